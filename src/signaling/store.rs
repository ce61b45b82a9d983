//! Signaling Store Vertrag
//!
//! Abstrakter Remote Key-Value Store mit Publish/Read/Subscribe.
//! Das konkrete Backend (Realtime-Datenbank, REST, WebSocket) ist ein
//! Implementierungsdetail; der Core sieht nur diesen Vertrag.
//! `MemoryStore` ist das mitgelieferte Loopback/Test-Backend.

use super::records::CandidateDirection;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Not authenticated against the signaling store")]
    NotAuthenticated,

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Signaling write failed at {path}: {reason}")]
    WriteFailed { path: String, reason: String },

    #[error("Signaling read failed at {path}: {reason}")]
    ReadFailed { path: String, reason: String },

    #[error("Signaling read timed out at {0}")]
    ReadTimeout(String),
}

// ============================================================================
// STORE PATHS
// ============================================================================

/// Pfad im Key-Space des Stores, Segmente durch `/` getrennt
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePath(String);

impl StorePath {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn child(&self, segment: &str) -> StorePath {
        StorePath(format!("{}/{}", self.0, segment))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Liegt `other` auf oder unter diesem Pfad?
    pub fn contains(&self, other: &StorePath) -> bool {
        other.0 == self.0 || other.0.starts_with(&format!("{}/", self.0))
    }
}

impl std::fmt::Display for StorePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pfad-Builder für einen einzelnen Call-Record
#[derive(Debug, Clone)]
pub struct CallPaths {
    root: StorePath,
}

impl CallPaths {
    pub fn new(owner: &str, call_id: &Uuid) -> Self {
        Self {
            root: StorePath::new(format!("{}/calls/{}", owner, call_id)),
        }
    }

    pub fn root(&self) -> StorePath {
        self.root.clone()
    }

    pub fn status(&self) -> StorePath {
        self.root.child("status")
    }

    pub fn offer(&self) -> StorePath {
        self.root.child("offer")
    }

    pub fn answer(&self) -> StorePath {
        self.root.child("answer")
    }

    pub fn ice(&self, direction: CandidateDirection) -> StorePath {
        self.root.child(direction.segment())
    }
}

// ============================================================================
// STORE CONTRACT
// ============================================================================

/// Eine einzelne Änderung unterhalb eines abonnierten Pfads
#[derive(Debug, Clone)]
pub struct StoreChange {
    pub path: StorePath,
    pub value: Value,
}

/// Publish/Read/Subscribe über einem Remote Key-Space.
///
/// Writes haben Overwrite-Semantik und sind damit idempotent. Subscribe
/// liefert Änderungen am Pfad und allen Kind-Pfaden; das Abo endet wenn
/// der Receiver gedroppt wird.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn publish(&self, path: &StorePath, value: Value) -> Result<(), SignalingError>;

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, SignalingError>;

    async fn subscribe_changes(
        &self,
        path: &StorePath,
    ) -> Result<mpsc::Receiver<StoreChange>, SignalingError>;
}

// ============================================================================
// MEMORY STORE
// ============================================================================

#[derive(Default)]
struct MemoryStoreInner {
    entries: BTreeMap<String, Value>,
    subscribers: Vec<(StorePath, mpsc::Sender<StoreChange>)>,
}

/// In-Memory Store mit Change-Fanout.
///
/// Dient als Loopback-Backend (beide Endpunkte im selben Prozess) und
/// als Test-Backend für beide Signaling-Strategien.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingStore for MemoryStore {
    async fn publish(&self, path: &StorePath, value: Value) -> Result<(), SignalingError> {
        let mut inner = self.inner.lock();
        inner.entries.insert(path.as_str().to_string(), value.clone());

        // Fanout an alle Abos deren Pfad diesen Write abdeckt
        let change = StoreChange {
            path: path.clone(),
            value,
        };
        inner.subscribers.retain(|(prefix, tx)| {
            if !prefix.contains(path) {
                return true;
            }
            match tx.try_send(change.clone()) {
                Ok(()) => true,
                // Voller Buffer: Änderung verwerfen, Abo behalten
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
        Ok(())
    }

    async fn read(&self, path: &StorePath) -> Result<Option<Value>, SignalingError> {
        let inner = self.inner.lock();
        if let Some(value) = inner.entries.get(path.as_str()) {
            return Ok(Some(value.clone()));
        }

        // Collection-Read: Kind-Einträge als Objekt einsammeln
        let prefix = format!("{}/", path.as_str());
        let mut map = serde_json::Map::new();
        for (key, value) in inner.entries.range(prefix.clone()..) {
            if !key.starts_with(&prefix) {
                break;
            }
            map.insert(key[prefix.len()..].to_string(), value.clone());
        }
        if map.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Value::Object(map)))
        }
    }

    async fn subscribe_changes(
        &self,
        path: &StorePath,
    ) -> Result<mpsc::Receiver<StoreChange>, SignalingError> {
        let (tx, rx) = mpsc::channel(100);
        self.inner.lock().subscribers.push((path.clone(), tx));
        Ok(rx)
    }
}
