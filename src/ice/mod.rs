//! ICE Server Provider
//!
//! Liefert STUN/TURN-Server für den Verbindungsaufbau. TURN-Credentials
//! sind kurzlebig und kommen von einem externen Fetcher; der Provider
//! cached sie prozessweit für 12 Stunden. Schlägt der Fetch fehl, fällt
//! er auf öffentliche STUN-Server zurück und cached auch diese, damit
//! ein ausgefallener Credential-Dienst nicht jeden Call-Aufbau blockiert.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;

// ============================================================================
// TYPES
// ============================================================================

/// Ein STUN/TURN-Server wie ihn der Credential-Endpunkt liefert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Reiner STUN-Server ohne Credentials
    pub fn stun(urls: &[&str]) -> Self {
        Self {
            urls: urls.iter().map(|u| u.to_string()).collect(),
            username: None,
            credential: None,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum IceError {
    #[error("ICE credential fetch failed: {0}")]
    FetchFailed(String),

    #[error("ICE credential response malformed: {0}")]
    MalformedResponse(String),
}

/// Externer Endpunkt der kurzlebige TURN-Credentials ausstellt
#[async_trait]
pub trait IceCredentialFetcher: Send + Sync {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, IceError>;
}

// ============================================================================
// PROVIDER
// ============================================================================

const CACHE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Öffentliche STUN-Server als Rückfallebene ohne TURN-Relay
pub fn fallback_servers() -> Vec<IceServer> {
    vec![IceServer::stun(&[
        "stun:stun.l.google.com:19302",
        "stun:stun1.l.google.com:19302",
        "stun:stun2.l.google.com:19302",
    ])]
}

struct CachedServers {
    servers: Vec<IceServer>,
    fetched_at: Instant,
}

/// Prozessweiter Cache über einem `IceCredentialFetcher`
pub struct IceServerProvider {
    fetcher: Box<dyn IceCredentialFetcher>,
    cache: Mutex<Option<CachedServers>>,
    ttl: Duration,
}

impl IceServerProvider {
    pub fn new(fetcher: Box<dyn IceCredentialFetcher>) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(None),
            ttl: CACHE_TTL,
        }
    }

    #[cfg(test)]
    fn with_ttl(fetcher: Box<dyn IceCredentialFetcher>, ttl: Duration) -> Self {
        Self {
            fetcher,
            cache: Mutex::new(None),
            ttl,
        }
    }

    /// Liefert die aktuell gültige Serverliste.
    ///
    /// Cache-Treffer jünger als die TTL werden direkt beantwortet.
    /// Bei Fetch-Fehler wird die STUN-Rückfallebene geliefert und
    /// ebenfalls gecached.
    pub async fn get_ice_servers(&self) -> Vec<IceServer> {
        if let Some(cached) = self.cache.lock().as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.servers.clone();
            }
        }

        let servers = match self.fetcher.fetch_ice_servers().await {
            Ok(servers) if !servers.is_empty() => servers,
            Ok(_) => {
                tracing::warn!("ICE credential endpoint returned no servers, using STUN fallback");
                fallback_servers()
            }
            Err(e) => {
                tracing::warn!("ICE credential fetch failed ({}), using STUN fallback", e);
                fallback_servers()
            }
        };

        *self.cache.lock() = Some(CachedServers {
            servers: servers.clone(),
            fetched_at: Instant::now(),
        });
        servers
    }
}
