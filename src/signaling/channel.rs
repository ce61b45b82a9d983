//! Signaling Channel Vertrag
//!
//! Eine Schnittstelle, zwei Strategien (Push via Live-Subscription,
//! Poll für bandbreitenbeschränkte Plattformen). Die State Machine
//! sieht nur `CallSignaling` und verzweigt nie auf die aktive Strategie.

use super::records::{
    CallRecord, CallStatus, CandidateDirection, IceCandidateRecord, SignalingEnvelope,
};
use super::store::{CallPaths, SignalingError, SignalingStore, StorePath};
use crate::engine::IceCandidate;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

// ============================================================================
// ROLE & EVENTS
// ============================================================================

/// Rolle dieses Endpunkts im Call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

impl CallRole {
    /// Richtung in die dieser Endpunkt Candidates publiziert
    pub fn outbound_direction(&self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::ToCallee,
            CallRole::Callee => CandidateDirection::ToCaller,
        }
    }

    /// Richtung aus der dieser Endpunkt Candidates konsumiert
    pub fn inbound_direction(&self) -> CandidateDirection {
        match self {
            CallRole::Caller => CandidateDirection::ToCaller,
            CallRole::Callee => CandidateDirection::ToCallee,
        }
    }
}

/// Events die der Channel an die Session liefert
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Remote Envelope: Answer beim Caller, (Restart-)Offer beim Callee
    EnvelopeReceived(SignalingEnvelope),

    /// Neuer Remote Candidate (bereits dedupliziert)
    RemoteCandidate(IceCandidateRecord),

    /// Status-Flag des Call-Records hat sich geändert
    StatusChanged(CallStatus),
}

// ============================================================================
// CHANNEL CONTRACT
// ============================================================================

/// Publish-Seite plus Watcher-Lifecycle eines Call-Signaling-Kanals.
///
/// `start` (re-)armiert die Watcher; nach `shutdown` werden alle
/// Operationen zu geloggten No-ops, damit Aufrufe die mit dem Teardown
/// rennen keinen Use-after-Release auslösen.
#[async_trait]
pub trait CallSignaling: Send + Sync {
    fn role(&self) -> CallRole;

    /// Schreibt den Call-Record (Meta-Daten inkl. Timestamps)
    async fn publish_record(&self, record: &CallRecord) -> Result<(), SignalingError>;

    /// Liest das Offer des Callers (Callee-Seite, vor dem Answer)
    async fn read_offer(&self) -> Result<Option<SignalingEnvelope>, SignalingError>;

    /// Publiziert Offer oder Answer (Routing über den Envelope-Typ)
    async fn publish_envelope(&self, env: &SignalingEnvelope) -> Result<(), SignalingError>;

    /// Publiziert einen lokalen Candidate in Richtung der Gegenseite
    async fn publish_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError>;

    /// Publiziert das Status-Flag
    async fn publish_status(&self, status: CallStatus) -> Result<(), SignalingError>;

    /// Startet (oder re-armiert) die Watcher auf Answer/Offer, ICE-Liste
    /// und Status. Ersetzt laufende Watcher.
    async fn start(&self, events: mpsc::Sender<SignalingEvent>) -> Result<(), SignalingError>;

    /// Stoppt alle Watcher; danach sind alle Operationen No-ops
    async fn shutdown(&self);
}

// ============================================================================
// SHARED CHANNEL CORE
// ============================================================================

/// Gemeinsamer Zustand beider Strategien: Store-Zugriff, Dedup-Set,
/// Closed-Flag und die Handles der Watcher-Tasks.
pub(super) struct ChannelCore {
    pub store: Arc<dyn SignalingStore>,
    pub paths: CallPaths,
    pub role: CallRole,
    closed: AtomicBool,
    seen_candidates: Mutex<HashSet<String>>,
    last_envelope_sdp: Mutex<Option<String>>,
    last_status: Mutex<Option<CallStatus>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChannelCore {
    pub fn new(store: Arc<dyn SignalingStore>, paths: CallPaths, role: CallRole) -> Self {
        Self {
            store,
            paths,
            role,
            closed: AtomicBool::new(false),
            seen_candidates: Mutex::new(HashSet::new()),
            last_envelope_sdp: Mutex::new(None),
            last_status: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pfad auf dem die Gegenseite ihre Envelopes publiziert
    pub fn inbound_envelope_path(&self) -> StorePath {
        match self.role {
            CallRole::Caller => self.paths.answer(),
            CallRole::Callee => self.paths.offer(),
        }
    }

    pub fn publish_path(&self, env: &SignalingEnvelope) -> StorePath {
        match env.kind {
            crate::engine::SdpKind::Offer => self.paths.offer(),
            crate::engine::SdpKind::Answer => self.paths.answer(),
        }
    }

    /// Write mit No-op-Semantik nach Shutdown
    pub async fn publish(&self, path: &StorePath, value: Value) -> Result<(), SignalingError> {
        if self.is_closed() {
            tracing::debug!("Signaling closed, dropping write to {}", path);
            return Ok(());
        }
        self.store.publish(path, value).await
    }

    pub async fn read(&self, path: &StorePath) -> Result<Option<Value>, SignalingError> {
        if self.is_closed() {
            return Ok(None);
        }
        self.store.read(path).await
    }

    pub async fn publish_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let record = IceCandidateRecord::new(candidate, self.role.outbound_direction());
        let path = self
            .paths
            .ice(self.role.outbound_direction())
            .child(&Uuid::new_v4().to_string());
        let value = serde_json::to_value(&record).map_err(|e| SignalingError::WriteFailed {
            path: path.as_str().to_string(),
            reason: e.to_string(),
        })?;
        self.publish(&path, value).await
    }

    /// Verarbeitet einen Read/Change der Candidate-Liste; dedupliziert
    /// über den logischen Store-Key und liefert nur neue Records.
    pub async fn ingest_candidates(
        &self,
        base: &StorePath,
        value: &Value,
        events: &mpsc::Sender<SignalingEvent>,
    ) -> bool {
        let mut fresh = Vec::new();

        if value.get("candidate").is_some() {
            // Einzelner Record (Change eines Kind-Pfads)
            if self.seen_candidates.lock().insert(base.as_str().to_string()) {
                if let Ok(rec) = serde_json::from_value::<IceCandidateRecord>(value.clone()) {
                    fresh.push(rec);
                }
            }
        } else if let Some(map) = value.as_object() {
            // Collection-Read: Map von Key -> Record
            for (key, entry) in map {
                let logical_key = format!("{}/{}", base, key);
                if self.seen_candidates.lock().insert(logical_key) {
                    if let Ok(rec) = serde_json::from_value::<IceCandidateRecord>(entry.clone()) {
                        fresh.push(rec);
                    }
                }
            }
        }

        for rec in fresh {
            if events
                .send(SignalingEvent::RemoteCandidate(rec))
                .await
                .is_err()
            {
                return false;
            }
        }
        true
    }

    /// Markiert ein Envelope als bereits verarbeitet, damit Watcher es
    /// nicht erneut emittieren (direkter `read_offer` auf Callee-Seite)
    pub fn note_envelope(&self, env: &SignalingEnvelope) {
        *self.last_envelope_sdp.lock() = Some(env.sdp.clone());
    }

    /// Emittiert ein Envelope-Event nur wenn sich das SDP geändert hat.
    /// `Ok(true)` heißt emittiert, `Ok(false)` unterdrückt oder nicht
    /// parsebar, `Err(())` Empfänger weg.
    pub async fn ingest_envelope(
        &self,
        value: &Value,
        events: &mpsc::Sender<SignalingEvent>,
    ) -> Result<bool, ()> {
        let env = match serde_json::from_value::<SignalingEnvelope>(value.clone()) {
            Ok(env) => env,
            Err(_) => return Ok(false),
        };
        {
            let mut last = self.last_envelope_sdp.lock();
            if last.as_deref() == Some(env.sdp.as_str()) {
                return Ok(false);
            }
            *last = Some(env.sdp.clone());
        }
        events
            .send(SignalingEvent::EnvelopeReceived(env))
            .await
            .map_err(|_| ())?;
        Ok(true)
    }

    /// Emittiert ein Status-Event nur bei Änderung; gibt den gelesenen
    /// Status zurück damit Poll-Loops auf terminalen Status stoppen.
    /// `Err(())` heißt: Empfänger weg, Watcher beenden.
    pub async fn ingest_status(
        &self,
        value: &Value,
        events: &mpsc::Sender<SignalingEvent>,
    ) -> Result<Option<CallStatus>, ()> {
        let status = match serde_json::from_value::<CallStatus>(value.clone()) {
            Ok(status) => status,
            Err(_) => return Ok(None),
        };
        {
            let mut last = self.last_status.lock();
            if *last == Some(status) {
                return Ok(Some(status));
            }
            *last = Some(status);
        }
        events
            .send(SignalingEvent::StatusChanged(status))
            .await
            .map_err(|_| ())?;
        Ok(Some(status))
    }

    pub fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    pub fn abort_tasks(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort_tasks();
        tracing::debug!("Signaling channel for {} shut down", self.paths.root());
    }
}
