//! Poll-Strategie
//!
//! Bandbreitenschonende Alternative zur Live-Subscription: liest die
//! Sub-Pfade (Answer/Offer, ICE-Liste, Status) in festen Intervallen,
//! mit begrenzter Versuchszahl und frühem Abbruch bei terminalem
//! Status. Gedacht für Plattformen auf denen ein volles Live-Sync-Abo
//! unbegrenzt Speicher ziehen würde.

use super::channel::{CallRole, CallSignaling, ChannelCore, SignalingEvent};
use super::records::{CallRecord, CallStatus, SignalingEnvelope};
use super::store::{CallPaths, SignalingError, SignalingStore};
use crate::engine::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

// ============================================================================
// TUNING
// ============================================================================

/// Intervalle und Versuchsbudgets pro Sub-Pfad
#[derive(Debug, Clone)]
pub struct PollTuning {
    pub envelope_interval: Duration,
    pub envelope_attempts: u32,
    pub ice_interval: Duration,
    pub ice_attempts: u32,
    pub status_interval: Duration,
    pub status_attempts: u32,
}

impl Default for PollTuning {
    fn default() -> Self {
        Self {
            envelope_interval: Duration::from_millis(500),
            envelope_attempts: 240,
            ice_interval: Duration::from_millis(300),
            ice_attempts: 400,
            status_interval: Duration::from_millis(1000),
            status_attempts: 600,
        }
    }
}

// ============================================================================
// POLL SIGNALING
// ============================================================================

/// Signaling Channel über wiederholte Reads
pub struct PollSignaling {
    core: Arc<ChannelCore>,
    tuning: PollTuning,
}

impl PollSignaling {
    pub fn new(
        store: Arc<dyn SignalingStore>,
        paths: CallPaths,
        role: CallRole,
        tuning: PollTuning,
    ) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(store, paths, role)),
            tuning,
        }
    }
}

#[async_trait]
impl CallSignaling for PollSignaling {
    fn role(&self) -> CallRole {
        self.core.role
    }

    async fn publish_record(&self, record: &CallRecord) -> Result<(), SignalingError> {
        let path = self.core.paths.root().child("meta");
        let value = serde_json::to_value(record).map_err(|e| SignalingError::WriteFailed {
            path: path.as_str().to_string(),
            reason: e.to_string(),
        })?;
        self.core.publish(&path, value).await
    }

    async fn read_offer(&self) -> Result<Option<SignalingEnvelope>, SignalingError> {
        let value = self.core.read(&self.core.paths.offer()).await?;
        let env: Option<SignalingEnvelope> = value.and_then(|v| serde_json::from_value(v).ok());
        if let Some(env) = &env {
            self.core.note_envelope(env);
        }
        Ok(env)
    }

    async fn publish_envelope(&self, env: &SignalingEnvelope) -> Result<(), SignalingError> {
        let path = self.core.publish_path(env);
        let value = serde_json::to_value(env).map_err(|e| SignalingError::WriteFailed {
            path: path.as_str().to_string(),
            reason: e.to_string(),
        })?;
        self.core.publish(&path, value).await
    }

    async fn publish_candidate(&self, candidate: IceCandidate) -> Result<(), SignalingError> {
        self.core.publish_candidate(candidate).await
    }

    async fn publish_status(&self, status: CallStatus) -> Result<(), SignalingError> {
        let path = self.core.paths.status();
        self.core
            .publish(&path, serde_json::to_value(status).unwrap_or_default())
            .await
    }

    async fn start(&self, events: mpsc::Sender<SignalingEvent>) -> Result<(), SignalingError> {
        if self.core.is_closed() {
            return Ok(());
        }
        // Re-Arm (nach ICE Restart) setzt frische Versuchsbudgets
        self.core.abort_tasks();

        // Envelope-Poller: läuft sein Budget durch, auch nach dem ersten
        // Treffer. Der SDP-Dedup unterdrückt Wiederholungen, Restart-
        // Offers auf demselben Pfad kommen weiter an.
        let core = Arc::clone(&self.core);
        let tx = events.clone();
        let interval = self.tuning.envelope_interval;
        let attempts = self.tuning.envelope_attempts;
        self.core.track_task(tokio::spawn(async move {
            let path = core.inbound_envelope_path();
            for _ in 0..attempts {
                if core.is_closed() {
                    break;
                }
                if let Ok(Some(value)) = core.read(&path).await {
                    if core.ingest_envelope(&value, &tx).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        }));

        // Candidate-Poller: läuft sein Budget durch und dedupliziert
        let core = Arc::clone(&self.core);
        let tx = events.clone();
        let interval = self.tuning.ice_interval;
        let attempts = self.tuning.ice_attempts;
        self.core.track_task(tokio::spawn(async move {
            let path = core.paths.ice(core.role.inbound_direction());
            for _ in 0..attempts {
                if core.is_closed() {
                    break;
                }
                if let Ok(Some(value)) = core.read(&path).await {
                    if !core.ingest_candidates(&path, &value, &tx).await {
                        break;
                    }
                }
                tokio::time::sleep(interval).await;
            }
        }));

        // Status-Poller: bricht bei terminalem Status ab
        let core = Arc::clone(&self.core);
        let interval = self.tuning.status_interval;
        let attempts = self.tuning.status_attempts;
        self.core.track_task(tokio::spawn(async move {
            let path = core.paths.status();
            for _ in 0..attempts {
                if core.is_closed() {
                    break;
                }
                if let Ok(Some(value)) = core.read(&path).await {
                    match core.ingest_status(&value, &events).await {
                        Ok(Some(status)) if status.is_terminal() => break,
                        Ok(_) => {}
                        Err(()) => break,
                    }
                }
                tokio::time::sleep(interval).await;
            }
        }));

        Ok(())
    }

    async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
