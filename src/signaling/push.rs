//! Push-Strategie
//!
//! Abonniert den Live-Feed des Stores und liefert Offer/Answer,
//! Candidates und Status-Änderungen als asynchrone Events sobald sie
//! geschrieben werden.

use super::channel::{CallRole, CallSignaling, ChannelCore, SignalingEvent};
use super::records::{CallRecord, CallStatus, SignalingEnvelope};
use super::store::{CallPaths, SignalingError, SignalingStore};
use crate::engine::IceCandidate;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Signaling Channel über Live-Subscriptions
pub struct PushSignaling {
    core: Arc<ChannelCore>,
}

impl PushSignaling {
    pub fn new(store: Arc<dyn SignalingStore>, paths: CallPaths, role: CallRole) -> Self {
        Self {
            core: Arc::new(ChannelCore::new(store, paths, role)),
        }
    }
}

#[async_trait]
impl CallSignaling for PushSignaling {
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
        // Re-Arm ersetzt laufende Watcher (z.B. nach ICE Restart)
        self.core.abort_tasks();

        // Envelope-Watcher (Answer beim Caller, Offer beim Callee)
        let env_path = self.core.inbound_envelope_path();
        let mut env_rx = self.core.store.subscribe_changes(&env_path).await?;
        let core = Arc::clone(&self.core);
        let tx = events.clone();
        self.core.track_task(tokio::spawn(async move {
            // Bereits vorhandenes Envelope nachziehen (Race: Write vor Subscribe)
            if let Ok(Some(value)) = core.read(&env_path).await {
                if core.ingest_envelope(&value, &tx).await.is_err() {
                    return;
                }
            }
            while let Some(change) = env_rx.recv().await {
                if core.is_closed() || core.ingest_envelope(&change.value, &tx).await.is_err() {
                    break;
                }
            }
        }));

        // Candidate-Watcher
        let ice_path = self.core.paths.ice(self.core.role.inbound_direction());
        let mut ice_rx = self.core.store.subscribe_changes(&ice_path).await?;
        let core = Arc::clone(&self.core);
        let tx = events.clone();
        self.core.track_task(tokio::spawn(async move {
            if let Ok(Some(value)) = core.read(&ice_path).await {
                if !core.ingest_candidates(&ice_path, &value, &tx).await {
                    return;
                }
            }
            while let Some(change) = ice_rx.recv().await {
                if core.is_closed()
                    || !core.ingest_candidates(&change.path, &change.value, &tx).await
                {
                    break;
                }
            }
        }));

        // Status-Watcher
        let status_path = self.core.paths.status();
        let mut status_rx = self.core.store.subscribe_changes(&status_path).await?;
        let core = Arc::clone(&self.core);
        self.core.track_task(tokio::spawn(async move {
            if let Ok(Some(value)) = core.read(&status_path).await {
                if core.ingest_status(&value, &events).await.is_err() {
                    return;
                }
            }
            while let Some(change) = status_rx.recv().await {
                if core.is_closed() {
                    break;
                }
                if core.ingest_status(&change.value, &events).await.is_err() {
                    break;
                }
            }
        }));

        Ok(())
    }

    async fn shutdown(&self) {
        self.core.shutdown().await;
    }
}
