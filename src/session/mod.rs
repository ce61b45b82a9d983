//! Call Session
//!
//! Die oberste Orchestrierungs-Schicht: State Machine, Timer, Media
//! Session und die Komposition von Engine, Signaling, Quality Monitor
//! und Retry Controller.

mod machine;
mod media;

pub use machine::{CallDirection, CallEvent, CallManager, CallSession, CallState};
pub use media::{AudioRoute, AudioRouter, MediaSession, NoopAudioRouter};

use crate::engine::EngineError;
use crate::signaling::SignalingError;
use thiserror::Error;

/// Fehler der öffentlichen Session-API.
///
/// Setup-Fehler kommen synchron aus `start_call`/`answer_call` zurück;
/// Mid-Call-Fehler (ICE) bleiben im Retry Controller und werden erst
/// nach Erschöpfung als terminaler `Failed`-State sichtbar.
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Another call is already active")]
    AlreadyInCall,

    #[error("ICE connection attempts exhausted: {0}")]
    IceConnectionExhausted(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),
}
