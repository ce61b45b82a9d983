//! Chime - P2P Call Session Core
//!
//! Der protokoll- und plattformneutrale Kern einer Audio/Video-Call-App:
//! - Call Session State Machine mit Timern und Retry/Fallback
//! - Austauschbares Signaling (Push via Live-Subscription oder Poll)
//!   über einem abstrakten Key-Value Store
//! - ICE Server Provider mit TTL-Cache und STUN-Rückfallebene
//! - Connection Quality Monitor über den Transport-Countern der Engine
//!
//! Die Media-Engine selbst ist ein externer Kollaborateur hinter dem
//! `MediaEngine`-Vertrag; ein webrtc-rs Adapter wird mitgeliefert.

pub mod engine;
pub mod ice;
pub mod notify;
pub mod quality;
pub mod retry;
pub mod session;
pub mod signaling;

pub use engine::{
    EngineError, EngineEvent, IceCandidate, IceConnectionState, MediaEngine, MediaEngineFactory,
    SessionDescription, TrackKind,
};
pub use ice::{IceCredentialFetcher, IceError, IceServer, IceServerProvider};
pub use notify::{NoopNotifier, WakeupNotifier};
pub use quality::{
    ConnectionQualitySample, NetworkInfo, NetworkQuality, NetworkTransport, NetworkWatcher,
    QualityTier,
};
pub use retry::{RetryDecision, RetryState};
pub use session::{
    AudioRoute, AudioRouter, CallDirection, CallError, CallEvent, CallManager, CallSession,
    CallState, NoopAudioRouter,
};
pub use signaling::{
    CallRecord, CallRole, CallSignaling, CallStatus, MemoryStore, PollTuning, SignalingError,
    SignalingStore,
};

use std::time::Duration;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Wahl der Signaling-Strategie
#[derive(Debug, Clone)]
pub enum SignalingMode {
    /// Live-Subscription auf dem Store
    Push,
    /// Wiederholte Reads mit begrenztem Budget
    Poll(PollTuning),
}

/// Konfiguration des `CallManager`
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Maximale Klingeldauer bevor der Call als verpasst gilt
    pub ring_timeout: Duration,

    /// Karenzzeit nach ICE-Disconnect bevor die Session terminiert
    pub disconnect_grace: Duration,

    /// Maximale ICE-Restart-Versuche pro Backoff-Runde
    pub max_restart_attempts: u32,

    pub signaling: SignalingMode,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            disconnect_grace: Duration::from_secs(5),
            max_restart_attempts: 3,
            signaling: SignalingMode::Push,
        }
    }
}

impl CallConfig {
    /// Preset für Plattformen mit unzuverlässigem Push: Poll-Strategie
    /// und verlängerte Klingeldauer
    pub fn polling() -> Self {
        Self {
            ring_timeout: Duration::from_secs(90),
            signaling: SignalingMode::Poll(PollTuning::default()),
            ..Self::default()
        }
    }
}
