//! Media Engine Contract
//!
//! Abstrahiert die native Media-Engine (Capture, Encode/Decode, ICE/RTP)
//! hinter einem Command/Observer-Vertrag. Der Core sequenziert nur die
//! Aufrufe und reagiert auf Events - die Engine-Implementierung selbst
//! ist austauschbar (webrtc-rs Adapter oder Mock in Tests).

pub mod webrtc;

use crate::ice::IceServer;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

pub use webrtc::WebRtcEngineFactory;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Failed to create offer: {0}")]
    OfferFailed(String),

    #[error("Failed to create answer: {0}")]
    AnswerFailed(String),

    #[error("Remote description rejected: {0}")]
    RemoteDescriptionRejected(String),

    #[error("ICE candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("No camera available")]
    NoCamera,

    #[error("Capture failed to start: {0}")]
    CaptureFailed(String),

    #[error("Failed to add track: {0}")]
    TrackFailed(String),

    #[error("Transport statistics unavailable")]
    StatsUnavailable,

    #[error("Engine error: {0}")]
    Engine(String),
}

// ============================================================================
// SESSION DESCRIPTION & CANDIDATES
// ============================================================================

/// Art einer Session Description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// SDP Offer oder Answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp,
        }
    }

    pub fn answer(sdp: String) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp,
        }
    }
}

/// Ein einzelner ICE Candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// ICE Connection State (Teilmenge die der Core auswertet)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

// ============================================================================
// TRACKS & CAPTURE
// ============================================================================

/// Art eines Media Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Ausrichtung einer Kamera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraFacing {
    Front,
    Back,
}

/// Beschreibung eines Capture-Geräts
#[derive(Debug, Clone)]
pub struct CameraInfo {
    pub id: String,
    pub facing: CameraFacing,
}

/// Auflösung und Framerate für Video Capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureMode {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl CaptureMode {
    /// Bevorzugter Modus (720p @ 30fps)
    pub const PREFERRED: CaptureMode = CaptureMode {
        width: 1280,
        height: 720,
        frame_rate: 30,
    };

    /// Fallback wenn der bevorzugte Modus nicht startet (480p @ 15fps)
    pub const FALLBACK: CaptureMode = CaptureMode {
        width: 640,
        height: 480,
        frame_rate: 15,
    };
}

// ============================================================================
// TRANSPORT COUNTERS
// ============================================================================

/// Monoton steigende Transport-Zähler der Engine.
///
/// Der Quality Monitor bildet daraus Deltas; die Engine liefert nur
/// Rohwerte vom aktiven Candidate Pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportCounters {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
}

// ============================================================================
// ENGINE EVENTS
// ============================================================================

/// Geschlossene Menge aller Engine-Events.
///
/// Alle Observer-Callbacks der nativen Engine werden auf diese Varianten
/// abgebildet und über einen einzigen Channel an die State Machine
/// geliefert - kein verstreuter Callback-State.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Lokaler ICE Candidate wurde gefunden
    IceCandidate(IceCandidate),

    /// ICE Connection State hat sich geändert
    IceConnectionState(IceConnectionState),

    /// Remote Track ist eingetroffen
    RemoteTrack { kind: TrackKind },

    /// Peer Connection State hat sich geändert (grobes Signal)
    ConnectionState { connected: bool },
}

// ============================================================================
// ENGINE CONTRACT
// ============================================================================

/// Command-Seite des Engine-Vertrags.
///
/// Alle Netzwerk-Operationen sind async und blockieren den Aufrufer nie.
/// Die Event-Seite läuft über `subscribe()`.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Gibt einen Receiver für Engine-Events zurück
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;

    /// Erstellt ein SDP Offer; `ice_restart` erzwingt neue ICE Credentials
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError>;

    /// Erstellt ein SDP Answer. Setzt voraus dass die Remote Description
    /// bereits gesetzt wurde - die Session erzwingt das strukturell.
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    /// Fügt den lokalen Audio Track hinzu (Echo Cancellation, Noise
    /// Suppression und AGC sind immer aktiv)
    async fn add_audio_track(&self) -> Result<(), EngineError>;

    /// Fügt einen Video Track mit gewählter Kamera und Capture-Modus hinzu
    async fn add_video_track(
        &self,
        camera: &CameraInfo,
        mode: CaptureMode,
    ) -> Result<(), EngineError>;

    /// Verfügbare Kameras (leer wenn das Gerät keine hat)
    fn list_cameras(&self) -> Vec<CameraInfo>;

    /// Aktiviert/deaktiviert einen bestehenden Track (kein Re-Create)
    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), EngineError>;

    /// Wechselt die aktive Kamera; No-op wenn keine vorhanden
    async fn switch_camera(&self) -> Result<(), EngineError>;

    /// Aktuelle Transport-Zähler (für den Quality Monitor)
    async fn transport_counters(&self) -> Result<TransportCounters, EngineError>;

    /// Schließt die Engine; mehrfacher Aufruf ist erlaubt
    async fn close(&self);
}

/// Erzeugt pro Anruf eine frische Engine-Instanz.
///
/// Die Initialisierung ist lazy und idempotent: erst beim ersten Anruf
/// wird die native Engine hochgefahren.
#[async_trait]
pub trait MediaEngineFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
    ) -> Result<Arc<dyn MediaEngine>, EngineError>;
}
