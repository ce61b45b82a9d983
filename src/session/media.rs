//! Media Session
//!
//! Besitzt die lokalen Tracks eines Calls und kapselt Kamera-Auswahl,
//! Capture-Fallback und die Mute/Video-Flags. Fehlende Kameras sind
//! nie fatal: der Call degradiert auf Audio-only.

use crate::engine::{
    CameraFacing, CameraInfo, CaptureMode, EngineError, MediaEngine, TrackKind,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// AUDIO ROUTING
// ============================================================================

/// Geteilter Audio-Routing-Zustand des Geräts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioRoute {
    /// Systemstandard (Hörer/Headset)
    Default,
    /// Lautsprecher + Kommunikationsmodus für den aktiven Call
    Communication,
}

/// Plattform-Anbindung für das Audio-Routing.
///
/// Genau eine Session hält die Route zur Zeit; `release` stellt auf
/// jedem Cleanup-Pfad den Standard wieder her.
pub trait AudioRouter: Send + Sync {
    fn set_route(&self, route: AudioRoute);
}

/// Router für Plattformen ohne umschaltbares Routing
pub struct NoopAudioRouter;

impl AudioRouter for NoopAudioRouter {
    fn set_route(&self, _route: AudioRoute) {}
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

/// Lokale Track-Verwaltung eines einzelnen Calls
pub struct MediaSession {
    engine: Arc<dyn MediaEngine>,
    router: Arc<dyn AudioRouter>,
    has_video: AtomicBool,
    muted: AtomicBool,
    video_enabled: AtomicBool,
    released: AtomicBool,
}

impl MediaSession {
    pub fn new(engine: Arc<dyn MediaEngine>, router: Arc<dyn AudioRouter>) -> Self {
        Self {
            engine,
            router,
            has_video: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            video_enabled: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    /// Erstellt die lokalen Tracks und übernimmt das Audio-Routing.
    ///
    /// Audio ist Pflicht; Video wird mit Front-Kamera bevorzugt, fällt
    /// auf die Rück-Kamera zurück und degradiert ohne Kamera auf
    /// Audio-only. Capture startet bevorzugt in 720p/30 und fällt bei
    /// Startfehler auf 480p/15 zurück.
    pub async fn create_tracks(&self, with_video: bool) -> Result<(), EngineError> {
        self.engine.add_audio_track().await?;
        self.router.set_route(AudioRoute::Communication);

        if !with_video {
            return Ok(());
        }

        let camera = match self.select_camera() {
            Some(camera) => camera,
            None => {
                tracing::warn!("No camera available, continuing audio-only");
                return Ok(());
            }
        };

        match self.start_capture(&camera).await {
            Ok(()) => {
                self.has_video.store(true, Ordering::SeqCst);
                self.video_enabled.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Video capture failed ({}), continuing audio-only", e);
                Ok(())
            }
        }
    }

    fn select_camera(&self) -> Option<CameraInfo> {
        let cameras = self.engine.list_cameras();
        cameras
            .iter()
            .find(|c| c.facing == CameraFacing::Front)
            .or_else(|| cameras.iter().find(|c| c.facing == CameraFacing::Back))
            .cloned()
    }

    async fn start_capture(&self, camera: &CameraInfo) -> Result<(), EngineError> {
        match self
            .engine
            .add_video_track(camera, CaptureMode::PREFERRED)
            .await
        {
            Ok(()) => Ok(()),
            Err(EngineError::CaptureFailed(reason)) => {
                tracing::info!(
                    "Preferred capture mode failed ({}), retrying with fallback mode",
                    reason
                );
                self.engine
                    .add_video_track(camera, CaptureMode::FALLBACK)
                    .await
            }
            Err(e) => Err(e),
        }
    }

    pub fn has_video(&self) -> bool {
        self.has_video.load(Ordering::SeqCst)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::SeqCst)
    }

    /// Flag-Flip auf dem bestehenden Audio Track, kein Re-Create
    pub async fn toggle_mute(&self) -> Result<bool, EngineError> {
        let muted = !self.muted.load(Ordering::SeqCst);
        self.engine
            .set_track_enabled(TrackKind::Audio, !muted)
            .await?;
        self.muted.store(muted, Ordering::SeqCst);
        Ok(muted)
    }

    /// Flag-Flip auf dem bestehenden Video Track; No-op ohne Video
    pub async fn toggle_video(&self) -> Result<bool, EngineError> {
        if !self.has_video() {
            return Ok(false);
        }
        let enabled = !self.video_enabled.load(Ordering::SeqCst);
        self.engine
            .set_track_enabled(TrackKind::Video, enabled)
            .await?;
        self.video_enabled.store(enabled, Ordering::SeqCst);
        Ok(enabled)
    }

    /// Deaktiviert Video dauerhaft (Audio-only-Fallback des Retry-Pfads)
    pub async fn disable_video(&self) -> Result<(), EngineError> {
        if !self.has_video() {
            return Ok(());
        }
        self.engine
            .set_track_enabled(TrackKind::Video, false)
            .await?;
        self.video_enabled.store(false, Ordering::SeqCst);
        self.has_video.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn switch_camera(&self) -> Result<(), EngineError> {
        if !self.has_video() {
            return Ok(());
        }
        self.engine.switch_camera().await
    }

    /// Gibt alle Track-Ressourcen frei und stellt das Audio-Routing
    /// wieder her. Idempotent; Fehler einzelner Schritte werden geloggt
    /// und überlaufen die restliche Freigabe nicht.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.engine.close().await;
        self.router.set_route(AudioRoute::Default);
        tracing::debug!("Media session released");
    }
}
