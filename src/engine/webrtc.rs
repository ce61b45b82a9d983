//! WebRTC Engine Adapter
//!
//! Implementiert den Engine-Vertrag über webrtc-rs Peer Connections.
//! Capture selbst (Kamera/Mikrofon-Frames) liefert der Embedder über die
//! lokalen Track-Handles; der Adapter verwaltet Peer Connection,
//! Negotiation und Transport-Statistiken.

use super::{
    CameraInfo, CaptureMode, EngineError, EngineEvent, IceCandidate, IceConnectionState,
    MediaEngine, MediaEngineFactory, SdpKind, SessionDescription, TrackKind, TransportCounters,
};
use crate::ice::IceServer;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate für den Audio Track (48kHz, Opus-Standard)
const SAMPLE_RATE: u32 = 48000;

/// Clock Rate für Video (RTP-Standard)
const VIDEO_CLOCK_RATE: u32 = 90000;

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

/// Media Engine auf Basis einer webrtc-rs Peer Connection
pub struct WebRtcEngine {
    pc: Arc<RTCPeerConnection>,
    event_tx: broadcast::Sender<EngineEvent>,
    audio_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    video_track: Mutex<Option<Arc<TrackLocalStaticRTP>>>,
    audio_enabled: AtomicBool,
    video_enabled: AtomicBool,
    cameras: Vec<CameraInfo>,
    active_camera: AtomicUsize,
    closed: AtomicBool,
}

impl WebRtcEngine {
    async fn new(
        ice_servers: Vec<IceServer>,
        cameras: Vec<CameraInfo>,
    ) -> Result<Arc<Self>, EngineError> {
        // Media Engine mit Standard-Codecs konfigurieren
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| EngineError::Engine(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| EngineError::Engine(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Engine(e.to_string()))?,
        );

        let (event_tx, _) = broadcast::channel(100);

        let engine = Arc::new(Self {
            pc: Arc::clone(&pc),
            event_tx,
            audio_track: Mutex::new(None),
            video_track: Mutex::new(None),
            audio_enabled: AtomicBool::new(true),
            video_enabled: AtomicBool::new(true),
            cameras,
            active_camera: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        engine.register_handlers();

        Ok(engine)
    }

    /// Registriert die Observer-Callbacks der Peer Connection und bildet
    /// sie auf die geschlossene Event-Menge ab
    fn register_handlers(&self) {
        let event_tx = self.event_tx.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate| {
                if let Some(c) = candidate {
                    if let Ok(init) = c.to_json() {
                        let _ = event_tx.send(EngineEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                }
                Box::pin(async {})
            }));

        let event_tx = self.event_tx.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                tracing::debug!("ICE connection state: {:?}", state);
                let mapped = match state {
                    RTCIceConnectionState::Checking => IceConnectionState::Checking,
                    RTCIceConnectionState::Connected => IceConnectionState::Connected,
                    RTCIceConnectionState::Completed => IceConnectionState::Completed,
                    RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                    RTCIceConnectionState::Failed => IceConnectionState::Failed,
                    RTCIceConnectionState::Closed => IceConnectionState::Closed,
                    _ => IceConnectionState::New,
                };
                let _ = event_tx.send(EngineEvent::IceConnectionState(mapped));
                Box::pin(async {})
            }));

        let event_tx = self.event_tx.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                tracing::debug!("Peer connection state: {:?}", s);
                let _ = event_tx.send(EngineEvent::ConnectionState {
                    connected: s == RTCPeerConnectionState::Connected,
                });
                Box::pin(async {})
            }));

        let event_tx = self.event_tx.clone();
        self.pc.on_track(Box::new(move |track, _, _| {
            let kind = if track.kind() == RTPCodecType::Video {
                TrackKind::Video
            } else {
                TrackKind::Audio
            };
            let _ = event_tx.send(EngineEvent::RemoteTrack { kind });
            Box::pin(async {})
        }));
    }

    /// Lokaler Audio Track (der Embedder schreibt RTP-Pakete hinein)
    pub fn local_audio_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.audio_track.lock().clone()
    }

    /// Lokaler Video Track
    pub fn local_video_track(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        self.video_track.lock().clone()
    }

    /// Soll der Embedder gerade Audio-Pakete schreiben?
    pub fn audio_enabled(&self) -> bool {
        self.audio_enabled.load(Ordering::Relaxed)
    }

    /// Soll der Embedder gerade Video-Pakete schreiben?
    pub fn video_enabled(&self) -> bool {
        self.video_enabled.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_tx.subscribe()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .pc
            .create_offer(options)
            .await
            .map_err(|e| EngineError::OfferFailed(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| EngineError::AnswerFailed(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let sdp = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| EngineError::Engine(e.to_string()))?;

        self.pc
            .set_local_description(sdp)
            .await
            .map_err(|e| EngineError::Engine(e.to_string()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), EngineError> {
        let sdp = match desc.kind {
            SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(|e| EngineError::RemoteDescriptionRejected(e.to_string()))?;

        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| EngineError::RemoteDescriptionRejected(e.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| EngineError::CandidateRejected(e.to_string()))
    }

    async fn add_audio_track(&self) -> Result<(), EngineError> {
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            "audio".to_string(),
            "chime".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::TrackFailed(e.to_string()))?;

        *self.audio_track.lock() = Some(track);
        Ok(())
    }

    async fn add_video_track(
        &self,
        camera: &CameraInfo,
        mode: CaptureMode,
    ) -> Result<(), EngineError> {
        tracing::info!(
            "Adding video track: camera {} ({}x{} @ {}fps)",
            camera.id,
            mode.width,
            mode.height,
            mode.frame_rate
        );

        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP8".to_string(),
                clock_rate: VIDEO_CLOCK_RATE,
                ..Default::default()
            },
            "video".to_string(),
            "chime".to_string(),
        ));

        self.pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| EngineError::TrackFailed(e.to_string()))?;

        if let Some(idx) = self.cameras.iter().position(|c| c.id == camera.id) {
            self.active_camera.store(idx, Ordering::Relaxed);
        }
        *self.video_track.lock() = Some(track);
        Ok(())
    }

    fn list_cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), EngineError> {
        match kind {
            TrackKind::Audio => self.audio_enabled.store(enabled, Ordering::Relaxed),
            TrackKind::Video => self.video_enabled.store(enabled, Ordering::Relaxed),
        }
        tracing::debug!("Track {:?} enabled: {}", kind, enabled);
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), EngineError> {
        if self.cameras.len() < 2 {
            tracing::debug!("switch_camera: only {} camera(s), no-op", self.cameras.len());
            return Ok(());
        }
        let next = (self.active_camera.load(Ordering::Relaxed) + 1) % self.cameras.len();
        self.active_camera.store(next, Ordering::Relaxed);
        tracing::info!("Switched to camera {}", self.cameras[next].id);
        Ok(())
    }

    async fn transport_counters(&self) -> Result<TransportCounters, EngineError> {
        let report = self.pc.get_stats().await;

        let mut counters = TransportCounters::default();
        let mut have_pair = false;

        for (_id, stat) in report.reports.iter() {
            match stat {
                StatsReportType::CandidatePair(pair) => {
                    // Nur das nominierte Pair trägt den aktiven Traffic
                    if pair.nominated {
                        counters.bytes_sent = pair.bytes_sent;
                        counters.bytes_received = pair.bytes_received;
                        counters.packets_sent = pair.packets_sent as u64;
                        counters.packets_received = pair.packets_received as u64;
                        counters.rtt_ms = Some(pair.current_round_trip_time * 1000.0);
                        have_pair = true;
                    }
                }
                StatsReportType::RemoteInboundRTP(remote) => {
                    // RTCP Receiver Reports der Gegenseite
                    counters.packets_lost += remote.packets_lost.max(0) as u64;
                }
                _ => {}
            }
        }

        if have_pair {
            Ok(counters)
        } else {
            Err(EngineError::StatsUnavailable)
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Failed to close peer connection: {}", e);
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Factory für webrtc-rs Engines.
///
/// Die Kamera-Liste stammt vom Embedder (Plattform-Enumeration); ohne
/// Kameras degradieren Video-Anrufe zu Audio-only.
pub struct WebRtcEngineFactory {
    cameras: Vec<CameraInfo>,
}

impl WebRtcEngineFactory {
    pub fn new(cameras: Vec<CameraInfo>) -> Self {
        Self { cameras }
    }
}

#[async_trait]
impl MediaEngineFactory for WebRtcEngineFactory {
    async fn create(
        &self,
        ice_servers: Vec<IceServer>,
    ) -> Result<Arc<dyn MediaEngine>, EngineError> {
        let engine = WebRtcEngine::new(ice_servers, self.cameras.clone()).await?;
        Ok(engine as Arc<dyn MediaEngine>)
    }
}
