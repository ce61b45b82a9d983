//! Call Session State Machine
//!
//! `CallManager` besitzt höchstens eine aktive Session pro Gerät und
//! orchestriert Engine, Signaling, Quality Monitor und Retry Controller.
//! Alle Transitionen laufen über die Event-Loop der Session; Timer
//! (Ring-Timeout, Disconnect-Grace) und der geplante Restart sind
//! eigenständig abbrechbare Tasks unterhalb der Session-Lebensdauer.

use super::media::{AudioRouter, MediaSession};
use super::CallError;
use crate::engine::{
    EngineEvent, IceCandidate, IceConnectionState, MediaEngine, MediaEngineFactory, SdpKind,
    SessionDescription, TrackKind,
};
use crate::ice::IceServerProvider;
use crate::notify::WakeupNotifier;
use crate::quality::{
    ConnectionQualitySample, NetworkInfo, NetworkWatcher, QualityMonitor, QualityTier,
};
use crate::retry::{RetryDecision, RetryState};
use crate::signaling::{
    CallPaths, CallRecord, CallRole, CallSignaling, CallStatus, PollSignaling, PushSignaling,
    SignalingEvent, SignalingStore,
};
use crate::{CallConfig, SignalingMode};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Timeout für den Best-effort-Write des finalen Status beim Cleanup
const FINAL_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// SESSION TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Lebenszyklus einer Session.
///
/// `Idle` und `Ended` sind terminal-äquivalent (keine aktiven
/// Ressourcen); `Failed` ist aus jedem nicht-terminalen Zustand
/// erreichbar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Idle,
    Initializing,
    Ringing,
    Connecting,
    Connected,
    Ended,
    Failed { reason: String },
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Idle | CallState::Ended | CallState::Failed { .. }
        )
    }
}

/// Momentaufnahme der aktiven Session.
///
/// Wird ausschließlich von der State Machine mutiert; der
/// signaling-seitige Record bleibt nach Call-Ende für Audit-Zwecke
/// im Store liegen und gehört nicht dem Core.
#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: Uuid,
    pub direction: CallDirection,
    pub local_participant_id: String,
    pub remote_participant_id: String,
    pub is_video: bool,
    pub is_user_call: bool,
    pub created_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Gesprächsdauer, sobald Antwort- und Ende-Zeitpunkt bekannt sind
    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.ended_at? - self.answered_at?)
    }
}

/// Events der öffentlichen Session-API
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Eingehender Call wurde registriert, wartet auf Annahme/Ablehnung
    IncomingCall(CallRecord),

    StateChanged { id: Uuid, state: CallState },

    /// Remote Track eingetroffen
    RemoteTrack { kind: TrackKind },

    /// Neues Quality-Sample des laufenden Calls
    Quality(ConnectionQualitySample),

    /// Video wurde nach erschöpften Restarts dauerhaft deaktiviert
    AudioOnlyFallback,

    MuteChanged(bool),

    VideoChanged(bool),
}

/// Beweis dass die Remote Description gesetzt wurde.
///
/// `create_and_publish_answer` verlangt diesen Wert, damit ein Answer
/// strukturell nie vor dem Offer erzeugt werden kann.
struct RemoteOfferApplied(());

// ============================================================================
// ACTIVE CALL
// ============================================================================

struct ActiveCall {
    session: Mutex<CallSession>,
    state: Mutex<CallState>,
    role: CallRole,
    engine: Arc<dyn MediaEngine>,
    signaling: Arc<dyn CallSignaling>,
    media: MediaSession,
    retry: Mutex<RetryState>,
    remote_applied: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    signal_tx: mpsc::Sender<SignalingEvent>,
    quality_tx: mpsc::Sender<ConnectionQualitySample>,
    quality: Mutex<Option<QualityMonitor>>,
    last_tier: Mutex<Option<QualityTier>>,
    ring_timer: Mutex<Option<JoinHandle<()>>>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovering: AtomicBool,
    cleaned: AtomicBool,
}

impl ActiveCall {
    fn id(&self) -> Uuid {
        self.session.lock().id
    }

    fn is_terminal(&self) -> bool {
        self.cleaned.load(Ordering::SeqCst) || self.state.lock().is_terminal()
    }

    fn track_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    fn cancel_timer(slot: &Mutex<Option<JoinHandle<()>>>) {
        if let Some(handle) = slot.lock().take() {
            handle.abort();
        }
    }

    /// Setzt die Remote Description und wendet gepufferte Candidates an
    async fn apply_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<RemoteOfferApplied, CallError> {
        self.engine.set_remote_description(desc).await?;
        self.remote_applied.store(true, Ordering::SeqCst);

        let buffered: Vec<IceCandidate> = self.pending_candidates.lock().drain(..).collect();
        for candidate in buffered {
            if let Err(e) = self.engine.add_ice_candidate(candidate).await {
                tracing::warn!("Buffered ICE candidate rejected: {}", e);
            }
        }
        Ok(RemoteOfferApplied(()))
    }

    async fn create_and_publish_answer(
        &self,
        _proof: RemoteOfferApplied,
    ) -> Result<(), CallError> {
        let answer = self.engine.create_answer().await?;
        self.engine.set_local_description(answer.clone()).await?;
        self.signaling.publish_envelope(&answer.into()).await?;
        Ok(())
    }

    fn failure_reason(&self) -> String {
        self.last_tier
            .lock()
            .map(|tier| tier.failure_reason())
            .unwrap_or("connection lost")
            .to_string()
    }
}

// ============================================================================
// CALL MANAGER
// ============================================================================

struct ManagerInner {
    config: CallConfig,
    local_id: String,
    store: Arc<dyn SignalingStore>,
    engine_factory: Arc<dyn MediaEngineFactory>,
    ice: Arc<IceServerProvider>,
    notifier: Arc<dyn WakeupNotifier>,
    audio_router: Arc<dyn AudioRouter>,
    network: Option<Arc<dyn NetworkWatcher>>,
    active: tokio::sync::Mutex<Option<Arc<ActiveCall>>>,
    pending_incoming: Mutex<Option<CallRecord>>,
    events: broadcast::Sender<CallEvent>,
}

/// Oberste Orchestrierungs-Schicht; genau eine aktive Session pro Gerät
pub struct CallManager {
    inner: Arc<ManagerInner>,
}

impl CallManager {
    pub fn new(
        config: CallConfig,
        local_id: impl Into<String>,
        store: Arc<dyn SignalingStore>,
        engine_factory: Arc<dyn MediaEngineFactory>,
        ice: Arc<IceServerProvider>,
        notifier: Arc<dyn WakeupNotifier>,
        audio_router: Arc<dyn AudioRouter>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                local_id: local_id.into(),
                store,
                engine_factory,
                ice,
                notifier,
                audio_router,
                network: None,
                active: tokio::sync::Mutex::new(None),
                pending_incoming: Mutex::new(None),
                events,
            }),
        }
    }

    /// Hängt einen Netzwerk-Watcher an; ein Netzwechsel während eines
    /// verbundenen Calls triggert caller-seitig einen proaktiven Restart.
    pub fn with_network_watcher(mut self, watcher: Arc<dyn NetworkWatcher>) -> Self {
        let inner = Arc::get_mut(&mut self.inner);
        match inner {
            Some(inner) => inner.network = Some(watcher),
            None => tracing::warn!("Network watcher must be attached before the manager is shared"),
        }
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub async fn current_state(&self) -> CallState {
        match self.inner.active.lock().await.as_ref() {
            Some(call) => call.state.lock().clone(),
            None => CallState::Idle,
        }
    }

    pub async fn current_session(&self) -> Option<CallSession> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(|call| call.session.lock().clone())
    }

    // ------------------------------------------------------------------
    // OUTGOING
    // ------------------------------------------------------------------

    /// Startet einen ausgehenden Call und liefert die Session-Id.
    ///
    /// Setup-Fehler kommen synchron zurück; danach läuft die Session
    /// event-getrieben weiter.
    pub async fn start_call(&self, callee: &str, is_video: bool) -> Result<Uuid, CallError> {
        self.start_call_as(callee, is_video, true).await
    }

    /// Variante für Calls an ein Gerät statt einen Nutzer; derselbe
    /// Pfad, nur das Record-Flag unterscheidet sich.
    pub async fn start_device_call(
        &self,
        device_id: &str,
        is_video: bool,
    ) -> Result<Uuid, CallError> {
        self.start_call_as(device_id, is_video, false).await
    }

    async fn start_call_as(
        &self,
        callee: &str,
        is_video: bool,
        is_user_call: bool,
    ) -> Result<Uuid, CallError> {
        let inner = &self.inner;
        if inner.local_id.is_empty() {
            return Err(CallError::NotAuthenticated);
        }
        if callee.is_empty() {
            return Err(CallError::PeerNotFound(callee.to_string()));
        }

        let mut slot = inner.active.lock().await;
        if slot.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        let call_id = Uuid::new_v4();
        tracing::info!("Starting {} call {} to {}", if is_video { "video" } else { "audio" }, call_id, callee);

        let servers = inner.ice.get_ice_servers().await;
        let engine = inner.engine_factory.create(servers).await?;
        // Vor dem Setup abonnieren: Candidate Gathering beginnt schon mit
        // set_local_description, diese Events müssen gepuffert werden
        let engine_rx = engine.subscribe();
        let media = MediaSession::new(Arc::clone(&engine), Arc::clone(&inner.audio_router));

        let record = CallRecord {
            id: call_id,
            caller: inner.local_id.clone(),
            callee: callee.to_string(),
            is_video,
            is_user_call,
            status: CallStatus::Ringing,
            created_at: Utc::now(),
            answered_at: None,
            ended_at: None,
        };

        // Der Record liegt im Subtree des Callees, damit dessen Client
        // eingehende Calls unter dem eigenen Pfad sieht
        let paths = CallPaths::new(callee, &call_id);
        let signaling = self.make_channel(paths, CallRole::Caller);

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let (quality_tx, quality_rx) = mpsc::channel(8);

        let setup = async {
            media.create_tracks(is_video).await?;
            signaling.publish_record(&record).await?;

            let offer = engine.create_offer(false).await?;
            engine.set_local_description(offer.clone()).await?;
            signaling.publish_envelope(&offer.into()).await?;
            signaling.start(signal_tx.clone()).await?;
            Ok::<(), CallError>(())
        };
        if let Err(e) = setup.await {
            // Der Record liegt schon im Store: terminalen Status
            // hinterlassen, sonst klingelt er beim Callee weiter
            if let Err(pub_err) = signaling.publish_status(CallStatus::Failed).await {
                tracing::warn!("Failed to mark aborted call setup: {}", pub_err);
            }
            media.release().await;
            signaling.shutdown().await;
            return Err(e);
        }

        let call = Arc::new(ActiveCall {
            session: Mutex::new(CallSession {
                id: call_id,
                direction: CallDirection::Outgoing,
                local_participant_id: inner.local_id.clone(),
                remote_participant_id: callee.to_string(),
                is_video,
                is_user_call,
                created_at: record.created_at,
                answered_at: None,
                ended_at: None,
            }),
            state: Mutex::new(CallState::Ringing),
            role: CallRole::Caller,
            engine,
            signaling,
            media,
            retry: Mutex::new(RetryState::new(inner.config.max_restart_attempts)),
            remote_applied: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            signal_tx,
            quality_tx,
            quality: Mutex::new(None),
            last_tier: Mutex::new(None),
            ring_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            recovering: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });
        *slot = Some(Arc::clone(&call));
        drop(slot);

        // Best-effort Wakeup, blockiert den Aufbau nie
        if let Err(e) = inner.notifier.notify_incoming_call(&record).await {
            tracing::warn!("Wakeup dispatch failed: {}", e);
        }

        spawn_event_loop(
            Arc::clone(inner),
            Arc::clone(&call),
            engine_rx,
            signal_rx,
            quality_rx,
        );
        spawn_ring_timer(Arc::clone(inner), Arc::clone(&call));

        let _ = inner.events.send(CallEvent::StateChanged {
            id: call_id,
            state: CallState::Ringing,
        });
        Ok(call_id)
    }

    // ------------------------------------------------------------------
    // INCOMING
    // ------------------------------------------------------------------

    /// Registriert einen eingehenden Call (vom Inbox-Listener oder
    /// Push-Payload des Embedders geliefert). Bei bereits aktivem Call
    /// wird die Gegenseite direkt abgewiesen.
    pub async fn incoming_call(&self, record: CallRecord) -> Result<(), CallError> {
        let inner = &self.inner;
        if inner.active.lock().await.is_some() {
            tracing::info!("Busy, rejecting incoming call {}", record.id);
            let paths = CallPaths::new(&inner.local_id, &record.id);
            let channel = self.make_channel(paths, CallRole::Callee);
            channel.publish_status(CallStatus::Rejected).await?;
            channel.shutdown().await;
            return Ok(());
        }

        *inner.pending_incoming.lock() = Some(record.clone());
        let _ = inner.events.send(CallEvent::IncomingCall(record));
        Ok(())
    }

    /// Nimmt den registrierten eingehenden Call an
    pub async fn answer_call(&self, session_id: Uuid, with_video: bool) -> Result<(), CallError> {
        let inner = &self.inner;
        let record = {
            let mut pending = inner.pending_incoming.lock();
            match pending.take() {
                Some(record) if record.id == session_id => record,
                other => {
                    *pending = other;
                    return Err(CallError::NoActiveCall);
                }
            }
        };

        let mut slot = inner.active.lock().await;
        if slot.is_some() {
            return Err(CallError::AlreadyInCall);
        }

        tracing::info!("Answering call {} from {}", record.id, record.caller);

        let servers = inner.ice.get_ice_servers().await;
        let engine = inner.engine_factory.create(servers).await?;
        // Abonnieren bevor das Setup Candidates lostritt
        let engine_rx = engine.subscribe();
        let media = MediaSession::new(Arc::clone(&engine), Arc::clone(&inner.audio_router));

        let paths = CallPaths::new(&inner.local_id, &record.id);
        let signaling = self.make_channel(paths, CallRole::Callee);

        let (signal_tx, signal_rx) = mpsc::channel(64);
        let (quality_tx, quality_rx) = mpsc::channel(8);

        let call = Arc::new(ActiveCall {
            session: Mutex::new(CallSession {
                id: record.id,
                direction: CallDirection::Incoming,
                local_participant_id: inner.local_id.clone(),
                remote_participant_id: record.caller.clone(),
                is_video: record.is_video,
                is_user_call: record.is_user_call,
                created_at: record.created_at,
                answered_at: None,
                ended_at: None,
            }),
            state: Mutex::new(CallState::Initializing),
            role: CallRole::Callee,
            engine,
            signaling,
            media,
            retry: Mutex::new(RetryState::new(inner.config.max_restart_attempts)),
            remote_applied: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            signal_tx: signal_tx.clone(),
            quality_tx,
            quality: Mutex::new(None),
            last_tier: Mutex::new(None),
            ring_timer: Mutex::new(None),
            grace_timer: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            recovering: AtomicBool::new(false),
            cleaned: AtomicBool::new(false),
        });

        let setup = async {
            call.media
                .create_tracks(with_video && record.is_video)
                .await?;

            let offer = call
                .signaling
                .read_offer()
                .await?
                .ok_or_else(|| {
                    CallError::Signaling(crate::signaling::SignalingError::ReadTimeout(
                        "offer".to_string(),
                    ))
                })?;
            let proof = call
                .apply_remote_description(SessionDescription::from(offer))
                .await?;
            call.create_and_publish_answer(proof).await?;

            call.signaling.publish_status(CallStatus::Active).await?;
            call.signaling.start(signal_tx).await?;
            Ok::<(), CallError>(())
        };
        if let Err(e) = setup.await {
            call.media.release().await;
            call.signaling.shutdown().await;
            return Err(e);
        }

        *call.state.lock() = CallState::Connecting;
        *slot = Some(Arc::clone(&call));
        drop(slot);

        spawn_event_loop(
            Arc::clone(inner),
            Arc::clone(&call),
            engine_rx,
            signal_rx,
            quality_rx,
        );

        let _ = inner.events.send(CallEvent::StateChanged {
            id: session_id,
            state: CallState::Connecting,
        });
        Ok(())
    }

    /// Weist den registrierten eingehenden Call ab
    pub async fn reject_call(&self, session_id: Uuid) -> Result<(), CallError> {
        let inner = &self.inner;
        let record = {
            let mut pending = inner.pending_incoming.lock();
            match pending.take() {
                Some(record) if record.id == session_id => record,
                other => {
                    *pending = other;
                    return Err(CallError::NoActiveCall);
                }
            }
        };

        tracing::info!("Rejecting call {}", record.id);
        let paths = CallPaths::new(&inner.local_id, &record.id);
        let channel = self.make_channel(paths, CallRole::Callee);
        channel.publish_status(CallStatus::Rejected).await?;
        channel.shutdown().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // IN-CALL CONTROLS
    // ------------------------------------------------------------------

    /// Beendet den aktiven Call. Idempotent: ohne aktive Session ein
    /// No-op, ein zweiter Aufruf schreibt nichts erneut.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let call = match self.inner.active.lock().await.as_ref().map(Arc::clone) {
            Some(call) => call,
            None => return Ok(()),
        };
        terminate(
            &self.inner,
            &call,
            Some(CallStatus::Ended),
            CallState::Ended,
        )
        .await;
        Ok(())
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let call = self.active_call().await?;
        let muted = call.media.toggle_mute().await?;
        let _ = self.inner.events.send(CallEvent::MuteChanged(muted));
        Ok(muted)
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        let call = self.active_call().await?;
        let enabled = call.media.toggle_video().await?;
        let _ = self.inner.events.send(CallEvent::VideoChanged(enabled));
        Ok(enabled)
    }

    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let call = self.active_call().await?;
        call.media.switch_camera().await?;
        Ok(())
    }

    async fn active_call(&self) -> Result<Arc<ActiveCall>, CallError> {
        self.inner
            .active
            .lock()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(CallError::NoActiveCall)
    }

    fn make_channel(&self, paths: CallPaths, role: CallRole) -> Arc<dyn CallSignaling> {
        let store = Arc::clone(&self.inner.store);
        match &self.inner.config.signaling {
            SignalingMode::Push => Arc::new(PushSignaling::new(store, paths, role)),
            SignalingMode::Poll(tuning) => {
                Arc::new(PollSignaling::new(store, paths, role, tuning.clone()))
            }
        }
    }
}

// ============================================================================
// EVENT LOOP
// ============================================================================

fn spawn_event_loop(
    inner: Arc<ManagerInner>,
    call: Arc<ActiveCall>,
    mut engine_rx: broadcast::Receiver<EngineEvent>,
    mut signal_rx: mpsc::Receiver<SignalingEvent>,
    mut quality_rx: mpsc::Receiver<ConnectionQualitySample>,
) {
    // Ohne Watcher hält ein Dummy-Sender den Select-Arm still
    let (net_keepalive, mut net_rx) = match &inner.network {
        Some(watcher) => (None, watcher.changes()),
        None => {
            let (tx, rx) = broadcast::channel(4);
            (Some(tx), rx)
        }
    };

    let loop_inner = Arc::clone(&inner);
    let loop_call = Arc::clone(&call);
    let handle = tokio::spawn(async move {
        let _net_keepalive = net_keepalive;
        let mut last_network = loop_inner.network.as_ref().map(|w| w.current());

        loop {
            tokio::select! {
                ev = engine_rx.recv() => match ev {
                    Ok(ev) => {
                        if handle_engine_event(&loop_inner, &loop_call, ev).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Engine event loop lagged, skipped {} events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                ev = signal_rx.recv() => match ev {
                    Some(ev) => {
                        if handle_signal_event(&loop_inner, &loop_call, ev).await {
                            break;
                        }
                    }
                    None => break,
                },
                sample = quality_rx.recv() => {
                    if let Some(sample) = sample {
                        *loop_call.last_tier.lock() = Some(sample.tier);
                        let _ = loop_inner.events.send(CallEvent::Quality(sample));
                    }
                },
                info = net_rx.recv() => {
                    if let Ok(info) = info {
                        handle_network_change(&loop_call, &mut last_network, info).await;
                    }
                },
            }
            if loop_call.cleaned.load(Ordering::SeqCst) {
                break;
            }
        }
        tracing::debug!("Event loop for call {} stopped", loop_call.id());
    });
    call.track_task(handle);
}

/// Rückgabe `true` beendet die Event-Loop
async fn handle_engine_event(
    inner: &Arc<ManagerInner>,
    call: &Arc<ActiveCall>,
    ev: EngineEvent,
) -> bool {
    match ev {
        EngineEvent::IceCandidate(candidate) => {
            if call.is_terminal() {
                return false;
            }
            if let Err(e) = call.signaling.publish_candidate(candidate).await {
                tracing::warn!("Failed to publish ICE candidate: {}", e);
            }
            false
        }
        EngineEvent::IceConnectionState(state) => match state {
            IceConnectionState::Connected | IceConnectionState::Completed => {
                on_ice_connected(inner, call);
                false
            }
            IceConnectionState::Disconnected => {
                if *call.state.lock() == CallState::Connected {
                    tracing::info!("ICE disconnected, starting grace period");
                    spawn_grace_timer(Arc::clone(inner), Arc::clone(call));
                }
                false
            }
            IceConnectionState::Failed => {
                // Restarts initiiert nur der Caller; der Callee antwortet
                // auf das frische Offer und überbrückt mit der Grace-Zeit
                match call.role {
                    CallRole::Caller => spawn_recovery(Arc::clone(inner), Arc::clone(call)),
                    CallRole::Callee => spawn_grace_timer(Arc::clone(inner), Arc::clone(call)),
                }
                false
            }
            _ => false,
        },
        EngineEvent::RemoteTrack { kind } => {
            let _ = inner.events.send(CallEvent::RemoteTrack { kind });
            false
        }
        EngineEvent::ConnectionState { connected } => {
            tracing::debug!("Peer connection state: connected={}", connected);
            false
        }
    }
}

async fn handle_signal_event(
    inner: &Arc<ManagerInner>,
    call: &Arc<ActiveCall>,
    ev: SignalingEvent,
) -> bool {
    match ev {
        SignalingEvent::EnvelopeReceived(env) => {
            match (call.role, env.kind) {
                (CallRole::Caller, SdpKind::Answer) => {
                    match call
                        .apply_remote_description(SessionDescription::from(env))
                        .await
                    {
                        Ok(_proof) => {
                            let mut state = call.state.lock();
                            if *state == CallState::Ringing {
                                *state = CallState::Connecting;
                                drop(state);
                                let _ = inner.events.send(CallEvent::StateChanged {
                                    id: call.id(),
                                    state: CallState::Connecting,
                                });
                            }
                        }
                        Err(e) => tracing::warn!("Remote answer rejected: {}", e),
                    }
                }
                (CallRole::Callee, SdpKind::Offer) => {
                    // Frisches Offer nach ICE Restart der Gegenseite
                    let applied = call
                        .apply_remote_description(SessionDescription::from(env))
                        .await;
                    match applied {
                        Ok(proof) => {
                            if let Err(e) = call.create_and_publish_answer(proof).await {
                                tracing::warn!("Renegotiation answer failed: {}", e);
                            }
                        }
                        Err(e) => tracing::warn!("Restart offer rejected: {}", e),
                    }
                }
                (role, kind) => {
                    tracing::debug!("Ignoring {:?} envelope in role {:?}", kind, role);
                }
            }
            false
        }
        SignalingEvent::RemoteCandidate(record) => {
            if call.is_terminal() {
                tracing::debug!("Discarding late ICE candidate for ended call");
                return false;
            }
            let candidate = IceCandidate::from(record);
            if call.remote_applied.load(Ordering::SeqCst) {
                if let Err(e) = call.engine.add_ice_candidate(candidate).await {
                    tracing::warn!("Remote ICE candidate rejected: {}", e);
                }
            } else {
                // Remote Description steht noch aus, Candidate puffern
                call.pending_candidates.lock().push(candidate);
            }
            false
        }
        SignalingEvent::StatusChanged(status) => match status {
            CallStatus::Ringing | CallStatus::Active => false,
            CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed => {
                tracing::info!("Remote ended call {} ({:?})", call.id(), status);
                spawn_terminate(Arc::clone(inner), Arc::clone(call), None, CallState::Ended);
                true
            }
            CallStatus::Failed => {
                spawn_terminate(
                    Arc::clone(inner),
                    Arc::clone(call),
                    None,
                    CallState::Failed {
                        reason: "remote reported failure".to_string(),
                    },
                );
                true
            }
        },
    }
}

fn on_ice_connected(inner: &Arc<ManagerInner>, call: &Arc<ActiveCall>) {
    ActiveCall::cancel_timer(&call.ring_timer);
    ActiveCall::cancel_timer(&call.grace_timer);
    call.retry.lock().on_connected();

    let newly_connected = {
        let mut state = call.state.lock();
        if *state == CallState::Connected || state.is_terminal() {
            false
        } else {
            *state = CallState::Connected;
            true
        }
    };
    if !newly_connected {
        return;
    }

    {
        let mut session = call.session.lock();
        if session.answered_at.is_none() {
            session.answered_at = Some(Utc::now());
        }
    }

    // Quality Monitor läuft nur solange Connected
    {
        let mut quality = call.quality.lock();
        if quality.is_none() {
            *quality = Some(QualityMonitor::start(
                Arc::clone(&call.engine),
                call.quality_tx.clone(),
            ));
        }
    }

    tracing::info!("Call {} connected", call.id());
    let _ = inner.events.send(CallEvent::StateChanged {
        id: call.id(),
        state: CallState::Connected,
    });
}

async fn handle_network_change(
    call: &Arc<ActiveCall>,
    last: &mut Option<NetworkInfo>,
    info: NetworkInfo,
) {
    let changed = last
        .as_ref()
        .map(|prev| prev.transport != info.transport)
        .unwrap_or(false);
    *last = Some(info);

    if !changed || call.role != CallRole::Caller {
        return;
    }
    if *call.state.lock() != CallState::Connected {
        return;
    }

    tracing::info!("Active network changed, restarting ICE proactively");
    if let Err(e) = ice_restart(call).await {
        tracing::warn!("Proactive ICE restart failed: {}", e);
    }
}

// ============================================================================
// TIMERS, RETRY & TEARDOWN
// ============================================================================

fn spawn_ring_timer(inner: Arc<ManagerInner>, call: Arc<ActiveCall>) {
    let timeout = inner.config.ring_timeout;
    let timer_call = Arc::clone(&call);
    let handle = tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if *timer_call.state.lock() != CallState::Ringing {
            return;
        }
        tracing::info!("Call {} timed out unanswered", timer_call.id());
        if let Err(e) = timer_call.signaling.publish_status(CallStatus::Missed).await {
            tracing::warn!("Failed to mark call missed: {}", e);
        }
        spawn_terminate(
            inner,
            timer_call,
            None,
            CallState::Failed {
                reason: "timed out".to_string(),
            },
        );
    });
    *call.ring_timer.lock() = Some(handle);
}

fn spawn_grace_timer(inner: Arc<ManagerInner>, call: Arc<ActiveCall>) {
    let grace = inner.config.disconnect_grace;
    let mut slot = call.grace_timer.lock();
    if slot.is_some() {
        return;
    }
    let timer_call = Arc::clone(&call);
    *slot = Some(tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        if timer_call.is_terminal() {
            return;
        }
        // Kein Recovery innerhalb der Grace-Zeit: Session beenden
        let reason = timer_call.failure_reason();
        tracing::warn!("Call {} did not recover within grace period", timer_call.id());
        if let Err(e) = timer_call.signaling.publish_status(CallStatus::Failed).await {
            tracing::warn!("Failed to publish failed status: {}", e);
        }
        spawn_terminate(inner, timer_call, None, CallState::Failed { reason });
    }));
}

async fn ice_restart(call: &Arc<ActiveCall>) -> Result<(), CallError> {
    let offer = call.engine.create_offer(true).await?;
    call.engine.set_local_description(offer.clone()).await?;
    // Neue Negotiation-Runde: Answer steht wieder aus
    call.remote_applied.store(false, Ordering::SeqCst);
    call.signaling.publish_envelope(&offer.into()).await?;
    call.signaling.start(call.signal_tx.clone()).await?;
    Ok(())
}

/// Begrenzte Entscheidungsschleife nach ICE-Failure; läuft als eigener
/// Task damit fehlschlagende Restarts nicht rekursieren.
fn spawn_recovery(inner: Arc<ManagerInner>, call: Arc<ActiveCall>) {
    if call.recovering.swap(true, Ordering::SeqCst) {
        return;
    }
    let task_call = Arc::clone(&call);
    let handle = tokio::spawn(async move {
        loop {
            if task_call.is_terminal() {
                break;
            }
            let decision = task_call
                .retry
                .lock()
                .on_ice_failed(task_call.media.has_video());
            match decision {
                RetryDecision::RestartAfter(delay) => {
                    tracing::info!("Scheduling ICE restart in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    if task_call.is_terminal() {
                        break;
                    }
                    match ice_restart(&task_call).await {
                        Ok(()) => break,
                        Err(e) => {
                            tracing::warn!("ICE restart failed: {}", e);
                        }
                    }
                }
                RetryDecision::AudioOnlyFallback => {
                    tracing::warn!("Restart attempts exhausted, degrading to audio-only");
                    if let Err(e) = task_call.media.disable_video().await {
                        tracing::warn!("Failed to disable video: {}", e);
                    }
                    let _ = inner.events.send(CallEvent::AudioOnlyFallback);
                }
                RetryDecision::GiveUp => {
                    let reason = task_call.failure_reason();
                    if let Err(e) = task_call
                        .signaling
                        .publish_status(CallStatus::Failed)
                        .await
                    {
                        tracing::warn!("Failed to publish failed status: {}", e);
                    }
                    spawn_terminate(
                        Arc::clone(&inner),
                        Arc::clone(&task_call),
                        None,
                        CallState::Failed { reason },
                    );
                    break;
                }
            }
        }
        task_call.recovering.store(false, Ordering::SeqCst);
    });
    call.track_task(handle);
}

fn spawn_terminate(
    inner: Arc<ManagerInner>,
    call: Arc<ActiveCall>,
    publish: Option<CallStatus>,
    final_state: CallState,
) {
    tokio::spawn(async move {
        terminate(&inner, &call, publish, final_state).await;
    });
}

/// Idempotente Freigabe aller Session-Ressourcen.
///
/// Wird von jedem Terminal-Pfad (Hangup, Remote-Ende, Timeout,
/// erschöpfte Retries) aufgerufen; jeder Teilschritt loggt Fehler und
/// läuft weiter, damit ein einzelner Fehlschlag nichts anderes leakt.
async fn terminate(
    inner: &Arc<ManagerInner>,
    call: &Arc<ActiveCall>,
    publish: Option<CallStatus>,
    final_state: CallState,
) {
    if call.cleaned.swap(true, Ordering::SeqCst) {
        return;
    }
    let call_id = call.id();
    tracing::info!("Terminating call {} -> {:?}", call_id, final_state);

    ActiveCall::cancel_timer(&call.ring_timer);
    ActiveCall::cancel_timer(&call.grace_timer);
    call.quality.lock().take();

    if let Some(status) = publish {
        match tokio::time::timeout(FINAL_STATUS_TIMEOUT, call.signaling.publish_status(status))
            .await
        {
            Ok(Err(e)) => tracing::warn!("Final status write failed: {}", e),
            Err(_) => tracing::warn!("Final status write timed out"),
            Ok(Ok(())) => {}
        }
    }

    call.signaling.shutdown().await;
    call.media.release().await;

    for handle in call.tasks.lock().drain(..) {
        handle.abort();
    }
    call.pending_candidates.lock().clear();

    {
        let mut session = call.session.lock();
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
    }
    *call.state.lock() = final_state.clone();

    let mut slot = inner.active.lock().await;
    if slot.as_ref().map(|c| c.id()) == Some(call_id) {
        *slot = None;
    }
    drop(slot);

    let _ = inner.events.send(CallEvent::StateChanged {
        id: call_id,
        state: final_state,
    });
}
