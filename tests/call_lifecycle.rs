//! End-to-End-Tests des Call-Lebenszyklus über eine gescriptete
//! Mock-Engine und den In-Memory Store.

use async_trait::async_trait;
use chime::engine::{
    CameraFacing, CameraInfo, CaptureMode, EngineError, EngineEvent, IceCandidate,
    IceConnectionState, MediaEngine, MediaEngineFactory, SessionDescription, TrackKind,
    TransportCounters,
};
use chime::ice::{IceCredentialFetcher, IceError, IceServer, IceServerProvider};
use chime::notify::NoopNotifier;
use chime::session::{CallEvent, CallManager, CallState, NoopAudioRouter};
use chime::signaling::{CallPaths, CallRecord, CallStatus, MemoryStore, SignalingStore};
use chime::CallConfig;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

// ============================================================================
// MOCKS
// ============================================================================

struct MockEngine {
    events: broadcast::Sender<EngineEvent>,
    ops: Mutex<Vec<String>>,
    offers: Mutex<Vec<(Instant, bool)>>,
    answer_count: AtomicU32,
    remote_set: AtomicBool,
    close_count: AtomicU32,
    cameras: Vec<CameraInfo>,
    // Skript-Schalter für einzelne Szenarien
    candidate_on_set_local: bool,
    fail_offers: bool,
}

impl MockEngine {
    fn new(cameras: Vec<CameraInfo>, candidate_on_set_local: bool, fail_offers: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(128);
        Arc::new(Self {
            events,
            ops: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            answer_count: AtomicU32::new(0),
            remote_set: AtomicBool::new(false),
            close_count: AtomicU32::new(0),
            cameras,
            candidate_on_set_local,
            fail_offers,
        })
    }

    fn log(&self, op: impl Into<String>) {
        self.ops.lock().unwrap().push(op.into());
    }

    fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    fn offers(&self) -> Vec<(Instant, bool)> {
        self.offers.lock().unwrap().clone()
    }

    fn send(&self, ev: EngineEvent) {
        let _ = self.events.send(ev);
    }
}

#[async_trait]
impl MediaEngine for MockEngine {
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, EngineError> {
        if self.fail_offers {
            return Err(EngineError::OfferFailed("scripted failure".to_string()));
        }
        let mut offers = self.offers.lock().unwrap();
        offers.push((Instant::now(), ice_restart));
        let n = offers.len();
        drop(offers);
        self.log(format!("create_offer({})", ice_restart));
        Ok(SessionDescription::offer(format!("v=0 mock-offer {}", n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(EngineError::AnswerFailed(
                "remote description not set".to_string(),
            ));
        }
        let n = self.answer_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.log("create_answer");
        Ok(SessionDescription::answer(format!("v=0 mock-answer {}", n)))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        self.log("set_local");
        // Candidate Gathering beginnt mit der Local Description
        if self.candidate_on_set_local {
            let _ = self.events.send(EngineEvent::IceCandidate(IceCandidate {
                candidate: "candidate:gathered-during-setup".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), EngineError> {
        self.remote_set.store(true, Ordering::SeqCst);
        self.log("set_remote");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(EngineError::CandidateRejected(
                "no remote description".to_string(),
            ));
        }
        self.log(format!("add_candidate({})", candidate.candidate));
        Ok(())
    }

    async fn add_audio_track(&self) -> Result<(), EngineError> {
        self.log("add_audio_track");
        Ok(())
    }

    async fn add_video_track(
        &self,
        camera: &CameraInfo,
        _mode: CaptureMode,
    ) -> Result<(), EngineError> {
        self.log(format!("add_video_track({})", camera.id));
        Ok(())
    }

    fn list_cameras(&self) -> Vec<CameraInfo> {
        self.cameras.clone()
    }

    async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), EngineError> {
        self.log(format!("set_enabled({:?},{})", kind, enabled));
        Ok(())
    }

    async fn switch_camera(&self) -> Result<(), EngineError> {
        self.log("switch_camera");
        Ok(())
    }

    async fn transport_counters(&self) -> Result<TransportCounters, EngineError> {
        Ok(TransportCounters {
            rtt_ms: Some(50.0),
            ..Default::default()
        })
    }

    async fn close(&self) {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        self.log("close");
    }
}

struct MockFactory {
    cameras: Vec<CameraInfo>,
    candidate_on_set_local: AtomicBool,
    fail_offers: AtomicBool,
    created: Mutex<Vec<Arc<MockEngine>>>,
}

impl MockFactory {
    fn new(cameras: Vec<CameraInfo>) -> Arc<Self> {
        Arc::new(Self {
            cameras,
            candidate_on_set_local: AtomicBool::new(false),
            fail_offers: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        })
    }

    fn engine(&self, index: usize) -> Arc<MockEngine> {
        Arc::clone(&self.created.lock().unwrap()[index])
    }

    fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaEngineFactory for MockFactory {
    async fn create(
        &self,
        _ice_servers: Vec<IceServer>,
    ) -> Result<Arc<dyn MediaEngine>, EngineError> {
        let engine = MockEngine::new(
            self.cameras.clone(),
            self.candidate_on_set_local.load(Ordering::SeqCst),
            self.fail_offers.load(Ordering::SeqCst),
        );
        self.created.lock().unwrap().push(Arc::clone(&engine));
        Ok(engine)
    }
}

struct StaticFetcher;

#[async_trait]
impl IceCredentialFetcher for StaticFetcher {
    async fn fetch_ice_servers(&self) -> Result<Vec<IceServer>, IceError> {
        Ok(vec![IceServer::stun(&["stun:stun.example.org:3478"])])
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn front_camera() -> Vec<CameraInfo> {
    vec![CameraInfo {
        id: "cam-front".to_string(),
        facing: CameraFacing::Front,
    }]
}

fn manager(
    local: &str,
    store: &Arc<MemoryStore>,
    factory: &Arc<MockFactory>,
    config: CallConfig,
) -> CallManager {
    CallManager::new(
        config,
        local,
        Arc::clone(store) as Arc<dyn SignalingStore>,
        Arc::clone(factory) as Arc<dyn MediaEngineFactory>,
        Arc::new(IceServerProvider::new(Box::new(StaticFetcher))),
        Arc::new(NoopNotifier),
        Arc::new(NoopAudioRouter),
    )
}

async fn wait_for<F: Fn(&CallState) -> bool>(mgr: &CallManager, pred: F, what: &str) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if pred(&mgr.current_state().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn wait_until<F: Fn() -> bool>(pred: F, what: &str) {
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}

async fn read_record(store: &MemoryStore, callee: &str, id: &Uuid) -> CallRecord {
    let meta = CallPaths::new(callee, id).root().child("meta");
    let value = store.read(&meta).await.unwrap().expect("call record");
    serde_json::from_value(value).unwrap()
}

async fn read_status(store: &MemoryStore, callee: &str, id: &Uuid) -> Option<CallStatus> {
    let value = store.read(&CallPaths::new(callee, id).status()).await.unwrap();
    value.and_then(|v| serde_json::from_value(v).ok())
}

fn index_of(ops: &[String], needle: &str) -> Option<usize> {
    ops.iter().position(|op| op.starts_with(needle))
}

// ============================================================================
// LIFECYCLE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn call_connects_end_to_end_and_tears_down() {
    let store = Arc::new(MemoryStore::new());
    let alice_factory = MockFactory::new(vec![]);
    let bob_factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &alice_factory, CallConfig::default());
    let bob = manager("bob", &store, &bob_factory, CallConfig::default());
    let mut bob_events = bob.subscribe();

    let call_id = alice.start_call("bob", false).await.unwrap();
    assert_eq!(alice.current_state().await, CallState::Ringing);

    let record = read_record(&store, "bob", &call_id).await;
    assert_eq!(record.caller, "alice");
    bob.incoming_call(record).await.unwrap();
    match bob_events.recv().await.unwrap() {
        CallEvent::IncomingCall(rec) => assert_eq!(rec.id, call_id),
        other => panic!("unexpected event: {:?}", other),
    }

    bob.answer_call(call_id, false).await.unwrap();

    // Answer muss nach der Remote Description erzeugt worden sein
    let bob_ops = bob_factory.engine(0).ops();
    assert!(index_of(&bob_ops, "set_remote").unwrap() < index_of(&bob_ops, "create_answer").unwrap());

    wait_for(&alice, |s| *s == CallState::Connecting, "alice connecting").await;

    alice_factory
        .engine(0)
        .send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    bob_factory
        .engine(0)
        .send(EngineEvent::IceConnectionState(IceConnectionState::Connected));

    wait_for(&alice, |s| *s == CallState::Connected, "alice connected").await;
    wait_for(&bob, |s| *s == CallState::Connected, "bob connected").await;

    let session = alice.current_session().await.unwrap();
    assert!(session.answered_at.is_some());

    alice.end_call().await.unwrap();
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Ended));

    // Das Remote-Ende räumt Bobs Session über den Status-Watcher ab
    wait_for(&alice, |s| *s == CallState::Idle, "alice idle").await;
    wait_for(&bob, |s| *s == CallState::Idle, "bob idle").await;

    wait_until(
        || {
            alice_factory.engine(0).close_count.load(Ordering::SeqCst) == 1
                && bob_factory.engine(0).close_count.load(Ordering::SeqCst) == 1
        },
        "both engines closed",
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn poll_strategy_drives_the_same_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let alice_factory = MockFactory::new(vec![]);
    let bob_factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &alice_factory, CallConfig::polling());
    let bob = manager("bob", &store, &bob_factory, CallConfig::polling());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let record = read_record(&store, "bob", &call_id).await;
    bob.incoming_call(record).await.unwrap();
    bob.answer_call(call_id, false).await.unwrap();

    wait_for(&alice, |s| *s == CallState::Connecting, "alice connecting").await;

    alice_factory
        .engine(0)
        .send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    bob_factory
        .engine(0)
        .send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    wait_for(&alice, |s| *s == CallState::Connected, "alice connected").await;
    wait_for(&bob, |s| *s == CallState::Connected, "bob connected").await;

    bob.end_call().await.unwrap();
    wait_for(&alice, |s| *s == CallState::Idle, "alice idle").await;
    wait_for(&bob, |s| *s == CallState::Idle, "bob idle").await;
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Ended));
}

#[tokio::test(start_paused = true)]
async fn repeated_cycles_release_every_engine() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    for i in 0..3 {
        alice.start_call("bob", false).await.unwrap();
        alice.end_call().await.unwrap();
        wait_for(&alice, |s| *s == CallState::Idle, "idle after cycle").await;
        assert_eq!(factory.count(), i + 1);
        assert_eq!(factory.engine(i).close_count.load(Ordering::SeqCst), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn ending_twice_is_an_idempotent_no_op() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    alice.end_call().await.unwrap();
    // Zweites Auflegen wirft nicht und schreibt nichts erneut
    alice.end_call().await.unwrap();
    assert_eq!(factory.engine(0).close_count.load(Ordering::SeqCst), 1);
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Ended));
}

#[tokio::test(start_paused = true)]
async fn second_outgoing_call_is_refused() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    alice.start_call("bob", false).await.unwrap();
    assert!(matches!(
        alice.start_call("carol", false).await,
        Err(chime::CallError::AlreadyInCall)
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_setup_leaves_a_terminal_status_behind() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    factory.fail_offers.store(true, Ordering::SeqCst);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    assert!(alice.start_call("bob", false).await.is_err());

    // Der schon publizierte Record darf beim Callee nicht weiterklingeln
    let calls = store
        .read(&chime::signaling::StorePath::new("bob/calls"))
        .await
        .unwrap()
        .expect("call record subtree");
    let status = calls
        .as_object()
        .unwrap()
        .iter()
        .find(|(key, _)| key.ends_with("/status"))
        .map(|(_, value)| value.clone())
        .expect("status entry");
    assert_eq!(status, json!("failed"));
}

// ============================================================================
// CANDIDATE ORDERING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn candidates_gathered_during_setup_are_published() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    factory.candidate_on_set_local.store(true, Ordering::SeqCst);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    // Die Engine meldet den Candidate schon während set_local_description,
    // also bevor die Event-Loop der Session läuft
    let call_id = alice.start_call("bob", false).await.unwrap();

    let ice_path = CallPaths::new("bob", &call_id).ice(chime::signaling::CandidateDirection::ToCallee);
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if store.read(&ice_path).await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("setup candidate was never published");
}

#[tokio::test(start_paused = true)]
async fn candidates_before_remote_description_are_buffered() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let paths = CallPaths::new("bob", &call_id);

    // Candidate trifft vor dem Answer ein
    store
        .publish(
            &paths.ice(chime::signaling::CandidateDirection::ToCaller).child("c1"),
            json!({"candidate": "candidate:early", "sdpMid": "0", "sdpMLineIndex": 0, "direction": "toCaller"}),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(index_of(&factory.engine(0).ops(), "add_candidate").is_none());

    store
        .publish(&paths.answer(), json!({"type": "answer", "sdp": "v=0 remote-answer"}))
        .await
        .unwrap();
    wait_for(&alice, |s| *s == CallState::Connecting, "alice connecting").await;

    wait_until(
        || index_of(&factory.engine(0).ops(), "add_candidate").is_some(),
        "buffered candidate applied",
    )
    .await;
    let ops = factory.engine(0).ops();
    assert!(index_of(&ops, "set_remote").unwrap() < index_of(&ops, "add_candidate").unwrap());
}

#[tokio::test(start_paused = true)]
async fn candidates_after_remote_description_apply_directly() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let paths = CallPaths::new("bob", &call_id);

    store
        .publish(&paths.answer(), json!({"type": "answer", "sdp": "v=0 remote-answer"}))
        .await
        .unwrap();
    wait_for(&alice, |s| *s == CallState::Connecting, "alice connecting").await;

    store
        .publish(
            &paths.ice(chime::signaling::CandidateDirection::ToCaller).child("c1"),
            json!({"candidate": "candidate:late-join", "sdpMid": "0", "sdpMLineIndex": 0, "direction": "toCaller"}),
        )
        .await
        .unwrap();

    wait_until(
        || index_of(&factory.engine(0).ops(), "add_candidate").is_some(),
        "candidate applied",
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn candidates_after_call_end_are_discarded() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    alice.end_call().await.unwrap();
    let ops_before = factory.engine(0).ops().len();

    store
        .publish(
            &CallPaths::new("bob", &call_id)
                .ice(chime::signaling::CandidateDirection::ToCaller)
                .child("late"),
            json!({"candidate": "candidate:too-late", "sdpMid": null, "sdpMLineIndex": null, "direction": "toCaller"}),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(factory.engine(0).ops().len(), ops_before);
}

// ============================================================================
// TIMERS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out_as_missed() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());
    let mut events = alice.subscribe();

    let call_id = alice.start_call("bob", false).await.unwrap();

    wait_for(
        &alice,
        |s| matches!(s, CallState::Idle),
        "timeout teardown",
    )
    .await;
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Missed));
    assert_eq!(factory.engine(0).close_count.load(Ordering::SeqCst), 1);

    let mut saw_timeout = false;
    while let Ok(ev) = events.try_recv() {
        if let CallEvent::StateChanged {
            state: CallState::Failed { reason },
            ..
        } = ev
        {
            assert_eq!(reason, "timed out");
            saw_timeout = true;
        }
    }
    assert!(saw_timeout);
}

#[tokio::test(start_paused = true)]
async fn disconnect_without_recovery_fails_after_grace() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let paths = CallPaths::new("bob", &call_id);
    store
        .publish(&paths.answer(), json!({"type": "answer", "sdp": "v=0 remote-answer"}))
        .await
        .unwrap();
    let engine = factory.engine(0);
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    wait_for(&alice, |s| *s == CallState::Connected, "connected").await;

    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Disconnected));
    wait_for(&alice, |s| *s == CallState::Idle, "grace teardown").await;
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Failed));
}

// ============================================================================
// RETRY & FALLBACK
// ============================================================================

#[tokio::test(start_paused = true)]
async fn ice_failure_restarts_with_backoff_then_falls_back_to_audio() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(front_camera());
    let alice = manager("alice", &store, &factory, CallConfig::default());
    let mut events = alice.subscribe();

    let call_id = alice.start_call("bob", true).await.unwrap();
    let paths = CallPaths::new("bob", &call_id);
    store
        .publish(&paths.answer(), json!({"type": "answer", "sdp": "v=0 remote-answer"}))
        .await
        .unwrap();
    let engine = factory.engine(0);
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    wait_for(&alice, |s| *s == CallState::Connected, "connected").await;
    assert!(index_of(&engine.ops(), "add_video_track").is_some());

    // Drei Failures: Restarts nach 2s, 4s, 8s
    let mut expected = 1; // initiales Offer
    for attempt in 0..3u32 {
        let failed_at = Instant::now();
        engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
        expected += 1;
        wait_until(|| engine.offers().len() == expected, "restart offer").await;

        let (at, restart) = engine.offers()[expected - 1];
        assert!(restart);
        let delay = at.duration_since(failed_at);
        assert_eq!(delay, Duration::from_millis(2000 * 2u64.pow(attempt)));
    }

    // Vierter Failure: Versuche erschöpft, Video-Call degradiert auf
    // Audio-only und bekommt einen weiteren Restart nach 2s
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
    expected += 1;
    wait_until(|| engine.offers().len() == expected, "fallback restart").await;
    assert!(engine
        .ops()
        .iter()
        .any(|op| op == "set_enabled(Video,false)"));
    loop {
        match events.recv().await {
            Ok(CallEvent::AudioOnlyFallback) => break,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(_) => panic!("event stream closed before fallback"),
        }
    }

    // Der Fallback-Restart hat bereits Versuch 1 verbraucht; zwei
    // weitere Failures, dann ist Audio-only erschöpft und terminal
    for _ in 0..2 {
        let before = engine.offers().len();
        engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
        wait_until(|| engine.offers().len() == before + 1, "audio-only restart").await;
    }
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
    wait_for(&alice, |s| matches!(s, CallState::Idle), "terminal teardown").await;
    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Failed));
}

#[tokio::test(start_paused = true)]
async fn reconnect_resets_the_backoff() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let paths = CallPaths::new("bob", &call_id);
    store
        .publish(&paths.answer(), json!({"type": "answer", "sdp": "v=0 remote-answer"}))
        .await
        .unwrap();
    let engine = factory.engine(0);
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    wait_for(&alice, |s| *s == CallState::Connected, "connected").await;

    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
    wait_until(|| engine.offers().len() == 2, "first restart").await;

    // Reconnect setzt den Zähler zurück: der nächste Failure wartet
    // wieder die Basis-Verzögerung ab
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Connected));
    wait_for(&alice, |s| *s == CallState::Connected, "reconnected").await;

    let failed_at = Instant::now();
    engine.send(EngineEvent::IceConnectionState(IceConnectionState::Failed));
    wait_until(|| engine.offers().len() == 3, "post-reset restart").await;
    let (at, _) = engine.offers()[2];
    assert_eq!(at.duration_since(failed_at), Duration::from_millis(2000));
}

// ============================================================================
// REJECT & CONTROLS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rejecting_an_incoming_call_publishes_rejected() {
    let store = Arc::new(MemoryStore::new());
    let alice_factory = MockFactory::new(vec![]);
    let bob_factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &alice_factory, CallConfig::default());
    let bob = manager("bob", &store, &bob_factory, CallConfig::default());

    let call_id = alice.start_call("bob", false).await.unwrap();
    let record = read_record(&store, "bob", &call_id).await;
    bob.incoming_call(record).await.unwrap();
    bob.reject_call(call_id).await.unwrap();

    assert_eq!(read_status(&store, "bob", &call_id).await, Some(CallStatus::Rejected));
    // Der Caller räumt über den Status-Watcher ab
    wait_for(&alice, |s| *s == CallState::Idle, "caller teardown").await;
    // Beim Callee wurde nie eine Engine erzeugt
    assert_eq!(bob_factory.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn mute_and_video_toggles_flip_track_flags() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(front_camera());
    let alice = manager("alice", &store, &factory, CallConfig::default());

    alice.start_call("bob", true).await.unwrap();
    let engine = factory.engine(0);

    assert!(alice.toggle_mute().await.unwrap());
    assert!(!alice.toggle_mute().await.unwrap());
    assert!(!alice.toggle_video().await.unwrap());
    assert!(alice.toggle_video().await.unwrap());

    let ops = engine.ops();
    assert!(ops.iter().any(|op| op == "set_enabled(Audio,false)"));
    assert!(ops.iter().any(|op| op == "set_enabled(Audio,true)"));
    assert!(ops.iter().any(|op| op == "set_enabled(Video,false)"));

    alice.switch_camera().await.unwrap();
    assert!(engine.ops().iter().any(|op| op == "switch_camera"));
}

#[tokio::test(start_paused = true)]
async fn audio_only_call_without_camera_still_starts() {
    let store = Arc::new(MemoryStore::new());
    let factory = MockFactory::new(vec![]);
    let alice = manager("alice", &store, &factory, CallConfig::default());

    // Video angefragt, keine Kamera vorhanden: degradiert auf Audio-only
    alice.start_call("bob", true).await.unwrap();
    let ops = factory.engine(0).ops();
    assert!(index_of(&ops, "add_audio_track").is_some());
    assert!(index_of(&ops, "add_video_track").is_none());
}
