use pulse_call::call_engine::{
    CallEngine, CallEngineDeps, CallEvent, CallHandle, CallSnapshot, CallState,
};
use pulse_call::config::CallConfig;
use pulse_call::database::CallLog;
use pulse_call::signaling::{memory_pair, MemorySignaling};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use super::mock_capture::{CaptureBehavior, MockCapture};
use super::mock_signaling::ScriptedSignaling;
use super::mock_transport::{IceOutcome, MockTransportFactory};

/// Obergrenze für jedes einzelne Warten bei pausierter Uhr
const EVENT_TIMEOUT: Duration = Duration::from_secs(600);

pub struct PeerSetup {
    pub capture: CaptureBehavior,
    pub ice: IceOutcome,
    pub config: CallConfig,
}

impl Default for PeerSetup {
    fn default() -> Self {
        Self {
            capture: CaptureBehavior::Grant,
            ice: IceOutcome::Connect,
            config: CallConfig::default(),
        }
    }
}

/// Eine Engine samt Zugriff auf alle gemockten Kollaborateure
pub struct TestPeer {
    pub id: &'static str,
    pub handle: CallHandle,
    pub events: broadcast::Receiver<CallEvent>,
    pub capture: MockCapture,
    pub transports: MockTransportFactory,
    pub signaling: ScriptedSignaling,
    /// Schreibt direkt in die eingehende Queue dieses Peers
    pub inbox: MemorySignaling,
    pub log: Arc<CallLog>,
}

fn spawn_peer(
    id: &'static str,
    setup: PeerSetup,
    outgoing: MemorySignaling,
    incoming: tokio::sync::mpsc::UnboundedReceiver<pulse_call::signaling::SignalingMessage>,
    inbox: MemorySignaling,
) -> TestPeer {
    let capture = MockCapture::new(setup.capture);
    let transports = MockTransportFactory::new(setup.ice);
    let signaling = ScriptedSignaling::new(outgoing);
    let log = Arc::new(CallLog::open_in_memory().expect("in-memory call log"));

    let handle = CallEngine::spawn(CallEngineDeps {
        local_peer_id: id.to_string(),
        config: setup.config,
        signaling: Arc::new(signaling.clone()),
        incoming,
        capture: Arc::new(capture.clone()),
        transports: Arc::new(transports.clone()),
        call_log: Some(Arc::clone(&log)),
    });
    let events = handle.subscribe();

    TestPeer {
        id,
        handle,
        events,
        capture,
        transports,
        signaling,
        inbox,
        log,
    }
}

/// "alice" und "bob", über In-Memory-Signaling verbunden
pub fn spawn_pair(alice: PeerSetup, bob: PeerSetup) -> (TestPeer, TestPeer) {
    let ((to_bob, alice_rx), (to_alice, bob_rx)) = memory_pair();
    let alice = spawn_peer("alice", alice, to_bob.clone(), alice_rx, to_alice.clone());
    let bob = spawn_peer("bob", bob, to_alice, bob_rx, to_bob);
    (alice, bob)
}

pub async fn next_matching(
    events: &mut broadcast::Receiver<CallEvent>,
    pred: impl Fn(&CallEvent) -> bool,
) -> CallEvent {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for call event")
}

pub async fn wait_for_state(
    peer: &mut TestPeer,
    pred: impl Fn(&CallState) -> bool,
) -> CallSnapshot {
    let event = next_matching(&mut peer.events, |e| {
        matches!(e, CallEvent::StateChanged(s) if pred(&s.state))
    })
    .await;
    match event {
        CallEvent::StateChanged(snapshot) => snapshot,
        other => panic!("unexpected event {:?}", other),
    }
}

/// Alles aktuell Gepufferte, ohne zu warten
pub fn drain(events: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return out,
        }
    }
}

/// Bringt beide Peers nach `InCall`, alice ist Caller
pub async fn connect(alice: &mut TestPeer, bob: &mut TestPeer) {
    alice
        .handle
        .start_call(bob.id, pulse_call::MediaKind::Audio)
        .await
        .expect("start call");
    next_matching(&mut bob.events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    bob.handle.accept_call().await.expect("accept call");

    wait_for_state(alice, |s| *s == CallState::InCall).await;
    wait_for_state(bob, |s| *s == CallState::InCall).await;
}

/// Lässt wartende Nachrichten bei pausierter Uhr durchlaufen
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
