//! Call Engine - Zustandsmaschine eines Anrufs
//!
//! Ein einzelner tokio-Task (Actor) verarbeitet UI-Befehle, eingehende
//! Signaling-Nachrichten und Transport-Ereignisse strikt nacheinander.
//! `CallHandle` ist die klonbare Schnittstelle für die UI.
//!
//! Zustände: `Idle → Ringing → Connecting → InCall → Ended`.

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use super::conditioner::{AudioConditioner, AudioConditionerConfig};
use super::error::{CallError, CallFailure};
use super::media::{LocalStream, LocalTrack, MediaCaptureProvider};
use super::peer::{PeerConnectionManager, TrackAttachment};
use super::quality::QualitySample;
use super::session::{
    CallRole, CallSession, CallState, CallSummary, EndReason, MediaFlags, MediaKind,
    MediaTrackState, RingDirection, TrackKind,
};
use super::transport::{IceConnectionState, PeerTransportFactory, TransportEvent};
use crate::config::CallConfig;
use crate::database::CallLog;
use crate::signaling::{
    IceCandidate, SessionId, SignalingChannel, SignalingMessage, SignalingPayload,
};

/// Grund im `CallReject` an Dritte während eines laufenden Anrufs
pub const BUSY_REASON: &str = "busy";

/// Grund im `CallEnd` nach abgelaufenem Klingeln
pub const TIMEOUT_REASON: &str = "timeout";

// ============================================================================
// OBSERVABLE TYPES
// ============================================================================

/// Zustand für die UI
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallSnapshot {
    pub state: CallState,
    pub session_id: Option<SessionId>,
    pub role: Option<CallRole>,
    pub partner_id: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub media: MediaFlags,
    pub quality: QualitySample,
}

impl Default for CallSnapshot {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            session_id: None,
            role: None,
            partner_id: None,
            media_kind: None,
            media: MediaFlags::default(),
            quality: QualitySample::disconnected(),
        }
    }
}

/// Events die von der CallEngine ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    /// Nur bei echtem Zustandswechsel
    StateChanged(CallSnapshot),
    IncomingCall {
        session_id: SessionId,
        from_peer_id: String,
        media_kind: MediaKind,
    },
    MediaChanged(MediaFlags),
    Quality(QualitySample),
    /// Gemeldeter Fehler; fatale Fehler enden zusätzlich in `Finished`
    Error(CallError),
    Finished(CallSummary),
}

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Kollaborateure der Engine
pub struct CallEngineDeps {
    pub local_peer_id: String,
    pub config: CallConfig,
    pub signaling: Arc<dyn SignalingChannel>,
    pub incoming: mpsc::UnboundedReceiver<SignalingMessage>,
    pub capture: Arc<dyn MediaCaptureProvider>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub call_log: Option<Arc<CallLog>>,
}

// ============================================================================
// COMMANDS
// ============================================================================

enum Command {
    StartCall {
        remote_peer_id: String,
        media_kind: MediaKind,
        reply: oneshot::Sender<Result<SessionId, CallError>>,
    },
    AcceptCall {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    RejectCall {
        reason: Option<String>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    ToggleMic {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    ToggleCamera {
        reply: oneshot::Sender<Result<bool, CallError>>,
    },
    RestartConditioner {
        config: AudioConditionerConfig,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

// ============================================================================
// CALL HANDLE
// ============================================================================

/// Klonbare Schnittstelle zur laufenden Engine
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<Mutex<CallSnapshot>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    /// Startet einen ausgehenden Anruf
    pub async fn start_call(
        &self,
        remote_peer_id: impl Into<String>,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        let remote_peer_id = remote_peer_id.into();
        self.request(|reply| Command::StartCall {
            remote_peer_id,
            media_kind,
            reply,
        })
        .await?
    }

    /// Nimmt den klingelnden Anruf an
    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AcceptCall { reply }).await?
    }

    /// Lehnt den klingelnden Anruf ab
    pub async fn reject_call(&self, reason: Option<String>) -> Result<(), CallError> {
        self.request(|reply| Command::RejectCall { reason, reply })
            .await?
    }

    /// Beendet den aktuellen Anruf; ohne Anruf ein No-op
    pub async fn end_call(&self) {
        let _ = self.request(|reply| Command::EndCall { reply }).await;
    }

    /// Schaltet das Mikrofon um, gibt den neuen Zustand zurück
    pub async fn toggle_mic(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMic { reply }).await?
    }

    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleCamera { reply }).await?
    }

    /// Baut den AudioConditioner mit neuer Konfiguration neu auf
    pub async fn restart_conditioner(&self, config: AudioConditionerConfig) -> Result<(), CallError> {
        self.request(|reply| Command::RestartConditioner { config, reply })
            .await?
    }

    pub fn state(&self) -> CallState {
        self.snapshot.lock().state.clone()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot.lock().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.event_tx.subscribe()
    }
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("snapshot", &*self.snapshot.lock())
            .finish()
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Aufgenommene Medien eines Anrufs samt Conditioner
struct LocalMedia {
    stream: LocalStream,
    conditioner: Option<AudioConditioner>,
    /// An den Transport übergebene Tracks
    outgoing: Vec<LocalTrack>,
    tracks: HashMap<TrackKind, MediaTrackState>,
}

impl LocalMedia {
    fn prepare(stream: LocalStream, config: &AudioConditionerConfig) -> Self {
        let mut conditioner = None;
        let mut outgoing = Vec::new();
        let mut tracks = HashMap::new();

        for track in &stream.tracks {
            tracks.insert(track.kind(), MediaTrackState::new(track.kind()));
            match track.kind() {
                TrackKind::Audio if conditioner.is_none() => {
                    let (output, c) = AudioConditioner::condition(track, config.clone());
                    conditioner = c;
                    outgoing.push(output);
                }
                _ => outgoing.push(track.clone()),
            }
        }

        Self {
            stream,
            conditioner,
            outgoing,
            tracks,
        }
    }

    fn has(&self, kind: TrackKind) -> bool {
        self.tracks.contains_key(&kind)
    }

    fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks.get(&kind).map(|t| t.enabled).unwrap_or(false)
    }

    fn set_enabled(&mut self, kind: TrackKind, enabled: bool) {
        for track in self.stream.tracks.iter().chain(self.outgoing.iter()) {
            if track.kind() == kind {
                track.set_enabled(enabled);
            }
        }
        if kind == TrackKind::Audio {
            if let Some(conditioner) = &self.conditioner {
                conditioner.set_muted(!enabled);
            }
        }
        if let Some(state) = self.tracks.get_mut(&kind) {
            state.enabled = enabled;
        }
    }

    /// Ersetzt den Conditioner, gibt den neuen Ausgangs-Track zurück
    fn restart_conditioner(&mut self, config: AudioConditionerConfig) -> Option<LocalTrack> {
        let raw = self.stream.track(TrackKind::Audio)?.clone();
        if let Some(old) = self.conditioner.take() {
            old.stop();
        }

        let (output, conditioner) = AudioConditioner::condition(&raw, config);
        if let Some(c) = &conditioner {
            c.set_muted(!self.is_enabled(TrackKind::Audio));
        }
        self.conditioner = conditioner;
        self.outgoing.retain(|t| t.kind() != TrackKind::Audio);
        self.outgoing.push(output.clone());
        Some(output)
    }

    async fn release(self, capture: &dyn MediaCaptureProvider) {
        if let Some(conditioner) = &self.conditioner {
            conditioner.stop();
        }
        capture.release(self.stream).await;
    }
}

// ============================================================================
// ACTIVE CALL
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deadline {
    Ring,
    Negotiation,
}

struct ActiveCall {
    session: CallSession,
    media: Option<LocalMedia>,
    peer: Option<PeerConnectionManager>,
    quality_rx: Option<watch::Receiver<QualitySample>>,
    quality: QualitySample,
    /// Candidates vor Erstellung der Peer-Verbindung
    early_candidates: Vec<IceCandidate>,
    ice_connected: bool,
    connected_at: Option<Instant>,
    deadline: Option<(Instant, Deadline)>,
    remote_tracks: HashMap<TrackKind, MediaTrackState>,
}

impl ActiveCall {
    fn new(session: CallSession) -> Self {
        Self {
            session,
            media: None,
            peer: None,
            quality_rx: None,
            quality: QualitySample::disconnected(),
            early_candidates: Vec::new(),
            ice_connected: false,
            connected_at: None,
            deadline: None,
            remote_tracks: HashMap::new(),
        }
    }

    fn is_ringing(&self, direction: RingDirection) -> bool {
        self.session.state == CallState::Ringing { direction }
    }

    fn media_flags(&self) -> MediaFlags {
        let (audio_enabled, video_enabled) = match &self.media {
            Some(media) => (
                media.is_enabled(TrackKind::Audio),
                media.is_enabled(TrackKind::Video),
            ),
            None => (false, false),
        };
        MediaFlags {
            audio_enabled,
            video_enabled,
            remote_audio: self.remote_tracks.contains_key(&TrackKind::Audio),
            remote_video: self.remote_tracks.contains_key(&TrackKind::Video),
        }
    }
}

enum Input {
    Command(Command),
    Signal(SignalingMessage),
    SignalingClosed,
    Transport(TransportEvent),
    QualityChanged,
    Deadline,
    Shutdown,
}

enum AcquireError {
    Failed(CallError),
    Cancelled(Option<oneshot::Sender<()>>),
}

// ============================================================================
// CALL ENGINE
// ============================================================================

/// Actor, der genau einen Anruf zur Zeit verwaltet
pub struct CallEngine {
    local_peer_id: String,
    config: CallConfig,
    signaling: Arc<dyn SignalingChannel>,
    incoming: mpsc::UnboundedReceiver<SignalingMessage>,
    incoming_open: bool,
    capture: Arc<dyn MediaCaptureProvider>,
    transports: Arc<dyn PeerTransportFactory>,
    call_log: Option<Arc<CallLog>>,
    commands: mpsc::UnboundedReceiver<Command>,
    deferred: VecDeque<Command>,
    call: Option<ActiveCall>,
    last_session: Option<CallSession>,
    finished: HashSet<SessionId>,
    snapshot: Arc<Mutex<CallSnapshot>>,
    event_tx: broadcast::Sender<CallEvent>,
}

impl CallEngine {
    /// Startet die Engine als Task und gibt den Handle zurück
    pub fn spawn(deps: CallEngineDeps) -> CallHandle {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(100);
        let snapshot = Arc::new(Mutex::new(CallSnapshot::default()));

        let engine = Self {
            local_peer_id: deps.local_peer_id,
            config: deps.config,
            signaling: deps.signaling,
            incoming: deps.incoming,
            incoming_open: true,
            capture: deps.capture,
            transports: deps.transports,
            call_log: deps.call_log,
            commands,
            deferred: VecDeque::new(),
            call: None,
            last_session: None,
            finished: HashSet::new(),
            snapshot: Arc::clone(&snapshot),
            event_tx: event_tx.clone(),
        };

        tokio::spawn(engine.run());

        CallHandle {
            commands: commands_tx,
            snapshot,
            event_tx,
        }
    }

    async fn run(mut self) {
        tracing::info!("Call engine started for peer {}", self.local_peer_id);

        loop {
            match self.next_input().await {
                Input::Command(command) => self.handle_command(command).await,
                Input::Signal(message) => self.handle_signal(message).await,
                Input::Transport(event) => self.handle_transport_event(event).await,
                Input::QualityChanged => self.handle_quality_changed(),
                Input::Deadline => self.handle_deadline().await,
                Input::SignalingClosed => {
                    tracing::warn!("Signaling queue closed, no further remote messages");
                    self.incoming_open = false;
                }
                Input::Shutdown => break,
            }
        }

        self.finish(EndReason::LocalHangup, true).await;
        tracing::info!("Call engine stopped for peer {}", self.local_peer_id);
    }

    async fn next_input(&mut self) -> Input {
        if let Some(command) = self.deferred.pop_front() {
            return Input::Command(command);
        }

        let deadline = self
            .call
            .as_ref()
            .and_then(|call| call.deadline.map(|(at, _)| at));
        let (peer, quality_rx) = match self.call.as_mut() {
            Some(call) => (call.peer.as_mut(), call.quality_rx.as_mut()),
            None => (None, None),
        };

        tokio::select! {
            biased;
            command = self.commands.recv() => match command {
                Some(command) => Input::Command(command),
                None => Input::Shutdown,
            },
            message = self.incoming.recv(), if self.incoming_open => match message {
                Some(message) => Input::Signal(message),
                None => Input::SignalingClosed,
            },
            event = next_transport_event(peer) => Input::Transport(event),
            _ = quality_changed(quality_rx) => Input::QualityChanged,
            _ = sleep_until(deadline) => Input::Deadline,
        }
    }

    // ========================================================================
    // STATE PUBLISHING
    // ========================================================================

    fn emit(&self, event: CallEvent) {
        let _ = self.event_tx.send(event);
    }

    fn build_snapshot(&self) -> CallSnapshot {
        match (&self.call, &self.last_session) {
            (Some(call), _) => CallSnapshot {
                state: call.session.state.clone(),
                session_id: Some(call.session.session_id.clone()),
                role: Some(call.session.role),
                partner_id: Some(call.session.remote_peer_id.clone()),
                media_kind: Some(call.session.media_kind),
                media: call.media_flags(),
                quality: call.quality.clone(),
            },
            (None, Some(session)) => CallSnapshot {
                state: session.state.clone(),
                session_id: Some(session.session_id.clone()),
                role: Some(session.role),
                partner_id: Some(session.remote_peer_id.clone()),
                media_kind: Some(session.media_kind),
                ..Default::default()
            },
            (None, None) => CallSnapshot::default(),
        }
    }

    /// Aktualisiert den Snapshot und meldet Änderungen
    fn publish(&self) {
        let snapshot = self.build_snapshot();
        let (state_changed, media_changed) = {
            let mut current = self.snapshot.lock();
            let state_changed =
                current.state != snapshot.state || current.session_id != snapshot.session_id;
            let media_changed = current.media != snapshot.media;
            *current = snapshot.clone();
            (state_changed, media_changed)
        };

        if media_changed {
            self.emit(CallEvent::MediaChanged(snapshot.media));
        }
        if state_changed {
            tracing::info!(
                "Call state: {:?} (session {:?})",
                snapshot.state,
                snapshot.session_id.as_ref().map(SessionId::as_str)
            );
            self.emit(CallEvent::StateChanged(snapshot));
        }
    }

    fn set_state(&mut self, state: CallState) {
        if let Some(call) = self.call.as_mut() {
            call.session.state = state;
        }
        self.publish();
    }

    fn set_deadline(&mut self, deadline: Option<Deadline>) {
        let ring = self.config.ring_timeout();
        let negotiation = self.config.negotiation_timeout();
        if let Some(call) = self.call.as_mut() {
            call.deadline = deadline.map(|kind| {
                let after = match kind {
                    Deadline::Ring => ring,
                    Deadline::Negotiation => negotiation,
                };
                (Instant::now() + after, kind)
            });
        }
    }

    // ========================================================================
    // SIGNALING OUT
    // ========================================================================

    async fn send(&self, payload: SignalingPayload) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        let message = SignalingMessage::new(
            call.session.session_id.clone(),
            self.local_peer_id.clone(),
            call.session.remote_peer_id.clone(),
            payload,
        );
        tracing::debug!(
            "Sending {} for session {}",
            message.payload.kind(),
            message.session_id
        );
        self.signaling.send(message).await.map_err(CallError::from)
    }

    /// Sendefehler melden, aber den Anruf nicht beenden
    async fn send_or_report(&self, payload: SignalingPayload) {
        if let Err(e) = self.send(payload).await {
            tracing::warn!("Signaling delivery failed: {}", e);
            self.emit(CallEvent::Error(e));
        }
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartCall {
                remote_peer_id,
                media_kind,
                reply,
            } => {
                let result = self.start_call(remote_peer_id, media_kind).await;
                let _ = reply.send(result);
            }
            Command::AcceptCall { reply } => {
                let result = self.accept_call().await;
                let _ = reply.send(result);
            }
            Command::RejectCall { reason, reply } => {
                let result = self.reject_call(reason).await;
                let _ = reply.send(result);
            }
            Command::EndCall { reply } => {
                self.finish(EndReason::LocalHangup, true).await;
                let _ = reply.send(());
            }
            Command::ToggleMic { reply } => {
                let _ = reply.send(self.toggle(TrackKind::Audio));
            }
            Command::ToggleCamera { reply } => {
                let _ = reply.send(self.toggle(TrackKind::Video));
            }
            Command::RestartConditioner { config, reply } => {
                let result = self.restart_conditioner(config).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Nimmt Medien auf; `EndCall` bricht ab, andere Befehle warten
    async fn acquire_media(&mut self, kind: MediaKind) -> Result<LocalStream, AcquireError> {
        let capture = Arc::clone(&self.capture);
        let acquire = capture.acquire(kind);
        tokio::pin!(acquire);

        loop {
            tokio::select! {
                biased;
                result = &mut acquire => {
                    return result.map_err(|e| AcquireError::Failed(e.into()));
                }
                command = self.commands.recv() => match command {
                    Some(Command::EndCall { reply }) => {
                        tracing::info!("Media acquisition cancelled by hangup");
                        return Err(AcquireError::Cancelled(Some(reply)));
                    }
                    Some(other) => self.deferred.push_back(other),
                    None => return Err(AcquireError::Cancelled(None)),
                },
            }
        }
    }

    async fn start_call(
        &mut self,
        remote_peer_id: String,
        media_kind: MediaKind,
    ) -> Result<SessionId, CallError> {
        if remote_peer_id == self.local_peer_id {
            return Err(CallError::invalid_state("cannot call yourself"));
        }

        if let Some(call) = self.call.as_ref() {
            let glare = call.is_ringing(RingDirection::Incoming)
                && call.session.remote_peer_id == remote_peer_id;
            if !glare {
                return Err(CallError::AlreadyInCall);
            }

            if self.local_peer_id > remote_peer_id {
                // Gegenseite bleibt Caller: eingehenden Anruf annehmen
                let session_id = call.session.session_id.clone();
                tracing::info!("Call to {} while ringing from it, accepting", remote_peer_id);
                self.accept_call().await?;
                return Ok(session_id);
            }

            // Wir bleiben Caller: eingehende Session still verwerfen
            let superseded = call.session.session_id.clone();
            tracing::info!("Superseding incoming session {} from {}", superseded, remote_peer_id);
            self.finished.insert(superseded);
            self.call = None;
        }

        let session = CallSession::outgoing(self.local_peer_id.clone(), remote_peer_id, media_kind);
        let session_id = session.session_id.clone();
        self.call = Some(ActiveCall::new(session));

        let stream = match self.acquire_media(media_kind).await {
            Ok(stream) => stream,
            Err(AcquireError::Failed(e)) => {
                tracing::warn!("Media acquisition failed: {}", e);
                self.call = None;
                self.last_session = None;
                self.publish();
                return Err(e);
            }
            Err(AcquireError::Cancelled(reply)) => {
                self.finish(EndReason::LocalHangup, true).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return Err(CallError::Cancelled);
            }
        };

        let audio = self.config.audio.clone();
        if let Some(call) = self.call.as_mut() {
            call.media = Some(LocalMedia::prepare(stream, &audio));
        }

        if let Err(e) = self.send(SignalingPayload::CallInvite { media_kind }).await {
            self.fail(e.clone()).await;
            return Err(e);
        }

        self.set_deadline(Some(Deadline::Ring));
        self.set_state(CallState::Ringing {
            direction: RingDirection::Outgoing,
        });
        Ok(session_id)
    }

    async fn accept_call(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        if !call.is_ringing(RingDirection::Incoming) {
            return Err(CallError::invalid_state("no incoming call is ringing"));
        }
        let media_kind = call.session.media_kind;

        let stream = match self.acquire_media(media_kind).await {
            Ok(stream) => stream,
            Err(AcquireError::Failed(e)) => {
                self.fail(e.clone()).await;
                return Err(e);
            }
            Err(AcquireError::Cancelled(reply)) => {
                self.finish(EndReason::LocalHangup, true).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return Err(CallError::Cancelled);
            }
        };

        let media = LocalMedia::prepare(stream, &self.config.audio);
        self.connect_as_receiver(media).await
    }

    /// Receiver-Seite: Peer-Verbindung öffnen und `CallAccept` senden
    async fn connect_as_receiver(&mut self, media: LocalMedia) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            media.release(self.capture.as_ref()).await;
            return Err(CallError::NoActiveCall);
        };
        call.session.role = CallRole::Receiver;
        call.media = Some(media);

        if let Err(e) = self.open_peer(CallRole::Receiver).await {
            self.fail(e.clone()).await;
            return Err(e);
        }
        if let Err(e) = self.send(SignalingPayload::CallAccept).await {
            self.fail(e.clone()).await;
            return Err(e);
        }

        self.set_deadline(Some(Deadline::Negotiation));
        self.set_state(CallState::Connecting);
        Ok(())
    }

    /// Erstellt die Peer-Verbindung und hängt die lokalen Tracks an
    async fn open_peer(&mut self, role: CallRole) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };

        let peer = PeerConnectionManager::open(
            call.session.session_id.clone(),
            role,
            self.transports.as_ref(),
            &self.config.ice_servers,
        )
        .await?;
        let peer = call.peer.insert(peer);

        let tracks = call
            .media
            .as_ref()
            .map(|m| m.outgoing.clone())
            .unwrap_or_default();
        for track in tracks {
            peer.attach_local_track(track).await?;
        }
        for candidate in std::mem::take(&mut call.early_candidates) {
            peer.add_remote_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    async fn reject_call(&mut self, reason: Option<String>) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        if !call.is_ringing(RingDirection::Incoming) {
            return Err(CallError::invalid_state("no incoming call is ringing"));
        }

        self.send_or_report(SignalingPayload::CallReject {
            reason: reason.clone(),
        })
        .await;
        self.finish(EndReason::Rejected { reason }, false).await;
        Ok(())
    }

    fn toggle(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let Some(media) = call.media.as_mut().filter(|m| m.has(kind)) else {
            return Err(CallError::invalid_state(format!("no local {kind:?} track")));
        };

        let enabled = !media.is_enabled(kind);
        media.set_enabled(kind, enabled);
        tracing::info!("Local {:?} track {}", kind, if enabled { "enabled" } else { "disabled" });
        self.publish();
        Ok(enabled)
    }

    async fn restart_conditioner(&mut self, config: AudioConditionerConfig) -> Result<(), CallError> {
        let Some(call) = self.call.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let Some(output) = call
            .media
            .as_mut()
            .and_then(|m| m.restart_conditioner(config))
        else {
            return Err(CallError::invalid_state("no local audio track"));
        };
        let Some(peer) = call.peer.as_mut() else {
            // Wird beim Öffnen der Verbindung angehängt
            return Ok(());
        };

        let attachment = peer.attach_local_track(output).await?;
        match attachment {
            TrackAttachment::NeedsRenegotiation if peer.role() == CallRole::Caller => {
                let sdp = peer.renegotiate().await?;
                self.send(SignalingPayload::SdpOffer { sdp }).await
            }
            TrackAttachment::NeedsRenegotiation => {
                tracing::warn!("Transport cannot replace tracks and receiver cannot renegotiate");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ========================================================================
    // SIGNALING IN
    // ========================================================================

    async fn handle_signal(&mut self, message: SignalingMessage) {
        if message.to_peer_id != self.local_peer_id || message.from_peer_id == self.local_peer_id {
            tracing::debug!("Ignoring {} not addressed to us", message.payload.kind());
            return;
        }

        if let SignalingPayload::CallInvite { media_kind } = message.payload {
            self.on_call_invite(message.session_id, message.from_peer_id, media_kind)
                .await;
            return;
        }

        let Some(call) = self.call.as_ref() else {
            tracing::debug!(
                "Ignoring {} for session {}: no active call",
                message.payload.kind(),
                message.session_id
            );
            return;
        };
        if call.session.session_id != message.session_id
            || call.session.remote_peer_id != message.from_peer_id
        {
            tracing::debug!(
                "Ignoring {} for unknown session {}",
                message.payload.kind(),
                message.session_id
            );
            return;
        }
        if call.session.state.is_settled() {
            // Noch nicht angekündigt oder schon beendet
            return;
        }

        let role = call.session.role;
        let result = match message.payload {
            SignalingPayload::CallAccept => self.on_call_accept().await,
            SignalingPayload::CallReject { reason } => {
                if role == CallRole::Caller && self.is_ringing(RingDirection::Outgoing) {
                    self.finish(EndReason::RemoteRejected { reason }, false).await;
                }
                Ok(())
            }
            SignalingPayload::SdpOffer { sdp } => self.on_sdp_offer(sdp).await,
            SignalingPayload::SdpAnswer { sdp } => self.on_sdp_answer(sdp).await,
            SignalingPayload::IceCandidate { candidate } => {
                self.on_remote_candidate(candidate).await;
                Ok(())
            }
            SignalingPayload::CallEnd { reason } => {
                self.finish(EndReason::RemoteHangup { reason }, false).await;
                Ok(())
            }
            SignalingPayload::CallInvite { .. } => Ok(()),
        };

        if let Err(e) = result {
            self.fail(e).await;
        }
    }

    fn is_ringing(&self, direction: RingDirection) -> bool {
        self.call
            .as_ref()
            .is_some_and(|call| call.is_ringing(direction))
    }

    async fn on_call_invite(&mut self, session_id: SessionId, from: String, media_kind: MediaKind) {
        if self.finished.contains(&session_id) {
            tracing::debug!("Ignoring invite for finished session {}", session_id);
            return;
        }

        let Some(call) = self.call.as_ref() else {
            let session =
                CallSession::incoming(session_id.clone(), self.local_peer_id.clone(), from.clone(), media_kind);
            self.call = Some(ActiveCall::new(session));
            self.set_deadline(Some(Deadline::Ring));
            tracing::info!("Incoming {:?} call from {} (session {})", media_kind, from, session_id);
            self.emit(CallEvent::IncomingCall {
                session_id,
                from_peer_id: from,
                media_kind,
            });
            self.publish();
            return;
        };

        if call.session.session_id == session_id {
            tracing::debug!("Duplicate invite for session {}", session_id);
            return;
        }

        let glare = call.session.remote_peer_id == from && call.is_ringing(RingDirection::Outgoing);
        if !glare {
            tracing::info!("Busy, rejecting invite from {} (session {})", from, session_id);
            let reject = SignalingMessage::new(
                session_id,
                self.local_peer_id.clone(),
                from,
                SignalingPayload::CallReject {
                    reason: Some(BUSY_REASON.to_string()),
                },
            );
            if let Err(e) = self.signaling.send(reject).await {
                tracing::warn!("Failed to send busy reject: {}", e);
            }
            return;
        }

        if self.local_peer_id < from {
            tracing::info!("Glare with {}: keeping our outgoing call", from);
            return;
        }

        // Glare: unsere Session wird verworfen, wir werden Receiver
        tracing::info!("Glare with {}: switching to receiver for session {}", from, session_id);
        let Some(mut superseded) = self.call.take() else {
            return;
        };
        self.finished.insert(superseded.session.session_id.clone());

        let session = CallSession::incoming(session_id, self.local_peer_id.clone(), from, media_kind);
        let mut media = superseded.media.take();
        if superseded.session.media_kind != media_kind {
            // Andere Medienart: neu aufnehmen wie beim Annehmen
            tracing::info!(
                "Glare switches media from {:?} to {:?}, reacquiring",
                superseded.session.media_kind,
                media_kind
            );
            if let Some(stale) = media.take() {
                stale.release(self.capture.as_ref()).await;
            }
        }
        self.call = Some(ActiveCall::new(session));

        match media {
            Some(media) => {
                let _ = self.connect_as_receiver(media).await;
            }
            None => {
                let _ = self.accept_call().await;
            }
        }
    }

    async fn on_call_accept(&mut self) -> Result<(), CallError> {
        let Some(call) = self.call.as_ref() else {
            return Ok(());
        };
        if call.session.role != CallRole::Caller || !call.is_ringing(RingDirection::Outgoing) {
            tracing::debug!("Ignoring call_accept in state {:?}", call.session.state);
            return Ok(());
        }

        self.open_peer(CallRole::Caller).await?;
        let sdp = self.peer_mut()?.create_offer().await?;
        self.set_deadline(Some(Deadline::Negotiation));
        self.set_state(CallState::Connecting);
        self.send(SignalingPayload::SdpOffer { sdp }).await
    }

    async fn on_sdp_offer(&mut self, sdp: String) -> Result<(), CallError> {
        let answer = self.peer_mut()?.apply_remote_offer(sdp).await?;
        self.send(SignalingPayload::SdpAnswer { sdp: answer }).await?;
        self.check_connected();
        Ok(())
    }

    async fn on_sdp_answer(&mut self, sdp: String) -> Result<(), CallError> {
        self.peer_mut()?.apply_remote_answer(sdp).await?;
        self.check_connected();
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        match call.peer.as_mut() {
            Some(peer) => {
                if let Err(e) = peer.add_remote_ice_candidate(candidate).await {
                    tracing::warn!("Failed to add remote ICE candidate: {}", e);
                }
            }
            None => call.early_candidates.push(candidate),
        }
    }

    fn peer_mut(&mut self) -> Result<&mut PeerConnectionManager, CallError> {
        self.call
            .as_mut()
            .and_then(|call| call.peer.as_mut())
            .ok_or_else(|| CallError::invalid_state("no peer connection for this session"))
    }

    /// `Connecting → InCall`, sobald beide Beschreibungen stehen und ICE verbunden ist
    fn check_connected(&mut self) {
        let interval = self.config.quality_interval();
        let Some(call) = self.call.as_mut() else {
            return;
        };
        if call.session.state != CallState::Connecting || !call.ice_connected {
            return;
        }
        let Some(peer) = call.peer.as_mut() else {
            return;
        };
        if !peer.is_negotiated() {
            return;
        }

        call.quality_rx = Some(peer.start_quality_monitor(interval));
        call.quality = QualitySample::connected_default();
        call.connected_at = Some(Instant::now());
        call.deadline = None;
        self.set_state(CallState::InCall);
    }

    // ========================================================================
    // TRANSPORT EVENTS
    // ========================================================================

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                self.send_or_report(SignalingPayload::IceCandidate { candidate })
                    .await;
            }
            TransportEvent::IceStateChanged(state) => {
                tracing::debug!("ICE state changed: {:?}", state);
                match state {
                    s if s.is_connected() => {
                        if let Some(call) = self.call.as_mut() {
                            call.ice_connected = true;
                        }
                        self.check_connected();
                    }
                    IceConnectionState::Failed => self.fail(CallError::ConnectivityFailure).await,
                    IceConnectionState::Disconnected => {
                        tracing::warn!("ICE disconnected, waiting for recovery");
                    }
                    _ => {}
                }
            }
            TransportEvent::RemoteTrack(kind) => {
                if let Some(call) = self.call.as_mut() {
                    call.remote_tracks.insert(kind, MediaTrackState::new(kind));
                }
                self.publish();
            }
        }
    }

    fn handle_quality_changed(&mut self) {
        let Some(call) = self.call.as_mut() else {
            return;
        };
        let Some(rx) = call.quality_rx.as_mut() else {
            return;
        };
        let sample = rx.borrow_and_update().clone();
        call.quality = sample.clone();
        self.snapshot.lock().quality = sample.clone();
        self.emit(CallEvent::Quality(sample));
    }

    async fn handle_deadline(&mut self) {
        let Some((_, kind)) = self.call.as_mut().and_then(|call| call.deadline.take()) else {
            return;
        };

        match kind {
            Deadline::Ring if self.is_ringing(RingDirection::Outgoing) => {
                tracing::info!("Outgoing call was not answered in time");
                self.finish(EndReason::RingTimeout, true).await;
            }
            Deadline::Ring if self.is_ringing(RingDirection::Incoming) => {
                tracing::info!("Incoming call was not answered in time");
                self.finish(EndReason::RingTimeout, false).await;
            }
            Deadline::Negotiation
                if self
                    .call
                    .as_ref()
                    .is_some_and(|c| c.session.state == CallState::Connecting) =>
            {
                self.fail(CallError::NegotiationTimeout).await;
            }
            _ => {}
        }
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    async fn fail(&mut self, error: CallError) {
        tracing::error!("Call failed: {}", error);
        self.emit(CallEvent::Error(error.clone()));
        self.finish(
            EndReason::Failed {
                failure: error.failure(),
            },
            true,
        )
        .await;
    }

    /// Beendet den aktiven Anruf; ohne Anruf ein No-op
    ///
    /// Reihenfolge: Peer-Verbindung schließen, Conditioner stoppen, Medien
    /// freigeben, Gegenseite benachrichtigen, `Ended` melden.
    async fn finish(&mut self, reason: EndReason, notify_remote: bool) {
        let Some(mut call) = self.call.take() else {
            return;
        };

        if let Some(peer) = call.peer.as_mut() {
            peer.close().await;
        }
        call.quality_rx = None;

        if let Some(media) = call.media.take() {
            media.release(self.capture.as_ref()).await;
        }

        let announced = call.session.state != CallState::Idle;
        if notify_remote && announced {
            let message = SignalingMessage::new(
                call.session.session_id.clone(),
                self.local_peer_id.clone(),
                call.session.remote_peer_id.clone(),
                SignalingPayload::CallEnd {
                    reason: wire_reason(&reason),
                },
            );
            if let Err(e) = self.signaling.send(message).await {
                tracing::warn!("Failed to send call_end: {}", e);
                self.emit(CallEvent::Error(e.into()));
            }
        }

        let ended_at = Utc::now();
        call.session.state = CallState::Ended {
            reason: reason.clone(),
        };
        call.session.ended_at = Some(ended_at);
        self.finished.insert(call.session.session_id.clone());

        let summary = CallSummary {
            call_id: call.session.session_id.clone(),
            partner_id: call.session.remote_peer_id.clone(),
            role: call.session.role,
            media_kind: call.session.media_kind,
            duration_seconds: call
                .connected_at
                .map(|at| at.elapsed().as_secs())
                .unwrap_or(0),
            was_connected: call.connected_at.is_some(),
            reason,
            ended_at,
        };

        if let Some(log) = &self.call_log {
            if let Err(e) = log.record(&summary) {
                tracing::warn!("Failed to record call {}: {}", summary.call_id, e);
            }
        }

        tracing::info!(
            "Call {} with {} ended: {:?}",
            summary.call_id,
            summary.partner_id,
            summary.reason
        );

        self.last_session = Some(call.session);
        self.publish();
        self.emit(CallEvent::Finished(summary));
    }
}

/// Grund im `CallEnd` für die Gegenseite
fn wire_reason(reason: &EndReason) -> Option<String> {
    match reason {
        EndReason::RingTimeout => Some(TIMEOUT_REASON.to_string()),
        EndReason::Failed { failure } => Some(
            match failure {
                CallFailure::NegotiationTimeout => "negotiation_timeout",
                CallFailure::ConnectivityFailure => "connectivity_failure",
                CallFailure::SignalingDelivery { .. } => "signaling_delivery",
                CallFailure::MediaAcquisition { .. } => "media_acquisition",
                CallFailure::InvalidState { .. } => "invalid_state",
            }
            .to_string(),
        ),
        _ => None,
    }
}

async fn next_transport_event(peer: Option<&mut PeerConnectionManager>) -> TransportEvent {
    match peer {
        Some(peer) => match peer.next_event().await {
            Some(event) => event,
            None => std::future::pending().await,
        },
        None => std::future::pending().await,
    }
}

async fn quality_changed(rx: Option<&mut watch::Receiver<QualitySample>>) {
    match rx {
        Some(rx) => {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
