use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::call_engine::{
    IceConnectionState, LocalTrack, PeerTransport, PeerTransportFactory, SdpType, TrackKind,
    TransportError, TransportEvent, TransportStats,
};
use pulse_call::config::IceServerConfig;
use pulse_call::signaling::IceCandidate;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Verhalten von ICE, sobald beide Beschreibungen gesetzt sind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceOutcome {
    Connect,
    Fail,
    /// Meldet nie einen Zustandswechsel
    Silent,
}

#[derive(Debug, Default)]
struct MockState {
    local_set: bool,
    remote_set: bool,
    ice_reported: bool,
    closed: bool,
    tracks: HashSet<TrackKind>,
    remote_candidates: Vec<IceCandidate>,
}

/// Transport, der "verbindet", sobald Offer/Answer auf seiner Seite fertig sind
pub struct MockTransport {
    outcome: IceOutcome,
    rtt_ms: Option<f64>,
    events: mpsc::UnboundedSender<TransportEvent>,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn tracks(&self) -> HashSet<TrackKind> {
        self.state.lock().tracks.clone()
    }

    pub fn remote_candidate_count(&self) -> usize {
        self.state.lock().remote_candidates.len()
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.state.lock().closed {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn local_description_applied(&self) {
        self.state.lock().local_set = true;
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(
            "candidate:1 1 udp 2122260223 192.0.2.10 54321 typ host",
        )));
        self.maybe_report_ice();
    }

    fn maybe_report_ice(&self) {
        let report = {
            let mut state = self.state.lock();
            if state.local_set && state.remote_set && !state.ice_reported {
                state.ice_reported = true;
                true
            } else {
                false
            }
        };
        if !report {
            return;
        }

        match self.outcome {
            IceOutcome::Connect => {
                self.emit(TransportEvent::IceStateChanged(IceConnectionState::Checking));
                self.emit(TransportEvent::IceStateChanged(IceConnectionState::Connected));
            }
            IceOutcome::Fail => {
                self.emit(TransportEvent::IceStateChanged(IceConnectionState::Checking));
                self.emit(TransportEvent::IceStateChanged(IceConnectionState::Failed));
            }
            IceOutcome::Silent => {}
        }
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        self.local_description_applied();
        Ok("v=0\r\ns=mock-offer\r\n".to_string())
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        if !self.state.lock().remote_set {
            return Err(TransportError::InvalidSdp("no remote offer".into()));
        }
        self.local_description_applied();
        Ok("v=0\r\ns=mock-answer\r\n".to_string())
    }

    async fn set_remote_description(
        &self,
        _kind: SdpType,
        _sdp: String,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().remote_set = true;
        self.emit(TransportEvent::RemoteTrack(TrackKind::Audio));
        self.maybe_report_ice();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().remote_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.state.lock().tracks.insert(track.kind());
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        self.ensure_open()?;
        Ok(self.state.lock().tracks.contains(&track.kind()))
    }

    async fn remove_track(&self, kind: TrackKind) -> Result<(), TransportError> {
        self.state.lock().tracks.remove(&kind);
        Ok(())
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        Ok(TransportStats {
            round_trip_time_ms: self.rtt_ms,
            ..Default::default()
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// Liefert `MockTransport`s und behält sie zur Prüfung
#[derive(Clone)]
pub struct MockTransportFactory {
    outcome: IceOutcome,
    rtt_ms: Option<f64>,
    created: Arc<Mutex<Vec<Arc<MockTransport>>>>,
}

impl MockTransportFactory {
    pub fn new(outcome: IceOutcome) -> Self {
        Self {
            outcome,
            rtt_ms: Some(30.0),
            created: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn last(&self) -> Option<Arc<MockTransport>> {
        self.created.lock().last().cloned()
    }

    pub fn all_closed(&self) -> bool {
        self.created.lock().iter().all(|t| t.is_closed())
    }
}

#[async_trait]
impl PeerTransportFactory for MockTransportFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(MockTransport {
            outcome: self.outcome,
            rtt_ms: self.rtt_ms,
            events,
            state: Mutex::new(MockState::default()),
        });
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}
