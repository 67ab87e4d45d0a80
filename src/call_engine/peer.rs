//! PeerConnectionManager - genau eine Peer-Verbindung pro Session
//!
//! Erzwingt die Reihenfolge der Aushandlung: Offer nur als Caller und nur
//! einmal, Answer nur nach Offer, ICE Candidates erst nach gesetzter
//! Remote Description (vorher werden sie gepuffert).

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::error::{CallError, TransportError};
use super::media::LocalTrack;
use super::quality::{NetworkQualityMonitor, QualitySample, StatsSource};
use super::session::{CallRole, TrackKind};
use super::transport::{PeerTransport, PeerTransportFactory, SdpType, TransportEvent, TransportStats};
use crate::config::IceServerConfig;
use crate::signaling::{IceCandidate, SessionId};

/// Ergebnis von `attach_local_track`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackAttachment {
    /// Neuer Track, wird mit der nächsten Aushandlung übertragen
    Added,
    /// Track ohne Neuverhandlung ersetzt
    Replaced,
    /// Derselbe Track war bereits angehängt
    Unchanged,
    /// Transport braucht einen neuen Offer/Answer-Zyklus
    NeedsRenegotiation,
}

/// Read-only Zugriff auf die Statistik für den Quality Monitor
#[derive(Clone)]
pub struct StatsHandle {
    transport: Arc<dyn PeerTransport>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StatsSource for StatsHandle {
    async fn stats(&self) -> Result<TransportStats, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.transport.stats().await
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

pub struct PeerConnectionManager {
    session_id: SessionId,
    role: CallRole,
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
    offer_created: bool,
    awaiting_answer: bool,
    local_description_set: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    attached: HashMap<TrackKind, LocalTrack>,
    closed: Arc<AtomicBool>,
    monitor: Option<NetworkQualityMonitor>,
}

impl PeerConnectionManager {
    /// Erstellt die Peer-Verbindung für eine Session
    pub async fn open(
        session_id: SessionId,
        role: CallRole,
        factory: &dyn PeerTransportFactory,
        ice_servers: &[IceServerConfig],
    ) -> Result<Self, CallError> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let transport = factory.create(ice_servers, events_tx).await?;

        tracing::debug!("Peer connection opened for session {} as {:?}", session_id, role);

        Ok(Self {
            session_id,
            role,
            transport,
            events,
            offer_created: false,
            awaiting_answer: false,
            local_description_set: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            attached: HashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
            monitor: None,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn role(&self) -> CallRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn is_remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Beide Beschreibungen angewendet
    pub fn is_negotiated(&self) -> bool {
        self.local_description_set && self.remote_description_set
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn attached_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.attached.get(&kind)
    }

    fn ensure_open(&self) -> Result<(), CallError> {
        if self.is_closed() {
            Err(TransportError::Closed.into())
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // SDP
    // ========================================================================

    /// Erstellt das Offer (nur Caller, nur einmal pro Session)
    pub async fn create_offer(&mut self) -> Result<String, CallError> {
        self.ensure_open()?;
        if self.role != CallRole::Caller {
            return Err(CallError::invalid_state("only the caller creates an offer"));
        }
        if self.offer_created {
            return Err(CallError::invalid_state("offer already created for this session"));
        }

        let sdp = self.transport.create_offer().await?;
        self.offer_created = true;
        self.awaiting_answer = true;
        self.local_description_set = true;
        tracing::debug!("Created offer for session {}", self.session_id);
        Ok(sdp)
    }

    /// Wendet das Offer der Gegenseite an und erzeugt das Answer
    ///
    /// Ein späteres Re-Offer ist erlaubt, sobald der erste Austausch steht.
    pub async fn apply_remote_offer(&mut self, sdp: String) -> Result<String, CallError> {
        self.ensure_open()?;
        if self.role != CallRole::Receiver {
            return Err(CallError::invalid_state("only the receiver applies a remote offer"));
        }
        if self.remote_description_set && !self.local_description_set {
            return Err(CallError::invalid_state("previous offer is still unanswered"));
        }

        self.transport
            .set_remote_description(SdpType::Offer, sdp)
            .await?;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;

        let answer = self.transport.create_answer().await?;
        self.local_description_set = true;
        tracing::debug!("Applied remote offer for session {}", self.session_id);
        Ok(answer)
    }

    /// Wendet das Answer der Gegenseite an (nur Caller, nach einem Offer)
    pub async fn apply_remote_answer(&mut self, sdp: String) -> Result<(), CallError> {
        self.ensure_open()?;
        if self.role != CallRole::Caller {
            return Err(CallError::invalid_state("only the caller applies a remote answer"));
        }
        if !self.awaiting_answer {
            return Err(CallError::invalid_state("no offer is awaiting an answer"));
        }

        self.transport
            .set_remote_description(SdpType::Answer, sdp)
            .await?;
        self.awaiting_answer = false;
        self.remote_description_set = true;
        self.flush_pending_candidates().await;
        tracing::debug!("Applied remote answer for session {}", self.session_id);
        Ok(())
    }

    /// Neues Offer nach einer Track-Änderung (nur Caller, nach dem ersten Austausch)
    pub async fn renegotiate(&mut self) -> Result<String, CallError> {
        self.ensure_open()?;
        if self.role != CallRole::Caller {
            return Err(CallError::invalid_state("only the caller renegotiates"));
        }
        if !self.is_negotiated() || self.awaiting_answer {
            return Err(CallError::invalid_state("negotiation still in progress"));
        }

        let sdp = self.transport.create_offer().await?;
        self.awaiting_answer = true;
        tracing::info!("Renegotiating session {}", self.session_id);
        Ok(sdp)
    }

    // ========================================================================
    // ICE
    // ========================================================================

    /// Wendet einen Candidate an oder puffert ihn bis zur Remote Description
    pub async fn add_remote_ice_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        self.ensure_open()?;
        if !self.remote_description_set {
            tracing::debug!(
                "Buffering ICE candidate for session {} ({} pending)",
                self.session_id,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push(candidate);
            return Ok(());
        }

        self.transport.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn flush_pending_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        tracing::debug!(
            "Flushing {} buffered ICE candidates for session {}",
            self.pending_candidates.len(),
            self.session_id
        );
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.transport.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to apply buffered ICE candidate: {}", e);
            }
        }
    }

    // ========================================================================
    // TRACKS
    // ========================================================================

    /// Hängt einen lokalen Track an oder ersetzt den vorhandenen gleicher Art
    pub async fn attach_local_track(
        &mut self,
        track: LocalTrack,
    ) -> Result<TrackAttachment, CallError> {
        self.ensure_open()?;
        let kind = track.kind();
        let negotiation_started = self.offer_created || self.remote_description_set;

        if let Some(existing) = self.attached.get(&kind) {
            if existing.id() == track.id() {
                return Ok(TrackAttachment::Unchanged);
            }

            if self.transport.replace_track(&track).await? {
                tracing::debug!("Replaced local {:?} track in session {}", kind, self.session_id);
                self.attached.insert(kind, track);
                return Ok(TrackAttachment::Replaced);
            }

            self.transport.remove_track(kind).await?;
        }

        self.transport.add_track(&track).await?;
        self.attached.insert(kind, track);

        Ok(if negotiation_started {
            TrackAttachment::NeedsRenegotiation
        } else {
            TrackAttachment::Added
        })
    }

    /// Entfernt den lokalen Track; `false` wenn keiner angehängt war
    pub async fn detach_local_track(&mut self, kind: TrackKind) -> Result<bool, CallError> {
        if self.attached.remove(&kind).is_none() || self.is_closed() {
            return Ok(false);
        }
        self.transport.remove_track(kind).await?;
        Ok(true)
    }

    // ========================================================================
    // STATS & EVENTS
    // ========================================================================

    pub async fn get_stats(&self) -> Result<TransportStats, CallError> {
        self.ensure_open()?;
        Ok(self.transport.stats().await?)
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            transport: Arc::clone(&self.transport),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Startet den Quality Monitor (einmalig) und gibt dessen Receiver zurück
    pub fn start_quality_monitor(&mut self, interval: Duration) -> watch::Receiver<QualitySample> {
        if let Some(monitor) = &self.monitor {
            return monitor.subscribe();
        }
        let monitor = NetworkQualityMonitor::spawn(self.stats_handle(), interval);
        let rx = monitor.subscribe();
        self.monitor = Some(monitor);
        rx
    }

    /// Nächstes Ereignis des Transports
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        self.events.recv().await
    }

    // ========================================================================
    // TEARDOWN
    // ========================================================================

    /// Gibt alle Transport-Ressourcen frei; weitere Aufrufe sind No-ops
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        self.pending_candidates.clear();
        self.attached.clear();
        self.events.close();

        if let Err(e) = self.transport.close().await {
            tracing::warn!("Error closing transport for session {}: {}", self.session_id, e);
        }
        tracing::info!("Peer connection closed for session {}", self.session_id);
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transport = Arc::clone(&self.transport);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = transport.close().await;
            });
        }
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("local_description_set", &self.local_description_set)
            .field("remote_description_set", &self.remote_description_set)
            .field("pending_candidates", &self.pending_candidates.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
