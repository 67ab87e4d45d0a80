//! Peer Transport Abstraktion
//!
//! Kapselt die plattformspezifische Peer-Verbindung (SDP, ICE, Tracks).
//! Callbacks des Transports kommen als `TransportEvent` über einen
//! mpsc-Kanal zurück, damit der Besitzer sie geordnet verarbeiten kann.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::TransportError;
use super::media::LocalTrack;
use super::session::TrackKind;
use crate::config::IceServerConfig;
use crate::signaling::IceCandidate;

/// Schnappschuss der Verbindungsstatistik
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    /// RTT des nominierten Candidate-Paars
    pub round_trip_time_ms: Option<f64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// ICE-Zustand der Verbindung
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

impl IceConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

/// Ereignisse, die der Transport asynchron meldet
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Lokaler Candidate muss zur Gegenseite
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    /// Gegenseite sendet einen Track
    RemoteTrack(TrackKind),
}

/// Eine Peer-zu-Peer Medienverbindung
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Erzeugt ein Offer und setzt es als lokale Beschreibung
    async fn create_offer(&self) -> Result<String, TransportError>;

    /// Erzeugt ein Answer und setzt es als lokale Beschreibung
    async fn create_answer(&self) -> Result<String, TransportError>;

    async fn set_remote_description(&self, kind: SdpType, sdp: String)
        -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError>;

    /// Ersetzt einen Track ohne Neuverhandlung
    ///
    /// `Ok(false)` heißt: nicht unterstützt, Offer/Answer nötig.
    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError>;

    async fn remove_track(&self, kind: TrackKind) -> Result<(), TransportError>;

    async fn stats(&self) -> Result<TransportStats, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Erzeugt eine neue Verbindung pro Anruf
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
