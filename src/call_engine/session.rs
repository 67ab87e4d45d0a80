//! Call Session - Datenmodell eines Anrufversuchs
//!
//! Enthält die Typen, die der CallEngine exklusiv gehören:
//! Session, Rolle, Medienart, beobachtbarer Zustand und End-Gründe.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CallFailure;
use crate::signaling::SessionId;

// ============================================================================
// ROLE & MEDIA KIND
// ============================================================================

/// Rolle des lokalen Peers innerhalb einer Session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Receiver,
}

/// Art des Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

/// Art eines einzelnen Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Tracks, die für diese Anrufart aufgenommen werden
    pub fn track_kinds(self) -> &'static [TrackKind] {
        match self {
            MediaKind::Audio => &[TrackKind::Audio],
            MediaKind::Video => &[TrackKind::Audio, TrackKind::Video],
        }
    }
}

// ============================================================================
// CALL STATE
// ============================================================================

/// Richtung eines klingelnden Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RingDirection {
    Outgoing,
    Incoming,
}

/// Warum ein Anruf beendet wurde
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EndReason {
    /// Lokal aufgelegt oder abgebrochen
    LocalHangup,
    /// Gegenseite hat aufgelegt
    RemoteHangup { reason: Option<String> },
    /// Eingehender Anruf lokal abgelehnt
    Rejected { reason: Option<String> },
    /// Gegenseite hat abgelehnt
    RemoteRejected { reason: Option<String> },
    /// Niemand hat rechtzeitig abgenommen
    RingTimeout,
    /// Fataler Fehler während des Aufbaus oder des Gesprächs
    Failed { failure: CallFailure },
}

/// Aktueller Status des Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    /// Kein aktiver Anruf
    Idle,
    /// Anruf klingelt (ausgehend oder eingehend)
    Ringing { direction: RingDirection },
    /// SDP/ICE Aushandlung läuft
    Connecting,
    /// Anruf aktiv
    InCall,
    /// Anruf beendet (terminal für die Session)
    Ended { reason: EndReason },
}

impl CallState {
    /// Terminal oder noch nicht begonnen
    pub fn is_settled(&self) -> bool {
        matches!(self, CallState::Idle | CallState::Ended { .. })
    }
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Ein Anrufversuch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSession {
    pub session_id: SessionId,
    pub local_peer_id: String,
    pub remote_peer_id: String,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub state: CallState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Neue ausgehende Session mit frischer ID
    pub fn outgoing(local_peer_id: String, remote_peer_id: String, media_kind: MediaKind) -> Self {
        Self {
            session_id: SessionId::generate(),
            local_peer_id,
            remote_peer_id,
            role: CallRole::Caller,
            media_kind,
            state: CallState::Idle,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Session für einen eingehenden Invite
    pub fn incoming(
        session_id: SessionId,
        local_peer_id: String,
        remote_peer_id: String,
        media_kind: MediaKind,
    ) -> Self {
        Self {
            session_id,
            local_peer_id,
            remote_peer_id,
            role: CallRole::Receiver,
            media_kind,
            state: CallState::Ringing {
                direction: RingDirection::Incoming,
            },
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

// ============================================================================
// MEDIA TRACK STATE
// ============================================================================

/// Zustand eines lokalen oder entfernten Tracks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrackState {
    pub kind: TrackKind,
    pub enabled: bool,
    pub attached_at: DateTime<Utc>,
}

impl MediaTrackState {
    pub fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            enabled: true,
            attached_at: Utc::now(),
        }
    }
}

/// Mute/Kamera-Flags für die UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaFlags {
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub remote_audio: bool,
    pub remote_video: bool,
}

// ============================================================================
// CALL SUMMARY
// ============================================================================

/// Zusammenfassung nach Anrufende, Grundlage für eine spätere Bewertung
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: SessionId,
    pub partner_id: String,
    pub role: CallRole,
    pub media_kind: MediaKind,
    pub duration_seconds: u64,
    pub was_connected: bool,
    pub reason: EndReason,
    pub ended_at: DateTime<Utc>,
}
