//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht trägt `sessionId`, `fromPeerId` und `toPeerId`; der
//! Nutzinhalt hängt vom `type` ab. JSON-Feldnamen sind camelCase, damit
//! der Rendezvous-Server sie unverändert weiterleiten kann.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::call_engine::MediaKind;

// ============================================================================
// SESSION ID
// ============================================================================

/// Eindeutige ID eines Anrufversuchs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Erzeugt eine neue zufällige Session-ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ============================================================================
// ICE CANDIDATE
// ============================================================================

/// Ein entdeckter Netzwerkpfad zur Gegenseite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

// ============================================================================
// SIGNALING MESSAGE
// ============================================================================

/// Nutzinhalt einer Signaling-Nachricht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalingPayload {
    /// Caller → Receiver
    CallInvite { media_kind: MediaKind },

    /// Receiver → Caller
    CallAccept,

    /// Receiver → Caller
    CallReject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Caller → Receiver
    SdpOffer { sdp: String },

    /// Receiver → Caller
    SdpAnswer { sdp: String },

    /// Beide Richtungen
    IceCandidate { candidate: IceCandidate },

    /// Beide Richtungen
    CallEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SignalingPayload {
    /// Name für Logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingPayload::CallInvite { .. } => "call_invite",
            SignalingPayload::CallAccept => "call_accept",
            SignalingPayload::CallReject { .. } => "call_reject",
            SignalingPayload::SdpOffer { .. } => "sdp_offer",
            SignalingPayload::SdpAnswer { .. } => "sdp_answer",
            SignalingPayload::IceCandidate { .. } => "ice_candidate",
            SignalingPayload::CallEnd { .. } => "call_end",
        }
    }
}

/// Eine Nachricht zwischen genau zwei Peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    pub session_id: SessionId,
    pub from_peer_id: String,
    pub to_peer_id: String,
    #[serde(flatten)]
    pub payload: SignalingPayload,
}

impl SignalingMessage {
    pub fn new(
        session_id: SessionId,
        from_peer_id: impl Into<String>,
        to_peer_id: impl Into<String>,
        payload: SignalingPayload,
    ) -> Self {
        Self {
            session_id,
            from_peer_id: from_peer_id.into(),
            to_peer_id: to_peer_id.into(),
            payload,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
