//! Fehlertypen der Call Engine
//!
//! Komponentenfehler (Capture, Transport, Signaling) werden per `#[from]`
//! in `CallError` überführt. `CallFailure` ist die serialisierbare Form,
//! die ein beendeter Anruf als Grund an die UI meldet.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::signaling::SignalingError;

// ============================================================================
// COMPONENT ERRORS
// ============================================================================

/// Mikrofon/Kamera konnten nicht geöffnet werden
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("Permission to capture media was denied")]
    PermissionDenied,

    #[error("Capture device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Fehler der zugrundeliegenden Peer-Verbindung
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("Transport is closed")]
    Closed,
}

// ============================================================================
// CALL ERROR
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(#[from] MediaAcquisitionError),

    #[error("Negotiation timed out")]
    NegotiationTimeout,

    #[error("No viable ICE candidate pair")]
    ConnectivityFailure,

    #[error("Signaling delivery failed: {0}")]
    SignalingDelivery(#[from] SignalingError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No active call")]
    NoActiveCall,

    #[error("Already in a call")]
    AlreadyInCall,

    #[error("Call was cancelled")]
    Cancelled,

    #[error("Call engine stopped")]
    EngineStopped,
}

impl CallError {
    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        CallError::InvalidState(msg.into())
    }

    /// Strukturierter Grund für `EndReason::Failed`
    pub fn failure(&self) -> CallFailure {
        match self {
            CallError::NegotiationTimeout => CallFailure::NegotiationTimeout,
            CallError::ConnectivityFailure => CallFailure::ConnectivityFailure,
            CallError::SignalingDelivery(e) => CallFailure::SignalingDelivery {
                message: e.to_string(),
            },
            CallError::MediaAcquisition(e) => CallFailure::MediaAcquisition {
                message: e.to_string(),
            },
            other => CallFailure::InvalidState {
                message: other.to_string(),
            },
        }
    }
}

/// Fataler Fehler, der einen Anruf beendet hat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallFailure {
    NegotiationTimeout,
    ConnectivityFailure,
    SignalingDelivery { message: String },
    MediaAcquisition { message: String },
    InvalidState { message: String },
}
