//! Signaling-Kanal Abstraktion
//!
//! Die CallEngine sendet über `SignalingChannel` und liest eingehende
//! Nachrichten aus einer geordneten Queue (`mpsc::UnboundedReceiver`).
//! Zustellung ist at-most-once: fehlgeschlagene Sends werden gemeldet,
//! aber nie wiederholt.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use super::messages::SignalingMessage;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),
}

// ============================================================================
// CHANNEL TRAIT
// ============================================================================

/// Ausgehende Seite eines Signaling-Transports
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError>;
}

// ============================================================================
// IN-MEMORY CHANNEL
// ============================================================================

/// Direkte Verbindung zweier Engines im selben Prozess
#[derive(Debug, Clone)]
pub struct MemorySignaling {
    remote: mpsc::UnboundedSender<SignalingMessage>,
}

impl MemorySignaling {
    /// Kanal, dessen Nachrichten in `remote` landen
    pub fn new(remote: mpsc::UnboundedSender<SignalingMessage>) -> Self {
        Self { remote }
    }
}

#[async_trait]
impl SignalingChannel for MemorySignaling {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.remote
            .send(message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

/// Ein Ende eines verbundenen Paares: Sender zur Gegenseite und eigene Queue
pub type MemoryEndpoint = (MemorySignaling, mpsc::UnboundedReceiver<SignalingMessage>);

/// Zwei über Kreuz verbundene Kanäle
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        (MemorySignaling::new(b_tx), a_rx),
        (MemorySignaling::new(a_tx), b_rx),
    )
}
