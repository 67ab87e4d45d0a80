//! WebSocket Client für den Signaling-Server
//!
//! Verwaltet die WebSocket-Verbindung zum Rendezvous-Server:
//! - Verbindungsaufbau mit Peer-ID als Query-Parameter
//! - Keepalive-Pings
//! - JSON-Serialisierung der `SignalingMessage`s
//! - Eingehende Nachrichten landen geordnet in der Engine-Queue

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::channel::{SignalingChannel, SignalingError};
use super::messages::SignalingMessage;
use crate::config::SignalingConfig;

/// Wie oft ein WebSocket-Ping gesendet wird
const PING_INTERVAL: Duration = Duration::from_secs(30);

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Verbindungs-Events des SignalingClient
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEvent {
    /// Verbunden mit Signaling-Server
    Connected,

    /// Verbindung getrennt
    Disconnected,
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// WebSocket Client für Signaling-Server Kommunikation
pub struct SignalingClient {
    server_url: Url,
    peer_id: String,
    state: Arc<RwLock<ClientState>>,
    tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<SignalingEvent>,
}

impl SignalingClient {
    /// Baut die WebSocket-URL aus Endpoint, Pfad und Peer-ID
    pub fn endpoint_url(config: &SignalingConfig, peer_id: &str) -> Result<Url, SignalingError> {
        let base = Url::parse(&config.endpoint)
            .map_err(|e| SignalingError::InvalidEndpoint(e.to_string()))?;
        let mut url = base
            .join(&config.path)
            .map_err(|e| SignalingError::InvalidEndpoint(e.to_string()))?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SignalingError::InvalidEndpoint(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| SignalingError::InvalidEndpoint(config.endpoint.clone()))?;
        url.query_pairs_mut().append_pair("peerId", peer_id);
        Ok(url)
    }

    /// Verbindet mit dem Signaling-Server
    ///
    /// Gibt den Client (ausgehende Seite) und die Queue der eingehenden
    /// Nachrichten zurück, die an die CallEngine übergeben wird.
    pub async fn connect(
        config: &SignalingConfig,
        peer_id: String,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError> {
        let server_url = Self::endpoint_url(config, &peer_id)?;

        tracing::info!("Connecting to signaling server: {}", server_url);

        let (ws_stream, _) = connect_async(server_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let (event_tx, _) = broadcast::channel(16);
        let state = Arc::new(RwLock::new(ClientState { is_connected: true }));

        let _ = event_tx.send(SignalingEvent::Connected);

        // Read-Task
        let state_clone = Arc::clone(&state);
        let event_tx_clone = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalingMessage>(&text) {
                            Ok(message) => {
                                if incoming_tx.send(message).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Failed to parse incoming signal: {} - {}", e, text);
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            state_clone.write().is_connected = false;
            let _ = event_tx_clone.send(SignalingEvent::Disconnected);
        });

        // Write-Task mit Keepalive
        let state_clone = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ping_interval = tokio::time::interval(PING_INTERVAL);
            ping_interval.tick().await;

            loop {
                tokio::select! {
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = write.send(Message::Text(msg)).await {
                            tracing::error!("Failed to send WebSocket message: {}", e);
                            break;
                        }
                    }
                    _ = ping_interval.tick() => {
                        if write.send(Message::Ping(Vec::new())).await.is_err() {
                            tracing::warn!("WebSocket ping failed, connection likely closed");
                            break;
                        }
                    }
                }
            }

            state_clone.write().is_connected = false;
        });

        Ok((
            Self {
                server_url,
                peer_id,
                state,
                tx,
                event_tx,
            },
            incoming_rx,
        ))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<SignalingEvent> {
        self.event_tx.subscribe()
    }

    /// Eigene Peer-ID
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;

        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url.as_str())
            .field("peer_id", &self.peer_id)
            .field("state", &*self.state.read())
            .finish()
    }
}
