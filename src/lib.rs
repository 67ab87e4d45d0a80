//! Pulse Call - P2P Anrufsteuerung
//!
//! Kern einer serverlosen P2P Voice/Video-Call-Applikation mit:
//! - Signaling über einen WebSocket Rendezvous-Server
//! - WebRTC für P2P Medien
//! - Noise Gate für das Mikrofon
//! - SQLite für das Anrufprotokoll
//!
//! Einstieg ist [`CallEngine::spawn`], das einen [`CallHandle`] liefert.

pub mod call_engine;
pub mod config;
pub mod database;
pub mod signaling;

pub use call_engine::{
    CallEngine, CallEngineDeps, CallError, CallEvent, CallHandle, CallSnapshot, CallState,
    CpalCaptureProvider, MediaKind, WebRtcTransportFactory,
};
pub use config::CallConfig;
pub use database::{CallLog, CallRating};
pub use signaling::{SignalingClient, SignalingMessage};

use tracing_subscriber::EnvFilter;

/// Filter ohne gesetztes `RUST_LOG`
const DEFAULT_LOG_FILTER: &str = "pulse_call=debug,webrtc=warn";

/// Installiert den globalen tracing Subscriber
///
/// Ist `RUST_LOG` gesetzt, gilt ausschließlich dessen Filter; sonst
/// `DEFAULT_LOG_FILTER`. Mehrfacher Aufruf ist harmlos.
pub fn init_tracing() {
    let filter = log_filter(std::env::var("RUST_LOG").ok().as_deref());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn log_filter(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER))
}
