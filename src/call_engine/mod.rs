//! Call Engine Module - Anrufsteuerung und Medien
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines Anrufs (`CallEngine`)
//! - WebRTC Peer Connections
//! - Audio Capture (Mikrofon) und Noise Gate
//! - Verbindungsqualität

mod conditioner;
mod engine;
mod error;
mod media;
mod peer;
mod quality;
mod rtc_transport;
mod session;
mod transport;

pub use conditioner::{
    AudioConditioner, AudioConditionerConfig, ConditionerError, FilterChain, GainStage, NoiseGate,
};
pub use engine::{
    CallEngine, CallEngineDeps, CallEvent, CallHandle, CallSnapshot, BUSY_REASON, TIMEOUT_REASON,
};
pub use error::{CallError, CallFailure, MediaAcquisitionError, TransportError};
pub use media::{
    AudioFrame, CpalCaptureProvider, LocalStream, LocalTrack, MediaCaptureProvider, FRAME_SIZE,
    SAMPLE_RATE,
};
pub use peer::{PeerConnectionManager, StatsHandle, TrackAttachment};
pub use quality::{
    bars_for_rtt, label_for_bars, NetworkQualityMonitor, QualitySample, StatsSource,
    DEFAULT_SAMPLE_INTERVAL, OPTIMISTIC_BARS,
};
pub use rtc_transport::{WebRtcTransport, WebRtcTransportFactory};
pub use session::{
    CallRole, CallSession, CallState, CallSummary, EndReason, MediaFlags, MediaKind,
    MediaTrackState, RingDirection, TrackKind,
};
pub use transport::{
    IceConnectionState, PeerTransport, PeerTransportFactory, SdpType, TransportEvent,
    TransportStats,
};
