//! WebRTC Peer Transport
//!
//! `PeerTransport` auf Basis von webrtc-rs. Audio wird als PCMU (G.711 µ-law)
//! gesendet: ein Pump-Task liest die 48kHz Frames des lokalen Tracks,
//! dezimiert auf 8kHz und schreibt Samples in den RTP-Track.
//!
//! Hinweis: Opus wird später ergänzt, sobald die opus-sys Bindings im Build
//! verfügbar sind.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_PCMU, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::error::TransportError;
use super::media::{AudioFrame, LocalTrack};
use super::session::TrackKind;
use super::transport::{
    IceConnectionState, PeerTransport, PeerTransportFactory, SdpType, TransportEvent,
    TransportStats,
};
use crate::config::IceServerConfig;
use crate::signaling::IceCandidate;

/// PCMU Abtastrate
const PCMU_RATE: u32 = 8000;

const STREAM_ID: &str = "pulse-call";

fn webrtc_err(e: webrtc::Error) -> TransportError {
    TransportError::WebRTC(e.to_string())
}

// ============================================================================
// G.711 µ-LAW
// ============================================================================

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32635;

/// Kodiert ein 16-bit Sample nach G.711 µ-law
pub(crate) fn mulaw_encode(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0x00
    };
    pcm = pcm.min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent = 7;
    let mut mask = 0x4000;
    while exponent > 0 && pcm & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (pcm >> (exponent + 3)) & 0x0F;
    !(sign | (exponent << 4) as u8 | mantissa as u8)
}

/// 48kHz Float-Frame → 8kHz µ-law Payload
fn encode_pcmu(frame: &AudioFrame, enabled: bool) -> Bytes {
    let step = (frame.sample_rate / PCMU_RATE).max(1) as usize;
    frame
        .samples
        .chunks(step)
        .map(|chunk| {
            if !enabled {
                return mulaw_encode(0);
            }
            let avg = chunk.iter().sum::<f32>() / chunk.len() as f32;
            mulaw_encode((avg.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
        })
        .collect::<Vec<u8>>()
        .into()
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt `WebRtcTransport`s mit Standard-Codecs und Interceptors
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = WebRtcTransport::new(ice_servers, events).await?;
        Ok(Arc::new(transport))
    }
}

// ============================================================================
// TRANSPORT
// ============================================================================

struct Outgoing {
    sender: Arc<RTCRtpSender>,
    pump: Option<JoinHandle<()>>,
    rtcp: JoinHandle<()>,
}

impl Outgoing {
    fn abort(&self) {
        if let Some(pump) = &self.pump {
            pump.abort();
        }
        self.rtcp.abort();
    }
}

/// Eine webrtc-rs Peer Connection
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    outgoing: Mutex<HashMap<TrackKind, Outgoing>>,
    closed: AtomicBool,
}

impl WebRtcTransport {
    pub async fn new(
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<Self, TransportError> {
        // Media Engine mit Standard-Codecs
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(webrtc_err)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(webrtc_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(config).await.map_err(webrtc_err)?);
        Self::register_handlers(&pc, events);

        Ok(Self {
            pc,
            outgoing: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Leitet Callbacks der Peer Connection als `TransportEvent`s weiter
    fn register_handlers(pc: &Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<TransportEvent>) {
        // ICE Candidate Handler
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(init) => {
                        let _ = tx.send(TransportEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
                }
            }
            Box::pin(async {})
        }));

        // ICE State Handler
        let tx = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            tracing::info!("ICE connection state: {}", state);
            let mapped = match state {
                RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
                RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
                RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
                RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
                RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
                RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
                RTCIceConnectionState::New => Some(IceConnectionState::New),
                _ => None,
            };
            if let Some(mapped) = mapped {
                let _ = tx.send(TransportEvent::IceStateChanged(mapped));
            }
            Box::pin(async {})
        }));

        // Track Handler (eingehende Medien)
        // TODO: Wiedergabe anbinden, sobald ein Decoder-Backend steht
        let tx = events;
        pc.on_track(Box::new(move |track, _, _| {
            let kind = match track.kind() {
                RTPCodecType::Video => TrackKind::Video,
                _ => TrackKind::Audio,
            };
            tracing::info!("Received remote {:?} track", kind);
            let _ = tx.send(TransportEvent::RemoteTrack(kind));
            Box::pin(async {})
        }));
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    fn new_rtp_track(kind: TrackKind, id: &str) -> Arc<TrackLocalStaticSample> {
        let capability = match kind {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_PCMU.to_string(),
                clock_rate: PCMU_RATE,
                channels: 1,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        Arc::new(TrackLocalStaticSample::new(
            capability,
            id.to_string(),
            STREAM_ID.to_string(),
        ))
    }

    /// Schreibt die Frames eines lokalen Audio-Tracks in den RTP-Track
    fn spawn_pump(track: &LocalTrack, rtp: Arc<TrackLocalStaticSample>) -> Option<JoinHandle<()>> {
        let mut frames = track.subscribe_audio()?;
        let source = track.clone();

        Some(tokio::spawn(async move {
            loop {
                let frame = match frames.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let sample = Sample {
                    data: encode_pcmu(&frame, source.is_enabled()),
                    duration: frame.duration(),
                    ..Default::default()
                };
                if let Err(e) = rtp.write_sample(&sample).await {
                    tracing::debug!("Audio pump stopped: {}", e);
                    break;
                }
            }
        }))
    }

    /// RTCP Pakete müssen gelesen werden, damit die Interceptors arbeiten
    fn spawn_rtcp_reader(sender: Arc<RTCRtpSender>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        self.ensure_open()?;
        let answer = self.pc.create_answer(None).await.map_err(webrtc_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(webrtc_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_description(
        &self,
        kind: SdpType,
        sdp: String,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let description = match kind {
            SdpType::Offer => RTCSessionDescription::offer(sdp),
            SdpType::Answer => RTCSessionDescription::answer(sdp),
        }
        .map_err(|e| TransportError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(description)
            .await
            .map_err(webrtc_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(webrtc_err)
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<(), TransportError> {
        self.ensure_open()?;
        let rtp = Self::new_rtp_track(track.kind(), track.id());
        let sender = self
            .pc
            .add_track(Arc::clone(&rtp) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(webrtc_err)?;

        let outgoing = Outgoing {
            pump: Self::spawn_pump(track, rtp),
            rtcp: Self::spawn_rtcp_reader(Arc::clone(&sender)),
            sender,
        };
        if let Some(previous) = self.outgoing.lock().insert(track.kind(), outgoing) {
            previous.abort();
        }
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<bool, TransportError> {
        self.ensure_open()?;
        let sender = match self.outgoing.lock().get(&track.kind()) {
            Some(outgoing) => Arc::clone(&outgoing.sender),
            None => return Ok(false),
        };

        let rtp = Self::new_rtp_track(track.kind(), track.id());
        sender
            .replace_track(Some(Arc::clone(&rtp) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(webrtc_err)?;

        let pump = Self::spawn_pump(track, rtp);
        if let Some(outgoing) = self.outgoing.lock().get_mut(&track.kind()) {
            if let Some(old) = std::mem::replace(&mut outgoing.pump, pump) {
                old.abort();
            }
        }
        Ok(true)
    }

    async fn remove_track(&self, kind: TrackKind) -> Result<(), TransportError> {
        self.ensure_open()?;
        let Some(outgoing) = self.outgoing.lock().remove(&kind) else {
            return Ok(());
        };
        outgoing.abort();
        self.pc
            .remove_track(&outgoing.sender)
            .await
            .map_err(webrtc_err)
    }

    async fn stats(&self) -> Result<TransportStats, TransportError> {
        self.ensure_open()?;
        let report = self.pc.get_stats().await;

        let mut stats = TransportStats::default();
        for entry in report.reports.values() {
            if let StatsReportType::CandidatePair(pair) = entry {
                if !pair.nominated {
                    continue;
                }
                if pair.current_round_trip_time > 0.0 {
                    stats.round_trip_time_ms = Some(pair.current_round_trip_time * 1000.0);
                }
                stats.bytes_sent = pair.bytes_sent;
                stats.bytes_received = pair.bytes_received;
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for (_, outgoing) in self.outgoing.lock().drain() {
            outgoing.abort();
        }
        // Grace period für das BYE über RTCP
        tokio::time::timeout(Duration::from_secs(2), self.pc.close())
            .await
            .map_err(|_| TransportError::WebRTC("close timed out".into()))?
            .map_err(webrtc_err)
    }
}

impl std::fmt::Debug for WebRtcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebRtcTransport")
            .field("connection_state", &self.pc.connection_state())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
