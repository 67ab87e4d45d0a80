//! Lokale Medien - Capture-Abstraktion und cpal-Implementierung
//!
//! `MediaCaptureProvider` liefert einen `LocalStream` mit Tracks. Audio-Tracks
//! tragen einen Broadcast-Kanal mit 20ms PCM-Frames (48kHz mono), den
//! AudioConditioner und Transport abonnieren.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapRb,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use uuid::Uuid;

use super::error::MediaAcquisitionError;
use super::session::{MediaKind, TrackKind};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Kapazität des Frame-Broadcasts pro Track
const FRAME_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// AUDIO FRAME
// ============================================================================

/// Ein Block Mono-PCM Samples im Bereich [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Root-Mean-Square Pegel des Frames
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

pub(crate) fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

// ============================================================================
// LOCAL TRACK & STREAM
// ============================================================================

/// Handle auf einen lokalen Track
///
/// Klone teilen sich das `enabled` Flag und den Frame-Kanal.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    kind: TrackKind,
    enabled: Arc<AtomicBool>,
    audio: Option<broadcast::Sender<AudioFrame>>,
}

impl LocalTrack {
    /// Audio-Track mit eigenem Frame-Kanal
    pub fn new_audio(id: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(FRAME_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
            enabled: Arc::new(AtomicBool::new(true)),
            audio: Some(tx),
        }
    }

    /// Video-Track; die Frames liefert die Plattform direkt an den Transport
    pub fn new_video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
            enabled: Arc::new(AtomicBool::new(true)),
            audio: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Sender zum Einspeisen von Frames (nur Audio)
    pub fn audio_sender(&self) -> Option<broadcast::Sender<AudioFrame>> {
        self.audio.clone()
    }

    /// Abonniert die Frames dieses Tracks (nur Audio)
    pub fn subscribe_audio(&self) -> Option<broadcast::Receiver<AudioFrame>> {
        self.audio.as_ref().map(|tx| tx.subscribe())
    }
}

/// Aufgenommene lokale Medien eines Anrufs
#[derive(Debug, Clone)]
pub struct LocalStream {
    pub id: String,
    pub tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }
}

// ============================================================================
// CAPTURE PROVIDER
// ============================================================================

/// Zugriff auf Mikrofon/Kamera der Plattform
///
/// `release` muss die Geräte tatsächlich freigeben, bevor es zurückkehrt.
#[async_trait]
pub trait MediaCaptureProvider: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError>;

    async fn release(&self, stream: LocalStream);
}

// ============================================================================
// CPAL PROVIDER
// ============================================================================

struct CaptureThread {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

/// Mikrofon-Capture über cpal
///
/// Jeder Stream läuft auf einem eigenen Thread, da `cpal::Stream` nicht
/// `Send` ist. Kamera-Capture wird von diesem Backend nicht unterstützt.
pub struct CpalCaptureProvider {
    device_name: Option<String>,
    captures: Mutex<HashMap<String, CaptureThread>>,
}

impl CpalCaptureProvider {
    /// `device_name = None` verwendet das Standard-Eingabegerät
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            captures: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for CpalCaptureProvider {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl MediaCaptureProvider for CpalCaptureProvider {
    async fn acquire(&self, kind: MediaKind) -> Result<LocalStream, MediaAcquisitionError> {
        if kind == MediaKind::Video {
            return Err(MediaAcquisitionError::DeviceUnavailable(
                "video capture is not supported by the cpal backend".to_string(),
            ));
        }

        let track = LocalTrack::new_audio(format!("mic-{}", Uuid::new_v4()));
        let frames = track
            .audio_sender()
            .ok_or_else(|| MediaAcquisitionError::DeviceUnavailable("no frame channel".into()))?;
        let stream = LocalStream::new(vec![track]);

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel();
        let device_name = self.device_name.clone();
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture(device_name, stop_flag, frames, ready_tx))
            .map_err(|e| MediaAcquisitionError::DeviceUnavailable(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => {
                self.captures
                    .lock()
                    .insert(stream.id.clone(), CaptureThread { stop, handle });
                tracing::info!("Microphone acquired for stream {}", stream.id);
                Ok(stream)
            }
            Ok(Err(e)) => {
                let _ = tokio::task::spawn_blocking(move || handle.join()).await;
                Err(e)
            }
            Err(_) => Err(MediaAcquisitionError::DeviceUnavailable(
                "capture thread exited".to_string(),
            )),
        }
    }

    async fn release(&self, stream: LocalStream) {
        let Some(capture) = self.captures.lock().remove(&stream.id) else {
            return;
        };

        capture.stop.store(true, Ordering::Relaxed);
        if tokio::task::spawn_blocking(move || capture.handle.join())
            .await
            .is_err()
        {
            tracing::warn!("Capture thread for stream {} did not join cleanly", stream.id);
        }
        tracing::info!("Microphone released for stream {}", stream.id);
    }
}

fn map_capture_error(message: String) -> MediaAcquisitionError {
    if message.to_lowercase().contains("permission") {
        MediaAcquisitionError::PermissionDenied
    } else {
        MediaAcquisitionError::DeviceUnavailable(message)
    }
}

fn run_capture(
    device_name: Option<String>,
    stop: Arc<AtomicBool>,
    frames: broadcast::Sender<AudioFrame>,
    ready: oneshot::Sender<Result<(), MediaAcquisitionError>>,
) {
    let host = cpal::default_host();
    let device = match device_name {
        Some(ref name) => host
            .input_devices()
            .ok()
            .and_then(|mut devices| devices.find(|d| d.name().ok().as_deref() == Some(name)))
            .or_else(|| {
                tracing::warn!("Input device '{}' not found, falling back to default", name);
                host.default_input_device()
            }),
        None => host.default_input_device(),
    };
    let Some(device) = device else {
        let _ = ready.send(Err(MediaAcquisitionError::DeviceUnavailable(
            "no audio input device found".to_string(),
        )));
        return;
    };

    let config = match find_best_input_config(&device) {
        Ok(config) => config,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    let device_rate = config.sample_rate.0;
    let device_channels = config.channels as usize;
    tracing::info!(
        "Starting audio capture: {} Hz, {} channels (target: {} Hz mono)",
        device_rate,
        device_channels,
        SAMPLE_RATE
    );

    // ~200ms Puffer bei Geräterate
    let ring = HeapRb::<f32>::new((device_rate as usize / 5) * device_channels);
    let (mut producer, mut consumer) = ring.split();

    let stream = match device.build_input_stream(
        &config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let _ = producer.push_slice(data);
        },
        |err| tracing::error!("Audio capture error: {}", err),
        None,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready.send(Err(map_capture_error(e.to_string())));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(map_capture_error(e.to_string())));
        return;
    }

    if ready.send(Ok(())).is_err() {
        // Acquire wurde abgebrochen
        return;
    }

    // 20ms bei Geräterate, interleaved
    let device_frame_samples = (device_rate as usize / 50) * device_channels;
    let mut device_buf = vec![0.0f32; device_frame_samples];

    while !stop.load(Ordering::Relaxed) {
        if consumer.occupied_len() < device_frame_samples {
            std::thread::sleep(Duration::from_millis(5));
            continue;
        }
        consumer.pop_slice(&mut device_buf);

        let mono = downmix(&device_buf, device_channels);
        let samples = resample_linear(&mono, device_rate, SAMPLE_RATE, FRAME_SIZE);

        // Keine Abonnenten ist kein Fehler
        let _ = frames.send(AudioFrame::new(samples, SAMPLE_RATE));
    }

    drop(stream);
    tracing::debug!("Audio capture thread stopped");
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Einfaches Linear-Resampling auf genau `out_len` Samples
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32, out_len: usize) -> Vec<f32> {
    if from_rate == to_rate {
        let mut out = input.to_vec();
        out.resize(out_len, 0.0);
        return out;
    }
    let ratio = to_rate as f64 / from_rate as f64;
    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let idx = src_pos as usize;
            let frac = (src_pos - idx as f64) as f32;
            let s0 = input.get(idx).copied().unwrap_or(0.0);
            let s1 = input.get(idx + 1).copied().unwrap_or(s0);
            s0 + (s1 - s0) * frac
        })
        .collect()
}

/// Findet die beste Input-Konfiguration
fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaAcquisitionError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| map_capture_error(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priorität: 48kHz > andere, F32 > andere
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaAcquisitionError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    if let Some(config) = configs
        .iter()
        .find(|c| c.sample_format() == SampleFormat::F32)
    {
        return Ok(config.with_max_sample_rate().into());
    }

    Err(MediaAcquisitionError::DeviceUnavailable(
        "no f32 input configuration available".to_string(),
    ))
}
