//! AudioConditioner - Noise Gate für das ausgehende Mikrofonsignal
//!
//! Pipeline: High-Pass → Low-Pass → Gain Stage → Ausgang.
//! Ein separater Control-Task berechnet pro Tick den RMS-Pegel des letzten
//! Frames und verschiebt das Gain-Ziel mit Hysterese zwischen zwei
//! Schwellwerten. Das Gain fällt nie unter `GAIN_FLOOR`.

use biquad::{Biquad, Coefficients, DirectForm1, ToHertz, Type};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::media::{rms, AudioFrame, LocalTrack, SAMPLE_RATE};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Untergrenze des Gains, auch bei Stille
pub const GAIN_FLOOR: f32 = 0.05;

/// Minimales Gain-Ziel bei geöffnetem Gate
pub const GATE_OPEN_MIN: f32 = 0.3;

pub const GAIN_MAX: f32 = 1.0;

/// Multiplikativer Abfall des Ziels pro Tick unterhalb der Schließschwelle
pub const RELEASE_DECAY: f32 = 0.9;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConditionerError {
    #[error("Track carries no audio frames")]
    NoAudioSource,

    #[error("Invalid conditioner config: {0}")]
    InvalidConfig(String),

    #[error("No async runtime available")]
    NoRuntime,
}

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConditionerConfig {
    pub noise_gate_threshold_on: f32,
    /// Üblicherweise 0.1 × `noise_gate_threshold_on`
    pub noise_gate_threshold_off: f32,
    pub high_pass_hz: f32,
    pub low_pass_hz: f32,
    pub attack_seconds: f32,
    pub release_seconds: f32,
    pub control_interval_ms: u64,
}

impl Default for AudioConditionerConfig {
    fn default() -> Self {
        Self::with_threshold(0.02)
    }
}

impl AudioConditionerConfig {
    /// Standardwerte mit eigener Öffnungsschwelle, Schließschwelle = 10%
    pub fn with_threshold(threshold_on: f32) -> Self {
        Self {
            noise_gate_threshold_on: threshold_on,
            noise_gate_threshold_off: threshold_on * 0.1,
            high_pass_hz: 100.0,
            low_pass_hz: 6000.0,
            attack_seconds: 0.01,
            release_seconds: 0.2,
            control_interval_ms: 20,
        }
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<(), ConditionerError> {
        if !self.noise_gate_threshold_on.is_finite() || self.noise_gate_threshold_on <= 0.0 {
            return Err(ConditionerError::InvalidConfig(
                "noise_gate_threshold_on must be positive".into(),
            ));
        }
        if !self.noise_gate_threshold_off.is_finite()
            || self.noise_gate_threshold_off < 0.0
            || self.noise_gate_threshold_off >= self.noise_gate_threshold_on
        {
            return Err(ConditionerError::InvalidConfig(
                "noise_gate_threshold_off must be below noise_gate_threshold_on".into(),
            ));
        }
        if !self.high_pass_hz.is_finite()
            || !self.low_pass_hz.is_finite()
            || self.high_pass_hz <= 0.0
            || self.high_pass_hz >= self.low_pass_hz
        {
            return Err(ConditionerError::InvalidConfig(
                "high_pass_hz must be positive and below low_pass_hz".into(),
            ));
        }
        if !self.attack_seconds.is_finite()
            || !self.release_seconds.is_finite()
            || self.attack_seconds <= 0.0
            || self.release_seconds <= 0.0
        {
            return Err(ConditionerError::InvalidConfig(
                "attack and release must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// FILTERS
// ============================================================================

/// High-Pass gefolgt von Low-Pass, beide Butterworth
pub struct FilterChain {
    high_pass: DirectForm1<f32>,
    low_pass: DirectForm1<f32>,
    sample_rate: u32,
}

impl FilterChain {
    pub fn new(config: &AudioConditionerConfig, sample_rate: u32) -> Result<Self, ConditionerError> {
        let fs = sample_rate.max(1) as f32;
        // Grenzfrequenzen unterhalb Nyquist halten
        let max_cutoff = (fs * 0.45).max(1.0);

        let high_pass = Coefficients::<f32>::from_params(
            Type::HighPass,
            fs.hz(),
            config.high_pass_hz.clamp(1.0, max_cutoff).hz(),
            biquad::Q_BUTTERWORTH_F32,
        )
        .map_err(|e| ConditionerError::InvalidConfig(format!("high-pass: {:?}", e)))?;

        let low_pass = Coefficients::<f32>::from_params(
            Type::LowPass,
            fs.hz(),
            config.low_pass_hz.clamp(1.0, max_cutoff).hz(),
            biquad::Q_BUTTERWORTH_F32,
        )
        .map_err(|e| ConditionerError::InvalidConfig(format!("low-pass: {:?}", e)))?;

        Ok(Self {
            high_pass: DirectForm1::<f32>::new(high_pass),
            low_pass: DirectForm1::<f32>::new(low_pass),
            sample_rate,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn process(&mut self, samples: &mut [f32]) {
        for s in samples.iter_mut() {
            *s = self.low_pass.run(self.high_pass.run(*s));
        }
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}

// ============================================================================
// NOISE GATE
// ============================================================================

/// Hysterese-Steuerung des Gain-Ziels
#[derive(Debug, Clone)]
pub struct NoiseGate {
    threshold_on: f32,
    threshold_off: f32,
    target: f32,
}

impl NoiseGate {
    pub fn new(config: &AudioConditionerConfig) -> Self {
        Self {
            threshold_on: config.noise_gate_threshold_on,
            threshold_off: config.noise_gate_threshold_off,
            target: GAIN_MAX,
        }
    }

    /// Verarbeitet einen RMS-Wert und gibt das neue Gain-Ziel zurück
    ///
    /// Über der Öffnungsschwelle steigt das Ziel (nie abwärts), unter der
    /// Schließschwelle fällt es multiplikativ bis `GAIN_FLOOR`, dazwischen
    /// bleibt es stehen.
    pub fn update(&mut self, rms: f32) -> f32 {
        if rms > self.threshold_on {
            let excess = ((rms - self.threshold_on) / self.threshold_on).min(1.0);
            let open = GATE_OPEN_MIN + (GAIN_MAX - GATE_OPEN_MIN) * excess;
            self.target = self.target.max(open).min(GAIN_MAX);
        } else if rms < self.threshold_off {
            self.target = (self.target * RELEASE_DECAY).max(GAIN_FLOOR);
        }
        self.target
    }

    pub fn target(&self) -> f32 {
        self.target
    }
}

// ============================================================================
// GAIN STAGE
// ============================================================================

/// Gain mit asymmetrischer Glättung (schneller Attack, langsamer Release)
#[derive(Debug, Clone)]
pub struct GainStage {
    gain: f32,
    target: f32,
    attack_seconds: f32,
    release_seconds: f32,
}

impl GainStage {
    pub fn new(attack_seconds: f32, release_seconds: f32) -> Self {
        Self {
            gain: GAIN_MAX,
            target: GAIN_MAX,
            attack_seconds,
            release_seconds,
        }
    }

    pub fn set_target(&mut self, target: f32) {
        self.target = target.clamp(GAIN_FLOOR, GAIN_MAX);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    pub fn target(&self) -> f32 {
        self.target
    }

    fn coefficient(&self, dt: f32) -> f32 {
        let tau = if self.target > self.gain {
            self.attack_seconds
        } else {
            self.release_seconds
        };
        1.0 - (-dt / tau.max(f32::EPSILON)).exp()
    }

    /// Bewegt das Gain um `dt` Sekunden Richtung Ziel
    pub fn advance(&mut self, dt: f32) -> f32 {
        let coef = self.coefficient(dt);
        self.gain += (self.target - self.gain) * coef;
        self.gain = self.gain.clamp(GAIN_FLOOR, GAIN_MAX);
        self.gain
    }

    pub fn process(&mut self, samples: &mut [f32], sample_rate: u32) {
        let dt = 1.0 / sample_rate.max(1) as f32;
        for s in samples.iter_mut() {
            *s *= self.advance(dt);
        }
    }
}

// ============================================================================
// AUDIO CONDITIONER
// ============================================================================

struct Shared {
    alive: AtomicBool,
    muted: AtomicBool,
    /// f32 Bits des letzten RMS-Pegels (vor dem Gain)
    level: AtomicU32,
    gain: Mutex<GainStage>,
}

/// Laufende Noise-Gate-Pipeline für einen Anruf
pub struct AudioConditioner {
    output: LocalTrack,
    shared: Arc<Shared>,
    process_task: JoinHandle<()>,
    control_task: JoinHandle<()>,
}

impl AudioConditioner {
    /// Startet die Pipeline auf dem rohen Mikrofon-Track
    pub fn start(raw: &LocalTrack, config: AudioConditionerConfig) -> Result<Self, ConditionerError> {
        config.validate()?;
        let mut filters = FilterChain::new(&config, SAMPLE_RATE)?;
        let mut input = raw.subscribe_audio().ok_or(ConditionerError::NoAudioSource)?;
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| ConditionerError::NoRuntime)?;

        let output = LocalTrack::new_audio(format!("{}-conditioned", raw.id()));
        let out_tx = output
            .audio_sender()
            .ok_or(ConditionerError::NoAudioSource)?;

        let shared = Arc::new(Shared {
            alive: AtomicBool::new(true),
            muted: AtomicBool::new(!raw.is_enabled()),
            level: AtomicU32::new(0f32.to_bits()),
            gain: Mutex::new(GainStage::new(config.attack_seconds, config.release_seconds)),
        });

        // Processing
        let process_shared = Arc::clone(&shared);
        let filter_config = config.clone();
        let process_task = runtime.spawn(async move {
            loop {
                let mut frame: AudioFrame = match input.recv().await {
                    Ok(frame) => frame,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::debug!("Conditioner lagged by {} frames", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !process_shared.alive.load(Ordering::Acquire) {
                    break;
                }

                let sr = frame.sample_rate;
                if filters.sample_rate() != sr {
                    match FilterChain::new(&filter_config, sr) {
                        Ok(rebuilt) => filters = rebuilt,
                        Err(e) => tracing::warn!("Keeping filters at {} Hz: {}", filters.sample_rate(), e),
                    }
                }
                filters.process(&mut frame.samples);

                process_shared
                    .level
                    .store(rms(&frame.samples).to_bits(), Ordering::Release);

                if process_shared.muted.load(Ordering::Acquire) {
                    frame.samples.iter_mut().for_each(|s| *s = 0.0);
                } else {
                    process_shared.gain.lock().process(&mut frame.samples, sr);
                }

                let _ = out_tx.send(frame);
            }
            tracing::debug!("Conditioner processing task finished");
        });

        // Control loop
        let control_shared = Arc::clone(&shared);
        let interval = config.control_interval();
        let mut gate = NoiseGate::new(&config);
        let control_task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !control_shared.alive.load(Ordering::Acquire) {
                    break;
                }
                let level = f32::from_bits(control_shared.level.load(Ordering::Acquire));
                let target = gate.update(level);
                control_shared.gain.lock().set_target(target);
            }
        });

        tracing::info!("Audio conditioner started on track {}", raw.id());

        Ok(Self {
            output,
            shared,
            process_task,
            control_task,
        })
    }

    /// Startet den Conditioner; schlägt das fehl, wird der Roh-Track verwendet
    pub fn condition(raw: &LocalTrack, config: AudioConditionerConfig) -> (LocalTrack, Option<Self>) {
        match Self::start(raw, config) {
            Ok(conditioner) => (conditioner.output(), Some(conditioner)),
            Err(e) => {
                tracing::warn!("Audio conditioner unavailable, sending raw audio: {}", e);
                (raw.clone(), None)
            }
        }
    }

    /// Konditionierter Ausgangs-Track
    pub fn output(&self) -> LocalTrack {
        self.output.clone()
    }

    /// Harter Mute unabhängig vom Gate
    pub fn set_muted(&self, muted: bool) {
        self.shared.muted.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    pub fn gain(&self) -> f32 {
        self.shared.gain.lock().gain()
    }

    /// Letzter gemessener Pegel nach den Filtern
    pub fn level(&self) -> f32 {
        f32::from_bits(self.shared.level.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Stoppt beide Tasks; weitere Ticks fassen den Graphen nicht mehr an
    pub fn stop(&self) {
        if self.shared.alive.swap(false, Ordering::AcqRel) {
            self.control_task.abort();
            self.process_task.abort();
            tracing::info!("Audio conditioner stopped");
        }
    }
}

impl Drop for AudioConditioner {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for AudioConditioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioConditioner")
            .field("output", &self.output.id())
            .field("active", &self.is_active())
            .field("muted", &self.is_muted())
            .field("gain", &self.gain())
            .finish()
    }
}
