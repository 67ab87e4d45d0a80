//! Network Quality Monitor
//!
//! Übersetzt die Round-Trip-Time der Peer-Verbindung in 0–5 Balken.
//! Läuft als eigener Task mit festem Intervall und endet automatisch,
//! sobald die Verbindung geschlossen ist.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::error::TransportError;
use super::transport::TransportStats;

/// Standard Abtastintervall
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// Kürzestes Abtastintervall; `tokio::time::interval` verlangt > 0
pub const MIN_SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// Balken bei bestehender Verbindung, aber noch ohne Messung
pub const OPTIMISTIC_BARS: u8 = 4;

/// RTT in Millisekunden → Balken
pub fn bars_for_rtt(rtt_ms: f64) -> u8 {
    match rtt_ms {
        r if r < 50.0 => 5,
        r if r < 150.0 => 4,
        r if r < 300.0 => 3,
        r if r < 500.0 => 2,
        _ => 1,
    }
}

pub fn label_for_bars(bars: u8) -> &'static str {
    match bars {
        5 => "Excellent",
        4 => "Good",
        3 => "Fair",
        2 => "Poor",
        1 => "Bad",
        _ => "Disconnected",
    }
}

/// Ein Messwert für die Anzeige
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualitySample {
    pub round_trip_time_ms: Option<f64>,
    pub bars: u8,
    pub label: String,
}

impl QualitySample {
    fn with_bars(round_trip_time_ms: Option<f64>, bars: u8) -> Self {
        Self {
            round_trip_time_ms,
            bars,
            label: label_for_bars(bars).to_string(),
        }
    }

    pub fn disconnected() -> Self {
        Self::with_bars(None, 0)
    }

    pub fn connected_default() -> Self {
        Self::with_bars(None, OPTIMISTIC_BARS)
    }

    pub fn from_rtt(rtt_ms: f64) -> Self {
        Self::with_bars(Some(rtt_ms), bars_for_rtt(rtt_ms))
    }
}

impl Default for QualitySample {
    fn default() -> Self {
        Self::disconnected()
    }
}

/// Quelle für Transport-Statistiken
#[async_trait]
pub trait StatsSource: Send + Sync {
    async fn stats(&self) -> Result<TransportStats, TransportError>;

    fn is_closed(&self) -> bool;
}

/// Periodische Qualitätsmessung
pub struct NetworkQualityMonitor {
    rx: watch::Receiver<QualitySample>,
    task: JoinHandle<()>,
}

impl NetworkQualityMonitor {
    pub fn spawn<S>(source: S, interval: Duration) -> Self
    where
        S: StatsSource + 'static,
    {
        let (tx, rx) = watch::channel(QualitySample::connected_default());

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(MIN_SAMPLE_INTERVAL));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if source.is_closed() {
                    tx.send_replace(QualitySample::disconnected());
                    break;
                }

                match source.stats().await {
                    Ok(TransportStats {
                        round_trip_time_ms: Some(rtt),
                        ..
                    }) => {
                        tx.send_replace(QualitySample::from_rtt(rtt));
                    }
                    Ok(_) => {
                        // Kein RTT im Report: letzten Wert behalten
                    }
                    Err(TransportError::Closed) => {
                        tx.send_replace(QualitySample::disconnected());
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("Stats sample failed: {}", e);
                    }
                }

                if tx.is_closed() {
                    break;
                }
            }
            tracing::debug!("Network quality monitor stopped");
        });

        Self { rx, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<QualitySample> {
        self.rx.clone()
    }

    pub fn latest(&self) -> QualitySample {
        self.rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for NetworkQualityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
