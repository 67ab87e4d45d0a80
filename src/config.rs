//! Konfiguration der Call Engine
//!
//! Signaling-Endpoint und ICE-Server sind für die Engine opak und werden
//! nur an Signaling-Client bzw. Transport-Factory durchgereicht.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::call_engine::{AudioConditionerConfig, ConditionerError};

/// Standard Signaling URL (über `SIGNALING_URL` überschreibbar)
pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling.localhost";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid signaling endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid audio settings: {0}")]
    Audio(#[from] ConditionerError),
}

// ============================================================================
// CONFIG STRUCTS
// ============================================================================

/// Adresse des Rendezvous-Servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingConfig {
    pub endpoint: String,
    #[serde(default = "default_signaling_path")]
    pub path: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_SIGNALING_URL.to_string(),
            path: default_signaling_path(),
        }
    }
}

fn default_signaling_path() -> String {
    "/ws".to_string()
}

/// STUN/TURN Server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Standard STUN Server Konfiguration
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![IceServerConfig {
        urls: vec![
            "stun:stun.l.google.com:19302".to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ],
        ..Default::default()
    }]
}

/// Gesamtkonfiguration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling: SignalingConfig,
    pub ice_servers: Vec<IceServerConfig>,
    pub negotiation_timeout_ms: u64,
    pub ring_timeout_ms: u64,
    pub quality_interval_ms: u64,
    pub audio: AudioConditionerConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling: SignalingConfig::default(),
            ice_servers: default_ice_servers(),
            negotiation_timeout_ms: 15_000,
            ring_timeout_ms: 45_000,
            quality_interval_ms: 2_000,
            audio: AudioConditionerConfig::default(),
        }
    }
}

impl CallConfig {
    /// Liest die Konfiguration aus Umgebungsvariablen
    ///
    /// - `SIGNALING_URL`, `SIGNALING_PATH`
    /// - `ICE_SERVERS`: kommagetrennte STUN/TURN URLs
    /// - `NEGOTIATION_TIMEOUT_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(endpoint) = lookup("SIGNALING_URL") {
            config.signaling.endpoint = endpoint;
        }
        if let Some(path) = lookup("SIGNALING_PATH") {
            config.signaling.path = path;
        }
        if let Some(servers) = lookup("ICE_SERVERS") {
            let urls: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                config.ice_servers = vec![IceServerConfig {
                    urls,
                    ..Default::default()
                }];
            }
        }
        if let Some(value) = lookup("NEGOTIATION_TIMEOUT_MS") {
            config.negotiation_timeout_ms =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: "NEGOTIATION_TIMEOUT_MS",
                    value,
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Parst ein JSON-Dokument; fehlende Felder bekommen Standardwerte
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.signaling.endpoint)?;
        for (name, value) in [
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("ring_timeout_ms", self.ring_timeout_ms),
            ("quality_interval_ms", self.quality_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    name,
                    value: value.to_string(),
                });
            }
        }
        self.audio.validate()?;
        Ok(())
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_millis(self.ring_timeout_ms)
    }

    pub fn quality_interval(&self) -> Duration {
        Duration::from_millis(self.quality_interval_ms)
    }
}
