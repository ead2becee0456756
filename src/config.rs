//! Call configuration
//!
//! Defaults, optionally overlaid by a JSON file and then by environment
//! variables:
//! - `UDP_CALL_SAMPLE_RATE`
//! - `UDP_CALL_BUFFER_SIZE`
//! - `UDP_CALL_MODE`
//! - `UDP_CALL_WIRE_FORMAT`
//! - `UDP_CALL_IDLE_TIMEOUT` (seconds, `0` disables)

use crate::call_engine::{AudioParams, CaptureEffects, WireFormat, CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::call_engine::wire::MAX_DATAGRAM_SIZE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Frame size used when nothing else is configured
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

const MIN_SAMPLE_RATE: u32 = 8_000;
const MAX_SAMPLE_RATE: u32 = 192_000;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid buffer size {0}: must be even, non-zero and fit in one datagram")]
    InvalidBufferSize(usize),

    #[error("Invalid sample rate {0} Hz")]
    InvalidSampleRate(u32),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

// ============================================================================
// CALL MODE
// ============================================================================

/// Which directions of audio a session carries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    /// Microphone out, speaker in
    #[default]
    Duplex,
    /// Microphone out; received audio is discarded
    CaptureOnly,
    /// Speaker in; nothing is captured or streamed
    ListenOnly,
}

impl CallMode {
    pub fn captures(self) -> bool {
        matches!(self, CallMode::Duplex | CallMode::CaptureOnly)
    }

    pub fn plays_back(self) -> bool {
        matches!(self, CallMode::Duplex | CallMode::ListenOnly)
    }
}

impl fmt::Display for CallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallMode::Duplex => "duplex",
            CallMode::CaptureOnly => "capture_only",
            CallMode::ListenOnly => "listen_only",
        })
    }
}

impl FromStr for CallMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "duplex" => Ok(CallMode::Duplex),
            "capture_only" => Ok(CallMode::CaptureOnly),
            "listen_only" => Ok(CallMode::ListenOnly),
            other => Err(format!("unknown call mode '{other}'")),
        }
    }
}

// ============================================================================
// CALL CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub sample_rate: u32,
    /// Bytes per captured frame and largest accepted audio payload
    pub buffer_size: usize,
    pub mode: CallMode,
    pub wire_format: WireFormat,
    /// End the call after this long without any inbound datagram
    pub idle_timeout_secs: Option<u64>,
    pub effects: CaptureEffects,
    pub input_device: Option<String>,
    pub output_device: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            mode: CallMode::default(),
            wire_format: WireFormat::default(),
            idle_timeout_secs: None,
            effects: CaptureEffects::default(),
            input_device: None,
            output_device: None,
        }
    }
}

impl CallConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_buffer_size(self.buffer_size, self.wire_format)?;

        if !(MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidSampleRate(self.sample_rate));
        }

        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn capture_params(&self) -> AudioParams {
        AudioParams {
            sample_rate: self.sample_rate,
            channels: CHANNELS,
            buffer_size: self.buffer_size,
            device: self.input_device.clone(),
        }
    }

    pub fn playback_params(&self) -> AudioParams {
        AudioParams {
            sample_rate: self.sample_rate,
            channels: CHANNELS,
            buffer_size: self.buffer_size,
            device: self.output_device.clone(),
        }
    }

    /// Platform config location, e.g. `~/.config/udp-call/config.json`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "udpcalling", "udp-call")
            .map(|dirs| dirs.config_dir().join("config.json"))
    }

    /// Reads a JSON config file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Defaults, then the config file, then the environment.
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => {
                    tracing::debug!("Loading config from {}", default.display());
                    Self::load(&default)?
                }
                None => Self::default(),
            },
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `UDP_CALL_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("UDP_CALL_SAMPLE_RATE") {
            self.sample_rate = parse_value("UDP_CALL_SAMPLE_RATE", &value)?;
        }
        if let Some(value) = lookup("UDP_CALL_BUFFER_SIZE") {
            self.buffer_size = parse_value("UDP_CALL_BUFFER_SIZE", &value)?;
        }
        if let Some(value) = lookup("UDP_CALL_MODE") {
            self.mode = parse_value("UDP_CALL_MODE", &value)?;
        }
        if let Some(value) = lookup("UDP_CALL_WIRE_FORMAT") {
            self.wire_format = parse_value("UDP_CALL_WIRE_FORMAT", &value)?;
        }
        if let Some(value) = lookup("UDP_CALL_IDLE_TIMEOUT") {
            let secs: u64 = parse_value("UDP_CALL_IDLE_TIMEOUT", &value)?;
            self.idle_timeout_secs = (secs > 0).then_some(secs);
        }
        Ok(())
    }
}

/// Buffer sizes hold whole PCM16 samples and fit in one datagram
pub fn validate_buffer_size(bytes: usize, format: WireFormat) -> Result<(), ConfigError> {
    let fits = format.datagram_capacity(bytes) <= MAX_DATAGRAM_SIZE;
    if bytes == 0 || bytes % 2 != 0 || !fits {
        return Err(ConfigError::InvalidBufferSize(bytes));
    }
    Ok(())
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CallConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.idle_timeout(), None);
    }

    #[test]
    fn test_buffer_size_validation() {
        assert!(validate_buffer_size(4096, WireFormat::Sentinel).is_ok());
        assert!(validate_buffer_size(0, WireFormat::Sentinel).is_err());
        assert!(validate_buffer_size(4095, WireFormat::Sentinel).is_err());
        assert!(validate_buffer_size(65_506, WireFormat::Sentinel).is_ok());
        assert!(validate_buffer_size(65_506, WireFormat::Tagged).is_ok());
        assert!(validate_buffer_size(65_508, WireFormat::Sentinel).is_err());
    }

    #[test]
    fn test_sample_rate_validation() {
        let config = CallConfig {
            sample_rate: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSampleRate(100))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("UDP_CALL_BUFFER_SIZE", "2048"),
            ("UDP_CALL_MODE", "listen-only"),
            ("UDP_CALL_WIRE_FORMAT", "tagged"),
            ("UDP_CALL_IDLE_TIMEOUT", "15"),
        ]
        .into_iter()
        .collect();

        let mut config = CallConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.buffer_size, 2048);
        assert_eq!(config.mode, CallMode::ListenOnly);
        assert_eq!(config.wire_format, WireFormat::Tagged);
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = CallConfig::default();
        let err = config
            .apply_overrides(|key| (key == "UDP_CALL_BUFFER_SIZE").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "buffer_size": 1024, "mode": "capture_only", "effects": {{ "noise_suppression": true }} }}"#
        )
        .unwrap();

        let config = CallConfig::load(file.path()).unwrap();
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.mode, CallMode::CaptureOnly);
        assert!(config.effects.noise_suppression);
        assert!(!config.effects.gain_control);
        assert_eq!(config.sample_rate, DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_load_missing_file() {
        let err = CallConfig::load(Path::new("/nonexistent/udp-call.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_mode_directions() {
        assert!(CallMode::Duplex.captures() && CallMode::Duplex.plays_back());
        assert!(CallMode::CaptureOnly.captures() && !CallMode::CaptureOnly.plays_back());
        assert!(!CallMode::ListenOnly.captures() && CallMode::ListenOnly.plays_back());
        assert_eq!("capture_only".parse::<CallMode>(), Ok(CallMode::CaptureOnly));
    }
}
