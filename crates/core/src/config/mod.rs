use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{MissingChannelPolicy, Result, TapScopeError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tap: TapConfig,
    pub analyzer: AnalyzerConfig,
}

impl AppConfig {
    /// Parses a JSON document; missing fields fall back to their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tap.delivery_capacity == 0 {
            return Err(TapScopeError::msg("tap.delivery_capacity must be at least 1"));
        }
        if self.analyzer.fft_size < 2 {
            return Err(TapScopeError::msg("analyzer.fft_size must be at least 2"));
        }
        Ok(())
    }
}

/// Configuration of the tap and its delivery path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TapConfig {
    /// Number of spectrum frames that may wait for the consumer before new
    /// frames are dropped.
    pub delivery_capacity: usize,
    pub missing_channel: MissingChannelPolicy,
}

impl Default for TapConfig {
    fn default() -> Self {
        Self {
            delivery_capacity: 8,
            missing_channel: MissingChannelPolicy::ZeroFill,
        }
    }
}

/// Configuration of the FFT spectrum analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub fft_size: usize,
    /// Mix all channels down to one spectrum.
    pub mono: bool,
    /// Number of logarithmic bands; `0` keeps the raw FFT bins.
    pub bands: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 2048,
            mono: true,
            bands: 64,
        }
    }
}
