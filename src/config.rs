use std::{fs, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Machine and pacing settings. Every field has a default, so partial
/// JSON documents are accepted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// CPU clock in kHz: 3993 (4 MHz mode) or 7987 (8 MHz mode).
    pub cpu_clock_khz: u32,
    /// Target speed relative to real hardware, in percent.
    pub speed_percent: u32,
    /// Frames per screen update.
    pub refresh_timing: u32,
    /// Run as fast as the host allows.
    pub no_wait: bool,
    /// 24 kHz (400 line) monitor mode.
    pub high_resolution: bool,
    /// BASIC mode switch word, only carried through snapshots.
    pub basic_mode: u32,
    pub compress_snapshots: bool,
    pub cd_enabled: bool,
    /// Audio output rate in Hz.
    pub sound_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu_clock_khz: 3993,
            speed_percent: 100,
            refresh_timing: 1,
            no_wait: false,
            high_resolution: false,
            basic_mode: 0x31,
            compress_snapshots: true,
            cd_enabled: false,
            sound_rate: 44100,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_json(&json)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!("[CONFIG] Loaded {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(100..=100_000).contains(&self.cpu_clock_khz) {
            return Err(ConfigError::Range {
                field: "cpu_clock_khz",
                value: self.cpu_clock_khz,
            });
        }
        if !(1..=10_000).contains(&self.speed_percent) {
            return Err(ConfigError::Range {
                field: "speed_percent",
                value: self.speed_percent,
            });
        }
        if !(1..=60).contains(&self.refresh_timing) {
            return Err(ConfigError::Range {
                field: "refresh_timing",
                value: self.refresh_timing,
            });
        }
        Ok(())
    }

    /// Clock after applying the speed setting, in kHz.
    pub fn effective_clock_khz(&self) -> u32 {
        (self.cpu_clock_khz as u64 * self.speed_percent as u64 / 100).max(1) as u32
    }
}
