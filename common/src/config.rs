//! Runtime configuration, loaded from a JSON file with every field optional

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{PinNumbering, ServoCalibration};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Numbering scheme used for `led.pin`
    pub numbering: PinNumbering,
    pub led: LedConfig,
    pub pca: PcaConfig,
    pub servo: ServoCalibration,
    /// How long to wait for a PWM thread to exit before giving up
    pub stop_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    pub pin: u8,
    pub frequency: f64,
    pub max_brightness: f64,
    /// Set for loads wired active-low
    pub invert: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PcaConfig {
    pub bus: u8,
    pub address: u16,
    pub frequency: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            numbering: PinNumbering::Board,
            led: LedConfig::default(),
            pca: PcaConfig::default(),
            servo: ServoCalibration::DEFAULT,
            stop_timeout_ms: 1000,
        }
    }
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pin: 33,
            frequency: 1000.0,
            max_brightness: 100.0,
            invert: false,
        }
    }
}

impl Default for PcaConfig {
    fn default() -> Self {
        Self {
            bus: 7,
            address: 0x40,
            frequency: 50.0,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        let config = Self::parse(&text).with_context(|| format!("Load {}", path.display()))?;
        debug!("Loaded config: {config:?}");

        Ok(config)
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(text).context("Parse config")?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.led.frequency.is_finite() && self.led.frequency > 0.0,
            "led.frequency must be positive, got {}",
            self.led.frequency
        );
        ensure!(
            (0.0..=100.0).contains(&self.led.max_brightness),
            "led.max_brightness must be within 0..=100, got {}",
            self.led.max_brightness
        );
        ensure!(
            self.pca.frequency.is_finite() && self.pca.frequency > 0.0,
            "pca.frequency must be positive, got {}",
            self.pca.frequency
        );
        ensure!(
            self.pca.address <= 0x7F,
            "pca.address {:#x} is not a 7 bit address",
            self.pca.address
        );

        Ok(())
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
