//! Configuration file support for Autonomia.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/autonomia/config.toml`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub workout: WorkoutConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub replay: ReplayConfig,

    #[serde(default)]
    pub sensor: SensorConfig,

    #[serde(default)]
    pub metronome: MetronomeConfig,
}

/// Target band and phase timing for one workout.
///
/// The band offsets are relative to the resting BPM measured at the start
/// of the session. Durations are in minutes.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WorkoutConfig {
    #[serde(default = "default_target_bpm_low")]
    pub target_bpm_low: i32,

    #[serde(default = "default_target_bpm_high")]
    pub target_bpm_high: i32,

    /// Lerp from low to high that calibration nudges toward.
    #[serde(default = "default_target_bpm_bias")]
    pub target_bpm_bias: f64,

    /// Calibration, steady, cooldown repetitions.
    #[serde(default = "default_intervals")]
    pub intervals: u32,

    #[serde(default = "default_calibration_time")]
    pub calibration_time: f64,

    #[serde(default = "default_steady_time")]
    pub steady_time: f64,

    #[serde(default = "default_cooldown_time")]
    pub cooldown_time: f64,
}

impl Default for WorkoutConfig {
    fn default() -> Self {
        Self {
            target_bpm_low: default_target_bpm_low(),
            target_bpm_high: default_target_bpm_high(),
            target_bpm_bias: default_target_bpm_bias(),
            intervals: default_intervals(),
            calibration_time: default_calibration_time(),
            steady_time: default_steady_time(),
            cooldown_time: default_cooldown_time(),
        }
    }
}

impl WorkoutConfig {
    /// Check the values a host could have typed in by hand
    pub fn validate(&self) -> Result<()> {
        if self.target_bpm_low > self.target_bpm_high {
            return Err(Error::Config(format!(
                "target_bpm_low ({}) is above target_bpm_high ({})",
                self.target_bpm_low, self.target_bpm_high
            )));
        }
        if !(0.0..=1.0).contains(&self.target_bpm_bias) {
            return Err(Error::Config(format!(
                "target_bpm_bias must be within [0, 1], got {}",
                self.target_bpm_bias
            )));
        }
        if self.intervals == 0 {
            return Err(Error::Config("intervals must be at least 1".into()));
        }
        for (name, minutes) in [
            ("calibration_time", self.calibration_time),
            ("steady_time", self.steady_time),
            ("cooldown_time", self.cooldown_time),
        ] {
            if !minutes.is_finite() || minutes < 0.0 {
                return Err(Error::Config(format!("{} must be >= 0, got {}", name, minutes)));
            }
        }
        Ok(())
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Skip writing the session log at shutdown
    #[serde(default)]
    pub no_save: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            no_save: false,
        }
    }
}

/// Replay pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Multiplier applied to every inter-tick sleep while replaying.
    #[serde(default = "default_replay_speed")]
    pub speed: f64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            speed: default_replay_speed(),
        }
    }
}

/// Heart-rate sensor bridge configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub device_address: Option<String>,

    #[serde(default = "default_sensor_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_scan_timeout_secs")]
    pub scan_timeout_secs: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            device_address: None,
            poll_interval_ms: default_sensor_poll_interval_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
            scan_timeout_secs: default_scan_timeout_secs(),
        }
    }
}

/// Metronome worker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetronomeConfig {
    /// General MIDI program, zero-based.
    #[serde(default = "default_program")]
    pub program: u8,

    /// Beats per measure
    #[serde(default = "default_meter")]
    pub meter: u32,

    #[serde(default = "default_metronome_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for MetronomeConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            meter: default_meter(),
            poll_interval_ms: default_metronome_poll_interval_ms(),
        }
    }
}

// Default value functions
fn default_target_bpm_low() -> i32 {
    10
}

fn default_target_bpm_high() -> i32 {
    20
}

fn default_target_bpm_bias() -> f64 {
    0.5
}

fn default_intervals() -> u32 {
    1
}

fn default_calibration_time() -> f64 {
    2.0
}

fn default_steady_time() -> f64 {
    10.0
}

fn default_cooldown_time() -> f64 {
    1.0
}

fn default_data_dir() -> PathBuf {
    let base = dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."));
    base.join("autonomia")
}

fn default_replay_speed() -> f64 {
    0.001
}

fn default_sensor_poll_interval_ms() -> u64 {
    100
}

fn default_reconnect_backoff_ms() -> u64 {
    100
}

fn default_scan_timeout_secs() -> u64 {
    5
}

fn default_program() -> u8 {
    11
}

fn default_meter() -> u32 {
    4
}

fn default_metronome_poll_interval_ms() -> u64 {
    10
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.workout.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("autonomia").join("config.toml")
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, self.to_toml()?)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.workout.target_bpm_low, 10);
        assert_eq!(config.workout.target_bpm_high, 20);
        assert_eq!(config.workout.intervals, 1);
        assert_eq!(config.metronome.meter, 4);
        assert_eq!(config.metronome.program, 11);
        assert!(!config.data.no_save);
        assert!(config.workout.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.workout, parsed.workout);
        assert_eq!(config.replay.speed, parsed.replay.speed);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[workout]
intervals = 3

[sensor]
device_address = "AA:BB:CC:DD:EE:FF"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.workout.intervals, 3);
        assert_eq!(config.workout.steady_time, 10.0); // default
        assert_eq!(
            config.sensor.device_address.as_deref(),
            Some("AA:BB:CC:DD:EE:FF")
        );
        assert_eq!(config.sensor.poll_interval_ms, 100);
    }

    #[test]
    fn test_validate_rejects_inverted_band() {
        let workout = WorkoutConfig {
            target_bpm_low: 30,
            target_bpm_high: 20,
            ..WorkoutConfig::default()
        };
        assert!(matches!(workout.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let workout = WorkoutConfig {
            intervals: 0,
            ..WorkoutConfig::default()
        };
        assert!(workout.validate().is_err());
    }

    #[test]
    fn test_save_and_load_from() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.workout.target_bpm_bias = 0.25;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.workout.target_bpm_bias, 0.25);
    }
}
