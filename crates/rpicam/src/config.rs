//! YAML configuration, by default read from `~/.rpicam/config.yaml`.
//!
//! ```yaml
//! camera:
//!   backend: rpicam-still
//!   width: 1920
//!   height: 1080
//!   hvflip: true
//! timelapse:
//!   fps: 30
//!   sec_per_frame: 10
//!   failover: heal
//! servos:
//!   pan:
//!     channel: 0
//!     load_previous_angle: true
//! telegram:
//!   enabled: true
//!   chat_id: "123456"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::camera::{Backend, FailoverPolicy};
use crate::servo::{RangePolicy, ServoConfig, SysfsPwm};

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Still capture tool; detected from `PATH` if unset
    pub backend: Option<Backend>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Rotate frames by 180°
    pub hvflip: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelapseConfig {
    pub fps: u32,
    pub sec_per_frame: f64,
    pub duration_min: f64,
    pub failover: FailoverPolicy,
    pub tmpdir: Option<PathBuf>,
    /// Stamp frames with the capture time
    pub annotate: bool,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            sec_per_frame: 10.0,
            duration_min: 120.0,
            failover: FailoverPolicy::Skip,
            tmpdir: None,
            annotate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoEntry {
    pub chip: PathBuf,
    pub channel: u32,
    pub freq_hz: f64,
    pub unsafe_range: bool,
    pub on_invalid_angle: RangePolicy,
    pub load_previous_angle: bool,
    pub initial_angle: Option<i32>,
}

impl Default for ServoEntry {
    fn default() -> Self {
        Self {
            chip: PathBuf::from(SysfsPwm::DEFAULT_CHIP),
            channel: 0,
            freq_hz: SysfsPwm::DEFAULT_FREQ_HZ,
            unsafe_range: false,
            on_invalid_angle: RangePolicy::Raise,
            load_previous_angle: false,
            initial_angle: None,
        }
    }
}

impl ServoEntry {
    pub fn servo_config(&self, name: &str) -> ServoConfig {
        ServoConfig {
            name: name.to_string(),
            unsafe_range: self.unsafe_range,
            on_invalid_angle: self.on_invalid_angle,
            load_previous_angle: self.load_previous_angle,
            initial_angle: self.initial_angle,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    /// Falls back to `RPICAM_TG_API_TOKEN`
    pub api_token: Option<String>,
    /// Falls back to `RPICAM_TG_CHAT_ID`
    pub chat_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub rotate_fill_perc: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("rpicam-jobs"),
            prefix: "timelapse".to_string(),
            rotate_fill_perc: 90.0,
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub camera: CameraConfig,
    pub timelapse: TimelapseConfig,
    pub servos: BTreeMap<String, ServoEntry>,
    pub telegram: TelegramConfig,
    /// Servo angle store; `$TMPDIR/rpicam-state.json` if unset
    pub state_file: Option<PathBuf>,
    /// Rotate timelapse outputs through this directory when set
    pub storage: Option<StorageConfig>,
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let tl = &self.timelapse;
        if tl.fps == 0 {
            return Err(ConfigError::Invalid("timelapse.fps must be positive".to_string()));
        }
        if !(tl.sec_per_frame > 0.0) {
            return Err(ConfigError::Invalid(
                "timelapse.sec_per_frame must be positive".to_string(),
            ));
        }
        if !(tl.duration_min > 0.0) {
            return Err(ConfigError::Invalid(
                "timelapse.duration_min must be positive".to_string(),
            ));
        }
        for (name, servo) in &self.servos {
            if let Some(angle) = servo.initial_angle {
                if !servo.unsafe_range && !(0..=180).contains(&angle) {
                    return Err(ConfigError::Invalid(format!(
                        "servos.{name}.initial_angle {angle} outside of [0, 180]"
                    )));
                }
            }
            if !(servo.freq_hz > 0.0) {
                return Err(ConfigError::Invalid(format!(
                    "servos.{name}.freq_hz must be positive"
                )));
            }
        }
        if let Some(storage) = &self.storage {
            if !(0.0..=100.0).contains(&storage.rotate_fill_perc) {
                return Err(ConfigError::Invalid(
                    "storage.rotate_fill_perc must be within [0, 100]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// `~/.rpicam/config.yaml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".rpicam").join("config.yaml"))
}

/// Load `path`, or the default config file if it exists, or defaults.
///
/// An explicitly given path must exist.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return Config::from_file(path);
    }
    match default_config_path() {
        Some(default) if default.is_file() => {
            log::debug!("Loading config from {}", default.display());
            Config::from_file(default)
        }
        _ => Ok(Config::default()),
    }
}
