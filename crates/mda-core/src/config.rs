//! Engine configuration.
//!
//! [`EngineConfig`] carries the tunables of the engine itself (queue sizes,
//! disk-space safety factor, camera geometry of the simulated microscope).
//! Per-acquisition parameters live in [`crate::settings::SequenceSettings`].
//!
//! Configuration is layered with Figment:
//! 1. Base Layer: defaults from `EngineConfig::default()`
//! 2. File Layer: a TOML file (optional, warns if missing)
//! 3. Environment Layer: variables prefixed with `MDA_`, nested fields split
//!    on double underscores (e.g. `MDA_CAMERA__WIDTH=1024`)

use crate::capabilities::ImageGeometry;
use crate::error::{MdaError, MdaResult};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default config file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/mda.toml";

/// Tunables of the sequencing engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Log filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Capacity of the bounded image queue between engine and sink.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Capacity of the lifecycle document broadcast channel.
    #[serde(default = "default_document_channel_capacity")]
    pub document_channel_capacity: usize,
    /// Free disk space required, as a multiple of the estimated data size.
    #[serde(default = "default_disk_space_factor")]
    pub disk_space_factor: f64,
    /// How often a paused engine checks for resume, in ms.
    #[serde(default = "default_pause_poll_interval_ms")]
    pub pause_poll_interval_ms: u64,
    /// Camera geometry used by the simulated microscope.
    #[serde(default)]
    pub camera: CameraConfig,
}

/// Camera geometry section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bytes_per_pixel: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            bytes_per_pixel: 2,
        }
    }
}

impl From<CameraConfig> for ImageGeometry {
    fn from(camera: CameraConfig) -> Self {
        ImageGeometry {
            width: camera.width,
            height: camera.height,
            bytes_per_pixel: camera.bytes_per_pixel,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_queue_capacity() -> usize {
    32
}

fn default_document_channel_capacity() -> usize {
    256
}

fn default_disk_space_factor() -> f64 {
    1.25
}

fn default_pause_poll_interval_ms() -> u64 {
    50
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            queue_capacity: default_queue_capacity(),
            document_channel_capacity: default_document_channel_capacity(),
            disk_space_factor: default_disk_space_factor(),
            pause_poll_interval_ms: default_pause_poll_interval_ms(),
            camera: CameraConfig::default(),
        }
    }
}

impl Provider for EngineConfig {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Engine Defaults")
    }

    fn data(
        &self,
    ) -> Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error> {
        Serialized::defaults(EngineConfig::default()).data()
    }
}

impl EngineConfig {
    /// Load the layered configuration.
    ///
    /// # Environment Variables
    ///
    /// - `MDA_LOG_LEVEL=debug` → sets `log_level`
    /// - `MDA_QUEUE_CAPACITY=64` → sets `queue_capacity`
    /// - `MDA_CAMERA__WIDTH=1024` → sets `camera.width`
    ///
    /// # Arguments
    ///
    /// * `config_path` - Optional path to a config file. If None, uses [`DEFAULT_CONFIG_PATH`]
    pub fn load(config_path: Option<PathBuf>) -> MdaResult<Self> {
        let mut figment = Figment::from(EngineConfig::default());

        let file_path = config_path.unwrap_or_else(|| DEFAULT_CONFIG_PATH.into());
        if file_path.exists() {
            figment = figment.merge(Toml::file(&file_path));
        } else {
            // Logging is not initialised yet, the level comes from this file
            eprintln!(
                "Config file not found: {}. Using defaults.",
                file_path.display()
            );
        }

        figment = figment.merge(Env::prefixed("MDA_").split("__"));

        let config: EngineConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> MdaResult<()> {
        if self.queue_capacity == 0 {
            return Err(MdaError::Configuration(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.document_channel_capacity == 0 {
            return Err(MdaError::Configuration(
                "document_channel_capacity must be at least 1".to_string(),
            ));
        }
        if !self.disk_space_factor.is_finite() || self.disk_space_factor < 1.0 {
            return Err(MdaError::Configuration(format!(
                "disk_space_factor must be >= 1.0, got {}",
                self.disk_space_factor
            )));
        }
        if self.pause_poll_interval_ms == 0 {
            return Err(MdaError::Configuration(
                "pause_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        crate::limits::validate_frame_size(&self.camera.into())?;
        Ok(())
    }

    /// Pause polling interval.
    #[must_use]
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }
}
