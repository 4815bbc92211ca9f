//! Hardware Capabilities
//!
//! The engine talks to the microscope through small capability traits
//! rather than one monolithic device interface:
//!
//! - [`StageControl`]: focus and XY moves, busy waits, focus direction
//! - [`ConfigControl`]: configuration group presets (channels)
//! - [`ExposureControl`]: camera exposure
//! - [`ShutterControl`]: illumination shutter
//! - [`ImageCapture`]: snapping images, sensor geometry
//! - [`Autofocus`]: full-focus routine
//!
//! [`MicroscopeCore`] bundles them and is implemented automatically for any
//! type that implements all six.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Every call may fail. The engine never retries; a failure aborts the run.

use crate::event::StageTarget;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Capability: Stage Motion
///
/// # Contract
/// - `move_stage` initiates motion and may return before completion
/// - `wait_for_device` blocks until the named device is idle
#[async_trait]
pub trait StageControl: Send + Sync {
    /// Start moving `device` to `target`.
    async fn move_stage(&self, device: &str, target: StageTarget) -> Result<()>;

    /// Current position of a single-axis drive, in µm.
    async fn position(&self, device: &str) -> Result<f64>;

    /// Current position of an XY stage, in µm.
    async fn xy_position(&self, device: &str) -> Result<(f64, f64)>;

    /// Block until `device` reports it is no longer busy.
    async fn wait_for_device(&self, device: &str) -> Result<()>;

    /// Raw focus direction of a focus drive.
    ///
    /// Positive means increasing Z moves the objective toward the sample
    /// top, negative the opposite. Zero means the direction is unknown.
    async fn focus_direction(&self, device: &str) -> Result<i32>;
}

/// Capability: Configuration Presets
#[async_trait]
pub trait ConfigControl: Send + Sync {
    /// Apply `preset` of configuration `group`.
    async fn set_config(&self, group: &str, preset: &str) -> Result<()>;
}

/// Capability: Exposure Time Control
///
/// # Contract
/// - Exposure is in milliseconds
/// - Setting exposure does not start acquisition
#[async_trait]
pub trait ExposureControl: Send + Sync {
    /// Set the camera exposure.
    async fn set_exposure(&self, exposure_ms: f64) -> Result<()>;

    /// Current camera exposure.
    async fn exposure(&self) -> Result<f64>;
}

/// Capability: Shutter Control
///
/// # Contract
/// - `snap_image` opens and closes the shutter itself unless the shutter
///   was opened explicitly with `set_shutter_open(true)`
#[async_trait]
pub trait ShutterControl: Send + Sync {
    /// Open or close the illumination shutter.
    async fn set_shutter_open(&self, open: bool) -> Result<()>;

    /// Query shutter state.
    async fn is_shutter_open(&self) -> Result<bool>;
}

/// Sensor geometry of the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageGeometry {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per pixel.
    pub bytes_per_pixel: u32,
}

impl ImageGeometry {
    /// Size of one image in bytes.
    #[must_use]
    pub fn bytes_per_image(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.bytes_per_pixel)
    }
}

/// Raw image returned by the camera.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedImage {
    /// Row-major pixel data.
    pub pixels: Vec<u16>,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

/// Capability: Image Capture
#[async_trait]
pub trait ImageCapture: Send + Sync {
    /// Expose and read out one image.
    async fn snap_image(&self) -> Result<CapturedImage>;

    /// Geometry of the images `snap_image` returns.
    fn image_geometry(&self) -> ImageGeometry;
}

/// Capability: Autofocus
#[async_trait]
pub trait Autofocus: Send + Sync {
    /// Run the full-focus routine and leave the focus drive at best focus.
    async fn full_focus(&self) -> Result<()>;
}

/// Everything the sequencing engine needs from a microscope.
pub trait MicroscopeCore:
    StageControl + ConfigControl + ExposureControl + ShutterControl + ImageCapture + Autofocus
{
}

impl<T> MicroscopeCore for T where
    T: StageControl + ConfigControl + ExposureControl + ShutterControl + ImageCapture + Autofocus
{
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_per_image() {
        let geometry = ImageGeometry {
            width: 512,
            height: 256,
            bytes_per_pixel: 2,
        };
        assert_eq!(geometry.bytes_per_image(), 262_144);
    }
}
