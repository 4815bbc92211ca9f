//! Simulated microscope.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use mda_core::capabilities::{
    Autofocus, CapturedImage, ConfigControl, ExposureControl, ImageCapture, ImageGeometry,
    ShutterControl, StageControl,
};
use mda_core::event::StageTarget;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::common::errors::ops;
use crate::common::{ErrorConfig, MockMode, MockRng, TimingConfig};
use crate::pattern::{generate_test_pattern, PatternParams};

const DRIVER_TYPE: &str = "mock_microscope";

/// Hardware call recorded by the simulated microscope.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    /// `move_stage`
    Move {
        /// Device moved.
        device: String,
        /// Target.
        target: StageTarget,
    },
    /// `wait_for_device`
    Wait(String),
    /// `set_config`
    SetConfig {
        /// Group.
        group: String,
        /// Preset.
        preset: String,
    },
    /// `set_exposure`
    SetExposure(f64),
    /// `set_shutter_open`
    Shutter(bool),
    /// `snap_image`
    Snap,
    /// `full_focus`
    FullFocus,
}

/// Behaviour of the focus drive at its travel limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FocusTravel {
    /// Lowest reachable position in µm
    pub lower_um: f64,
    /// Highest reachable position in µm
    pub upper_um: f64,
}

impl FocusTravel {
    fn enforce(&self, target: f64) -> Result<f64> {
        if target < self.lower_um || target > self.upper_um {
            Err(anyhow!(
                "Focus position {:.2}µm exceeds limits [{:.2}, {:.2}]µm",
                target,
                self.lower_um,
                self.upper_um
            ))
        } else {
            Ok(target)
        }
    }
}

#[derive(Debug)]
struct MicroscopeState {
    z_um: f64,
    xy_um: (f64, f64),
    last_move_um: f64,
    exposure_ms: f64,
    shutter_open: bool,
    presets: HashMap<String, String>,
}

/// Simulated microscope with a focus drive, XY stage, camera, shutter,
/// configuration presets and autofocus.
///
/// Every call is recorded in a call log that tests can inspect, and every
/// call first consults the [`ErrorConfig`] for injected failures.
///
/// # Example
///
/// ```rust,ignore
/// let scope = MockMicroscope::builder()
///     .mode(MockMode::Realistic)
///     .focus_direction(-1)
///     .build();
///
/// scope.move_stage("Z", StageTarget::Z(10.0)).await?;
/// assert_eq!(scope.position("Z").await?, 10.0);
/// ```
pub struct MockMicroscope {
    state: Arc<RwLock<MicroscopeState>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    frame_counter: AtomicU64,
    geometry: ImageGeometry,
    focus_device: String,
    xy_device: String,
    focus_direction: i32,
    focus_travel: Option<FocusTravel>,
    specimen_z_um: f64,
    best_focus_um: Option<f64>,
    mode: MockMode,
    timing: TimingConfig,
    error_config: ErrorConfig,
    rng: MockRng,
}

impl MockMicroscope {
    /// Microscope in instant mode with default geometry.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring MockMicroscope
    pub fn builder() -> MockMicroscopeBuilder {
        MockMicroscopeBuilder::new()
    }

    /// Calls recorded so far.
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Number of images snapped.
    pub fn images_snapped(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    /// Current focus position.
    pub async fn z(&self) -> f64 {
        self.state.read().await.z_um
    }

    /// Whether the shutter is open.
    pub async fn shutter_is_open(&self) -> bool {
        self.state.read().await.shutter_open
    }

    /// Preset currently applied for `group`.
    pub async fn preset(&self, group: &str) -> Option<String> {
        self.state.read().await.presets.get(group).cloned()
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        self.error_config.check_operation(DRIVER_TYPE, operation)?;
        Ok(())
    }

    fn check_device(&self, device: &str) -> Result<()> {
        if device == self.focus_device || device == self.xy_device {
            Ok(())
        } else {
            Err(anyhow!("Unknown device '{}'", device))
        }
    }

    async fn delay(&self, base: Duration) {
        if self.mode.is_timed() && !base.is_zero() {
            sleep(self.rng.jitter(base, self.timing.jitter)).await;
        }
    }
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageControl for MockMicroscope {
    async fn move_stage(&self, device: &str, target: StageTarget) -> Result<()> {
        self.check(ops::MOVE_STAGE)?;
        self.check_device(device)?;
        self.record(MockCall::Move {
            device: device.to_string(),
            target,
        });

        let mut state = self.state.write().await;
        match target {
            StageTarget::Z(z) => {
                if device != self.focus_device {
                    return Err(anyhow!("'{}' is not a focus drive", device));
                }
                let z = match &self.focus_travel {
                    Some(travel) => travel.enforce(z)?,
                    None => z,
                };
                state.last_move_um = (z - state.z_um).abs();
                tracing::debug!(from = state.z_um, to = z, "MockMicroscope: focus move");
                state.z_um = z;
            }
            StageTarget::Xy { x, y } => {
                if device != self.xy_device {
                    return Err(anyhow!("'{}' is not an XY stage", device));
                }
                let (cx, cy) = state.xy_um;
                state.last_move_um = ((x - cx).powi(2) + (y - cy).powi(2)).sqrt();
                tracing::debug!(x, y, "MockMicroscope: XY move");
                state.xy_um = (x, y);
            }
        }
        Ok(())
    }

    async fn position(&self, device: &str) -> Result<f64> {
        self.check(ops::POSITION)?;
        if device != self.focus_device {
            return Err(anyhow!("'{}' is not a focus drive", device));
        }
        Ok(self.state.read().await.z_um)
    }

    async fn xy_position(&self, device: &str) -> Result<(f64, f64)> {
        self.check(ops::POSITION)?;
        if device != self.xy_device {
            return Err(anyhow!("'{}' is not an XY stage", device));
        }
        Ok(self.state.read().await.xy_um)
    }

    async fn wait_for_device(&self, device: &str) -> Result<()> {
        self.check(ops::WAIT_FOR_DEVICE)?;
        self.check_device(device)?;
        self.record(MockCall::Wait(device.to_string()));
        let distance = self.state.read().await.last_move_um;
        self.delay(self.timing.settling(distance)).await;
        Ok(())
    }

    async fn focus_direction(&self, device: &str) -> Result<i32> {
        self.check(ops::FOCUS_DIRECTION)?;
        if device != self.focus_device {
            return Err(anyhow!("'{}' is not a focus drive", device));
        }
        Ok(self.focus_direction)
    }
}

#[async_trait]
impl ConfigControl for MockMicroscope {
    async fn set_config(&self, group: &str, preset: &str) -> Result<()> {
        self.check(ops::SET_CONFIG)?;
        self.record(MockCall::SetConfig {
            group: group.to_string(),
            preset: preset.to_string(),
        });
        self.state
            .write()
            .await
            .presets
            .insert(group.to_string(), preset.to_string());
        self.delay(Duration::from_millis(self.timing.config_switch_ms))
            .await;
        Ok(())
    }
}

#[async_trait]
impl ExposureControl for MockMicroscope {
    async fn set_exposure(&self, exposure_ms: f64) -> Result<()> {
        self.check(ops::SET_EXPOSURE)?;
        if !exposure_ms.is_finite() || exposure_ms <= 0.0 {
            return Err(anyhow!("Invalid exposure {} ms", exposure_ms));
        }
        self.record(MockCall::SetExposure(exposure_ms));
        self.state.write().await.exposure_ms = exposure_ms;
        Ok(())
    }

    async fn exposure(&self) -> Result<f64> {
        Ok(self.state.read().await.exposure_ms)
    }
}

#[async_trait]
impl ShutterControl for MockMicroscope {
    async fn set_shutter_open(&self, open: bool) -> Result<()> {
        self.check(ops::SET_SHUTTER)?;
        self.record(MockCall::Shutter(open));
        self.state.write().await.shutter_open = open;
        Ok(())
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        Ok(self.state.read().await.shutter_open)
    }
}

#[async_trait]
impl ImageCapture for MockMicroscope {
    async fn snap_image(&self) -> Result<CapturedImage> {
        self.check(ops::SNAP_IMAGE)?;
        self.record(MockCall::Snap);

        let (exposure_ms, z_um) = {
            let state = self.state.read().await;
            (state.exposure_ms, state.z_um)
        };
        self.delay(Duration::from_secs_f64(exposure_ms / 1000.0) + Duration::from_millis(self.timing.readout_ms))
            .await;

        let frame_num = self.frame_counter.fetch_add(1, Ordering::SeqCst);
        let pixels = generate_test_pattern(
            self.geometry.width,
            self.geometry.height,
            PatternParams {
                frame_num,
                defocus_um: z_um - self.specimen_z_um,
                brightness: exposure_ms / 10.0,
            },
        );
        Ok(CapturedImage {
            pixels,
            width: self.geometry.width,
            height: self.geometry.height,
        })
    }

    fn image_geometry(&self) -> ImageGeometry {
        self.geometry
    }
}

#[async_trait]
impl Autofocus for MockMicroscope {
    async fn full_focus(&self) -> Result<()> {
        self.check(ops::FULL_FOCUS)?;
        self.record(MockCall::FullFocus);
        self.delay(Duration::from_millis(self.timing.autofocus_ms))
            .await;
        if let Some(best) = self.best_focus_um {
            self.state.write().await.z_um = best;
        }
        Ok(())
    }
}

// =============================================================================
// Builder Pattern
// =============================================================================

/// Builder for MockMicroscope with fluent API
pub struct MockMicroscopeBuilder {
    geometry: ImageGeometry,
    focus_device: String,
    xy_device: String,
    focus_direction: i32,
    focus_travel: Option<FocusTravel>,
    initial_z_um: f64,
    initial_xy_um: (f64, f64),
    specimen_z_um: f64,
    best_focus_um: Option<f64>,
    mode: MockMode,
    timing: Option<TimingConfig>,
    error_config: Option<ErrorConfig>,
    seed: Option<u64>,
}

impl MockMicroscopeBuilder {
    /// Create new builder with defaults
    pub fn new() -> Self {
        Self {
            geometry: ImageGeometry {
                width: 64,
                height: 64,
                bytes_per_pixel: 2,
            },
            focus_device: "Z".to_string(),
            xy_device: "XY".to_string(),
            focus_direction: 1,
            focus_travel: None,
            initial_z_um: 0.0,
            initial_xy_um: (0.0, 0.0),
            specimen_z_um: 0.0,
            best_focus_um: None,
            mode: MockMode::Instant,
            timing: None,
            error_config: None,
            seed: None,
        }
    }

    /// Camera geometry
    pub fn geometry(mut self, geometry: ImageGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    /// Names of the focus drive and XY stage
    pub fn devices(mut self, focus: impl Into<String>, xy: impl Into<String>) -> Self {
        self.focus_device = focus.into();
        self.xy_device = xy.into();
        self
    }

    /// Raw focus direction reported by the focus drive
    pub fn focus_direction(mut self, direction: i32) -> Self {
        self.focus_direction = direction;
        self
    }

    /// Reject focus moves outside `[lower, upper]`
    pub fn focus_travel(mut self, lower_um: f64, upper_um: f64) -> Self {
        self.focus_travel = Some(FocusTravel { lower_um, upper_um });
        self
    }

    /// Starting focus position
    pub fn initial_z(mut self, z_um: f64) -> Self {
        self.initial_z_um = z_um;
        self
    }

    /// Starting XY position
    pub fn initial_xy(mut self, x_um: f64, y_um: f64) -> Self {
        self.initial_xy_um = (x_um, y_um);
        self
    }

    /// Focus position at which synthetic images are sharpest
    pub fn specimen_z(mut self, z_um: f64) -> Self {
        self.specimen_z_um = z_um;
        self
    }

    /// Position the focus drive ends at after autofocus
    pub fn best_focus(mut self, z_um: f64) -> Self {
        self.best_focus_um = Some(z_um);
        self
    }

    /// Operational mode
    pub fn mode(mut self, mode: MockMode) -> Self {
        self.mode = mode;
        self
    }

    /// Device latencies (used in Realistic and Chaos modes)
    pub fn timing(mut self, timing: TimingConfig) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Error injection
    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = Some(config);
        self
    }

    /// Seed for jitter and chaos failures
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build the MockMicroscope
    pub fn build(self) -> MockMicroscope {
        let timing = self.timing.unwrap_or_else(|| match self.mode {
            MockMode::Instant => TimingConfig::default(),
            MockMode::Realistic | MockMode::Chaos => TimingConfig::widefield(),
        });
        let error_config = self.error_config.unwrap_or_else(|| match self.mode {
            MockMode::Chaos => ErrorConfig::random_failures_seeded(0.01, self.seed),
            MockMode::Instant | MockMode::Realistic => ErrorConfig::none(),
        });

        MockMicroscope {
            state: Arc::new(RwLock::new(MicroscopeState {
                z_um: self.initial_z_um,
                xy_um: self.initial_xy_um,
                last_move_um: 0.0,
                exposure_ms: 10.0,
                shutter_open: false,
                presets: HashMap::new(),
            })),
            calls: Arc::new(Mutex::new(Vec::new())),
            frame_counter: AtomicU64::new(0),
            geometry: self.geometry,
            focus_device: self.focus_device,
            xy_device: self.xy_device,
            focus_direction: self.focus_direction,
            focus_travel: self.focus_travel,
            specimen_z_um: self.specimen_z_um,
            best_focus_um: self.best_focus_um,
            mode: self.mode,
            timing,
            error_config,
            rng: MockRng::new(self.seed),
        }
    }
}

impl Default for MockMicroscopeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ErrorScenario;

    #[tokio::test]
    async fn test_focus_move_and_readback() {
        let scope = MockMicroscope::new();
        scope.move_stage("Z", StageTarget::Z(12.5)).await.unwrap();
        scope.wait_for_device("Z").await.unwrap();
        assert_eq!(scope.position("Z").await.unwrap(), 12.5);
        assert_eq!(
            scope.calls(),
            vec![
                MockCall::Move {
                    device: "Z".into(),
                    target: StageTarget::Z(12.5)
                },
                MockCall::Wait("Z".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_xy_move() {
        let scope = MockMicroscope::builder().initial_xy(5.0, 5.0).build();
        assert_eq!(scope.xy_position("XY").await.unwrap(), (5.0, 5.0));
        scope
            .move_stage("XY", StageTarget::Xy { x: 100.0, y: -3.0 })
            .await
            .unwrap();
        assert_eq!(scope.xy_position("XY").await.unwrap(), (100.0, -3.0));
        assert!(scope.move_stage("XY", StageTarget::Z(1.0)).await.is_err());
    }

    #[tokio::test]
    async fn test_focus_travel_limits() {
        let scope = MockMicroscope::builder().focus_travel(0.0, 100.0).build();
        assert!(scope.move_stage("Z", StageTarget::Z(150.0)).await.is_err());
        assert_eq!(scope.z().await, 0.0);
    }

    #[tokio::test]
    async fn test_unknown_device_rejected() {
        let scope = MockMicroscope::new();
        assert!(scope.wait_for_device("Piezo").await.is_err());
        assert!(scope.focus_direction("XY").await.is_err());
    }

    #[tokio::test]
    async fn test_snap_uses_geometry() {
        let geometry = ImageGeometry {
            width: 16,
            height: 8,
            bytes_per_pixel: 2,
        };
        let scope = MockMicroscope::builder().geometry(geometry).build();
        let image = scope.snap_image().await.unwrap();
        assert_eq!(image.pixels.len(), 128);
        assert_eq!((image.width, image.height), (16, 8));
        assert_eq!(scope.images_snapped(), 1);
    }

    #[tokio::test]
    async fn test_presets_and_shutter() {
        let scope = MockMicroscope::new();
        scope.set_config("Channel", "DAPI").await.unwrap();
        scope.set_shutter_open(true).await.unwrap();
        assert_eq!(scope.preset("Channel").await.as_deref(), Some("DAPI"));
        assert!(scope.shutter_is_open().await);
        assert!(scope.set_exposure(0.0).await.is_err());
    }

    #[tokio::test]
    async fn test_autofocus_moves_to_best_focus() {
        let scope = MockMicroscope::builder().best_focus(42.0).build();
        scope.full_focus().await.unwrap();
        assert_eq!(scope.z().await, 42.0);
    }

    #[tokio::test]
    async fn test_injected_snap_failure() {
        let scope = MockMicroscope::builder()
            .error_config(ErrorConfig::scenario(ErrorScenario::FailAfterN {
                operation: ops::SNAP_IMAGE,
                count: 1,
            }))
            .build();
        assert!(scope.snap_image().await.is_ok());
        let err = scope.snap_image().await.unwrap_err();
        assert!(err.to_string().contains("mock_microscope"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_realistic_mode_takes_time() {
        let scope = MockMicroscope::builder()
            .mode(MockMode::Realistic)
            .timing(TimingConfig {
                readout_ms: 20,
                ..TimingConfig::default()
            })
            .build();
        scope.set_exposure(30.0).await.unwrap();
        let start = tokio::time::Instant::now();
        scope.snap_image().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
