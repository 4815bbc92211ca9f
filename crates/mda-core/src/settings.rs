//! Sequence settings snapshot.
//!
//! [`SequenceSettings`] holds every use-flag and parameter of an acquisition.
//! The engine clones it once when a run starts and never looks at the
//! caller's copy again, so edits made while a run is in progress only apply
//! to the next run.
//!
//! Settings are plain serde data and can be written as TOML:
//!
//! ```toml
//! name = "timelapse"
//! use_frames = true
//! num_frames = 10
//! interval_ms = 500.0
//!
//! use_channels = true
//! [[channels]]
//! config = "DAPI"
//! exposure_ms = 20.0
//! ```

use crate::axis::{slice_count, AxisBounds, AxisKind, AxisSpec, StepRule};
use crate::error::{MdaError, MdaResult};
use crate::event::StagePosition;
use crate::limits::MAX_TIMELAPSE_SPAN_MS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One channel entry of the settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSpec {
    /// Include this channel in the acquisition.
    pub use_channel: bool,
    /// Preset name within the channel group.
    pub config: String,
    /// Exposure in ms.
    pub exposure_ms: f64,
    /// Focus offset in µm applied on top of the slice position.
    pub z_offset_um: f64,
    /// Image at every slice. When false the channel is imaged once per
    /// stack, at its first slice.
    pub do_z_stack: bool,
    /// Acquire only on frames that are a multiple of `skip_frames + 1`.
    pub skip_frames: u32,
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            use_channel: true,
            config: String::new(),
            exposure_ms: 10.0,
            z_offset_um: 0.0,
            do_z_stack: true,
            skip_frames: 0,
        }
    }
}

impl ChannelSpec {
    /// Enabled channel with the given preset and exposure.
    pub fn new(config: impl Into<String>, exposure_ms: f64) -> Self {
        Self {
            config: config.into(),
            exposure_ms,
            ..Self::default()
        }
    }
}

/// How the imaging volume is defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpaceMode {
    /// Plain stack from the slice settings, or a single plane at the current focus.
    #[default]
    None,
    /// Fixed Z range over an XY footprint.
    Cuboid,
    /// Fixed distances above and below one surface.
    FixedDistanceFromSurface,
    /// Between a top and a bottom surface.
    VolumeBetweenSurfaces,
    /// 2D tiling at the current focus.
    #[serde(rename = "region_2d")]
    Region2D,
    /// 2D tiling with Z taken from a surface.
    #[serde(rename = "region_2d_surface_guided")]
    Region2DSurfaceGuided,
}

impl SpaceMode {
    /// Modes that acquire a Z stack whose extent comes from the volume.
    #[must_use]
    pub fn is_volume(&self) -> bool {
        matches!(
            self,
            SpaceMode::Cuboid
                | SpaceMode::FixedDistanceFromSurface
                | SpaceMode::VolumeBetweenSurfaces
        )
    }

    /// Modes that tile an XY footprint.
    #[must_use]
    pub fn is_region(&self) -> bool {
        !matches!(self, SpaceMode::None)
    }
}

impl std::fmt::Display for SpaceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SpaceMode::None => "none",
            SpaceMode::Cuboid => "cuboid",
            SpaceMode::FixedDistanceFromSurface => "fixed_distance_from_surface",
            SpaceMode::VolumeBetweenSurfaces => "volume_between_surfaces",
            SpaceMode::Region2D => "region_2d",
            SpaceMode::Region2DSurfaceGuided => "region_2d_surface_guided",
        };
        write!(f, "{}", label)
    }
}

/// Point on a surface, in stage coordinates (µm).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point3 {
    /// Stage X.
    pub x: f64,
    /// Stage Y.
    pub y: f64,
    /// Focus position.
    pub z: f64,
}

impl Point3 {
    /// Point from its coordinates.
    #[must_use]
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Named set of interpolation points describing a sample surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceDef {
    /// Name referenced from [`VolumeSettings`].
    pub name: String,
    /// Points the surface is fitted through.
    pub points: Vec<Point3>,
}

/// XY region tiled by region and volume modes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Footprint {
    /// Single tile at the current stage position.
    #[default]
    CurrentPosition,
    /// Tiles covering the XY extent of a surface's points.
    Surface {
        /// Surface to cover.
        name: String,
    },
    /// Explicit grid centred on a stage position.
    Grid {
        /// Number of tile rows.
        rows: usize,
        /// Number of tile columns.
        cols: usize,
        /// Grid centre X in µm.
        center_x_um: f64,
        /// Grid centre Y in µm.
        center_y_um: f64,
    },
}

/// Travel limits of the focus drive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FocusLimits {
    /// Lowest reachable position in µm.
    pub lower_um: f64,
    /// Highest reachable position in µm.
    pub upper_um: f64,
}

impl FocusLimits {
    /// Whether `z` is reachable.
    #[must_use]
    pub fn contains(&self, z: f64) -> bool {
        z >= self.lower_um && z <= self.upper_um
    }
}

/// Volume and region settings used by every space mode other than `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSettings {
    /// Space mode.
    pub mode: SpaceMode,
    /// Slice spacing in µm for volume modes. Must be positive.
    pub z_step_um: f64,
    /// Cuboid top Z in µm.
    pub cuboid_z_start_um: f64,
    /// Cuboid bottom Z in µm.
    pub cuboid_z_end_um: f64,
    /// Surface for fixed-distance mode.
    pub fixed_surface: Option<String>,
    /// Distance imaged above the fixed surface, in µm.
    pub distance_above_surface_um: f64,
    /// Distance imaged below the fixed surface, in µm.
    pub distance_below_surface_um: f64,
    /// Upper surface for between-surfaces mode.
    pub top_surface: Option<String>,
    /// Lower surface for between-surfaces mode.
    pub bottom_surface: Option<String>,
    /// Extra distance imaged above the top surface, in µm.
    pub distance_above_top_um: f64,
    /// Extra distance imaged below the bottom surface, in µm.
    pub distance_below_bottom_um: f64,
    /// Surface supplying Z in surface-guided 2D mode.
    pub collection_plane: Option<String>,
    /// XY region to tile.
    pub footprint: Footprint,
    /// Overlap between neighbouring tiles, percent of the field of view.
    pub tile_overlap_percent: f64,
    /// Surfaces available to the modes above.
    pub surfaces: Vec<SurfaceDef>,
}

impl Default for VolumeSettings {
    fn default() -> Self {
        Self {
            mode: SpaceMode::None,
            z_step_um: 1.0,
            cuboid_z_start_um: 0.0,
            cuboid_z_end_um: 0.0,
            fixed_surface: None,
            distance_above_surface_um: 0.0,
            distance_below_surface_um: 0.0,
            top_surface: None,
            bottom_surface: None,
            distance_above_top_um: 0.0,
            distance_below_bottom_um: 0.0,
            collection_plane: None,
            footprint: Footprint::CurrentPosition,
            tile_overlap_percent: 0.0,
            surfaces: Vec::new(),
        }
    }
}

impl VolumeSettings {
    /// Surface definition by name.
    #[must_use]
    pub fn surface(&self, name: &str) -> Option<&SurfaceDef> {
        self.surfaces.iter().find(|s| s.name == name)
    }

    fn require_surface(&self, field: &str, name: Option<&String>) -> MdaResult<()> {
        let name = name.ok_or_else(|| {
            MdaError::Configuration(format!("{} mode requires `{}`", self.mode, field))
        })?;
        if self.surface(name).is_none() {
            return Err(MdaError::InvalidSurface {
                name: name.clone(),
                reason: "no surface with this name is defined".to_string(),
            });
        }
        Ok(())
    }
}

/// Nesting order of the four axes, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcqOrderMode {
    /// Time, Position, Slice, Channel.
    TimePosSliceChannel,
    /// Time, Position, Channel, Slice.
    TimePosChannelSlice,
    /// Position, Time, Slice, Channel.
    PosTimeSliceChannel,
    /// Position, Time, Channel, Slice.
    PosTimeChannelSlice,
}

impl AcqOrderMode {
    /// Order selected by the two order flags.
    ///
    /// `time_first` makes time vary faster than position; `slices_first`
    /// makes slices vary faster than channels.
    #[must_use]
    pub fn from_flags(time_first: bool, slices_first: bool) -> Self {
        match (time_first, slices_first) {
            (false, false) => AcqOrderMode::TimePosSliceChannel,
            (false, true) => AcqOrderMode::TimePosChannelSlice,
            (true, false) => AcqOrderMode::PosTimeSliceChannel,
            (true, true) => AcqOrderMode::PosTimeChannelSlice,
        }
    }

    /// Axes outermost first.
    #[must_use]
    pub fn axis_order(&self) -> [AxisKind; 4] {
        use AxisKind::{Channel, Position, Slice, Time};
        match self {
            AcqOrderMode::TimePosSliceChannel => [Time, Position, Slice, Channel],
            AcqOrderMode::TimePosChannelSlice => [Time, Position, Channel, Slice],
            AcqOrderMode::PosTimeSliceChannel => [Position, Time, Slice, Channel],
            AcqOrderMode::PosTimeChannelSlice => [Position, Time, Channel, Slice],
        }
    }
}

impl std::fmt::Display for AcqOrderMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<&str> = self.axis_order().iter().map(AxisKind::label).collect();
        write!(f, "{}", labels.join(", "))
    }
}

/// Complete configuration of one acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequenceSettings {
    /// Run name, used as the datastore prefix.
    pub name: String,
    /// Directory images are saved under.
    pub save_root: PathBuf,
    /// Show images while acquiring. Carried to the `Started` document.
    pub show_display: bool,

    /// Acquire a timelapse.
    pub use_frames: bool,
    /// Number of frames when no custom intervals are used.
    pub num_frames: usize,
    /// Interval between frame starts in ms.
    pub interval_ms: f64,
    /// Use `custom_intervals_ms` instead of `num_frames` and `interval_ms`.
    pub use_custom_intervals: bool,
    /// Per-frame intervals in ms.
    pub custom_intervals_ms: Vec<f64>,

    /// Visit the positions in `positions`.
    pub use_position_list: bool,
    /// Stage positions in visiting order.
    pub positions: Vec<StagePosition>,

    /// Acquire the channels in `channels`.
    pub use_channels: bool,
    /// Configuration group the channel presets belong to.
    pub channel_group: String,
    /// Channels in acquisition order.
    pub channels: Vec<ChannelSpec>,

    /// Acquire a simple Z stack (space mode `None` only).
    pub use_slices: bool,
    /// First slice position in µm.
    pub slice_z_bottom_um: f64,
    /// Last slice position in µm, inclusive.
    pub slice_z_top_um: f64,
    /// Slice spacing in µm.
    pub slice_z_step_um: f64,
    /// Slice positions are relative to the focus position at run start.
    pub relative_z_slice: bool,

    /// Time varies faster than position.
    pub time_first: bool,
    /// Slices vary faster than channels.
    pub slices_first: bool,

    /// Keep the shutter open while only the channel changes.
    pub keep_shutter_open_channels: bool,
    /// Keep the shutter open while only the slice changes.
    pub keep_shutter_open_slices: bool,

    /// Run autofocus at the start of each position.
    pub use_autofocus: bool,
    /// Autofocus only on frames that are a multiple of `skip_autofocus_count + 1`.
    pub skip_autofocus_count: u32,

    /// Focus drive name.
    pub focus_device: Option<String>,
    /// XY stage name.
    pub xy_device: Option<String>,
    /// Camera pixel size in µm, used for tiling.
    pub pixel_size_um: f64,
    /// Focus travel limits.
    pub focus_limits: Option<FocusLimits>,

    /// Region and volume settings.
    pub volume: VolumeSettings,
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            name: "acquisition".to_string(),
            save_root: PathBuf::from("./data"),
            show_display: true,
            use_frames: false,
            num_frames: 1,
            interval_ms: 0.0,
            use_custom_intervals: false,
            custom_intervals_ms: Vec::new(),
            use_position_list: false,
            positions: Vec::new(),
            use_channels: false,
            channel_group: "Channel".to_string(),
            channels: Vec::new(),
            use_slices: false,
            slice_z_bottom_um: 0.0,
            slice_z_top_um: 0.0,
            slice_z_step_um: 1.0,
            relative_z_slice: false,
            time_first: false,
            slices_first: true,
            keep_shutter_open_channels: false,
            keep_shutter_open_slices: false,
            use_autofocus: false,
            skip_autofocus_count: 0,
            focus_device: Some("Z".to_string()),
            xy_device: Some("XY".to_string()),
            pixel_size_um: 1.0,
            focus_limits: None,
            volume: VolumeSettings::default(),
        }
    }
}

impl SequenceSettings {
    /// Parse settings from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> MdaResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse settings from TOML text.
    pub fn from_toml_str(text: &str) -> MdaResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Nesting order selected by the order flags.
    #[must_use]
    pub fn order_mode(&self) -> AcqOrderMode {
        AcqOrderMode::from_flags(self.time_first, self.slices_first)
    }

    /// Number of timelapse frames (1 without a time axis).
    #[must_use]
    pub fn num_frames(&self) -> usize {
        if !self.use_frames {
            1
        } else if self.use_custom_intervals {
            self.custom_intervals_ms.len()
        } else {
            self.num_frames
        }
    }

    /// Channels that take part in the acquisition, in order.
    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.channels
            .iter()
            .filter(move |c| self.use_channels && c.use_channel)
    }

    /// Timing rule of the time axis.
    #[must_use]
    pub fn time_step(&self) -> StepRule {
        if self.use_custom_intervals {
            StepRule::CustomIntervals {
                intervals_ms: self.custom_intervals_ms.clone(),
            }
        } else {
            StepRule::Interval {
                interval_ms: self.interval_ms,
            }
        }
    }

    /// Whether the slice axis takes its extent from a surface or cuboid.
    #[must_use]
    pub fn uses_volume(&self) -> bool {
        self.volume.mode.is_volume()
    }

    /// Declarative description of every axis in use.
    #[must_use]
    pub fn axis_specs(&self) -> Vec<AxisSpec> {
        let mut specs = Vec::new();
        if self.use_frames {
            specs.push(AxisSpec::counted(AxisKind::Time, self.num_frames()).with_step(self.time_step()));
        }
        if self.use_position_list {
            specs.push(AxisSpec::counted(AxisKind::Position, self.positions.len()));
        }
        if self.use_channels {
            let skips: Vec<u32> = self.enabled_channels().map(|c| c.skip_frames).collect();
            specs.push(
                AxisSpec::counted(AxisKind::Channel, skips.len())
                    .with_step(StepRule::SkipFactor { skip_frames: skips }),
            );
        }
        if self.uses_volume() {
            specs.push(AxisSpec {
                kind: AxisKind::Slice,
                bounds: AxisBounds::UntilOutOfVolume {
                    step_um: self.volume.z_step_um,
                },
                step: StepRule::Unit,
            });
        } else if self.volume.mode == SpaceMode::None && self.use_slices {
            specs.push(AxisSpec {
                kind: AxisKind::Slice,
                bounds: AxisBounds::Range {
                    start_um: self.slice_z_bottom_um,
                    stop_um: self.slice_z_top_um,
                    step_um: self.slice_z_step_um,
                },
                step: StepRule::Unit,
            });
        }
        specs
    }

    /// Check the settings for errors that would make the run meaningless.
    ///
    /// Surfaces are only checked for presence here; fitting them happens when
    /// the event pipeline is built.
    pub fn validate(&self) -> MdaResult<()> {
        if self.use_frames {
            if !self.interval_ms.is_finite() || self.interval_ms < 0.0 {
                return Err(MdaError::Configuration(format!(
                    "interval_ms must be a non-negative number, got {}",
                    self.interval_ms
                )));
            }
            if self.use_custom_intervals
                && self
                    .custom_intervals_ms
                    .iter()
                    .any(|i| !i.is_finite() || *i < 0.0)
            {
                return Err(MdaError::Configuration(
                    "custom intervals must be non-negative numbers".to_string(),
                ));
            }
            let span_ms = self
                .time_step()
                .frame_offset_ms(self.num_frames().saturating_sub(1));
            if span_ms > MAX_TIMELAPSE_SPAN_MS {
                return Err(MdaError::Configuration(format!(
                    "timelapse spans {} ms, more than the {} ms limit",
                    span_ms, MAX_TIMELAPSE_SPAN_MS
                )));
            }
        }

        if self.use_position_list && self.positions.is_empty() {
            return Err(MdaError::Configuration(
                "use_position_list is set but the position list is empty".to_string(),
            ));
        }

        for channel in self.enabled_channels() {
            if !channel.exposure_ms.is_finite() || channel.exposure_ms <= 0.0 {
                return Err(MdaError::Configuration(format!(
                    "channel '{}' has invalid exposure {} ms",
                    channel.config, channel.exposure_ms
                )));
            }
            if !channel.z_offset_um.is_finite() {
                return Err(MdaError::Configuration(format!(
                    "channel '{}' has a non-finite z offset",
                    channel.config
                )));
            }
        }

        if let Some(limits) = &self.focus_limits {
            if limits.lower_um > limits.upper_um {
                return Err(MdaError::Configuration(format!(
                    "focus limits are inverted: {} > {}",
                    limits.lower_um, limits.upper_um
                )));
            }
        }

        let volume = &self.volume;
        match volume.mode {
            SpaceMode::None => {
                if self.use_slices {
                    if self.focus_device.is_none() {
                        return Err(MdaError::Configuration(
                            "a Z stack needs a focus device".to_string(),
                        ));
                    }
                    slice_count(
                        self.slice_z_bottom_um,
                        self.slice_z_top_um,
                        self.slice_z_step_um,
                    )?;
                }
                return Ok(());
            }
            SpaceMode::Cuboid => {
                if volume.cuboid_z_start_um > volume.cuboid_z_end_um {
                    return Err(MdaError::Configuration(format!(
                        "cuboid start {} is greater than its end {}",
                        volume.cuboid_z_start_um, volume.cuboid_z_end_um
                    )));
                }
            }
            SpaceMode::FixedDistanceFromSurface => {
                volume.require_surface("fixed_surface", volume.fixed_surface.as_ref())?;
                if volume.distance_above_surface_um < 0.0 || volume.distance_below_surface_um < 0.0
                {
                    return Err(MdaError::Configuration(
                        "surface distances must be non-negative".to_string(),
                    ));
                }
            }
            SpaceMode::VolumeBetweenSurfaces => {
                volume.require_surface("top_surface", volume.top_surface.as_ref())?;
                volume.require_surface("bottom_surface", volume.bottom_surface.as_ref())?;
            }
            SpaceMode::Region2D => {}
            SpaceMode::Region2DSurfaceGuided => {
                volume.require_surface("collection_plane", volume.collection_plane.as_ref())?;
            }
        }

        if volume.mode.is_volume() {
            if volume.z_step_um == 0.0 {
                return Err(MdaError::ZeroSliceStep);
            }
            if !volume.z_step_um.is_finite() || volume.z_step_um < 0.0 {
                return Err(MdaError::Configuration(format!(
                    "z_step_um must be positive, got {}",
                    volume.z_step_um
                )));
            }
        }
        if volume.mode != SpaceMode::Region2D && self.focus_device.is_none() {
            return Err(MdaError::Configuration(format!(
                "{} mode needs a focus device",
                volume.mode
            )));
        }
        if let Footprint::Surface { name } = &volume.footprint {
            if volume.surface(name).is_none() {
                return Err(MdaError::InvalidSurface {
                    name: name.clone(),
                    reason: "footprint surface is not defined".to_string(),
                });
            }
        }
        if !(0.0..100.0).contains(&volume.tile_overlap_percent) {
            return Err(MdaError::Configuration(format!(
                "tile overlap must be in [0, 100), got {}",
                volume.tile_overlap_percent
            )));
        }
        if !self.pixel_size_um.is_finite() || self.pixel_size_um <= 0.0 {
            return Err(MdaError::Configuration(format!(
                "pixel_size_um must be positive, got {}",
                self.pixel_size_um
            )));
        }
        Ok(())
    }
}
