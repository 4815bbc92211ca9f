//! Acquisition plans.
//!
//! [`AcquisitionPlan::build`] turns a settings snapshot plus the few values
//! read from the hardware at run start ([`HardwareContext`]) into the stage
//! list of the event pipeline. All configuration errors surface here, before
//! any device is moved. The plan can then generate its event stream any
//! number of times; every generation is identical.

use crate::pipeline::{AutofocusMarks, EventPipeline, KeepShutterOpen, SliceIndexMonitor};
use crate::stages::{
    ChannelStage, EventIter, EventStage, PositionStage, SliceSource, SliceStage, TimelapseStage,
};
use crate::volume::{named_surface, FocusDirection, VolumeBoundsPolicy};
use mda_core::axis::{slice_positions, AxisBounds, AxisKind};
use mda_core::capabilities::{ImageGeometry, MicroscopeCore};
use mda_core::error::{MdaError, MdaResult};
use mda_core::event::{AcquisitionEvent, StagePosition};
use mda_core::limits::validate_frame_size;
use mda_core::settings::{AcqOrderMode, ChannelSpec, Footprint, SequenceSettings, SpaceMode};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Values read from the microscope once, at the top of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HardwareContext {
    /// Direction of the focus drive toward the sample.
    pub focus_direction: FocusDirection,
    /// Focus position when the run started, µm.
    pub z_reference_um: f64,
    /// XY stage position when the run started, µm.
    pub xy_reference_um: (f64, f64),
    /// Camera geometry.
    pub geometry: ImageGeometry,
    /// Camera exposure when the run started, ms.
    pub exposure_ms: f64,
}

impl HardwareContext {
    /// Context for planning without a microscope: stage at the origin,
    /// focus moving toward the sample with increasing Z.
    #[must_use]
    pub fn nominal(geometry: ImageGeometry) -> Self {
        Self {
            focus_direction: FocusDirection::Positive,
            z_reference_um: 0.0,
            xy_reference_um: (0.0, 0.0),
            geometry,
            exposure_ms: 10.0,
        }
    }

    /// Read the context from `core`.
    ///
    /// The focus direction is only queried for surface-relative volumes, and
    /// an undefined direction is a configuration error.
    #[instrument(skip_all, err)]
    pub async fn probe(core: &dyn MicroscopeCore, settings: &SequenceSettings) -> MdaResult<Self> {
        let needs_direction = matches!(
            settings.volume.mode,
            SpaceMode::FixedDistanceFromSurface | SpaceMode::VolumeBetweenSurfaces
        );

        let mut context = Self::nominal(core.image_geometry());
        if let Some(focus) = &settings.focus_device {
            if needs_direction {
                let raw = core
                    .focus_direction(focus)
                    .await
                    .map_err(|e| MdaError::hardware("read focus direction", &e))?;
                context.focus_direction = FocusDirection::from_raw(focus, raw)?;
            }
            context.z_reference_um = core
                .position(focus)
                .await
                .map_err(|e| MdaError::hardware("read focus position", &e))?;
        }
        if let Some(xy) = &settings.xy_device {
            context.xy_reference_um = core
                .xy_position(xy)
                .await
                .map_err(|e| MdaError::hardware("read XY position", &e))?;
        }
        context.exposure_ms = core
            .exposure()
            .await
            .map_err(|e| MdaError::hardware("read exposure", &e))?;

        debug!(?context, "hardware context");
        Ok(context)
    }
}

/// Everything needed to generate the events of one run.
pub struct AcquisitionPlan {
    settings: Arc<SequenceSettings>,
    context: HardwareContext,
    pipeline: EventPipeline,
    root: AcquisitionEvent,
    channels: Arc<[ChannelSpec]>,
    positions: Option<Arc<[StagePosition]>>,
    slice_stage: Option<Arc<SliceStage>>,
    overlap_px: Option<(u32, u32)>,
    bytes_per_image: u64,
    display_origin_um: f64,
    display_step_um: f64,
    monitor: Arc<SliceIndexMonitor>,
}

impl AcquisitionPlan {
    /// Validate `settings` and build the stage list.
    #[instrument(skip_all, fields(name = %settings.name, mode = %settings.volume.mode), err)]
    pub fn build(settings: Arc<SequenceSettings>, context: HardwareContext) -> MdaResult<Self> {
        settings.validate()?;
        let bytes_per_image = validate_frame_size(&context.geometry)?;

        let channels: Arc<[ChannelSpec]> = settings.enabled_channels().cloned().collect();
        let single_plane: Arc<[bool]> = channels.iter().map(|c| !c.do_z_stack).collect();

        let (positions, overlap_px) = if settings.volume.mode.is_region() {
            if settings.use_position_list {
                warn!("position list is ignored; positions come from the region footprint");
            }
            let (tiles, overlap) = tile_positions(&settings, &context)?;
            (Some(tiles), Some(overlap))
        } else if settings.use_position_list {
            (Some(Arc::from(settings.positions.clone())), None)
        } else {
            (None, None)
        };

        let specs = settings.axis_specs();
        let spec_of = |kind: AxisKind| specs.iter().find(|s| s.kind == kind);

        let fallback_xy = context.xy_reference_um;
        let mut display_origin_um = context.z_reference_um;
        let mut display_step_um = 1.0;
        let source = match settings.volume.mode {
            SpaceMode::None if settings.use_slices => {
                let Some(AxisBounds::Range {
                    start_um,
                    stop_um,
                    step_um,
                }) = spec_of(AxisKind::Slice).map(|s| &s.bounds)
                else {
                    return Err(MdaError::Configuration(
                        "Z stack requires a slice range".into(),
                    ));
                };
                let offset = if settings.relative_z_slice {
                    context.z_reference_um
                } else {
                    0.0
                };
                let z: Vec<f64> = slice_positions(*start_um, *stop_um, *step_um)?
                    .into_iter()
                    .map(|z| z + offset)
                    .collect();
                display_origin_um = start_um + offset;
                display_step_um = if stop_um >= start_um {
                    step_um.abs()
                } else {
                    -step_um.abs()
                };
                Some(SliceSource::Range { z_um: Arc::from(z) })
            }
            SpaceMode::Cuboid
            | SpaceMode::FixedDistanceFromSurface
            | SpaceMode::VolumeBetweenSurfaces => {
                if let Some(spec) = spec_of(AxisKind::Slice) {
                    spec.count()?;
                }
                let policy = VolumeBoundsPolicy::from_settings(&settings, context.focus_direction)?;
                display_origin_um = policy.z_origin();
                display_step_um = policy.signed_step();
                let (half_width_um, half_height_um) = half_field(&settings, &context);
                Some(SliceSource::Volume {
                    policy: Arc::new(policy),
                    half_width_um,
                    half_height_um,
                })
            }
            SpaceMode::Region2DSurfaceGuided => {
                let name = settings.volume.collection_plane.as_deref().ok_or_else(|| {
                    MdaError::Configuration("surface-guided mode requires `collection_plane`".into())
                })?;
                Some(SliceSource::SurfacePlane {
                    surface: named_surface(&settings.volume, name)?,
                })
            }
            SpaceMode::None | SpaceMode::Region2D => None,
        };
        let slice_stage =
            source.map(|s| Arc::new(SliceStage::new(s, Arc::clone(&single_plane), fallback_xy)));

        let mut stages: Vec<Arc<dyn EventStage>> = Vec::with_capacity(4);
        for axis in settings.order_mode().axis_order() {
            match axis {
                AxisKind::Time => {
                    if let Some(spec) = spec_of(AxisKind::Time) {
                        stages.push(Arc::new(TimelapseStage::from_spec(spec)?));
                    }
                }
                AxisKind::Position => {
                    if let Some(p) = &positions {
                        stages.push(Arc::new(PositionStage::new(Arc::clone(p))));
                    }
                }
                AxisKind::Channel => {
                    if let Some(spec) = spec_of(AxisKind::Channel) {
                        stages.push(Arc::new(ChannelStage::from_spec(
                            settings.channel_group.clone(),
                            Arc::clone(&channels),
                            spec,
                        )));
                    }
                }
                AxisKind::Slice => {
                    if let Some(s) = &slice_stage {
                        stages.push(Arc::clone(s) as Arc<dyn EventStage>);
                    }
                }
            }
        }

        let mut root = AcquisitionEvent::root();
        // channel offsets still apply when no stack positions the focus
        if slice_stage.is_none()
            && settings.focus_device.is_some()
            && channels.iter().any(|c| c.z_offset_um != 0.0)
        {
            root.z_um = Some(context.z_reference_um);
        }

        let pipeline = EventPipeline::new(stages);
        debug!(?pipeline, "plan built");

        Ok(Self {
            settings,
            context,
            pipeline,
            root,
            channels,
            positions,
            slice_stage,
            overlap_px,
            bytes_per_image,
            display_origin_um,
            display_step_um,
            monitor: Arc::new(SliceIndexMonitor::new()),
        })
    }

    /// Fresh event stream with shutter and autofocus policies applied.
    #[must_use]
    pub fn events(&self) -> EventIter {
        let settings = &self.settings;
        let mut iter = self.pipeline.events(self.root.clone());

        let mut keep = Vec::new();
        if settings.keep_shutter_open_channels {
            keep.push(AxisKind::Channel);
        }
        if settings.keep_shutter_open_slices {
            keep.push(AxisKind::Slice);
        }
        if !keep.is_empty() {
            iter = Box::new(KeepShutterOpen::new(iter, keep));
        }
        if settings.use_autofocus {
            iter = Box::new(AutofocusMarks::new(iter, settings.skip_autofocus_count));
        }

        let monitor = Arc::clone(&self.monitor);
        Box::new(iter.inspect(move |event| monitor.observe(event)))
    }

    /// Settings snapshot the plan was built from.
    #[must_use]
    pub fn settings(&self) -> &Arc<SequenceSettings> {
        &self.settings
    }

    /// Hardware context the plan was built with.
    #[must_use]
    pub fn context(&self) -> &HardwareContext {
        &self.context
    }

    /// Nesting order selected by the settings.
    #[must_use]
    pub fn order_mode(&self) -> AcqOrderMode {
        self.settings.order_mode()
    }

    /// Axes actually iterated, outermost first.
    #[must_use]
    pub fn axis_order(&self) -> Vec<AxisKind> {
        self.pipeline.axis_order()
    }

    /// Enabled channels, in acquisition order.
    #[must_use]
    pub fn channels(&self) -> &[ChannelSpec] {
        &self.channels
    }

    /// Positions of the position axis, if there is one.
    #[must_use]
    pub fn positions(&self) -> Option<&[StagePosition]> {
        self.positions.as_deref()
    }

    /// Slice stage, if there is one.
    #[must_use]
    pub fn slice_stage(&self) -> Option<&SliceStage> {
        self.slice_stage.as_deref()
    }

    /// Number of slices at `xy`; 1 without a slice axis.
    #[must_use]
    pub fn slices_at(&self, xy: Option<&StagePosition>) -> usize {
        self.slice_stage.as_ref().map_or(1, |s| s.count_at(xy))
    }

    /// Slice positions of the stack at the first position.
    #[must_use]
    pub fn calculate_slices(&self) -> Vec<f64> {
        let first = self.positions.as_ref().and_then(|p| p.first());
        self.slice_stage
            .as_ref()
            .map(|s| s.planes(first).map(|(_, z)| z).collect())
            .unwrap_or_default()
    }

    /// Tile overlap in pixels, for region modes.
    #[must_use]
    pub fn overlap_px(&self) -> Option<(u32, u32)> {
        self.overlap_px
    }

    /// Bytes of one image.
    #[must_use]
    pub fn bytes_per_image(&self) -> u64 {
        self.bytes_per_image
    }

    /// Slice indices seen so far by generated streams.
    #[must_use]
    pub fn slice_monitor(&self) -> &Arc<SliceIndexMonitor> {
        &self.monitor
    }

    /// Focus position shown at display slice `index`.
    ///
    /// Display indices start at the smallest slice index generated so far.
    #[must_use]
    pub fn z_of_display_index(&self, index: i64) -> f64 {
        self.display_origin_um + self.display_step_um * (index + self.monitor.min()) as f64
    }

    /// Display slice index nearest to `z_um`.
    #[must_use]
    pub fn display_index_of_z(&self, z_um: f64) -> i64 {
        ((z_um - self.display_origin_um) / self.display_step_um).round() as i64 - self.monitor.min()
    }
}

impl std::fmt::Debug for AcquisitionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionPlan")
            .field("name", &self.settings.name)
            .field("pipeline", &self.pipeline)
            .field("positions", &self.positions.as_ref().map(|p| p.len()))
            .finish()
    }
}

/// Half the field of view in µm.
fn half_field(settings: &SequenceSettings, context: &HardwareContext) -> (f64, f64) {
    (
        f64::from(context.geometry.width) * settings.pixel_size_um / 2.0,
        f64::from(context.geometry.height) * settings.pixel_size_um / 2.0,
    )
}

/// Tiles needed to cover `extent` with fields of `fov` spaced by `step`.
fn tiles_to_cover(extent: f64, fov: f64, step: f64) -> usize {
    if extent <= fov {
        1
    } else {
        ((extent - fov) / step).ceil() as usize + 1
    }
}

/// Row-major tile grid for the region footprint, plus the overlap in pixels.
fn tile_positions(
    settings: &SequenceSettings,
    context: &HardwareContext,
) -> MdaResult<(Arc<[StagePosition]>, (u32, u32))> {
    let geometry = &context.geometry;
    let pixel = settings.pixel_size_um;
    let overlap = settings.volume.tile_overlap_percent / 100.0;
    let fov_w = f64::from(geometry.width) * pixel;
    let fov_h = f64::from(geometry.height) * pixel;
    let step_x = fov_w * (1.0 - overlap);
    let step_y = fov_h * (1.0 - overlap);
    let overlap_px = (
        (f64::from(geometry.width) * overlap).round() as u32,
        (f64::from(geometry.height) * overlap).round() as u32,
    );

    let (rows, cols, center) = match &settings.volume.footprint {
        Footprint::CurrentPosition => (1, 1, context.xy_reference_um),
        Footprint::Grid {
            rows,
            cols,
            center_x_um,
            center_y_um,
        } => {
            if *rows == 0 || *cols == 0 {
                return Err(MdaError::Configuration(format!(
                    "tile grid must have at least one row and column, got {}x{}",
                    rows, cols
                )));
            }
            (*rows, *cols, (*center_x_um, *center_y_um))
        }
        Footprint::Surface { name } => {
            let extent = named_surface(&settings.volume, name)?.xy_extent();
            (
                tiles_to_cover(extent.height(), fov_h, step_y),
                tiles_to_cover(extent.width(), fov_w, step_x),
                extent.center(),
            )
        }
    };
    let count = rows.checked_mul(cols).ok_or(MdaError::SizeOverflow {
        context: "tile count",
    })?;

    let mut tiles = Vec::with_capacity(count);
    for row in 0..rows {
        for col in 0..cols {
            let x = center.0 + (col as f64 - (cols - 1) as f64 / 2.0) * step_x;
            let y = center.1 + (row as f64 - (rows - 1) as f64 / 2.0) * step_y;
            let mut tile = StagePosition::new(format!("Grid_{}_{}", row, col), x, y)
                .with_grid(row as i64, col as i64);
            tile.affine = Some([pixel, 0.0, x - fov_w / 2.0, 0.0, pixel, y - fov_h / 2.0]);
            tiles.push(tile);
        }
    }
    debug!(rows, cols, "tiled region footprint");
    Ok((Arc::from(tiles), overlap_px))
}
