//! Generator stages.
//!
//! Each stage refines one axis: it takes an event from the stage before it
//! and lazily yields copies with its own axis index (and the physical
//! parameters that go with it) filled in. Stages never block and never touch
//! hardware; timing is only recorded on the event for the runner to honour.

use crate::surface::Surface;
use crate::volume::{TileFootprint, VolumeBoundsPolicy};
use mda_core::axis::{AxisKind, AxisSpec, StepRule};
use mda_core::error::MdaResult;
use mda_core::event::{AcquisitionEvent, ChannelSetting, StagePosition};
use mda_core::settings::ChannelSpec;
use std::sync::Arc;

/// Lazy stream of events.
pub type EventIter = Box<dyn Iterator<Item = AcquisitionEvent> + Send>;

/// Lazy stream of `(slice index, z)`.
pub type PlaneIter = Box<dyn Iterator<Item = (i64, f64)> + Send>;

/// One level of the nested acquisition loop.
pub trait EventStage: Send + Sync {
    /// Axis this stage indexes.
    fn axis(&self) -> AxisKind;

    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Refine `event` into the events of this stage.
    fn expand(&self, event: AcquisitionEvent) -> EventIter;
}

/// `frames` copies of the event with the time index set.
#[derive(Debug, Clone)]
pub struct TimelapseStage {
    frames: usize,
    step: StepRule,
}

impl TimelapseStage {
    /// Stage over `frames` time points spaced by `step`.
    #[must_use]
    pub fn new(frames: usize, step: StepRule) -> Self {
        Self { frames, step }
    }

    /// Stage for a time axis description.
    pub fn from_spec(spec: &AxisSpec) -> MdaResult<Self> {
        let frames = spec.count()?.unwrap_or(0);
        Ok(Self::new(frames, spec.step.clone()))
    }
}

impl EventStage for TimelapseStage {
    fn axis(&self) -> AxisKind {
        AxisKind::Time
    }

    fn name(&self) -> &'static str {
        "timelapse"
    }

    fn expand(&self, event: AcquisitionEvent) -> EventIter {
        let step = self.step.clone();
        Box::new((0..self.frames).map(move |frame| {
            let mut next = event.with_axis(AxisKind::Time, frame as i64);
            next.min_start_ms = Some(step.frame_offset_ms(frame));
            next
        }))
    }
}

/// One event per stage position, in list order.
#[derive(Debug, Clone)]
pub struct PositionStage {
    positions: Arc<[StagePosition]>,
}

impl PositionStage {
    /// Stage visiting `positions`.
    #[must_use]
    pub fn new(positions: Arc<[StagePosition]>) -> Self {
        Self { positions }
    }
}

impl EventStage for PositionStage {
    fn axis(&self) -> AxisKind {
        AxisKind::Position
    }

    fn name(&self) -> &'static str {
        "positions"
    }

    fn expand(&self, event: AcquisitionEvent) -> EventIter {
        let positions = Arc::clone(&self.positions);
        Box::new((0..positions.len()).map(move |i| {
            let mut next = event.with_axis(AxisKind::Position, i as i64);
            next.xy = Some(positions[i].clone());
            next
        }))
    }
}

/// One event per enabled channel, honouring skip factors.
///
/// A channel with skip factor `k` is left out of frames that are not a
/// multiple of `k + 1`; nothing is emitted in its place.
#[derive(Debug, Clone)]
pub struct ChannelStage {
    group: String,
    channels: Arc<[ChannelSpec]>,
    skip: StepRule,
}

impl ChannelStage {
    /// Stage over the enabled `channels` of configuration `group`, skipping
    /// frames by each channel's own skip factor.
    #[must_use]
    pub fn new(group: impl Into<String>, channels: Arc<[ChannelSpec]>) -> Self {
        let skip = StepRule::SkipFactor {
            skip_frames: channels.iter().map(|c| c.skip_frames).collect(),
        };
        Self {
            group: group.into(),
            channels,
            skip,
        }
    }

    /// Stage whose frame subsampling follows the channel axis description.
    #[must_use]
    pub fn from_spec(
        group: impl Into<String>,
        channels: Arc<[ChannelSpec]>,
        spec: &AxisSpec,
    ) -> Self {
        Self {
            group: group.into(),
            channels,
            skip: spec.step.clone(),
        }
    }

    fn acquired(
        skip: &StepRule,
        index: usize,
        channel: &ChannelSpec,
        event: &AcquisitionEvent,
    ) -> bool {
        if !skip.is_acquired(index, event.frame()) {
            return false;
        }
        // single-plane channels fire only on the first slice of a stack
        channel.do_z_stack || event.axis(AxisKind::Slice).is_none() || event.stack_start
    }
}

impl EventStage for ChannelStage {
    fn axis(&self) -> AxisKind {
        AxisKind::Channel
    }

    fn name(&self) -> &'static str {
        "channels"
    }

    fn expand(&self, event: AcquisitionEvent) -> EventIter {
        let channels = Arc::clone(&self.channels);
        let group = self.group.clone();
        let skip = self.skip.clone();
        Box::new((0..channels.len()).filter_map(move |i| {
            let spec = &channels[i];
            if !Self::acquired(&skip, i, spec, &event) {
                return None;
            }
            let mut next = event.with_axis(AxisKind::Channel, i as i64);
            next.channel = Some(ChannelSetting {
                group: group.clone(),
                config: spec.config.clone(),
                exposure_ms: spec.exposure_ms,
                z_offset_um: spec.z_offset_um,
            });
            Some(next)
        }))
    }
}

/// Where the slices of a stack come from.
#[derive(Debug, Clone)]
pub enum SliceSource {
    /// Fixed list of focus positions, identical at every position.
    Range {
        /// Absolute Z of each slice.
        z_um: Arc<[f64]>,
    },
    /// Slices bounded by a volume, recomputed for every tile.
    Volume {
        /// Bounds of the imaging volume.
        policy: Arc<VolumeBoundsPolicy>,
        /// Half the field of view along X, µm.
        half_width_um: f64,
        /// Half the field of view along Y, µm.
        half_height_um: f64,
    },
    /// One plane per tile, Z taken from a surface.
    SurfacePlane {
        /// Surface supplying Z.
        surface: Arc<Surface>,
    },
}

/// Z-stack stage.
///
/// Z is added to any Z already on the event. The first slice yielded for an
/// input event is marked `stack_start`; channels with `do_z_stack = false`
/// that have already been chosen by an outer stage only get that slice.
#[derive(Debug, Clone)]
pub struct SliceStage {
    source: SliceSource,
    single_plane_channels: Arc<[bool]>,
    fallback_xy: (f64, f64),
}

impl SliceStage {
    /// Stage over `source`.
    ///
    /// `single_plane_channels[i]` is true when enabled channel `i` is imaged
    /// once per stack. `fallback_xy` locates the stack for events that carry
    /// no stage position.
    #[must_use]
    pub fn new(source: SliceSource, single_plane_channels: Arc<[bool]>, fallback_xy: (f64, f64)) -> Self {
        Self {
            source,
            single_plane_channels,
            fallback_xy,
        }
    }

    /// Slice source.
    #[must_use]
    pub fn source(&self) -> &SliceSource {
        &self.source
    }

    /// Slices of the stack at `xy`.
    #[must_use]
    pub fn planes(&self, xy: Option<&StagePosition>) -> PlaneIter {
        let center = xy.map_or(self.fallback_xy, |p| (p.x_um, p.y_um));
        match &self.source {
            SliceSource::Range { z_um } => {
                let z_um = Arc::clone(z_um);
                Box::new((0..z_um.len()).map(move |k| (k as i64, z_um[k])))
            }
            SliceSource::Volume {
                policy,
                half_width_um,
                half_height_um,
            } => Box::new(policy.walk(TileFootprint {
                center,
                half_width_um: *half_width_um,
                half_height_um: *half_height_um,
            })),
            SliceSource::SurfacePlane { surface } => {
                let (x, y) = center;
                let z = surface
                    .interpolate(x, y)
                    .unwrap_or_else(|| surface.extrapolate(x, y));
                Box::new(std::iter::once((0, z)))
            }
        }
    }

    /// Number of slices of the stack at `xy`.
    #[must_use]
    pub fn count_at(&self, xy: Option<&StagePosition>) -> usize {
        self.planes(xy).count()
    }

    fn single_plane(&self, event: &AcquisitionEvent) -> bool {
        event
            .axis(AxisKind::Channel)
            .and_then(|c| usize::try_from(c).ok())
            .and_then(|c| self.single_plane_channels.get(c).copied())
            .unwrap_or(false)
    }
}

impl EventStage for SliceStage {
    fn axis(&self) -> AxisKind {
        AxisKind::Slice
    }

    fn name(&self) -> &'static str {
        match self.source {
            SliceSource::Range { .. } => "z_stack",
            SliceSource::Volume { .. } => "volume_z_stack",
            SliceSource::SurfacePlane { .. } => "surface_plane",
        }
    }

    fn expand(&self, event: AcquisitionEvent) -> EventIter {
        let limit = if self.single_plane(&event) { 1 } else { usize::MAX };
        let planes = self.planes(event.xy.as_ref());
        let base_z = event.z_um.unwrap_or(0.0);
        Box::new(planes.take(limit).enumerate().map(move |(n, (k, z))| {
            let mut next = event.with_axis(AxisKind::Slice, k);
            next.z_um = Some(base_z + z);
            next.stack_start = n == 0;
            next
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(stage: &dyn EventStage, event: AcquisitionEvent) -> Vec<AcquisitionEvent> {
        stage.expand(event).collect()
    }

    #[test]
    fn test_timelapse_records_start_offsets() {
        let stage = TimelapseStage::new(3, StepRule::Interval { interval_ms: 250.0 });
        let events = collect(&stage, AcquisitionEvent::root());
        let offsets: Vec<_> = events.iter().map(|e| e.min_start_ms).collect();
        assert_eq!(offsets, vec![Some(0.0), Some(250.0), Some(500.0)]);
        assert_eq!(events[2].frame(), 2);
    }

    #[test]
    fn test_position_stage_sets_xy() {
        let stage = PositionStage::new(Arc::from(vec![
            StagePosition::new("A", 1.0, 2.0),
            StagePosition::new("B", 3.0, 4.0),
        ]));
        let events = collect(&stage, AcquisitionEvent::root());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].axis(AxisKind::Position), Some(1));
        assert_eq!(events[1].xy.as_ref().map(|p| p.label.as_str()), Some("B"));
    }

    #[test]
    fn test_channel_skip_factor() {
        let stage = ChannelStage::new(
            "Channel",
            Arc::from(vec![
                ChannelSpec::new("DAPI", 10.0),
                ChannelSpec {
                    skip_frames: 2,
                    ..ChannelSpec::new("FITC", 20.0)
                },
            ]),
        );
        for frame in 0..7 {
            let events = collect(&stage, AcquisitionEvent::root().with_axis(AxisKind::Time, frame));
            let expected = if frame % 3 == 0 { 2 } else { 1 };
            assert_eq!(events.len(), expected, "frame {}", frame);
        }
        let events = collect(&stage, AcquisitionEvent::root());
        let fitc = &events[1];
        assert_eq!(fitc.axis(AxisKind::Channel), Some(1));
        assert_eq!(fitc.exposure_ms(), Some(20.0));
    }

    #[test]
    fn test_range_stack_adds_to_existing_z() {
        let stage = SliceStage::new(
            SliceSource::Range {
                z_um: Arc::from(vec![0.0, 5.0]),
            },
            Arc::from(Vec::new()),
            (0.0, 0.0),
        );
        let mut root = AcquisitionEvent::root();
        root.z_um = Some(1.0);
        let events = collect(&stage, root);
        let z: Vec<_> = events.iter().map(|e| e.z_um).collect();
        assert_eq!(z, vec![Some(1.0), Some(6.0)]);
        assert!(events[0].stack_start);
        assert!(!events[1].stack_start);
    }

    #[test]
    fn test_single_plane_channel_gets_first_slice_only() {
        let stage = SliceStage::new(
            SliceSource::Range {
                z_um: Arc::from(vec![0.0, 1.0, 2.0]),
            },
            Arc::from(vec![false, true]),
            (0.0, 0.0),
        );
        let stacked = AcquisitionEvent::root().with_axis(AxisKind::Channel, 0);
        let single = AcquisitionEvent::root().with_axis(AxisKind::Channel, 1);
        assert_eq!(collect(&stage, stacked).len(), 3);
        assert_eq!(collect(&stage, single).len(), 1);
    }

    #[test]
    fn test_channel_inside_stack_skips_single_plane_channels() {
        let stage = ChannelStage::new(
            "Channel",
            Arc::from(vec![
                ChannelSpec::new("DAPI", 10.0),
                ChannelSpec {
                    do_z_stack: false,
                    ..ChannelSpec::new("BF", 5.0)
                },
            ]),
        );
        let mut first = AcquisitionEvent::root().with_axis(AxisKind::Slice, 0);
        first.stack_start = true;
        let mut later = AcquisitionEvent::root().with_axis(AxisKind::Slice, 1);
        later.stack_start = false;
        assert_eq!(collect(&stage, first).len(), 2);
        assert_eq!(collect(&stage, later).len(), 1);
    }
}
