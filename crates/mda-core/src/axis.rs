//! Acquisition axes.
//!
//! Every acquisition is a walk over up to four dimensions. [`AxisSpec`]
//! describes one dimension declaratively (how many indices, how they step),
//! [`AxisCoords`] is the point an event occupies in that space.

use crate::error::{MdaError, MdaResult};
use crate::limits::{MAX_SLICES_PER_STACK, SLICE_COUNT_EPSILON};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One acquisition dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    /// Timelapse frame.
    Time,
    /// Stage position.
    Position,
    /// Channel preset.
    Channel,
    /// Z slice.
    Slice,
}

impl AxisKind {
    /// All axes in canonical order.
    pub const ALL: [AxisKind; 4] = [
        AxisKind::Time,
        AxisKind::Position,
        AxisKind::Channel,
        AxisKind::Slice,
    ];

    /// Capitalised label used in summaries.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AxisKind::Time => "Time",
            AxisKind::Position => "Position",
            AxisKind::Channel => "Channel",
            AxisKind::Slice => "Slice",
        }
    }
}

impl std::fmt::Display for AxisKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AxisKind::Time => "time",
            AxisKind::Position => "position",
            AxisKind::Channel => "channel",
            AxisKind::Slice => "slice",
        };
        write!(f, "{}", label)
    }
}

/// Index of an event along each axis it has been expanded over.
///
/// Axes that are not part of the acquisition are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisCoords(BTreeMap<AxisKind, i64>);

impl AxisCoords {
    /// Empty coordinates.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Index along `kind`, if the event has been expanded over it.
    #[must_use]
    pub fn get(&self, kind: AxisKind) -> Option<i64> {
        self.0.get(&kind).copied()
    }

    /// Set the index along `kind`.
    pub fn set(&mut self, kind: AxisKind, index: i64) {
        self.0.insert(kind, index);
    }

    /// Builder form of [`AxisCoords::set`].
    #[must_use]
    pub fn with(mut self, kind: AxisKind, index: i64) -> Self {
        self.set(kind, index);
        self
    }

    /// Timelapse frame, `0` when the acquisition has no time axis.
    #[must_use]
    pub fn frame(&self) -> i64 {
        self.get(AxisKind::Time).unwrap_or(0)
    }

    /// Axes present, in canonical order.
    pub fn axes(&self) -> impl Iterator<Item = AxisKind> + '_ {
        self.0.keys().copied()
    }

    /// Number of axes present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no axis has been set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Axes whose index differs between `self` and `other`.
    ///
    /// An axis present on only one side counts as changed.
    #[must_use]
    pub fn changed_axes(&self, other: &AxisCoords) -> Vec<AxisKind> {
        AxisKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind) != other.get(*kind))
            .collect()
    }
}

impl std::fmt::Display for AxisCoords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for (kind, index) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", kind, index)?;
            first = false;
        }
        Ok(())
    }
}

/// How many indices an axis spans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AxisBounds {
    /// Fixed cardinality.
    Count {
        /// Number of indices.
        count: usize,
    },
    /// Slice count derived from a Z range.
    Range {
        /// First Z position in µm.
        start_um: f64,
        /// Last Z position in µm, inclusive.
        stop_um: f64,
        /// Step in µm; the sign is ignored.
        step_um: f64,
    },
    /// Slices continue until the candidate Z leaves the imaging volume.
    /// The count depends on the position and is only known per position.
    UntilOutOfVolume {
        /// Step in µm along the focus direction.
        step_um: f64,
    },
}

/// How successive indices along an axis are spaced or subsampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StepRule {
    /// Consecutive indices, no timing or subsampling.
    Unit,
    /// Frames start `interval_ms` apart.
    Interval {
        /// Interval between frame starts.
        interval_ms: f64,
    },
    /// Frame `i` starts at the sum of the first `i + 1` intervals.
    CustomIntervals {
        /// Per-frame intervals.
        intervals_ms: Vec<f64>,
    },
    /// Per-index skip factors: index `i` is only acquired on frames that are a
    /// multiple of `skip_frames[i] + 1`.
    SkipFactor {
        /// Skip factor per index.
        skip_frames: Vec<u32>,
    },
}

impl StepRule {
    /// Earliest start of `frame` relative to the start of the run, in ms.
    #[must_use]
    pub fn frame_offset_ms(&self, frame: usize) -> f64 {
        match self {
            StepRule::Interval { interval_ms } => *interval_ms * frame as f64,
            StepRule::CustomIntervals { intervals_ms } => {
                intervals_ms.iter().take(frame + 1).sum()
            }
            StepRule::Unit | StepRule::SkipFactor { .. } => 0.0,
        }
    }

    /// Whether index `index` is acquired on `frame`.
    #[must_use]
    pub fn is_acquired(&self, index: usize, frame: i64) -> bool {
        match self {
            StepRule::SkipFactor { skip_frames } => skip_frames
                .get(index)
                .map_or(true, |skip| frame % (i64::from(*skip) + 1) == 0),
            _ => true,
        }
    }
}

/// Declarative description of one acquisition dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisSpec {
    /// Dimension described.
    pub kind: AxisKind,
    /// Cardinality rule.
    pub bounds: AxisBounds,
    /// Spacing or subsampling rule.
    pub step: StepRule,
}

impl AxisSpec {
    /// Axis with a fixed number of consecutive indices.
    #[must_use]
    pub fn counted(kind: AxisKind, count: usize) -> Self {
        Self {
            kind,
            bounds: AxisBounds::Count { count },
            step: StepRule::Unit,
        }
    }

    /// Replace the step rule.
    #[must_use]
    pub fn with_step(mut self, step: StepRule) -> Self {
        self.step = step;
        self
    }

    /// Position-independent number of indices.
    ///
    /// Returns `None` for axes whose extent depends on the stage position.
    /// A zero step on a bounded range is an error.
    pub fn count(&self) -> MdaResult<Option<usize>> {
        match &self.bounds {
            AxisBounds::Count { count } => Ok(Some(*count)),
            AxisBounds::Range {
                start_um,
                stop_um,
                step_um,
            } => slice_count(*start_um, *stop_um, *step_um).map(Some),
            AxisBounds::UntilOutOfVolume { step_um } => {
                if *step_um == 0.0 {
                    return Err(MdaError::ZeroSliceStep);
                }
                Ok(None)
            }
        }
    }
}

/// Number of slices in the inclusive range `[start, stop]` walked with `|step|`.
pub fn slice_count(start_um: f64, stop_um: f64, step_um: f64) -> MdaResult<usize> {
    if !start_um.is_finite() || !stop_um.is_finite() || !step_um.is_finite() {
        return Err(MdaError::Configuration(
            "slice range and step must be finite".to_string(),
        ));
    }
    if step_um == 0.0 {
        return Err(MdaError::ZeroSliceStep);
    }
    let steps = ((stop_um - start_um).abs() / step_um.abs() + SLICE_COUNT_EPSILON).floor();
    if steps >= MAX_SLICES_PER_STACK as f64 {
        return Err(MdaError::Configuration(format!(
            "slice range yields more than {} slices",
            MAX_SLICES_PER_STACK
        )));
    }
    Ok(steps as usize + 1)
}

/// Explicit Z positions of a simple stack, from `start` toward `stop`.
pub fn slice_positions(start_um: f64, stop_um: f64, step_um: f64) -> MdaResult<Vec<f64>> {
    let count = slice_count(start_um, stop_um, step_um)?;
    let signed = if stop_um >= start_um {
        step_um.abs()
    } else {
        -step_um.abs()
    };
    Ok((0..count).map(|i| start_um + i as f64 * signed).collect())
}
