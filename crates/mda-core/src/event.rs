//! Acquisition events.
//!
//! An [`AcquisitionEvent`] is created by the first generator stage, refined
//! by each later stage, consumed exactly once by the engine and dropped after
//! its image has been tagged.

use crate::axis::{AxisCoords, AxisKind};
use serde::{Deserialize, Serialize};

/// Immutable channel preset applied before an image is taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSetting {
    /// Configuration group (e.g. `"Channel"`).
    pub group: String,
    /// Preset within the group (e.g. `"DAPI"`).
    pub config: String,
    /// Camera exposure in ms.
    pub exposure_ms: f64,
    /// Offset added to the focus position for this channel, in µm.
    pub z_offset_um: f64,
}

/// XY stage position an event is taken at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    /// Label shown in metadata (e.g. `"Pos0"` or `"Grid_1_2"`).
    pub label: String,
    /// Absolute stage X in µm.
    pub x_um: f64,
    /// Absolute stage Y in µm.
    pub y_um: f64,
    /// Row in a tiling grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_row: Option<i64>,
    /// Column in a tiling grid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_col: Option<i64>,
    /// Pixel to stage affine transform `[a, b, tx, c, d, ty]` for this tile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affine: Option<[f64; 6]>,
}

impl StagePosition {
    /// Position at absolute stage coordinates.
    pub fn new(label: impl Into<String>, x_um: f64, y_um: f64) -> Self {
        Self {
            label: label.into(),
            x_um,
            y_um,
            grid_row: None,
            grid_col: None,
            affine: None,
        }
    }

    /// Attach grid indices.
    #[must_use]
    pub fn with_grid(mut self, row: i64, col: i64) -> Self {
        self.grid_row = Some(row);
        self.grid_col = Some(col);
        self
    }
}

/// Target of a stage move.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StageTarget {
    /// Absolute focus position in µm.
    Z(f64),
    /// Absolute XY position in µm.
    Xy {
        /// X in µm.
        x: f64,
        /// Y in µm.
        y: f64,
    },
}

/// One point of the acquisition plus the physical parameters for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionEvent {
    /// Index along every axis this event has been expanded over.
    pub coords: AxisCoords,
    /// Channel preset, when a channel axis is in use.
    pub channel: Option<ChannelSetting>,
    /// Absolute focus position in µm, before the channel offset.
    pub z_um: Option<f64>,
    /// XY stage position.
    pub xy: Option<StagePosition>,
    /// Keep the shutter open after this image is taken.
    pub shutter_open: bool,
    /// First slice of its Z stack.
    pub stack_start: bool,
    /// Run autofocus before this event.
    pub autofocus: bool,
    /// Earliest start relative to the start of the run, in ms.
    pub min_start_ms: Option<f64>,
}

impl AcquisitionEvent {
    /// Root event that every pipeline starts from.
    #[must_use]
    pub fn root() -> Self {
        Self {
            coords: AxisCoords::new(),
            channel: None,
            z_um: None,
            xy: None,
            shutter_open: false,
            stack_start: true,
            autofocus: false,
            min_start_ms: None,
        }
    }

    /// Copy with `kind` set to `index`.
    #[must_use]
    pub fn with_axis(&self, kind: AxisKind, index: i64) -> Self {
        let mut event = self.clone();
        event.coords.set(kind, index);
        event
    }

    /// Index along `kind`.
    #[must_use]
    pub fn axis(&self, kind: AxisKind) -> Option<i64> {
        self.coords.get(kind)
    }

    /// Timelapse frame, `0` without a time axis.
    #[must_use]
    pub fn frame(&self) -> i64 {
        self.coords.frame()
    }

    /// Focus position to move to, channel offset included.
    #[must_use]
    pub fn resolved_z(&self) -> Option<f64> {
        let offset = self.channel.as_ref().map_or(0.0, |c| c.z_offset_um);
        self.z_um.map(|z| z + offset)
    }

    /// Exposure for this event, if a channel sets one.
    #[must_use]
    pub fn exposure_ms(&self) -> Option<f64> {
        self.channel.as_ref().map(|c| c.exposure_ms)
    }
}
