//! Image count, data volume and duration estimates.
//!
//! Counts are computed from the plan's axis sizes, not by running the
//! event pipeline, so they double as a check on the generator.

use crate::plan::AcquisitionPlan;
use mda_core::axis::AxisKind;
use mda_core::error::{MdaError, MdaResult};
use mda_core::event::StagePosition;
use serde::Serialize;
use std::time::Duration;

/// Summary of an acquisition before it runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcquisitionSummary {
    /// Time points.
    pub num_frames: usize,
    /// Stage positions (1 without a position axis).
    pub num_positions: usize,
    /// Largest stack size over all positions (1 without a slice axis).
    pub num_slices: usize,
    /// Enabled channels.
    pub num_channels: usize,
    /// Images the run will produce.
    pub total_images: u64,
    /// Bytes per image.
    pub bytes_per_image: u64,
    /// Bytes of all images.
    pub total_bytes: u64,
    /// Lower bound on the run time.
    pub min_duration: Duration,
    /// Iterated axes, outermost first, e.g. "Position, Time, Channel, Slice".
    pub order: String,
}

/// Number of images `plan` produces.
pub fn total_images(plan: &AcquisitionPlan) -> MdaResult<u64> {
    let settings = plan.settings();
    let frames = settings.num_frames() as u64;
    let positions: Vec<Option<&StagePosition>> = match plan.positions() {
        Some(p) => p.iter().map(Some).collect(),
        None => vec![None],
    };

    let mut total: u64 = 0;
    for xy in positions {
        let slices = plan.slices_at(xy) as u64;
        let per_position = if settings.use_channels {
            plan.channels()
                .iter()
                .map(|c| {
                    let stack = if c.do_z_stack { slices } else { slices.min(1) };
                    let skip = u64::from(c.skip_frames) + 1;
                    // frames 0, skip, 2*skip, ... below `frames`
                    let acquired = frames.div_ceil(skip);
                    acquired * stack
                })
                .sum::<u64>()
        } else {
            frames * slices
        };
        total = total
            .checked_add(per_position)
            .ok_or(MdaError::SizeOverflow {
                context: "total image count",
            })?;
    }
    Ok(total)
}

/// Bytes of all images.
pub fn total_bytes(plan: &AcquisitionPlan) -> MdaResult<u64> {
    total_images(plan)?
        .checked_mul(plan.bytes_per_image())
        .ok_or(MdaError::SizeOverflow {
            context: "total data size",
        })
}

/// Full summary of `plan`.
pub fn summarize(plan: &AcquisitionPlan) -> MdaResult<AcquisitionSummary> {
    let settings = plan.settings();
    let num_frames = settings.num_frames();
    let num_positions = plan.positions().map_or(1, <[StagePosition]>::len);
    let num_slices = match plan.positions() {
        Some(p) => p.iter().map(|xy| plan.slices_at(Some(xy))).max().unwrap_or(0),
        None => plan.slices_at(None),
    };
    let num_channels = plan.channels().len();
    let total_images = total_images(plan)?;
    let total_bytes = total_bytes(plan)?;

    let exposure_per_frame_ms: f64 = if settings.use_channels {
        plan.channels()
            .iter()
            .map(|c| {
                let stack = if c.do_z_stack { num_slices } else { 1 };
                c.exposure_ms * stack as f64 * num_positions as f64
            })
            .sum()
    } else {
        plan.context().exposure_ms * num_slices as f64 * num_positions as f64
    };

    let interval_ms = settings.interval_ms.max(exposure_per_frame_ms);
    let frames_ms = if settings.use_frames && settings.use_custom_intervals {
        settings.custom_intervals_ms.iter().sum()
    } else {
        interval_ms * num_frames.saturating_sub(1) as f64
    };
    let min_duration_ms = frames_ms + exposure_per_frame_ms;
    let min_duration = Duration::try_from_secs_f64((min_duration_ms / 1000.0).max(0.0))
        .map_err(|_| {
            MdaError::Configuration(format!(
                "acquisition duration of {} ms is out of range",
                min_duration_ms
            ))
        })?;

    let order = plan
        .axis_order()
        .iter()
        .map(AxisKind::label)
        .collect::<Vec<_>>()
        .join(", ");

    Ok(AcquisitionSummary {
        num_frames,
        num_positions,
        num_slices,
        num_channels,
        total_images,
        bytes_per_image: plan.bytes_per_image(),
        total_bytes,
        min_duration,
        order,
    })
}

/// "512 MB" up to 1024 MB, "1.50 GB" above.
#[must_use]
pub fn format_memory(bytes: u64) -> String {
    let mb = bytes / (1024 * 1024);
    if mb <= 1024 {
        format!("{} MB", mb)
    } else {
        format!("{:.2} GB", mb as f64 / 1024.0)
    }
}

/// "1h 2m 3.5s", leading zero units left out.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs_f64();
    let hours = (total / 3600.0).floor();
    let minutes = ((total - hours * 3600.0) / 60.0).floor();
    let seconds = total - hours * 3600.0 - minutes * 60.0;

    let mut out = String::new();
    if hours > 0.0 {
        out.push_str(&format!("{}h ", hours));
    }
    if minutes > 0.0 || hours > 0.0 {
        out.push_str(&format!("{}m ", minutes));
    }
    let seconds = (seconds * 100.0).round() / 100.0;
    out.push_str(&format!("{}s", seconds));
    out
}

impl std::fmt::Display for AcquisitionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Number of time points: {}", self.num_frames)?;
        writeln!(f, "Number of positions: {}", self.num_positions)?;
        writeln!(f, "Number of slices: {}", self.num_slices)?;
        writeln!(f, "Number of channels: {}", self.num_channels)?;
        writeln!(f, "Total images: {}", self.total_images)?;
        writeln!(f, "Total memory: {}", format_memory(self.total_bytes))?;
        write!(f, "Minimum duration: {}", format_duration(self.min_duration))?;
        if !self.order.is_empty() {
            write!(f, "\nOrder: {}", self.order)?;
        }
        Ok(())
    }
}
