//! Shared hard limits to prevent unbounded allocations or loops.
//!
//! This module centralizes:
//! - Slice and frame size limits
//! - Polling and wait granularity of the engine
//!
//! Using centralized constants ensures consistency across crates and
//! makes tuning easier.

use crate::capabilities::ImageGeometry;
use crate::error::MdaError;
use std::time::Duration;

// =============================================================================
// Timing Constants
// =============================================================================

/// Longest single sleep while waiting for a timed frame (100 ms).
///
/// Waits are split into chunks of this size so that stop requests are noticed
/// promptly.
pub const WAIT_CHUNK: Duration = Duration::from_millis(100);

/// Default interval at which a paused engine checks for resume (50 ms).
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(50);

/// Latest allowed start of the last timelapse frame (one year, in ms).
pub const MAX_TIMELAPSE_SPAN_MS: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum number of slices in one Z stack.
///
/// Surface-guided stacks stop at the volume boundary; this bound also stops
/// them if the volume never closes (e.g. a surface extrapolated to infinity).
pub const MAX_SLICES_PER_STACK: usize = 100_000;

/// Tolerance added before flooring a slice count, absorbs floating point error
/// in `range / step`.
pub const SLICE_COUNT_EPSILON: f64 = 1e-9;

/// Maximum supported width/height for frames.
pub const MAX_FRAME_DIMENSION: u32 = 65_536;

/// Maximum allowed frame payload in bytes (default: 512MB).
pub const MAX_FRAME_BYTES: u64 = 512 * 1024 * 1024;

/// Validate camera geometry and return the byte size of one image.
pub fn validate_frame_size(geometry: &ImageGeometry) -> Result<u64, MdaError> {
    if geometry.width == 0 || geometry.height == 0 || geometry.bytes_per_pixel == 0 {
        return Err(MdaError::Configuration(format!(
            "camera geometry {}x{}x{} has a zero dimension",
            geometry.width, geometry.height, geometry.bytes_per_pixel
        )));
    }
    if geometry.width > MAX_FRAME_DIMENSION || geometry.height > MAX_FRAME_DIMENSION {
        return Err(MdaError::Configuration(format!(
            "frame dimensions {}x{} exceed maximum {} per dimension",
            geometry.width, geometry.height, MAX_FRAME_DIMENSION
        )));
    }

    let bytes = u64::from(geometry.width)
        .checked_mul(u64::from(geometry.height))
        .and_then(|p| p.checked_mul(u64::from(geometry.bytes_per_pixel)))
        .ok_or(MdaError::SizeOverflow {
            context: "frame byte size",
        })?;

    if bytes > MAX_FRAME_BYTES {
        return Err(MdaError::Configuration(format!(
            "frame size {} bytes exceeds maximum {} bytes",
            bytes, MAX_FRAME_BYTES
        )));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_frame_size() {
        let ok = ImageGeometry {
            width: 2048,
            height: 2048,
            bytes_per_pixel: 2,
        };
        assert_eq!(validate_frame_size(&ok).unwrap(), 8_388_608);

        let zero = ImageGeometry {
            width: 0,
            ..ok
        };
        assert!(validate_frame_size(&zero).is_err());

        let wide = ImageGeometry {
            width: MAX_FRAME_DIMENSION + 1,
            ..ok
        };
        assert!(validate_frame_size(&wide).is_err());
    }
}
