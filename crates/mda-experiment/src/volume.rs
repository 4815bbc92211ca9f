//! Imaging-volume bounds.
//!
//! [`VolumeBoundsPolicy`] answers one question for the Z-stack stage: is a
//! candidate focus position above the imaging volume, below it, or inside
//! it, for the tile currently being imaged. "Above" always means on the
//! objective side of the sample, so for surface-relative modes the answer
//! depends on which way the focus drive moves toward the sample.
//!
//! [`SliceWalk`] turns a policy into the slices of one stack.

use crate::surface::Surface;
use mda_core::error::{MdaError, MdaResult};
use mda_core::limits::MAX_SLICES_PER_STACK;
use mda_core::settings::{FocusLimits, Footprint, SequenceSettings, SpaceMode, VolumeSettings};
use std::sync::Arc;

/// Which way the focus drive moves toward the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusDirection {
    /// Increasing Z moves toward the sample.
    #[default]
    Positive,
    /// Decreasing Z moves toward the sample.
    Negative,
}

impl FocusDirection {
    /// Interpret the raw value reported by a focus device.
    pub fn from_raw(device: &str, raw: i32) -> MdaResult<Self> {
        match raw.signum() {
            1 => Ok(FocusDirection::Positive),
            -1 => Ok(FocusDirection::Negative),
            _ => Err(MdaError::FocusDirectionUndefined {
                device: device.to_string(),
                raw,
            }),
        }
    }

    /// +1.0 or -1.0.
    #[must_use]
    pub fn sign(&self) -> f64 {
        match self {
            FocusDirection::Positive => 1.0,
            FocusDirection::Negative => -1.0,
        }
    }
}

/// XY area imaged by one tile, in stage µm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileFootprint {
    /// Tile centre.
    pub center: (f64, f64),
    /// Half the field of view along X.
    pub half_width_um: f64,
    /// Half the field of view along Y.
    pub half_height_um: f64,
}

impl TileFootprint {
    /// Zero-size footprint at a point.
    #[must_use]
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            center: (x, y),
            half_width_um: 0.0,
            half_height_um: 0.0,
        }
    }

    /// Centre followed by the four corners.
    #[must_use]
    pub fn sample_points(&self) -> [(f64, f64); 5] {
        let (x, y) = self.center;
        let (hw, hh) = (self.half_width_um, self.half_height_um);
        [
            (x, y),
            (x - hw, y - hh),
            (x + hw, y - hh),
            (x + hw, y + hh),
            (x - hw, y + hh),
        ]
    }
}

/// Shape of the imaging volume.
#[derive(Debug, Clone)]
pub enum BoundsMode {
    /// Single plane at `z_origin`.
    Plane,
    /// Fixed Z range, identical at every position.
    Cuboid {
        /// Top of the range.
        z_start_um: f64,
        /// Bottom of the range.
        z_end_um: f64,
    },
    /// Band around one surface.
    FixedDistance {
        /// Reference surface.
        surface: Arc<Surface>,
        /// Distance imaged above the surface.
        above_um: f64,
        /// Distance imaged below the surface.
        below_um: f64,
        /// Allow heights outside the surface's hull.
        extrapolate: bool,
    },
    /// Between two surfaces.
    BetweenSurfaces {
        /// Upper surface.
        top: Arc<Surface>,
        /// Lower surface.
        bottom: Arc<Surface>,
        /// Extra distance above `top`.
        above_top_um: f64,
        /// Extra distance below `bottom`.
        below_bottom_um: f64,
    },
}

/// Decides whether focus positions lie inside the imaging volume.
#[derive(Debug, Clone)]
pub struct VolumeBoundsPolicy {
    mode: BoundsMode,
    direction: FocusDirection,
    limits: Option<FocusLimits>,
    z_step_um: f64,
    z_origin: f64,
}

impl VolumeBoundsPolicy {
    /// Single-plane policy at `z_origin`.
    #[must_use]
    pub fn plane(z_origin: f64) -> Self {
        Self {
            mode: BoundsMode::Plane,
            direction: FocusDirection::Positive,
            limits: None,
            z_step_um: 1.0,
            z_origin,
        }
    }

    /// Policy with an explicit mode. The stack origin is derived from it.
    pub fn new(
        mode: BoundsMode,
        direction: FocusDirection,
        limits: Option<FocusLimits>,
        z_step_um: f64,
    ) -> MdaResult<Self> {
        if z_step_um == 0.0 {
            return Err(MdaError::ZeroSliceStep);
        }
        if !z_step_um.is_finite() {
            return Err(MdaError::Configuration(format!(
                "z step must be finite, got {}",
                z_step_um
            )));
        }
        let mut policy = Self {
            mode,
            direction,
            limits,
            z_step_um: z_step_um.abs(),
            z_origin: 0.0,
        };
        policy.z_origin = policy.z_top();
        Ok(policy)
    }

    /// Policy for the volume modes of `settings`.
    pub fn from_settings(settings: &SequenceSettings, direction: FocusDirection) -> MdaResult<Self> {
        let volume = &settings.volume;
        let mode = match volume.mode {
            SpaceMode::Cuboid => BoundsMode::Cuboid {
                z_start_um: volume.cuboid_z_start_um,
                z_end_um: volume.cuboid_z_end_um,
            },
            SpaceMode::FixedDistanceFromSurface => {
                let name = required(volume, "fixed_surface", volume.fixed_surface.as_ref())?;
                let extrapolate =
                    !matches!(&volume.footprint, Footprint::Surface { name: f } if f == name);
                BoundsMode::FixedDistance {
                    surface: named_surface(volume, name)?,
                    above_um: volume.distance_above_surface_um,
                    below_um: volume.distance_below_surface_um,
                    extrapolate,
                }
            }
            SpaceMode::VolumeBetweenSurfaces => {
                let top = required(volume, "top_surface", volume.top_surface.as_ref())?;
                let bottom = required(volume, "bottom_surface", volume.bottom_surface.as_ref())?;
                BoundsMode::BetweenSurfaces {
                    top: named_surface(volume, top)?,
                    bottom: named_surface(volume, bottom)?,
                    above_top_um: volume.distance_above_top_um,
                    below_bottom_um: volume.distance_below_bottom_um,
                }
            }
            other => {
                return Err(MdaError::Configuration(format!(
                    "{} mode has no Z volume",
                    other
                )))
            }
        };
        Self::new(mode, direction, settings.focus_limits, volume.z_step_um)
    }

    /// Volume shape.
    #[must_use]
    pub fn mode(&self) -> &BoundsMode {
        &self.mode
    }

    /// Origin of the slice index: slice `k` sits at `z_origin + k * step`.
    #[must_use]
    pub fn z_origin(&self) -> f64 {
        self.z_origin
    }

    /// Signed distance between consecutive slices.
    #[must_use]
    pub fn signed_step(&self) -> f64 {
        match self.mode {
            BoundsMode::FixedDistance { .. } | BoundsMode::BetweenSurfaces { .. } => {
                self.direction.sign() * self.z_step_um
            }
            BoundsMode::Plane | BoundsMode::Cuboid { .. } => self.z_step_um,
        }
    }

    fn depth_sign(&self) -> f64 {
        match self.mode {
            BoundsMode::FixedDistance { .. } | BoundsMode::BetweenSurfaces { .. } => {
                self.direction.sign()
            }
            BoundsMode::Plane | BoundsMode::Cuboid { .. } => 1.0,
        }
    }

    /// Topmost focus position the stack can start from, clamped to the
    /// focus limits.
    fn z_top(&self) -> f64 {
        let above_surface = |surface: &Surface, margin: f64| -> f64 {
            let (lo, hi) = surface.z_range();
            match self.direction {
                FocusDirection::Positive => {
                    let top = lo - margin;
                    self.limits.map_or(top, |l| top.max(l.lower_um))
                }
                FocusDirection::Negative => {
                    let top = hi + margin;
                    self.limits.map_or(top, |l| top.min(l.upper_um))
                }
            }
        };
        match &self.mode {
            BoundsMode::Plane => self.z_origin,
            BoundsMode::Cuboid { z_start_um, .. } => *z_start_um,
            BoundsMode::FixedDistance {
                surface, above_um, ..
            } => above_surface(surface, *above_um),
            BoundsMode::BetweenSurfaces {
                top, above_top_um, ..
            } => above_surface(top, *above_top_um),
        }
    }

    /// True when no part of the volume can be located under `tile`.
    #[must_use]
    pub fn is_undefined_at(&self, tile: &TileFootprint) -> bool {
        match &self.mode {
            BoundsMode::Plane | BoundsMode::Cuboid { .. } => false,
            BoundsMode::FixedDistance {
                surface,
                extrapolate,
                ..
            } => heights(surface, tile, *extrapolate).is_empty(),
            BoundsMode::BetweenSurfaces { top, bottom, .. } => {
                heights(top, tile, false).is_empty() || heights(bottom, tile, false).is_empty()
            }
        }
    }

    /// Whether `z` lies entirely above the volume everywhere under `tile`.
    #[must_use]
    pub fn is_above(&self, tile: &TileFootprint, z: f64) -> bool {
        let s = self.depth_sign();
        match &self.mode {
            BoundsMode::Plane => z < self.z_origin,
            BoundsMode::Cuboid { z_start_um, .. } => z < *z_start_um,
            BoundsMode::FixedDistance {
                surface,
                above_um,
                extrapolate,
                ..
            } => all_defined(&heights(surface, tile, *extrapolate), |zs| {
                s * z < s * zs - above_um
            }),
            BoundsMode::BetweenSurfaces {
                top, above_top_um, ..
            } => all_defined(&heights(top, tile, false), |zs| {
                s * z < s * zs - above_top_um
            }),
        }
    }

    /// Whether `z` lies entirely below the volume everywhere under `tile`.
    #[must_use]
    pub fn is_below(&self, tile: &TileFootprint, z: f64) -> bool {
        let s = self.depth_sign();
        match &self.mode {
            BoundsMode::Plane => z > self.z_origin,
            BoundsMode::Cuboid { z_end_um, .. } => z > *z_end_um,
            BoundsMode::FixedDistance {
                surface,
                below_um,
                extrapolate,
                ..
            } => all_defined(&heights(surface, tile, *extrapolate), |zs| {
                s * z > s * zs + below_um
            }),
            BoundsMode::BetweenSurfaces {
                bottom,
                below_bottom_um,
                ..
            } => all_defined(&heights(bottom, tile, false), |zs| {
                s * z > s * zs + below_bottom_um
            }),
        }
    }

    /// Past the focus limit on the sample side.
    fn beyond_deep_limit(&self, z: f64) -> bool {
        match (self.limits, self.depth_sign() > 0.0) {
            (Some(l), true) => z > l.upper_um,
            (Some(l), false) => z < l.lower_um,
            (None, _) => false,
        }
    }

    /// Past the focus limit on the objective side.
    fn beyond_shallow_limit(&self, z: f64) -> bool {
        match (self.limits, self.depth_sign() > 0.0) {
            (Some(l), true) => z < l.lower_um,
            (Some(l), false) => z > l.upper_um,
            (None, _) => false,
        }
    }

    /// Slices of the stack under `tile`.
    #[must_use]
    pub fn walk(self: &Arc<Self>, tile: TileFootprint) -> SliceWalk {
        let done = self.is_undefined_at(&tile);
        SliceWalk {
            policy: Arc::clone(self),
            tile,
            index: 0,
            done,
        }
    }

    /// Focus position of slice index `k`.
    #[must_use]
    pub fn z_of_index(&self, k: i64) -> f64 {
        self.z_origin + k as f64 * self.signed_step()
    }

    /// Nearest slice index of a focus position.
    #[must_use]
    pub fn index_of_z(&self, z: f64) -> i64 {
        ((z - self.z_origin) / self.signed_step()).round() as i64
    }
}

fn all_defined(heights: &[f64], pred: impl Fn(f64) -> bool) -> bool {
    !heights.is_empty() && heights.iter().all(|z| pred(*z))
}

fn heights(surface: &Surface, tile: &TileFootprint, extrapolate: bool) -> Vec<f64> {
    tile.sample_points()
        .iter()
        .filter_map(|(x, y)| surface.z_at(*x, *y, extrapolate))
        .collect()
}

fn required<'a>(volume: &VolumeSettings, field: &str, name: Option<&'a String>) -> MdaResult<&'a str> {
    name.map(String::as_str).ok_or_else(|| {
        MdaError::Configuration(format!("{} mode requires `{}`", volume.mode, field))
    })
}

/// Fit the surface called `name` from the volume settings.
pub fn named_surface(volume: &VolumeSettings, name: &str) -> MdaResult<Arc<Surface>> {
    let def = volume.surface(name).ok_or_else(|| MdaError::InvalidSurface {
        name: name.to_string(),
        reason: "no surface with this name is defined".to_string(),
    })?;
    Ok(Arc::new(Surface::fit(def)?))
}

/// Lazily yields `(slice index, z)` for one stack.
///
/// Slices above the volume (or beyond the shallow focus limit) are skipped
/// but still consume an index, so the same Z always carries the same index
/// across positions. The walk ends at the first slice below the volume or
/// beyond the deep focus limit.
#[derive(Debug, Clone)]
pub struct SliceWalk {
    policy: Arc<VolumeBoundsPolicy>,
    tile: TileFootprint,
    index: i64,
    done: bool,
}

impl Iterator for SliceWalk {
    type Item = (i64, f64);

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if self.index >= MAX_SLICES_PER_STACK as i64 {
                tracing::warn!(
                    center = ?self.tile.center,
                    "stack reached the slice limit before leaving the volume"
                );
                self.done = true;
                break;
            }
            let k = self.index;
            let z = self.policy.z_of_index(k);
            if self.policy.is_below(&self.tile, z) || self.policy.beyond_deep_limit(z) {
                self.done = true;
                break;
            }
            self.index += 1;
            if self.policy.is_above(&self.tile, z) || self.policy.beyond_shallow_limit(z) {
                continue;
            }
            return Some((k, z));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mda_core::settings::{Point3, SurfaceDef};

    fn flat(name: &str, z: f64) -> SurfaceDef {
        SurfaceDef {
            name: name.into(),
            points: vec![
                Point3::new(0.0, 0.0, z),
                Point3::new(100.0, 0.0, z),
                Point3::new(100.0, 100.0, z),
                Point3::new(0.0, 100.0, z),
            ],
        }
    }

    fn fixed(direction: FocusDirection, extrapolate: bool) -> Arc<VolumeBoundsPolicy> {
        let surface = Arc::new(Surface::fit(&flat("s", 10.0)).unwrap());
        Arc::new(
            VolumeBoundsPolicy::new(
                BoundsMode::FixedDistance {
                    surface,
                    above_um: 2.0,
                    below_um: 3.0,
                    extrapolate,
                },
                direction,
                None,
                1.0,
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_focus_direction_from_raw() {
        assert_eq!(FocusDirection::from_raw("Z", 1).unwrap(), FocusDirection::Positive);
        assert_eq!(FocusDirection::from_raw("Z", -3).unwrap(), FocusDirection::Negative);
        assert!(matches!(
            FocusDirection::from_raw("Z", 0),
            Err(MdaError::FocusDirectionUndefined { raw: 0, .. })
        ));
    }

    #[test]
    fn test_cuboid_walk() {
        let policy = Arc::new(
            VolumeBoundsPolicy::new(
                BoundsMode::Cuboid {
                    z_start_um: 2.0,
                    z_end_um: 6.0,
                },
                FocusDirection::Negative,
                None,
                2.0,
            )
            .unwrap(),
        );
        let slices: Vec<_> = policy.walk(TileFootprint::point(0.0, 0.0)).collect();
        assert_eq!(slices, vec![(0, 2.0), (1, 4.0), (2, 6.0)]);
        assert!(policy.is_above(&TileFootprint::point(0.0, 0.0), 1.0));
        assert!(policy.is_below(&TileFootprint::point(0.0, 0.0), 6.5));
    }

    #[test]
    fn test_fixed_distance_positive_direction() {
        let policy = fixed(FocusDirection::Positive, false);
        assert_eq!(policy.z_origin(), 8.0);
        let z: Vec<f64> = policy
            .walk(TileFootprint::point(50.0, 50.0))
            .map(|(_, z)| z)
            .collect();
        assert_eq!(z, vec![8.0, 9.0, 10.0, 11.0, 12.0, 13.0]);
    }

    #[test]
    fn test_fixed_distance_negative_direction() {
        let policy = fixed(FocusDirection::Negative, false);
        assert_eq!(policy.z_origin(), 12.0);
        let z: Vec<f64> = policy
            .walk(TileFootprint::point(50.0, 50.0))
            .map(|(_, z)| z)
            .collect();
        assert_eq!(z, vec![12.0, 11.0, 10.0, 9.0, 8.0, 7.0]);
    }

    #[test]
    fn test_undefined_outside_hull_without_extrapolation() {
        let tile = TileFootprint::point(500.0, 500.0);
        let policy = fixed(FocusDirection::Positive, false);
        assert!(policy.is_undefined_at(&tile));
        assert_eq!(policy.walk(tile).count(), 0);

        let policy = fixed(FocusDirection::Positive, true);
        assert!(!policy.is_undefined_at(&tile));
        assert_eq!(policy.walk(tile).count(), 6);
    }

    #[test]
    fn test_deeper_surface_skips_leading_slices() {
        let tilted = SurfaceDef {
            name: "tilt".into(),
            points: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(100.0, 0.0, 0.0),
                Point3::new(100.0, 100.0, 10.0),
                Point3::new(0.0, 100.0, 10.0),
            ],
        };
        let policy = Arc::new(
            VolumeBoundsPolicy::new(
                BoundsMode::FixedDistance {
                    surface: Arc::new(Surface::fit(&tilted).unwrap()),
                    above_um: 0.0,
                    below_um: 0.0,
                    extrapolate: false,
                },
                FocusDirection::Positive,
                None,
                1.0,
            )
            .unwrap(),
        );
        let slices: Vec<_> = policy.walk(TileFootprint::point(100.0, 100.0)).collect();
        assert_eq!(slices, vec![(10, 10.0)]);
    }

    #[test]
    fn test_between_surfaces() {
        let top = Arc::new(Surface::fit(&flat("top", 5.0)).unwrap());
        let bottom = Arc::new(Surface::fit(&flat("bottom", 8.0)).unwrap());
        let policy = Arc::new(
            VolumeBoundsPolicy::new(
                BoundsMode::BetweenSurfaces {
                    top,
                    bottom,
                    above_top_um: 1.0,
                    below_bottom_um: 0.0,
                },
                FocusDirection::Positive,
                None,
                1.0,
            )
            .unwrap(),
        );
        let z: Vec<f64> = policy
            .walk(TileFootprint::point(10.0, 10.0))
            .map(|(_, z)| z)
            .collect();
        assert_eq!(z, vec![4.0, 5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_focus_limits_clamp_and_stop() {
        let surface = Arc::new(Surface::fit(&flat("s", 10.0)).unwrap());
        let policy = Arc::new(
            VolumeBoundsPolicy::new(
                BoundsMode::FixedDistance {
                    surface,
                    above_um: 5.0,
                    below_um: 5.0,
                    extrapolate: false,
                },
                FocusDirection::Positive,
                Some(FocusLimits {
                    lower_um: 7.0,
                    upper_um: 12.0,
                }),
                1.0,
            )
            .unwrap(),
        );
        assert_eq!(policy.z_origin(), 7.0);
        let z: Vec<f64> = policy
            .walk(TileFootprint::point(50.0, 50.0))
            .map(|(_, z)| z)
            .collect();
        assert_eq!(z, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn test_plane_policy() {
        let policy = VolumeBoundsPolicy::plane(3.0);
        let tile = TileFootprint::point(0.0, 0.0);
        assert!(policy.is_above(&tile, 2.9));
        assert!(policy.is_below(&tile, 3.1));
        assert!(!policy.is_above(&tile, 3.0) && !policy.is_below(&tile, 3.0));
    }

    #[test]
    fn test_zero_step_rejected() {
        let result = VolumeBoundsPolicy::new(
            BoundsMode::Cuboid {
                z_start_um: 0.0,
                z_end_um: 1.0,
            },
            FocusDirection::Positive,
            None,
            0.0,
        );
        assert!(matches!(result, Err(MdaError::ZeroSliceStep)));
    }
}
