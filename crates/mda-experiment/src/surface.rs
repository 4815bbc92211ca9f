//! Sample surfaces fitted through user-placed points.
//!
//! A surface is defined by a handful of (x, y, z) points marked on the
//! sample. Focus heights are interpolated inside the convex hull of the
//! points with inverse-distance weighting. Outside the hull a value is only
//! produced when the caller explicitly allows extrapolation.

use mda_core::error::{MdaError, MdaResult};
use mda_core::settings::{Point3, SurfaceDef};

/// Tolerance for hull containment and degenerate-area checks, in µm / µm².
const GEOMETRY_EPSILON: f64 = 1e-9;

/// Exponent of the inverse-distance weights.
const IDW_POWER: i32 = 2;

/// Axis-aligned XY bounding box of a surface's points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct XyExtent {
    /// Smallest X.
    pub min_x: f64,
    /// Largest X.
    pub max_x: f64,
    /// Smallest Y.
    pub min_y: f64,
    /// Largest Y.
    pub max_y: f64,
}

impl XyExtent {
    /// Width along X.
    #[must_use]
    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    /// Height along Y.
    #[must_use]
    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    /// Centre point.
    #[must_use]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }
}

/// Fitted surface.
#[derive(Debug, Clone)]
pub struct Surface {
    name: String,
    points: Vec<Point3>,
    hull: Vec<(f64, f64)>,
}

impl Surface {
    /// Fit a surface through the points of `def`.
    ///
    /// Needs at least three finite points that are not all on one line.
    pub fn fit(def: &SurfaceDef) -> MdaResult<Self> {
        let invalid = |reason: &str| MdaError::InvalidSurface {
            name: def.name.clone(),
            reason: reason.to_string(),
        };

        if def.points.len() < 3 {
            return Err(invalid("at least three points are needed"));
        }
        if def
            .points
            .iter()
            .any(|p| !p.x.is_finite() || !p.y.is_finite() || !p.z.is_finite())
        {
            return Err(invalid("point coordinates must be finite"));
        }

        let hull = convex_hull(&def.points);
        if hull.len() < 3 || polygon_area(&hull) <= GEOMETRY_EPSILON {
            return Err(invalid("points are collinear"));
        }

        Ok(Self {
            name: def.name.clone(),
            points: def.points.clone(),
            hull,
        })
    }

    /// Surface name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Points the surface was fitted through.
    #[must_use]
    pub fn points(&self) -> &[Point3] {
        &self.points
    }

    /// Convex hull of the points in XY, counter-clockwise.
    #[must_use]
    pub fn hull(&self) -> &[(f64, f64)] {
        &self.hull
    }

    /// Whether (x, y) lies inside the hull or on its boundary.
    #[must_use]
    pub fn contains_xy(&self, x: f64, y: f64) -> bool {
        let n = self.hull.len();
        (0..n).all(|i| {
            let a = self.hull[i];
            let b = self.hull[(i + 1) % n];
            cross(a, b, (x, y)) >= -GEOMETRY_EPSILON
        })
    }

    /// Height at (x, y) if it lies within the hull.
    #[must_use]
    pub fn interpolate(&self, x: f64, y: f64) -> Option<f64> {
        self.contains_xy(x, y).then(|| self.idw(x, y))
    }

    /// Height at (x, y) regardless of the hull.
    #[must_use]
    pub fn extrapolate(&self, x: f64, y: f64) -> f64 {
        self.idw(x, y)
    }

    /// Height at (x, y), extrapolating outside the hull when allowed.
    #[must_use]
    pub fn z_at(&self, x: f64, y: f64, extrapolate: bool) -> Option<f64> {
        if extrapolate {
            Some(self.extrapolate(x, y))
        } else {
            self.interpolate(x, y)
        }
    }

    /// Lowest and highest Z of the points.
    #[must_use]
    pub fn z_range(&self) -> (f64, f64) {
        self.points
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
                (lo.min(p.z), hi.max(p.z))
            })
    }

    /// XY bounding box of the points.
    #[must_use]
    pub fn xy_extent(&self) -> XyExtent {
        self.points.iter().fold(
            XyExtent {
                min_x: f64::INFINITY,
                max_x: f64::NEG_INFINITY,
                min_y: f64::INFINITY,
                max_y: f64::NEG_INFINITY,
            },
            |e, p| XyExtent {
                min_x: e.min_x.min(p.x),
                max_x: e.max_x.max(p.x),
                min_y: e.min_y.min(p.y),
                max_y: e.max_y.max(p.y),
            },
        )
    }

    fn idw(&self, x: f64, y: f64) -> f64 {
        // weights are applied to offsets from the first point so that a flat
        // surface yields its height exactly
        let base = self.points[0].z;
        let mut weighted = 0.0;
        let mut total = 0.0;
        for p in &self.points {
            let d2 = (p.x - x).powi(2) + (p.y - y).powi(2);
            if d2 <= GEOMETRY_EPSILON {
                return p.z;
            }
            let w = 1.0 / d2.sqrt().powi(IDW_POWER);
            weighted += w * (p.z - base);
            total += w;
        }
        base + weighted / total
    }
}

/// z component of (b - a) × (p - a); positive when p is left of a→b.
fn cross(a: (f64, f64), b: (f64, f64), p: (f64, f64)) -> f64 {
    (b.0 - a.0) * (p.1 - a.1) - (b.1 - a.1) * (p.0 - a.0)
}

/// Andrew's monotone chain. Collinear boundary points are dropped.
fn convex_hull(points: &[Point3]) -> Vec<(f64, f64)> {
    let mut pts: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
    pts.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.total_cmp(&b.1)));
    pts.dedup();
    if pts.len() < 3 {
        return pts;
    }

    let mut lower: Vec<(f64, f64)> = Vec::with_capacity(pts.len());
    for &p in &pts {
        while lower.len() >= 2 && cross(lower[lower.len() - 2], lower[lower.len() - 1], p) <= 0.0 {
            lower.pop();
        }
        lower.push(p);
    }

    let mut upper: Vec<(f64, f64)> = Vec::with_capacity(pts.len());
    for &p in pts.iter().rev() {
        while upper.len() >= 2 && cross(upper[upper.len() - 2], upper[upper.len() - 1], p) <= 0.0 {
            upper.pop();
        }
        upper.push(p);
    }

    lower.pop();
    upper.pop();
    lower.extend(upper);
    lower
}

fn polygon_area(poly: &[(f64, f64)]) -> f64 {
    let n = poly.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let a = poly[i];
            let b = poly[(i + 1) % n];
            a.0 * b.1 - b.0 * a.1
        })
        .sum();
    twice.abs() / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(z: [f64; 4]) -> SurfaceDef {
        SurfaceDef {
            name: "tissue".into(),
            points: vec![
                Point3::new(0.0, 0.0, z[0]),
                Point3::new(100.0, 0.0, z[1]),
                Point3::new(100.0, 100.0, z[2]),
                Point3::new(0.0, 100.0, z[3]),
            ],
        }
    }

    #[test]
    fn test_hull_of_square_with_interior_point() {
        let mut def = square([0.0; 4]);
        def.points.push(Point3::new(50.0, 50.0, 3.0));
        let surface = Surface::fit(&def).unwrap();
        assert_eq!(surface.hull().len(), 4);
        assert!(surface.contains_xy(50.0, 50.0));
        assert!(surface.contains_xy(100.0, 50.0));
        assert!(!surface.contains_xy(100.1, 50.0));
    }

    #[test]
    fn test_interpolation_hits_points_exactly() {
        let surface = Surface::fit(&square([1.0, 2.0, 3.0, 4.0])).unwrap();
        assert_eq!(surface.interpolate(100.0, 0.0), Some(2.0));
        let mid = surface.interpolate(50.0, 50.0).unwrap();
        assert!((mid - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_outside_hull_requires_extrapolation() {
        let surface = Surface::fit(&square([5.0; 4])).unwrap();
        assert_eq!(surface.z_at(200.0, 50.0, false), None);
        let z = surface.z_at(200.0, 50.0, true).unwrap();
        assert!((z - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_surfaces_rejected() {
        let line = SurfaceDef {
            name: "line".into(),
            points: vec![
                Point3::new(0.0, 0.0, 0.0),
                Point3::new(1.0, 1.0, 0.0),
                Point3::new(2.0, 2.0, 0.0),
            ],
        };
        assert!(matches!(
            Surface::fit(&line),
            Err(MdaError::InvalidSurface { .. })
        ));

        let two = SurfaceDef {
            name: "two".into(),
            points: vec![Point3::new(0.0, 0.0, 0.0), Point3::new(1.0, 0.0, 0.0)],
        };
        assert!(Surface::fit(&two).is_err());
    }

    #[test]
    fn test_extent_and_range() {
        let surface = Surface::fit(&square([-2.0, 0.0, 7.0, 1.0])).unwrap();
        assert_eq!(surface.z_range(), (-2.0, 7.0));
        let extent = surface.xy_extent();
        assert_eq!(extent.width(), 100.0);
        assert_eq!(extent.center(), (50.0, 50.0));
    }
}
