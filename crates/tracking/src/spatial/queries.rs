//! Spatial query utilities for distance calculations.
//!
//! Uses the Haversine formula for point-to-point distances. Projections onto
//! segments use a local equirectangular approximation around the segment,
//! which is accurate to well under a meter at segment scale.

use std::f64::consts::PI;

use geo::{HaversineDistance, Line, Point};

/// Mean Earth radius, matching the radius `geo` uses for Haversine.
pub const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Meters per degree of latitude (and of longitude at the equator).
pub const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * PI / 180.0;

/// Calculate Haversine distance between two points in meters
pub fn haversine_distance(p1: Point, p2: Point) -> f64 {
    p1.haversine_distance(&p2)
}

/// Result of projecting a point onto a segment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Projection {
    /// Perpendicular (or endpoint) distance in meters.
    pub offset_m: f64,
    /// Position of the foot of the projection, 0 at `start`, 1 at `end`.
    pub fraction: f64,
}

/// Project `point` onto `line`, clamping to the segment ends.
///
/// Degenerate input never panics: a zero-length line projects onto its start
/// and non-finite coordinates yield an infinite offset.
pub fn project_onto_line(point: Point, line: Line) -> Projection {
    let mid_lat = ((line.start.y + line.end.y) / 2.0).to_radians();
    let kx = METERS_PER_DEGREE * mid_lat.cos();
    let ky = METERS_PER_DEGREE;

    let bx = (line.end.x - line.start.x) * kx;
    let by = (line.end.y - line.start.y) * ky;
    let px = (point.x() - line.start.x) * kx;
    let py = (point.y() - line.start.y) * ky;

    let len_2 = bx * bx + by * by;
    if !(len_2.is_finite() && px.is_finite() && py.is_finite()) {
        return Projection {
            offset_m: f64::INFINITY,
            fraction: 0.0,
        };
    }

    let fraction = if len_2 == 0.0 {
        0.0
    } else {
        ((px * bx + py * by) / len_2).clamp(0.0, 1.0)
    };

    let dx = px - fraction * bx;
    let dy = py - fraction * by;

    Projection {
        offset_m: dx.hypot(dy),
        fraction,
    }
}

/// Radius in degrees that covers at least `meters` in every direction around
/// latitude `lat`. Used to pre-filter R-tree lookups.
pub fn meters_to_degrees_at(lat: f64, meters: f64) -> f64 {
    let cos = lat.to_radians().cos().abs().max(0.01);
    meters / (METERS_PER_DEGREE * cos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use geo::Coord;

    #[test]
    fn test_haversine_distance() {
        // Ramses Square to Tahrir Square is roughly 2.3 km
        let ramses = Point::new(31.2467, 30.0626);
        let tahrir = Point::new(31.2357, 30.0444);

        let dist = haversine_distance(ramses, tahrir);
        assert!((dist - 2_280.0).abs() < 200.0);
    }

    #[test]
    fn test_meridian_degree_length() {
        let a = Point::new(31.2, 30.0);
        let b = Point::new(31.2, 31.0);
        assert_abs_diff_eq!(haversine_distance(a, b), METERS_PER_DEGREE, epsilon = 1e-6);
    }

    #[test]
    fn test_project_onto_meridian_segment() {
        let line = Line::new(Coord { x: 31.2, y: 30.0 }, Coord { x: 31.2, y: 30.01 });
        let point = Point::new(31.2, 30.005);

        let projection = project_onto_line(point, line);
        assert_abs_diff_eq!(projection.fraction, 0.5, epsilon = 1e-9);
        assert!(projection.offset_m < 0.01);
    }

    #[test]
    fn test_project_offset_is_perpendicular_distance() {
        let line = Line::new(Coord { x: 31.2, y: 30.0 }, Coord { x: 31.2, y: 30.01 });
        // ~96 m east of the line
        let point = Point::new(31.201, 30.005);

        let projection = project_onto_line(point, line);
        let expected = haversine_distance(point, Point::new(31.2, 30.005));
        assert_abs_diff_eq!(projection.offset_m, expected, epsilon = 0.5);
    }

    #[test]
    fn test_project_clamps_to_endpoints() {
        let line = Line::new(Coord { x: 31.2, y: 30.0 }, Coord { x: 31.2, y: 30.01 });
        let before = project_onto_line(Point::new(31.2, 29.99), line);
        let after = project_onto_line(Point::new(31.2, 30.02), line);

        assert_eq!(before.fraction, 0.0);
        assert_eq!(after.fraction, 1.0);
        assert_abs_diff_eq!(before.offset_m, 0.01 * METERS_PER_DEGREE, epsilon = 0.5);
    }

    #[test]
    fn test_project_degenerate_input() {
        let point_line = Line::new(Coord { x: 31.2, y: 30.0 }, Coord { x: 31.2, y: 30.0 });
        let projection = project_onto_line(Point::new(31.2, 30.001), point_line);
        assert_eq!(projection.fraction, 0.0);
        assert!(projection.offset_m.is_finite());

        let nan = project_onto_line(Point::new(f64::NAN, 30.0), point_line);
        assert!(nan.offset_m.is_infinite());
    }

    #[test]
    fn test_degree_radius_covers_longitude() {
        let deg = meters_to_degrees_at(30.0, 1000.0);
        assert!(deg * METERS_PER_DEGREE >= 1000.0);
        assert!(deg * METERS_PER_DEGREE * 30f64.to_radians().cos() >= 999.9);
    }
}
