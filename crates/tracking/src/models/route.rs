//! Static route network entities.
//!
//! Routes, stops and segments are immutable once the catalog is loaded and
//! are shared behind `Arc` by every lane and query.

use std::sync::Arc;

use geo::{Line, LineString, Point};

use crate::identifiers::*;

/// A boarding point on one route, positioned by its distance from the
/// route origin.
#[derive(Clone, Debug)]
pub struct Stop {
    pub id: StopIdentifier,
    pub name: Option<Arc<str>>,
    pub location: Point,
    pub route_id: RouteIdentifier,
    pub distance_m: f64,
}

/// Piece of route geometry between two consecutive shape points.
#[derive(Clone, Debug)]
pub struct Segment {
    pub route_id: RouteIdentifier,
    pub index: usize,
    pub line: Line,
    pub start_m: f64,
    pub length_m: f64,
}

impl Segment {
    pub fn end_m(&self) -> f64 {
        self.start_m + self.length_m
    }

    /// Meters of `[from_m, to_m]` that fall inside this segment.
    pub fn overlap_m(&self, from_m: f64, to_m: f64) -> f64 {
        (to_m.min(self.end_m()) - from_m.max(self.start_m)).max(0.0)
    }
}

#[derive(Clone, Debug)]
pub struct Route {
    pub id: RouteIdentifier,
    pub name: Arc<str>,
    pub shape: LineString,
    segments: Vec<Segment>,
    stops: Vec<Stop>,
    length_m: f64,
}

impl Route {
    /// Assemble a route from already validated parts. Segments must be
    /// contiguous and stops ordered by distance.
    pub(crate) fn new(
        id: RouteIdentifier,
        name: Arc<str>,
        shape: LineString,
        segments: Vec<Segment>,
        stops: Vec<Stop>,
    ) -> Self {
        let length_m = segments.last().map(Segment::end_m).unwrap_or(0.0);
        Self {
            id,
            name,
            shape,
            segments,
            stops,
            length_m,
        }
    }

    pub fn length_m(&self) -> f64 {
        self.length_m
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn stops(&self) -> &[Stop] {
        &self.stops
    }

    pub fn stop(&self, id: &StopIdentifier) -> Option<&Stop> {
        self.stops.iter().find(|s| &s.id == id)
    }

    pub fn clamp_distance(&self, distance_m: f64) -> f64 {
        if distance_m.is_nan() {
            return 0.0;
        }
        distance_m.clamp(0.0, self.length_m)
    }

    /// Index of the segment containing `distance_m`. A distance exactly on a
    /// boundary belongs to the segment that starts there, except at the end
    /// of the route.
    pub fn segment_index_at(&self, distance_m: f64) -> usize {
        let d = self.clamp_distance(distance_m);
        let after = self.segments.partition_point(|s| s.start_m <= d);
        after.saturating_sub(1).min(self.segments.len().saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Coord;

    fn segment(route: &RouteIdentifier, index: usize, start_m: f64, length_m: f64) -> Segment {
        Segment {
            route_id: route.clone(),
            index,
            line: Line::new(Coord { x: 0.0, y: 0.0 }, Coord { x: 0.0, y: 0.0 }),
            start_m,
            length_m,
        }
    }

    fn route() -> Route {
        let id = RouteIdentifier::new("r");
        Route::new(
            id.clone(),
            "r".into(),
            LineString::from(vec![(0.0, 0.0), (0.0, 1.0)]),
            vec![
                segment(&id, 0, 0.0, 100.0),
                segment(&id, 1, 100.0, 50.0),
                segment(&id, 2, 150.0, 250.0),
            ],
            vec![],
        )
    }

    #[test]
    fn test_length_is_sum_of_segments() {
        assert_eq!(route().length_m(), 400.0);
    }

    #[test]
    fn test_segment_index_at() {
        let r = route();
        assert_eq!(r.segment_index_at(-10.0), 0);
        assert_eq!(r.segment_index_at(0.0), 0);
        assert_eq!(r.segment_index_at(99.9), 0);
        assert_eq!(r.segment_index_at(100.0), 1);
        assert_eq!(r.segment_index_at(399.0), 2);
        assert_eq!(r.segment_index_at(400.0), 2);
        assert_eq!(r.segment_index_at(1e9), 2);
    }

    #[test]
    fn test_segment_overlap() {
        let r = route();
        let s = r.segment(1).unwrap();
        assert_eq!(s.overlap_m(0.0, 400.0), 50.0);
        assert_eq!(s.overlap_m(120.0, 130.0), 10.0);
        assert_eq!(s.overlap_m(200.0, 300.0), 0.0);
    }

    #[test]
    fn test_clamp_distance() {
        let r = route();
        assert_eq!(r.clamp_distance(f64::NAN), 0.0);
        assert_eq!(r.clamp_distance(500.0), 400.0);
    }
}
