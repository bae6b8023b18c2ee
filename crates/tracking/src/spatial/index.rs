//! R-tree index over route segments and stops.
//!
//! ## Two-Stage Filtering
//!
//! Queries use a two-stage filtering approach:
//! 1. **R-tree filter**: Euclidean distance in degree space with a radius
//!    widened for the query latitude, so the candidate set is a superset
//! 2. **Ground filter**: exact meters (Haversine or local projection) on the
//!    filtered results, which also provides the ordering
//!
//! An empty result is the normal "nothing nearby" answer, never an error.

use std::sync::Arc;

use geo::{Line, Point};
use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::models::route::{Route, Stop};
use crate::spatial::queries::{haversine_distance, meters_to_degrees_at, project_onto_line};

// ============================================================================
// Stop Spatial Node
// ============================================================================

#[derive(Clone)]
pub struct StopNode {
    pub route: Arc<Route>,
    pub stop_index: usize,
    point: [f64; 2],
}

impl StopNode {
    pub fn new(route: Arc<Route>, stop_index: usize, location: Point) -> Self {
        Self {
            route,
            stop_index,
            point: [location.x(), location.y()],
        }
    }

    pub fn stop(&self) -> &Stop {
        &self.route.stops()[self.stop_index]
    }
}

impl RTreeObject for StopNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.point)
    }
}

impl PointDistance for StopNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.point[0] - point[0];
        let dy = self.point[1] - point[1];
        dx * dx + dy * dy
    }
}

// ============================================================================
// Route Segment Spatial Node
// ============================================================================

#[derive(Clone)]
pub struct SegmentNode {
    pub route: Arc<Route>,
    pub segment_index: usize,
    pub line: Line,
    aabb: AABB<[f64; 2]>,
}

impl SegmentNode {
    pub fn new(route: Arc<Route>, segment_index: usize, line: Line) -> Self {
        let start = [line.start.x, line.start.y];
        let end = [line.end.x, line.end.y];

        Self {
            route,
            segment_index,
            line,
            aabb: AABB::from_corners(start, end),
        }
    }
}

impl RTreeObject for SegmentNode {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.aabb
    }
}

impl PointDistance for SegmentNode {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        // Distance from point to line segment (squared Euclidean distance)
        let p = [point[0], point[1]];
        let a = [self.line.start.x, self.line.start.y];
        let b = [self.line.end.x, self.line.end.y];

        let ab = [b[0] - a[0], b[1] - a[1]];
        let ap = [p[0] - a[0], p[1] - a[1]];

        let ab_ab = ab[0] * ab[0] + ab[1] * ab[1];

        if ab_ab == 0.0 {
            // Segment is actually a point
            return ap[0] * ap[0] + ap[1] * ap[1];
        }

        let ab_ap = ab[0] * ap[0] + ab[1] * ap[1];
        let t = (ab_ap / ab_ab).clamp(0.0, 1.0);

        let closest = [a[0] + t * ab[0], a[1] + t * ab[1]];
        let dx = p[0] - closest[0];
        let dy = p[1] - closest[1];

        dx * dx + dy * dy
    }
}

// ============================================================================
// Query results
// ============================================================================

/// A route segment near a query point.
#[derive(Clone, Debug)]
pub struct SegmentHit {
    pub route: Arc<Route>,
    pub segment_index: usize,
    /// Perpendicular distance from the query point.
    pub offset_m: f64,
    /// Distance-along-route of the projected point, within the route length.
    pub distance_along_m: f64,
}

#[derive(Clone, Debug)]
pub struct StopHit {
    pub route: Arc<Route>,
    pub stop_index: usize,
    pub distance_m: f64,
}

impl StopHit {
    pub fn stop(&self) -> &Stop {
        &self.route.stops()[self.stop_index]
    }
}

// ============================================================================
// Index
// ============================================================================

#[derive(Clone)]
pub struct SpatialIndex {
    segments: RTree<SegmentNode>,
    stops: RTree<StopNode>,
}

impl SpatialIndex {
    pub fn build(routes: &[Arc<Route>]) -> Self {
        let mut segment_nodes = Vec::new();
        let mut stop_nodes = Vec::new();

        for route in routes {
            for segment in route.segments() {
                segment_nodes.push(SegmentNode::new(route.clone(), segment.index, segment.line));
            }
            for (i, stop) in route.stops().iter().enumerate() {
                stop_nodes.push(StopNode::new(route.clone(), i, stop.location));
            }
        }

        Self {
            segments: RTree::bulk_load(segment_nodes),
            stops: RTree::bulk_load(stop_nodes),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.size()
    }

    /// Up to `k` segments within `max_radius_m` of `point`, nearest first.
    pub fn nearest_segments(&self, point: Point, k: usize, max_radius_m: f64) -> Vec<SegmentHit> {
        if k == 0 || !valid_radius(max_radius_m) || !valid_point(point) {
            return Vec::new();
        }

        let radius_deg = meters_to_degrees_at(point.y(), max_radius_m);
        let mut hits: Vec<SegmentHit> = self
            .segments
            .locate_within_distance([point.x(), point.y()], radius_deg * radius_deg)
            .filter_map(|node| {
                let projection = project_onto_line(point, node.line);
                if projection.offset_m > max_radius_m {
                    return None;
                }
                let segment = node.route.segment(node.segment_index)?;
                let along = segment.start_m + projection.fraction * segment.length_m;
                Some(SegmentHit {
                    route: node.route.clone(),
                    segment_index: node.segment_index,
                    offset_m: projection.offset_m,
                    distance_along_m: node.route.clamp_distance(along),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.offset_m
                .total_cmp(&b.offset_m)
                .then_with(|| a.route.id.cmp(&b.route.id))
                .then_with(|| a.segment_index.cmp(&b.segment_index))
        });
        hits.truncate(k);
        hits
    }

    /// Up to `k` stops within `max_radius_m` of `point`, nearest first.
    pub fn nearest_stops(&self, point: Point, k: usize, max_radius_m: f64) -> Vec<StopHit> {
        if k == 0 || !valid_radius(max_radius_m) || !valid_point(point) {
            return Vec::new();
        }

        let radius_deg = meters_to_degrees_at(point.y(), max_radius_m);
        let mut hits: Vec<StopHit> = self
            .stops
            .locate_within_distance([point.x(), point.y()], radius_deg * radius_deg)
            .map(|node| StopHit {
                route: node.route.clone(),
                stop_index: node.stop_index,
                distance_m: haversine_distance(point, node.stop().location),
            })
            .filter(|hit| hit.distance_m <= max_radius_m)
            .collect();

        hits.sort_by(|a, b| a.distance_m.total_cmp(&b.distance_m));
        hits.truncate(k);
        hits
    }
}

fn valid_radius(radius_m: f64) -> bool {
    radius_m > 0.0 && radius_m.is_finite()
}

fn valid_point(point: Point) -> bool {
    point.x().is_finite() && point.y().is_finite()
}
