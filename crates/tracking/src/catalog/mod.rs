//! Immutable route catalog, loaded once at startup.
//!
//! This type is cheap to clone since all data is stored in `Arc`s, and it is
//! never mutated after [`RouteCatalog::load`], so lanes and queries share it
//! without synchronization.

pub mod dataset;

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use geo::{Coord, Line, LineString, Point};
use tracing::info;

use crate::identifiers::*;
use crate::models::route::{Route, Segment, Stop};
use crate::models::types::{ConfigError, Result};
use crate::spatial::index::SpatialIndex;
use crate::spatial::queries::{haversine_distance, project_onto_line};

use dataset::{RouteDataset, RouteDefinition, StopDefinition};

/// Stops listed up to this far past the computed route length are placed at
/// the route end instead of rejected, absorbing rounding in the dataset.
const END_OF_ROUTE_TOLERANCE_M: f64 = 1.0;

/// One route's record for a stop identifier.
#[derive(Clone, Debug)]
pub struct ServedStop {
    pub route: Arc<Route>,
    pub stop_index: usize,
}

impl ServedStop {
    pub fn stop(&self) -> &Stop {
        &self.route.stops()[self.stop_index]
    }
}

#[derive(Clone)]
pub struct RouteCatalog {
    routes: Vec<Arc<Route>>,
    route_map: HashMap<RouteIdentifier, Arc<Route>>,
    stop_map: HashMap<StopIdentifier, Vec<ServedStop>>,
    index: Arc<SpatialIndex>,
}

impl RouteCatalog {
    /// Validate route definitions and build lookup maps plus the spatial index.
    pub fn load(definitions: Vec<RouteDefinition>) -> Result<Self> {
        if definitions.is_empty() {
            return Err(ConfigError::EmptyDataset);
        }

        let mut seen = HashSet::new();
        let mut routes = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let route = build_route(definition)?;
            if !seen.insert(route.id.clone()) {
                return Err(ConfigError::DuplicateRoute(route.id));
            }
            routes.push(Arc::new(route));
        }

        let route_map: HashMap<_, _> = routes.iter().map(|r| (r.id.clone(), r.clone())).collect();

        let mut stop_map: HashMap<StopIdentifier, Vec<ServedStop>> = HashMap::new();
        for route in &routes {
            for (stop_index, stop) in route.stops().iter().enumerate() {
                stop_map.entry(stop.id.clone()).or_default().push(ServedStop {
                    route: route.clone(),
                    stop_index,
                });
            }
        }

        let index = Arc::new(SpatialIndex::build(&routes));

        info!(
            routes = routes.len(),
            stops = stop_map.len(),
            segments = index.segment_count(),
            "route catalog loaded"
        );

        Ok(Self {
            routes,
            route_map,
            stop_map,
            index,
        })
    }

    pub fn from_dataset(dataset: RouteDataset) -> Result<Self> {
        Self::load(dataset.routes)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let dataset: RouteDataset = serde_json::from_reader(reader)?;
        Self::from_dataset(dataset)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn get_route(&self, id: &RouteIdentifier) -> Option<&Arc<Route>> {
        self.route_map.get(id)
    }

    /// Every route's record for this stop, or `None` for an unknown stop.
    pub fn get_stop(&self, id: &StopIdentifier) -> Option<&[ServedStop]> {
        self.stop_map.get(id).map(Vec::as_slice)
    }

    pub fn segment(&self, route: &RouteIdentifier, index: usize) -> Option<&Segment> {
        self.route_map.get(route)?.segment(index)
    }

    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    /// Routes with geometry within `radius_m` of `point`, nearest first.
    pub fn routes_near(&self, point: Point, radius_m: f64) -> Vec<Arc<Route>> {
        let mut seen = HashSet::new();
        self.index
            .nearest_segments(point, usize::MAX, radius_m)
            .into_iter()
            .filter(|hit| seen.insert(hit.route.id.clone()))
            .map(|hit| hit.route)
            .collect()
    }
}

fn valid_coord(lon: f64, lat: f64) -> bool {
    lon.is_finite() && lat.is_finite() && (-180.0..=180.0).contains(&lon) && (-90.0..=90.0).contains(&lat)
}

fn build_route(definition: RouteDefinition) -> Result<Route> {
    let RouteDefinition { id, name, shape, stops } = definition;
    if id.is_empty() {
        return Err(ConfigError::EmptyRouteId);
    }

    let mut coords: Vec<Coord> = Vec::with_capacity(shape.len());
    for [lon, lat] in shape {
        if !valid_coord(lon, lat) {
            return Err(ConfigError::InvalidCoordinate { route: id, lon, lat });
        }
        let coord = Coord { x: lon, y: lat };
        // Repeated points would produce zero-length segments
        if coords.last() != Some(&coord) {
            coords.push(coord);
        }
    }
    if coords.len() < 2 {
        return Err(ConfigError::DegenerateGeometry {
            route: id,
            points: coords.len(),
        });
    }

    let shape = LineString::from(coords);
    let mut segments = Vec::with_capacity(shape.0.len() - 1);
    let mut start_m = 0.0;
    for (index, line) in shape.lines().enumerate() {
        let length_m = haversine_distance(line.start.into(), line.end.into());
        segments.push(Segment {
            route_id: id.clone(),
            index,
            line,
            start_m,
            length_m,
        });
        start_m += length_m;
    }
    let length_m = start_m;

    let mut placed = Vec::with_capacity(stops.len());
    let mut previous_m = 0.0;
    for definition in stops {
        let stop = place_stop(&id, definition, &segments, length_m, previous_m)?;
        previous_m = stop.distance_m;
        placed.push(stop);
    }

    let name: Arc<str> = name.unwrap_or_else(|| id.to_string()).into();
    Ok(Route::new(id, name, shape, segments, placed))
}

fn place_stop(
    route: &RouteIdentifier,
    definition: StopDefinition,
    segments: &[Segment],
    length_m: f64,
    previous_m: f64,
) -> Result<Stop> {
    let StopDefinition {
        id,
        name,
        lon,
        lat,
        distance_m,
    } = definition;

    if id.is_empty() {
        return Err(ConfigError::EmptyStopId { route: route.clone() });
    }
    if !valid_coord(lon, lat) {
        return Err(ConfigError::InvalidCoordinate {
            route: route.clone(),
            lon,
            lat,
        });
    }
    let location = Point::new(lon, lat);

    let distance_m = match distance_m {
        Some(d) => d,
        None => project_stop(location, segments, previous_m),
    };

    if !distance_m.is_finite() || distance_m < 0.0 || distance_m > length_m + END_OF_ROUTE_TOLERANCE_M {
        return Err(ConfigError::StopOutOfRange {
            route: route.clone(),
            stop: id,
            distance_m,
            length_m,
        });
    }
    if distance_m < previous_m {
        return Err(ConfigError::StopsOutOfOrder {
            route: route.clone(),
            stop: id,
            distance_m,
            previous_m,
        });
    }

    Ok(Stop {
        id,
        name: name.map(Into::into),
        location,
        route_id: route.clone(),
        distance_m: distance_m.min(length_m),
    })
}

/// Distance-along-route of the closest point to `location` at or after
/// `from_m`, so loops and out-and-back routes place stops in order.
fn project_stop(location: Point, segments: &[Segment], from_m: f64) -> f64 {
    let mut best: Option<(f64, f64)> = None;
    for segment in segments.iter().filter(|s| s.end_m() >= from_m) {
        let line: Line = if segment.start_m < from_m {
            // Only the part of the segment past the previous stop
            let fraction = (from_m - segment.start_m) / segment.length_m;
            let start = segment.line.start + segment.line.delta() * fraction;
            Line::new(start, segment.line.end)
        } else {
            segment.line
        };
        let projection = project_onto_line(location, line);
        let line_start_m = segment.start_m.max(from_m);
        let along = line_start_m + projection.fraction * (segment.end_m() - line_start_m);
        if best.map_or(true, |(offset, _)| projection.offset_m < offset) {
            best = Some((projection.offset_m, along));
        }
    }
    best.map_or(from_m, |(_, along)| along)
}
