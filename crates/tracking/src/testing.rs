//! Shared fixtures for unit tests.
//!
//! Routes run due north along the 31.2°E meridian from 30°N, where a degree
//! of latitude is exactly `METERS_PER_DEGREE`, so distances along them are
//! exact.

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use geo::Point;

use crate::catalog::dataset::{RouteDefinition, StopDefinition};
use crate::catalog::RouteCatalog;
use crate::config::TrackingConfig;
use crate::spatial::queries::METERS_PER_DEGREE;

pub const ORIGIN_LAT: f64 = 30.0;
pub const ORIGIN_LON: f64 = 31.2;

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Point `distance_m` north of the origin, shifted `east_m` east.
pub fn point_at(distance_m: f64, east_m: f64) -> Point {
    let lat = ORIGIN_LAT + distance_m / METERS_PER_DEGREE;
    let lon = ORIGIN_LON + east_m / (METERS_PER_DEGREE * ORIGIN_LAT.to_radians().cos());
    Point::new(lon, lat)
}

pub fn coord_at(distance_m: f64, east_m: f64) -> [f64; 2] {
    let p = point_at(distance_m, east_m);
    [p.x(), p.y()]
}

pub fn stop(id: &str, distance_m: f64) -> StopDefinition {
    let p = point_at(distance_m, 0.0);
    StopDefinition {
        id: id.into(),
        name: None,
        lon: p.x(),
        lat: p.y(),
        distance_m: Some(distance_m),
    }
}

/// R1: straight 2500 m route with stops A (0), B (1000) and C (2500).
pub fn r1() -> RouteDefinition {
    RouteDefinition {
        id: "R1".into(),
        name: Some("Route 1".into()),
        shape: vec![coord_at(0.0, 0.0), coord_at(1000.0, 0.0), coord_at(2500.0, 0.0)],
        stops: vec![stop("A", 0.0), stop("B", 1000.0), stop("C", 2500.0)],
    }
}

/// R2: shares R1's corridor for the first 1000 m, then turns east.
pub fn r2() -> RouteDefinition {
    RouteDefinition {
        id: "R2".into(),
        name: Some("Route 2".into()),
        shape: vec![coord_at(0.0, 0.0), coord_at(1000.0, 0.0), coord_at(1000.0, 1500.0)],
        stops: vec![stop("A", 0.0), stop("B", 1000.0)],
    }
}

pub fn catalog(routes: Vec<RouteDefinition>) -> Arc<RouteCatalog> {
    Arc::new(RouteCatalog::load(routes).unwrap())
}

/// Default settings; the fixture routes lie inside the default bounds.
pub fn config() -> TrackingConfig {
    TrackingConfig::default()
}
