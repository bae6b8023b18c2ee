//! Pings and live per-vehicle state.

use chrono::{DateTime, Utc};
use geo::Point;
use serde::{Deserialize, Serialize};

use crate::identifiers::*;
use crate::spatial::haversine_distance;

/// One reported vehicle position sample, as delivered by the transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionPing {
    pub vehicle_id: VehicleIdentifier,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub speed_mps: Option<f64>,
    #[serde(default)]
    pub heading_deg: Option<f64>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl PositionPing {
    pub fn new(vehicle_id: impl Into<VehicleIdentifier>, location: Point, timestamp: DateTime<Utc>) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            lat: location.y(),
            lon: location.x(),
            timestamp,
            speed_mps: None,
            heading_deg: None,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn location(&self) -> Point {
        Point::new(self.lon, self.lat)
    }

    pub fn order_key(&self) -> OrderKey {
        OrderKey {
            timestamp: self.timestamp,
            sequence: self.sequence,
        }
    }
}

/// Per-vehicle ordering key: the sequence number when the device sends one,
/// the timestamp otherwise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrderKey {
    pub timestamp: DateTime<Utc>,
    pub sequence: Option<u64>,
}

impl OrderKey {
    /// Whether a ping with this key may follow one with `previous`.
    /// Timestamps never go backwards; equal keys are duplicates.
    pub fn supersedes(&self, previous: &OrderKey) -> bool {
        if self.timestamp < previous.timestamp {
            return false;
        }
        match (self.sequence, previous.sequence) {
            (Some(current), Some(last)) => current > last,
            _ => self.timestamp > previous.timestamp,
        }
    }
}

/// Position of a vehicle on a specific route, from a single fix.
#[derive(Clone, Debug, PartialEq)]
pub struct RouteMatch {
    pub route_id: RouteIdentifier,
    pub segment_index: usize,
    pub distance_m: f64,
    /// Perpendicular distance between the raw fix and the route.
    pub offset_m: f64,
    pub fixed_at: DateTime<Utc>,
}

/// Matcher state machine for one vehicle.
///
/// `Suspect` holds the last trusted match after a fix that regressed beyond
/// the jitter tolerance; `penalties` counts consecutive inconsistent fixes.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchState {
    Unmatched,
    Matched(RouteMatch),
    Suspect { held: RouteMatch, penalties: u32 },
}

impl MatchState {
    pub fn route_match(&self) -> Option<&RouteMatch> {
        match self {
            Self::Unmatched => None,
            Self::Matched(m) | Self::Suspect { held: m, .. } => Some(m),
        }
    }

    pub fn route_id(&self) -> Option<&RouteIdentifier> {
        self.route_match().map(|m| &m.route_id)
    }

    pub fn penalties(&self) -> u32 {
        match self {
            Self::Suspect { penalties, .. } => *penalties,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VehicleState {
    pub vehicle_id: VehicleIdentifier,
    /// Last raw position reported, matched or not.
    pub location: Point,
    pub heading_deg: Option<f64>,
    pub state: MatchState,
    pub last_seen: DateTime<Utc>,
    pub order: OrderKey,
    pub speed_mps: Option<f64>,
    pub confidence: f64,
    /// Consecutive fixes matched to the current route.
    pub samples: u32,
}

impl VehicleState {
    pub fn age_s(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.last_seen).num_milliseconds() as f64 / 1000.0).max(0.0)
    }

    pub fn is_stale(&self, now: DateTime<Utc>, threshold_s: f64) -> bool {
        self.age_s(now) > threshold_s
    }

    pub fn summary(&self, from: Point) -> VehicleSummary {
        let route_match = self.state.route_match();
        VehicleSummary {
            vehicle_id: self.vehicle_id.clone(),
            lat: self.location.y(),
            lon: self.location.x(),
            route_id: route_match.map(|m| m.route_id.clone()),
            distance_along_m: route_match.map(|m| m.distance_m),
            speed_mps: self.speed_mps,
            confidence: self.confidence,
            last_seen: self.last_seen,
            distance_m: haversine_distance(from, self.location),
        }
    }
}

/// Read-only view of a vehicle returned by proximity queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VehicleSummary {
    pub vehicle_id: VehicleIdentifier,
    pub lat: f64,
    pub lon: f64,
    pub route_id: Option<RouteIdentifier>,
    pub distance_along_m: Option<f64>,
    pub speed_mps: Option<f64>,
    pub confidence: f64,
    pub last_seen: DateTime<Utc>,
    /// Distance from the query point.
    pub distance_m: f64,
}
