//! Error types shared across the tracking core.

use strum::{EnumCount, EnumIter, IntoStaticStr};

use crate::identifiers::*;

// ============================================================================
// Configuration / dataset errors
// ============================================================================

/// Fatal at startup: the core cannot serve without a valid network and
/// consistent settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Route dataset contains no routes")]
    EmptyDataset,

    #[error("Route has an empty identifier")]
    EmptyRouteId,

    #[error("Duplicate route: {0}")]
    DuplicateRoute(RouteIdentifier),

    #[error("Route {route} has {points} distinct geometry points, at least 2 are required")]
    DegenerateGeometry { route: RouteIdentifier, points: usize },

    #[error("Route {route} has an invalid coordinate ({lon}, {lat})")]
    InvalidCoordinate {
        route: RouteIdentifier,
        lon: f64,
        lat: f64,
    },

    #[error("Route {route} has a stop with an empty identifier")]
    EmptyStopId { route: RouteIdentifier },

    #[error("Stop {stop} on route {route} is at {distance_m} m, before the previous stop at {previous_m} m")]
    StopsOutOfOrder {
        route: RouteIdentifier,
        stop: StopIdentifier,
        distance_m: f64,
        previous_m: f64,
    },

    #[error("Stop {stop} on route {route} is at {distance_m} m, outside the route length of {length_m} m")]
    StopOutOfRange {
        route: RouteIdentifier,
        stop: StopIdentifier,
        distance_m: f64,
        length_m: f64,
    },

    #[error("Invalid setting {name}: {reason}")]
    InvalidSetting { name: &'static str, reason: String },

    #[error("Failed to parse route dataset: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Failed to read route dataset: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Ping validation
// ============================================================================

/// Why a ping was dropped by the gateway.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Vehicle identifier is empty")]
    EmptyVehicleId,

    #[error("Coordinate ({lon}, {lat}) is not a valid position")]
    InvalidCoordinate { lat: f64, lon: f64 },

    #[error("Coordinate ({lon}, {lat}) is outside the service area")]
    OutOfBounds { lat: f64, lon: f64 },

    #[error("Ping is {age_s} s old")]
    TooOld { age_s: i64 },

    #[error("Ping is {skew_s} s in the future")]
    FromFuture { skew_s: i64 },

    #[error("Reported speed {0} is not a valid speed")]
    InvalidSpeed(f64),

    #[error("Reported heading {0} is not a valid heading")]
    InvalidHeading(f64),

    #[error("Ping is older than the last accepted ping for this vehicle")]
    OutOfOrder,

    #[error("Ping was already accepted for this vehicle")]
    Duplicate,
}

/// Fieldless view of [`ValidationError`], used for counters and wire codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum RejectReason {
    EmptyVehicleId,
    InvalidCoordinate,
    OutOfBounds,
    TooOld,
    FromFuture,
    InvalidSpeed,
    InvalidHeading,
    OutOfOrder,
    Duplicate,
}

impl RejectReason {
    pub fn code(self) -> &'static str {
        self.into()
    }
}

impl ValidationError {
    pub fn reason(&self) -> RejectReason {
        match self {
            Self::EmptyVehicleId => RejectReason::EmptyVehicleId,
            Self::InvalidCoordinate { .. } => RejectReason::InvalidCoordinate,
            Self::OutOfBounds { .. } => RejectReason::OutOfBounds,
            Self::TooOld { .. } => RejectReason::TooOld,
            Self::FromFuture { .. } => RejectReason::FromFuture,
            Self::InvalidSpeed(_) => RejectReason::InvalidSpeed,
            Self::InvalidHeading(_) => RejectReason::InvalidHeading,
            Self::OutOfOrder => RejectReason::OutOfOrder,
            Self::Duplicate => RejectReason::Duplicate,
        }
    }

    /// Stable code reported back to the transport that delivered the ping.
    pub fn code(&self) -> &'static str {
        self.reason().code()
    }
}

// ============================================================================
// Ingestion / queries
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("Ingestion is closed")]
    Closed,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Stop not found: {0}")]
    StopNotFound(StopIdentifier),

    #[error("Route not found: {0}")]
    RouteNotFound(RouteIdentifier),
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;
