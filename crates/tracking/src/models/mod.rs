//! Route network and vehicle data models, plus error types.

pub mod route;
pub mod types;
pub mod vehicle;

// Re-exports for convenience
pub use route::{Route, Segment, Stop};
pub use types::{ConfigError, IngestError, QueryError, RejectReason, Result, ValidationError};
pub use vehicle::{MatchState, OrderKey, PositionPing, RouteMatch, VehicleState, VehicleSummary};
