//! Ingestion: validation, ordering and dispatch of raw pings to lanes.

pub mod gateway;
pub mod lanes;
pub mod stats;

pub use gateway::Gateway;
pub use lanes::{Enqueued, Lane, Lanes};
pub use stats::{IngestStats, StatsSnapshot};
