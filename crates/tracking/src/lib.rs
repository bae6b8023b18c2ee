//! # dnerve-tracking
//!
//! Real-time vehicle tracking and arrival estimation for informal transit.
//!
//! ## Features
//!
//! - **Map-matching**: Noisy GPS fixes projected onto a static route network,
//!   with continuity across overlapping corridors and regression handling
//! - **Live state**: Sharded per-vehicle state with staleness eviction and a
//!   proximity grid
//! - **Segment speeds**: Rolling travel times per route segment, decaying to a
//!   network prior when unobserved
//! - **Arrivals**: Per-stop ETAs annotated with a confidence score
//! - **Pipeline**: Validation, per-vehicle ordering and bounded lanes with load
//!   shedding, on tokio
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use chrono::{Duration, TimeZone, Utc};
//! use dnerve_tracking::prelude::*;
//! use geo::Point;
//!
//! // A straight ~2.5 km route due north, stops projected from their coordinates
//! let dataset = r#"{ "routes": [{
//!     "id": "R1",
//!     "shape": [[31.2, 30.0], [31.2, 30.009], [31.2, 30.0225]],
//!     "stops": [
//!         { "id": "A", "lon": 31.2, "lat": 30.0 },
//!         { "id": "B", "lon": 31.2, "lat": 30.009 },
//!         { "id": "C", "lon": 31.2, "lat": 30.0225 }
//!     ]
//! }] }"#;
//! let catalog = Arc::new(RouteCatalog::from_reader(dataset.as_bytes())?);
//! let tracker = Tracker::new(catalog, TrackingConfig::default())?;
//!
//! // ~500 m in, then ~900 m in 40 s later
//! let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
//! let t1 = t0 + Duration::seconds(40);
//! tracker.ingest(PositionPing::new("V1", Point::new(31.2, 30.0045), t0), t0)?;
//! tracker.ingest(PositionPing::new("V1", Point::new(31.2, 30.0081), t1), t1)?;
//!
//! let arrivals = tracker.list_arrivals(&"B".into(), None, t1)?;
//! assert_eq!(arrivals[0].vehicle_id.as_str(), "V1");
//! let eta = arrivals[0].eta - t0;
//! assert!((eta.num_seconds() - 50).abs() <= 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod catalog;
pub mod config;
pub mod eta;
pub mod identifiers;
pub mod ingest;
pub mod matcher;
pub mod models;
pub mod service;
pub mod spatial;
pub mod speed;
pub mod store;
pub mod tracker;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub mod prelude {
    pub use crate::catalog::dataset::{RouteDataset, RouteDefinition, StopDefinition};
    pub use crate::catalog::RouteCatalog;
    pub use crate::config::*;
    pub use crate::eta::{Arrival, EtaConfidence};
    pub use crate::identifiers::*;
    pub use crate::ingest::StatsSnapshot;
    pub use crate::matcher::Transition;
    pub use crate::models::*;
    pub use crate::service::{ShutdownOutcome, TrackingService};
    pub use crate::tracker::{SweepReport, Tracker};
}

pub use prelude::*;
