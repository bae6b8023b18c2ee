//! Spatial indexing and query utilities.

pub mod index;
pub mod queries;

pub use index::{SegmentHit, SpatialIndex, StopHit};
pub use queries::{haversine_distance, project_onto_line, Projection};
