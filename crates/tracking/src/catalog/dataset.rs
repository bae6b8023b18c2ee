//! Route-network dataset format.
//!
//! The dataset is produced by external route tooling and consumed read-only.
//! Coordinates are `[lon, lat]` pairs, matching GeoJSON order.
//!
//! ```json
//! {
//!   "routes": [{
//!     "id": "ramses-tahrir",
//!     "name": "Ramses - Tahrir",
//!     "shape": [[31.2467, 30.0626], [31.2357, 30.0444]],
//!     "stops": [
//!       { "id": "ramses", "lon": 31.2467, "lat": 30.0626, "distance_m": 0.0 },
//!       { "id": "tahrir", "lon": 31.2357, "lat": 30.0444 }
//!     ]
//!   }]
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::identifiers::*;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RouteDataset {
    pub routes: Vec<RouteDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: RouteIdentifier,
    #[serde(default)]
    pub name: Option<String>,
    pub shape: Vec<[f64; 2]>,
    #[serde(default)]
    pub stops: Vec<StopDefinition>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopDefinition {
    pub id: StopIdentifier,
    #[serde(default)]
    pub name: Option<String>,
    pub lon: f64,
    pub lat: f64,
    /// Cumulative distance from the route origin; projected from the
    /// coordinate when absent.
    #[serde(default)]
    pub distance_m: Option<f64>,
}
