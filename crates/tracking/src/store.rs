//! Live vehicle state, keyed by vehicle id.
//!
//! The primary map is sharded, so writers for different vehicles rarely
//! share a lock. A secondary grid view maps coarse lat/lon cells to the
//! vehicles last seen in them, for proximity queries without a full scan.
//!
//! Lock order is always primary entry, then grid cells. Upsert and eviction
//! for one vehicle both run under its primary shard lock, so the grid view
//! never disagrees with the primary map for longer than one of those calls.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use geo::Point;
use tracing::debug;

use crate::config::StoreConfig;
use crate::identifiers::*;
use crate::models::vehicle::VehicleState;
use crate::spatial::queries::{haversine_distance, meters_to_degrees_at, METERS_PER_DEGREE};

type Cell = (i32, i32);

/// Above this many grid cells a proximity query scans the primary map instead.
const MAX_SCANNED_CELLS: i64 = 4096;

pub struct VehicleStore {
    vehicles: DashMap<VehicleIdentifier, VehicleState>,
    cells: DashMap<Cell, HashSet<VehicleIdentifier>>,
    cell_deg: f64,
    staleness_threshold_s: f64,
}

impl VehicleStore {
    pub fn new(config: &StoreConfig) -> Self {
        Self {
            vehicles: DashMap::new(),
            cells: DashMap::new(),
            cell_deg: config.grid_cell_deg,
            staleness_threshold_s: config.staleness_threshold_s as f64,
        }
    }

    /// Store `state` unless the stored state is newer. Returns whether it was
    /// applied.
    pub fn upsert(&self, state: VehicleState) -> bool {
        let cell = self.cell_of(state.location);
        match self.vehicles.entry(state.vehicle_id.clone()) {
            Entry::Occupied(mut occupied) => {
                if state.last_seen < occupied.get().last_seen {
                    debug!(vehicle = %state.vehicle_id, "ignoring older state");
                    return false;
                }
                let previous = self.cell_of(occupied.get().location);
                if previous != cell {
                    self.unindex(previous, &state.vehicle_id);
                    self.index(cell, state.vehicle_id.clone());
                }
                occupied.insert(state);
            }
            Entry::Vacant(vacant) => {
                self.index(cell, state.vehicle_id.clone());
                vacant.insert(state);
            }
        }
        true
    }

    pub fn get(&self, vehicle_id: &VehicleIdentifier) -> Option<VehicleState> {
        self.vehicles.get(vehicle_id).map(|s| s.clone())
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Vehicles matched, or held, on `route_id`.
    pub fn list_by_route(&self, route_id: &RouteIdentifier) -> Vec<VehicleState> {
        self.vehicles
            .iter()
            .filter(|entry| entry.state.route_id() == Some(route_id))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Vehicles whose last position lies within `radius_m` of `point`,
    /// nearest first. Includes unmatched vehicles; staleness is left to the
    /// caller.
    pub fn list_near(&self, point: Point, radius_m: f64) -> Vec<(VehicleState, f64)> {
        if !(radius_m >= 0.0 && radius_m.is_finite() && point.x().is_finite() && point.y().is_finite()) {
            return Vec::new();
        }

        let lat_deg = radius_m / METERS_PER_DEGREE;
        let lon_deg = meters_to_degrees_at(point.y(), radius_m);
        let (min_x, min_y) = self.cell_of(Point::new(point.x() - lon_deg, point.y() - lat_deg));
        let (max_x, max_y) = self.cell_of(Point::new(point.x() + lon_deg, point.y() + lat_deg));
        let span = (max_x as i64 - min_x as i64 + 1) * (max_y as i64 - min_y as i64 + 1);

        let mut ids: HashSet<VehicleIdentifier> = HashSet::new();
        if span > MAX_SCANNED_CELLS {
            ids.extend(self.vehicles.iter().map(|entry| entry.key().clone()));
        } else {
            for x in min_x..=max_x {
                for y in min_y..=max_y {
                    if let Some(cell) = self.cells.get(&(x, y)) {
                        ids.extend(cell.iter().cloned());
                    }
                }
            }
        }

        let mut near: Vec<(VehicleState, f64)> = ids
            .iter()
            .filter_map(|id| self.get(id))
            .map(|state| {
                let distance = haversine_distance(point, state.location);
                (state, distance)
            })
            .filter(|(_, distance)| *distance <= radius_m)
            .collect();
        near.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.vehicle_id.cmp(&b.0.vehicle_id)));
        near
    }

    /// Remove every vehicle unseen for longer than the staleness threshold.
    pub fn evict_stale(&self, now: DateTime<Utc>) -> Vec<VehicleIdentifier> {
        let candidates: Vec<VehicleIdentifier> = self
            .vehicles
            .iter()
            .filter(|entry| entry.is_stale(now, self.staleness_threshold_s))
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for vehicle_id in candidates {
            // Re-checked under the entry lock: a fresh ping may have landed
            if let Entry::Occupied(occupied) = self.vehicles.entry(vehicle_id) {
                if occupied.get().is_stale(now, self.staleness_threshold_s) {
                    self.unindex(self.cell_of(occupied.get().location), occupied.key());
                    let (vehicle_id, _) = occupied.remove_entry();
                    evicted.push(vehicle_id);
                }
            }
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "evicted stale vehicles");
        }
        evicted
    }

    pub fn staleness_threshold_s(&self) -> f64 {
        self.staleness_threshold_s
    }

    fn cell_of(&self, point: Point) -> Cell {
        let x = (point.x() / self.cell_deg).floor();
        let y = (point.y() / self.cell_deg).floor();
        // `as` saturates, and NaN maps to 0
        (x as i32, y as i32)
    }

    fn index(&self, cell: Cell, vehicle_id: VehicleIdentifier) {
        self.cells.entry(cell).or_default().insert(vehicle_id);
    }

    fn unindex(&self, cell: Cell, vehicle_id: &VehicleIdentifier) {
        if let Entry::Occupied(mut occupied) = self.cells.entry(cell) {
            occupied.get_mut().remove(vehicle_id);
            if occupied.get().is_empty() {
                occupied.remove();
            }
        }
    }
}
