//! Arrival projections from live vehicle state and segment speeds.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use geo::Point;
use serde::Serialize;

use crate::catalog::RouteCatalog;
use crate::config::TrackingConfig;
use crate::identifiers::*;
use crate::models::route::Route;
use crate::models::types::QueryError;
use crate::models::vehicle::{VehicleState, VehicleSummary};
use crate::speed::SegmentSpeedModel;
use crate::store::VehicleStore;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Arrival {
    pub vehicle_id: VehicleIdentifier,
    pub route_id: RouteIdentifier,
    pub stop_id: StopIdentifier,
    pub eta: DateTime<Utc>,
    /// Projected travel time from the vehicle's last fix.
    pub travel_time_s: f64,
    /// Distance left along the route.
    pub remaining_m: f64,
    pub confidence: EtaConfidence,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct EtaConfidence {
    /// Overall usability in [0, 1].
    pub score: f64,
    /// Seconds since the vehicle last reported.
    pub age_s: f64,
    /// Half-width of the plausible arrival window, in seconds.
    pub uncertainty_s: f64,
    /// Consecutive fixes matched to the route.
    pub samples: u32,
}

pub struct EtaEngine {
    catalog: Arc<RouteCatalog>,
    store: Arc<VehicleStore>,
    speeds: Arc<SegmentSpeedModel>,
    min_confidence: f64,
    vehicle_speed_weight: f64,
    min_speed_mps: f64,
    staleness_threshold_s: f64,
}

impl EtaEngine {
    pub fn new(
        catalog: Arc<RouteCatalog>,
        store: Arc<VehicleStore>,
        speeds: Arc<SegmentSpeedModel>,
        config: &TrackingConfig,
    ) -> Self {
        Self {
            catalog,
            store,
            speeds,
            min_confidence: config.eta.min_confidence,
            vehicle_speed_weight: config.eta.vehicle_speed_weight,
            min_speed_mps: config.speed.min_speed_mps,
            staleness_threshold_s: config.store.staleness_threshold_s as f64,
        }
    }

    /// Upcoming arrivals at `stop_id`, soonest first, optionally restricted
    /// to one route.
    pub fn list_arrivals(
        &self,
        stop_id: &StopIdentifier,
        route_filter: Option<&RouteIdentifier>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arrival>, QueryError> {
        let served = self
            .catalog
            .get_stop(stop_id)
            .ok_or_else(|| QueryError::StopNotFound(stop_id.clone()))?;
        if let Some(route_id) = route_filter {
            if self.catalog.get_route(route_id).is_none() {
                return Err(QueryError::RouteNotFound(route_id.clone()));
            }
        }

        let mut arrivals = Vec::new();
        for served_stop in served
            .iter()
            .filter(|s| route_filter.map_or(true, |r| &s.route.id == r))
        {
            let stop = served_stop.stop();
            for vehicle in self.store.list_by_route(&served_stop.route.id) {
                if vehicle.is_stale(now, self.staleness_threshold_s) {
                    continue;
                }
                if let Some(arrival) = self.project(&served_stop.route, stop_id, stop.distance_m, &vehicle, now) {
                    arrivals.push(arrival);
                }
            }
        }

        arrivals.sort_by(|a, b| a.eta.cmp(&b.eta).then_with(|| a.vehicle_id.cmp(&b.vehicle_id)));
        Ok(arrivals)
    }

    /// Vehicles, matched or not, within `radius_m` of `point`, nearest first.
    pub fn list_vehicles_near(&self, point: Point, radius_m: f64, now: DateTime<Utc>) -> Vec<VehicleSummary> {
        self.store
            .list_near(point, radius_m)
            .into_iter()
            .filter(|(state, _)| !state.is_stale(now, self.staleness_threshold_s))
            .map(|(state, _)| state.summary(point))
            .collect()
    }

    fn project(
        &self,
        route: &Route,
        stop_id: &StopIdentifier,
        stop_m: f64,
        vehicle: &VehicleState,
        now: DateTime<Utc>,
    ) -> Option<Arrival> {
        let fix = vehicle.state.route_match()?;
        if fix.distance_m > stop_m {
            return None;
        }

        let vehicle_speed = vehicle.speed_mps.filter(|v| *v >= self.min_speed_mps);
        let travel_time_s = self.travel_time_s(route, fix.distance_m, stop_m, vehicle_speed, now)?;

        let age_s = vehicle.age_s(now);
        let n = vehicle.samples as f64;
        let freshness = (1.0 - age_s / self.staleness_threshold_s).clamp(0.0, 1.0);
        let score = (vehicle.confidence * n / (n + 1.0) * freshness).clamp(0.0, 1.0);
        if score < self.min_confidence {
            return None;
        }

        Some(Arrival {
            vehicle_id: vehicle.vehicle_id.clone(),
            route_id: route.id.clone(),
            stop_id: stop_id.clone(),
            eta: fix.fixed_at + Duration::milliseconds((travel_time_s * 1000.0).round() as i64),
            travel_time_s,
            remaining_m: stop_m - fix.distance_m,
            confidence: EtaConfidence {
                score,
                age_s,
                uncertainty_s: travel_time_s * (1.0 - score) + age_s,
                samples: vehicle.samples,
            },
        })
    }

    /// Expected seconds to cover `[from_m, to_m]` along `route`. The first
    /// segment blends in the vehicle's own speed; later ones use the model.
    fn travel_time_s(
        &self,
        route: &Route,
        from_m: f64,
        to_m: f64,
        vehicle_speed_mps: Option<f64>,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let first = route.segment_index_at(from_m);
        let mut blended = false;
        let mut total_s = 0.0;

        for segment in &route.segments()[first..] {
            if segment.start_m >= to_m {
                break;
            }
            let covered_m = segment.overlap_m(from_m, to_m);
            if covered_m <= 0.0 {
                continue;
            }
            let estimate = self.speeds.estimate_travel_time(&route.id, segment.index, now)?;
            let mut segment_s = estimate.seconds;
            if !blended {
                if let Some(speed) = vehicle_speed_mps {
                    let vehicle_s = segment.length_m / speed;
                    let n = estimate.samples as f64;
                    let w = self.vehicle_speed_weight;
                    if n + w > 0.0 {
                        segment_s = (n * estimate.seconds + w * vehicle_s) / (n + w);
                    }
                }
                blended = true;
            }
            total_s += segment_s * covered_m / segment.length_m;
        }
        Some(total_s)
    }
}
