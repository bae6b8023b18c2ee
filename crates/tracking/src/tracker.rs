//! The synchronous tracking core: one object owning the gateway, matcher,
//! live state and speed model, with every time-dependent call taking `now`.
//!
//! [`crate::service::TrackingService`] runs this core on lane workers; tests
//! and embedders that bring their own scheduling drive it directly.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use geo::Point;
use tracing::{debug, info};

use crate::catalog::RouteCatalog;
use crate::config::TrackingConfig;
use crate::eta::{Arrival, EtaEngine};
use crate::identifiers::*;
use crate::ingest::{Gateway, IngestStats};
use crate::matcher::{MapMatcher, Transition};
use crate::models::types::{QueryError, Result, ValidationError};
use crate::models::vehicle::{PositionPing, VehicleState, VehicleSummary};
use crate::speed::SegmentSpeedModel;
use crate::store::VehicleStore;

/// What one sweep removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: usize,
    pub pruned_watermarks: usize,
}

pub struct Tracker {
    catalog: Arc<RouteCatalog>,
    config: TrackingConfig,
    gateway: Gateway,
    matcher: MapMatcher,
    store: Arc<VehicleStore>,
    speeds: Arc<SegmentSpeedModel>,
    eta: EtaEngine,
}

impl Tracker {
    pub fn new(catalog: Arc<RouteCatalog>, config: TrackingConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(VehicleStore::new(&config.store));
        let speeds = Arc::new(SegmentSpeedModel::new(catalog.clone(), config.speed.clone()));
        let eta = EtaEngine::new(catalog.clone(), store.clone(), speeds.clone(), &config);
        info!(
            routes = catalog.routes().len(),
            segments = catalog.index().segment_count(),
            "tracker ready"
        );

        Ok(Self {
            gateway: Gateway::new(config.ingest.clone()),
            matcher: MapMatcher::new(catalog.clone(), &config),
            catalog,
            config,
            store,
            speeds,
            eta,
        })
    }

    /// Validate and order-check a ping without processing it.
    pub fn admit(&self, ping: PositionPing, now: DateTime<Utc>) -> Result<PositionPing, ValidationError> {
        self.gateway.admit(ping, now)
    }

    /// Match an admitted ping and apply the result. Must be called by the
    /// single writer for the ping's vehicle.
    pub fn process(&self, ping: &PositionPing, now: DateTime<Utc>) -> Transition {
        let threshold_s = self.store.staleness_threshold_s();
        let prior = self
            .store
            .get(&ping.vehicle_id)
            .filter(|state| !state.is_stale(now, threshold_s));

        let outcome = self.matcher.match_ping(ping, prior.as_ref());
        for traversal in &outcome.traversals {
            let sample = self.speeds.record(traversal);
            debug!(
                route = %traversal.route_id,
                segment = traversal.segment_index,
                ?sample,
                "segment traversal"
            );
        }
        self.store.upsert(outcome.state);
        self.gateway.stats().observe_processed();
        outcome.transition
    }

    /// Admit and process in one step.
    pub fn ingest(&self, ping: PositionPing, now: DateTime<Utc>) -> Result<Transition, ValidationError> {
        let ping = self.admit(ping, now)?;
        Ok(self.process(&ping, now))
    }

    /// Evict stale vehicles and prune expired ordering watermarks.
    pub fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let evicted = self.store.evict_stale(now);
        self.gateway.stats().observe_evicted(evicted.len());
        let report = SweepReport {
            evicted: evicted.len(),
            pruned_watermarks: self.gateway.prune_watermarks(now),
        };
        if report != SweepReport::default() {
            debug!(?report, "sweep");
        }
        report
    }

    pub fn list_arrivals(
        &self,
        stop_id: &StopIdentifier,
        route_filter: Option<&RouteIdentifier>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Arrival>, QueryError> {
        self.eta.list_arrivals(stop_id, route_filter, now)
    }

    pub fn list_vehicles_near(&self, point: Point, radius_m: f64, now: DateTime<Utc>) -> Vec<VehicleSummary> {
        self.eta.list_vehicles_near(point, radius_m, now)
    }

    pub fn vehicle(&self, vehicle_id: &VehicleIdentifier) -> Option<VehicleState> {
        self.store.get(vehicle_id)
    }

    pub fn vehicle_count(&self) -> usize {
        self.store.len()
    }

    pub fn catalog(&self) -> &Arc<RouteCatalog> {
        &self.catalog
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn speeds(&self) -> &SegmentSpeedModel {
        &self.speeds
    }

    pub fn stats(&self) -> &IngestStats {
        self.gateway.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::types::{ConfigError, RejectReason};
    use crate::testing::*;

    fn tracker() -> Tracker {
        Tracker::new(catalog(vec![r1(), r2()]), config()).unwrap()
    }

    fn ping(vehicle: &str, distance_m: f64, east_m: f64, t: i64) -> PositionPing {
        PositionPing::new(vehicle, point_at(distance_m, east_m), at(t))
    }

    #[test]
    fn test_rejects_invalid_config() {
        let mut config = config();
        config.pipeline.lanes = 0;
        let err = Tracker::new(catalog(vec![r1()]), config).err().unwrap();
        assert!(matches!(err, ConfigError::InvalidSetting { name: "pipeline.lanes", .. }));
    }

    #[test]
    fn test_arrival_scenario() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 500.0, 0.0, 0), at(0)).unwrap();
        tracker.ingest(ping("V1", 900.0, 0.0, 40), at(40)).unwrap();

        let arrivals = tracker.list_arrivals(&"B".into(), Some(&"R1".into()), at(40)).unwrap();
        assert_eq!(arrivals.len(), 1);
        assert!((arrivals[0].eta - at(50)).num_milliseconds().abs() <= 100);
        assert_eq!(arrivals[0].confidence.samples, 2);
    }

    #[test]
    fn test_redelivery_does_not_change_state() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 500.0, 0.0, 0), at(0)).unwrap();
        tracker.ingest(ping("V1", 900.0, 0.0, 40), at(40)).unwrap();
        let before = tracker.vehicle(&"V1".into()).unwrap();

        let err = tracker.ingest(ping("V1", 900.0, 0.0, 40), at(41)).unwrap_err();
        assert_eq!(err, ValidationError::Duplicate);

        let after = tracker.vehicle(&"V1".into()).unwrap();
        assert_eq!(after.state, before.state);
        assert_eq!(after.samples, before.samples);
        assert_eq!(after.last_seen, before.last_seen);
        assert_eq!(tracker.stats().rejected(RejectReason::Duplicate), 1);
    }

    #[test]
    fn test_out_of_order_ping_is_dropped() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 900.0, 0.0, 40), at(40)).unwrap();

        let err = tracker.ingest(ping("V1", 500.0, 0.0, 0), at(41)).unwrap_err();
        assert_eq!(err, ValidationError::OutOfOrder);
        assert_eq!(tracker.vehicle(&"V1".into()).unwrap().last_seen, at(40));
    }

    #[test]
    fn test_unmatched_vehicle_is_visible_but_has_no_arrivals() {
        let tracker = tracker();
        let transition = tracker.ingest(ping("V9", 500.0, 2000.0, 0), at(0)).unwrap();
        assert_eq!(transition, Transition::Unmatched);

        let near = tracker.list_vehicles_near(point_at(500.0, 2000.0), 50.0, at(0));
        assert_eq!(near.len(), 1);
        assert!(tracker.list_arrivals(&"B".into(), None, at(0)).unwrap().is_empty());
    }

    #[test]
    fn test_sweep_evicts_stale_vehicles() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 500.0, 0.0, 0), at(0)).unwrap();
        tracker.ingest(ping("V1", 900.0, 0.0, 40), at(40)).unwrap();
        tracker.ingest(ping("V2", 100.0, 0.0, 600), at(600)).unwrap();

        let report = tracker.sweep(at(700));
        assert_eq!(report.evicted, 1);
        assert_eq!(report.pruned_watermarks, 1);
        assert!(tracker.vehicle(&"V1".into()).is_none());
        assert_eq!(tracker.vehicle_count(), 1);
        assert!(tracker.list_vehicles_near(point_at(900.0, 0.0), 100.0, at(700)).is_empty());
        assert_eq!(tracker.stats().snapshot().evicted, 1);

        // An evicted vehicle starts afresh
        let transition = tracker.ingest(ping("V1", 950.0, 0.0, 700), at(700)).unwrap();
        assert_eq!(transition, Transition::Acquired);
    }

    #[test]
    fn test_stale_prior_is_not_continued() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 500.0, 0.0, 0), at(0)).unwrap();
        // Back after 11 minutes without a sweep in between
        let transition = tracker.ingest(ping("V1", 2000.0, 0.0, 660), at(660)).unwrap();
        assert_eq!(transition, Transition::Acquired);
        assert_eq!(tracker.vehicle(&"V1".into()).unwrap().samples, 1);
    }

    #[test]
    fn test_traversals_feed_speed_model() {
        let tracker = tracker();
        tracker.ingest(ping("V1", 900.0, 0.0, 0), at(0)).unwrap();
        tracker.ingest(ping("V1", 1100.0, 0.0, 20), at(20)).unwrap();

        let stat = tracker.speeds().stat(&"R1".into(), 0).unwrap();
        assert_eq!(stat.samples, 1);
        assert_eq!(tracker.stats().snapshot().processed, 2);
    }
}
