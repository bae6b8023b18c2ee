//! Async runtime around [`Tracker`]: lane workers, the staleness sweeper and
//! graceful shutdown.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use geo::Point;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::eta::Arrival;
use crate::identifiers::*;
use crate::ingest::{Enqueued, Lanes, StatsSnapshot};
use crate::models::types::{IngestError, QueryError};
use crate::models::vehicle::{PositionPing, VehicleSummary};
use crate::tracker::Tracker;

/// How shutdown ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every lane drained before the deadline.
    Drained,
    /// The deadline passed; this many queued pings were abandoned.
    Aborted { abandoned: usize },
}

struct Workers {
    lanes: Vec<JoinHandle<()>>,
    sweeper: JoinHandle<()>,
}

pub struct TrackingService {
    tracker: Arc<Tracker>,
    lanes: Arc<Lanes>,
    workers: Mutex<Option<Workers>>,
}

impl TrackingService {
    /// Spawn one worker per lane and the sweeper on the current tokio
    /// runtime.
    pub fn start(tracker: Arc<Tracker>) -> Self {
        let pipeline = &tracker.config().pipeline;
        let lanes = Arc::new(Lanes::new(pipeline.lanes, pipeline.lane_capacity));

        let lane_workers = (0..lanes.count())
            .map(|index| {
                let tracker = tracker.clone();
                let lanes = lanes.clone();
                tokio::spawn(async move {
                    let Some(lane) = lanes.lane(index) else {
                        return;
                    };
                    while let Some(ping) = lane.pop().await {
                        tracker.process(&ping, Utc::now());
                    }
                    debug!(lane = index, "lane drained");
                })
            })
            .collect();

        let sweeper = {
            let tracker = tracker.clone();
            let every = Duration::from_secs(tracker.config().store.sweep_interval_s);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(every);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    tracker.sweep(Utc::now());
                }
            })
        };

        info!(lanes = lanes.count(), capacity = pipeline.lane_capacity, "tracking service started");
        Self {
            tracker,
            lanes,
            workers: Mutex::new(Some(Workers {
                lanes: lane_workers,
                sweeper,
            })),
        }
    }

    /// Admit a ping and queue it on its vehicle's lane.
    pub fn submit(&self, ping: PositionPing) -> Result<(), IngestError> {
        let lane = self.lanes.lane_for(&ping.vehicle_id);
        if lane.is_closed() {
            return Err(IngestError::Closed);
        }
        let ping = self.tracker.admit(ping, Utc::now())?;
        match lane.push(ping) {
            Ok(Enqueued::Queued) => Ok(()),
            Ok(Enqueued::Shed(shed)) => {
                warn!(vehicle = %shed.vehicle_id, timestamp = %shed.timestamp, "lane full, shed ping");
                self.tracker.stats().observe_shed();
                Ok(())
            }
            Err(_) => Err(IngestError::Closed),
        }
    }

    pub fn list_arrivals(
        &self,
        stop_id: &StopIdentifier,
        route_filter: Option<&RouteIdentifier>,
    ) -> Result<Vec<Arrival>, QueryError> {
        self.tracker.list_arrivals(stop_id, route_filter, Utc::now())
    }

    pub fn list_vehicles_near(&self, point: Point, radius_m: f64) -> Vec<VehicleSummary> {
        self.tracker.list_vehicles_near(point, radius_m, Utc::now())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.tracker.stats().snapshot()
    }

    /// Pings queued but not yet processed.
    pub fn backlog(&self) -> usize {
        self.lanes.backlog()
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    /// Stop accepting pings and let the lanes drain until `grace` expires,
    /// then abort whatever is left. Later calls return immediately.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownOutcome {
        self.lanes.close_all();
        let workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(Workers { lanes, sweeper }) = workers else {
            return ShutdownOutcome::Drained;
        };
        sweeper.abort();

        let aborts: Vec<_> = lanes.iter().map(JoinHandle::abort_handle).collect();
        let outcome = match tokio::time::timeout(grace, join_all(lanes)).await {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                for handle in &aborts {
                    handle.abort();
                }
                ShutdownOutcome::Aborted {
                    abandoned: self.lanes.backlog(),
                }
            }
        };

        match outcome {
            ShutdownOutcome::Drained => info!("tracking service drained"),
            ShutdownOutcome::Aborted { abandoned } => {
                warn!(abandoned, ?grace, "shutdown grace expired, aborting lanes")
            }
        }
        outcome
    }
}
