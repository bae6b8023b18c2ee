//! Ping validation and per-vehicle ordering.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::stats::IngestStats;
use crate::config::IngestConfig;
use crate::identifiers::*;
use crate::models::types::ValidationError;
use crate::models::vehicle::{OrderKey, PositionPing};

pub struct Gateway {
    config: IngestConfig,
    /// Order key of the last accepted ping per vehicle.
    watermarks: DashMap<VehicleIdentifier, OrderKey>,
    stats: IngestStats,
}

impl Gateway {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            watermarks: DashMap::new(),
            stats: IngestStats::default(),
        }
    }

    /// Validate, normalize and order-check a ping. An accepted ping advances
    /// its vehicle's watermark; every rejection is counted.
    pub fn admit(&self, ping: PositionPing, now: DateTime<Utc>) -> Result<PositionPing, ValidationError> {
        let result = self.validate(ping, now).and_then(|ping| {
            self.advance(&ping)?;
            Ok(ping)
        });
        match &result {
            Ok(_) => self.stats.observe_accepted(),
            Err(err) => {
                trace!(code = err.code(), "rejected ping: {err}");
                self.stats.observe_rejected(err.reason());
            }
        }
        result
    }

    /// Field checks only; ordering is left to [`Gateway::admit`].
    pub fn validate(&self, mut ping: PositionPing, now: DateTime<Utc>) -> Result<PositionPing, ValidationError> {
        if ping.vehicle_id.is_empty() {
            return Err(ValidationError::EmptyVehicleId);
        }

        let (lat, lon) = (ping.lat, ping.lon);
        if !(lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)) {
            return Err(ValidationError::InvalidCoordinate { lat, lon });
        }
        if !self.config.bounds.contains(lat, lon) {
            return Err(ValidationError::OutOfBounds { lat, lon });
        }

        let age = now - ping.timestamp;
        if window(self.config.max_ping_age_s).is_some_and(|max| age > max) {
            return Err(ValidationError::TooOld { age_s: age.num_seconds() });
        }
        if window(self.config.max_future_skew_s).is_some_and(|max| -age > max) {
            return Err(ValidationError::FromFuture {
                skew_s: (-age).num_seconds(),
            });
        }

        if let Some(speed) = ping.speed_mps {
            if !(speed.is_finite() && speed >= 0.0) {
                return Err(ValidationError::InvalidSpeed(speed));
            }
        }
        if let Some(heading) = ping.heading_deg {
            if !heading.is_finite() {
                return Err(ValidationError::InvalidHeading(heading));
            }
            ping.heading_deg = Some(heading.rem_euclid(360.0));
        }

        Ok(ping)
    }

    /// Drop watermarks that no admissible ping could still be compared
    /// against. Returns how many were removed.
    pub fn prune_watermarks(&self, now: DateTime<Utc>) -> usize {
        let Some(horizon) = window(self.config.max_ping_age_s).and_then(|age| now.checked_sub_signed(age)) else {
            return 0;
        };
        let before = self.watermarks.len();
        self.watermarks.retain(|_, key| key.timestamp >= horizon);
        before.saturating_sub(self.watermarks.len())
    }

    pub fn watermark(&self, vehicle_id: &VehicleIdentifier) -> Option<OrderKey> {
        self.watermarks.get(vehicle_id).map(|k| *k)
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    fn advance(&self, ping: &PositionPing) -> Result<(), ValidationError> {
        let key = ping.order_key();
        match self.watermarks.entry(ping.vehicle_id.clone()) {
            Entry::Occupied(mut last) => {
                if key == *last.get() {
                    return Err(ValidationError::Duplicate);
                }
                if !key.supersedes(last.get()) {
                    return Err(ValidationError::OutOfOrder);
                }
                last.insert(key);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(key);
            }
        }
        Ok(())
    }
}

/// `seconds` as a signed span, or `None` when it doesn't fit one. An
/// unrepresentable window bounds nothing.
fn window(seconds: u64) -> Option<Duration> {
    i64::try_from(seconds).ok().and_then(Duration::try_seconds)
}
