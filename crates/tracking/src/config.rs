//! Tunable settings for the tracking core.
//!
//! Every field has a default, so a config file only needs to mention what it
//! overrides. Defaults are calibrated for Greater Cairo microbus traffic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::types::{ConfigError, Result};

/// Ceiling for every setting measured in whole seconds.
pub const MAX_WINDOW_S: u64 = 7 * 24 * 3600;

/// Geographic rectangle pings must fall in.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

impl Default for GeoBounds {
    /// Greater Cairo
    fn default() -> Self {
        Self {
            min_lat: 29.7,
            max_lat: 30.3,
            min_lon: 31.0,
            max_lon: 31.6,
        }
    }
}

impl GeoBounds {
    /// The whole globe, for deployments that don't restrict the service area.
    pub fn world() -> Self {
        Self {
            min_lat: -90.0,
            max_lat: 90.0,
            min_lon: -180.0,
            max_lon: 180.0,
        }
    }

    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        (self.min_lat..=self.max_lat).contains(&lat) && (self.min_lon..=self.max_lon).contains(&lon)
    }
}

/// Ping validation window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub bounds: GeoBounds,
    /// Pings older than this are stale replays.
    pub max_ping_age_s: u64,
    /// Tolerated device clock skew into the future.
    pub max_future_skew_s: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            bounds: GeoBounds::default(),
            max_ping_age_s: 300,
            max_future_skew_s: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Search radius for a vehicle with no recent fix.
    pub base_search_radius_m: f64,
    /// Extra search radius per second since the last fix.
    pub search_radius_growth_mps: f64,
    pub max_search_radius_m: f64,
    pub max_candidates: usize,
    /// Fixes further than this from every route are unmatched.
    pub rejection_distance_m: f64,
    /// Backward movement along the route absorbed as GPS jitter.
    pub backward_jitter_tolerance_m: f64,
    /// Score bonus, in meters of offset, for staying on the prior route.
    pub continuity_bonus_m: f64,
    /// Inconsistent regressions held off before one is accepted.
    pub max_consecutive_regressions: u32,
    /// Weight of the newest sample in the vehicle speed average.
    pub speed_smoothing: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            base_search_radius_m: 75.0,
            search_radius_growth_mps: 2.0,
            max_search_radius_m: 400.0,
            max_candidates: 8,
            rejection_distance_m: 60.0,
            backward_jitter_tolerance_m: 30.0,
            continuity_bonus_m: 20.0,
            max_consecutive_regressions: 3,
            speed_smoothing: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    /// Weight of the newest travel-time sample in the segment average.
    pub decay_factor: f64,
    pub min_speed_mps: f64,
    pub max_speed_mps: f64,
    /// Network-wide prior for segments without samples.
    pub default_speed_mps: f64,
    /// Time for an unobserved segment average to move halfway to the prior.
    pub prior_half_life_s: f64,
    pub min_travel_time_s: f64,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            decay_factor: 0.3,
            min_speed_mps: 0.5,
            max_speed_mps: 33.0,
            // ~22 km/h, average microbus speed in Cairo traffic
            default_speed_mps: 6.1,
            prior_half_life_s: 3600.0,
            min_travel_time_s: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub staleness_threshold_s: u64,
    pub sweep_interval_s: u64,
    /// Cell size of the vehicle proximity grid.
    pub grid_cell_deg: f64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            staleness_threshold_s: 600,
            sweep_interval_s: 30,
            grid_cell_deg: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtaConfig {
    /// Estimates below this confidence are omitted rather than returned.
    pub min_confidence: f64,
    /// Weight of the vehicle's own speed, in equivalent segment samples, when
    /// estimating the rest of its current segment.
    pub vehicle_speed_weight: f64,
}

impl Default for EtaConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.2,
            vehicle_speed_weight: 3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker lanes; a vehicle always maps to the same lane.
    pub lanes: usize,
    pub lane_capacity: usize,
    pub shutdown_grace_s: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lanes: 4,
            lane_capacity: 1024,
            shutdown_grace_s: 5,
        }
    }
}

impl PipelineConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub ingest: IngestConfig,
    pub matching: MatchConfig,
    pub speed: SpeedConfig,
    pub store: StoreConfig,
    pub eta: EtaConfig,
    pub pipeline: PipelineConfig,
}

impl TrackingConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let b = &self.ingest.bounds;
        check("ingest.bounds", b.min_lat < b.max_lat && b.min_lon < b.max_lon, "min must be below max")?;
        check(
            "ingest.bounds",
            b.min_lat >= -90.0 && b.max_lat <= 90.0 && b.min_lon >= -180.0 && b.max_lon <= 180.0,
            "outside the globe",
        )?;
        check_window("ingest.max_ping_age_s", self.ingest.max_ping_age_s, 1)?;
        check_window("ingest.max_future_skew_s", self.ingest.max_future_skew_s, 0)?;

        let m = &self.matching;
        check_positive("matching.base_search_radius_m", m.base_search_radius_m)?;
        check(
            "matching.search_radius_growth_mps",
            m.search_radius_growth_mps >= 0.0 && m.search_radius_growth_mps.is_finite(),
            "must be non-negative",
        )?;
        check(
            "matching.max_search_radius_m",
            m.max_search_radius_m >= m.base_search_radius_m,
            "must be at least the base search radius",
        )?;
        check("matching.max_candidates", m.max_candidates > 0, "must be positive")?;
        check_positive("matching.rejection_distance_m", m.rejection_distance_m)?;
        check(
            "matching.backward_jitter_tolerance_m",
            m.backward_jitter_tolerance_m >= 0.0 && m.backward_jitter_tolerance_m.is_finite(),
            "must be non-negative",
        )?;
        check(
            "matching.continuity_bonus_m",
            m.continuity_bonus_m >= 0.0 && m.continuity_bonus_m.is_finite(),
            "must be non-negative",
        )?;
        check_fraction("matching.speed_smoothing", m.speed_smoothing)?;

        let s = &self.speed;
        check_fraction("speed.decay_factor", s.decay_factor)?;
        check_positive("speed.min_speed_mps", s.min_speed_mps)?;
        check(
            "speed.max_speed_mps",
            s.max_speed_mps > s.min_speed_mps && s.max_speed_mps.is_finite(),
            "must exceed the minimum speed",
        )?;
        check(
            "speed.default_speed_mps",
            (s.min_speed_mps..=s.max_speed_mps).contains(&s.default_speed_mps),
            "must lie within the speed envelope",
        )?;
        check_positive("speed.prior_half_life_s", s.prior_half_life_s)?;
        check_positive("speed.min_travel_time_s", s.min_travel_time_s)?;

        check_window("store.staleness_threshold_s", self.store.staleness_threshold_s, 1)?;
        check_window("store.sweep_interval_s", self.store.sweep_interval_s, 1)?;
        check_positive("store.grid_cell_deg", self.store.grid_cell_deg)?;

        check(
            "eta.min_confidence",
            (0.0..=1.0).contains(&self.eta.min_confidence),
            "must be within [0, 1]",
        )?;
        check(
            "eta.vehicle_speed_weight",
            self.eta.vehicle_speed_weight >= 0.0 && self.eta.vehicle_speed_weight.is_finite(),
            "must be non-negative",
        )?;

        check("pipeline.lanes", self.pipeline.lanes > 0, "must be positive")?;
        check("pipeline.lane_capacity", self.pipeline.lane_capacity > 0, "must be positive")?;
        check_window("pipeline.shutdown_grace_s", self.pipeline.shutdown_grace_s, 0)?;
        Ok(())
    }
}

fn check(name: &'static str, ok: bool, reason: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidSetting {
            name,
            reason: reason.to_string(),
        })
    }
}

fn check_positive(name: &'static str, value: f64) -> Result<()> {
    check(name, value > 0.0 && value.is_finite(), "must be positive")
}

fn check_window(name: &'static str, value_s: u64, min_s: u64) -> Result<()> {
    check(
        name,
        (min_s..=MAX_WINDOW_S).contains(&value_s),
        &format!("must be within [{min_s}, {MAX_WINDOW_S}] seconds"),
    )
}

fn check_fraction(name: &'static str, value: f64) -> Result<()> {
    check(name, value > 0.0 && value <= 1.0, "must be within (0, 1]")
}
