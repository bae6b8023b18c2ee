//! Rolling travel-time statistics per route segment.
//!
//! Every lane that sees a vehicle cross a segment folds a sample into that
//! segment's exponentially-weighted mean. Stats live in a sharded map so
//! vehicles crossing different segments never contend, and the
//! read-modify-write for one segment happens under its shard lock.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use crate::catalog::RouteCatalog;
use crate::config::SpeedConfig;
use crate::identifiers::*;
use crate::models::route::Segment;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub route_id: RouteIdentifier,
    pub segment_index: usize,
}

impl SegmentKey {
    pub fn new(route_id: RouteIdentifier, segment_index: usize) -> Self {
        Self {
            route_id,
            segment_index,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentSpeedStat {
    /// Travel time for the whole segment.
    pub mean_travel_time_s: f64,
    pub samples: u64,
    pub last_observed: DateTime<Utc>,
}

/// Movement through (part of) one segment between two fixes.
#[derive(Clone, Debug, PartialEq)]
pub struct SegmentTraversal {
    pub route_id: RouteIdentifier,
    pub segment_index: usize,
    pub elapsed_s: f64,
    pub distance_m: f64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleOutcome {
    Recorded { travel_time_s: f64 },
    /// Slower than the envelope allows; folded in at the minimum speed.
    Clamped { travel_time_s: f64 },
    /// Faster than the envelope allows, empty, or for an unknown segment.
    Discarded,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TravelTimeEstimate {
    pub seconds: f64,
    /// Samples behind the estimate; zero means it is the network prior.
    pub samples: u64,
}

pub struct SegmentSpeedModel {
    catalog: Arc<RouteCatalog>,
    config: SpeedConfig,
    stats: DashMap<SegmentKey, SegmentSpeedStat>,
}

impl SegmentSpeedModel {
    pub fn new(catalog: Arc<RouteCatalog>, config: SpeedConfig) -> Self {
        Self {
            catalog,
            config,
            stats: DashMap::new(),
        }
    }

    pub fn record(&self, traversal: &SegmentTraversal) -> SampleOutcome {
        let Some(segment) = self.catalog.segment(&traversal.route_id, traversal.segment_index) else {
            return SampleOutcome::Discarded;
        };
        let SegmentTraversal {
            elapsed_s,
            distance_m,
            observed_at,
            ..
        } = *traversal;
        if !(elapsed_s > 0.0 && distance_m > 0.0 && elapsed_s.is_finite() && distance_m.is_finite()) {
            return SampleOutcome::Discarded;
        }

        let speed = distance_m / elapsed_s;
        if speed > self.config.max_speed_mps {
            trace!(
                route = %traversal.route_id,
                segment = traversal.segment_index,
                speed,
                "discarding implausible segment sample"
            );
            return SampleOutcome::Discarded;
        }
        let clamped = speed < self.config.min_speed_mps;
        let speed = speed.max(self.config.min_speed_mps);
        let travel_time_s = (segment.length_m / speed).max(self.config.min_travel_time_s);

        let alpha = self.config.decay_factor;
        let prior = self.prior_s(segment);
        let half_life = self.config.prior_half_life_s;
        self.stats
            .entry(SegmentKey::new(traversal.route_id.clone(), traversal.segment_index))
            .and_modify(|stat| {
                let base = decayed(stat, prior, half_life, observed_at);
                stat.mean_travel_time_s = alpha * travel_time_s + (1.0 - alpha) * base;
                stat.samples += 1;
                stat.last_observed = stat.last_observed.max(observed_at);
            })
            .or_insert(SegmentSpeedStat {
                mean_travel_time_s: travel_time_s,
                samples: 1,
                last_observed: observed_at,
            });

        if clamped {
            SampleOutcome::Clamped { travel_time_s }
        } else {
            SampleOutcome::Recorded { travel_time_s }
        }
    }

    /// Expected time to traverse the whole segment, or `None` for an unknown
    /// segment. Falls back to the network prior without samples.
    pub fn estimate_travel_time(
        &self,
        route_id: &RouteIdentifier,
        segment_index: usize,
        now: DateTime<Utc>,
    ) -> Option<TravelTimeEstimate> {
        let segment = self.catalog.segment(route_id, segment_index)?;
        let prior = self.prior_s(segment);

        let (seconds, samples) = match self.stats.get(&SegmentKey::new(route_id.clone(), segment_index)) {
            Some(stat) => (
                decayed(&stat, prior, self.config.prior_half_life_s, now),
                stat.samples,
            ),
            None => (prior, 0),
        };

        Some(TravelTimeEstimate {
            seconds: seconds.max(self.config.min_travel_time_s),
            samples,
        })
    }

    pub fn stat(&self, route_id: &RouteIdentifier, segment_index: usize) -> Option<SegmentSpeedStat> {
        self.stats
            .get(&SegmentKey::new(route_id.clone(), segment_index))
            .map(|s| *s)
    }

    /// Number of segments with at least one sample.
    pub fn observed_segments(&self) -> usize {
        self.stats.len()
    }

    fn prior_s(&self, segment: &Segment) -> f64 {
        segment.length_m / self.config.default_speed_mps
    }
}

/// Mean pulled toward `prior` by how long the segment has gone unobserved.
fn decayed(stat: &SegmentSpeedStat, prior: f64, half_life_s: f64, now: DateTime<Utc>) -> f64 {
    let age_s = (now - stat.last_observed).num_milliseconds().max(0) as f64 / 1000.0;
    let keep = 0.5f64.powf(age_s / half_life_s);
    prior + (stat.mean_travel_time_s - prior) * keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use approx::assert_abs_diff_eq;

    fn model() -> SegmentSpeedModel {
        SegmentSpeedModel::new(catalog(vec![r1()]), SpeedConfig::default())
    }

    fn traversal(segment_index: usize, elapsed_s: f64, distance_m: f64, t: i64) -> SegmentTraversal {
        SegmentTraversal {
            route_id: "R1".into(),
            segment_index,
            elapsed_s,
            distance_m,
            observed_at: at(t),
        }
    }

    #[test]
    fn test_prior_without_samples() {
        let model = model();
        let estimate = model.estimate_travel_time(&"R1".into(), 0, at(0)).unwrap();

        assert_eq!(estimate.samples, 0);
        assert_abs_diff_eq!(estimate.seconds, 1000.0 / 6.1, epsilon = 0.01);
        assert!(model.estimate_travel_time(&"R1".into(), 7, at(0)).is_none());
        assert!(model.estimate_travel_time(&"nope".into(), 0, at(0)).is_none());
    }

    #[test]
    fn test_partial_traversal_is_normalized_to_segment_length() {
        let model = model();
        // 200 m in 20 s on a 1000 m segment => 100 s for the whole segment
        let outcome = model.record(&traversal(0, 20.0, 200.0, 0));

        match outcome {
            SampleOutcome::Recorded { travel_time_s } => assert_abs_diff_eq!(travel_time_s, 100.0, epsilon = 0.01),
            other => panic!("unexpected outcome {other:?}"),
        }
        let estimate = model.estimate_travel_time(&"R1".into(), 0, at(0)).unwrap();
        assert_eq!(estimate.samples, 1);
        assert_abs_diff_eq!(estimate.seconds, 100.0, epsilon = 0.01);
    }

    #[test]
    fn test_recent_samples_dominate() {
        let model = model();
        model.record(&traversal(0, 100.0, 1000.0, 0));
        for t in 1..=20 {
            model.record(&traversal(0, 200.0, 1000.0, t));
        }

        let estimate = model.estimate_travel_time(&"R1".into(), 0, at(20)).unwrap();
        assert_eq!(estimate.samples, 21);
        assert!((estimate.seconds - 200.0).abs() < 1.0);
    }

    #[test]
    fn test_spike_is_discarded_and_crawl_is_clamped() {
        let model = model();
        // 500 m in 5 s = 100 m/s
        assert_eq!(model.record(&traversal(0, 5.0, 500.0, 0)), SampleOutcome::Discarded);
        assert!(model.stat(&"R1".into(), 0).is_none());

        // 10 m in 100 s = 0.1 m/s, clamped to 0.5 m/s
        match model.record(&traversal(0, 100.0, 10.0, 0)) {
            SampleOutcome::Clamped { travel_time_s } => assert_abs_diff_eq!(travel_time_s, 2000.0, epsilon = 0.01),
            other => panic!("unexpected outcome {other:?}"),
        }

        assert_eq!(model.record(&traversal(0, 0.0, 10.0, 0)), SampleOutcome::Discarded);
        assert_eq!(model.record(&traversal(0, 10.0, f64::NAN, 0)), SampleOutcome::Discarded);
    }

    #[test]
    fn test_unobserved_segment_decays_toward_prior() {
        let model = model();
        model.record(&traversal(0, 50.0, 1000.0, 0));
        let prior = 1000.0 / 6.1;

        let fresh = model.estimate_travel_time(&"R1".into(), 0, at(0)).unwrap().seconds;
        let one_half_life = model.estimate_travel_time(&"R1".into(), 0, at(3600)).unwrap().seconds;
        let much_later = model.estimate_travel_time(&"R1".into(), 0, at(3600 * 24)).unwrap().seconds;

        assert_abs_diff_eq!(fresh, 50.0, epsilon = 0.01);
        assert_abs_diff_eq!(one_half_life, (50.0 + prior) / 2.0, epsilon = 0.01);
        assert_abs_diff_eq!(much_later, prior, epsilon = 0.01);
    }

    #[test]
    fn test_estimate_respects_minimum() {
        let config = SpeedConfig {
            min_travel_time_s: 120.0,
            ..SpeedConfig::default()
        };
        let model = SegmentSpeedModel::new(catalog(vec![r1()]), config);
        model.record(&traversal(0, 50.0, 1000.0, 0));

        let estimate = model.estimate_travel_time(&"R1".into(), 0, at(0)).unwrap();
        assert_eq!(estimate.seconds, 120.0);
    }

    #[test]
    fn test_concurrent_updates_are_not_lost() {
        let model = model();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        model.record(&traversal(1, 150.0, 1500.0, 0));
                    }
                });
            }
        });

        let stat = model.stat(&"R1".into(), 1).unwrap();
        assert_eq!(stat.samples, 800);
        assert_abs_diff_eq!(stat.mean_travel_time_s, 150.0, epsilon = 0.01);
    }
}
