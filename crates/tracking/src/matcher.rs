//! Map-matching of raw fixes onto the route network.
//!
//! # Matching
//! - Queries the spatial index for segments near the fix; the search radius
//!   grows with time since the vehicle's last fix
//! - Scores candidates by perpendicular offset, with continuity bonuses for
//!   staying on the prior route and for moving forward along it
//! - Rejects the best candidate if it is still too far from the fix
//!
//! # Regressions
//! A fix that lands on the prior route but behind it by more than the jitter
//! tolerance is re-evaluated on geometry alone. A strictly closer fit on
//! another route is a route change; otherwise the prior match is held
//! (`MatchState::Suspect`) and a penalty counted, until enough consecutive
//! regressions force acceptance (e.g. the vehicle started a new run).
//!
//! The matcher is pure: it reads the prior state and returns the next one, so
//! a lane applies its output without further locking.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::catalog::RouteCatalog;
use crate::config::{MatchConfig, TrackingConfig};
use crate::models::route::Route;
use crate::models::vehicle::{MatchState, PositionPing, RouteMatch, VehicleState};
use crate::spatial::index::SegmentHit;
use crate::speed::SegmentTraversal;

/// How the vehicle's match changed with this fix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// No plausible route near the fix.
    Unmatched,
    /// First match after being unmatched or unknown.
    Acquired,
    /// Same route, consistent progress.
    Continued,
    /// Moved to a different route.
    Switched,
    /// Regression rejected; prior match held.
    HeldBack,
    /// Regression accepted after too many consecutive holds.
    ForcedRegression,
}

#[derive(Clone, Debug)]
pub struct MatchOutcome {
    pub state: VehicleState,
    pub transition: Transition,
    /// Segments covered since the previous fix on the same route.
    pub traversals: Vec<SegmentTraversal>,
}

pub struct MapMatcher {
    catalog: Arc<RouteCatalog>,
    config: MatchConfig,
    max_speed_mps: f64,
}

impl MapMatcher {
    pub fn new(catalog: Arc<RouteCatalog>, config: &TrackingConfig) -> Self {
        Self {
            catalog,
            config: config.matching.clone(),
            max_speed_mps: config.speed.max_speed_mps,
        }
    }

    pub fn search_radius_m(&self, elapsed_s: f64) -> f64 {
        let grown = self.config.base_search_radius_m + self.config.search_radius_growth_mps * elapsed_s.max(0.0);
        grown.min(self.config.max_search_radius_m)
    }

    /// Match one validated ping given the vehicle's prior state, if any.
    pub fn match_ping(&self, ping: &PositionPing, prior: Option<&VehicleState>) -> MatchOutcome {
        let point = ping.location();
        let elapsed_s = prior.map_or(0.0, |p| seconds_between(p.last_seen, ping.timestamp));
        let radius_m = self.search_radius_m(elapsed_s);
        let candidates = self
            .catalog
            .index()
            .nearest_segments(point, self.config.max_candidates, radius_m);

        let prior_match = prior.and_then(|p| p.state.route_match());
        let Some(best) = self.best_candidate(&candidates, prior_match) else {
            debug!(vehicle = %ping.vehicle_id, radius_m, "no route within rejection distance");
            return self.unmatched(ping, prior);
        };

        let fresh = self.route_match(best, ping.timestamp);
        let Some(held) = prior_match.filter(|m| m.route_id == fresh.route_id) else {
            let transition = if prior_match.is_some() {
                Transition::Switched
            } else {
                Transition::Acquired
            };
            debug!(vehicle = %ping.vehicle_id, route = %fresh.route_id, ?transition, "route match");
            return self.matched(ping, prior, fresh, transition);
        };

        if fresh.distance_m >= held.distance_m - self.config.backward_jitter_tolerance_m {
            return self.matched(ping, prior, fresh, Transition::Continued);
        }

        // Regressed beyond tolerance: re-evaluate on geometry alone
        if let Some(other) = candidates
            .iter()
            .find(|hit| hit.offset_m <= self.config.rejection_distance_m)
            .filter(|hit| hit.route.id != held.route_id && hit.offset_m < best.offset_m)
        {
            let switched = self.route_match(other, ping.timestamp);
            debug!(vehicle = %ping.vehicle_id, route = %switched.route_id, "regression resolved by route change");
            return self.matched(ping, prior, switched, Transition::Switched);
        }

        let penalties = prior.map_or(0, |p| p.state.penalties()) + 1;
        if penalties > self.config.max_consecutive_regressions {
            warn!(
                vehicle = %ping.vehicle_id,
                route = %fresh.route_id,
                from_m = held.distance_m,
                to_m = fresh.distance_m,
                "accepting repeated regression"
            );
            return self.matched(ping, prior, fresh, Transition::ForcedRegression);
        }

        debug!(
            vehicle = %ping.vehicle_id,
            from_m = held.distance_m,
            to_m = fresh.distance_m,
            penalties,
            "holding prior match against regression"
        );
        self.held_back(ping, prior, held.clone(), penalties)
    }

    fn best_candidate<'a>(&self, candidates: &'a [SegmentHit], prior: Option<&RouteMatch>) -> Option<&'a SegmentHit> {
        // Candidates arrive sorted by offset, so the first maximum wins ties
        let mut best: Option<(&SegmentHit, f64)> = None;
        for hit in candidates.iter().filter(|hit| hit.offset_m <= self.config.rejection_distance_m) {
            let score = self.score(hit, prior);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((hit, score));
            }
        }
        best.map(|(hit, _)| hit)
    }

    /// Higher is better. Staying on the prior route earns the continuity
    /// bonus once, and once more when the fix does not regress.
    fn score(&self, hit: &SegmentHit, prior: Option<&RouteMatch>) -> f64 {
        let mut score = -hit.offset_m;
        if let Some(m) = prior.filter(|m| m.route_id == hit.route.id) {
            score += self.config.continuity_bonus_m;
            if hit.distance_along_m >= m.distance_m - self.config.backward_jitter_tolerance_m {
                score += self.config.continuity_bonus_m;
            }
        }
        score
    }

    fn route_match(&self, hit: &SegmentHit, fixed_at: DateTime<Utc>) -> RouteMatch {
        let distance_m = hit.route.clamp_distance(hit.distance_along_m);
        RouteMatch {
            route_id: hit.route.id.clone(),
            segment_index: hit.segment_index,
            distance_m,
            offset_m: hit.offset_m,
            fixed_at,
        }
    }

    fn confidence(&self, offset_m: f64, penalties: u32) -> f64 {
        let geometric = (1.0 - offset_m / self.config.rejection_distance_m).clamp(0.0, 1.0);
        geometric * 0.5f64.powi(penalties as i32)
    }

    fn base_state(&self, ping: &PositionPing, prior: Option<&VehicleState>, state: MatchState) -> VehicleState {
        VehicleState {
            vehicle_id: ping.vehicle_id.clone(),
            location: ping.location(),
            heading_deg: ping.heading_deg.or_else(|| prior.and_then(|p| p.heading_deg)),
            state,
            last_seen: ping.timestamp,
            order: ping.order_key(),
            speed_mps: prior.and_then(|p| p.speed_mps),
            confidence: 0.0,
            samples: 0,
        }
    }

    fn unmatched(&self, ping: &PositionPing, prior: Option<&VehicleState>) -> MatchOutcome {
        let mut state = self.base_state(ping, prior, MatchState::Unmatched);
        if let Some(reported) = ping.speed_mps {
            state.speed_mps = Some(self.smooth(state.speed_mps, reported));
        }
        MatchOutcome {
            state,
            transition: Transition::Unmatched,
            traversals: Vec::new(),
        }
    }

    fn held_back(&self, ping: &PositionPing, prior: Option<&VehicleState>, held: RouteMatch, penalties: u32) -> MatchOutcome {
        let confidence = self.confidence(held.offset_m, penalties);
        let samples = prior.map_or(0, |p| p.samples);
        let mut state = self.base_state(ping, prior, MatchState::Suspect { held, penalties });
        state.confidence = confidence;
        state.samples = samples;
        MatchOutcome {
            state,
            transition: Transition::HeldBack,
            traversals: Vec::new(),
        }
    }

    fn matched(
        &self,
        ping: &PositionPing,
        prior: Option<&VehicleState>,
        fresh: RouteMatch,
        transition: Transition,
    ) -> MatchOutcome {
        let mut traversals = Vec::new();
        let mut progress_speed = None;
        let mut samples = 1;

        if transition == Transition::Continued {
            if let Some((prior_state, held)) = prior.and_then(|p| p.state.route_match().map(|m| (p, m))) {
                samples = prior_state.samples.saturating_add(1);
                let elapsed_s = seconds_between(held.fixed_at, fresh.fixed_at);
                let progress_m = fresh.distance_m - held.distance_m;
                if elapsed_s > 0.0 {
                    progress_speed = Some((progress_m.max(0.0) / elapsed_s).min(self.max_speed_mps));
                    if progress_m > 0.0 && fresh.segment_index > held.segment_index {
                        if let Some(route) = self.catalog.get_route(&fresh.route_id) {
                            traversals = split_traversal(route, held, &fresh, elapsed_s);
                        }
                    }
                }
            }
        }

        let confidence = self.confidence(fresh.offset_m, 0);
        let mut state = self.base_state(ping, prior, MatchState::Matched(fresh));
        if let Some(sample) = progress_speed.or(ping.speed_mps) {
            state.speed_mps = Some(self.smooth(state.speed_mps, sample));
        }
        state.confidence = confidence;
        state.samples = samples;

        MatchOutcome {
            state,
            transition,
            traversals,
        }
    }

    fn smooth(&self, previous: Option<f64>, sample: f64) -> f64 {
        let sample = sample.clamp(0.0, self.max_speed_mps);
        match previous {
            Some(previous) => {
                let alpha = self.config.speed_smoothing;
                alpha * sample + (1.0 - alpha) * previous
            }
            None => sample,
        }
    }
}

/// Apportion the time between two fixes to every segment the vehicle covered,
/// by each segment's share of the covered distance.
fn split_traversal(route: &Route, from: &RouteMatch, to: &RouteMatch, elapsed_s: f64) -> Vec<SegmentTraversal> {
    let covered_m = to.distance_m - from.distance_m;
    route.segments()[from.segment_index..=to.segment_index.min(route.segments().len() - 1)]
        .iter()
        .filter_map(|segment| {
            let distance_m = segment.overlap_m(from.distance_m, to.distance_m);
            (distance_m > 0.0).then(|| SegmentTraversal {
                route_id: route.id.clone(),
                segment_index: segment.index,
                elapsed_s: elapsed_s * distance_m / covered_m,
                distance_m,
                observed_at: to.fixed_at,
            })
        })
        .collect()
}

fn seconds_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use approx::assert_abs_diff_eq;

    fn matcher(routes: Vec<crate::catalog::dataset::RouteDefinition>) -> MapMatcher {
        MapMatcher::new(catalog(routes), &config())
    }

    fn ping(distance_m: f64, east_m: f64, t: i64) -> PositionPing {
        PositionPing::new("V1", point_at(distance_m, east_m), at(t))
    }

    fn run(matcher: &MapMatcher, pings: &[PositionPing]) -> Vec<MatchOutcome> {
        let mut prior: Option<VehicleState> = None;
        pings
            .iter()
            .map(|p| {
                let outcome = matcher.match_ping(p, prior.as_ref());
                prior = Some(outcome.state.clone());
                outcome
            })
            .collect()
    }

    fn distance(outcome: &MatchOutcome) -> f64 {
        outcome.state.state.route_match().unwrap().distance_m
    }

    #[test]
    fn test_acquire_on_route() {
        let m = matcher(vec![r1()]);
        let outcome = m.match_ping(&ping(500.0, 5.0, 0), None);

        assert_eq!(outcome.transition, Transition::Acquired);
        assert_eq!(outcome.state.state.route_id().unwrap().as_str(), "R1");
        assert_abs_diff_eq!(distance(&outcome), 500.0, epsilon = 0.5);
        assert!(outcome.state.confidence > 0.9);
        assert_eq!(outcome.state.samples, 1);
        assert!(outcome.traversals.is_empty());
    }

    #[test]
    fn test_far_fix_is_unmatched() {
        let m = matcher(vec![r1()]);
        let outcome = m.match_ping(&ping(500.0, 2000.0, 0), None);

        assert_eq!(outcome.transition, Transition::Unmatched);
        assert_eq!(outcome.state.state, MatchState::Unmatched);
        assert_eq!(outcome.state.confidence, 0.0);
    }

    #[test]
    fn test_fix_just_outside_rejection_distance_is_unmatched() {
        let m = matcher(vec![r1()]);
        // Inside the search radius but beyond the rejection distance
        let outcome = m.match_ping(&ping(500.0, 70.0, 0), None);
        assert_eq!(outcome.transition, Transition::Unmatched);
    }

    #[test]
    fn test_distance_is_clamped_to_route() {
        let m = matcher(vec![r1()]);
        let past_end = m.match_ping(&ping(2550.0, 0.0, 0), None);
        let before_start = m.match_ping(&ping(-40.0, 0.0, 0), None);

        let length = m.catalog.get_route(&"R1".into()).unwrap().length_m();
        assert_abs_diff_eq!(distance(&past_end), length, epsilon = 1e-6);
        assert_abs_diff_eq!(distance(&before_start), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_progress_yields_speed_and_traversals() {
        let m = matcher(vec![r1()]);
        let outcomes = run(&m, &[ping(900.0, 0.0, 0), ping(1100.0, 0.0, 20)]);
        let last = &outcomes[1];

        assert_eq!(last.transition, Transition::Continued);
        assert_abs_diff_eq!(last.state.speed_mps.unwrap(), 10.0, epsilon = 0.05);
        assert_eq!(last.state.samples, 2);

        assert_eq!(last.traversals.len(), 2);
        assert_eq!(last.traversals[0].segment_index, 0);
        assert_abs_diff_eq!(last.traversals[0].distance_m, 100.0, epsilon = 0.5);
        assert_abs_diff_eq!(last.traversals[0].elapsed_s, 10.0, epsilon = 0.05);
        assert_eq!(last.traversals[1].segment_index, 1);
        assert_abs_diff_eq!(last.traversals[1].elapsed_s, 10.0, epsilon = 0.05);
    }

    #[test]
    fn test_no_traversal_within_one_segment() {
        let m = matcher(vec![r1()]);
        let outcomes = run(&m, &[ping(500.0, 0.0, 0), ping(900.0, 0.0, 40)]);
        assert!(outcomes[1].traversals.is_empty());
        assert_abs_diff_eq!(outcomes[1].state.speed_mps.unwrap(), 10.0, epsilon = 0.05);
    }

    #[test]
    fn test_small_backward_jitter_is_absorbed() {
        let m = matcher(vec![r1()]);
        let outcomes = run(&m, &[ping(500.0, 0.0, 0), ping(485.0, 3.0, 10)]);

        assert_eq!(outcomes[1].transition, Transition::Continued);
        assert_eq!(outcomes[1].state.samples, 2);
    }

    #[test]
    fn test_large_regression_holds_prior_then_gives_way() {
        let m = matcher(vec![r1()]);
        let outcomes = run(
            &m,
            &[
                ping(1500.0, 0.0, 0),
                ping(1200.0, 0.0, 10),
                ping(1200.0, 0.0, 20),
                ping(1200.0, 0.0, 30),
                ping(1200.0, 0.0, 40),
            ],
        );

        for (i, outcome) in outcomes[1..4].iter().enumerate() {
            assert_eq!(outcome.transition, Transition::HeldBack);
            assert_eq!(outcome.state.state.penalties(), i as u32 + 1);
            assert_abs_diff_eq!(distance(outcome), 1500.0, epsilon = 0.5);
            // The held fix keeps its own timestamp; liveness follows the ping
            assert_eq!(outcome.state.state.route_match().unwrap().fixed_at, at(0));
            assert_eq!(outcome.state.last_seen, at(10 * (i as i64 + 1)));
        }
        assert!(outcomes[1].state.confidence < outcomes[0].state.confidence);

        let forced = &outcomes[4];
        assert_eq!(forced.transition, Transition::ForcedRegression);
        assert_abs_diff_eq!(distance(forced), 1200.0, epsilon = 0.5);
        assert_eq!(forced.state.samples, 1);
    }

    #[test]
    fn test_recovery_from_suspect() {
        let m = matcher(vec![r1()]);
        let outcomes = run(&m, &[ping(1500.0, 0.0, 0), ping(1100.0, 0.0, 10), ping(1600.0, 0.0, 20)]);

        assert_eq!(outcomes[1].transition, Transition::HeldBack);
        assert_eq!(outcomes[2].transition, Transition::Continued);
        assert!(matches!(outcomes[2].state.state, MatchState::Matched(_)));
        // 100 m in 20 s since the held fix
        assert_abs_diff_eq!(outcomes[2].state.speed_mps.unwrap(), 5.0, epsilon = 0.05);
    }

    #[test]
    fn test_overlapping_corridor_keeps_prior_route() {
        let m = matcher(vec![r1(), r2()]);

        // Equal fits on the shared corridor; without history the lower id wins
        let fresh = m.match_ping(&ping(400.0, 2.0, 30), None);
        assert_eq!(fresh.state.state.route_id().unwrap().as_str(), "R1");

        let mut prior = m.match_ping(&ping(1000.0, 800.0, 0), None).state;
        assert_eq!(prior.state.route_id().unwrap().as_str(), "R2");
        prior.state = MatchState::Matched(RouteMatch {
            route_id: "R2".into(),
            segment_index: 0,
            distance_m: 300.0,
            offset_m: 0.0,
            fixed_at: at(0),
        });

        let outcome = m.match_ping(&ping(400.0, 2.0, 30), Some(&prior));
        assert_eq!(outcome.transition, Transition::Continued);
        assert_eq!(outcome.state.state.route_id().unwrap().as_str(), "R2");
    }

    #[test]
    fn test_leaving_shared_corridor_switches_route() {
        let m = matcher(vec![r1(), r2()]);
        let outcomes = run(&m, &[ping(900.0, 0.0, 0), ping(1000.0, 300.0, 40)]);

        assert_eq!(outcomes[0].state.state.route_id().unwrap().as_str(), "R1");
        assert_eq!(outcomes[1].transition, Transition::Switched);
        assert_eq!(outcomes[1].state.state.route_id().unwrap().as_str(), "R2");
        assert!(outcomes[1].traversals.is_empty());
    }

    #[test]
    fn test_regression_resolved_by_closer_route() {
        let m = matcher(vec![r1(), r2()]);
        let outcomes = run(&m, &[ping(2000.0, 0.0, 0), ping(990.0, 15.0, 60)]);

        assert_eq!(outcomes[0].state.state.route_id().unwrap().as_str(), "R1");
        assert_eq!(outcomes[1].transition, Transition::Switched);
        assert_eq!(outcomes[1].state.state.route_id().unwrap().as_str(), "R2");
    }

    #[test]
    fn test_search_radius_grows_with_silence() {
        let m = matcher(vec![r1()]);
        assert_eq!(m.search_radius_m(0.0), 75.0);
        assert_eq!(m.search_radius_m(10.0), 95.0);
        assert_eq!(m.search_radius_m(3600.0), 400.0);
    }

    #[test]
    fn test_reported_speed_used_without_progress() {
        let m = matcher(vec![r1()]);
        let outcome = m.match_ping(&ping(500.0, 0.0, 0).with_speed(8.0), None);
        assert_eq!(outcome.state.speed_mps, Some(8.0));
    }
}
