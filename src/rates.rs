//! Per-peer message throughput tracking.
//!
//! The dispatcher uses these estimates to rank idle peers by download
//! capacity, size request batches, and derive the per-request timeout. New
//! peers are seeded from fleet-wide aggregates so they start out neither
//! starved nor flooded; a timed-out request feeds a zero sample back in,
//! which craters the estimate and demotes the peer in the ranking.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Message kinds whose throughput is tracked independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Contract bytecode retrievals.
    ByteCodes,
}

/// Weight of a new sample in the exponential moving averages.
const MEASUREMENT_IMPACT: f64 = 0.1;

/// Overshoot applied when converting throughput into a batch cap, so replies
/// stay saturated instead of converging to exactly-full.
const CAPACITY_OVERSHOOT: f64 = 1.01;

/// Lower bound for the smoothed round-trip estimate.
const RTT_MIN_ESTIMATE: Duration = Duration::from_secs(2);

/// Upper bound, and starting value, for the smoothed round-trip estimate.
const RTT_MAX_ESTIMATE: Duration = Duration::from_secs(20);

/// Multiplier from the median round trip to the request timeout.
const TTL_SCALING: u32 = 3;

/// Hard cap on the request timeout.
const TTL_LIMIT: Duration = Duration::from_secs(60);

/// Throughput state for a single peer.
#[derive(Debug, Clone)]
pub struct Tracker {
    /// Estimated items retrievable per second, per message kind.
    capacity: HashMap<MessageKind, f64>,
    /// Smoothed request round-trip time.
    roundtrip: Duration,
}

impl Tracker {
    /// Creates a tracker seeded with the given per-kind capacities and
    /// round-trip estimate (typically the fleet mean and median).
    pub fn new(capacity: HashMap<MessageKind, f64>, roundtrip: Duration) -> Self {
        Self {
            capacity,
            roundtrip: roundtrip.clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE),
        }
    }

    /// Number of items this peer is estimated to serve within `target_rtt`.
    /// Never returns zero: an unproven peer gets a single-item probe.
    fn capacity(&self, kind: MessageKind, target_rtt: Duration) -> u64 {
        let per_second = self.capacity.get(&kind).copied().unwrap_or_default();
        let items = (per_second * target_rtt.as_secs_f64() * CAPACITY_OVERSHOOT).ceil() as u64;
        items.max(1)
    }

    /// Folds a delivery sample into the estimates. `items == 0` marks a
    /// timeout or failure and decays the capacity without touching the
    /// round-trip estimate.
    fn update(&mut self, kind: MessageKind, elapsed: Duration, items: usize) {
        let cap = self.capacity.entry(kind).or_default();
        if items == 0 {
            *cap *= 1.0 - MEASUREMENT_IMPACT;
            return;
        }
        let measured = items as f64 / elapsed.as_secs_f64().max(0.001);
        *cap = (1.0 - MEASUREMENT_IMPACT) * *cap + MEASUREMENT_IMPACT * measured;

        let smoothed = (1.0 - MEASUREMENT_IMPACT) * self.roundtrip.as_secs_f64()
            + MEASUREMENT_IMPACT * elapsed.as_secs_f64();
        self.roundtrip =
            Duration::from_secs_f64(smoothed).clamp(RTT_MIN_ESTIMATE, RTT_MAX_ESTIMATE);
    }
}

/// Thread-safe registry of per-peer throughput trackers.
///
/// Cheaply cloneable (Arc-backed); clones share state.
#[derive(Debug, Clone, Default)]
pub struct RateTrackers {
    inner: Arc<RwLock<HashMap<String, Tracker>>>,
}

impl RateTrackers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a peer. Replaces any previous tracker for the id.
    pub fn track(&self, id: &str, tracker: Tracker) {
        self.inner.write().insert(id.to_string(), tracker);
    }

    /// Stops tracking a peer.
    pub fn untrack(&self, id: &str) {
        self.inner.write().remove(id);
    }

    /// Estimated number of items the peer can serve within `target_rtt`.
    /// Unknown peers get the single-item floor.
    pub fn capacity(&self, id: &str, kind: MessageKind, target_rtt: Duration) -> u64 {
        self.inner
            .read()
            .get(id)
            .map(|tracker| tracker.capacity(kind, target_rtt))
            .unwrap_or(1)
    }

    /// Records a delivery (or, with `items == 0`, a failure) for a peer.
    pub fn update(&self, id: &str, kind: MessageKind, elapsed: Duration, items: usize) {
        if let Some(tracker) = self.inner.write().get_mut(id) {
            tracker.update(kind, elapsed, items);
        }
    }

    /// Mean per-kind capacity across all tracked peers, used to seed
    /// newcomers.
    pub fn mean_capacities(&self) -> HashMap<MessageKind, f64> {
        let trackers = self.inner.read();
        let mut sums: HashMap<MessageKind, f64> = HashMap::new();
        for tracker in trackers.values() {
            for (kind, cap) in &tracker.capacity {
                *sums.entry(*kind).or_default() += cap;
            }
        }
        for cap in sums.values_mut() {
            *cap /= trackers.len() as f64;
        }
        sums
    }

    /// Median smoothed round trip across tracked peers, or the conservative
    /// maximum when none are tracked yet.
    pub fn median_round_trip(&self) -> Duration {
        let trackers = self.inner.read();
        let mut rtts: Vec<Duration> = trackers.values().map(|t| t.roundtrip).collect();
        if rtts.is_empty() {
            return RTT_MAX_ESTIMATE;
        }
        rtts.sort();
        rtts[rtts.len() / 2]
    }

    /// Deadline allowed for a single request before its timeout fires.
    /// Sampled once at issue time; it tightens as the fleet proves faster.
    pub fn target_timeout(&self) -> Duration {
        (self.median_round_trip() * TTL_SCALING).min(TTL_LIMIT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(rtts_and_caps: &[(u64, f64)]) -> RateTrackers {
        let rates = RateTrackers::new();
        for (i, (rtt, cap)) in rtts_and_caps.iter().enumerate() {
            let mut capacity = HashMap::new();
            capacity.insert(MessageKind::ByteCodes, *cap);
            rates.track(
                &format!("peer{i}"),
                Tracker::new(capacity, Duration::from_secs(*rtt)),
            );
        }
        rates
    }

    #[test]
    fn unknown_peer_gets_single_item_probe() {
        let rates = RateTrackers::new();
        assert_eq!(
            rates.capacity("nobody", MessageKind::ByteCodes, Duration::from_secs(3)),
            1
        );
    }

    #[test]
    fn fresh_tracker_floors_at_one_item() {
        let rates = tracked(&[(5, 0.0)]);
        assert_eq!(
            rates.capacity("peer0", MessageKind::ByteCodes, Duration::from_secs(10)),
            1
        );
    }

    #[test]
    fn capacity_grows_with_observed_throughput() {
        let rates = tracked(&[(5, 0.0)]);
        for _ in 0..20 {
            rates.update(
                "peer0",
                MessageKind::ByteCodes,
                Duration::from_secs(1),
                50,
            );
        }
        let cap = rates.capacity("peer0", MessageKind::ByteCodes, Duration::from_secs(1));
        assert!(cap > 20, "capacity should approach the measured rate, got {cap}");
    }

    #[test]
    fn zero_sample_craters_the_estimate() {
        let rates = tracked(&[(5, 0.0)]);
        for _ in 0..20 {
            rates.update("peer0", MessageKind::ByteCodes, Duration::from_secs(1), 50);
        }
        let before = rates.capacity("peer0", MessageKind::ByteCodes, Duration::from_secs(1));
        for _ in 0..40 {
            rates.update("peer0", MessageKind::ByteCodes, Duration::from_secs(1), 0);
        }
        let after = rates.capacity("peer0", MessageKind::ByteCodes, Duration::from_secs(1));
        assert!(after < before / 2, "decay too weak: {before} -> {after}");
    }

    #[test]
    fn median_round_trip_defaults_conservative() {
        let rates = RateTrackers::new();
        assert_eq!(rates.median_round_trip(), RTT_MAX_ESTIMATE);
    }

    #[test]
    fn target_timeout_tracks_the_median() {
        let rates = tracked(&[(2, 0.0), (4, 0.0), (19, 0.0)]);
        assert_eq!(rates.target_timeout(), Duration::from_secs(12));
    }

    #[test]
    fn target_timeout_is_capped() {
        let rates = RateTrackers::new();
        assert_eq!(rates.target_timeout(), TTL_LIMIT);
    }

    #[test]
    fn newcomers_inherit_fleet_estimates() {
        let rates = tracked(&[(4, 0.0)]);
        for _ in 0..20 {
            rates.update("peer0", MessageKind::ByteCodes, Duration::from_secs(1), 60);
        }
        let seeded = Tracker::new(rates.mean_capacities(), rates.median_round_trip());
        rates.track("newcomer", seeded);
        let cap = rates.capacity("newcomer", MessageKind::ByteCodes, Duration::from_secs(1));
        assert!(cap > 10, "newcomer should inherit the fleet mean, got {cap}");
    }
}
