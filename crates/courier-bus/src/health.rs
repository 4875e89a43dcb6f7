//! Relay health scoring for outbound publish ordering.
//!
//! Ranks relays by recent behavior rather than static priority. The score
//! for a relay with history is:
//!
//! ```text
//! success_rate + recency_bonus - latency_penalty, clamped to [0, 1]
//! ```
//!
//! - `success_rate` = successes / (successes + failures)
//! - `recency_bonus` decays linearly from 0.2 to 0 over a fixed window
//!   measured from the most recent outcome, and is zero when that outcome
//!   was a failure
//! - `latency_penalty` = min(0.2, avg latency ms / 10000)
//!
//! A relay with no history scores a neutral 0.5.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Score for a relay with no recorded history.
const NEUTRAL_SCORE: f64 = 0.5;

/// Maximum recency bonus, awarded immediately after a success.
const RECENCY_BONUS_MAX: f64 = 0.2;

/// Window over which the recency bonus decays to zero.
const RECENCY_WINDOW: Duration = Duration::from_secs(300);

/// Cap on the latency penalty.
const LATENCY_PENALTY_CAP: f64 = 0.2;

/// Divisor converting average latency (ms) into a penalty.
const LATENCY_PENALTY_DIVISOR: f64 = 10_000.0;

/// Running aggregates for a single relay.
#[derive(Debug, Clone, Default)]
pub struct RelayHealthStats {
    /// Successful publishes.
    pub success_count: u64,
    /// Failed publishes.
    pub failure_count: u64,
    /// Sum of observed publish latencies (ms).
    pub latency_sum_ms: u64,
    /// Number of latency observations.
    pub latency_count: u64,
    /// Instant of the most recent success.
    pub last_success_at: Option<Instant>,
    /// Instant of the most recent failure.
    pub last_failure_at: Option<Instant>,
}

impl RelayHealthStats {
    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            return NEUTRAL_SCORE;
        }
        self.success_count as f64 / total as f64
    }

    fn recency_bonus(&self) -> f64 {
        let (last_success, last_failure) = (self.last_success_at, self.last_failure_at);
        let most_recent = match (last_success, last_failure) {
            (Some(s), Some(f)) => {
                if f >= s {
                    // Most recent outcome was a failure.
                    return 0.0;
                }
                s
            }
            (Some(s), None) => s,
            (None, _) => return 0.0,
        };

        let elapsed = most_recent.elapsed();
        if elapsed >= RECENCY_WINDOW {
            return 0.0;
        }
        RECENCY_BONUS_MAX * (1.0 - elapsed.as_secs_f64() / RECENCY_WINDOW.as_secs_f64())
    }

    fn latency_penalty(&self) -> f64 {
        if self.latency_count == 0 {
            return 0.0;
        }
        let avg = self.latency_sum_ms as f64 / self.latency_count as f64;
        (avg / LATENCY_PENALTY_DIVISOR).min(LATENCY_PENALTY_CAP)
    }
}

/// Tracks per-relay publish outcomes and ranks relays by score.
#[derive(Default)]
pub struct RelayHealthTracker {
    stats: Mutex<HashMap<String, RelayHealthStats>>,
}

impl RelayHealthTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful publish with its observed latency.
    pub fn record_success(&self, relay: &str, latency_ms: u64) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(relay.to_string()).or_default();
        entry.success_count += 1;
        entry.latency_sum_ms += latency_ms;
        entry.latency_count += 1;
        entry.last_success_at = Some(Instant::now());
    }

    /// Record a failed publish.
    pub fn record_failure(&self, relay: &str) {
        let mut stats = self.stats.lock();
        let entry = stats.entry(relay.to_string()).or_default();
        entry.failure_count += 1;
        entry.last_failure_at = Some(Instant::now());
    }

    /// Health score for `relay` in `[0, 1]`; 0.5 with no history.
    pub fn score(&self, relay: &str) -> f64 {
        let stats = self.stats.lock();
        let entry = match stats.get(relay) {
            Some(e) => e,
            None => return NEUTRAL_SCORE,
        };
        (entry.success_rate() + entry.recency_bonus() - entry.latency_penalty()).clamp(0.0, 1.0)
    }

    /// Copy of the stats recorded for `relay`, if any.
    pub fn stats(&self, relay: &str) -> Option<RelayHealthStats> {
        self.stats.lock().get(relay).cloned()
    }

    /// Return a new list of the given relays ordered by descending score.
    ///
    /// The sort is stable, so equal scores keep their input order. The input
    /// is never mutated.
    pub fn sorted_relays(&self, relays: &[String]) -> Vec<String> {
        let mut scored: Vec<(String, f64)> = relays
            .iter()
            .map(|r| (r.clone(), self.score(r)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(r, _)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(relays: &[&str]) -> Vec<String> {
        relays.iter().map(|r| r.to_string()).collect()
    }

    #[test]
    fn test_unknown_relay_scores_neutral() {
        let health = RelayHealthTracker::new();
        assert!((health.score("wss://unknown.example.com") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_successes_raise_score() {
        let health = RelayHealthTracker::new();
        health.record_success("wss://good.example.com", 50);
        health.record_success("wss://good.example.com", 40);

        // success_rate 1.0 + fresh recency bonus ~0.2, clamped to 1.0.
        assert!(health.score("wss://good.example.com") > 0.9);
    }

    #[test]
    fn test_failures_lower_score() {
        let health = RelayHealthTracker::new();
        health.record_failure("wss://bad.example.com");
        health.record_failure("wss://bad.example.com");

        // success_rate 0, no recency bonus after a failure.
        assert!((health.score("wss://bad.example.com") - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_recency_bonus_after_failure() {
        let health = RelayHealthTracker::new();
        health.record_success("wss://r.example.com", 10);
        health.record_failure("wss://r.example.com");

        // success_rate 0.5, bonus suppressed by the trailing failure.
        let score = health.score("wss://r.example.com");
        assert!((score - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_latency_penalty() {
        let health = RelayHealthTracker::new();
        // avg 3000ms -> penalty 0.3 capped at 0.2.
        health.record_success("wss://slow.example.com", 3000);
        let slow = health.score("wss://slow.example.com");

        health.record_success("wss://fast.example.com", 10);
        let fast = health.score("wss://fast.example.com");

        assert!(fast > slow);
    }

    #[test]
    fn test_score_clamped() {
        let health = RelayHealthTracker::new();
        for _ in 0..10 {
            health.record_success("wss://r.example.com", 1);
        }
        let score = health.score("wss://r.example.com");
        assert!(score <= 1.0);
        assert!(score >= 0.0);
    }

    #[test]
    fn test_sorted_relays_orders_by_score() {
        let health = RelayHealthTracker::new();
        health.record_failure("wss://bad.example.com");
        health.record_failure("wss://bad.example.com");
        health.record_success("wss://good.example.com", 20);

        let input = urls(&["wss://bad.example.com", "wss://new.example.com", "wss://good.example.com"]);
        let sorted = health.sorted_relays(&input);

        assert_eq!(sorted[0], "wss://good.example.com");
        assert_eq!(sorted[1], "wss://new.example.com");
        assert_eq!(sorted[2], "wss://bad.example.com");
    }

    #[test]
    fn test_sorted_relays_does_not_mutate_input() {
        let health = RelayHealthTracker::new();
        health.record_success("wss://b.example.com", 10);

        let input = urls(&["wss://a.example.com", "wss://b.example.com"]);
        let before = input.clone();
        let sorted = health.sorted_relays(&input);

        assert_eq!(input, before);
        assert_eq!(sorted.len(), input.len());
    }

    #[test]
    fn test_sorted_relays_stable_for_ties() {
        let health = RelayHealthTracker::new();
        let input = urls(&["wss://x.example.com", "wss://y.example.com", "wss://z.example.com"]);
        let sorted = health.sorted_relays(&input);

        // All unknown, all 0.5: input order preserved.
        assert_eq!(sorted, input);
    }
}
