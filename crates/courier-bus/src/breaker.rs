//! Per-relay circuit breakers for outbound publish fault isolation.
//!
//! Each relay gets its own breaker, created lazily on first use:
//!
//! - **Closed**: normal operation; consecutive failures are counted.
//! - **Open**: the relay is skipped until the reset window elapses.
//! - **HalfOpen**: one probe attempt is allowed; a success closes the
//!   breaker, a failure reopens it.
//!
//! The Open → HalfOpen transition happens as a side effect of
//! [`BreakerMap::can_attempt`], not on a timer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast; attempts are denied until the reset window elapses.
    Open,
    /// Testing recovery with a single probe.
    HalfOpen,
}

/// Circuit breaker configuration.
#[derive(Clone, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long an open breaker waits before allowing a probe.
    pub reset_after: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_after: Duration::from_secs(30),
        }
    }
}

/// Breaker state for a single relay.
#[derive(Debug)]
struct RelayCircuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    last_success_at: Option<Instant>,
}

impl RelayCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Lazily-populated map of per-relay circuit breakers.
pub struct BreakerMap {
    config: BreakerConfig,
    circuits: Mutex<HashMap<String, RelayCircuit>>,
}

impl BreakerMap {
    /// Create a breaker map with the given configuration.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a publish attempt against `relay` is currently allowed.
    ///
    /// Closed and HalfOpen allow attempts. Open allows one only if the reset
    /// window has elapsed since the last failure, in which case the breaker
    /// flips to HalfOpen before returning `true`.
    pub fn can_attempt(&self, relay: &str) -> bool {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(relay.to_string())
            .or_insert_with(RelayCircuit::new);

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = match circuit.last_failure_at {
                    Some(at) => at.elapsed(),
                    None => return false,
                };
                if elapsed < self.config.reset_after {
                    return false;
                }
                circuit.state = CircuitState::HalfOpen;
                tracing::info!("Relay {} breaker half-open, allowing probe", relay);
                true
            }
        }
    }

    /// Record a successful publish against `relay`.
    ///
    /// Resets the failure count; a HalfOpen breaker closes.
    pub fn record_success(&self, relay: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(relay.to_string())
            .or_insert_with(RelayCircuit::new);

        circuit.last_success_at = Some(Instant::now());
        circuit.failure_count = 0;
        if circuit.state != CircuitState::Closed {
            tracing::info!("Relay {} breaker closed after success", relay);
        }
        circuit.state = CircuitState::Closed;
    }

    /// Record a failed publish against `relay`.
    ///
    /// Opens the breaker after `failure_threshold` consecutive failures
    /// while Closed; any failure while HalfOpen reopens immediately.
    pub fn record_failure(&self, relay: &str) {
        let mut circuits = self.circuits.lock();
        let circuit = circuits
            .entry(relay.to_string())
            .or_insert_with(RelayCircuit::new);

        circuit.last_failure_at = Some(Instant::now());
        circuit.failure_count += 1;

        match circuit.state {
            CircuitState::Closed => {
                if circuit.failure_count >= self.config.failure_threshold {
                    circuit.state = CircuitState::Open;
                    tracing::warn!(
                        "Relay {} breaker opened after {} consecutive failures",
                        relay,
                        circuit.failure_count
                    );
                }
            }
            CircuitState::HalfOpen => {
                circuit.state = CircuitState::Open;
                tracing::warn!("Relay {} probe failed, breaker reopened", relay);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state of the breaker for `relay` (Closed if never seen).
    pub fn state(&self, relay: &str) -> CircuitState {
        self.circuits
            .lock()
            .get(relay)
            .map(|c| c.state)
            .unwrap_or(CircuitState::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY: &str = "wss://relay.example.com";

    fn breaker(threshold: u32, reset_ms: u64) -> BreakerMap {
        BreakerMap::new(BreakerConfig {
            failure_threshold: threshold,
            reset_after: Duration::from_millis(reset_ms),
        })
    }

    #[test]
    fn test_starts_closed() {
        let breakers = breaker(5, 30_000);
        assert_eq!(breakers.state(RELAY), CircuitState::Closed);
        assert!(breakers.can_attempt(RELAY));
    }

    #[test]
    fn test_opens_at_threshold() {
        let breakers = breaker(3, 30_000);

        breakers.record_failure(RELAY);
        breakers.record_failure(RELAY);
        assert_eq!(breakers.state(RELAY), CircuitState::Closed);

        breakers.record_failure(RELAY);
        assert_eq!(breakers.state(RELAY), CircuitState::Open);
        assert!(!breakers.can_attempt(RELAY));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breakers = breaker(3, 30_000);

        breakers.record_failure(RELAY);
        breakers.record_failure(RELAY);
        breakers.record_success(RELAY);
        breakers.record_failure(RELAY);
        breakers.record_failure(RELAY);

        // Not three consecutive failures.
        assert_eq!(breakers.state(RELAY), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_after_reset_window() {
        let breakers = breaker(1, 20);

        breakers.record_failure(RELAY);
        assert!(!breakers.can_attempt(RELAY));

        std::thread::sleep(Duration::from_millis(30));

        // can_attempt flips the breaker to half-open as a side effect.
        assert!(breakers.can_attempt(RELAY));
        assert_eq!(breakers.state(RELAY), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_success_closes() {
        let breakers = breaker(1, 20);

        breakers.record_failure(RELAY);
        std::thread::sleep(Duration::from_millis(30));
        assert!(breakers.can_attempt(RELAY));

        breakers.record_success(RELAY);
        assert_eq!(breakers.state(RELAY), CircuitState::Closed);
        assert!(breakers.can_attempt(RELAY));
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let breakers = breaker(1, 20);

        breakers.record_failure(RELAY);
        std::thread::sleep(Duration::from_millis(30));
        assert!(breakers.can_attempt(RELAY));

        breakers.record_failure(RELAY);
        assert_eq!(breakers.state(RELAY), CircuitState::Open);
        assert!(!breakers.can_attempt(RELAY));
    }

    #[test]
    fn test_relays_are_independent() {
        let breakers = breaker(2, 30_000);

        breakers.record_failure("wss://a.example.com");
        breakers.record_failure("wss://a.example.com");
        breakers.record_failure("wss://b.example.com");

        assert_eq!(breakers.state("wss://a.example.com"), CircuitState::Open);
        assert_eq!(breakers.state("wss://b.example.com"), CircuitState::Closed);
    }
}
