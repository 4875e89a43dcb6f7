//! Bus configuration.

use crate::breaker::BreakerConfig;
use crate::seen::SeenConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a [`MessageBus`](crate::MessageBus).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Relay URLs to subscribe to and publish through.
    pub relays: Vec<String>,

    /// Directory holding the per-account state files.
    pub state_dir: PathBuf,

    /// Buffer subtracted from the resumption timestamp when subscribing.
    ///
    /// Tolerates clock skew between relays and missed events around the
    /// last checkpoint; duplicates from the overlap window are handled by
    /// the seen tracker.
    pub lookback: Duration,

    /// Debounce window for checkpoint writes.
    ///
    /// Each processed event resets (not stacks) a single pending write.
    pub persist_debounce: Duration,

    /// Maximum number of recent event ids kept in the checkpoint.
    pub recent_ids_cap: usize,

    /// Seen tracker settings.
    pub seen: SeenConfig,

    /// Per-relay circuit breaker settings.
    pub breaker: BreakerConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            state_dir: PathBuf::from("./data/courier"),
            lookback: Duration::from_secs(120),
            persist_debounce: Duration::from_secs(5),
            recent_ids_cap: 5000,
            seen: SeenConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }
}
