//! Bounded, recency- and age-limited cache of processed event IDs.
//!
//! The [`SeenTracker`] answers "have we already processed this id" under a
//! hard memory bound. Entries expire two ways:
//! - **Capacity**: inserting at `max_entries` evicts the least-recently-used
//!   entry (tail of an intrusive recency list).
//! - **Age**: entries untouched for longer than `ttl` are considered absent.
//!   Expiry is checked lazily on access and removed in bulk by a periodic
//!   background sweep.
//!
//! # Key Design
//!
//! The recency list is stored *inside* the map: each entry carries the
//! `prev`/`next` event IDs of its list neighbors rather than pointers, so the
//! whole structure is a single `HashMap` plus head/tail keys. All access goes
//! through one mutex, so a lazy check and the sweep can never disagree about
//! an entry's expiry.

use nostr::EventId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Configuration for the seen tracker.
#[derive(Debug, Clone)]
pub struct SeenConfig {
    /// Maximum number of entries held at any time.
    pub max_entries: usize,
    /// How long an untouched entry stays valid.
    pub ttl: Duration,
    /// Interval of the background expiry sweep.
    pub prune_interval: Duration,
}

impl Default for SeenConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            ttl: Duration::from_secs(600),
            prune_interval: Duration::from_secs(60),
        }
    }
}

struct SeenEntry {
    seen_at: Instant,
    prev: Option<EventId>,
    next: Option<EventId>,
}

#[derive(Default)]
struct SeenInner {
    map: HashMap<EventId, SeenEntry>,
    /// Most recently touched entry.
    head: Option<EventId>,
    /// Least recently touched entry.
    tail: Option<EventId>,
}

impl SeenInner {
    /// Detach `id` from the recency list without removing it from the map.
    fn unlink(&mut self, id: &EventId) {
        let (prev, next) = match self.map.get(id) {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(e) = self.map.get_mut(&p) {
                    e.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(e) = self.map.get_mut(&n) {
                    e.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(entry) = self.map.get_mut(id) {
            entry.prev = None;
            entry.next = None;
        }
    }

    /// Make `id` the head of the recency list. The entry must be detached.
    fn push_front(&mut self, id: EventId) {
        let old_head = self.head;
        if let Some(entry) = self.map.get_mut(&id) {
            entry.prev = None;
            entry.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.map.get_mut(&h) {
                e.prev = Some(id);
            }
        }
        self.head = Some(id);
        if self.tail.is_none() {
            self.tail = Some(id);
        }
    }

    /// Remove an entry entirely.
    fn remove(&mut self, id: &EventId) -> bool {
        if !self.map.contains_key(id) {
            return false;
        }
        self.unlink(id);
        self.map.remove(id);
        true
    }

    /// Remove the least-recently-used entry.
    fn evict_tail(&mut self) {
        if let Some(tail) = self.tail {
            self.remove(&tail);
        }
    }

    /// Insert a fresh entry at the front, evicting the tail at capacity.
    fn insert_front(&mut self, id: EventId, max_entries: usize) {
        if self.map.len() >= max_entries {
            self.evict_tail();
        }
        self.map.insert(
            id,
            SeenEntry {
                seen_at: Instant::now(),
                prev: None,
                next: None,
            },
        );
        self.push_front(id);
    }
}

/// Deduplication cache for event IDs with LRU and TTL eviction.
pub struct SeenTracker {
    config: SeenConfig,
    inner: Mutex<SeenInner>,
    prune_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SeenTracker {
    /// Create a tracker with the given configuration.
    ///
    /// The background sweep is not started here; call [`start_pruning`]
    /// from within a tokio runtime.
    ///
    /// [`start_pruning`]: SeenTracker::start_pruning
    pub fn new(config: SeenConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(SeenInner::default()),
            prune_handle: Mutex::new(None),
        }
    }

    /// Pure read: is `id` present and unexpired?
    ///
    /// Does not mutate the tracker and does not extend the entry's TTL.
    pub fn peek(&self, id: &EventId) -> bool {
        let inner = self.inner.lock();
        match inner.map.get(id) {
            Some(entry) => entry.seen_at.elapsed() <= self.config.ttl,
            None => false,
        }
    }

    /// Check-and-insert in one operation.
    ///
    /// Returns `false` and marks the id seen if it was absent (or present but
    /// expired, in which case the stale entry is replaced). Returns `true`
    /// and refreshes the TTL if the id is present and unexpired.
    ///
    /// The first call for a never-seen id always inserts it; callers that
    /// only want to ask should use [`peek`](SeenTracker::peek).
    pub fn check_and_mark(&self, id: &EventId) -> bool {
        let mut inner = self.inner.lock();
        match inner.map.get(id) {
            Some(entry) if entry.seen_at.elapsed() <= self.config.ttl => {
                if let Some(e) = inner.map.get_mut(id) {
                    e.seen_at = Instant::now();
                }
                inner.unlink(id);
                inner.push_front(*id);
                true
            }
            Some(_) => {
                // Expired: replace with a fresh entry.
                inner.remove(id);
                inner.insert_front(*id, self.config.max_entries);
                false
            }
            None => {
                inner.insert_front(*id, self.config.max_entries);
                false
            }
        }
    }

    /// Unconditionally mark `id` as seen, refreshing it if already present.
    pub fn add(&self, id: &EventId) {
        let mut inner = self.inner.lock();
        if inner.map.contains_key(id) {
            if let Some(e) = inner.map.get_mut(id) {
                e.seen_at = Instant::now();
            }
            inner.unlink(id);
            inner.push_front(*id);
        } else {
            inner.insert_front(*id, self.config.max_entries);
        }
    }

    /// Remove `id`. Returns whether it was present.
    pub fn delete(&self, id: &EventId) -> bool {
        self.inner.lock().remove(id)
    }

    /// Remove all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.head = None;
        inner.tail = None;
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the tracker holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bulk-preload ids, e.g. from a persisted checkpoint.
    ///
    /// Ids are inserted in order, so later ids are treated as more recent;
    /// when the slice exceeds capacity only the most recent survive.
    pub fn seed(&self, ids: &[EventId]) {
        for id in ids {
            self.add(id);
        }
    }

    /// Remove every expired entry.
    ///
    /// Entries are ordered by last touch, so the sweep walks from the tail
    /// and stops at the first unexpired entry.
    pub fn prune_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0usize;
        while let Some(tail) = inner.tail {
            let expired = match inner.map.get(&tail) {
                Some(entry) => entry.seen_at.elapsed() > self.config.ttl,
                None => break,
            };
            if !expired {
                break;
            }
            inner.remove(&tail);
            removed += 1;
        }
        removed
    }

    /// Start the periodic background sweep on the current tokio runtime.
    ///
    /// The task holds only a weak handle, so dropping the tracker ends the
    /// sweep even without an explicit [`stop`](SeenTracker::stop).
    pub fn start_pruning(self: Arc<Self>) {
        let weak = Arc::downgrade(&self);
        let interval = self.config.prune_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let tracker = match weak.upgrade() {
                    Some(t) => t,
                    None => break,
                };
                let removed = tracker.prune_expired();
                if removed > 0 {
                    tracing::debug!("Pruned {} expired seen entries", removed);
                }
            }
        });
        let mut slot = self.prune_handle.lock();
        if let Some(old) = slot.replace(handle) {
            old.abort();
        }
    }

    /// Cancel the background sweep, if running.
    pub fn stop(&self) {
        if let Some(handle) = self.prune_handle.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for SeenTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_id(n: u8) -> EventId {
        let mut bytes = [0u8; 32];
        bytes[0] = n;
        EventId::from_byte_array(bytes)
    }

    fn tracker(max_entries: usize, ttl_ms: u64) -> SeenTracker {
        SeenTracker::new(SeenConfig {
            max_entries,
            ttl: Duration::from_millis(ttl_ms),
            prune_interval: Duration::from_secs(60),
        })
    }

    #[test]
    fn test_check_and_mark_first_call_inserts() {
        let seen = tracker(10, 60_000);
        let id = test_id(1);

        assert!(!seen.check_and_mark(&id));
        assert!(seen.check_and_mark(&id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_peek_does_not_insert() {
        let seen = tracker(10, 60_000);
        let id = test_id(1);

        assert!(!seen.peek(&id));
        assert_eq!(seen.len(), 0);

        seen.add(&id);
        assert!(seen.peek(&id));
        assert_eq!(seen.len(), 1);
    }

    #[test]
    fn test_size_bound_holds() {
        let seen = tracker(3, 60_000);
        for n in 0..50 {
            seen.add(&test_id(n));
            assert!(seen.len() <= 3);
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_lru_eviction_order() {
        let seen = tracker(3, 60_000);
        let (id1, id2, id3, id4) = (test_id(1), test_id(2), test_id(3), test_id(4));

        seen.add(&id1);
        seen.add(&id2);
        seen.add(&id3);
        seen.add(&id4);

        // id1 was least recently used.
        assert!(!seen.peek(&id1));
        assert!(seen.peek(&id2));
        assert!(seen.peek(&id3));
        assert!(seen.peek(&id4));
    }

    #[test]
    fn test_touch_protects_from_eviction() {
        let seen = tracker(3, 60_000);
        let (id1, id2, id3, id4) = (test_id(1), test_id(2), test_id(3), test_id(4));

        seen.add(&id1);
        seen.add(&id2);
        seen.add(&id3);

        // Touch id1, making id2 the LRU entry.
        assert!(seen.check_and_mark(&id1));
        seen.add(&id4);

        assert!(seen.peek(&id1));
        assert!(!seen.peek(&id2));
        assert!(seen.peek(&id3));
        assert!(seen.peek(&id4));
    }

    #[test]
    fn test_ttl_expiry_lazy() {
        let seen = tracker(10, 30);
        let id = test_id(1);

        seen.add(&id);
        assert!(seen.peek(&id));

        std::thread::sleep(Duration::from_millis(50));
        assert!(!seen.peek(&id));

        // Expired entry is replaced on check_and_mark, returning false.
        assert!(!seen.check_and_mark(&id));
        assert!(seen.peek(&id));
    }

    #[test]
    fn test_check_and_mark_refreshes_ttl() {
        let seen = tracker(10, 80);
        let id = test_id(1);

        seen.add(&id);
        std::thread::sleep(Duration::from_millis(50));
        assert!(seen.check_and_mark(&id));

        // Without the refresh the entry would now be past its TTL.
        std::thread::sleep(Duration::from_millis(50));
        assert!(seen.peek(&id));
    }

    #[test]
    fn test_prune_expired() {
        let seen = tracker(10, 30);
        seen.add(&test_id(1));
        seen.add(&test_id(2));
        std::thread::sleep(Duration::from_millis(50));
        seen.add(&test_id(3));

        let removed = seen.prune_expired();
        assert_eq!(removed, 2);
        assert_eq!(seen.len(), 1);
        assert!(seen.peek(&test_id(3)));
    }

    #[test]
    fn test_delete_and_clear() {
        let seen = tracker(10, 60_000);
        seen.add(&test_id(1));
        seen.add(&test_id(2));

        assert!(seen.delete(&test_id(1)));
        assert!(!seen.delete(&test_id(1)));
        assert_eq!(seen.len(), 1);

        seen.clear();
        assert!(seen.is_empty());
    }

    #[test]
    fn test_seed_respects_capacity_most_recent_first() {
        let seen = tracker(3, 60_000);
        let ids: Vec<EventId> = (0..6).map(test_id).collect();
        seen.seed(&ids);

        assert_eq!(seen.len(), 3);
        // The last three ids survive.
        assert!(seen.peek(&test_id(3)));
        assert!(seen.peek(&test_id(4)));
        assert!(seen.peek(&test_id(5)));
        assert!(!seen.peek(&test_id(0)));
    }

    #[tokio::test]
    async fn test_background_sweep() {
        let seen = Arc::new(SeenTracker::new(SeenConfig {
            max_entries: 10,
            ttl: Duration::from_millis(20),
            prune_interval: Duration::from_millis(10),
        }));
        seen.add(&test_id(1));
        Arc::clone(&seen).start_pruning();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(seen.len(), 0);
        seen.stop();
    }
}
