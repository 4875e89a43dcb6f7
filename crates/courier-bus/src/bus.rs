//! The message bus orchestrator.
//!
//! Ties the leaf components together: opens one logical subscription across
//! all configured relays, runs the inbound validation/decrypt pipeline, and
//! drives outbound encrypted sends with health-ranked, breaker-gated
//! failover.
//!
//! # Inbound pipeline
//!
//! Applied per received event, first matching rule wins:
//!
//! 1. Duplicate or currently in flight — drop
//! 2. Self-authored — drop
//! 3. Stale (`created_at` before the resumption window) — drop
//! 4. Not addressed to us (no matching `p` tag) — drop
//! 5. Invalid signature — error sink, drop
//! 6. Mark seen (before decrypting, so a crash mid-decrypt cannot bypass
//!    dedup when the relay redelivers)
//! 7. Decrypt; on failure error sink, drop
//! 8. Deliver `(sender, plaintext, reply)` to the handler
//! 9. Advance the checkpoint and schedule a debounced persist
//!
//! # Outbound send
//!
//! Content is encrypted and signed once; relays are tried strictly
//! sequentially in health-score order, skipping any whose breaker denies
//! the attempt. The first accepting relay wins; exhaustion of every
//! candidate is the only error surfaced to the caller.

use crate::breaker::BreakerMap;
use crate::config::BusConfig;
use crate::crypto::{CryptoCodec, Nip04Codec};
use crate::error::{Error, Result};
use crate::health::RelayHealthTracker;
use crate::seen::SeenTracker;
use crate::state::{BusState, ProfileState, PublishOutcome, StateStore, BUS_STATE_VERSION};
use crate::transport::{NostrTransport, RelayTransport, TransportNotification};

use async_trait::async_trait;
use courier_core::metrics::MetricsRecorder;
use courier_core::{is_addressed_to, unix_now, verify_event};
use nostr::{Event, EventBuilder, EventId, Filter, Keys, Kind, Metadata, PublicKey, Tag, Timestamp};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Receives validated, decrypted, non-duplicate inbound messages.
///
/// Invoked exactly once per delivered event. `reply` re-enters the outbound
/// send path addressed back to the sender.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn on_message(&self, sender: PublicKey, plaintext: String, reply: Reply);
}

/// Receives recoverable faults (signature/decrypt failures, relay publish
/// errors, persistence errors). Never called for ordinary drops.
pub trait ErrorSink: Send + Sync {
    /// Report one recoverable fault with a short context label.
    fn on_error(&self, error: &Error, context: &str);
}

/// Error sink that logs through `tracing`.
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn on_error(&self, error: &Error, context: &str) {
        tracing::warn!("{}: {}", context, error);
    }
}

/// Handle for replying to the sender of a delivered message.
#[derive(Clone)]
pub struct Reply {
    to: PublicKey,
    outbound: Arc<Outbound>,
}

impl Reply {
    /// Encrypt and send `text` back to the message's sender.
    pub async fn send(&self, text: &str) -> Result<EventId> {
        self.outbound.send_direct_message(&self.to, text).await
    }

    /// The public key this reply is addressed to.
    pub fn recipient(&self) -> PublicKey {
        self.to
    }
}

/// Outbound publish path shared by the bus and [`Reply`] handles.
struct Outbound {
    keys: Keys,
    relays: Vec<String>,
    transport: Arc<dyn RelayTransport>,
    codec: Arc<dyn CryptoCodec>,
    breakers: BreakerMap,
    health: RelayHealthTracker,
    metrics: Arc<MetricsRecorder>,
    errors: Arc<dyn ErrorSink>,
}

impl Outbound {
    /// Encrypt, sign, and publish a DM with sequential failover.
    async fn send_direct_message(&self, to: &PublicKey, text: &str) -> Result<EventId> {
        let ciphertext = self.codec.encrypt(self.keys.secret_key(), to, text)?;
        let event = EventBuilder::new(Kind::EncryptedDirectMessage, ciphertext)
            .tag(Tag::public_key(*to))
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Sign(e.to_string()))?;
        self.publish_with_failover(&event).await
    }

    /// Try relays in health order until one accepts the event.
    ///
    /// Each relay's breaker observes the real outcome before the next
    /// candidate is tried; attempts are never raced in parallel.
    async fn publish_with_failover(&self, event: &Event) -> Result<EventId> {
        let ordered = self.health.sorted_relays(&self.relays);
        let mut attempted = 0usize;
        let mut last_error: Option<String> = None;

        for relay in &ordered {
            if !self.breakers.can_attempt(relay) {
                self.metrics.incr("bus_publish_skipped_total");
                tracing::debug!("Skipping relay {} (breaker open)", relay);
                continue;
            }

            attempted += 1;
            self.metrics.incr("bus_publish_attempts_total");
            let started = Instant::now();

            match self.transport.publish(relay, event).await {
                Ok(()) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    self.breakers.record_success(relay);
                    self.health.record_success(relay, latency_ms);
                    self.metrics.incr("bus_publish_success_total");
                    tracing::debug!("Published {} via {} in {}ms", event.id, relay, latency_ms);
                    return Ok(event.id);
                }
                Err(e) => {
                    self.breakers.record_failure(relay);
                    self.health.record_failure(relay);
                    self.metrics.incr("bus_publish_failures_total");
                    self.errors.on_error(&e, "relay publish");
                    tracing::warn!("Publish to {} failed: {}", relay, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(Error::AllRelaysFailed {
            attempted,
            last: last_error.unwrap_or_else(|| "all relays skipped by circuit breaker".to_string()),
        })
    }

    /// Sign and publish a profile metadata event to every configured relay.
    ///
    /// Unlike the DM path this does not stop at the first success: the
    /// per-relay outcome map is the point. Breaker-denied relays are
    /// recorded as failures without being attempted.
    async fn publish_profile(
        &self,
        metadata_json: String,
    ) -> Result<(EventId, HashMap<String, PublishOutcome>, usize)> {
        let event = EventBuilder::new(Kind::Metadata, metadata_json)
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Sign(e.to_string()))?;

        let mut results = HashMap::new();
        let mut attempted = 0usize;
        for relay in &self.relays {
            if !self.breakers.can_attempt(relay) {
                self.metrics.incr("bus_publish_skipped_total");
                results.insert(relay.clone(), PublishOutcome::failure("circuit open"));
                continue;
            }

            attempted += 1;
            self.metrics.incr("bus_publish_attempts_total");
            let started = Instant::now();
            match self.transport.publish(relay, &event).await {
                Ok(()) => {
                    self.breakers.record_success(relay);
                    self.health
                        .record_success(relay, started.elapsed().as_millis() as u64);
                    self.metrics.incr("bus_publish_success_total");
                    results.insert(relay.clone(), PublishOutcome::success());
                }
                Err(e) => {
                    self.breakers.record_failure(relay);
                    self.health.record_failure(relay);
                    self.metrics.incr("bus_publish_failures_total");
                    self.errors.on_error(&e, "profile publish");
                    results.insert(relay.clone(), PublishOutcome::failure(e.to_string()));
                }
            }
        }

        Ok((event.id, results, attempted))
    }
}

/// Shared internals of a running bus.
struct BusCore {
    config: BusConfig,
    keys: Keys,
    /// Our public key in hex; scopes the persisted state files.
    account: String,
    seen: Arc<SeenTracker>,
    outbound: Arc<Outbound>,
    transport: Arc<dyn RelayTransport>,
    codec: Arc<dyn CryptoCodec>,
    store: StateStore,
    metrics: Arc<MetricsRecorder>,
    errors: Arc<dyn ErrorSink>,
    handler: Arc<dyn MessageHandler>,
    state: Mutex<BusState>,
    in_flight: Mutex<HashSet<EventId>>,
    since: AtomicU64,
    persist_pending: Mutex<Option<JoinHandle<()>>>,
    recv_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Decentralized-relay message bus for one account.
///
/// See the module docs for the pipeline. Construction validates the key and
/// relay list synchronously; network activity starts with
/// [`start`](MessageBus::start) and stops with [`close`](MessageBus::close).
pub struct MessageBus {
    core: Arc<BusCore>,
}

impl MessageBus {
    /// Create a bus with the default transport and content codec.
    ///
    /// Fails fast on a malformed secret key or an empty relay list, before
    /// any network activity.
    pub fn new(
        config: BusConfig,
        secret_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self> {
        let keys = Keys::parse(secret_key).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let transport = Arc::new(NostrTransport::new(keys.clone()));
        Self::with_parts(
            config,
            keys,
            handler,
            transport,
            Arc::new(Nip04Codec),
            Arc::new(LogErrorSink),
            Arc::new(MetricsRecorder::new()),
        )
    }

    /// Create a bus with explicit collaborators (used by tests and hosts
    /// that install their own transport, codec, error sink, or metrics).
    pub fn with_parts(
        config: BusConfig,
        keys: Keys,
        handler: Arc<dyn MessageHandler>,
        transport: Arc<dyn RelayTransport>,
        codec: Arc<dyn CryptoCodec>,
        errors: Arc<dyn ErrorSink>,
        metrics: Arc<MetricsRecorder>,
    ) -> Result<Self> {
        if config.relays.is_empty() {
            return Err(Error::NoRelays);
        }
        let store = StateStore::new(&config.state_dir)?;
        let account = keys.public_key().to_hex();

        let outbound = Arc::new(Outbound {
            keys: keys.clone(),
            relays: config.relays.clone(),
            transport: Arc::clone(&transport),
            codec: Arc::clone(&codec),
            breakers: BreakerMap::new(config.breaker.clone()),
            health: RelayHealthTracker::new(),
            metrics: Arc::clone(&metrics),
            errors: Arc::clone(&errors),
        });

        let seen = Arc::new(SeenTracker::new(config.seen.clone()));

        Ok(Self {
            core: Arc::new(BusCore {
                config,
                keys,
                account,
                seen,
                outbound,
                transport,
                codec,
                store,
                metrics,
                errors,
                handler,
                state: Mutex::new(BusState::default()),
                in_flight: Mutex::new(HashSet::new()),
                since: AtomicU64::new(0),
                persist_pending: Mutex::new(None),
                recv_handle: Mutex::new(None),
            }),
        })
    }

    /// Load the checkpoint, seed dedup, and open the relay subscription.
    pub async fn start(&self) -> Result<()> {
        let core = &self.core;
        let now = unix_now();

        let loaded = core.store.load_bus_state(&core.account);
        let since = compute_since(loaded.as_ref(), now).saturating_sub(core.config.lookback.as_secs());
        core.since.store(since, Ordering::SeqCst);

        if let Some(ref persisted) = loaded {
            let ids: Vec<EventId> = persisted
                .recent_event_ids
                .iter()
                .filter_map(|hex| EventId::parse(hex).ok())
                .collect();
            if ids.len() < persisted.recent_event_ids.len() {
                tracing::debug!(
                    "Dropped {} unparseable ids while seeding dedup",
                    persisted.recent_event_ids.len() - ids.len()
                );
            }
            core.seen.seed(&ids);
        }

        {
            let mut state = core.state.lock();
            *state = loaded.unwrap_or_default();
            state.version = BUS_STATE_VERSION;
            state.gateway_started_at = Some(now);
        }
        // Initial snapshot; persistence faults are never fatal.
        core.persist_now();

        let filter = Filter::new()
            .kind(Kind::EncryptedDirectMessage)
            .pubkey(core.keys.public_key())
            .since(Timestamp::from(since));

        let rx = core.transport.subscribe(&core.config.relays, filter).await?;
        Arc::clone(&core.seen).start_pruning();

        let loop_core = Arc::clone(core);
        let handle = tokio::spawn(async move {
            BusCore::run_loop(loop_core, rx).await;
        });
        *core.recv_handle.lock() = Some(handle);

        tracing::info!(
            "Bus started for {} with {} relays, since={}",
            core.account,
            core.config.relays.len(),
            since
        );
        Ok(())
    }

    /// Encrypt and send a DM, failing over across healthy relays.
    pub async fn send_direct_message(&self, to: &PublicKey, text: &str) -> Result<EventId> {
        self.core.outbound.send_direct_message(to, text).await
    }

    /// Publish our profile metadata to every configured relay.
    ///
    /// The per-relay outcome map is persisted regardless of the overall
    /// result; the call errors only if no relay accepted the event.
    pub async fn publish_profile(&self, metadata: &Metadata) -> Result<EventId> {
        let core = &self.core;
        let json = serde_json::to_string(metadata)?;
        let (event_id, results, attempted) = core.outbound.publish_profile(json).await?;

        let accepted = results.values().filter(|o| o.ok).count();
        let profile_state = ProfileState {
            last_published_at: Some(unix_now()),
            last_published_event_id: Some(event_id.to_hex()),
            last_publish_results: results,
            ..ProfileState::default()
        };
        if let Err(e) = core.store.save_profile_state(&core.account, &profile_state) {
            core.metrics.incr("bus_state_persist_failures_total");
            core.errors.on_error(&e, "profile state persist");
        }

        if accepted == 0 {
            let last = profile_state
                .last_publish_results
                .values()
                .filter_map(|o| o.error.clone())
                .next()
                .unwrap_or_else(|| "no relay accepted the event".to_string());
            return Err(Error::AllRelaysFailed { attempted, last });
        }
        tracing::info!(
            "Profile {} published to {}/{} relays",
            event_id,
            accepted,
            core.config.relays.len()
        );
        Ok(event_id)
    }

    /// Close the subscription, stop the sweep, and flush a pending write.
    pub async fn close(&self) {
        let core = &self.core;
        tracing::info!("Closing bus for {}", core.account);

        core.transport.close().await;
        if let Some(handle) = core.recv_handle.lock().take() {
            handle.abort();
        }
        core.seen.stop();

        let pending = core.persist_pending.lock().take();
        if let Some(handle) = pending {
            handle.abort();
            // Best-effort flush; write errors are logged, never raised.
            core.persist_now();
        }
    }

    /// Per-relay circuit breakers (live view).
    pub fn breakers(&self) -> &BreakerMap {
        &self.core.outbound.breakers
    }

    /// Per-relay health tracker (live view).
    pub fn health(&self) -> &RelayHealthTracker {
        &self.core.outbound.health
    }

    /// The metrics recorder this bus reports into.
    pub fn metrics(&self) -> &MetricsRecorder {
        &self.core.metrics
    }

    /// The seen tracker (live view).
    pub fn seen(&self) -> &SeenTracker {
        &self.core.seen
    }

    /// Our public key.
    pub fn public_key(&self) -> PublicKey {
        self.core.keys.public_key()
    }
}

impl BusCore {
    /// Consume transport notifications until the channel closes.
    async fn run_loop(core: Arc<BusCore>, mut rx: mpsc::Receiver<TransportNotification>) {
        while let Some(notification) = rx.recv().await {
            match notification {
                TransportNotification::Event { relay_url, event } => {
                    BusCore::handle_event(&core, relay_url, event);
                }
                TransportNotification::EndOfStored { relay_url } => {
                    tracing::debug!("Relay {} finished stored replay", relay_url);
                }
                TransportNotification::Closed { relay_url } => {
                    core.metrics.incr("bus_subscription_closed_total");
                    tracing::warn!("Relay {} closed the subscription", relay_url);
                }
            }
        }
        tracing::debug!("Transport notification channel closed");
    }

    /// Run the synchronous head of the inbound pipeline and spawn the
    /// decrypt/deliver tail for events that pass.
    fn handle_event(core: &Arc<BusCore>, relay_url: String, event: Box<Event>) {
        core.metrics.incr("bus_events_received_total");
        let id = event.id;

        if core.seen.peek(&id) || core.in_flight.lock().contains(&id) {
            core.metrics.incr("bus_events_duplicate_total");
            tracing::debug!("Dropping duplicate event {}", id);
            return;
        }
        if event.pubkey == core.keys.public_key() {
            core.metrics.incr("bus_events_self_total");
            return;
        }
        if event.created_at.as_u64() < core.since.load(Ordering::SeqCst) {
            core.metrics.incr("bus_events_stale_total");
            return;
        }
        if !is_addressed_to(&event, &core.keys.public_key()) {
            core.metrics.incr("bus_events_not_addressed_total");
            return;
        }
        if let Err(e) = verify_event(&event) {
            core.metrics.incr("bus_events_invalid_signature_total");
            let err = Error::Core(e);
            core.errors.on_error(&err, "signature verification");
            tracing::warn!("Rejected event {} from {}: bad signature", id, relay_url);
            return;
        }

        // Mark seen before the decrypt suspension point: a crash mid-decrypt
        // must not let a relay redelivery bypass dedup.
        core.seen.add(&id);
        core.in_flight.lock().insert(id);

        let task_core = Arc::clone(core);
        tokio::spawn(async move {
            let _guard = InFlightGuard {
                id,
                core: Arc::clone(&task_core),
            };
            BusCore::process_event(&task_core, relay_url, *event).await;
        });
    }

    /// Decrypt, deliver, and checkpoint one validated event.
    async fn process_event(core: &Arc<BusCore>, relay_url: String, event: Event) {
        let plaintext = match core
            .codec
            .decrypt(core.keys.secret_key(), &event.pubkey, &event.content)
        {
            Ok(p) => p,
            Err(e) => {
                core.metrics.incr("bus_events_decrypt_failed_total");
                core.errors.on_error(&e, "decrypt");
                tracing::warn!("Failed to decrypt event {} from {}", event.id, relay_url);
                return;
            }
        };

        let reply = Reply {
            to: event.pubkey,
            outbound: Arc::clone(&core.outbound),
        };
        core.handler.on_message(event.pubkey, plaintext, reply).await;
        core.metrics.incr("bus_messages_delivered_total");

        {
            let mut state = core.state.lock();
            let created = event.created_at.as_u64();
            state.last_processed_at =
                Some(state.last_processed_at.map_or(created, |cur| cur.max(created)));
            state.recent_event_ids.push(event.id.to_hex());
            let cap = core.config.recent_ids_cap;
            if state.recent_event_ids.len() > cap {
                let excess = state.recent_event_ids.len() - cap;
                state.recent_event_ids.drain(0..excess);
            }
        }
        BusCore::schedule_persist(core);
    }

    /// Reset (not stack) the single pending debounced checkpoint write.
    fn schedule_persist(core: &Arc<BusCore>) {
        let mut pending = core.persist_pending.lock();
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let delay = core.config.persist_debounce;
        let task_core = Arc::clone(core);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task_core.persist_now();
        }));
    }

    /// Write the current checkpoint; faults go to the error sink.
    fn persist_now(&self) {
        let snapshot = self.state.lock().clone();
        self.metrics.incr("bus_state_persist_total");
        if let Err(e) = self.store.save_bus_state(&self.account, &snapshot) {
            self.metrics.incr("bus_state_persist_failures_total");
            self.errors.on_error(&e, "state persist");
        }
    }
}

/// Removes an event id from the in-flight set when the handler task ends,
/// whatever the outcome.
struct InFlightGuard {
    id: EventId,
    core: Arc<BusCore>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.core.in_flight.lock().remove(&self.id);
    }
}

/// Base resumption timestamp from a persisted checkpoint.
///
/// The newer of `last_processed_at` and `gateway_started_at`; `now` when
/// there is no usable prior state. The subscription lookback buffer is
/// subtracted by the caller.
pub fn compute_since(state: Option<&BusState>, now: u64) -> u64 {
    match state {
        Some(s) => {
            let base = s
                .last_processed_at
                .unwrap_or(0)
                .max(s.gateway_started_at.unwrap_or(0));
            if base == 0 { now } else { base }
        }
        None => now,
    }
}
