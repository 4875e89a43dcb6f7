//! Relay transport seam.
//!
//! The bus talks to relays through the [`RelayTransport`] trait: one
//! logical subscription spanning all configured relays, consumed as a
//! channel of [`TransportNotification`]s, plus per-relay publishes. The
//! default implementation, [`NostrTransport`], wraps `nostr_sdk::Client`
//! and forwards its relay pool notifications into the channel; tests
//! substitute a scripted transport.

use crate::error::{Error, Result};
use async_trait::async_trait;
use nostr_sdk::prelude::*;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Notification from the relay subscription.
#[derive(Debug)]
pub enum TransportNotification {
    /// An event arrived from a relay.
    Event {
        /// URL of the relay that delivered the event.
        relay_url: String,
        /// The received event, unvalidated.
        event: Box<Event>,
    },
    /// A relay finished replaying stored events for the subscription.
    EndOfStored {
        /// URL of the relay.
        relay_url: String,
    },
    /// A relay closed the subscription.
    Closed {
        /// URL of the relay.
        relay_url: String,
    },
}

/// Opaque relay pub/sub capability used by the bus.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open one logical subscription across `relays` with the given filter.
    ///
    /// Returns the notification channel; the subscription stays open until
    /// [`close`](RelayTransport::close) or until the receiver is dropped.
    async fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
    ) -> Result<mpsc::Receiver<TransportNotification>>;

    /// Publish an event to a single relay.
    async fn publish(&self, relay: &str, event: &Event) -> Result<()>;

    /// Close the subscription and disconnect from all relays.
    async fn close(&self);
}

/// Size of the notification channel between the forwarder and the bus.
const NOTIFICATION_CHANNEL_SIZE: usize = 1024;

/// [`RelayTransport`] backed by a `nostr_sdk` relay pool.
pub struct NostrTransport {
    client: Client,
    forward_handle: Mutex<Option<JoinHandle<()>>>,
}

impl NostrTransport {
    /// Create a transport signing relay auth challenges with `keys`.
    pub fn new(keys: Keys) -> Self {
        let client = Client::builder().signer(keys).build();
        client.automatic_authentication(true);
        Self {
            client,
            forward_handle: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RelayTransport for NostrTransport {
    async fn subscribe(
        &self,
        relays: &[String],
        filter: Filter,
    ) -> Result<mpsc::Receiver<TransportNotification>> {
        for relay_url in relays {
            if let Err(e) = self.client.add_relay(relay_url).await {
                tracing::warn!("Failed to add relay {}: {}", relay_url, e);
            }
        }

        self.client.connect().await;

        self.client
            .subscribe(filter, None)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_SIZE);
        let mut notifications = self.client.notifications();

        let handle = tokio::spawn(async move {
            loop {
                let notification = match notifications.recv().await {
                    Ok(n) => n,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        tracing::info!("Notification channel closed");
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                        metrics::counter!("relay_notifications_lagged_total").increment(count);
                        tracing::warn!("Notification receiver lagged, dropped {} messages", count);
                        continue;
                    }
                };

                let outbound = match notification {
                    RelayPoolNotification::Event {
                        relay_url, event, ..
                    } => Some(TransportNotification::Event {
                        relay_url: relay_url.to_string(),
                        event,
                    }),
                    RelayPoolNotification::Message { relay_url, message } => match message {
                        RelayMessage::EndOfStoredEvents(_) => {
                            Some(TransportNotification::EndOfStored {
                                relay_url: relay_url.to_string(),
                            })
                        }
                        RelayMessage::Closed { .. } => Some(TransportNotification::Closed {
                            relay_url: relay_url.to_string(),
                        }),
                        RelayMessage::Notice(notice) => {
                            tracing::debug!("Relay {} notice: {}", relay_url, notice);
                            None
                        }
                        _ => None,
                    },
                    RelayPoolNotification::Shutdown => {
                        tracing::info!("Relay pool shutdown notification received");
                        break;
                    }
                };

                if let Some(n) = outbound {
                    if tx.send(n).await.is_err() {
                        // Bus side dropped the receiver.
                        break;
                    }
                }
            }
        });
        *self.forward_handle.lock() = Some(handle);

        Ok(rx)
    }

    async fn publish(&self, relay: &str, event: &Event) -> Result<()> {
        let output = self
            .client
            .send_event_to([relay], event)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if output.success.is_empty() {
            let reason = output
                .failed
                .values()
                .next()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "relay rejected event".to_string());
            return Err(Error::Transport(reason));
        }
        Ok(())
    }

    async fn close(&self) {
        self.client.disconnect().await;
        if let Some(handle) = self.forward_handle.lock().take() {
            handle.abort();
        }
    }
}
