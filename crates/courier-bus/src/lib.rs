//! Decentralized-relay message bus.
//!
//! Reliable encrypted messaging over a set of unreliable public relays:
//! one logical inbound subscription with validation, dedup, and resumable
//! checkpoints, plus outbound publishing with health-ranked relay selection
//! and per-relay circuit breakers.
//!
//! ```text
//!                         +--------------------+
//!   relay 1 --\           |     MessageBus     |
//!   relay 2 ----> pool -->| validate -> dedup  |--> handler(sender, text)
//!   relay 3 --/           | -> decrypt -> ckpt |          |
//!                         +--------------------+          v reply
//!                                   ^             health-ranked publish
//!                                   |             with circuit breakers
//!                            persisted state
//!                          (resume after crash)
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use courier_bus::{BusConfig, MessageBus, MessageHandler, Reply};
//! use nostr::PublicKey;
//! use std::sync::Arc;
//!
//! struct Echo;
//!
//! #[async_trait::async_trait]
//! impl MessageHandler for Echo {
//!     async fn on_message(&self, _sender: PublicKey, text: String, reply: Reply) {
//!         let _ = reply.send(&format!("echo: {}", text)).await;
//!     }
//! }
//!
//! # async fn run() -> courier_bus::Result<()> {
//! let config = BusConfig {
//!     relays: vec!["wss://relay.example.com".to_string()],
//!     ..BusConfig::default()
//! };
//! let bus = MessageBus::new(config, "<secret key hex>", Arc::new(Echo))?;
//! bus.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod health;
pub mod seen;
pub mod state;
pub mod transport;

pub use breaker::{BreakerConfig, BreakerMap, CircuitState};
pub use bus::{compute_since, ErrorSink, LogErrorSink, MessageBus, MessageHandler, Reply};
pub use config::BusConfig;
pub use crypto::{CryptoCodec, Nip04Codec};
pub use error::{Error, Result};
pub use health::{RelayHealthStats, RelayHealthTracker};
pub use seen::{SeenConfig, SeenTracker};
pub use state::{BusState, ProfileState, PublishOutcome, StateStore};
pub use transport::{NostrTransport, RelayTransport, TransportNotification};
