//! Core types, validation, and shared utilities for the courier message bus.
//!
//! This crate provides:
//! - Direct-message event validation and addressing checks via the nostr crate
//! - The counters/gauges metrics recorder with snapshot export
//! - Shared error types

mod error;
mod event;
pub mod metrics;

pub use error::{Error, Result};
pub use event::{is_addressed_to, verify_event};
pub use self::metrics::{
    MetricEvent, MetricSink, MetricsRecorder, MetricsSnapshot, NoopSink, unix_now,
};
