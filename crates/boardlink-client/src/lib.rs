//! boardlink-client: command/response correlation for a serial board link.
//!
//! Many tasks may issue commands concurrently over one link. Each request
//! carries a fresh id; the board answers out of order, interleaved with
//! unsolicited notifications, and every answer is routed back to the task
//! that asked. Notifications are fanned out to tag-filtered subscriptions.
//!
//! # Architecture
//!
//! - [`client`] -- [`BoardClient`], the reader task and typed operations
//! - `pending` (private) -- the id -> waiter table
//! - [`fanout`] -- [`EventBus`] and [`Subscription`]
//! - [`stats`] -- link counters and round-trip summaries
//! - [`builder`] -- [`BoardBuilder`] for serial connections
//! - [`sequence`] -- scripted pin sequences

pub mod builder;
pub mod client;
pub mod fanout;
mod pending;
pub mod sequence;
pub mod stats;

pub use builder::{BoardBuilder, DEFAULT_SETTLE_DELAY};
pub use client::{BoardClient, BoxedTransport, ClientOptions, PendingRequest, TimeoutPolicy};
pub use fanout::{EventBus, Subscription, SubscriptionId};
pub use sequence::{
    Level, LogEntry, Progress, Sequence, SequenceOutcome, SequenceReport, SequenceRunner, Step,
};
pub use stats::{LatencySummary, LinkStats, StatsSnapshot};
