//! Link statistics.
//!
//! Counters for what crossed the link plus a round-trip summary over the
//! most recent responses. Read a consistent copy with
//! [`LinkStats::snapshot`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Number of round-trip samples kept for the rolling summary.
pub const RTT_WINDOW: usize = 100;

/// Distribution of a set of round-trip samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencySummary {
    pub count: usize,
    pub min: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub max: Duration,
}

impl LatencySummary {
    /// Summarize `samples`, or `None` if there are none.
    pub fn from_samples(samples: impl IntoIterator<Item = Duration>) -> Option<Self> {
        let mut sorted: Vec<Duration> = samples.into_iter().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let n = sorted.len();
        let rank = |pct: usize| sorted[(n * pct / 100).min(n - 1)];
        Some(Self {
            count: n,
            min: sorted[0],
            mean: sorted.iter().sum::<Duration>() / n as u32,
            p50: rank(50),
            p95: rank(95),
            max: sorted[n - 1],
        })
    }
}

impl fmt::Display for LatencySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        write!(
            f,
            "n={}  min={:.1}ms  mean={:.1}ms  p50={:.1}ms  p95={:.1}ms  max={:.1}ms",
            self.count,
            ms(self.min),
            ms(self.mean),
            ms(self.p50),
            ms(self.p95),
            ms(self.max),
        )
    }
}

/// A point-in-time copy of the link counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Request lines written to the board.
    pub commands_sent: u64,
    /// Responses matched to a pending request.
    pub responses_received: u64,
    /// Matched responses whose status was not `ok`.
    pub device_errors: u64,
    /// Requests that hit their deadline.
    pub timeouts: u64,
    /// Requests cancelled by the caller.
    pub cancelled: u64,
    /// Responses with no matching pending request.
    pub orphaned_responses: u64,
    /// Inbound lines that could not be decoded.
    pub parse_errors: u64,
    /// Unsolicited messages published to subscribers.
    pub events: u64,
    /// Mean round trip over the last [`RTT_WINDOW`] responses.
    pub avg_response_time: Option<Duration>,
    /// Round-trip distribution over the same window.
    pub response_times: Option<LatencySummary>,
}

#[derive(Debug, Default)]
struct Inner {
    counters: StatsSnapshot,
    rtts: VecDeque<Duration>,
}

/// Shared, thread-safe link statistics.
#[derive(Debug, Default)]
pub struct LinkStats {
    inner: Mutex<Inner>,
}

impl LinkStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_sent(&self) {
        self.lock().counters.commands_sent += 1;
    }

    pub(crate) fn record_response(&self, round_trip: Duration, ok: bool) {
        let mut inner = self.lock();
        inner.counters.responses_received += 1;
        if !ok {
            inner.counters.device_errors += 1;
        }
        if inner.rtts.len() == RTT_WINDOW {
            inner.rtts.pop_front();
        }
        inner.rtts.push_back(round_trip);
    }

    pub(crate) fn record_timeout(&self) {
        self.lock().counters.timeouts += 1;
    }

    pub(crate) fn record_cancelled(&self) {
        self.lock().counters.cancelled += 1;
    }

    pub(crate) fn record_orphan(&self) {
        self.lock().counters.orphaned_responses += 1;
    }

    pub(crate) fn record_parse_error(&self) {
        self.lock().counters.parse_errors += 1;
    }

    pub(crate) fn record_event(&self) {
        self.lock().counters.events += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.lock();
        let mut snap = inner.counters.clone();
        snap.response_times = LatencySummary::from_samples(inner.rtts.iter().copied());
        snap.avg_response_time = snap.response_times.map(|r| r.mean);
        snap
    }
}
