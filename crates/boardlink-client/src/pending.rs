//! The pending-request table.
//!
//! Maps request ids to the single-use completion slot of the caller waiting
//! for the answer. Every path that resolves a request (response, timeout,
//! cancellation, abandonment, connection loss) first removes the entry under
//! the table lock, so whichever path removes it is the only one that can
//! complete it.
//!
//! The lock is a `std::sync::Mutex`: it is never held across an `.await`,
//! and completion sends are non-blocking `oneshot` sends performed while
//! the lock is held. A waiter that finds its entry already gone can
//! therefore rely on the outcome being in its channel.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use boardlink_core::error::{Error, Result};
use boardlink_core::types::RequestId;
use boardlink_protocol::codec::Response;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// How a pending request was completed by someone other than its waiter.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The board answered.
    Reply(Response),
    /// `BoardClient::cancel` was called for this id.
    Cancelled,
    /// The reader loop ended while the request was outstanding.
    ConnectionLost,
}

#[derive(Debug)]
struct PendingEntry {
    tx: oneshot::Sender<Outcome>,
    command: &'static str,
    issued_at: Instant,
    deadline: Instant,
}

/// A request resolved by a response, as reported to the reader loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Resolved {
    pub command: &'static str,
    pub round_trip: Duration,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<RequestId, PendingEntry>,
    next_id: u64,
    /// Set once the connection is gone; no new entries are accepted.
    closed: bool,
}

/// Request id -> waiting caller.
#[derive(Debug)]
pub(crate) struct PendingTable {
    inner: Mutex<Inner>,
}

impl PendingTable {
    pub fn new() -> Self {
        PendingTable {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_id: 1,
                closed: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh id and register a pending entry for it.
    ///
    /// Ids come from a monotonic counter (`r1`, `r2`, ...); an id that is
    /// still pending is skipped.
    pub fn register(
        &self,
        command: &'static str,
        deadline: Instant,
    ) -> Result<(RequestId, oneshot::Receiver<Outcome>)> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(Error::NotConnected);
        }

        let id = loop {
            let n = inner.next_id;
            inner.next_id = n.checked_add(1).unwrap_or(1);
            let candidate = RequestId::new(format!("r{n}"));
            if !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let (tx, rx) = oneshot::channel();
        inner.entries.insert(
            id.clone(),
            PendingEntry {
                tx,
                command,
                issued_at: Instant::now(),
                deadline,
            },
        );
        Ok((id, rx))
    }

    /// Complete the entry for `id` with a response.
    ///
    /// Returns `None` if there is no such entry (an orphaned response).
    pub fn resolve(&self, id: &str, response: Response) -> Option<Resolved> {
        let mut inner = self.lock();
        let entry = inner.entries.remove(id)?;
        let resolved = Resolved {
            command: entry.command,
            round_trip: entry.issued_at.elapsed(),
        };
        // The waiter may have been dropped between removal checks; nothing
        // else to do then.
        let _ = entry.tx.send(Outcome::Reply(response));
        Some(resolved)
    }

    /// Remove an entry without completing it. Used by the waiter itself on
    /// timeout, abandonment and write failure.
    ///
    /// Returns `true` if the entry was still present.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.lock().entries.remove(id).is_some()
    }

    /// Remove the entry and complete it with [`Outcome::Cancelled`].
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut inner = self.lock();
        match inner.entries.remove(id) {
            Some(entry) => {
                let _ = entry.tx.send(Outcome::Cancelled);
                true
            }
            None => false,
        }
    }

    /// Close the table and complete every entry with
    /// [`Outcome::ConnectionLost`]. Returns the number of entries failed.
    pub fn fail_all(&self) -> usize {
        let mut inner = self.lock();
        inner.closed = true;
        let entries: Vec<_> = inner.entries.drain().collect();
        let n = entries.len();
        for (_, entry) in entries {
            let _ = entry.tx.send(Outcome::ConnectionLost);
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[cfg(test)]
    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Ids and command names of outstanding requests whose deadline has
    /// passed. Their waiters remove them; this is for diagnostics.
    pub fn overdue(&self, now: Instant) -> Vec<(RequestId, &'static str)> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(id, e)| (id.clone(), e.command))
            .collect()
    }

    #[cfg(test)]
    fn set_next_id(&self, n: u64) {
        self.lock().next_id = n;
    }
}
