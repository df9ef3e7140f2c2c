//! Correlation of responses to in-flight calls.

use crate::error::TransportError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use highway_protocol::RawFrame;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::oneshot;

/// Tracks calls awaiting a response on one connection.
///
/// Ids are unique among in-flight calls: after the counter wraps, ids still
/// pending are skipped. Id 0 is reserved for one-way requests and never
/// allocated. Once [`fail_all`](Self::fail_all) has run the registry is
/// closed and refuses new calls.
pub struct CorrelationRegistry {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<RawFrame>>,
    max_pending: usize,
    closed: AtomicBool,
}

impl CorrelationRegistry {
    pub fn new(max_pending: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            max_pending,
            closed: AtomicBool::new(false),
        }
    }

    /// Starts id allocation at `first_id`.
    pub fn starting_at(mut self, first_id: u64) -> Self {
        self.next_id = AtomicU64::new(first_id);
        self
    }

    /// Allocates a correlation id and the channel its response arrives on.
    pub fn register(&self) -> Result<(u64, oneshot::Receiver<RawFrame>), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        if self.pending.len() >= self.max_pending {
            return Err(TransportError::TooManyPendingCalls {
                max: self.max_pending,
            });
        }

        let (tx, rx) = oneshot::channel();
        let id = loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            match self.pending.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(tx);
                    break id;
                }
                Entry::Occupied(_) => {
                    tracing::debug!("correlation id {} still in flight, skipping", id);
                }
            }
        };

        // fail_all may have drained the map between the first check and the insert
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TransportError::ConnectionClosed);
        }
        Ok((id, rx))
    }

    /// Hands a response frame to the call waiting on `id`.
    ///
    /// Returns false if no call is waiting (unknown, cancelled or timed out).
    pub fn complete(&self, id: u64, frame: RawFrame) -> bool {
        match self.pending.remove(&id) {
            Some((_, tx)) => {
                if tx.send(frame).is_err() {
                    tracing::debug!("caller for correlation id {} went away", id);
                    return false;
                }
                true
            }
            None => {
                tracing::warn!("no pending call for correlation id {}", id);
                false
            }
        }
    }

    /// Forgets a call. Its receiver observes a closed channel.
    pub fn cancel(&self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Closes the registry and drops every pending call, returning how many
    /// there were.
    pub fn fail_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            tracing::debug!("failed {} pending calls", count);
        }
        count
    }

    /// Returns the number of calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
