//! Per-connection outbound queues.
//!
//! Each remote connection gets a bounded queue of envelopes waiting to be
//! written to its socket. A slow reader must not make the server buffer
//! every update it misses, so on overflow the queued `update`s are thrown
//! away and the connection is flagged: its next inbound message first gets
//! one full `update` per subscribed key.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::transport::Envelope;

/// Identifies one remote connection on the authoritative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Result of queueing an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,

    /// The queue was full: pending updates were discarded and the
    /// connection now waits for a resync.
    Overflowed,

    /// An update was skipped because a resync is already due.
    Suppressed,

    /// The connection is gone, or it fell so far behind that even
    /// non-update replies no longer fit and it was closed.
    Closed,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<Envelope>,
    needs_resync: bool,
    closed: bool,
}

/// Bounded outbound queue shared by the manager and the socket writer.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, envelope: Envelope) -> PushOutcome {
        let is_update = matches!(envelope, Envelope::Update { .. });
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if is_update && state.needs_resync {
                return PushOutcome::Suppressed;
            }

            if state.items.len() < self.capacity {
                state.items.push_back(envelope);
                PushOutcome::Queued
            } else {
                state
                    .items
                    .retain(|queued| !matches!(queued, Envelope::Update { .. }));
                state.needs_resync = true;

                if is_update {
                    PushOutcome::Overflowed
                } else if state.items.len() < self.capacity {
                    state.items.push_back(envelope);
                    PushOutcome::Overflowed
                } else {
                    state.closed = true;
                    state.items.clear();
                    PushOutcome::Closed
                }
            }
        };

        self.notify.notify_waiters();
        outcome
    }

    /// Clear the resync flag, returning whether it was set.
    pub fn take_resync(&self) -> bool {
        std::mem::take(&mut self.state.lock().needs_resync)
    }

    pub fn needs_resync(&self) -> bool {
        self.state.lock().needs_resync
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.state.lock().items.pop_front()
    }

    /// Wait for the next envelope. Returns `None` once the queue is closed
    /// and drained of nothing further to send.
    ///
    /// Cancel-safe: dropping the future never loses an envelope.
    pub async fn recv(&self) -> Option<Envelope> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(envelope) = state.items.pop_front() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The socket side of a registered connection.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    queue: Arc<OutboundQueue>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, queue: Arc<OutboundQueue>) -> Self {
        Self { id, queue }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Wait for the next envelope to write to the socket.
    pub async fn recv(&self) -> Option<Envelope> {
        self.queue.recv().await
    }

    pub fn try_recv(&self) -> Option<Envelope> {
        self.queue.try_recv()
    }

    /// Take everything queued right now.
    pub fn drain(&self) -> Vec<Envelope> {
        std::iter::from_fn(|| self.queue.try_recv()).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}
