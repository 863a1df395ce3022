//! The remote side of one shared key.
//!
//! A [`StateChannel`] mirrors a key into a local [`Signal`]. Local writes
//! show up in the signal at once and are proposed to the authoritative side
//! one at a time; the server answers each proposal with an `ack` or a
//! `rejected`. While a proposal is in flight, pushed updates are held back
//! so they cannot clobber the optimistic value, and applied in version
//! order once the proposal resolves.
//!
//! Writes made while disconnected wait in a bounded outbox. If it
//! overflows, the oldest writes are dropped and the channel gives up on
//! replaying the rest: the next authoritative value replaces local state.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::{ProtocolError, ReactiveError};
use crate::reactive::{ReadSignal, Runtime, Signal, Tracker};
use crate::transport::{Envelope, RejectReason};

/// Notifications about a channel's sync state.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A proposal was turned down and the local value rolled back.
    Rejected {
        key: String,
        reason: RejectReason,
        canonical_value: Value,
        canonical_version: u64,
    },

    /// A proposal was committed.
    Committed { key: String, version: u64 },

    /// The channel received the full authoritative value after subscribing.
    Resynced { key: String, version: u64 },
}

#[derive(Debug, Clone)]
struct Pending {
    value: Value,
    base_version: u64,
}

#[derive(Debug)]
struct ChannelState {
    canonical: Value,
    last_known_version: u64,
    pending: Option<Pending>,
    queued_updates: VecDeque<(Value, u64)>,
    outbox: VecDeque<Value>,
    overflowed: bool,
    link: Option<mpsc::UnboundedSender<Envelope>>,
    awaiting_sync: bool,
    synced: bool,
}

impl ChannelState {
    /// Move the next outbox entry into flight.
    fn next_proposal(&mut self, key: &str) -> Option<Envelope> {
        if !self.synced || self.pending.is_some() {
            return None;
        }
        let value = self.outbox.pop_front()?;
        self.pending = Some(Pending {
            value: value.clone(),
            base_version: self.last_known_version,
        });
        Some(Envelope::Propose {
            key: key.to_string(),
            value,
            base_version: self.last_known_version,
        })
    }

    /// Apply held-back updates newer than what is already known.
    fn apply_queued_updates(&mut self) {
        while let Some((value, version)) = self.queued_updates.pop_front() {
            if version > self.last_known_version {
                self.canonical = value;
                self.last_known_version = version;
            }
        }
    }

    /// The value the signal should show, if it should follow the canonical
    /// one. `None` while local writes are still unresolved.
    fn visible(&self) -> Option<Value> {
        (self.pending.is_none() && self.outbox.is_empty()).then(|| self.canonical.clone())
    }

    /// After an overflow, drop unsent writes and ask for a fresh value.
    fn resync_after_overflow(&mut self, key: &str) -> Option<Envelope> {
        if !self.overflowed || !self.synced || self.pending.is_some() {
            return None;
        }
        self.overflowed = false;
        self.outbox.clear();
        self.awaiting_sync = true;
        Some(Envelope::Subscribe {
            key: key.to_string(),
        })
    }
}

struct ChannelInner {
    key: String,
    rt: Runtime,
    signal: Signal<Value>,
    capacity: usize,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<SyncEvent>,
}

/// A shared-state key mirrored into a local signal.
#[derive(Clone)]
pub struct StateChannel {
    inner: Arc<ChannelInner>,
}

impl StateChannel {
    /// Create a detached channel showing `initial` until it first syncs.
    pub fn new(rt: &Runtime, key: impl Into<String>, initial: Value, offline_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self::with_events(rt, key, initial, offline_capacity, events)
    }

    pub(crate) fn with_events(
        rt: &Runtime,
        key: impl Into<String>,
        initial: Value,
        offline_capacity: usize,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                key: key.into(),
                rt: rt.clone(),
                signal: Signal::new(rt, initial.clone()),
                capacity: offline_capacity.max(1),
                state: Mutex::new(ChannelState {
                    canonical: initial,
                    last_known_version: 0,
                    pending: None,
                    queued_updates: VecDeque::new(),
                    outbox: VecDeque::new(),
                    overflowed: false,
                    link: None,
                    awaiting_sync: false,
                    synced: false,
                }),
                events,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Read-only view of the local value for use in computeds and effects.
    pub fn signal(&self) -> ReadSignal<Value> {
        self.inner.signal.read_only()
    }

    pub fn get(&self, cx: &Tracker) -> Value {
        self.inner.signal.get(cx)
    }

    pub fn get_untracked(&self) -> Value {
        self.inner.signal.get_untracked()
    }

    /// Write locally and propose the value to the authoritative side.
    ///
    /// The signal takes the value immediately. The `Err` case only reports
    /// failures of local effects triggered by the write.
    pub fn set(&self, value: Value) -> Result<(), ReactiveError> {
        // Held until the signal shows the value, so a concurrent `handle`
        // cannot slip between the state change and the signal write.
        let _eval = self.inner.rt.evaluation_lock();
        let key = self.key();
        let (proposal, link) = {
            let mut state = self.inner.state.lock();
            if state.outbox.len() >= self.inner.capacity {
                state.outbox.pop_front();
                if !state.overflowed {
                    tracing::warn!(key, capacity = self.inner.capacity, "outbox overflowed; will resync");
                }
                state.overflowed = true;
            }
            state.outbox.push_back(value.clone());
            (state.next_proposal(key), state.link.clone())
        };

        let result = self.inner.signal.set(value);
        self.send(link, proposal);
        result
    }

    /// Last version confirmed by the authoritative side.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().last_known_version
    }

    /// The last value confirmed by the authoritative side.
    pub fn canonical(&self) -> Value {
        self.inner.state.lock().canonical.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.inner.state.lock().pending.is_some()
    }

    /// Local writes not yet proposed.
    pub fn outbox_len(&self) -> usize {
        self.inner.state.lock().outbox.len()
    }

    /// Whether the channel is connected and has received its key's value.
    pub fn is_synced(&self) -> bool {
        self.inner.state.lock().synced
    }

    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Start syncing over `link`: subscribe and wait for the full value.
    pub fn attach(&self, link: mpsc::UnboundedSender<Envelope>) {
        {
            let mut state = self.inner.state.lock();
            state.link = Some(link.clone());
            state.awaiting_sync = true;
            state.synced = false;
        }
        tracing::debug!(key = %self.key(), "subscribing");
        self.send(
            Some(link),
            Some(Envelope::Subscribe {
                key: self.key().to_string(),
            }),
        );
    }

    /// Stop syncing. An in-flight proposal goes back to the front of the
    /// outbox and is proposed again once the channel resyncs.
    pub fn detach(&self) {
        let mut state = self.inner.state.lock();
        state.link = None;
        state.awaiting_sync = false;
        state.synced = false;
        state.queued_updates.clear();
        if let Some(pending) = state.pending.take() {
            state.outbox.push_front(pending.value);
            if state.outbox.len() > self.inner.capacity {
                state.outbox.pop_back();
                state.overflowed = true;
            }
        }
    }

    /// Handle an envelope from the authoritative side.
    pub fn handle(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let _eval = self.inner.rt.evaluation_lock();
        let key = self.key();
        let mut event = None;

        let (visible, outgoing, link) = {
            let mut state = self.inner.state.lock();
            let visible = match envelope {
                Envelope::Update { value, version, .. } => {
                    if state.awaiting_sync {
                        state.awaiting_sync = false;
                        state.synced = true;
                        state.canonical = value;
                        state.last_known_version = version;
                        if state.overflowed {
                            state.overflowed = false;
                            state.outbox.clear();
                        }
                        tracing::debug!(key, version, "resynced");
                        event = Some(SyncEvent::Resynced {
                            key: key.to_string(),
                            version,
                        });
                        state.visible()
                    } else if state.pending.is_some() {
                        state.queued_updates.push_back((value, version));
                        None
                    } else if version > state.last_known_version {
                        state.canonical = value;
                        state.last_known_version = version;
                        state.visible()
                    } else {
                        tracing::trace!(key, version, "ignoring stale update");
                        None
                    }
                }
                Envelope::Ack { version, .. } => match state.pending.take() {
                    Some(pending) => {
                        tracing::debug!(key, base = pending.base_version, version, "proposal committed");
                        state.canonical = pending.value;
                        state.last_known_version = version;
                        state.apply_queued_updates();
                        event = Some(SyncEvent::Committed {
                            key: key.to_string(),
                            version,
                        });
                        state.visible()
                    }
                    None => {
                        tracing::warn!(key, version, "ack without a pending proposal");
                        None
                    }
                },
                Envelope::Rejected {
                    reason,
                    canonical_value,
                    canonical_version,
                    ..
                } => {
                    state.pending = None;
                    let discarded = std::mem::take(&mut state.outbox).len();
                    state.overflowed = false;
                    state.canonical = canonical_value.clone();
                    state.last_known_version = canonical_version;
                    state.apply_queued_updates();
                    if reason == RejectReason::UnknownKey {
                        state.awaiting_sync = false;
                        state.synced = false;
                    }
                    tracing::info!(key, %reason, canonical_version, discarded, "proposal rejected; rolled back");
                    event = Some(SyncEvent::Rejected {
                        key: key.to_string(),
                        reason,
                        canonical_value,
                        canonical_version,
                    });
                    Some(state.canonical.clone())
                }
                Envelope::Error { message } => {
                    tracing::warn!(key, %message, "server reported an error");
                    None
                }
                other => {
                    return Err(ProtocolError::UnexpectedEnvelope {
                        kind: other.kind(),
                        origin: "server",
                    })
                }
            };

            let outgoing = state
                .resync_after_overflow(key)
                .or_else(|| state.next_proposal(key));
            (visible, outgoing, state.link.clone())
        };

        if let Some(value) = visible {
            if let Err(err) = self.inner.signal.set(value) {
                tracing::warn!(key, error = %err, "effect failed while applying remote value");
            }
        }
        if let Some(event) = event {
            // No receivers is fine.
            let _ = self.inner.events.send(event);
        }
        self.send(link, outgoing);
        Ok(())
    }

    fn send(&self, link: Option<mpsc::UnboundedSender<Envelope>>, envelope: Option<Envelope>) {
        let (Some(link), Some(envelope)) = (link, envelope) else {
            return;
        };
        if link.send(envelope).is_err() {
            tracing::debug!(key = %self.key(), "link closed before envelope was sent");
        }
    }
}

impl fmt::Debug for StateChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("StateChannel")
            .field("key", &self.inner.key)
            .field("version", &state.last_known_version)
            .field("pending", &state.pending.is_some())
            .field("outbox", &state.outbox.len())
            .field("synced", &state.synced)
            .finish()
    }
}
