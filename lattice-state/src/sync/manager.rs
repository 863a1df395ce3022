//! The authoritative side of shared state.
//!
//! A [`StateManager`] holds one entry per key: the canonical value, its
//! version, a validator and the set of subscribed connections. Proposals
//! for the same key are handled one at a time under the entry's lock, so
//! validation, commit and fan-out are atomic per key. Different keys
//! proceed in parallel.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::transport::{Envelope, RejectReason};

use super::connection::{Connection, ConnectionId, OutboundQueue, PushOutcome};

/// Decides whether a proposed value may be committed.
pub type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A key's canonical value and version.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub value: Value,
    pub version: u64,
}

struct Entry {
    value: Value,
    version: u64,
    validator: Validator,
    subscribers: IndexSet<ConnectionId>,
}

struct ConnectionState {
    queue: Arc<OutboundQueue>,
    subscriptions: Mutex<HashSet<String>>,
}

struct ManagerInner {
    config: ServerConfig,
    entries: DashMap<String, Arc<Mutex<Entry>>>,
    connections: DashMap<ConnectionId, Arc<ConnectionState>>,
}

/// Registry of shared-state entries and connected remotes.
#[derive(Clone)]
pub struct StateManager {
    inner: Arc<ManagerInner>,
}

impl StateManager {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                entries: DashMap::new(),
                connections: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Register a key with its initial value at version 0.
    ///
    /// Returns false, leaving the existing entry untouched, if the key is
    /// already registered.
    pub fn register<F>(&self, key: impl Into<String>, initial: Value, validator: F) -> bool
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        let key = key.into();
        match self.inner.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                tracing::warn!(key = %occupied.key(), "key already registered");
                false
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                tracing::debug!(key = %vacant.key(), "registered key");
                vacant.insert(Arc::new(Mutex::new(Entry {
                    value: initial,
                    version: 0,
                    validator: Arc::new(validator),
                    subscribers: IndexSet::new(),
                })));
                true
            }
        }
    }

    /// Canonical value and version of a key.
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        let entry = self.entry(key)?;
        let entry = entry.lock();
        Some(Snapshot {
            value: entry.value.clone(),
            version: entry.version,
        })
    }

    /// Commit a value from the authoritative side itself.
    ///
    /// The value is validated like any proposal and, once committed, sent to
    /// every subscriber. Returns the new version.
    pub fn set(&self, key: &str, value: Value) -> Result<u64, RejectReason> {
        let entry = self.entry(key).ok_or(RejectReason::UnknownKey)?;
        let mut entry = entry.lock();

        if !run_validator(&entry.validator, key, &value) {
            return Err(RejectReason::ValidationFailed);
        }

        entry.value = value;
        entry.version += 1;
        tracing::debug!(key, version = entry.version, "committed local write");
        self.broadcast(key, &entry, None);
        Ok(entry.version)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.entry(key)
            .map(|entry| entry.lock().subscribers.len())
            .unwrap_or(0)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Register a new remote connection.
    pub fn connect(&self) -> Connection {
        let id = ConnectionId::new();
        let queue = Arc::new(OutboundQueue::new(self.inner.config.outbound_queue_capacity));
        self.inner.connections.insert(
            id,
            Arc::new(ConnectionState {
                queue: queue.clone(),
                subscriptions: Mutex::new(HashSet::new()),
            }),
        );
        tracing::debug!(conn = %id, "connection registered");
        Connection::new(id, queue)
    }

    /// Forget a connection and all of its subscriptions.
    pub fn disconnect(&self, id: ConnectionId) {
        let Some((_, conn)) = self.inner.connections.remove(&id) else {
            return;
        };
        conn.queue.close();

        let keys: Vec<String> = conn.subscriptions.lock().drain().collect();
        for key in keys {
            if let Some(entry) = self.entry(&key) {
                entry.lock().subscribers.shift_remove(&id);
            }
        }
        tracing::debug!(conn = %id, "connection removed");
    }

    /// Handle one envelope received from a connection.
    ///
    /// Replies are queued on the connection. An `Err` means the remote broke
    /// the protocol and the connection should be dropped.
    pub fn dispatch(&self, id: ConnectionId, envelope: Envelope) -> Result<(), ProtocolError> {
        let Some(conn) = self.connection(id) else {
            tracing::debug!(conn = %id, "envelope for unknown connection ignored");
            return Ok(());
        };

        if conn.queue.take_resync() {
            self.resync(id, &conn);
        }

        match envelope {
            Envelope::Subscribe { key } => self.subscribe(id, &conn, key),
            Envelope::Unsubscribe { key } => self.unsubscribe(id, &conn, &key),
            Envelope::Propose {
                key,
                value,
                base_version,
            } => self.propose(id, &conn, key, value, base_version),
            other => {
                return Err(ProtocolError::UnexpectedEnvelope {
                    kind: other.kind(),
                    origin: "client",
                })
            }
        }
        Ok(())
    }

    fn subscribe(&self, id: ConnectionId, conn: &ConnectionState, key: String) {
        let Some(entry) = self.entry(&key) else {
            tracing::warn!(conn = %id, key = %key, "subscribe to unknown key");
            push(id, conn, unknown_key(key));
            return;
        };

        let mut entry = entry.lock();
        entry.subscribers.insert(id);
        conn.subscriptions.lock().insert(key.clone());
        tracing::debug!(conn = %id, key = %key, version = entry.version, "subscribed");

        push(
            id,
            conn,
            Envelope::Update {
                key,
                value: entry.value.clone(),
                version: entry.version,
            },
        );
    }

    fn unsubscribe(&self, id: ConnectionId, conn: &ConnectionState, key: &str) {
        conn.subscriptions.lock().remove(key);
        if let Some(entry) = self.entry(key) {
            entry.lock().subscribers.shift_remove(&id);
        }
        tracing::debug!(conn = %id, key, "unsubscribed");
    }

    fn propose(
        &self,
        id: ConnectionId,
        conn: &ConnectionState,
        key: String,
        value: Value,
        base_version: u64,
    ) {
        let Some(entry) = self.entry(&key) else {
            tracing::warn!(conn = %id, key = %key, "proposal for unknown key");
            push(id, conn, unknown_key(key));
            return;
        };

        // Held until the reply is queued so the origin sees replies and
        // updates for this key in commit order.
        let mut entry = entry.lock();

        let rejection = if base_version != entry.version {
            tracing::debug!(
                conn = %id,
                key = %key,
                base_version,
                current = entry.version,
                "stale proposal rejected"
            );
            Some(RejectReason::StaleVersion)
        } else if !run_validator(&entry.validator, &key, &value) {
            tracing::info!(conn = %id, key = %key, "proposal failed validation");
            Some(RejectReason::ValidationFailed)
        } else {
            None
        };

        let reply = match rejection {
            Some(reason) => Envelope::Rejected {
                key,
                reason,
                canonical_value: entry.value.clone(),
                canonical_version: entry.version,
            },
            None => {
                entry.value = value;
                entry.version += 1;
                tracing::debug!(conn = %id, key = %key, version = entry.version, "committed");
                self.broadcast(&key, &entry, Some(id));
                Envelope::Ack {
                    key,
                    version: entry.version,
                }
            }
        };
        push(id, conn, reply);
    }

    /// Send the entry's current value to every subscriber except `skip`.
    fn broadcast(&self, key: &str, entry: &Entry, skip: Option<ConnectionId>) {
        for &subscriber in &entry.subscribers {
            if Some(subscriber) == skip {
                continue;
            }
            let Some(conn) = self.connection(subscriber) else {
                continue;
            };
            push(
                subscriber,
                &conn,
                Envelope::Update {
                    key: key.to_string(),
                    value: entry.value.clone(),
                    version: entry.version,
                },
            );
        }
    }

    /// Send one full update per subscribed key after an overflow.
    fn resync(&self, id: ConnectionId, conn: &ConnectionState) {
        let mut keys: Vec<String> = conn.subscriptions.lock().iter().cloned().collect();
        keys.sort();
        tracing::info!(conn = %id, keys = keys.len(), "resyncing lagging connection");

        for key in keys {
            let Some(snapshot) = self.get(&key) else {
                continue;
            };
            push(
                id,
                conn,
                Envelope::Update {
                    key,
                    value: snapshot.value,
                    version: snapshot.version,
                },
            );
        }
    }

    fn entry(&self, key: &str) -> Option<Arc<Mutex<Entry>>> {
        self.inner.entries.get(key).map(|entry| entry.value().clone())
    }

    fn connection(&self, id: ConnectionId) -> Option<Arc<ConnectionState>> {
        self.inner.connections.get(&id).map(|conn| conn.value().clone())
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("keys", &self.inner.entries.len())
            .field("connections", &self.inner.connections.len())
            .finish()
    }
}

fn push(id: ConnectionId, conn: &ConnectionState, envelope: Envelope) {
    match conn.queue.push(envelope) {
        PushOutcome::Queued | PushOutcome::Suppressed => {}
        PushOutcome::Overflowed => {
            tracing::warn!(conn = %id, "outbound queue overflowed; connection will be resynced");
        }
        PushOutcome::Closed => {
            tracing::debug!(conn = %id, "dropping envelope for closed connection");
        }
    }
}

fn unknown_key(key: String) -> Envelope {
    Envelope::Rejected {
        key,
        reason: RejectReason::UnknownKey,
        canonical_value: Value::Null,
        canonical_version: 0,
    }
}

/// A panicking validator counts as a rejection.
fn run_validator(validator: &Validator, key: &str, value: &Value) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| validator(value))) {
        Ok(valid) => valid,
        Err(_) => {
            tracing::error!(key, "validator panicked; proposal rejected");
            false
        }
    }
}
