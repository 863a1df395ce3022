//! Shared-state sync without sockets.
//!
//! Each remote is a runtime with channels wired to a manager connection
//! through in-memory queues. `pump` shuttles envelopes both ways until
//! nothing is left in flight.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use lattice_state::config::ServerConfig;
use lattice_state::reactive::{Computed, Effect, Runtime};
use lattice_state::sync::{Connection, StateChannel, StateManager, SyncEvent};
use lattice_state::transport::{Envelope, RejectReason};

struct Remote {
    rt: Runtime,
    channels: Vec<StateChannel>,
    rx: mpsc::UnboundedReceiver<Envelope>,
    tx: mpsc::UnboundedSender<Envelope>,
    conn: Option<Connection>,
}

impl Remote {
    fn new(keys: &[(&str, Value)]) -> Self {
        let rt = Runtime::new();
        let channels = keys
            .iter()
            .map(|(key, initial)| StateChannel::new(&rt, *key, initial.clone(), 8))
            .collect();
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rt,
            channels,
            rx,
            tx,
            conn: None,
        }
    }

    fn channel(&self, key: &str) -> &StateChannel {
        self.channels
            .iter()
            .find(|c| c.key() == key)
            .expect("channel")
    }

    fn connect(&mut self, manager: &StateManager) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.tx = tx;
        self.rx = rx;
        self.conn = Some(manager.connect());
        for channel in &self.channels {
            channel.attach(self.tx.clone());
        }
    }

    fn disconnect(&mut self, manager: &StateManager) {
        if let Some(conn) = self.conn.take() {
            manager.disconnect(conn.id());
        }
        for channel in &self.channels {
            channel.detach();
        }
    }

    /// Move one round of envelopes. Returns whether anything moved.
    fn step(&mut self, manager: &StateManager) -> bool {
        let Some(conn) = self.conn.clone() else {
            return false;
        };
        let mut moved = false;

        while let Ok(envelope) = self.rx.try_recv() {
            manager.dispatch(conn.id(), envelope).unwrap();
            moved = true;
        }
        for envelope in conn.drain() {
            let key = envelope.key().unwrap().to_string();
            self.channel(&key).handle(envelope).unwrap();
            moved = true;
        }
        moved
    }
}

fn pump(manager: &StateManager, remotes: &mut [&mut Remote]) {
    for _ in 0..100 {
        let mut moved = false;
        for remote in remotes.iter_mut() {
            moved |= remote.step(manager);
        }
        if !moved {
            return;
        }
    }
    panic!("envelopes still moving after 100 rounds");
}

fn counter_manager() -> StateManager {
    let manager = StateManager::default();
    manager.register("counter", json!(0), |v| v.as_i64().is_some_and(|n| n >= 0));
    manager
}

#[test]
fn subscribe_delivers_current_value() {
    let manager = counter_manager();
    manager.set("counter", json!(12)).unwrap();

    let mut remote = Remote::new(&[("counter", json!(null))]);
    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    let channel = remote.channel("counter");
    assert!(channel.is_synced());
    assert_eq!(channel.get_untracked(), json!(12));
    assert_eq!(channel.version(), 1);
}

#[test]
fn write_reaches_other_remotes() {
    let manager = counter_manager();
    let mut a = Remote::new(&[("counter", json!(0))]);
    let mut b = Remote::new(&[("counter", json!(0))]);
    a.connect(&manager);
    b.connect(&manager);
    pump(&manager, &mut [&mut a, &mut b]);

    a.channel("counter").set(json!(3)).unwrap();
    pump(&manager, &mut [&mut a, &mut b]);

    assert_eq!(manager.get("counter").unwrap().value, json!(3));
    assert_eq!(b.channel("counter").get_untracked(), json!(3));
    assert_eq!(b.channel("counter").version(), 1);
    assert_eq!(a.channel("counter").version(), 1);
}

#[test]
fn conflicting_writes_converge() {
    let manager = counter_manager();
    let mut a = Remote::new(&[("counter", json!(0))]);
    let mut b = Remote::new(&[("counter", json!(0))]);
    a.connect(&manager);
    b.connect(&manager);
    pump(&manager, &mut [&mut a, &mut b]);
    let mut b_events = b.channel("counter").events();

    // Both propose against version 0 before either hears from the server.
    a.channel("counter").set(json!(1)).unwrap();
    b.channel("counter").set(json!(5)).unwrap();
    assert_eq!(b.channel("counter").get_untracked(), json!(5));

    // The server sees A first.
    a.step(&manager);
    pump(&manager, &mut [&mut b, &mut a]);

    assert_eq!(manager.get("counter").unwrap().value, json!(1));
    assert_eq!(a.channel("counter").get_untracked(), json!(1));
    assert_eq!(b.channel("counter").get_untracked(), json!(1));

    let rejected = std::iter::from_fn(|| b_events.try_recv().ok())
        .find(|e| matches!(e, SyncEvent::Rejected { .. }))
        .expect("rejection event");
    assert_eq!(
        rejected,
        SyncEvent::Rejected {
            key: "counter".into(),
            reason: RejectReason::StaleVersion,
            canonical_value: json!(1),
            canonical_version: 1,
        }
    );

    // Resubmitting on top of the canonical value succeeds.
    b.channel("counter").set(json!(6)).unwrap();
    pump(&manager, &mut [&mut a, &mut b]);
    assert_eq!(manager.get("counter").unwrap().version, 2);
    for remote in [&a, &b] {
        let channel = remote.channel("counter");
        assert_eq!(channel.get_untracked(), json!(6));
        assert_eq!(channel.version(), 2);
    }
}

#[test]
fn invalid_write_rolls_back_locally() {
    let manager = counter_manager();
    let mut remote = Remote::new(&[("counter", json!(0))]);
    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    let _effect = remote
        .channel("counter")
        .signal()
        .subscribe(move |value| seen_clone.lock().push(value));

    remote.channel("counter").set(json!(-4)).unwrap();
    pump(&manager, &mut [&mut remote]);

    assert_eq!(*seen.lock(), vec![json!(0), json!(-4), json!(0)]);
    assert_eq!(manager.get("counter").unwrap().version, 0);
}

#[test]
fn reconnect_resyncs_once() {
    let manager = counter_manager();
    let mut remote = Remote::new(&[("counter", json!(0))]);
    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    remote.disconnect(&manager);
    for n in 1..=3 {
        manager.set("counter", json!(n)).unwrap();
    }

    let channel = remote.channel("counter").clone();
    let deliveries = Arc::new(Mutex::new(0));
    let counter = deliveries.clone();
    let _effect = channel.signal().subscribe(move |_| *counter.lock() += 1);

    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    assert_eq!(channel.get_untracked(), json!(3));
    assert_eq!(channel.version(), 3);
    // Initial run plus exactly one full resync.
    assert_eq!(*deliveries.lock(), 2);
}

#[test]
fn offline_writes_are_proposed_after_reconnect() {
    let manager = counter_manager();
    let mut remote = Remote::new(&[("counter", json!(0))]);
    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);
    remote.disconnect(&manager);

    remote.channel("counter").set(json!(8)).unwrap();
    assert_eq!(remote.channel("counter").outbox_len(), 1);

    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    assert_eq!(manager.get("counter").unwrap().value, json!(8));
    assert_eq!(remote.channel("counter").version(), 1);
    assert_eq!(remote.channel("counter").outbox_len(), 0);
}

#[test]
fn lagging_remote_catches_up_with_full_value() {
    let manager = StateManager::new(ServerConfig {
        outbound_queue_capacity: 2,
        ..ServerConfig::default()
    });
    manager.register("counter", json!(0), |_| true);
    manager.register("label", json!("a"), |v| v.is_string());

    let mut slow = Remote::new(&[("counter", json!(0)), ("label", json!(""))]);
    slow.connect(&manager);
    pump(&manager, &mut [&mut slow]);

    for n in 1..=20 {
        manager.set("counter", json!(n)).unwrap();
    }
    manager.set("label", json!("b")).unwrap();

    // Whatever fit in the queue is applied; the rest waits for a resync.
    slow.step(&manager);
    assert_ne!(slow.channel("counter").get_untracked(), json!(20));

    // The next message from the remote triggers the resync.
    slow.channel("counter").set(json!(100)).unwrap();
    pump(&manager, &mut [&mut slow]);

    assert_eq!(manager.get("label").unwrap().value, json!("b"));
    assert_eq!(slow.channel("label").get_untracked(), json!("b"));
    assert_eq!(slow.channel("label").version(), 1);
}

#[test]
fn remote_state_feeds_the_local_graph() {
    let manager = StateManager::default();
    manager.register("price", json!(10), |v| v.is_number());
    manager.register("quantity", json!(2), |v| v.is_number());

    let mut remote = Remote::new(&[("price", json!(0)), ("quantity", json!(0))]);
    remote.connect(&manager);
    pump(&manager, &mut [&mut remote]);

    let (price, quantity) = (remote.channel("price").clone(), remote.channel("quantity").clone());
    let total = Computed::new(&remote.rt, move |cx| {
        price.get(cx).as_i64().unwrap_or(0) * quantity.get(cx).as_i64().unwrap_or(0)
    });

    let totals = Arc::new(Mutex::new(Vec::new()));
    let (t, totals_clone) = (total.clone(), totals.clone());
    let _effect = Effect::new(&remote.rt, move |cx| totals_clone.lock().push(t.get(cx)));

    manager.set("price", json!(11)).unwrap();
    manager.set("quantity", json!(3)).unwrap();
    pump(&manager, &mut [&mut remote]);

    assert_eq!(*totals.lock(), vec![20, 22, 33]);
}
