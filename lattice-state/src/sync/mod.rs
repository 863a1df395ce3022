//! Shared state synchronization.
//!
//! The authoritative side keeps every key in a [`StateManager`]. Each remote
//! mirrors the keys it cares about through [`StateChannel`]s, whose local
//! signals feed the reactive graph like any other source.
//!
//! # Flow
//!
//! ```text
//!  remote A                      server                       remote B
//!  set(v) ──propose(v, base)──▶  validate, commit ──update──▶ handle()
//!         ◀────────ack──────────  version + 1
//! ```
//!
//! A proposal whose base version is no longer current is rejected and the
//! origin rolls back to the canonical value it receives with the rejection.

mod channel;
mod connection;
mod manager;

pub use channel::{StateChannel, SyncEvent};
pub use connection::{Connection, ConnectionId, OutboundQueue, PushOutcome};
pub use manager::{Snapshot, StateManager, Validator};
