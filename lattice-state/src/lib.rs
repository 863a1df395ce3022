//! Lattice State
//!
//! This crate provides a reactive dependency graph and a layer that keeps
//! named pieces of state in sync between an authoritative server and any
//! number of remote processes.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `graph`: Dependency graph, dirty marking and effect scheduling
//! - `reactive`: Signals, computeds and effects on top of a [`Runtime`]
//! - `sync`: Authoritative [`StateManager`] and remote [`StateChannel`]s
//! - `transport`: JSON-over-WebSocket protocol, server and client
//! - `config`: TOML configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use lattice_state::reactive::{Computed, Effect, Runtime, Signal};
//!
//! let rt = Runtime::new();
//! let count = Signal::new(&rt, 0);
//!
//! // Create a derived value
//! let c = count.clone();
//! let doubled = Computed::new(&rt, move |cx| c.get(cx) * 2);
//!
//! // Create an effect
//! let (c, d) = (count.clone(), doubled.clone());
//! Effect::new(&rt, move |cx| {
//!     println!("Count: {}, Doubled: {}", c.get(cx), d.get(cx));
//! });
//!
//! // Update the signal
//! count.set(5)?;
//! // Effect automatically runs, prints: "Count: 5, Doubled: 10"
//! ```
//!
//! [`Runtime`]: reactive::Runtime
//! [`StateManager`]: sync::StateManager
//! [`StateChannel`]: sync::StateChannel

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{ConfigError, ProtocolError, ReactiveError, TransportError};
pub use serde_json::Value;
