//! WebSocket transport.
//!
//! Envelopes travel as JSON text frames. The server side feeds frames into a
//! [`StateManager`](crate::sync::StateManager); the client side routes them
//! to [`StateChannel`](crate::sync::StateChannel)s by key.

mod client;
mod protocol;
mod server;

pub use client::SyncClient;
pub use protocol::{decode, encode, Envelope, RejectReason};
pub use server::{handle_connection, handle_socket, serve};
