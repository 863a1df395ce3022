//! Reactive Primitives
//!
//! This module implements the core reactive system: signals, computeds, and
//! effects, coordinated by a [`Runtime`].
//!
//! # Concepts
//!
//! ## Signals
//!
//! A Signal is a container for mutable state. When a signal's value is read
//! through a computation's [`Tracker`], the signal registers that computation
//! as a dependent. When the signal's value changes, all dependents are
//! notified.
//!
//! ## Computeds
//!
//! A Computed is a derived value that caches its result. It re-evaluates only
//! when one of its dependencies changes, and only when someone reads it.
//!
//! ## Effects
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change. Effects are used to synchronize reactive state with
//! external systems, such as a rendering layer or a network channel.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: every compute and effect closure receives
//! a `&Tracker`, and reads go through it (`signal.get(cx)`). There is no
//! thread-local state, so independent runtimes can coexist in one process
//! and nested evaluations cannot leak dependencies into each other.

mod computed;
mod effect;
mod runtime;
mod signal;
mod tracker;

pub use computed::Computed;
pub use effect::{Cleanup, Effect, EffectOutcome};
pub use runtime::Runtime;
pub use signal::{ReadSignal, Signal};
pub use tracker::Tracker;
