//! Signal Implementation
//!
//! A Signal is the fundamental reactive primitive. It holds a value and
//! tracks which computations depend on it.
//!
//! # How Signals Work
//!
//! 1. When a signal is read through a computation's [`Tracker`], the
//!    computation is registered as a subscriber once it finishes running.
//!
//! 2. When a signal's value changes, all subscribers are notified through the
//!    runtime's scheduler.
//!
//! 3. Writing a value equal to the current one is a no-op: no version bump,
//!    no notification. Equality defaults to `PartialEq` and can be replaced
//!    per signal.
//!
//! # Thread Safety
//!
//! Signals are `Send + Sync`. The value is protected by a `RwLock`; writes
//! also take the runtime's evaluation lock so a write never lands in the
//! middle of another evaluation.

use std::fmt::{self, Debug};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ReactiveError;
use crate::graph::NodeId;

use super::effect::Effect;
use super::runtime::Runtime;
use super::tracker::Tracker;

/// Equality used to short-circuit writes and recomputations.
pub(crate) type Equality<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

struct SignalInner<T> {
    /// Unique identifier for this signal.
    id: NodeId,
    rt: Runtime,
    value: RwLock<T>,
    equals: Equality<T>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A reactive signal holding a value of type T.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// // Read the value
/// let value = count.get_untracked();
///
/// // Update the value (notifies subscribers)
/// count.set(5)?;
/// ```
pub struct Signal<T>
where
    T: Send + Sync + 'static,
{
    inner: Arc<SignalInner<T>>,
}

impl<T> Signal<T>
where
    T: Send + Sync + 'static,
{
    /// Create a new signal with the given initial value.
    pub fn new(rt: &Runtime, value: T) -> Self
    where
        T: PartialEq,
    {
        Self::with_equality(rt, value, |a: &T, b: &T| a == b)
    }

    /// Create a signal that uses `equals` to decide whether a write changes
    /// anything.
    pub fn with_equality<F>(rt: &Runtime, value: T, equals: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let id = rt.register_source();
        Self {
            inner: Arc::new(SignalInner {
                id,
                rt: rt.clone(),
                value: RwLock::new(value),
                equals: Arc::new(equals),
            }),
        }
    }

    /// Create a signal where every write notifies, even with an equal value.
    pub fn always_notify(rt: &Runtime, value: T) -> Self {
        Self::with_equality(rt, value, |_, _| false)
    }

    /// Get the signal's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.rt
    }

    /// Get the current value and subscribe the computation behind `cx`.
    pub fn get(&self, cx: &Tracker) -> T
    where
        T: Clone,
    {
        cx.track(self.inner.id);
        self.inner.value.read().clone()
    }

    /// Borrow the current value and subscribe the computation behind `cx`.
    pub fn with<R>(&self, cx: &Tracker, f: impl FnOnce(&T) -> R) -> R {
        cx.track(self.inner.id);
        f(&self.inner.value.read())
    }

    /// Get the current value without tracking dependencies.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.read().clone()
    }

    /// Set a new value and notify subscribers.
    ///
    /// Outside a batch this runs the full flush before returning; the result
    /// is the first evaluation failure of that flush, if any.
    pub fn set(&self, value: T) -> Result<(), ReactiveError> {
        let _guard = self.inner.rt.evaluation_lock();
        {
            let mut current = self.inner.value.write();
            if (self.inner.equals)(&current, &value) {
                return Ok(());
            }
            *current = value;
        }
        self.inner.rt.commit_source(self.inner.id)
    }

    /// Update the value using a function of the current value.
    pub fn update<F>(&self, f: F) -> Result<(), ReactiveError>
    where
        F: FnOnce(&T) -> T,
    {
        let _guard = self.inner.rt.evaluation_lock();
        let new_value = f(&self.inner.value.read());
        self.set(new_value)
    }

    /// Number of committed changes so far.
    pub fn version(&self) -> u64 {
        self.inner.rt.version(self.inner.id)
    }

    /// Get the number of subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.rt.subscriber_count(self.inner.id)
    }

    /// A handle that can read and subscribe but not write.
    pub fn read_only(&self) -> ReadSignal<T> {
        ReadSignal {
            signal: self.clone(),
        }
    }

    /// Call `callback` with the value now and after every change.
    ///
    /// This is the hook a rendering layer attaches to: the value is read
    /// exactly once per run, so the subscription tracks just this signal.
    pub fn subscribe<F>(&self, callback: F) -> Effect
    where
        T: Clone,
        F: Fn(T) + Send + Sync + 'static,
    {
        let signal = self.clone();
        Effect::new(&self.inner.rt, move |cx| callback(signal.get(cx)))
    }
}

impl<T> Clone for Signal<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Signal<T>
where
    T: Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.inner.id)
            .field("value", &*self.inner.value.read())
            .field("version", &self.version())
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

/// Read-only view of a [`Signal`].
pub struct ReadSignal<T>
where
    T: Send + Sync + 'static,
{
    signal: Signal<T>,
}

impl<T> ReadSignal<T>
where
    T: Send + Sync + 'static,
{
    pub fn id(&self) -> NodeId {
        self.signal.id()
    }

    pub fn get(&self, cx: &Tracker) -> T
    where
        T: Clone,
    {
        self.signal.get(cx)
    }

    pub fn with<R>(&self, cx: &Tracker, f: impl FnOnce(&T) -> R) -> R {
        self.signal.with(cx, f)
    }

    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.signal.get_untracked()
    }

    pub fn version(&self) -> u64 {
        self.signal.version()
    }

    pub fn subscriber_count(&self) -> usize {
        self.signal.subscriber_count()
    }

    pub fn subscribe<F>(&self, callback: F) -> Effect
    where
        T: Clone,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.signal.subscribe(callback)
    }
}

impl<T> Clone for ReadSignal<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T> Debug for ReadSignal<T>
where
    T: Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ReadSignal").field(&self.signal).finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
