//! Computed Implementation
//!
//! A Computed is a cached derived value that re-evaluates only when its
//! dependencies change.
//!
//! # How Computeds Work
//!
//! 1. On first access, the computed runs its function and caches the result.
//!
//! 2. When accessed again, if no dependencies have changed, returns cached value.
//!
//! 3. When a direct dependency changes, the computed is marked dirty; when
//!    something further upstream changes it is marked maybe-dirty.
//!
//! 4. On next access, a maybe-dirty computed first brings its own derived
//!    inputs up to date. Only if one of them actually changed does it rerun.
//!
//! 5. After every run its dependency set is replaced by exactly what that run
//!    read, so branches not taken stop triggering it.
//!
//! # Why This Matters
//!
//! This "lazy" approach avoids unnecessary recomputation:
//!
//! - A signal changes
//! - 10 computeds depend on it
//! - Only the computeds actually accessed will recompute
//! - Computeds that are never read stay dirty (no wasted work)

use std::fmt::{self, Debug};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::ReactiveError;
use crate::graph::{DirtyState, NodeId};

use super::effect::Effect;
use super::runtime::{panic_to_error, Reactive, Runtime};
use super::signal::Equality;
use super::tracker::Tracker;

struct ComputedInner<T> {
    id: NodeId,
    rt: Runtime,
    compute: Box<dyn Fn(&Tracker) -> T + Send + Sync>,

    /// The cached value (None if never computed).
    value: RwLock<Option<T>>,

    equals: Equality<T>,
}

impl<T> Reactive for ComputedInner<T>
where
    T: Send + Sync + 'static,
{
    fn evaluate(&self, cx: &Tracker) -> Result<bool, ReactiveError> {
        let new_value = panic::catch_unwind(AssertUnwindSafe(|| (self.compute)(cx)))
            .map_err(|payload| panic_to_error(self.id, payload))?;

        let mut cached = self.value.write();
        let changed = match cached.as_ref() {
            Some(old) => !(self.equals)(old, &new_value),
            None => true,
        };
        if changed {
            *cached = Some(new_value);
        }
        Ok(changed)
    }
}

impl<T> Drop for ComputedInner<T> {
    fn drop(&mut self) {
        self.rt.remove_node(self.id);
    }
}

/// A cached derived value that recomputes only when dependencies change.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 2);
///
/// let c = count.clone();
/// let doubled = Computed::new(&rt, move |cx| c.get(cx) * 2);
/// assert_eq!(doubled.get_untracked(), 4);
/// ```
pub struct Computed<T>
where
    T: Send + Sync + 'static,
{
    inner: Arc<ComputedInner<T>>,
}

impl<T> Computed<T>
where
    T: Send + Sync + 'static,
{
    /// Create a new computed with the given function.
    ///
    /// The function is not run immediately. It runs on first access.
    pub fn new<F>(rt: &Runtime, compute: F) -> Self
    where
        T: PartialEq,
        F: Fn(&Tracker) -> T + Send + Sync + 'static,
    {
        Self::with_equality(rt, compute, |a: &T, b: &T| a == b)
    }

    /// Create a computed whose dependents are only invalidated when `equals`
    /// says the new value differs from the cached one.
    pub fn with_equality<F, E>(rt: &Runtime, compute: F, equals: E) -> Self
    where
        F: Fn(&Tracker) -> T + Send + Sync + 'static,
        E: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let id = NodeId::new();
        let inner = Arc::new(ComputedInner {
            id,
            rt: rt.clone(),
            compute: Box::new(compute),
            value: RwLock::new(None),
            equals: Arc::new(equals),
        });

        let weak = Arc::downgrade(&inner);
        rt.register_computed(id, weak);

        Self { inner }
    }

    /// Get the computed's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Get the current value, recomputing if necessary, and subscribe the
    /// computation behind `cx`.
    ///
    /// # Panics
    ///
    /// Re-raises a failure of the compute function so it propagates to the
    /// enclosing computed or effect, which records it as its own failure.
    /// Use [`Computed::try_get`] to handle it instead.
    pub fn get(&self, cx: &Tracker) -> T
    where
        T: Clone,
    {
        match self.try_get(cx) {
            Ok(value) => value,
            Err(err) => panic::panic_any(err),
        }
    }

    /// Get the current value, returning compute failures as errors.
    pub fn try_get(&self, cx: &Tracker) -> Result<T, ReactiveError>
    where
        T: Clone,
    {
        let _guard = self.inner.rt.evaluation_lock();
        self.inner.rt.refresh(self.inner.id)?;
        cx.track(self.inner.id);

        self.inner
            .value
            .read()
            .clone()
            .ok_or(ReactiveError::Disposed { node: self.inner.id })
    }

    /// Get the current value without tracking dependencies.
    ///
    /// # Panics
    ///
    /// Same as [`Computed::get`].
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.get(&Tracker::untracked())
    }

    /// True when the cached value is stale or was never computed.
    pub fn is_dirty(&self) -> bool {
        self.inner.rt.dirty_state(self.inner.id) != Some(DirtyState::Clean)
    }

    /// Check if the computed has a cached value.
    pub fn has_value(&self) -> bool {
        self.inner.value.read().is_some()
    }

    /// Number of times the computed value actually changed.
    pub fn version(&self) -> u64 {
        self.inner.rt.version(self.inner.id)
    }

    /// Get the number of dependents.
    pub fn dependent_count(&self) -> usize {
        self.inner.rt.subscriber_count(self.inner.id)
    }

    /// Get the number of dependencies recorded by the last successful run.
    pub fn dependency_count(&self) -> usize {
        self.inner.rt.dependency_count(self.inner.id)
    }

    /// Unsubscribe from every dependency. Later reads fail with
    /// [`ReactiveError::Disposed`].
    pub fn dispose(&self) {
        self.inner.rt.dispose(self.inner.id);
        *self.inner.value.write() = None;
    }

    /// Call `callback` with the value now and after every change.
    pub fn subscribe<F>(&self, callback: F) -> Effect
    where
        T: Clone,
        F: Fn(T) + Send + Sync + 'static,
    {
        let computed = self.clone();
        Effect::new(&self.inner.rt, move |cx: &Tracker| -> Result<(), ReactiveError> {
            callback(computed.try_get(cx)?);
            Ok(())
        })
    }
}

impl<T> Clone for Computed<T>
where
    T: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for Computed<T>
where
    T: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("id", &self.inner.id)
            .field("dirty", &self.is_dirty())
            .field("has_value", &self.has_value())
            .field("dependent_count", &self.dependent_count())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
