//! Effect Implementation
//!
//! An Effect is a side-effecting computation that runs whenever its
//! dependencies change.
//!
//! # How Effects Work
//!
//! 1. When created, the effect runs its function immediately to establish
//!    initial dependencies.
//!
//! 2. When any dependency changes, the effect is queued on the scheduler and
//!    runs once in the next flush, no matter how many of its inputs changed.
//!
//! 3. Each run replaces the effect's dependencies with the ones it read.
//!
//! # Differences from Computed
//!
//! - Computeds return a value; effects do not.
//! - Computeds are lazy (compute on access); effects are eager (run when deps change).
//! - Computeds cache results; effects just run their side effect.
//!
//! # Cleanup
//!
//! An effect may return a [`Cleanup`]. The runtime calls it right before the
//! next run and when the effect is disposed.
//!
//! # Failure
//!
//! A run that panics or returns `Err` disables the effect. It stays
//! subscribed but is skipped by every flush until [`Effect::enable`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ReactiveError;
use crate::graph::NodeId;

use super::runtime::{panic_to_error, Reactive, Runtime};
use super::tracker::Tracker;

/// Work to undo an effect run.
pub struct Cleanup(Box<dyn FnOnce() + Send>);

impl Cleanup {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self(Box::new(f))
    }

    fn run(self) {
        (self.0)()
    }
}

impl fmt::Debug for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Cleanup")
    }
}

/// What an effect function may return.
pub trait EffectOutcome {
    fn into_cleanup(self) -> Result<Option<Cleanup>, String>;
}

impl EffectOutcome for () {
    fn into_cleanup(self) -> Result<Option<Cleanup>, String> {
        Ok(None)
    }
}

impl EffectOutcome for Cleanup {
    fn into_cleanup(self) -> Result<Option<Cleanup>, String> {
        Ok(Some(self))
    }
}

impl EffectOutcome for Option<Cleanup> {
    fn into_cleanup(self) -> Result<Option<Cleanup>, String> {
        Ok(self)
    }
}

impl<O, E> EffectOutcome for Result<O, E>
where
    O: EffectOutcome,
    E: fmt::Display,
{
    fn into_cleanup(self) -> Result<Option<Cleanup>, String> {
        self.map_err(|err| err.to_string())?.into_cleanup()
    }
}

type EffectFn = Box<dyn Fn(&Tracker) -> Result<Option<Cleanup>, String> + Send + Sync>;

struct EffectInner {
    id: NodeId,
    run: EffectFn,
    cleanup: Mutex<Option<Cleanup>>,

    /// Number of times the effect has run.
    run_count: AtomicUsize,

    last_error: Mutex<Option<ReactiveError>>,
}

impl EffectInner {
    fn run_cleanup(&self) {
        let cleanup = self.cleanup.lock().take();
        if let Some(cleanup) = cleanup {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| cleanup.run())) {
                let err = panic_to_error(self.id, payload);
                tracing::warn!(node = %self.id, error = %err, "effect cleanup panicked");
            }
        }
    }
}

impl Reactive for EffectInner {
    fn evaluate(&self, cx: &Tracker) -> Result<bool, ReactiveError> {
        self.run_cleanup();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (self.run)(cx)));
        self.run_count.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(Ok(cleanup)) => {
                *self.cleanup.lock() = cleanup;
                Ok(true)
            }
            Ok(Err(message)) => Err(ReactiveError::Evaluation {
                node: self.id,
                message,
            }),
            Err(payload) => Err(panic_to_error(self.id, payload)),
        }
    }

    fn dispose(&self) {
        self.run_cleanup();
    }

    fn record_error(&self, error: &ReactiveError) {
        *self.last_error.lock() = Some(error.clone());
    }
}

/// Handle to a registered effect.
///
/// The runtime owns the effect; dropping the handle does not stop it. Call
/// [`Effect::dispose`] for that.
///
/// # Example
///
/// ```rust,ignore
/// let rt = Runtime::new();
/// let count = Signal::new(&rt, 0);
///
/// let c = count.clone();
/// let effect = Effect::new(&rt, move |cx| {
///     println!("Count is: {}", c.get(cx));
/// });
///
/// count.set(5)?;  // Prints: "Count is: 5"
/// effect.dispose();
/// ```
#[derive(Clone)]
pub struct Effect {
    inner: Arc<EffectInner>,
    rt: Runtime,
}

impl Effect {
    /// Create a new effect with the given function.
    ///
    /// The function runs immediately to establish dependencies. If that run
    /// fails the effect starts out disabled; see [`Effect::last_error`].
    pub fn new<F, O>(rt: &Runtime, run: F) -> Self
    where
        F: Fn(&Tracker) -> O + Send + Sync + 'static,
        O: EffectOutcome,
    {
        let effect = Self::new_lazy(rt, run);
        // Failures are logged and recorded on the effect.
        let _ = effect.execute();
        effect
    }

    /// Create a new effect without running it.
    ///
    /// It has no dependencies until its first [`Effect::execute`].
    pub fn new_lazy<F, O>(rt: &Runtime, run: F) -> Self
    where
        F: Fn(&Tracker) -> O + Send + Sync + 'static,
        O: EffectOutcome,
    {
        let id = NodeId::new();
        let inner = Arc::new(EffectInner {
            id,
            run: Box::new(move |cx: &Tracker| run(cx).into_cleanup()),
            cleanup: Mutex::new(None),
            run_count: AtomicUsize::new(0),
            last_error: Mutex::new(None),
        });
        rt.register_effect(id, inner.clone());

        Self {
            inner,
            rt: rt.clone(),
        }
    }

    /// Get the effect's unique ID.
    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    /// Run the effect now, whether or not its inputs changed.
    pub fn execute(&self) -> Result<(), ReactiveError> {
        self.rt.rerun(self.inner.id)
    }

    /// Dispose of the effect.
    ///
    /// Runs the last cleanup and unsubscribes from every dependency. After
    /// disposal, the effect will not run again.
    pub fn dispose(&self) {
        self.rt.dispose(self.inner.id);
    }

    /// Check if the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        !self.rt.contains(self.inner.id)
    }

    /// Check if a failed run disabled the effect.
    pub fn is_disabled(&self) -> bool {
        self.rt.is_disabled(self.inner.id)
    }

    /// Re-enable a disabled effect and run it again.
    pub fn enable(&self) -> Result<(), ReactiveError> {
        self.inner.last_error.lock().take();
        self.rt.enable(self.inner.id)
    }

    /// The failure that disabled the effect, if any.
    pub fn last_error(&self) -> Option<ReactiveError> {
        self.inner.last_error.lock().clone()
    }

    /// Get the number of times the effect has run.
    pub fn run_count(&self) -> usize {
        self.inner.run_count.load(Ordering::SeqCst)
    }

    /// Get the number of dependencies.
    pub fn dependency_count(&self) -> usize {
        self.rt.dependency_count(self.inner.id)
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect")
            .field("id", &self.inner.id)
            .field("run_count", &self.run_count())
            .field("dependency_count", &self.dependency_count())
            .field("disabled", &self.is_disabled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
