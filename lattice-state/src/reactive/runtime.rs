//! Reactive Runtime
//!
//! The runtime is the central coordinator that connects signals, computeds,
//! and effects. It owns the dependency graph and schedules updates when
//! signals change.
//!
//! # How It Works
//!
//! 1. When a signal, computed or effect is created, it registers a node with
//!    the runtime.
//!
//! 2. When a computed or effect runs, its [`Tracker`] collects the nodes it
//!    read. Afterwards the runtime replaces the node's edges with exactly
//!    those reads.
//!
//! 3. When a signal's value changes, the runtime:
//!    a. Marks direct dependents dirty and the rest maybe-dirty
//!    b. Queues reached effects
//!    c. Flushes the queue, unless a batch is collecting writes
//!    d. Computeds are lazy - they recompute when pulled
//!
//! # Thread Safety
//!
//! A `Runtime` is a cheap handle and may be shared across threads, but
//! evaluation is single-threaded and cooperative: every write, pull and
//! flush holds a reentrant evaluation lock, so evaluations never interleave.
//! User closures never run while the graph lock is held.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use smallvec::SmallVec;

use crate::config::RuntimeConfig;
use crate::error::ReactiveError;
use crate::graph::{DirtyState, Node, NodeId, NodeKind, SchedulerPhase, UpdateScheduler};

use super::tracker::Tracker;

/// A node the runtime can evaluate.
pub(crate) trait Reactive: Send + Sync {
    /// Run the node's function with `cx` as its evaluation context.
    ///
    /// Returns `Ok(true)` when the produced value differs from the previous
    /// one. Panics must be caught by the implementation.
    fn evaluate(&self, cx: &Tracker) -> Result<bool, ReactiveError>;

    /// Release whatever the node holds between runs (effect cleanup).
    fn dispose(&self) {}

    /// Called when the node failed and has been disabled.
    fn record_error(&self, _error: &ReactiveError) {}
}

#[derive(Default)]
struct RuntimeState {
    graph: UpdateScheduler,

    /// Evaluable nodes, held weakly so dropping a computed frees it.
    reactives: HashMap<NodeId, Weak<dyn Reactive>>,

    /// Effects are owned by the runtime until disposed.
    owned: HashMap<NodeId, Arc<dyn Reactive>>,
}

struct RuntimeInner {
    eval_lock: ReentrantMutex<()>,
    state: Mutex<RuntimeState>,
    config: RuntimeConfig,
}

/// Handle to a reactive runtime.
///
/// Cloning the handle shares the runtime. Independent runtimes never see
/// each other's nodes.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    /// Create a runtime with default settings.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                eval_lock: ReentrantMutex::new(()),
                state: Mutex::new(RuntimeState::default()),
                config,
            }),
        }
    }

    /// Current scheduler phase.
    pub fn phase(&self) -> SchedulerPhase {
        self.inner.state.lock().graph.phase()
    }

    /// Number of live nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.inner.state.lock().graph.node_count()
    }

    /// Run `f` with propagation deferred until it returns.
    ///
    /// Writes inside `f` are collected and flushed exactly once afterwards.
    /// Nested batches flush only when the outermost one closes. If `f`
    /// panics, the flush still runs and the panic is resumed afterwards.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> Result<R, ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        self.inner.state.lock().graph.begin_batch();

        let result = panic::catch_unwind(AssertUnwindSafe(f));

        let flush_due = self.inner.state.lock().graph.end_batch();
        let flushed = if flush_due { self.flush() } else { Ok(()) };

        match result {
            Ok(value) => flushed.map(|()| value),
            Err(payload) => {
                if let Err(err) = flushed {
                    tracing::warn!(error = %err, "flush after panicking batch failed");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Run every queued effect.
    ///
    /// Effects written to by other effects are picked up in following
    /// rounds. A failing effect is disabled and the rest of the flush still
    /// runs; the first failure is returned once the queue is drained.
    pub fn flush(&self) -> Result<(), ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        {
            let mut state = self.inner.state.lock();
            if state.graph.phase() == SchedulerPhase::Flushing {
                return Ok(());
            }
            state.graph.set_phase(SchedulerPhase::Flushing);
        }

        let max_rounds = self.inner.config.max_flush_rounds;
        let mut first_error = None;
        let mut rounds = 0;

        loop {
            let batch = self.inner.state.lock().graph.take_pending();
            if batch.is_empty() {
                break;
            }

            rounds += 1;
            if rounds > max_rounds {
                tracing::error!(
                    rounds = max_rounds,
                    dropped = batch.len(),
                    "flush did not settle; dropping queued effects"
                );
                self.inner.state.lock().graph.clear_pending();
                first_error.get_or_insert(ReactiveError::FlushLimit { rounds: max_rounds });
                break;
            }

            tracing::trace!(round = rounds, effects = batch.len(), "flush round");
            for id in batch {
                if let Err(err) = self.run_effect(id) {
                    first_error.get_or_insert(err);
                }
            }
        }

        {
            let mut state = self.inner.state.lock();
            let phase = if state.graph.in_batch() {
                SchedulerPhase::Collecting
            } else {
                SchedulerPhase::Idle
            };
            state.graph.set_phase(phase);
        }

        first_error.map_or(Ok(()), Err)
    }

    // ------------------------------------------------------------------
    // Node registration
    // ------------------------------------------------------------------

    pub(crate) fn register_source(&self) -> NodeId {
        self.inner.state.lock().graph.add_node(Node::source())
    }

    pub(crate) fn register_computed(&self, id: NodeId, reactive: Weak<dyn Reactive>) {
        let mut state = self.inner.state.lock();
        state.graph.add_node(Node::with_id(id, NodeKind::Derived));
        state.reactives.insert(id, reactive);
    }

    pub(crate) fn register_effect(&self, id: NodeId, reactive: Arc<dyn Reactive>) {
        let mut state = self.inner.state.lock();
        state.graph.add_node(Node::with_id(id, NodeKind::Effect));
        state.reactives.insert(id, Arc::downgrade(&reactive));
        state.owned.insert(id, reactive);
    }

    /// Drop a node and all its edges without running any cleanup.
    pub(crate) fn remove_node(&self, id: NodeId) {
        let owned = {
            let mut state = self.inner.state.lock();
            state.graph.remove_node(id);
            state.reactives.remove(&id);
            state.owned.remove(&id)
        };
        drop(owned);
    }

    /// Dispose a node: unsubscribe it everywhere and run its last cleanup.
    pub(crate) fn dispose(&self, id: NodeId) {
        let _guard = self.inner.eval_lock.lock();
        let (owned, weak) = {
            let mut state = self.inner.state.lock();
            state.graph.remove_node(id);
            (state.owned.remove(&id), state.reactives.remove(&id))
        };

        if let Some(reactive) = owned.or_else(|| weak.and_then(|w| w.upgrade())) {
            reactive.dispose();
        }
        tracing::trace!(node = %id, "disposed");
    }

    pub(crate) fn evaluation_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.inner.eval_lock.lock()
    }

    // ------------------------------------------------------------------
    // Propagation
    // ------------------------------------------------------------------

    /// Record a committed change to a source node and propagate it.
    ///
    /// Flushes immediately unless a batch is collecting or a flush is
    /// already running.
    pub(crate) fn commit_source(&self, id: NodeId) -> Result<(), ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        let flush_due = {
            let mut state = self.inner.state.lock();
            if let Some(node) = state.graph.get_node_mut(id) {
                node.bump_version();
            }
            state.graph.mark_changed(id);
            state.graph.phase() == SchedulerPhase::Idle
        };

        if flush_due {
            self.flush()
        } else {
            Ok(())
        }
    }

    /// Bring a computed or effect up to date, evaluating it only when one of
    /// its inputs actually changed.
    pub(crate) fn refresh(&self, id: NodeId) -> Result<(), ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        self.update_if_necessary(id)
    }

    fn update_if_necessary(&self, id: NodeId) -> Result<(), ReactiveError> {
        let (dirty, deps) = {
            let state = self.inner.state.lock();
            let node = state
                .graph
                .get_node(id)
                .ok_or(ReactiveError::Disposed { node: id })?;
            if node.is_computing() {
                return Err(ReactiveError::Cycle { node: id });
            }
            let deps: SmallVec<[NodeId; 8]> = node.dependencies().iter().copied().collect();
            (node.dirty_state(), deps)
        };

        if dirty == DirtyState::MaybeDirty {
            for dep in deps {
                if self.kind(dep) == Some(NodeKind::Derived) {
                    self.update_if_necessary(dep)?;
                }
                if self.dirty_state(id) == Some(DirtyState::Dirty) {
                    break;
                }
            }
        }

        match self.dirty_state(id) {
            Some(DirtyState::Dirty) => self.evaluate(id),
            Some(DirtyState::MaybeDirty) => {
                if let Some(node) = self.inner.state.lock().graph.get_node_mut(id) {
                    node.mark_clean();
                }
                Ok(())
            }
            Some(DirtyState::Clean) | None => Ok(()),
        }
    }

    fn evaluate(&self, id: NodeId) -> Result<(), ReactiveError> {
        let (reactive, since) = {
            let mut state = self.inner.state.lock();
            let since = state.graph.epoch();
            let reactive = state.reactives.get(&id).and_then(Weak::upgrade);
            match (reactive, state.graph.get_node_mut(id)) {
                (Some(reactive), Some(node)) => {
                    node.set_computing(true);
                    (reactive, since)
                }
                _ => return Err(ReactiveError::Disposed { node: id }),
            }
        };

        let cx = Tracker::new(id);
        let result = reactive.evaluate(&cx);

        {
            let mut state = self.inner.state.lock();
            let Some(node) = state.graph.get_node_mut(id) else {
                // Disposed by its own run.
                return result.map(|_| ());
            };
            node.set_computing(false);

            if let Ok(changed) = result {
                node.mark_clean();
                if changed {
                    node.bump_version();
                }
                state.graph.replace_dependencies(id, cx.into_reads());
                if changed {
                    state.graph.mark_dependents_dirty(id);
                }
                // An input written during the run may have been read before the write.
                if state.graph.requeue_if_stale(id, since) {
                    tracing::trace!(node = %id, "inputs changed during run; requeued");
                }
            }
        }

        drop(reactive);
        result.map(|_| ())
    }

    fn run_effect(&self, id: NodeId) -> Result<(), ReactiveError> {
        {
            let state = self.inner.state.lock();
            match state.graph.get_node(id) {
                Some(node) if !node.is_disabled() => {}
                _ => return Ok(()),
            }
        }

        self.update_if_necessary(id).map_err(|err| {
            self.disable(id, &err);
            err
        })
    }

    /// Run an effect now, whether or not its inputs changed.
    ///
    /// Disabled effects are skipped. Outside a batch or flush the run counts
    /// as a flush of its own: writes it makes are propagated after it
    /// returns, not in the middle of it.
    pub(crate) fn rerun(&self, id: NodeId) -> Result<(), ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        let owns_flush = {
            let mut state = self.inner.state.lock();
            state
                .graph
                .get_node_mut(id)
                .ok_or(ReactiveError::Disposed { node: id })?
                .mark_dirty();
            let idle = state.graph.phase() == SchedulerPhase::Idle;
            if idle {
                state.graph.set_phase(SchedulerPhase::Flushing);
            }
            idle
        };

        let result = self.run_effect(id);
        if !owns_flush {
            return result;
        }

        self.inner.state.lock().graph.set_phase(SchedulerPhase::Idle);
        let flushed = self.flush();
        result.and(flushed)
    }

    fn disable(&self, id: NodeId, err: &ReactiveError) {
        let reactive = {
            let mut state = self.inner.state.lock();
            if let Some(node) = state.graph.get_node_mut(id) {
                node.set_disabled(true);
            }
            state.reactives.get(&id).and_then(Weak::upgrade)
        };

        tracing::warn!(node = %id, error = %err, "effect failed; disabled until re-enabled");
        if let Some(reactive) = reactive {
            reactive.record_error(err);
        }
    }

    /// Re-enable a disabled effect and rerun it.
    pub(crate) fn enable(&self, id: NodeId) -> Result<(), ReactiveError> {
        let _guard = self.inner.eval_lock.lock();
        let flush_due = {
            let mut state = self.inner.state.lock();
            let node = state
                .graph
                .get_node_mut(id)
                .ok_or(ReactiveError::Disposed { node: id })?;
            node.set_disabled(false);
            node.mark_dirty();
            state.graph.enqueue(id);
            state.graph.phase() == SchedulerPhase::Idle
        };

        if flush_due {
            self.flush()
        } else {
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    fn kind(&self, id: NodeId) -> Option<NodeKind> {
        self.inner.state.lock().graph.get_node(id).map(Node::kind)
    }

    pub(crate) fn dirty_state(&self, id: NodeId) -> Option<DirtyState> {
        self.inner
            .state
            .lock()
            .graph
            .get_node(id)
            .map(Node::dirty_state)
    }

    pub(crate) fn version(&self, id: NodeId) -> u64 {
        self.inner
            .state
            .lock()
            .graph
            .get_node(id)
            .map_or(0, Node::version)
    }

    pub(crate) fn subscriber_count(&self, id: NodeId) -> usize {
        self.inner
            .state
            .lock()
            .graph
            .get_node(id)
            .map_or(0, |node| node.dependents().len())
    }

    pub(crate) fn dependency_count(&self, id: NodeId) -> usize {
        self.inner
            .state
            .lock()
            .graph
            .get_node(id)
            .map_or(0, |node| node.dependencies().len())
    }

    pub(crate) fn is_disabled(&self, id: NodeId) -> bool {
        self.inner
            .state
            .lock()
            .graph
            .get_node(id)
            .is_some_and(Node::is_disabled)
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.inner.state.lock().graph.contains(id)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Runtime")
            .field("phase", &state.graph.phase())
            .field("nodes", &state.graph.node_count())
            .field("pending", &state.graph.pending_count())
            .finish()
    }
}

/// Turn a caught panic payload into an evaluation error.
///
/// A `ReactiveError` raised by a nested `Computed::get` is passed through
/// unchanged so cycles stay recognisable.
pub(crate) fn panic_to_error(node: NodeId, payload: Box<dyn std::any::Any + Send>) -> ReactiveError {
    if let Some(err) = payload.downcast_ref::<ReactiveError>() {
        return err.clone();
    }
    let message = if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "panicked".to_string()
    };
    ReactiveError::Evaluation { node, message }
}
