//! Update Scheduler
//!
//! The scheduler owns the dependency graph and decides the order in which
//! dirty nodes are updated. It ensures that dependencies are always updated
//! before their dependents.
//!
//! # Algorithm
//!
//! 1. When a source node changes, its direct dependents are marked `Dirty`.
//! 2. Everything further downstream is marked `MaybeDirty`.
//! 3. Reached effects are queued; the queue is a set, so an effect reached
//!    through several changed ancestors is queued once.
//! 4. On flush, queued effects are taken in dependency-depth order. Each one
//!    pulls its maybe-dirty ancestors first; an ancestor whose recomputed
//!    value did not change leaves its dependents clean.
//!
//! This "push dirty, pull values" approach keeps computeds lazy while still
//! guaranteeing that no effect observes a half-propagated graph.

use std::collections::{HashMap, HashSet, VecDeque};

use indexmap::IndexSet;

use super::node::{DirtyState, Node, NodeId, NodeKind};

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerPhase {
    /// No batch open and no flush running.
    Idle,

    /// Inside `batch()`; writes are queued but not propagated.
    Collecting,

    /// Running queued effects.
    Flushing,
}

/// The update scheduler manages the dependency graph and coordinates updates.
#[derive(Debug)]
pub struct UpdateScheduler {
    /// All nodes in the graph, indexed by ID.
    nodes: HashMap<NodeId, Node>,

    phase: SchedulerPhase,

    /// Nesting depth of open batches.
    batch_depth: usize,

    /// Effects waiting for the next flush round, in the order they were reached.
    pending: IndexSet<NodeId>,

    /// Bumped by every `mark_changed`.
    epoch: u64,
}

impl UpdateScheduler {
    /// Create a new empty scheduler.
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            phase: SchedulerPhase::Idle,
            batch_depth: 0,
            pending: IndexSet::new(),
            epoch: 0,
        }
    }

    /// Add a node to the graph.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, node);
        id
    }

    /// Remove a node from the graph.
    ///
    /// Also removes all edges involving this node and drops it from the
    /// pending queue.
    pub fn remove_node(&mut self, node_id: NodeId) -> Option<Node> {
        let node = self.nodes.remove(&node_id)?;

        for dep_id in node.dependencies() {
            if let Some(dep) = self.nodes.get_mut(dep_id) {
                dep.remove_dependent(node_id);
            }
        }

        for dependent_id in node.dependents() {
            if let Some(dependent) = self.nodes.get_mut(dependent_id) {
                dependent.remove_dependency(node_id);
            }
        }

        self.pending.shift_remove(&node_id);
        Some(node)
    }

    pub fn get_node(&self, node_id: NodeId) -> Option<&Node> {
        self.nodes.get(&node_id)
    }

    pub fn get_node_mut(&mut self, node_id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&node_id)
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    /// Add a dependency edge: `dependent` depends on `dependency`.
    pub fn add_edge(&mut self, dependency: NodeId, dependent: NodeId) {
        if let Some(dep_node) = self.nodes.get_mut(&dependency) {
            dep_node.add_dependent(dependent);
        }
        if let Some(dependent_node) = self.nodes.get_mut(&dependent) {
            dependent_node.add_dependency(dependency);
        }
    }

    /// Replace a node's dependency set with exactly `reads`.
    ///
    /// Edges to nodes that were not read this run are pruned. Reads of nodes
    /// that no longer exist are ignored. The node's depth is recomputed.
    pub fn replace_dependencies<I>(&mut self, node_id: NodeId, reads: I)
    where
        I: IntoIterator<Item = NodeId>,
    {
        let new_deps: HashSet<NodeId> = reads
            .into_iter()
            .filter(|id| *id != node_id && self.nodes.contains_key(id))
            .collect();

        let old_deps = match self.nodes.get_mut(&node_id) {
            Some(node) => node.take_dependencies(),
            None => return,
        };

        for stale in old_deps.difference(&new_deps) {
            if let Some(dep) = self.nodes.get_mut(stale) {
                dep.remove_dependent(node_id);
            }
        }

        let mut depth = 0;
        for &dep_id in &new_deps {
            self.add_edge(dep_id, node_id);
            if let Some(dep) = self.nodes.get(&dep_id) {
                depth = depth.max(dep.depth() + 1);
            }
        }

        if let Some(node) = self.nodes.get_mut(&node_id) {
            node.set_depth(depth);
        }
    }

    /// Mark a source node as changed and propagate dirty flags.
    ///
    /// Direct dependents become `Dirty`, everything further downstream becomes
    /// `MaybeDirty`. Every reached effect that is not disabled is queued.
    pub fn mark_changed(&mut self, source_id: NodeId) {
        self.epoch += 1;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(source) = self.nodes.get_mut(&source_id) {
            source.set_changed_at(self.epoch);
            for dependent_id in source.dependents() {
                queue.push_back((*dependent_id, true));
            }
        }

        while let Some((node_id, direct)) = queue.pop_front() {
            if let Some(node) = self.nodes.get_mut(&node_id) {
                if direct {
                    node.mark_dirty();
                } else {
                    node.mark_maybe_dirty();
                }

                if !visited.insert(node_id) {
                    continue;
                }

                if node.kind() == NodeKind::Effect && !node.is_disabled() {
                    self.pending.insert(node_id);
                }

                for dependent_id in node.dependents().clone() {
                    queue.push_back((dependent_id, false));
                }
            }
        }
    }

    /// Number of source changes committed so far.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Re-mark a node whose inputs were written after `since`.
    ///
    /// Called once a run has finished and its reads became the node's
    /// dependencies. A source changed after `since` makes the node `Dirty`;
    /// an invalidated derived dependency makes it `MaybeDirty`. A stale effect
    /// is queued again. Returns whether the node was stale.
    pub fn requeue_if_stale(&mut self, node_id: NodeId, since: u64) -> bool {
        let Some(node) = self.nodes.get(&node_id) else {
            return false;
        };

        let mut stale = DirtyState::Clean;
        for dep_id in node.dependencies() {
            match self.nodes.get(dep_id) {
                Some(dep) if dep.kind() == NodeKind::Source => {
                    if dep.changed_at() > since {
                        stale = DirtyState::Dirty;
                        break;
                    }
                }
                Some(dep) if !dep.is_clean() => stale = DirtyState::MaybeDirty,
                _ => {}
            }
        }

        let requeue = node.kind() == NodeKind::Effect && !node.is_disabled();
        let Some(node) = self.nodes.get_mut(&node_id) else {
            return false;
        };
        match stale {
            DirtyState::Clean => return false,
            DirtyState::MaybeDirty => node.mark_maybe_dirty(),
            DirtyState::Dirty => node.mark_dirty(),
        }
        if requeue {
            self.pending.insert(node_id);
        }
        true
    }

    /// Mark the direct dependents of a derived node dirty after its value
    /// changed during a pull.
    pub fn mark_dependents_dirty(&mut self, node_id: NodeId) {
        let dependents = match self.nodes.get(&node_id) {
            Some(node) => node.dependents().clone(),
            None => return,
        };

        for dependent_id in dependents {
            if let Some(dependent) = self.nodes.get_mut(&dependent_id) {
                if dependent.dirty_state() != DirtyState::Clean {
                    dependent.mark_dirty();
                }
            }
        }
    }

    /// Queue an effect for the next flush round.
    pub fn enqueue(&mut self, node_id: NodeId) {
        self.pending.insert(node_id);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Take every queued effect, ordered by dependency depth.
    ///
    /// Effects at the same depth keep the order in which they were reached.
    pub fn take_pending(&mut self) -> Vec<NodeId> {
        let mut batch: Vec<NodeId> = self.pending.drain(..).collect();
        batch.sort_by_key(|id| self.nodes.get(id).map_or(0, Node::depth));
        batch
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn phase(&self) -> SchedulerPhase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: SchedulerPhase) {
        self.phase = phase;
    }

    /// Open a batch. Moves an idle scheduler into `Collecting`.
    pub fn begin_batch(&mut self) {
        self.batch_depth += 1;
        if self.phase == SchedulerPhase::Idle {
            self.phase = SchedulerPhase::Collecting;
        }
    }

    /// Close a batch. Returns `true` when the outermost batch closed and a
    /// flush is due.
    pub fn end_batch(&mut self) -> bool {
        self.batch_depth = self.batch_depth.saturating_sub(1);
        self.batch_depth == 0 && self.phase == SchedulerPhase::Collecting
    }

    pub fn in_batch(&self) -> bool {
        self.batch_depth > 0
    }

    /// Get the total number of nodes in the graph.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new()
    }
}
