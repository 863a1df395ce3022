//! Dependency Tracker
//!
//! A tracker is the evaluation context of one computed or effect run. Every
//! reactive read made through it is recorded, and when the run finishes the
//! runtime replaces the node's dependency set with exactly those reads.
//!
//! # Implementation
//!
//! The tracker is passed explicitly: compute and effect closures receive a
//! `&Tracker`, and `Signal::get` / `Computed::get` take one. There is no
//! ambient stack. Nested evaluations (a computed pulled while an effect is
//! running) simply get their own tracker, so they cannot leak reads into
//! each other.

use std::cell::RefCell;

use smallvec::SmallVec;

use crate::graph::NodeId;

/// The evaluation context threaded through reactive reads.
#[derive(Debug)]
pub struct Tracker {
    /// The computation being evaluated, `None` for untracked reads.
    owner: Option<NodeId>,

    /// Node IDs read so far, in read order, possibly repeated.
    reads: RefCell<SmallVec<[NodeId; 8]>>,
}

impl Tracker {
    /// Start tracking reads on behalf of `owner`.
    pub(crate) fn new(owner: NodeId) -> Self {
        Self {
            owner: Some(owner),
            reads: RefCell::new(SmallVec::new()),
        }
    }

    /// A context that records nothing. Reads through it never subscribe.
    pub fn untracked() -> Self {
        Self {
            owner: None,
            reads: RefCell::new(SmallVec::new()),
        }
    }

    /// The node this context evaluates, if any.
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn is_tracking(&self) -> bool {
        self.owner.is_some()
    }

    /// Record a read of `node`.
    pub(crate) fn track(&self, node: NodeId) {
        if self.owner.is_some() {
            self.reads.borrow_mut().push(node);
        }
    }

    /// The distinct nodes read so far, in first-read order.
    pub fn dependencies(&self) -> Vec<NodeId> {
        let reads = self.reads.borrow();
        let mut seen = Vec::with_capacity(reads.len());
        for id in reads.iter() {
            if !seen.contains(id) {
                seen.push(*id);
            }
        }
        seen
    }

    pub(crate) fn into_reads(self) -> SmallVec<[NodeId; 8]> {
        self.reads.into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_records_owner() {
        let id = NodeId::new();
        let cx = Tracker::new(id);
        assert_eq!(cx.owner(), Some(id));
        assert!(cx.is_tracking());
    }

    #[test]
    fn tracker_records_distinct_dependencies() {
        let cx = Tracker::new(NodeId::new());
        let (a, b, c) = (NodeId::from(1), NodeId::from(2), NodeId::from(3));

        cx.track(a);
        cx.track(b);
        cx.track(a);
        cx.track(c);

        assert_eq!(cx.dependencies(), vec![a, b, c]);
    }

    #[test]
    fn untracked_context_records_nothing() {
        let cx = Tracker::untracked();
        cx.track(NodeId::from(7));
        assert!(!cx.is_tracking());
        assert!(cx.dependencies().is_empty());
    }

    #[test]
    fn nested_trackers_are_independent() {
        let outer = Tracker::new(NodeId::new());
        outer.track(NodeId::from(1));

        {
            let inner = Tracker::new(NodeId::new());
            inner.track(NodeId::from(2));
            assert_eq!(inner.dependencies(), vec![NodeId::from(2)]);
        }

        assert_eq!(outer.dependencies(), vec![NodeId::from(1)]);
    }
}
