//! The dependency graph: [`NodeData`], its outgoing [`Target`] edges, and the
//! rank-raising DFS that keeps `downstream.rank > upstream.rank` everywhere.

use std::any::Any;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::rank::{Rank, NULL_RANK};
use crate::transaction::Transaction;

/// A type-erased listener callback. Concrete `Stream<A>`s box their typed
/// handlers behind this so `NodeData` itself never needs to know `A`.
pub(crate) type AnyHandler = dyn Fn(&Transaction, &dyn Any) + Send + Sync;

/// An outgoing edge: a downstream node plus a weak handle to the callback
/// that should run when the owning node fires. The strong reference lives on
/// the [`crate::listener::Listener`] the subscriber holds; once that's
/// dropped, `handler.upgrade()` returns `None` and `send` quietly skips it.
#[derive(Clone)]
pub(crate) struct Target {
    pub(crate) id: u64,
    pub(crate) handler: Weak<AnyHandler>,
    pub(crate) node: Arc<NodeData>,
}

/// A vertex in the dependency DAG.
pub(crate) struct NodeData {
    rank: AtomicU64,
    targets: Mutex<Vec<Target>>,
    next_target_id: AtomicU64,
}

impl NodeData {
    pub(crate) fn new_with_rank(rank: Rank) -> Arc<Self> {
        Arc::new(NodeData {
            rank: AtomicU64::new(rank),
            targets: Mutex::new(Vec::new()),
            next_target_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn null() -> Arc<Self> {
        Self::new_with_rank(NULL_RANK)
    }

    pub(crate) fn rank(&self) -> Rank {
        self.rank.load(Ordering::Acquire)
    }

    /// Snapshot of this node's outgoing targets. Cloned out from under the
    /// lock so traversal and scheduling never hold a node's lock while
    /// touching another node.
    pub(crate) fn targets_snapshot(&self) -> Vec<Target> {
        self.targets.lock().clone()
    }

    /// Registers `handler` as a listener of this node, with `downstream` as
    /// the node any output produced by `handler` should be scheduled against.
    /// Returns `(rank_changed, target_id)`; `rank_changed` tells the caller
    /// whether the owning transaction needs `set_needs_regenerating`.
    pub(crate) fn link_to(
        self: &Arc<Self>,
        handler: Weak<AnyHandler>,
        downstream: &Arc<NodeData>,
    ) -> (bool, u64) {
        let mut visited = HashSet::new();
        let rank_changed = ensure_bigger_than(downstream, self.rank(), &mut visited);
        let id = self.next_target_id.fetch_add(1, Ordering::Relaxed);
        self.targets.lock().push(Target {
            id,
            handler,
            node: downstream.clone(),
        });
        (rank_changed, id)
    }

    /// Removes the target previously returned by `link_to`. Idempotent: a
    /// second call with the same id is a no-op, since by then nothing matches.
    pub(crate) fn unlink_to(&self, id: u64) {
        let mut targets = self.targets.lock();
        if let Some(pos) = targets.iter().position(|t| t.id == id) {
            targets.remove(pos);
        }
    }
}

/// Raises `node`'s rank to at least `limit + 1`, and recurses into its own
/// listeners so the invariant holds transitively. `visited` stops the walk
/// from looping forever if the graph (illegitimately) contains a cycle; it is
/// keyed on `Arc` pointer identity, never on `Rank`, since ranks are not
/// unique and are exactly the thing being mutated here.
fn ensure_bigger_than(node: &Arc<NodeData>, limit: Rank, visited: &mut HashSet<usize>) -> bool {
    let ptr = Arc::as_ptr(node) as usize;
    if node.rank() > limit || !visited.insert(ptr) {
        return false;
    }
    let new_rank = limit.saturating_add(1);
    node.rank.store(new_rank, Ordering::Release);
    tracing::trace!(new_rank, "node rank raised by ensure_bigger_than");
    let mut changed = true;
    for target in node.targets_snapshot() {
        changed |= ensure_bigger_than(&target.node, new_rank, visited);
    }
    changed
}
