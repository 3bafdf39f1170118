//! [`Listener`]: the handle a subscriber gets back from `listen`.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::node::{AnyHandler, NodeData};

struct ListenerInner {
    node: Arc<NodeData>,
    target_id: u64,
    // Kept alive only to hold the strong reference the node's Target refers
    // to weakly; never called directly through this field.
    _handler: Arc<AnyHandler>,
}

/// A live subscription. Dropping it (or calling [`Listener::unlisten`]
/// explicitly) removes the underlying edge from the dependency graph.
/// Unlistening is idempotent.
pub struct Listener {
    inner: Mutex<Option<ListenerInner>>,
}

impl Listener {
    pub(crate) fn new(node: Arc<NodeData>, target_id: u64, handler: Arc<AnyHandler>) -> Self {
        Listener {
            inner: Mutex::new(Some(ListenerInner {
                node,
                target_id,
                _handler: handler,
            })),
        }
    }

    /// Removes this listener's edge from the graph. Safe to call more than
    /// once, and safe to call from within a `Drop`.
    pub fn unlisten(&self) {
        if let Some(inner) = self.inner.lock().take() {
            inner.node.unlink_to(inner.target_id);
        }
    }

    /// The target id this listener still owns, or `None` if it has already
    /// unlistened (used by combinators like `once` that unlink themselves
    /// directly without going through a second `Listener`).
    pub(crate) fn target_id(&self) -> Option<u64> {
        self.inner.lock().as_ref().map(|i| i.target_id)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.unlisten();
    }
}
