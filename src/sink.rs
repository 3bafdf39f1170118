//! Externally-writable handles: [`StreamSink`] and [`CellSink`].
//!
//! These are the only two types application code uses to inject values into
//! the graph from outside a transaction. Both refuse to `send` while a
//! listener callback is on the stack, per spec §7.

use crate::cell::Cell;
use crate::error::{FrpError, Result};
use crate::stream::Stream;
use crate::transaction::Transaction;

/// An externally-writable stream: `send` pushes a value through it.
pub struct StreamSink<A> {
    stream: Stream<A>,
}

impl<A: Clone + Send + Sync + 'static> Clone for StreamSink<A> {
    fn clone(&self) -> Self {
        StreamSink {
            stream: self.stream.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> StreamSink<A> {
    pub fn new() -> Self {
        StreamSink {
            stream: Stream::new_node(0),
        }
    }

    /// The read side: a `Stream<A>` downstream combinators can subscribe to.
    pub fn stream(&self) -> Stream<A> {
        self.stream.clone()
    }

    /// Pushes `value`, opening a new transaction if one is not already
    /// current on this thread. Fails with [`FrpError::SendDuringCallback`] if
    /// called from inside a listener callback.
    pub fn send(&self, value: A) -> Result<()> {
        let stream = self.stream.clone();
        Transaction::run(move |t| {
            if t.in_callback() {
                return Err(FrpError::SendDuringCallback);
            }
            stream.send(t, value);
            Ok(())
        })
    }

    /// Pushes `value` within an already-open transaction. Used internally by
    /// combinators that construct their own nested sends (`defer`, `split`)
    /// and by tests exercising same-transaction semantics directly.
    pub(crate) fn send_in_transaction(&self, trans: &Transaction, value: A) {
        self.stream.send(trans, value);
    }
}

impl<A: Clone + Send + Sync + 'static> Default for StreamSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// An externally-writable cell: `send` updates its current value.
pub struct CellSink<A> {
    sink: StreamSink<A>,
    cell: Cell<A>,
}

impl<A: Clone + Send + Sync + 'static> Clone for CellSink<A> {
    fn clone(&self) -> Self {
        CellSink {
            sink: self.sink.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> CellSink<A> {
    pub fn new(initial: A) -> Self {
        let sink = StreamSink::new();
        let cell = sink.stream().hold(initial);
        CellSink { sink, cell }
    }

    /// The read side: a `Cell<A>` downstream combinators can observe.
    pub fn cell(&self) -> Cell<A> {
        self.cell.clone()
    }

    /// Updates the cell's value, opening a new transaction if needed.
    pub fn send(&self, value: A) -> Result<()> {
        self.sink.send(value)
    }

    pub(crate) fn send_in_transaction(&self, trans: &Transaction, value: A) {
        self.sink.send_in_transaction(trans, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_during_callback_is_rejected() {
        let sink = StreamSink::<i32>::new();
        let inner = StreamSink::<i32>::new();
        let rejected = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rejected2 = rejected.clone();
        let inner_clone = inner.clone();
        let _l = sink.stream().listen(move |_v| {
            if inner_clone.send(1).is_err() {
                rejected2.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        });
        sink.send(0).unwrap();
        assert!(rejected.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn cell_sink_updates_visible_after_send() {
        let sink = CellSink::new(1);
        assert_eq!(sink.cell().sample(), 1);
        sink.send(9).unwrap();
        assert_eq!(sink.cell().sample(), 9);
    }
}
