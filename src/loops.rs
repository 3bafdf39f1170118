//! Forward declarations: [`StreamLoop`] and [`CellLoop`].
//!
//! Both let a combinator reference "whatever this will eventually be fed by"
//! before that source exists, so mutually-recursive graphs (a cell whose
//! update depends on a stream that in turn samples that same cell) can be
//! wired up in two steps: declare, then `loop_to` the real source in.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::Cell;
use crate::error::{FrpError, Result};
use crate::stream::Stream;
use crate::transaction::Transaction;

/// A stream whose real source is supplied later via [`StreamLoop::loop_to`].
pub struct StreamLoop<A> {
    placeholder: Stream<A>,
    bound: Arc<AtomicBool>,
}

impl<A> Clone for StreamLoop<A> {
    fn clone(&self) -> Self {
        StreamLoop {
            placeholder: self.placeholder.clone(),
            bound: self.bound.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> StreamLoop<A> {
    pub fn new() -> Self {
        StreamLoop {
            placeholder: Stream::new_node(0),
            bound: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The forward-declared stream. Valid to subscribe to immediately; it
    /// simply does not fire anything until [`StreamLoop::loop_to`] is called.
    pub fn stream(&self) -> Stream<A> {
        self.placeholder.clone()
    }

    /// Binds `actual` as this loop's real source. May only be called once.
    pub fn loop_to(&self, actual: &Stream<A>) -> Result<()> {
        if self.bound.swap(true, Ordering::AcqRel) {
            return Err(FrpError::loop_already_looped("StreamLoop"));
        }
        let placeholder = self.placeholder.clone();
        let actual = actual.clone();
        Transaction::run(move |t| {
            let placeholder2 = placeholder.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| placeholder2.send(t2, a.clone()));
            let l = actual.listen_node(placeholder.node(), t, handler, false);
            placeholder.add_cleanup(l);
        });
        Ok(())
    }
}

impl<A: Clone + Send + Sync + 'static> Default for StreamLoop<A> {
    fn default() -> Self {
        Self::new()
    }
}

/// A cell whose real source is supplied later via [`CellLoop::loop_to`].
/// Sampling before binding returns [`FrpError::LoopNotLooped`]; Rust has no
/// null value of an arbitrary `A` to stand in for "not yet resolved."
pub struct CellLoop<A> {
    stream_loop: StreamLoop<A>,
    cell: Arc<Mutex<Option<Cell<A>>>>,
}

impl<A> Clone for CellLoop<A> {
    fn clone(&self) -> Self {
        CellLoop {
            stream_loop: self.stream_loop.clone(),
            cell: self.cell.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> CellLoop<A> {
    pub fn new() -> Self {
        CellLoop {
            stream_loop: StreamLoop::new(),
            cell: Arc::new(Mutex::new(None)),
        }
    }

    /// The stream of updates this loop will eventually carry. Always valid to
    /// subscribe to; fires nothing until `loop_to` is called.
    pub fn updates(&self) -> Stream<A> {
        self.stream_loop.stream()
    }

    /// The current value, once bound.
    pub fn sample(&self) -> Result<A> {
        match &*self.cell.lock() {
            Some(c) => Ok(c.sample()),
            None => Err(FrpError::loop_not_looped("CellLoop")),
        }
    }

    /// Binds `actual` as this loop's real cell.
    pub fn loop_to(&self, actual: &Cell<A>) -> Result<()> {
        self.stream_loop.loop_to(&actual.updates())?;
        *self.cell.lock() = Some(actual.clone());
        Ok(())
    }
}

impl<A: Clone + Send + Sync + 'static> Default for CellLoop<A> {
    fn default() -> Self {
        Self::new()
    }
}
