//! [`Cell`]: a continuous, always-has-a-current-value signal, plus the
//! applicative (`lift`/`apply`) and `switch` combinators over it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::stream::Stream;
use crate::transaction::Transaction;

/// A value computed on demand and cached after the first access. Used for
/// `hold_lazy`/`accum_lazy`, where constructing the initial value may itself
/// be expensive or have side effects the caller wants deferred.
pub struct Lazy<A> {
    inner: Mutex<LazyState<A>>,
}

enum LazyState<A> {
    Thunk(Option<Box<dyn FnOnce() -> A + Send>>),
    Value(A),
}

impl<A: Clone> Lazy<A> {
    pub fn new<F>(thunk: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Lazy {
            inner: Mutex::new(LazyState::Thunk(Some(Box::new(thunk)))),
        }
    }

    pub fn of_value(value: A) -> Self {
        Lazy {
            inner: Mutex::new(LazyState::Value(value)),
        }
    }

    pub fn get(&self) -> A {
        let mut guard = self.inner.lock();
        match &mut *guard {
            LazyState::Value(v) => v.clone(),
            LazyState::Thunk(thunk) => {
                let f = thunk.take().expect("Lazy thunk already consumed");
                let v = f();
                *guard = LazyState::Value(v.clone());
                v
            }
        }
    }
}

enum CellCurrent<A> {
    Eager(A),
    Deferred(Lazy<A>),
}

pub(crate) struct CellData<A> {
    current: Mutex<CellCurrent<A>>,
    next: Mutex<Option<A>>,
}

impl<A: Clone> CellCurrent<A> {
    fn get(&mut self) -> A {
        match self {
            CellCurrent::Eager(v) => v.clone(),
            CellCurrent::Deferred(lazy) => {
                let v = lazy.get();
                *self = CellCurrent::Eager(v.clone());
                v
            }
        }
    }
}

/// A value that always has a "current" reading and updates at most once per
/// transaction, committed at the last phase (so every listener within a
/// transaction observes the *pre-update* value, per the delay law).
pub struct Cell<A> {
    data: Arc<CellData<A>>,
    updates: Stream<A>,
}

impl<A> Clone for Cell<A> {
    fn clone(&self) -> Self {
        Cell {
            data: self.data.clone(),
            updates: self.updates.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> Cell<A> {
    /// Builds a constant cell with no updates stream of its own.
    pub fn constant(value: A) -> Self {
        let data = Arc::new(CellData {
            current: Mutex::new(CellCurrent::Eager(value)),
            next: Mutex::new(None),
        });
        let updates = Stream::<A>::new_node(0);
        Cell { data, updates }
    }

    pub(crate) fn new_from_stream(stream: Stream<A>, trans: &Transaction, initial: A) -> Self {
        Self::new_from_stream_state(stream, trans, CellCurrent::Eager(initial))
    }

    /// As [`Cell::new_from_stream`], but the initial value is not computed
    /// until the cell is first sampled (spec §4.4's `holdLazy`).
    pub(crate) fn new_from_stream_lazy(
        stream: Stream<A>,
        trans: &Transaction,
        initial: Lazy<A>,
    ) -> Self {
        Self::new_from_stream_state(stream, trans, CellCurrent::Deferred(initial))
    }

    fn new_from_stream_state(
        stream: Stream<A>,
        trans: &Transaction,
        initial: CellCurrent<A>,
    ) -> Self {
        let data = Arc::new(CellData {
            current: Mutex::new(initial),
            next: Mutex::new(None),
        });
        let data_for_handler = data.clone();
        let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = Arc::new(move |t2, a: &A| {
            let mut next = data_for_handler.next.lock();
            let first = next.is_none();
            *next = Some(a.clone());
            drop(next);
            if first {
                let data2 = data_for_handler.clone();
                t2.last(move || {
                    if let Some(v) = data2.next.lock().take() {
                        *data2.current.lock() = CellCurrent::Eager(v);
                    }
                });
            }
        });
        let l = stream.listen_node(stream.node(), trans, handler, false);
        stream.add_cleanup(l);
        Cell {
            data,
            updates: stream,
        }
    }

    /// The stream of values this cell takes on, one event per transaction in
    /// which it updates.
    pub fn updates(&self) -> Stream<A> {
        self.updates.clone()
    }

    /// The cell's current value, ignoring any pending (not-yet-committed)
    /// update from the transaction in progress.
    pub fn sample(&self) -> A {
        self.sample_no_trans()
    }

    pub(crate) fn sample_no_trans(&self) -> A {
        self.data.current.lock().get()
    }

    /// A lazily-evaluated read of the current value.
    pub fn sample_lazy(&self) -> Lazy<A> {
        let data = self.data.clone();
        Lazy::new(move || data.current.lock().get())
    }

    /// A stream that immediately (within the subscribing transaction) fires
    /// the cell's current value, then every subsequent update.
    pub(crate) fn value_in_transaction(&self, trans: &Transaction) -> Stream<A> {
        let out = Stream::<A>::new_node(self.updates.node().rank());
        let out2 = out.clone();
        let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
            Arc::new(move |t2, a: &A| out2.send(t2, a.clone()));
        let l = self.updates.listen_node(out.node(), trans, handler, true);
        out.add_cleanup(l);
        let init_val = self.sample_no_trans();
        let out3 = out.clone();
        trans.prioritized(&out3.node(), move |t3| out3.send(t3, init_val));
        out
    }

    /// A stream that immediately fires the cell's current value (in a fresh
    /// transaction), then every subsequent update.
    pub fn value(&self) -> Stream<A> {
        let c = self.clone();
        Transaction::run(move |t| c.value_in_transaction(t))
    }

    /// Transforms the cell's value with a pure function.
    pub fn map<B, F>(&self, f: F) -> Cell<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(&A) -> B + Send + Sync + 'static,
    {
        let c = self.clone();
        Transaction::run(move |t| {
            let f = Arc::new(f);
            let initial = f(&c.sample_no_trans());
            let f2 = f.clone();
            let updates = c.updates().map(move |a| f2(a));
            updates.hold_in_transaction(t, initial)
        })
    }

    /// Subscribes to the cell: fires immediately with the current value,
    /// then on every update.
    pub fn listen<F>(&self, handler: F) -> crate::listener::Listener
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let c = self.clone();
        Transaction::run(move |t| {
            let vs = c.value_in_transaction(t);
            vs.listen(handler)
        })
    }

    /// Combines this cell with another via a pure function.
    pub fn lift2<B, C, F>(&self, other: &Cell<B>, f: F) -> Cell<C>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(&A, &B) -> C + Send + Sync + 'static,
    {
        let a = self.clone();
        let b = other.clone();
        Transaction::run(move |t| {
            let f = Arc::new(f);
            let f2 = f.clone();
            let initial = f(&a.sample_no_trans(), &b.sample_no_trans());
            let a2 = a.clone();
            let b2 = b.clone();
            let upd_a = a.updates().map(move |av| f2(av, &b2.sample_no_trans()));
            let f3 = f.clone();
            let a3 = a2.clone();
            let upd_b = b.updates().map(move |bv| f3(&a3.sample_no_trans(), bv));
            let merged = upd_a.merge_with(&upd_b, |_l, r| r.clone());
            merged.hold_in_transaction(t, initial)
        })
    }

    /// Combines three cells via a pure function.
    pub fn lift3<B, C, D, F>(&self, b: &Cell<B>, c: &Cell<C>, f: F) -> Cell<D>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        D: Clone + Send + Sync + 'static,
        F: Fn(&A, &B, &C) -> D + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let f2 = f.clone();
        let ab = self.lift2(b, move |a, b| (a.clone(), b.clone()));
        ab.lift2(c, move |(a, b), c| f2(a, b, c))
    }

    /// N-ary lift over a slice of homogeneous cells, folding pairwise.
    pub fn lift_all<F>(cells: &[Cell<A>], zero: A, f: F) -> Cell<A>
    where
        F: Fn(&A, &A) -> A + Send + Sync + Clone + 'static,
    {
        cells.iter().fold(Cell::constant(zero), |acc, c| {
            let f = f.clone();
            acc.lift2(c, move |a, b| f(a, b))
        })
    }

    /// Applicative application: a cell of functions applied to this cell.
    pub fn apply<B, F>(&self, cf: &Cell<F>) -> Cell<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(&A) -> B + Clone + Send + Sync + 'static,
    {
        cf.lift2(self, |f, a| f(a))
    }

    /// Flattens a cell of cells into a single cell that tracks whichever
    /// inner cell is current, switching over from the *next* transaction
    /// after the outer cell updates (never retroactively).
    pub fn switch_c(outer: &Cell<Cell<A>>) -> Cell<A> {
        let outer = outer.clone();
        Transaction::run(move |t| {
            let initial = outer.sample_no_trans().sample_no_trans();
            switch_c_impl(&outer, t, initial)
        })
    }

    /// Flattens a cell of streams into a single stream that forwards
    /// whichever inner stream is current.
    pub fn switch_s(outer: &Cell<Stream<A>>) -> Stream<A> {
        switch_s_impl(outer)
    }
}

fn switch_c_impl<A>(outer: &Cell<Cell<A>>, trans: &Transaction, initial: A) -> Cell<A>
where
    A: Clone + Send + Sync + 'static,
{
    let out = Stream::<A>::new_node(0);
    let current_inner_listener: Arc<Mutex<Option<crate::listener::Listener>>> =
        Arc::new(Mutex::new(None));

    let out2 = out.clone();
    let cil = current_inner_listener.clone();
    let rewire = move |t: &Transaction, inner: &Cell<A>| {
        let out3 = out2.clone();
        let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
            Arc::new(move |t2, a: &A| out3.send(t2, a.clone()));
        let l = inner.updates.listen_node(out2.node(), t, handler, true);
        *cil.lock() = Some(l);
    };

    rewire(trans, &outer.sample_no_trans());

    let out4 = out.clone();
    let outer_handler: Arc<dyn Fn(&Transaction, &Cell<A>) + Send + Sync> = {
        let rewire_box: Arc<dyn Fn(&Transaction, &Cell<A>) + Send + Sync> = Arc::new(rewire);
        Arc::new(move |t2: &Transaction, inner: &Cell<A>| {
            let inner = inner.clone();
            let rewire_box = rewire_box.clone();
            t2.post(move || {
                Transaction::run(move |t3| rewire_box(t3, &inner));
            });
        })
    };
    let l_outer = outer.updates.listen_node(out4.node(), trans, outer_handler, false);
    out.add_cleanup(l_outer);

    out.hold_in_transaction(trans, initial)
}

fn switch_s_impl<A>(outer: &Cell<Stream<A>>) -> Stream<A>
where
    A: Clone + Send + Sync + 'static,
{
    let outer = outer.clone();
    Transaction::run(move |t| {
        let out = Stream::<A>::new_node(0);
        let current_inner_listener: Arc<Mutex<Option<crate::listener::Listener>>> =
            Arc::new(Mutex::new(None));

        let out2 = out.clone();
        let cil = current_inner_listener.clone();
        let rewire = move |t: &Transaction, inner: &Stream<A>| {
            let out3 = out2.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| out3.send(t2, a.clone()));
            let l = inner.listen_node(out2.node(), t, handler, true);
            *cil.lock() = Some(l);
        };

        rewire(t, &outer.sample_no_trans());

        let out4 = out.clone();
        let rewire_box: Arc<dyn Fn(&Transaction, &Stream<A>) + Send + Sync> = Arc::new(rewire);
        let outer_handler: Arc<dyn Fn(&Transaction, &Stream<A>) + Send + Sync> = {
            let rewire_box = rewire_box.clone();
            Arc::new(move |t2: &Transaction, inner: &Stream<A>| {
                let inner = inner.clone();
                let rewire_box = rewire_box.clone();
                t2.post(move || {
                    Transaction::run(move |t3| rewire_box(t3, &inner));
                });
            })
        };
        let l_outer = outer.updates.listen_node(out4.node(), t, outer_handler, false);
        out.add_cleanup(l_outer);

        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CellSink, StreamSink};
    use std::sync::atomic::Ordering;

    #[test]
    fn hold_reflects_initial_then_updates() {
        let sink = StreamSink::<i32>::new();
        let cell = sink.stream().hold(0);
        assert_eq!(cell.sample(), 0);
        sink.send(5).unwrap();
        assert_eq!(cell.sample(), 5);
    }

    #[test]
    fn hold_lazy_defers_initial_evaluation_until_sampled() {
        let forced = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let forced2 = forced.clone();
        let sink = StreamSink::<i32>::new();
        let cell = sink.stream().hold_lazy(Lazy::new(move || {
            forced2.store(true, Ordering::SeqCst);
            99
        }));
        assert!(!forced.load(Ordering::SeqCst));
        assert_eq!(cell.sample(), 99);
        assert!(forced.load(Ordering::SeqCst));
        sink.send(1).unwrap();
        assert_eq!(cell.sample(), 1);
    }

    #[test]
    fn snapshot_uses_pre_update_value() {
        // Within one transaction, a cell update and a stream event snapshotting
        // that same cell must see the *old* value (the delay law).
        let cell_sink = CellSink::new(1);
        let event_sink = StreamSink::<()>::new();
        let snaps = event_sink.stream().snapshot(&cell_sink.cell(), |_e, c| *c);
        let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _l = snaps.listen(move |v| seen2.lock().push(*v));
        Transaction::run(|t| {
            cell_sink.send_in_transaction(t, 2);
            event_sink.send_in_transaction(t, ());
        });
        assert_eq!(*seen.lock(), vec![1]);
        assert_eq!(cell_sink.cell().sample(), 2);
    }

    #[test]
    fn map_transforms_current_and_future_values() {
        let sink = CellSink::new(2);
        let doubled = sink.cell().map(|x| x * 2);
        assert_eq!(doubled.sample(), 4);
        sink.send(5).unwrap();
        assert_eq!(doubled.sample(), 10);
    }

    #[test]
    fn value_stream_fires_current_value_then_updates() {
        let sink = CellSink::new(1);
        let vs = sink.cell().value();
        let seen: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _l = vs.listen(move |v| seen2.lock().push(*v));
        sink.send(2).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn lift2_combines_current_values_and_tracks_updates() {
        let a = CellSink::new(1);
        let b = CellSink::new(10);
        let sum = a.cell().lift2(&b.cell(), |x, y| x + y);
        assert_eq!(sum.sample(), 11);
        a.send(2).unwrap();
        assert_eq!(sum.sample(), 12);
    }
}
