//! [`Stream`]: a discrete event source, plus every combinator over it.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cell::Cell;
use crate::listener::Listener;
use crate::node::{AnyHandler, NodeData};
use crate::rank::Rank;
use crate::transaction::Transaction;

fn null_node() -> Arc<NodeData> {
    use std::sync::OnceLock;
    static NULL: OnceLock<Arc<NodeData>> = OnceLock::new();
    NULL.get_or_init(NodeData::null).clone()
}

struct StreamData<A> {
    node: Arc<NodeData>,
    firings: Mutex<Vec<A>>,
    cleanups: Mutex<Vec<Listener>>,
}

/// A discrete event source. Cheap to clone: every clone shares the same
/// underlying node and listener set.
pub struct Stream<A> {
    inner: Arc<StreamData<A>>,
}

impl<A> Clone for Stream<A> {
    fn clone(&self) -> Self {
        Stream {
            inner: self.inner.clone(),
        }
    }
}

impl<A: Clone + Send + Sync + 'static> Stream<A> {
    pub(crate) fn new_node(rank: Rank) -> Self {
        Stream {
            inner: Arc::new(StreamData {
                node: NodeData::new_with_rank(rank),
                firings: Mutex::new(Vec::new()),
                cleanups: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn node(&self) -> Arc<NodeData> {
        self.inner.node.clone()
    }

    /// Keeps `listener` alive for as long as this stream is. Used internally
    /// by every combinator to hold its own subscription open, and exposed so
    /// application code composing its own derived streams can do the same.
    pub fn add_cleanup(&self, listener: Listener) {
        self.inner.cleanups.lock().push(listener);
    }

    /// Fires `value` in transaction `trans`: records it in the firings
    /// buffer (cleared at the last phase, so replay-on-listen only ever sees
    /// the current transaction's firings), then schedules every live
    /// listener target at its node's rank.
    pub(crate) fn send(&self, trans: &Transaction, value: A) {
        {
            let mut firings = self.inner.firings.lock();
            if firings.is_empty() {
                let data = self.inner.clone();
                trans.last(move || {
                    data.firings.lock().clear();
                });
            }
            firings.push(value.clone());
        }
        for target in self.inner.node.targets_snapshot() {
            if let Some(handler) = target.handler.upgrade() {
                let downstream = target.node.clone();
                let v = value.clone();
                trans.prioritized(&downstream, move |t| {
                    t.enter_callback();
                    handler(t, &v as &dyn Any);
                    t.exit_callback();
                });
            } else {
                tracing::trace!("skipping dead listener target during send");
            }
        }
    }

    /// Low-level subscribe, used both by the public `listen` and by every
    /// combinator. `downstream` is the node any value `handler` produces
    /// should be scheduled against; pass the null node for a plain leaf
    /// subscriber with nothing further downstream.
    pub(crate) fn listen_node(
        &self,
        downstream: Arc<NodeData>,
        trans: &Transaction,
        handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync>,
        suppress_earlier_firings: bool,
    ) -> Listener {
        let handler_any: Arc<AnyHandler> = {
            let handler = handler.clone();
            Arc::new(move |t: &Transaction, v: &dyn Any| {
                if let Some(v) = v.downcast_ref::<A>() {
                    handler(t, v);
                }
            })
        };
        let weak: std::sync::Weak<AnyHandler> = Arc::downgrade(&handler_any);
        let (rank_changed, target_id) = self.inner.node.link_to(weak, &downstream);
        if rank_changed {
            trans.set_needs_regenerating();
        }

        if !suppress_earlier_firings {
            let firings_snapshot: Vec<A> = self.inner.firings.lock().clone();
            if !firings_snapshot.is_empty() {
                let handler2 = handler.clone();
                trans.prioritized(&downstream, move |t| {
                    t.enter_callback();
                    for v in firings_snapshot {
                        let result =
                            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                                handler2(t, &v);
                            }));
                        if let Err(e) = result {
                            tracing::error!(?e, "listener replay handler panicked");
                        }
                    }
                    t.exit_callback();
                });
            }
        }

        Listener::new(self.inner.node.clone(), target_id, handler_any)
    }

    /// Subscribes a plain observer with no further downstream node.
    pub fn listen<F>(&self, handler: F) -> Listener
    where
        F: Fn(&A) + Send + Sync + 'static,
    {
        let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
            Arc::new(move |_t: &Transaction, a: &A| handler(a));
        let s = self.clone();
        Transaction::run(move |t| s.listen_node(null_node(), t, handler, false))
    }

    /// Subscribes with a pre-built, externally-owned handler: the returned
    /// `Listener` does not keep `handler` alive itself, so the caller is
    /// responsible for that (mirrors the original API's `listenWeak`, useful
    /// to avoid reference cycles through a handler that captures this stream).
    pub fn listen_weak(&self, handler: Arc<dyn Fn(&A) + Send + Sync>) -> Listener {
        let wrapped: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
            Arc::new(move |_t: &Transaction, a: &A| handler(a));
        let s = self.clone();
        Transaction::run(move |t| s.listen_node(null_node(), t, wrapped, false))
    }

    /// Transforms each event with a pure function.
    pub fn map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + Send + Sync + 'static,
        F: Fn(&A) -> B + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let out = Stream::<B>::new_node(0);
            let out2 = out.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| out2.send(t2, f(a)));
            let l = src.listen_node(out.node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }

    /// Filters events by predicate.
    pub fn filter<F>(&self, pred: F) -> Stream<A>
    where
        F: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let out = Stream::<A>::new_node(0);
            let out2 = out.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = Arc::new(move |t2, a: &A| {
                if pred(a) {
                    out2.send(t2, a.clone());
                }
            });
            let l = src.listen_node(out.node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }

    /// Keeps only events where `cell` currently samples `true`.
    pub fn gate(&self, cell: &Cell<bool>) -> Stream<A> {
        self.snapshot(cell, |a, keep| if *keep { Some(a.clone()) } else { None })
            .filter_optional()
    }

    /// Combines each event with the cell's current value.
    pub fn snapshot<B, C, F>(&self, cell: &Cell<B>, f: F) -> Stream<C>
    where
        B: Clone + Send + Sync + 'static,
        C: Clone + Send + Sync + 'static,
        F: Fn(&A, &B) -> C + Send + Sync + 'static,
    {
        let src = self.clone();
        let cell = cell.clone();
        Transaction::run(move |t| {
            let out = Stream::<C>::new_node(0);
            let out2 = out.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = Arc::new(move |t2, a: &A| {
                let b = cell.sample_no_trans();
                out2.send(t2, f(a, &b));
            });
            let l = src.listen_node(out.node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }

    /// Pairs each event with the cell's current value.
    pub fn snapshot_with_cell<B>(&self, cell: &Cell<B>) -> Stream<(A, B)>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.snapshot(cell, |a, b| (a.clone(), b.clone()))
    }

    /// Folds simultaneous firings within a single transaction down to one,
    /// left-to-right, via `f(accumulated_so_far, next)`.
    pub fn coalesce<F>(&self, f: F) -> Stream<A>
    where
        F: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let out = Stream::<A>::new_node(0);
            let accum: Arc<Mutex<Option<A>>> = Arc::new(Mutex::new(None));
            let out2 = out.clone();
            let accum2 = accum.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = Arc::new(move |t2, a: &A| {
                let mut slot = accum2.lock();
                let first = slot.is_none();
                let combined = match slot.take() {
                    Some(existing) => f(&existing, a),
                    None => a.clone(),
                };
                *slot = Some(combined);
                drop(slot);
                if first {
                    let out3 = out2.clone();
                    let accum3 = accum2.clone();
                    t2.prioritized(&out3.node(), move |t3| {
                        if let Some(v) = accum3.lock().take() {
                            out3.send(t3, v);
                        }
                    });
                }
            });
            let l = src.listen_node(out.node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }

    /// Merges with `other`, keeping both events when they fire in the same
    /// transaction (right-biased: see [`Stream::merge`] for the common case
    /// that folds simultaneous firings down to one).
    fn merge_raw(&self, other: &Stream<A>) -> Stream<A> {
        let left = self.clone();
        let right = other.clone();
        Transaction::run(move |t| {
            let out = Stream::<A>::new_node(0);

            // The left input is routed through an intermediate node so the
            // output's rank never has to track the left input's rank
            // directly.
            let mid = Stream::<A>::new_node(0);
            let mid2 = mid.clone();
            let left_handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| mid2.send(t2, a.clone()));
            let l_in = left.listen_node(mid.node(), t, left_handler, false);
            mid.add_cleanup(l_in);

            let out_a = out.clone();
            let mid_handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| out_a.send(t2, a.clone()));
            let l_mid = mid.listen_node(out.node(), t, mid_handler, false);
            out.add_cleanup(l_mid);

            let out_b = out.clone();
            let right_handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> =
                Arc::new(move |t2, a: &A| out_b.send(t2, a.clone()));
            let l_right = right.listen_node(out.node(), t, right_handler, false);
            out.add_cleanup(l_right);

            out
        })
    }

    /// Merges with `other`. Simultaneous firings within one transaction are
    /// combined with `f(left, right)`.
    pub fn merge_with<F>(&self, other: &Stream<A>, f: F) -> Stream<A>
    where
        F: Fn(&A, &A) -> A + Send + Sync + 'static,
    {
        self.merge_raw(other).coalesce(f)
    }

    /// Merges with `other`. Simultaneous firings keep the right stream's
    /// value (the default, right-biased behavior).
    pub fn merge(&self, other: &Stream<A>) -> Stream<A> {
        self.merge_with(other, |_l, r| r.clone())
    }

    /// Alias for [`Stream::merge`], kept for parity with the combinator-free
    /// name used elsewhere in the public surface.
    pub fn or_else(&self, other: &Stream<A>) -> Stream<A> {
        self.merge(other)
    }

    /// Forwards only the first event, then unlistens from its source.
    pub fn once(&self) -> Stream<A> {
        let src = self.clone();
        Transaction::run(move |t| {
            let out = Stream::<A>::new_node(0);
            let fired = Arc::new(AtomicBool::new(false));
            let src_node = src.node();
            let out2 = out.clone();
            let target_id_slot: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
            let target_id_slot2 = target_id_slot.clone();
            let src_node2 = src_node.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = {
                let fired = fired.clone();
                Arc::new(move |t2, a: &A| {
                    if !fired.swap(true, Ordering::AcqRel) {
                        out2.send(t2, a.clone());
                        if let Some(id) = target_id_slot2.lock().take() {
                            src_node2.unlink_to(id);
                        }
                    }
                })
            };
            let l = src.listen_node(out.node(), t, handler, false);
            *target_id_slot.lock() = l.target_id();
            out.add_cleanup(l);
            out
        })
    }

    /// Re-fires every event one full transaction later, in its own
    /// outermost transaction (post-phase deferral).
    pub fn defer(&self) -> Stream<A> {
        let src = self.clone();
        Transaction::run(move |t| {
            let sink = Arc::new(crate::sink::StreamSink::<A>::new());
            let out = sink.stream();
            let sink2 = sink.clone();
            let handler: Arc<dyn Fn(&Transaction, &A) + Send + Sync> = Arc::new(move |t2, a: &A| {
                let v = a.clone();
                let sink3 = sink2.clone();
                t2.post(move || {
                    let _ = sink3.send(v);
                });
            });
            let l = src.listen_node(null_node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }

    /// Accumulates state across events, returning a cell of the running
    /// state. Built from a forward-declared loop, matching the original
    /// API's construction (spec §4.4).
    pub fn accum<S, F>(&self, initial: S, f: F) -> Cell<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(&A, &S) -> S + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let loop_ = crate::loops::StreamLoop::<S>::new();
            let state_cell = loop_.stream().hold_in_transaction(t, initial.clone());
            let state_cell2 = state_cell.clone();
            let f = Arc::new(f);
            let updates = src.snapshot(&state_cell2, move |a, s| f(a, s));
            loop_
                .loop_to(&updates)
                .expect("a freshly created StreamLoop cannot already be bound");
            state_cell
        })
    }

    /// As [`Stream::accum`], but `initial` is not evaluated until the
    /// resulting cell is first sampled.
    pub fn accum_lazy<S, F>(&self, initial: crate::cell::Lazy<S>, f: F) -> Cell<S>
    where
        S: Clone + Send + Sync + 'static,
        F: Fn(&A, &S) -> S + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let loop_ = crate::loops::StreamLoop::<S>::new();
            let state_cell = loop_.stream().hold_lazy_in_transaction(t, initial);
            let state_cell2 = state_cell.clone();
            let f = Arc::new(f);
            let updates = src.snapshot(&state_cell2, move |a, s| f(a, s));
            loop_
                .loop_to(&updates)
                .expect("a freshly created StreamLoop cannot already be bound");
            state_cell
        })
    }

    /// Like [`Stream::accum`], but also produces an output event per input
    /// event via `f(input, state) -> (output, new_state)`.
    pub fn collect<S, B, F>(&self, initial: S, f: F) -> Stream<B>
    where
        S: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
        F: Fn(&A, &S) -> (B, S) + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let loop_ = crate::loops::StreamLoop::<S>::new();
            let state_cell = loop_.stream().hold_in_transaction(t, initial.clone());
            let f = Arc::new(f);
            let f2 = f.clone();
            let pairs: Stream<(B, S)> = src.snapshot(&state_cell, move |a, s| f2(a, s));
            let new_state = pairs.map(|(_, s)| s.clone());
            loop_
                .loop_to(&new_state)
                .expect("a freshly created StreamLoop cannot already be bound");
            pairs.map(|(b, _)| b.clone())
        })
    }

    /// As [`Stream::collect`], but `initial` is not evaluated until the
    /// internal state cell is first sampled.
    pub fn collect_lazy<S, B, F>(&self, initial: crate::cell::Lazy<S>, f: F) -> Stream<B>
    where
        S: Clone + Send + Sync + 'static,
        B: Clone + Send + Sync + 'static,
        F: Fn(&A, &S) -> (B, S) + Send + Sync + 'static,
    {
        let src = self.clone();
        Transaction::run(move |t| {
            let loop_ = crate::loops::StreamLoop::<S>::new();
            let state_cell = loop_.stream().hold_lazy_in_transaction(t, initial);
            let f = Arc::new(f);
            let f2 = f.clone();
            let pairs: Stream<(B, S)> = src.snapshot(&state_cell, move |a, s| f2(a, s));
            let new_state = pairs.map(|(_, s)| s.clone());
            loop_
                .loop_to(&new_state)
                .expect("a freshly created StreamLoop cannot already be bound");
            pairs.map(|(b, _)| b.clone())
        })
    }

    /// Holds the stream's most recent value as a cell, starting at `initial`.
    pub fn hold(&self, initial: A) -> Cell<A> {
        let src = self.clone();
        Transaction::run(move |t| src.hold_in_transaction(t, initial))
    }

    /// As [`Stream::hold`], but `initial` is not evaluated until the cell is
    /// first sampled.
    pub fn hold_lazy(&self, initial: crate::cell::Lazy<A>) -> Cell<A> {
        let src = self.clone();
        Transaction::run(move |t| Cell::new_from_stream_lazy(src, t, initial))
    }

    pub(crate) fn hold_in_transaction(&self, trans: &Transaction, initial: A) -> Cell<A> {
        Cell::new_from_stream(self.clone(), trans, initial)
    }

    pub(crate) fn hold_lazy_in_transaction(
        &self,
        trans: &Transaction,
        initial: crate::cell::Lazy<A>,
    ) -> Cell<A> {
        Cell::new_from_stream_lazy(self.clone(), trans, initial)
    }
}

impl<A: Clone + Send + Sync + 'static> Stream<Option<A>> {
    /// Drops `None` events, unwrapping the rest.
    pub fn filter_optional(&self) -> Stream<A> {
        let src = self.clone();
        Transaction::run(move |t| {
            let out = Stream::<A>::new_node(0);
            let out2 = out.clone();
            let handler: Arc<dyn Fn(&Transaction, &Option<A>) + Send + Sync> =
                Arc::new(move |t2, a: &Option<A>| {
                    if let Some(v) = a {
                        out2.send(t2, v.clone());
                    }
                });
            let l = src.listen_node(out.node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }
}

impl<A: Clone + Send + Sync + 'static> Stream<Vec<A>> {
    /// Splits each event (a collection) into individual events, each
    /// delivered in its own follow-up transaction (post-phase), matching
    /// `defer`'s timing for every element.
    pub fn split(&self) -> Stream<A> {
        let src = self.clone();
        Transaction::run(move |t| {
            let sink = Arc::new(crate::sink::StreamSink::<A>::new());
            let out = sink.stream();
            let sink2 = sink.clone();
            let handler: Arc<dyn Fn(&Transaction, &Vec<A>) + Send + Sync> =
                Arc::new(move |t2, items: &Vec<A>| {
                    for item in items.clone() {
                        let sink3 = sink2.clone();
                        t2.post(move || {
                            let _ = sink3.send(item);
                        });
                    }
                });
            let l = src.listen_node(null_node(), t, handler, false);
            out.add_cleanup(l);
            out
        })
    }
}

/// Merges a collection of streams in a balanced binary tree, combining
/// simultaneous firings with `f`.
pub fn merge_all_with<A, F>(streams: &[Stream<A>], f: F) -> Option<Stream<A>>
where
    A: Clone + Send + Sync + 'static,
    F: Fn(&A, &A) -> A + Send + Sync + Clone + 'static,
{
    if streams.is_empty() {
        return None;
    }
    let mut level: Vec<Stream<A>> = streams.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut it = level.into_iter();
        while let Some(a) = it.next() {
            match it.next() {
                Some(b) => next.push(a.merge_with(&b, f.clone())),
                None => next.push(a),
            }
        }
        level = next;
    }
    level.into_iter().next()
}
