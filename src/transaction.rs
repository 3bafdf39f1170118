//! The rank-ordered transaction engine.
//!
//! At most one transaction is current per process at a time. `Transaction::run`
//! either joins the transaction already in progress on this thread (re-entrant
//! call) or blocks on a process-wide lock, creates a new one, drains it to a
//! fixed point in rank order, and runs its close-path phases — all before any
//! other thread's `run` call can start its own transaction.

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex;

use crate::node::NodeData;
use crate::rank::Rank;

static TRANSACTION_LOCK: StdMutex<()> = StdMutex::new(());
static SEQ_COUNTER: AtomicU64 = AtomicU64::new(0);
static ON_START_HOOKS: Mutex<Vec<Box<dyn Fn() + Send + Sync>>> = Mutex::new(Vec::new());

thread_local! {
    static CURRENT: RefCell<Option<Arc<Inner>>> = RefCell::new(None);
}

fn next_seq() -> u64 {
    SEQ_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapKey {
    rank: Rank,
    seq: u64,
}

struct EntryRecord {
    node: Arc<NodeData>,
    action: Option<Box<dyn FnOnce(&Transaction) + Send>>,
}

struct Inner {
    entries: Mutex<HashMap<u64, EntryRecord>>,
    heap: Mutex<BinaryHeap<Reverse<HeapKey>>>,
    to_regen: AtomicBool,
    last: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    first_post: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    post: Mutex<BTreeMap<i64, Box<dyn FnOnce(&Transaction) + Send>>>,
    in_callback: AtomicU32,
}

impl Inner {
    fn new() -> Self {
        Inner {
            entries: Mutex::new(HashMap::new()),
            heap: Mutex::new(BinaryHeap::new()),
            to_regen: AtomicBool::new(false),
            last: Mutex::new(Vec::new()),
            first_post: Mutex::new(Vec::new()),
            post: Mutex::new(BTreeMap::new()),
            in_callback: AtomicU32::new(0),
        }
    }
}

/// A handle to the currently-running transaction, passed to every combinator
/// and listener callback. Cheap to clone (an `Arc` underneath).
#[derive(Clone)]
pub struct Transaction(pub(crate) Arc<Inner>);

impl Transaction {
    /// Runs `f` inside a transaction: joins the one already in progress on
    /// this thread if there is one, otherwise starts a new outermost
    /// transaction, drains it, runs the close-path phases, and returns `f`'s
    /// result. The close path always runs, even if `f` panics.
    pub fn run<T, F>(f: F) -> T
    where
        F: FnOnce(&Transaction) -> T,
    {
        CURRENT.with(|cur| {
            let existing = cur.borrow().clone();
            if let Some(inner) = existing {
                let txn = Transaction(inner);
                return f(&txn);
            }

            let guard = TRANSACTION_LOCK.lock().unwrap_or_else(|p| p.into_inner());
            let inner = Arc::new(Inner::new());
            *cur.borrow_mut() = Some(inner.clone());
            tracing::trace!("transaction started");

            for hook in ON_START_HOOKS.lock().iter() {
                hook();
            }

            let txn = Transaction(inner.clone());
            let inner_for_body = inner.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                let value = f(&txn);
                Self::drain(&inner_for_body);
                let lasts = std::mem::take(&mut *inner_for_body.last.lock());
                for action in lasts {
                    action();
                }
                value
            }));

            // Everything from here on must run on every exit path, including
            // a panic unwinding out of the closure above: clear the
            // thread-local so a subsequent `run` starts fresh rather than
            // rejoining a transaction that never finished draining, and
            // release the global lock before the first-post/post phases,
            // since those actions (`defer`, `split`, `switch`) commonly call
            // back into `Transaction::run` on this same thread.
            *cur.borrow_mut() = None;
            drop(guard);

            let posts = std::mem::take(&mut *inner.first_post.lock());
            for action in posts {
                action();
            }

            let post_map = std::mem::take(&mut *inner.post.lock());
            for (_key, action) in post_map {
                Transaction::run(move |t| action(t));
            }

            tracing::trace!("transaction closed");
            match result {
                Ok(v) => v,
                Err(payload) => std::panic::resume_unwind(payload),
            }
        })
    }

    /// `run` for actions with no meaningful return value.
    pub fn run_void<F>(f: F)
    where
        F: FnOnce(&Transaction),
    {
        Transaction::run(|t| f(t))
    }

    /// Registers a hook invoked once at the start of every *outermost*
    /// transaction (never re-entered by a nested `run` call).
    pub fn on_start<F>(hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        ON_START_HOOKS.lock().push(Box::new(hook));
    }

    fn drain(inner: &Arc<Inner>) {
        loop {
            if inner.to_regen.swap(false, Ordering::AcqRel) {
                Self::rebuild_heap(inner);
            }
            let seq = {
                let mut heap = inner.heap.lock();
                heap.pop().map(|Reverse(key)| key.seq)
            };
            let seq = match seq {
                Some(s) => s,
                None => break,
            };
            let record = inner.entries.lock().remove(&seq);
            if let Some(mut record) = record {
                if let Some(action) = record.action.take() {
                    let txn = Transaction(inner.clone());
                    action(&txn);
                }
            }
        }
    }

    fn rebuild_heap(inner: &Arc<Inner>) {
        let entries = inner.entries.lock();
        let mut heap = inner.heap.lock();
        heap.clear();
        for (seq, record) in entries.iter() {
            heap.push(Reverse(HeapKey {
                rank: record.node.rank(),
                seq: *seq,
            }));
        }
    }

    /// Schedules `action` to run once this transaction's drain loop reaches
    /// `node`'s rank. `node` is consulted for its *current* rank at the
    /// moment the heap is (re)built, never cached beyond that.
    pub(crate) fn prioritized<F>(&self, node: &Arc<NodeData>, action: F)
    where
        F: FnOnce(&Transaction) + Send + 'static,
    {
        let seq = next_seq();
        let rank = node.rank();
        self.0.entries.lock().insert(
            seq,
            EntryRecord {
                node: node.clone(),
                action: Some(Box::new(action)),
            },
        );
        self.0.heap.lock().push(Reverse(HeapKey { rank, seq }));
    }

    /// Marks the priority queue stale: the next drain iteration rebuilds it
    /// from the entries set using each entry's node's *current* rank. Called
    /// whenever `linkTo` actually raises a rank mid-transaction.
    pub(crate) fn set_needs_regenerating(&self) {
        self.0.to_regen.store(true, Ordering::Release);
    }

    /// Queues `action` for the last phase: runs once, after the drain loop
    /// empties, in the order last-phase actions were registered.
    pub(crate) fn last<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.last.lock().push(Box::new(action));
    }

    /// Queues `action` for the first-post phase: runs once, after drain and
    /// the last phase, with `CURRENT` already cleared (so a `Transaction::run`
    /// inside `action` starts a genuinely new outermost transaction).
    pub fn post<F>(&self, action: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.0.first_post.lock().push(Box::new(action));
    }

    /// Engine primitive: queues `action` under `key` in the keyed post map. A
    /// second call with the same key composes: the existing action for that
    /// key runs first, then the new one. Each key's composed action runs in
    /// its own freshly-opened outermost transaction after the first-post
    /// phase.
    #[allow(dead_code)]
    pub(crate) fn post_keyed<F>(&self, key: i64, action: F)
    where
        F: FnOnce(&Transaction) + Send + 'static,
    {
        let mut map = self.0.post.lock();
        let combined: Box<dyn FnOnce(&Transaction) + Send> = match map.remove(&key) {
            Some(existing) => Box::new(move |t: &Transaction| {
                existing(t);
                action(t);
            }),
            None => Box::new(action),
        };
        map.insert(key, combined);
    }

    pub(crate) fn enter_callback(&self) {
        self.0.in_callback.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn exit_callback(&self) {
        self.0.in_callback.fetch_sub(1, Ordering::AcqRel);
    }

    /// Whether a listener callback (e.g. replay-on-listen) is currently
    /// executing on this transaction. Sinks refuse `send` while this is true.
    pub(crate) fn in_callback(&self) -> bool {
        self.0.in_callback.load(Ordering::Acquire) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_run_reuses_current_transaction() {
        let outer_ptr = Transaction::run(|t| Arc::as_ptr(&t.0) as usize);
        let (a, b) = Transaction::run(|t1| {
            let p1 = Arc::as_ptr(&t1.0) as usize;
            let p2 = Transaction::run(|t2| Arc::as_ptr(&t2.0) as usize);
            (p1, p2)
        });
        assert_eq!(a, b);
        assert_ne!(a, outer_ptr); // different outermost transactions
    }

    #[test]
    fn last_phase_runs_after_drain() {
        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let node = NodeData::new_with_rank(0);
        Transaction::run(|t| {
            let log2 = log.clone();
            t.prioritized(&node, move |_t| log2.lock().push("drain"));
            let log3 = log.clone();
            t.last(move || log3.lock().push("last"));
        });
        assert_eq!(*log.lock(), vec!["drain", "last"]);
    }

    #[test]
    fn post_keyed_composes_in_order() {
        let log: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        Transaction::run(|t| {
            let log1 = log.clone();
            t.post_keyed(7, move |_t| log1.lock().push(1));
            let log2 = log.clone();
            t.post_keyed(7, move |_t| log2.lock().push(2));
        });
        assert_eq!(*log.lock(), vec![1, 2]);
    }

    #[test]
    fn regen_reorders_by_live_rank() {
        // `trigger` is queued first (lowest sequence number, rank 0) and
        // links a high-ranked node onto `b` mid-drain -- exactly what
        // `link_to` does for real combinators -- raising b's live rank
        // above a's and requesting a heap rebuild. `b` is queued second and
        // `a` third, both also at rank 0, so without the rebuild the FIFO
        // tie-break would run b before a. After the rebuild driven by
        // `trigger`, the heap must reflect b's bumped rank and run a first.
        use crate::node::AnyHandler;
        use std::any::Any;

        let a = NodeData::new_with_rank(0);
        let b = NodeData::new_with_rank(0);
        let trigger = NodeData::new_with_rank(0);
        let upstream = NodeData::new_with_rank(10);

        let dummy_handler: Arc<AnyHandler> = Arc::new(|_t: &Transaction, _v: &dyn Any| {});
        let weak = Arc::downgrade(&dummy_handler);

        let log: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        Transaction::run(|t| {
            let b_for_trigger = b.clone();
            let upstream_for_trigger = upstream.clone();
            t.prioritized(&trigger, move |t2| {
                let (changed, _id) = upstream_for_trigger.link_to(weak, &b_for_trigger);
                assert!(changed, "b's rank must actually change for this test to mean anything");
                t2.set_needs_regenerating();
            });

            let log_b = log.clone();
            t.prioritized(&b, move |_t| log_b.lock().push("b"));

            let log_a = log.clone();
            t.prioritized(&a, move |_t| log_a.lock().push("a"));
        });

        assert_eq!(*log.lock(), vec!["a", "b"]);
        assert!(b.rank() > upstream.rank());
    }

    #[test]
    fn first_post_action_can_open_a_nested_transaction_without_deadlocking() {
        // Regression: `defer`/`split`/`Cell::switch_*` schedule a `post`
        // action that itself calls `Transaction::run`. That must not try to
        // reacquire `TRANSACTION_LOCK` while it is still held by this
        // (outer) transaction's close path.
        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        Transaction::run_void(|t| {
            t.post(move || {
                Transaction::run_void(|_t2| {
                    ran2.store(true, Ordering::SeqCst);
                });
            });
        });
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn close_path_runs_and_current_is_cleared_even_if_the_closure_panics() {
        // Regression: a panic during `f` (or during drain/last) must not
        // leave the thread-local `CURRENT` pointing at a dead transaction --
        // otherwise every later `Transaction::run` on this thread would
        // silently "join" it and never drain again.
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            Transaction::run_void(|_t| panic!("boom"));
        }));
        assert!(unwound.is_err());

        let ran = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ran2 = ran.clone();
        Transaction::run_void(move |_t| ran2.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }
}
