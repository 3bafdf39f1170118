//! Propagation core of a functional reactive programming library: a
//! rank-ordered transaction engine, the dependency graph of reactive nodes it
//! schedules over, and the stream/cell primitives built on top of both.
//!
//! Application code composes [`Stream`] and [`Cell`] values directly via
//! their combinator methods; there is no separate builder/DSL layer in this
//! crate — that belongs to the layer above, which this crate exists to serve.
//!
//! ```
//! use streamgraph::StreamSink;
//!
//! let numbers = StreamSink::<i32>::new();
//! let doubled = numbers.stream().map(|n| n * 2);
//! let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
//! let seen2 = seen.clone();
//! let _listener = doubled.listen(move |n| seen2.lock().push(*n));
//! numbers.send(21).unwrap();
//! assert_eq!(*seen.lock(), vec![42]);
//! ```

mod cell;
mod error;
mod listener;
mod loops;
mod node;
mod rank;
mod sink;
mod stream;
mod transaction;

pub use cell::{Cell, Lazy};
pub use error::{FrpError, Result};
pub use listener::Listener;
pub use loops::{CellLoop, StreamLoop};
pub use rank::Rank;
pub use sink::{CellSink, StreamSink};
pub use stream::{merge_all_with, Stream};
pub use transaction::Transaction;
