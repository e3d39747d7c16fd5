//! Chunked, interruptible streams running on owned threads.
//!
//! A [`Stream`] describes a possibly infinite sequence of values that may fail. Streams move data
//! in [`Chunk`]s, and can be combined with sequential operators (`map`, `filter`, `flat_map`, ...),
//! with pairwise state machines (`zip`, `zip_all`, `zip_latest`, ...), and with concurrent
//! operators that run several producers at once (`merge`, `flat_map_par`, `broadcast`,
//! `group_by_key`, ...).
//!
//! # Execution model
//!
//! Running a stream *acquires* it inside a [`Scope`], which yields a [`Pull`]. Every invocation of
//! the pull produces one non-empty chunk, signals the end of the stream, or fails with a [`Cause`].
//!
//! Concurrent operators fork [`Task`]s, each of which is an OS thread owned by a scope. When the
//! scope closes, the tasks are interrupted and waited for, so no thread outlives the stream that
//! spawned it. Interruption is cooperative: a task notices it whenever it waits on a [`Queue`],
//! sleeps on a [`Clock`], or invokes a pull.
//!
//! Failures come in three flavors, kept apart by [`Cause`]: typed errors of type `E`, defects
//! (panics in user code), and interruptions. The `run_*` operations return `Result<_, E>` and
//! re-raise defects as panics; the `run_*_exit` variants hand out the full cause.
//!
//! # Usage
//!
//! ```
//! use strand::{Runtime, Stream};
//!
//! let rt = Runtime::new();
//!
//! let words: Stream<(), String, &str> = Stream::from_iter(["one", "two", "three"]);
//! let lengths = words.map(|w| w.len()).zip(&Stream::range(0..10));
//! assert_eq!(lengths.run_collect(&rt), Ok(vec![(3, 0), (3, 1), (5, 2)]));
//! ```
//!
//! Producers running concurrently are merged into one stream:
//!
//! ```
//! use strand::{Runtime, Stream};
//!
//! let rt = Runtime::new();
//!
//! let evens: Stream<(), String, i64> = Stream::range(0..50).filter(|n| n % 2 == 0);
//! let odds = Stream::range(0..50).filter(|n| n % 2 == 1);
//! let mut all = evens.merge(&odds).run_collect(&rt).unwrap();
//! all.sort();
//! assert_eq!(all, (0..50).collect::<Vec<_>>());
//! ```

mod broadcast;
mod cause;
mod chunk;
mod clock;
mod drop;
mod group_by;
mod merge;
mod pull;
mod queue;
mod run;
mod runtime;
mod schedule;
mod scope;
mod stream;
mod sync;
mod take;
pub mod task;
mod time;
mod transform;
mod zip;


pub use broadcast::Distributor;
pub use cause::{Cause, Defect, Exit};
pub use chunk::{Chunk, Iter};
pub use clock::{Clock, SystemClock, TestClock};
pub use group_by::GroupBy;
pub use merge::HaltStrategy;
pub use pull::{Pull, PullResult};
pub use queue::{Queue, QueueError};
pub use runtime::{Context, Runtime, RuntimeBuilder};
pub use schedule::{Decision, Driver, Schedule};
pub use scope::{FinalizerKey, Scope};
pub use stream::{Data, Env, Stream};
pub use take::Take;
pub use task::{Interrupted, Task, TaskId};
pub use zip::Side;
