//! # sockpool-module: Default implementations
//!
//! The building blocks the listener is assembled from. Each one is
//! written for correctness first and is safe to share across the tokio
//! worker threads that drive connections.
//!
//! ## Components
//!
//! | Component        | Type                | Backing                         |
//! |------------------|---------------------|---------------------------------|
//! | Buffer arena     | `BufferArena`       | one `BytesMut` block, LIFO free |
//! | Context pools    | `ContextPool<T>`    | crossbeam `ArrayQueue`          |
//! | Connection token | `ConnectionToken<S>`| arena segments + `Heartbeat`    |
//! | Task scheduler   | `BoundedScheduler`  | FIFO queue + blocking pool      |
//! | Watchdog         | `Watchdog`          | mutex-guarded watch set         |
//! | Tracer           | `LogTrace`          | `tracing` events                |

pub mod arena;
pub mod cancel;
pub mod log_trace;
pub mod pool;
pub mod scheduler;
pub mod token;
pub mod watchdog;

pub use arena::{BufferArena, Segment};
pub use cancel::CancellationToken;
pub use log_trace::LogTrace;
pub use pool::{AcceptContext, ContextPool, WorkerContext};
pub use scheduler::{BoundedScheduler, TaskOutcome};
pub use token::{ConnectionToken, Heartbeat, IdentityToken};
pub use watchdog::Watchdog;

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// Every structure guarded this way stays consistent between statements,
/// so a poisoned lock carries no torn state.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
