//! # sockpool-listener: The Connection Engine
//!
//! A TCP listener that serves many short-lived connections out of memory
//! allocated once, up front:
//!
//! - a buffer arena sized `buffer_size × (max_connections + excess) × 2`,
//! - a worker-context pool, one context per connection slot,
//! - an accept-context pool,
//! - a semaphore capping live connections at `max_connections`.
//!
//! Message framing and business logic come from a caller-supplied
//! [`MessageHandler`](sockpool_core::MessageHandler). Handlers run on a
//! bounded scheduler off the I/O path. A watchdog closes connections that
//! stay idle past the connection timeout.
//!
//! ```ignore
//! let settings = ListenerSettings::from_env();
//! let mut listener = SocketListener::with_trace(settings, Arc::new(MyHandler), Arc::new(LogTrace::new()))?;
//! let addr = listener.start_listen()?;
//! tokio::signal::ctrl_c().await?;
//! listener.shutdown().await;
//! ```

mod connection;
pub mod listener;
pub mod stats;

pub use listener::SocketListener;
pub use stats::ListenerStats;
