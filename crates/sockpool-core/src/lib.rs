//! # sockpool-core: Trait definitions for sockpool
//!
//! This crate defines the trait boundaries of the connection-pooling
//! TCP server. Each trait models one seam the listener calls through:
//!
//! - [`handler::MessageHandler`]: message framing and business logic,
//!   supplied by the caller.
//! - [`handler::ConnectionState`]: per-connection protocol state, recycled
//!   together with its connection token.
//! - [`trace::ServerTrace`]: lifecycle hooks. [`trace::NullTrace`] is the default.
//! - [`clock::Clock`]: monotonic millisecond timestamps, injected so timing
//!   can be driven by hand in tests.
//!
//! ## Design principle
//!
//! > "Program to the interface. Start safe. Optimize with a new impl,
//! >  not by modifying the existing one."
//!
//! The listener depends on these traits, never on concrete handlers or
//! tracers. Default implementations live in `sockpool-module`.

pub mod clock;
pub mod env;
pub mod error;
pub mod handler;
pub mod id;
pub mod settings;
pub mod trace;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{ListenerError, Result};
pub use handler::{BoxError, ConnectionState, CustomState, MessageHandler, MessageResponse};
pub use id::TokenId;
pub use settings::ListenerSettings;
pub use trace::{CloseInfo, CloseReason, NullTrace, ServerTrace, WatchdogTiming};
