//! Trace / observability seam.
//!
//! The listener calls a `ServerTrace` at every lifecycle event. Every hook
//! has an empty default body, so an implementor overrides only what it
//! cares about. [`NullTrace`] overrides nothing and is what the listener
//! uses when the caller does not supply a tracer.
//!
//! Hooks are invoked inline on I/O, scheduler and watchdog threads. They
//! must be cheap and must not block.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use crate::id::TokenId;
use crate::settings::ListenerSettings;

/// Why a connection was closed.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CloseReason {
    /// Not closed / no reason recorded yet.
    #[default]
    None = 0,
    /// The handler asked for the close (`disconnect_once_done`).
    Requested = 1,
    /// The peer closed its end (zero-byte receive).
    RemoteClosed = 2,
    /// A receive or send failed with a socket error.
    SocketError = 3,
    /// The message outgrew the receive segment.
    BufferOverflow = 4,
    /// The watchdog found the connection idle for too long.
    TimedOut = 5,
    /// The dispatch task waited longer than the max task delay.
    TaskExpired = 6,
    /// The handler returned an error or panicked.
    HandlerFailed = 7,
    /// The listener is shutting down.
    Shutdown = 8,
}

impl CloseReason {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CloseReason::Requested,
            2 => CloseReason::RemoteClosed,
            3 => CloseReason::SocketError,
            4 => CloseReason::BufferOverflow,
            5 => CloseReason::TimedOut,
            6 => CloseReason::TaskExpired,
            7 => CloseReason::HandlerFailed,
            8 => CloseReason::Shutdown,
            _ => CloseReason::None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::None => "none",
            CloseReason::Requested => "requested",
            CloseReason::RemoteClosed => "remote-closed",
            CloseReason::SocketError => "socket-error",
            CloseReason::BufferOverflow => "buffer-overflow",
            CloseReason::TimedOut => "timed-out",
            CloseReason::TaskExpired => "task-expired",
            CloseReason::HandlerFailed => "handler-failed",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details handed to [`ServerTrace::closing_connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CloseInfo {
    /// The handler asked to disconnect after its response.
    pub told_by_handler: bool,
    /// The peer closed first.
    pub closed_by_remote: bool,
    pub reason: CloseReason,
    /// Socket error kind, when `reason` is `SocketError`.
    pub error: Option<io::ErrorKind>,
}

/// Timing breakdown for one watchdog sweep, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WatchdogTiming {
    /// Time spent waiting for the poll interval.
    pub await_ms: u64,
    /// Time between waking and holding the watch-set lock.
    pub lock_ms: u64,
    /// Time spent scanning the watch set under the lock.
    pub scan_ms: u64,
    /// Time spent force-closing this connection.
    pub close_ms: u64,
}

/// Lifecycle hooks. All no-op by default.
#[allow(unused_variables)]
pub trait ServerTrace: Send + Sync {
    /// The listener is about to bind.
    fn start_listen(&self, settings: &ListenerSettings) {}

    /// The listen socket went away underneath an accept.
    fn disposed_listen(&self, err: &io::Error) {}

    /// An accept completed with an error.
    fn bad_accept(&self, token: TokenId, err: &io::Error) {}

    /// A connection was accepted.
    fn accepted(&self, token: TokenId, remote: SocketAddr) {}

    /// Bytes arrived. `message` is everything accumulated so far.
    fn received(&self, token: TokenId, remote: SocketAddr, message: &[u8]) {}

    /// More bytes arrived than the receive segment holds.
    fn received_greater_than_buffer(
        &self,
        token: TokenId,
        remote: SocketAddr,
        message: &[u8],
        total: usize,
    ) {
    }

    /// A send of `bytes` is about to be issued.
    fn sending(&self, token: TokenId, remote: SocketAddr, bytes: usize) {}

    /// A send completed with `bytes` written.
    fn sent(&self, token: TokenId, remote: SocketAddr, bytes: usize) {}

    /// A connection is about to be torn down.
    fn closing_connection(&self, token: TokenId, remote: SocketAddr, info: &CloseInfo) {}

    /// The watchdog is force-closing an idle connection.
    fn timing_out_connection(
        &self,
        token: TokenId,
        remote: SocketAddr,
        idle_ms: u64,
        timing: &WatchdogTiming,
    ) {
    }

    /// A complete message was submitted to the task scheduler.
    fn queued_task(&self, token: TokenId) {}

    /// A dispatch task began, after waiting `waited` in the queue.
    fn starting_task(&self, token: TokenId, waited: Duration) {}

    /// A dispatch task was dropped for waiting longer than the max delay.
    fn expired_task(&self, token: TokenId, waited: Duration) {}

    /// A dispatch task finished and its response is ready.
    fn completed_task(&self, token: TokenId) {}

    /// The handler failed.
    fn failed_task(&self, token: TokenId, err: &dyn fmt::Display) {}

    /// A watchdog sweep finished.
    fn watchdog_running(&self, now_ms: u64, duration_ms: u64, active: usize) {}

    /// An unexpected error outside any single hook.
    fn exception(&self, err: &dyn fmt::Display) {}

    /// The listener is being disposed.
    fn dispose(&self) {}

    fn increment_watched(&self) {}

    fn decrement_watched(&self) {}
}

/// Tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTrace;

impl ServerTrace for NullTrace {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_roundtrip_u8() {
        for reason in [
            CloseReason::None,
            CloseReason::Requested,
            CloseReason::RemoteClosed,
            CloseReason::SocketError,
            CloseReason::BufferOverflow,
            CloseReason::TimedOut,
            CloseReason::TaskExpired,
            CloseReason::HandlerFailed,
            CloseReason::Shutdown,
        ] {
            assert_eq!(CloseReason::from_u8(reason as u8), reason);
        }
        assert_eq!(CloseReason::from_u8(200), CloseReason::None);
    }

    #[test]
    fn test_null_trace_is_object_safe() {
        let trace: std::sync::Arc<dyn ServerTrace> = std::sync::Arc::new(NullTrace);
        trace.queued_task(TokenId::new(1));
        trace.dispose();
    }
}
