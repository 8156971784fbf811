//! `LogTrace`: `ServerTrace` that forwards every hook to `tracing`.
//!
//! Listener start/stop goes out at `info`, per-connection lifecycle at
//! `debug`, byte-level traffic at `trace`, and anything that closes a
//! connection abnormally at `warn`. Installing a subscriber is left to the
//! binary.
//!
//! Also keeps a gauge of currently watched connections.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sockpool_core::id::TokenId;
use sockpool_core::settings::ListenerSettings;
use sockpool_core::trace::{CloseInfo, CloseReason, ServerTrace, WatchdogTiming};

#[derive(Debug, Default)]
pub struct LogTrace {
    watched: AtomicUsize,
}

impl LogTrace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections the watchdog is currently tracking.
    pub fn watched(&self) -> usize {
        self.watched.load(Ordering::Relaxed)
    }
}

impl ServerTrace for LogTrace {
    fn start_listen(&self, settings: &ListenerSettings) {
        tracing::info!(
            addr = %settings.local_addr,
            max_connections = settings.max_connections,
            buffer_size = settings.buffer_size,
            workers = settings.worker_pool_size(),
            "starting listener"
        );
    }

    fn disposed_listen(&self, err: &io::Error) {
        tracing::debug!(error = %err, "listen socket disposed");
    }

    fn bad_accept(&self, token: TokenId, err: &io::Error) {
        tracing::warn!(%token, error = %err, "accept failed");
    }

    fn accepted(&self, token: TokenId, remote: SocketAddr) {
        tracing::debug!(%token, %remote, "accepted");
    }

    fn received(&self, token: TokenId, remote: SocketAddr, message: &[u8]) {
        tracing::trace!(%token, %remote, bytes = message.len(), "received");
    }

    fn received_greater_than_buffer(
        &self,
        token: TokenId,
        remote: SocketAddr,
        message: &[u8],
        total: usize,
    ) {
        tracing::warn!(
            %token,
            %remote,
            buffered = message.len(),
            total,
            "message exceeds receive buffer"
        );
    }

    fn sending(&self, token: TokenId, remote: SocketAddr, bytes: usize) {
        tracing::trace!(%token, %remote, bytes, "sending");
    }

    fn sent(&self, token: TokenId, remote: SocketAddr, bytes: usize) {
        tracing::trace!(%token, %remote, bytes, "sent");
    }

    fn closing_connection(&self, token: TokenId, remote: SocketAddr, info: &CloseInfo) {
        match info.reason {
            CloseReason::Requested | CloseReason::RemoteClosed | CloseReason::Shutdown => {
                tracing::debug!(
                    %token,
                    %remote,
                    reason = %info.reason,
                    told_by_handler = info.told_by_handler,
                    closed_by_remote = info.closed_by_remote,
                    "closing connection"
                );
            }
            _ => {
                tracing::warn!(
                    %token,
                    %remote,
                    reason = %info.reason,
                    error = ?info.error,
                    "closing connection"
                );
            }
        }
    }

    fn timing_out_connection(
        &self,
        token: TokenId,
        remote: SocketAddr,
        idle_ms: u64,
        timing: &WatchdogTiming,
    ) {
        tracing::warn!(
            %token,
            %remote,
            idle_ms,
            await_ms = timing.await_ms,
            lock_ms = timing.lock_ms,
            scan_ms = timing.scan_ms,
            close_ms = timing.close_ms,
            "timing out idle connection"
        );
    }

    fn queued_task(&self, token: TokenId) {
        tracing::trace!(%token, "task queued");
    }

    fn starting_task(&self, token: TokenId, waited: Duration) {
        tracing::trace!(%token, waited_ms = waited.as_millis() as u64, "task starting");
    }

    fn expired_task(&self, token: TokenId, waited: Duration) {
        tracing::warn!(%token, waited_ms = waited.as_millis() as u64, "task expired in queue");
    }

    fn completed_task(&self, token: TokenId) {
        tracing::trace!(%token, "task completed");
    }

    fn failed_task(&self, token: TokenId, err: &dyn fmt::Display) {
        tracing::warn!(%token, error = %err, "handler failed");
    }

    fn watchdog_running(&self, now_ms: u64, duration_ms: u64, active: usize) {
        tracing::trace!(now_ms, duration_ms, active, "watchdog sweep");
    }

    fn exception(&self, err: &dyn fmt::Display) {
        tracing::error!(error = %err, "listener error");
    }

    fn dispose(&self) {
        tracing::info!("listener disposing");
    }

    fn increment_watched(&self) {
        self.watched.fetch_add(1, Ordering::Relaxed);
    }

    fn decrement_watched(&self) {
        let _ = self
            .watched
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watched_gauge() {
        let t = LogTrace::new();
        t.increment_watched();
        t.increment_watched();
        t.decrement_watched();
        assert_eq!(t.watched(), 1);
        t.decrement_watched();
        t.decrement_watched();
        assert_eq!(t.watched(), 0);
    }

    #[test]
    fn test_hooks_without_subscriber() {
        let t = LogTrace::new();
        let remote: SocketAddr = "10.0.0.1:80".parse().unwrap();
        let id = TokenId::new(5);
        t.accepted(id, remote);
        t.received(id, remote, b"GET / HTTP/1.1\r\n\r\n");
        t.closing_connection(
            id,
            remote,
            &CloseInfo {
                reason: CloseReason::SocketError,
                error: Some(io::ErrorKind::ConnectionReset),
                ..Default::default()
            },
        );
        t.failed_task(id, &"boom");
    }
}
