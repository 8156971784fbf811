//! Listener statistics
//!
//! Counters are bumped lock-free on the connection path; `ListenerStats`
//! is a point-in-time snapshot built on demand.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    accepted: AtomicU64,
    handled: AtomicU64,
    active: AtomicUsize,
    lost_workers: AtomicU64,
}

impl StatsCounters {
    #[inline]
    pub(crate) fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_handled(&self) {
        self.handled.fetch_add(1, Ordering::Relaxed);
    }

    /// A connection task took over a worker context.
    #[inline]
    pub(crate) fn record_open(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_close(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// A worker context went down with its task and never reached the pool.
    #[inline]
    pub(crate) fn record_lost_worker(&self) {
        self.lost_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn lost_workers(&self) -> u64 {
        self.lost_workers.load(Ordering::Relaxed)
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }
}

/// Snapshot of a listener's resource usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenerStats {
    /// Accepted connections not yet closed.
    pub active_connections: usize,
    /// Worker contexts waiting in the pool.
    pub idle_workers: usize,
    /// Accept contexts waiting in the pool.
    pub idle_accept_contexts: usize,
    /// Connections registered with the watchdog.
    pub watched: usize,
    /// Arena segments held by worker contexts.
    pub segments_in_use: usize,
    /// Connections accepted since start.
    pub accepted_total: u64,
    /// Messages the handler completed since start.
    pub handled_total: u64,
    /// Worker contexts dropped by the runtime instead of recycled.
    pub lost_workers: u64,
}

impl fmt::Display for ListenerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "active={} idle_workers={} idle_accepts={} watched={} segments={} accepted={} handled={} lost={}",
            self.active_connections,
            self.idle_workers,
            self.idle_accept_contexts,
            self.watched,
            self.segments_in_use,
            self.accepted_total,
            self.handled_total,
            self.lost_workers,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let c = StatsCounters::default();
        c.record_accept();
        c.record_accept();
        c.record_handled();
        assert_eq!(c.accepted(), 2);
        assert_eq!(c.handled(), 1);
    }

    #[test]
    fn test_active_follows_open_and_close() {
        let c = StatsCounters::default();
        c.record_open();
        c.record_open();
        c.record_close();
        assert_eq!(c.active(), 1);
        c.record_close();
        assert_eq!(c.active(), 0);

        c.record_lost_worker();
        assert_eq!(c.lost_workers(), 1);
    }

    #[test]
    fn test_display() {
        let s = ListenerStats {
            active_connections: 1,
            accepted_total: 3,
            ..Default::default()
        };
        let text = s.to_string();
        assert!(text.starts_with("active=1 "));
        assert!(text.ends_with("accepted=3 handled=0 lost=0"));
    }
}
