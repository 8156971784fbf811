//! `Watchdog`: idle-connection reaper.
//!
//! Connections register on accept and deregister on close. A background
//! task wakes every `interval`, collects every connection idle for longer
//! than `timeout` under the watch-set lock, then trips their close signals
//! after the lock is released. The connection task does the actual
//! teardown, so a socket is never touched from here.
//!
//! Each entry remembers the heartbeat epoch it was registered under. A
//! slot recycled between the scan and the close has moved to a new epoch
//! and is left alone.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use sockpool_core::clock::Clock;
use sockpool_core::id::TokenId;
use sockpool_core::trace::{CloseReason, ServerTrace, WatchdogTiming};

use crate::cancel::CancellationToken;
use crate::lock;
use crate::token::Heartbeat;

struct Watched {
    heartbeat: Heartbeat,
    epoch: u64,
    remote: SocketAddr,
}

struct WatchdogInner {
    watched: Mutex<HashMap<TokenId, Watched>>,
    clock: Arc<dyn Clock>,
    trace: Arc<dyn ServerTrace>,
    timeout_ms: u64,
    interval: Duration,
    cancel: CancellationToken,
}

#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<WatchdogInner>,
}

impl Watchdog {
    pub fn new(
        timeout: Duration,
        interval: Duration,
        clock: Arc<dyn Clock>,
        trace: Arc<dyn ServerTrace>,
    ) -> Self {
        Self {
            inner: Arc::new(WatchdogInner {
                watched: Mutex::new(HashMap::new()),
                clock,
                trace,
                timeout_ms: timeout.as_millis() as u64,
                interval,
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Spawn the sweep loop on `handle`. It runs until `stop()`.
    pub fn start(&self, handle: &Handle) -> JoinHandle<()> {
        let this = self.clone();
        handle.spawn(async move { this.run().await })
    }

    async fn run(self) {
        let clock = &self.inner.clock;
        loop {
            let wait_start = clock.now_millis();
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.inner.interval) => {}
            }
            let await_ms = clock.now_millis().saturating_sub(wait_start);
            self.sweep_after(await_ms);
        }
        tracing::debug!("watchdog stopped");
    }

    /// Start watching a connection.
    pub fn add_watch(&self, id: TokenId, heartbeat: &Heartbeat, remote: SocketAddr) {
        let entry = Watched {
            heartbeat: heartbeat.clone(),
            epoch: heartbeat.epoch(),
            remote,
        };
        let replaced = lock(&self.inner.watched).insert(id, entry).is_some();
        if !replaced {
            self.inner.trace.increment_watched();
        }
    }

    /// Stop watching a connection. Returns `false` if it was not watched.
    pub fn remove_watch(&self, id: TokenId) -> bool {
        let removed = lock(&self.inner.watched).remove(&id).is_some();
        if removed {
            self.inner.trace.decrement_watched();
        }
        removed
    }

    pub fn watched_count(&self) -> usize {
        lock(&self.inner.watched).len()
    }

    /// Run one sweep now. Returns how many connections were timed out.
    pub fn sweep(&self) -> usize {
        self.sweep_after(0)
    }

    fn sweep_after(&self, await_ms: u64) -> usize {
        let clock = &self.inner.clock;
        let timeout_ms = self.inner.timeout_ms;

        let woke = clock.now_millis();
        let (victims, active, locked, scanned) = {
            let watched = lock(&self.inner.watched);
            let locked = clock.now_millis();
            let victims: Vec<_> = watched
                .iter()
                .filter_map(|(id, w)| {
                    let idle = woke.saturating_sub(w.heartbeat.last_talked());
                    (idle > timeout_ms).then(|| (*id, w.heartbeat.clone(), w.epoch, w.remote, idle))
                })
                .collect();
            (victims, watched.len(), locked, clock.now_millis())
        };

        let mut closed = 0;
        for (id, heartbeat, epoch, remote, idle_ms) in victims {
            let close_start = clock.now_millis();
            if !heartbeat.force_close_epoch(epoch, CloseReason::TimedOut) {
                continue;
            }
            closed += 1;
            let timing = WatchdogTiming {
                await_ms,
                lock_ms: locked.saturating_sub(woke),
                scan_ms: scanned.saturating_sub(locked),
                close_ms: clock.now_millis().saturating_sub(close_start),
            };
            self.inner
                .trace
                .timing_out_connection(id, remote, idle_ms, &timing);
        }

        let done = clock.now_millis();
        self.inner
            .trace
            .watchdog_running(done, done.saturating_sub(woke), active);
        closed
    }

    /// Stop the sweep loop and close every connection still watched.
    pub fn stop(&self) {
        self.inner.cancel.cancel();
        let drained: Vec<Watched> = lock(&self.inner.watched).drain().map(|(_, w)| w).collect();
        for w in drained {
            w.heartbeat.force_close_epoch(w.epoch, CloseReason::Shutdown);
            self.inner.trace.decrement_watched();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockpool_core::clock::ManualClock;
    use sockpool_core::trace::NullTrace;
    use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTrace {
        watched: AtomicIsize,
        timed_out: AtomicUsize,
        runs: AtomicUsize,
    }

    impl ServerTrace for CountingTrace {
        fn increment_watched(&self) {
            self.watched.fetch_add(1, Ordering::SeqCst);
        }
        fn decrement_watched(&self) {
            self.watched.fetch_sub(1, Ordering::SeqCst);
        }
        fn timing_out_connection(&self, _: TokenId, _: SocketAddr, _: u64, _: &WatchdogTiming) {
            self.timed_out.fetch_add(1, Ordering::SeqCst);
        }
        fn watchdog_running(&self, _: u64, _: u64, _: usize) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn remote() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn test_sweep_closes_only_idle() {
        let clock = Arc::new(ManualClock::new(0));
        let trace = Arc::new(CountingTrace::default());
        let dog = Watchdog::new(
            Duration::from_millis(100),
            Duration::from_millis(10),
            clock.clone(),
            trace.clone(),
        );

        let idle = Heartbeat::new();
        let busy = Heartbeat::new();
        dog.add_watch(TokenId::new(1), &idle, remote());
        dog.add_watch(TokenId::new(2), &busy, remote());
        assert_eq!(trace.watched.load(Ordering::SeqCst), 2);

        clock.set(150);
        busy.touch(140);
        assert_eq!(dog.sweep(), 1);
        assert!(idle.is_force_closed());
        assert_eq!(idle.close_reason(), CloseReason::TimedOut);
        assert!(!busy.is_force_closed());
        assert_eq!(trace.timed_out.load(Ordering::SeqCst), 1);
        assert_eq!(trace.runs.load(Ordering::SeqCst), 1);

        // Exactly at the timeout is not yet idle.
        clock.set(240);
        assert_eq!(dog.sweep(), 0);
    }

    #[test]
    fn test_add_remove_fire_watched_traces() {
        let trace = Arc::new(CountingTrace::default());
        let dog = Watchdog::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Arc::new(ManualClock::new(0)),
            trace.clone(),
        );
        let hb = Heartbeat::new();
        dog.add_watch(TokenId::new(7), &hb, remote());
        assert_eq!(dog.watched_count(), 1);
        assert!(dog.remove_watch(TokenId::new(7)));
        assert!(!dog.remove_watch(TokenId::new(7)));
        assert_eq!(dog.watched_count(), 0);
        assert_eq!(trace.watched.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recycled_slot_is_spared() {
        let clock = Arc::new(ManualClock::new(0));
        let dog = Watchdog::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            clock.clone(),
            Arc::new(NullTrace),
        );
        let hb = Heartbeat::new();
        dog.add_watch(TokenId::new(3), &hb, remote());

        // The slot moves on to a new connection without deregistering.
        hb.rearm();
        clock.set(100);
        assert_eq!(dog.sweep(), 0);
        assert!(!hb.is_force_closed());
    }

    #[test]
    fn test_stop_closes_everything() {
        let trace = Arc::new(CountingTrace::default());
        let dog = Watchdog::new(
            Duration::from_secs(60),
            Duration::from_secs(1),
            Arc::new(ManualClock::new(0)),
            trace.clone(),
        );
        let a = Heartbeat::new();
        let b = Heartbeat::new();
        dog.add_watch(TokenId::new(1), &a, remote());
        dog.add_watch(TokenId::new(2), &b, remote());

        dog.stop();
        assert!(dog.is_stopped());
        assert_eq!(a.close_reason(), CloseReason::Shutdown);
        assert_eq!(b.close_reason(), CloseReason::Shutdown);
        assert_eq!(dog.watched_count(), 0);
        assert_eq!(trace.watched.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_background_loop_reaps_and_stops() {
        let clock = Arc::new(ManualClock::new(0));
        let dog = Watchdog::new(
            Duration::from_millis(50),
            Duration::from_millis(5),
            clock.clone(),
            Arc::new(NullTrace),
        );
        let hb = Heartbeat::new();
        dog.add_watch(TokenId::new(9), &hb, remote());
        let task = dog.start(&Handle::current());

        clock.set(1_000);
        tokio::time::timeout(Duration::from_secs(2), hb.force_closed())
            .await
            .expect("watchdog never fired");

        dog.stop();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
