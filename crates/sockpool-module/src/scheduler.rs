//! `BoundedScheduler`: runs blocking work with a concurrency cap.
//!
//! At most `max_concurrency` jobs run at once on the runtime's blocking
//! pool. Extra submissions wait in a FIFO queue and start, in order, as
//! running slots free up. There is no priority and no preemption.
//!
//! A job that waited longer than `max_delay` by the time a slot picks it
//! up is not run at all; it completes as [`TaskOutcome::Expired`]. A job
//! that panics completes as [`TaskOutcome::Panicked`]. Either way the
//! input value moved into `schedule()` comes back to the caller.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::oneshot;

use sockpool_core::clock::Clock;

use crate::lock;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// How a scheduled job ended.
#[derive(Debug, PartialEq, Eq)]
pub enum TaskOutcome<R> {
    /// The job ran and returned a value.
    Completed(R),
    /// The job waited `waited` in the queue, more than the max delay, and was skipped.
    Expired { waited: Duration },
    /// The job panicked with this message.
    Panicked(String),
}

struct SchedulerState {
    queue: VecDeque<Job>,
    running: usize,
}

struct SchedulerInner {
    max_concurrency: usize,
    max_delay: Duration,
    clock: Arc<dyn Clock>,
    handle: Handle,
    state: Mutex<SchedulerState>,
}

#[derive(Clone)]
pub struct BoundedScheduler {
    inner: Arc<SchedulerInner>,
}

impl BoundedScheduler {
    /// Create a scheduler that runs jobs on `handle`'s blocking pool.
    pub fn new(
        max_concurrency: usize,
        max_delay: Duration,
        clock: Arc<dyn Clock>,
        handle: Handle,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                max_concurrency: max_concurrency.max(1),
                max_delay,
                clock,
                handle,
                state: Mutex::new(SchedulerState {
                    queue: VecDeque::new(),
                    running: 0,
                }),
            }),
        }
    }

    /// Queue `work` to run against `input`.
    ///
    /// Returns at once. `work` receives the input and how long the job
    /// waited in the queue. The receiver resolves with the input and the
    /// outcome; it only errors if the runtime dropped the job unrun.
    pub fn schedule<I, R, F>(&self, input: I, work: F) -> oneshot::Receiver<(I, TaskOutcome<R>)>
    where
        I: Send + 'static,
        R: Send + 'static,
        F: FnOnce(&mut I, Duration) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let clock = Arc::clone(&self.inner.clock);
        let max_delay = self.inner.max_delay;
        let queued_at = clock.now_millis();

        let job: Job = Box::new(move || {
            let mut input = input;
            let waited = Duration::from_millis(clock.now_millis().saturating_sub(queued_at));
            let outcome = if waited > max_delay {
                TaskOutcome::Expired { waited }
            } else {
                match catch_unwind(AssertUnwindSafe(|| work(&mut input, waited))) {
                    Ok(r) => TaskOutcome::Completed(r),
                    Err(payload) => TaskOutcome::Panicked(panic_message(payload)),
                }
            };
            // Receiver gone means the connection task was cancelled.
            let _ = tx.send((input, outcome));
        });

        self.submit(job);
        rx
    }

    fn submit(&self, job: Job) {
        let spawn_runner = {
            let mut state = lock(&self.inner.state);
            state.queue.push_back(job);
            if state.running < self.inner.max_concurrency {
                state.running += 1;
                true
            } else {
                false
            }
        };

        if spawn_runner {
            let inner = Arc::clone(&self.inner);
            self.inner.handle.spawn_blocking(move || run_queue(&inner));
        }
    }

    /// Jobs running right now.
    pub fn running(&self) -> usize {
        lock(&self.inner.state).running
    }

    /// Jobs waiting for a slot.
    pub fn queued(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    #[inline]
    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }
}

/// Runner loop: keep taking jobs in FIFO order until the queue is empty.
fn run_queue(inner: &SchedulerInner) {
    loop {
        let job = {
            let mut state = lock(&inner.state);
            match state.queue.pop_front() {
                Some(job) => job,
                None => {
                    state.running -= 1;
                    return;
                }
            }
        };
        job();
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockpool_core::clock::{ManualClock, MonotonicClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scheduler(max: usize, delay: Duration, clock: Arc<dyn Clock>) -> BoundedScheduler {
        BoundedScheduler::new(max, delay, clock, Handle::current())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completed_returns_input_and_result() {
        let s = scheduler(2, Duration::from_secs(5), Arc::new(MonotonicClock::new()));
        let rx = s.schedule(vec![1u8, 2, 3], |v, _| {
            v.push(4);
            v.len()
        });
        let (input, outcome) = rx.await.unwrap();
        assert_eq!(input, vec![1, 2, 3, 4]);
        assert_eq!(outcome, TaskOutcome::Completed(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrency_is_bounded() {
        let s = scheduler(2, Duration::from_secs(30), Arc::new(MonotonicClock::new()));
        let live = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let receivers: Vec<_> = (0..8)
            .map(|i| {
                let live = Arc::clone(&live);
                let peak = Arc::clone(&peak);
                s.schedule(i, move |_, _| {
                    let now = live.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    live.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for rx in receivers {
            let (_, outcome) = rx.await.unwrap();
            assert_eq!(outcome, TaskOutcome::Completed(()));
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(s.queued(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_single_slot_runs_fifo() {
        let s = scheduler(1, Duration::from_secs(30), Arc::new(MonotonicClock::new()));
        let order = Arc::new(Mutex::new(Vec::new()));

        let receivers: Vec<_> = (0..5)
            .map(|i| {
                let order = Arc::clone(&order);
                s.schedule(i, move |i, _| order.lock().unwrap().push(*i))
            })
            .collect();
        for rx in receivers {
            rx.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_expired_job_is_not_run() {
        let clock = Arc::new(ManualClock::new(0));
        let s = scheduler(1, Duration::from_millis(100), clock.clone());
        let ran = Arc::new(AtomicUsize::new(0));

        // Hold the only slot until the clock has moved past the max delay.
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let blocker = s.schedule((), move |_, _| {
            let _ = release_rx.recv();
        });

        let late = {
            let ran = Arc::clone(&ran);
            s.schedule("input", move |_, _| {
                ran.fetch_add(1, Ordering::SeqCst);
            })
        };

        clock.advance(500);
        let _ = release_tx.send(());
        blocker.await.unwrap();

        let (input, outcome) = late.await.unwrap();
        assert_eq!(input, "input");
        assert_eq!(
            outcome,
            TaskOutcome::Expired {
                waited: Duration::from_millis(500)
            }
        );
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panic_is_caught_and_input_returned() {
        let s = scheduler(1, Duration::from_secs(5), Arc::new(MonotonicClock::new()));
        let rx = s.schedule(7u32, |_, _| -> () { panic!("handler blew up") });
        let (input, outcome) = rx.await.unwrap();
        assert_eq!(input, 7);
        assert_eq!(outcome, TaskOutcome::Panicked("handler blew up".into()));

        // The slot is usable afterwards.
        let (_, outcome) = s.schedule((), |_, _| 1).await.unwrap();
        assert_eq!(outcome, TaskOutcome::Completed(1));
    }
}
