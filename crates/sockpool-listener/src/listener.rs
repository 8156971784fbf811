//! `SocketListener`: owns the listen socket and every pooled resource.
//!
//! Construction warms the arena and fills both context pools, so nothing
//! is allocated per connection afterwards. `start_listen()` binds and
//! spawns `max_accept_ops` acceptor tasks onto the current runtime.
//!
//! Each acceptor loops:
//!
//! ```text
//! loop {
//!     1. Pop an accept context (or build one)
//!     2. Acquire a connection permit (waits while at max_connections)
//!     3. Accept; stamp the context with the accept time
//!     4. Failure → trace bad_accept, return context + permit, retry
//!                  (after a pause unless the error was the peer's)
//!     5. Success → pop a worker context, bind it to the peer,
//!                  return the accept context, register with the watchdog,
//!                  spawn the connection task
//! }
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use sockpool_core::clock::{Clock, MonotonicClock};
use sockpool_core::error::{ListenerError, Result};
use sockpool_core::handler::MessageHandler;
use sockpool_core::settings::ListenerSettings;
use sockpool_core::trace::{CloseReason, NullTrace, ServerTrace};
use sockpool_module::{
    AcceptContext, BoundedScheduler, BufferArena, CancellationToken, ConnectionToken,
    ContextPool, IdentityToken, Watchdog, WorkerContext,
};

use crate::connection;
use crate::stats::{ListenerStats, StatsCounters};

/// State shared by the listener, its acceptors and every connection task.
pub(crate) struct Shared<H: MessageHandler> {
    pub(crate) settings: ListenerSettings,
    pub(crate) handler: Arc<H>,
    pub(crate) trace: Arc<dyn ServerTrace>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) arena: BufferArena,
    pub(crate) accept_pool: ContextPool<AcceptContext>,
    pub(crate) worker_pool: ContextPool<WorkerContext<H::State>>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) watchdog: Watchdog,
    /// Set by `start_listen`, once a runtime handle is known.
    pub(crate) scheduler: OnceLock<BoundedScheduler>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) stats: StatsCounters,
}

pub struct SocketListener<H: MessageHandler> {
    shared: Arc<Shared<H>>,
    local_addr: Option<SocketAddr>,
    acceptors: Vec<JoinHandle<()>>,
    watchdog_task: Option<JoinHandle<()>>,
}

impl<H: MessageHandler> SocketListener<H> {
    /// Build a listener with no tracing and the monotonic clock.
    pub fn new(settings: ListenerSettings, handler: Arc<H>) -> Result<Self> {
        Self::with_parts(
            settings,
            handler,
            Arc::new(NullTrace),
            Arc::new(MonotonicClock::new()),
        )
    }

    /// Build a listener with a tracer.
    pub fn with_trace(
        settings: ListenerSettings,
        handler: Arc<H>,
        trace: Arc<dyn ServerTrace>,
    ) -> Result<Self> {
        Self::with_parts(settings, handler, trace, Arc::new(MonotonicClock::new()))
    }

    /// Build a listener from every injectable part.
    ///
    /// Validates the settings, allocates the arena and fills the worker
    /// and accept pools. Does not touch the network.
    pub fn with_parts(
        settings: ListenerSettings,
        handler: Arc<H>,
        trace: Arc<dyn ServerTrace>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;

        let workers = settings.worker_pool_size();
        let arena = BufferArena::new(settings.buffer_size, workers * settings.operation_kinds());
        arena.warm();

        let worker_pool = ContextPool::new(workers);
        for i in 0..workers {
            let exhausted = || ListenerError::ArenaExhausted { allocated: i * 2 };
            let recv = arena.acquire().ok_or_else(exhausted)?;
            let send = arena.acquire().ok_or_else(exhausted)?;
            let token = ConnectionToken::new(IdentityToken::new(), recv, send);
            worker_pool.push(WorkerContext::new(token));
        }

        let accept_pool = ContextPool::new(settings.max_accept_ops);
        for _ in 0..settings.max_accept_ops {
            accept_pool.push(AcceptContext::new());
        }

        let watchdog = Watchdog::new(
            settings.connection_timeout,
            settings.watchdog_interval,
            Arc::clone(&clock),
            Arc::clone(&trace),
        );

        let shared = Shared {
            permits: Arc::new(Semaphore::new(settings.max_connections)),
            settings,
            handler,
            trace,
            clock,
            arena,
            accept_pool,
            worker_pool,
            watchdog,
            scheduler: OnceLock::new(),
            shutdown: CancellationToken::new(),
            stats: StatsCounters::default(),
        };

        Ok(Self {
            shared: Arc::new(shared),
            local_addr: None,
            acceptors: Vec::new(),
            watchdog_task: None,
        })
    }

    /// Bind, start the watchdog and spawn the acceptors.
    ///
    /// Must be called from inside a tokio runtime. Returns the bound
    /// address, which differs from the configured one when port 0 was asked for.
    pub fn start_listen(&mut self) -> Result<SocketAddr> {
        if self.local_addr.is_some() {
            return Err(ListenerError::AlreadyListening);
        }
        let handle = Handle::try_current().map_err(|_| ListenerError::NoRuntime)?;
        let shared = &self.shared;
        let settings = &shared.settings;

        shared.trace.start_listen(settings);

        let listener = bind(settings).map_err(|source| ListenerError::Bind {
            addr: settings.local_addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let _ = shared.scheduler.set(BoundedScheduler::new(
            settings.max_task_concurrency,
            settings.max_task_delay,
            Arc::clone(&shared.clock),
            handle.clone(),
        ));

        self.watchdog_task = Some(shared.watchdog.start(&handle));

        for _ in 0..settings.max_accept_ops {
            let shared = Arc::clone(shared);
            let listener = Arc::clone(&listener);
            self.acceptors
                .push(handle.spawn(async move { accept_loop(shared, listener).await }));
        }

        tracing::debug!(addr = %local_addr, acceptors = settings.max_accept_ops, "listening");
        self.local_addr = Some(local_addr);
        Ok(local_addr)
    }

    /// Bound address, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn settings(&self) -> &ListenerSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> ListenerStats {
        let shared = &self.shared;
        ListenerStats {
            active_connections: shared.stats.active(),
            idle_workers: shared.worker_pool.len(),
            idle_accept_contexts: shared.accept_pool.len(),
            watched: shared.watchdog.watched_count(),
            segments_in_use: shared.arena.in_use(),
            accepted_total: shared.stats.accepted(),
            handled_total: shared.stats.handled(),
            lost_workers: shared.stats.lost_workers(),
        }
    }

    /// Stop accepting, close every connection and release all resources.
    ///
    /// Connections mid-dispatch finish their handler call first. Waits at
    /// most one connection timeout for them before draining the pools.
    pub async fn shutdown(mut self) {
        let shared = Arc::clone(&self.shared);
        shared.trace.dispose();

        shared.shutdown.cancel();
        shared.watchdog.stop();

        for task in self.acceptors.drain(..) {
            let _ = task.await;
        }
        if let Some(task) = self.watchdog_task.take() {
            let _ = task.await;
        }

        // Every permit back means every connection has returned its context.
        let all = shared.settings.max_connections as u32;
        match tokio::time::timeout(
            shared.settings.connection_timeout,
            shared.permits.acquire_many(all),
        )
        .await
        {
            Ok(Ok(permits)) => permits.forget(),
            _ => tracing::warn!("connections still open at shutdown"),
        }
        shared.permits.close();

        for ctx in shared.worker_pool.drain() {
            let (recv, send) = ctx.token.into_segments();
            shared.arena.release(recv);
            shared.arena.release(send);
        }
        shared.accept_pool.drain();

        tracing::info!(stats = %self.stats(), "listener stopped");
    }
}

impl<H: MessageHandler> Drop for SocketListener<H> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.watchdog.stop();
    }
}

fn bind(settings: &ListenerSettings) -> io::Result<TcpListener> {
    let addr = settings.local_addr;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(settings.max_pending)
}

/// Pause after an accept error that is not tied to one peer, such as
/// running out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptRetry {
    /// The peer went away mid-handshake; the next accept is unaffected.
    Now,
    After(Duration),
    /// The accept socket is unusable.
    Stop,
}

fn accept_retry(err: &io::Error) -> AcceptRetry {
    match err.kind() {
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected => AcceptRetry::Stop,
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => AcceptRetry::Now,
        _ => AcceptRetry::After(ACCEPT_BACKOFF),
    }
}

async fn accept_loop<H: MessageHandler>(shared: Arc<Shared<H>>, listener: Arc<TcpListener>) {
    loop {
        let mut ctx = shared.accept_pool.pop_or_else(AcceptContext::new);

        let acquired = tokio::select! {
            _ = shared.shutdown.cancelled() => None,
            permit = Arc::clone(&shared.permits).acquire_owned() => permit.ok(),
        };
        let Some(permit) = acquired else {
            shared.accept_pool.push(ctx);
            break;
        };

        let accepted = tokio::select! {
            _ = shared.shutdown.cancelled() => {
                shared.accept_pool.push(ctx);
                break;
            }
            res = listener.accept() => res,
        };
        ctx.stamp(shared.clock.now_millis());

        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                shared.trace.bad_accept(ctx.id(), &err);
                shared.accept_pool.push(ctx);
                drop(permit);
                match accept_retry(&err) {
                    AcceptRetry::Stop => {
                        shared.trace.disposed_listen(&err);
                        break;
                    }
                    AcceptRetry::Now => {}
                    AcceptRetry::After(pause) => {
                        tokio::select! {
                            _ = shared.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                continue;
            }
        };

        let Some(mut worker) = shared.worker_pool.pop() else {
            // The pool holds max_connections + excess contexts and we hold
            // one of max_connections permits, so this is a sizing bug.
            shared.trace.exception(&"worker pool empty");
            shared.accept_pool.push(ctx);
            continue;
        };

        worker.bind(remote, ctx.accepted_at());
        shared.accept_pool.push(ctx);
        shared.stats.record_accept();
        shared.stats.record_open();
        shared.trace.accepted(worker.id(), remote);
        shared
            .watchdog
            .add_watch(worker.id(), worker.token.heartbeat(), remote);
        if shared.shutdown.is_cancelled() {
            // Accepted while the watchdog was being stopped.
            worker.token.heartbeat().force_close(CloseReason::Shutdown);
        }

        tokio::spawn(connection::run(Arc::clone(&shared), stream, remote, worker, permit));
    }
}
