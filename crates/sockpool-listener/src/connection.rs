//! Per-connection state machine.
//!
//! One task drives each connection through
//!
//! ```text
//! Receiving → Dispatching → Sending → Receiving
//!     │            │           │
//!     └────────────┴───────────┴──→ Closing → (context back in the pool)
//! ```
//!
//! so receive, dispatch and send never overlap for one connection. Reads
//! and writes race the slot's close signal; the handler call does not, and
//! the signal is checked again once it returns.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use sockpool_core::handler::MessageHandler;
use sockpool_core::id::TokenId;
use sockpool_core::trace::{CloseInfo, CloseReason};
use sockpool_module::{Heartbeat, TaskOutcome, WorkerContext};

use crate::listener::Shared;

/// Why a phase gave up on the connection.
struct Closing {
    reason: CloseReason,
    error: Option<io::ErrorKind>,
}

impl Closing {
    fn reason(reason: CloseReason) -> Self {
        Self { reason, error: None }
    }

    fn socket(err: &io::Error) -> Self {
        Self {
            reason: CloseReason::SocketError,
            error: Some(err.kind()),
        }
    }

    /// The slot's close signal fired.
    fn signalled(heartbeat: &Heartbeat) -> Self {
        Self::reason(heartbeat.close_reason())
    }
}

type Phase = Result<(), Closing>;

/// Drive one accepted connection until it closes.
pub(crate) async fn run<H: MessageHandler>(
    shared: Arc<Shared<H>>,
    mut stream: TcpStream,
    remote: SocketAddr,
    mut worker: WorkerContext<H::State>,
    permit: OwnedSemaphorePermit,
) {
    let _ = stream.set_nodelay(true);
    let id = worker.id();
    let heartbeat = worker.token.heartbeat().clone();

    let closing = loop {
        // ── Receiving ──
        if let Err(c) = receive(&shared, &mut stream, remote, &mut worker, &heartbeat).await {
            break c;
        }

        // ── Dispatching ──
        let Some((w, dispatched)) = dispatch(&shared, remote, worker, &heartbeat).await else {
            abandon(&shared, id, remote);
            return;
        };
        worker = w;
        if let Err(c) = dispatched {
            break c;
        }

        // ── Sending ──
        if let Err(c) = send(&shared, &mut stream, remote, &mut worker, &heartbeat).await {
            break c;
        }
        if worker.token.close_after_send() {
            break Closing::reason(CloseReason::Requested);
        }
    };

    close(&shared, stream, remote, worker, permit, closing);
}

async fn receive<H: MessageHandler>(
    shared: &Shared<H>,
    stream: &mut TcpStream,
    remote: SocketAddr,
    worker: &mut WorkerContext<H::State>,
    heartbeat: &Heartbeat,
) -> Phase {
    let id = worker.id();
    let token = &mut worker.token;

    loop {
        // A full segment that still holds no complete message can only
        // overflow. Read one probe byte to tell overflow from silence.
        let overflow_probe = token.is_receive_full();
        let mut probe = [0u8; 1];

        let read = {
            let buf = if overflow_probe {
                &mut probe[..]
            } else {
                token.receive_buf()
            };
            tokio::select! {
                _ = heartbeat.force_closed() => None,
                r = stream.read(buf) => Some(r),
            }
        };

        let n = match read {
            None => return Err(Closing::signalled(heartbeat)),
            Some(Err(e)) => return Err(Closing::socket(&e)),
            Some(Ok(0)) => {
                token.set_closed_by_remote();
                return Err(Closing::reason(CloseReason::RemoteClosed));
            }
            Some(Ok(n)) => n,
        };

        if overflow_probe {
            let total = token.received() + n;
            shared
                .trace
                .received_greater_than_buffer(id, remote, token.message(), total);
            return Err(Closing::reason(CloseReason::BufferOverflow));
        }

        token.advance_received(n);
        heartbeat.touch(shared.clock.now_millis());
        shared.trace.received(id, remote, token.message());

        let (message, state) = token.message_parts();
        if shared.handler.is_message_complete(message, n, state) {
            return Ok(());
        }
    }
}

/// Run the handler on the scheduler.
///
/// Hands the context back with the response staged in its token, or with
/// the reason to close. `None` means the scheduler dropped the job unrun.
async fn dispatch<H: MessageHandler>(
    shared: &Shared<H>,
    remote: SocketAddr,
    worker: WorkerContext<H::State>,
    heartbeat: &Heartbeat,
) -> Option<(WorkerContext<H::State>, Phase)> {
    let id = worker.id();
    let Some(scheduler) = shared.scheduler.get() else {
        return Some((worker, Err(Closing::reason(CloseReason::Shutdown))));
    };

    shared.trace.queued_task(id);

    let handler = Arc::clone(&shared.handler);
    let trace = Arc::clone(&shared.trace);
    let custom = shared.settings.custom_state.clone();
    let job = scheduler.schedule(worker, move |w, waited| {
        trace.starting_task(id, waited);
        let (message, state) = w.token.message_parts();
        handler.handle_message(remote, message, custom.as_ref(), state)
    });

    let (mut worker, outcome) = job.await.ok()?;

    let response = match outcome {
        TaskOutcome::Completed(Ok(response)) => response,
        TaskOutcome::Completed(Err(err)) => {
            shared.trace.failed_task(id, &err);
            return Some((worker, Err(Closing::reason(CloseReason::HandlerFailed))));
        }
        TaskOutcome::Panicked(msg) => {
            shared.trace.failed_task(id, &msg);
            return Some((worker, Err(Closing::reason(CloseReason::HandlerFailed))));
        }
        TaskOutcome::Expired { waited } => {
            shared.trace.expired_task(id, waited);
            return Some((worker, Err(Closing::reason(CloseReason::TaskExpired))));
        }
    };

    shared.trace.completed_task(id);
    shared.stats.record_handled();

    if heartbeat.is_force_closed() {
        return Some((worker, Err(Closing::signalled(heartbeat))));
    }

    worker.token.reset();
    worker.token.set_response(response);
    Some((worker, Ok(())))
}

async fn send<H: MessageHandler>(
    shared: &Shared<H>,
    stream: &mut TcpStream,
    remote: SocketAddr,
    worker: &mut WorkerContext<H::State>,
    heartbeat: &Heartbeat,
) -> Phase {
    let id = worker.id();
    let token = &mut worker.token;

    while token.has_pending_write() {
        let written = {
            let chunk = token.stage_send();
            shared.trace.sending(id, remote, chunk.len());
            tokio::select! {
                _ = heartbeat.force_closed() => None,
                r = stream.write(chunk) => Some(r),
            }
        };

        match written {
            None => return Err(Closing::signalled(heartbeat)),
            Some(Err(e)) => return Err(Closing::socket(&e)),
            Some(Ok(0)) => {
                return Err(Closing {
                    reason: CloseReason::SocketError,
                    error: Some(io::ErrorKind::WriteZero),
                })
            }
            Some(Ok(n)) => {
                token.advance_sent(n);
                heartbeat.touch(shared.clock.now_millis());
                shared.trace.sent(id, remote, n);
            }
        }
    }
    Ok(())
}

/// Close bookkeeping for a connection whose worker context was dropped
/// together with its dispatch job.
///
/// Only happens while the runtime is shutting down its blocking pool. The
/// socket closes on drop and the permit is released by the caller; the
/// worker pool stays one context short.
pub(crate) fn abandon<H: MessageHandler>(shared: &Shared<H>, id: TokenId, remote: SocketAddr) {
    shared.trace.exception(&"dispatch task dropped by the runtime");
    let info = CloseInfo {
        told_by_handler: false,
        closed_by_remote: false,
        reason: CloseReason::Shutdown,
        error: None,
    };
    shared.trace.closing_connection(id, remote, &info);
    shared.watchdog.remove_watch(id);
    shared.stats.record_lost_worker();
    shared.stats.record_close();
}

/// Tear the connection down and recycle its slot.
///
/// Order matters: the worker context is back in its pool before the
/// permit is released, so an acceptor holding a fresh permit always finds one.
fn close<H: MessageHandler>(
    shared: &Shared<H>,
    stream: TcpStream,
    remote: SocketAddr,
    mut worker: WorkerContext<H::State>,
    permit: OwnedSemaphorePermit,
    closing: Closing,
) {
    let id = worker.id();
    let token = &mut worker.token;
    token.set_close_reason(closing.reason);

    let info = CloseInfo {
        told_by_handler: token.close_after_send(),
        closed_by_remote: token.closed_by_remote(),
        reason: token.close_reason(),
        error: closing.error,
    };
    shared.trace.closing_connection(id, remote, &info);

    shared.watchdog.remove_watch(id);

    // Errors here mean the peer is already gone.
    if let Ok(std_stream) = stream.into_std() {
        let _ = std_stream.shutdown(Shutdown::Both);
    }

    worker.release();
    if !shared.worker_pool.push(worker) {
        shared.trace.exception(&"worker pool overflow on close");
    }
    shared.stats.record_close();
    drop(permit);
}
