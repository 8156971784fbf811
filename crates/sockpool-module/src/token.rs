//! Connection tokens
//!
//! A `ConnectionToken` is the per-slot state a worker context carries from
//! one connection to the next: its two arena segments, the receive and send
//! cursors, the close flags and the handler's protocol state. Tokens are
//! built once at warm-up and recycled with `reset()`.
//!
//! The `Heartbeat` is the only part of a token shared outside the task
//! driving the connection. The watchdog reads its activity stamp and trips
//! its close signal; the connection task observes the signal at its next
//! await point.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use sockpool_core::handler::{ConnectionState, MessageResponse};
use sockpool_core::id::TokenId;
use sockpool_core::trace::CloseReason;

use crate::arena::Segment;

// Close word layout: epoch in the upper 56 bits, close reason in the low 8.
// A reason of 0 means "not closed".
const REASON_BITS: u32 = 8;
const REASON_MASK: u64 = (1 << REASON_BITS) - 1;

/// Activity stamp and out-of-band close signal for one connection slot.
///
/// Clones share state. Every `rearm()` starts a new epoch so that a close
/// aimed at a previous connection in the same slot is ignored.
#[derive(Clone, Default)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

#[derive(Default)]
struct HeartbeatInner {
    last_talked: AtomicU64,
    close: AtomicU64,
    notify: Notify,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity at `now_ms`.
    #[inline]
    pub fn touch(&self, now_ms: u64) {
        self.inner.last_talked.store(now_ms, Ordering::Release);
    }

    /// Timestamp of the last recorded activity.
    #[inline]
    pub fn last_talked(&self) -> u64 {
        self.inner.last_talked.load(Ordering::Acquire)
    }

    /// Current epoch. Bumped by every `rearm()`.
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.inner.close.load(Ordering::Acquire) >> REASON_BITS
    }

    /// Trip the close signal for whatever connection currently holds the slot.
    ///
    /// Returns `false` if it was already tripped.
    pub fn force_close(&self, reason: CloseReason) -> bool {
        self.force_close_epoch(self.epoch(), reason)
    }

    /// Trip the close signal only if the slot is still in `epoch`.
    pub fn force_close_epoch(&self, epoch: u64, reason: CloseReason) -> bool {
        let armed = epoch << REASON_BITS;
        let code = match reason {
            CloseReason::None => CloseReason::Requested as u64,
            r => r as u64,
        };
        let tripped = self
            .inner
            .close
            .compare_exchange(armed, armed | code, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if tripped {
            self.inner.notify.notify_waiters();
        }
        tripped
    }

    #[inline]
    pub fn is_force_closed(&self) -> bool {
        self.inner.close.load(Ordering::Acquire) & REASON_MASK != 0
    }

    /// Reason passed to the `force_close` that tripped the signal.
    pub fn close_reason(&self) -> CloseReason {
        CloseReason::from_u8((self.inner.close.load(Ordering::Acquire) & REASON_MASK) as u8)
    }

    /// Resolve once the close signal is tripped.
    pub async fn force_closed(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_force_closed() {
                return;
            }
            notified.await;
        }
    }

    /// Clear the close signal and start a new epoch.
    pub fn rearm(&self) {
        let _ = self
            .inner
            .close
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                Some(((word >> REASON_BITS) + 1) << REASON_BITS)
            });
    }
}

impl fmt::Debug for Heartbeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heartbeat")
            .field("last_talked", &self.last_talked())
            .field("epoch", &self.epoch())
            .field("closed", &self.close_reason())
            .finish()
    }
}

/// Stable identity of a connection slot.
#[derive(Debug, Clone)]
pub struct IdentityToken {
    id: TokenId,
    heartbeat: Heartbeat,
}

impl IdentityToken {
    /// Mint a fresh identity.
    pub fn new() -> Self {
        Self {
            id: TokenId::next(),
            heartbeat: Heartbeat::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> TokenId {
        self.id
    }

    #[inline]
    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }
}

impl Default for IdentityToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-slot connection state.
pub struct ConnectionToken<S> {
    identity: IdentityToken,

    recv: Segment,
    /// Bytes accumulated in `recv` since the last dispatch.
    received: usize,

    send: Segment,
    /// Response being written. Owned by the token until fully sent.
    write_data: Option<Vec<u8>>,
    bytes_sent: usize,

    close_after_send: bool,
    closed_by_remote: bool,
    close_reason: CloseReason,

    state: S,
}

impl<S: ConnectionState> ConnectionToken<S> {
    /// Bind a token to its two segments for life.
    pub fn new(identity: IdentityToken, recv: Segment, send: Segment) -> Self {
        Self {
            identity,
            recv,
            received: 0,
            send,
            write_data: None,
            bytes_sent: 0,
            close_after_send: false,
            closed_by_remote: false,
            close_reason: CloseReason::None,
            state: S::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> TokenId {
        self.identity.id()
    }

    #[inline]
    pub fn identity(&self) -> &IdentityToken {
        &self.identity
    }

    #[inline]
    pub fn heartbeat(&self) -> &Heartbeat {
        self.identity.heartbeat()
    }

    // -- receive side --

    /// Segment size; the largest message this token accepts.
    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.recv.capacity()
    }

    #[inline]
    pub fn received(&self) -> usize {
        self.received
    }

    /// Arena offset the next receive writes to.
    #[inline]
    pub fn receive_next_pos(&self) -> usize {
        self.recv.offset() + self.received
    }

    /// No room left in the receive segment.
    #[inline]
    pub fn is_receive_full(&self) -> bool {
        self.received >= self.recv.capacity()
    }

    /// Unfilled tail of the receive segment.
    #[inline]
    pub fn receive_buf(&mut self) -> &mut [u8] {
        let at = self.received;
        &mut self.recv[at..]
    }

    /// Account for `n` bytes written into `receive_buf()`.
    #[inline]
    pub fn advance_received(&mut self, n: usize) {
        self.received = (self.received + n).min(self.recv.capacity());
    }

    /// Everything received since the last dispatch.
    #[inline]
    pub fn message(&self) -> &[u8] {
        &self.recv[..self.received]
    }

    /// The accumulated message alongside the protocol state, borrowed together.
    #[inline]
    pub fn message_parts(&mut self) -> (&[u8], &mut S) {
        (&self.recv[..self.received], &mut self.state)
    }

    // -- send side --

    /// Take ownership of a handler's response.
    pub fn set_response(&mut self, response: MessageResponse) {
        self.write_data = response.to_send.filter(|d| !d.is_empty());
        self.bytes_sent = 0;
        self.close_after_send = response.disconnect_once_done;
    }

    #[inline]
    pub fn has_pending_write(&self) -> bool {
        self.write_remaining() > 0
    }

    /// Bytes of the response not yet written.
    #[inline]
    pub fn write_remaining(&self) -> usize {
        self.write_data
            .as_ref()
            .map_or(0, |d| d.len().saturating_sub(self.bytes_sent))
    }

    #[inline]
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    /// Copy the next chunk of the response into the send segment.
    ///
    /// Returns the chunk, at most one segment long.
    pub fn stage_send(&mut self) -> &[u8] {
        let Some(data) = self.write_data.as_ref() else {
            return &[];
        };
        let start = self.bytes_sent.min(data.len());
        let len = (data.len() - start).min(self.send.capacity());
        self.send[..len].copy_from_slice(&data[start..start + len]);
        &self.send[..len]
    }

    /// Account for `n` bytes written to the socket.
    pub fn advance_sent(&mut self, n: usize) {
        self.bytes_sent += n;
        if self.write_remaining() == 0 {
            self.write_data = None;
            self.bytes_sent = 0;
        }
    }

    // -- control flags --

    #[inline]
    pub fn close_after_send(&self) -> bool {
        self.close_after_send
    }

    #[inline]
    pub fn closed_by_remote(&self) -> bool {
        self.closed_by_remote
    }

    pub fn set_closed_by_remote(&mut self) {
        self.closed_by_remote = true;
    }

    #[inline]
    pub fn close_reason(&self) -> CloseReason {
        self.close_reason
    }

    /// Record why the connection is closing. The first reason sticks.
    pub fn set_close_reason(&mut self, reason: CloseReason) {
        if self.close_reason == CloseReason::None {
            self.close_reason = reason;
        }
    }

    #[inline]
    pub fn state(&self) -> &S {
        &self.state
    }

    #[inline]
    pub fn state_mut(&mut self) -> &mut S {
        &mut self.state
    }

    // -- recycling --

    /// Zero counters and flags and drop any pending response.
    ///
    /// Segments and protocol state are kept. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.received = 0;
        self.write_data = None;
        self.bytes_sent = 0;
        self.close_after_send = false;
        self.closed_by_remote = false;
        self.close_reason = CloseReason::None;
    }

    /// Return the protocol state to its fresh value.
    pub fn reset_custom_state(&mut self) {
        self.state.reset();
    }

    /// Tear the token down, handing its segments back.
    pub fn into_segments(self) -> (Segment, Segment) {
        (self.recv, self.send)
    }
}

impl<S> fmt::Debug for ConnectionToken<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionToken")
            .field("id", &self.identity.id())
            .field("recv_offset", &self.recv.offset())
            .field("received", &self.received)
            .field("send_offset", &self.send.offset())
            .field("bytes_sent", &self.bytes_sent)
            .field("close_after_send", &self.close_after_send)
            .field("closed_by_remote", &self.closed_by_remote)
            .field("close_reason", &self.close_reason)
            .finish()
    }
}
