//! `ContextPool`: bounded free list of reusable operation contexts.
//!
//! Backed by a lock-free MPMC `ArrayQueue`, so any number of connection
//! tasks may push and pop at once without a shared lock. Capacity is fixed
//! at construction and the pool never holds more than that.
//!
//! Two pools exist per listener:
//! - the accept pool (`AcceptContext`), which falls back to building a
//!   fresh context when empty and drops overflow on push;
//! - the worker pool (`WorkerContext`), filled at warm-up and never popped
//!   empty while the connection semaphore is honoured.

use crossbeam_queue::ArrayQueue;
use std::net::SocketAddr;

use sockpool_core::handler::ConnectionState;
use sockpool_core::id::TokenId;

use crate::token::ConnectionToken;

pub struct ContextPool<T> {
    queue: ArrayQueue<T>,
}

impl<T> ContextPool<T> {
    /// Create an empty pool holding at most `capacity` contexts.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    /// Return a context to the pool.
    ///
    /// Returns `false` if the pool was full and the context was dropped.
    pub fn push(&self, item: T) -> bool {
        self.queue.push(item).is_ok()
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pop a context, or build one with `make` when the pool is empty.
    pub fn pop_or_else(&self, make: impl FnOnce() -> T) -> T {
        self.queue.pop().unwrap_or_else(make)
    }

    /// Remove every pooled context.
    pub fn drain(&self) -> Vec<T> {
        std::iter::from_fn(|| self.queue.pop()).collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// State carried by one pending accept.
#[derive(Debug, Clone, Copy)]
pub struct AcceptContext {
    id: TokenId,
    /// Clock reading when the accept completed.
    accepted_at: u64,
}

impl AcceptContext {
    pub fn new() -> Self {
        Self {
            id: TokenId::next(),
            accepted_at: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> TokenId {
        self.id
    }

    #[inline]
    pub fn accepted_at(&self) -> u64 {
        self.accepted_at
    }

    #[inline]
    pub fn stamp(&mut self, now_ms: u64) {
        self.accepted_at = now_ms;
    }
}

impl Default for AcceptContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A connection slot: the token plus the peer it is currently serving.
#[derive(Debug)]
pub struct WorkerContext<S> {
    pub token: ConnectionToken<S>,
    remote: Option<SocketAddr>,
}

impl<S: ConnectionState> WorkerContext<S> {
    pub fn new(token: ConnectionToken<S>) -> Self {
        Self {
            token,
            remote: None,
        }
    }

    /// Prepare the slot for a freshly accepted connection.
    ///
    /// Starts a new heartbeat epoch, stamps it with the accept time and
    /// clears everything the previous connection left behind.
    pub fn bind(&mut self, remote: SocketAddr, accepted_at: u64) {
        self.remote = Some(remote);
        self.token.heartbeat().rearm();
        self.token.heartbeat().touch(accepted_at);
        self.token.reset();
        self.token.reset_custom_state();
    }

    /// Forget the peer and clear the token ahead of pooling.
    pub fn release(&mut self) {
        self.remote = None;
        self.token.reset();
    }

    #[inline]
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote
    }

    #[inline]
    pub fn id(&self) -> TokenId {
        self.token.id()
    }
}
