//! Listener configuration

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::env::{env_get, env_get_millis};
use crate::error::{ListenerError, Result};
use crate::handler::CustomState;

/// Send + receive: every worker token owns one segment of each.
pub const OPERATION_KINDS: usize = 2;

/// Configuration snapshot for a listener.
///
/// Every field is supplied by the caller. The listener copies the settings
/// at construction and never mutates them.
#[derive(Clone)]
pub struct ListenerSettings {
    /// Address to bind.
    pub local_addr: SocketAddr,

    /// Maximum number of connections serviced at once.
    pub max_connections: usize,

    /// Listen backlog: connections the OS may queue while we are at capacity.
    pub max_pending: u32,

    /// Accept operations kept in flight at once (size of the accept pool).
    pub max_accept_ops: usize,

    /// Bytes per arena segment. A request must fit in one segment;
    /// responses may be larger and are sent in segment-sized chunks.
    pub buffer_size: usize,

    /// Spare worker contexts beyond `max_connections`.
    pub excess_handlers: usize,

    /// Idle time after which the watchdog closes a connection.
    pub connection_timeout: Duration,

    /// Pause between watchdog sweeps.
    pub watchdog_interval: Duration,

    /// Message handlers running at once.
    pub max_task_concurrency: usize,

    /// How long a dispatch task may wait in the queue before it is dropped.
    pub max_task_delay: Duration,

    /// Passed through to every `handle_message` call.
    pub custom_state: Option<CustomState>,
}

impl ListenerSettings {
    /// Build settings from `SOCKPOOL_*` environment variables.
    ///
    /// | Variable                   | Fallback        |
    /// |----------------------------|-----------------|
    /// | `SOCKPOOL_ADDR`            | `0.0.0.0:8080`  |
    /// | `SOCKPOOL_MAX_CONNS`       | 1024            |
    /// | `SOCKPOOL_MAX_PENDING`     | 1024            |
    /// | `SOCKPOOL_ACCEPT_OPS`      | 4               |
    /// | `SOCKPOOL_BUFFER_SIZE`     | 4096            |
    /// | `SOCKPOOL_EXCESS_HANDLERS` | 16              |
    /// | `SOCKPOOL_TIMEOUT_MS`      | 30000           |
    /// | `SOCKPOOL_WATCHDOG_MS`     | 1000            |
    /// | `SOCKPOOL_TASKS`           | available CPUs  |
    /// | `SOCKPOOL_TASK_DELAY_MS`   | 3000            |
    pub fn from_env() -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);

        Self {
            local_addr: env_get(
                "SOCKPOOL_ADDR",
                SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            ),
            max_connections: env_get("SOCKPOOL_MAX_CONNS", 1024),
            max_pending: env_get("SOCKPOOL_MAX_PENDING", 1024),
            max_accept_ops: env_get("SOCKPOOL_ACCEPT_OPS", 4),
            buffer_size: env_get("SOCKPOOL_BUFFER_SIZE", 4096),
            excess_handlers: env_get("SOCKPOOL_EXCESS_HANDLERS", 16),
            connection_timeout: env_get_millis("SOCKPOOL_TIMEOUT_MS", 30_000),
            watchdog_interval: env_get_millis("SOCKPOOL_WATCHDOG_MS", 1_000),
            max_task_concurrency: env_get("SOCKPOOL_TASKS", num_cpus),
            max_task_delay: env_get_millis("SOCKPOOL_TASK_DELAY_MS", 3_000),
            custom_state: None,
        }
    }

    /// Set the bind address
    pub fn local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = addr;
        self
    }

    /// Set maximum simultaneous connections
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = n;
        self
    }

    /// Set the segment size
    pub fn buffer_size(mut self, n: usize) -> Self {
        self.buffer_size = n;
        self
    }

    /// Set the idle timeout
    pub fn connection_timeout(mut self, d: Duration) -> Self {
        self.connection_timeout = d;
        self
    }

    /// Set the watchdog poll interval
    pub fn watchdog_interval(mut self, d: Duration) -> Self {
        self.watchdog_interval = d;
        self
    }

    /// Attach opaque state for the handler
    pub fn custom_state(mut self, state: CustomState) -> Self {
        self.custom_state = Some(state);
        self
    }

    /// Worker contexts to pre-allocate.
    #[inline]
    pub fn worker_pool_size(&self) -> usize {
        self.max_connections + self.excess_handlers
    }

    #[inline]
    pub fn operation_kinds(&self) -> usize {
        OPERATION_KINDS
    }

    /// Total bytes of the buffer arena.
    #[inline]
    pub fn arena_bytes(&self) -> usize {
        self.buffer_size * self.worker_pool_size() * OPERATION_KINDS
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ListenerError::InvalidSettings(
                "max_connections must be at least 1",
            ));
        }
        if self.max_pending == 0 {
            return Err(ListenerError::InvalidSettings("max_pending must be at least 1"));
        }
        if self.max_accept_ops == 0 {
            return Err(ListenerError::InvalidSettings(
                "max_accept_ops must be at least 1",
            ));
        }
        if self.buffer_size == 0 {
            return Err(ListenerError::InvalidSettings("buffer_size must be at least 1"));
        }
        if self.max_task_concurrency == 0 {
            return Err(ListenerError::InvalidSettings(
                "max_task_concurrency must be at least 1",
            ));
        }
        if self.connection_timeout.is_zero() {
            return Err(ListenerError::InvalidSettings(
                "connection_timeout must be non-zero",
            ));
        }
        if self.watchdog_interval.is_zero() {
            return Err(ListenerError::InvalidSettings(
                "watchdog_interval must be non-zero",
            ));
        }
        self.buffer_size
            .checked_mul(self.worker_pool_size())
            .and_then(|n| n.checked_mul(OPERATION_KINDS))
            .ok_or(ListenerError::InvalidSettings("arena size overflows usize"))?;
        Ok(())
    }
}

impl fmt::Debug for ListenerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSettings")
            .field("local_addr", &self.local_addr)
            .field("max_connections", &self.max_connections)
            .field("max_pending", &self.max_pending)
            .field("max_accept_ops", &self.max_accept_ops)
            .field("buffer_size", &self.buffer_size)
            .field("excess_handlers", &self.excess_handlers)
            .field("connection_timeout", &self.connection_timeout)
            .field("watchdog_interval", &self.watchdog_interval)
            .field("max_task_concurrency", &self.max_task_concurrency)
            .field("max_task_delay", &self.max_task_delay)
            .field("custom_state", &self.custom_state.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ListenerSettings {
        ListenerSettings {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 10,
            max_pending: 100,
            max_accept_ops: 2,
            buffer_size: 4096,
            excess_handlers: 5,
            connection_timeout: Duration::from_secs(100),
            watchdog_interval: Duration::from_secs(10),
            max_task_concurrency: 10,
            max_task_delay: Duration::from_secs(3),
            custom_state: None,
        }
    }

    #[test]
    fn test_derived_sizes() {
        let s = sample();
        assert_eq!(s.worker_pool_size(), 15);
        assert_eq!(s.operation_kinds(), 2);
        assert_eq!(s.arena_bytes(), 4096 * 15 * 2);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero() {
        let s = sample().max_connections(0);
        assert!(matches!(s.validate(), Err(ListenerError::InvalidSettings(_))));

        let s = sample().buffer_size(0);
        assert!(s.validate().is_err());

        let s = sample().watchdog_interval(Duration::ZERO);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_from_env_reads_overrides() {
        std::env::set_var("SOCKPOOL_MAX_CONNS", "7");
        std::env::set_var("SOCKPOOL_TIMEOUT_MS", "1500");
        let s = ListenerSettings::from_env();
        assert_eq!(s.max_connections, 7);
        assert_eq!(s.connection_timeout, Duration::from_millis(1500));
        assert!(s.validate().is_ok());
        std::env::remove_var("SOCKPOOL_MAX_CONNS");
        std::env::remove_var("SOCKPOOL_TIMEOUT_MS");
    }

    #[test]
    fn test_debug_hides_custom_state() {
        let s = sample().custom_state(std::sync::Arc::new("secret"));
        let dbg = format!("{:?}", s);
        assert!(dbg.contains("custom_state: true"));
        assert!(!dbg.contains("secret"));
    }
}
