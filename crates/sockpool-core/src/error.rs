//! Listener error types.
//!
//! Only listener-level failures surface here. Per-connection failures are
//! never returned to the caller: they end in a close plus a trace call.

use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// A settings field is out of range.
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),

    /// Creating, binding or listening on the socket failed.
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The buffer arena ran out of segments while warming the worker pool.
    #[error("buffer arena exhausted after {allocated} segments")]
    ArenaExhausted { allocated: usize },

    /// `start_listen` was called outside a tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// `start_listen` was called twice.
    #[error("listener already started")]
    AlreadyListening,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ListenerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = ListenerError::InvalidSettings("max_connections must be at least 1");
        assert_eq!(
            format!("{}", e),
            "invalid settings: max_connections must be at least 1"
        );

        let e = ListenerError::ArenaExhausted { allocated: 4 };
        assert_eq!(format!("{}", e), "buffer arena exhausted after 4 segments");
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::Other, "boom");
        let e: ListenerError = io_err.into();
        assert!(matches!(e, ListenerError::Io(_)));
    }
}
