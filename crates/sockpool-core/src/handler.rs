//! Message handler abstraction.
//!
//! A `MessageHandler` owns everything protocol-specific: where a message
//! ends and what to answer. The listener owns the bytes; the handler only
//! ever sees borrowed views of a connection's receive segment.
//!
//! **Contract:**
//! - `is_message_complete()` is called after every receive with the whole
//!   accumulated message so far. It must be idempotent: the listener may
//!   ask again with a longer message.
//! - `handle_message()` runs on a scheduler thread, never on the I/O path.
//!   It may fail; an error closes that one connection and nothing else.
//! - `ConnectionState::reset()` is called every time a token is recycled
//!   for a new connection.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

/// Error type handlers report failures with.
///
/// Boxed so handlers are free to use `anyhow` or their own error enums.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Opaque state the listener's owner hands down to every `handle_message` call.
pub type CustomState = Arc<dyn Any + Send + Sync>;

/// Per-connection protocol state.
///
/// Constructed once per connection token (via `Default`) and reused for
/// every connection that token serves.
pub trait ConnectionState: Default + Send + 'static {
    /// Return to the freshly constructed state.
    fn reset(&mut self);
}

impl ConnectionState for () {
    fn reset(&mut self) {}
}

/// What a handler wants done after a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageResponse {
    /// Bytes to write back, if any.
    pub to_send: Option<Vec<u8>>,
    /// Close the connection once `to_send` is fully written
    /// (or straight away when there is nothing to send).
    pub disconnect_once_done: bool,
}

impl MessageResponse {
    /// Send `bytes` and keep the connection open for the next message.
    pub fn reply(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            to_send: Some(bytes.into()),
            disconnect_once_done: false,
        }
    }

    /// Send `bytes`, then close.
    pub fn reply_and_close(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            to_send: Some(bytes.into()),
            disconnect_once_done: true,
        }
    }

    /// Send nothing and wait for the next message.
    pub fn silent() -> Self {
        Self::default()
    }

    /// Send nothing and close.
    pub fn close() -> Self {
        Self {
            to_send: None,
            disconnect_once_done: true,
        }
    }
}

/// Protocol framing and business logic, supplied by the caller.
pub trait MessageHandler: Send + Sync + 'static {
    /// Per-connection state type.
    type State: ConnectionState;

    /// Is `message` (everything received since the last dispatch) a
    /// complete request?
    ///
    /// `new_len` is how many of the trailing bytes arrived in the receive
    /// that triggered this check.
    fn is_message_complete(&self, message: &[u8], new_len: usize, state: &mut Self::State) -> bool;

    /// Process a complete message and produce the response.
    fn handle_message(
        &self,
        remote: SocketAddr,
        message: &[u8],
        custom: Option<&CustomState>,
        state: &mut Self::State,
    ) -> Result<MessageResponse, BoxError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_constructors() {
        let r = MessageResponse::reply(b"ok".to_vec());
        assert_eq!(r.to_send.as_deref(), Some(&b"ok"[..]));
        assert!(!r.disconnect_once_done);

        let r = MessageResponse::reply_and_close("bye");
        assert_eq!(r.to_send.as_deref(), Some(&b"bye"[..]));
        assert!(r.disconnect_once_done);

        assert_eq!(MessageResponse::silent(), MessageResponse::default());
        assert!(MessageResponse::close().to_send.is_none());
        assert!(MessageResponse::close().disconnect_once_done);
    }

    #[test]
    fn test_custom_state_downcast() {
        let custom: CustomState = Arc::new(42u32);
        assert_eq!(custom.downcast_ref::<u32>(), Some(&42));
    }
}
