//! Connection token identifier type

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TOKEN_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identifier for a connection token.
///
/// Assigned once when the token is constructed and kept for the token's
/// whole life, across every connection it serves. It has no relation to
/// the socket the token happens to be bound to.
/// The maximum value (u64::MAX) is reserved as a sentinel for "no token".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct TokenId(u64);

impl TokenId {
    /// Sentinel value indicating no token
    pub const NONE: TokenId = TokenId(u64::MAX);

    /// Allocate a fresh, process-unique id.
    #[inline]
    pub fn next() -> Self {
        TokenId(NEXT_TOKEN_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a TokenId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        TokenId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u64::MAX
    }
}

impl From<TokenId> for u64 {
    #[inline]
    fn from(id: TokenId) -> Self {
        id.0
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "TokenId(NONE)")
        } else {
            write!(f, "TokenId({})", self.0)
        }
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for TokenId {
    fn default() -> Self {
        TokenId::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_ids_unique() {
        let a = TokenId::next();
        let b = TokenId::next();
        assert_ne!(a, b);
        assert!(!a.is_none());
    }

    #[test]
    fn test_token_id_none() {
        assert!(TokenId::NONE.is_none());
        assert_eq!(TokenId::default(), TokenId::NONE);
        assert_eq!(format!("{}", TokenId::NONE), "none");
        assert_eq!(format!("{:?}", TokenId::new(3)), "TokenId(3)");
    }
}
