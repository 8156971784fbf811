//! Environment variable utilities
//!
//! Typed lookups used by [`ListenerSettings::from_env`](crate::settings::ListenerSettings::from_env).
//!
//! # Usage
//!
//! ```ignore
//! use sockpool_core::env::{env_get, env_get_millis};
//!
//! let conns: usize = env_get("SOCKPOOL_MAX_CONNS", 1024);
//! let timeout = env_get_millis("SOCKPOOL_TIMEOUT_MS", 30_000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Get environment variable parsed as type T, or return default
///
/// Unset and unparsable values both fall back to `default`.
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Get environment variable as optional value
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Get a millisecond count as a `Duration`
#[inline]
pub fn env_get_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__SOCKPOOL_TEST_UNSET__", 42);
        assert_eq!(val, 42);
    }

    #[test]
    fn test_env_get_opt_none() {
        let val: Option<u16> = env_get_opt("__SOCKPOOL_TEST_UNSET__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__SOCKPOOL_TEST_CONNS__", " 123 ");
        let val: usize = env_get("__SOCKPOOL_TEST_CONNS__", 0);
        assert_eq!(val, 123);
        std::env::remove_var("__SOCKPOOL_TEST_CONNS__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__SOCKPOOL_TEST_INVALID__", "not_a_number");
        let val: usize = env_get("__SOCKPOOL_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__SOCKPOOL_TEST_INVALID__");
    }

    #[test]
    fn test_env_get_millis() {
        std::env::set_var("__SOCKPOOL_TEST_MS__", "250");
        assert_eq!(
            env_get_millis("__SOCKPOOL_TEST_MS__", 1),
            Duration::from_millis(250)
        );
        std::env::remove_var("__SOCKPOOL_TEST_MS__");
        assert_eq!(
            env_get_millis("__SOCKPOOL_TEST_MS__", 1),
            Duration::from_millis(1)
        );
    }
}
