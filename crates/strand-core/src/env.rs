//! Environment variable utilities
//!
//! Every runtime knob can be overridden at run time through a `STRAND_*`
//! variable; these helpers parse them with a fallback default.
//!
//! ```ignore
//! use strand_core::env::{env_get, env_get_bool, env_get_ms};
//!
//! let threads: usize = env_get("STRAND_NUM_THREADS", 1);
//! let caller = env_get_bool("STRAND_USE_CALLER", true);
//! let wait = env_get_ms("STRAND_MAX_WAIT_MS", 3000);
//! ```

use std::str::FromStr;
use std::time::Duration;

/// Parse `key` as `T`, or return `default` when unset or unparsable
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Parse `key` as `T`, `None` when unset or unparsable
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Boolean flag: "1", "true", "yes", "on" are true; "0", "false", "no",
/// "off" are false; anything else keeps the default.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Milliseconds value as a `Duration`
#[inline]
pub fn env_get_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_get(key, default_ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        let val: usize = env_get("__STRAND_TEST_UNSET__", 42);
        assert_eq!(val, 42);
        let val: Option<usize> = env_get_opt("__STRAND_TEST_UNSET__");
        assert!(val.is_none());
    }

    #[test]
    fn test_env_get_with_set_var() {
        std::env::set_var("__STRAND_TEST_NUM__", " 123 ");
        let val: usize = env_get("__STRAND_TEST_NUM__", 0);
        assert_eq!(val, 123);
        assert_eq!(env_get_ms("__STRAND_TEST_NUM__", 5), Duration::from_millis(123));
        std::env::remove_var("__STRAND_TEST_NUM__");
    }

    #[test]
    fn test_env_get_bool_variants() {
        std::env::set_var("__STRAND_TEST_BOOL__", "ON");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", false));

        std::env::set_var("__STRAND_TEST_BOOL__", "no");
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", true));

        std::env::set_var("__STRAND_TEST_BOOL__", "garbage");
        assert!(env_get_bool("__STRAND_TEST_BOOL__", true));
        assert!(!env_get_bool("__STRAND_TEST_BOOL__", false));

        std::env::remove_var("__STRAND_TEST_BOOL__");
    }

    #[test]
    fn test_env_get_invalid_parse() {
        std::env::set_var("__STRAND_TEST_INVALID__", "not_a_number");
        let val: u64 = env_get("__STRAND_TEST_INVALID__", 99);
        assert_eq!(val, 99);
        std::env::remove_var("__STRAND_TEST_INVALID__");
    }
}
