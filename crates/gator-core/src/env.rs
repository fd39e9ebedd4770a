//! `GATOR_*` environment overrides
//!
//! Unset or unparsable variables fall back to the caller's default.
//!
//! ```ignore
//! use gator_core::env::{env_get, env_get_bool};
//!
//! let hz: u32 = env_get("GATOR_TICK_HZ", 1000);
//! let pin: bool = env_get_bool("GATOR_PIN_THREADS", true);
//! ```

use std::str::FromStr;

/// `key` parsed as `T`, else `default`
#[inline]
pub fn env_get<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env_get_opt(key).unwrap_or(default)
}

/// Switch-style variable: `1`, `true`, `yes` or `on` in any case is
/// true, anything else false. Unset gives `default`.
#[inline]
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key).map_or(default, |raw| {
        ["1", "true", "yes", "on"].contains(&raw.trim().to_ascii_lowercase().as_str())
    })
}

/// `Some(T)` if the variable is set and parses
#[inline]
pub fn env_get_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Raw value of `key`, else `default`
#[inline]
pub fn env_get_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.into())
}
