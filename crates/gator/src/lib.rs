//! # gator - per-core trace collector
//!
//! Samples every core on a timer tick, writes backtraces, counters and
//! names into per-core ring buffers, and hands committed frames to a
//! single consumer.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use gator::{Caller, CancellationToken, Collector, ControlSurface, Endpoint, GatorConfig};
//!
//! let collector = Collector::builder(GatorConfig::from_env())
//!     .interrupts(platform)
//!     .source(counters)
//!     .build()?;
//! let control = ControlSurface::new(Arc::new(collector));
//!
//! let buffer = control.open_buffer(Caller::current())?;
//! control.write(Caller::current(), Endpoint::Enable, 0, b"1\n")?;
//!
//! let mut bytes = vec![0u8; buffer.transfer_unit()];
//! let cancel = CancellationToken::new();
//! while let n @ 1.. = buffer.read(&mut bytes, &cancel)? {
//!     for frame in gator::FrameReader::new(&bytes[..n], true) {
//!         // ...
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  gator-core-0 .. gator-core-N        (one producer thread per core)
//!        │  tick: sample, backtrace, counters
//!        ▼
//!  ChannelStore: core × channel rings  ── commit ──▶ DeferredWake
//!        │                                                │
//!        ▼                                                ▼
//!  Collector::blocking_read  ◀──────────── gator-wake thread
//! ```

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

// Re-export core types
pub use gator_core::{
    constants,
    pack,
    CancellationToken,
    ChannelKind,
    ConfigEntry,
    ConfigError,
    CookieResolver,
    CoreId,
    DataSource,
    EntryAccess,
    EventSink,
    ExecMode,
    Frame,
    FrameParseError,
    FrameReader,
    FrameTail,
    FrameType,
    GatorError,
    GatorResult,
    InterruptFrame,
    InterruptSource,
    KernelUnwinder,
    NameSink,
    NullCookies,
    Registers,
    SourceError,
    TaskId,
    UsageError,
    UserMemory,
};

// Re-export env utilities
pub use gator_core::{env_get, env_get_bool, env_get_opt, env_get_str};

// Re-export runtime types
pub use gator_runtime::{
    to_errno,
    BufferHandle,
    Caller,
    Collector,
    CollectorBuilder,
    ControlSurface,
    CoreWriter,
    CpuEvent,
    Endpoint,
    GatorConfig,
    Phase,
    PmEvent,
};

/// Level named by `GATOR_LOG_LEVEL`, or `None` for `off`
fn log_level(name: &str) -> Option<Level> {
    match name.trim().to_lowercase().as_str() {
        "off" => None,
        "error" => Some(Level::ERROR),
        "warn" => Some(Level::WARN),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => Some(Level::INFO),
    }
}

/// Install a global fmt subscriber at the level given by `GATOR_LOG_LEVEL`
/// (default `info`)
pub fn init_logging() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
    let Some(level) = log_level(&env_get_str("GATOR_LOG_LEVEL", "info")) else {
        return Ok(());
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_thread_names(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_names() {
        assert_eq!(log_level("off"), None);
        assert_eq!(log_level("WARN"), Some(Level::WARN));
        assert_eq!(log_level("trace\n"), Some(Level::TRACE));
        assert_eq!(log_level("bogus"), Some(Level::INFO));
    }
}
