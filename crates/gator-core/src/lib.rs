//! # gator-core
//!
//! Core types and traits for the gator per-core trace collector.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Buffers, threads and the lifecycle live in `gator-runtime`.
//!
//! ## Modules
//!
//! - `id` - Core and task identifier types
//! - `channel` - Channel kinds and wire frame types
//! - `pack` - Packed (7-bit group) integer codec
//! - `frame` - Host-side frame parser
//! - `error` - Error taxonomy
//! - `traits` - Collaborator interfaces (cookies, data sources, unwinders)
//! - `cancel` - Cancellation token for blocking reads
//! - `env` - Environment variable utilities

pub mod id;
pub mod channel;
pub mod pack;
pub mod frame;
pub mod error;
pub mod traits;
pub mod cancel;
pub mod env;

// Re-exports for convenience
pub use id::{CoreId, TaskId};
pub use channel::{ChannelKind, FrameType, NUM_CHANNELS};
pub use frame::{Frame, FrameParseError, FrameReader};
pub use error::{ConfigError, GatorError, GatorResult, SourceError, UsageError};
pub use traits::{
    ConfigEntry, CookieResolver, DataSource, EntryAccess, EventSink, ExecMode, FrameTail,
    InterruptFrame, InterruptSource, KernelUnwinder, NameSink, NullCookies, Registers, UserMemory,
};
pub use cancel::CancellationToken;
pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};

/// Wire protocol constants
pub mod constants {
    /// Protocol version reported through the control surface
    pub const PROTOCOL_VERSION: u64 = 12;

    /// Worst-case encoded size of a packed 32-bit value
    pub const MAXSIZE_PACK32: usize = 5;

    /// Worst-case encoded size of a packed 64-bit value
    pub const MAXSIZE_PACK64: usize = 10;

    /// Size of the backpatched frame length field
    pub const FRAME_LENGTH_SIZE: usize = 4;

    /// Address could not be attributed to any image
    pub const NO_COOKIE: u32 = 0;

    /// Image lookup failed
    pub const INVALID_COOKIE: u32 = !0;

    /// Backtrace channel: end of one sample
    pub const MESSAGE_END_BACKTRACE: u32 = 1;

    /// Name channel: cookie -> image path
    pub const MESSAGE_COOKIE: u32 = 1;
    /// Name channel: pid -> thread name
    pub const MESSAGE_THREAD_NAME: u32 = 2;
    /// Name channel: core -> core name
    pub const MESSAGE_CORE_NAME: u32 = 3;

    /// GPU channel: unit started a job
    pub const MESSAGE_GPU_START: u32 = 1;
    /// GPU channel: unit finished a job
    pub const MESSAGE_GPU_STOP: u32 = 2;

    /// Scheduler channel: context switch
    pub const MESSAGE_SCHED_SWITCH: u32 = 1;
    /// Scheduler channel: task exit
    pub const MESSAGE_SCHED_EXIT: u32 = 2;

    /// Block-counter key reserved for the event timestamp
    pub const EVENT_KEY_TIMESTAMP: u32 = 0;

    /// Maximum number of cores a collector will manage
    pub const MAX_CORES: usize = 256;

    /// Deepest user stack walk a sample may request
    pub const MAX_BACKTRACE_DEPTH: u32 = 1024;
}
