//! Error types for the trace collector
//!
//! Producer-side failures (a write rejected for lack of space) are never
//! errors: they degrade into the in-band overflow condition. Everything
//! here is returned synchronously from setup, start, the control surface
//! or the consumer's blocking read.

use thiserror::Error;

use crate::channel::ChannelKind;

/// Result type for collector operations
pub type GatorResult<T> = Result<T, GatorError>;

/// Errors surfaced by the collector
#[derive(Debug, Error)]
pub enum GatorError {
    /// Bad capacity or parameter, rejected before anything is applied
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Channel storage could not be allocated
    #[error("failed to allocate {bytes} bytes for the {channel} channel of core {core}")]
    Allocation {
        core: u32,
        channel: ChannelKind,
        bytes: usize,
    },

    /// A start stage failed and everything before it was rolled back
    #[error("start failed at {stage}: {reason}")]
    StartFailure { stage: String, reason: String },

    /// Caller broke an interface contract
    #[error("usage error: {0}")]
    Usage(#[from] UsageError),

    /// Unprivileged access to the control or data endpoints
    #[error("permission denied")]
    PermissionDenied,

    /// Operation not allowed in the current lifecycle state
    #[error("busy: {0}")]
    Busy(&'static str),

    /// Blocking read cancelled by the caller
    #[error("read interrupted")]
    Interrupted,

    /// Storage disappeared under a pending read
    #[error("buffer for the {channel} channel of core {core} was released")]
    BufferReleased { core: u32, channel: ChannelKind },
}

impl GatorError {
    /// Shorthand for a failed start stage
    pub fn start_failure(stage: impl Into<String>, reason: impl ToString) -> Self {
        GatorError::StartFailure {
            stage: stage.into(),
            reason: reason.to_string(),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{channel} channel size {size} is not a power of two")]
    NotPowerOfTwo { channel: ChannelKind, size: u32 },

    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

/// Interface contract violations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UsageError {
    #[error("read size {actual} does not match the transfer unit {expected}")]
    TransferSize { expected: usize, actual: usize },

    #[error("buffers are not set up")]
    NotSetUp,

    #[error("buffers are already set up")]
    AlreadySetUp,

    #[error("collection is not running")]
    NotRunning,

    #[error("partial access at a non-zero offset")]
    NonZeroOffset,

    #[error("cannot parse value: {0}")]
    Parse(String),

    #[error("no such core: {0}")]
    NoSuchCore(u32),

    #[error("another reader is already draining")]
    ConcurrentRead,

    #[error("{0} is read-only")]
    ReadOnly(&'static str),
}

/// Failure reported by a data source's start hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct SourceError {
    pub reason: String,
}

impl SourceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
