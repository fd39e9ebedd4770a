//! Control surface
//!
//! The file-like endpoints a host exposes to the capture daemon. Scalar
//! endpoints read and write decimal text; the `buffer` endpoint is opened
//! once, drained with blocking reads and released by dropping the handle.
//! Every error maps to an errno via [`to_errno`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gator_core::constants::PROTOCOL_VERSION;
use gator_core::{
    CancellationToken, ConfigEntry, ConfigError, EntryAccess, GatorError, GatorResult, UsageError,
};
use tracing::{info, warn};

use crate::lifecycle::Collector;
use crate::platform;

/// Who is touching an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    privileged: bool,
}

impl Caller {
    /// The calling process
    pub fn current() -> Self {
        Self {
            privileged: platform::is_privileged(),
        }
    }

    pub const fn privileged() -> Self {
        Self { privileged: true }
    }

    pub const fn unprivileged() -> Self {
        Self { privileged: false }
    }

    #[inline]
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

/// Scalar control endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Enable,
    BacktraceDepth,
    Tick,
    ResponseType,
    CpuCores,
    BufferSize,
    Version,
}

impl Endpoint {
    pub const ALL: [Endpoint; 7] = [
        Endpoint::Enable,
        Endpoint::BacktraceDepth,
        Endpoint::Tick,
        Endpoint::ResponseType,
        Endpoint::CpuCores,
        Endpoint::BufferSize,
        Endpoint::Version,
    ];

    pub const fn path(self) -> &'static str {
        match self {
            Endpoint::Enable => "enable",
            Endpoint::BacktraceDepth => "backtrace_depth",
            Endpoint::Tick => "tick",
            Endpoint::ResponseType => "response_type",
            Endpoint::CpuCores => "cpu_cores",
            Endpoint::BufferSize => "buffer_size",
            Endpoint::Version => "version",
        }
    }

    pub fn from_path(path: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.path() == path)
    }

    pub const fn access(self) -> EntryAccess {
        match self {
            Endpoint::CpuCores | Endpoint::BufferSize | Endpoint::Version => EntryAccess::ReadOnly,
            _ => EntryAccess::ReadWrite,
        }
    }
}

/// Parse an endpoint write: decimal or `0x` hex, optional trailing newline
fn parse_value(data: &[u8]) -> GatorResult<u64> {
    let text = std::str::from_utf8(data)
        .map_err(|_| UsageError::Parse(String::from_utf8_lossy(data).into_owned()))?;
    let digits = text.trim_end_matches(|c: char| c == '\n' || c == '\r');
    let parsed = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => digits.parse(),
    };
    parsed.map_err(|_| UsageError::Parse(digits.to_string()).into())
}

fn narrow(value: u64, what: &str) -> GatorResult<u32> {
    u32::try_from(value)
        .map_err(|_| UsageError::Parse(format!("{what} {value} out of range")).into())
}

/// Endpoint front end over a shared collector
pub struct ControlSurface {
    collector: Arc<Collector>,
    buffer_open: Arc<AtomicBool>,
}

impl ControlSurface {
    pub fn new(collector: Arc<Collector>) -> Self {
        Self {
            collector,
            buffer_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn value(&self, endpoint: Endpoint) -> u64 {
        let c = &self.collector;
        match endpoint {
            Endpoint::Enable => c.is_running() as u64,
            Endpoint::BacktraceDepth => c.backtrace_depth() as u64,
            Endpoint::Tick => c.tick_hz() as u64,
            Endpoint::ResponseType => c.response_type() as u64,
            Endpoint::CpuCores => c.num_cores() as u64,
            Endpoint::BufferSize => c.transfer_unit() as u64,
            Endpoint::Version => PROTOCOL_VERSION,
        }
    }

    /// The endpoint's text from byte `offset` on; empty past the end
    pub fn read_text(&self, endpoint: Endpoint, offset: usize) -> String {
        let text = format!("{}\n", self.value(endpoint));
        text.get(offset..).unwrap_or_default().to_string()
    }

    /// Write a whole value to a read-write endpoint
    ///
    /// Returns the number of bytes consumed, which is all of `data`.
    pub fn write(
        &self,
        caller: Caller,
        endpoint: Endpoint,
        offset: usize,
        data: &[u8],
    ) -> GatorResult<usize> {
        if !caller.is_privileged() {
            return Err(GatorError::PermissionDenied);
        }
        if offset != 0 {
            return Err(UsageError::NonZeroOffset.into());
        }
        if endpoint.access() == EntryAccess::ReadOnly {
            return Err(UsageError::ReadOnly(endpoint.path()).into());
        }
        let value = parse_value(data)?;
        let c = &self.collector;
        match endpoint {
            Endpoint::Enable if value != 0 => c.start()?,
            Endpoint::Enable => c.stop(),
            Endpoint::BacktraceDepth => c.set_backtrace_depth(narrow(value, "backtrace depth")?)?,
            Endpoint::Tick => c.set_tick_hz(narrow(value, "tick rate")?),
            Endpoint::ResponseType => c.set_response_type(narrow(value, "response type")?)?,
            Endpoint::CpuCores | Endpoint::BufferSize | Endpoint::Version => {
                return Err(UsageError::ReadOnly(endpoint.path()).into());
            }
        }
        Ok(data.len())
    }

    /// Every entry in the control tree: built-ins, then each source's
    /// knobs under `events/`
    pub fn entries(&self) -> Vec<ConfigEntry> {
        let mut entries: Vec<ConfigEntry> = Endpoint::ALL
            .into_iter()
            .map(|e| ConfigEntry {
                path: e.path().to_string(),
                access: e.access(),
                value: self.value(e),
            })
            .collect();
        for source in self.collector.sources() {
            entries.extend(source.config_entries().into_iter().map(|mut entry| {
                entry.path = format!("events/{}", entry.path);
                entry
            }));
        }
        entries
    }

    /// Open the data endpoint: privilege check, single open, buffer setup
    pub fn open_buffer(&self, caller: Caller) -> GatorResult<BufferHandle> {
        if !caller.is_privileged() {
            return Err(GatorError::PermissionDenied);
        }
        if self.buffer_open.swap(true, Ordering::AcqRel) {
            return Err(GatorError::Busy("buffer already open"));
        }
        if let Err(e) = self.collector.setup() {
            self.buffer_open.store(false, Ordering::Release);
            return Err(e);
        }
        info!(transfer_unit = self.collector.transfer_unit(), "buffer opened");
        Ok(BufferHandle {
            collector: self.collector.clone(),
            open: self.buffer_open.clone(),
        })
    }
}

/// Open data endpoint. Dropping it stops collection and frees the buffers.
pub struct BufferHandle {
    collector: Arc<Collector>,
    open: Arc<AtomicBool>,
}

impl BufferHandle {
    /// Bytes every read must ask for
    pub fn transfer_unit(&self) -> usize {
        self.collector.transfer_unit()
    }

    /// Blocking drain; see [`Collector::blocking_read`]
    pub fn read(&self, buf: &mut [u8], cancel: &CancellationToken) -> GatorResult<usize> {
        self.collector.blocking_read(buf, cancel)
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("transfer_unit", &self.transfer_unit())
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        self.collector.stop();
        if let Err(e) = self.collector.teardown() {
            warn!(error = %e, "buffer release failed");
        }
        self.open.store(false, Ordering::Release);
        info!("buffer released");
    }
}

/// errno for an error surfaced through the control surface
pub fn to_errno(err: &GatorError) -> i32 {
    match err {
        GatorError::Config(ConfigError::NotPowerOfTwo { .. }) => libc::ENOEXEC,
        GatorError::Config(ConfigError::InvalidValue(_)) => libc::EINVAL,
        GatorError::Allocation { .. } => libc::ENOMEM,
        GatorError::StartFailure { .. } => libc::EINVAL,
        GatorError::Usage(_) => libc::EINVAL,
        GatorError::PermissionDenied => libc::EPERM,
        GatorError::Busy(_) => libc::EBUSY,
        GatorError::Interrupted => libc::EINTR,
        GatorError::BufferReleased { .. } => libc::EFAULT,
    }
}
