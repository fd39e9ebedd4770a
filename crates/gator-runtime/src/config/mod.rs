//! Collector configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`GATOR_*`, runtime)
//! 3. User's `GATOR_CONFIG_RS` file (compile-time)
//! 4. Library defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use gator_runtime::config::GatorConfig;
//! use gator_core::ChannelKind;
//!
//! let config = GatorConfig::from_env()
//!     .num_cores(4)
//!     .buffer_size(ChannelKind::Backtrace, 256 * 1024)
//!     .tick_hz(250);
//! ```

pub mod defaults;

use std::time::Duration;

use gator_core::constants::{MAX_BACKTRACE_DEPTH, MAX_CORES};
use gator_core::env::{env_get, env_get_bool};
use gator_core::{ChannelKind, ConfigError, NUM_CHANNELS};
use tracing::info;

/// Smallest channel the margin arithmetic supports
pub const MIN_CHANNEL_SIZE: u32 = 256;

/// Collector configuration with builder pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatorConfig {
    /// Number of cores with their own channel set
    pub num_cores: usize,
    /// Per-channel ring capacity in bytes, indexed by `ChannelKind::index()`
    pub buffer_sizes: [u32; NUM_CHANNELS],
    /// Headroom kept free while space is available
    pub space_margin: u32,
    /// Headroom required to leave the overflow state
    pub recovery_margin: u32,
    /// Commit once this fraction of a ring is pending (numerator)
    pub commit_threshold_num: u32,
    /// Commit once this fraction of a ring is pending (denominator)
    pub commit_threshold_den: u32,
    /// Delay between a commit and the consumer wake
    pub wake_delay: Duration,
    /// Sampling ticks per second, per core
    pub tick_hz: u32,
    /// User stack frames to unwind per sample
    pub backtrace_depth: u32,
    /// Response type written ahead of every frame (0 = none)
    pub response_type: u32,
    /// Pin producer threads to their core
    pub pin_threads: bool,
    /// How often a blocked reader re-checks cancellation
    pub read_poll: Duration,
}

impl Default for GatorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn default_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(MAX_CORES)
}

fn default_sizes() -> [u32; NUM_CHANNELS] {
    [
        defaults::SUMMARY_BUFFER_SIZE,
        defaults::BACKTRACE_BUFFER_SIZE,
        defaults::NAME_BUFFER_SIZE,
        defaults::COUNTER_BUFFER_SIZE,
        defaults::BLOCK_COUNTER_BUFFER_SIZE,
        defaults::ANNOTATE_BUFFER_SIZE,
        defaults::SCHED_TRACE_BUFFER_SIZE,
        defaults::GPU_TRACE_BUFFER_SIZE,
        defaults::IDLE_BUFFER_SIZE,
    ]
}

/// `GATOR_BACKTRACE_BUFFER_SIZE`, `GATOR_IDLE_BUFFER_SIZE`, ...
fn size_var(kind: ChannelKind) -> String {
    format!("GATOR_{}_BUFFER_SIZE", kind.name().to_uppercase())
}

impl GatorConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `GATOR_NUM_CORES` - Number of cores
    /// - `GATOR_<CHANNEL>_BUFFER_SIZE` - Ring capacity, e.g. `GATOR_BACKTRACE_BUFFER_SIZE`
    /// - `GATOR_SPACE_MARGIN` / `GATOR_RECOVERY_MARGIN` - Hysteresis margins
    /// - `GATOR_WAKE_DELAY_US` - Deferred wake delay in microseconds
    /// - `GATOR_TICK_HZ` - Sampling rate
    /// - `GATOR_BACKTRACE_DEPTH` - User unwind depth
    /// - `GATOR_RESPONSE_TYPE` - Frame response type
    /// - `GATOR_PIN_THREADS` - Pin producer threads (0/1)
    /// - `GATOR_READ_POLL_MS` - Reader cancellation poll interval
    pub fn from_env() -> Self {
        let defaults = Self::new();
        let mut buffer_sizes = defaults.buffer_sizes;
        for kind in ChannelKind::ALL {
            buffer_sizes[kind.index()] = env_get(&size_var(kind), buffer_sizes[kind.index()]);
        }

        Self {
            num_cores: env_get("GATOR_NUM_CORES", defaults.num_cores),
            buffer_sizes,
            space_margin: env_get("GATOR_SPACE_MARGIN", defaults.space_margin),
            recovery_margin: env_get("GATOR_RECOVERY_MARGIN", defaults.recovery_margin),
            commit_threshold_num: defaults.commit_threshold_num,
            commit_threshold_den: defaults.commit_threshold_den,
            wake_delay: Duration::from_micros(env_get(
                "GATOR_WAKE_DELAY_US",
                defaults::WAKE_DELAY_US,
            )),
            tick_hz: env_get("GATOR_TICK_HZ", defaults.tick_hz),
            backtrace_depth: env_get("GATOR_BACKTRACE_DEPTH", defaults.backtrace_depth),
            response_type: env_get("GATOR_RESPONSE_TYPE", defaults.response_type),
            pin_threads: env_get_bool("GATOR_PIN_THREADS", defaults.pin_threads),
            read_poll: Duration::from_millis(env_get(
                "GATOR_READ_POLL_MS",
                defaults::READ_POLL_MS,
            )),
        }
    }

    /// Create config with compile-time defaults only (no env override).
    pub fn new() -> Self {
        Self {
            num_cores: default_cores(),
            buffer_sizes: default_sizes(),
            space_margin: defaults::SPACE_MARGIN,
            recovery_margin: defaults::RECOVERY_MARGIN,
            commit_threshold_num: defaults::COMMIT_THRESHOLD_NUM,
            commit_threshold_den: defaults::COMMIT_THRESHOLD_DEN,
            wake_delay: Duration::from_micros(defaults::WAKE_DELAY_US),
            tick_hz: defaults::TICK_HZ,
            backtrace_depth: defaults::BACKTRACE_DEPTH,
            response_type: defaults::RESPONSE_TYPE,
            pin_threads: defaults::PIN_THREADS,
            read_poll: Duration::from_millis(defaults::READ_POLL_MS),
        }
    }

    // Builder methods

    pub fn num_cores(mut self, n: usize) -> Self {
        self.num_cores = n;
        self
    }

    pub fn buffer_size(mut self, kind: ChannelKind, size: u32) -> Self {
        self.buffer_sizes[kind.index()] = size;
        self
    }

    pub fn space_margin(mut self, bytes: u32) -> Self {
        self.space_margin = bytes;
        self
    }

    pub fn recovery_margin(mut self, bytes: u32) -> Self {
        self.recovery_margin = bytes;
        self
    }

    pub fn commit_threshold(mut self, num: u32, den: u32) -> Self {
        self.commit_threshold_num = num;
        self.commit_threshold_den = den;
        self
    }

    pub fn wake_delay(mut self, d: Duration) -> Self {
        self.wake_delay = d;
        self
    }

    pub fn tick_hz(mut self, hz: u32) -> Self {
        self.tick_hz = hz;
        self
    }

    pub fn backtrace_depth(mut self, depth: u32) -> Self {
        self.backtrace_depth = depth;
        self
    }

    pub fn response_type(mut self, response_type: u32) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn pin_threads(mut self, enable: bool) -> Self {
        self.pin_threads = enable;
        self
    }

    pub fn read_poll(mut self, d: Duration) -> Self {
        self.read_poll = d;
        self
    }

    #[inline]
    pub fn buffer_size_of(&self, kind: ChannelKind) -> u32 {
        self.buffer_sizes[kind.index()]
    }

    /// Size every consumer read must use: the largest channel
    pub fn transfer_unit(&self) -> usize {
        self.buffer_sizes.iter().copied().max().unwrap_or(0) as usize
    }

    /// Effective `(space, recovery)` margins for one channel
    ///
    /// The configured margins are clamped to 1/8 and 1/2 of the capacity so
    /// small channels keep usable space.
    pub fn margins(&self, kind: ChannelKind) -> (u32, u32) {
        let size = self.buffer_size_of(kind);
        (
            self.space_margin.min(size / 8),
            self.recovery_margin.min(size / 2),
        )
    }

    /// Pending bytes that force a commit on this channel
    pub fn commit_threshold_bytes(&self, kind: ChannelKind) -> u32 {
        let size = self.buffer_size_of(kind) as u64;
        (size * self.commit_threshold_num as u64 / self.commit_threshold_den.max(1) as u64) as u32
    }

    /// Validate configuration and return errors if invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_cores == 0 {
            return Err(ConfigError::InvalidValue("num_cores must be > 0"));
        }
        if self.num_cores > MAX_CORES {
            return Err(ConfigError::InvalidValue("num_cores must be <= 256"));
        }
        for kind in ChannelKind::ALL {
            let size = self.buffer_size_of(kind);
            if !size.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo {
                    channel: kind,
                    size,
                });
            }
            if size < MIN_CHANNEL_SIZE {
                return Err(ConfigError::InvalidValue("channel sizes must be >= 256 bytes"));
            }
            let (space, recovery) = self.margins(kind);
            if recovery <= space {
                return Err(ConfigError::InvalidValue(
                    "recovery margin must exceed space margin on every channel",
                ));
            }
        }
        if self.commit_threshold_num == 0
            || self.commit_threshold_den == 0
            || self.commit_threshold_num > self.commit_threshold_den
        {
            return Err(ConfigError::InvalidValue(
                "commit threshold must be a fraction in (0, 1]",
            ));
        }
        if self.tick_hz == 0 {
            return Err(ConfigError::InvalidValue("tick rate must be > 0"));
        }
        if self.read_poll.is_zero() {
            return Err(ConfigError::InvalidValue("read_poll must be > 0"));
        }
        if self.backtrace_depth > MAX_BACKTRACE_DEPTH {
            return Err(ConfigError::InvalidValue("backtrace depth must be <= 1024"));
        }
        Ok(())
    }

    /// Log the effective configuration
    pub fn log_summary(&self) {
        info!(
            num_cores = self.num_cores,
            transfer_unit = self.transfer_unit(),
            space_margin = self.space_margin,
            recovery_margin = self.recovery_margin,
            commit_threshold_num = self.commit_threshold_num,
            commit_threshold_den = self.commit_threshold_den,
            wake_delay = ?self.wake_delay,
            tick_hz = self.tick_hz,
            backtrace_depth = self.backtrace_depth,
            response_type = self.response_type,
            pin_threads = self.pin_threads,
            "gator configuration"
        );
        for kind in ChannelKind::ALL {
            let (space, recovery) = self.margins(kind);
            info!(
                channel = %kind,
                size = self.buffer_size_of(kind),
                space_margin = space,
                recovery_margin = recovery,
                "channel"
            );
        }
    }
}
