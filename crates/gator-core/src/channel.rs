//! Channel kinds and wire frame types
//!
//! Every core owns one ring per channel kind. The channel kind fixes the
//! frame type written at the head of each frame in that ring.

use core::fmt;

/// Number of logical channels per core
pub const NUM_CHANNELS: usize = 9;

/// One of the fixed logical data streams
///
/// The discriminant is the channel's index in per-core tables and also
/// its position in the consumer's discovery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChannelKind {
    Summary = 0,
    Backtrace = 1,
    Name = 2,
    Counter = 3,
    BlockCounter = 4,
    Annotate = 5,
    SchedTrace = 6,
    GpuTrace = 7,
    Idle = 8,
}

impl ChannelKind {
    /// All channels in discovery order
    pub const ALL: [ChannelKind; NUM_CHANNELS] = [
        ChannelKind::Summary,
        ChannelKind::Backtrace,
        ChannelKind::Name,
        ChannelKind::Counter,
        ChannelKind::BlockCounter,
        ChannelKind::Annotate,
        ChannelKind::SchedTrace,
        ChannelKind::GpuTrace,
        ChannelKind::Idle,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[inline]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Frame type written at the head of every frame in this channel
    #[inline]
    pub const fn frame_type(self) -> FrameType {
        match self {
            ChannelKind::Summary => FrameType::Summary,
            ChannelKind::Backtrace => FrameType::Backtrace,
            ChannelKind::Name => FrameType::Name,
            ChannelKind::Counter => FrameType::Counter,
            ChannelKind::BlockCounter => FrameType::BlockCounter,
            ChannelKind::Annotate => FrameType::Annotate,
            ChannelKind::SchedTrace => FrameType::SchedTrace,
            ChannelKind::GpuTrace => FrameType::GpuTrace,
            ChannelKind::Idle => FrameType::Idle,
        }
    }

    /// Whether only the boot core owns storage for this channel.
    /// Annotations are core-agnostic.
    #[inline]
    pub const fn boot_core_only(self) -> bool {
        matches!(self, ChannelKind::Annotate)
    }

    /// Name used in environment variables and logs
    pub const fn name(self) -> &'static str {
        match self {
            ChannelKind::Summary => "summary",
            ChannelKind::Backtrace => "backtrace",
            ChannelKind::Name => "name",
            ChannelKind::Counter => "counter",
            ChannelKind::BlockCounter => "block_counter",
            ChannelKind::Annotate => "annotate",
            ChannelKind::SchedTrace => "sched_trace",
            ChannelKind::GpuTrace => "gpu_trace",
            ChannelKind::Idle => "idle",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Wire frame type tags (stable across the protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Summary = 1,
    Backtrace = 2,
    Name = 3,
    Counter = 4,
    BlockCounter = 5,
    Annotate = 6,
    SchedTrace = 7,
    GpuTrace = 8,
    Idle = 9,
}

impl FrameType {
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    /// Channel that carries frames of this type
    #[inline]
    pub fn channel(self) -> ChannelKind {
        ChannelKind::ALL[self as usize - 1]
    }
}

impl TryFrom<u32> for FrameType {
    type Error = u32;

    fn try_from(v: u32) -> Result<Self, u32> {
        match v {
            1 => Ok(FrameType::Summary),
            2 => Ok(FrameType::Backtrace),
            3 => Ok(FrameType::Name),
            4 => Ok(FrameType::Counter),
            5 => Ok(FrameType::BlockCounter),
            6 => Ok(FrameType::Annotate),
            7 => Ok(FrameType::SchedTrace),
            8 => Ok(FrameType::GpuTrace),
            9 => Ok(FrameType::Idle),
            other => Err(other),
        }
    }
}
