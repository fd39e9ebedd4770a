//! Core and task identifier types

use core::fmt;

/// Index of a processing core
///
/// Cores are numbered densely from zero. Every per-core table in the
/// runtime is indexed with `as_usize()`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoreId(u32);

impl CoreId {
    /// The boot core. Owns the only annotation and summary storage.
    pub const BOOT: CoreId = CoreId(0);

    #[inline]
    pub const fn new(id: u32) -> Self {
        CoreId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }

    /// Iterate over `0..count` as core ids
    pub fn range(count: usize) -> impl Iterator<Item = CoreId> + Clone {
        (0..count as u32).map(CoreId)
    }
}

impl From<u32> for CoreId {
    #[inline]
    fn from(id: u32) -> Self {
        CoreId(id)
    }
}

impl From<CoreId> for u32 {
    #[inline]
    fn from(id: CoreId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreId({})", self.0)
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the task that was interrupted by a tick
///
/// `tgid` is the thread group (process) id, `pid` the thread id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TaskId {
    pub tgid: u32,
    pub pid: u32,
}

impl TaskId {
    #[inline]
    pub const fn new(tgid: u32, pid: u32) -> Self {
        TaskId { tgid, pid }
    }

    /// The idle/kernel task
    pub const KERNEL: TaskId = TaskId { tgid: 0, pid: 0 };
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tgid, self.pid)
    }
}
