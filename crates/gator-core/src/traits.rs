//! Collaborator interfaces
//!
//! These traits define the boundary between the collector and everything
//! it treats as external: the platform that delivers interrupted register
//! snapshots, the cookie resolver, stack unwinders, and data-source
//! plugins. The runtime only ever holds them as `Arc<dyn Trait>`.
//!
//! Hooks marked "producer context" run on the owning core's tick thread
//! and must not block or allocate.

use crate::constants::NO_COOKIE;
use crate::error::SourceError;
use crate::id::{CoreId, TaskId};

/// Execution mode of an interrupted context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Kernel,
    User,
}

/// Register snapshot taken when a tick interrupted a core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Registers {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    pub lr: u64,
    pub user_mode: bool,
}

impl Registers {
    #[inline]
    pub fn mode(&self) -> ExecMode {
        if self.user_mode {
            ExecMode::User
        } else {
            ExecMode::Kernel
        }
    }
}

/// Everything the sampler needs about the interrupted context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptFrame {
    pub regs: Registers,
    pub task: TaskId,
}

/// Platform hook that exposes the interrupted context on each tick
pub trait InterruptSource: Send + Sync {
    /// Snapshot for the tick currently running on `core`, or `None` for a
    /// spurious tick. Producer context.
    fn interrupted(&self, core: CoreId) -> Option<InterruptFrame>;

    /// Human-readable core name, marshalled when a core comes online
    fn core_name(&self, _core: CoreId) -> &str {
        "Unknown"
    }
}

/// Receiver for name records produced while resolving cookies
pub trait NameSink {
    fn cookie(&mut self, cookie: u32, path: &str);
    fn thread_name(&mut self, pid: u32, name: &str);
}

/// Maps tasks and addresses to small stable image identifiers
pub trait CookieResolver: Send + Sync {
    /// Called by the lifecycle controller before any data source starts
    fn initialize(&self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Called on stop and on start rollback
    fn release(&self) {}

    /// Cookie of the binary image `task` is executing. Producer context.
    fn resolve_exec(&self, core: CoreId, task: TaskId, names: &mut dyn NameSink) -> u32;

    /// `(cookie, offset)` for `address` in `task`. Returning `NO_COOKIE`
    /// or `INVALID_COOKIE` makes the sampler emit the raw address.
    /// Producer context.
    fn resolve(
        &self,
        core: CoreId,
        task: TaskId,
        address: u64,
        names: &mut dyn NameSink,
    ) -> (u32, u64);
}

/// Resolver that attributes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCookies;

impl CookieResolver for NullCookies {
    fn resolve_exec(&self, _core: CoreId, _task: TaskId, _names: &mut dyn NameSink) -> u32 {
        NO_COOKIE
    }

    fn resolve(
        &self,
        _core: CoreId,
        _task: TaskId,
        address: u64,
        _names: &mut dyn NameSink,
    ) -> (u32, u64) {
        (NO_COOKIE, address)
    }
}

/// Kernel-side stack walker
pub trait KernelUnwinder: Send + Sync {
    /// Report up to `depth` frames as `(address, cookie)`. Producer context.
    fn walk(&self, core: CoreId, regs: &Registers, depth: u32, visit: &mut dyn FnMut(u64, u32));
}

/// One user-space frame record: saved frame pointer and return address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTail {
    pub fp: u64,
    pub lr: u64,
}

/// Non-faulting reads of the interrupted task's stack
pub trait UserMemory: Send + Sync {
    /// Read the frame record at `addr`, or `None` if it is not readable.
    /// Producer context.
    fn read_frame_tail(&self, task: TaskId, addr: u64) -> Option<FrameTail>;
}

/// Receiver for counter key/value pairs
pub trait EventSink {
    fn event(&mut self, key: u32, value: u32);
    fn event64(&mut self, key: u32, value: u64);
}

/// Access mode of a control-surface entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryAccess {
    ReadOnly,
    ReadWrite,
}

/// One configuration knob exposed through the control surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub path: String,
    pub access: EntryAccess,
    pub value: u64,
}

impl ConfigEntry {
    pub fn read_only(path: impl Into<String>, value: u64) -> Self {
        Self {
            path: path.into(),
            access: EntryAccess::ReadOnly,
            value,
        }
    }

    pub fn read_write(path: impl Into<String>, value: u64) -> Self {
        Self {
            path: path.into(),
            access: EntryAccess::ReadWrite,
            value,
        }
    }
}

/// A data-source plugin
///
/// Every hook is optional. The lifecycle controller calls `start` in
/// registration order and `stop` in reverse order.
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;

    fn start(&self) -> Result<(), SourceError> {
        Ok(())
    }

    fn stop(&self) {}

    /// Core joined the session. Producer context of `core`.
    fn online(&self, _core: CoreId, _out: &mut dyn EventSink) {}

    /// Core is leaving the session. Producer context of `core`.
    fn offline(&self, _core: CoreId, _out: &mut dyn EventSink) {}

    /// Controller context, before `online` runs on the core
    fn online_dispatch(&self, _core: CoreId) {}

    /// Controller context, after `offline` ran on the core
    fn offline_dispatch(&self, _core: CoreId) {}

    /// Counter values for this tick. Producer context.
    fn read(&self, _core: CoreId, _out: &mut dyn EventSink) {}

    /// System is about to sleep; stop instrumentation
    fn suspend(&self) {}

    /// System woke up; restore instrumentation
    fn resume(&self) {}

    /// Knobs this source contributes under `events/`
    fn config_entries(&self) -> Vec<ConfigEntry> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Names(Vec<String>);

    impl NameSink for Names {
        fn cookie(&mut self, cookie: u32, path: &str) {
            self.0.push(format!("{cookie}={path}"));
        }
        fn thread_name(&mut self, pid: u32, name: &str) {
            self.0.push(format!("{pid}:{name}"));
        }
    }

    #[test]
    fn test_null_cookies() {
        let mut names = Names(Vec::new());
        let r = NullCookies;
        let task = TaskId::new(1, 1);
        assert_eq!(r.resolve_exec(CoreId::BOOT, task, &mut names), NO_COOKIE);
        assert_eq!(r.resolve(CoreId::BOOT, task, 0x4000, &mut names), (NO_COOKIE, 0x4000));
        assert!(names.0.is_empty());
    }

    #[test]
    fn test_register_mode() {
        let mut regs = Registers::default();
        assert_eq!(regs.mode(), ExecMode::Kernel);
        regs.user_mode = true;
        assert_eq!(regs.mode(), ExecMode::User);
    }

    #[test]
    fn test_config_entry_ctors() {
        let e = ConfigEntry::read_write("events/cycles/enabled", 1);
        assert_eq!(e.access, EntryAccess::ReadWrite);
        assert_eq!(ConfigEntry::read_only("x", 2).access, EntryAccess::ReadOnly);
    }
}
