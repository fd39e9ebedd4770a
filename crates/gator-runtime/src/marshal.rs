//! Record marshalling
//!
//! `CoreWriter` is the only producer-side handle onto a core's channels.
//! Each record reserves its worst-case encoded size with `check_space`
//! before writing anything, so a rejected record leaves no partial bytes
//! behind. Records that can pile up in one frame finish with
//! `check_and_commit`, which publishes the frame once it passes the
//! commit threshold.

use gator_core::constants::{
    EVENT_KEY_TIMESTAMP, MAXSIZE_PACK32, MAXSIZE_PACK64, MESSAGE_COOKIE, MESSAGE_CORE_NAME,
    MESSAGE_END_BACKTRACE, MESSAGE_GPU_START, MESSAGE_GPU_STOP, MESSAGE_SCHED_EXIT,
    MESSAGE_SCHED_SWITCH, MESSAGE_THREAD_NAME,
};
use gator_core::{ChannelKind, CoreId, EventSink, NameSink, TaskId};

use crate::platform;
use crate::store::{ChannelRing, CoreRings};
use crate::wake::DeferredWake;

const P32: u32 = MAXSIZE_PACK32 as u32;
const P64: u32 = MAXSIZE_PACK64 as u32;

/// Fixed fields of an annotation: core, tid, time, size
const ANNOTATE_HEADER: u32 = 3 * P32 + P64;

/// Backtrace header: time, cookie, tgid, pid, mode
const BACKTRACE_PREFIX: u32 = P64 + 4 * P32;
/// One `(cookie, offset)` address
const BACKTRACE_ENTRY: u32 = P32 + P64;
/// End marker
const BACKTRACE_FOOTER: u32 = P32;

/// Writer for one core's channels
///
/// Only that core's producer context may hold one, except for the
/// annotation channel which is serialized by the collector's annotation
/// lock.
pub struct CoreWriter<'a> {
    core: CoreId,
    rings: &'a CoreRings,
    wake: &'a DeferredWake,
    epoch_ns: u64,
}

impl<'a> CoreWriter<'a> {
    pub(crate) fn new(
        core: CoreId,
        rings: &'a CoreRings,
        wake: &'a DeferredWake,
        epoch_ns: u64,
    ) -> Self {
        Self {
            core,
            rings,
            wake,
            epoch_ns,
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Nanoseconds since the session started
    #[inline]
    pub fn now(&self) -> u64 {
        platform::monotonic_ns().saturating_sub(self.epoch_ns)
    }

    #[inline]
    fn ring(&self, kind: ChannelKind) -> &'a ChannelRing {
        self.rings.get(kind)
    }

    /// Publish the open frame of `kind` and schedule a consumer wake
    pub fn commit(&self, kind: ChannelKind) -> bool {
        let committed = self.ring(kind).commit();
        if committed {
            self.wake.schedule();
        }
        committed
    }

    /// Publish the open frame of `kind` once it passes the commit threshold
    pub fn check_and_commit(&self, kind: ChannelKind) -> bool {
        let committed = self.ring(kind).check_and_commit_if_large();
        if committed {
            self.wake.schedule();
        }
        committed
    }

    /// Publish every channel of this core except annotations, which
    /// commit per record
    pub fn commit_all(&self) {
        for ring in self.rings.iter() {
            if ring.kind() != ChannelKind::Annotate && ring.commit() {
                self.wake.schedule();
            }
        }
    }

    // ---- summary ------------------------------------------------------

    /// Session baseline: wall clock and monotonic start, committed at once
    pub fn summary(&self, wall_ns: u64, monotonic_ns: u64) -> bool {
        let ring = self.ring(ChannelKind::Summary);
        if !ring.check_space(2 * P64) {
            return false;
        }
        ring.write_packed64(wall_ns);
        ring.write_packed64(monotonic_ns);
        self.commit(ChannelKind::Summary)
    }

    // ---- backtrace ----------------------------------------------------

    /// Open a sample with room for its first address and the end marker
    ///
    /// On rejection nothing is written and the pending frame gets a
    /// chance to commit so the consumer can catch up.
    pub fn backtrace_header(&self, exec_cookie: u32, task: TaskId, in_kernel: bool) -> bool {
        let ring = self.ring(ChannelKind::Backtrace);
        if !ring.check_space(BACKTRACE_PREFIX + BACKTRACE_ENTRY + BACKTRACE_FOOTER) {
            self.check_and_commit(ChannelKind::Backtrace);
            return false;
        }
        ring.write_packed64(self.now());
        ring.write_packed(exec_cookie);
        ring.write_packed(task.tgid);
        ring.write_packed(task.pid);
        ring.write_packed(in_kernel as u32);
        true
    }

    /// One address of the open sample
    ///
    /// Every accepted entry keeps room for the end marker behind it, so a
    /// sample cut short by a full ring still closes cleanly.
    #[inline]
    pub fn backtrace_entry(&self, cookie: u32, offset: u64) -> bool {
        let ring = self.ring(ChannelKind::Backtrace);
        if !ring.check_space(BACKTRACE_ENTRY + BACKTRACE_FOOTER) {
            return false;
        }
        ring.write_packed(cookie);
        ring.write_packed64(offset);
        true
    }

    pub fn backtrace_footer(&self) {
        self.ring(ChannelKind::Backtrace)
            .write_packed(MESSAGE_END_BACKTRACE);
        self.check_and_commit(ChannelKind::Backtrace);
    }

    // ---- names --------------------------------------------------------

    pub fn cookie_name(&self, cookie: u32, path: &str) -> bool {
        let ring = self.ring(ChannelKind::Name);
        if !ring.check_space(3 * P32 + path.len() as u32) {
            return false;
        }
        ring.write_packed(MESSAGE_COOKIE);
        ring.write_packed(cookie);
        ring.write_string(path);
        self.check_and_commit(ChannelKind::Name);
        true
    }

    pub fn thread_name(&self, pid: u32, name: &str) -> bool {
        let ring = self.ring(ChannelKind::Name);
        if !ring.check_space(3 * P32 + P64 + name.len() as u32) {
            return false;
        }
        ring.write_packed(MESSAGE_THREAD_NAME);
        ring.write_packed64(self.now());
        ring.write_packed(pid);
        ring.write_string(name);
        self.check_and_commit(ChannelKind::Name);
        true
    }

    pub fn core_name(&self, name: &str) -> bool {
        let ring = self.ring(ChannelKind::Name);
        if !ring.check_space(3 * P32 + name.len() as u32) {
            return false;
        }
        ring.write_packed(MESSAGE_CORE_NAME);
        ring.write_packed(self.core.as_u32());
        ring.write_string(name);
        self.check_and_commit(ChannelKind::Name);
        true
    }

    // ---- counters -----------------------------------------------------

    /// Timestamp that opens a group of block-counter events
    pub fn event_header(&self) -> bool {
        let ring = self.ring(ChannelKind::BlockCounter);
        if !ring.check_space(P32 + P64) {
            return false;
        }
        ring.write_packed(EVENT_KEY_TIMESTAMP);
        ring.write_packed64(self.now());
        true
    }

    /// A standalone counter sample
    pub fn counter(&self, key: u32, value: u64) -> bool {
        let ring = self.ring(ChannelKind::Counter);
        if !ring.check_space(P64 + P32 + P64) {
            return false;
        }
        ring.write_packed64(self.now());
        ring.write_packed(key);
        ring.write_packed64(value);
        self.check_and_commit(ChannelKind::Counter);
        true
    }

    // ---- scheduler, gpu, idle ---------------------------------------

    pub fn sched_switch(&self, task: TaskId, cookie: u32, state: u32) -> bool {
        let ring = self.ring(ChannelKind::SchedTrace);
        if !ring.check_space(5 * P32 + P64) {
            return false;
        }
        ring.write_packed(MESSAGE_SCHED_SWITCH);
        ring.write_packed64(self.now());
        ring.write_packed(task.tgid);
        ring.write_packed(task.pid);
        ring.write_packed(cookie);
        ring.write_packed(state);
        self.check_and_commit(ChannelKind::SchedTrace);
        true
    }

    pub fn sched_exit(&self, pid: u32) -> bool {
        let ring = self.ring(ChannelKind::SchedTrace);
        if !ring.check_space(2 * P32 + P64) {
            return false;
        }
        ring.write_packed(MESSAGE_SCHED_EXIT);
        ring.write_packed64(self.now());
        ring.write_packed(pid);
        self.check_and_commit(ChannelKind::SchedTrace);
        true
    }

    pub fn gpu_start(&self, unit: u32, gpu_core: u32, task: TaskId) -> bool {
        let ring = self.ring(ChannelKind::GpuTrace);
        if !ring.check_space(5 * P32 + P64) {
            return false;
        }
        ring.write_packed(MESSAGE_GPU_START);
        ring.write_packed64(self.now());
        ring.write_packed(unit);
        ring.write_packed(gpu_core);
        ring.write_packed(task.tgid);
        ring.write_packed(task.pid);
        self.check_and_commit(ChannelKind::GpuTrace);
        true
    }

    pub fn gpu_stop(&self, unit: u32, gpu_core: u32) -> bool {
        let ring = self.ring(ChannelKind::GpuTrace);
        if !ring.check_space(3 * P32 + P64) {
            return false;
        }
        ring.write_packed(MESSAGE_GPU_STOP);
        ring.write_packed64(self.now());
        ring.write_packed(unit);
        ring.write_packed(gpu_core);
        self.check_and_commit(ChannelKind::GpuTrace);
        true
    }

    pub fn idle(&self, state: u32) -> bool {
        let ring = self.ring(ChannelKind::Idle);
        if !ring.check_space(2 * P32 + P64) {
            return false;
        }
        ring.write_packed(state);
        ring.write_packed64(self.now());
        ring.write_packed(self.core.as_u32());
        self.check_and_commit(ChannelKind::Idle);
        true
    }

    // ---- annotations --------------------------------------------------

    /// Write as much of `bytes` as the channel has room for. Returns the
    /// number of payload bytes taken; 0 means the channel is full.
    ///
    /// The record may wrap past the physical end of the ring.
    pub(crate) fn annotate(&self, tid: u32, bytes: &[u8]) -> usize {
        let ring = self.ring(ChannelKind::Annotate);
        if !ring.has_storage() {
            return 0;
        }
        let room = ring.bytes_available().saturating_sub(ANNOTATE_HEADER);
        let size = bytes.len().min(room as usize);
        if size == 0 || !ring.check_space(ANNOTATE_HEADER + size as u32) {
            return 0;
        }
        ring.write_packed(self.core.as_u32());
        ring.write_packed(tid);
        ring.write_packed64(self.now());
        ring.write_packed(size as u32);
        ring.write_bytes(&bytes[..size]);
        self.commit(ChannelKind::Annotate);
        size
    }
}

/// Counter values from data-source hooks, as block-counter key/value pairs
impl EventSink for CoreWriter<'_> {
    fn event(&mut self, key: u32, value: u32) {
        let ring = self.ring(ChannelKind::BlockCounter);
        if ring.check_space(2 * P32) {
            ring.write_packed(key);
            ring.write_packed(value);
        }
    }

    fn event64(&mut self, key: u32, value: u64) {
        let ring = self.ring(ChannelKind::BlockCounter);
        if ring.check_space(P32 + P64) {
            ring.write_packed(key);
            ring.write_packed64(value);
        }
    }
}

impl NameSink for CoreWriter<'_> {
    fn cookie(&mut self, cookie: u32, path: &str) {
        self.cookie_name(cookie, path);
    }

    fn thread_name(&mut self, pid: u32, name: &str) {
        CoreWriter::thread_name(self, pid, name);
    }
}
