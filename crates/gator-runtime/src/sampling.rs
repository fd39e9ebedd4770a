//! Sampling & backtrace pipeline
//!
//! Runs on a core's producer thread once per tick. Nothing here blocks,
//! allocates or logs. A sample that does not fit is dropped whole: the
//! backtrace header reserves room for every entry and the footer before
//! the first byte is written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use gator_core::constants::{INVALID_COOKIE, NO_COOKIE};
use gator_core::{
    ChannelKind, CookieResolver, CoreId, DataSource, ExecMode, InterruptFrame, KernelUnwinder,
    Registers, TaskId, UserMemory,
};

use crate::marshal::CoreWriter;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "arm")] {
        /// Distance from the saved frame pointer to its `{fp, lr}` record
        const FRAME_RECORD_OFFSET: u64 = 4;
    } else {
        const FRAME_RECORD_OFFSET: u64 = 0;
    }
}

/// Collaborators and parameters one tick needs
pub(crate) struct Sampler<'a> {
    pub cookies: &'a dyn CookieResolver,
    pub unwinder: Option<&'a dyn KernelUnwinder>,
    pub memory: Option<&'a dyn UserMemory>,
    pub sources: &'a [Arc<dyn DataSource>],
    pub depth: u32,
}

impl Sampler<'_> {
    /// Addresses a sample may carry
    fn entries(&self, mode: ExecMode) -> u32 {
        match mode {
            ExecMode::Kernel => self.depth.max(1),
            // pc, then lr and `depth` frame records
            ExecMode::User if self.depth > 0 => self.depth.saturating_add(2),
            ExecMode::User => 1,
        }
    }

    /// Write one backtrace sample for the interrupted context
    pub(crate) fn sample(&self, w: &mut CoreWriter<'_>, frame: &InterruptFrame) {
        let core = w.core();
        let mode = frame.regs.mode();
        let exec_cookie = self.cookies.resolve_exec(core, frame.task, w);
        if !w.backtrace_header(exec_cookie, frame.task, mode == ExecMode::Kernel) {
            return;
        }

        let mut budget = self.entries(mode);
        match mode {
            ExecMode::Kernel => self.kernel_trace(w, &frame.regs, &mut budget),
            ExecMode::User => {
                self.add_trace(w, frame.task, frame.regs.pc, &mut budget);
                if self.depth > 0 {
                    self.user_walk(w, frame.task, &frame.regs, &mut budget);
                }
            }
        }
        w.backtrace_footer();
    }

    fn kernel_trace(&self, w: &CoreWriter<'_>, regs: &Registers, budget: &mut u32) {
        let Some(unwinder) = self.unwinder else {
            w.backtrace_entry(NO_COOKIE, regs.pc);
            return;
        };
        unwinder.walk(w.core(), regs, self.depth.max(1), &mut |address: u64, cookie: u32| {
            if *budget > 0 {
                *budget -= 1;
                if !w.backtrace_entry(cookie, address) {
                    *budget = 0;
                }
            }
        });
    }

    /// Map `address` to `(cookie, offset)` and append it
    fn add_trace(&self, w: &mut CoreWriter<'_>, task: TaskId, address: u64, budget: &mut u32) {
        if *budget == 0 {
            return;
        }
        *budget -= 1;
        // Bit 0 only marks the instruction set
        let (cookie, offset) = self.cookies.resolve(w.core(), task, address & !1, w);
        let offset = if cookie == NO_COOKIE || cookie == INVALID_COOKIE {
            address
        } else {
            offset
        };
        if !w.backtrace_entry(cookie, offset & !1) {
            // Ring full: close the sample with what it has
            *budget = 0;
        }
    }

    /// Follow `{fp, lr}` frame records up the user stack
    fn user_walk(&self, w: &mut CoreWriter<'_>, task: TaskId, regs: &Registers, budget: &mut u32) {
        // The entry preamble may not have saved lr yet
        self.add_trace(w, task, regs.lr, budget);

        let Some(memory) = self.memory else {
            return;
        };
        if regs.fp == 0 || regs.fp < regs.sp {
            return;
        }
        let mut tail = regs.fp.wrapping_sub(FRAME_RECORD_OFFSET);
        for _ in 0..self.depth {
            if tail == 0 || tail & 3 != 0 {
                break;
            }
            let Some(record) = memory.read_frame_tail(task, tail) else {
                break;
            };
            self.add_trace(w, task, record.lr, budget);
            if record.fp == 0 {
                break;
            }
            // Records must move strictly up the stack
            let next = record.fp.wrapping_sub(FRAME_RECORD_OFFSET);
            if next <= tail {
                break;
            }
            tail = next;
        }
    }

    /// Timestamped block of every source's counters
    ///
    /// The commit check runs after the last source so a timestamp and its
    /// counters land in the same frame.
    pub(crate) fn collect_counters(&self, w: &mut CoreWriter<'_>) {
        if !w.event_header() {
            return;
        }
        let core = w.core();
        for source in self.sources {
            source.read(core, w);
        }
        w.check_and_commit(ChannelKind::BlockCounter);
    }
}

/// Per-core "already collecting counters" flags
pub(crate) struct CollectGuards {
    flags: Box<[AtomicBool]>,
}

/// Held while a core collects counters
pub(crate) struct Collecting<'a> {
    flag: &'a AtomicBool,
}

impl CollectGuards {
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            flags: (0..num_cores).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// `None` when `core` is already inside a collection
    pub(crate) fn enter(&self, core: CoreId) -> Option<Collecting<'_>> {
        let flag = self.flags.get(core.as_usize())?;
        if flag.swap(true, Ordering::Acquire) {
            return None;
        }
        Some(Collecting { flag })
    }
}

impl Drop for Collecting<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
