//! Per-core producer contexts
//!
//! Each core gets one thread that plays the role of that core's timer
//! interrupt: it fires the tick handler at the configured rate and runs
//! cross-core calls queued with `run_on`. Everything that writes into a
//! core's channels runs on this thread, which keeps every ring
//! single-writer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use gator_core::{CoreId, GatorError, GatorResult, UsageError};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::platform;

/// Work shipped to a core's producer thread
pub(crate) type CoreCall = Box<dyn FnOnce() + Send>;

/// Handler invoked on every tick of an enabled core
pub(crate) type TickHandler = Arc<dyn Fn(CoreId) + Send + Sync>;

struct TickSlot {
    calls: SegQueue<CoreCall>,
    enabled: AtomicBool,
    thread: Mutex<Option<Thread>>,
}

impl TickSlot {
    fn new() -> Self {
        Self {
            calls: SegQueue::new(),
            enabled: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    fn run_pending(&self) {
        while let Some(call) = self.calls.pop() {
            call();
        }
    }
}

/// Detaches a producer thread from its slot however the thread ends
///
/// Calls still queued are dropped unrun, which closes their reply
/// channels so waiting `run_on` callers fail instead of blocking.
struct ProducerExit<'a> {
    core: CoreId,
    slot: &'a TickSlot,
}

impl Drop for ProducerExit<'_> {
    fn drop(&mut self) {
        {
            let mut handle = self.slot.thread.lock();
            if handle.as_ref().is_some_and(|t| t.id() == thread::current().id()) {
                *handle = None;
            }
        }
        self.slot.enabled.store(false, Ordering::Release);
        while self.slot.calls.pop().is_some() {}
        if thread::panicking() {
            warn!(core = self.core.as_u32(), "producer thread died");
        }
    }
}

/// Per-core tick state shared with the producer threads
pub(crate) struct TickTimer {
    slots: Box<[TickSlot]>,
    shutdown: AtomicBool,
}

/// Join handles of one session's producer threads
pub(crate) struct TickThreads {
    handles: Vec<JoinHandle<()>>,
}

impl TickTimer {
    pub(crate) fn new(num_cores: usize) -> Self {
        Self {
            slots: (0..num_cores).map(|_| TickSlot::new()).collect(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn slot(&self, core: CoreId) -> GatorResult<&TickSlot> {
        self.slots
            .get(core.as_usize())
            .ok_or(GatorError::Usage(UsageError::NoSuchCore(core.as_u32())))
    }

    /// Spawn one producer thread per core. Ticks start disabled.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        hz: u32,
        pin: bool,
        handler: TickHandler,
    ) -> std::io::Result<TickThreads> {
        self.shutdown.store(false, Ordering::Release);
        let period = Duration::from_nanos(1_000_000_000 / hz.max(1) as u64);
        let mut handles = Vec::with_capacity(self.slots.len());

        for core in CoreId::range(self.slots.len()) {
            let timer = self.clone();
            let handler = handler.clone();
            let spawned = thread::Builder::new()
                .name(format!("gator-core-{}", core.as_u32()))
                .spawn(move || timer.producer_loop(core, period, pin, handler));
            match spawned {
                Ok(handle) => {
                    *self.slots[core.as_usize()].thread.lock() = Some(handle.thread().clone());
                    handles.push(handle);
                }
                Err(e) => {
                    self.shutdown(TickThreads { handles });
                    return Err(e);
                }
            }
        }
        Ok(TickThreads { handles })
    }

    fn producer_loop(&self, core: CoreId, period: Duration, pin: bool, handler: TickHandler) {
        if pin {
            if let Err(e) = platform::pin_current_thread(core) {
                debug!(core = core.as_u32(), error = %e, "could not pin producer thread");
            }
        }
        let slot = &self.slots[core.as_usize()];
        let _exit = ProducerExit { core, slot };
        let mut next = Instant::now() + period;

        loop {
            slot.run_pending();
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            if now >= next {
                if slot.enabled.load(Ordering::Acquire) {
                    handler(core);
                }
                next += period;
                if next <= now {
                    // Overran: drop the missed ticks
                    next = now + period;
                }
            } else {
                thread::park_timeout(next - now);
            }
        }
        // Calls queued just before shutdown still complete
        slot.run_pending();
    }

    /// Stop and join every producer thread
    pub(crate) fn shutdown(&self, threads: TickThreads) {
        for slot in self.slots.iter() {
            slot.enabled.store(false, Ordering::Release);
            slot.thread.lock().take();
        }
        self.shutdown.store(true, Ordering::Release);
        for handle in threads.handles {
            handle.thread().unpark();
            if handle.join().is_err() {
                warn!("producer thread panicked");
            }
        }
    }

    pub(crate) fn set_enabled(&self, core: CoreId, enabled: bool) {
        if let Ok(slot) = self.slot(core) {
            slot.enabled.store(enabled, Ordering::Release);
        }
    }

    pub(crate) fn is_enabled(&self, core: CoreId) -> bool {
        self.slot(core)
            .map(|s| s.enabled.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Run `f` on `core`'s producer thread and wait for its result
    ///
    /// Runs inline when already on that thread.
    pub(crate) fn run_on<F, R>(&self, core: CoreId, f: F) -> GatorResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let slot = self.slot(core)?;
        let mut f = Some(f);
        let rx = {
            let guard = slot.thread.lock();
            let Some(target) = guard.as_ref() else {
                return Err(UsageError::NotRunning.into());
            };
            if target.id() == thread::current().id() {
                None
            } else {
                let (tx, rx) = mpsc::sync_channel(1);
                if let Some(f) = f.take() {
                    slot.calls.push(Box::new(move || {
                        let _ = tx.send(f());
                    }));
                }
                target.unpark();
                Some(rx)
            }
        };
        match (rx, f) {
            (Some(rx), _) => rx.recv().map_err(|_| UsageError::NotRunning.into()),
            (None, Some(f)) => Ok(f()),
            (None, None) => Err(UsageError::NotRunning.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counts: Arc<Vec<AtomicUsize>>) -> TickHandler {
        Arc::new(move |core: CoreId| {
            counts[core.as_usize()].fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn test_ticks_only_when_enabled() {
        let timer = Arc::new(TickTimer::new(2));
        let counts = Arc::new(vec![AtomicUsize::new(0), AtomicUsize::new(0)]);
        let threads = timer.spawn(1000, false, counting_handler(counts.clone())).unwrap();

        timer.set_enabled(CoreId::new(1), true);
        thread::sleep(Duration::from_millis(50));
        timer.shutdown(threads);

        assert_eq!(counts[0].load(Ordering::Relaxed), 0);
        assert!(counts[1].load(Ordering::Relaxed) > 0);
        assert!(!timer.is_enabled(CoreId::new(1)));
    }

    #[test]
    fn test_run_on_targets_core_thread() {
        let timer = Arc::new(TickTimer::new(2));
        let threads = timer
            .spawn(100, false, Arc::new(|_core: CoreId| {}))
            .unwrap();

        let name = timer
            .run_on(CoreId::new(1), || thread::current().name().map(str::to_owned))
            .unwrap();
        assert_eq!(name.as_deref(), Some("gator-core-1"));

        // Nested call from the target thread runs inline
        let inner = timer.clone();
        let nested = timer
            .run_on(CoreId::new(0), move || inner.run_on(CoreId::new(0), || 7))
            .unwrap();
        assert_eq!(nested.unwrap(), 7);

        timer.shutdown(threads);
        assert!(matches!(
            timer.run_on(CoreId::new(0), || ()),
            Err(GatorError::Usage(UsageError::NotRunning))
        ));
    }

    #[test]
    fn test_run_on_fails_after_call_panics() {
        let timer = Arc::new(TickTimer::new(1));
        let threads = timer
            .spawn(100, false, Arc::new(|_core: CoreId| {}))
            .unwrap();

        let panicked: GatorResult<()> = timer.run_on(CoreId::BOOT, || panic!("bad call"));
        assert!(matches!(panicked, Err(GatorError::Usage(UsageError::NotRunning))));
        assert!(matches!(
            timer.run_on(CoreId::BOOT, || ()),
            Err(GatorError::Usage(UsageError::NotRunning))
        ));
        timer.shutdown(threads);
    }

    #[test]
    fn test_run_on_fails_after_tick_handler_panics() {
        let timer = Arc::new(TickTimer::new(2));
        let threads = timer
            .spawn(
                1000,
                false,
                Arc::new(|core: CoreId| {
                    if core.as_u32() == 1 {
                        panic!("tick handler");
                    }
                }),
            )
            .unwrap();
        timer.set_enabled(CoreId::new(1), true);

        let mut result = Ok(());
        for _ in 0..200 {
            result = timer.run_on(CoreId::new(1), || ());
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(result, Err(GatorError::Usage(UsageError::NotRunning))));
        assert!(!timer.is_enabled(CoreId::new(1)));
        // The other core is unaffected
        assert!(timer.run_on(CoreId::BOOT, || ()).is_ok());
        timer.shutdown(threads);
    }

    #[test]
    fn test_run_on_unknown_core() {
        let timer = Arc::new(TickTimer::new(1));
        assert!(matches!(
            timer.run_on(CoreId::new(4), || ()),
            Err(GatorError::Usage(UsageError::NoSuchCore(4)))
        ));
    }
}
