//! Lifecycle controller
//!
//! Owns every piece of session state. Two locks guard it:
//!
//! - the coarse `state` lock serializes setup, start, stop, teardown and
//!   the notifier entry points end to end;
//! - the fine `buffer_lock` serializes storage mutation against the
//!   consumer's drain.
//!
//! Producers never take either lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use gator_core::constants::MAX_BACKTRACE_DEPTH;
use gator_core::{
    ChannelKind, ConfigError, CookieResolver, CoreId, DataSource, GatorError, GatorResult,
    InterruptFrame, InterruptSource, KernelUnwinder, NullCookies, UsageError, UserMemory,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::GatorConfig;
use crate::marshal::CoreWriter;
use crate::platform;
use crate::sampling::{CollectGuards, Sampler};
use crate::store::ChannelStore;
use crate::tick::{TickHandler, TickThreads, TickTimer};
use crate::wake::{BufferWait, DeferredWake, WakeThread};

/// Where the collector is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No storage mapped
    Idle,
    /// Storage mapped, not collecting
    Configured,
    /// Collecting
    Running,
}

/// Core hot-plug notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEvent {
    /// The core is about to leave service
    DownPrepare,
    /// The core rejoined
    Online,
}

/// Power-management notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmEvent {
    SuspendPrepare,
    PostSuspend,
}

struct State {
    phase: Phase,
    hotplug_registered: bool,
    pm_registered: bool,
    /// Cores taken offline by a suspend, brought back on resume
    suspended: Vec<CoreId>,
    ticks: Option<TickThreads>,
    waker: Option<WakeThread>,
}

/// Interrupt source used when none is configured: every tick is spurious
struct NoInterrupts;

impl InterruptSource for NoInterrupts {
    fn interrupted(&self, _core: CoreId) -> Option<InterruptFrame> {
        None
    }
}

pub(crate) struct Inner {
    pub(crate) config: GatorConfig,
    pub(crate) store: ChannelStore,

    backtrace_depth: AtomicU32,
    tick_hz: AtomicU32,
    response_type: AtomicU32,

    pub(crate) running: AtomicBool,
    epoch_ns: AtomicU64,

    state: Mutex<State>,
    pub(crate) buffer_lock: Mutex<()>,
    annotate_lock: Mutex<()>,

    pub(crate) wait: Arc<BufferWait>,
    wake: Arc<DeferredWake>,
    timer: Arc<TickTimer>,
    collecting: CollectGuards,
    online: Box<[AtomicBool]>,
    pub(crate) reader_active: AtomicBool,

    sources: Vec<Arc<dyn DataSource>>,
    cookies: Arc<dyn CookieResolver>,
    interrupts: Arc<dyn InterruptSource>,
    unwinder: Option<Arc<dyn KernelUnwinder>>,
    memory: Option<Arc<dyn UserMemory>>,
}

impl Inner {
    fn writer(&self, core: CoreId) -> Option<CoreWriter<'_>> {
        let rings = self.store.core(core)?;
        Some(CoreWriter::new(
            core,
            rings,
            &self.wake,
            self.epoch_ns.load(Ordering::Relaxed),
        ))
    }

    fn sampler(&self) -> Sampler<'_> {
        Sampler {
            cookies: &*self.cookies,
            unwinder: self.unwinder.as_deref(),
            memory: self.memory.as_deref(),
            sources: &self.sources,
            depth: self.backtrace_depth.load(Ordering::Relaxed),
        }
    }

    /// Tick handler. Producer context of `core`.
    fn on_tick(&self, core: CoreId) {
        let Some(frame) = self.interrupts.interrupted(core) else {
            return;
        };
        let Some(mut w) = self.writer(core) else {
            return;
        };
        let sampler = self.sampler();
        sampler.sample(&mut w, &frame);
        if let Some(_collecting) = self.collecting.enter(core) {
            sampler.collect_counters(&mut w);
        }
    }

    /// Run `f` with a writer on `core`'s producer thread
    fn on_core<F, R>(self: &Arc<Self>, core: CoreId, f: F) -> GatorResult<R>
    where
        F: FnOnce(&Inner, &mut CoreWriter<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        let inner = Arc::clone(self);
        self.timer
            .run_on(core, move || {
                let mut w = inner.writer(core)?;
                Some(f(&inner, &mut w))
            })?
            .ok_or_else(|| UsageError::NoSuchCore(core.as_u32()).into())
    }

    /// Bring the writer's core into the session. Producer context.
    fn online_local(&self, w: &mut CoreWriter<'_>) {
        let core = w.core();
        if w.event_header() {
            for source in &self.sources {
                source.online(core, w);
            }
            w.check_and_commit(ChannelKind::BlockCounter);
        }
        self.timer.set_enabled(core, true);
        w.core_name(self.interrupts.core_name(core));
        self.online[core.as_usize()].store(true, Ordering::Release);
    }

    /// Take the writer's core out of the session. Producer context.
    fn offline_local(&self, w: &mut CoreWriter<'_>) {
        let core = w.core();
        if w.event_header() {
            for source in &self.sources {
                source.offline(core, w);
            }
        }
        self.timer.set_enabled(core, false);
        w.commit_all();
        self.online[core.as_usize()].store(false, Ordering::Release);
    }

    fn is_online(&self, core: CoreId) -> bool {
        self.online
            .get(core.as_usize())
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn core_online(self: &Arc<Self>, core: CoreId) -> GatorResult<()> {
        for source in &self.sources {
            source.online_dispatch(core);
        }
        self.on_core(core, |inner, w| inner.online_local(w))?;
        debug!(core = core.as_u32(), "core online");
        Ok(())
    }

    fn core_offline(self: &Arc<Self>, core: CoreId) -> GatorResult<()> {
        if !self.is_online(core) {
            return Ok(());
        }
        self.on_core(core, |inner, w| inner.offline_local(w))?;
        for source in &self.sources {
            source.offline_dispatch(core);
        }
        debug!(core = core.as_u32(), "core offline");
        Ok(())
    }

    fn stop_sources(&self, started: usize) {
        for source in self.sources[..started].iter().rev() {
            source.stop();
        }
    }

    /// Undo a partial start: everything after the sources came up
    fn abort_start(self: &Arc<Self>, state: &mut State) {
        for core in CoreId::range(self.store.num_cores()) {
            if let Err(e) = self.core_offline(core) {
                warn!(core = core.as_u32(), error = %e, "offline during rollback failed");
            }
        }
        if let Some(ticks) = state.ticks.take() {
            self.timer.shutdown(ticks);
        }
        self.stop_sources(self.sources.len());
        self.cookies.release();
        if let Some(waker) = state.waker.take() {
            waker.stop();
        }
    }
}

/// Builder for [`Collector`]
pub struct CollectorBuilder {
    config: GatorConfig,
    interrupts: Arc<dyn InterruptSource>,
    cookies: Arc<dyn CookieResolver>,
    unwinder: Option<Arc<dyn KernelUnwinder>>,
    memory: Option<Arc<dyn UserMemory>>,
    sources: Vec<Arc<dyn DataSource>>,
}

impl CollectorBuilder {
    /// Platform hook that supplies the interrupted context on each tick
    pub fn interrupts(mut self, interrupts: Arc<dyn InterruptSource>) -> Self {
        self.interrupts = interrupts;
        self
    }

    pub fn cookies(mut self, cookies: Arc<dyn CookieResolver>) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn kernel_unwinder(mut self, unwinder: Arc<dyn KernelUnwinder>) -> Self {
        self.unwinder = Some(unwinder);
        self
    }

    pub fn user_memory(mut self, memory: Arc<dyn UserMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Register a data source. Sources start in registration order.
    pub fn source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn build(self) -> GatorResult<Collector> {
        self.config.validate()?;
        let num_cores = self.config.num_cores;
        let inner = Inner {
            store: ChannelStore::new(&self.config),
            backtrace_depth: AtomicU32::new(self.config.backtrace_depth),
            tick_hz: AtomicU32::new(self.config.tick_hz),
            response_type: AtomicU32::new(self.config.response_type),
            running: AtomicBool::new(false),
            epoch_ns: AtomicU64::new(0),
            state: Mutex::new(State {
                phase: Phase::Idle,
                hotplug_registered: false,
                pm_registered: false,
                suspended: Vec::new(),
                ticks: None,
                waker: None,
            }),
            buffer_lock: Mutex::new(()),
            annotate_lock: Mutex::new(()),
            wait: Arc::new(BufferWait::new()),
            wake: Arc::new(DeferredWake::new()),
            timer: Arc::new(TickTimer::new(num_cores)),
            collecting: CollectGuards::new(num_cores),
            online: (0..num_cores).map(|_| AtomicBool::new(false)).collect(),
            reader_active: AtomicBool::new(false),
            sources: self.sources,
            cookies: self.cookies,
            interrupts: self.interrupts,
            unwinder: self.unwinder,
            memory: self.memory,
            config: self.config,
        };
        Ok(Collector {
            inner: Arc::new(inner),
        })
    }
}

/// The per-core trace collector
///
/// Dropping it stops collection and releases all storage.
pub struct Collector {
    pub(crate) inner: Arc<Inner>,
}

impl Collector {
    pub fn builder(config: GatorConfig) -> CollectorBuilder {
        CollectorBuilder {
            config,
            interrupts: Arc::new(NoInterrupts),
            cookies: Arc::new(NullCookies),
            unwinder: None,
            memory: None,
            sources: Vec::new(),
        }
    }

    pub fn config(&self) -> &GatorConfig {
        &self.inner.config
    }

    pub fn num_cores(&self) -> usize {
        self.inner.store.num_cores()
    }

    /// Read size the consumer must use: the largest channel capacity
    pub fn transfer_unit(&self) -> usize {
        self.inner.config.transfer_unit()
    }

    pub fn store(&self) -> &ChannelStore {
        &self.inner.store
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn backtrace_depth(&self) -> u32 {
        self.inner.backtrace_depth.load(Ordering::Relaxed)
    }

    pub fn tick_hz(&self) -> u32 {
        self.inner.tick_hz.load(Ordering::Relaxed)
    }

    pub fn response_type(&self) -> u32 {
        self.inner.response_type.load(Ordering::Relaxed)
    }

    pub fn sources(&self) -> &[Arc<dyn DataSource>] {
        &self.inner.sources
    }

    /// Map channel storage for every core
    pub fn setup(&self) -> GatorResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.phase != Phase::Idle {
            return Err(UsageError::AlreadySetUp.into());
        }
        let _buffers = inner.buffer_lock.lock();
        if let Err(e) = inner.store.setup() {
            // Partial storage stays mapped until teardown
            warn!(error = %e, "buffer setup failed");
            return Err(e);
        }
        state.phase = Phase::Configured;
        info!(
            cores = inner.store.num_cores(),
            transfer_unit = inner.config.transfer_unit(),
            "buffers set up"
        );
        Ok(())
    }

    /// Start collecting
    ///
    /// Either every stage comes up or everything started so far is rolled
    /// back and the collector stays configured.
    pub fn start(&self) -> GatorResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        match state.phase {
            Phase::Idle => return Err(UsageError::NotSetUp.into()),
            Phase::Running => return Err(GatorError::Busy("already running")),
            Phase::Configured => {}
        }
        let hz = inner.tick_hz.load(Ordering::Relaxed);
        if hz == 0 {
            return Err(ConfigError::InvalidValue("tick rate must be > 0").into());
        }

        let response_type = inner.response_type.load(Ordering::Relaxed);
        for ring in inner.store.rings() {
            ring.response_type.store(response_type, Ordering::Relaxed);
            ring.open_frame();
        }

        // Samples are timed from here; the summary carrying it is written
        // once nothing can roll the start back
        let epoch = platform::monotonic_ns();
        let wall = platform::wall_clock_ns();
        inner.epoch_ns.store(epoch, Ordering::Relaxed);

        inner
            .cookies
            .initialize()
            .map_err(|e| GatorError::start_failure("cookie resolver", e))?;

        for (i, source) in inner.sources.iter().enumerate() {
            if let Err(e) = source.start() {
                warn!(
                    source = source.name(),
                    error = %e,
                    "data source failed to start, rolling back"
                );
                inner.stop_sources(i);
                inner.cookies.release();
                return Err(GatorError::start_failure(
                    format!("data source '{}'", source.name()),
                    e,
                ));
            }
        }

        match WakeThread::spawn(inner.wake.clone(), inner.wait.clone(), inner.config.wake_delay) {
            Ok(waker) => state.waker = Some(waker),
            Err(e) => {
                inner.abort_start(&mut state);
                return Err(GatorError::start_failure("wake thread", e));
            }
        }

        // Sampling comes up last, once every source is live
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let handler: TickHandler = Arc::new(move |core| {
            if let Some(inner) = weak.upgrade() {
                inner.on_tick(core);
            }
        });
        match inner.timer.spawn(hz, inner.config.pin_threads, handler) {
            Ok(ticks) => state.ticks = Some(ticks),
            Err(e) => {
                inner.abort_start(&mut state);
                return Err(GatorError::start_failure("tick threads", e));
            }
        }
        for core in CoreId::range(inner.store.num_cores()) {
            if let Err(e) = inner.core_online(core) {
                inner.abort_start(&mut state);
                return Err(GatorError::start_failure(format!("core {core} online"), e));
            }
        }
        if let Err(e) = inner.on_core(CoreId::BOOT, move |_, w| w.summary(wall, epoch)) {
            inner.abort_start(&mut state);
            return Err(GatorError::start_failure("summary", e));
        }

        state.hotplug_registered = true;
        state.pm_registered = true;
        inner.running.store(true, Ordering::Release);
        state.phase = Phase::Running;
        info!(
            tick_hz = hz,
            backtrace_depth = inner.backtrace_depth.load(Ordering::Relaxed),
            sources = inner.sources.len(),
            "collection started"
        );
        Ok(())
    }

    /// Stop collecting. A no-op unless running.
    pub fn stop(&self) {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.phase != Phase::Running {
            return;
        }

        // Notifiers go first so no event re-enables a tick being torn down
        state.hotplug_registered = false;
        state.pm_registered = false;
        state.suspended.clear();

        for core in CoreId::range(inner.store.num_cores()) {
            if let Err(e) = inner.core_offline(core) {
                warn!(core = core.as_u32(), error = %e, "core offline failed");
            }
        }
        if let Some(ticks) = state.ticks.take() {
            inner.timer.shutdown(ticks);
        }
        inner.stop_sources(inner.sources.len());

        {
            let _buffers = inner.buffer_lock.lock();
            inner.running.store(false, Ordering::Release);
            inner.cookies.release();
        }
        inner.wait.wake_all();
        if let Some(waker) = state.waker.take() {
            waker.stop();
        }
        state.phase = Phase::Configured;
        info!("collection stopped");
    }

    /// Release all channel storage
    pub fn teardown(&self) -> GatorResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.phase == Phase::Running {
            return Err(GatorError::Busy("cannot release buffers while running"));
        }
        let _buffers = inner.buffer_lock.lock();
        let _annotations = inner.annotate_lock.lock();
        // Safety: not running, so no producer thread exists, and both the
        // consumer and annotation writers are excluded by the locks above
        unsafe { inner.store.teardown() };
        inner.wait.wake_all();
        state.phase = Phase::Idle;
        info!("buffers released");
        Ok(())
    }

    /// Deliver a core hot-plug event. Ignored unless registered.
    pub fn notify_cpu(&self, core: CoreId, event: CpuEvent) -> GatorResult<()> {
        let inner = &self.inner;
        let state = inner.state.lock();
        if !state.hotplug_registered {
            return Ok(());
        }
        match event {
            CpuEvent::DownPrepare => inner.core_offline(core),
            CpuEvent::Online => inner.core_online(core),
        }
    }

    /// Deliver a power-management event. Ignored unless registered.
    pub fn notify_pm(&self, event: PmEvent) -> GatorResult<()> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if !state.pm_registered {
            return Ok(());
        }
        match event {
            PmEvent::SuspendPrepare => {
                if !state.hotplug_registered {
                    return Ok(());
                }
                state.hotplug_registered = false;
                for source in &inner.sources {
                    source.suspend();
                }
                let online: Vec<CoreId> = CoreId::range(inner.store.num_cores())
                    .filter(|&c| inner.is_online(c))
                    .collect();
                // Every core comes back on resume even if one fails to go down
                for &core in &online {
                    if let Err(e) = inner.core_offline(core) {
                        warn!(core = core.as_u32(), error = %e, "core did not suspend");
                    }
                }
                info!(cores = online.len(), "suspended");
                state.suspended = online;
            }
            PmEvent::PostSuspend => {
                if state.hotplug_registered {
                    return Ok(());
                }
                for core in std::mem::take(&mut state.suspended) {
                    if let Err(e) = inner.core_online(core) {
                        warn!(core = core.as_u32(), error = %e, "core did not resume");
                    }
                }
                for source in &inner.sources {
                    source.resume();
                }
                state.hotplug_registered = true;
                info!("resumed");
            }
        }
        Ok(())
    }

    /// Frames this many user stack frames per sample. Rejected while running
    /// and above `MAX_BACKTRACE_DEPTH`.
    pub fn set_backtrace_depth(&self, depth: u32) -> GatorResult<()> {
        if depth > MAX_BACKTRACE_DEPTH {
            return Err(ConfigError::InvalidValue("backtrace depth must be <= 1024").into());
        }
        let state = self.inner.state.lock();
        if state.phase == Phase::Running {
            return Err(GatorError::Busy("backtrace depth is fixed while running"));
        }
        self.inner.backtrace_depth.store(depth, Ordering::Relaxed);
        Ok(())
    }

    /// Response type written ahead of each frame. Rejected while running.
    pub fn set_response_type(&self, response_type: u32) -> GatorResult<()> {
        let state = self.inner.state.lock();
        if state.phase == Phase::Running {
            return Err(GatorError::Busy("response type is fixed while running"));
        }
        self.inner.response_type.store(response_type, Ordering::Relaxed);
        Ok(())
    }

    /// Sampling rate, applied at the next start
    pub fn set_tick_hz(&self, hz: u32) {
        let _state = self.inner.state.lock();
        self.inner.tick_hz.store(hz, Ordering::Relaxed);
    }

    /// Run `f` on `core`'s producer context and wait for it
    ///
    /// The only way outside a tick to write into a core's channels.
    pub fn run_on_core<F, R>(&self, core: CoreId, f: F) -> GatorResult<R>
    where
        F: FnOnce(&mut CoreWriter<'_>) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.inner.on_core(core, move |_, w| f(w))
    }

    /// Append an annotation from any thread
    ///
    /// Returns how many bytes of `bytes` were taken; 0 means the
    /// annotation channel is full and the caller should retry later.
    pub fn annotate(&self, tid: u32, bytes: &[u8]) -> GatorResult<usize> {
        let inner = &self.inner;
        let _annotations = inner.annotate_lock.lock();
        if !inner.running.load(Ordering::Acquire) {
            return Err(UsageError::NotRunning.into());
        }
        Ok(inner
            .writer(CoreId::BOOT)
            .map(|w| w.annotate(tid, bytes))
            .unwrap_or(0))
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.teardown() {
            warn!(error = %e, "teardown on drop failed");
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("cores", &self.num_cores())
            .field("running", &self.is_running())
            .field("sources", &self.inner.sources.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gator_core::{
        CancellationToken, ChannelKind, EventSink, FrameReader, FrameType, NameSink, Registers,
        SourceError, TaskId,
    };
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        fail: bool,
        log: Log,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: false,
                log: log.clone(),
            })
        }

        fn failing(name: &'static str, log: &Log) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail: true,
                log: log.clone(),
            })
        }

        fn push(&self, what: String) {
            self.log.lock().push(what);
        }
    }

    impl DataSource for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn start(&self) -> Result<(), SourceError> {
            self.push(format!("start {}", self.name));
            if self.fail {
                Err(SourceError::new("no such counter"))
            } else {
                Ok(())
            }
        }

        fn stop(&self) {
            self.push(format!("stop {}", self.name));
        }

        fn online(&self, core: CoreId, out: &mut dyn EventSink) {
            out.event(1, core.as_u32());
            self.push(format!("online {} {}", self.name, core));
        }

        fn offline(&self, core: CoreId, _out: &mut dyn EventSink) {
            self.push(format!("offline {} {}", self.name, core));
        }

        fn suspend(&self) {
            self.push(format!("suspend {}", self.name));
        }

        fn resume(&self) {
            self.push(format!("resume {}", self.name));
        }
    }

    #[derive(Default)]
    struct CountingCookies {
        initialized: AtomicU32,
        released: AtomicU32,
    }

    impl CookieResolver for CountingCookies {
        fn initialize(&self) -> Result<(), SourceError> {
            self.initialized.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn release(&self) {
            self.released.fetch_add(1, Ordering::Relaxed);
        }

        fn resolve_exec(&self, _core: CoreId, _task: TaskId, _names: &mut dyn NameSink) -> u32 {
            2
        }

        fn resolve(&self, _core: CoreId, _task: TaskId, address: u64, _names: &mut dyn NameSink) -> (u32, u64) {
            (2, address)
        }
    }

    struct AlwaysUser;

    impl InterruptSource for AlwaysUser {
        fn interrupted(&self, core: CoreId) -> Option<InterruptFrame> {
            Some(InterruptFrame {
                regs: Registers {
                    pc: 0x4000 + core.as_u32() as u64 * 0x10,
                    user_mode: true,
                    ..Registers::default()
                },
                task: TaskId::new(300, 301),
            })
        }
    }

    fn config() -> GatorConfig {
        GatorConfig::new()
            .num_cores(2)
            .tick_hz(1000)
            .pin_threads(false)
            .wake_delay(Duration::from_millis(1))
    }

    fn lines(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    /// Drain every committed frame of one ring
    fn drain_ring(c: &Collector, core: u32, kind: ChannelKind) -> Vec<u8> {
        let ring = c.store().ring(CoreId::new(core), kind).unwrap();
        let mut out = vec![0u8; ring.capacity() as usize];
        let n = ring.drain_into(&mut out).unwrap_or(0);
        out.truncate(n);
        out
    }

    #[test]
    fn test_phase_order_is_enforced() {
        let c = Collector::builder(config()).build().unwrap();
        assert_eq!(c.phase(), Phase::Idle);
        assert!(matches!(c.start(), Err(GatorError::Usage(UsageError::NotSetUp))));

        c.setup().unwrap();
        assert!(matches!(c.setup(), Err(GatorError::Usage(UsageError::AlreadySetUp))));

        c.start().unwrap();
        assert!(c.is_running());
        assert!(matches!(c.start(), Err(GatorError::Busy(_))));
        assert!(matches!(c.teardown(), Err(GatorError::Busy(_))));

        c.stop();
        c.stop();
        assert_eq!(c.phase(), Phase::Configured);
        c.teardown().unwrap();
        assert_eq!(c.phase(), Phase::Idle);
        assert!(!c.store().is_ready());
    }

    #[test]
    fn test_failed_source_rolls_back() {
        let log: Log = Arc::default();
        let cookies = Arc::new(CountingCookies::default());
        let c = Collector::builder(config())
            .cookies(cookies.clone())
            .source(Recorder::new("sched", &log))
            .source(Recorder::new("power", &log))
            .source(Recorder::failing("gpu", &log))
            .source(Recorder::new("mali", &log))
            .build()
            .unwrap();
        c.setup().unwrap();

        let err = c.start().unwrap_err();
        assert!(matches!(err, GatorError::StartFailure { .. }), "{err}");
        assert!(err.to_string().contains("gpu"));
        assert!(!c.is_running());
        assert_eq!(c.phase(), Phase::Configured);
        assert_eq!(
            lines(&log),
            vec!["start sched", "start power", "start gpu", "stop power", "stop sched"]
        );
        assert_eq!(cookies.initialized.load(Ordering::Relaxed), 1);
        assert_eq!(cookies.released.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_start_stop_runs_hooks_in_order() {
        let log: Log = Arc::default();
        let c = Collector::builder(config())
            .source(Recorder::new("a", &log))
            .source(Recorder::new("b", &log))
            .build()
            .unwrap();
        c.setup().unwrap();
        c.start().unwrap();
        c.stop();

        let log = lines(&log);
        assert_eq!(&log[..2], &["start a", "start b"]);
        assert!(log.contains(&"online a 1".to_string()));
        assert!(log.contains(&"offline b 0".to_string()));
        assert_eq!(&log[log.len() - 2..], &["stop b", "stop a"]);
    }

    #[test]
    fn test_zero_tick_rate_rejected_at_start() {
        let c = Collector::builder(config()).build().unwrap();
        c.setup().unwrap();
        c.set_tick_hz(0);
        assert!(matches!(c.start(), Err(GatorError::Config(ConfigError::InvalidValue(_)))));
        c.set_tick_hz(100);
        c.start().unwrap();
    }

    #[test]
    fn test_failed_start_leaves_no_summary() {
        let log: Log = Arc::default();
        let c = Collector::builder(config().read_poll(Duration::from_millis(5)))
            .source(Recorder::failing("gpu", &log))
            .build()
            .unwrap();
        c.setup().unwrap();
        assert!(c.start().is_err());

        assert!(c.store().commit_ready().is_none());
        assert!(drain_ring(&c, 0, ChannelKind::Summary).is_empty());
        let mut buf = vec![0u8; c.inner.config.transfer_unit()];
        assert_eq!(c.blocking_read(&mut buf, &CancellationToken::new()).unwrap(), 0);
    }

    #[test]
    fn test_backtrace_depth_is_bounded() {
        let c = Collector::builder(config()).build().unwrap();
        c.setup().unwrap();
        c.set_backtrace_depth(MAX_BACKTRACE_DEPTH).unwrap();
        assert!(matches!(
            c.set_backtrace_depth(u32::MAX),
            Err(GatorError::Config(ConfigError::InvalidValue(_)))
        ));
        assert_eq!(c.backtrace_depth(), MAX_BACKTRACE_DEPTH);
    }

    #[test]
    fn test_depth_and_response_type_busy_while_running() {
        let c = Collector::builder(config()).build().unwrap();
        c.setup().unwrap();
        c.set_backtrace_depth(4).unwrap();
        c.start().unwrap();
        assert!(matches!(c.set_backtrace_depth(8), Err(GatorError::Busy(_))));
        assert!(matches!(c.set_response_type(0), Err(GatorError::Busy(_))));
        assert_eq!(c.backtrace_depth(), 4);
        c.stop();
        c.set_backtrace_depth(8).unwrap();
        assert_eq!(c.backtrace_depth(), 8);
    }

    #[test]
    fn test_ticks_produce_backtrace_frames() {
        let c = Collector::builder(config())
            .interrupts(Arc::new(AlwaysUser))
            .cookies(Arc::new(CountingCookies::default()))
            .build()
            .unwrap();
        c.setup().unwrap();
        c.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        c.stop();

        for core in 0..2u32 {
            let bytes = drain_ring(&c, core, ChannelKind::Backtrace);
            let frames: Vec<_> = FrameReader::new(&bytes, true).map(|f| f.unwrap()).collect();
            assert!(!frames.is_empty(), "core {core} produced no samples");
            for f in &frames {
                assert_eq!(f.frame_type, FrameType::Backtrace);
                assert_eq!(f.core, core);
            }
            // Offline committed the counters too
            assert!(!drain_ring(&c, core, ChannelKind::BlockCounter).is_empty());
            // Core name written on online
            assert!(!drain_ring(&c, core, ChannelKind::Name).is_empty());
        }
        // Summary lives on the boot core only
        assert!(!drain_ring(&c, 0, ChannelKind::Summary).is_empty());
        assert!(drain_ring(&c, 1, ChannelKind::Summary).is_empty());
    }

    #[test]
    fn test_hotplug_offline_and_online() {
        let log: Log = Arc::default();
        let c = Collector::builder(config())
            .source(Recorder::new("s", &log))
            .build()
            .unwrap();
        // Not registered before start
        c.notify_cpu(CoreId::new(1), CpuEvent::DownPrepare).unwrap();
        assert!(lines(&log).is_empty());

        c.setup().unwrap();
        c.start().unwrap();
        c.notify_cpu(CoreId::new(1), CpuEvent::DownPrepare).unwrap();
        assert!(!c.inner.is_online(CoreId::new(1)));
        assert!(!c.inner.timer.is_enabled(CoreId::new(1)));
        assert!(c.inner.timer.is_enabled(CoreId::BOOT));

        // A second down for an offline core does nothing
        let before = lines(&log).len();
        c.notify_cpu(CoreId::new(1), CpuEvent::DownPrepare).unwrap();
        assert_eq!(lines(&log).len(), before);

        c.notify_cpu(CoreId::new(1), CpuEvent::Online).unwrap();
        assert!(c.inner.is_online(CoreId::new(1)));
        assert!(c.inner.timer.is_enabled(CoreId::new(1)));
        c.stop();
    }

    #[test]
    fn test_suspend_resume() {
        let log: Log = Arc::default();
        let c = Collector::builder(config())
            .source(Recorder::new("s", &log))
            .build()
            .unwrap();
        c.setup().unwrap();
        c.start().unwrap();
        log.lock().clear();

        c.notify_pm(PmEvent::SuspendPrepare).unwrap();
        assert!(!c.inner.is_online(CoreId::BOOT));
        assert!(!c.inner.is_online(CoreId::new(1)));
        // Hot-plug is ignored while suspended
        c.notify_cpu(CoreId::new(1), CpuEvent::Online).unwrap();
        assert!(!c.inner.is_online(CoreId::new(1)));

        c.notify_pm(PmEvent::PostSuspend).unwrap();
        assert!(c.inner.is_online(CoreId::BOOT));
        assert!(c.inner.is_online(CoreId::new(1)));

        let log = lines(&log);
        assert_eq!(log.first().map(String::as_str), Some("suspend s"));
        assert_eq!(log.last().map(String::as_str), Some("resume s"));
        c.stop();
    }

    #[test]
    fn test_suspend_resume_survives_a_dead_core() {
        let log: Log = Arc::default();
        let c = Collector::builder(config())
            .source(Recorder::new("s", &log))
            .build()
            .unwrap();
        c.setup().unwrap();
        c.start().unwrap();
        // Core 1's producer thread dies and can no longer be reached
        let fault: GatorResult<()> = c.run_on_core(CoreId::new(1), |_| panic!("producer fault"));
        assert!(fault.is_err());
        log.lock().clear();

        c.notify_pm(PmEvent::SuspendPrepare).unwrap();
        assert!(!c.inner.is_online(CoreId::BOOT));
        assert_eq!(c.inner.state.lock().suspended.len(), 2);

        c.notify_pm(PmEvent::PostSuspend).unwrap();
        assert!(c.inner.is_online(CoreId::BOOT));
        assert!(c.inner.timer.is_enabled(CoreId::BOOT));
        assert_eq!(lines(&log).last().map(String::as_str), Some("resume s"));
        c.stop();
        assert_eq!(c.phase(), Phase::Configured);
    }

    #[test]
    fn test_run_on_core_writes_to_that_core() {
        let c = Collector::builder(config()).build().unwrap();
        assert!(c.run_on_core(CoreId::BOOT, |_| ()).is_err());
        c.setup().unwrap();
        c.start().unwrap();

        let core = c
            .run_on_core(CoreId::new(1), |w| {
                w.sched_switch(TaskId::new(9, 9), 0, 1);
                w.commit(ChannelKind::SchedTrace);
                w.core()
            })
            .unwrap();
        assert_eq!(core, CoreId::new(1));
        assert!(c.store().ring(CoreId::new(1), ChannelKind::SchedTrace).unwrap().commit_ready());
        assert!(matches!(
            c.run_on_core(CoreId::new(5), |_| ()),
            Err(GatorError::Usage(UsageError::NoSuchCore(5)))
        ));
        c.stop();
    }

    #[test]
    fn test_annotate_requires_running() {
        let c = Collector::builder(config()).build().unwrap();
        c.setup().unwrap();
        assert!(matches!(
            c.annotate(1, b"x"),
            Err(GatorError::Usage(UsageError::NotRunning))
        ));
        c.start().unwrap();
        assert_eq!(c.annotate(1, b"marker").unwrap(), 6);
        c.stop();
        let bytes = drain_ring(&c, 0, ChannelKind::Annotate);
        let frame = FrameReader::new(&bytes, true).next().unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Annotate);
    }
}
