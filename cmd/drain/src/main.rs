//! Drain demo - synthetic platform end to end
//!
//! Drives the collector with a fake interrupt source, user stacks, cookie
//! resolver and counter source, enables collection through the control
//! surface and drains frames until stopped.
//!
//! Environment:
//! - `GATOR_DRAIN_SECS` - how long to collect (default 2)
//! - `GATOR_LOG_LEVEL` - log level (default info)
//! - every `GATOR_*` collector setting

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gator::constants::NO_COOKIE;
use gator::{
    env_get, Caller, CancellationToken, Collector, ConfigEntry, ControlSurface, CookieResolver,
    CoreId, CpuEvent, DataSource, Endpoint, EventSink, FrameReader, FrameTail, FrameType,
    GatorConfig, InterruptFrame, InterruptSource, NameSink, Registers, TaskId, UserMemory,
};
use tracing::{error, info};

/// Fake text segment every synthetic process executes from
const TEXT_BASE: u64 = 0x40_0000;
const TEXT_SIZE: u64 = 0x10_0000;
/// Fake stacks grow down from here; frame records are 0x20 apart
const STACK_TOP: u64 = 0x7fff_0000;
const FRAME_STRIDE: u64 = 0x20;
const STACK_FRAMES: u64 = 12;

const PROCESSES: [(u32, &str); 4] = [
    (1200, "/usr/bin/render"),
    (1201, "/usr/bin/decode"),
    (1202, "/usr/lib/libaudio.so"),
    (1203, "/usr/bin/idle-loop"),
];

#[inline]
fn xorshift(state: &AtomicU64) -> u64 {
    let mut x = state.load(Ordering::Relaxed);
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    state.store(x, Ordering::Relaxed);
    x
}

/// Pseudo-random registers per core
struct SyntheticInterrupts {
    seeds: Vec<AtomicU64>,
}

impl SyntheticInterrupts {
    fn new(cores: usize) -> Self {
        Self {
            seeds: (0..cores as u64)
                .map(|c| AtomicU64::new(0x9e37_79b9_7f4a_7c15 ^ (c + 1)))
                .collect(),
        }
    }
}

impl InterruptSource for SyntheticInterrupts {
    fn interrupted(&self, core: CoreId) -> Option<InterruptFrame> {
        let r = xorshift(self.seeds.get(core.as_usize())?);
        let (tgid, _) = PROCESSES[(r % PROCESSES.len() as u64) as usize];
        let user_mode = r & 0x30 != 0;
        let depth = (r >> 8) % STACK_FRAMES;
        let fp = STACK_TOP - (depth + 1) * FRAME_STRIDE;
        Some(InterruptFrame {
            regs: Registers {
                pc: if user_mode {
                    TEXT_BASE + (r >> 16) % TEXT_SIZE
                } else {
                    0xffff_8000_0000_0000 | (r >> 20)
                },
                sp: fp - 0x100,
                fp,
                lr: TEXT_BASE + (r >> 24) % TEXT_SIZE,
                user_mode,
            },
            task: TaskId::new(tgid, tgid + (r >> 40) as u32 % 4),
        })
    }

    fn core_name(&self, _core: CoreId) -> &str {
        "Synthetic-A"
    }
}

/// Frame records laid out every `FRAME_STRIDE` bytes up to `STACK_TOP`
struct SyntheticStack;

impl UserMemory for SyntheticStack {
    fn read_frame_tail(&self, task: TaskId, addr: u64) -> Option<FrameTail> {
        if addr >= STACK_TOP || addr < STACK_TOP - STACK_FRAMES * FRAME_STRIDE {
            return None;
        }
        let next = addr + FRAME_STRIDE;
        Some(FrameTail {
            fp: if next >= STACK_TOP { 0 } else { next },
            lr: TEXT_BASE + (addr ^ task.pid as u64) % TEXT_SIZE,
        })
    }
}

/// One cookie per synthetic process, named the first time it is seen
struct ProcessCookies {
    named: Vec<AtomicBool>,
}

impl ProcessCookies {
    fn new() -> Self {
        Self {
            named: PROCESSES.iter().map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Cookie 0 means unattributed, so real images start at 1
    fn cookie_of(&self, tgid: u32, names: &mut dyn NameSink) -> u32 {
        let Some(index) = PROCESSES.iter().position(|(t, _)| *t == tgid) else {
            return NO_COOKIE;
        };
        let cookie = index as u32 + 1;
        if !self.named[index].swap(true, Ordering::Relaxed) {
            names.cookie(cookie, PROCESSES[index].1);
        }
        cookie
    }
}

impl CookieResolver for ProcessCookies {
    fn release(&self) {
        for flag in &self.named {
            flag.store(false, Ordering::Relaxed);
        }
    }

    fn resolve_exec(&self, _core: CoreId, task: TaskId, names: &mut dyn NameSink) -> u32 {
        self.cookie_of(task.tgid, names)
    }

    fn resolve(
        &self,
        _core: CoreId,
        task: TaskId,
        address: u64,
        names: &mut dyn NameSink,
    ) -> (u32, u64) {
        if (TEXT_BASE..TEXT_BASE + TEXT_SIZE).contains(&address) {
            (self.cookie_of(task.tgid, names), address - TEXT_BASE)
        } else {
            (NO_COOKIE, address)
        }
    }
}

/// Monotonic per-core cycle counter
struct Cycles {
    counts: Vec<AtomicU64>,
}

const CYCLES_KEY: u32 = 10;

impl DataSource for Cycles {
    fn name(&self) -> &str {
        "cycles"
    }

    fn online(&self, core: CoreId, out: &mut dyn EventSink) {
        if let Some(c) = self.counts.get(core.as_usize()) {
            c.store(0, Ordering::Relaxed);
        }
        out.event(CYCLES_KEY, 0);
    }

    fn read(&self, core: CoreId, out: &mut dyn EventSink) {
        if let Some(c) = self.counts.get(core.as_usize()) {
            let delta = 1_000_000 + (core.as_u32() as u64 * 7919);
            out.event64(CYCLES_KEY, c.fetch_add(delta, Ordering::Relaxed) + delta);
        }
    }

    fn config_entries(&self) -> Vec<ConfigEntry> {
        vec![
            ConfigEntry::read_write("cycles/enabled", 1),
            ConfigEntry::read_only("cycles/key", CYCLES_KEY as u64),
        ]
    }
}

#[derive(Default)]
struct Stats {
    frames: HashMap<FrameType, (u64, u64)>,
    reads: u64,
    bytes: u64,
    malformed: u64,
}

impl Stats {
    fn record(&mut self, bytes: &[u8], with_response_type: bool) {
        self.reads += 1;
        self.bytes += bytes.len() as u64;
        for frame in FrameReader::new(bytes, with_response_type) {
            match frame {
                Ok(f) => {
                    let entry = self.frames.entry(f.frame_type).or_default();
                    entry.0 += 1;
                    entry.1 += f.payload.len() as u64;
                }
                Err(e) => {
                    error!(error = ?e, "malformed frame");
                    self.malformed += 1;
                }
            }
        }
    }
}

fn main() {
    if let Err(e) = gator::init_logging() {
        eprintln!("logging disabled: {e}");
    }

    let secs: u64 = env_get("GATOR_DRAIN_SECS", 2);
    let config = GatorConfig::from_env();
    config.log_summary();
    let cores = config.num_cores;

    let collector = match Collector::builder(config)
        .interrupts(Arc::new(SyntheticInterrupts::new(cores)))
        .cookies(Arc::new(ProcessCookies::new()))
        .user_memory(Arc::new(SyntheticStack))
        .source(Arc::new(Cycles {
            counts: (0..cores).map(|_| AtomicU64::new(0)).collect(),
        }))
        .build()
    {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };
    let control = ControlSurface::new(collector.clone());

    println!("=== gator drain ===\n");
    for entry in control.entries() {
        println!("  {:<24} {:>10}  {:?}", entry.path, entry.value, entry.access);
    }
    println!();

    // This process is the host: it owns the endpoints it opens
    let root = Caller::privileged();
    let buffer = match control.open_buffer(root) {
        Ok(b) => b,
        Err(e) => {
            error!(error = %e, errno = gator::to_errno(&e), "cannot open buffer");
            std::process::exit(1);
        }
    };
    let with_response_type = collector.response_type() != 0;

    // A reader that starts before collection sees end of stream at once
    if let Err(e) = control.write(root, Endpoint::Enable, 0, b"1\n") {
        error!(error = %e, errno = gator::to_errno(&e), "cannot enable collection");
        std::process::exit(1);
    }
    let started = Instant::now();

    let reader = {
        let cancel = CancellationToken::new();
        let unit = buffer.transfer_unit();
        thread::Builder::new()
            .name("drain-reader".into())
            .spawn(move || {
                let mut stats = Stats::default();
                let mut bytes = vec![0u8; unit];
                loop {
                    match buffer.read(&mut bytes, &cancel) {
                        Ok(0) => break,
                        Ok(n) => stats.record(&bytes[..n], with_response_type),
                        Err(e) => {
                            error!(error = %e, "read failed");
                            break;
                        }
                    }
                }
                // Dropping the handle releases the buffers
                drop(buffer);
                stats
            })
    };
    let reader = match reader {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "cannot spawn reader");
            std::process::exit(1);
        }
    };

    if let Err(e) = collector.annotate(std::process::id(), b"drain started") {
        error!(error = %e, "annotation failed");
    }

    // Take the last core out and back in half way through
    thread::sleep(Duration::from_secs(secs) / 2);
    if cores > 1 {
        let last = CoreId::new(cores as u32 - 1);
        for event in [CpuEvent::DownPrepare, CpuEvent::Online] {
            if let Err(e) = collector.notify_cpu(last, event) {
                error!(core = last.as_u32(), error = %e, "hot-plug event failed");
            }
        }
    }
    thread::sleep(Duration::from_secs(secs) / 2);

    if let Err(e) = control.write(root, Endpoint::Enable, 0, b"0\n") {
        error!(error = %e, "cannot disable collection");
    }
    let elapsed = started.elapsed();

    let stats = match reader.join() {
        Ok(s) => s,
        Err(_) => {
            error!("reader panicked");
            std::process::exit(1);
        }
    };
    info!(reads = stats.reads, bytes = stats.bytes, "drain finished");

    println!("=== Results ({:.2?}) ===", elapsed);
    println!("Reads:     {}", stats.reads);
    println!("Bytes:     {}", stats.bytes);
    println!("Malformed: {}", stats.malformed);
    println!();
    println!("  {:<14} {:>10} {:>12}", "channel", "frames", "payload");
    let mut rows: Vec<_> = stats.frames.into_iter().collect();
    rows.sort_by_key(|(t, _)| t.as_u32());
    for (frame_type, (frames, payload)) in rows {
        println!(
            "  {:<14} {:>10} {:>12}",
            frame_type.channel().name(),
            frames,
            payload
        );
    }
}
