//! Channel Buffer Store
//!
//! Every core owns one `ChannelRing` per channel kind. The ring records
//! (cursors, margins) live for the whole life of the collector; only the
//! byte storage behind them is mapped on setup and unmapped on teardown.
//!
//! Storage is viewed as `[AtomicU8]` so the producer filling the head and
//! the consumer copying the committed tail never race on plain bytes. The
//! commit cursor is the only visibility barrier: it is stored with
//! `Release` after the bytes it covers and loaded with `Acquire` by the
//! consumer.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, Ordering};

use gator_core::{ChannelKind, ConfigError, CoreId, GatorError, GatorResult, NUM_CHANNELS};
use tracing::debug;

use crate::config::GatorConfig;
use crate::platform;

/// One ring buffer: a (core, channel) instance
pub struct ChannelRing {
    core: CoreId,
    kind: ChannelKind,
    pub(crate) size: u32,
    pub(crate) mask: u32,
    storage: AtomicPtr<u8>,

    /// Next byte the producer writes
    pub(crate) write: AtomicU32,
    /// Start of the open frame; everything before it is visible
    pub(crate) commit: AtomicU32,
    /// Next byte the consumer copies
    pub(crate) read: AtomicU32,
    /// Sticky result of the last space check
    pub(crate) space_available: AtomicBool,

    pub(crate) space_margin: u32,
    pub(crate) recovery_margin: u32,
    pub(crate) commit_threshold: u32,

    /// Response type written ahead of each frame this session
    pub(crate) response_type: AtomicU32,
    /// Bytes of the open frame's header (0 = no frame open)
    pub(crate) header_len: AtomicU32,
    /// Bytes before the length field in the open frame's header
    pub(crate) prefix_len: AtomicU32,
}

impl ChannelRing {
    fn new(core: CoreId, kind: ChannelKind, config: &GatorConfig) -> Self {
        let size = config.buffer_size_of(kind);
        let (space_margin, recovery_margin) = config.margins(kind);
        Self {
            core,
            kind,
            size,
            mask: size.wrapping_sub(1),
            storage: AtomicPtr::new(std::ptr::null_mut()),
            write: AtomicU32::new(0),
            commit: AtomicU32::new(0),
            read: AtomicU32::new(0),
            space_available: AtomicBool::new(true),
            space_margin,
            recovery_margin,
            commit_threshold: config.commit_threshold_bytes(kind),
            response_type: AtomicU32::new(config.response_type),
            header_len: AtomicU32::new(0),
            prefix_len: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn core(&self) -> CoreId {
        self.core
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn has_storage(&self) -> bool {
        !self.storage.load(Ordering::Acquire).is_null()
    }

    /// The ring's bytes, or `None` before setup and after teardown
    #[inline]
    pub(crate) fn storage(&self) -> Option<&[AtomicU8]> {
        let base = self.storage.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        // Safety: base maps `size` bytes and AtomicU8 has the layout of u8.
        // The mapping is only released by `release`, whose callers
        // guarantee no producer or consumer holds this slice.
        Some(unsafe { std::slice::from_raw_parts(base as *const AtomicU8, self.size as usize) })
    }

    /// Whether committed bytes are waiting for the consumer
    #[inline]
    pub fn commit_ready(&self) -> bool {
        self.commit.load(Ordering::Acquire) != self.read.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.write.store(0, Ordering::Relaxed);
        self.commit.store(0, Ordering::Relaxed);
        self.read.store(0, Ordering::Relaxed);
        self.space_available.store(true, Ordering::Relaxed);
        self.header_len.store(0, Ordering::Relaxed);
        self.prefix_len.store(0, Ordering::Relaxed);
    }

    fn allocate(&self) -> GatorResult<()> {
        self.reset();
        // Annotations are core-agnostic: only the boot core stores them
        if self.kind.boot_core_only() && !self.core.is_boot() {
            return Ok(());
        }
        if self.has_storage() {
            return Ok(());
        }
        let base = platform::map_storage(self.size as usize).ok_or(GatorError::Allocation {
            core: self.core.as_u32(),
            channel: self.kind,
            bytes: self.size as usize,
        })?;
        self.storage.store(base, Ordering::Release);
        Ok(())
    }

    /// Unmap storage and reset cursors
    ///
    /// # Safety
    /// No producer may be running on this ring and the consumer must be
    /// excluded (buffer lock held).
    unsafe fn release(&self) {
        let base = self.storage.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !base.is_null() {
            platform::unmap_storage(base, self.size as usize);
        }
        self.reset();
    }

    /// Place all cursors at `pos` with no frame open
    #[cfg(test)]
    pub(crate) fn set_cursors(&self, pos: u32) {
        let pos = pos & self.mask;
        self.write.store(pos, Ordering::Relaxed);
        self.commit.store(pos, Ordering::Relaxed);
        self.read.store(pos, Ordering::Relaxed);
        self.header_len.store(0, Ordering::Relaxed);
        self.prefix_len.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for ChannelRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRing")
            .field("core", &self.core)
            .field("kind", &self.kind)
            .field("size", &self.size)
            .field("write", &self.write.load(Ordering::Relaxed))
            .field("commit", &self.commit.load(Ordering::Relaxed))
            .field("read", &self.read.load(Ordering::Relaxed))
            .field("space_available", &self.space_available.load(Ordering::Relaxed))
            .finish()
    }
}

/// All channel rings of one core
#[derive(Debug)]
pub struct CoreRings {
    rings: [ChannelRing; NUM_CHANNELS],
}

impl CoreRings {
    #[inline]
    pub fn get(&self, kind: ChannelKind) -> &ChannelRing {
        &self.rings[kind.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRing> {
        self.rings.iter()
    }
}

/// Per-core table of channel rings
#[derive(Debug)]
pub struct ChannelStore {
    cores: Box<[CoreRings]>,
    ready: AtomicBool,
}

impl ChannelStore {
    pub fn new(config: &GatorConfig) -> Self {
        let cores = CoreId::range(config.num_cores)
            .map(|core| CoreRings {
                rings: std::array::from_fn(|i| {
                    ChannelRing::new(core, ChannelKind::ALL[i], config)
                }),
            })
            .collect();
        Self {
            cores,
            ready: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    #[inline]
    pub fn core(&self, core: CoreId) -> Option<&CoreRings> {
        self.cores.get(core.as_usize())
    }

    #[inline]
    pub fn ring(&self, core: CoreId, kind: ChannelKind) -> Option<&ChannelRing> {
        self.core(core).map(|c| c.get(kind))
    }

    /// Every ring, core ascending then channel ascending
    pub fn rings(&self) -> impl Iterator<Item = &ChannelRing> {
        self.cores.iter().flat_map(|c| c.iter())
    }

    /// Whether storage is mapped
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Validate capacities and map storage for every ring
    ///
    /// On failure the rings mapped so far stay mapped; `teardown` frees
    /// them.
    pub fn setup(&self) -> GatorResult<()> {
        for kind in ChannelKind::ALL {
            let size = self.cores.first().map(|c| c.get(kind).size).unwrap_or(0);
            if !size.is_power_of_two() {
                return Err(ConfigError::NotPowerOfTwo {
                    channel: kind,
                    size,
                }
                .into());
            }
        }
        for ring in self.rings() {
            ring.allocate()?;
        }
        self.ready.store(true, Ordering::Release);
        debug!(cores = self.cores.len(), "channel storage mapped");
        Ok(())
    }

    /// Unmap every ring and reset cursors. Safe to call repeatedly.
    ///
    /// # Safety
    /// Producers must be stopped and the buffer lock held.
    pub unsafe fn teardown(&self) {
        self.ready.store(false, Ordering::Release);
        for ring in self.rings() {
            ring.release();
        }
    }

    /// First ring with committed data, in discovery order
    pub fn commit_ready(&self) -> Option<&ChannelRing> {
        self.rings().find(|r| r.commit_ready())
    }
}

impl Drop for ChannelStore {
    fn drop(&mut self) {
        // Safety: &mut self excludes every other user
        unsafe { self.teardown() }
    }
}
