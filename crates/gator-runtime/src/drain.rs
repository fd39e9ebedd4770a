//! Consumer drain
//!
//! One reader at a time blocks until some ring has committed data or
//! collection stops, then copies one ring's committed bytes out. Rings
//! are scanned core ascending, channel ascending on every call, so a busy
//! ring at the front cannot starve the rest for more than one read each.

use std::sync::atomic::{AtomicBool, Ordering};

use gator_core::{CancellationToken, GatorError, GatorResult, UsageError};
use tracing::trace;

use crate::lifecycle::Collector;
use crate::store::ChannelRing;

impl ChannelRing {
    /// Copy committed-but-unread bytes into `out` and release them
    ///
    /// The range may wrap, in which case it is copied as two spans.
    /// Returns `None` when the ring has no storage.
    pub(crate) fn drain_into(&self, out: &mut [u8]) -> Option<usize> {
        let buf = self.storage()?;
        let commit = self.commit.load(Ordering::Acquire);
        let read = self.read.load(Ordering::Relaxed);
        let len = ((commit.wrapping_sub(read) & self.mask) as usize).min(out.len());

        let start = read as usize;
        let first = len.min(self.size as usize - start);
        for (dst, src) in out[..first].iter_mut().zip(&buf[start..start + first]) {
            *dst = src.load(Ordering::Relaxed);
        }
        for (dst, src) in out[first..len].iter_mut().zip(&buf[..len - first]) {
            *dst = src.load(Ordering::Relaxed);
        }

        let next = read.wrapping_add(len as u32) & self.mask;
        self.read.store(next, Ordering::Release);
        Some(len)
    }
}

/// Marks the single reader slot taken until dropped
struct ActiveReader<'a>(&'a AtomicBool);

impl Drop for ActiveReader<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Collector {
    /// Block until committed data is available and copy it into `buf`
    ///
    /// `buf` must be exactly [`transfer_unit`](Collector::transfer_unit)
    /// bytes. Returns the byte count of whole frames from one core's
    /// channel, or 0 once collection has stopped and everything was
    /// drained. Cancelling `cancel` ends the wait with
    /// [`GatorError::Interrupted`].
    pub fn blocking_read(&self, buf: &mut [u8], cancel: &CancellationToken) -> GatorResult<usize> {
        let inner = &self.inner;
        let expected = inner.config.transfer_unit();
        if buf.len() != expected {
            return Err(UsageError::TransferSize {
                expected,
                actual: buf.len(),
            }
            .into());
        }
        if !inner.store.is_ready() {
            return Err(UsageError::NotSetUp.into());
        }
        if inner.reader_active.swap(true, Ordering::AcqRel) {
            return Err(UsageError::ConcurrentRead.into());
        }
        let _active = ActiveReader(&inner.reader_active);

        inner.wait.wait_until(
            || inner.store.commit_ready().is_some() || !inner.running.load(Ordering::Acquire),
            cancel,
            inner.config.read_poll,
        )?;

        let copied = {
            let _buffers = inner.buffer_lock.lock();
            let Some(ring) = inner.store.commit_ready() else {
                // Woken by stop with nothing left
                return Ok(0);
            };
            let n = ring.drain_into(buf).ok_or(GatorError::BufferReleased {
                core: ring.core().as_u32(),
                channel: ring.kind(),
            })?;
            trace!(core = ring.core().as_u32(), channel = %ring.kind(), bytes = n, "drained");
            n
        };

        // Commits may have been coalesced while we waited
        inner.wait.wake_all();
        Ok(copied)
    }
}
