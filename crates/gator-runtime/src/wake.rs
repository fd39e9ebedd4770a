//! Consumer wait queue and deferred wake-up
//!
//! Producers never wake the consumer themselves. A commit only raises a
//! pending flag; the `gator-wake` thread notices it on its next quantum
//! and notifies the wait queue from an ordinary thread context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use gator_core::{CancellationToken, GatorError, GatorResult};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

/// Wait queue the consumer sleeps on
#[derive(Debug, Default)]
pub struct BufferWait {
    lock: Mutex<()>,
    cond: Condvar,
}

impl BufferWait {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake every waiter so it re-evaluates its condition
    pub fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }

    /// Sleep until `ready` holds or `cancel` fires
    ///
    /// `ready` is evaluated under the queue lock, so a `wake_all` issued
    /// after the state change cannot be missed. Cancellation is noticed
    /// within `poll`.
    pub fn wait_until<F>(
        &self,
        mut ready: F,
        cancel: &CancellationToken,
        poll: Duration,
    ) -> GatorResult<()>
    where
        F: FnMut() -> bool,
    {
        let mut guard = self.lock.lock();
        loop {
            if ready() {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(GatorError::Interrupted);
            }
            self.cond.wait_for(&mut guard, poll);
        }
    }
}

/// Pending-wake flag set from producer context
#[derive(Debug, Default)]
pub struct DeferredWake {
    pending: AtomicBool,
}

impl DeferredWake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a consumer wake after the current quantum. Never blocks.
    #[inline]
    pub fn schedule(&self) {
        self.pending.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}

/// The thread that turns pending flags into wake-ups
pub(crate) struct WakeThread {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WakeThread {
    pub(crate) fn spawn(
        pending: Arc<DeferredWake>,
        wait: Arc<BufferWait>,
        quantum: Duration,
    ) -> std::io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = thread::Builder::new()
            .name("gator-wake".into())
            .spawn(move || {
                debug!(?quantum, "deferred waker started");
                while !stop.load(Ordering::Acquire) {
                    thread::park_timeout(quantum);
                    if pending.take() {
                        trace!("waking consumer");
                        wait.wake_all();
                    }
                }
                // Flush anything committed during shutdown
                if pending.take() {
                    wait.wake_all();
                }
            })?;
        Ok(Self { shutdown, handle })
    }

    pub(crate) fn stop(self) {
        self.shutdown.store(true, Ordering::Release);
        self.handle.thread().unpark();
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_wait_returns_when_ready() {
        let wait = BufferWait::new();
        let token = CancellationToken::new();
        wait.wait_until(|| true, &token, Duration::from_millis(5))
            .unwrap();
    }

    #[test]
    fn test_wait_is_cancellable() {
        let wait = Arc::new(BufferWait::new());
        let token = CancellationToken::new();
        let cancel = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            cancel.cancel();
        });
        let err = wait
            .wait_until(|| false, &token, Duration::from_millis(5))
            .unwrap_err();
        assert!(matches!(err, GatorError::Interrupted));
        canceller.join().unwrap();
    }

    #[test]
    fn test_deferred_wake_reaches_waiter() {
        let wait = Arc::new(BufferWait::new());
        let pending = Arc::new(DeferredWake::new());
        let waker = WakeThread::spawn(pending.clone(), wait.clone(), Duration::from_millis(1)).unwrap();

        let flag = Arc::new(AtomicBool::new(false));
        let producer = {
            let flag = flag.clone();
            let pending = pending.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::Release);
                pending.schedule();
            })
        };

        let start = Instant::now();
        // Long poll: only the deferred wake can end this promptly
        wait.wait_until(
            || flag.load(Ordering::Acquire),
            &CancellationToken::new(),
            Duration::from_secs(10),
        )
        .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));

        producer.join().unwrap();
        waker.stop();
    }
}
