//! Platform hooks: clocks, thread pinning, privilege and channel storage

use gator_core::CoreId;

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Monotonic clock in nanoseconds
        #[inline]
        pub fn monotonic_ns() -> u64 {
            let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
            // Safety: ts is a valid out-pointer; CLOCK_MONOTONIC always exists
            unsafe {
                libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
            }
            ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
        }

        /// Pin the calling thread to `core`
        pub fn pin_current_thread(core: CoreId) -> Result<(), nix::Error> {
            use nix::sched::{sched_setaffinity, CpuSet};
            use nix::unistd::Pid;

            let mut set = CpuSet::new();
            set.set(core.as_usize())?;
            sched_setaffinity(Pid::from_raw(0), &set)
        }
    } else {
        use std::sync::OnceLock;
        use std::time::Instant;

        static EPOCH: OnceLock<Instant> = OnceLock::new();

        /// Monotonic clock in nanoseconds since first use
        #[inline]
        pub fn monotonic_ns() -> u64 {
            EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
        }

        /// No affinity control on this platform
        pub fn pin_current_thread(_core: CoreId) -> Result<(), std::io::Error> {
            Ok(())
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Whether the calling process may open the data endpoint
        pub fn is_privileged() -> bool {
            nix::unistd::geteuid().is_root()
        }
    } else {
        pub fn is_privileged() -> bool {
            true
        }
    }
}

/// Wall-clock time in nanoseconds since the Unix epoch
pub fn wall_clock_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Map `len` zeroed bytes of channel storage
        pub(crate) fn map_storage(len: usize) -> Option<*mut u8> {
            // Safety: anonymous private mapping, no fd, no fixed address
            let base = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                None
            } else {
                Some(base as *mut u8)
            }
        }

        /// Release storage returned by `map_storage`
        ///
        /// # Safety
        /// `base` and `len` must come from one `map_storage` call and no
        /// reference into the region may outlive this call.
        pub(crate) unsafe fn unmap_storage(base: *mut u8, len: usize) {
            libc::munmap(base as *mut libc::c_void, len);
        }
    } else {
        use std::alloc::{alloc_zeroed, dealloc, Layout};

        pub(crate) fn map_storage(len: usize) -> Option<*mut u8> {
            let layout = Layout::array::<u8>(len).ok()?;
            // Safety: len is non-zero for every channel
            let base = unsafe { alloc_zeroed(layout) };
            if base.is_null() { None } else { Some(base) }
        }

        /// # Safety
        /// See the unix variant.
        pub(crate) unsafe fn unmap_storage(base: *mut u8, len: usize) {
            if let Ok(layout) = Layout::array::<u8>(len) {
                dealloc(base, layout);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = monotonic_ns();
        assert!(b > a);
    }

    #[test]
    fn test_storage_is_zeroed() {
        let base = map_storage(4096).unwrap();
        // Safety: freshly mapped 4096-byte region
        unsafe {
            let bytes = std::slice::from_raw_parts(base, 4096);
            assert!(bytes.iter().all(|&b| b == 0));
            unmap_storage(base, 4096);
        }
    }
}
