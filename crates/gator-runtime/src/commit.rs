//! Frame Commit Protocol
//!
//! Producer-side operations on one ring. Only the ring's own core writes
//! through these, so the write cursor needs no lock.
//!
//! The `write_*` family performs no bounds check: callers reserve room
//! with `check_space` first and a write past the read cursor silently
//! corrupts unread data. Build with the `debug-bounds` feature to turn
//! that into a panic.

use std::sync::atomic::Ordering;

use gator_core::constants::{FRAME_LENGTH_SIZE, MAXSIZE_PACK32, MAXSIZE_PACK64};
use gator_core::pack::{pack_u32, pack_u64};

use crate::store::ChannelRing;

impl ChannelRing {
    /// Bytes from `from` up to the write cursor
    #[inline]
    fn filled_since(&self, from: u32) -> u32 {
        self.write.load(Ordering::Relaxed).wrapping_sub(from) & self.mask
    }

    /// Free space minus the current hysteresis margin. No side effects.
    #[inline]
    pub fn bytes_available(&self) -> u32 {
        let filled = self.filled_since(self.read.load(Ordering::Acquire));
        let margin = if self.space_available.load(Ordering::Relaxed) {
            self.space_margin
        } else {
            self.recovery_margin
        };
        (self.size - filled).saturating_sub(margin)
    }

    /// Record whether `bytes` fit and return the updated flag
    #[inline]
    pub fn check_space(&self, bytes: u32) -> bool {
        if !self.has_storage() {
            return false;
        }
        let ok = self.bytes_available() >= bytes;
        self.space_available.store(ok, Ordering::Relaxed);
        ok
    }

    /// Space usable without wrapping
    #[inline]
    pub fn contiguous_space_available(&self) -> u32 {
        let to_end = self.size - self.write.load(Ordering::Relaxed);
        self.bytes_available().min(to_end)
    }

    /// Bytes written since the last commit, open header included
    #[inline]
    pub fn pending_bytes(&self) -> u32 {
        self.filled_since(self.commit.load(Ordering::Relaxed))
    }

    pub fn write_bytes(&self, data: &[u8]) {
        let Some(buf) = self.storage() else {
            return;
        };
        let mut w = self.write.load(Ordering::Relaxed);
        #[cfg(feature = "debug-bounds")]
        let read = self.read.load(Ordering::Acquire);
        for &b in data {
            #[cfg(feature = "debug-bounds")]
            assert!(
                (w.wrapping_sub(read) & self.mask) + 1 < self.size,
                "{} channel of core {} overran its read cursor",
                self.kind(),
                self.core()
            );
            buf[w as usize].store(b, Ordering::Relaxed);
            w = (w + 1) & self.mask;
        }
        self.write.store(w, Ordering::Relaxed);
    }

    #[inline]
    pub fn write_packed(&self, x: u32) {
        let mut tmp = [0u8; MAXSIZE_PACK32];
        let n = pack_u32(x, &mut tmp);
        self.write_bytes(&tmp[..n]);
    }

    #[inline]
    pub fn write_packed64(&self, x: u64) {
        let mut tmp = [0u8; MAXSIZE_PACK64];
        let n = pack_u64(x, &mut tmp);
        self.write_bytes(&tmp[..n]);
    }

    /// Packed length followed by the raw bytes
    pub fn write_string(&self, s: &str) {
        self.write_packed(s.len() as u32);
        self.write_bytes(s.as_bytes());
    }

    /// Write the header of a new frame at the commit cursor
    ///
    /// A header that is already open with nothing after it is rewritten in
    /// place, so reopening is idempotent.
    pub fn open_frame(&self) {
        if !self.has_storage() {
            return;
        }
        let commit = self.commit.load(Ordering::Relaxed);
        if self.filled_since(commit) == self.header_len.load(Ordering::Relaxed) {
            self.write.store(commit, Ordering::Relaxed);
        }

        let start = self.write.load(Ordering::Relaxed);
        let response_type = self.response_type.load(Ordering::Relaxed);
        if response_type != 0 {
            self.write_packed(response_type);
        }
        let prefix = self.filled_since(start);
        // Length is backpatched on commit
        self.write_bytes(&[0; FRAME_LENGTH_SIZE]);
        self.write_packed(self.kind().frame_type().as_u32());
        self.write_packed(self.core().as_u32());

        self.prefix_len.store(prefix, Ordering::Relaxed);
        self.header_len.store(self.filled_since(start), Ordering::Relaxed);
    }

    /// Backpatch the open frame's length, publish it and open the next one
    ///
    /// Returns `false` when there was nothing to publish. The caller owns
    /// waking the consumer.
    pub fn commit(&self) -> bool {
        let Some(buf) = self.storage() else {
            return false;
        };
        let header = self.header_len.load(Ordering::Relaxed);
        if header == 0 {
            return false;
        }
        let commit = self.commit.load(Ordering::Relaxed);
        let filled = self.filled_since(commit);
        if filled <= header {
            return false;
        }

        let prefix = self.prefix_len.load(Ordering::Relaxed);
        let length = filled - prefix - FRAME_LENGTH_SIZE as u32;
        for (i, b) in length.to_le_bytes().into_iter().enumerate() {
            let at = commit.wrapping_add(prefix + i as u32) & self.mask;
            buf[at as usize].store(b, Ordering::Relaxed);
        }

        self.commit
            .store(self.write.load(Ordering::Relaxed), Ordering::Release);
        self.open_frame();
        true
    }

    /// Commit once the open frame holds the configured share of the ring
    #[inline]
    pub fn check_and_commit_if_large(&self) -> bool {
        if self.pending_bytes() >= self.commit_threshold {
            self.commit()
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatorConfig;
    use crate::store::ChannelStore;
    use gator_core::{ChannelKind, CoreId, FrameReader, FrameType};
    use proptest::prelude::*;

    fn store(size: u32, response_type: u32) -> ChannelStore {
        let cfg = GatorConfig::new()
            .num_cores(1)
            .buffer_size(ChannelKind::Backtrace, size)
            .response_type(response_type);
        let store = ChannelStore::new(&cfg);
        store.setup().unwrap();
        store
    }

    fn ring(store: &ChannelStore) -> &ChannelRing {
        store.ring(CoreId::BOOT, ChannelKind::Backtrace).unwrap()
    }

    /// Copy committed bytes out the way the consumer does
    fn consume(ring: &ChannelRing) -> Vec<u8> {
        let mut out = vec![0u8; ring.capacity() as usize];
        let n = ring.drain_into(&mut out).unwrap();
        out.truncate(n);
        out
    }

    #[test]
    fn test_open_frame_layout() {
        let s = store(1024, 1);
        let r = ring(&s);
        r.open_frame();
        // response type, 4 length bytes, frame type, core
        assert_eq!(r.header_len.load(Ordering::Relaxed), 7);
        assert_eq!(r.prefix_len.load(Ordering::Relaxed), 1);

        // Reopening an empty frame does not stack headers
        r.open_frame();
        assert_eq!(r.pending_bytes(), 7);
    }

    #[test]
    fn test_commit_backpatches_length() {
        let s = store(1024, 1);
        let r = ring(&s);
        r.open_frame();
        r.write_bytes(&[0xaa; 5]);
        assert!(r.commit());

        let bytes = consume(r);
        assert_eq!(bytes.len(), 12);
        // frame type + core + payload
        assert_eq!(&bytes[1..5], &7u32.to_le_bytes());

        let frame = FrameReader::new(&bytes, true).next().unwrap().unwrap();
        assert_eq!(frame.frame_type, FrameType::Backtrace);
        assert_eq!(frame.core, 0);
        assert_eq!(frame.payload, &[0xaa; 5]);

        // The next header is already open
        assert_eq!(r.pending_bytes(), 7);
    }

    #[test]
    fn test_commit_is_idempotent() {
        let s = store(1024, 0);
        let r = ring(&s);
        r.open_frame();
        assert!(!r.commit());
        r.write_packed(300);
        assert!(r.commit());
        let committed = r.commit.load(Ordering::Relaxed);
        assert!(!r.commit());
        assert_eq!(r.commit.load(Ordering::Relaxed), committed);
    }

    #[test]
    fn test_frame_split_by_wraparound() {
        let s = store(1024, 1);
        let r = ring(&s);
        // Frame starts 10 bytes before the physical end
        r.set_cursors(1024 - 10);
        r.open_frame();
        let header = r.header_len.load(Ordering::Relaxed);
        let payload: Vec<u8> = (0..40 - header as u8).collect();
        r.write_bytes(&payload);
        assert!(r.commit());
        assert!(r.commit.load(Ordering::Relaxed) < 1024 - 10);

        let bytes = consume(r);
        assert_eq!(bytes.len(), 40);
        let frame = FrameReader::new(&bytes, true).next().unwrap().unwrap();
        assert_eq!(frame.payload, payload.as_slice());
    }

    #[test]
    fn test_hysteresis() {
        let s = store(1024, 0);
        let r = ring(&s);
        // 1024/8 = 128 and 1024/2 = 512
        assert_eq!(r.bytes_available(), 1024 - 128);

        r.write_bytes(&[0; 800]);
        assert!(!r.check_space(100));
        assert_eq!(r.bytes_available(), 0);

        // Drain 400 bytes: 624 free clears the small margin for 200 bytes
        // but not the recovery one
        r.read.store(400, Ordering::Release);
        assert!(!r.check_space(200));
        assert_eq!(r.bytes_available(), 624 - 512);
        assert!(r.check_space(112));
        assert_eq!(r.bytes_available(), 624 - 128);
    }

    #[test]
    fn test_contiguous_space() {
        let s = store(1024, 0);
        let r = ring(&s);
        r.set_cursors(1000);
        assert_eq!(r.contiguous_space_available(), 24);
        r.set_cursors(0);
        assert_eq!(r.contiguous_space_available(), 1024 - 128);
    }

    #[test]
    fn test_no_storage_rejects_space() {
        let cfg = GatorConfig::new().num_cores(2);
        let s = ChannelStore::new(&cfg);
        s.setup().unwrap();
        let r = s.ring(CoreId::new(1), ChannelKind::Annotate).unwrap();
        assert!(!r.check_space(1));
        r.open_frame();
        r.write_bytes(b"ignored");
        assert!(!r.commit());
    }

    #[test]
    fn test_check_and_commit_threshold() {
        let s = store(1024, 0);
        let r = ring(&s);
        r.open_frame();
        r.write_bytes(&[1; 700]);
        assert!(!r.check_and_commit_if_large());
        r.write_bytes(&[1; 100]);
        assert!(r.check_and_commit_if_large());
    }

    proptest! {
        #[test]
        fn prop_committed_bytes_read_back_in_order(
            start in 0u32..1024,
            frames in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..120), 1..12),
        ) {
            let s = store(1024, 1);
            let r = ring(&s);
            r.set_cursors(start);
            r.open_frame();

            let mut expected = Vec::new();
            let mut got = Vec::new();
            for payload in &frames {
                if !r.check_space(payload.len() as u32) {
                    got.extend(consume(r));
                    prop_assert!(r.check_space(payload.len() as u32));
                }
                r.write_bytes(payload);
                prop_assert!(r.commit());
                expected.push(payload.clone());
            }
            got.extend(consume(r));

            let decoded: Vec<Vec<u8>> = FrameReader::new(&got, true)
                .map(|f| f.unwrap().payload.to_vec())
                .collect();
            prop_assert_eq!(decoded, expected);
        }

        #[test]
        fn prop_check_space_guarantees_room(
            start in 0u32..1024,
            fill in 0u32..1024,
            want in 1u32..1024,
        ) {
            let s = store(1024, 0);
            let r = ring(&s);
            r.set_cursors(start);
            let fill = fill.min(r.bytes_available());
            r.write_bytes(&vec![0; fill as usize]);
            if r.check_space(want) {
                prop_assert!(r.bytes_available() >= want);
                let read = r.read.load(Ordering::Relaxed);
                let filled = r.write.load(Ordering::Relaxed).wrapping_sub(read) & r.mask;
                prop_assert!(filled + want < r.capacity());
            }
        }

        #[test]
        fn prop_recovery_needs_larger_margin(drained in 0u32..1024) {
            let s = store(1024, 0);
            let r = ring(&s);
            r.write_bytes(&[0; 1000]);
            prop_assert!(!r.check_space(1));
            let drained = drained.min(1000);
            r.read.store(drained, Ordering::Release);
            let naive_free = 1024 - (1000 - drained);
            let ok = r.check_space(1);
            prop_assert_eq!(ok, naive_free > r.recovery_margin);
        }
    }
}
