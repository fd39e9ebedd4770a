//! Packed integer codec
//!
//! Values are split into 7-bit groups, least significant first, with the
//! high bit of each byte marking continuation. A group whose bit 6 is set
//! is never the final one, so the stream is also a valid signed LEB128
//! encoding of the same positive value and host-side signed decoders read
//! it unchanged.
//!
//! Worst case is 5 bytes for a `u32` and 10 bytes for a `u64`.

use crate::constants::{MAXSIZE_PACK32, MAXSIZE_PACK64};

/// Encode `x` into `out`, returning the number of bytes used
#[inline]
pub fn pack_u32(x: u32, out: &mut [u8; MAXSIZE_PACK32]) -> usize {
    let mut scratch = [0u8; MAXSIZE_PACK64];
    let n = pack_u64(x as u64, &mut scratch);
    out[..n].copy_from_slice(&scratch[..n]);
    n
}

/// Encode `x` into `out`, returning the number of bytes used
#[inline]
pub fn pack_u64(mut x: u64, out: &mut [u8; MAXSIZE_PACK64]) -> usize {
    let mut n = 0;
    loop {
        let b = (x & 0x7f) as u8;
        x >>= 7;
        if x == 0 && b & 0x40 == 0 {
            out[n] = b;
            return n + 1;
        }
        out[n] = b | 0x80;
        n += 1;
    }
}

/// Decode a packed 64-bit value from the front of `bytes`
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends mid-value or runs past 10 bytes. A terminating group with
/// bit 6 set is sign-extended, matching signed producers.
pub fn unpack_u64(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &b) in bytes.iter().take(MAXSIZE_PACK64).enumerate() {
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            if shift < 64 && b & 0x40 != 0 {
                value |= !0u64 << shift;
            }
            return Some((value, i + 1));
        }
    }
    None
}

/// Decode a packed 32-bit value from the front of `bytes`
pub fn unpack_u32(bytes: &[u8]) -> Option<(u32, usize)> {
    let (value, used) = unpack_u64(&bytes[..bytes.len().min(MAXSIZE_PACK32)])?;
    Some((value as u32, used))
}

/// Sequential decoder over a frame payload
#[derive(Debug, Clone)]
pub struct PackedReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PackedReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        let (v, n) = unpack_u32(&self.bytes[self.pos..])?;
        self.pos += n;
        Some(v)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        let (v, n) = unpack_u64(&self.bytes[self.pos..])?;
        self.pos += n;
        Some(v)
    }

    /// Read `len` raw bytes
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.bytes.get(self.pos..end)?;
        self.pos = end;
        Some(out)
    }

    /// Read a packed-length-prefixed string
    pub fn read_string(&mut self) -> Option<&'a str> {
        let len = self.read_u32()? as usize;
        core::str::from_utf8(self.read_bytes(len)?).ok()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip32(v: u32) -> (u32, usize) {
        let mut buf = [0u8; MAXSIZE_PACK32];
        let n = pack_u32(v, &mut buf);
        let (back, used) = unpack_u32(&buf[..n]).unwrap();
        assert_eq!(used, n);
        (back, n)
    }

    #[test]
    fn test_u32_boundaries() {
        assert_eq!(roundtrip32(0), (0, 1));
        // bit 6 set in the only group forces a second byte
        assert_eq!(roundtrip32(63), (63, 1));
        assert_eq!(roundtrip32(64), (64, 2));
        assert_eq!(roundtrip32(127), (127, 2));
        assert_eq!(roundtrip32(128), (128, 2));
        assert_eq!(roundtrip32(u32::MAX), (u32::MAX, MAXSIZE_PACK32));
    }

    #[test]
    fn test_u64_boundaries() {
        let mut buf = [0u8; MAXSIZE_PACK64];
        let n = pack_u64(0, &mut buf);
        assert_eq!(unpack_u64(&buf[..n]), Some((0, 1)));

        let n = pack_u64(u64::MAX, &mut buf);
        assert_eq!(n, MAXSIZE_PACK64);
        assert_eq!(unpack_u64(&buf[..n]), Some((u64::MAX, MAXSIZE_PACK64)));
    }

    #[test]
    fn test_exact_bytes() {
        let mut buf = [0u8; MAXSIZE_PACK32];
        let n = pack_u32(128, &mut buf);
        assert_eq!(&buf[..n], &[0x80, 0x01]);
        let n = pack_u32(127, &mut buf);
        assert_eq!(&buf[..n], &[0xff, 0x00]);
    }

    #[test]
    fn test_signed_stream_is_sign_extended() {
        // -1 as a one-byte signed group
        assert_eq!(unpack_u64(&[0x7f]), Some((u64::MAX, 1)));
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(unpack_u64(&[0x80, 0x80]), None);
        assert_eq!(unpack_u64(&[]), None);
    }

    #[test]
    fn test_reader_sequence() {
        let mut bytes = Vec::new();
        let mut buf = [0u8; MAXSIZE_PACK64];
        for v in [1u64, 300, 1 << 40] {
            let n = pack_u64(v, &mut buf);
            bytes.extend_from_slice(&buf[..n]);
        }
        let n = pack_u64(5, &mut buf);
        bytes.extend_from_slice(&buf[..n]);
        bytes.extend_from_slice(b"hello");

        let mut r = PackedReader::new(&bytes);
        assert_eq!(r.read_u64(), Some(1));
        assert_eq!(r.read_u32(), Some(300));
        assert_eq!(r.read_u64(), Some(1 << 40));
        assert_eq!(r.read_string(), Some("hello"));
        assert!(r.is_empty());
        assert_eq!(r.read_u32(), None);
    }

    proptest! {
        #[test]
        fn prop_u64_roundtrip(v in any::<u64>()) {
            let mut buf = [0u8; MAXSIZE_PACK64];
            let n = pack_u64(v, &mut buf);
            prop_assert!(n <= MAXSIZE_PACK64);
            prop_assert_eq!(unpack_u64(&buf[..n]), Some((v, n)));
        }

        #[test]
        fn prop_u32_roundtrip(v in any::<u32>()) {
            let (back, n) = roundtrip32(v);
            prop_assert!(n <= MAXSIZE_PACK32);
            prop_assert_eq!(back, v);
        }
    }
}
