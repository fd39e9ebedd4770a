//! Host-side frame parser
//!
//! Layout of one committed frame:
//!
//! ```text
//! [response type, packed]   only when the producer's response_type != 0
//! [length, u32 LE]          bytes that follow this field
//! [frame type, packed]
//! [core, packed]
//! [payload ...]
//! ```
//!
//! A single drain returns one or more whole frames from one (core, channel)
//! ring, so the reader simply walks frames until the input is exhausted.

use crate::channel::FrameType;
use crate::constants::FRAME_LENGTH_SIZE;
use crate::pack::{unpack_u32, PackedReader};

/// One decoded frame borrowing its payload from the drained bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame<'a> {
    pub response_type: Option<u32>,
    pub frame_type: FrameType,
    pub core: u32,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Decoder positioned at the start of the payload
    pub fn reader(&self) -> PackedReader<'a> {
        PackedReader::new(self.payload)
    }
}

/// Malformed input found while walking frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    Truncated { offset: usize },
    UnknownType { offset: usize, tag: u32 },
}

/// Iterator over the frames in a drained byte range
#[derive(Debug, Clone)]
pub struct FrameReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    with_response_type: bool,
}

impl<'a> FrameReader<'a> {
    /// `with_response_type` must match the producer's response type setting
    pub fn new(bytes: &'a [u8], with_response_type: bool) -> Self {
        Self {
            bytes,
            pos: 0,
            with_response_type,
        }
    }

    fn parse_one(&mut self) -> Result<Frame<'a>, FrameParseError> {
        let start = self.pos;
        let truncated = FrameParseError::Truncated { offset: start };
        let mut pos = self.pos;

        let response_type = if self.with_response_type {
            let (v, n) = unpack_u32(&self.bytes[pos..]).ok_or(truncated.clone())?;
            pos += n;
            Some(v)
        } else {
            None
        };

        let len_bytes = self
            .bytes
            .get(pos..pos + FRAME_LENGTH_SIZE)
            .ok_or(truncated.clone())?;
        let length = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
            as usize;
        pos += FRAME_LENGTH_SIZE;

        let body = self.bytes.get(pos..pos + length).ok_or(truncated.clone())?;
        let mut r = PackedReader::new(body);
        let tag = r.read_u32().ok_or(truncated.clone())?;
        let core = r.read_u32().ok_or(truncated)?;
        let frame_type = FrameType::try_from(tag)
            .map_err(|tag| FrameParseError::UnknownType { offset: start, tag })?;
        let header = body.len() - r.remaining();

        self.pos = pos + length;
        Ok(Frame {
            response_type,
            frame_type,
            core,
            payload: &body[header..],
        })
    }
}

impl<'a> Iterator for FrameReader<'a> {
    type Item = Result<Frame<'a>, FrameParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let item = self.parse_one();
        if item.is_err() {
            // Stop after the first malformed frame
            self.pos = self.bytes.len();
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_bytes(response: Option<u8>, tag: u8, core: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        if let Some(r) = response {
            out.push(r);
        }
        let len = (2 + payload.len()) as u32;
        out.extend_from_slice(&len.to_le_bytes());
        out.push(tag);
        out.push(core);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_two_frames() {
        let mut bytes = frame_bytes(Some(1), 2, 3, &[9, 9, 9]);
        bytes.extend(frame_bytes(Some(1), 2, 3, &[]));

        let frames: Vec<_> = FrameReader::new(&bytes, true)
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].response_type, Some(1));
        assert_eq!(frames[0].frame_type, FrameType::Backtrace);
        assert_eq!(frames[0].core, 3);
        assert_eq!(frames[0].payload, &[9, 9, 9]);
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn test_without_response_type() {
        let bytes = frame_bytes(None, 1, 0, &[4]);
        let frame = FrameReader::new(&bytes, false).next().unwrap().unwrap();
        assert_eq!(frame.response_type, None);
        assert_eq!(frame.frame_type, FrameType::Summary);
    }

    #[test]
    fn test_truncated_and_unknown() {
        let mut bytes = frame_bytes(Some(1), 2, 0, &[1, 2, 3]);
        bytes.pop();
        let err = FrameReader::new(&bytes, true).next().unwrap().unwrap_err();
        assert_eq!(err, FrameParseError::Truncated { offset: 0 });

        let bytes = frame_bytes(Some(1), 42, 0, &[]);
        let mut reader = FrameReader::new(&bytes, true);
        assert_eq!(
            reader.next().unwrap().unwrap_err(),
            FrameParseError::UnknownType { offset: 0, tag: 42 }
        );
        assert!(reader.next().is_none());
    }
}
