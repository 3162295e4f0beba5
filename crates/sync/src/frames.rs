//! The pull wire format: a concatenation of self-describing frames until a
//! terminal end-marker. Each frame is a 1-byte tag (0x01 string, 0x02
//! binary, 0xFF end) followed, for the first two, by a 4-byte little-endian
//! length prefix and the payload.

use anyhow::bail;
use bytes::{
    Buf,
    BufMut,
    Bytes,
    BytesMut,
};

const TAG_STRING: u8 = 0x01;
const TAG_BINARY: u8 = 0x02;
const TAG_END: u8 = 0xFF;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 string payload, e.g. a table name.
    Str(String),
    /// Binary payload, e.g. an Arrow IPC batch.
    Bin(Bytes),
    /// Terminal marker; nothing follows.
    End,
}

pub fn encode_frame(frame: &Frame) -> Bytes {
    match frame {
        Frame::Str(text) => {
            let mut out = BytesMut::with_capacity(5 + text.len());
            out.put_u8(TAG_STRING);
            out.put_u32_le(text.len() as u32);
            out.put_slice(text.as_bytes());
            out.freeze()
        },
        Frame::Bin(payload) => {
            let mut out = BytesMut::with_capacity(5 + payload.len());
            out.put_u8(TAG_BINARY);
            out.put_u32_le(payload.len() as u32);
            out.put_slice(payload);
            out.freeze()
        },
        Frame::End => Bytes::from_static(&[TAG_END]),
    }
}

/// Incremental decoder: feed arbitrary chunk boundaries, pop complete
/// frames.
#[derive(Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    finished: bool,
}

impl FrameDecoder {
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    pub fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
        if self.finished {
            if !self.buffer.is_empty() {
                bail!("bytes after end-marker frame");
            }
            return Ok(None);
        }
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let tag = self.buffer[0];
        if tag == TAG_END {
            self.buffer.advance(1);
            self.finished = true;
            return Ok(Some(Frame::End));
        }
        if self.buffer.len() < 5 {
            return Ok(None);
        }
        let length = u32::from_le_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;
        if self.buffer.len() < 5 + length {
            return Ok(None);
        }
        self.buffer.advance(5);
        let payload = self.buffer.split_to(length).freeze();
        match tag {
            TAG_STRING => Ok(Some(Frame::Str(String::from_utf8(payload.to_vec())?))),
            TAG_BINARY => Ok(Some(Frame::Bin(payload))),
            other => bail!("unknown frame tag 0x{other:02x}"),
        }
    }

    /// True once the end-marker frame has been decoded.
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn frames_round_trip_across_chunk_boundaries() {
        let frames = vec![
            Frame::Str("users".into()),
            Frame::Bin(Bytes::from(vec![1u8, 2, 3, 4, 5])),
            Frame::Str("posts".into()),
            Frame::End,
        ];
        let mut wire = BytesMut::new();
        for frame in &frames {
            wire.extend_from_slice(&encode_frame(frame));
        }

        // Feed one byte at a time to exercise partial-frame handling.
        let mut decoder = FrameDecoder::default();
        let mut decoded = Vec::new();
        for byte in wire.iter() {
            decoder.feed(&[*byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                decoded.push(frame);
            }
        }
        assert_eq!(decoded, frames);
        assert!(decoder.is_finished());
    }

    #[test]
    fn empty_payloads_are_valid() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&encode_frame(&Frame::Str(String::new())));
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::Str(String::new())));
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn unknown_tags_are_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&[0x7f, 0, 0, 0, 0]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn trailing_bytes_after_end_are_rejected() {
        let mut decoder = FrameDecoder::default();
        decoder.feed(&encode_frame(&Frame::End));
        decoder.feed(&[0x01]);
        assert_eq!(decoder.next_frame().unwrap(), Some(Frame::End));
        assert!(decoder.next_frame().is_err());
    }
}
