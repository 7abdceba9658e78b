//! Frame codecs for the duplex channel
//!
//! The transport never looks inside a frame. A codec only decides where one
//! frame ends and the next begins:
//!
//! - [`Framing::Lines`]: one frame per `\n`-terminated line (JSONL style).
//!   The delimiter is stripped and nothing else; blank lines are skipped,
//!   so empty payloads are refused on encode.
//! - [`Framing::LengthPrefixed`]: a 4-byte big-endian length followed by the
//!   payload.
//!
//! Oversized frames are reported as [`FrameError::TooLarge`] and skipped, so
//! the decoder resynchronises on the next frame. Bytes left over when the
//! stream ends are reported as [`FrameError::Truncated`].

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound for a single frame (8 MiB)
pub const DEFAULT_MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

const LENGTH_HEADER: usize = 4;

/// How frames are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Newline-delimited frames
    #[default]
    Lines,
    /// 4-byte big-endian length prefix
    LengthPrefixed,
}

/// Stateful encoder/decoder for one direction of the channel
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_len: usize,
    // Lines: offset already scanned for a delimiter.
    next_index: usize,
    // Lines: dropping an oversized line until the next delimiter.
    discarding: bool,
    // LengthPrefixed: payload bytes of an oversized frame still to drop.
    skip: usize,
}

impl FrameCodec {
    /// Create a codec with the given framing and maximum frame size
    pub fn new(framing: Framing, max_frame_len: usize) -> Self {
        Self {
            framing,
            max_frame_len,
            next_index: 0,
            discarding: false,
            skip: 0,
        }
    }

    /// Newline-delimited codec with the default maximum
    pub fn lines() -> Self {
        Self::new(Framing::Lines, DEFAULT_MAX_FRAME_LEN)
    }

    /// Length-prefixed codec with the default maximum
    pub fn length_prefixed() -> Self {
        Self::new(Framing::LengthPrefixed, DEFAULT_MAX_FRAME_LEN)
    }

    /// Framing used by this codec
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Maximum frame size in bytes
    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }

    fn decode_line(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        loop {
            let newline = buf[self.next_index..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.clear();
                    self.next_index = 0;
                    return Ok(None);
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let mut line = buf.split_to(end + 1);
                    line.truncate(end);
                    if end > self.max_frame_len {
                        return Err(FrameError::TooLarge {
                            len: end,
                            max: self.max_frame_len,
                        });
                    }
                    if line.is_empty() {
                        continue;
                    }
                    return Ok(Some(line.freeze()));
                }
                (false, None) if buf.len() > self.max_frame_len => {
                    let len = buf.len();
                    buf.clear();
                    self.next_index = 0;
                    self.discarding = true;
                    return Err(FrameError::TooLarge {
                        len,
                        max: self.max_frame_len,
                    });
                }
                (false, None) => {
                    self.next_index = buf.len();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_length_prefixed(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if self.skip > 0 {
            let n = self.skip.min(buf.len());
            buf.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }

        if buf.len() < LENGTH_HEADER {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > self.max_frame_len {
            buf.advance(LENGTH_HEADER);
            self.skip = len;
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if buf.len() < LENGTH_HEADER + len {
            buf.reserve(LENGTH_HEADER + len - buf.len());
            return Ok(None);
        }

        buf.advance(LENGTH_HEADER);
        Ok(Some(buf.split_to(len).freeze()))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::lines()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        match self.framing {
            Framing::Lines => self.decode_line(buf),
            Framing::LengthPrefixed => self.decode_length_prefixed(buf),
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        // An oversized frame cut short by EOF was already reported.
        let was_skipping = self.discarding || self.skip > 0;
        self.discarding = false;
        self.skip = 0;
        self.next_index = 0;

        if buf.is_empty() || was_skipping {
            buf.clear();
            return Ok(None);
        }

        let remaining = buf.len();
        buf.clear();
        Err(FrameError::Truncated { remaining })
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if frame.len() > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len: frame.len(),
                max: self.max_frame_len,
            });
        }

        match self.framing {
            Framing::Lines => {
                if frame.is_empty() {
                    return Err(FrameError::Empty);
                }
                if let Some(pos) = frame.iter().position(|b| *b == b'\n') {
                    return Err(FrameError::EmbeddedDelimiter(pos));
                }
                dst.reserve(frame.len() + 1);
                dst.put_slice(&frame);
                dst.put_u8(b'\n');
            }
            Framing::LengthPrefixed => {
                let len = u32::try_from(frame.len()).map_err(|_| FrameError::TooLarge {
                    len: frame.len(),
                    max: u32::MAX as usize,
                })?;
                dst.reserve(LENGTH_HEADER + frame.len());
                dst.put_u32(len);
                dst.put_slice(&frame);
            }
        }
        Ok(())
    }
}
