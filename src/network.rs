/**
 * network.rs
 *
 * Line framing shared by the directory server and peer protocols.
 *
 * A frame starts at the first non-whitespace byte and ends at the first
 * whitespace byte that is not a plain space (CR, LF, tab, ...). Leading
 * whitespace is never part of a frame, so the LF of a CRLF pair is simply
 * skipped when the next frame is decoded.
 */

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Longest frame accepted by default, in bytes
pub const DEFAULT_MAX_LINE_LENGTH: usize = 8192;

/// Terminator appended to every outgoing frame
pub const LINE_TERMINATOR: &[u8] = b"\r\n";

/// Line codec errors
#[derive(Debug, Error)]
pub enum LineCodecError {
    #[error("line exceeds {0} bytes")]
    MaxLineLengthExceeded(usize),

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("line contains an embedded terminator")]
    EmbeddedTerminator,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Result of checking a buffer for a complete frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// At least this many more bytes are needed
    Incomplete(usize),

    /// The frame occupies `start..end`; `end` is the index of its terminator
    Complete { start: usize, end: usize },
}

/// Whitespace as the protocol sees it (C `isspace`, which includes VT)
pub fn is_whitespace(byte: u8) -> bool {
    matches!(byte, b' ' | b'\t' | b'\n' | 0x0b | 0x0c | b'\r')
}

/// Whitespace that ends a frame
pub fn is_terminator(byte: u8) -> bool {
    byte != b' ' && is_whitespace(byte)
}

/// Frame completion predicate
pub fn frame_status(buf: &[u8]) -> FrameStatus {
    let start = match buf.iter().position(|&b| !is_whitespace(b)) {
        Some(start) => start,
        None => return FrameStatus::Incomplete(1),
    };

    match buf[start + 1..].iter().position(|&b| is_terminator(b)) {
        Some(offset) => FrameStatus::Complete {
            start,
            end: start + 1 + offset,
        },
        None => FrameStatus::Incomplete(1),
    }
}

/// Frame extraction: the first complete line with leading whitespace removed
pub fn extract_frame(buf: &[u8]) -> Option<&[u8]> {
    match frame_status(buf) {
        FrameStatus::Complete { start, end } => Some(&buf[start..end]),
        FrameStatus::Incomplete(_) => None,
    }
}

/// `tokio_util` codec producing one `String` per protocol line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineCodec {
    max_length: usize,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = LineCodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, LineCodecError> {
        match frame_status(buf) {
            FrameStatus::Complete { start, end } => {
                if end - start > self.max_length {
                    return Err(LineCodecError::MaxLineLengthExceeded(self.max_length));
                }

                // Consume the frame together with its terminator
                let frame = buf.split_to(end + 1);
                let line = std::str::from_utf8(&frame[start..end])
                    .map_err(|_| LineCodecError::InvalidUtf8)?;
                Ok(Some(line.to_string()))
            }
            FrameStatus::Incomplete(_) => {
                let leading = buf.iter().take_while(|&&b| is_whitespace(b)).count();
                buf.advance(leading);

                if buf.len() > self.max_length {
                    return Err(LineCodecError::MaxLineLengthExceeded(self.max_length));
                }
                Ok(None)
            }
        }
    }
}

impl<T: AsRef<str>> Encoder<T> for LineCodec {
    type Error = LineCodecError;

    fn encode(&mut self, line: T, dst: &mut BytesMut) -> Result<(), LineCodecError> {
        let line = line.as_ref().as_bytes();
        if line.iter().any(|&b| is_terminator(b)) {
            return Err(LineCodecError::EmbeddedTerminator);
        }
        if line.len() > self.max_length {
            return Err(LineCodecError::MaxLineLengthExceeded(self.max_length));
        }

        dst.reserve(line.len() + LINE_TERMINATOR.len());
        dst.put_slice(line);
        dst.put_slice(LINE_TERMINATOR);
        Ok(())
    }
}
