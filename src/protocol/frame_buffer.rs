//! Frame buffer for extracting command responses from the log stream.
//!
//! Log data arrives in arbitrary slices. The buffer accumulates bytes and
//! yields complete packets in one of two framings:
//!
//! - **HDLC**: escaped bytes terminated by `0x7E`; the CRC is verified and
//!   stripped.
//! - **Non-HDLC**: `[0x7E][version=1][len:u16][payload][0x7E]`, implemented as
//!   a state machine:
//!   - `WaitingForHeader`: need 4 bytes
//!   - `WaitingForPayload`: header parsed, need `len + 1` more bytes
//!
//! # Example
//!
//! ```
//! use diag_transport::protocol::{FrameBuffer, Framing};
//! use diag_transport::codec::hdlc;
//!
//! let mut buffer = FrameBuffer::new(Framing::Hdlc);
//! let frame = hdlc::encode(b"\x80\x12abc");
//!
//! assert!(buffer.push(&frame[..3]).is_empty());
//! let packets = buffer.push(&frame[3..]);
//! assert_eq!(packets, vec![b"\x80\x12abc".to_vec()]);
//! ```

use bytes::{Buf, BytesMut};

use crate::codec::hdlc::{self, CONTROL_CHAR};

/// Size of the non-HDLC frame header.
pub const NON_HDLC_HEADER_SIZE: usize = 4;

/// Version byte of non-HDLC frames.
pub const NON_HDLC_VERSION: u8 = 1;

/// Default cap on a buffered frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Framing of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Hdlc,
    NonHdlc,
}

/// State machine for non-HDLC parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the 4-byte header.
    WaitingForHeader,
    /// Header parsed, waiting for payload plus trailer.
    WaitingForPayload { len: usize },
}

/// Accumulates log stream bytes and extracts packets.
pub struct FrameBuffer {
    buffer: BytesMut,
    framing: Framing,
    state: State,
    max_frame_size: usize,
}

impl FrameBuffer {
    pub fn new(framing: Framing) -> Self {
        Self::with_max_frame(framing, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            framing,
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Switch framing. Buffered bytes are discarded.
    pub fn set_framing(&mut self, framing: Framing) {
        if self.framing != framing {
            self.framing = framing;
            self.clear();
        }
    }

    #[inline]
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Push data and extract every complete packet.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);

        let mut packets = Vec::new();
        loop {
            let next = match self.framing {
                Framing::Hdlc => self.try_extract_hdlc(),
                Framing::NonHdlc => self.try_extract_non_hdlc(),
            };
            match next {
                Extract::Packet(packet) => packets.push(packet),
                Extract::Skipped => continue,
                Extract::NeedMore => break,
            }
        }
        packets
    }

    fn try_extract_hdlc(&mut self) -> Extract {
        let Some(end) = self.buffer.iter().position(|&b| b == CONTROL_CHAR) else {
            if self.buffer.len() > self.max_frame_size {
                tracing::warn!(
                    "Discarding {} bytes without HDLC terminator",
                    self.buffer.len()
                );
                self.buffer.clear();
            }
            return Extract::NeedMore;
        };

        let raw = self.buffer.split_to(end + 1);
        if end == 0 {
            return Extract::Skipped;
        }
        let (mut packet, _) = hdlc::unescape(&raw);
        match hdlc::check_crc(&mut packet) {
            Ok(()) => Extract::Packet(packet),
            Err(e) => {
                tracing::warn!("Dropping log stream frame: {}", e);
                Extract::Skipped
            }
        }
    }

    fn try_extract_non_hdlc(&mut self) -> Extract {
        match self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < NON_HDLC_HEADER_SIZE {
                    return Extract::NeedMore;
                }
                if self.buffer[0] != CONTROL_CHAR || self.buffer[1] != NON_HDLC_VERSION {
                    // resync on the next start byte
                    let skip = self.buffer[1..]
                        .iter()
                        .position(|&b| b == CONTROL_CHAR)
                        .map_or(self.buffer.len(), |p| p + 1);
                    tracing::debug!("Skipping {} bytes of unframed log data", skip);
                    self.buffer.advance(skip);
                    return Extract::Skipped;
                }
                let len = u16::from_le_bytes([self.buffer[2], self.buffer[3]]) as usize;
                if len > self.max_frame_size {
                    tracing::warn!(
                        "Non-HDLC frame of {} bytes exceeds {}",
                        len,
                        self.max_frame_size
                    );
                    self.buffer.advance(1);
                    return Extract::Skipped;
                }
                self.buffer.advance(NON_HDLC_HEADER_SIZE);
                self.state = State::WaitingForPayload { len };
                self.try_extract_non_hdlc()
            }
            State::WaitingForPayload { len } => {
                if self.buffer.len() < len + 1 {
                    return Extract::NeedMore;
                }
                let packet = self.buffer.split_to(len).to_vec();
                let trailer = self.buffer.get_u8();
                self.state = State::WaitingForHeader;
                if trailer != CONTROL_CHAR {
                    tracing::warn!("Non-HDLC frame trailer {:#04x}", trailer);
                }
                Extract::Packet(packet)
            }
        }
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.state = State::WaitingForHeader;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

enum Extract {
    Packet(Vec<u8>),
    Skipped,
    NeedMore,
}

/// Wrap `payload` in a non-HDLC frame.
pub fn non_hdlc_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + NON_HDLC_HEADER_SIZE + 1);
    frame.push(CONTROL_CHAR);
    frame.push(NON_HDLC_VERSION);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.push(CONTROL_CHAR);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hdlc_multiple_frames_in_one_push() {
        let mut buffer = FrameBuffer::new(Framing::Hdlc);
        let mut data = hdlc::encode(b"one");
        data.extend_from_slice(&hdlc::encode(b"two\x7e"));

        let packets = buffer.push(&data);
        assert_eq!(packets, vec![b"one".to_vec(), b"two\x7e".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_hdlc_leading_flag_and_bad_crc() {
        let mut buffer = FrameBuffer::new(Framing::Hdlc);
        let mut bad = hdlc::encode(b"bad");
        bad[0] = b'c';
        let mut data = vec![CONTROL_CHAR];
        data.extend_from_slice(&bad);
        data.extend_from_slice(&hdlc::encode(b"good"));

        assert_eq!(buffer.push(&data), vec![b"good".to_vec()]);
    }

    #[test]
    fn test_non_hdlc_fragmented() {
        let mut buffer = FrameBuffer::new(Framing::NonHdlc);
        let frame = non_hdlc_frame(b"payload");

        assert!(buffer.push(&frame[..2]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert!(buffer.push(&frame[2..6]).is_empty());
        assert_eq!(buffer.state_name(), "WaitingForPayload");
        assert_eq!(buffer.push(&frame[6..]), vec![b"payload".to_vec()]);
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_non_hdlc_resync() {
        let mut buffer = FrameBuffer::new(Framing::NonHdlc);
        let mut data = vec![0x01, 0x02, 0x03];
        data.extend_from_slice(&non_hdlc_frame(b"ok"));
        data.extend_from_slice(&non_hdlc_frame(b""));

        assert_eq!(buffer.push(&data), vec![b"ok".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_set_framing_clears() {
        let mut buffer = FrameBuffer::new(Framing::Hdlc);
        buffer.push(b"partial");
        assert_eq!(buffer.len(), 7);
        buffer.set_framing(Framing::NonHdlc);
        assert!(buffer.is_empty());
        assert_eq!(buffer.framing(), Framing::NonHdlc);
    }

    #[test]
    fn test_hdlc_overflow_discarded() {
        let mut buffer = FrameBuffer::with_max_frame(Framing::Hdlc, 8);
        assert!(buffer.push(&[0x11; 16]).is_empty());
        assert!(buffer.is_empty());
    }
}
