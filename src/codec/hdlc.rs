//! Async-HDLC framing used by the diag log stream.
//!
//! ```text
//! <payload> <crc16:le> 0x7E      with 0x7D / 0x7E escaped as 0x7D, byte ^ 0x20
//! ```
//!
//! The CRC is CRC-16/X.25 (reflected 0x1021, initial 0xFFFF, inverted).

use bytes::{BufMut, BytesMut};
use crc::{Crc, CRC_16_IBM_SDLC};

use crate::error::{DiagError, Result};

/// Frame terminator.
pub const CONTROL_CHAR: u8 = 0x7E;
/// Escape marker.
pub const ESCAPE_CHAR: u8 = 0x7D;
/// Value XOR-ed into an escaped byte.
pub const ESCAPE_MASK: u8 = 0x20;

/// Size of the trailing CRC.
pub const CRC_LEN: usize = 2;

/// CRC-16/X.25 (IBM-SDLC) engine.
pub const HDLC_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

/// CRC-16/X.25 of `data`.
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    HDLC_CRC.checksum(data)
}

#[inline]
fn put_escaped(out: &mut BytesMut, byte: u8) {
    if byte == CONTROL_CHAR || byte == ESCAPE_CHAR {
        out.put_u8(ESCAPE_CHAR);
        out.put_u8(byte ^ ESCAPE_MASK);
    } else {
        out.put_u8(byte);
    }
}

/// Append the HDLC encoding of `payload` (CRC and terminator included).
pub fn encode_into(payload: &[u8], out: &mut BytesMut) {
    out.reserve(payload.len() + CRC_LEN + 2);
    for &byte in payload {
        put_escaped(out, byte);
    }
    for byte in crc16(payload).to_le_bytes() {
        put_escaped(out, byte);
    }
    out.put_u8(CONTROL_CHAR);
}

/// HDLC-encode `payload` into a new buffer.
///
/// ```
/// use diag_transport::codec::hdlc;
///
/// let frame = hdlc::encode(&[0x4b, 0x7e]);
/// assert_eq!(&frame[..3], &[0x4b, 0x7d, 0x5e]);
/// assert_eq!(*frame.last().unwrap(), hdlc::CONTROL_CHAR);
/// assert_eq!(hdlc::decode(&frame).unwrap(), vec![0x4b, 0x7e]);
/// ```
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(payload.len() + CRC_LEN + 2);
    encode_into(payload, &mut out);
    out.to_vec()
}

/// Remove escaping from `frame`, stopping at the first terminator.
///
/// Returns the unescaped bytes and the number of input bytes consumed
/// (terminator included). A trailing lone escape byte is dropped.
pub fn unescape(frame: &[u8]) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(frame.len());
    let mut i = 0;
    while i < frame.len() {
        match frame[i] {
            CONTROL_CHAR => return (out, i + 1),
            ESCAPE_CHAR => {
                if let Some(&next) = frame.get(i + 1) {
                    out.push(next ^ ESCAPE_MASK);
                }
                i += 2;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    (out, frame.len())
}

/// Decode one complete frame and verify its CRC.
///
/// Returns the payload without the CRC.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    let (mut data, _) = unescape(frame);
    check_crc(&mut data)?;
    Ok(data)
}

/// Verify and strip the trailing CRC of unescaped frame bytes.
pub fn check_crc(data: &mut Vec<u8>) -> Result<()> {
    if data.len() < CRC_LEN {
        return Err(DiagError::Malformed(format!(
            "HDLC frame of {} bytes has no CRC",
            data.len()
        )));
    }
    let split = data.len() - CRC_LEN;
    let expected = u16::from_le_bytes([data[split], data[split + 1]]);
    let actual = crc16(&data[..split]);
    if expected != actual {
        return Err(DiagError::Malformed(format!(
            "HDLC CRC mismatch: expected {:#06x}, computed {:#06x}",
            expected, actual
        )));
    }
    data.truncate(split);
    Ok(())
}
