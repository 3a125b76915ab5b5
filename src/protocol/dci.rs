//! DCI envelopes.
//!
//! Outbound requests:
//! ```text
//! [DCI_DATA:u32][uid:i32][client_id:i32] <request>
//! [DCI_DATA:u32][type:i32][client_id:i32][set:i32][count:i32] <codes>
//! ```
//!
//! Inbound `DCI_DATA` chunks carry `[proc:i32][len:i32]` followed by
//! sub-records, each introduced by an `i32` type:
//!
//! | Type | Layout |
//! |---|---|
//! | `0` response | `[len:i32][delete:u8][uid:i32][payload: len-4]` |
//! | `-1` log | `[log_len:u16 ...]`, `log_len` bytes in total |
//! | `-2` event | `[event_len:u16][event_len bytes]` |
//! | `-3` extended | `[ext:8][inner_type:i32][inner_len:u16 ...]` |

use bytes::{Buf, BufMut};

use super::stream::DCI_DATA_TYPE;

/// Sub-record type of a command response.
pub const DCI_PKT_RSP_TYPE: i32 = 0;
/// Sub-record type of a log.
pub const DCI_LOG_TYPE: i32 = -1;
/// Sub-record type of an event.
pub const DCI_EVENT_TYPE: i32 = -2;
/// Sub-record type of an extended-header packet.
pub const DCI_EXT_HDR_TYPE: i32 = -3;

/// Size of the extended header.
pub const DCI_EXT_HDR_LEN: usize = 8;

/// Size of the `[uid][client_id]` request header following the type tag.
pub const DCI_SEND_HEADER_LEN: usize = 12;

/// Size of the stream config header.
pub const DCI_STREAM_HEADER_LEN: usize = 20;

/// Write the header of an outbound DCI request.
pub fn encode_send_header(buf: &mut impl BufMut, uid: i32, client_id: i32) {
    buf.put_u32_le(DCI_DATA_TYPE);
    buf.put_i32_le(uid);
    buf.put_i32_le(client_id);
}

/// Kind of stream being configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Log,
    Event,
}

impl StreamKind {
    #[inline]
    pub fn wire_type(self) -> i32 {
        match self {
            StreamKind::Log => DCI_LOG_TYPE,
            StreamKind::Event => DCI_EVENT_TYPE,
        }
    }
}

/// Header of a log or event stream configuration request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciStreamHeader {
    pub kind: StreamKind,
    pub client_id: i32,
    pub set: bool,
    pub count: i32,
}

impl DciStreamHeader {
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(DCI_DATA_TYPE);
        buf.put_i32_le(self.kind.wire_type());
        buf.put_i32_le(self.client_id);
        buf.put_i32_le(i32::from(self.set));
        buf.put_i32_le(self.count);
    }
}

/// Per-client drop/receive counters reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthStats {
    pub dropped_logs: i32,
    pub dropped_events: i32,
    pub received_logs: i32,
    pub received_events: i32,
}

/// Leading `[proc][len]` of a `DCI_DATA` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciDataHeader {
    pub proc: i32,
    pub len: i32,
}

impl DciDataHeader {
    pub const SIZE: usize = 8;

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.proc);
        buf.put_i32_le(self.len);
    }

    /// Returns `None` if the buffer is too short.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            proc: buf.get_i32_le(),
            len: buf.get_i32_le(),
        })
    }
}

/// One decoded `DCI_DATA` sub-record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DciRecord<'a> {
    /// Response to a transaction.
    Response {
        delete: bool,
        uid: i32,
        payload: &'a [u8],
    },
    /// Log packet, as delivered to the log stream handler.
    Log(&'a [u8]),
    /// Event packet, as delivered to the event stream handler.
    Event(&'a [u8]),
}

impl DciRecord<'_> {
    /// Encode in the inbound layout (type tag included).
    ///
    /// Log payloads must begin with their own `u16` length; event payloads
    /// are encoded with a length prefix.
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        match *self {
            DciRecord::Response {
                delete,
                uid,
                payload,
            } => {
                buf.put_i32_le(DCI_PKT_RSP_TYPE);
                buf.put_i32_le(payload.len() as i32 + 4);
                buf.put_u8(u8::from(delete));
                buf.put_i32_le(uid);
                buf.put_slice(payload);
            }
            DciRecord::Log(log) => {
                buf.put_i32_le(DCI_LOG_TYPE);
                buf.put_slice(log);
            }
            DciRecord::Event(event) => {
                buf.put_i32_le(DCI_EVENT_TYPE);
                buf.put_slice(event);
            }
        }
    }
}

/// Iterator over the sub-records of a `DCI_DATA` body.
///
/// Iteration stops at the declared length, at an unknown type, or at the first
/// truncated record.
pub struct DciRecords<'a> {
    data: &'a [u8],
    pos: usize,
    version: u8,
}

impl<'a> DciRecords<'a> {
    /// `body` is everything after the `[proc][len]` header, already limited
    /// to the declared length. `version` selects extended header handling.
    pub fn new(body: &'a [u8], version: u8) -> Self {
        Self {
            data: body,
            pos: 0,
            version,
        }
    }

    fn stop(&mut self, reason: &str) -> Option<DciRecord<'a>> {
        tracing::warn!(
            "DCI record at offset {} dropped: {} ({} bytes left)",
            self.pos,
            reason,
            self.data.len() - self.pos
        );
        self.pos = self.data.len();
        None
    }

    fn le_u16(&self, at: usize) -> Option<usize> {
        let bytes = self.data.get(at..at + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
    }

    fn le_i32(&self, at: usize) -> Option<i32> {
        let bytes = self.data.get(at..at + 4)?;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take(&mut self, start: usize, len: usize, advance: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(start..start + len)?;
        self.pos += advance;
        Some(slice)
    }
}

impl<'a> Iterator for DciRecords<'a> {
    type Item = DciRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.pos >= self.data.len() {
                return None;
            }
            let Some(kind) = self.le_i32(self.pos) else {
                return self.stop("truncated type");
            };
            let body = self.pos + 4;

            match kind {
                DCI_PKT_RSP_TYPE => {
                    let Some(len) = self.le_i32(body) else {
                        return self.stop("truncated response length");
                    };
                    if len < 4 {
                        return self.stop("response shorter than its uid");
                    }
                    let len = len as usize;
                    let Some(record) = self.data.get(body + 4..body + 5 + len) else {
                        return self.stop("truncated response");
                    };
                    let delete = record[0] != 0;
                    let uid = i32::from_le_bytes([record[1], record[2], record[3], record[4]]);
                    self.pos = body + 5 + len;
                    return Some(DciRecord::Response {
                        delete,
                        uid,
                        payload: &record[5..],
                    });
                }
                DCI_LOG_TYPE => {
                    let Some(len) = self.le_u16(body) else {
                        return self.stop("truncated log length");
                    };
                    if len < 2 {
                        return self.stop("log shorter than its length field");
                    }
                    return match self.take(body, len, 4 + len) {
                        Some(log) => Some(DciRecord::Log(log)),
                        None => self.stop("truncated log"),
                    };
                }
                DCI_EVENT_TYPE => {
                    let Some(len) = self.le_u16(body) else {
                        return self.stop("truncated event length");
                    };
                    return match self.take(body, 2 + len, 6 + len) {
                        Some(event) => Some(DciRecord::Event(event)),
                        None => self.stop("truncated event"),
                    };
                }
                DCI_EXT_HDR_TYPE => {
                    let inner = body + DCI_EXT_HDR_LEN;
                    let (Some(inner_type), Some(inner_len)) =
                        (self.le_i32(inner), self.le_u16(inner + 4))
                    else {
                        return self.stop("truncated extended header");
                    };
                    let extra = if inner_type == DCI_EVENT_TYPE { 2 } else { 0 };
                    let header = DCI_EXT_HDR_LEN + 4;
                    let advance = 4 + header + inner_len + extra;
                    let (start, len) = if self.version > 0 {
                        (body, header + inner_len + extra)
                    } else {
                        (inner + 4, inner_len + extra)
                    };
                    let Some(payload) = self.take(start, len, advance) else {
                        return self.stop("truncated extended packet");
                    };
                    match inner_type {
                        DCI_LOG_TYPE => return Some(DciRecord::Log(payload)),
                        DCI_EVENT_TYPE => return Some(DciRecord::Event(payload)),
                        other => {
                            tracing::warn!("Skipping extended packet with inner type {}", other);
                            continue;
                        }
                    }
                }
                other => return self.stop(&format!("unknown record type {}", other)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_packet(code: u16, extra: &[u8]) -> Vec<u8> {
        let len = (4 + extra.len()) as u16;
        let mut buf = Vec::new();
        buf.put_u16_le(len);
        buf.put_u16_le(code);
        buf.put_slice(extra);
        buf
    }

    fn ext_record(inner_type: i32, inner: &[u8], inner_len: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.put_i32_le(DCI_EXT_HDR_TYPE);
        buf.put_slice(&[0xee; DCI_EXT_HDR_LEN]);
        buf.put_i32_le(inner_type);
        buf.put_slice(inner);
        assert_eq!(inner_len as usize, inner.len() - if inner_type == DCI_EVENT_TYPE { 2 } else { 0 });
        buf
    }

    #[test]
    fn test_send_header() {
        let mut buf = Vec::new();
        encode_send_header(&mut buf, 7, 3);
        assert_eq!(buf.len(), DCI_SEND_HEADER_LEN);
        assert_eq!(&buf[..4], &[0x40, 0, 0, 0]);
        assert_eq!(&buf[4..8], &7i32.to_le_bytes());
        assert_eq!(&buf[8..], &3i32.to_le_bytes());
    }

    #[test]
    fn test_stream_header() {
        let mut buf = Vec::new();
        DciStreamHeader {
            kind: StreamKind::Event,
            client_id: 2,
            set: true,
            count: 3,
        }
        .encode_into(&mut buf);
        assert_eq!(buf.len(), DCI_STREAM_HEADER_LEN);
        assert_eq!(&buf[4..8], &(-2i32).to_le_bytes());
        assert_eq!(&buf[12..16], &1i32.to_le_bytes());
    }

    #[test]
    fn test_response_record() {
        let mut buf = Vec::new();
        DciRecord::Response {
            delete: true,
            uid: 42,
            payload: b"abcd",
        }
        .encode_into(&mut buf);

        let records: Vec<_> = DciRecords::new(&buf, 0).collect();
        assert_eq!(
            records,
            vec![DciRecord::Response {
                delete: true,
                uid: 42,
                payload: b"abcd"
            }]
        );
    }

    #[test]
    fn test_mixed_records() {
        let log = log_packet(0x1234, &[9, 9]);
        let mut event = Vec::new();
        event.put_u16_le(3);
        event.put_slice(&[1, 2, 3]);

        let mut buf = Vec::new();
        DciRecord::Log(&log).encode_into(&mut buf);
        DciRecord::Event(&event).encode_into(&mut buf);
        DciRecord::Response {
            delete: false,
            uid: 1,
            payload: &[],
        }
        .encode_into(&mut buf);

        let records: Vec<_> = DciRecords::new(&buf, 0).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0], DciRecord::Log(&log));
        assert_eq!(records[1], DciRecord::Event(&event));
        assert!(matches!(records[2], DciRecord::Response { uid: 1, delete: false, .. }));
    }

    #[test]
    fn test_ext_header_stripped_for_version_zero() {
        let log = log_packet(0x1010, &[]);
        let buf = ext_record(DCI_LOG_TYPE, &log, log.len() as u16);

        let records: Vec<_> = DciRecords::new(&buf, 0).collect();
        assert_eq!(records, vec![DciRecord::Log(&log)]);
    }

    #[test]
    fn test_ext_header_kept_for_version_one() {
        let log = log_packet(0x1010, &[5]);
        let buf = ext_record(DCI_LOG_TYPE, &log, log.len() as u16);

        let records: Vec<_> = DciRecords::new(&buf, 1).collect();
        assert_eq!(records, vec![DciRecord::Log(&buf[4..])]);
        assert_eq!(buf[4..].len(), log.len() + 12);
    }

    #[test]
    fn test_ext_event_adds_length_field() {
        let mut event = Vec::new();
        event.put_u16_le(2);
        event.put_slice(&[7, 7]);
        let buf = ext_record(DCI_EVENT_TYPE, &event, 2);

        let records: Vec<_> = DciRecords::new(&buf, 0).collect();
        assert_eq!(records, vec![DciRecord::Event(&event)]);
    }

    #[test]
    fn test_unknown_type_stops() {
        let mut buf = Vec::new();
        buf.put_i32_le(-9);
        buf.put_slice(&[0; 16]);
        DciRecord::Response {
            delete: true,
            uid: 5,
            payload: &[1],
        }
        .encode_into(&mut buf);

        assert_eq!(DciRecords::new(&buf, 0).count(), 0);
    }

    #[test]
    fn test_truncated_response_stops() {
        let mut buf = Vec::new();
        buf.put_i32_le(DCI_PKT_RSP_TYPE);
        buf.put_i32_le(100);
        buf.put_u8(1);
        buf.put_i32_le(9);

        assert_eq!(DciRecords::new(&buf, 0).count(), 0);
    }

    #[test]
    fn test_data_header() {
        let mut buf = Vec::new();
        DciDataHeader { proc: 1, len: 30 }.encode_into(&mut buf);
        assert_eq!(
            DciDataHeader::decode(&buf),
            Some(DciDataHeader { proc: 1, len: 30 })
        );
        assert!(DciDataHeader::decode(&buf[..7]).is_none());
    }
}
