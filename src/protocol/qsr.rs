//! Database file transfer records.
//!
//! Requests go out as raw user-space data, optionally prefixed with a
//! processor token:
//! ```text
//! [USER_SPACE_RAW_DATA:u32][token:i32]? [0x80][0x12][subsys_cmd:u16][version=1:u16][opcode:u16] <fields>
//! ```
//! Responses come back on the log stream with a v2 header followed by
//! `[version:u16][opcode:u16]` and the opcode's fields.

use std::fmt;

use bytes::{Buf, BufMut};

use super::stream::{
    DIAG_BAD_CMD_F, DIAG_SUBSYS_CMD_VER_2_F, DIAG_SUBSYS_DIAG_SERV, MDM_TOKEN, QSC_TOKEN,
    USER_SPACE_RAW_DATA_TYPE,
};
use super::wire_format::{SubsysV2Header, SUBSYS_V2_HEADER_SIZE};
use crate::error::{DiagError, Result};

/// Size of a database GUID.
pub const GUID_LEN: usize = 16;

/// Protocol version carried by every request and response.
pub const QSR_VERSION: u16 = 1;

/// Size of a request header.
pub const REQ_HEADER_SIZE: usize = 8;

/// Size of a response header.
pub const RSP_HEADER_SIZE: usize = SUBSYS_V2_HEADER_SIZE + 4;

/// Peripheral whose database is transferred, with its subsystem command code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QsrPeripheral {
    Modem,
    Apps,
    Wcnss,
    Adsp,
    Slpi,
}

impl QsrPeripheral {
    /// Peripherals in transfer order, with their notification mask bits.
    /// The apps bit (0x01) carries no database.
    pub const ORDERED: [(QsrPeripheral, u32); 4] = [
        (QsrPeripheral::Modem, 0x02),
        (QsrPeripheral::Adsp, 0x04),
        (QsrPeripheral::Wcnss, 0x08),
        (QsrPeripheral::Slpi, 0x10),
    ];

    #[inline]
    pub fn cmd_code(self) -> u16 {
        match self {
            QsrPeripheral::Modem => 0x0816,
            QsrPeripheral::Apps => 0x020F,
            QsrPeripheral::Wcnss => 0x141F,
            QsrPeripheral::Adsp => 0x0E10,
            QsrPeripheral::Slpi => 0x1A18,
        }
    }

    pub fn from_cmd_code(code: u16) -> Option<Self> {
        match code {
            0x0816 => Some(QsrPeripheral::Modem),
            0x020F => Some(QsrPeripheral::Apps),
            0x141F => Some(QsrPeripheral::Wcnss),
            0x0E10 => Some(QsrPeripheral::Adsp),
            0x1A18 => Some(QsrPeripheral::Slpi),
            _ => None,
        }
    }
}

/// Processor hosting the peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcKind {
    Msm,
    Mdm,
    Qsc,
}

impl ProcKind {
    /// Token written after the type tag, if any.
    #[inline]
    pub fn token(self) -> Option<i32> {
        match self {
            ProcKind::Msm => None,
            ProcKind::Mdm => Some(MDM_TOKEN),
            ProcKind::Qsc => Some(QSC_TOKEN),
        }
    }

    /// Processor index used for output directories.
    #[inline]
    pub fn index(self) -> usize {
        match self {
            ProcKind::Msm => 0,
            ProcKind::Mdm => 1,
            ProcKind::Qsc => 5,
        }
    }
}

/// Transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    List = 0,
    Open = 1,
    Read = 2,
    Close = 3,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Opcode::List),
            1 => Some(Opcode::Open),
            2 => Some(Opcode::Read),
            3 => Some(Opcode::Close),
            _ => None,
        }
    }
}

/// 16-byte database identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid(pub [u8; GUID_LEN]);

impl fmt::Display for Guid {
    /// `%08x-%04x-%04x-%02x%02x-%02x%02x%02x%02x%02x%02x` over the
    /// little-endian `u32`/`u16`/`u16` leading fields.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9],
            b[10],
            b[11],
            b[12],
            b[13],
            b[14],
            b[15]
        )
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guid({})", self)
    }
}

/// Outbound transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QsrRequest {
    List,
    Open { guid: Guid },
    Read { fd: u16, req_bytes: u32, offset: u32 },
    Close { fd: u16 },
}

impl QsrRequest {
    #[inline]
    pub fn opcode(&self) -> Opcode {
        match self {
            QsrRequest::List => Opcode::List,
            QsrRequest::Open { .. } => Opcode::Open,
            QsrRequest::Read { .. } => Opcode::Read,
            QsrRequest::Close { .. } => Opcode::Close,
        }
    }

    /// Encode the full device write for `peripheral` on `proc`.
    pub fn encode_into(&self, proc: ProcKind, peripheral: QsrPeripheral, buf: &mut impl BufMut) {
        buf.put_u32_le(USER_SPACE_RAW_DATA_TYPE);
        if let Some(token) = proc.token() {
            buf.put_i32_le(token);
        }
        buf.put_u8(DIAG_SUBSYS_CMD_VER_2_F);
        buf.put_u8(DIAG_SUBSYS_DIAG_SERV);
        buf.put_u16_le(peripheral.cmd_code());
        buf.put_u16_le(QSR_VERSION);
        buf.put_u16_le(self.opcode() as u16);
        match *self {
            QsrRequest::List => {}
            QsrRequest::Open { guid } => buf.put_slice(&guid.0),
            QsrRequest::Read {
                fd,
                req_bytes,
                offset,
            } => {
                buf.put_u16_le(fd);
                buf.put_u32_le(req_bytes);
                buf.put_u32_le(offset);
            }
            QsrRequest::Close { fd } => buf.put_u16_le(fd),
        }
    }
}

/// Entry of a LIST response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub guid: Guid,
    pub file_len: u32,
}

/// Decoded transfer response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QsrResponse {
    /// Peripheral rejected the request.
    BadCommand,
    List {
        status: u8,
        files: Vec<FileInfo>,
    },
    Open {
        guid: Guid,
        fd: u16,
        status: u8,
    },
    Read {
        header: SubsysV2Header,
        fd: u16,
        offset: u32,
        num_read: u32,
        status: u8,
        data: Vec<u8>,
    },
    Close {
        fd: u16,
        status: u8,
    },
}

fn short(what: &str, len: usize) -> DiagError {
    DiagError::Malformed(format!("{} response truncated at {} bytes", what, len))
}

impl QsrResponse {
    /// Decode an unframed response packet.
    pub fn decode(packet: &[u8]) -> Result<Self> {
        if packet.first() == Some(&DIAG_BAD_CMD_F) {
            return Ok(QsrResponse::BadCommand);
        }
        let header = SubsysV2Header::decode(packet).ok_or_else(|| short("transfer", packet.len()))?;
        let mut rest = &packet[SUBSYS_V2_HEADER_SIZE..];
        if rest.len() < 4 {
            return Err(short("transfer", packet.len()));
        }
        let version = rest.get_u16_le();
        let opcode = rest.get_u16_le();
        if version != QSR_VERSION {
            return Err(DiagError::Protocol(format!(
                "unsupported transfer version {}",
                version
            )));
        }
        let opcode = Opcode::from_u16(opcode)
            .ok_or_else(|| DiagError::Protocol(format!("unknown transfer opcode {}", opcode)))?;

        match opcode {
            Opcode::List => {
                if rest.len() < 2 {
                    return Err(short("list", packet.len()));
                }
                let status = rest.get_u8();
                let count = rest.get_u8() as usize;
                if rest.len() < count * (GUID_LEN + 4) {
                    return Err(short("list", packet.len()));
                }
                let files = (0..count)
                    .map(|_| {
                        let mut guid = [0u8; GUID_LEN];
                        rest.copy_to_slice(&mut guid);
                        FileInfo {
                            guid: Guid(guid),
                            file_len: rest.get_u32_le(),
                        }
                    })
                    .collect();
                Ok(QsrResponse::List { status, files })
            }
            Opcode::Open => {
                if rest.len() < GUID_LEN + 3 {
                    return Err(short("open", packet.len()));
                }
                let mut guid = [0u8; GUID_LEN];
                rest.copy_to_slice(&mut guid);
                Ok(QsrResponse::Open {
                    guid: Guid(guid),
                    fd: rest.get_u16_le(),
                    status: rest.get_u8(),
                })
            }
            Opcode::Read => {
                if rest.len() < 11 {
                    return Err(short("read", packet.len()));
                }
                let fd = rest.get_u16_le();
                let offset = rest.get_u32_le();
                let num_read = rest.get_u32_le();
                let status = rest.get_u8();
                let take = (num_read as usize).min(rest.len());
                Ok(QsrResponse::Read {
                    header,
                    fd,
                    offset,
                    num_read,
                    status,
                    data: rest[..take].to_vec(),
                })
            }
            Opcode::Close => {
                if rest.len() < 3 {
                    return Err(short("close", packet.len()));
                }
                Ok(QsrResponse::Close {
                    fd: rest.get_u16_le(),
                    status: rest.get_u8(),
                })
            }
        }
    }

    #[inline]
    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            QsrResponse::BadCommand => None,
            QsrResponse::List { .. } => Some(Opcode::List),
            QsrResponse::Open { .. } => Some(Opcode::Open),
            QsrResponse::Read { .. } => Some(Opcode::Read),
            QsrResponse::Close { .. } => Some(Opcode::Close),
        }
    }
}

/// True if `packet` is a transfer response (or a bad-command echo of a
/// transfer request).
pub fn is_transfer_response(packet: &[u8]) -> bool {
    let (cmd_code, version, opcode) = match packet {
        [DIAG_SUBSYS_CMD_VER_2_F, DIAG_SUBSYS_DIAG_SERV, ..] => {
            if packet.len() < RSP_HEADER_SIZE {
                return false;
            }
            (
                u16::from_le_bytes([packet[2], packet[3]]),
                u16::from_le_bytes([packet[12], packet[13]]),
                u16::from_le_bytes([packet[14], packet[15]]),
            )
        }
        [DIAG_BAD_CMD_F, DIAG_SUBSYS_CMD_VER_2_F, DIAG_SUBSYS_DIAG_SERV, ..] => {
            if packet.len() < 9 {
                return false;
            }
            (
                u16::from_le_bytes([packet[3], packet[4]]),
                u16::from_le_bytes([packet[5], packet[6]]),
                u16::from_le_bytes([packet[7], packet[8]]),
            )
        }
        _ => return false,
    };
    QsrPeripheral::from_cmd_code(cmd_code).is_some()
        && version == QSR_VERSION
        && Opcode::from_u16(opcode).is_some()
}

/// Encoders for peripheral-side responses, used by loopback peers.
pub mod encode {
    use super::*;

    fn header(buf: &mut impl BufMut, peripheral: QsrPeripheral, rsp_cnt: u16, opcode: Opcode) {
        let mut header = SubsysV2Header::new(DIAG_SUBSYS_DIAG_SERV, peripheral.cmd_code());
        header.rsp_cnt = rsp_cnt;
        header.encode_into(buf);
        buf.put_u16_le(QSR_VERSION);
        buf.put_u16_le(opcode as u16);
    }

    pub fn list(peripheral: QsrPeripheral, files: &[FileInfo]) -> Vec<u8> {
        let mut buf = Vec::new();
        header(&mut buf, peripheral, 0, Opcode::List);
        buf.put_u8(0);
        buf.put_u8(files.len() as u8);
        for file in files {
            buf.put_slice(&file.guid.0);
            buf.put_u32_le(file.file_len);
        }
        buf
    }

    pub fn open(peripheral: QsrPeripheral, guid: Guid, fd: u16, status: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        header(&mut buf, peripheral, 0, Opcode::Open);
        buf.put_slice(&guid.0);
        buf.put_u16_le(fd);
        buf.put_u8(status);
        buf
    }

    pub fn read(
        peripheral: QsrPeripheral,
        rsp_cnt: u16,
        fd: u16,
        offset: u32,
        data: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::new();
        header(&mut buf, peripheral, rsp_cnt, Opcode::Read);
        buf.put_u16_le(fd);
        buf.put_u32_le(offset);
        buf.put_u32_le(data.len() as u32);
        buf.put_u8(0);
        buf.put_slice(data);
        buf
    }

    pub fn close(peripheral: QsrPeripheral, fd: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        header(&mut buf, peripheral, 0, Opcode::Close);
        buf.put_u16_le(fd);
        buf.put_u8(0);
        buf
    }
}

/// Header written at the start of `.qmdl2` files.
///
/// ```text
/// [header_length:u32][version:u8][hdlc_data_type:u8][guid_count:u32][guid * count]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QshrinkHeader {
    guids: Vec<Guid>,
}

impl QshrinkHeader {
    const BASE_LEN: u32 = 10;

    pub fn new() -> Self {
        Self { guids: Vec::new() }
    }

    /// Record a database GUID. Duplicates are ignored.
    pub fn add_guid(&mut self, guid: Guid) {
        if !self.guids.contains(&guid) {
            self.guids.push(guid);
        }
    }

    pub fn guids(&self) -> &[Guid] {
        &self.guids
    }

    #[inline]
    pub fn header_length(&self) -> u32 {
        Self::BASE_LEN + (self.guids.len() * GUID_LEN) as u32
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.header_length());
        buf.put_u8(1);
        buf.put_u8(0);
        buf.put_u32_le(self.guids.len() as u32);
        for guid in &self.guids {
            buf.put_slice(&guid.0);
        }
    }
}

impl Default for QshrinkHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guid(seed: u8) -> Guid {
        let mut bytes = [0u8; GUID_LEN];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        Guid(bytes)
    }

    #[test]
    fn test_guid_display() {
        let g = Guid([
            0x78, 0x56, 0x34, 0x12, 0xbc, 0x9a, 0xf0, 0xde, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06,
            0x07, 0x88,
        ]);
        assert_eq!(g.to_string(), "12345678-9abc-def0-0102-030405060788");
    }

    #[test]
    fn test_list_request_msm() {
        let mut buf = Vec::new();
        QsrRequest::List.encode_into(ProcKind::Msm, QsrPeripheral::Modem, &mut buf);
        assert_eq!(
            buf,
            vec![0x80, 0, 0, 0, 0x80, 0x12, 0x16, 0x08, 1, 0, 0, 0]
        );
    }

    #[test]
    fn test_read_request_mdm() {
        let mut buf = Vec::new();
        QsrRequest::Read {
            fd: 3,
            req_bytes: 4000,
            offset: 4000,
        }
        .encode_into(ProcKind::Mdm, QsrPeripheral::Adsp, &mut buf);
        assert_eq!(buf.len(), 4 + 4 + REQ_HEADER_SIZE + 10);
        assert_eq!(&buf[4..8], &(-1i32).to_le_bytes());
        assert_eq!(&buf[14..16], &2u16.to_le_bytes());
        assert_eq!(&buf[18..22], &4000u32.to_le_bytes());
        assert_eq!(&buf[22..26], &4000u32.to_le_bytes());
    }

    #[test]
    fn test_decode_list() {
        let files = [
            FileInfo { guid: guid(1), file_len: 10 },
            FileInfo { guid: guid(2), file_len: 5000 },
        ];
        let packet = encode::list(QsrPeripheral::Modem, &files);
        assert!(is_transfer_response(&packet));
        assert_eq!(
            QsrResponse::decode(&packet).unwrap(),
            QsrResponse::List { status: 0, files: files.to_vec() }
        );
    }

    #[test]
    fn test_decode_read() {
        let packet = encode::read(QsrPeripheral::Slpi, 0x1001, 7, 4000, b"xyz");
        match QsrResponse::decode(&packet).unwrap() {
            QsrResponse::Read { header, fd, offset, num_read, status, data } => {
                assert_eq!(header.rsp_cnt, 0x1001);
                assert_eq!(fd, 7);
                assert_eq!(offset, 4000);
                assert_eq!(num_read, 3);
                assert_eq!(status, 0);
                assert_eq!(data, b"xyz");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_open_close() {
        let g = guid(9);
        assert_eq!(
            QsrResponse::decode(&encode::open(QsrPeripheral::Wcnss, g, 4, 0)).unwrap(),
            QsrResponse::Open { guid: g, fd: 4, status: 0 }
        );
        assert_eq!(
            QsrResponse::decode(&encode::close(QsrPeripheral::Wcnss, 4)).unwrap(),
            QsrResponse::Close { fd: 4, status: 0 }
        );
    }

    #[test]
    fn test_bad_command_echo() {
        let mut packet = vec![DIAG_BAD_CMD_F];
        QsrRequest::List.encode_into(ProcKind::Msm, QsrPeripheral::Modem, &mut packet);
        // drop the type tag that precedes the request on the way out
        packet.drain(1..5);
        assert!(is_transfer_response(&packet));
        assert_eq!(QsrResponse::decode(&packet).unwrap(), QsrResponse::BadCommand);
    }

    #[test]
    fn test_not_transfer_response() {
        let mut packet = encode::close(QsrPeripheral::Modem, 1);
        assert!(is_transfer_response(&packet));
        packet[2] = 0x99;
        assert!(!is_transfer_response(&packet));
        assert!(!is_transfer_response(&[0x4b, 0x12]));
        assert!(!is_transfer_response(&[]));
    }

    #[test]
    fn test_decode_truncated() {
        let packet = encode::open(QsrPeripheral::Modem, guid(0), 1, 0);
        assert!(matches!(
            QsrResponse::decode(&packet[..20]),
            Err(DiagError::Malformed(_))
        ));
    }

    #[test]
    fn test_qshrink_header() {
        let mut header = QshrinkHeader::new();
        header.add_guid(guid(1));
        header.add_guid(guid(1));
        header.add_guid(guid(2));

        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(header.header_length(), 42);
        assert_eq!(buf.len(), 42);
        assert_eq!(&buf[..4], &42u32.to_le_bytes());
        assert_eq!(buf[4], 1);
        assert_eq!(buf[5], 0);
    }
}
