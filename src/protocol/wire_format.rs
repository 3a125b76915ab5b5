//! Command packet headers.
//!
//! ```text
//! legacy:        [cmd:u8] ...
//! subsystem:     [cmd:u8][subsys:u8][subsys_cmd:u16]
//! subsystem v2:  [cmd:u8][subsys:u8][subsys_cmd:u16][status:u32][delayed_rsp_id:u16][rsp_cnt:u16]
//! DCI packet:    [start:u8][version:u8][len:u16][pkt_code:u8][tag:i32] <packet> [end:u8]
//! ```
//!
//! All multi-byte integers are little endian.

use bytes::{Buf, BufMut};

use super::stream::{DIAG_SUBSYS_CMD_F, DIAG_SUBSYS_CMD_VER_2_F};

/// Size of a subsystem header.
pub const SUBSYS_HEADER_SIZE: usize = 4;

/// Size of a subsystem v2 header.
pub const SUBSYS_V2_HEADER_SIZE: usize = 12;

/// Size of the DCI packet envelope preceding a command.
pub const DCI_PKT_HEADER_SIZE: usize = 9;

/// Sequence counters at or above this value mean more parts follow.
pub const RSP_CNT_MORE_FOLLOWS: u16 = 0x1000;

/// Decoded subsystem header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsysHeader {
    pub cmd_code: u8,
    pub subsys_id: u8,
    pub subsys_cmd_code: u16,
}

impl SubsysHeader {
    pub fn new(subsys_id: u8, subsys_cmd_code: u16) -> Self {
        Self {
            cmd_code: DIAG_SUBSYS_CMD_F,
            subsys_id,
            subsys_cmd_code,
        }
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.cmd_code);
        buf.put_u8(self.subsys_id);
        buf.put_u16_le(self.subsys_cmd_code);
    }

    /// Returns `None` if the buffer is too short.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < SUBSYS_HEADER_SIZE {
            return None;
        }
        Some(Self {
            cmd_code: buf.get_u8(),
            subsys_id: buf.get_u8(),
            subsys_cmd_code: buf.get_u16_le(),
        })
    }
}

/// Decoded subsystem v2 header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsysV2Header {
    pub cmd_code: u8,
    pub subsys_id: u8,
    pub subsys_cmd_code: u16,
    pub status: u32,
    pub delayed_rsp_id: u16,
    pub rsp_cnt: u16,
}

impl SubsysV2Header {
    pub fn new(subsys_id: u8, subsys_cmd_code: u16) -> Self {
        Self {
            cmd_code: DIAG_SUBSYS_CMD_VER_2_F,
            subsys_id,
            subsys_cmd_code,
            status: 0,
            delayed_rsp_id: 0,
            rsp_cnt: 0,
        }
    }

    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.cmd_code);
        buf.put_u8(self.subsys_id);
        buf.put_u16_le(self.subsys_cmd_code);
        buf.put_u32_le(self.status);
        buf.put_u16_le(self.delayed_rsp_id);
        buf.put_u16_le(self.rsp_cnt);
    }

    /// Overwrite the header at the start of `packet`.
    ///
    /// Does nothing if `packet` is shorter than the header.
    pub fn write_to(&self, packet: &mut [u8]) {
        if packet.len() >= SUBSYS_V2_HEADER_SIZE {
            let mut dst = &mut packet[..SUBSYS_V2_HEADER_SIZE];
            self.encode_into(&mut dst);
        }
    }

    /// Returns `None` if the buffer is too short.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < SUBSYS_V2_HEADER_SIZE {
            return None;
        }
        Some(Self {
            cmd_code: buf.get_u8(),
            subsys_id: buf.get_u8(),
            subsys_cmd_code: buf.get_u16_le(),
            status: buf.get_u32_le(),
            delayed_rsp_id: buf.get_u16_le(),
            rsp_cnt: buf.get_u16_le(),
        })
    }

    /// True if this is the final part of a delayed response sequence.
    #[inline]
    pub fn is_last_part(&self) -> bool {
        self.rsp_cnt > 0 && self.rsp_cnt < RSP_CNT_MORE_FOLLOWS
    }
}

/// Envelope of a command packet relayed over DCI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DciPktHeader {
    pub start: u8,
    pub version: u8,
    pub len: u16,
    pub pkt_code: u8,
    pub tag: i32,
}

impl DciPktHeader {
    pub fn encode_into(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.start);
        buf.put_u8(self.version);
        buf.put_u16_le(self.len);
        buf.put_u8(self.pkt_code);
        buf.put_i32_le(self.tag);
    }

    /// Returns `None` if the buffer is too short.
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < DCI_PKT_HEADER_SIZE {
            return None;
        }
        Some(Self {
            start: buf.get_u8(),
            version: buf.get_u8(),
            len: buf.get_u16_le(),
            pkt_code: buf.get_u8(),
            tag: buf.get_i32_le(),
        })
    }
}

/// Lookup key of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandKey {
    pub cmd_code: u8,
    /// `None` for legacy commands.
    pub subsys_id: Option<u8>,
    /// Subsystem command for subsystem packets, the command code otherwise.
    pub code: u16,
}

impl CommandKey {
    /// Extract the lookup key of `packet`.
    ///
    /// Returns `None` for an empty packet or a truncated subsystem header.
    pub fn of(packet: &[u8]) -> Option<Self> {
        let cmd_code = *packet.first()?;
        if cmd_code == DIAG_SUBSYS_CMD_F || cmd_code == DIAG_SUBSYS_CMD_VER_2_F {
            let header = SubsysHeader::decode(packet)?;
            Some(Self {
                cmd_code,
                subsys_id: Some(header.subsys_id),
                code: header.subsys_cmd_code,
            })
        } else {
            Some(Self {
                cmd_code,
                subsys_id: None,
                code: u16::from(cmd_code),
            })
        }
    }

    /// True for v2 subsystem packets.
    #[inline]
    pub fn is_v2(&self) -> bool {
        self.cmd_code == DIAG_SUBSYS_CMD_VER_2_F
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subsys_v2_layout() {
        let mut header = SubsysV2Header::new(18, 0x0816);
        header.delayed_rsp_id = 7;
        header.rsp_cnt = 0x1001;

        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), SUBSYS_V2_HEADER_SIZE);
        assert_eq!(&buf[..4], &[0x80, 18, 0x16, 0x08]);
        assert_eq!(&buf[8..12], &[7, 0, 0x01, 0x10]);

        let decoded = SubsysV2Header::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert!(!decoded.is_last_part());
    }

    #[test]
    fn test_last_part() {
        let mut header = SubsysV2Header::new(1, 1);
        assert!(!header.is_last_part());
        header.rsp_cnt = 1;
        assert!(header.is_last_part());
        header.rsp_cnt = 0x0fff;
        assert!(header.is_last_part());
    }

    #[test]
    fn test_write_to_packet() {
        let mut packet = vec![0u8; 16];
        let mut header = SubsysV2Header::new(5, 9);
        header.rsp_cnt = 2;
        header.write_to(&mut packet);
        assert_eq!(SubsysV2Header::decode(&packet).unwrap(), header);

        let mut short = vec![0u8; 4];
        header.write_to(&mut short);
        assert_eq!(short, vec![0u8; 4]);
    }

    #[test]
    fn test_decode_short() {
        assert!(SubsysHeader::decode(&[75, 1, 2]).is_none());
        assert!(SubsysV2Header::decode(&[0u8; 11]).is_none());
        assert!(DciPktHeader::decode(&[0u8; 8]).is_none());
    }

    #[test]
    fn test_dci_pkt_header() {
        let header = DciPktHeader {
            start: 0x7e,
            version: 1,
            len: 12,
            pkt_code: 0x80,
            tag: -42,
        };
        let mut buf = Vec::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), DCI_PKT_HEADER_SIZE);
        assert_eq!(DciPktHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_command_key() {
        let key = CommandKey::of(&[75, 18, 0x0f, 0x02, 0xaa]).unwrap();
        assert_eq!(key.subsys_id, Some(18));
        assert_eq!(key.code, 0x020f);
        assert!(!key.is_v2());

        let key = CommandKey::of(&[0x0c, 1, 2]).unwrap();
        assert_eq!(key.subsys_id, None);
        assert_eq!(key.code, 0x0c);

        assert!(CommandKey::of(&[]).is_none());
        assert!(CommandKey::of(&[128, 1]).is_none());
    }
}
