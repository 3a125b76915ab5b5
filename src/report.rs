//! Log, event and message reports originating in this process.
//!
//! Every report is checked against the masks the device pushed, built in a
//! pool buffer and written as one record. The leading data type tells the
//! device which consumers (local tool, DCI clients) want it:
//!
//! ```text
//! log:   data_type:u32 0x10 more:u8 len:u16 { len:u16 code:u16 ts:u64 } payload
//! event: data_type:u32 0x60 len:u16 id:u16 ts:u64 [payload_len:u8] payload
//! msg:   data_type:u32 0x79 ts_type:u8 num_args:u8 drop_cnt:u8 ts:u64
//!        line:u16 ssid:u16 ss_mask:u32 args:u32* fmt\0 file\0
//! ```
//!
//! Timestamps count 1.25 ms ticks in the upper 48 bits.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use crate::error::{DiagError, Result};
use crate::masks::MaskState;
use crate::pool::{BufferPool, PoolBuffer, PoolClass};
use crate::protocol::stream::{
    DATA_TYPE_DCI_EVENT, DATA_TYPE_DCI_LOG, DATA_TYPE_EVENT, DATA_TYPE_F3, DATA_TYPE_LOG,
    DIAG_EVENT_REPORT_F, DIAG_EXT_MSG_F, DIAG_LOG_F,
};
use crate::transport::Device;

/// Size of the header in front of every log payload.
pub const LOG_HEADER_SIZE: usize = 12;

/// Highest event id.
pub const EVENT_LAST_ID: u16 = 0x0fff;

/// Largest event payload.
pub const MAX_EVENT_PAYLOAD: usize = u8::MAX as usize;

/// Most arguments a message may carry.
pub const MAX_MSG_ARGS: usize = 9;

const TAG_SIZE: usize = 4;

/// Event id, timestamp and length field of an event.
const EVENT_HEADER_SIZE: usize = 2 + 8;

/// A message call site: where it is and which subsystem mask gates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgDescriptor<'a> {
    pub line: u16,
    pub ssid: u16,
    pub ss_mask: u32,
    pub fmt: &'a str,
    /// Source path; only the part after the last separator is sent.
    pub file: &'a str,
}

/// Current time in report timestamp format.
pub fn timestamp() -> u64 {
    let ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
    (ms * 4 / 5) << 16
}

/// Last component of `path`, splitting on `/`, `\` and `:`.
pub fn abbreviate_file(path: &str) -> &str {
    path.rsplit(|c| matches!(c, '/' | '\\' | ':'))
        .next()
        .unwrap_or(path)
}

/// Builds and writes reports gated by the current masks.
pub struct Reporter {
    device: Arc<dyn Device>,
    pool: BufferPool,
    masks: Arc<MaskState>,
    commit_failures: AtomicUsize,
    /// Messages lost since the last one sent.
    msg_drops: AtomicU32,
}

impl Reporter {
    pub fn new(device: Arc<dyn Device>, pool: BufferPool, masks: Arc<MaskState>) -> Self {
        Self {
            device,
            pool,
            masks,
            commit_failures: AtomicUsize::new(0),
            msg_drops: AtomicU32::new(0),
        }
    }

    /// Send log `code` if the log mask, or the DCI log mask of a registered
    /// DCI client, enables it. Returns `false` when masked off.
    pub fn log_submit(&self, code: u16, payload: &[u8]) -> Result<bool> {
        self.check_open()?;
        if payload.is_empty() {
            return Err(DiagError::InvalidParameter(format!(
                "log {:#06x} without payload",
                code
            )));
        }
        let log_len = LOG_HEADER_SIZE + payload.len();
        if log_len > usize::from(u16::MAX) {
            return Err(DiagError::HugePacket {
                size: log_len,
                max: usize::from(u16::MAX),
            });
        }

        let mut data_type = 0;
        if self.masks.log_enabled(code) {
            data_type |= DATA_TYPE_LOG;
        }
        if self.masks.dci_log_enabled(code) {
            data_type |= DATA_TYPE_DCI_LOG;
        }
        if data_type == 0 {
            return Ok(false);
        }

        let mut buf = self.buffer(TAG_SIZE + 4 + log_len)?;
        let frame = buf.vec_mut();
        frame.put_u32_le(data_type);
        frame.put_u8(DIAG_LOG_F);
        frame.put_u8(0);
        frame.put_u16_le(log_len as u16);
        frame.put_u16_le(log_len as u16);
        frame.put_u16_le(code);
        frame.put_u64_le(timestamp());
        frame.put_slice(payload);
        self.write(&buf)?;
        Ok(true)
    }

    /// Send event `id` without payload.
    pub fn event_report(&self, id: u16) -> Result<bool> {
        self.event_report_payload(id, &[])
    }

    /// Send event `id` if the event mask, or the DCI event mask of a
    /// registered DCI client, enables it. Returns `false` when masked off.
    pub fn event_report_payload(&self, id: u16, payload: &[u8]) -> Result<bool> {
        self.check_open()?;
        if id > EVENT_LAST_ID {
            return Err(DiagError::InvalidParameter(format!("event id {:#x}", id)));
        }
        if payload.len() > MAX_EVENT_PAYLOAD {
            return Err(DiagError::HugePacket {
                size: payload.len(),
                max: MAX_EVENT_PAYLOAD,
            });
        }

        let local = self.masks.event_enabled(id);
        let dci = self.masks.dci_event_enabled(id);
        if !local && !dci {
            return Ok(false);
        }
        let mut data_type = DATA_TYPE_EVENT;
        if dci {
            data_type |= DATA_TYPE_DCI_EVENT;
        }

        // payloads of up to two bytes go without their length byte
        let (len_code, body_len) = match payload.len() {
            n @ 0..=2 => (n as u16, n),
            n => (3, n + 1),
        };
        let length = EVENT_HEADER_SIZE + body_len;
        let mut buf = self.buffer(TAG_SIZE + 3 + length)?;
        let frame = buf.vec_mut();
        frame.put_u32_le(data_type);
        frame.put_u8(DIAG_EVENT_REPORT_F);
        frame.put_u16_le(length as u16);
        frame.put_u16_le(id | len_code << 13);
        frame.put_u64_le(timestamp());
        if len_code == 3 {
            frame.put_u8(payload.len() as u8);
        }
        frame.put_slice(payload);
        self.write(&buf)?;
        Ok(true)
    }

    /// Send a message with its arguments if the message mask enables any
    /// bit of `desc.ss_mask` for `desc.ssid`. Returns `false` when masked off.
    pub fn msg_send(&self, desc: &MsgDescriptor<'_>, args: &[u32]) -> Result<bool> {
        self.check_open()?;
        if args.len() > MAX_MSG_ARGS {
            return Err(DiagError::InvalidParameter(format!(
                "{} message arguments",
                args.len()
            )));
        }
        if !self.masks.msg_enabled(desc.ssid, desc.ss_mask) {
            return Ok(false);
        }

        let file = abbreviate_file(desc.file);
        let size = TAG_SIZE + 12 + 8 + 4 * args.len() + desc.fmt.len() + file.len() + 2;
        let mut buf = match self.buffer(size) {
            Ok(buf) => buf,
            Err(e) => {
                self.msg_drops.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };
        let drop_cnt = self.msg_drops.swap(0, Ordering::Relaxed).min(u32::from(u8::MAX)) as u8;

        let frame = buf.vec_mut();
        frame.put_u32_le(DATA_TYPE_F3);
        frame.put_u8(DIAG_EXT_MSG_F);
        frame.put_u8(0);
        frame.put_u8(args.len() as u8);
        frame.put_u8(drop_cnt);
        frame.put_u64_le(timestamp());
        frame.put_u16_le(desc.line);
        frame.put_u16_le(desc.ssid);
        frame.put_u32_le(desc.ss_mask);
        for arg in args {
            frame.put_u32_le(*arg);
        }
        frame.put_slice(desc.fmt.as_bytes());
        frame.put_u8(0);
        frame.put_slice(file.as_bytes());
        frame.put_u8(0);
        self.write(&buf)?;
        Ok(true)
    }

    /// Number of report writes that failed.
    pub fn commit_failures(&self) -> usize {
        self.commit_failures.load(Ordering::Relaxed)
    }

    fn check_open(&self) -> Result<()> {
        if self.device.is_open() {
            Ok(())
        } else {
            Err(DiagError::DeviceClosed)
        }
    }

    fn buffer(&self, size: usize) -> Result<PoolBuffer> {
        self.pool.alloc(size, PoolClass::General).map_err(|e| {
            tracing::error!("Could not allocate {} byte report: {}", size, e);
            e
        })
    }

    fn write(&self, frame: &[u8]) -> Result<()> {
        self.device.write(frame).map_err(|e| {
            tracing::warn!("Report write of {} bytes failed: {}", frame.len(), e);
            self.commit_failures.fetch_add(1, Ordering::Relaxed);
            e
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::masks::{MaskKind, DCI_LOG_MASK_STRIDE};
    use crate::transport::LoopbackDevice;

    fn reporter() -> (Arc<LoopbackDevice>, Arc<MaskState>, Reporter) {
        let device = Arc::new(LoopbackDevice::new());
        let pool = BufferPool::new(&PoolConfig::default());
        pool.init();
        let masks = Arc::new(MaskState::new());
        let reporter = Reporter::new(device.clone(), pool, Arc::clone(&masks));
        (device, masks, reporter)
    }

    fn le16(b: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([b[at], b[at + 1]])
    }

    fn le32(b: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([b[at], b[at + 1], b[at + 2], b[at + 3]])
    }

    /// Log mask enabling `items` of equipment 1.
    fn log_mask(items: &[usize]) -> Vec<u8> {
        let mut data = vec![1];
        data.extend_from_slice(&16u32.to_le_bytes());
        let mut bits = [0u8; 2];
        for &i in items {
            bits[i / 8] |= 1 << (i % 8);
        }
        data.extend_from_slice(&bits);
        data
    }

    fn msg_mask(ssid: u16, level: u32) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&ssid.to_le_bytes());
        data.extend_from_slice(&ssid.to_le_bytes());
        data.extend_from_slice(&level.to_le_bytes());
        data
    }

    #[test]
    fn test_log_gated_by_mask() {
        let (device, masks, reporter) = reporter();
        masks.update(MaskKind::Log, &log_mask(&[3]));

        assert!(!reporter.log_submit(0x1004, b"off").unwrap());
        assert!(device.written().is_empty());

        assert!(reporter.log_submit(0x1003, b"on").unwrap());
        let written = device.written();
        assert_eq!(written.len(), 1);
        let frame = &written[0];
        assert_eq!(le32(frame, 0), DATA_TYPE_LOG);
        assert_eq!(frame[4], DIAG_LOG_F);
        assert_eq!(frame[5], 0);
        assert_eq!(le16(frame, 6), 14);
        assert_eq!(le16(frame, 8), 14);
        assert_eq!(le16(frame, 10), 0x1003);
        assert_eq!(&frame[20..], b"on");
    }

    #[test]
    fn test_log_for_dci_client_only() {
        let (device, masks, reporter) = reporter();
        let mut dci = 1i32.to_le_bytes().to_vec();
        let mut bits = vec![0u8; 2 * DCI_LOG_MASK_STRIDE];
        bits[DCI_LOG_MASK_STRIDE + 2] = 1;
        dci.append(&mut bits);
        masks.update(MaskKind::DciLog, &dci);

        assert!(reporter.log_submit(0x1000, b"x").unwrap());
        assert_eq!(le32(&device.written()[0], 0), DATA_TYPE_DCI_LOG);
    }

    #[test]
    fn test_log_requires_payload() {
        let (_device, masks, reporter) = reporter();
        masks.update(MaskKind::Log, &log_mask(&[3]));
        assert!(matches!(
            reporter.log_submit(0x1003, &[]),
            Err(DiagError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_event_gated_by_mask() {
        let (device, masks, reporter) = reporter();
        masks.update(MaskKind::Event, &[0b0000_0100]);

        assert!(!reporter.event_report(1).unwrap());
        assert!(device.written().is_empty());

        assert!(reporter.event_report(2).unwrap());
        let frame = device.take_written().remove(0);
        assert_eq!(le32(&frame, 0), DATA_TYPE_EVENT);
        assert_eq!(frame[4], DIAG_EVENT_REPORT_F);
        assert_eq!(le16(&frame, 5), 10);
        assert_eq!(le16(&frame, 7), 2);
        assert_eq!(frame.len(), 4 + 3 + 10);
    }

    #[test]
    fn test_event_payload_encoding() {
        let (device, masks, reporter) = reporter();
        masks.update(MaskKind::Event, &[0xff]);
        let mut dci = 1i32.to_le_bytes().to_vec();
        dci.push(0b0000_0001);
        masks.update(MaskKind::DciEvent, &dci);

        assert!(reporter.event_report_payload(0, &[7, 8]).unwrap());
        assert!(reporter.event_report_payload(5, &[1, 2, 3]).unwrap());
        let written = device.written();

        let short = &written[0];
        assert_eq!(le32(short, 0), DATA_TYPE_EVENT | DATA_TYPE_DCI_EVENT);
        assert_eq!(le16(short, 5), 12);
        assert_eq!(le16(short, 7), 2 << 13);
        assert_eq!(&short[17..], &[7, 8]);

        let long = &written[1];
        assert_eq!(le32(long, 0), DATA_TYPE_EVENT);
        assert_eq!(le16(long, 5), 14);
        assert_eq!(le16(long, 7), 5 | 3 << 13);
        assert_eq!(&long[17..], &[3, 1, 2, 3]);
    }

    #[test]
    fn test_event_limits() {
        let (_device, masks, reporter) = reporter();
        masks.update(MaskKind::Event, &[0xff; 512]);
        assert!(matches!(
            reporter.event_report(0x1000),
            Err(DiagError::InvalidParameter(_))
        ));
        assert!(matches!(
            reporter.event_report_payload(1, &[0; 256]),
            Err(DiagError::HugePacket { size: 256, .. })
        ));
    }

    #[test]
    fn test_msg_gated_by_mask() {
        let (device, masks, reporter) = reporter();
        masks.update(MaskKind::Msg, &msg_mask(20, 0x4));
        let desc = MsgDescriptor {
            line: 77,
            ssid: 20,
            ss_mask: 0x4,
            fmt: "value %d",
            file: "vendor/diag/src/lsm.c",
        };

        assert!(!reporter
            .msg_send(&MsgDescriptor { ss_mask: 0x1, ..desc }, &[1])
            .unwrap());
        assert!(device.written().is_empty());

        assert!(reporter.msg_send(&desc, &[42]).unwrap());
        let frame = device.take_written().remove(0);
        assert_eq!(le32(&frame, 0), DATA_TYPE_F3);
        assert_eq!(frame[4], DIAG_EXT_MSG_F);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], 0);
        assert_eq!(le16(&frame, 16), 77);
        assert_eq!(le16(&frame, 18), 20);
        assert_eq!(le32(&frame, 20), 0x4);
        assert_eq!(le32(&frame, 24), 42);
        assert_eq!(&frame[28..], b"value %d\0lsm.c\0");
    }

    #[test]
    fn test_msg_too_many_args() {
        let (_device, masks, reporter) = reporter();
        masks.update(MaskKind::Msg, &msg_mask(1, 1));
        let desc = MsgDescriptor {
            line: 1,
            ssid: 1,
            ss_mask: 1,
            fmt: "",
            file: "",
        };
        assert!(reporter.msg_send(&desc, &[0; MAX_MSG_ARGS]).is_ok());
        assert!(reporter.msg_send(&desc, &[0; MAX_MSG_ARGS + 1]).is_err());
    }

    #[test]
    fn test_closed_device_and_write_failure() {
        let (device, masks, reporter) = reporter();
        masks.update(MaskKind::Event, &[0xff]);
        device.set_fail_writes(true);
        assert!(reporter.event_report(1).is_err());
        assert_eq!(reporter.commit_failures(), 1);

        device.close();
        assert!(matches!(
            reporter.event_report(1),
            Err(DiagError::DeviceClosed)
        ));
    }

    #[test]
    fn test_abbreviate_file() {
        assert_eq!(abbreviate_file("a/b/c.c"), "c.c");
        assert_eq!(abbreviate_file(r"C:\src\x.c"), "x.c");
        assert_eq!(abbreviate_file("drive:y.c"), "y.c");
        assert_eq!(abbreviate_file("plain.c"), "plain.c");
    }

    #[test]
    fn test_timestamp_ticks() {
        let ts = timestamp();
        assert_eq!(ts & 0xffff, 0);
        assert!(ts >> 16 > 0);
    }
}
