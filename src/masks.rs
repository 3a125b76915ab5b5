//! Message, log and event masks pushed by the device.
//!
//! The device sends a fresh mask whenever the host changes what it wants to
//! see. Masks are kept as received and decoded on lookup:
//!
//! ```text
//! message: { ssid_first:u16, ssid_last:u16, level:u32 * (last - first + 1) } *
//! log:     { equip_id:u8, num_items:u32, bits[(num_items + 7) / 8] } *
//! event:   bit array indexed by event id
//!
//! DCI log:   { num_clients:i32 } { reserved:u16, bits[512] } per equip id
//! DCI event: { num_clients:i32 } bit array indexed by event id
//! ```
//!
//! Log codes are `equip_id << 12 | item`. DCI masks only count while at
//! least one DCI client is registered.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::protocol::stream::{
    DCI_EVENT_MASKS_TYPE, DCI_LOG_MASKS_TYPE, EVENT_MASKS_TYPE, LOG_MASKS_TYPE,
    MASK_SYNC_COMPLETE, MSG_MASKS_TYPE,
};

/// Bytes per equipment id in the DCI log mask.
pub const DCI_LOG_MASK_STRIDE: usize = 514;

/// Which mask an update replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskKind {
    Msg,
    Log,
    Event,
    DciLog,
    DciEvent,
}

impl MaskKind {
    /// Mask kind carried by a stream type tag.
    pub fn from_stream_type(tag: u32) -> Option<Self> {
        match tag {
            MSG_MASKS_TYPE => Some(MaskKind::Msg),
            LOG_MASKS_TYPE => Some(MaskKind::Log),
            EVENT_MASKS_TYPE => Some(MaskKind::Event),
            DCI_LOG_MASKS_TYPE => Some(MaskKind::DciLog),
            DCI_EVENT_MASKS_TYPE => Some(MaskKind::DciEvent),
            _ => None,
        }
    }

    /// Sync bit set by an update of this kind.
    fn sync_bit(self) -> u32 {
        match self {
            MaskKind::Msg => MSG_MASKS_TYPE,
            MaskKind::Log => LOG_MASKS_TYPE,
            MaskKind::Event => EVENT_MASKS_TYPE,
            MaskKind::DciLog | MaskKind::DciEvent => 0,
        }
    }
}

#[derive(Default)]
struct Masks {
    msg: Vec<u8>,
    log: Vec<u8>,
    event: Vec<u8>,
    dci_log: Vec<u8>,
    dci_event: Vec<u8>,
    dci_log_clients: i32,
    dci_event_clients: i32,
    sync_bits: u32,
}

impl Masks {
    fn slot(&mut self, kind: MaskKind) -> &mut Vec<u8> {
        match kind {
            MaskKind::Msg => &mut self.msg,
            MaskKind::Log => &mut self.log,
            MaskKind::Event => &mut self.event,
            MaskKind::DciLog => &mut self.dci_log,
            MaskKind::DciEvent => &mut self.dci_event,
        }
    }
}

/// Current masks plus the initial sync state.
#[derive(Default)]
pub struct MaskState {
    masks: Mutex<Masks>,
    synced: Condvar,
}

impl MaskState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a mask with the bytes of an update.
    ///
    /// DCI updates lacking their client count are ignored.
    pub fn update(&self, kind: MaskKind, data: &[u8]) {
        let mut masks = self.masks.lock();
        let data = match kind {
            MaskKind::DciLog | MaskKind::DciEvent => {
                if data.len() < 4 {
                    tracing::warn!("{:?} update of {} bytes dropped", kind, data.len());
                    return;
                }
                let (count, bits) = data.split_at(4);
                let clients = i32::from_le_bytes([count[0], count[1], count[2], count[3]]);
                if kind == MaskKind::DciLog {
                    masks.dci_log_clients = clients;
                } else {
                    masks.dci_event_clients = clients;
                }
                bits
            }
            _ => data,
        };
        let slot = masks.slot(kind);
        slot.clear();
        slot.extend_from_slice(data);
        masks.sync_bits |= kind.sync_bit();
        if masks.sync_bits & MASK_SYNC_COMPLETE == MASK_SYNC_COMPLETE {
            self.synced.notify_all();
        }
    }

    /// True once message, log and event masks have all been received.
    pub fn is_synced(&self) -> bool {
        self.masks.lock().sync_bits & MASK_SYNC_COMPLETE == MASK_SYNC_COMPLETE
    }

    /// Block until synced or `timeout` passes. Returns the sync state.
    pub fn wait_for_sync(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut masks = self.masks.lock();
        while masks.sync_bits & MASK_SYNC_COMPLETE != MASK_SYNC_COMPLETE {
            if self.synced.wait_until(&mut masks, deadline).timed_out() {
                let synced = masks.sync_bits & MASK_SYNC_COMPLETE == MASK_SYNC_COMPLETE;
                if !synced {
                    tracing::debug!("Mask sync incomplete: {:#x}", masks.sync_bits);
                }
                return synced;
            }
        }
        true
    }

    pub fn log_enabled(&self, code: u16) -> bool {
        log_bit(&self.masks.lock().log, code)
    }

    pub fn event_enabled(&self, id: u16) -> bool {
        bit(&self.masks.lock().event, usize::from(id))
    }

    pub fn dci_log_enabled(&self, code: u16) -> bool {
        let masks = self.masks.lock();
        if masks.dci_log_clients <= 0 {
            return false;
        }
        let equip = usize::from(code >> 12);
        let item = usize::from(code & 0x0fff);
        let at = equip * DCI_LOG_MASK_STRIDE + 2 + item / 8;
        masks
            .dci_log
            .get(at)
            .map_or(false, |byte| byte & (1 << (item % 8)) != 0)
    }

    pub fn dci_event_enabled(&self, id: u16) -> bool {
        let masks = self.masks.lock();
        masks.dci_event_clients > 0 && bit(&masks.dci_event, usize::from(id))
    }

    /// True if any bit of `level` is enabled for `ssid`.
    pub fn msg_enabled(&self, ssid: u16, level: u32) -> bool {
        let masks = self.masks.lock();
        let mut rest = masks.msg.as_slice();
        while rest.len() >= 4 {
            let first = u16::from_le_bytes([rest[0], rest[1]]);
            let last = u16::from_le_bytes([rest[2], rest[3]]);
            if last < first {
                return false;
            }
            let count = usize::from(last - first) + 1;
            let Some(levels) = rest.get(4..4 + count * 4) else {
                return false;
            };
            if (first..=last).contains(&ssid) {
                let at = usize::from(ssid - first) * 4;
                let value = u32::from_le_bytes([
                    levels[at],
                    levels[at + 1],
                    levels[at + 2],
                    levels[at + 3],
                ]);
                return value & level != 0;
            }
            rest = &rest[4 + count * 4..];
        }
        false
    }
}

#[inline]
fn bit(bits: &[u8], index: usize) -> bool {
    bits.get(index / 8)
        .map_or(false, |byte| byte & (1 << (index % 8)) != 0)
}

fn log_bit(records: &[u8], code: u16) -> bool {
    let equip = (code >> 12) as u8;
    let item = usize::from(code & 0x0fff);
    let mut rest = records;
    while rest.len() >= 5 {
        let equip_id = rest[0];
        let num_items = u32::from_le_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let len = (num_items + 7) / 8;
        let Some(mask) = rest.get(5..5 + len) else {
            return false;
        };
        if equip_id == equip {
            return item < num_items && bit(mask, item);
        }
        rest = &rest[5 + len..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn log_record(equip: u8, items: u32, set: &[usize]) -> Vec<u8> {
        let mut rec = vec![equip];
        rec.extend_from_slice(&items.to_le_bytes());
        let mut mask = vec![0u8; (items as usize + 7) / 8];
        for &i in set {
            mask[i / 8] |= 1 << (i % 8);
        }
        rec.extend_from_slice(&mask);
        rec
    }

    #[test]
    fn test_log_mask_lookup() {
        let state = MaskState::new();
        let mut data = log_record(1, 16, &[3]);
        data.extend_from_slice(&log_record(0xb, 0x200, &[0x1c0]));
        state.update(MaskKind::Log, &data);

        assert!(state.log_enabled(0x1003));
        assert!(!state.log_enabled(0x1004));
        assert!(state.log_enabled(0xb1c0));
        assert!(!state.log_enabled(0xb300));
        assert!(!state.log_enabled(0x4000));
    }

    #[test]
    fn test_event_mask_lookup() {
        let state = MaskState::new();
        state.update(MaskKind::Event, &[0b0000_0100, 0b1000_0000]);
        assert!(state.event_enabled(2));
        assert!(state.event_enabled(15));
        assert!(!state.event_enabled(3));
        assert!(!state.event_enabled(400));
    }

    #[test]
    fn test_msg_mask_lookup() {
        let state = MaskState::new();
        let mut data = Vec::new();
        data.extend_from_slice(&5u16.to_le_bytes());
        data.extend_from_slice(&6u16.to_le_bytes());
        data.extend_from_slice(&0x1u32.to_le_bytes());
        data.extend_from_slice(&0x6u32.to_le_bytes());
        state.update(MaskKind::Msg, &data);

        assert!(state.msg_enabled(5, 0x1));
        assert!(state.msg_enabled(6, 0x4));
        assert!(!state.msg_enabled(6, 0x1));
        assert!(!state.msg_enabled(7, 0xffff_ffff));
    }

    fn dci_update(clients: i32, bits: &[u8]) -> Vec<u8> {
        let mut data = clients.to_le_bytes().to_vec();
        data.extend_from_slice(bits);
        data
    }

    #[test]
    fn test_dci_masks_do_not_sync() {
        let state = MaskState::new();
        let mut log = vec![0u8; 2 * DCI_LOG_MASK_STRIDE];
        log[DCI_LOG_MASK_STRIDE + 2 + 1] = 0b0000_0010;
        state.update(MaskKind::DciLog, &dci_update(1, &log));
        state.update(MaskKind::DciEvent, &dci_update(2, &[1]));

        assert!(state.dci_log_enabled(0x1009));
        assert!(!state.dci_log_enabled(0x1008));
        assert!(!state.dci_log_enabled(0x0009));
        assert!(!state.dci_log_enabled(0x5000));
        assert!(state.dci_event_enabled(0));
        assert!(!state.dci_event_enabled(1));
        assert!(!state.is_synced());
    }

    #[test]
    fn test_dci_masks_need_clients() {
        let state = MaskState::new();
        state.update(MaskKind::DciEvent, &dci_update(0, &[0xff]));
        assert!(!state.dci_event_enabled(0));

        state.update(MaskKind::DciEvent, &dci_update(1, &[0xff]));
        assert!(state.dci_event_enabled(0));

        // truncated update leaves the previous mask in place
        state.update(MaskKind::DciEvent, &[1, 0]);
        assert!(state.dci_event_enabled(7));
    }

    #[test]
    fn test_wait_for_sync() {
        let state = Arc::new(MaskState::new());
        assert!(!state.wait_for_sync(Duration::from_millis(5)));

        let updater = {
            let state = Arc::clone(&state);
            thread::spawn(move || {
                state.update(MaskKind::Msg, &[]);
                state.update(MaskKind::Log, &[]);
                state.update(MaskKind::Event, &[]);
            })
        };
        assert!(state.wait_for_sync(Duration::from_secs(5)));
        updater.join().unwrap();
        assert!(state.is_synced());
    }

    #[test]
    fn test_kind_from_stream_type() {
        assert_eq!(MaskKind::from_stream_type(0x2), Some(MaskKind::Log));
        assert_eq!(MaskKind::from_stream_type(0x200), Some(MaskKind::DciEvent));
        assert_eq!(MaskKind::from_stream_type(0x8), None);
    }
}
