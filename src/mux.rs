//! Frame multiplexer.
//!
//! Every chunk read from the device starts with a 4-byte little-endian type
//! tag. [`FrameMux::dispatch`] routes the chunk by that tag:
//!
//! - mask updates go to [`MaskState`]
//! - command packets go to the [`PacketEngine`], local or DCI origin
//! - `DCI_DATA` goes to the [`DciTracker`]
//! - `USER_SPACE_DATA` is split into per-processor fields for every
//!   registered [`DataSink`]
//! - `HDLC_SUPPORT` flips the framing flag and notifies the sinks
//! - `DEINIT` stops the reader
//!
//! A malformed chunk is truncated with a warning; the next chunk is handled
//! normally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::RwLock;

use crate::dci::DciTracker;
use crate::masks::{MaskKind, MaskState};
use crate::packet::PacketEngine;
use crate::protocol::stream::{
    DCI_DATA_TYPE, DCI_PKT_TYPE, DEINIT_TYPE, HDLC_SUPPORT_TYPE, PKT_TYPE, TOKEN_LIST,
    USER_SPACE_DATA_TYPE,
};
use crate::protocol::valid_token;

/// Size of the leading type tag.
pub const TYPE_TAG_SIZE: usize = 4;

/// Consumer of `USER_SPACE_DATA` fields.
///
/// Sinks are called on the reader thread, in registration order, once per
/// field.
pub trait DataSink: Send + Sync {
    /// One field of log data for processor `proc`.
    fn accept(&self, proc: usize, data: &[u8]);

    /// HDLC framing was switched on the device.
    fn set_hdlc(&self, _enabled: bool) {}
}

/// Per-processor closure sink for callback logging mode.
#[derive(Default)]
pub struct CallbackSink {
    handlers: RwLock<Vec<Option<Arc<dyn Fn(&[u8]) + Send + Sync>>>>,
}

impl CallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver processor `proc`'s fields to `handler`, replacing any
    /// previous one.
    pub fn register(&self, proc: usize, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        let mut handlers = self.handlers.write();
        if handlers.len() <= proc {
            handlers.resize_with(proc + 1, || None);
        }
        handlers[proc] = Some(Arc::new(handler));
    }

    pub fn unregister(&self, proc: usize) {
        if let Some(slot) = self.handlers.write().get_mut(proc) {
            *slot = None;
        }
    }
}

impl DataSink for CallbackSink {
    fn accept(&self, proc: usize, data: &[u8]) {
        let handler = self.handlers.read().get(proc).cloned().flatten();
        match handler {
            Some(handler) => handler(data),
            None => tracing::debug!("No callback registered for processor {}", proc),
        }
    }
}

/// Iterator over the fields of a `USER_SPACE_DATA` payload.
///
/// ```text
/// [num_fields:i32] { [token:i32]? [count:u32][count bytes] } * num_fields
/// ```
///
/// A field starting with a negative word carries a remote processor token;
/// local fields start directly with their count. Iteration stops at an
/// unknown token or a field running past the payload.
pub struct UserDataFields<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl<'a> UserDataFields<'a> {
    /// `payload` is the chunk without its type tag.
    pub fn new(payload: &'a [u8]) -> Self {
        let remaining = read_i32(payload, 0).map_or(0, |n| n.max(0) as usize);
        Self {
            data: payload,
            pos: 4,
            remaining,
        }
    }

    fn stop(&mut self, reason: &str) -> Option<(usize, &'a [u8])> {
        tracing::warn!(
            "User space data truncated at offset {}: {}",
            self.pos,
            reason
        );
        self.remaining = 0;
        None
    }
}

impl<'a> Iterator for UserDataFields<'a> {
    type Item = (usize, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 || self.pos >= self.data.len() {
            return None;
        }
        let Some(word) = read_i32(self.data, self.pos) else {
            return self.stop("truncated field header");
        };
        let proc = if word < 0 {
            let Some(proc) = valid_token(word) else {
                return self.stop(&format!("invalid processor token {}", word));
            };
            self.pos += 4;
            proc
        } else {
            0
        };
        let Some(count) = read_i32(self.data, self.pos).map(|c| c as u32 as usize) else {
            return self.stop("truncated field count");
        };
        let start = self.pos + 4;
        let Some(field) = self.data.get(start..start + count) else {
            return self.stop(&format!("field of {} bytes overruns chunk", count));
        };
        self.pos = start + count;
        self.remaining -= 1;
        Some((proc, field))
    }
}

#[inline]
fn read_i32(data: &[u8], at: usize) -> Option<i32> {
    let b = data.get(at..at + 4)?;
    Some(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Encode a full `USER_SPACE_DATA` chunk, type tag included.
///
/// ```
/// use diag_transport::mux::{encode_user_data, UserDataFields};
///
/// let chunk = encode_user_data(&[(0, b"local"), (1, b"modem")]);
/// let fields: Vec<_> = UserDataFields::new(&chunk[4..]).collect();
/// assert_eq!(fields, vec![(0, &b"local"[..]), (1, &b"modem"[..])]);
/// ```
pub fn encode_user_data(fields: &[(usize, &[u8])]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_u32_le(USER_SPACE_DATA_TYPE);
    buf.put_i32_le(fields.len() as i32);
    for &(proc, data) in fields {
        if proc > 0 {
            buf.put_i32_le(TOKEN_LIST[proc]);
        }
        buf.put_u32_le(data.len() as u32);
        buf.put_slice(data);
    }
    buf
}

/// What the reader does after a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    /// The device asked the reader to stop.
    Deinit,
}

/// Routes device chunks to their consumers.
pub struct FrameMux {
    masks: Arc<MaskState>,
    packets: Arc<PacketEngine>,
    dci: Arc<DciTracker>,
    sinks: Vec<Arc<dyn DataSink>>,
    hdlc_enabled: AtomicBool,
}

impl FrameMux {
    pub fn new(
        masks: Arc<MaskState>,
        packets: Arc<PacketEngine>,
        dci: Arc<DciTracker>,
        hdlc_enabled: bool,
    ) -> Self {
        Self {
            masks,
            packets,
            dci,
            sinks: Vec::new(),
            hdlc_enabled: AtomicBool::new(hdlc_enabled),
        }
    }

    /// Append a sink for `USER_SPACE_DATA` fields.
    pub fn add_sink(&mut self, sink: Arc<dyn DataSink>) {
        sink.set_hdlc(self.hdlc_enabled());
        self.sinks.push(sink);
    }

    #[inline]
    pub fn hdlc_enabled(&self) -> bool {
        self.hdlc_enabled.load(Ordering::Acquire)
    }

    /// Route one chunk.
    pub fn dispatch(&self, chunk: &[u8]) -> Dispatch {
        let Some(tag) = read_i32(chunk, 0).map(|t| t as u32) else {
            tracing::warn!("Dropping {} byte chunk without type tag", chunk.len());
            return Dispatch::Continue;
        };
        let payload = &chunk[TYPE_TAG_SIZE..];

        if let Some(kind) = MaskKind::from_stream_type(tag) {
            self.masks.update(kind, payload);
            return Dispatch::Continue;
        }

        match tag {
            PKT_TYPE => self.packets.process_local(payload),
            DCI_PKT_TYPE => self.packets.process_dci(payload),
            DCI_DATA_TYPE => self.dci.process_data(payload),
            USER_SPACE_DATA_TYPE => self.deliver(payload),
            HDLC_SUPPORT_TYPE => self.hdlc_support(payload),
            DEINIT_TYPE => {
                tracing::debug!("Device requested reader shutdown");
                return Dispatch::Deinit;
            }
            other => tracing::debug!("Ignoring chunk with type {:#x}", other),
        }
        Dispatch::Continue
    }

    fn deliver(&self, payload: &[u8]) {
        if self.sinks.is_empty() {
            tracing::debug!("No sink for {} bytes of user space data", payload.len());
            return;
        }
        for (proc, field) in UserDataFields::new(payload) {
            for sink in &self.sinks {
                sink.accept(proc, field);
            }
        }
    }

    /// Payload byte 1 means HDLC framing is disabled.
    fn hdlc_support(&self, payload: &[u8]) {
        let Some(&disabled) = payload.first() else {
            tracing::warn!("Empty HDLC support update");
            return;
        };
        let enabled = disabled == 0;
        self.set_hdlc(enabled);
    }

    /// Record the framing mode and tell every sink.
    pub fn set_hdlc(&self, enabled: bool) {
        let previous = self.hdlc_enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            tracing::debug!("HDLC framing {}", if enabled { "enabled" } else { "disabled" });
        }
        for sink in &self.sinks {
            sink.set_hdlc(enabled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DciConfig, PacketConfig, PoolConfig};
    use crate::pool::BufferPool;
    use crate::protocol::stream::{LOG_MASKS_TYPE, MSG_MASKS_TYPE};
    use crate::transport::{Device, LoopbackDevice};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        fields: Mutex<Vec<(usize, Vec<u8>)>>,
        hdlc: Mutex<Vec<bool>>,
    }

    impl DataSink for Recorder {
        fn accept(&self, proc: usize, data: &[u8]) {
            self.fields.lock().push((proc, data.to_vec()));
        }

        fn set_hdlc(&self, enabled: bool) {
            self.hdlc.lock().push(enabled);
        }
    }

    fn mux() -> (FrameMux, Arc<MaskState>, Arc<LoopbackDevice>) {
        let device = Arc::new(LoopbackDevice::new());
        let pool = BufferPool::new(&PoolConfig::default());
        pool.init();
        let dev: Arc<dyn Device> = device.clone();
        let masks = Arc::new(MaskState::new());
        let packets = Arc::new(PacketEngine::new(
            Arc::clone(&dev),
            pool.clone(),
            &PacketConfig::default(),
        ));
        let dci = Arc::new(DciTracker::new(dev, pool, &DciConfig::default()));
        (
            FrameMux::new(Arc::clone(&masks), packets, dci, true),
            masks,
            device,
        )
    }

    fn chunk(tag: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = tag.to_le_bytes().to_vec();
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_user_data_fields() {
        let chunk = encode_user_data(&[(0, b"abc"), (5, b""), (9, b"z")]);
        let fields: Vec<_> = UserDataFields::new(&chunk[4..]).collect();
        assert_eq!(
            fields,
            vec![(0, &b"abc"[..]), (5, &b""[..]), (9, &b"z"[..])]
        );
    }

    #[test]
    fn test_user_data_invalid_token_truncates() {
        let mut payload = Vec::new();
        payload.put_i32_le(2);
        payload.put_u32_le(1);
        payload.put_u8(7);
        payload.put_i32_le(-42);
        payload.put_u32_le(1);
        payload.put_u8(8);
        let fields: Vec<_> = UserDataFields::new(&payload).collect();
        assert_eq!(fields, vec![(0, &[7u8][..])]);
    }

    #[test]
    fn test_user_data_overrun_truncates() {
        let mut payload = Vec::new();
        payload.put_i32_le(1);
        payload.put_u32_le(100);
        payload.put_slice(b"short");
        assert_eq!(UserDataFields::new(&payload).count(), 0);
        assert_eq!(UserDataFields::new(&[]).count(), 0);
    }

    #[test]
    fn test_masks_routed() {
        let (mux, masks, _) = mux();
        assert_eq!(mux.dispatch(&chunk(MSG_MASKS_TYPE, &[])), Dispatch::Continue);
        mux.dispatch(&chunk(LOG_MASKS_TYPE, &[]));
        assert!(!masks.is_synced());
        mux.dispatch(&chunk(0x4, &[1]));
        assert!(masks.is_synced());
        assert!(masks.event_enabled(0));
    }

    #[test]
    fn test_user_data_reaches_sinks() {
        let (mut mux, _, _) = mux();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        mux.add_sink(first.clone());
        mux.add_sink(second.clone());

        mux.dispatch(&encode_user_data(&[(0, b"log"), (1, b"mdm")]));

        let expected = vec![(0, b"log".to_vec()), (1, b"mdm".to_vec())];
        assert_eq!(*first.fields.lock(), expected);
        assert_eq!(*second.fields.lock(), expected);
    }

    #[test]
    fn test_hdlc_support_toggle() {
        let (mut mux, _, _) = mux();
        let sink = Arc::new(Recorder::default());
        mux.add_sink(sink.clone());

        mux.dispatch(&chunk(HDLC_SUPPORT_TYPE, &[1]));
        assert!(!mux.hdlc_enabled());
        mux.dispatch(&chunk(HDLC_SUPPORT_TYPE, &[0]));
        assert!(mux.hdlc_enabled());
        mux.dispatch(&chunk(HDLC_SUPPORT_TYPE, &[]));
        assert_eq!(*sink.hdlc.lock(), vec![true, false, true]);
    }

    #[test]
    fn test_deinit_and_short_chunks() {
        let (mux, _, device) = mux();
        assert_eq!(mux.dispatch(&chunk(DEINIT_TYPE, &[])), Dispatch::Deinit);
        assert_eq!(mux.dispatch(&[1, 2]), Dispatch::Continue);
        assert_eq!(mux.dispatch(&chunk(0x8000, b"x")), Dispatch::Continue);
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_callback_sink() {
        let sink = CallbackSink::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            sink.register(1, move |data: &[u8]| seen.lock().push(data.to_vec()));
        }
        sink.accept(0, b"nobody");
        sink.accept(1, b"modem");
        sink.unregister(1);
        sink.accept(1, b"gone");
        assert_eq!(*seen.lock(), vec![b"modem".to_vec()]);
    }
}
