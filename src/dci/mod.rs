//! DCI module - remote consumer clients and their transactions.
//!
//! One client slot exists per DCI processor. A registered client can:
//! - send command requests with [`DciTracker::send_async`] and get the
//!   response through a completion callback
//! - subscribe to log and event streams
//! - query device-side health and mask state
//!
//! Transaction ids come from one process-wide counter. A transaction stays in
//! its client's table until a response arrives with the delete flag set (a
//! plain response, or the last part of a delayed sequence) or the client is
//! released.
//!
//! ```text
//! send_async:  [DCI_DATA:u32][uid:i32][client_id:i32] <request>
//! response:    DCI_DATA chunk -> complete(proc, uid, delete, payload) -> callback
//! ```

mod client;
mod stream;

pub use client::{Completion, ResponseBuffer, INVALID_CLIENT_ID};
pub use stream::{DataSignal, StreamHandler};

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::BufMut;

use client::{ClientSlot, Transaction};
use stream::Delivery;

use crate::config::DciConfig;
use crate::error::{DiagError, Result};
use crate::pool::{BufferPool, PoolClass};
use crate::protocol::dci::{
    encode_send_header, DciDataHeader, DciRecord, DciRecords, DciStreamHeader, HealthStats,
    StreamKind, DCI_SEND_HEADER_LEN, DCI_STREAM_HEADER_LEN,
};
use crate::protocol::stream::RealTimeMode;
use crate::transport::{ControlReply, ControlRequest, Device};

/// Highest DCI version supported.
pub const DCI_VERSION: u8 = 1;

/// Processor index meaning "all processors" in health queries.
pub const ALL_PROC: i32 = -1;

/// DCI client registry and transaction tracker.
pub struct DciTracker {
    device: Arc<dyn Device>,
    pool: BufferPool,
    max_request_size: usize,
    next_uid: AtomicI32,
    slots: Vec<ClientSlot>,
}

impl DciTracker {
    /// Create one inactive slot per configured processor.
    pub fn new(device: Arc<dyn Device>, pool: BufferPool, config: &DciConfig) -> Self {
        Self {
            device,
            pool,
            max_request_size: config.max_request_size,
            next_uid: AtomicI32::new(0),
            slots: (0..config.processors).map(|_| ClientSlot::new()).collect(),
        }
    }

    /// Number of processor slots.
    pub fn processors(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, proc: i32) -> Result<&ClientSlot> {
        usize::try_from(proc)
            .ok()
            .and_then(|p| self.slots.get(p))
            .ok_or(DiagError::InvalidProcessor(proc))
    }

    fn proc_of(&self, client_id: i32) -> Result<usize> {
        if client_id == INVALID_CLIENT_ID {
            return Err(DiagError::InvalidClient(client_id));
        }
        self.slots
            .iter()
            .position(|s| s.client_id() == client_id)
            .ok_or(DiagError::InvalidClient(client_id))
    }

    /// Register the client of `proc`. Returns the device-assigned client id.
    pub fn register(&self, proc: i32, notification_mask: u32, signal_type: i32) -> Result<i32> {
        let slot = self.slot(proc)?;
        let mut info = slot.info.lock();
        if info.is_active() {
            tracing::warn!("DCI client already registered for processor {}", proc);
            return Err(DiagError::DuplicateClient(proc));
        }

        let scratch_len = self.max_request_size + DCI_SEND_HEADER_LEN.max(DCI_STREAM_HEADER_LEN);
        let scratch = self
            .pool
            .alloc(scratch_len, PoolClass::General)
            .map_err(|e| DiagError::NoMemory(format!("DCI request buffer: {}", e)))?;

        let reply = self.device.control(&ControlRequest::DciRegister {
            proc,
            notification_mask,
            signal_type,
        });
        let client_id = match reply {
            Ok(ControlReply::Value(id)) if id >= 0 => id,
            other => {
                tracing::error!("Could not register DCI client on processor {}: {:?}", proc, other);
                return Err(DiagError::NoRegistration);
            }
        };

        info.client_id = client_id;
        info.notification_mask = notification_mask;
        info.signal_type = signal_type;
        info.scratch = Some(scratch);
        info.data_signal = None;
        tracing::debug!("DCI client {} registered on processor {}", client_id, proc);
        Ok(client_id)
    }

    /// Send `request` and track it until its response arrives.
    ///
    /// `callback` runs on the reader thread with the copied response bytes.
    /// Returns the transaction id.
    pub fn send_async(
        &self,
        client_id: i32,
        request: &[u8],
        response: ResponseBuffer,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> Result<i32> {
        let proc = self.proc_of(client_id)?;
        if request.is_empty() || request.len() > self.max_request_size {
            tracing::warn!(
                "DCI request of {} bytes, max supported {}",
                request.len(),
                self.max_request_size
            );
            return Err(DiagError::HugePacket {
                size: request.len(),
                max: self.max_request_size,
            });
        }
        let slot = &self.slots[proc];

        let uid = self.next_uid.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let handle = slot.insert(Transaction {
            uid,
            response,
            callback: Arc::new(callback),
        });

        let sent = {
            let mut info = slot.info.lock();
            match info.scratch.as_mut() {
                Some(scratch) => {
                    scratch.clear();
                    let buf = scratch.vec_mut();
                    encode_send_header(buf, uid, client_id);
                    buf.put_slice(request);
                    self.device.write(scratch)
                }
                None => Err(DiagError::NoMemory("DCI request buffer released".into())),
            }
        };

        if let Err(e) = sent {
            slot.remove(handle);
            tracing::warn!("DCI request {} of client {} not sent: {}", uid, client_id, e);
            return Err(match e {
                DiagError::NoMemory(_) => e,
                other => DiagError::SendFailed(other.to_string()),
            });
        }
        Ok(uid)
    }

    /// Deliver a response to transaction `uid` of processor `proc`.
    ///
    /// The payload is copied only if `0 < len <= capacity`; otherwise the
    /// callback is not run. The transaction is removed only if `delete` is
    /// set. Returns `true` if the transaction was found.
    pub fn complete(&self, proc: usize, uid: i32, delete: bool, payload: &[u8]) -> bool {
        let Some(slot) = self.slots.get(proc) else {
            tracing::warn!("DCI response for invalid processor {}", proc);
            return false;
        };

        let delivery = {
            let mut requests = slot.requests.lock();
            let Some(handle) = requests.find(|t| t.uid == uid) else {
                drop(requests);
                tracing::warn!("Incorrect DCI transaction {} on processor {}", uid, proc);
                return false;
            };
            let delivery = requests.get_mut(handle).and_then(|t| {
                if t.response.fill(payload) {
                    Some((Arc::clone(&t.callback), t.response.as_bytes().to_vec()))
                } else {
                    tracing::warn!(
                        "Invalid DCI response for {}: len {} capacity {}",
                        uid,
                        payload.len(),
                        t.response.capacity()
                    );
                    None
                }
            });
            if delete {
                requests.remove(handle);
            }
            delivery
        };

        if let Some((callback, bytes)) = delivery {
            callback(&bytes);
        }
        true
    }

    /// Process a `DCI_DATA` chunk body (after the type tag).
    pub fn process_data(&self, body: &[u8]) {
        let Some(header) = DciDataHeader::decode(body) else {
            tracing::warn!("Truncated DCI data header");
            return;
        };
        let Some(proc) = usize::try_from(header.proc)
            .ok()
            .filter(|&p| p < self.slots.len())
        else {
            tracing::warn!("DCI data for invalid processor {}", header.proc);
            return;
        };
        let records = &body[DciDataHeader::SIZE..];
        let declared = usize::try_from(header.len).unwrap_or(0);
        let records = &records[..declared.min(records.len())];

        let delivery = {
            let info = self.slots[proc].info.lock();
            Delivery {
                logs: info.logs.clone(),
                events: info.events.clone(),
                signal: info.data_signal.clone(),
                version: info.version,
            }
        };

        for record in DciRecords::new(records, delivery.version) {
            delivery.signal(proc);
            match record {
                DciRecord::Response {
                    delete,
                    uid,
                    payload,
                } => {
                    self.complete(proc, uid, delete, payload);
                }
                DciRecord::Log(log) => delivery.log(proc, log),
                DciRecord::Event(event) => delivery.event(proc, event),
            }
        }
    }

    /// Deregister `client_id`, dropping its transactions and scratch buffer.
    pub fn release(&self, client_id: i32) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        self.device
            .control(&ControlRequest::DciDeinit { client_id })
            .map_err(|e| {
                tracing::error!("Could not release DCI client {}: {}", client_id, e);
                e
            })?;

        let slot = &self.slots[proc];
        slot.info.lock().reset();
        let dropped = slot.clear();
        tracing::debug!(
            "DCI client {} released, {} transactions dropped",
            client_id,
            dropped
        );
        Ok(())
    }

    /// Release every active client. Failures are logged.
    pub fn release_all(&self) {
        for slot in &self.slots {
            let id = slot.client_id();
            if id != INVALID_CLIENT_ID {
                if let Err(e) = self.release(id) {
                    tracing::warn!("DCI client {} release failed: {}", id, e);
                    slot.info.lock().reset();
                    slot.clear();
                }
            }
        }
    }

    /// Client id active on `proc`, if any.
    pub fn client_id(&self, proc: i32) -> Option<i32> {
        self.slot(proc)
            .ok()
            .map(|s| s.client_id())
            .filter(|&id| id != INVALID_CLIENT_ID)
    }

    /// Transactions in flight for `client_id`.
    pub fn pending(&self, client_id: i32) -> Result<usize> {
        let proc = self.proc_of(client_id)?;
        Ok(self.slots[proc].pending())
    }

    fn stream_config(&self, kind: StreamKind, client_id: i32, set: bool, items: &[u8], count: usize) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        if count < 1 {
            return Err(DiagError::InvalidParameter(
                "stream config needs at least one code".into(),
            ));
        }
        if items.len() > self.max_request_size {
            return Err(DiagError::HugePacket {
                size: items.len(),
                max: self.max_request_size,
            });
        }

        let mut info = self.slots[proc].info.lock();
        let Some(scratch) = info.scratch.as_mut() else {
            return Err(DiagError::NoMemory("DCI request buffer released".into()));
        };
        scratch.clear();
        let buf = scratch.vec_mut();
        DciStreamHeader {
            kind,
            client_id,
            set,
            count: count as i32,
        }
        .encode_into(buf);
        buf.put_slice(items);
        self.device.write(scratch).map_err(|e| {
            tracing::warn!("DCI {:?} stream config not sent: {}", kind, e);
            DiagError::SendFailed(e.to_string())
        })
    }

    /// Enable (`set`) or disable log codes for `client_id`.
    pub fn log_stream_config(&self, client_id: i32, set: bool, codes: &[u16]) -> Result<()> {
        let mut items = Vec::with_capacity(codes.len() * 2);
        for &code in codes {
            items.put_u16_le(code);
        }
        self.stream_config(StreamKind::Log, client_id, set, &items, codes.len())
    }

    /// Enable (`set`) or disable event ids for `client_id`.
    pub fn event_stream_config(&self, client_id: i32, set: bool, ids: &[i32]) -> Result<()> {
        let mut items = Vec::with_capacity(ids.len() * 4);
        for &id in ids {
            items.put_i32_le(id);
        }
        self.stream_config(StreamKind::Event, client_id, set, &items, ids.len())
    }

    /// Install log and event stream handlers for `client_id`.
    pub fn register_stream_handlers(
        &self,
        client_id: i32,
        logs: Option<StreamHandler>,
        events: Option<StreamHandler>,
    ) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        let mut info = self.slots[proc].info.lock();
        info.logs = logs;
        info.events = events;
        Ok(())
    }

    /// Run `signal` once for every sub-record received for `client_id`.
    pub fn register_data_signal(&self, client_id: i32, signal: DataSignal) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        self.slots[proc].info.lock().data_signal = Some(signal);
        Ok(())
    }

    pub fn deregister_data_signal(&self, client_id: i32) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        let mut info = self.slots[proc].info.lock();
        if info.data_signal.take().is_none() {
            return Err(DiagError::NoRegistration);
        }
        Ok(())
    }

    /// Select the extended header format delivered to `client_id`.
    pub fn set_version(&self, client_id: i32, version: u8) -> Result<()> {
        let proc = self.proc_of(client_id)?;
        if version > DCI_VERSION {
            return Err(DiagError::NotSupported(format!(
                "DCI version {} (max {})",
                version, DCI_VERSION
            )));
        }
        self.slots[proc].info.lock().version = version;
        Ok(())
    }

    pub fn version(&self, client_id: i32) -> Result<u8> {
        let proc = self.proc_of(client_id)?;
        Ok(self.slots[proc].info.lock().version)
    }

    /// Drop and receive counters of `client_id` for `proc` (or [`ALL_PROC`]).
    pub fn health_stats(&self, client_id: i32, proc: i32, reset: bool) -> Result<HealthStats> {
        self.proc_of(client_id)?;
        if proc < ALL_PROC {
            return Err(DiagError::InvalidProcessor(proc));
        }
        match self.device.control(&ControlRequest::DciHealthStats {
            client_id,
            proc,
            reset,
        })? {
            ControlReply::Health(stats) => Ok(stats),
            other => Err(DiagError::Protocol(format!(
                "unexpected health reply {:?}",
                other
            ))),
        }
    }

    fn status(&self, client_id: i32, request: ControlRequest) -> Result<bool> {
        self.proc_of(client_id)?;
        match self.device.control(&request) {
            Ok(ControlReply::Status(set)) => Ok(set),
            Ok(other) => Ok(other.value() == Some(1)),
            Err(e) => Err(DiagError::SendFailed(e.to_string())),
        }
    }

    /// True if `code` is enabled for `client_id` on the device.
    pub fn log_status(&self, client_id: i32, code: u16) -> Result<bool> {
        self.status(client_id, ControlRequest::DciLogStatus { client_id, code })
    }

    /// True if event `id` is enabled for `client_id` on the device.
    pub fn event_status(&self, client_id: i32, id: u16) -> Result<bool> {
        self.status(client_id, ControlRequest::DciEventStatus { client_id, id })
    }

    fn simple_control(&self, client_id: i32, request: ControlRequest) -> Result<()> {
        self.proc_of(client_id)?;
        self.device
            .control(&request)
            .map(|_| ())
            .map_err(|e| DiagError::SendFailed(e.to_string()))
    }

    pub fn clear_logs(&self, client_id: i32) -> Result<()> {
        self.simple_control(client_id, ControlRequest::DciClearLogs { client_id })
    }

    pub fn clear_events(&self, client_id: i32) -> Result<()> {
        self.simple_control(client_id, ControlRequest::DciClearEvents { client_id })
    }

    /// Vote for real-time or buffered operation on behalf of `client_id`.
    ///
    /// A failed vote is logged; the device keeps its current mode.
    pub fn vote_real_time(&self, client_id: i32, mode: RealTimeMode) -> Result<()> {
        self.proc_of(client_id)?;
        if let Err(e) = self.device.control(&ControlRequest::VoteRealTime {
            proc: ALL_PROC,
            mode: mode as i32,
        }) {
            tracing::warn!("Real time vote of client {} failed: {}", client_id, e);
        }
        Ok(())
    }

    /// Current real-time mode of `proc`.
    pub fn real_time_status(&self, proc: i32) -> Result<RealTimeMode> {
        self.slot(proc)?;
        let reply = self.device.control(&ControlRequest::GetRealTime { proc })?;
        match reply.value() {
            Some(2) => Ok(RealTimeMode::NonRealTime),
            _ => Ok(RealTimeMode::RealTime),
        }
    }

    /// Bitmask of peripherals supporting DCI on `proc`.
    pub fn support_list(&self, proc: i32) -> Result<u16> {
        self.slot(proc)?;
        let reply = self.device.control(&ControlRequest::DciSupport { proc })?;
        Ok(reply.value().unwrap_or(0) as u16)
    }
}
