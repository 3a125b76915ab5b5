//! Packet module - command request dispatch and responses.
//!
//! Command packets routed to this process arrive as `PKT` chunks (local) or
//! `DCI_PKT` chunks (relayed by a DCI client). Each packet moves through:
//!
//! ```text
//! RECEIVED -> lookup -> DISPATCHED -> { immediate response | delayed pending } -> SENT
//! ```
//!
//! Responses are framed by origin:
//!
//! ```text
//! local:            [RESPONSE:u32][packet]
//! DCI:              [DCI_PKT:u32][0x93:u8][tag:i32][packet]
//! DCI, v2 packet:   [DCI_PKT:u32][0x94:u32][tag:i32][packet]
//! delayed, local:   [DELAYED_RESPONSE:u32][packet]
//! delayed, DCI:     [DCI_PKT:u32][0x94:u32][tag:i32][packet]
//! ```
//!
//! Packets without a matching handler are dropped with a log; no response is
//! synthesized for them.

mod context;
mod delayed;
mod registry;

pub use context::{DelayedResponse, Origin, PacketContext, PacketResponse};
pub use delayed::CorrelationTable;
pub use registry::{CommandHandler, CommandRegistry, CommandTable, TableKind, NO_SUBSYS_ID};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BufMut;
use parking_lot::Mutex;

use crate::config::PacketConfig;
use crate::error::{DiagError, Result};
use crate::pool::{BufferPool, PoolBuffer, PoolClass};
use crate::protocol::stream::{
    DCI_DELAYED_RSP_CODE, DCI_PKT_RSP_CODE, DCI_PKT_TYPE, DELAYED_RESPONSE_TYPE,
    DIAG_SUBSYS_CMD_F, DIAG_SUBSYS_CMD_VER_2_F, RESPONSE_TYPE,
};
use crate::protocol::{
    CommandKey, DciPktHeader, SubsysHeader, SubsysV2Header, DCI_PKT_HEADER_SIZE,
    SUBSYS_HEADER_SIZE, SUBSYS_V2_HEADER_SIZE,
};
use crate::transport::{ControlReply, ControlRequest, Device};

/// Bytes of the request echoed by an error response.
pub const MAX_ERR_ECHO: usize = 16;

/// Size of the stream tag preceding every outbound record.
const TAG_SIZE: usize = 4;

/// Command dispatch and response framing.
pub struct PacketEngine {
    device: Arc<dyn Device>,
    pool: BufferPool,
    registry: Mutex<CommandRegistry>,
    /// Held from table insert until the device accepted or refused it.
    registering: Mutex<()>,
    correlations: CorrelationTable,
    commit_failures: AtomicUsize,
}

impl PacketEngine {
    pub fn new(device: Arc<dyn Device>, pool: BufferPool, config: &PacketConfig) -> Self {
        Self {
            device,
            pool,
            registry: Mutex::new(CommandRegistry::new(config.max_tables)),
            registering: Mutex::new(()),
            correlations: CorrelationTable::new(),
            commit_failures: AtomicUsize::new(0),
        }
    }

    /// Add a command table and register its ranges with the device.
    ///
    /// If the device refuses the registration the table is removed again.
    pub fn register_table(&self, table: CommandTable) -> Result<()> {
        if !self.device.is_open() {
            return Err(DiagError::DeviceClosed);
        }
        let registrations = table.registrations();
        let kind = table.kind();
        let _registering = self.registering.lock();
        self.registry.lock().register(table)?;

        if let Err(e) = self
            .device
            .control(&ControlRequest::RegisterCommands(registrations))
        {
            tracing::error!("Unable to register {:?} commands with the device: {}", kind, e);
            self.registry.lock().pop();
            return Err(e);
        }
        tracing::debug!("Registered {:?} command table", kind);
        Ok(())
    }

    /// Number of registered tables.
    pub fn table_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Dispatch a `PKT` chunk body.
    pub fn process_local(&self, packet: &[u8]) {
        self.dispatch(packet, Origin::Local);
    }

    /// Dispatch a `DCI_PKT` chunk body: a 9-byte envelope, the packet and a
    /// trailing end byte.
    pub fn process_dci(&self, body: &[u8]) {
        if body.len() < DCI_PKT_HEADER_SIZE + 1 {
            tracing::warn!("Invalid DCI packet length {}", body.len());
            return;
        }
        let Some(header) = DciPktHeader::decode(body) else {
            return;
        };
        let packet = &body[DCI_PKT_HEADER_SIZE..body.len() - 1];
        self.dispatch(packet, Origin::Dci { tag: header.tag });
    }

    fn dispatch(&self, packet: &[u8], origin: Origin) {
        let Some(key) = CommandKey::of(packet) else {
            tracing::warn!("Dropping truncated command packet of {} bytes", packet.len());
            return;
        };
        // the lock is not held while the handler runs
        let handler = self.registry.lock().lookup(&key);
        let Some(handler) = handler else {
            tracing::debug!(
                "No handler for cmd {:#04x} subsys {:?} code {:#06x}",
                key.cmd_code,
                key.subsys_id,
                key.code
            );
            return;
        };

        let ctx = PacketContext::new(self, origin);
        if let Some(response) = handler.handle(packet, &ctx) {
            self.commit(response, origin);
        }
    }

    fn response_buffer(&self, len: usize) -> Result<PoolBuffer> {
        let max = self.pool.item_size(PoolClass::Packet);
        if len > max {
            return Err(DiagError::HugePacket { size: len, max });
        }
        self.pool.alloc(len, PoolClass::Packet)
    }

    /// Allocate a response of `len` bytes whose first byte is `code`.
    pub fn alloc(&self, code: u8, len: usize) -> Result<PacketResponse> {
        if !self.device.is_open() {
            return Err(DiagError::DeviceClosed);
        }
        let buf = self.response_buffer(len)?;
        Ok(PacketResponse::new(buf, code, len))
    }

    /// Allocate a `0x4B` response with its header filled in.
    pub fn subsys_alloc(&self, subsys_id: u8, code: u16, len: usize) -> Result<PacketResponse> {
        let mut rsp = self.alloc(DIAG_SUBSYS_CMD_F, len.max(SUBSYS_HEADER_SIZE))?;
        let mut dst = &mut rsp[..SUBSYS_HEADER_SIZE];
        SubsysHeader::new(subsys_id, code).encode_into(&mut dst);
        Ok(rsp)
    }

    /// Allocate a `0x80` response.
    ///
    /// For commands of a delayed table a delayed response id is reserved from
    /// the device first; if that fails the allocation fails.
    pub fn subsys_alloc_v2(&self, subsys_id: u8, code: u16, len: usize) -> Result<PacketResponse> {
        let mut rsp = self.alloc(DIAG_SUBSYS_CMD_VER_2_F, len.max(SUBSYS_V2_HEADER_SIZE))?;
        let mut header = SubsysV2Header::new(subsys_id, code);

        let delayed = self.registry.lock().with_delay(subsys_id, code);
        if delayed {
            header.delayed_rsp_id = self.next_delayed_rsp_id()?;
        }
        header.write_to(&mut rsp);
        Ok(rsp)
    }

    fn next_delayed_rsp_id(&self) -> Result<u16> {
        let reply = self.device.control(&ControlRequest::GetDelayedResponseId)?;
        match reply {
            ControlReply::Value(id) if id > 0 && id <= i32::from(u16::MAX) => Ok(id as u16),
            other => {
                tracing::error!("Unable to retrieve a delayed response id: {:?}", other);
                Err(DiagError::Protocol(format!(
                    "invalid delayed response id reply {:?}",
                    other
                )))
            }
        }
    }

    /// Build a "bad command" style response: `code` followed by up to
    /// [`MAX_ERR_ECHO`] bytes of the request.
    pub fn err_rsp(&self, code: u8, request: &[u8]) -> Result<PacketResponse> {
        let echo = request.len().min(MAX_ERR_ECHO);
        let mut rsp = self.alloc(code, 1 + echo)?;
        rsp[1..].copy_from_slice(&request[..echo]);
        Ok(rsp)
    }

    /// Frame and write a response. The buffer returns to its pool afterwards.
    ///
    /// A v2 response relayed over DCI records its delayed response id so later
    /// parts reach the same DCI request.
    pub fn commit(&self, response: PacketResponse, origin: Origin) {
        if response.is_empty() || !self.device.is_open() {
            return;
        }
        let packet = response.into_buffer();

        let mut out = match self.pool.alloc(packet.len() + 16, PoolClass::Packet) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!("Could not allocate response frame: {}", e);
                return;
            }
        };
        let frame = out.vec_mut();
        match origin {
            Origin::Local => {
                frame.put_u32_le(RESPONSE_TYPE);
            }
            Origin::Dci { tag } => {
                frame.put_u32_le(DCI_PKT_TYPE);
                if packet[0] == DIAG_SUBSYS_CMD_VER_2_F {
                    frame.put_u32_le(u32::from(DCI_DELAYED_RSP_CODE));
                    if let Some(header) = SubsysV2Header::decode(&packet) {
                        self.correlations.add(header.delayed_rsp_id, tag);
                    }
                } else {
                    frame.put_u8(DCI_PKT_RSP_CODE);
                }
                frame.put_i32_le(tag);
            }
        }
        frame.put_slice(&packet);
        self.write(&out);
    }

    /// Allocate a delayed response part for `delayed_rsp_id`.
    ///
    /// The part counter starts at 1 (a single, final part).
    pub fn delay_alloc(
        &self,
        subsys_id: u8,
        code: u16,
        delayed_rsp_id: u16,
        len: usize,
    ) -> Result<DelayedResponse> {
        if !self.device.is_open() {
            return Err(DiagError::DeviceClosed);
        }
        let len = len.max(SUBSYS_V2_HEADER_SIZE);
        let buf = self.pool.alloc(TAG_SIZE + len, PoolClass::General)?;
        let mut header = SubsysV2Header::new(subsys_id, code);
        header.delayed_rsp_id = delayed_rsp_id;
        header.rsp_cnt = 1;
        Ok(DelayedResponse::new(buf, header, len))
    }

    /// Frame and write a delayed response part.
    ///
    /// Parts of a DCI-relayed command go back to the recorded DCI tag; the
    /// correlation is dropped once the part counter marks the last part.
    pub fn delay_commit(&self, response: DelayedResponse) {
        if response.is_empty() || !self.device.is_open() {
            return;
        }
        let header = response.header();
        let packet = response.into_buffer();

        let mut out = match self.pool.alloc(packet.len() + 12, PoolClass::General) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!("Could not allocate delayed response frame: {}", e);
                return;
            }
        };
        let frame = out.vec_mut();
        match self.correlations.find(header.delayed_rsp_id) {
            Some((handle, tag)) => {
                frame.put_u32_le(DCI_PKT_TYPE);
                frame.put_u32_le(u32::from(DCI_DELAYED_RSP_CODE));
                frame.put_i32_le(tag);
                frame.put_slice(&packet);
                self.write(&out);
                if header.is_last_part() {
                    self.correlations.remove(handle);
                }
            }
            None => {
                frame.put_u32_le(DELAYED_RESPONSE_TYPE);
                frame.put_slice(&packet);
                self.write(&out);
            }
        }
    }

    fn write(&self, frame: &[u8]) {
        if let Err(e) = self.device.write(frame) {
            tracing::warn!("Response write of {} bytes failed: {}", frame.len(), e);
            self.commit_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of response writes that failed.
    pub fn commit_failures(&self) -> usize {
        self.commit_failures.load(Ordering::Relaxed)
    }

    /// Number of open DCI delayed response correlations.
    pub fn pending_correlations(&self) -> usize {
        self.correlations.len()
    }

    /// Deregister every command and clear both tables. The tables are
    /// cleared even when the device refuses the deregistration.
    pub fn deinit(&self) -> Result<()> {
        let _registering = self.registering.lock();
        let result = self
            .device
            .control(&ControlRequest::DeregisterCommands)
            .map(|_| ());
        self.registry.lock().clear();
        self.correlations.clear();
        result
    }
}
