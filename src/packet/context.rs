//! Per-request context and response records.
//!
//! Handlers receive a [`PacketContext`] for the packet being dispatched. It
//! allocates response packets from the engine's pool and remembers where the
//! request came from, so the committed response is framed for the right
//! destination:
//! - `alloc` / `subsys_alloc` / `subsys_alloc_v2` - build a response
//! - `err_rsp` - build a "bad command" response echoing the request
//! - `origin` - local or DCI, with the DCI tag
//!
//! # Example
//!
//! ```ignore
//! fn version(req: &[u8], ctx: &PacketContext<'_>) -> Option<PacketResponse> {
//!     let mut rsp = ctx.subsys_alloc(50, 0x10, 8).ok()?;
//!     rsp[4..8].copy_from_slice(&1u32.to_le_bytes());
//!     Some(rsp)
//! }
//! ```

use std::ops::{Deref, DerefMut};

use super::PacketEngine;
use crate::error::Result;
use crate::pool::PoolBuffer;
use crate::protocol::{SubsysV2Header, SUBSYS_V2_HEADER_SIZE};

/// Where a command packet came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Routed to this process by the device.
    Local,
    /// Relayed by a DCI client; `tag` identifies the request.
    Dci { tag: i32 },
}

/// Context passed to command handlers.
pub struct PacketContext<'a> {
    engine: &'a PacketEngine,
    origin: Origin,
}

impl<'a> PacketContext<'a> {
    pub(crate) fn new(engine: &'a PacketEngine, origin: Origin) -> Self {
        Self { engine, origin }
    }

    #[inline]
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Allocate a response of `len` bytes starting with `code`.
    pub fn alloc(&self, code: u8, len: usize) -> Result<PacketResponse> {
        self.engine.alloc(code, len)
    }

    /// Allocate a `0x4B` response with the subsystem header filled in.
    pub fn subsys_alloc(&self, subsys_id: u8, code: u16, len: usize) -> Result<PacketResponse> {
        self.engine.subsys_alloc(subsys_id, code, len)
    }

    /// Allocate a `0x80` response, reserving a delayed response id for
    /// commands of a delayed table.
    pub fn subsys_alloc_v2(&self, subsys_id: u8, code: u16, len: usize) -> Result<PacketResponse> {
        self.engine.subsys_alloc_v2(subsys_id, code, len)
    }

    /// Build an error response of `code` echoing the start of `request`.
    pub fn err_rsp(&self, code: u8, request: &[u8]) -> Result<PacketResponse> {
        self.engine.err_rsp(code, request)
    }

    /// The engine, for delayed responses sent after the handler returns.
    pub fn engine(&self) -> &'a PacketEngine {
        self.engine
    }
}

/// A response packet under construction.
///
/// Dereferences to the packet bytes, command code first.
#[derive(Debug)]
pub struct PacketResponse {
    buf: PoolBuffer,
}

impl PacketResponse {
    pub(crate) fn new(mut buf: PoolBuffer, code: u8, len: usize) -> Self {
        buf.clear();
        buf.vec_mut().resize(len, 0);
        if let Some(first) = buf.first_mut() {
            *first = code;
        }
        Self { buf }
    }

    /// Truncate the packet. Growing is not allowed; returns `false` if
    /// `new_len` is not shorter.
    pub fn shorten(&mut self, new_len: usize) -> bool {
        if new_len >= self.buf.len() {
            tracing::warn!(
                "Cannot shorten {} byte response to {}",
                self.buf.len(),
                new_len
            );
            return false;
        }
        self.buf.vec_mut().truncate(new_len);
        true
    }

    /// v2 header, if this is a `0x80` response.
    pub fn v2_header(&self) -> Option<SubsysV2Header> {
        SubsysV2Header::decode(&self.buf)
    }

    /// Set the response counter of a `0x80` response.
    pub fn set_rsp_cnt(&mut self, rsp_cnt: u16) {
        if let Some(mut header) = self.v2_header() {
            header.rsp_cnt = rsp_cnt;
            header.write_to(&mut self.buf);
        }
    }

    pub(crate) fn into_buffer(self) -> PoolBuffer {
        self.buf
    }
}

impl Deref for PacketResponse {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for PacketResponse {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// A delayed response part, committed with
/// [`PacketEngine::delay_commit`](super::PacketEngine::delay_commit).
#[derive(Debug)]
pub struct DelayedResponse {
    buf: PoolBuffer,
}

impl DelayedResponse {
    pub(crate) fn new(mut buf: PoolBuffer, header: SubsysV2Header, len: usize) -> Self {
        buf.clear();
        buf.vec_mut().resize(len.max(SUBSYS_V2_HEADER_SIZE), 0);
        header.write_to(&mut buf);
        Self { buf }
    }

    pub fn header(&self) -> SubsysV2Header {
        // always at least a full header long
        SubsysV2Header::decode(&self.buf).unwrap_or_else(|| SubsysV2Header::new(0, 0))
    }

    #[inline]
    pub fn delayed_rsp_id(&self) -> u16 {
        self.header().delayed_rsp_id
    }

    #[inline]
    pub fn rsp_cnt(&self) -> u16 {
        self.header().rsp_cnt
    }

    /// Set the part counter. Values at or above `0x1000` mean more parts
    /// follow.
    pub fn set_rsp_cnt(&mut self, rsp_cnt: u16) {
        let mut header = self.header();
        header.rsp_cnt = rsp_cnt;
        header.write_to(&mut self.buf);
    }

    /// Payload following the v2 header.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[SUBSYS_V2_HEADER_SIZE..]
    }

    pub(crate) fn into_buffer(self) -> PoolBuffer {
        self.buf
    }
}

impl Deref for DelayedResponse {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::{BufferPool, PoolClass};

    fn pool() -> BufferPool {
        let pool = BufferPool::new(&PoolConfig::default());
        pool.init();
        pool
    }

    #[test]
    fn test_response_code_and_shorten() {
        let pool = pool();
        let buf = pool.alloc(16, PoolClass::Packet).unwrap();
        let mut rsp = PacketResponse::new(buf, 0x1d, 16);
        assert_eq!(rsp.len(), 16);
        assert_eq!(rsp[0], 0x1d);

        assert!(rsp.shorten(4));
        assert_eq!(rsp.len(), 4);
        assert!(!rsp.shorten(4));
    }

    #[test]
    fn test_response_rsp_cnt() {
        let pool = pool();
        let buf = pool.alloc(16, PoolClass::Packet).unwrap();
        let mut rsp = PacketResponse::new(buf, 0x80, 16);
        rsp.set_rsp_cnt(3);
        assert_eq!(rsp.v2_header().unwrap().rsp_cnt, 3);
    }

    #[test]
    fn test_delayed_header() {
        let pool = pool();
        let buf = pool.alloc(20, PoolClass::General).unwrap();
        let mut header = SubsysV2Header::new(18, 0x0816);
        header.delayed_rsp_id = 9;
        header.rsp_cnt = 1;
        let mut rsp = DelayedResponse::new(buf, header, 20);

        assert_eq!(rsp.len(), 20);
        assert_eq!(rsp.delayed_rsp_id(), 9);
        rsp.set_rsp_cnt(0x1001);
        assert_eq!(rsp.rsp_cnt(), 0x1001);
        assert_eq!(rsp.payload_mut().len(), 8);
    }
}
