//! Per-processor client slot and its transaction table.

use std::sync::Arc;

use parking_lot::Mutex;

use super::stream::{DataSignal, StreamHandler};
use crate::arena::{Arena, Handle};
use crate::pool::PoolBuffer;

/// Client id of an inactive slot.
pub const INVALID_CLIENT_ID: i32 = -1;

/// Completion callback of a transaction. Receives the copied response.
pub type Completion = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Caller-owned destination of a DCI response.
///
/// Responses longer than the declared capacity are rejected rather than
/// truncated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ResponseBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Declared capacity.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes of the last accepted response.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Copy `payload` in. Returns `false`, leaving the buffer untouched, if
    /// `payload` is empty or larger than the capacity.
    pub(crate) fn fill(&mut self, payload: &[u8]) -> bool {
        if payload.is_empty() || payload.len() > self.capacity {
            return false;
        }
        self.data.clear();
        self.data.extend_from_slice(payload);
        true
    }
}

/// A request waiting for its response.
pub(crate) struct Transaction {
    pub uid: i32,
    pub response: ResponseBuffer,
    pub callback: Completion,
}

/// Registration state of a slot.
pub(crate) struct ClientInfo {
    pub client_id: i32,
    pub notification_mask: u32,
    pub signal_type: i32,
    pub version: u8,
    /// Scratch buffer requests are encoded into.
    pub scratch: Option<PoolBuffer>,
    pub logs: Option<StreamHandler>,
    pub events: Option<StreamHandler>,
    pub data_signal: Option<DataSignal>,
}

impl ClientInfo {
    fn inactive() -> Self {
        Self {
            client_id: INVALID_CLIENT_ID,
            notification_mask: 0,
            signal_type: 0,
            version: 0,
            scratch: None,
            logs: None,
            events: None,
            data_signal: None,
        }
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.client_id != INVALID_CLIENT_ID
    }

    /// Back to the unregistered state, dropping handlers and the scratch
    /// buffer.
    pub fn reset(&mut self) {
        *self = Self::inactive();
    }
}

/// One processor's client and in-flight transactions.
///
/// The info and request tables have separate locks; neither is held while a
/// user callback runs.
pub(crate) struct ClientSlot {
    pub info: Mutex<ClientInfo>,
    pub requests: Mutex<Arena<Transaction>>,
}

impl ClientSlot {
    pub fn new() -> Self {
        Self {
            info: Mutex::new(ClientInfo::inactive()),
            requests: Mutex::new(Arena::new()),
        }
    }

    pub fn client_id(&self) -> i32 {
        self.info.lock().client_id
    }

    pub fn insert(&self, transaction: Transaction) -> Handle {
        self.requests.lock().insert(transaction)
    }

    pub fn remove(&self, handle: Handle) -> bool {
        self.requests.lock().remove(handle).is_some()
    }

    /// Number of transactions in flight.
    pub fn pending(&self) -> usize {
        self.requests.lock().len()
    }

    /// Drop every in-flight transaction.
    pub fn clear(&self) -> usize {
        self.requests.lock().drain().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_buffer_bounds() {
        let mut buf = ResponseBuffer::with_capacity(4);
        assert!(!buf.fill(&[]));
        assert!(!buf.fill(&[1, 2, 3, 4, 5]));
        assert!(buf.as_bytes().is_empty());
        assert!(buf.fill(&[1, 2, 3, 4]));
        assert_eq!(buf.as_bytes(), &[1, 2, 3, 4]);
        assert!(buf.fill(&[9]));
        assert_eq!(buf.as_bytes(), &[9]);
    }

    #[test]
    fn test_slot_reset() {
        let slot = ClientSlot::new();
        {
            let mut info = slot.info.lock();
            info.client_id = 3;
            info.version = 1;
        }
        assert_eq!(slot.client_id(), 3);
        slot.info.lock().reset();
        assert!(!slot.info.lock().is_active());
        assert_eq!(slot.info.lock().version, 0);
    }

    #[test]
    fn test_slot_transactions() {
        let slot = ClientSlot::new();
        let callback: Completion = Arc::new(|_: &[u8]| {});
        let h = slot.insert(Transaction {
            uid: 1,
            response: ResponseBuffer::with_capacity(8),
            callback: Arc::clone(&callback),
        });
        slot.insert(Transaction {
            uid: 2,
            response: ResponseBuffer::with_capacity(8),
            callback,
        });
        assert_eq!(slot.pending(), 2);
        assert!(slot.remove(h));
        assert!(!slot.remove(h));
        assert_eq!(slot.clear(), 1);
        assert_eq!(slot.pending(), 0);
    }
}
