//! Delayed response correlation.
//!
//! A v2 command relayed over DCI is answered in parts carrying the delayed
//! response id issued by the device. The first (immediate) part records
//! `delayed_rsp_id -> dci tag`; every later part looks the tag up. The entry
//! is removed when a part's response counter marks it as the last one, not
//! when parts stop arriving.

use parking_lot::Mutex;

use crate::arena::{Arena, Handle};

#[derive(Debug, Clone, Copy)]
struct Correlation {
    delayed_rsp_id: u16,
    tag: i32,
}

/// `delayed_rsp_id -> dci tag` table with its own lock.
#[derive(Default)]
pub struct CorrelationTable {
    entries: Mutex<Arena<Correlation>>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delayed_rsp_id: u16, tag: i32) -> Handle {
        self.entries.lock().insert(Correlation {
            delayed_rsp_id,
            tag,
        })
    }

    /// First entry for `delayed_rsp_id`.
    pub fn find(&self, delayed_rsp_id: u16) -> Option<(Handle, i32)> {
        let entries = self.entries.lock();
        let handle = entries.find(|c| c.delayed_rsp_id == delayed_rsp_id)?;
        entries.get(handle).map(|c| (handle, c.tag))
    }

    /// Remove an entry. Returns `false` if it was already gone.
    pub fn remove(&self, handle: Handle) -> bool {
        self.entries.lock().remove(handle).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().drain();
    }
}
