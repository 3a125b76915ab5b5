//! Two-slot handoff between the device reader and the disk writer.
//!
//! Each slot holds one region per processor. The reader appends to the
//! filling slot; when a region would overflow, the rest of the region is
//! filled, the slot is handed to the writer and the reader moves to the other
//! slot, blocking until the writer has freed it. A slot is only ever touched
//! by one side: the reader while it is free, the writer while it is ready.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::protocol::stream::NUM_PROC;

/// Progress of a pipeline shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushPhase {
    /// Normal operation.
    Running,
    /// Shutdown requested; incoming data is dropped.
    Requested,
    /// The reader handed over its partial slot.
    HandedOver,
    /// The writer wrote every ready slot and closed its files.
    Drained,
}

struct Slot {
    regions: Vec<Vec<u8>>,
    ready: bool,
    free: bool,
}

impl Slot {
    fn new() -> Self {
        Self {
            regions: vec![Vec::new(); NUM_PROC],
            ready: false,
            free: true,
        }
    }
}

struct Inner {
    slots: [Slot; 2],
    /// Slot the reader appends to.
    fill: usize,
    /// Slot the writer takes next.
    drain: usize,
    phase: FlushPhase,
}

pub(crate) struct DoubleBuffer {
    inner: Mutex<Inner>,
    /// Signalled when a slot becomes ready or the phase advances.
    ready: Condvar,
    /// Signalled when the writer frees a slot or finishes.
    freed: Condvar,
    region_size: usize,
}

impl DoubleBuffer {
    pub fn new(region_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: [Slot::new(), Slot::new()],
                fill: 0,
                drain: 0,
                phase: FlushPhase::Running,
            }),
            ready: Condvar::new(),
            freed: Condvar::new(),
            region_size,
        }
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    pub fn phase(&self) -> FlushPhase {
        self.inner.lock().phase
    }

    /// Append `data` to `proc`'s region, handing slots over as they fill.
    ///
    /// Blocks while both slots are with the writer. Returns `false` if data
    /// was dropped because the pipeline is shutting down.
    pub fn fill(&self, proc: usize, mut data: &[u8]) -> bool {
        if proc >= NUM_PROC {
            tracing::warn!("Dropping {} bytes for unknown processor {}", data.len(), proc);
            return false;
        }
        let mut inner = self.inner.lock();
        loop {
            if inner.phase != FlushPhase::Running {
                tracing::debug!("Pipeline flushing, dropping {} bytes", data.len());
                return false;
            }
            let fill = inner.fill;
            let region = &mut inner.slots[fill].regions[proc];
            let room = self.region_size.saturating_sub(region.len());
            if data.len() < room {
                region.extend_from_slice(data);
                return true;
            }
            region.extend_from_slice(&data[..room]);
            data = &data[room..];

            Self::hand_off(&mut inner);
            self.ready.notify_all();
            tracing::debug!("Slot {} handed to writer", fill);

            while !inner.slots[inner.fill].free {
                if inner.phase >= FlushPhase::HandedOver {
                    return false;
                }
                self.freed.wait(&mut inner);
            }
        }
    }

    fn hand_off(inner: &mut Inner) {
        let fill = inner.fill;
        inner.slots[fill].ready = true;
        inner.slots[fill].free = false;
        inner.fill = 1 - fill;
    }

    /// Writer side: wait for the next ready slot and take its regions.
    ///
    /// Returns `None` once the reader has handed over and nothing is left.
    pub fn next_ready(&self) -> Option<(usize, Vec<Vec<u8>>)> {
        let mut inner = self.inner.lock();
        loop {
            let drain = inner.drain;
            if inner.slots[drain].ready {
                let regions = std::mem::take(&mut inner.slots[drain].regions);
                return Some((drain, regions));
            }
            if inner.phase >= FlushPhase::HandedOver {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Writer side: give a written slot back to the reader.
    pub fn release(&self, index: usize, mut regions: Vec<Vec<u8>>) {
        for region in &mut regions {
            region.clear();
        }
        let mut inner = self.inner.lock();
        let slot = &mut inner.slots[index];
        slot.regions = regions;
        slot.ready = false;
        slot.free = true;
        inner.drain = 1 - index;
        drop(inner);
        self.freed.notify_all();
    }

    /// Stop accepting data.
    pub fn request_flush(&self) {
        let mut inner = self.inner.lock();
        if inner.phase == FlushPhase::Running {
            inner.phase = FlushPhase::Requested;
        }
    }

    /// Reader side: hand the partial slot to the writer.
    pub fn hand_over(&self) {
        let mut inner = self.inner.lock();
        if inner.phase >= FlushPhase::HandedOver {
            return;
        }
        if inner.slots[inner.fill].free {
            Self::hand_off(&mut inner);
        }
        inner.phase = FlushPhase::HandedOver;
        drop(inner);
        self.ready.notify_all();
        self.freed.notify_all();
    }

    /// Writer side: everything is on disk.
    pub fn finish(&self) {
        self.inner.lock().phase = FlushPhase::Drained;
        self.freed.notify_all();
    }

    /// Wait until the writer finished. Returns `false` on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.phase != FlushPhase::Drained {
            if self.freed.wait_until(&mut inner, deadline).timed_out() {
                return inner.phase == FlushPhase::Drained;
            }
        }
        true
    }

    /// Empty both slots. The phase is left as it is.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for slot in &mut inner.slots {
            if slot.regions.len() != NUM_PROC {
                slot.regions = vec![Vec::new(); NUM_PROC];
            }
            for region in &mut slot.regions {
                region.clear();
            }
            slot.ready = false;
            slot.free = true;
        }
        inner.fill = 0;
        inner.drain = 0;
    }

    /// Bytes buffered for `proc` in the filling slot.
    #[cfg(test)]
    fn buffered(&self, proc: usize) -> usize {
        let inner = self.inner.lock();
        inner.slots[inner.fill].regions[proc].len()
    }
}
