//! Fixed-slot buffer pools with heap fallback.
//!
//! Two classes of slots are kept: general-purpose buffers for outbound
//! requests and smaller packet buffers for command responses. A request that
//! does not fit the class, or that finds every slot taken, is served from the
//! heap instead. Running out of slots is never an error.
//!
//! Buffers return to their slot when dropped:
//!
//! ```
//! use diag_transport::config::PoolConfig;
//! use diag_transport::pool::{BufferPool, PoolClass};
//!
//! let pool = BufferPool::new(&PoolConfig::default());
//! pool.init();
//!
//! let buf = pool.alloc(100, PoolClass::Packet).unwrap();
//! assert!(buf.is_pooled());
//! assert_eq!(pool.in_use(PoolClass::Packet), 1);
//!
//! drop(buf);
//! assert_eq!(pool.in_use(PoolClass::Packet), 0);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::error::{DiagError, Result};

/// Slot class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolClass {
    /// General-purpose buffers.
    General,
    /// Command response buffers.
    Packet,
}

struct Slot {
    in_use: bool,
    storage: Option<Vec<u8>>,
}

struct ClassSlots {
    item_size: usize,
    count: usize,
    slots: Vec<Slot>,
}

impl ClassSlots {
    fn new(item_size: usize, count: usize) -> Self {
        Self {
            item_size,
            count,
            slots: Vec::new(),
        }
    }

    fn populate(&mut self) {
        self.slots = (0..self.count)
            .map(|_| Slot {
                in_use: false,
                storage: Some(Vec::with_capacity(self.item_size)),
            })
            .collect();
    }

    fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }
}

struct State {
    initialized: bool,
    /// Bumped on every `exit()` so buffers from an earlier life are not
    /// accepted back.
    epoch: u64,
    general: ClassSlots,
    packet: ClassSlots,
}

impl State {
    fn class(&mut self, class: PoolClass) -> &mut ClassSlots {
        match class {
            PoolClass::General => &mut self.general,
            PoolClass::Packet => &mut self.packet,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    heap_allocations: AtomicUsize,
}

impl Shared {
    /// Return slot storage. Returns `false` if the slot no longer accepts it.
    fn give_back(&self, origin: SlotOrigin, mut storage: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if !state.initialized || state.epoch != origin.epoch {
            return false;
        }
        let Some(slot) = state.class(origin.class).slots.get_mut(origin.index) else {
            return false;
        };
        if !slot.in_use {
            return false;
        }
        storage.clear();
        slot.storage = Some(storage);
        slot.in_use = false;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotOrigin {
    class: PoolClass,
    index: usize,
    epoch: u64,
}

/// Handle to a pair of slot pools.
///
/// Cloning the handle shares the same pools.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Create an uninitialized pool. Call [`init`](Self::init) before allocating.
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    initialized: false,
                    epoch: 0,
                    general: ClassSlots::new(config.general_item_size, config.general_items),
                    packet: ClassSlots::new(config.packet_item_size, config.packet_items),
                }),
                heap_allocations: AtomicUsize::new(0),
            }),
        }
    }

    /// Allocate slot storage. Calling `init` twice is a no-op.
    pub fn init(&self) {
        let mut state = self.shared.state.lock();
        if state.initialized {
            return;
        }
        state.general.populate();
        state.packet.populate();
        state.initialized = true;
        tracing::debug!(
            "Buffer pool ready: {} x {} general, {} x {} packet",
            state.general.count,
            state.general.item_size,
            state.packet.count,
            state.packet.item_size
        );
    }

    /// Tear down all slots. Outstanding buffers are heap-freed when dropped.
    pub fn exit(&self) {
        let mut state = self.shared.state.lock();
        if !state.initialized {
            return;
        }
        state.initialized = false;
        state.epoch += 1;
        state.general.slots.clear();
        state.packet.slots.clear();
    }

    /// Allocate a buffer able to hold `size` bytes.
    ///
    /// The returned buffer is empty with at least `size` bytes of capacity.
    pub fn alloc(&self, size: usize, class: PoolClass) -> Result<PoolBuffer> {
        let mut state = self.shared.state.lock();
        if !state.initialized {
            return Err(DiagError::NotInitialized);
        }
        let epoch = state.epoch;
        let slots = state.class(class);

        if size <= slots.item_size {
            if let Some((index, slot)) = slots
                .slots
                .iter_mut()
                .enumerate()
                .find(|(_, s)| !s.in_use)
            {
                slot.in_use = true;
                let data = slot
                    .storage
                    .take()
                    .unwrap_or_else(|| Vec::with_capacity(size));
                return Ok(PoolBuffer {
                    data,
                    origin: Some(SlotOrigin {
                        class,
                        index,
                        epoch,
                    }),
                    pool: Arc::downgrade(&self.shared),
                });
            }
        }
        drop(state);

        self.shared.heap_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(PoolBuffer {
            data: Vec::with_capacity(size),
            origin: None,
            pool: Weak::new(),
        })
    }

    /// Release a buffer.
    ///
    /// Slot buffers of this pool and class are marked free; anything else is
    /// heap-freed. A class mismatch is logged and the buffer still returns to
    /// the slot it came from.
    pub fn free(&self, buf: PoolBuffer, class: PoolClass) {
        if let Some(origin) = buf.origin {
            if origin.class != class {
                tracing::warn!(
                    "Buffer from {:?} slot {} freed as {:?}",
                    origin.class,
                    origin.index,
                    class
                );
            }
            if !buf.pool.ptr_eq(&Arc::downgrade(&self.shared)) {
                tracing::warn!("Freeing buffer that belongs to another pool");
            }
        }
        drop(buf);
    }

    /// Number of slots of `class` currently handed out.
    pub fn in_use(&self, class: PoolClass) -> usize {
        self.shared.state.lock().class(class).in_use()
    }

    /// Total number of heap fallbacks since creation.
    pub fn heap_allocations(&self) -> usize {
        self.shared.heap_allocations.load(Ordering::Relaxed)
    }

    /// Slot capacity of `class`.
    pub fn item_size(&self, class: PoolClass) -> usize {
        self.shared.state.lock().class(class).item_size
    }

    pub fn is_initialized(&self) -> bool {
        self.shared.state.lock().initialized
    }
}

/// A buffer obtained from [`BufferPool::alloc`].
///
/// Dereferences to the written bytes. Use [`vec_mut`](Self::vec_mut) to
/// encode into it with `bytes::BufMut`.
pub struct PoolBuffer {
    data: Vec<u8>,
    origin: Option<SlotOrigin>,
    pool: Weak<Shared>,
}

impl PoolBuffer {
    /// True if backed by a pool slot rather than the heap.
    #[inline]
    pub fn is_pooled(&self) -> bool {
        self.origin.is_some()
    }

    /// Class and index of the backing slot.
    pub fn slot(&self) -> Option<(PoolClass, usize)> {
        self.origin.map(|o| (o.class, o.index))
    }

    /// Append bytes.
    #[inline]
    pub fn put(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Underlying vector, for `BufMut` encoding.
    #[inline]
    pub fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.data.len())
            .field("slot", &self.slot())
            .finish()
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        let Some(origin) = self.origin.take() else {
            return;
        };
        if let Some(shared) = self.pool.upgrade() {
            let storage = std::mem::take(&mut self.data);
            shared.give_back(origin, storage);
        }
    }
}
