//! Pooled byte buffers shared by all connections.
//!
//! The arena hands out fixed-size buffers by handle. A handle carries the
//! slot generation it was issued for; releasing a buffer bumps the generation
//! so any later use of the old handle is reported as [`PgError::StaleBuffer`]
//! instead of touching a buffer that now belongs to someone else.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::error::{PgError, PgResult};

/// Default buffer size for socket reads.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Reference to a leased buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    slot: usize,
    generation: u32,
}

impl BufferHandle {
    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

struct SlotState {
    generation: u32,
    leased: bool,
    data: Box<[u8]>,
}

/// Snapshot of arena usage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Buffers ever allocated.
    pub allocated: usize,
    /// Buffers currently leased.
    pub leased: usize,
    /// Acquisitions served from the free list.
    pub reused: usize,
}

/// Thread-safe pool of fixed-size buffers.
pub struct BufferArena {
    buffer_size: usize,
    slots: RwLock<Vec<Arc<Mutex<SlotState>>>>,
    free: Mutex<Vec<usize>>,
    leased: AtomicUsize,
    reused: AtomicUsize,
}

impl BufferArena {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            slots: RwLock::new(Vec::new()),
            free: Mutex::new(Vec::new()),
            leased: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Lease a buffer, reusing a released one when available.
    pub fn acquire(&self) -> BufferHandle {
        self.leased.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = self.free.lock().pop() {
            if let Some(state) = self.slots.read().get(slot) {
                let mut state = state.lock();
                state.leased = true;
                self.reused.fetch_add(1, Ordering::Relaxed);
                return BufferHandle {
                    slot,
                    generation: state.generation,
                };
            }
        }

        let mut slots = self.slots.write();
        let slot = slots.len();
        slots.push(Arc::new(Mutex::new(SlotState {
            generation: 0,
            leased: true,
            data: vec![0u8; self.buffer_size].into_boxed_slice(),
        })));
        trace!(slot, size = self.buffer_size, "buffer allocated");
        BufferHandle {
            slot,
            generation: 0,
        }
    }

    fn slot(&self, handle: BufferHandle) -> PgResult<Arc<Mutex<SlotState>>> {
        self.slots
            .read()
            .get(handle.slot)
            .cloned()
            .ok_or(PgError::StaleBuffer {
                slot: handle.slot,
                generation: handle.generation,
            })
    }

    /// Run `f` with mutable access to the leased buffer.
    pub fn with<R>(&self, handle: BufferHandle, f: impl FnOnce(&mut [u8]) -> R) -> PgResult<R> {
        let slot = self.slot(handle)?;
        let mut state = slot.lock();
        if !state.leased || state.generation != handle.generation {
            return Err(PgError::StaleBuffer {
                slot: handle.slot,
                generation: handle.generation,
            });
        }
        Ok(f(&mut state.data))
    }

    /// Return a buffer to the pool. The handle becomes stale.
    pub fn release(&self, handle: BufferHandle) -> PgResult<()> {
        let slot = self.slot(handle)?;
        {
            let mut state = slot.lock();
            if !state.leased || state.generation != handle.generation {
                return Err(PgError::StaleBuffer {
                    slot: handle.slot,
                    generation: handle.generation,
                });
            }
            state.leased = false;
            state.generation = state.generation.wrapping_add(1);
        }
        self.leased.fetch_sub(1, Ordering::Relaxed);
        self.free.lock().push(handle.slot);
        Ok(())
    }

    /// Lease a buffer that is released when the guard drops.
    pub fn lease(self: &Arc<Self>) -> Lease {
        Lease {
            handle: self.acquire(),
            arena: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            allocated: self.slots.read().len(),
            leased: self.leased.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }
}

impl Default for BufferArena {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// RAII lease on an arena buffer.
pub struct Lease {
    arena: Arc<BufferArena>,
    handle: BufferHandle,
}

impl Lease {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> PgResult<R> {
        self.arena.with(self.handle, f)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let _ = self.arena.release(self.handle);
    }
}
