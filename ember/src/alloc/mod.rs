#![allow(unsafe_op_in_unsafe_fn)]

//! Thread-local chunk allocator used to host task frames.
//!
//! Every thread that allocates gets its own [`Chunk`](chunk::Chunk), created
//! lazily on first use. Allocation is always served by the caller's chunk.
//! Deallocation frees into the caller's chunk when it owns the pointer,
//! otherwise the owning chunk is looked up and the block is queued on its
//! pending list until the next reclamation passes.

use dashmap::DashMap;
use std::alloc::Layout;
use std::fmt;
use std::ptr::NonNull;
use std::thread::{self, ThreadId};

pub(crate) mod chunk;
use chunk::{Chunk, MIN_BLOCK_SIZE};

mod error;
pub use error::AllocError;


/// Snapshot of allocator occupancy across all chunks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AllocStats {
    /// Number of chunks (one per thread that ever allocated).
    pub chunks: usize,

    /// Blocks handed out and not yet freed.
    pub live: usize,

    /// Blocks freed from a foreign thread, waiting for reclamation.
    pub pending: usize,
}

pub struct ThreadAllocator {
    chunks: DashMap<ThreadId, Chunk>,
    chunk_capacity: usize,
    max_block_size: usize,
}

impl ThreadAllocator {
    /// Creates an allocator whose per-thread chunks hold `chunk_capacity`
    /// bytes and serve blocks of at most `max_block_size` bytes.
    #[track_caller]
    pub fn new(chunk_capacity: usize, max_block_size: usize) -> ThreadAllocator {
        assert!(
            max_block_size.is_power_of_two() && max_block_size >= MIN_BLOCK_SIZE,
            "max_block_size must be a power of two >= {MIN_BLOCK_SIZE}"
        );
        assert!(
            chunk_capacity >= max_block_size,
            "chunk_capacity must hold at least one block of max_block_size"
        );

        ThreadAllocator {
            chunks: DashMap::new(),
            chunk_capacity,
            max_block_size,
        }
    }

    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
    }

    pub fn max_block_size(&self) -> usize {
        self.max_block_size
    }

    /// Allocates room for `count` values of `T` from the calling thread's
    /// chunk. The memory is uninitialized.
    pub fn allocate<T>(&self, count: usize) -> Result<NonNull<T>, AllocError> {
        let layout = Layout::array::<T>(count).map_err(|_| AllocError::TooLarge {
            size: usize::MAX,
            max: self.max_block_size,
        })?;

        self.allocate_layout(layout).map(NonNull::cast)
    }

    /// Frees memory obtained from [`ThreadAllocator::allocate`].
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate::<T>(count)` on this allocator, any
    /// value stored in it must already be dropped, and it must not be used
    /// afterwards.
    pub unsafe fn deallocate<T>(&self, ptr: NonNull<T>, count: usize) {
        // The same layout was computed successfully when allocating.
        let Ok(layout) = Layout::array::<T>(count) else {
            unreachable!("deallocate called with a count that could never be allocated");
        };

        self.deallocate_layout(ptr.cast(), layout);
    }

    pub fn allocate_layout(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let id = thread::current().id();

        if let Some(chunk) = self.chunks.get(&id) {
            return chunk.allocate(layout);
        }

        let chunk = self
            .chunks
            .entry(id)
            .or_try_insert_with(|| Chunk::new(id, self.chunk_capacity, self.max_block_size))?;

        tracing::debug!(thread = ?id, capacity = self.chunk_capacity, "created allocator chunk");
        chunk.allocate(layout)
    }

    /// Frees a block. Blocks owned by the calling thread go straight back to
    /// its free lists, blocks owned by another thread are deferred to that
    /// chunk's pending list.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `allocate_layout(layout)` on this allocator and
    /// must not be used afterwards.
    ///
    /// # Panics
    ///
    /// If no chunk of this allocator owns `ptr`.
    #[track_caller]
    pub unsafe fn deallocate_layout(&self, ptr: NonNull<u8>, layout: Layout) {
        let id = thread::current().id();

        if let Some(chunk) = self.chunks.get(&id)
            && chunk.contains(ptr)
        {
            chunk.free_local(ptr, layout);
            return;
        }

        match self.chunks.iter().find(|chunk| chunk.contains(ptr)) {
            Some(owner) => {
                tracing::trace!(ptr = ?ptr, owner = ?owner.owner(), "deferred cross-thread free");
                owner.free_remote(ptr, layout);
            }
            None => panic!("pointer {ptr:p} was not allocated by this allocator"),
        }
    }

    /// Runs one reclamation pass over every chunk and returns how many
    /// remotely freed blocks became reusable.
    ///
    /// A block freed from a foreign thread is queued on the chunk's active
    /// pending list, and a pass only drains the inactive one before flipping
    /// them. Such a block therefore becomes reusable after one or two passes,
    /// never during the pass that races with its free.
    ///
    /// Chunks of threads that exited are released once empty.
    pub fn deallocate_pending(&self) -> usize {
        let reclaimed = self
            .chunks
            .iter()
            .map(|chunk| chunk.merge_pending())
            .sum();

        // Frees hold a read guard on the owning shard, so an empty chunk
        // seen under the write guard has no block in flight.
        let mut released = 0;
        self.chunks.retain(|_, chunk| {
            let release = chunk.is_orphaned() && chunk.is_empty();
            released += usize::from(release);
            !release
        });

        tracing::debug!(reclaimed, released, chunks = self.chunks.len(), "reclamation pass");
        reclaimed
    }

    /// Returns true if `ptr` lies in any chunk of this allocator.
    pub fn owns<T>(&self, ptr: NonNull<T>) -> bool {
        self.chunks.iter().any(|chunk| chunk.contains(ptr.cast()))
    }

    pub fn stats(&self) -> AllocStats {
        self.chunks
            .iter()
            .fold(AllocStats::default(), |mut stats, chunk| {
                stats.chunks += 1;
                stats.live += chunk.live();
                stats.pending += chunk.pending();
                stats
            })
    }
}

impl fmt::Debug for ThreadAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadAllocator")
            .field("chunk_capacity", &self.chunk_capacity)
            .field("max_block_size", &self.max_block_size)
            .field("stats", &self.stats())
            .finish()
    }
}
