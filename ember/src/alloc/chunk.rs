#![allow(unsafe_op_in_unsafe_fn)]

use crate::alloc::AllocError;
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::alloc::{self as sys, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

/// Smallest block handed out by a chunk. Every request is rounded up to a
/// power of two of at least this size, so blocks are always cache-line
/// aligned.
pub(crate) const MIN_BLOCK_SIZE: usize = 64;

/// Maps a layout to its size class index and block size.
pub(crate) fn size_class(layout: Layout, max_block_size: usize) -> Result<(usize, usize), AllocError> {
    if layout.size() == 0 {
        return Err(AllocError::ZeroSized);
    }

    let block_size = layout
        .size()
        .max(layout.align())
        .max(MIN_BLOCK_SIZE)
        .next_power_of_two();

    if block_size > max_block_size {
        return Err(AllocError::TooLarge {
            size: layout.size(),
            max: max_block_size,
        });
    }

    let class = (block_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize;
    Ok((class, block_size))
}

thread_local! {
    /// Dropped when the thread exits, which tells chunks their owner is gone.
    static THREAD_ALIVE: Arc<()> = Arc::new(());
}

/// A block released by a thread other than the chunk owner. It stays out of
/// the free lists until a reclamation pass merges it back.
#[derive(Debug, Clone, Copy)]
struct PendingFree {
    offset: usize,
    class: usize,
}

/// Live free-list heap. Only the owning thread and the reclamation pass ever
/// take the lock, so it is uncontended in practice.
#[derive(Debug)]
struct Heap {
    /// Bump pointer, everything above it has never been handed out.
    top: usize,

    /// One LIFO free list of block offsets per size class.
    free: Vec<Vec<usize>>,
}

/// Fixed-capacity allocation pool owned by a single thread.
///
/// Blocks are carved out of one contiguous region. Each block is aligned to
/// its own size, which is why the region is aligned to the largest block
/// size.
///
/// Frees coming from other threads never touch the live free lists. They go
/// to one of two pending queues, selected by `active`. A reclamation pass
/// drains the *other* queue and then flips `active`, so a block freed
/// remotely is never reissued before the next pass.
pub(crate) struct Chunk {
    owner: ThreadId,
    owner_alive: Weak<()>,
    base: NonNull<u8>,
    region: Layout,
    max_block_size: usize,
    heap: Mutex<Heap>,
    pending: [SegQueue<PendingFree>; 2],
    active: CachePadded<AtomicUsize>,
    live: AtomicUsize,
    pending_len: AtomicUsize,
}

// Safety: the region is only reached through `&self` methods which either
// hold the heap lock or go through the lock-free pending queues.
unsafe impl Send for Chunk {}
unsafe impl Sync for Chunk {}

impl Chunk {
    pub(crate) fn new(owner: ThreadId, capacity: usize, max_block_size: usize) -> Result<Chunk, AllocError> {
        let region = Layout::from_size_align(capacity, max_block_size)
            .map_err(|_| AllocError::OutOfMemory { capacity })?;

        if region.size() == 0 {
            return Err(AllocError::OutOfMemory { capacity });
        }

        // Safety: region has a non-zero size.
        let base = NonNull::new(unsafe { sys::alloc(region) })
            .ok_or(AllocError::OutOfMemory { capacity })?;

        debug_assert!(max_block_size.is_power_of_two() && max_block_size >= MIN_BLOCK_SIZE);
        let num_classes = (max_block_size.trailing_zeros() - MIN_BLOCK_SIZE.trailing_zeros()) as usize + 1;

        // Unset while the thread is being torn down, such a chunk counts as
        // orphaned from the start.
        let owner_alive = THREAD_ALIVE.try_with(Arc::downgrade).unwrap_or_default();

        Ok(Chunk {
            owner,
            owner_alive,
            base,
            region,
            max_block_size,
            heap: Mutex::new(Heap {
                top: 0,
                free: vec![Vec::new(); num_classes],
            }),
            pending: [SegQueue::new(), SegQueue::new()],
            active: CachePadded::new(AtomicUsize::new(0)),
            live: AtomicUsize::new(0),
            pending_len: AtomicUsize::new(0),
        })
    }

    pub(crate) fn owner(&self) -> ThreadId {
        self.owner
    }

    /// True once the owner thread exited. Nothing allocates from the chunk
    /// anymore.
    pub(crate) fn is_orphaned(&self) -> bool {
        self.owner_alive.strong_count() == 0
    }

    /// No block is handed out or waiting to be merged back.
    pub(crate) fn is_empty(&self) -> bool {
        self.live() == 0 && self.pending() == 0
    }

    pub(crate) fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Blocks handed out and not yet freed.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Blocks freed remotely and not yet merged back.
    pub(crate) fn pending(&self) -> usize {
        self.pending_len.load(Ordering::Relaxed)
    }

    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        addr >= base && addr < base + self.region.size()
    }

    pub(crate) fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError> {
        let (class, block_size) = size_class(layout, self.max_block_size)?;

        let offset = {
            let mut heap = self.heap.lock();

            match heap.free[class].pop() {
                Some(offset) => offset,
                None => {
                    let offset = heap.top.next_multiple_of(block_size);
                    if offset + block_size > self.region.size() {
                        return Err(AllocError::Exhausted {
                            requested: block_size,
                            capacity: self.region.size(),
                        });
                    }

                    heap.top = offset + block_size;
                    offset
                }
            }
        };

        self.live.fetch_add(1, Ordering::Relaxed);

        // Safety: offset + block_size is within the region.
        Ok(unsafe { self.base.add(offset) })
    }

    /// Returns a block to the live free list. Must be called from the owner
    /// thread.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `allocate` on this chunk with the same
    /// `layout`, and must not be used afterwards.
    pub(crate) unsafe fn free_local(&self, ptr: NonNull<u8>, layout: Layout) {
        debug_assert_eq!(self.owner, std::thread::current().id());

        let (offset, class) = self.locate(ptr, layout);
        self.heap.lock().free[class].push(offset);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Defers the free of a block to the next reclamation passes.
    ///
    /// # Safety
    ///
    /// Same contract as [`Chunk::free_local`], from any thread.
    pub(crate) unsafe fn free_remote(&self, ptr: NonNull<u8>, layout: Layout) {
        let (offset, class) = self.locate(ptr, layout);
        let active = self.active.load(Ordering::Acquire);

        // Counted before the push so a concurrent merge never underflows.
        self.pending_len.fetch_add(1, Ordering::Relaxed);
        self.pending[active].push(PendingFree { offset, class });
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Merges the inactive pending queue into the free lists, then makes it
    /// the active one. Returns the number of blocks reclaimed.
    pub(crate) fn merge_pending(&self) -> usize {
        let inactive = self.active.load(Ordering::Acquire) ^ 1;
        let mut merged = 0;

        {
            let mut heap = self.heap.lock();
            while let Some(PendingFree { offset, class }) = self.pending[inactive].pop() {
                heap.free[class].push(offset);
                merged += 1;
            }
        }

        self.pending_len.fetch_sub(merged, Ordering::Relaxed);
        self.active.store(inactive, Ordering::Release);
        merged
    }

    #[track_caller]
    fn locate(&self, ptr: NonNull<u8>, layout: Layout) -> (usize, usize) {
        assert!(self.contains(ptr), "pointer {ptr:p} does not belong to this chunk");

        let (class, block_size) = match size_class(layout, self.max_block_size) {
            Ok(class) => class,
            Err(e) => panic!("freeing {ptr:p} with a layout this chunk never serves: {e}"),
        };

        let offset = ptr.as_ptr() as usize - self.base.as_ptr() as usize;
        debug_assert!(offset.is_multiple_of(block_size), "misaligned block {ptr:p}");

        (offset, class)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // Safety: base was allocated with this exact layout.
        unsafe { sys::dealloc(self.base.as_ptr(), self.region) };
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("owner", &self.owner)
            .field("base", &self.base)
            .field("capacity", &self.capacity())
            .field("live", &self.live())
            .field("pending", &self.pending())
            .finish()
    }
}
