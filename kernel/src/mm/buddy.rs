//! Buddy allocator for the kernel page pool.
//!
//! Manages a contiguous range of page frames described by an array of
//! per-frame block records. Eleven freelists, one per order; allocation
//! splits the smallest fitting block downward, free eagerly coalesces
//! with the buddy at each order. Blocks are addressed by frame index; the
//! freelists are index-linked, so no pointers live inside free memory.
//!
//! `wait` defers a free onto a per-CPU waitlist that `free_wait` drains
//! once the pages can no longer be reached by a concurrent page-table
//! walk.

use core::ptr::NonNull;

use spin::Mutex;

use super::{Fill, PAGE_BITS, PAGE_SIZE};
use crate::cpu::{CpuId, MAX_CPUS};

/// Number of block orders (0..=10): the largest block is 4 MiB.
pub const ORDERS: usize = 11;

const NIL: u32 = u32::MAX;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Tag {
    Used,
    Free,
}

/// Per-frame metadata record.
struct Block {
    ord: u8,
    tag: Tag,
    prev: u32,
    next: u32,
}

struct Inner {
    /// Kernel virtual address of frame 0.
    base: usize,
    /// Number of frames in the pool.
    frames: usize,
    /// One record per frame.
    blocks: alloc::vec::Vec<Block>,
    /// Freelist head per order, index-linked through `Block::{prev,next}`.
    free: [u32; ORDERS],
}

impl Inner {
    fn index_of(&self, ptr: usize) -> usize {
        debug_assert!(ptr >= self.base && ptr < self.base + (self.frames << PAGE_BITS));
        debug_assert_eq!(ptr & (PAGE_SIZE - 1), 0);
        (ptr - self.base) >> PAGE_BITS
    }

    fn page_of(&self, idx: usize) -> usize {
        self.base + (idx << PAGE_BITS)
    }

    fn valid(&self, idx: usize) -> bool {
        idx < self.frames
    }

    fn dequeue(&mut self, idx: u32) {
        let (prev, next, ord) = {
            let b = &self.blocks[idx as usize];
            (b.prev, b.next, b.ord as usize)
        };
        if prev != NIL {
            self.blocks[prev as usize].next = next;
        } else {
            self.free[ord] = next;
        }
        if next != NIL {
            self.blocks[next as usize].prev = prev;
        }
        self.blocks[idx as usize].prev = NIL;
        self.blocks[idx as usize].next = NIL;
    }

    fn dequeue_head(&mut self, ord: usize) -> Option<u32> {
        let head = self.free[ord];
        if head == NIL {
            return None;
        }
        self.dequeue(head);
        Some(head)
    }

    fn enqueue(&mut self, idx: u32) {
        let ord = self.blocks[idx as usize].ord as usize;
        let head = self.free[ord];
        self.blocks[idx as usize].prev = NIL;
        self.blocks[idx as usize].next = head;
        if head != NIL {
            self.blocks[head as usize].prev = idx;
        }
        self.free[ord] = idx;
    }

    /// Mark a used block free and coalesce upward as far as possible.
    fn coalesce(&mut self, mut idx: usize) {
        debug_assert!(self.blocks[idx].tag == Tag::Used);
        self.blocks[idx].tag = Tag::Free;

        let mut ord = self.blocks[idx].ord as usize;
        while ord < ORDERS - 1 {
            let buddy = idx ^ (1 << ord);
            if !self.valid(buddy)
                || self.blocks[buddy].tag != Tag::Free
                || self.blocks[buddy].ord as usize != ord
            {
                break;
            }
            self.dequeue(buddy as u32);
            idx = idx.min(buddy);
            ord += 1;
            self.blocks[idx].ord = ord as u8;
        }

        self.enqueue(idx as u32);
    }
}

static POOL: Mutex<Option<Inner>> = Mutex::new(None);

static WAITLIST: [Mutex<alloc::vec::Vec<usize>>; MAX_CPUS] =
    [const { Mutex::new(alloc::vec::Vec::new()) }; MAX_CPUS];

/// Initialize the allocator over a page-aligned pool.
///
/// All frames start out free. `phys` is the physical address of `base`,
/// used for the pool-wide pointer/physical conversion.
pub fn init(base: NonNull<u8>, phys: u64, size: usize) {
    let base = base.as_ptr() as usize;
    assert_eq!(base & (PAGE_SIZE - 1), 0);
    let frames = size >> PAGE_BITS;
    assert!(frames > 0);

    super::set_pool_base(base, phys);

    // Deferred frees from a previous pool must not leak into this one.
    for list in &WAITLIST {
        list.lock().clear();
    }

    let mut blocks = alloc::vec::Vec::with_capacity(frames);
    for _ in 0..frames {
        blocks.push(Block {
            ord: 0,
            tag: Tag::Used,
            prev: NIL,
            next: NIL,
        });
    }

    let mut inner = Inner {
        base,
        frames,
        blocks,
        free: [NIL; ORDERS],
    };
    for idx in 0..frames {
        inner.coalesce(idx);
    }

    *POOL.lock() = Some(inner);
}

/// Allocate `2^ord` contiguous pages, optionally pre-filled.
pub fn alloc(ord: usize, fill: Fill) -> Option<NonNull<u8>> {
    debug_assert!(ord < ORDERS);

    let ptr = {
        let mut guard = POOL.lock();
        let inner = guard.as_mut()?;

        let mut o = ord;
        let idx = loop {
            if o >= ORDERS {
                return None;
            }
            if let Some(idx) = inner.dequeue_head(o) {
                break idx as usize;
            }
            o += 1;
        };

        // Split back down, returning the lower half each round.
        while o > ord {
            o -= 1;
            let upper = idx + (1 << o);
            inner.blocks[upper].ord = o as u8;
            inner.blocks[upper].tag = Tag::Free;
            inner.enqueue(upper as u32);
        }

        inner.blocks[idx].ord = ord as u8;
        inner.blocks[idx].tag = Tag::Used;
        inner.page_of(idx)
    };

    let bytes = PAGE_SIZE << ord;
    match fill {
        Fill::None => (),
        // SAFETY: the block was just carved out of the pool and is unaliased.
        Fill::Bits0 => unsafe { core::ptr::write_bytes(ptr as *mut u8, 0x00, bytes) },
        // SAFETY: as above.
        Fill::Bits1 => unsafe { core::ptr::write_bytes(ptr as *mut u8, 0xFF, bytes) },
    }

    NonNull::new(ptr as *mut u8)
}

/// Return a block to the pool immediately and coalesce.
pub fn free(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let mut guard = POOL.lock();
    let inner = guard.as_mut().expect("buddy not initialized");
    let idx = inner.index_of(ptr as usize);
    inner.coalesce(idx);
}

/// Queue a block for deferred freeing on the current CPU.
pub fn wait(cpu: CpuId, ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    WAITLIST[cpu as usize].lock().push(ptr as usize);
}

/// Drain the current CPU's deferred-free waitlist.
///
/// Callers must ensure no page-table walk can still reach the queued
/// blocks (TLB/IOTLB synchronization has completed).
pub fn free_wait(cpu: CpuId) {
    let drained: alloc::vec::Vec<usize> = {
        let mut list = WAITLIST[cpu as usize].lock();
        core::mem::take(&mut *list)
    };
    for ptr in drained {
        free(ptr as *mut u8);
    }
}

/// Number of free frames, summed over all orders.
pub fn free_frames() -> usize {
    let guard = POOL.lock();
    let inner = match guard.as_ref() {
        Some(i) => i,
        None => return 0,
    };
    let mut total = 0;
    for ord in 0..ORDERS {
        let mut idx = inner.free[ord];
        while idx != NIL {
            total += 1 << ord;
            idx = inner.blocks[idx as usize].next;
        }
    }
    total
}
