//! Buddy-style space allocator over a flat address space.
//!
//! The free list is a single sorted set of `(order, offset)` pairs (spec
//! §3): no two free blocks at the same order are ever buddies, every free
//! block is aligned to its own order, and the list starts out as one block
//! spanning the whole address space.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use tracing::{debug, trace};

use crate::descriptor::{encode_free, Block, MAX_ORDER};
use crate::error::{Error, Result};
use crate::serialize::{read_u64_list, write_u64_list};

/// Buddy allocator over blocks of order `0..=MAX_ORDER`.
#[derive(Debug, Clone)]
pub struct BuddyAllocator {
    /// Free blocks, sorted by `(order, offset)`.
    free: BTreeSet<(u8, u64)>,
}

impl Default for BuddyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl BuddyAllocator {
    /// A fresh allocator: the whole address space is one free block.
    pub fn new() -> Self {
        let mut free = BTreeSet::new();
        free.insert((MAX_ORDER, 0));
        BuddyAllocator { free }
    }

    /// Allocate a block able to hold `size` bytes (`size >= 1`). The
    /// returned block's `used` field is left at `0`; callers set it to the
    /// actual payload size.
    pub fn alloc(&mut self, size: u64) -> Result<Block> {
        assert!(size >= 1, "allocation size must be at least 1 byte");
        let order = order_for_size(size);
        self.alloc_order(order)
    }

    /// Allocate a block of exactly `order`, splitting a larger free block
    /// if necessary.
    pub fn alloc_order(&mut self, order: u8) -> Result<Block> {
        if order > MAX_ORDER {
            return Err(Error::out_of_space(order, MAX_ORDER));
        }

        // Smallest free block with order >= requested.
        let found = self
            .free
            .range((order, 0)..)
            .next()
            .copied()
            .ok_or(Error::out_of_space(order, MAX_ORDER))?;

        self.free.remove(&found);
        let (found_order, found_offset) = found;

        // Split down to the requested order, keeping the lower half and
        // freeing the upper halves at each intermediate order.
        for split_order in (order..found_order).rev() {
            let upper_offset = found_offset + (1u64 << split_order);
            self.free.insert((split_order, upper_offset));
            trace!(order = split_order, offset = upper_offset, "buddy split: upper half freed");
        }

        debug!(order, offset = found_offset, "buddy alloc");
        Ok(Block::free(order, found_offset))
    }

    /// Free a previously allocated block, coalescing with its buddy
    /// wherever possible.
    pub fn free(&mut self, block: Block) {
        let mut order = block.order;
        let mut offset = block.offset;

        while order < MAX_ORDER {
            let buddy_offset = offset ^ (1u64 << order);
            if self.free.remove(&(order, buddy_offset)) {
                offset = offset.min(buddy_offset);
                trace!(order, offset, buddy_offset, "buddy merge");
                order += 1;
            } else {
                break;
            }
        }

        debug!(order, offset, "buddy free");
        self.free.insert((order, offset));
    }

    /// Total bytes currently allocated (i.e. not in the free list).
    pub fn size(&self) -> u64 {
        let free_bytes: u64 = self.free.iter().map(|&(order, _)| 1u64 << order).sum();
        (1u64 << MAX_ORDER) - free_bytes
    }

    /// Serialize the free list as a length-prefixed list of packed
    /// `(order, offset)` descriptors (`used = 0`).
    pub fn to_stream<W: Write>(&self, out: &mut W) -> Result<()> {
        let descs: Vec<u64> = self
            .free
            .iter()
            .map(|&(order, offset)| encode_free(order, offset))
            .collect();
        write_u64_list(out, &descs)
    }

    /// Restore a free list previously written by [`Self::to_stream`].
    pub fn from_stream<R: Read>(input: &mut R) -> Result<Self> {
        let descs = read_u64_list(input)?;
        let mut free = BTreeSet::new();
        for desc in descs {
            let block = Block::from_desc(desc)?;
            free.insert((block.order, block.offset));
        }
        Ok(BuddyAllocator { free })
    }
}

/// `order = ceil(log2(size))`, i.e. the smallest order whose block can hold
/// `size` bytes.
fn order_for_size(size: u64) -> u8 {
    debug_assert!(size >= 1);
    (64 - (size - 1).leading_zeros()) as u8
}
