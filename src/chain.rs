use std::{marker::PhantomData, ptr::NonNull};

use tracing::trace;

use crate::{block::BlockHeader, kernel::Mapping};

/// Non-null pointer to a block header.
pub(crate) type Link = Option<NonNull<BlockHeader>>;

/// Singly linked chain of every block of every live region, in allocation
/// order.
///
/// The chain never allocates. Its nodes are the [`BlockHeader`]s themselves,
/// written at the start of each block inside the mapped regions:
///
/// ```text
///   Region A (mapped)                      Region B (mapped)
/// +--------------------------------+     +---------------------+
/// | +-------+    +-------+         |     | +-------+           |
/// | | Block | -> | Block | --------|-----|>| Block | -> None   |
/// | +-------+    +-------+         |     | +-------+           |
/// +--------------------------------+     +---------------------+
///   ^ head
/// ```
///
/// Blocks of one region are always consecutive in the chain and in memory,
/// each one pointing back to the first block of its region.
pub(crate) struct Chain {
    head: Link,
    /// Allocation identifier counter. Never reused.
    allocations: u64,
}

// SAFETY: the headers are only reachable through the chain, and the chain is
// only ever reached through the allocator's mutex.
unsafe impl Send for Chain {}

/// The blocks of a fully free region, ready to be detached from the chain.
#[derive(Debug)]
pub(crate) struct RegionSpan {
    pub mapping: Mapping,
    /// Last block before the region, `None` if the region is at the head.
    prev: Link,
    /// First block after the region.
    after: Link,
}

pub(crate) struct Iter<'a> {
    current: Link,
    marker: PhantomData<&'a Chain>,
}

impl Chain {
    pub const fn new() -> Self {
        Self {
            head: None,
            allocations: 0,
        }
    }

    #[inline]
    pub fn head(&self) -> Link {
        self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of headers stamped so far, which is also the next identifier.
    #[inline]
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter {
            current: self.head,
            marker: PhantomData,
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.allocations;
        self.allocations += 1;
        id
    }

    /// Turns a brand new `mapping` into a single block spanning all of it,
    /// with `usage` bytes in use, and appends it at the tail.
    ///
    /// **SAFETY**: `mapping` must be a live, page aligned mapping that is not
    /// yet part of the chain, and `usage` must not exceed its size.
    pub unsafe fn push_region(&mut self, mapping: Mapping, usage: usize) -> NonNull<BlockHeader> {
        let id = self.next_id();

        unsafe {
            let mut block =
                BlockHeader::initialize(mapping.addr, id, usage, mapping.size, mapping.addr.cast());
            block.as_mut().region_size = mapping.size;

            let tail = self.iter().last();
            match tail {
                Some(mut tail) => tail.as_mut().next = Some(block),
                None => self.head = Some(block),
            }

            block
        }
    }

    /// Serves `needed` bytes out of `block`.
    ///
    /// A block with no usage at all is handed out whole. Otherwise the block
    /// shrinks to its usage and a new block is carved right after it from
    /// the remainder, taking its place in the chain just behind it.
    ///
    /// **SAFETY**: `block` must be part of this chain and its remainder must
    /// be at least `needed`.
    pub unsafe fn split(&mut self, block: NonNull<BlockHeader>, needed: usize) -> NonNull<BlockHeader> {
        let header = unsafe { &mut *block.as_ptr() };
        debug_assert!(header.remainder() >= needed);

        if header.usage == 0 {
            header.usage = needed;
            trace!(alloc_id = header.alloc_id, needed, "reusing free block whole");
            return block;
        }

        let remainder = header.remainder();
        header.size = header.usage;

        let id = self.next_id();

        unsafe {
            let addr = block.cast::<u8>().add(header.size);
            let mut carved = BlockHeader::initialize(addr, id, needed, remainder, header.region_start);

            carved.as_mut().next = header.next;
            header.next = Some(carved);

            trace!(from = header.alloc_id, alloc_id = id, size = remainder, needed, "split block");

            carved
        }
    }

    /// Returns the span of the region starting at `start` if every one of
    /// its blocks is free, `None` while any block is still in use.
    ///
    /// **SAFETY**: `start` must be the first block of a region in this chain.
    pub unsafe fn free_region(&self, start: NonNull<BlockHeader>) -> Option<RegionSpan> {
        let mut current = Some(start);

        unsafe {
            while let Some(block) = current {
                let header = block.as_ref();
                if header.region_start != start {
                    break;
                }
                if !header.is_free() {
                    return None;
                }
                current = header.next;
            }

            let prev = self.iter().find(|block| block.as_ref().next == Some(start));

            Some(RegionSpan {
                mapping: Mapping {
                    addr: start.cast(),
                    size: start.as_ref().region_size,
                },
                prev,
                after: current,
            })
        }
    }

    /// Detaches every block of `span` from the chain.
    ///
    /// **SAFETY**: `span` must come from [`Chain::free_region`] with no
    /// mutation of the chain in between. The region itself may already be
    /// unmapped, its headers are not read.
    pub unsafe fn unlink(&mut self, span: RegionSpan) {
        match span.prev {
            Some(mut prev) => unsafe { prev.as_mut().next = span.after },
            None => {
                debug_assert_eq!(self.head(), Some(span.mapping.addr.cast()));
                self.head = span.after;
            }
        }
    }
}

impl Iterator for Iter<'_> {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.current?;

        // SAFETY: every link in the chain points to a live header.
        self.current = unsafe { block.as_ref().next };

        Some(block)
    }
}

impl<'a> IntoIterator for &'a Chain {
    type Item = NonNull<BlockHeader>;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
