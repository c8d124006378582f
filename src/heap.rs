//! The allocator state and the operations on it. Everything here assumes
//! the caller already holds the allocator lock.

use std::ptr::{self, NonNull};

use tracing::{trace, warn};

use crate::{
    block::{BlockHeader, SCRIBBLE_BYTE},
    chain::Chain,
    config::Config,
    error::{AllocError, AllocResult},
    kernel::{PlatformMemory, acquire_region, release_region},
    utils::block_size,
};

pub(crate) struct Heap {
    pub chain: Chain,
}

impl Heap {
    pub const fn new() -> Self {
        Self { chain: Chain::new() }
    }

    /// Serves `size` bytes, reusing a block chosen by `config.algorithm` or
    /// mapping a new region when none fits.
    pub fn allocate<M: PlatformMemory>(
        &mut self,
        memory: &M,
        config: Config,
        size: usize,
        name: Option<&str>,
    ) -> AllocResult<NonNull<u8>> {
        let needed = block_size(size)?;

        let reusable = if self.chain.is_empty() {
            None
        } else {
            config
                .algorithm
                .and_then(|algorithm| algorithm.find(&self.chain, needed))
        };

        let block = match reusable {
            Some(block) => unsafe { self.chain.split(block, needed) },
            None => {
                let mapping = acquire_region(memory, needed)?;
                unsafe { self.chain.push_region(mapping, needed) }
            }
        };

        let payload = BlockHeader::payload(block);

        let header = unsafe { &mut *block.as_ptr() };
        if let Some(name) = name {
            header.set_name(name);
        }

        if config.scribble {
            unsafe { payload.write_bytes(SCRIBBLE_BYTE, header.capacity()) };
        }

        trace!(size, alloc_id = header.alloc_id, payload = ?payload, "allocated");

        Ok(payload)
    }

    /// Allocates room for `count` items of `size` bytes, all zeroed.
    pub fn zero_allocate<M: PlatformMemory>(
        &mut self,
        memory: &M,
        config: Config,
        count: usize,
        size: usize,
    ) -> AllocResult<NonNull<u8>> {
        let total = count
            .checked_mul(size)
            .ok_or(AllocError::SizeOverflow { size: usize::MAX })?;

        let payload = self.allocate(memory, config, total, None)?;
        unsafe { payload.write_bytes(0, total) };

        Ok(payload)
    }

    /// Resizes the allocation behind `payload` to `size` bytes.
    ///
    /// Returns `None` only when `size` is 0, in which case the allocation is
    /// released.
    ///
    /// **SAFETY**: `payload` must be `None` or a live allocation of this heap.
    pub unsafe fn resize<M: PlatformMemory>(
        &mut self,
        memory: &M,
        config: Config,
        payload: Option<NonNull<u8>>,
        size: usize,
    ) -> AllocResult<Option<NonNull<u8>>> {
        let Some(payload) = payload else {
            return self.allocate(memory, config, size, None).map(Some);
        };

        if size == 0 {
            unsafe { self.release(memory, payload)? };
            return Ok(None);
        }

        let needed = block_size(size)?;
        let header = unsafe { BlockHeader::from_payload(payload).as_mut() };

        if header.size >= needed {
            trace!(alloc_id = header.alloc_id, from = header.usage, to = needed, "resized in place");
            header.usage = needed;
            return Ok(Some(payload));
        }

        let keep = header.payload_usage().min(size);
        let moved = self.allocate(memory, config, size, None)?;

        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), moved.as_ptr(), keep);

            // The data already lives in `moved`, an unmap failure only leaks
            // the old region.
            if let Err(error) = self.release(memory, payload) {
                warn!(%error, "old block not reclaimed after resize");
            }
        }

        Ok(Some(moved))
    }

    /// Marks the allocation behind `payload` free, and unmaps its region once
    /// every block in it is free.
    ///
    /// When the unmap fails the region stays in the chain, fully free, and
    /// the error is returned.
    ///
    /// **SAFETY**: `payload` must be a live allocation of this heap.
    pub unsafe fn release<M: PlatformMemory>(&mut self, memory: &M, payload: NonNull<u8>) -> AllocResult<()> {
        unsafe {
            let header = BlockHeader::from_payload(payload).as_mut();
            trace!(alloc_id = header.alloc_id, "released");

            header.usage = 0;

            let Some(span) = self.chain.free_region(header.region_start) else {
                return Ok(());
            };

            release_region(memory, span.mapping)?;
            self.chain.unlink(span);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::HEADER_SIZE, config::Algorithm, kernel::OsMemory};

    const CONFIG: Config = Config::new(Algorithm::FirstFit);

    /// `(alloc_id, size, usage)` for every block of the chain.
    fn blocks(heap: &Heap) -> Vec<(u64, usize, usize)> {
        heap.chain
            .iter()
            .map(|block| unsafe {
                let header = block.as_ref();
                (header.alloc_id, header.size, header.usage)
            })
            .collect()
    }

    fn region_count(heap: &Heap) -> usize {
        heap.chain
            .iter()
            .filter(|&block| BlockHeader::is_region_start(block))
            .count()
    }

    fn page_size() -> usize {
        OsMemory.page_size()
    }

    fn release_all(heap: &mut Heap, payloads: &[NonNull<u8>]) {
        for &payload in payloads {
            unsafe { heap.release(&OsMemory, payload).unwrap() };
        }
        assert!(heap.chain.is_empty());
    }

    #[test]
    fn first_allocation_maps_one_region() {
        let mut heap = Heap::new();

        let payload = heap.allocate(&OsMemory, CONFIG, 24, None).unwrap();

        assert_eq!(0, payload.as_ptr() as usize % 8);
        assert_eq!(vec![(0, page_size(), block_size(24).unwrap())], blocks(&heap));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn freed_block_is_reused_under_first_fit() {
        let mut heap = Heap::new();

        let first = heap.allocate(&OsMemory, CONFIG, 100, None).unwrap();
        let second = heap.allocate(&OsMemory, CONFIG, 50, None).unwrap();
        unsafe { heap.release(&OsMemory, first).unwrap() };

        let third = heap.allocate(&OsMemory, CONFIG, 40, None).unwrap();

        assert_eq!(first, third);
        assert_eq!(1, region_count(&heap));

        let (first_size, second_size) = (block_size(100).unwrap(), block_size(50).unwrap());
        assert_eq!(
            vec![(0, first_size, block_size(40).unwrap()), (1, page_size() - first_size, second_size)],
            blocks(&heap)
        );

        release_all(&mut heap, &[second, third]);
    }

    #[test]
    fn unknown_algorithm_always_maps() {
        let mut heap = Heap::new();
        let config = Config { algorithm: None, scribble: false };

        let first = heap.allocate(&OsMemory, config, 8, None).unwrap();
        let second = heap.allocate(&OsMemory, config, 8, None).unwrap();

        assert_eq!(2, region_count(&heap));

        release_all(&mut heap, &[first, second]);
    }

    #[test]
    fn large_request_spans_several_pages() {
        let mut heap = Heap::new();

        let payload = heap.allocate(&OsMemory, CONFIG, 3 * page_size(), None).unwrap();

        assert_eq!(vec![(0, 4 * page_size(), block_size(3 * page_size()).unwrap())], blocks(&heap));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn scribble_fills_whole_capacity() {
        let mut heap = Heap::new();
        let config = CONFIG.scribble(true);

        let payload = heap.allocate(&OsMemory, config, 16, None).unwrap();
        let capacity = page_size() - HEADER_SIZE;
        let bytes = unsafe { std::slice::from_raw_parts(payload.as_ptr(), capacity) };

        assert!(bytes.iter().all(|&b| b == SCRIBBLE_BYTE));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn zero_allocate_clears_scribbled_payload() {
        let mut heap = Heap::new();

        let payload = heap.zero_allocate(&OsMemory, CONFIG.scribble(true), 4, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(payload.as_ptr(), 40) };

        assert!(bytes[..32].iter().all(|&b| b == 0));
        assert!(bytes[32..].iter().all(|&b| b == SCRIBBLE_BYTE));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn zero_allocate_rejects_overflow_and_zero() {
        let mut heap = Heap::new();

        assert!(matches!(
            heap.zero_allocate(&OsMemory, CONFIG, usize::MAX, 2),
            Err(AllocError::SizeOverflow { .. })
        ));
        assert!(matches!(
            heap.zero_allocate(&OsMemory, CONFIG, 0, 8),
            Err(AllocError::InvalidSize { .. })
        ));
        assert!(heap.chain.is_empty());
    }

    #[test]
    fn resize_in_place_updates_usage() {
        let mut heap = Heap::new();

        let payload = heap.allocate(&OsMemory, CONFIG, 16, None).unwrap();
        let resized = unsafe { heap.resize(&OsMemory, CONFIG, Some(payload), 1000).unwrap() };

        assert_eq!(Some(payload), resized);
        assert_eq!(vec![(0, page_size(), block_size(1000).unwrap())], blocks(&heap));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn resize_zero_releases() {
        let mut heap = Heap::new();

        let payload = heap.allocate(&OsMemory, CONFIG, 16, None).unwrap();
        let resized = unsafe { heap.resize(&OsMemory, CONFIG, Some(payload), 0).unwrap() };

        assert_eq!(None, resized);
        assert!(heap.chain.is_empty());
    }

    #[test]
    fn resize_null_allocates() {
        let mut heap = Heap::new();

        let payload = unsafe { heap.resize(&OsMemory, CONFIG, None, 32).unwrap().unwrap() };

        assert_eq!(1, region_count(&heap));

        release_all(&mut heap, &[payload]);
    }

    #[test]
    fn resize_beyond_capacity_moves_payload() {
        let mut heap = Heap::new();

        let payload = heap.allocate(&OsMemory, CONFIG, 64, None).unwrap();
        unsafe {
            for i in 0..64 {
                payload.add(i).write(i as u8);
            }
        }

        let moved = unsafe { heap.resize(&OsMemory, CONFIG, Some(payload), 2 * page_size()).unwrap().unwrap() };

        assert_ne!(payload, moved);
        let bytes = unsafe { std::slice::from_raw_parts(moved.as_ptr(), 64) };
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));

        // The old region was the only one holding the old block, so it is gone.
        assert_eq!(1, region_count(&heap));
        assert_eq!(2, heap.chain.allocations());

        release_all(&mut heap, &[moved]);
    }
}
