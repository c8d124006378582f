//! This file contains the helper functions for the allocator. These are
//! functions that don't particularly belong to any concrete module.

use crate::{
    block::HEADER_SIZE,
    error::{AllocError, AllocResult},
};

/// Every block size, and therefore every payload address, is a multiple of this.
pub const ALIGNMENT: usize = 8;

/// It aligns `to_be_aligned` using `aligment`, which must be a power of two.
///
/// This is used to align region sizes to be a multiple of the page size
/// and block sizes to be a multiple of [`ALIGNMENT`].
pub fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Total block size needed to serve a `size` byte request: the payload plus
/// its header, aligned.
pub(crate) fn block_size(size: usize) -> AllocResult<usize> {
    if size == 0 {
        return Err(AllocError::InvalidSize { size });
    }

    match size.checked_add(HEADER_SIZE + ALIGNMENT - 1) {
        Some(_) => Ok(align(size + HEADER_SIZE, ALIGNMENT)),
        None => Err(AllocError::SizeOverflow { size }),
    }
}
