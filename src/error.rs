//! Error types of the allocator.
//!
//! Nothing in the allocator panics on failure. Every operation reports
//! through its return value and the caller decides whether to abort.

use std::io;

use thiserror::Error;

/// Result type for allocator operations.
pub type AllocResult<T> = Result<T, AllocError>;

/// Errors that can occur while serving an allocation request.
#[derive(Debug, Error)]
pub enum AllocError {
    /// Zero-sized request. The heap is left untouched.
    #[error("invalid allocation size: {size}")]
    InvalidSize { size: usize },

    /// The requested size plus the block header does not fit in `usize`.
    #[error("allocation size overflows: {size} bytes")]
    SizeOverflow { size: usize },

    /// The platform refused to map a new region.
    #[error("failed to map a region of {size} bytes: {source}")]
    MappingFailure {
        size: usize,
        #[source]
        source: io::Error,
    },

    /// The platform refused to unmap a region. The region stays in the
    /// chain with all of its blocks marked free.
    #[error("failed to unmap region at {addr:#x} ({size} bytes): {source}")]
    UnmappingFailure {
        addr: usize,
        size: usize,
        #[source]
        source: io::Error,
    },
}

/// Returned when parsing an allocation algorithm name fails.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown allocator algorithm: {0:?}")]
pub struct UnknownAlgorithm(pub String);
