//! A multi-strategy memory allocator built directly on top of the platform's
//! virtual memory.
//!
//! Memory is requested from the kernel in page sized regions. Each region is
//! carved into blocks, every block starting with a [`HEADER_SIZE`] byte header
//! followed by its payload. All blocks of all regions form a single chain in
//! allocation order:
//!
//! ```text
//! +-----------------------------------------+      +----------------------+
//! | +--------+----+    +--------+--------+  |      | +--------+-------+   |
//! | | Header | .. | -> | Header | ...    |  | ---> | | Header | ...   |   |
//! | +--------+----+    +--------+--------+  |      | +--------+-------+   |
//! +-----------------------------------------+      +----------------------+
//!   Region 1                                         Region 2
//! ```
//!
//! New requests reuse room in existing blocks according to the configured
//! [`Algorithm`]: first fit, best fit or worst fit. A block with spare room is
//! split in two. A region is given back to the kernel as soon as every one of
//! its blocks is free, and never before.
//!
//! The whole chain sits behind a single mutex.
//!
//! ```
//! use misfit::{Algorithm, Config, MisFit};
//!
//! let allocator = MisFit::with_config(Config::new(Algorithm::BestFit));
//!
//! let ptr = allocator.allocate(24);
//! assert!(!ptr.is_null());
//!
//! unsafe { allocator.release(ptr) };
//! assert!(allocator.snapshot().is_empty());
//! ```

mod block;
mod chain;
mod config;
mod error;
mod fit;
mod heap;
mod kernel;
mod report;
mod utils;

use std::{
    alloc::{GlobalAlloc, Layout},
    fmt::{self, Write},
    io,
    ptr::{self, NonNull},
};

use parking_lot::{Mutex, const_mutex};
use tracing::{trace, warn};

pub use block::HEADER_SIZE;
pub use config::{ALGORITHM_VAR, Algorithm, Config, ConfigSource, SCRIBBLE_VAR};
pub use error::{AllocError, AllocResult, UnknownAlgorithm};
pub use kernel::{OsMemory, PlatformMemory};
pub use report::{BlockInfo, RegionInfo};
pub use utils::ALIGNMENT;

use heap::Heap;

/// The allocator.
///
/// Every operation takes the lock exactly once and keeps it until it
/// returns, syscalls included.
///
/// [`MisFit::allocate`], [`MisFit::zero_allocate`], [`MisFit::resize`] and
/// [`MisFit::release`] follow the C memory API: failures come back as null
/// pointers. Each of them has a `try_` twin returning the [`AllocError`].
pub struct MisFit<M = OsMemory> {
    heap: Mutex<Heap>,
    memory: M,
    config: ConfigSource,
}

impl MisFit<OsMemory> {
    /// An allocator backed by the OS that reads its configuration from the
    /// environment on every allocation.
    pub const fn new() -> Self {
        Self::with_memory(OsMemory, ConfigSource::Environment)
    }

    /// An allocator backed by the OS that always uses `config`.
    pub const fn with_config(config: Config) -> Self {
        Self::with_memory(OsMemory, ConfigSource::Fixed(config))
    }
}

impl Default for MisFit<OsMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MisFit<M> {
    /// An allocator mapping its regions through `memory`, with its settings
    /// taken from `config`.
    pub const fn with_memory(memory: M, config: ConfigSource) -> Self {
        Self {
            heap: const_mutex(Heap::new()),
            memory,
            config,
        }
    }

    /// The platform regions are mapped through.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Where each allocation takes its [`Config`] from.
    pub fn config_source(&self) -> ConfigSource {
        self.config
    }
}

impl<M: PlatformMemory> MisFit<M> {
    /// Allocates at least `size` bytes aligned to [`ALIGNMENT`].
    ///
    /// An existing block is reused when the configured [`Algorithm`] finds
    /// one with enough room, otherwise a new region is mapped.
    ///
    /// # Errors
    ///
    /// [`AllocError::InvalidSize`] for a zero `size`,
    /// [`AllocError::SizeOverflow`] when the block size does not fit in a
    /// `usize` and [`AllocError::MappingFailure`] when the platform refuses
    /// a new region.
    pub fn try_allocate(&self, size: usize) -> AllocResult<NonNull<u8>> {
        let config = self.config.resolve();
        trace!(size, "malloc");

        self.heap.lock().allocate(&self.memory, config, size, None)
    }

    /// Like [`MisFit::try_allocate`], naming the block `name` instead of
    /// `Allocation <id>`. Names longer than 31 bytes are truncated.
    pub fn try_allocate_named(&self, size: usize, name: &str) -> AllocResult<NonNull<u8>> {
        let config = self.config.resolve();
        trace!(size, name, "malloc");

        self.heap.lock().allocate(&self.memory, config, size, Some(name))
    }

    /// Allocates `count * size` bytes and zeroes them, scribbling
    /// included.
    ///
    /// # Errors
    ///
    /// As [`MisFit::try_allocate`], with [`AllocError::SizeOverflow`] also
    /// covering `count * size`.
    pub fn try_zero_allocate(&self, count: usize, size: usize) -> AllocResult<NonNull<u8>> {
        let config = self.config.resolve();
        trace!(count, size, "calloc");

        self.heap.lock().zero_allocate(&self.memory, config, count, size)
    }

    /// Resizes `ptr` to `size` bytes, moving it only when its block is too
    /// small. A null `ptr` allocates, a zero `size` releases and returns
    /// `None`.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator.
    pub unsafe fn try_resize(&self, ptr: *mut u8, size: usize) -> AllocResult<Option<NonNull<u8>>> {
        let config = self.config.resolve();
        trace!(?ptr, size, "realloc");

        unsafe {
            self.heap
                .lock()
                .resize(&self.memory, config, NonNull::new(ptr), size)
        }
    }

    /// Releases `ptr`. Releasing null does nothing.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by this allocator, and
    /// must not be used afterwards.
    pub unsafe fn try_release(&self, ptr: *mut u8) -> AllocResult<()> {
        trace!(?ptr, "free");

        let Some(payload) = NonNull::new(ptr) else {
            return Ok(());
        };

        unsafe { self.heap.lock().release(&self.memory, payload) }
    }

    /// Returns a pointer to at least `size` bytes aligned to [`ALIGNMENT`],
    /// or null.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        into_raw(self.try_allocate(size))
    }

    /// Named twin of [`MisFit::allocate`].
    pub fn allocate_named(&self, size: usize, name: &str) -> *mut u8 {
        into_raw(self.try_allocate_named(size, name))
    }

    /// Returns a pointer to `count * size` zeroed bytes, or null.
    pub fn zero_allocate(&self, count: usize, size: usize) -> *mut u8 {
        into_raw(self.try_zero_allocate(count, size))
    }

    /// # Safety
    ///
    /// See [`MisFit::try_resize`].
    pub unsafe fn resize(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        match unsafe { self.try_resize(ptr, size) } {
            Ok(resized) => resized.map_or(ptr::null_mut(), NonNull::as_ptr),
            Err(error) => {
                warn!(%error, "realloc failed");
                ptr::null_mut()
            }
        }
    }

    /// # Safety
    ///
    /// See [`MisFit::try_release`].
    pub unsafe fn release(&self, ptr: *mut u8) {
        if let Err(error) = unsafe { self.try_release(ptr) } {
            warn!(%error, "free failed");
        }
    }

    /// Writes the current layout of every region and block into `out`.
    ///
    /// The lock is held while `out` is written to. When this allocator
    /// serves the whole process, an `out` that allocates deadlocks: use
    /// [`MisFit::print_memory`] or [`MisFit::write_memory`] with a writer
    /// that does not buffer.
    pub fn report(&self, out: &mut impl fmt::Write) -> fmt::Result {
        report::write_report(&self.heap.lock().chain, out)
    }

    /// Writes the report, preceded by a title line, into `out`. Nothing is
    /// buffered on the way, so a non-allocating `out` keeps this usable
    /// while the allocator serves the whole process.
    pub fn write_memory(&self, out: impl io::Write) -> io::Result<()> {
        let mut sink = report::IoSink::new(out);

        let heap = self.heap.lock();
        let written = writeln!(sink, "-- Current Memory State --")
            .and_then(|()| report::write_report(&heap.chain, &mut sink));
        drop(heap);

        sink.finish(written)
    }

    /// Prints the current layout to stdout.
    pub fn print_memory(&self) -> io::Result<()> {
        self.write_memory(report::stdout())
    }

    /// Copies the current layout out of the heap.
    ///
    /// The copy is built under the lock, so this must not be called from a
    /// process whose global allocator is this very allocator.
    pub fn snapshot(&self) -> Vec<RegionInfo> {
        report::snapshot(&self.heap.lock().chain)
    }

    /// Number of block headers stamped so far.
    pub fn allocations(&self) -> u64 {
        self.heap.lock().chain.allocations()
    }
}

fn into_raw(result: AllocResult<NonNull<u8>>) -> *mut u8 {
    match result {
        Ok(payload) => payload.as_ptr(),
        Err(error) => {
            warn!(%error, "allocation failed");
            ptr::null_mut()
        }
    }
}

/// Lets the allocator serve the whole process:
///
/// ```no_run
/// use misfit::MisFit;
///
/// #[global_allocator]
/// static ALLOCATOR: MisFit = MisFit::new();
/// # fn main() {}
/// ```
///
/// Payloads are [`ALIGNMENT`] aligned. Stricter layouts are served from a
/// block `layout.align()` bytes larger: the returned address is the first one
/// aligned to `layout.align()` that leaves a word before it, and that word
/// holds the block's payload pointer.
///
/// No `tracing` subscriber that allocates may be installed while the
/// allocator serves the process, since events are emitted with the lock held.
unsafe impl<M: PlatformMemory + Sync> GlobalAlloc for MisFit<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.allocate(layout.size());
        }

        match layout.size().checked_add(layout.align()) {
            Some(padded) => unsafe { over_align(self.allocate(padded), layout.align()) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return self.zero_allocate(1, layout.size());
        }

        match layout.size().checked_add(layout.align()) {
            Some(padded) => unsafe { over_align(self.zero_allocate(1, padded), layout.align()) },
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { self.release(payload_of(ptr, layout.align())) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            return unsafe { self.resize(ptr, new_size) };
        }

        // SAFETY: the caller guarantees `new_size` rounded up to the alignment
        // does not overflow.
        let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };

        unsafe {
            let moved = self.alloc(new_layout);
            if !moved.is_null() {
                ptr::copy_nonoverlapping(ptr, moved, layout.size().min(new_size));
                self.dealloc(ptr, layout);
            }
            moved
        }
    }
}

/// Moves `payload` forward to the first address aligned to `align` with room
/// for a pointer before it, and stores `payload` there.
///
/// # Safety
///
/// `payload` must be null or [`ALIGNMENT`] aligned with at least `align`
/// spare bytes past the requested size. `align` is a power of two greater
/// than [`ALIGNMENT`].
unsafe fn over_align(payload: *mut u8, align: usize) -> *mut u8 {
    if payload.is_null() {
        return payload;
    }

    let offset = utils::align(payload as usize + size_of::<usize>(), align) - payload as usize;

    unsafe {
        let aligned = payload.add(offset);
        aligned.cast::<*mut u8>().sub(1).write(payload);
        aligned
    }
}

/// Inverse of [`over_align`] for a pointer handed out under `align`.
///
/// # Safety
///
/// `ptr` must be null or come from this allocator under the same `align`.
unsafe fn payload_of(ptr: *mut u8, align: usize) -> *mut u8 {
    if ptr.is_null() || align <= ALIGNMENT {
        return ptr;
    }

    unsafe { ptr.cast::<*mut u8>().sub(1).read() }
}
