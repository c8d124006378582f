use std::{
    io,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use tracing::{debug, error};

use crate::{
    error::{AllocError, AllocResult},
    utils::align,
};

/// Virtual memory page size of the computer. This is usually 4096.
/// We don't know the value at compile time, so it is queried once and
/// cached here.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. As the allocator, our top level view of this has nothing
/// to do with the concrete implementations / APIs offered by each kernel.
///
/// Implementations must not allocate through the allocator they back.
pub trait PlatformMemory {
    /// Request an anonymous, private, read-write memory region of size `len`.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of [`PlatformMemory::page_size`].
    unsafe fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the memory of size `len` starting from `addr` back to the kernel.
    ///
    /// # Safety
    ///
    /// `addr` and `len` must describe exactly one mapping previously returned
    /// by [`PlatformMemory::request_memory`], and nothing may touch it after.
    unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Returns the virtual memory page size of the computer in bytes.
    fn page_size(&self) -> usize;
}

/// The operating system's virtual memory: `mmap` on unix, `VirtualAlloc`
/// on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsMemory;

impl OsMemory {
    /// Wrapper to calculate the computer's page size once.
    #[inline]
    fn cached_page_size() -> usize {
        match PAGE_SIZE.load(Ordering::Relaxed) {
            0 => {
                let size = unsafe { Self::query_page_size() };
                PAGE_SIZE.store(size, Ordering::Relaxed);
                size
            }
            size => size,
        }
    }
}

#[cfg(unix)]
mod unix {
    use super::{OsMemory, PlatformMemory};

    use libc::{mmap, munmap, off_t, size_t};

    use std::{
        io,
        os::raw::{c_int, c_void},
        ptr::NonNull,
    };

    impl OsMemory {
        pub(super) unsafe fn query_page_size() -> usize {
            unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) as usize }
        }
    }

    impl PlatformMemory for OsMemory {
        unsafe fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = std::ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FLAGS: c_int = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            unsafe {
                match mmap(ADDR, len as size_t, PROT, FLAGS, FD, OFFSET) {
                    libc::MAP_FAILED => Err(io::Error::last_os_error()),
                    addr => NonNull::new(addr.cast::<u8>())
                        .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory)),
                }
            }
        }

        unsafe fn return_memory(&self, addr: NonNull<u8>, len: usize) -> io::Result<()> {
            match unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }

        fn page_size(&self) -> usize {
            Self::cached_page_size()
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{io, mem::MaybeUninit, os::raw::c_void, ptr::NonNull};

    use super::{OsMemory, PlatformMemory};

    use windows::Win32::System::{Memory, SystemInformation};

    impl OsMemory {
        pub(super) unsafe fn query_page_size() -> usize {
            unsafe {
                let mut system_info = MaybeUninit::uninit();
                SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

                system_info.assume_init().dwPageSize as usize
            }
        }
    }

    impl PlatformMemory for OsMemory {
        unsafe fn request_memory(&self, len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)
            }
        }

        unsafe fn return_memory(&self, addr: NonNull<u8>, _len: usize) -> io::Result<()> {
            unsafe {
                Memory::VirtualFree(addr.as_ptr().cast::<c_void>(), 0, Memory::MEM_RELEASE)
                    .map_err(|_| io::Error::last_os_error())
            }
        }

        fn page_size(&self) -> usize {
            Self::cached_page_size()
        }
    }
}

/// A live mapping handed out by [`acquire_region`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub addr: NonNull<u8>,
    pub size: usize,
}

/// Maps a fresh region able to hold at least `byte_count` bytes. The size is
/// rounded up to a whole number of pages.
///
/// There is no retry here: a refusal from the platform goes straight back to
/// the caller as [`AllocError::MappingFailure`].
pub(crate) fn acquire_region<M: PlatformMemory>(
    memory: &M,
    byte_count: usize,
) -> AllocResult<Mapping> {
    let page_size = memory.page_size();

    if byte_count > usize::MAX - page_size {
        return Err(AllocError::SizeOverflow { size: byte_count });
    }

    let size = align(byte_count.max(1), page_size);

    match unsafe { memory.request_memory(size) } {
        Ok(addr) => {
            debug!(addr = ?addr, size, "mapped region");
            Ok(Mapping { addr, size })
        }
        Err(source) => {
            error!(size, %source, "mmap failed");
            Err(AllocError::MappingFailure { size, source })
        }
    }
}

/// Unmaps exactly the byte range described by `mapping`.
///
/// # Safety
///
/// `mapping` must come from [`acquire_region`] with the same `memory`, and no
/// block header or payload inside it may be used afterwards.
pub(crate) unsafe fn release_region<M: PlatformMemory>(
    memory: &M,
    mapping: Mapping,
) -> AllocResult<()> {
    match unsafe { memory.return_memory(mapping.addr, mapping.size) } {
        Ok(()) => {
            debug!(addr = ?mapping.addr, size = mapping.size, "unmapped region");
            Ok(())
        }
        Err(source) => {
            error!(addr = ?mapping.addr, size = mapping.size, %source, "munmap failed");
            Err(AllocError::UnmappingFailure {
                addr: mapping.addr.as_ptr() as usize,
                size: mapping.size,
                source,
            })
        }
    }
}
