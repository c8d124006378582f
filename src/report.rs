//! Human readable dumps of the memory layout.
//!
//! The report lists every region followed by its blocks, in chain order:
//!
//! ```text
//! [REGION] 0x7f3a2c000000-0x7f3a2c001000 4096
//! [BLOCK]  0x7f3a2c000000-0x7f3a2c0000d0 (0) 'Allocation 0' 208 208 104
//! [BLOCK]  0x7f3a2c0000d0-0x7f3a2c001000 (1) 'Allocation 1' 3888 160 56
//! ```
//!
//! Block columns are the address range, allocation id, name, total size,
//! usage and payload bytes in use. Sizes and usage include the header.

use std::{
    fmt::{self, Write},
    io,
    ptr::NonNull,
};

#[cfg(unix)]
use std::{fs::File, mem::ManuallyDrop, os::fd::FromRawFd};

use crate::{block::BlockHeader, chain::Chain};

/// One mapped region and the blocks carved out of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionInfo {
    pub start: usize,
    pub size: usize,
    pub blocks: Vec<BlockInfo>,
}

/// Copy of a block header taken at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub start: usize,
    pub alloc_id: u64,
    pub name: String,
    pub size: usize,
    pub usage: usize,
    /// Bytes of payload in use, 0 when free.
    pub payload: usize,
}

impl RegionInfo {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    /// Sum of the sizes of every block, which always equals the mapping size.
    pub fn block_bytes(&self) -> usize {
        self.blocks.iter().map(|block| block.size).sum()
    }
}

impl BlockInfo {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn is_free(&self) -> bool {
        self.usage == 0
    }
}

fn write_region(out: &mut impl Write, start: usize, size: usize) -> fmt::Result {
    writeln!(out, "[REGION] {:#x}-{:#x} {}", start, start + size, size)
}

fn write_block(out: &mut impl Write, block: &BlockHeader, start: usize) -> fmt::Result {
    writeln!(
        out,
        "[BLOCK]  {:#x}-{:#x} ({}) '{}' {} {} {}",
        start,
        start + block.size,
        block.alloc_id,
        block.name(),
        block.size,
        block.usage,
        block.payload_usage(),
    )
}

/// Writes the report for `chain` into `out`, walking it exactly once.
pub(crate) fn write_report(chain: &Chain, out: &mut impl Write) -> fmt::Result {
    let mut region: Option<NonNull<BlockHeader>> = None;

    for block in chain {
        let header = unsafe { block.as_ref() };

        if region != Some(header.region_start) {
            region = Some(header.region_start);
            let origin = unsafe { header.region_start.as_ref() };
            write_region(out, header.region_start.as_ptr() as usize, origin.region_size)?;
        }

        write_block(out, header, block.as_ptr() as usize)?;
    }

    Ok(())
}

/// Copies the layout of `chain` out of the mapped memory.
pub(crate) fn snapshot(chain: &Chain) -> Vec<RegionInfo> {
    let mut regions: Vec<RegionInfo> = Vec::new();

    for block in chain {
        let header = unsafe { block.as_ref() };

        if BlockHeader::is_region_start(block) {
            regions.push(RegionInfo {
                start: block.as_ptr() as usize,
                size: header.region_size,
                blocks: Vec::new(),
            });
        }

        if let Some(region) = regions.last_mut() {
            region.blocks.push(BlockInfo {
                start: block.as_ptr() as usize,
                alloc_id: header.alloc_id,
                name: header.name().to_owned(),
                size: header.size,
                usage: header.usage,
                payload: header.payload_usage(),
            });
        }
    }

    regions
}

/// Adapts an [`io::Write`] so the report can be formatted straight into it,
/// keeping the first I/O error around.
pub(crate) struct IoSink<W> {
    inner: W,
    error: Option<io::Error>,
}

impl<W: io::Write> IoSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, error: None }
    }

    /// Turns the outcome of the formatting into the underlying I/O result.
    pub fn finish(mut self, written: fmt::Result) -> io::Result<()> {
        match (written, self.error.take()) {
            (Ok(()), _) => self.inner.flush(),
            (Err(_), Some(error)) => Err(error),
            (Err(error), None) => Err(io::Error::other(error)),
        }
    }
}

impl<W: io::Write> Write for IoSink<W> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.inner.write_all(s.as_bytes()).map_err(|error| {
            self.error = Some(error);
            fmt::Error
        })
    }
}

/// Standard output, written to the descriptor directly. `io::stdout()`
/// allocates its buffer on first use, which would re-enter the allocator
/// while it holds its lock.
#[cfg(unix)]
pub(crate) struct RawStdout(ManuallyDrop<File>);

#[cfg(unix)]
impl io::Write for RawStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(&mut &*self.0, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
pub(crate) fn stdout() -> RawStdout {
    // SAFETY: descriptor 1 lives for the whole process and is never closed here.
    RawStdout(ManuallyDrop::new(unsafe { File::from_raw_fd(libc::STDOUT_FILENO) }))
}

/// Standard output handle, written with `WriteFile`.
#[cfg(windows)]
pub(crate) struct RawStdout;

#[cfg(windows)]
impl io::Write for RawStdout {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        use windows::Win32::{
            Storage::FileSystem::WriteFile,
            System::Console::{GetStdHandle, STD_OUTPUT_HANDLE},
        };

        let chunk = &buf[..buf.len().min(u32::MAX as usize)];
        let mut written = 0u32;

        // SAFETY: the handle is owned by the process and `written` outlives
        // the synchronous write.
        unsafe {
            let handle = GetStdHandle(STD_OUTPUT_HANDLE).map_err(|_| io::Error::last_os_error())?;
            WriteFile(handle, Some(chunk), Some(&raw mut written), None)
                .map_err(|_| io::Error::last_os_error())?;
        }

        Ok(written as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(windows)]
pub(crate) fn stdout() -> RawStdout {
    RawStdout
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[BLOCK]  {:#x}-{:#x} ({}) '{}' {} {} {}",
            self.start,
            self.end(),
            self.alloc_id,
            self.name,
            self.size,
            self.usage,
            self.payload,
        )
    }
}

impl fmt::Display for RegionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_region(f, self.start, self.size)?;
        for block in &self.blocks {
            writeln!(f, "{block}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::HEADER_SIZE,
        kernel::{OsMemory, PlatformMemory, acquire_region, release_region},
    };

    #[test]
    fn empty_chain_reports_nothing() {
        let chain = Chain::new();
        let mut out = String::new();

        write_report(&chain, &mut out).unwrap();

        assert!(out.is_empty());
        assert!(snapshot(&chain).is_empty());
    }

    #[test]
    fn report_matches_snapshot() {
        let page_size = OsMemory.page_size();
        let mut chain = Chain::new();
        let (first, second) = (
            acquire_region(&OsMemory, 1).unwrap(),
            acquire_region(&OsMemory, 1).unwrap(),
        );

        unsafe {
            let block = chain.push_region(first, 208);
            let mut carved = chain.split(block, 160);
            carved.as_mut().usage = 0;
            chain.push_region(second, HEADER_SIZE + 8).as_mut().set_name("config");
        }

        let mut out = String::new();
        write_report(&chain, &mut out).unwrap();

        let regions = snapshot(&chain);
        let rendered: String = regions.iter().map(ToString::to_string).collect();
        assert_eq!(out, rendered);

        let lines: Vec<_> = out.lines().collect();
        assert_eq!(5, lines.len());
        let start = first.addr.as_ptr() as usize;
        assert_eq!(format!("[REGION] {:#x}-{:#x} {}", start, start + page_size, page_size), lines[0]);
        assert!(lines[1].ends_with(&format!("(0) 'Allocation 0' 208 208 {}", 208 - HEADER_SIZE)));
        assert!(lines[2].ends_with(&format!("(1) 'Allocation 1' {} 0 0", page_size - 208)));
        assert!(lines[3].starts_with("[REGION] "));
        assert!(lines[4].ends_with(&format!("(2) 'config' {} {} 8", page_size, HEADER_SIZE + 8)));

        assert_eq!(2, regions.len());
        assert!(regions.iter().all(|region| region.block_bytes() == region.size));
        assert!(regions[0].blocks[1].is_free());

        unsafe {
            release_region(&OsMemory, first).unwrap();
            release_region(&OsMemory, second).unwrap();
        }
    }
}
