use std::{
    fmt::{self, Write},
    mem,
    ptr::NonNull,
    str,
};

/// Header size of a block. Every payload handed to the user starts exactly
/// this many bytes after its header.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// Bytes reserved for the block name, including the trailing NUL.
pub(crate) const NAME_LEN: usize = 32;

/// Byte pattern written over fresh payloads when scribbling is enabled.
pub(crate) const SCRIBBLE_BYTE: u8 = 0xAA;

const _: () = assert!(HEADER_SIZE % 8 == 0);

/// This is the structure of a block. The fields of the block are its
/// metadata, the payload is placed right after this header inside the same
/// mapping.
///
/// ```text
/// +---------------------+ <------+
/// |      alloc_id       |        |
/// +---------------------+        |
/// |        name         |        |
/// +---------------------+        |
/// |    size | usage     |        | -> Header (HEADER_SIZE bytes)
/// +---------------------+        |
/// |    region_start     |        |
/// +---------------------+        |
/// | region_size | next  |        |
/// +---------------------+ <------+
/// |       Payload       |        |
/// |         ...         |        | -> size - HEADER_SIZE bytes
/// |                     |        |
/// +---------------------+ <------+
/// ```
///
/// `size` and `usage` both count the header. A block is free when its
/// `usage` is 0. The header keeps the 100 bytes of metadata and padding of
/// the classic layout, rounded up to 8 so payloads stay word aligned.
#[repr(C, align(8))]
pub(crate) struct BlockHeader {
    /// Unique identifier, assigned once when the header is stamped.
    pub alloc_id: u64,
    /// NUL terminated UTF-8 name.
    name: [u8; NAME_LEN],
    /// Total size of the block, header included.
    pub size: usize,
    /// Bytes in use, header included. 0 means free.
    pub usage: usize,
    /// First block of the owning region.
    pub region_start: NonNull<BlockHeader>,
    /// Size of the mapping. Only meaningful on the first block of a region.
    pub region_size: usize,
    /// Next block in the chain.
    pub next: Option<NonNull<BlockHeader>>,
    _padding: [u8; 20],
}

impl BlockHeader {
    /// Stamps a fresh header at `addr` and returns it.
    ///
    /// **SAFETY**: `addr` must be 8-aligned and point to at least `size`
    /// writable bytes owned by the allocator.
    pub unsafe fn initialize(
        addr: NonNull<u8>,
        alloc_id: u64,
        usage: usize,
        size: usize,
        region_start: NonNull<BlockHeader>,
    ) -> NonNull<BlockHeader> {
        let block = addr.cast::<BlockHeader>();

        let mut header = BlockHeader {
            alloc_id,
            name: [0; NAME_LEN],
            size,
            usage,
            region_start,
            region_size: 0,
            next: None,
            _padding: [0; 20],
        };
        // Cannot fail, the buffer truncates.
        let _ = write!(NameWriter::new(&mut header.name), "Allocation {alloc_id}");

        unsafe { block.as_ptr().write(header) };

        block
    }

    /// Recovers the header from a payload pointer given to the user.
    ///
    /// **SAFETY**: `payload` must have been returned by [`BlockHeader::payload`].
    #[inline]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> NonNull<BlockHeader> {
        unsafe { payload.sub(HEADER_SIZE).cast() }
    }

    /// Address right after the header of `block`.
    #[inline]
    pub fn payload(block: NonNull<BlockHeader>) -> NonNull<u8> {
        // SAFETY: every block is at least HEADER_SIZE bytes.
        unsafe { block.cast::<u8>().add(HEADER_SIZE) }
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.usage == 0
    }

    /// Capacity that can still be carved out of this block.
    #[inline]
    pub fn remainder(&self) -> usize {
        self.size - self.usage
    }

    /// Usable bytes behind the header.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - HEADER_SIZE
    }

    /// Bytes of payload in use, 0 when free.
    #[inline]
    pub fn payload_usage(&self) -> usize {
        self.usage.saturating_sub(HEADER_SIZE)
    }

    #[inline]
    pub fn is_region_start(this: NonNull<BlockHeader>) -> bool {
        unsafe { this.as_ref().region_start == this }
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);

        // Names are only ever written through `NameWriter`, which keeps them valid.
        str::from_utf8(&self.name[..len]).unwrap_or_default()
    }

    /// Replaces the name, truncated to fit on a char boundary.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; NAME_LEN];
        let _ = NameWriter::new(&mut self.name).write_str(name);
    }
}

/// Writes into a fixed name buffer without allocating, always leaving room
/// for the trailing NUL.
struct NameWriter<'a> {
    buf: &'a mut [u8; NAME_LEN],
    len: usize,
}

impl<'a> NameWriter<'a> {
    fn new(buf: &'a mut [u8; NAME_LEN]) -> Self {
        Self { buf, len: 0 }
    }
}

impl Write for NameWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = NAME_LEN - 1 - self.len;

        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }

        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;

        if take < s.len() { Err(fmt::Error) } else { Ok(()) }
    }
}
