//! The backing region: one fixed byte range, carved once into a bitmap area
//! followed by the payload area.
//!
//! Everything the ledger knows is stored inside the region itself, so all
//! accesses go through raw pointers: callers hold pointers into payloads
//! while we read and write the headers around them, and we never form a
//! reference that covers a live payload except on the caller's request.

use super::block::Header;
use crate::config::{ArenaConfig, Carving, ConfigError, HEADER_SIZE};
use alloc::alloc::{alloc_zeroed, dealloc};
use core::{alloc::Layout, ptr::NonNull, slice};

/// Where the region's bytes came from.
enum Backing {
    /// Allocated from the global allocator at creation, with this layout.
    Owned(Layout),
    /// Lent to us for the rest of the program.
    Static,
}

pub(crate) struct Region {
    /// Aligned start of the region.
    base: NonNull<u8>,
    carving: Carving,
    backing: Backing,
}

// Safety: the region exclusively owns (or was exclusively lent) its bytes.
unsafe impl Send for Region {}

impl Region {
    /// Allocate a fresh, zeroed region of `config.capacity` bytes.
    pub(crate) fn allocate(config: &ArenaConfig) -> Result<Self, ConfigError> {
        let carving = config.carve(config.capacity)?;
        let layout = Layout::from_size_align(config.capacity, config.alignment)
            .map_err(|_| ConfigError::CapacityOverflow)?;

        // Safety: `carve` succeeded, so the layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(base).ok_or(ConfigError::RegionUnavailable {
            capacity: config.capacity,
        })?;

        Ok(Region {
            base,
            carving,
            backing: Backing::Owned(layout),
        })
    }

    /// Carve a caller-provided static buffer. The start of the buffer is
    /// skipped as needed to reach `config.alignment`.
    pub(crate) fn from_static(
        bytes: &'static mut [u8],
        config: &ArenaConfig,
    ) -> Result<Self, ConfigError> {
        if !config.alignment.is_power_of_two() {
            return Err(ConfigError::BadAlignment {
                alignment: config.alignment,
            });
        }

        let skip = bytes.as_ptr().align_offset(config.alignment);
        let capacity = bytes.len().saturating_sub(skip);
        let carving = config.carve(capacity)?;

        let bytes = &mut bytes[skip..];
        bytes[..carving.bitmap_len].fill(0);

        Ok(Region {
            base: NonNull::from(bytes).cast(),
            carving,
            backing: Backing::Static,
        })
    }

    #[inline]
    pub(crate) fn carving(&self) -> &Carving {
        &self.carving
    }

    #[inline]
    pub(crate) fn payload_len(&self) -> usize {
        self.carving.payload_len
    }

    /// Start of the payload area.
    #[inline]
    fn payload_base(&self) -> *mut u8 {
        // Safety: the bitmap area is inside the region.
        unsafe { self.base.as_ptr().add(self.carving.bitmap_len) }
    }

    pub(crate) fn bitmap(&self) -> &[u8] {
        // Safety: the bitmap area is never handed out to callers.
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.carving.bitmap_len) }
    }

    pub(crate) fn bitmap_mut(&mut self) -> &mut [u8] {
        // Safety: as above, and `&mut self` makes this the only view.
        unsafe { slice::from_raw_parts_mut(self.base.as_ptr(), self.carving.bitmap_len) }
    }

    /// Read the header of the block at `off`.
    pub(crate) fn header(&self, off: usize) -> Header {
        assert!(off + HEADER_SIZE <= self.payload_len());
        let mut bytes = [0; HEADER_SIZE];
        // Safety: bounds checked above; headers are never handed out.
        unsafe {
            self.payload_base()
                .add(off)
                .copy_to_nonoverlapping(bytes.as_mut_ptr(), HEADER_SIZE);
        }
        Header::decode(&bytes)
    }

    /// Write the header of the block at `off`.
    pub(crate) fn set_header(&mut self, off: usize, header: &Header) {
        assert!(off + HEADER_SIZE <= self.payload_len());
        let bytes = header.encode();
        // Safety: bounds checked above.
        unsafe {
            self.payload_base()
                .add(off)
                .copy_from_nonoverlapping(bytes.as_ptr(), HEADER_SIZE);
        }
    }

    /// Read the `usize` stored at the start of the payload of block `off`.
    pub(crate) fn payload_word(&self, off: usize) -> usize {
        let at = off + HEADER_SIZE;
        assert!(at + 8 <= self.payload_len());
        let mut w = [0; 8];
        // Safety: bounds checked above.
        unsafe {
            self.payload_base()
                .add(at)
                .copy_to_nonoverlapping(w.as_mut_ptr(), 8);
        }
        usize::try_from(u64::from_le_bytes(w)).unwrap_or(usize::MAX)
    }

    /// Store a `usize` at the start of the payload of block `off`.
    pub(crate) fn set_payload_word(&mut self, off: usize, value: usize) {
        let at = off + HEADER_SIZE;
        assert!(at + 8 <= self.payload_len());
        let w = (value as u64).to_le_bytes();
        // Safety: bounds checked above.
        unsafe {
            self.payload_base()
                .add(at)
                .copy_from_nonoverlapping(w.as_ptr(), 8);
        }
    }

    /// The caller-visible address of the payload of block `off`.
    pub(crate) fn payload_ptr(&self, off: usize) -> NonNull<u8> {
        debug_assert!(off + HEADER_SIZE <= self.payload_len());
        // Safety: in bounds of the region, which is non-null.
        unsafe { NonNull::new_unchecked(self.payload_base().add(off + HEADER_SIZE)) }
    }

    /// Map a caller-visible payload address back to its block offset,
    /// checking only that the address lies in the payload area and is
    /// `alignment`-aligned relative to it.
    pub(crate) fn block_offset_of(&self, ptr: NonNull<u8>, alignment: usize) -> Option<usize> {
        let addr = ptr.as_ptr() as usize;
        let start = self.payload_base() as usize;
        let rel = addr.checked_sub(start)?;
        let off = rel.checked_sub(HEADER_SIZE)?;
        if rel >= self.payload_len() || off % alignment != 0 {
            return None;
        }
        Some(off)
    }

    /// Zero `len` bytes of the payload of block `off`.
    pub(crate) fn zero_payload(&mut self, off: usize, len: usize) {
        let at = off + HEADER_SIZE;
        assert!(at + len <= self.payload_len());
        // Safety: bounds checked above.
        unsafe { self.payload_base().add(at).write_bytes(0, len) }
    }

    /// Copy `len` payload bytes from block `src` to block `dst`.
    pub(crate) fn copy_payload(&mut self, src: usize, dst: usize, len: usize) {
        let (src, dst) = (src + HEADER_SIZE, dst + HEADER_SIZE);
        assert!(src + len <= self.payload_len() && dst + len <= self.payload_len());
        debug_assert!(src + len <= dst || dst + len <= src);
        // Safety: bounds checked above; distinct blocks never overlap.
        unsafe {
            let base = self.payload_base();
            base.add(dst)
                .copy_from_nonoverlapping(base.add(src).cast_const(), len);
        }
    }

    /// The payload bytes of block `off`.
    pub(crate) fn payload(&self, off: usize, len: usize) -> &[u8] {
        let at = off + HEADER_SIZE;
        assert!(at + len <= self.payload_len());
        // Safety: bounds checked above.
        unsafe { slice::from_raw_parts(self.payload_base().add(at), len) }
    }

    /// The payload bytes of block `off`, mutably.
    pub(crate) fn payload_mut(&mut self, off: usize, len: usize) -> &mut [u8] {
        let at = off + HEADER_SIZE;
        assert!(at + len <= self.payload_len());
        // Safety: bounds checked above.
        unsafe { slice::from_raw_parts_mut(self.payload_base().add(at), len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        match self.backing {
            // Safety: allocated in `Region::allocate` with exactly this layout.
            Backing::Owned(layout) => unsafe { dealloc(self.base.as_ptr(), layout) },
            Backing::Static => {}
        }
    }
}
