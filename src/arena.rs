//! The fixed-capacity arena.
//!
//! All memory is served out of one backing region obtained once, at creation.
//! The region is carved into a chunk bitmap followed by the payload area, and
//! the payload area is partitioned into blocks, each starting with a
//! [`HEADER_SIZE`]-byte header. The blocks form the ledger: an address-ordered
//! doubly linked list of every block, free or allocated.
//!
//! Allocation is first-fit over the ledger. The chunk bitmap lets the search
//! jump over runs of chunks known to be fully occupied, so that the average
//! search does not have to walk every block in a large pool:
//!
//! * Finding a fit asks the bitmap for the next chunk that may contain free
//!   space, walks the ledger through the blocks of that chunk, and goes back
//!   to the bitmap when it leaves the chunk.
//!
//! * A fitting block is split if the remainder can hold a block of its own;
//!   otherwise the caller gets a little more than it asked for.
//!
//! * Releasing a block coalesces it with its free neighbours immediately, so
//!   no two free blocks are ever adjacent.
//!
//! Optionally, small released blocks are parked in size-classed bins and
//! handed straight back to the next request of that class, skipping the
//! search and the coalescing. Bins are drained back into the ledger by
//! [`Arena::reclaim_bins`], or automatically when the ledger cannot satisfy a
//! request.

use crate::config::{align_up, ArenaConfig, ConfigError, HEADER_SIZE};
use crate::ArenaError;
use core::ptr::NonNull;

mod bins;
mod bitmap;
mod block;
mod ledger;
mod region;

use bins::Bins;
use bitmap::ChunkBitmap;
use block::Header;
use region::Region;

pub use block::{BlockInfo, Status};
pub use ledger::{Blocks, Corruption};

/// A fixed-capacity first-fit allocator over one owned backing region.
///
/// Every method takes `&mut self`: the arena does no locking of its own. Wrap
/// it in a [`SyncArena`][crate::SyncArena] to share it between threads.
///
/// Pointers returned by the arena are valid for reads and writes of
/// [`usable_size`][Arena::usable_size] bytes until they are released or the
/// arena is destroyed.
pub struct Arena {
    region: Region,
    bitmap: Option<ChunkBitmap>,
    bins: Option<Bins>,
    alignment: usize,
    high_water: usize,
}

/// A summary of the ledger, returned by [`Arena::stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Total bytes of the payload area.
    pub payload_len: usize,
    /// Number of free blocks.
    pub free_blocks: usize,
    /// Header and payload bytes of all free blocks.
    pub free_bytes: usize,
    /// Number of blocks handed out to callers.
    pub allocated_blocks: usize,
    /// Header and payload bytes of all allocated blocks.
    pub allocated_bytes: usize,
    /// Number of blocks parked in bins.
    pub binned_blocks: usize,
    /// Header and payload bytes of all binned blocks.
    pub binned_bytes: usize,
    /// Total size of the largest free block.
    pub largest_free: usize,
}

impl Arena {
    /// Create an arena over a freshly allocated region of `config.capacity`
    /// bytes.
    pub fn try_create(config: ArenaConfig) -> Result<Self, ConfigError> {
        let region = Region::allocate(&config)?;
        Ok(Self::init(region, &config))
    }

    /// Like [`Arena::try_create`], but an invalid configuration is fatal.
    ///
    /// # Panics
    ///
    /// Panics if `config` is invalid or the region cannot be allocated.
    pub fn create(config: ArenaConfig) -> Self {
        match Self::try_create(config) {
            Ok(arena) => arena,
            Err(e) => {
                log::error!("cannot create arena with {config:?}: {e}");
                panic!("invalid arena configuration: {e}");
            }
        }
    }

    /// Create an arena over a caller-provided region that lives for the rest
    /// of the program. `config.capacity` is ignored: the arena uses all of
    /// `bytes` past the first `config.alignment`-aligned address.
    pub fn from_static(bytes: &'static mut [u8], config: ArenaConfig) -> Result<Self, ConfigError> {
        let region = Region::from_static(bytes, &config)?;
        Ok(Self::init(region, &config))
    }

    fn init(mut region: Region, config: &ArenaConfig) -> Self {
        let carving = *region.carving();
        let payload_len = carving.payload_len;

        region.set_header(0, &Header::new(payload_len, None, None, Status::Free));
        let bitmap = config
            .bitmap
            .then(|| ChunkBitmap::new(config.chunk_size, carving.chunk_count));
        if let Some(bitmap) = bitmap {
            bitmap.reset(region.bitmap_mut(), payload_len);
        }

        log::debug!(
            "created arena: {} bytes of payload, {} bitmap bytes over {} chunks, bins {}",
            payload_len,
            carving.bitmap_len,
            carving.chunk_count,
            if config.bins { "on" } else { "off" },
        );

        Arena {
            region,
            bitmap,
            bins: config.bins.then(|| Bins::new(config.alignment)),
            alignment: config.alignment,
            high_water: 0,
        }
    }

    /// Tear down the arena, returning an owned region to the global
    /// allocator. Every pointer it handed out becomes dangling.
    pub fn destroy(self) {
        log::debug!("destroying arena with {} bytes of payload", self.payload_capacity());
    }

    /// The alignment of every payload.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Total bytes of the payload area, headers included.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.region.payload_len()
    }

    /// The furthest end offset, within the payload area, that any allocated
    /// block has ever reached.
    #[inline]
    pub fn high_water_mark(&self) -> usize {
        self.high_water
    }

    /// Header plus aligned payload for a `size`-byte request.
    fn required_size(&self, size: usize) -> Result<usize, ArenaError> {
        let required = align_up(size, self.alignment)
            .and_then(|payload| payload.checked_add(HEADER_SIZE))
            .ok_or(ArenaError::Overflow)?;
        if required > self.region.payload_len() {
            return Err(ArenaError::OutOfMemory);
        }
        Ok(required)
    }

    /// Allocate `size` bytes. Returns `None` for zero-sized requests and on
    /// any failure.
    #[inline]
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.try_allocate(size).ok().flatten()
    }

    /// Allocate `size` bytes, reporting why the allocation failed. Returns
    /// `Ok(None)` for zero-sized requests.
    pub fn try_allocate(&mut self, size: usize) -> Result<Option<NonNull<u8>>, ArenaError> {
        if size == 0 {
            return Ok(None);
        }
        let off = self.allocate_block(size).inspect_err(|e| {
            log::debug!("allocate({size}) failed: {e}");
        })?;
        Ok(Some(self.region.payload_ptr(off)))
    }

    fn allocate_block(&mut self, size: usize) -> Result<usize, ArenaError> {
        let required = self.required_size(size)?;
        let mut rounded = required;

        if self.bins.is_some() {
            if let Some((class, class_payload)) =
                bins::class_for_request(required - HEADER_SIZE, self.alignment)
            {
                if let Some(off) = self.pop_bin(class) {
                    return Ok(off);
                }
                // Serve small requests with whole classes so that they can
                // be binned and reused later.
                if let Ok(class_required) = self.required_size(class_payload) {
                    rounded = class_required;
                }
            }
        }

        let (off, size) = match self.find_fit_rounded(rounded, required) {
            Some(fit) => fit,
            None if self.bins.as_ref().is_some_and(|b| b.len() > 0) => {
                log::debug!("no fit for {required} bytes, reclaiming bins");
                self.reclaim_bins();
                self.find_fit_rounded(rounded, required)
                    .ok_or(ArenaError::OutOfMemory)?
            }
            None => return Err(ArenaError::OutOfMemory),
        };

        self.split(off, size);
        self.mark_allocated(off);
        Ok(off)
    }

    /// Find a block for `rounded` bytes, or failing that for the `required`
    /// bytes the request actually needs. Returns the block and the size to
    /// split it to.
    fn find_fit_rounded(&self, rounded: usize, required: usize) -> Option<(usize, usize)> {
        if let Some(off) = self.find_fit(rounded) {
            return Some((off, rounded));
        }
        if rounded == required {
            return None;
        }
        self.find_fit(required).map(|off| (off, required))
    }

    fn pop_bin(&mut self, class: usize) -> Option<usize> {
        let off = self.bins.as_mut()?.pop(&self.region, class)?;
        self.mark_allocated(off);
        Some(off)
    }

    /// Tag block `off` as allocated and account for it in the bitmap.
    fn mark_allocated(&mut self, off: usize) {
        let mut header = self.region.header(off);
        header.set_status(Status::Allocated);
        self.region.set_header(off, &header);

        let end = off + header.size;
        self.fill_bits(off, end);
        self.high_water = self.high_water.max(end);
    }

    /// Allocate `count * elem_size` zeroed bytes.
    #[inline]
    pub fn zero_allocate(&mut self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        self.try_zero_allocate(count, elem_size).ok().flatten()
    }

    /// Allocate `count * elem_size` zeroed bytes, reporting why the
    /// allocation failed.
    pub fn try_zero_allocate(
        &mut self,
        count: usize,
        elem_size: usize,
    ) -> Result<Option<NonNull<u8>>, ArenaError> {
        let size = count.checked_mul(elem_size).ok_or_else(|| {
            log::debug!("zero_allocate({count}, {elem_size}) overflows");
            ArenaError::Overflow
        })?;
        let Some(ptr) = self.try_allocate(size)? else {
            return Ok(None);
        };

        let (off, header) = self.lookup(ptr)?;
        self.region.zero_payload(off, header.payload_size());
        Ok(Some(ptr))
    }

    /// Release an allocation. Null, foreign, and already released pointers
    /// are ignored.
    #[inline]
    pub fn release(&mut self, ptr: Option<NonNull<u8>>) {
        let _ = self.try_release(ptr);
    }

    /// Release an allocation, reporting why the pointer was ignored.
    pub fn try_release(&mut self, ptr: Option<NonNull<u8>>) -> Result<(), ArenaError> {
        let Some(ptr) = ptr else {
            return Ok(());
        };
        let (off, header) = self.lookup(ptr).inspect_err(|e| {
            log::warn!("ignoring release of {ptr:p}: {e}");
        })?;
        self.release_block(off, header);
        Ok(())
    }

    fn release_block(&mut self, off: usize, mut header: Header) {
        if let Some(bins) = &mut self.bins {
            if let Some(class) = bins::class_for_block(header.payload_size(), self.alignment) {
                header.set_status(Status::Binned);
                self.region.set_header(off, &header);
                bins.push(&mut self.region, class, off);
                return;
            }
        }

        header.set_status(Status::Free);
        self.region.set_header(off, &header);
        self.coalesce(off);
    }

    /// Resize an allocation.
    ///
    /// A `None` pointer allocates, and a `new_size` of zero releases. The
    /// allocation is shrunk or grown in place when possible; otherwise it is
    /// moved. On failure, the original allocation is left untouched.
    #[inline]
    pub fn reallocate(&mut self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        self.try_reallocate(ptr, new_size).ok().flatten()
    }

    /// Resize an allocation, reporting why it could not be resized.
    pub fn try_reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Result<Option<NonNull<u8>>, ArenaError> {
        let Some(ptr) = ptr else {
            return self.try_allocate(new_size);
        };
        if new_size == 0 {
            self.try_release(Some(ptr))?;
            return Ok(None);
        }

        let (off, header) = self.lookup(ptr).inspect_err(|e| {
            log::warn!("ignoring reallocate of {ptr:p}: {e}");
        })?;
        let required = self.required_size(new_size)?;

        if required <= header.size {
            log::trace!("reallocate({ptr:p}, {new_size}): shrinking in place");
            self.split(off, required);
            return Ok(Some(ptr));
        }

        if let Some(next) = header.next {
            let next_header = self.region.header(next);
            if next_header.is(Status::Free)
                && header.size.saturating_add(next_header.size) >= required
                && self.absorb_next(off)
            {
                log::trace!("reallocate({ptr:p}, {new_size}): grew in place");
                self.split(off, required);
                self.mark_allocated(off);
                return Ok(Some(ptr));
            }
        }

        let new_off = self.allocate_block(new_size).inspect_err(|e| {
            log::debug!("reallocate({ptr:p}, {new_size}) failed: {e}");
        })?;
        log::trace!("reallocate({ptr:p}, {new_size}): moving to block {new_off:#x}");
        let len = header.payload_size().min(new_size);
        self.region.copy_payload(off, new_off, len);
        // The old header is unchanged: `allocate_block` only touches free and
        // binned blocks.
        self.release_block(off, self.region.header(off));
        Ok(Some(self.region.payload_ptr(new_off)))
    }

    /// Return every binned block to the ledger, coalescing as it goes.
    pub fn reclaim_bins(&mut self) {
        let Some(mut bins) = self.bins.take() else {
            return;
        };
        let mut reclaimed = 0;
        for class in 0..bins::SIZE_CLASSES.len() {
            while let Some(off) = bins.pop(&self.region, class) {
                let mut header = self.region.header(off);
                header.set_status(Status::Free);
                self.region.set_header(off, &header);
                self.coalesce(off);
                reclaimed += 1;
            }
        }
        log::debug!("reclaimed {reclaimed} binned blocks");
        self.bins = Some(bins);
    }

    /// The number of payload bytes usable through `ptr`, which may exceed the
    /// size that was requested.
    pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
        let (_, header) = self.lookup(ptr).ok()?;
        Some(header.payload_size())
    }

    /// The payload of the live allocation at `ptr`.
    pub fn payload(&self, ptr: NonNull<u8>) -> Option<&[u8]> {
        let (off, header) = self.lookup(ptr).ok()?;
        Some(self.region.payload(off, header.payload_size()))
    }

    /// The payload of the live allocation at `ptr`, mutably.
    pub fn payload_mut(&mut self, ptr: NonNull<u8>) -> Option<&mut [u8]> {
        let (off, header) = self.lookup(ptr).ok()?;
        Some(self.region.payload_mut(off, header.payload_size()))
    }

    /// Is `chunk` marked fully occupied in the chunk bitmap? Always `false`
    /// without a bitmap.
    pub fn chunk_is_occupied(&self, chunk: usize) -> bool {
        match self.bitmap {
            Some(bitmap) if chunk < bitmap.chunk_count() => {
                bitmap.is_set(self.region.bitmap(), chunk)
            }
            _ => false,
        }
    }

    /// Summarize the ledger.
    pub fn stats(&self) -> ArenaStats {
        let mut stats = ArenaStats {
            payload_len: self.region.payload_len(),
            ..ArenaStats::default()
        };
        for block in self.blocks() {
            match block.status {
                Some(Status::Free) => {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                    stats.largest_free = stats.largest_free.max(block.size);
                }
                Some(Status::Allocated) => {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += block.size;
                }
                Some(Status::Binned) => {
                    stats.binned_blocks += 1;
                    stats.binned_bytes += block.size;
                }
                None => {}
            }
        }
        stats
    }
}

impl core::fmt::Debug for Arena {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("payload_len", &self.region.payload_len())
            .field("alignment", &self.alignment)
            .field("bitmap", &self.bitmap.is_some())
            .field("bins", &self.bins.is_some())
            .field("high_water", &self.high_water)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::{boxed::Box, vec, vec::Vec};

    fn arena(config: ArenaConfig) -> Arena {
        let _ = env_logger::try_init();
        Arena::try_create(config).unwrap()
    }

    /// The ledger partitions the payload area, no two neighbours are free,
    /// and no free block hides under an occupied chunk.
    fn check(arena: &Arena) {
        if let Err(e) = arena.validate() {
            panic!("{e}\n{}", arena.dump_state());
        }

        let mut expected = 0;
        let mut prev_free = false;
        for block in arena.blocks() {
            assert_eq!(block.offset, expected);
            assert!(!(prev_free && block.is_free()));
            if block.is_free() {
                let chunk_size = 256;
                for chunk in block.offset / chunk_size..=(block.end() - 1) / chunk_size {
                    assert!(!arena.chunk_is_occupied(chunk), "chunk {chunk} under free block");
                }
            }
            prev_free = block.is_free();
            expected = block.end();
        }
        assert_eq!(expected, arena.payload_capacity());
    }

    #[test]
    fn fresh_arena_is_one_free_block() {
        let arena = arena(ArenaConfig::default());
        check(&arena);
        let blocks: Vec<_> = arena.blocks().collect();
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].is_free());
        assert_eq!(blocks[0].size, arena.payload_capacity());
        assert_eq!(arena.high_water_mark(), 0);
    }

    #[test]
    fn round_trip() {
        let mut arena = arena(ArenaConfig::default());
        let before = arena.dump_state();

        let ptr = arena.allocate(100).unwrap();
        assert_eq!(ptr.as_ptr() as usize % arena.alignment(), 0);
        assert_eq!(arena.usable_size(ptr), Some(104));
        check(&arena);

        arena.release(Some(ptr));
        check(&arena);
        assert_eq!(arena.dump_state(), before);
    }

    #[test]
    fn zero_size_requests() {
        let mut arena = arena(ArenaConfig::default());
        assert_eq!(arena.allocate(0), None);
        assert_eq!(arena.try_allocate(0), Ok(None));
        assert_eq!(arena.zero_allocate(0, 8), None);
        assert_eq!(arena.reallocate(None, 0), None);
        assert_eq!(arena.stats().allocated_blocks, 0);
    }

    #[test]
    fn double_release_is_ignored() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        let _b = arena.allocate(64).unwrap();

        arena.release(Some(a));
        let before = arena.dump_state();
        assert_eq!(arena.try_release(Some(a)), Err(ArenaError::DoubleRelease));
        assert_eq!(arena.dump_state(), before);
        assert_eq!(arena.reallocate(Some(a), 32), None);
        assert_eq!(arena.dump_state(), before);
        check(&arena);
    }

    #[test]
    fn grows_in_place_into_released_neighbour() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 96);

        arena.payload_mut(a).unwrap().fill(0xA5);
        arena.release(Some(b));
        let grown = arena.reallocate(Some(a), 128).unwrap();
        assert_eq!(grown, a);
        assert!(arena.payload(a).unwrap()[..64].iter().all(|&b| b == 0xA5));
        assert_eq!(arena.usable_size(a), Some(128));
        check(&arena);
    }

    #[test]
    fn shrink_leaves_reusable_tail() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(256).unwrap();
        let _b = arena.allocate(64).unwrap();
        let high_water = arena.high_water_mark();
        assert_eq!(high_water, 288 + 96);

        assert_eq!(arena.reallocate(Some(a), 64), Some(a));
        assert_eq!(arena.usable_size(a), Some(64));
        check(&arena);

        // The 192-byte tail holds exactly a 160-byte payload.
        let c = arena.allocate(160).unwrap();
        assert_eq!(c.as_ptr() as usize, a.as_ptr() as usize + 96);
        assert_eq!(arena.high_water_mark(), high_water);
        check(&arena);
    }

    #[test]
    fn shrink_merges_tail_with_free_successor() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(512).unwrap();
        assert_eq!(arena.reallocate(Some(a), 16), Some(a));
        let stats = arena.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.allocated_bytes, 48);
        check(&arena);
    }

    #[test]
    fn reallocate_moves_when_blocked() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        let _b = arena.allocate(64).unwrap();
        for (i, byte) in arena.payload_mut(a).unwrap().iter_mut().enumerate() {
            *byte = i as u8;
        }

        let moved = arena.reallocate(Some(a), 1000).unwrap();
        assert_ne!(moved, a);
        let bytes = arena.payload(moved).unwrap();
        assert!(bytes[..64].iter().enumerate().all(|(i, &b)| b == i as u8));
        assert_eq!(arena.usable_size(a), None);
        assert_eq!(arena.try_release(Some(a)), Err(ArenaError::DoubleRelease));
        check(&arena);
    }

    #[test]
    fn failed_reallocate_keeps_original() {
        let mut arena = arena(ArenaConfig::new(4096).with_bitmap(false));
        let a = arena.allocate(100).unwrap();
        arena.payload_mut(a).unwrap().fill(7);
        let before = arena.dump_state();

        assert_eq!(arena.try_reallocate(Some(a), 5000), Err(ArenaError::OutOfMemory));
        assert_eq!(arena.dump_state(), before);
        assert!(arena.payload(a).unwrap().iter().all(|&b| b == 7));
    }

    #[test]
    fn reallocate_to_zero_releases() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        assert_eq!(arena.reallocate(Some(a), 0), None);
        assert_eq!(arena.stats().free_blocks, 1);
        assert_eq!(arena.stats().allocated_blocks, 0);
    }

    #[test]
    fn bitmap_marks_only_whole_chunks() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(1024).unwrap();
        // Block 0..1056 covers chunks 0..=3 entirely and chunk 4 in part.
        for chunk in 0..4 {
            assert!(arena.chunk_is_occupied(chunk), "chunk {chunk}");
        }
        assert!(!arena.chunk_is_occupied(4));
        check(&arena);

        arena.release(Some(a));
        for chunk in 0..5 {
            assert!(!arena.chunk_is_occupied(chunk), "chunk {chunk}");
        }
        check(&arena);
    }

    #[test]
    fn exhaustion() {
        let mut arena = arena(ArenaConfig::new(4096).with_bitmap(false));
        assert_eq!(arena.payload_capacity(), 4096);

        let all = arena.allocate(4064).unwrap();
        assert_eq!(arena.allocate(1), None);
        assert_eq!(arena.try_allocate(1), Err(ArenaError::OutOfMemory));
        check(&arena);

        arena.release(Some(all));
        assert_eq!(arena.try_allocate(4065), Err(ArenaError::OutOfMemory));
        assert!(arena.allocate(4064).is_some());
    }

    #[test]
    fn exhaustion_with_bitmap() {
        // 17 chunks take 3 bitmap bytes, padded to 8.
        let mut arena = arena(ArenaConfig::new(4104));
        assert_eq!(arena.payload_capacity(), 4096);

        let all = arena.allocate(4064).unwrap();
        assert_eq!(arena.allocate(1), None);
        check(&arena);
        arena.release(Some(all));
        check(&arena);
    }

    #[test]
    fn zero_allocate_zeroes() {
        let mut arena = arena(ArenaConfig::default());
        let dirty = arena.allocate(40).unwrap();
        arena.payload_mut(dirty).unwrap().fill(0xFF);
        arena.release(Some(dirty));

        let ptr = arena.zero_allocate(10, 4).unwrap();
        assert_eq!(ptr, dirty);
        let bytes = arena.payload(ptr).unwrap();
        assert_eq!(bytes.len(), 40);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn overflow() {
        let mut arena = arena(ArenaConfig::default());
        assert_eq!(arena.zero_allocate(usize::MAX, 2), None);
        assert_eq!(arena.try_zero_allocate(usize::MAX, 2), Err(ArenaError::Overflow));
        assert_eq!(arena.try_allocate(usize::MAX), Err(ArenaError::Overflow));
        let capacity = arena.payload_capacity();
        assert_eq!(arena.try_allocate(capacity), Err(ArenaError::OutOfMemory));
        check(&arena);
    }

    #[test]
    fn invalid_pointers_are_ignored() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        arena.payload_mut(a).unwrap().fill(0);
        let before = arena.dump_state();

        arena.release(None);
        assert_eq!(arena.dump_state(), before);

        let mut foreign = [0u64; 8];
        let foreign = NonNull::from(&mut foreign).cast::<u8>();
        assert_eq!(arena.try_release(Some(foreign)), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.try_reallocate(Some(foreign), 8), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.usable_size(foreign), None);
        assert_eq!(arena.dump_state(), before);

        let interior = NonNull::new(a.as_ptr().wrapping_add(8)).unwrap();
        assert!(arena.try_release(Some(interior)).is_err());
        let misaligned = NonNull::new(a.as_ptr().wrapping_add(3)).unwrap();
        assert_eq!(arena.try_release(Some(misaligned)), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.dump_state(), before);

        arena.release(Some(a));
        check(&arena);
    }

    #[test]
    fn corruption_is_detected() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();
        assert!(!arena.dump_state().contains("!!"));

        // Scribble over `b`'s tag by writing past the end of `a`.
        unsafe { a.as_ptr().add(64 + 24).write_bytes(0xEE, 4) };

        assert!(matches!(arena.validate(), Err(Corruption::BadTag { offset: 96, .. })));
        assert!(arena.dump_state().contains("!!"));
        assert_eq!(arena.try_release(Some(b)), Err(ArenaError::DoubleRelease));
        arena.release(Some(a));
    }

    #[test]
    fn broken_next_link_is_rejected() {
        let mut arena = arena(ArenaConfig::default());
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();

        // Overwrite only `b`'s `next` field, which follows `a`'s payload at
        // header bytes 16..24.
        unsafe { a.as_ptr().add(64 + 16).write_bytes(0xEE, 8) };
        assert_eq!(arena.validate(), Err(Corruption::BrokenLink { offset: 96 }));

        let before = arena.dump_state();
        assert_eq!(arena.try_release(Some(b)), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.try_reallocate(Some(b), 8), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.usable_size(b), None);
        assert_eq!(arena.dump_state(), before);

        // The search cannot follow the ledger past `b`.
        assert_eq!(arena.try_allocate(1000), Err(ArenaError::OutOfMemory));
        assert_eq!(arena.dump_state(), before);
    }

    #[test]
    fn overwritten_header_stops_the_search() {
        let mut arena = arena(ArenaConfig::new(4096).with_bitmap(false));
        let a = arena.allocate(64).unwrap();
        let b = arena.allocate(64).unwrap();

        // Run 32 bytes past the end of `a`, over all of `b`'s header.
        unsafe { a.as_ptr().write_bytes(0xEE, 64 + 32) };
        assert_eq!(arena.validate(), Err(Corruption::BrokenLink { offset: 96 }));

        let before = arena.dump_state();
        assert_eq!(arena.allocate(1000), None);
        assert_eq!(arena.try_allocate(1000), Err(ArenaError::OutOfMemory));
        assert!(arena.try_release(Some(b)).is_err());
        // `a` is intact, but `b` no longer links back to it.
        assert_eq!(arena.try_release(Some(a)), Err(ArenaError::InvalidPointer));
        assert_eq!(arena.dump_state(), before);
    }

    #[test]
    fn bins_fall_back_to_exact_fit() {
        let mut arena = arena(ArenaConfig::new(4096).with_bitmap(false).with_bins(true));
        let _big = arena.allocate(4008).unwrap();
        let stats = arena.stats();
        assert_eq!(stats.largest_free, 56);

        // Too small for the 32-byte class, but exactly right for 24 bytes.
        let small = arena.try_allocate(24).unwrap().unwrap();
        assert_eq!(arena.usable_size(small), Some(24));
        assert_eq!(arena.stats().free_blocks, 0);
        check(&arena);

        arena.release(Some(small));
        assert_eq!(arena.stats().binned_blocks, 1);
        check(&arena);
    }

    #[test]
    fn config_errors() {
        let _ = env_logger::try_init();
        let err = |config| Arena::try_create(config).unwrap_err();

        assert_eq!(
            err(ArenaConfig::default().with_chunk_size(100)),
            ConfigError::ChunkSizeNotPowerOfTwo { chunk_size: 100 }
        );
        assert_eq!(
            err(ArenaConfig::default().with_alignment(4)),
            ConfigError::BadAlignment { alignment: 4 }
        );
        assert_eq!(
            err(ArenaConfig::default().with_alignment(64)),
            ConfigError::BadAlignment { alignment: 64 }
        );
        assert_eq!(
            err(ArenaConfig::new(16)),
            ConfigError::CapacityTooSmall {
                capacity: 16,
                required: 48
            }
        );
        assert_eq!(
            err(ArenaConfig::new(40).with_bitmap(false)),
            ConfigError::CapacityTooSmall {
                capacity: 40,
                required: 40
            }
        );
        assert!(ArenaConfig::new(41).with_bitmap(false).validate().is_ok());
    }

    #[test]
    #[should_panic(expected = "invalid arena configuration")]
    fn create_panics_on_bad_config() {
        let _ = Arena::create(ArenaConfig::default().with_chunk_size(3));
    }

    #[test]
    fn wider_alignment() {
        let mut arena = arena(ArenaConfig::default().with_alignment(32));
        for size in [1, 31, 33, 100] {
            let ptr = arena.allocate(size).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 32, 0);
            assert_eq!(arena.usable_size(ptr).unwrap() % 32, 0);
        }
        check(&arena);
    }

    #[test]
    fn from_static_region() {
        let _ = env_logger::try_init();
        let bytes: &'static mut [u8] = Box::leak(vec![0xCC; 4099].into_boxed_slice());
        let mut arena = Arena::from_static(bytes, ArenaConfig::new(0)).unwrap();
        assert!(arena.payload_capacity() <= 4096);
        check(&arena);

        let ptr = arena.zero_allocate(8, 8).unwrap();
        assert!(arena.payload(ptr).unwrap().iter().all(|&b| b == 0));
        arena.release(Some(ptr));
        check(&arena);
        arena.destroy();
    }

    #[test]
    fn bins_reuse_released_blocks() {
        let mut arena = arena(ArenaConfig::default().with_bins(true));
        let a = arena.allocate(24).unwrap();
        // Rounded up to the 32-byte class.
        assert_eq!(arena.usable_size(a), Some(32));
        let _guard = arena.allocate(500).unwrap();

        arena.release(Some(a));
        assert_eq!(arena.stats().binned_blocks, 1);
        assert_eq!(arena.try_release(Some(a)), Err(ArenaError::DoubleRelease));
        check(&arena);

        let b = arena.allocate(20).unwrap();
        assert_eq!(b, a);
        assert_eq!(arena.stats().binned_blocks, 0);

        arena.release(Some(b));
        arena.reclaim_bins();
        let stats = arena.stats();
        assert_eq!(stats.binned_blocks, 0);
        assert_eq!(stats.free_blocks, 2);
        check(&arena);
    }

    #[test]
    fn bins_are_reclaimed_when_ledger_is_full() {
        let mut arena = arena(ArenaConfig::new(4096).with_bitmap(false).with_bins(true));
        let mut ptrs = Vec::new();
        while let Some(ptr) = arena.allocate(16) {
            ptrs.push(ptr);
        }
        assert_eq!(arena.stats().free_blocks, 0);

        for ptr in &ptrs {
            arena.release(Some(*ptr));
        }
        assert_eq!(arena.stats().binned_blocks, ptrs.len());
        check(&arena);

        let big = arena.allocate(2000).unwrap();
        assert_eq!(arena.stats().binned_blocks, 0);
        check(&arena);
        arena.release(Some(big));
        assert_eq!(arena.stats().free_blocks, 1);
    }

    #[test]
    fn churn_keeps_invariants() {
        let mut arena = arena(ArenaConfig::new(1 << 15));
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        let mut seed = 0x2545_f491_u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };

        for step in 0..2000u32 {
            let pick = next() as usize;
            match next() % 4 {
                0 | 1 => {
                    let size = 1 + pick % 700;
                    if let Some(ptr) = arena.allocate(size) {
                        let fill = step as u8;
                        arena.payload_mut(ptr).unwrap()[..size].fill(fill);
                        live.push((ptr, size, fill));
                    }
                }
                2 if !live.is_empty() => {
                    let (ptr, _, _) = live.swap_remove(pick % live.len());
                    arena.release(Some(ptr));
                }
                3 if !live.is_empty() => {
                    let i = pick % live.len();
                    let (ptr, size, fill) = live[i];
                    let new_size = 1 + next() as usize % 900;
                    if let Some(new_ptr) = arena.reallocate(Some(ptr), new_size) {
                        let kept = size.min(new_size);
                        let bytes = arena.payload_mut(new_ptr).unwrap();
                        assert!(bytes[..kept].iter().all(|&b| b == fill));
                        bytes[..new_size].fill(fill);
                        live[i] = (new_ptr, new_size, fill);
                    }
                }
                _ => {}
            }
            check(&arena);
        }

        for (ptr, size, fill) in live.drain(..) {
            assert!(arena.payload(ptr).unwrap()[..size].iter().all(|&b| b == fill));
            arena.release(Some(ptr));
        }
        let stats = arena.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, arena.payload_capacity());
    }
}
