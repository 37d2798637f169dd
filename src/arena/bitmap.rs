//! The chunk bitmap accelerator.
//!
//! One bit per `chunk_size` bytes of payload area. A set bit means "nothing
//! free here, skip it"; a clear bit means "there may be free space here". A
//! clear bit over a fully occupied chunk only costs a wasted scan, but a set
//! bit over a chunk that any free block overlaps would hide that block from
//! allocation. So every operation that creates or grows a free block clears
//! the bits of every chunk the block touches, and bits are only ever set for
//! chunks lying entirely inside a single allocated block.

/// Bitmap geometry. The bits themselves live in the region's bitmap area and
/// are passed in by the caller.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ChunkBitmap {
    chunk_shift: u32,
    chunk_count: usize,
}

impl ChunkBitmap {
    pub(crate) fn new(chunk_size: usize, chunk_count: usize) -> Self {
        debug_assert!(chunk_size.is_power_of_two());
        ChunkBitmap {
            chunk_shift: chunk_size.trailing_zeros(),
            chunk_count,
        }
    }

    #[inline]
    pub(crate) fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    #[inline]
    pub(crate) fn chunk_start(&self, chunk: usize) -> usize {
        chunk << self.chunk_shift
    }

    #[inline]
    pub(crate) fn chunk_end(&self, chunk: usize) -> usize {
        (chunk + 1) << self.chunk_shift
    }

    /// The chunk containing payload offset `off`.
    #[inline]
    pub(crate) fn chunk_of(&self, off: usize) -> usize {
        off >> self.chunk_shift
    }

    /// Mark the chunks covering `0..payload_len` as possibly free, and every
    /// trailing chunk past it as occupied.
    pub(crate) fn reset(&self, bits: &mut [u8], payload_len: usize) {
        bits.fill(0);
        let first_unused = payload_len.div_ceil(1 << self.chunk_shift);
        self.set_range(bits, first_unused, self.chunk_count, true);
        // Padding bits past `chunk_count` are never scanned, but keep them set
        // so whole-byte skipping sees a full byte.
        self.set_range(bits, self.chunk_count, bits.len() * 8, true);
    }

    #[inline]
    pub(crate) fn is_set(&self, bits: &[u8], chunk: usize) -> bool {
        bits[chunk / 8] & (1 << (chunk % 8)) != 0
    }

    /// Find the first clear chunk at or after `from`.
    ///
    /// Whole bytes of set bits are skipped at once; otherwise bits are tested
    /// one at a time.
    pub(crate) fn find_clear(&self, bits: &[u8], from: usize) -> Option<usize> {
        let mut chunk = from;
        while chunk < self.chunk_count {
            let byte = bits[chunk / 8];
            if byte == u8::MAX {
                chunk = (chunk / 8 + 1) * 8;
                continue;
            }
            if byte & (1 << (chunk % 8)) == 0 {
                return Some(chunk);
            }
            chunk += 1;
        }
        None
    }

    /// Clear the bit of every chunk that `start..end` overlaps.
    pub(crate) fn clear_span(&self, bits: &mut [u8], start: usize, end: usize) {
        if start >= end {
            return;
        }
        let first = self.chunk_of(start);
        let last = self.chunk_of(end - 1);
        log::trace!("bitmap: clearing chunks {first}..={last}");
        self.set_range(bits, first, last + 1, false);
    }

    /// Set the bit of every chunk lying entirely within `start..end`.
    pub(crate) fn fill_span(&self, bits: &mut [u8], start: usize, end: usize) {
        let first = start.div_ceil(1 << self.chunk_shift);
        let past = self.chunk_of(end);
        if first < past {
            log::trace!("bitmap: filling chunks {first}..{past}");
            self.set_range(bits, first, past, true);
        }
    }

    /// Set or clear bits `lo..hi`, clamped to the bitmap.
    fn set_range(&self, bits: &mut [u8], lo: usize, hi: usize, value: bool) {
        let hi = hi.min(bits.len() * 8);
        let mut i = lo;
        while i < hi {
            if i % 8 == 0 && i + 8 <= hi {
                bits[i / 8] = if value { u8::MAX } else { 0 };
                i += 8;
                continue;
            }
            if value {
                bits[i / 8] |= 1 << (i % 8);
            } else {
                bits[i / 8] &= !(1 << (i % 8));
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_marks_trailing_chunks() {
        // 10 chunks of 16 bytes, but only 100 bytes of payload: chunks 0..=6
        // overlap the payload.
        let bitmap = ChunkBitmap::new(16, 10);
        let mut bits = [0xAAu8; 2];
        bitmap.reset(&mut bits, 100);
        for chunk in 0..7 {
            assert!(!bitmap.is_set(&bits, chunk), "chunk {chunk}");
        }
        for chunk in 7..10 {
            assert!(bitmap.is_set(&bits, chunk), "chunk {chunk}");
        }
        assert_eq!(bits[1], 0b1111_1111);
    }

    #[test]
    fn find_clear_skips_full_bytes() {
        let bitmap = ChunkBitmap::new(64, 32);
        let mut bits = [0u8; 4];
        bitmap.fill_span(&mut bits, 0, 64 * 19);
        assert_eq!(bits, [0xFF, 0xFF, 0b0000_0111, 0]);
        assert_eq!(bitmap.find_clear(&bits, 0), Some(19));
        assert_eq!(bitmap.find_clear(&bits, 20), Some(20));

        bitmap.fill_span(&mut bits, 0, 64 * 32);
        assert_eq!(bitmap.find_clear(&bits, 0), None);
    }

    #[test]
    fn fill_span_only_covers_whole_chunks() {
        let bitmap = ChunkBitmap::new(32, 8);
        let mut bits = [0u8; 1];
        // 40..150 fully covers chunks 2 and 3 (64..128), partially 1 and 4.
        bitmap.fill_span(&mut bits, 40, 150);
        assert_eq!(bits[0], 0b0000_1100);

        // A span inside one chunk covers nothing.
        bitmap.fill_span(&mut bits, 161, 190);
        assert_eq!(bits[0], 0b0000_1100);
    }

    #[test]
    fn clear_span_covers_partial_chunks() {
        let bitmap = ChunkBitmap::new(32, 8);
        let mut bits = [u8::MAX; 1];
        bitmap.clear_span(&mut bits, 40, 65);
        assert_eq!(bits[0], 0b1111_1001);

        bitmap.clear_span(&mut bits, 100, 100);
        assert_eq!(bits[0], 0b1111_1001);
    }
}
