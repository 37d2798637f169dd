//! The ledger: every block of the payload area, in address order, linked
//! through `prev`/`next` offsets stored in the block headers.
//!
//! Invariants, after every public operation:
//!
//! * The first block starts at offset `0`, each block's `offset + size` is
//!   its successor's offset, and the last block ends at the end of the
//!   payload area.
//!
//! * No two adjacent blocks are both free.
//!
//! * No free block overlaps a chunk whose bitmap bit is set.

use super::block::{BlockInfo, Header, Status};
use super::Arena;
use crate::config::HEADER_SIZE;
use crate::ArenaError;
use alloc::string::String;
use core::fmt::{self, Write};

impl Arena {
    /// The successor of block `off`. A `next` link that does not name the
    /// block physically following `off` is treated as the end of the ledger.
    fn successor(&self, header: &Header, off: usize) -> Option<usize> {
        let next = header.next?;
        if !self.next_link_ok(off, header) {
            log::warn!(
                "block {off:#x}: next link {next:#x} does not match its size {}",
                header.size
            );
            return None;
        }
        Some(next)
    }

    /// Does block `off`'s `next` link name the block that physically follows
    /// it, with room for that block's header?
    fn next_link_ok(&self, off: usize, header: &Header) -> bool {
        let payload_len = self.region.payload_len();
        let end = off.checked_add(header.size);
        header.size >= HEADER_SIZE
            && match header.next {
                None => end == Some(payload_len),
                Some(next) => {
                    end == Some(next) && next.saturating_add(HEADER_SIZE) <= payload_len
                }
            }
    }

    /// Does block `off`'s `prev` link name a block that ends at `off` and
    /// links back to it?
    fn prev_link_ok(&self, off: usize, header: &Header) -> bool {
        match header.prev {
            None => off == 0,
            Some(prev) => {
                prev < off && {
                    let prev_header = self.region.header(prev);
                    prev_header.next == Some(off) && prev.checked_add(prev_header.size) == Some(off)
                }
            }
        }
    }

    pub(super) fn clear_bits(&mut self, start: usize, end: usize) {
        if let Some(bitmap) = self.bitmap {
            bitmap.clear_span(self.region.bitmap_mut(), start, end);
        }
    }

    pub(super) fn fill_bits(&mut self, start: usize, end: usize) {
        if let Some(bitmap) = self.bitmap {
            bitmap.fill_span(self.region.bitmap_mut(), start, end);
        }
    }

    /// Find the first free block of at least `required` bytes, in address
    /// order.
    ///
    /// The bitmap picks the next chunk that may hold free space; we then walk
    /// the ledger from the first block overlapping that chunk, and go back to
    /// the bitmap once the walk leaves the chunk. The cursor only ever moves
    /// forward, so this is at worst one pass over the chunks plus one pass over
    /// the blocks.
    pub(super) fn find_fit(&self, required: usize) -> Option<usize> {
        let mut cursor = 0;
        let mut chunk = 0;

        loop {
            let (chunk_start, chunk_end) = match self.bitmap {
                Some(bitmap) => {
                    chunk = bitmap.find_clear(self.region.bitmap(), chunk)?;
                    (bitmap.chunk_start(chunk), bitmap.chunk_end(chunk))
                }
                // Without a bitmap, the whole payload area is one chunk.
                None if chunk == 0 => (0, usize::MAX),
                None => return None,
            };

            // Skip the blocks that end before this chunk starts.
            loop {
                let header = self.region.header(cursor);
                if cursor.saturating_add(header.size) > chunk_start {
                    break;
                }
                cursor = self.successor(&header, cursor)?;
            }

            // Walk the blocks that start within this chunk.
            while cursor < chunk_end {
                let header = self.region.header(cursor);
                if header.is(Status::Free)
                    && header.size >= required
                    && self.next_link_ok(cursor, &header)
                {
                    log::trace!("find_fit({required}): block {cursor:#x} in chunk {chunk}");
                    return Some(cursor);
                }
                cursor = self.successor(&header, cursor)?;
            }

            chunk = match self.bitmap {
                Some(bitmap) => bitmap.chunk_of(cursor).max(chunk + 1),
                None => 1,
            };
        }
    }

    /// Shrink block `off` to `required` bytes, if the remainder is large
    /// enough to be a block of its own. The remainder becomes a free block,
    /// merged with its successor if that is free too.
    pub(super) fn split(&mut self, off: usize, required: usize) {
        let mut header = self.region.header(off);
        debug_assert!(required <= header.size);
        if header.size - required < HEADER_SIZE + self.alignment {
            return;
        }

        let rest = off + required;
        let rest_header = Header::new(header.size - required, Some(off), header.next, Status::Free);
        if let Some(next) = header.next {
            let mut next_header = self.region.header(next);
            next_header.prev = Some(rest);
            self.region.set_header(next, &next_header);
        }
        header.size = required;
        header.next = Some(rest);
        self.region.set_header(off, &header);
        self.region.set_header(rest, &rest_header);
        log::trace!(
            "split block {off:#x}: kept {required} bytes, {} bytes free at {rest:#x}",
            rest_header.size
        );

        if let Some(next) = rest_header.next {
            if self.region.header(next).is(Status::Free) {
                self.absorb_next(rest);
            }
        }

        let rest_size = self.region.header(rest).size;
        self.clear_bits(rest, rest + rest_size);
    }

    /// Merge block `off`'s successor into it. The successor must be free.
    /// Returns `false`, changing nothing, if either block's links are broken.
    pub(super) fn absorb_next(&mut self, off: usize) -> bool {
        let mut header = self.region.header(off);
        let Some(next) = header.next else {
            return false;
        };
        if !self.next_link_ok(off, &header) {
            log::warn!("block {off:#x}: not coalescing across a broken next link");
            return false;
        }
        let next_header = self.region.header(next);
        debug_assert!(next_header.is(Status::Free));
        if !self.next_link_ok(next, &next_header) {
            log::warn!("block {next:#x}: not coalescing across a broken next link");
            return false;
        }

        header.size += next_header.size;
        header.next = next_header.next;
        if let Some(after) = next_header.next {
            let mut after_header = self.region.header(after);
            after_header.prev = Some(off);
            self.region.set_header(after, &after_header);
        }
        self.region.set_header(off, &header);
        log::trace!("coalesced block {next:#x} into {off:#x}");
        true
    }

    /// Merge the newly freed block `off` with its free neighbours, and make
    /// sure the bitmap exposes the whole merged span. Returns the offset of
    /// the merged block.
    pub(super) fn coalesce(&mut self, off: usize) -> usize {
        let header = self.region.header(off);
        debug_assert!(header.is(Status::Free));

        if let Some(next) = header.next.filter(|_| self.next_link_ok(off, &header)) {
            if self.region.header(next).is(Status::Free) {
                self.absorb_next(off);
            }
        }

        let mut merged = off;
        if let Some(prev) = header.prev.filter(|_| self.prev_link_ok(off, &header)) {
            if self.region.header(prev).is(Status::Free) && self.absorb_next(prev) {
                merged = prev;
            }
        }

        let size = self.region.header(merged).size;
        self.clear_bits(merged, merged + size);
        merged
    }

    /// Map a caller's pointer to its allocated block.
    pub(super) fn lookup(&self, ptr: core::ptr::NonNull<u8>) -> Result<(usize, Header), ArenaError> {
        let off = self
            .region
            .block_offset_of(ptr, self.alignment)
            .ok_or(ArenaError::InvalidPointer)?;
        let header = self.region.header(off);

        // A free or binned tag, or a scribbled one, means the caller no
        // longer owns this block.
        if !header.is(Status::Allocated) {
            return Err(ArenaError::DoubleRelease);
        }

        // A pointer into the middle of a payload can land on bytes that look
        // like a header, so check that both neighbours agree the block is
        // there.
        let linked = header.size >= HEADER_SIZE + self.alignment
            && self.next_link_ok(off, &header)
            && self.prev_link_ok(off, &header)
            && header
                .next
                .map_or(true, |next| self.region.header(next).prev == Some(off));
        if !linked {
            return Err(ArenaError::InvalidPointer);
        }

        Ok((off, header))
    }

    /// Iterate over every block in the ledger, in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            arena: self,
            next: Some(0),
        }
    }

    /// Check every ledger, bitmap, and bin invariant.
    pub fn validate(&self) -> Result<(), Corruption> {
        let mut first = None;
        self.audit(|event| {
            if let AuditEvent::Violation(c) = event {
                first.get_or_insert(c);
            }
        });
        match first {
            Some(c) => Err(c),
            None => Ok(()),
        }
    }

    /// Render every block and every detected invariant violation, one per
    /// line.
    pub fn dump_state(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "arena: payload {} bytes, alignment {}, bitmap {}, bins {}",
            self.region.payload_len(),
            self.alignment,
            match self.bitmap {
                Some(b) => b.chunk_count(),
                None => 0,
            },
            self.bins.is_some(),
        );
        self.audit(|event| match event {
            AuditEvent::Block(block) => {
                let status = match block.status {
                    Some(s) => alloc::format!("{s:?}"),
                    None => String::from("?"),
                };
                let _ = writeln!(
                    out,
                    "  {:#010x} size={:<8} status={:<9} tag={:#010x} prev={} next={}",
                    block.offset,
                    block.size,
                    status,
                    block.tag,
                    Link(block.prev),
                    Link(block.next),
                );
            }
            AuditEvent::Violation(corruption) => {
                let _ = writeln!(out, "!! {corruption}");
            }
        });
        out
    }

    /// Walk the ledger, reporting each block and each violation found. Stops
    /// at the first block whose links cannot be followed.
    fn audit(&self, mut on: impl FnMut(AuditEvent<'_>)) {
        let payload_len = self.region.payload_len();
        let mut expected = 0;
        let mut prev = None;
        let mut prev_free = false;
        let mut binned = 0;

        loop {
            if expected + HEADER_SIZE > payload_len {
                on(AuditEvent::Violation(Corruption::Truncated { offset: expected }));
                return;
            }
            let header = self.region.header(expected);
            let block = BlockInfo::new(expected, &header);
            on(AuditEvent::Block(&block));
            let off = expected;

            if header.prev != prev {
                on(AuditEvent::Violation(Corruption::BrokenLink { offset: off }));
            }
            let status = match header.status {
                Some(status) if header.is(status) => Some(status),
                _ => {
                    on(AuditEvent::Violation(Corruption::BadTag { offset: off, tag: header.tag }));
                    None
                }
            };
            if header.size < HEADER_SIZE + self.alignment
                || header.size % self.alignment != 0
                || header.size > payload_len - off
            {
                on(AuditEvent::Violation(Corruption::BadSize {
                    offset: off,
                    size: header.size,
                }));
                return;
            }

            let free = status == Some(Status::Free);
            if free && prev_free {
                on(AuditEvent::Violation(Corruption::AdjacentFree { offset: off }));
            }
            if free {
                if let Some(bitmap) = self.bitmap {
                    let bits = self.region.bitmap();
                    let last = bitmap.chunk_of(block.end() - 1);
                    for chunk in bitmap.chunk_of(off)..=last {
                        if bitmap.is_set(bits, chunk) {
                            on(AuditEvent::Violation(Corruption::StaleBitmap { offset: off, chunk }));
                        }
                    }
                }
            }
            if status == Some(Status::Binned) {
                binned += 1;
                if self.bins.is_none() {
                    on(AuditEvent::Violation(Corruption::BadBin { offset: off }));
                }
            }

            let end = block.end();
            match header.next {
                None if end == payload_len => break,
                None => {
                    on(AuditEvent::Violation(Corruption::Truncated { offset: end }));
                    return;
                }
                Some(next) if next != end => {
                    on(AuditEvent::Violation(Corruption::BrokenLink { offset: off }));
                    return;
                }
                Some(_) => {}
            }

            prev = Some(off);
            prev_free = free;
            expected = end;
        }

        if let Some(bins) = &self.bins {
            bins.audit(&self.region, binned, &mut |c| {
                on(AuditEvent::Violation(c))
            });
        }
    }
}

enum AuditEvent<'a> {
    Block(&'a BlockInfo),
    Violation(Corruption),
}

/// Iterator over the ledger, returned by [`Arena::blocks`].
///
/// Stops early, rather than looping, if it meets a `next` link that does not
/// name the following block.
pub struct Blocks<'a> {
    arena: &'a Arena,
    next: Option<usize>,
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<BlockInfo> {
        let off = self.next.take()?;
        if off + HEADER_SIZE > self.arena.region.payload_len() {
            return None;
        }
        let header = self.arena.region.header(off);
        self.next = self.arena.successor(&header, off);
        Some(BlockInfo::new(off, &header))
    }
}

/// An invariant violation found by [`Arena::validate`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Corruption {
    /// A block's `prev` or `next` link does not name its physical neighbour.
    BrokenLink {
        /// The block whose links are wrong.
        offset: usize,
    },

    /// A block's tag does not match its status, or its status is garbage.
    BadTag {
        /// The block.
        offset: usize,
        /// The tag found.
        tag: u32,
    },

    /// A block's size is misaligned, too small, or runs past the payload
    /// area.
    BadSize {
        /// The block.
        offset: usize,
        /// The size found.
        size: usize,
    },

    /// The ledger does not reach the end of the payload area.
    Truncated {
        /// Where the ledger stops.
        offset: usize,
    },

    /// Two adjacent blocks are both free.
    AdjacentFree {
        /// The second of the two blocks.
        offset: usize,
    },

    /// A free block overlaps a chunk marked fully occupied.
    StaleBitmap {
        /// The free block.
        offset: usize,
        /// The chunk whose bit is set.
        chunk: usize,
    },

    /// A binned block is missing from its bin, or a bin holds something
    /// other than a binned block.
    BadBin {
        /// The block.
        offset: usize,
    },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Corruption::BrokenLink { offset } => {
                write!(f, "block {offset:#x}: links do not match its neighbours")
            }
            Corruption::BadTag { offset, tag } => {
                write!(f, "block {offset:#x}: tag {tag:#010x} does not match status")
            }
            Corruption::BadSize { offset, size } => {
                write!(f, "block {offset:#x}: invalid size {size}")
            }
            Corruption::Truncated { offset } => {
                write!(f, "ledger ends at {offset:#x}, before the end of the payload area")
            }
            Corruption::AdjacentFree { offset } => {
                write!(f, "block {offset:#x}: free and follows another free block")
            }
            Corruption::StaleBitmap { offset, chunk } => {
                write!(f, "block {offset:#x}: free but chunk {chunk} is marked occupied")
            }
            Corruption::BadBin { offset } => {
                write!(f, "block {offset:#x}: bin membership does not match status")
            }
        }
    }
}

impl core::error::Error for Corruption {}

struct Link(Option<usize>);

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(off) => write!(f, "{off:#x}"),
            None => f.write_str("-"),
        }
    }
}
