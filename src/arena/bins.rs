//! Size-classed bins.
//!
//! Each bin is a singly linked list of released blocks whose payload can hold
//! that bin's size class. The link to the next block is stored in the first
//! word of the binned block's payload. Binned blocks stay in the ledger with
//! status `Binned`, so they are never coalesced until they are reclaimed.

use super::block::Status;
use super::ledger::Corruption;
use super::region::Region;
use crate::config::{align_up, HEADER_SIZE};

/// Payload sizes of the bins. Anything larger is served by the ledger.
pub(crate) const SIZE_CLASSES: [usize; 7] = [16, 32, 64, 128, 256, 512, 1024];

const NUM_CLASSES: usize = SIZE_CLASSES.len();

/// End-of-list marker stored in a payload link word.
const NIL: usize = usize::MAX;

/// The payload size of class `class`, rounded to `alignment`.
#[inline]
fn class_size(class: usize, alignment: usize) -> usize {
    // Class sizes and alignments are small powers of two.
    align_up(SIZE_CLASSES[class], alignment).unwrap_or(usize::MAX)
}

/// The smallest class able to serve a request for `payload` bytes, with that
/// class's payload size.
pub(crate) fn class_for_request(payload: usize, alignment: usize) -> Option<(usize, usize)> {
    (0..NUM_CLASSES)
        .map(|class| (class, class_size(class, alignment)))
        .find(|&(_, size)| payload <= size)
}

/// The largest class a released block with `payload` bytes can serve, if the
/// block is small enough to be binned at all.
pub(crate) fn class_for_block(payload: usize, alignment: usize) -> Option<usize> {
    if payload > class_size(NUM_CLASSES - 1, alignment) {
        return None;
    }
    (0..NUM_CLASSES)
        .rev()
        .find(|&class| class_size(class, alignment) <= payload)
}

#[derive(Clone, Debug)]
pub(crate) struct Bins {
    heads: [Option<usize>; NUM_CLASSES],
    lens: [usize; NUM_CLASSES],
    alignment: usize,
}

impl Bins {
    pub(crate) fn new(alignment: usize) -> Self {
        Bins {
            heads: [None; NUM_CLASSES],
            lens: [0; NUM_CLASSES],
            alignment,
        }
    }

    /// Could `off` be a binned block of class `class`?
    fn is_member(&self, region: &Region, class: usize, off: usize) -> bool {
        off % self.alignment == 0
            && off.saturating_add(HEADER_SIZE + 8) <= region.payload_len()
            && {
                let header = region.header(off);
                header.is(Status::Binned)
                    && header.payload_size() >= class_size(class, self.alignment)
            }
    }

    /// Number of blocks held across all bins.
    pub(crate) fn len(&self) -> usize {
        self.lens.iter().sum()
    }

    pub(crate) fn push(&mut self, region: &mut Region, class: usize, off: usize) {
        region.set_payload_word(off, self.heads[class].unwrap_or(NIL));
        self.heads[class] = Some(off);
        self.lens[class] += 1;
        log::trace!("bin {}: pushed block {off:#x}", SIZE_CLASSES[class]);
    }

    pub(crate) fn pop(&mut self, region: &Region, class: usize) -> Option<usize> {
        let off = self.heads[class]?;
        let next = region.payload_word(off);
        self.lens[class] -= 1;
        self.heads[class] = if next == NIL {
            None
        } else if self.is_member(region, class, next) {
            Some(next)
        } else {
            // The link was overwritten after release; the rest of this bin is
            // lost to it until `validate` reports it.
            log::warn!("bin {}: corrupt link {next:#x} in block {off:#x}", SIZE_CLASSES[class]);
            self.lens[class] = 0;
            None
        };
        log::trace!("bin {}: popped block {off:#x}", SIZE_CLASSES[class]);
        Some(off)
    }

    /// Check that every bin holds exactly `binned` blocks in total, each one
    /// a healthy binned block large enough for its class.
    pub(crate) fn audit(&self, region: &Region, binned: usize, on_violation: &mut dyn FnMut(Corruption)) {
        for class in 0..NUM_CLASSES {
            let mut cursor = self.heads[class];
            let mut seen = 0;
            while let Some(off) = cursor {
                if seen == self.lens[class] || !self.is_member(region, class, off) {
                    on_violation(Corruption::BadBin { offset: off });
                    break;
                }
                seen += 1;
                let next = region.payload_word(off);
                cursor = (next != NIL).then_some(next);
            }
            if cursor.is_none() && seen != self.lens[class] {
                on_violation(Corruption::BadBin { offset: NIL });
            }
        }

        if self.len() != binned {
            on_violation(Corruption::BadBin { offset: NIL });
        }
    }
}
