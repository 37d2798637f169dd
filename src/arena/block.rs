//! Block headers as they are laid out inside the payload area.

use crate::config::HEADER_SIZE;

/// Written into the header of every block handed out to a caller.
pub(crate) const TAG_ALLOCATED: u32 = 0xA110_CA7E;

/// Written into the header of an allocated block that is parked in a bin.
pub(crate) const TAG_BINNED: u32 = 0xB1A5_ED00;

/// The tag of a free block. Release clears the tag to this.
pub(crate) const TAG_FREE: u32 = 0;

/// Encoded in place of a missing `prev`/`next` link.
const NIL: u64 = u64::MAX;

/// Whether a block is free or allocated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    /// Available for allocation.
    Free,
    /// Handed out to a caller.
    Allocated,
    /// Released by a caller but parked in a size-class bin instead of being
    /// returned to the ledger.
    Binned,
}

impl Status {
    fn to_raw(self) -> u32 {
        match self {
            Status::Free => 0,
            Status::Allocated => 1,
            Status::Binned => 2,
        }
    }

    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Status::Free),
            1 => Some(Status::Allocated),
            2 => Some(Status::Binned),
            _ => None,
        }
    }

    /// The tag a healthy block with this status carries.
    pub(crate) fn expected_tag(self) -> u32 {
        match self {
            Status::Free => TAG_FREE,
            Status::Allocated => TAG_ALLOCATED,
            Status::Binned => TAG_BINNED,
        }
    }
}

/// A decoded block header.
///
/// Blocks are named by their byte offset from the start of the payload area;
/// `prev` and `next` are the offsets of the physically adjacent blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    /// Header plus payload, in bytes.
    pub(crate) size: usize,
    pub(crate) prev: Option<usize>,
    pub(crate) next: Option<usize>,
    pub(crate) tag: u32,
    /// `None` if the status word holds garbage.
    pub(crate) status: Option<Status>,
}

impl Header {
    pub(crate) fn new(size: usize, prev: Option<usize>, next: Option<usize>, status: Status) -> Self {
        Header {
            size,
            prev,
            next,
            tag: status.expected_tag(),
            status: Some(status),
        }
    }

    /// Change this header's status, rewriting its tag to match.
    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = Some(status);
        self.tag = status.expected_tag();
    }

    /// Is this a healthy block with the given status?
    pub(crate) fn is(&self, status: Status) -> bool {
        self.status == Some(status) && self.tag == status.expected_tag()
    }

    pub(crate) fn payload_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }

    pub(crate) fn encode(&self) -> [u8; HEADER_SIZE] {
        fn link(l: Option<usize>) -> u64 {
            l.map_or(NIL, |off| off as u64)
        }

        let mut bytes = [0; HEADER_SIZE];
        bytes[0..8].copy_from_slice(&(self.size as u64).to_le_bytes());
        bytes[8..16].copy_from_slice(&link(self.prev).to_le_bytes());
        bytes[16..24].copy_from_slice(&link(self.next).to_le_bytes());
        bytes[24..28].copy_from_slice(&self.tag.to_le_bytes());
        let status = self.status.map_or(u32::MAX, Status::to_raw);
        bytes[28..32].copy_from_slice(&status.to_le_bytes());
        bytes
    }

    pub(crate) fn decode(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |i: usize| {
            let mut w = [0; 8];
            w.copy_from_slice(&bytes[i..i + 8]);
            u64::from_le_bytes(w)
        };
        let half = |i: usize| {
            let mut h = [0; 4];
            h.copy_from_slice(&bytes[i..i + 4]);
            u32::from_le_bytes(h)
        };
        let link = |raw: u64| {
            if raw == NIL {
                None
            } else {
                usize::try_from(raw).ok()
            }
        };

        Header {
            size: usize::try_from(word(0)).unwrap_or(usize::MAX),
            prev: link(word(8)),
            next: link(word(16)),
            tag: half(24),
            status: Status::from_raw(half(28)),
        }
    }
}

/// A read-only view of one block in the ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the block header from the start of the payload area.
    pub offset: usize,
    /// Header plus payload, in bytes.
    pub size: usize,
    /// The block's status, or `None` if its header is corrupt.
    pub status: Option<Status>,
    /// The raw tag word.
    pub tag: u32,
    /// Offset of the physically preceding block.
    pub prev: Option<usize>,
    /// Offset of the physically following block.
    pub next: Option<usize>,
}

impl BlockInfo {
    pub(crate) fn new(offset: usize, header: &Header) -> Self {
        BlockInfo {
            offset,
            size: header.size,
            status: header.status,
            tag: header.tag,
            prev: header.prev,
            next: header.next,
        }
    }

    /// Bytes available to the caller.
    #[inline]
    pub fn payload_size(&self) -> usize {
        self.size.saturating_sub(HEADER_SIZE)
    }

    /// Offset one past the last byte of this block.
    #[inline]
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }

    /// Is this block free?
    #[inline]
    pub fn is_free(&self) -> bool {
        self.status == Some(Status::Free)
    }
}
