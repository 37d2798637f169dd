//! Construction-time configuration for an [`Arena`][crate::Arena].

use core::fmt;

/// The size, in bytes, of every block header in the ledger.
///
/// Headers are `size | prev | next | tag | status`, each offset field encoded
/// as a little-endian `u64` regardless of the target's pointer width.
pub const HEADER_SIZE: usize = 32;

/// The smallest supported payload alignment.
pub const MIN_ALIGNMENT: usize = 8;

/// The largest supported payload alignment.
///
/// Alignments must divide [`HEADER_SIZE`] so that every payload that follows
/// an aligned header is itself aligned.
pub const MAX_ALIGNMENT: usize = HEADER_SIZE;

/// Configuration for an [`Arena`][crate::Arena].
///
/// All fields are fixed once the arena is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Total size of the backing region, bitmap area included.
    pub capacity: usize,

    /// The number of payload bytes covered by a single bitmap bit. Must be a
    /// power of two.
    pub chunk_size: usize,

    /// Alignment of every block and every payload handed out. Must be a power
    /// of two between [`MIN_ALIGNMENT`] and [`MAX_ALIGNMENT`].
    pub alignment: usize,

    /// Carve a chunk bitmap out of the region to accelerate first-fit
    /// searches. Without it, allocation is a plain scan of the ledger.
    pub bitmap: bool,

    /// Keep released small blocks in per-size-class bins for O(1) reuse
    /// instead of coalescing them.
    pub bins: bool,
}

impl Default for ArenaConfig {
    #[inline]
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl ArenaConfig {
    /// A configuration for a region of `capacity` bytes with default chunk
    /// size and alignment, bitmap enabled and bins disabled.
    #[inline]
    pub const fn new(capacity: usize) -> Self {
        ArenaConfig {
            capacity,
            chunk_size: 256,
            alignment: MIN_ALIGNMENT,
            bitmap: true,
            bins: false,
        }
    }

    /// Set the chunk size.
    #[inline]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Set the alignment.
    #[inline]
    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    /// Enable or disable the chunk bitmap.
    #[inline]
    pub const fn with_bitmap(mut self, bitmap: bool) -> Self {
        self.bitmap = bitmap;
        self
    }

    /// Enable or disable size-classed bins.
    #[inline]
    pub const fn with_bins(mut self, bins: bool) -> Self {
        self.bins = bins;
        self
    }

    /// Check this configuration against its own `capacity`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.carve(self.capacity).map(|_| ())
    }

    /// Compute how a region of `capacity` bytes is split between the bitmap
    /// area and the payload area.
    pub(crate) fn carve(&self, capacity: usize) -> Result<Carving, ConfigError> {
        if !self.chunk_size.is_power_of_two() {
            return Err(ConfigError::ChunkSizeNotPowerOfTwo {
                chunk_size: self.chunk_size,
            });
        }
        if !self.alignment.is_power_of_two()
            || self.alignment < MIN_ALIGNMENT
            || self.alignment > MAX_ALIGNMENT
        {
            return Err(ConfigError::BadAlignment {
                alignment: self.alignment,
            });
        }

        let (chunk_count, bitmap_len) = if self.bitmap {
            let chunk_count = capacity.div_ceil(self.chunk_size);
            let bitmap_len = align_up(chunk_count.div_ceil(8), self.alignment)
                .ok_or(ConfigError::CapacityOverflow)?;
            (chunk_count, bitmap_len)
        } else {
            (0, 0)
        };

        let required = bitmap_len
            .checked_add(HEADER_SIZE)
            .and_then(|n| n.checked_add(self.alignment))
            .ok_or(ConfigError::CapacityOverflow)?;
        if capacity <= required {
            return Err(ConfigError::CapacityTooSmall { capacity, required });
        }

        let payload_len = align_down(capacity - bitmap_len, self.alignment);
        debug_assert!(payload_len >= HEADER_SIZE + self.alignment);

        Ok(Carving {
            chunk_count,
            bitmap_len,
            payload_len,
        })
    }
}

/// How a backing region is carved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Carving {
    pub(crate) chunk_count: usize,
    pub(crate) bitmap_len: usize,
    pub(crate) payload_len: usize,
}

/// An invalid [`ArenaConfig`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The chunk size is not a power of two.
    ChunkSizeNotPowerOfTwo {
        /// The offending chunk size.
        chunk_size: usize,
    },

    /// The alignment is not a power of two in the supported range.
    BadAlignment {
        /// The offending alignment.
        alignment: usize,
    },

    /// The region cannot hold its bitmap plus one minimal block.
    CapacityTooSmall {
        /// The capacity that was given.
        capacity: usize,
        /// The capacity must be strictly greater than this.
        required: usize,
    },

    /// Bookkeeping sizes overflow `usize`.
    CapacityOverflow,

    /// The global allocator could not provide the backing region.
    RegionUnavailable {
        /// The capacity that was requested.
        capacity: usize,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ChunkSizeNotPowerOfTwo { chunk_size } => {
                write!(f, "chunk size {chunk_size} is not a power of two")
            }
            ConfigError::BadAlignment { alignment } => write!(
                f,
                "alignment {alignment} must be a power of two between \
                 {MIN_ALIGNMENT} and {MAX_ALIGNMENT}"
            ),
            ConfigError::CapacityTooSmall { capacity, required } => write!(
                f,
                "capacity of {capacity} bytes cannot hold the arena's own bookkeeping \
                 (must exceed {required} bytes)"
            ),
            ConfigError::CapacityOverflow => write!(f, "arena capacity overflows usize"),
            ConfigError::RegionUnavailable { capacity } => {
                write!(f, "failed to obtain a backing region of {capacity} bytes")
            }
        }
    }
}

impl core::error::Error for ConfigError {}

/// Round `n` up to a multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn align_up(n: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    Some(n.checked_add(align - 1)? & !(align - 1))
}

/// Round `n` down to a multiple of `align`, which must be a power of two.
#[inline]
pub(crate) fn align_down(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}
