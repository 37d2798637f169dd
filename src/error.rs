use core::fmt;

/// Why an arena operation did not succeed.
///
/// None of these are fatal: the arena is left exactly as it was before the
/// failed call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ArenaError {
    /// No free block is large enough for the request.
    OutOfMemory,

    /// The pointer does not name the payload of any block in this arena, or
    /// the block's links disagree with its neighbours.
    InvalidPointer,

    /// The block's tag does not say it is allocated: it was already released
    /// or its tag has been overwritten.
    DoubleRelease,

    /// Size arithmetic overflowed `usize`.
    Overflow,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ArenaError::OutOfMemory => "out of memory",
            ArenaError::InvalidPointer => "pointer is not an allocation from this arena",
            ArenaError::DoubleRelease => "block is not allocated (double release or corruption)",
            ArenaError::Overflow => "requested size overflows",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for ArenaError {}
