#![doc = include_str!("../README.md")]
#![no_std]
#![deny(missing_docs)]
#![cfg_attr(feature = "allocator_api", feature(allocator_api))]

extern crate alloc;

use cfg_if::cfg_if;

mod arena;
mod config;
mod error;
mod sync_arena;

pub use arena::{Arena, ArenaStats, BlockInfo, Blocks, Corruption, Status};
pub use config::{ArenaConfig, ConfigError, HEADER_SIZE, MAX_ALIGNMENT, MIN_ALIGNMENT};
pub use error::ArenaError;
pub use sync_arena::{Lock, SingleThreadedLock, SpinLock, SyncArena};

cfg_if! {
    if #[cfg(feature = "allocator_api")] {
        pub use core::alloc::{AllocError, Allocator};
    } else if #[cfg(feature = "allocator_api2")] {
        pub use allocator_api2::alloc::{AllocError, Allocator};
    } else {
        compile_error!("Must enable one of the `allocator_api` or `allocator_api2` cargo features");
    }
}
