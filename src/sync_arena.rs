//! A thread-safe wrapper around [`Arena`].
//!
//! Every call takes one coarse lock for its whole duration and then runs the
//! single-threaded arena code underneath it. Helpers never call back into the
//! locked methods, so the lock is never re-entered.

use super::*;
use core::{alloc::Layout, ptr::NonNull};

mod mutex;
pub use mutex::{Lock, SingleThreadedLock, SpinLock};
use mutex::Mutex;

/// An [`Arena`] behind a lock of type `L`.
///
/// This type also implements the [`Allocator`] trait, so collections can be
/// built directly on top of an arena. Layouts with an alignment larger than
/// the arena's are refused.
pub struct SyncArena<L>
where
    L: Lock,
{
    arena: Mutex<Arena, L>,
}

impl<L> SyncArena<L>
where
    L: Lock,
{
    /// Wrap an existing arena.
    #[inline]
    pub const fn new(arena: Arena, lock: L) -> Self {
        SyncArena {
            arena: Mutex::new(arena, lock),
        }
    }

    /// Create an arena per `config` and wrap it.
    pub fn try_create(config: ArenaConfig, lock: L) -> Result<Self, ConfigError> {
        Ok(Self::new(Arena::try_create(config)?, lock))
    }

    /// Take the arena back out.
    #[inline]
    pub fn into_inner(self) -> Arena {
        self.arena.into_inner()
    }

    /// Get an exclusive reference to the arena without locking.
    #[inline]
    pub fn get_mut(&mut self) -> &mut Arena {
        self.arena.get_mut()
    }

    /// Run `f` with the lock held.
    ///
    /// `f` must not call back into this `SyncArena`.
    pub fn with_arena<R>(&self, f: impl FnOnce(&mut Arena) -> R) -> R {
        let mut arena = self.arena.lock();
        f(&mut arena)
    }

    /// See [`Arena::allocate`].
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.arena.lock().allocate(size)
    }

    /// See [`Arena::zero_allocate`].
    #[inline]
    pub fn zero_allocate(&self, count: usize, elem_size: usize) -> Option<NonNull<u8>> {
        self.arena.lock().zero_allocate(count, elem_size)
    }

    /// See [`Arena::reallocate`].
    #[inline]
    pub fn reallocate(&self, ptr: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        self.arena.lock().reallocate(ptr, new_size)
    }

    /// See [`Arena::release`].
    #[inline]
    pub fn release(&self, ptr: Option<NonNull<u8>>) {
        self.arena.lock().release(ptr);
    }

    /// See [`Arena::reclaim_bins`].
    #[inline]
    pub fn reclaim_bins(&self) {
        self.arena.lock().reclaim_bins();
    }

    /// See [`Arena::stats`].
    #[inline]
    pub fn stats(&self) -> ArenaStats {
        self.arena.lock().stats()
    }

    /// See [`Arena::validate`].
    #[inline]
    pub fn validate(&self) -> Result<(), Corruption> {
        self.arena.lock().validate()
    }

    /// See [`Arena::dump_state`].
    #[inline]
    pub fn dump_state(&self) -> alloc::string::String {
        self.arena.lock().dump_state()
    }

    /// A well-aligned, non-null pointer for zero-sized allocations. It is
    /// never dereferenced and never passed to the arena.
    fn dangling(layout: Layout) -> NonNull<[u8]> {
        let ptr = NonNull::new(layout.align() as *mut u8).unwrap_or(NonNull::dangling());
        NonNull::slice_from_raw_parts(ptr, 0)
    }

    fn resize(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
        zeroed: bool,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let mut arena = self.arena.lock();
        if new_layout.align() > arena.alignment() {
            return Err(AllocError);
        }

        let new_ptr = if old_layout.size() == 0 {
            arena.allocate(new_layout.size())
        } else {
            arena.reallocate(Some(ptr), new_layout.size())
        }
        .ok_or(AllocError)?;

        let payload = arena.payload_mut(new_ptr).ok_or(AllocError)?;
        if zeroed {
            payload[old_layout.size()..].fill(0);
        }
        let len = payload.len();
        Ok(NonNull::slice_from_raw_parts(new_ptr, len))
    }
}

impl<L> core::fmt::Debug for SyncArena<L>
where
    L: Lock,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncArena").finish_non_exhaustive()
    }
}

unsafe impl<L> Allocator for SyncArena<L>
where
    L: Lock,
{
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(Self::dangling(layout));
        }

        let mut arena = self.arena.lock();
        if layout.align() > arena.alignment() {
            return Err(AllocError);
        }
        let ptr = arena.allocate(layout.size()).ok_or(AllocError)?;
        let len = arena.usable_size(ptr).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    fn allocate_zeroed(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(Self::dangling(layout));
        }

        let mut arena = self.arena.lock();
        if layout.align() > arena.alignment() {
            return Err(AllocError);
        }
        let ptr = arena.zero_allocate(1, layout.size()).ok_or(AllocError)?;
        let len = arena.usable_size(ptr).ok_or(AllocError)?;
        Ok(NonNull::slice_from_raw_parts(ptr, len))
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            self.arena.lock().release(Some(ptr));
        }
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.resize(ptr, old_layout, new_layout, false)
    }

    #[inline]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());
        self.resize(ptr, old_layout, new_layout, true)
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());
        if new_layout.size() == 0 {
            self.deallocate(ptr, old_layout);
            return Ok(Self::dangling(new_layout));
        }
        self.resize(ptr, old_layout, new_layout, false)
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::{sync::Arc, thread, vec::Vec};

    #[test]
    fn threads_share_one_arena() {
        let _ = env_logger::try_init();

        let config = ArenaConfig::new(1 << 16).with_bins(true);
        let arena = Arc::new(SyncArena::try_create(config, SpinLock::new()).unwrap());

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let arena = Arc::clone(&arena);
                thread::spawn(move || {
                    for i in 0..200usize {
                        let size = 8 + (i * 37 + t as usize * 11) % 300;
                        let Some(ptr) = arena.allocate(size) else {
                            continue;
                        };
                        unsafe { ptr.as_ptr().write_bytes(t, size) };
                        let ptr = arena.reallocate(Some(ptr), size * 2).unwrap_or(ptr);
                        let intact = arena.with_arena(|a| {
                            a.payload(ptr).unwrap()[..size].iter().all(|&b| b == t)
                        });
                        assert!(intact, "thread {t} saw its bytes change");
                        arena.release(Some(ptr));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        arena.validate().unwrap();
        arena.reclaim_bins();
        let stats = arena.stats();
        assert_eq!(stats.allocated_blocks, 0);
        assert_eq!(stats.binned_blocks, 0);
        assert_eq!(stats.free_blocks, 1);
    }

    #[test]
    fn allocator_api() {
        let arena = SyncArena::try_create(ArenaConfig::new(4096), SingleThreadedLock::new()).unwrap();

        let layout = Layout::from_size_align(24, 8).unwrap();
        let block = arena.allocate_zeroed(layout).unwrap();
        assert!(block.len() >= 24);
        let ptr = block.cast::<u8>();
        assert!(unsafe { block.as_ref() }.iter().all(|&b| b == 0));
        unsafe { ptr.as_ptr().write_bytes(0x5A, 24) };

        let bigger = Layout::from_size_align(200, 8).unwrap();
        let grown = unsafe { arena.grow_zeroed(ptr, layout, bigger) }.unwrap();
        let bytes = unsafe { grown.as_ref() };
        assert!(bytes[..24].iter().all(|&b| b == 0x5A));
        assert!(bytes[24..200].iter().all(|&b| b == 0));

        let smaller = Layout::from_size_align(8, 8).unwrap();
        let shrunk = unsafe { arena.shrink(grown.cast(), bigger, smaller) }.unwrap();
        assert_eq!(shrunk.cast::<u8>(), grown.cast::<u8>());
        unsafe { arena.deallocate(shrunk.cast(), smaller) };

        let zst = Layout::from_size_align(0, 8).unwrap();
        let empty = Allocator::allocate(&arena, zst).unwrap();
        assert_eq!(empty.len(), 0);
        unsafe { arena.deallocate(empty.cast(), zst) };

        let overaligned = Layout::from_size_align(16, 64).unwrap();
        assert!(Allocator::allocate(&arena, overaligned).is_err());

        arena.validate().unwrap();
        assert_eq!(arena.stats().allocated_blocks, 0);
    }
}
