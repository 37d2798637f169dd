//! Shared fuzzing and testing infrastructure for `fixed_arena`.

use fixed_arena::{Arena, ArenaConfig, ArenaError};
use mutatis::{mutators as m, DefaultMutate, Generate, Mutate};
use std::{collections::BTreeMap, ptr::NonNull};

/// The size of a test allocation, in bytes.
//
// Note: a newtype rather than a bare `usize` so that it can have its own
// default mutator with a sensible maximum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Size(pub usize);

impl DefaultMutate for Size {
    type DefaultMutate = SizeMutator;
}

/// A mutator for `Size`s with a configurable maximum.
#[derive(Debug)]
pub struct SizeMutator {
    pub max_size: usize,
}

impl Default for SizeMutator {
    fn default() -> Self {
        Self { max_size: 4096 }
    }
}

impl Mutate<Size> for SizeMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, size: &mut Size) -> mutatis::Result<()> {
        c.mutation(|ctx| {
            let max_size = if ctx.shrink() { size.0 } else { self.max_size };
            size.0 = m::range(0..=max_size).generate(ctx)?;
            Ok(())
        })?;
        Ok(())
    }
}

impl Generate<Size> for SizeMutator {
    fn generate(&mut self, context: &mut mutatis::Context) -> mutatis::Result<Size> {
        Ok(Size(m::range(0..=self.max_size).generate(context)?))
    }
}

/// A test operation.
#[derive(Clone, Debug, Mutate, bincode::Encode, bincode::Decode)]
pub enum Op {
    /// `allocate(size)`, keeping the result as `id`.
    Alloc { id: u32, size: Size },
    /// `zero_allocate(count, elem)`, keeping the result as `id`.
    ZeroAlloc { id: u32, count: Size, elem: Size },
    /// `reallocate(id, size)`; allocates if `id` is not live.
    Realloc { id: u32, size: Size },
    /// `release(id)`.
    Release { id: u32 },
    /// `release(id)` twice in a row.
    DoubleRelease { id: u32 },
    /// Release a pointer `offset` bytes into the payload of `id`.
    ReleaseInterior { id: u32, offset: u32 },
    /// Release a pointer that the arena never handed out.
    ReleaseForeign { offset: u32 },
}

impl Generate<Op> for OpMutator {
    fn generate(&mut self, ctx: &mut mutatis::Context) -> mutatis::Result<Op> {
        let choices: &[fn(&mut mutatis::Context) -> mutatis::Result<Op>] = &[
            |ctx| {
                Ok(Op::Alloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::ZeroAlloc {
                    id: ctx.rng().gen_u32(),
                    count: SizeMutator { max_size: 64 }.generate(ctx)?,
                    elem: SizeMutator { max_size: 64 }.generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Realloc {
                    id: ctx.rng().gen_u32(),
                    size: m::default::<Size>().generate(ctx)?,
                })
            },
            |ctx| {
                Ok(Op::Release {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::DoubleRelease {
                    id: ctx.rng().gen_u32(),
                })
            },
            |ctx| {
                Ok(Op::ReleaseInterior {
                    id: ctx.rng().gen_u32(),
                    offset: ctx.rng().gen_u32() % 64,
                })
            },
            |ctx| {
                Ok(Op::ReleaseForeign {
                    offset: ctx.rng().gen_u32() % FOREIGN_LEN as u32,
                })
            },
        ];

        let f = ctx.rng().choose(choices).unwrap();
        f(ctx)
    }
}

impl Op {
    fn id_mut(&mut self) -> Option<&mut u32> {
        match self {
            Op::Alloc { id, .. }
            | Op::ZeroAlloc { id, .. }
            | Op::Realloc { id, .. }
            | Op::Release { id }
            | Op::DoubleRelease { id }
            | Op::ReleaseInterior { id, .. } => Some(id),
            Op::ReleaseForeign { .. } => None,
        }
    }
}

/// A sequence of test operations to perform.
#[derive(Clone, Debug, Default, bincode::Encode, bincode::Decode)]
pub struct Ops {
    ops: Vec<Op>,
}

impl DefaultMutate for Ops {
    type DefaultMutate = OpsMutator;
}

#[derive(Default)]
pub struct OpsMutator;

impl Mutate<Ops> for OpsMutator {
    fn mutate(&mut self, c: &mut mutatis::Candidates<'_>, ops: &mut Ops) -> mutatis::Result<()> {
        // Completely random mutations on a single-element basis.
        m::default::<Vec<Op>>().mutate(c, &mut ops.ops)?;

        fn alloc_positions_and_ids(ops: &Ops) -> impl Iterator<Item = (usize, u32)> + '_ {
            ops.ops.iter().enumerate().filter_map(|(i, op)| match op {
                Op::Alloc { id, .. } | Op::ZeroAlloc { id, .. } | Op::Realloc { id, .. } => {
                    Some((i, *id))
                }
                _ => None,
            })
        }

        // Retarget an operation to an existing `id`.
        c.mutation(|ctx| {
            let num_allocs = alloc_positions_and_ids(ops).count();
            if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                let (_, new_id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                let op_index = ctx.rng().gen_index(ops.ops.len()).unwrap();
                if let Some(id) = ops.ops[op_index].id_mut() {
                    *id = new_id;
                }
            }
            Ok(())
        })?;

        // Release an existing allocation, correctly or otherwise.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let f = ctx
                        .rng()
                        .choose([
                            |id| Op::Release { id },
                            |id| Op::Release { id },
                            |id| Op::DoubleRelease { id },
                            |id| Op::ReleaseInterior { id, offset: 8 },
                        ])
                        .unwrap();
                    let release_op = f(id);
                    let release_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(release_index, release_op);
                }
                Ok(())
            })?;
        }

        // Resize an existing allocation.
        if !c.shrink() {
            c.mutation(|ctx| {
                let num_allocs = alloc_positions_and_ids(ops).count();
                if let Some(alloc_index) = ctx.rng().gen_index(num_allocs) {
                    let (op_index, id) = alloc_positions_and_ids(ops).nth(alloc_index).unwrap();
                    let size = m::default::<Size>().generate(ctx)?;
                    let resize_index =
                        op_index + 1 + ctx.rng().gen_index(ops.ops.len() - op_index).unwrap();
                    ops.ops.insert(resize_index, Op::Realloc { id, size });
                }
                Ok(())
            })?;
        }

        Ok(())
    }
}

macro_rules! ensure {
    ( $cond:expr , $msg:expr $( , $args:expr )* $(,)? ) => {{
        let cond = $cond;
        if !cond {
            let msg = format!($msg $( , $args )* );
            let str_cond = stringify!($cond);
            return Err(format!("check failed: `{str_cond}`: {msg}"));
        }
    }};
}

impl Ops {
    /// Create a new `Ops` from the given test operations.
    pub fn new(ops: impl IntoIterator<Item = Op>) -> Self {
        let ops = ops.into_iter().collect();
        Ops { ops }
    }

    /// Remove the last operation, returning whether there was one.
    pub fn pop(&mut self) -> bool {
        self.ops.pop().is_some()
    }

    /// Run these test operations against a fresh arena of `capacity` bytes,
    /// with and without the chunk bitmap, and with and without bins.
    pub fn run(&self, capacity: usize) -> Result<(), String> {
        for bitmap in [true, false] {
            for bins in [false, true] {
                let config = ArenaConfig::new(capacity)
                    .with_bitmap(bitmap)
                    .with_bins(bins);
                self.run_with_config(config)?;
            }
        }
        Ok(())
    }

    /// Run these test operations against a fresh arena built from `config`.
    pub fn run_with_config(&self, config: ArenaConfig) -> Result<(), String> {
        log::debug!("========== Running test operations with {config:?} ==========");

        let mut arena = Arena::try_create(config).map_err(|e| e.to_string())?;
        let mut live = LiveMap::default();
        let mut foreign = [FREE_POISON_PATTERN; FOREIGN_LEN];

        // Check every ledger invariant and every live allocation's contents.
        let check_arena = |arena: &Arena, live: &LiveMap| -> Result<(), String> {
            if let Err(e) = arena.validate() {
                return Err(format!("invariant violated: {e}\n{}", arena.dump_state()));
            }

            let mut expected = 0;
            for block in arena.blocks() {
                ensure!(block.offset == expected, "gap or overlap at {expected:#x}");
                expected = block.end();
            }
            ensure!(
                expected == arena.payload_capacity(),
                "ledger does not cover the payload area",
            );

            ensure!(
                arena.stats().allocated_blocks == live.map.len(),
                "arena and model disagree on the number of live allocations",
            );
            for (id, alloc) in &live.map {
                let Some(bytes) = arena.payload(alloc.ptr) else {
                    return Err(format!("live allocation id{id} not recognized: {alloc:?}"));
                };
                ensure!(bytes.len() >= alloc.size, "id{id} shrank behind our back");
                ensure!(
                    bytes[..alloc.size].iter().all(|b| *b == alloc.fill),
                    "contents of id{id} changed",
                );
            }
            Ok(())
        };

        // Check a new allocation against the live set, then fill it.
        let new_alloc = |arena: &mut Arena,
                         live: &mut LiveMap,
                         id: u32,
                         ptr: NonNull<u8>,
                         size: usize,
                         zeroed: bool|
         -> Result<(), String> {
            log::debug!("new allocation: id{id} -> {{ address: {ptr:p}, size: {size} }}");

            ensure!(
                ptr.as_ptr() as usize % arena.alignment() == 0,
                "allocation is misaligned",
            );
            let Some(payload) = arena.payload_mut(ptr) else {
                return Err(format!("new allocation id{id} not recognized"));
            };
            ensure!(payload.len() >= size, "allocation is smaller than requested");
            if zeroed {
                ensure!(
                    payload.iter().all(|b| *b == 0),
                    "supposedly zeroed block of memory contains non-zero byte",
                );
            }

            let start = ptr.as_ptr() as usize;
            let end = start + payload.len();
            for (other_id, other) in &live.map {
                let other_start = other.ptr.as_ptr() as usize;
                ensure!(
                    end <= other_start || other_start + other.size <= start,
                    "id{id} overlaps live allocation id{other_id}",
                );
            }

            let fill = if zeroed { 0 } else { pattern(id) };
            payload[..size].fill(fill);
            live.map.insert(id, LiveAlloc { ptr, size, fill });
            Ok(())
        };

        // Interpret each op and check that our invariants are upheld and
        // properties are maintained as we go!
        for op in &self.ops {
            log::debug!("Running {op:?}");

            match *op {
                Op::Alloc { id, size } => {
                    if let Some(old) = live.map.remove(&id) {
                        arena.release(Some(old.ptr));
                    }
                    match arena.try_allocate(size.0) {
                        Ok(Some(ptr)) => new_alloc(&mut arena, &mut live, id, ptr, size.0, false)?,
                        Ok(None) => ensure!(size.0 == 0, "non-zero allocation returned nothing"),
                        Err(e) => ensure!(is_exhaustion(e), "unexpected allocation failure: {e}"),
                    }
                }

                Op::ZeroAlloc { id, count, elem } => {
                    if let Some(old) = live.map.remove(&id) {
                        arena.release(Some(old.ptr));
                    }
                    if let Some(ptr) = arena.zero_allocate(count.0, elem.0) {
                        new_alloc(&mut arena, &mut live, id, ptr, count.0 * elem.0, true)?;
                    }
                }

                Op::Realloc { id, size } => match live.map.remove(&id) {
                    None => {
                        if let Some(ptr) = arena.reallocate(None, size.0) {
                            new_alloc(&mut arena, &mut live, id, ptr, size.0, false)?;
                        }
                    }
                    Some(old) => match arena.try_reallocate(Some(old.ptr), size.0) {
                        Ok(Some(ptr)) => {
                            let kept = old.size.min(size.0);
                            let Some(payload) = arena.payload_mut(ptr) else {
                                return Err(format!("reallocated id{id} not recognized"));
                            };
                            ensure!(
                                payload[..kept].iter().all(|b| *b == old.fill),
                                "original allocation's bytes not preserved by reallocate",
                            );
                            payload[..size.0].fill(old.fill);
                            live.map.insert(
                                id,
                                LiveAlloc {
                                    ptr,
                                    size: size.0,
                                    fill: old.fill,
                                },
                            );
                        }
                        Ok(None) => ensure!(size.0 == 0, "reallocate returned nothing"),
                        Err(e) => {
                            ensure!(is_exhaustion(e), "unexpected reallocation failure: {e}");
                            live.map.insert(id, old);
                        }
                    },
                },

                Op::Release { id } => {
                    if let Some(alloc) = live.map.remove(&id) {
                        ensure!(
                            arena.try_release(Some(alloc.ptr)).is_ok(),
                            "releasing live allocation id{id} failed",
                        );
                    }
                }

                Op::DoubleRelease { id } => {
                    if let Some(alloc) = live.map.remove(&id) {
                        arena.release(Some(alloc.ptr));
                        let before = arena.dump_state();
                        ensure!(
                            arena.try_release(Some(alloc.ptr)) == Err(ArenaError::DoubleRelease),
                            "second release of id{id} was not rejected",
                        );
                        ensure!(arena.dump_state() == before, "second release changed the ledger");
                    }
                }

                Op::ReleaseInterior { id, offset } => {
                    if let Some(alloc) = live.map.get(&id) {
                        if offset != 0 && (offset as usize) < alloc.size {
                            let before = arena.dump_state();
                            let interior = alloc.ptr.as_ptr().wrapping_add(offset as usize);
                            arena.release(NonNull::new(interior));
                            ensure!(
                                arena.dump_state() == before,
                                "interior release of id{id} changed the ledger",
                            );
                        }
                    }
                }

                Op::ReleaseForeign { offset } => {
                    let before = arena.dump_state();
                    let ptr = foreign.as_mut_ptr().wrapping_add(offset as usize % FOREIGN_LEN);
                    ensure!(
                        arena.try_release(NonNull::new(ptr)) == Err(ArenaError::InvalidPointer),
                        "foreign pointer was not rejected",
                    );
                    ensure!(arena.dump_state() == before, "foreign release changed the ledger");
                }
            }

            check_arena(&arena, &live)?;
        }

        ensure!(
            foreign.iter().all(|b| *b == FREE_POISON_PATTERN),
            "arena wrote through a foreign pointer",
        );

        // Finally, release any remaining live allocations: the arena must be
        // back to a single free block.
        for (_, alloc) in std::mem::take(&mut live.map) {
            arena.release(Some(alloc.ptr));
        }
        arena.reclaim_bins();
        check_arena(&arena, &live)?;
        let stats = arena.stats();
        ensure!(
            stats.free_blocks == 1 && stats.free_bytes == arena.payload_capacity(),
            "arena not empty after releasing everything:\n{}",
            arena.dump_state(),
        );

        Ok(())
    }
}

/// Did the request fail only because it could not fit?
fn is_exhaustion(e: ArenaError) -> bool {
    matches!(e, ArenaError::OutOfMemory | ArenaError::Overflow)
}

/// The byte pattern a non-zeroed allocation is filled with. Never zero, so
/// that a stale zero-fill is caught.
fn pattern(id: u32) -> u8 {
    (id % 255) as u8 + 1
}

const FREE_POISON_PATTERN: u8 = 0xFF;

/// Length of the out-of-arena buffer that foreign pointers point into.
const FOREIGN_LEN: usize = 256;

/// A currently-live allocation.
struct LiveAlloc {
    ptr: NonNull<u8>,
    /// Requested size; the arena may have handed out more.
    size: usize,
    /// Every one of the first `size` bytes holds this value.
    fill: u8,
}

impl std::fmt::Debug for LiveAlloc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let LiveAlloc { ptr, size, fill } = self;
        f.debug_struct("LiveAlloc")
            .field("ptr", &format!("{ptr:p}"))
            .field("size", &size)
            .field("fill", &fill)
            .finish()
    }
}

/// The set of currently-live allocations, keyed by ID.
#[derive(Default)]
struct LiveMap {
    map: BTreeMap<u32, LiveAlloc>,
}
