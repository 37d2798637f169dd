#![no_main]

use fixed_arena::ArenaConfig;
use fixed_arena_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

const ARENA_CAPACITY: usize = 1 << 16; // 64KiB

/// Every input runs against each combination of the plain ledger scan, the
/// chunk bitmap, and the size-class bins.
const CONFIGS: [ArenaConfig; 4] = [
    ArenaConfig::new(ARENA_CAPACITY),
    ArenaConfig::new(ARENA_CAPACITY).with_bitmap(false),
    ArenaConfig::new(ARENA_CAPACITY).with_bins(true),
    ArenaConfig::new(ARENA_CAPACITY)
        .with_bitmap(false)
        .with_bins(true),
];

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    // Decode the ops from the data, or use the default ops if that fails.
    let mut ops = bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .map_or_else(|_decode_err| Ops::default(), |(ops, _)| ops);

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);

    if session.mutate(&mut ops).is_ok() {
        // Re-encode the mutated ops back into `data`, dropping ops off the
        // end until they fit.
        loop {
            if let Ok(new_size) = bincode::encode_into_slice(&ops, data, bincode_config()) {
                return new_size;
            }
            if !ops.pop() {
                break;
            }
        }
    }

    // Otherwise fall back to the fuzzer's default mutation strategies.
    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Ok((ops, _)) = bincode::decode_from_slice::<Ops, _>(data, bincode_config()) {
        for config in CONFIGS {
            if let Err(e) = ops.run_with_config(config) {
                panic!("error with {config:?}: {e}");
            }
        }
    }
});
