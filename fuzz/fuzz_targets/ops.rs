#![no_main]

use device_suballoc_fuzzing::Ops;
use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fn decode(data: &[u8]) -> Option<Ops> {
    bincode::decode_from_slice::<Ops, _>(data, bincode_config())
        .ok()
        .map(|(ops, _)| ops)
}

/// Encodes `ops` into `data`, dropping trailing ops until they fit. Returns
/// the encoded length, or `None` if not even an empty sequence fits.
fn encode_truncating(ops: &mut Ops, data: &mut [u8]) -> Option<usize> {
    loop {
        if let Ok(len) = bincode::encode_into_slice(&*ops, data, bincode_config()) {
            return Some(len);
        }
        if !ops.pop() {
            return None;
        }
    }
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // Leave roughly one in eight mutations to libFuzzer's byte-level mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    let mut ops = decode(&data[..size.min(data.len())]).unwrap_or_default();
    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);
    if session.mutate(&mut ops).is_ok() {
        if let Some(len) = encode_truncating(&mut ops, data) {
            return len;
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Some(ops) = decode(data) {
        if let Err(e) = ops.run() {
            panic!("error: {e}");
        }
    }
});
