/// Test data generators

use proptest::prelude::*;
use rand::Rng;

/// Generate random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen()).collect()
}

/// `count` distinct, non-empty transaction payloads
pub fn random_payloads(count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut payload = (i as u32).to_be_bytes().to_vec();
            payload.extend(random_bytes(28));
            payload
        })
        .collect()
}

/// Strategy for a single transaction payload
pub fn payload_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..256)
}

/// Strategy for a validator count and a vote count that may or may not
/// reach a quorum
pub fn vote_split_strategy() -> impl Strategy<Value = (usize, usize)> {
    (4usize..32).prop_flat_map(|n| (Just(n), 0..=n))
}
