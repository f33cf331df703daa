/// Cryptography for the consensus engine
///
/// Implements:
/// - Per-validator secp256k1 signatures and addresses
/// - BLS group signatures (⌊2n/3⌋+1 of n shares)
/// - Hash functions (BLAKE3 / SHA-256)

pub mod bls;
pub mod ecdsa;
pub mod hash;

pub use bls::{
    aggregate, threshold, BLSError, BLSPublicKey, BLSSecretKey, BLSSignature, GroupKey,
    GroupSignature, GroupSigner, ShareSignature,
};
pub use ecdsa::{
    ECDSAError, ECDSAPublicKey, ECDSASecretKey, ValidatorAddress, ValidatorSignature,
    ValidatorSigner,
};
pub use hash::{hash_concat, hash_data, Hash};
