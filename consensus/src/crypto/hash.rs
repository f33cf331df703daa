/// Hashing for block claims, transaction roots and header chains
///
/// BLAKE3 is used for every consensus hash. SHA-256 is only used to derive
/// validator addresses from secp256k1 public keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const HASH_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum HashError {
    #[error("Invalid hash size: expected {HASH_SIZE}, got {0}")]
    InvalidSize(usize),
}

/// 32 byte digest
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, HashError> {
        let bytes: [u8; HASH_SIZE] = slice
            .try_into()
            .map_err(|_| HashError::InvalidSize(slice.len()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The all-zero hash, used as the previous block of genesis
    pub const fn zero() -> Self {
        Self([0u8; HASH_SIZE])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Hash function selection
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashFunction {
    /// Address derivation
    Sha256,
    #[default]
    Blake3,
}

/// Hash arbitrary data with BLAKE3
pub fn hash_data(data: &[u8]) -> Hash {
    hash_data_with(data, HashFunction::default())
}

/// Hash data with a specific function
pub fn hash_data_with(data: &[u8], function: HashFunction) -> Hash {
    match function {
        HashFunction::Sha256 => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            hasher.update(data);
            Hash::new(hasher.finalize().into())
        }
        HashFunction::Blake3 => Hash::new(*blake3::hash(data).as_bytes()),
    }
}

/// Hash the concatenation of several parts without an intermediate buffer
pub fn hash_concat<'a, I>(parts: I) -> Hash
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    Hash::new(*hasher.finalize().as_bytes())
}
