/// Per-validator signatures (secp256k1)
///
/// Every artifact a validator casts carries a `ValidatorSignature`: the
/// signer's compressed public key plus the signature. Verification recovers
/// the signer's `ValidatorAddress`, the last 20 bytes of SHA-256 over the
/// public key.

use crate::crypto::hash::{hash_data_with, HashFunction};
use k256::ecdsa::{
    signature::{Signer, Verifier},
    Signature as K256Signature, SigningKey, VerifyingKey,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ADDRESS_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum ECDSAError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid key")]
    InvalidKey,
    #[error("Verification failed")]
    VerificationFailed,
}

/// Identity of a validator
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ValidatorAddress([u8; ADDRESS_SIZE]);

impl ValidatorAddress {
    pub const fn new(bytes: [u8; ADDRESS_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_public_key(public_key: &ECDSAPublicKey) -> Self {
        let digest = hash_data_with(&public_key.to_bytes(), HashFunction::Sha256);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest.as_bytes()[32 - ADDRESS_SIZE..]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ADDRESS_SIZE]
    }
}

impl fmt::Display for ValidatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ValidatorAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorAddress({})", hex::encode(&self.0[..6]))
    }
}

/// ECDSA secret key (secp256k1)
#[derive(Clone)]
pub struct ECDSASecretKey {
    inner: SigningKey,
}

impl ECDSASecretKey {
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = SigningKey::from_slice(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> ECDSAPublicKey {
        ECDSAPublicKey {
            inner: self.inner.verifying_key().clone(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

/// ECDSA public key (secp256k1)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ECDSAPublicKey {
    inner: VerifyingKey,
}

impl ECDSAPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ECDSAError> {
        let inner = VerifyingKey::from_sec1_bytes(bytes).map_err(|_| ECDSAError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Compressed SEC1 encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_sec1_bytes().to_vec()
    }
}

/// Signature over an artifact, self-describing the signer
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSignature {
    public_key: Vec<u8>,
    signature: Vec<u8>,
}

impl ValidatorSignature {
    /// Verify against `message` and return the signer's address
    pub fn verify(&self, message: &[u8]) -> Result<ValidatorAddress, ECDSAError> {
        let public_key = ECDSAPublicKey::from_bytes(&self.public_key)?;
        let signature =
            K256Signature::from_slice(&self.signature).map_err(|_| ECDSAError::InvalidSignature)?;
        public_key
            .inner
            .verify(message, &signature)
            .map_err(|_| ECDSAError::VerificationFailed)?;
        Ok(ValidatorAddress::from_public_key(&public_key))
    }

    /// Address of the embedded key, without checking the signature
    pub fn signer(&self) -> Result<ValidatorAddress, ECDSAError> {
        let public_key = ECDSAPublicKey::from_bytes(&self.public_key)?;
        Ok(ValidatorAddress::from_public_key(&public_key))
    }
}

impl fmt::Debug for ValidatorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sig_prefix = &self.signature[..self.signature.len().min(6)];
        write!(f, "ValidatorSignature({})", hex::encode(sig_prefix))
    }
}

/// Signing handle of the local validator
#[derive(Clone)]
pub struct ValidatorSigner {
    secret: ECDSASecretKey,
    public_key: ECDSAPublicKey,
    address: ValidatorAddress,
}

impl ValidatorSigner {
    pub fn new(secret: ECDSASecretKey) -> Self {
        let public_key = secret.public_key();
        let address = ValidatorAddress::from_public_key(&public_key);
        Self {
            secret,
            public_key,
            address,
        }
    }

    pub fn generate() -> Self {
        Self::new(ECDSASecretKey::generate())
    }

    pub fn address(&self) -> ValidatorAddress {
        self.address
    }

    pub fn public_key(&self) -> &ECDSAPublicKey {
        &self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> ValidatorSignature {
        let signature: K256Signature = self.secret.inner.sign(message);
        ValidatorSignature {
            public_key: self.public_key.to_bytes(),
            signature: signature.to_bytes().to_vec(),
        }
    }
}
