/// BLS group signatures over BLS12-381 (min_pk)
///
/// A validator group is the ordered list of every validator's share public
/// key; its `GroupKey` is the hash of that list. Each validator signs with
/// its own share, and any ⌊2n/3⌋+1 distinct share signatures over the same
/// message aggregate into one `GroupSignature`.
///
/// A group signature carries the full share list plus the indices of the
/// shares that signed, so a verifier can both rebuild the aggregate public
/// key and derive the group key without consulting a validator set.

use crate::crypto::hash::{hash_concat, Hash};
use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Ciphersuite tag for every signature in this crate
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

pub const BLS_SECRET_KEY_SIZE: usize = 32;

#[derive(Error, Debug)]
pub enum BLSError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Insufficient signatures: need {needed}, got {got}")]
    InsufficientSignatures { needed: usize, got: usize },
    #[error("Invalid key")]
    InvalidKey,
    #[error("Signature verification failed")]
    VerificationFailed,
    #[error("Share is not a member of the group")]
    UnknownShare,
    #[error("Signer indices must be unique, ordered and in range")]
    InvalidSigners,
}

/// Byzantine quorum for `n` participants: ⌊2n/3⌋+1
pub fn threshold(n: usize) -> usize {
    2 * n / 3 + 1
}

/// BLS secret key wrapper
#[derive(Clone)]
pub struct BLSSecretKey {
    inner: BlstSecretKey,
}

impl BLSSecretKey {
    /// Generate a new random secret key
    pub fn generate() -> Result<Self, BLSError> {
        let mut ikm = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut ikm);
        Self::from_seed(&ikm)
    }

    /// Deterministic key generation, `seed` must be at least 32 bytes
    pub fn from_seed(seed: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::key_gen(seed, &[]).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> [u8; BLS_SECRET_KEY_SIZE] {
        self.inner.to_bytes()
    }

    pub fn public_key(&self) -> BLSPublicKey {
        BLSPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> BLSSignature {
        BLSSignature {
            inner: self.inner.sign(message, BLS_DST, &[]),
        }
    }
}

/// BLS public key wrapper; a validator's group share
#[derive(Clone, PartialEq, Eq)]
pub struct BLSPublicKey {
    inner: BlstPublicKey,
}

impl BLSPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstPublicKey::from_bytes(bytes).map_err(|_| BLSError::InvalidKey)?;
        Ok(Self { inner })
    }

    /// Compressed encoding
    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

impl std::hash::Hash for BLSPublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::hash::Hash::hash(&self.to_bytes(), state);
    }
}

impl fmt::Debug for BLSPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSPublicKey({})", hex::encode(&self.to_bytes()[..6]))
    }
}

/// BLS signature wrapper
#[derive(Clone, PartialEq, Eq)]
pub struct BLSSignature {
    inner: BlstSignature,
}

impl BLSSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BLSError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| BLSError::InvalidSignature)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    fn verify(&self, message: &[u8], public_key: &BlstPublicKey) -> Result<(), BLSError> {
        match self.inner.verify(true, message, BLS_DST, &[], public_key, true) {
            blst::BLST_ERROR::BLST_SUCCESS => Ok(()),
            _ => Err(BLSError::VerificationFailed),
        }
    }
}

impl fmt::Debug for BLSSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BLSSignature({})", hex::encode(&self.to_bytes()[..6]))
    }
}

/// Identity of a validator group: hash of its ordered share list.
/// The zero key marks "no group", as on unsigned genesis certificates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GroupKey(Hash);

impl GroupKey {
    pub fn from_shares(shares: &[BLSPublicKey]) -> Self {
        let encoded: Vec<Vec<u8>> = shares.iter().map(BLSPublicKey::to_bytes).collect();
        Self(hash_concat(encoded.iter().map(Vec::as_slice)))
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GroupKey({})", self.0)
    }
}

/// One validator's signature under its group share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSignature {
    pub share: BLSPublicKey,
    pub signature: BLSSignature,
}

impl ShareSignature {
    pub fn verify(&self, message: &[u8]) -> Result<(), BLSError> {
        self.signature.verify(message, &self.share.inner)
    }
}

/// Aggregated signature of a quorum of a group
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSignature {
    shares: Vec<BLSPublicKey>,
    signers: Vec<u16>,
    signature: BLSSignature,
}

impl GroupSignature {
    pub fn group_key(&self) -> GroupKey {
        GroupKey::from_shares(&self.shares)
    }

    pub fn signer_count(&self) -> usize {
        self.signers.len()
    }

    /// Verify the aggregate and return the key of the group that produced it
    pub fn verify(&self, message: &[u8]) -> Result<GroupKey, BLSError> {
        let n = self.shares.len();
        let ordered = self.signers.windows(2).all(|w| w[0] < w[1]);
        let in_range = self.signers.iter().all(|&i| (i as usize) < n);
        if !ordered || !in_range {
            return Err(BLSError::InvalidSigners);
        }
        let needed = threshold(n);
        if self.signers.len() < needed {
            return Err(BLSError::InsufficientSignatures {
                needed,
                got: self.signers.len(),
            });
        }
        let pks: Vec<&BlstPublicKey> = self
            .signers
            .iter()
            .map(|&i| &self.shares[i as usize].inner)
            .collect();
        let aggregated = AggregatePublicKey::aggregate(&pks, true)
            .map_err(|_| BLSError::InvalidKey)?
            .to_public_key();
        self.signature.verify(message, &aggregated)?;
        Ok(self.group_key())
    }
}

/// Combine share signatures over `message` into a group signature.
///
/// Every share must belong to `group` and verify; duplicates are collapsed.
pub fn aggregate(
    group: &[BLSPublicKey],
    message: &[u8],
    partials: &[ShareSignature],
) -> Result<GroupSignature, BLSError> {
    let mut by_index: BTreeMap<u16, &BlstSignature> = BTreeMap::new();
    for partial in partials {
        let index = group
            .iter()
            .position(|share| share == &partial.share)
            .ok_or(BLSError::UnknownShare)?;
        partial.verify(message)?;
        by_index.insert(index as u16, &partial.signature.inner);
    }

    let needed = threshold(group.len());
    if by_index.len() < needed {
        return Err(BLSError::InsufficientSignatures {
            needed,
            got: by_index.len(),
        });
    }

    let sigs: Vec<&BlstSignature> = by_index.values().copied().collect();
    let combined = AggregateSignature::aggregate(&sigs, true)
        .map_err(|_| BLSError::InvalidSignature)?
        .to_signature();

    Ok(GroupSignature {
        shares: group.to_vec(),
        signers: by_index.into_keys().collect(),
        signature: BLSSignature { inner: combined },
    })
}

/// Signing handle over the local validator's group share
#[derive(Clone)]
pub struct GroupSigner {
    secret: BLSSecretKey,
    share: BLSPublicKey,
    group: Vec<BLSPublicKey>,
    group_key: GroupKey,
}

impl GroupSigner {
    pub fn new(secret: BLSSecretKey, group: Vec<BLSPublicKey>) -> Result<Self, BLSError> {
        let share = secret.public_key();
        if !group.contains(&share) {
            return Err(BLSError::UnknownShare);
        }
        let group_key = GroupKey::from_shares(&group);
        Ok(Self {
            secret,
            share,
            group,
            group_key,
        })
    }

    pub fn share(&self) -> &BLSPublicKey {
        &self.share
    }

    pub fn group(&self) -> &[BLSPublicKey] {
        &self.group
    }

    pub fn group_key(&self) -> GroupKey {
        self.group_key
    }

    pub fn sign_share(&self, message: &[u8]) -> ShareSignature {
        ShareSignature {
            share: self.share.clone(),
            signature: self.secret.sign(message),
        }
    }

    pub fn aggregate(
        &self,
        message: &[u8],
        partials: &[ShareSignature],
    ) -> Result<GroupSignature, BLSError> {
        aggregate(&self.group, message, partials)
    }
}


impl serde::Serialize for BLSPublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for BLSPublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(BytesVisitor::new("a compressed BLS public key", |b| {
            BLSPublicKey::from_bytes(b)
        }))
    }
}

impl serde::Serialize for BLSSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> serde::Deserialize<'de> for BLSSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_bytes(BytesVisitor::new("a compressed BLS signature", |b| {
            BLSSignature::from_bytes(b)
        }))
    }
}

/// Visitor shared by the byte-encoded key and signature types
struct BytesVisitor<T, F> {
    expecting: &'static str,
    parse: F,
    _marker: std::marker::PhantomData<T>,
}

impl<T, F> BytesVisitor<T, F>
where
    F: Fn(&[u8]) -> Result<T, BLSError>,
{
    fn new(expecting: &'static str, parse: F) -> Self {
        Self {
            expecting,
            parse,
            _marker: std::marker::PhantomData,
        }
    }
}

impl<'de, T, F> serde::de::Visitor<'de> for BytesVisitor<T, F>
where
    F: Fn(&[u8]) -> Result<T, BLSError>,
{
    type Value = T;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str(self.expecting)
    }

    fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        (self.parse)(v).map_err(E::custom)
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::SeqAccess<'de>,
    {
        let mut bytes = Vec::new();
        while let Some(byte) = seq.next_element::<u8>()? {
            bytes.push(byte);
        }
        (self.parse)(&bytes).map_err(serde::de::Error::custom)
    }
}
