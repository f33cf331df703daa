/// Contract with the application that owns transaction semantics
///
/// The consensus engine never interprets transactions. It asks the
/// application to select, validate and apply them, and only tracks their
/// hashes.

use crate::crypto::{hash_concat, hash_data, Hash};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    #[error("invalid transactions: {0}")]
    Invalid(String),

    #[error("missing transactions")]
    MissingTransactions,

    #[error("application failure: {0}")]
    Internal(String),
}

/// Opaque transaction body
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub payload: Vec<u8>,
}

impl Transaction {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self { payload: payload.into() }
    }

    pub fn hash(&self) -> Hash {
        hash_data(&self.payload)
    }

    pub fn encoded_len(&self) -> usize {
        self.payload.len()
    }
}

/// Transactions found, plus the hashes that were not
pub type TxLookup = (Vec<Transaction>, Vec<Hash>);

pub trait Application: Send + Sync {
    fn unmarshal_tx(&self, bytes: &[u8]) -> Result<Transaction, AppError>;

    /// Whether applying `txs` at `height` yields `state_root`
    fn is_valid(
        &self,
        chain_id: u32,
        height: u32,
        state_root: &Hash,
        txs: &[Transaction],
    ) -> Result<bool, AppError>;

    /// Apply a committed block, returning the new state root
    fn apply_state(&self, chain_id: u32, height: u32, txs: &[Transaction]) -> Result<Hash, AppError>;

    /// Transactions for a new block at `height` and the state root they produce
    fn get_valid_proposal(
        &self,
        chain_id: u32,
        height: u32,
        max_bytes: usize,
    ) -> Result<(Vec<Transaction>, Hash), AppError>;

    fn pending_tx_add(&self, txs: &[Transaction]) -> Result<(), AppError>;

    fn pending_tx_get(&self, height: u32, hashes: &[Hash]) -> Result<TxLookup, AppError>;

    fn mined_tx_get(&self, hashes: &[Hash]) -> Result<TxLookup, AppError>;
}

#[derive(Default)]
struct MockState {
    pending: BTreeMap<Hash, Transaction>,
    mined: HashMap<Hash, Transaction>,
    /// State root after each applied height
    roots: BTreeMap<u32, Hash>,
    rejected: HashSet<Hash>,
}

/// In-memory application whose state root is a hash chain over the applied
/// transaction hashes
pub struct MockApplication {
    genesis_root: Hash,
    state: Mutex<MockState>,
}

impl MockApplication {
    pub fn new(genesis_root: Hash) -> Self {
        Self {
            genesis_root,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make every block containing `tx` invalid
    pub fn reject(&self, tx: &Transaction) -> Result<(), AppError> {
        self.lock()?.rejected.insert(tx.hash());
        Ok(())
    }

    pub fn state_root(&self, height: u32) -> Result<Option<Hash>, AppError> {
        let state = self.lock()?;
        Ok(if height <= 1 {
            Some(self.genesis_root)
        } else {
            state.roots.get(&height).copied()
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::Internal("application state lock poisoned".into()))
    }

    fn root_after(&self, state: &MockState, height: u32, txs: &[Transaction]) -> Hash {
        let prev = if height <= 2 {
            self.genesis_root
        } else {
            state
                .roots
                .get(&(height - 1))
                .copied()
                .unwrap_or(self.genesis_root)
        };
        // Empty blocks leave the state untouched
        if txs.is_empty() {
            return prev;
        }
        let hashes: Vec<Hash> = txs.iter().map(Transaction::hash).collect();
        hash_concat(
            std::iter::once(&prev.as_bytes()[..]).chain(hashes.iter().map(|h| &h.as_bytes()[..])),
        )
    }
}

impl Application for MockApplication {
    fn unmarshal_tx(&self, bytes: &[u8]) -> Result<Transaction, AppError> {
        if bytes.is_empty() {
            return Err(AppError::Invalid("empty transaction".into()));
        }
        Ok(Transaction::new(bytes))
    }

    fn is_valid(
        &self,
        _chain_id: u32,
        height: u32,
        state_root: &Hash,
        txs: &[Transaction],
    ) -> Result<bool, AppError> {
        let state = self.lock()?;
        if txs.iter().any(|tx| state.rejected.contains(&tx.hash())) {
            return Ok(false);
        }
        Ok(&self.root_after(&state, height, txs) == state_root)
    }

    fn apply_state(&self, _chain_id: u32, height: u32, txs: &[Transaction]) -> Result<Hash, AppError> {
        let mut state = self.lock()?;
        let root = self.root_after(&state, height, txs);
        state.roots.insert(height, root);
        for tx in txs {
            let hash = tx.hash();
            state.pending.remove(&hash);
            state.mined.insert(hash, tx.clone());
        }
        Ok(root)
    }

    fn get_valid_proposal(
        &self,
        _chain_id: u32,
        height: u32,
        max_bytes: usize,
    ) -> Result<(Vec<Transaction>, Hash), AppError> {
        let state = self.lock()?;
        let mut used = 0;
        let mut txs = Vec::new();
        for tx in state.pending.values() {
            if state.rejected.contains(&tx.hash()) {
                continue;
            }
            if used + tx.encoded_len() > max_bytes {
                break;
            }
            used += tx.encoded_len();
            txs.push(tx.clone());
        }
        let root = self.root_after(&state, height, &txs);
        Ok((txs, root))
    }

    fn pending_tx_add(&self, txs: &[Transaction]) -> Result<(), AppError> {
        let mut state = self.lock()?;
        for tx in txs {
            let hash = tx.hash();
            if !state.mined.contains_key(&hash) {
                state.pending.insert(hash, tx.clone());
            }
        }
        Ok(())
    }

    fn pending_tx_get(&self, _height: u32, hashes: &[Hash]) -> Result<TxLookup, AppError> {
        let state = self.lock()?;
        Ok(split_found(hashes, |h| state.pending.get(h).cloned()))
    }

    fn mined_tx_get(&self, hashes: &[Hash]) -> Result<TxLookup, AppError> {
        let state = self.lock()?;
        Ok(split_found(hashes, |h| state.mined.get(h).cloned()))
    }
}

fn split_found(hashes: &[Hash], lookup: impl Fn(&Hash) -> Option<Transaction>) -> TxLookup {
    let mut found = Vec::new();
    let mut missing = Vec::new();
    for hash in hashes {
        match lookup(hash) {
            Some(tx) => found.push(tx),
            None => missing.push(*hash),
        }
    }
    (found, missing)
}
