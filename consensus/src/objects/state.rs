/// Persistent per-node state and validator sets

use super::{BlockHeader, Proposal};
use crate::crypto::{BLSPublicKey, GroupKey, ValidatorAddress};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What this node knows about the chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnState {
    pub vaddr: ValidatorAddress,
    pub group_key: GroupKey,
    /// Highest committed header observed from anyone
    pub max_bh_seen: BlockHeader,
    /// Last header applied locally
    pub sync_to_bh: BlockHeader,
    pub canonical_snapshot: BlockHeader,
    pub pending_snapshot: BlockHeader,
}

impl OwnState {
    pub fn new(vaddr: ValidatorAddress, genesis: BlockHeader) -> Self {
        Self {
            vaddr,
            group_key: GroupKey::default(),
            max_bh_seen: genesis.clone(),
            sync_to_bh: genesis.clone(),
            canonical_snapshot: genesis.clone(),
            pending_snapshot: genesis,
        }
    }

    pub fn is_synced(&self) -> bool {
        self.sync_to_bh.bclaims.height >= self.max_bh_seen.bclaims.height
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

fn expired(started: u64, timeout: Duration) -> bool {
    now_nanos().saturating_sub(started) >= timeout.as_nanos() as u64
}

/// Values and step timers this node holds while validating
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnValidatingState {
    pub vaddr: ValidatorAddress,
    pub group_key: GroupKey,
    /// Unix nanoseconds
    pub round_started: u64,
    pub pre_vote_step_started: u64,
    pub pre_commit_step_started: u64,
    pub valid_value: Option<Proposal>,
    pub locked_value: Option<Proposal>,
}

impl OwnValidatingState {
    pub fn set_round_started(&mut self) {
        let now = now_nanos();
        self.round_started = now;
        self.pre_vote_step_started = now;
        self.pre_commit_step_started = now;
    }

    pub fn set_pre_vote_step_started(&mut self) {
        self.pre_vote_step_started = now_nanos();
    }

    pub fn set_pre_commit_step_started(&mut self) {
        self.pre_commit_step_started = now_nanos();
    }

    pub fn pto_expired(&self, timeout: Duration) -> bool {
        expired(self.round_started, timeout)
    }

    pub fn pvto_expired(&self, timeout: Duration) -> bool {
        expired(self.pre_vote_step_started, timeout)
    }

    pub fn pcto_expired(&self, timeout: Duration) -> bool {
        expired(self.pre_commit_step_started, timeout)
    }

    /// Grace period in the dead block round predecessor, measured from
    /// round start
    pub fn dbrnr_expired(&self, timeout: Duration) -> bool {
        expired(self.round_started, timeout)
    }

    pub fn clear_values(&mut self) {
        self.valid_value = None;
        self.locked_value = None;
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub vaddr: ValidatorAddress,
    pub group_share: BLSPublicKey,
}

/// Ordered validators effective from `not_before`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    pub validators: Vec<Validator>,
    pub group_key: GroupKey,
    pub not_before: u32,
}

impl ValidatorSet {
    pub fn new(validators: Vec<Validator>, not_before: u32) -> Self {
        let shares: Vec<BLSPublicKey> = validators.iter().map(|v| v.group_share.clone()).collect();
        Self {
            group_key: GroupKey::from_shares(&shares),
            validators,
            not_before,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn group_shares(&self) -> Vec<BLSPublicKey> {
        self.validators.iter().map(|v| v.group_share.clone()).collect()
    }

    pub fn get(&self, vaddr: &ValidatorAddress) -> Option<&Validator> {
        self.validators.iter().find(|v| &v.vaddr == vaddr)
    }

    pub fn contains(&self, vaddr: &ValidatorAddress) -> bool {
        self.get(vaddr).is_some()
    }

    pub fn is_valid_tuple(&self, vaddr: &ValidatorAddress, group_key: &GroupKey) -> bool {
        self.contains(vaddr) && &self.group_key == group_key
    }

    pub fn is_valid_triplet(
        &self,
        vaddr: &ValidatorAddress,
        group_share: &BLSPublicKey,
        group_key: &GroupKey,
    ) -> bool {
        &self.group_key == group_key
            && self
                .get(vaddr)
                .map_or(false, |v| &v.group_share == group_share)
    }

    /// Round robin proposer: index `(height + round - 1) mod n`
    pub fn proposer(&self, height: u32, round: u32) -> Option<&Validator> {
        if self.validators.is_empty() {
            return None;
        }
        let idx = (height as usize + round as usize).saturating_sub(1) % self.validators.len();
        self.validators.get(idx)
    }

    pub fn is_proposer(&self, vaddr: &ValidatorAddress, height: u32, round: u32) -> bool {
        self.proposer(height, round)
            .map_or(false, |v| &v.vaddr == vaddr)
    }
}
