/// Typed accessors over the column families

use super::{
    Result, StorageError, Txn, CF_BLOCK_HEADERS, CF_BROADCAST, CF_HEADER_ROOTS, CF_OWN_STATE,
    CF_OWN_VALIDATING_STATE, CF_ROUND_STATES, CF_SNAPSHOTS, CF_VALIDATOR_SETS,
    CF_VALIDATOR_SETS_POST_APP,
};
use crate::crypto::{hash_concat, Hash, ValidatorAddress};
use crate::objects::{
    BlockHeader, ConsensusMessage, OwnState, OwnValidatingState, RCert, RoundState, ValidatorSet,
};

const OWN_KEY: &[u8] = b"own";

/// Kinds kept in the broadcast column, in gossip order
pub const BROADCAST_KINDS: [&str; 8] = [
    "block_header",
    "next_height",
    "next_round",
    "pre_commit",
    "pre_commit_nil",
    "pre_vote",
    "pre_vote_nil",
    "proposal",
];

/// `header_root(h) = H(header_root(h-1) || block_hash(h))`
pub fn next_header_root(prev_root: &Hash, block_hash: &Hash) -> Hash {
    hash_concat([&prev_root.as_bytes()[..], &block_hash.as_bytes()[..]])
}

impl Txn<'_> {
    pub fn get_own_state(&self) -> Result<Option<OwnState>> {
        self.get_value(CF_OWN_STATE, OWN_KEY)
    }

    pub fn set_own_state(&mut self, os: &OwnState) -> Result<()> {
        self.put_value(CF_OWN_STATE, OWN_KEY, os)
    }

    pub fn get_own_validating_state(&self) -> Result<Option<OwnValidatingState>> {
        self.get_value(CF_OWN_VALIDATING_STATE, OWN_KEY)
    }

    pub fn set_own_validating_state(&mut self, ovs: &OwnValidatingState) -> Result<()> {
        self.put_value(CF_OWN_VALIDATING_STATE, OWN_KEY, ovs)
    }

    pub fn get_round_state(&self, vaddr: &ValidatorAddress) -> Result<Option<RoundState>> {
        self.get_value(CF_ROUND_STATES, vaddr.as_bytes())
    }

    pub fn set_round_state(&mut self, rs: &RoundState) -> Result<()> {
        self.put_value(CF_ROUND_STATES, rs.vaddr.as_bytes(), rs)
    }

    /// Set effective at `height`: the one with the greatest `not_before`
    /// not above it
    pub fn get_validator_set(&self, height: u32) -> Result<Option<ValidatorSet>> {
        self.seek_prev(CF_VALIDATOR_SETS, &height.to_be_bytes())?
            .map(|(_, bytes)| super::decode(&bytes))
            .transpose()
    }

    pub fn set_validator_set(&mut self, vs: &ValidatorSet) -> Result<()> {
        self.put_value(CF_VALIDATOR_SETS, &vs.not_before.to_be_bytes(), vs)
    }

    /// Set staged by the application, keyed by the height it takes effect
    pub fn get_validator_set_post_application(&self, not_before: u32) -> Result<Option<ValidatorSet>> {
        self.get_value(CF_VALIDATOR_SETS_POST_APP, &not_before.to_be_bytes())
    }

    pub fn set_validator_set_post_application(&mut self, vs: &ValidatorSet) -> Result<()> {
        self.put_value(CF_VALIDATOR_SETS_POST_APP, &vs.not_before.to_be_bytes(), vs)
    }

    pub fn get_block_header(&self, height: u32) -> Result<Option<BlockHeader>> {
        self.get_value(CF_BLOCK_HEADERS, &height.to_be_bytes())
    }

    pub fn set_block_header(&mut self, bh: &BlockHeader) -> Result<()> {
        self.put_value(CF_BLOCK_HEADERS, &bh.bclaims.height.to_be_bytes(), bh)
    }

    pub fn get_header_root(&self, height: u32) -> Result<Option<Hash>> {
        self.get_value(CF_HEADER_ROOTS, &height.to_be_bytes())
    }

    /// Chain the root of `bh` onto the root stored for the height below
    pub fn commit_header_root(&mut self, bh: &BlockHeader) -> Result<Hash> {
        let height = bh.bclaims.height;
        let prev = if height <= 1 {
            Hash::zero()
        } else {
            self.get_header_root(height - 1)?.ok_or_else(|| {
                StorageError::InvalidData(format!("no header root at height {}", height - 1))
            })?
        };
        let root = next_header_root(&prev, &bh.block_hash());
        self.put_value(CF_HEADER_ROOTS, &height.to_be_bytes(), &root)?;
        Ok(root)
    }

    pub fn set_broadcast(&mut self, msg: &ConsensusMessage) -> Result<()> {
        self.put_value(CF_BROADCAST, msg.kind().as_bytes(), msg)
    }

    /// Every artifact currently waiting for gossip
    pub fn get_broadcast(&self) -> Result<Vec<ConsensusMessage>> {
        let mut out = Vec::new();
        for kind in BROADCAST_KINDS {
            if let Some(msg) = self.get_value(CF_BROADCAST, kind.as_bytes())? {
                out.push(msg);
            }
        }
        Ok(out)
    }

    pub fn get_snapshot_header(&self, height: u32) -> Result<Option<BlockHeader>> {
        self.get_value(CF_SNAPSHOTS, &height.to_be_bytes())
    }

    pub fn set_snapshot_header(&mut self, bh: &BlockHeader) -> Result<()> {
        self.put_value(CF_SNAPSHOTS, &bh.bclaims.height.to_be_bytes(), bh)
    }
}

/// Write the genesis header, the first validator set and the node's own
/// starting state at round (2, 1)
pub fn init_genesis(
    txn: &mut Txn<'_>,
    vaddr: ValidatorAddress,
    validator_set: &ValidatorSet,
    genesis: &BlockHeader,
) -> Result<()> {
    if genesis.bclaims.height != 1 {
        return Err(StorageError::InvalidData("genesis header must be height 1".into()));
    }
    txn.set_block_header(genesis)?;
    txn.commit_header_root(genesis)?;
    txn.set_validator_set(validator_set)?;

    let mut own = OwnState::new(vaddr, genesis.clone());
    own.group_key = validator_set.group_key;
    txn.set_own_state(&own)?;
    txn.set_own_validating_state(&OwnValidatingState {
        vaddr,
        group_key: validator_set.group_key,
        ..OwnValidatingState::default()
    })?;

    let rcert = RCert::unsigned(genesis.bclaims.chain_id, 2, genesis.block_hash());
    let share = validator_set.get(&vaddr).map(|v| v.group_share.clone());
    txn.set_round_state(&RoundState::new(vaddr, validator_set.group_key, share, rcert))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::test_fixtures::Network;

    #[test]
    fn test_init_genesis() {
        let net = Network::new(4);
        let storage = Storage::new_temp().unwrap();
        storage
            .update(|txn| init_genesis(txn, net.vaddr(0), &net.validator_set, &net.genesis))
            .unwrap();

        storage
            .view(|txn| {
                let own = txn.get_own_state()?.unwrap();
                assert_eq!(own.sync_to_bh, net.genesis);
                assert_eq!(own.group_key, net.validator_set.group_key);
                let rs = txn.get_round_state(&net.vaddr(0))?.unwrap();
                assert_eq!((rs.rcert.claims.height, rs.rcert.claims.round), (2, 1));
                assert_eq!(rs.rcert.claims.prev_block, net.genesis.block_hash());
                assert_eq!(
                    txn.get_header_root(1)?,
                    Some(next_header_root(&Hash::zero(), &net.genesis.block_hash()))
                );
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_validator_set_lookup_by_height() {
        let net = Network::new(4);
        let storage = Storage::new_temp().unwrap();
        let mut later = net.validator_set.clone();
        later.not_before = 50;
        later.validators.truncate(3);
        let later = ValidatorSet::new(later.validators, 50);

        storage
            .update(|txn| {
                txn.set_validator_set(&net.validator_set)?;
                txn.set_validator_set(&later)
            })
            .unwrap();
        storage
            .view(|txn| {
                assert_eq!(txn.get_validator_set(1)?.unwrap().len(), 4);
                assert_eq!(txn.get_validator_set(49)?.unwrap().len(), 4);
                assert_eq!(txn.get_validator_set(50)?.unwrap().len(), 3);
                assert_eq!(txn.get_validator_set(5000)?.unwrap().len(), 3);
                assert!(txn.get_validator_set(0)?.is_none());
                Ok::<_, StorageError>(())
            })
            .unwrap();
    }

    #[test]
    fn test_broadcast_slots_keep_latest_per_kind() {
        let net = Network::new(4);
        let storage = Storage::new_temp().unwrap();
        let rc = net.rcert(2, 1);
        let first = ConsensusMessage::PreVoteNil(net.pre_vote_nil(0, &rc));
        let second = ConsensusMessage::PreVoteNil(net.pre_vote_nil(1, &rc));
        storage
            .update(|txn| {
                txn.set_broadcast(&first)?;
                txn.set_broadcast(&second)
            })
            .unwrap();
        let slots = storage.view(|txn| txn.get_broadcast()).unwrap();
        assert_eq!(slots, vec![second]);
    }
}
