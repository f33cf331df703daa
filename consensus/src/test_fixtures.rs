/// Deterministic validator networks for unit tests

use crate::application::{Application, MockApplication, Transaction};
use crate::config::EngineConfig;
use crate::crypto::{
    hash_data, BLSSecretKey, ECDSASecretKey, GroupKey, GroupSigner, Hash, ShareSignature,
    ValidatorAddress, ValidatorSigner,
};
use crate::engine::{Engine, InMemoryKeyStore};
use crate::handlers::Handlers;
use crate::objects::{
    make_next_height, make_pre_commit, make_tx_root, BClaims, BlockHeader, NextHeight, NextRound,
    PreCommit, PreCommitNil, PreVote, PreVoteNil, Proposal, RCert, RClaims, Validator,
    ValidatorSet,
};
use crate::round_states::RoundStates;
use crate::storage::store::next_header_root;
use crate::storage::{init_genesis, Storage};
use crate::tx_resolver::{TxFetcher, TxResolver};
use async_trait::async_trait;
use std::sync::Arc;

pub(crate) const GENESIS_ROOT: Hash = Hash::new([7; 32]);

/// Peer that serves a fixed set of headers and transactions
#[derive(Default)]
pub(crate) struct StaticPeers {
    pub headers: Vec<BlockHeader>,
    pub txs: Vec<Transaction>,
}

impl StaticPeers {
    fn matching(&self, hashes: &[Hash]) -> Vec<Transaction> {
        self.txs
            .iter()
            .filter(|tx| hashes.contains(&tx.hash()))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TxFetcher for StaticPeers {
    async fn request_pending_txs(&self, hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>> {
        Ok(self.matching(hashes))
    }

    async fn request_mined_txs(&self, hashes: &[Hash]) -> anyhow::Result<Vec<Transaction>> {
        Ok(self.matching(hashes))
    }

    async fn request_block_header(&self, height: u32) -> anyhow::Result<Option<BlockHeader>> {
        Ok(self
            .headers
            .iter()
            .find(|bh| bh.bclaims.height == height)
            .cloned())
    }
}

/// `n` validators with keys derived from their index
pub(crate) struct Network {
    pub chain_id: u32,
    signers: Vec<ValidatorSigner>,
    group_secrets: Vec<BLSSecretKey>,
    group_signers: Vec<GroupSigner>,
    pub validator_set: ValidatorSet,
    pub genesis: BlockHeader,
}

impl Network {
    pub fn new(n: usize) -> Self {
        Self::with_chain(n, 42)
    }

    pub fn with_chain(n: usize, chain_id: u32) -> Self {
        let signers: Vec<ValidatorSigner> = (0..n)
            .map(|i| ValidatorSigner::new(ECDSASecretKey::from_bytes(&[i as u8 + 1; 32]).unwrap()))
            .collect();
        let group_secrets: Vec<BLSSecretKey> = (0..n)
            .map(|i| BLSSecretKey::from_seed(&[i as u8 + 1; 32]).unwrap())
            .collect();
        let validators: Vec<Validator> = signers
            .iter()
            .zip(&group_secrets)
            .map(|(s, g)| Validator {
                vaddr: s.address(),
                group_share: g.public_key(),
            })
            .collect();
        let validator_set = ValidatorSet::new(validators, 1);
        let group_signers = group_secrets
            .iter()
            .map(|g| GroupSigner::new(g.clone(), validator_set.group_shares()).unwrap())
            .collect();
        Self {
            chain_id,
            signers,
            group_secrets,
            group_signers,
            validator_set,
            genesis: BlockHeader::genesis(chain_id, GENESIS_ROOT),
        }
    }

    pub fn vaddr(&self, i: usize) -> ValidatorAddress {
        self.signers[i].address()
    }

    pub fn signer(&self, i: usize) -> &ValidatorSigner {
        &self.signers[i]
    }

    pub fn group_signer(&self, i: usize) -> &GroupSigner {
        &self.group_signers[i]
    }

    pub fn group_key(&self) -> GroupKey {
        self.validator_set.group_key
    }

    pub fn group_secret(&self, i: usize) -> BLSSecretKey {
        self.group_secrets[i].clone()
    }

    pub fn threshold(&self) -> usize {
        crate::crypto::threshold(self.signers.len())
    }

    pub fn proposer_index(&self, height: u32, round: u32) -> usize {
        (height + round - 1) as usize % self.signers.len()
    }

    /// A state root no mock application ever reaches
    pub fn other_root() -> Hash {
        Hash::new([9; 32])
    }

    /// Hash of the block below `height`
    pub fn prev_block(&self, height: u32) -> Hash {
        match height {
            0 | 1 => Hash::zero(),
            2 => self.genesis.block_hash(),
            h => hash_data(format!("block {}", h - 1).as_bytes()),
        }
    }

    fn header_root_below(&self, height: u32) -> Hash {
        if height <= 2 {
            next_header_root(&Hash::zero(), &self.genesis.block_hash())
        } else {
            hash_data(format!("header root {}", height - 1).as_bytes())
        }
    }

    fn group_sign(&self, message: &[u8]) -> crate::crypto::GroupSignature {
        let shares: Vec<ShareSignature> = self.group_signers[..self.threshold()]
            .iter()
            .map(|g| g.sign_share(message))
            .collect();
        self.group_signers[0].aggregate(message, &shares).unwrap()
    }

    pub fn rcert(&self, height: u32, round: u32) -> RCert {
        let prev_block = self.prev_block(height);
        if height <= 2 && round == 1 {
            return RCert::unsigned(self.chain_id, height, prev_block);
        }
        let claims = RClaims {
            chain_id: self.chain_id,
            height,
            round,
            prev_block,
        };
        let message = if round == 1 {
            prev_block.to_vec()
        } else {
            claims.signing_bytes().unwrap()
        };
        RCert {
            sig_group: Some(self.group_sign(&message)),
            claims,
        }
    }

    pub fn txs(&self, n: usize) -> Vec<Transaction> {
        (0..n).map(|k| Transaction::new(format!("tx-{k}").into_bytes())).collect()
    }

    fn bclaims(&self, rc: &RCert, tx_hashes: &[Hash], state_root: Hash) -> BClaims {
        BClaims {
            chain_id: self.chain_id,
            height: rc.claims.height,
            tx_count: tx_hashes.len() as u32,
            prev_block: rc.claims.prev_block,
            tx_root: make_tx_root(tx_hashes),
            state_root,
            header_root: self.header_root_below(rc.claims.height),
        }
    }

    /// Empty block signed by validator `i`
    pub fn proposal(&self, i: usize, rc: &RCert) -> Proposal {
        self.proposal_with_state(i, rc, GENESIS_ROOT)
    }

    /// Empty block signed by the rightful proposer of `rc`
    pub fn proposal_for(&self, rc: &RCert) -> Proposal {
        self.proposal(self.proposer_index(rc.claims.height, rc.claims.round), rc)
    }

    pub fn proposal_with_state(&self, i: usize, rc: &RCert, state_root: Hash) -> Proposal {
        Proposal::new(&self.signers[i], self.bclaims(rc, &[], state_root), rc.clone(), Vec::new())
            .unwrap()
    }

    /// Block carrying `txs`, ordered and rooted the way a fresh mock
    /// application would propose them
    pub fn proposal_with_txs(&self, i: usize, rc: &RCert, txs: &[Transaction]) -> Proposal {
        let app = MockApplication::new(GENESIS_ROOT);
        app.pending_tx_add(txs).unwrap();
        let (ordered, root) = app
            .get_valid_proposal(self.chain_id, rc.claims.height, usize::MAX)
            .unwrap();
        let hashes: Vec<Hash> = ordered.iter().map(Transaction::hash).collect();
        Proposal::new(&self.signers[i], self.bclaims(rc, &hashes, root), rc.clone(), hashes)
            .unwrap()
    }

    pub fn pre_vote(&self, i: usize, p: &Proposal) -> PreVote {
        p.pre_vote(&self.signers[i]).unwrap()
    }

    pub fn pre_vote_nil(&self, i: usize, rc: &RCert) -> PreVoteNil {
        rc.pre_vote_nil(&self.signers[i]).unwrap()
    }

    /// Precommit backed by the prevotes of the first quorum of validators
    pub fn pre_commit(&self, i: usize, p: &Proposal) -> PreCommit {
        let pvs: Vec<PreVote> = (0..self.threshold()).map(|k| self.pre_vote(k, p)).collect();
        make_pre_commit(&self.signers[i], &pvs).unwrap()
    }

    pub fn pre_commit_nil(&self, i: usize, rc: &RCert) -> PreCommitNil {
        rc.pre_commit_nil(&self.signers[i]).unwrap()
    }

    pub fn next_round(&self, i: usize, rc: &RCert) -> NextRound {
        rc.next_round(&self.signers[i], &self.group_signers[i]).unwrap()
    }

    pub fn next_height(&self, i: usize, p: &Proposal) -> NextHeight {
        let pcs: Vec<PreCommit> = (0..self.threshold()).map(|k| self.pre_commit(k, p)).collect();
        make_next_height(&self.signers[i], &self.group_signers[i], &pcs).unwrap()
    }

    /// Header the group would produce by committing `p`
    pub fn committed_header(&self, p: &Proposal) -> BlockHeader {
        BlockHeader {
            bclaims: p.pclaims.bclaims.clone(),
            sig_group: Some(self.group_sign(p.block_hash().as_bytes())),
            tx_hashes: p.tx_hashes.clone(),
        }
    }

    pub fn outsider_pre_vote_nil(&self, rc: &RCert) -> PreVoteNil {
        rc.pre_vote_nil(&outsider()).unwrap()
    }

    /// Fresh store for validator `i`, at round (2, 1)
    pub fn storage(&self, i: usize) -> Storage {
        self.storage_for(self.vaddr(i))
    }

    fn storage_for(&self, vaddr: ValidatorAddress) -> Storage {
        let storage = Storage::new_temp().unwrap();
        storage
            .update(|txn| init_genesis(txn, vaddr, &self.validator_set, &self.genesis))
            .unwrap();
        storage
    }

    pub fn round_states(&self, i: usize) -> RoundStates {
        self.storage(i).view(RoundStates::load).unwrap()
    }

    pub fn round_states_at(&self, i: usize, rc: RCert) -> RoundStates {
        let storage = self.storage(i);
        self.move_to(&storage, i, rc);
        storage.view(RoundStates::load).unwrap()
    }

    /// Put validator `i`'s own record at `rc`
    pub fn move_to(&self, storage: &Storage, i: usize, rc: RCert) {
        let vaddr = self.vaddr(i);
        storage
            .update(|txn| -> crate::error::Result<()> {
                let mut own = txn.get_round_state(&vaddr)?.unwrap();
                own.set_rcert(rc);
                txn.set_round_state(&own)?;
                Ok(())
            })
            .unwrap();
    }

    /// Record in `storage` that peer `i` has reached `rc`
    pub fn set_peer_rcert(&self, storage: &Storage, i: usize, rc: RCert) {
        let vaddr = self.vaddr(i);
        storage
            .update(|txn| -> crate::error::Result<()> {
                let mut rs = RoundStates::load(txn)?;
                rs.round_state_mut(&vaddr)?.set_rcert(rc);
                rs.write(txn)
            })
            .unwrap();
    }

    fn resolver(&self, app: Arc<MockApplication>, peers: StaticPeers, config: &EngineConfig) -> Arc<TxResolver> {
        Arc::new(TxResolver::new(app, Arc::new(peers), config.tx_resolver.clone()))
    }

    fn build(
        &self,
        signer: ValidatorSigner,
        config: EngineConfig,
        keys: InMemoryKeyStore,
        peers: StaticPeers,
    ) -> (Engine, Arc<MockApplication>) {
        let storage = self.storage_for(signer.address());
        let app = Arc::new(MockApplication::new(GENESIS_ROOT));
        let resolver = self.resolver(app.clone(), peers, &config);
        let engine = Engine::new(storage, app.clone(), resolver, Arc::new(keys), signer, config);
        (engine, app)
    }

    fn keys_of(&self, i: usize) -> InMemoryKeyStore {
        let keys = InMemoryKeyStore::new();
        keys.insert(self.group_secret(i)).unwrap();
        keys
    }

    pub fn engine(&self, i: usize, config: EngineConfig) -> (Engine, Arc<MockApplication>) {
        self.build(self.signers[i].clone(), config, self.keys_of(i), StaticPeers::default())
    }

    pub fn engine_with_keys(
        &self,
        i: usize,
        config: EngineConfig,
        keys: InMemoryKeyStore,
    ) -> (Engine, Arc<MockApplication>) {
        self.build(self.signers[i].clone(), config, keys, StaticPeers::default())
    }

    /// Engine whose peers can serve `headers`
    pub fn engine_with_headers(
        &self,
        i: usize,
        config: EngineConfig,
        headers: Vec<BlockHeader>,
    ) -> (Engine, Arc<MockApplication>) {
        let peers = StaticPeers {
            headers,
            txs: Vec::new(),
        };
        self.build(self.signers[i].clone(), config, self.keys_of(i), peers)
    }

    /// Engine of a node outside the validator set
    pub fn observer_engine(&self, config: EngineConfig) -> (Engine, Arc<MockApplication>) {
        self.build(outsider(), config, InMemoryKeyStore::new(), StaticPeers::default())
    }

    /// Admission for validator `i`, with an empty application
    pub fn handlers(&self, i: usize) -> Handlers {
        let config = EngineConfig::default();
        let app = Arc::new(MockApplication::new(GENESIS_ROOT));
        Handlers::new(self.storage(i), self.resolver(app, StaticPeers::default(), &config))
    }
}

fn outsider() -> ValidatorSigner {
    ValidatorSigner::new(ECDSASecretKey::from_bytes(&[200; 32]).unwrap())
}
