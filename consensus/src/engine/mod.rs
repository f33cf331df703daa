/// Per-node decision engine
///
/// One call to [`Engine::update_local_state`] is one tick. The tick loads
/// the node's view of the current round, picks the single highest-priority
/// action that applies, performs it and writes the view back, all inside
/// one store transaction. A tick that fails leaves the store untouched.
///
/// Ticks are not re-entrant: the caller drives them from a single task and
/// feeds admitted messages through [`crate::handlers::Handlers`] in between.

mod cast;
mod dispatch;
mod steps;

pub use dispatch::Handler;

use crate::application::{Application, Transaction};
use crate::config::EngineConfig;
use crate::crypto::{BLSPublicKey, BLSSecretKey, GroupSigner, Hash, ValidatorAddress, ValidatorSigner};
use crate::error::{ConsensusError, Result};
use crate::objects::{make_tx_root, BClaims, BlockHeader};
use crate::round_states::RoundStates;
use crate::storage::{Storage, Txn};
use crate::tx_resolver::TxResolver;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn, Instrument, Span};

/// Source of the BLS secret behind a validator's published group share
pub trait GroupKeyStore: Send + Sync {
    fn group_secret(&self, share: &BLSPublicKey) -> Result<Option<BLSSecretKey>>;
}

#[derive(Default)]
pub struct InMemoryKeyStore {
    keys: RwLock<HashMap<BLSPublicKey, BLSSecretKey>>,
}

impl InMemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, secret: BLSSecretKey) -> Result<()> {
        let mut keys = self
            .keys
            .write()
            .map_err(|_| ConsensusError::corrupt("key store lock poisoned"))?;
        keys.insert(secret.public_key(), secret);
        Ok(())
    }
}

impl GroupKeyStore for InMemoryKeyStore {
    fn group_secret(&self, share: &BLSPublicKey) -> Result<Option<BLSSecretKey>> {
        let keys = self
            .keys
            .read()
            .map_err(|_| ConsensusError::corrupt("key store lock poisoned"))?;
        Ok(keys.get(share).cloned())
    }
}

/// Snapshot of where the node stands
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub height: u32,
    pub round: u32,
    pub sync_to_height: u32,
    pub max_seen_height: u32,
    pub is_validator: bool,
    pub in_sync: bool,
    /// Short hex prefix of the last committed block hash
    pub block_hash: String,
}

pub struct Engine {
    storage: Storage,
    app: Arc<dyn Application>,
    resolver: Arc<TxResolver>,
    keystore: Arc<dyn GroupKeyStore>,
    signer: ValidatorSigner,
    /// Rebuilt whenever the validator set's group changes
    group_signer: Option<GroupSigner>,
    config: EngineConfig,
    span: Span,
}

impl Engine {
    pub fn new(
        storage: Storage,
        app: Arc<dyn Application>,
        resolver: Arc<TxResolver>,
        keystore: Arc<dyn GroupKeyStore>,
        signer: ValidatorSigner,
        config: EngineConfig,
    ) -> Self {
        let span = tracing::info_span!("engine", vaddr = %signer.address());
        Self {
            storage,
            app,
            resolver,
            keystore,
            signer,
            group_signer: None,
            config,
            span,
        }
    }

    pub fn address(&self) -> ValidatorAddress {
        self.signer.address()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one tick. Returns whether the node considers itself in sync;
    /// `false` means the caller should run [`Engine::sync`].
    pub fn update_local_state(&mut self) -> Result<bool> {
        let span = self.span.clone();
        let _enter = span.enter();
        let storage = self.storage.clone();
        match storage.update(|txn| self.tick(txn)) {
            Ok(in_sync) => Ok(in_sync),
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "tick aborted");
                Ok(false)
            }
            Err(e) => {
                error!(error = %e, "tick failed");
                Err(e)
            }
        }
    }

    fn tick(&mut self, txn: &mut Txn<'_>) -> Result<bool> {
        if !self.update_loaded_objects(txn)? {
            return Ok(true);
        }
        let mut rs = RoundStates::load(txn)?;
        let sync_to = rs.own_state.sync_to_bh.bclaims.height;
        let in_sync = if sync_to + 1 <= rs.own_state.max_bh_seen.bclaims.height {
            debug!(sync_to, max_seen = rs.own_state.max_bh_seen.bclaims.height, "behind");
            false
        } else {
            let in_sync = self.dispatch(txn, &mut rs)?;
            rs.write(txn)?;
            in_sync
        };
        self.resolver.clean_cache(sync_to)?;
        Ok(in_sync)
    }

    /// Bring the validator set, own address and group signer in line with
    /// the height about to be decided. Returns `false` when something was
    /// refreshed, in which case the tick ends after persisting.
    fn update_loaded_objects(&mut self, txn: &mut Txn<'_>) -> Result<bool> {
        let mut own_state = txn
            .get_own_state()?
            .ok_or_else(|| ConsensusError::corrupt("own state missing"))?;
        let mut ovs = txn.get_own_validating_state()?.unwrap_or_default();
        let height = own_state.sync_to_bh.bclaims.height + 1;
        let mut ok = true;

        let mut vs = txn
            .get_validator_set(height)?
            .ok_or_else(|| ConsensusError::corrupt(format!("no validator set at height {height}")))?;
        if let Some(post) = txn.get_validator_set_post_application(vs.not_before)? {
            if post.group_key != vs.group_key {
                info!(not_before = post.not_before, validators = post.len(), "validator set rotated");
                txn.set_validator_set(&post)?;
                vs = post;
                ok = false;
            }
        }

        let vaddr = self.signer.address();
        if own_state.vaddr != vaddr {
            own_state.vaddr = vaddr;
            ovs.vaddr = vaddr;
            ok = false;
        }

        if let Some(validator) = vs.get(&vaddr) {
            let stale_signer = self
                .group_signer
                .as_ref()
                .map_or(true, |g| g.group_key() != vs.group_key);
            if vs.group_key != own_state.group_key || stale_signer {
                ok = false;
                let Some(secret) = self.keystore.group_secret(&validator.group_share)? else {
                    warn!(height, "no group secret for own share");
                    return Ok(false);
                };
                let signer = GroupSigner::new(secret, vs.group_shares())
                    .map_err(|e| ConsensusError::SignerMismatch(e.to_string()))?;
                if signer.share() != &validator.group_share {
                    return Err(ConsensusError::SignerMismatch(format!(
                        "secret does not produce the share published for {vaddr}"
                    )));
                }
                self.group_signer = Some(signer);
            }
        } else {
            self.group_signer = None;
        }

        if vs.group_key != own_state.group_key {
            own_state.group_key = vs.group_key;
            ovs.group_key = vs.group_key;
            ok = false;
        }

        if !ok {
            debug!(height, "loaded objects refreshed");
            ovs.set_round_started();
            txn.set_own_state(&own_state)?;
            txn.set_own_validating_state(&ovs)?;
        }
        Ok(ok)
    }

    /// Catch up by one committed header fetched from peers. Returns whether
    /// the node is now at the highest header it has seen.
    pub async fn sync(&self) -> Result<bool> {
        let span = self.span.clone();
        self.sync_inner().instrument(span).await
    }

    async fn sync_inner(&self) -> Result<bool> {
        let (sync_to, max_seen) = self.storage.view(|txn| {
            let own = txn
                .get_own_state()?
                .ok_or_else(|| ConsensusError::corrupt("own state missing"))?;
            Ok::<_, ConsensusError>((own.sync_to_bh.bclaims.height, own.max_bh_seen.bclaims.height))
        })?;
        if sync_to >= max_seen {
            return Ok(true);
        }

        let target = sync_to + 1;
        let header = match self.resolver.fetch_block_header(target).await {
            Ok(Some(bh)) => bh,
            Ok(None) => {
                debug!(height = target, "no peer has the header yet");
                return Ok(false);
            }
            Err(e) => {
                warn!(height = target, error = %e, "block header request failed");
                return Ok(false);
            }
        };

        match self.storage.update(|txn| self.sync_one(txn, header)) {
            Ok(done) => Ok(done),
            Err(e) if e.is_recoverable() => {
                debug!(height = target, error = %e, "sync attempt aborted");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn sync_one(&self, txn: &mut Txn<'_>, bh: BlockHeader) -> Result<bool> {
        let mut rs = RoundStates::load(txn)?;
        let tip = &rs.own_state.sync_to_bh;
        if bh.bclaims.chain_id != tip.bclaims.chain_id {
            return Err(ConsensusError::invalid("synced header is for another chain"));
        }
        if bh.bclaims.height != tip.bclaims.height + 1 {
            return Err(ConsensusError::invalid("synced header does not follow the tip"));
        }
        if bh.bclaims.prev_block != tip.block_hash() {
            return Err(ConsensusError::invalid("synced header does not extend the tip"));
        }
        let group_key = bh.validate_signatures()?;
        let vs = txn.get_validator_set(bh.bclaims.height)?.ok_or_else(|| {
            ConsensusError::corrupt(format!("no validator set at height {}", bh.bclaims.height))
        })?;
        if group_key != vs.group_key {
            return Err(ConsensusError::invalid("synced header signed by an unknown group"));
        }

        let txs = self.get_txs(bh.bclaims.height, 1, &bh.tx_hashes)?;
        if !self.is_valid(txn, &rs, &bh.bclaims, &bh.tx_hashes, &txs)? {
            warn!(height = bh.bclaims.height, "synced header rejected by the application");
            return Ok(false);
        }
        self.set_most_recent_block_header(txn, &mut rs, bh)?;
        let done = rs.own_state.is_synced();
        rs.write(txn)?;
        Ok(done)
    }

    pub fn status(&self) -> Result<EngineStatus> {
        self.storage.view(|txn| {
            let rs = RoundStates::load(txn)?;
            let hash = rs.own_state.sync_to_bh.block_hash();
            Ok(EngineStatus {
                height: rs.height(),
                round: rs.round(),
                sync_to_height: rs.own_state.sync_to_bh.bclaims.height,
                max_seen_height: rs.own_state.max_bh_seen.bclaims.height,
                is_validator: rs.is_current_validator(),
                in_sync: rs.own_state.is_synced(),
                block_hash: hex::encode(&hash.as_bytes()[..4]),
            })
        })
    }

    fn group_signer(&self) -> Result<&GroupSigner> {
        self.group_signer
            .as_ref()
            .ok_or_else(|| ConsensusError::corrupt("validating without a group signer"))
    }

    /// Bodies for `hashes`, or `MissingTransactions` while any is still
    /// being downloaded
    fn get_txs(&self, height: u32, round: u32, hashes: &[Hash]) -> Result<Vec<Transaction>> {
        let (txs, missing) = self.resolver.get_txs(height, round, hashes)?;
        if !missing.is_empty() {
            return Err(ConsensusError::MissingTransactions);
        }
        Ok(txs)
    }

    fn header_root(&self, txn: &Txn<'_>, height: u32) -> Result<Hash> {
        txn.get_header_root(height)?
            .ok_or_else(|| ConsensusError::corrupt(format!("no header root at height {height}")))
    }

    /// Whether `bclaims` is an acceptable successor of the last committed
    /// header
    fn is_valid(
        &self,
        txn: &Txn<'_>,
        rs: &RoundStates,
        bclaims: &BClaims,
        tx_hashes: &[Hash],
        txs: &[Transaction],
    ) -> Result<bool> {
        let tip = &rs.own_state.sync_to_bh;
        if bclaims.chain_id != tip.bclaims.chain_id || bclaims.height != tip.bclaims.height + 1 {
            return Ok(false);
        }
        if bclaims.prev_block != tip.block_hash() {
            debug!(height = bclaims.height, "block does not extend the tip");
            return Ok(false);
        }
        if bclaims.header_root != self.header_root(txn, tip.bclaims.height)? {
            debug!(height = bclaims.height, "header root mismatch");
            return Ok(false);
        }
        if bclaims.validate_tx_hashes(tx_hashes).is_err() {
            return Ok(false);
        }
        Ok(self
            .app
            .is_valid(bclaims.chain_id, bclaims.height, &bclaims.state_root, txs)?)
    }

    /// Claims of the empty block extending the tip
    fn empty_block_claims(&self, txn: &Txn<'_>, rs: &RoundStates) -> Result<BClaims> {
        let tip = &rs.own_state.sync_to_bh.bclaims;
        Ok(BClaims {
            chain_id: rs.chain_id(),
            height: rs.height(),
            tx_count: 0,
            prev_block: rs.prev_block(),
            tx_root: make_tx_root(&[]),
            state_root: tip.state_root,
            header_root: self.header_root(txn, tip.height)?,
        })
    }
}

/// Turn a recoverable failure into `false`
fn tolerated(result: Result<()>) -> Result<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_recoverable() => {
            debug!(error = %e, "step skipped");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::objects::ConsensusMessage;
    use crate::test_fixtures::Network;

    #[test]
    fn test_first_tick_loads_group_signer() {
        let net = Network::new(4);
        let (mut engine, _) = net.engine(0, EngineConfig::default());
        assert!(engine.group_signer.is_none());
        assert!(engine.update_local_state().unwrap());
        assert_eq!(
            engine.group_signer.as_ref().map(GroupSigner::group_key),
            Some(net.validator_set.group_key)
        );

        // Second tick dispatches normally and stays quiet before timeouts
        assert!(engine.update_local_state().unwrap());
        let status = engine.status().unwrap();
        assert_eq!((status.height, status.round), (2, 1));
        assert!(status.is_validator);
    }

    #[test]
    fn test_missing_group_secret_skips_tick() {
        let net = Network::new(4);
        let (mut engine, _) = net.engine_with_keys(1, EngineConfig::default(), InMemoryKeyStore::new());
        assert!(engine.update_local_state().unwrap());
        assert!(engine.update_local_state().unwrap());
        assert!(engine.group_signer.is_none());
        let slots = engine.storage().view(|txn| txn.get_broadcast()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn test_wrong_group_secret_is_signer_mismatch() {
        let net = Network::new(4);
        let keys = InMemoryKeyStore::new();
        // Index the secret of validator 2 under validator 1's share
        let wrong = net.group_secret(2);
        keys.keys
            .write()
            .unwrap()
            .insert(net.validator_set.validators[1].group_share.clone(), wrong);
        let (mut engine, _) = net.engine_with_keys(1, EngineConfig::default(), keys);
        assert!(matches!(
            engine.update_local_state(),
            Err(ConsensusError::SignerMismatch(_))
        ));
    }

    #[test]
    fn test_proposer_proposes_on_second_tick() {
        let net = Network::new(4);
        let proposer = net.proposer_index(2, 1);
        let (mut engine, app) = net.engine(proposer, EngineConfig::default());
        app.pending_tx_add(&net.txs(3)).unwrap();

        engine.update_local_state().unwrap();
        engine.update_local_state().unwrap();

        let slots = engine.storage().view(|txn| txn.get_broadcast()).unwrap();
        let [ConsensusMessage::Proposal(p)] = slots.as_slice() else {
            panic!("expected a single proposal, got {slots:?}");
        };
        assert_eq!(p.tx_hashes.len(), 3);
        assert_eq!(p.bclaims().height, 2);
        assert_eq!(p.bclaims().prev_block, net.genesis.block_hash());
        let rs = engine.storage().view(|txn| RoundStates::load(txn)).unwrap();
        assert_eq!(rs.valid_value(), Some(p));
        assert!(rs.own_round_state().p_current(rs.rcert()));
    }

    #[test]
    fn test_non_proposer_idles_before_timeout() {
        let net = Network::new(4);
        let idx = (net.proposer_index(2, 1) + 1) % 4;
        let (mut engine, _) = net.engine(idx, EngineConfig::default());
        engine.update_local_state().unwrap();
        engine.update_local_state().unwrap();
        let slots = engine.storage().view(|txn| txn.get_broadcast()).unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn test_behind_node_reports_out_of_sync() {
        let net = Network::new(4);
        let (mut engine, _) = net.engine(0, EngineConfig::default());
        engine.update_local_state().unwrap();
        let bh = net.committed_header(&net.proposal_for(&net.rcert(2, 1)));
        engine
            .storage()
            .update(|txn| {
                let mut own = txn.get_own_state()?.unwrap();
                own.max_bh_seen = bh.clone();
                txn.set_own_state(&own)
            })
            .unwrap();
        assert!(!engine.update_local_state().unwrap());
        assert!(!engine.status().unwrap().in_sync);
    }

    #[tokio::test]
    async fn test_sync_applies_fetched_header() {
        let net = Network::new(4);
        let p = net.proposal_for(&net.rcert(2, 1));
        let bh = net.committed_header(&p);
        let (mut engine, _) = net.engine_with_headers(0, EngineConfig::default(), vec![bh.clone()]);
        engine.update_local_state().unwrap();
        engine
            .storage()
            .update(|txn| {
                let mut own = txn.get_own_state()?.unwrap();
                own.max_bh_seen = bh.clone();
                txn.set_own_state(&own)
            })
            .unwrap();

        assert!(engine.sync().await.unwrap());
        let status = engine.status().unwrap();
        assert_eq!(status.sync_to_height, 2);
        assert_eq!((status.height, status.round), (3, 1));
        assert!(status.in_sync);
        let stored = engine.storage().view(|txn| txn.get_block_header(2)).unwrap();
        assert_eq!(stored, Some(bh));
    }

    #[tokio::test]
    async fn test_sync_without_header_is_not_done() {
        let net = Network::new(4);
        let bh = net.committed_header(&net.proposal_for(&net.rcert(2, 1)));
        let (engine, _) = net.engine(0, EngineConfig::default());
        engine
            .storage()
            .update(|txn| {
                let mut own = txn.get_own_state()?.unwrap();
                own.max_bh_seen = bh.clone();
                txn.set_own_state(&own)
            })
            .unwrap();
        assert!(!engine.sync().await.unwrap());
        assert_eq!(engine.status().unwrap().sync_to_height, 1);
    }

    #[test]
    fn test_status_serializes() {
        let net = Network::new(4);
        let (engine, _) = net.engine(0, EngineConfig::default());
        let status = engine.status().unwrap();
        let json = serde_json::to_string(&status).unwrap();
        let back: EngineStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
        assert_eq!(status.block_hash.len(), 8);
    }
}
