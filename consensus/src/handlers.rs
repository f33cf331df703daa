/// Admission of inbound protocol messages
///
/// A message is first checked against what this node knows (chain, height,
/// signatures, membership) without touching the store, then recorded in
/// the round state of its author. Both halves run against the same store
/// the engine ticks on; recording happens in its own write transaction.

use crate::config::DEAD_BLOCK_ROUND;
use crate::crypto::{GroupKey, ValidatorAddress};
use crate::error::{ConsensusError, Result};
use crate::objects::{sub_one_no_zero, ConsensusMessage, HeightRound, Signers, ValidatorSet};
use crate::round_states::RoundStates;
use crate::storage::{Storage, Txn};
use crate::tx_resolver::TxResolver;
use std::sync::Arc;
use tracing::{debug, trace, Span};

/// Height whose validator set judges a message at (height, round). Round 1
/// messages carry the certificate of the previous height; later rounds
/// carry one of their own height.
fn set_height(height: u32, round: u32) -> u32 {
    let below = sub_one_no_zero(height);
    if below <= 2 || round == 1 {
        below
    } else {
        height
    }
}

/// Membership checks against one validator set and group key
struct Membership {
    set: ValidatorSet,
    group_key: GroupKey,
}

impl Membership {
    fn resolve(txn: &Txn<'_>, height: u32, round: u32, message_key: &GroupKey) -> Result<Self> {
        let at = set_height(height, round);
        let set = txn
            .get_validator_set(at)?
            .ok_or_else(|| ConsensusError::invalid(format!("no validator set at height {at}")))?;
        let group_key = if round == 1 {
            if !message_key.is_zero() && message_key != &set.group_key {
                return Err(ConsensusError::invalid("certificate signed by an unknown group"));
            }
            set.group_key
        } else {
            *message_key
        };
        Ok(Self { set, group_key })
    }

    fn member(&self, vaddr: Option<ValidatorAddress>, role: &str) -> Result<()> {
        let vaddr = vaddr.ok_or_else(|| ConsensusError::invalid(format!("{role} missing")))?;
        if !self.set.is_valid_tuple(&vaddr, &self.group_key) {
            return Err(ConsensusError::invalid(format!("{role} {vaddr} is not a validator")));
        }
        Ok(())
    }

    fn proposer(&self, signers: &Signers, height: u32, round: u32) -> Result<()> {
        self.member(signers.proposer, "proposer")?;
        if round == DEAD_BLOCK_ROUND {
            return Ok(());
        }
        let vaddr = signers.proposer.unwrap_or_default();
        if !self.set.is_proposer(&vaddr, height, round) {
            return Err(ConsensusError::invalid(format!(
                "{vaddr} is not the proposer of ({height}, {round})"
            )));
        }
        Ok(())
    }

    fn share_holder(&self, signers: &Signers) -> Result<()> {
        let vaddr = signers
            .voter
            .ok_or_else(|| ConsensusError::invalid("voter missing"))?;
        let share = signers
            .group_share
            .as_ref()
            .ok_or_else(|| ConsensusError::invalid("group share missing"))?;
        if !self.set.is_valid_triplet(&vaddr, share, &self.group_key) {
            return Err(ConsensusError::invalid(format!("{vaddr} signed with a foreign share")));
        }
        Ok(())
    }

    fn cosigners(&self, signers: &Signers) -> Result<()> {
        for vaddr in &signers.cosigners {
            self.member(Some(*vaddr), "cosigner")?;
        }
        Ok(())
    }
}

/// A header is acceptable when signed by the set effective at its height,
/// or by the set the application staged to replace it
fn check_block_header_group(txn: &Txn<'_>, group_key: &GroupKey, height: u32) -> Result<()> {
    let set = txn
        .get_validator_set(height)?
        .ok_or_else(|| ConsensusError::invalid(format!("no validator set at height {height}")))?;
    if &set.group_key == group_key {
        return Ok(());
    }
    match txn.get_validator_set_post_application(set.not_before)? {
        Some(post) if &post.group_key == group_key => Ok(()),
        _ => Err(ConsensusError::invalid(format!(
            "header {height} signed by an unknown group"
        ))),
    }
}

pub struct Handlers {
    storage: Storage,
    resolver: Arc<TxResolver>,
    span: Span,
}

impl Handlers {
    pub fn new(storage: Storage, resolver: Arc<TxResolver>) -> Self {
        Self {
            storage,
            resolver,
            span: tracing::info_span!("handlers"),
        }
    }

    /// Validate and record one inbound message
    pub fn admit(&self, msg: ConsensusMessage) -> Result<()> {
        let _enter = self.span.enter();
        let kind = msg.kind();
        let (height, round) = msg.height_round();
        let result = self.pre_validate(&msg).and_then(|_| self.store(msg));
        match &result {
            Ok(()) => trace!(kind, height, round, "admitted"),
            Err(e) => debug!(kind, height, round, error = %e, "rejected"),
        }
        result
    }

    /// Stateless and membership checks; returns the recovered signers
    pub fn pre_validate(&self, msg: &ConsensusMessage) -> Result<Signers> {
        self.storage.view(|txn| {
            let own_state = txn
                .get_own_state()?
                .ok_or_else(|| ConsensusError::corrupt("own state missing"))?;
            let own = txn
                .get_round_state(&own_state.vaddr)?
                .ok_or_else(|| ConsensusError::corrupt("own round state missing"))?;
            if msg.chain_id() != own.rcert.chain_id() {
                return Err(ConsensusError::invalid(format!(
                    "message for chain {} on chain {}",
                    msg.chain_id(),
                    own.rcert.chain_id()
                )));
            }

            let (height, round) = msg.height_round();
            if let ConsensusMessage::BlockHeader(bh) = msg {
                let group_key = bh.validate_signatures()?;
                check_block_header_group(txn, &group_key, height)?;
                return Ok(Signers {
                    group_key,
                    ..Signers::default()
                });
            }

            let (own_height, own_round) = own.height_round();
            if height < own_height {
                return Err(ConsensusError::stale(format!(
                    "message for height {height} below {own_height}"
                )));
            }
            let next_height = matches!(msg, ConsensusMessage::NextHeight(_));
            if height == own_height && round < own_round && !next_height {
                return Err(ConsensusError::stale(format!(
                    "message for round {round} below {own_round}"
                )));
            }

            let signers = msg.validate_signatures()?;
            let membership = Membership::resolve(txn, height, round, &signers.group_key)?;
            match msg {
                ConsensusMessage::Proposal(_) => {
                    membership.proposer(&signers, height, round)?;
                }
                ConsensusMessage::PreVote(_) | ConsensusMessage::PreCommit(_) => {
                    membership.proposer(&signers, height, round)?;
                    membership.member(signers.voter, "voter")?;
                    membership.cosigners(&signers)?;
                }
                ConsensusMessage::PreVoteNil(_) | ConsensusMessage::PreCommitNil(_) => {
                    membership.member(signers.voter, "voter")?;
                }
                ConsensusMessage::NextRound(_) => {
                    membership.share_holder(&signers)?;
                }
                ConsensusMessage::NextHeight(_) => {
                    membership.proposer(&signers, height, round)?;
                    membership.share_holder(&signers)?;
                    membership.cosigners(&signers)?;
                }
                ConsensusMessage::BlockHeader(_) => {}
            }
            Ok(signers)
        })
    }

    /// Record a validated message in its author's round state
    pub fn store(&self, msg: ConsensusMessage) -> Result<()> {
        let download = match &msg {
            ConsensusMessage::Proposal(p) => Some((p.height(), p.round(), p.tx_hashes.clone())),
            _ => None,
        };
        self.storage.update(|txn| {
            let mut rs = RoundStates::load(txn)?;
            match msg {
                ConsensusMessage::Proposal(p) => rs.set_proposal(p)?,
                ConsensusMessage::PreVote(pv) => rs.set_pre_vote(pv)?,
                ConsensusMessage::PreVoteNil(pvn) => rs.set_pre_vote_nil(pvn)?,
                ConsensusMessage::PreCommit(pc) => rs.set_pre_commit(pc)?,
                ConsensusMessage::PreCommitNil(pcn) => rs.set_pre_commit_nil(pcn)?,
                ConsensusMessage::NextRound(nr) => rs.set_next_round(nr)?,
                ConsensusMessage::NextHeight(nh) => rs.set_next_height(nh)?,
                ConsensusMessage::BlockHeader(bh) => {
                    let height = bh.bclaims.height;
                    if height <= rs.own_state.max_bh_seen.bclaims.height
                        || height <= rs.own_state.sync_to_bh.bclaims.height
                    {
                        return Err(ConsensusError::stale(format!("header {height} already seen")));
                    }
                    rs.own_state.max_bh_seen = bh;
                }
            }
            rs.write(txn)
        })?;

        // Start fetching the block's transactions before anyone needs them
        if let Some((height, round, hashes)) = download {
            self.resolver.get_txs(height, round, &hashes)?;
        }
        Ok(())
    }
}
