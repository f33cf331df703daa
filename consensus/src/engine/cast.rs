/// Building, recording and broadcasting the node's own artifacts
///
/// Every cast validates what it built before anything is recorded, writes
/// the artifact into the broadcast slot of its kind and records it in the
/// node's own round state.

use super::Engine;
use crate::config::EPOCH_LENGTH;
use crate::error::{ConsensusError, Result};
use crate::objects::{
    make_block_header, make_next_height, make_pre_commit, make_round_cert, make_tx_root, BClaims,
    BlockHeader, ConsensusMessage, NextHeight, NextRound, PreCommit, PreCommitNil, PreVote, PreVoteNil,
    Proposal, RCert,
};
use crate::round_states::RoundStates;
use crate::storage::Txn;
use tracing::{debug, info};

fn recorded(updated: bool, what: &str) -> Result<()> {
    if updated {
        Ok(())
    } else {
        Err(ConsensusError::corrupt(format!("own {what} conflicts with the own round state")))
    }
}

impl Engine {
    pub(super) fn cast_new_proposal_value(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let tip = rs.own_state.sync_to_bh.bclaims.clone();
        let height = tip.height + 1;
        let (txs, state_root) =
            self.app
                .get_valid_proposal(rs.chain_id(), height, self.config.max_proposal_bytes)?;
        let tx_hashes: Vec<_> = txs.iter().map(|tx| tx.hash()).collect();
        self.resolver.add_txs(height, &txs)?;

        let bclaims = BClaims {
            chain_id: rs.chain_id(),
            height,
            tx_count: tx_hashes.len() as u32,
            prev_block: rs.prev_block(),
            tx_root: make_tx_root(&tx_hashes),
            state_root,
            header_root: self.header_root(txn, tip.height)?,
        };
        let p = Proposal::new(&self.signer, bclaims, rs.rcert().clone(), tx_hashes)?;
        p.validate_signatures()?;
        self.update_valid_value(txn, rs, &p)?;
        info!(height, round = rs.round(), txs = txs.len(), "proposing new block");
        self.set_most_recent_proposal(rs, p.clone())?;
        txn.set_broadcast(&ConsensusMessage::Proposal(p))?;
        Ok(())
    }

    /// Propose a block carried over from an earlier round
    pub(super) fn cast_proposal_from_value(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, value: &Proposal) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let p = value.re_propose(&self.signer, rs.rcert().clone())?;
        p.validate_signatures()?;
        debug!(height = rs.height(), round = rs.round(), "re-proposing held value");
        self.set_most_recent_proposal(rs, p.clone())?;
        txn.set_broadcast(&ConsensusMessage::Proposal(p))?;
        Ok(())
    }

    /// Prevote `p` only if it carries the block this node holds on to
    pub(super) fn cast_pre_vote_with_lock(
        &self,
        txn: &mut Txn<'_>,
        rs: &mut RoundStates,
        lock: &Proposal,
        p: &Proposal,
    ) -> Result<()> {
        if lock.bclaims() == p.bclaims() {
            self.cast_pre_vote(txn, rs, p)
        } else {
            self.cast_pre_vote_nil(txn, rs)
        }
    }

    pub(super) fn cast_pre_vote(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, p: &Proposal) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let pv = p.pre_vote(&self.signer)?;
        pv.validate_signatures()?;
        self.set_most_recent_valid_value(rs, p.clone());
        self.set_most_recent_pre_vote(rs, pv.clone())?;
        txn.set_broadcast(&ConsensusMessage::PreVote(pv))?;
        Ok(())
    }

    pub(super) fn cast_pre_vote_nil(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let pvn = rs.rcert().pre_vote_nil(&self.signer)?;
        pvn.validate_signatures()?;
        self.set_most_recent_pre_vote_nil(rs, pvn.clone())?;
        txn.set_broadcast(&ConsensusMessage::PreVoteNil(pvn))?;
        Ok(())
    }

    pub(super) fn cast_pre_commit(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, pre_votes: &[PreVote]) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let pc = make_pre_commit(&self.signer, pre_votes)?;
        pc.validate_signatures()?;
        self.set_most_recent_pre_commit(rs, pc.clone())?;
        txn.set_broadcast(&ConsensusMessage::PreCommit(pc))?;
        Ok(())
    }

    pub(super) fn cast_pre_commit_nil(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let pcn = rs.rcert().pre_commit_nil(&self.signer)?;
        pcn.validate_signatures()?;
        self.set_most_recent_pre_commit_nil(rs, pcn.clone())?;
        txn.set_broadcast(&ConsensusMessage::PreCommitNil(pcn))?;
        Ok(())
    }

    pub(super) fn cast_next_round(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let nr = rs.rcert().next_round(&self.signer, self.group_signer()?)?;
        nr.validate_signatures()?;
        debug!(height = rs.height(), round = rs.round(), "voting for next round");
        self.set_most_recent_next_round(rs, nr.clone())?;
        txn.set_broadcast(&ConsensusMessage::NextRound(nr))?;
        Ok(())
    }

    /// Aggregate a next round quorum into the certificate of the next round
    /// and move there. Peers build the same certificate from the same votes.
    pub(super) fn cast_next_round_rcert(&self, rs: &mut RoundStates, next_rounds: &[NextRound]) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let rc = make_round_cert(self.group_signer()?, next_rounds)?;
        rc.validate_signature()?;
        self.set_most_recent_rcert(rs, rc);
        Ok(())
    }

    /// Join a next height quorum someone else already started
    pub(super) fn cast_next_height_from_next_height(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, nh: &NextHeight) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let own = nh.plagiarize(&self.signer, self.group_signer()?)?;
        own.validate_signatures()?;
        self.set_most_recent_next_height(rs, own.clone())?;
        txn.set_broadcast(&ConsensusMessage::NextHeight(own))?;
        Ok(())
    }

    pub(super) fn cast_next_height_from_pre_commits(
        &self,
        txn: &mut Txn<'_>,
        rs: &mut RoundStates,
        pre_commits: &[PreCommit],
    ) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let nh = make_next_height(&self.signer, self.group_signer()?, pre_commits)?;
        nh.validate_signatures()?;
        self.set_most_recent_next_height(rs, nh.clone())?;
        txn.set_broadcast(&ConsensusMessage::NextHeight(nh))?;
        Ok(())
    }

    pub(super) fn cast_new_committed_block_header(
        &self,
        txn: &mut Txn<'_>,
        rs: &mut RoundStates,
        next_heights: &[NextHeight],
    ) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (bh, rc) = make_block_header(self.group_signer()?, next_heights)?;
        rc.validate_signature()?;
        self.set_most_recent_block_header(txn, rs, bh)
    }

    /// Commit the valid value on the strength of a round 1 certificate of
    /// the following height, which signs the same block hash
    pub(super) fn cast_new_committed_block_from_proposal_and_rcert(
        &self,
        txn: &mut Txn<'_>,
        rs: &mut RoundStates,
        p: &Proposal,
        rc: &RCert,
    ) -> Result<()> {
        let bh = BlockHeader {
            bclaims: p.bclaims().clone(),
            sig_group: rc.sig_group.clone(),
            tx_hashes: p.tx_hashes.clone(),
        };
        self.set_most_recent_block_header(txn, rs, bh)
    }

    fn set_most_recent_proposal(&self, rs: &mut RoundStates, p: Proposal) -> Result<()> {
        recorded(rs.own_round_state_mut().set_proposal(p)?, "proposal")
    }

    fn set_most_recent_pre_vote(&self, rs: &mut RoundStates, pv: PreVote) -> Result<()> {
        recorded(rs.own_round_state_mut().set_pre_vote(pv)?, "prevote")?;
        rs.own_validating_state.set_pre_vote_step_started();
        Ok(())
    }

    fn set_most_recent_pre_vote_nil(&self, rs: &mut RoundStates, pvn: PreVoteNil) -> Result<()> {
        recorded(rs.own_round_state_mut().set_pre_vote_nil(pvn)?, "prevote nil")?;
        rs.own_validating_state.set_pre_vote_step_started();
        Ok(())
    }

    /// Precommitting locks the value
    fn set_most_recent_pre_commit(&self, rs: &mut RoundStates, pc: PreCommit) -> Result<()> {
        let p = pc.proposal.clone();
        recorded(rs.own_round_state_mut().set_pre_commit(pc)?, "precommit")?;
        rs.own_validating_state.locked_value = Some(p.clone());
        rs.own_validating_state.valid_value = Some(p);
        rs.own_validating_state.set_pre_commit_step_started();
        Ok(())
    }

    fn set_most_recent_pre_commit_nil(&self, rs: &mut RoundStates, pcn: PreCommitNil) -> Result<()> {
        recorded(rs.own_round_state_mut().set_pre_commit_nil(pcn)?, "precommit nil")?;
        rs.own_validating_state.set_pre_commit_step_started();
        Ok(())
    }

    fn set_most_recent_next_round(&self, rs: &mut RoundStates, nr: NextRound) -> Result<()> {
        recorded(rs.own_round_state_mut().set_next_round(nr)?, "next round vote")
    }

    fn set_most_recent_next_height(&self, rs: &mut RoundStates, nh: NextHeight) -> Result<()> {
        let p = nh.proposal().clone();
        recorded(rs.own_round_state_mut().set_next_height(nh)?, "next height vote")?;
        rs.own_validating_state.locked_value = Some(p.clone());
        rs.own_validating_state.valid_value = Some(p);
        Ok(())
    }

    /// Move the own record to `rc` and restart the step timers
    pub(super) fn set_most_recent_rcert(&self, rs: &mut RoundStates, rc: RCert) {
        debug!(height = rc.claims.height, round = rc.claims.round, "entering round");
        rs.own_round_state_mut().set_rcert(rc);
        rs.own_validating_state.set_round_started();
    }

    pub(super) fn set_most_recent_valid_value(&self, rs: &mut RoundStates, p: Proposal) {
        rs.own_validating_state.valid_value = Some(p);
    }

    /// Apply and persist a committed header, then start round 1 of the
    /// following height
    pub(super) fn set_most_recent_block_header(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, bh: BlockHeader) -> Result<()> {
        let height = bh.bclaims.height;
        let group_key = bh.validate_signatures()?;
        if height > 1 && group_key != rs.validator_set.group_key {
            return Err(ConsensusError::invalid(format!(
                "header {height} signed by a group other than the validator set"
            )));
        }

        let txs = self.get_txs(height, 1, &bh.tx_hashes)?;
        let state_root = self.app.apply_state(bh.bclaims.chain_id, height, &txs)?;
        if state_root != bh.bclaims.state_root {
            return Err(ConsensusError::invalid(format!(
                "state root after applying block {height} does not match its header"
            )));
        }

        txn.set_block_header(&bh)?;
        let header_root = txn.commit_header_root(&bh)?;
        if height % EPOCH_LENGTH == 0 {
            let pending = std::mem::replace(&mut rs.own_state.pending_snapshot, bh.clone());
            rs.own_state.canonical_snapshot = pending;
            txn.set_snapshot_header(&bh)?;
            info!(height, "snapshot header recorded");
        }
        if rs.own_state.max_bh_seen.bclaims.height < height {
            rs.own_state.max_bh_seen = bh.clone();
        }
        rs.own_state.sync_to_bh = bh.clone();

        rs.own_round_state_mut().set_rcert(bh.next_rcert());
        rs.own_validating_state.clear_values();
        rs.own_validating_state.set_round_started();

        info!(
            height,
            txs = txs.len(),
            block_hash = %bh.block_hash(),
            header_root = %header_root,
            "committed block"
        );
        txn.set_broadcast(&ConsensusMessage::BlockHeader(bh))?;
        Ok(())
    }
}
