/// Step handlers of the round ladder
///
/// Every handler is a no-op for nodes outside the validator set, except the
/// height and round jumps, which observers use to follow the chain.

use super::{tolerated, Engine};
use crate::config::{DEAD_BLOCK_ROUND, DEAD_BLOCK_ROUND_NR};
use crate::error::{ConsensusError, Result};
use crate::objects::{
    BClaims, BlockHeader, HeightRound, NextHeight, PClaims, PreCommit, PreVote, Proposal, RCert,
};
use crate::round_states::RoundStates;
use crate::storage::Txn;
use tracing::debug;

fn pre_vote_claims(pv: &PreVote) -> &PClaims {
    &pv.proposal.pclaims
}

fn pre_commit_claims(pc: &PreCommit) -> &PClaims {
    &pc.proposal.pclaims
}

fn next_height_claims(nh: &NextHeight) -> &BClaims {
    &nh.claims.proposal.pclaims.bclaims
}

/// The largest group of votes agreeing on `key`, if it reaches `threshold`.
/// A returned group is never empty.
pub(crate) fn quorum<T, K: PartialEq>(votes: Vec<T>, threshold: usize, key: fn(&T) -> &K) -> Option<Vec<T>> {
    let threshold = threshold.max(1);
    let mut groups: Vec<Vec<T>> = Vec::new();
    for vote in votes {
        let slot = groups
            .iter()
            .position(|g| g.first().map_or(false, |first| key(first) == key(&vote)));
        match slot {
            Some(i) => groups[i].push(vote),
            None => groups.push(vec![vote]),
        }
    }
    groups
        .into_iter()
        .filter(|g| g.len() >= threshold)
        .max_by_key(Vec::len)
}

impl Engine {
    fn pre_vote_quorum(&self, rs: &RoundStates) -> (Option<Vec<PreVote>>, usize, usize) {
        let (pre_votes, nils) = rs.current_pre_votes();
        let total = pre_votes.len();
        (quorum(pre_votes, rs.threshold(), pre_vote_claims), total, nils)
    }

    fn pre_commit_quorum(&self, rs: &RoundStates) -> (Option<Vec<PreCommit>>, usize, usize) {
        let (pre_commits, nils) = rs.current_pre_commits();
        let total = pre_commits.len();
        (quorum(pre_commits, rs.threshold(), pre_commit_claims), total, nils)
    }

    pub(super) fn do_pending_proposal(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() || rs.round() == DEAD_BLOCK_ROUND {
            return Ok(());
        }
        if rs.locked_value_current() {
            if let Some(locked) = rs.locked_value().cloned() {
                return self.cast_proposal_from_value(txn, rs, &locked);
            }
        }
        if rs.valid_value_current() {
            if let Some(valid) = rs.valid_value().cloned() {
                return self.cast_proposal_from_value(txn, rs, &valid);
            }
        }
        self.cast_new_proposal_value(txn, rs)
    }

    pub(super) fn do_pending_pre_vote(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        if rs.round() == DEAD_BLOCK_ROUND {
            return self.cast_dead_block_pre_vote(txn, rs);
        }
        let Some(p) = rs.current_proposal().cloned() else {
            return self.cast_pre_vote_nil(txn, rs);
        };
        if rs.locked_value_current() {
            if let Some(locked) = rs.locked_value().cloned() {
                return self.cast_pre_vote_with_lock(txn, rs, &locked, &p);
            }
        }
        if rs.valid_value_current() {
            if let Some(valid) = rs.valid_value().cloned() {
                return self.cast_pre_vote_with_lock(txn, rs, &valid, &p);
            }
        }
        let acceptable = match self.get_txs(p.height(), p.round(), &p.tx_hashes) {
            Ok(txs) => self.is_valid(txn, rs, p.bclaims(), &p.tx_hashes, &txs)?,
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "proposal transactions unavailable");
                false
            }
            Err(e) => return Err(e),
        };
        if acceptable {
            self.cast_pre_vote(txn, rs, &p)
        } else {
            self.cast_pre_vote_nil(txn, rs)
        }
    }

    /// In the dead block round everyone prevotes the empty block. An
    /// identical one already prevoted by a peer is reused so the votes
    /// line up.
    fn cast_dead_block_pre_vote(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        rs.own_validating_state.clear_values();
        let bclaims = self.empty_block_claims(txn, rs)?;
        let (pre_votes, _) = rs.current_pre_votes();
        let adopted = pre_votes
            .into_iter()
            .map(|pv| pv.proposal)
            .find(|p| p.bclaims() == &bclaims);
        let p = match adopted {
            Some(p) => p,
            None => Proposal::new(&self.signer, bclaims, rs.rcert().clone(), Vec::new())?,
        };
        self.cast_pre_vote(txn, rs, &p)
    }

    pub(super) fn do_pre_vote_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        if let (Some(pre_votes), _, _) = self.pre_vote_quorum(rs) {
            self.cast_pre_commit(txn, rs, &pre_votes)?;
        }
        Ok(())
    }

    pub(super) fn do_pre_vote_nil_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (pre_votes, _, nils) = self.pre_vote_quorum(rs);
        if let Some(pre_votes) = pre_votes {
            return self.update_valid_value(txn, rs, &pre_votes[0].proposal);
        }
        if nils >= rs.threshold() {
            self.cast_pre_commit_nil(txn, rs)?;
        }
        Ok(())
    }

    pub(super) fn do_pending_pre_commit(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (pre_votes, total, nils) = self.pre_vote_quorum(rs);
        if let Some(pre_votes) = pre_votes {
            let own_matches = rs.local_pre_vote_current()
                && rs
                    .own_round_state()
                    .pre_vote
                    .as_ref()
                    .map_or(false, |pv| pv.proposal.pclaims == pre_votes[0].proposal.pclaims);
            if own_matches {
                return self.cast_pre_commit(txn, rs, &pre_votes);
            }
            tolerated(self.update_valid_value(txn, rs, &pre_votes[0].proposal))?;
        }
        if rs.round() != DEAD_BLOCK_ROUND && total + nils >= rs.threshold() {
            self.cast_pre_commit_nil(txn, rs)?;
        }
        Ok(())
    }

    pub(super) fn do_pre_commit_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        if let (Some(pre_commits), _, _) = self.pre_commit_quorum(rs) {
            self.update_valid_value(txn, rs, &pre_commits[0].proposal)?;
            self.cast_next_height_from_pre_commits(txn, rs, &pre_commits)?;
        }
        Ok(())
    }

    pub(super) fn do_pre_commit_nil_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (pre_commits, _, nils) = self.pre_commit_quorum(rs);
        if let Some(pre_commits) = pre_commits {
            self.update_valid_value(txn, rs, &pre_commits[0].proposal)?;
            return self.cast_next_height_from_pre_commits(txn, rs, &pre_commits);
        }
        if nils >= rs.threshold() && rs.round() != DEAD_BLOCK_ROUND_NR {
            self.cast_next_round(txn, rs)?;
        }
        Ok(())
    }

    /// Try to move to the next height on a precommit quorum
    fn commit_pre_commits(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, pre_commits: &[PreCommit]) -> Result<bool> {
        if !tolerated(self.update_valid_value(txn, rs, &pre_commits[0].proposal))? {
            return Ok(false);
        }
        tolerated(self.cast_next_height_from_pre_commits(txn, rs, pre_commits))
    }

    /// Escalate to the next round unless the dead block round grace
    /// period is still running
    fn next_round_unless_waiting(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        let waiting = rs.round() == DEAD_BLOCK_ROUND_NR
            && !rs
                .own_validating_state
                .dbrnr_expired(self.config.dead_block_round_grace);
        if waiting {
            return Ok(());
        }
        self.cast_next_round(txn, rs)
    }

    pub(super) fn do_pending_next(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (pre_commits, total, nils) = self.pre_commit_quorum(rs);
        if let Some(pre_commits) = pre_commits {
            if self.commit_pre_commits(txn, rs, &pre_commits)? {
                return Ok(());
            }
            if rs.round() != DEAD_BLOCK_ROUND {
                self.next_round_unless_waiting(txn, rs)?;
            }
            return Ok(());
        }
        if rs.round() != DEAD_BLOCK_ROUND && total + nils >= rs.threshold() {
            self.next_round_unless_waiting(txn, rs)?;
        }
        Ok(())
    }

    pub(super) fn do_next_round_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        if let (Some(pre_commits), _, _) = self.pre_commit_quorum(rs) {
            if self.commit_pre_commits(txn, rs, &pre_commits)? {
                return Ok(());
            }
        }
        let (_, next_rounds) = rs.current_next();
        if next_rounds.len() >= rs.threshold() {
            self.cast_next_round_rcert(rs, &next_rounds)?;
        }
        Ok(())
    }

    /// Follow a peer to a later round of this height
    /// Observers adopt the certificate too, they only skip the valid value.
    pub(super) fn do_round_jump(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, rc: RCert) -> Result<()> {
        if rs.is_current_validator() {
            if let (Some(pre_commits), _, _) = self.pre_commit_quorum(rs) {
                tolerated(self.update_valid_value(txn, rs, &pre_commits[0].proposal))?;
            }
        }
        self.set_most_recent_rcert(rs, rc);
        Ok(())
    }

    pub(super) fn do_next_height_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if !rs.is_current_validator() {
            return Ok(());
        }
        let (next_heights, _) = rs.current_next();
        if let Some(next_heights) = quorum(next_heights, rs.threshold(), next_height_claims) {
            tolerated(self.cast_new_committed_block_header(txn, rs, &next_heights))?;
        }
        Ok(())
    }

    /// Commit the block a round 1 certificate of the next height proves,
    /// when it is the valid value or the empty block. Returns whether the
    /// node committed; otherwise it has to sync.
    pub(super) fn do_height_jump_step(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, rc: RCert) -> Result<bool> {
        if rc.claims.height > rs.height() + 1 || rc.claims.round != 1 {
            return Ok(false);
        }
        if rs.valid_value_current() {
            if let Some(valid) = rs.valid_value().cloned() {
                if valid.block_hash() == rc.claims.prev_block {
                    let committed = tolerated(self.cast_new_committed_block_from_proposal_and_rcert(txn, rs, &valid, &rc))?;
                    rs.own_validating_state.clear_values();
                    return Ok(committed);
                }
            }
        }

        let bclaims = self.empty_block_claims(txn, rs)?;
        if bclaims.block_hash() != rc.claims.prev_block {
            debug!(height = rc.claims.height, "unknown block behind certificate");
            return Ok(false);
        }
        let bh = BlockHeader {
            bclaims,
            sig_group: rc.sig_group.clone(),
            tx_hashes: Vec::new(),
        };
        if let Err(e) = bh.validate_signatures() {
            debug!(error = %e, "certificate does not sign the empty block");
            return Ok(false);
        }
        if !self.is_valid(txn, rs, &bh.bclaims, &bh.tx_hashes, &[])? {
            return Ok(false);
        }
        tolerated(self.set_most_recent_block_header(txn, rs, bh))
    }

    /// Observers track what the validators converge on, without voting
    pub(super) fn do_check_valid_value(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<()> {
        if let (Some(pre_commits), _, _) = self.pre_commit_quorum(rs) {
            tolerated(self.update_valid_value(txn, rs, &pre_commits[0].proposal))?;
            return Ok(());
        }
        if let (Some(pre_votes), _, _) = self.pre_vote_quorum(rs) {
            tolerated(self.update_valid_value(txn, rs, &pre_votes[0].proposal))?;
        }
        Ok(())
    }

    /// Adopt `p` as the valid value once its transactions are local and
    /// the application accepts it
    pub(super) fn update_valid_value(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, p: &Proposal) -> Result<()> {
        let (height, round) = (p.height(), p.round());
        let txs = self.get_txs(height, round, &p.tx_hashes)?;
        if !self.is_valid(txn, rs, p.bclaims(), &p.tx_hashes, &txs)? {
            return Err(ConsensusError::invalid(format!(
                "proposal at ({height}, {round}) is not a valid block"
            )));
        }
        self.set_most_recent_valid_value(rs, p.clone());
        Ok(())
    }
}
