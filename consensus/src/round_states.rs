/// Working set of one decision cycle
///
/// `RoundStates` is loaded from the store at the start of a tick or an
/// admission, mutated in memory and written back in the same transaction.
/// It never outlives that transaction.

use crate::crypto::{threshold, Hash, ValidatorAddress};
use crate::error::{ConsensusError, Result};
use crate::objects::{
    relate_h, Authored, NextHeight, NextRound, OwnState, OwnValidatingState, PreCommit,
    PreCommitNil, PreVote, PreVoteNil, Proposal, RCert, RoundState, ValidatorSet,
};
use crate::storage::Txn;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

pub struct RoundStates {
    pub own_state: OwnState,
    pub own_validating_state: OwnValidatingState,
    pub validator_set: ValidatorSet,
    own: RoundState,
    /// Every other validator's record
    peers: HashMap<ValidatorAddress, RoundState>,
}

impl RoundStates {
    /// Load the node's own view and every validator's record at the
    /// node's current round
    pub fn load(txn: &Txn<'_>) -> Result<Self> {
        let own_state = txn
            .get_own_state()?
            .ok_or_else(|| ConsensusError::corrupt("own state missing"))?;
        let own = txn
            .get_round_state(&own_state.vaddr)?
            .ok_or_else(|| ConsensusError::corrupt("own round state missing"))?;
        let rcert = own.rcert.clone();
        let validator_set = txn
            .get_validator_set(rcert.claims.height)?
            .ok_or_else(|| ConsensusError::corrupt(format!("no validator set at height {}", rcert.claims.height)))?;

        let mut peers = HashMap::with_capacity(validator_set.len());
        for validator in &validator_set.validators {
            if validator.vaddr == own_state.vaddr {
                continue;
            }
            let rs = match txn.get_round_state(&validator.vaddr)? {
                Some(rs) => rs,
                None => RoundState::new(
                    validator.vaddr,
                    validator_set.group_key,
                    Some(validator.group_share.clone()),
                    rcert.clone(),
                ),
            };
            peers.insert(validator.vaddr, rs);
        }

        let own_validating_state = txn.get_own_validating_state()?.unwrap_or_default();
        Ok(Self {
            own_state,
            own_validating_state,
            validator_set,
            own,
            peers,
        })
    }

    /// Persist everything, flagging validators whose messages contradict
    /// the value this node stands behind
    pub fn write(mut self, txn: &mut Txn<'_>) -> Result<()> {
        txn.set_own_state(&self.own_state)?;
        txn.set_own_validating_state(&self.own_validating_state)?;

        let checker = if self.locked_value_current() {
            self.locked_value().cloned()
        } else if self.valid_value_current() {
            self.valid_value().cloned()
        } else {
            None
        };
        for rs in self.peers.values_mut() {
            if let Some(value) = &checker {
                rs.track_external_conflicts(value);
            }
            txn.set_round_state(rs)?;
        }
        txn.set_round_state(&self.own)?;
        Ok(())
    }

    pub fn own_vaddr(&self) -> ValidatorAddress {
        self.own_state.vaddr
    }

    pub fn own_round_state(&self) -> &RoundState {
        &self.own
    }

    pub fn own_round_state_mut(&mut self) -> &mut RoundState {
        &mut self.own
    }

    pub fn round_state(&self, vaddr: &ValidatorAddress) -> Option<&RoundState> {
        if self.is_me(vaddr) {
            return Some(&self.own);
        }
        self.peers.get(vaddr)
    }

    pub fn round_state_mut(&mut self, vaddr: &ValidatorAddress) -> Result<&mut RoundState> {
        if self.is_me(vaddr) {
            return Ok(&mut self.own);
        }
        self.peers
            .get_mut(vaddr)
            .ok_or_else(|| ConsensusError::invalid(format!("no round state for {vaddr}")))
    }

    /// Records of the validator set, in set order
    pub fn validator_round_states(&self) -> impl Iterator<Item = &RoundState> + '_ {
        self.validator_set
            .validators
            .iter()
            .filter_map(|v| self.round_state(&v.vaddr))
    }

    pub fn is_me(&self, vaddr: &ValidatorAddress) -> bool {
        &self.own_state.vaddr == vaddr
    }

    pub fn is_current_validator(&self) -> bool {
        self.validator_set.contains(&self.own_state.vaddr)
    }

    pub fn local_is_proposer(&self) -> bool {
        self.validator_set
            .is_proposer(&self.own_state.vaddr, self.height(), self.round())
    }

    pub fn rcert(&self) -> &RCert {
        &self.own_round_state().rcert
    }

    pub fn chain_id(&self) -> u32 {
        self.rcert().claims.chain_id
    }

    pub fn height(&self) -> u32 {
        self.rcert().claims.height
    }

    pub fn round(&self) -> u32 {
        self.rcert().claims.round
    }

    pub fn prev_block(&self) -> Hash {
        self.rcert().claims.prev_block
    }

    pub fn threshold(&self) -> usize {
        threshold(self.validator_set.len())
    }

    /// The proposal of this round's designated proposer, if current
    pub fn current_proposal(&self) -> Option<&Proposal> {
        let proposer = self.validator_set.proposer(self.height(), self.round())?;
        let rs = self.round_state(&proposer.vaddr)?;
        if rs.p_current(self.rcert()) {
            rs.proposal.as_ref()
        } else {
            None
        }
    }

    /// Current prevotes, and the number of validators counted as nil. A
    /// validator with a current prevote is never also counted as nil.
    pub fn current_pre_votes(&self) -> (Vec<PreVote>, usize) {
        let rc = self.rcert();
        let mut pre_votes = Vec::new();
        let mut nils = 0;
        for rs in self.validator_round_states() {
            match &rs.pre_vote {
                Some(pv) if rs.pv_current(rc) => pre_votes.push(pv.clone()),
                _ if rs.pvn_current(rc) || (rs.implicit_pvn && rs.current_hr(rc)) => nils += 1,
                _ => {}
            }
        }
        (pre_votes, nils)
    }

    /// Current precommits, and the number of validators counted as nil
    pub fn current_pre_commits(&self) -> (Vec<PreCommit>, usize) {
        let rc = self.rcert();
        let mut pre_commits = Vec::new();
        let mut nils = 0;
        for rs in self.validator_round_states() {
            match &rs.pre_commit {
                Some(pc) if rs.pc_current(rc) => pre_commits.push(pc.clone()),
                _ if rs.pcn_current(rc) || (rs.implicit_pcn && rs.current_hr(rc)) => nils += 1,
                _ => {}
            }
        }
        (pre_commits, nils)
    }

    pub fn current_next(&self) -> (Vec<NextHeight>, Vec<NextRound>) {
        let rc = self.rcert();
        let mut next_heights = Vec::new();
        let mut next_rounds = Vec::new();
        for rs in self.validator_round_states() {
            if rs.nh_current(rc) {
                if let Some(nh) = &rs.next_height {
                    next_heights.push(nh.clone());
                }
            }
            if rs.nr_current(rc) {
                if let Some(nr) = &rs.next_round {
                    next_rounds.push(nr.clone());
                }
            }
        }
        (next_heights, next_rounds)
    }

    pub fn set_proposal(&mut self, p: Proposal) -> Result<()> {
        let proposer = p.author()?;
        self.round_state_mut(&proposer)?.set_proposal(p)?;
        Ok(())
    }

    /// Record a prevote, and its proposal under the proposer
    pub fn set_pre_vote(&mut self, pv: PreVote) -> Result<()> {
        ignore_stale(self.set_proposal(pv.proposal.clone()))?;
        let voter = pv.author()?;
        self.round_state_mut(&voter)?.set_pre_vote(pv)?;
        Ok(())
    }

    pub fn set_pre_vote_nil(&mut self, pvn: PreVoteNil) -> Result<()> {
        let voter = pvn.author()?;
        self.round_state_mut(&voter)?.set_pre_vote_nil(pvn)?;
        Ok(())
    }

    /// Record a precommit along with the prevotes it proves. A precommit
    /// whose prevotes cannot be recorded marks its author as nil instead.
    pub fn set_pre_commit(&mut self, pc: PreCommit) -> Result<()> {
        ignore_stale(self.set_proposal(pc.proposal.clone()))?;
        let voter = pc.author()?;
        for pv in pc.implicit_pre_votes() {
            let pv_voter = pv.author()?;
            match self.round_state_mut(&pv_voter)?.set_pre_vote(pv) {
                Ok(_) => {}
                Err(e) if e.is_stale() => {}
                Err(_) => {
                    self.round_state_mut(&voter)?.implicit_pcn = true;
                    return Ok(());
                }
            }
        }
        self.round_state_mut(&voter)?.set_pre_commit(pc)?;
        Ok(())
    }

    pub fn set_pre_commit_nil(&mut self, pcn: PreCommitNil) -> Result<()> {
        let voter = pcn.author()?;
        self.round_state_mut(&voter)?.set_pre_commit_nil(pcn)?;
        Ok(())
    }

    pub fn set_next_round(&mut self, nr: NextRound) -> Result<()> {
        let voter = nr.author()?;
        self.round_state_mut(&voter)?.set_next_round(nr)?;
        Ok(())
    }

    pub fn set_next_height(&mut self, nh: NextHeight) -> Result<()> {
        // The proposal is informational here
        if let Err(e) = self.set_proposal(nh.proposal().clone()) {
            debug!(error = %e, "proposal carried by next height not recorded");
        }
        let voter = nh.author()?;
        self.round_state_mut(&voter)?.set_next_height(nh)?;
        Ok(())
    }

    pub fn locked_value(&self) -> Option<&Proposal> {
        self.own_validating_state.locked_value.as_ref()
    }

    pub fn valid_value(&self) -> Option<&Proposal> {
        self.own_validating_state.valid_value.as_ref()
    }

    pub fn locked_value_current(&self) -> bool {
        self.locked_value()
            .map_or(false, |v| relate_h(self.own_round_state(), v) == Ordering::Equal)
    }

    pub fn valid_value_current(&self) -> bool {
        self.valid_value()
            .map_or(false, |v| relate_h(self.own_round_state(), v) == Ordering::Equal)
    }

    pub fn local_pre_vote_current(&self) -> bool {
        let own = self.own_round_state();
        own.pv_current(&own.rcert)
    }

    pub fn local_pre_commit_current(&self) -> bool {
        let own = self.own_round_state();
        own.pc_current(&own.rcert)
    }
}

fn ignore_stale(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_stale() => Ok(()),
        other => other,
    }
}
