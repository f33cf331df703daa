/// Choosing the one action of a tick
///
/// Higher rows win. Jumps driven by peers come first, then the dead block
/// round escape, then height and round escalation, then the normal
/// proposal / prevote / precommit ladder of the current round.

use super::Engine;
use crate::config::{DEAD_BLOCK_ROUND, DEAD_BLOCK_ROUND_NR};
use crate::error::Result;
use crate::objects::{relate_h, relate_hr, HeightRound, NextHeight, RCert, RoundState};
use crate::round_states::RoundStates;
use crate::storage::Txn;
use std::cmp::Ordering;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Handler {
    /// A peer is at round 1 of a later height
    HeightJump(RCert),
    /// A peer of this height reached the dead block round
    DeadBlockRoundJump(RCert),
    /// Non-validators only follow along
    CheckValidValue { in_sync: bool },
    /// Own next round vote stands in the round before the dead block round
    DeadBlockRoundNextRound,
    CastNextHeight(NextHeight),
    NextHeightStep,
    /// A peer of this height is in a later round
    RoundJump(RCert),
    NextRoundStep,
    PendingNext,
    PreCommitStep,
    PreCommitNilStep,
    PendingPreCommit,
    PreVoteStep,
    PreVoteNilStep,
    PendingPreVote,
    PendingProposal,
    Idle,
}

impl Handler {
    pub fn name(&self) -> &'static str {
        match self {
            Self::HeightJump(_) => "height_jump",
            Self::DeadBlockRoundJump(_) => "dead_block_round_jump",
            Self::CheckValidValue { .. } => "check_valid_value",
            Self::DeadBlockRoundNextRound => "dead_block_round_next_round",
            Self::CastNextHeight(_) => "cast_next_height",
            Self::NextHeightStep => "next_height_step",
            Self::RoundJump(_) => "round_jump",
            Self::NextRoundStep => "next_round_step",
            Self::PendingNext => "pending_next",
            Self::PreCommitStep => "pre_commit_step",
            Self::PreCommitNilStep => "pre_commit_nil_step",
            Self::PendingPreCommit => "pending_pre_commit",
            Self::PreVoteStep => "pre_vote_step",
            Self::PreVoteNilStep => "pre_vote_nil_step",
            Self::PendingPreVote => "pending_pre_vote",
            Self::PendingProposal => "pending_proposal",
            Self::Idle => "idle",
        }
    }
}

impl Engine {
    pub(super) fn dispatch(&self, txn: &mut Txn<'_>, rs: &mut RoundStates) -> Result<bool> {
        let handler = self.select_handler(rs);
        trace!(height = rs.height(), round = rs.round(), handler = handler.name(), "dispatch");
        self.run_handler(txn, rs, handler)
    }

    pub(crate) fn select_handler(&self, rs: &RoundStates) -> Handler {
        let rc = rs.rcert();
        let mut future_round: Vec<&RoundState> = Vec::new();
        let mut future_height: Vec<&RoundState> = Vec::new();
        for peer in rs.validator_round_states() {
            match relate_h(rc, peer) {
                Ordering::Less => future_height.push(peer),
                Ordering::Equal if relate_hr(rc, peer) == Ordering::Less => future_round.push(peer),
                _ => {}
            }
        }

        let mut jump_to: Option<&RoundState> = None;
        for &peer in future_height.iter().filter(|p| p.round() == 1) {
            if jump_to.map_or(true, |best| peer.height() > best.height()) {
                jump_to = Some(peer);
            }
        }
        if let Some(peer) = jump_to {
            return Handler::HeightJump(peer.rcert.clone());
        }

        if let Some(peer) = future_round.iter().find(|p| p.round() == DEAD_BLOCK_ROUND) {
            return Handler::DeadBlockRoundJump(peer.rcert.clone());
        }

        if !rs.is_current_validator() {
            return Handler::CheckValidValue {
                in_sync: future_height.is_empty(),
            };
        }

        let own = rs.own_round_state();
        if own.nr_current(rc) && rc.claims.round == DEAD_BLOCK_ROUND_NR {
            return Handler::DeadBlockRoundNextRound;
        }

        let (next_heights, _) = rs.current_next();
        if let Some(nh) = next_heights.into_iter().next() {
            return if own.nh_current(rc) {
                Handler::NextHeightStep
            } else {
                Handler::CastNextHeight(nh)
            };
        }

        let mut round_to: Option<&RoundState> = None;
        for &peer in &future_round {
            if round_to.map_or(true, |best| peer.round() > best.round()) {
                round_to = Some(peer);
            }
        }
        if let Some(peer) = round_to {
            return Handler::RoundJump(peer.rcert.clone());
        }

        let ovs = &rs.own_validating_state;
        let cfg = &self.config;
        if own.nr_current(rc) {
            return Handler::NextRoundStep;
        }
        if own.pc_current(rc) {
            return if ovs.pcto_expired(cfg.pre_commit_step_timeout) {
                Handler::PendingNext
            } else {
                Handler::PreCommitStep
            };
        }
        if own.pcn_current(rc) {
            return if ovs.pcto_expired(cfg.pre_commit_step_timeout) {
                Handler::PendingNext
            } else {
                Handler::PreCommitNilStep
            };
        }
        if own.pv_current(rc) {
            return if ovs.pvto_expired(cfg.pre_vote_step_timeout) {
                Handler::PendingPreCommit
            } else {
                Handler::PreVoteStep
            };
        }
        if own.pvn_current(rc) {
            return if ovs.pvto_expired(cfg.pre_vote_step_timeout) {
                Handler::PendingPreCommit
            } else {
                Handler::PreVoteNilStep
            };
        }
        if ovs.pto_expired(cfg.proposal_step_timeout) {
            return Handler::PendingPreVote;
        }
        if rs.local_is_proposer() && !own.p_current(rc) {
            return Handler::PendingProposal;
        }
        Handler::Idle
    }

    fn run_handler(&self, txn: &mut Txn<'_>, rs: &mut RoundStates, handler: Handler) -> Result<bool> {
        match handler {
            Handler::HeightJump(rc) => return self.do_height_jump_step(txn, rs, rc),
            Handler::CheckValidValue { in_sync } => {
                self.do_check_valid_value(txn, rs)?;
                return Ok(in_sync);
            }
            Handler::DeadBlockRoundJump(rc) | Handler::RoundJump(rc) => {
                self.do_round_jump(txn, rs, rc)?
            }
            Handler::DeadBlockRoundNextRound | Handler::NextRoundStep => {
                self.do_next_round_step(txn, rs)?
            }
            Handler::CastNextHeight(nh) => self.cast_next_height_from_next_height(txn, rs, &nh)?,
            Handler::NextHeightStep => self.do_next_height_step(txn, rs)?,
            Handler::PendingNext => self.do_pending_next(txn, rs)?,
            Handler::PreCommitStep => self.do_pre_commit_step(txn, rs)?,
            Handler::PreCommitNilStep => self.do_pre_commit_nil_step(txn, rs)?,
            Handler::PendingPreCommit => self.do_pending_pre_commit(txn, rs)?,
            Handler::PreVoteStep => self.do_pre_vote_step(txn, rs)?,
            Handler::PreVoteNilStep => self.do_pre_vote_nil_step(txn, rs)?,
            Handler::PendingPreVote => self.do_pending_pre_vote(txn, rs)?,
            Handler::PendingProposal => self.do_pending_proposal(txn, rs)?,
            Handler::Idle => {}
        }
        Ok(true)
    }
}
