/// One validator's most recent protocol messages, as seen by this node
///
/// A `RoundState` holds at most one artifact of each kind for the round its
/// `rcert` names. Setting an artifact from a later round or height resets the
/// record to that round; earlier artifacts are stale. Contradicting artifacts
/// within a round are kept aside in the `conflicting_*` slots and raise the
/// implicit nil flags, which count as nil votes in every tally.

use super::{
    relate_h, relate_hr, BClaims, HasRCert, HeightRound, NextHeight, NextRound, PreCommit,
    PreCommitNil, PreVote, PreVoteNil, Proposal, RCert,
};
use crate::config::{DEAD_BLOCK_ROUND, DEAD_BLOCK_ROUND_NR};
use crate::crypto::{BLSPublicKey, GroupKey, ValidatorAddress};
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundState {
    pub vaddr: ValidatorAddress,
    pub group_key: GroupKey,
    /// Absent for nodes outside the validator set
    pub group_share: Option<BLSPublicKey>,
    pub rcert: RCert,
    pub conflicting_rcert: Option<RCert>,
    pub proposal: Option<Proposal>,
    pub conflicting_proposal: Option<Proposal>,
    pub pre_vote: Option<PreVote>,
    pub conflicting_pre_vote: Option<PreVote>,
    pub pre_vote_nil: Option<PreVoteNil>,
    pub implicit_pvn: bool,
    pub pre_commit: Option<PreCommit>,
    pub conflicting_pre_commit: Option<PreCommit>,
    pub pre_commit_nil: Option<PreCommitNil>,
    pub implicit_pcn: bool,
    pub next_round: Option<NextRound>,
    pub next_height: Option<NextHeight>,
    pub conflicting_next_height: Option<NextHeight>,
}

/// Any artifact a round state can hold
#[derive(Clone, Debug)]
enum Entry {
    RCert(RCert),
    Proposal(Proposal),
    PreVote(PreVote),
    PreVoteNil(PreVoteNil),
    PreCommit(PreCommit),
    PreCommitNil(PreCommitNil),
    NextRound(NextRound),
    NextHeight(NextHeight),
}

impl Entry {
    fn rcert(&self) -> &RCert {
        match self {
            Self::RCert(v) => v,
            Self::Proposal(v) => v.rcert(),
            Self::PreVote(v) => v.rcert(),
            Self::PreVoteNil(v) => v.rcert(),
            Self::PreCommit(v) => v.rcert(),
            Self::PreCommitNil(v) => v.rcert(),
            Self::NextRound(v) => v.rcert(),
            Self::NextHeight(v) => v.rcert(),
        }
    }

    fn bclaims(&self) -> Option<&BClaims> {
        match self {
            Self::Proposal(v) => Some(v.bclaims()),
            Self::PreVote(v) => Some(v.proposal.bclaims()),
            Self::PreCommit(v) => Some(v.proposal.bclaims()),
            Self::NextHeight(v) => Some(v.proposal().bclaims()),
            _ => None,
        }
    }
}

impl HeightRound for Entry {
    fn height_round(&self) -> (u32, u32) {
        self.rcert().height_round()
    }
}

fn is_dead_block_round<T: HeightRound + ?Sized>(v: &T) -> bool {
    v.round() == DEAD_BLOCK_ROUND
}

fn is_current<T: HeightRound>(slot: &Option<T>, rc: &RCert) -> bool {
    slot.as_ref()
        .map_or(false, |v| relate_hr(rc, v) == Ordering::Equal)
}

fn bclaims_of<T: HasBClaims>(slot: &Option<T>) -> Option<&BClaims> {
    slot.as_ref().map(HasBClaims::bclaims)
}

trait HasBClaims {
    fn bclaims(&self) -> &BClaims;
}

impl HasBClaims for Proposal {
    fn bclaims(&self) -> &BClaims {
        &self.pclaims.bclaims
    }
}

impl HasBClaims for PreVote {
    fn bclaims(&self) -> &BClaims {
        &self.proposal.pclaims.bclaims
    }
}

impl HasBClaims for PreCommit {
    fn bclaims(&self) -> &BClaims {
        &self.proposal.pclaims.bclaims
    }
}

impl HasBClaims for NextHeight {
    fn bclaims(&self) -> &BClaims {
        &self.claims.proposal.pclaims.bclaims
    }
}

impl RoundState {
    pub fn new(
        vaddr: ValidatorAddress,
        group_key: GroupKey,
        group_share: Option<BLSPublicKey>,
        rcert: RCert,
    ) -> Self {
        Self {
            vaddr,
            group_key,
            group_share,
            rcert,
            conflicting_rcert: None,
            proposal: None,
            conflicting_proposal: None,
            pre_vote: None,
            conflicting_pre_vote: None,
            pre_vote_nil: None,
            implicit_pvn: false,
            pre_commit: None,
            conflicting_pre_commit: None,
            pre_commit_nil: None,
            implicit_pcn: false,
            next_round: None,
            next_height: None,
            conflicting_next_height: None,
        }
    }

    /// Clear everything bound to the current round; next height votes
    /// survive round changes
    pub fn reset(&mut self) {
        self.conflicting_rcert = None;
        self.proposal = None;
        self.conflicting_proposal = None;
        self.pre_vote = None;
        self.conflicting_pre_vote = None;
        self.pre_vote_nil = None;
        self.implicit_pvn = false;
        self.pre_commit = None;
        self.conflicting_pre_commit = None;
        self.pre_commit_nil = None;
        self.implicit_pcn = false;
        self.next_round = None;
    }

    pub fn current_hr(&self, rc: &RCert) -> bool {
        relate_hr(rc, self) == Ordering::Equal
    }

    pub fn p_current(&self, rc: &RCert) -> bool {
        is_current(&self.proposal, rc)
    }

    pub fn pv_current(&self, rc: &RCert) -> bool {
        is_current(&self.pre_vote, rc)
    }

    pub fn pvn_current(&self, rc: &RCert) -> bool {
        is_current(&self.pre_vote_nil, rc)
    }

    pub fn pc_current(&self, rc: &RCert) -> bool {
        is_current(&self.pre_commit, rc)
    }

    pub fn pcn_current(&self, rc: &RCert) -> bool {
        is_current(&self.pre_commit_nil, rc)
    }

    pub fn nr_current(&self, rc: &RCert) -> bool {
        is_current(&self.next_round, rc)
    }

    /// Next height votes count across every round of a height, except that
    /// inside the dead block round only dead block round votes count
    pub fn nh_current(&self, rc: &RCert) -> bool {
        let Some(nh) = &self.next_height else {
            return false;
        };
        if is_dead_block_round(rc) || is_dead_block_round(self) {
            relate_hr(rc, nh) == Ordering::Equal
        } else {
            relate_h(rc, nh) == Ordering::Equal
        }
    }

    /// Flag this validator if `value` contradicts what it sent this round
    pub fn track_external_conflicts(&mut self, value: &Proposal) {
        if relate_hr(self, value) != Ordering::Equal {
            return;
        }
        let _ = self.check_stale_and_conflict(&Entry::Proposal(value.clone()), false);
    }

    pub fn set_rcert(&mut self, rc: RCert) {
        self.set_reset(Entry::RCert(rc));
    }

    pub fn set_proposal(&mut self, v: Proposal) -> Result<bool> {
        let dbr = is_dead_block_round(&v);
        if dbr && !v.tx_hashes.is_empty() {
            return Err(ConsensusError::invalid("proposal with transactions in dead block round"));
        }
        self.set_checked(Entry::Proposal(v), dbr, "proposal")
    }

    pub fn set_pre_vote(&mut self, v: PreVote) -> Result<bool> {
        let dbr = is_dead_block_round(&v);
        if dbr && !v.proposal.tx_hashes.is_empty() {
            return Err(ConsensusError::invalid("prevote with transactions in dead block round"));
        }
        self.set_checked(Entry::PreVote(v), dbr, "prevote")
    }

    pub fn set_pre_vote_nil(&mut self, v: PreVoteNil) -> Result<bool> {
        if is_dead_block_round(&v) {
            return Err(ConsensusError::invalid("prevote nil in dead block round"));
        }
        self.generic_set(Entry::PreVoteNil(v))
    }

    pub fn set_pre_commit(&mut self, v: PreCommit) -> Result<bool> {
        let dbr = is_dead_block_round(&v);
        if dbr && !v.proposal.tx_hashes.is_empty() {
            return Err(ConsensusError::invalid("precommit with transactions in dead block round"));
        }
        self.set_checked(Entry::PreCommit(v), dbr, "precommit")
    }

    pub fn set_pre_commit_nil(&mut self, v: PreCommitNil) -> Result<bool> {
        if is_dead_block_round(&v) {
            return Err(ConsensusError::invalid("precommit nil in dead block round"));
        }
        self.generic_set(Entry::PreCommitNil(v))
    }

    pub fn set_next_round(&mut self, v: NextRound) -> Result<bool> {
        if is_dead_block_round(&v) {
            return Err(ConsensusError::invalid("next round in dead block round"));
        }
        self.generic_set(Entry::NextRound(v))
    }

    pub fn set_next_height(&mut self, v: NextHeight) -> Result<bool> {
        if is_dead_block_round(&v) && !v.proposal().tx_hashes.is_empty() {
            return Err(ConsensusError::invalid("next height with transactions in dead block round"));
        }
        match relate_h(self, &v) {
            Ordering::Greater => Err(ConsensusError::stale("next height from a previous height")),
            Ordering::Less => {
                self.set_reset(Entry::NextHeight(v));
                Ok(true)
            }
            Ordering::Equal => {
                let entry = Entry::NextHeight(v);
                if !self.check_stale_and_conflict(&entry, true)? {
                    return Ok(false);
                }
                self.set_type(entry);
                Ok(true)
            }
        }
    }

    fn set_checked(&mut self, entry: Entry, dbr: bool, kind: &str) -> Result<bool> {
        let ok = self.generic_set(entry)?;
        if !ok && dbr {
            return Err(ConsensusError::invalid(format!("conflicting {kind} in dead block round")));
        }
        Ok(ok)
    }

    fn generic_set(&mut self, entry: Entry) -> Result<bool> {
        match relate_h(self, &entry) {
            Ordering::Greater => return Err(ConsensusError::stale("artifact from a previous height")),
            Ordering::Less => {
                self.set_reset(entry);
                return Ok(true);
            }
            Ordering::Equal => {}
        }
        match relate_hr(self, &entry) {
            Ordering::Greater => {
                let newer_nh = match &entry {
                    Entry::NextHeight(_) => self
                        .next_height
                        .as_ref()
                        .map_or(true, |held| relate_hr(held, &entry) == Ordering::Less),
                    _ => false,
                };
                if !newer_nh {
                    return Err(ConsensusError::stale("artifact from a previous round"));
                }
            }
            Ordering::Less => {
                self.set_reset(entry);
                return Ok(true);
            }
            Ordering::Equal => {}
        }
        if !self.check_stale_and_conflict(&entry, true)? {
            return Ok(false);
        }
        self.set_type(entry);
        Ok(true)
    }

    /// `Ok(false)` when the artifact conflicts and was set aside
    fn check_stale_and_conflict(&mut self, entry: &Entry, internal: bool) -> Result<bool> {
        if self.check_conflict(entry, internal)? {
            self.set_type_conflict(entry, internal);
            return Ok(false);
        }
        self.check_type_stale(entry, internal)?;
        Ok(true)
    }

    /// `Ok(true)` on a conflict with an artifact already held
    fn check_conflict(&mut self, entry: &Entry, internal: bool) -> Result<bool> {
        if internal {
            self.reset_nh_for_dead_block_round(entry);
            self.check_same_type_conflict(entry)?;
        }
        let prev_block = entry.rcert().prev_block();
        if self.rcert.prev_block() != prev_block {
            return Ok(true);
        }
        if let Some(bclaims) = entry.bclaims() {
            let held = [
                bclaims_of(&self.proposal),
                bclaims_of(&self.pre_vote),
                bclaims_of(&self.pre_commit),
                bclaims_of(&self.next_height),
            ];
            if held.into_iter().flatten().any(|b| b != bclaims) {
                return Ok(true);
            }
        }
        let nil_prev_blocks = [
            self.pre_vote_nil.as_ref().map(|v| v.rcert().prev_block()),
            self.pre_commit_nil.as_ref().map(|v| v.rcert().prev_block()),
            self.next_round.as_ref().map(|v| v.rcert().prev_block()),
        ];
        Ok(nil_prev_blocks.into_iter().flatten().any(|p| p != prev_block))
    }

    fn reset_nh_for_dead_block_round(&mut self, entry: &Entry) {
        if !is_dead_block_round(entry) {
            return;
        }
        if self.next_height.as_ref().map_or(false, |nh| !is_dead_block_round(nh)) {
            self.next_height = None;
        }
        if self
            .conflicting_next_height
            .as_ref()
            .map_or(false, |nh| !is_dead_block_round(nh))
        {
            self.conflicting_next_height = None;
        }
    }

    fn check_same_type_conflict(&self, entry: &Entry) -> Result<()> {
        if self.implicit_pvn || self.implicit_pcn {
            return Err(ConsensusError::invalid("validator already flagged with implicit nil"));
        }
        if self.conflicting_rcert.is_some() {
            return Err(ConsensusError::invalid("validator already sent a conflicting rcert"));
        }
        let conflict = match entry {
            Entry::Proposal(_) => self.conflicting_proposal.is_some(),
            Entry::PreVote(_) => self.pre_vote_nil.is_some() || self.conflicting_pre_vote.is_some(),
            Entry::PreVoteNil(_) => self.pre_vote.is_some(),
            Entry::PreCommit(_) => {
                self.pre_vote_nil.is_some()
                    || self.pre_commit_nil.is_some()
                    || self.conflicting_pre_commit.is_some()
            }
            Entry::PreCommitNil(_) => self.pre_commit.is_some(),
            Entry::NextHeight(_) => self.conflicting_next_height.is_some(),
            Entry::RCert(_) | Entry::NextRound(_) => false,
        };
        if conflict {
            return Err(ConsensusError::invalid("artifact contradicts one already held"));
        }
        Ok(())
    }

    fn set_reset(&mut self, entry: Entry) {
        let future_height = relate_h(self, &entry) == Ordering::Less;
        let round = entry.round();
        let escalation_round = match entry {
            Entry::NextRound(_) => DEAD_BLOCK_ROUND_NR,
            _ => DEAD_BLOCK_ROUND,
        };
        if round == escalation_round || future_height {
            self.next_height = None;
            self.conflicting_next_height = None;
        }
        self.reset();
        self.rcert = entry.rcert().clone();
        self.set_type(entry);
    }

    fn set_type_conflict(&mut self, entry: &Entry, internal: bool) {
        if internal {
            match entry {
                Entry::Proposal(v) => self.conflicting_proposal = Some(v.clone()),
                Entry::PreVote(v) => self.conflicting_pre_vote = Some(v.clone()),
                Entry::PreCommit(v) => self.conflicting_pre_commit = Some(v.clone()),
                Entry::NextHeight(v) => self.conflicting_next_height = Some(v.clone()),
                other => self.conflicting_rcert = Some(other.rcert().clone()),
            }
        }
        self.implicit_pvn = true;
        self.implicit_pcn = true;
    }

    fn set_type(&mut self, entry: Entry) {
        match entry {
            Entry::RCert(v) => self.rcert = v,
            Entry::Proposal(v) => self.proposal = Some(v),
            Entry::PreVote(v) => self.pre_vote = Some(v),
            Entry::PreVoteNil(v) => self.pre_vote_nil = Some(v),
            Entry::PreCommit(v) => self.pre_commit = Some(v),
            Entry::PreCommitNil(v) => self.pre_commit_nil = Some(v),
            Entry::NextRound(v) => self.next_round = Some(v),
            Entry::NextHeight(v) => self.next_height = Some(v),
        }
    }

    fn check_type_stale(&self, entry: &Entry, internal: bool) -> Result<()> {
        if !internal {
            return Ok(());
        }
        let held = match entry {
            Entry::RCert(_) => false,
            Entry::Proposal(_) => self.proposal.is_some(),
            Entry::PreVote(_) => self.pre_vote.is_some(),
            Entry::PreVoteNil(_) => self.pre_vote_nil.is_some(),
            Entry::PreCommit(_) => self.pre_commit.is_some(),
            Entry::PreCommitNil(_) => self.pre_commit_nil.is_some(),
            Entry::NextRound(_) => self.next_round.is_some(),
            Entry::NextHeight(_) => self.next_height.is_some(),
        };
        if held {
            return Err(ConsensusError::stale("artifact of this kind already held"));
        }
        Ok(())
    }
}
