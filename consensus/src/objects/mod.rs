/// Protocol artifacts and the (height, round) order over them
///
/// Every artifact is a serde struct whose canonical encoding is bincode.
/// Signatures are taken over a per-type designator followed by that
/// encoding, so a signature for one artifact type never verifies as another.

pub mod claims;
pub mod next;
pub mod round_state;
pub mod state;
pub mod votes;

pub use claims::{make_tx_root, BClaims, PClaims, RClaims, RCert};
pub use next::{make_block_header, make_round_cert, BlockHeader, NHClaims, NRClaims, NextHeight, NextRound};
pub use round_state::RoundState;
pub use state::{OwnState, OwnValidatingState, Validator, ValidatorSet};
pub use votes::{make_next_height, make_pre_commit, PreCommit, PreCommitNil, PreVote, PreVoteNil, Proposal};

use crate::crypto::{BLSPublicKey, GroupKey, ValidatorAddress};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub(crate) const PROPOSAL_DESIGNATOR: &[u8] = b"Proposal";
pub(crate) const PRE_VOTE_DESIGNATOR: &[u8] = b"PreVote";
pub(crate) const PRE_VOTE_NIL_DESIGNATOR: &[u8] = b"PreVoteNil";
pub(crate) const PRE_COMMIT_DESIGNATOR: &[u8] = b"PreCommit";
pub(crate) const PRE_COMMIT_NIL_DESIGNATOR: &[u8] = b"PreCommitNil";
pub(crate) const NEXT_ROUND_DESIGNATOR: &[u8] = b"NextRound";
pub(crate) const NEXT_HEIGHT_DESIGNATOR: &[u8] = b"NextHeight";

/// Canonical encoding
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub(crate) fn designated<T: Serialize + ?Sized>(designator: &[u8], value: &T) -> Result<Vec<u8>> {
    let mut out = designator.to_vec();
    out.extend(encode(value)?);
    Ok(out)
}

/// Artifacts that embed a round certificate
pub trait HasRCert {
    fn rcert(&self) -> &RCert;
}

/// Anything positioned at a (height, round)
pub trait HeightRound {
    fn height_round(&self) -> (u32, u32);

    fn height(&self) -> u32 {
        self.height_round().0
    }

    fn round(&self) -> u32 {
        self.height_round().1
    }
}

macro_rules! impl_has_rcert {
    ($($ty:ty => |$v:ident| $rcert:expr;)*) => {
        $(
            impl HasRCert for $ty {
                fn rcert(&self) -> &RCert {
                    let $v = self;
                    $rcert
                }
            }

            impl HeightRound for $ty {
                fn height_round(&self) -> (u32, u32) {
                    let claims = &self.rcert().claims;
                    (claims.height, claims.round)
                }
            }
        )*
    };
}

impl_has_rcert! {
    RCert => |v| v;
    PClaims => |v| &v.rcert;
    Proposal => |v| &v.pclaims.rcert;
    PreVote => |v| &v.proposal.pclaims.rcert;
    PreVoteNil => |v| &v.rcert;
    PreCommit => |v| &v.proposal.pclaims.rcert;
    PreCommitNil => |v| &v.rcert;
    NRClaims => |v| &v.rcert;
    NextRound => |v| &v.claims.rcert;
    NHClaims => |v| &v.proposal.pclaims.rcert;
    NextHeight => |v| &v.claims.proposal.pclaims.rcert;
    RoundState => |v| &v.rcert;
}

/// Artifacts signed by a single validator
pub trait Authored {
    /// Address of the embedded signing key; only meaningful after the
    /// artifact's signatures were validated
    fn author(&self) -> Result<ValidatorAddress>;
}

macro_rules! impl_authored {
    ($($ty:ty),*) => {
        $(
            impl Authored for $ty {
                fn author(&self) -> Result<ValidatorAddress> {
                    Ok(self.signature.signer()?)
                }
            }
        )*
    };
}

impl_authored!(Proposal, PreVote, PreVoteNil, PreCommit, PreCommitNil, NextRound, NextHeight);

impl HeightRound for RClaims {
    fn height_round(&self) -> (u32, u32) {
        (self.height, self.round)
    }
}

/// A committed header sits at round 1 of its height
impl HeightRound for BlockHeader {
    fn height_round(&self) -> (u32, u32) {
        (self.bclaims.height, 1)
    }
}

/// Order by height, then round
pub fn relate_hr<A, B>(a: &A, b: &B) -> Ordering
where
    A: HeightRound + ?Sized,
    B: HeightRound + ?Sized,
{
    a.height_round().cmp(&b.height_round())
}

/// Order by height only
pub fn relate_h<A, B>(a: &A, b: &B) -> Ordering
where
    A: HeightRound + ?Sized,
    B: HeightRound + ?Sized,
{
    a.height().cmp(&b.height())
}

/// `height - 1`, never below 1
pub fn sub_one_no_zero(height: u32) -> u32 {
    height.saturating_sub(1).max(1)
}

/// Identities recovered from an artifact's signatures
#[derive(Clone, Debug, Default)]
pub struct Signers {
    pub group_key: GroupKey,
    pub proposer: Option<ValidatorAddress>,
    pub voter: Option<ValidatorAddress>,
    pub group_share: Option<BLSPublicKey>,
    pub cosigners: Vec<ValidatorAddress>,
}

impl Signers {
    /// The validator whose round state receives the artifact
    pub fn author(&self) -> Option<ValidatorAddress> {
        self.voter.or(self.proposer)
    }
}

/// Any inbound protocol message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    PreVote(PreVote),
    PreVoteNil(PreVoteNil),
    PreCommit(PreCommit),
    PreCommitNil(PreCommitNil),
    NextRound(NextRound),
    NextHeight(NextHeight),
    BlockHeader(BlockHeader),
}

impl ConsensusMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Proposal(_) => "proposal",
            Self::PreVote(_) => "pre_vote",
            Self::PreVoteNil(_) => "pre_vote_nil",
            Self::PreCommit(_) => "pre_commit",
            Self::PreCommitNil(_) => "pre_commit_nil",
            Self::NextRound(_) => "next_round",
            Self::NextHeight(_) => "next_height",
            Self::BlockHeader(_) => "block_header",
        }
    }

    pub fn chain_id(&self) -> u32 {
        match self {
            Self::BlockHeader(bh) => bh.bclaims.chain_id,
            _ => self.rcert().map_or(0, |rc| rc.claims.chain_id),
        }
    }

    /// Embedded certificate; block headers carry none
    pub fn rcert(&self) -> Option<&RCert> {
        match self {
            Self::Proposal(v) => Some(v.rcert()),
            Self::PreVote(v) => Some(v.rcert()),
            Self::PreVoteNil(v) => Some(v.rcert()),
            Self::PreCommit(v) => Some(v.rcert()),
            Self::PreCommitNil(v) => Some(v.rcert()),
            Self::NextRound(v) => Some(v.rcert()),
            Self::NextHeight(v) => Some(v.rcert()),
            Self::BlockHeader(_) => None,
        }
    }

    pub fn validate_signatures(&self) -> Result<Signers> {
        match self {
            Self::Proposal(v) => v.validate_signatures(),
            Self::PreVote(v) => v.validate_signatures(),
            Self::PreVoteNil(v) => v.validate_signatures(),
            Self::PreCommit(v) => v.validate_signatures(),
            Self::PreCommitNil(v) => v.validate_signatures(),
            Self::NextRound(v) => v.validate_signatures(),
            Self::NextHeight(v) => v.validate_signatures(),
            Self::BlockHeader(v) => Ok(Signers {
                group_key: v.validate_signatures()?,
                ..Signers::default()
            }),
        }
    }
}

impl HeightRound for ConsensusMessage {
    fn height_round(&self) -> (u32, u32) {
        match self {
            Self::BlockHeader(bh) => bh.height_round(),
            _ => self.rcert().map_or((0, 0), |rc| rc.height_round()),
        }
    }
}
