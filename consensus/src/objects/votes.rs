use super::{
    designated, BClaims, NHClaims, NextHeight, PClaims, RCert, Signers, NEXT_HEIGHT_DESIGNATOR,
    PRE_COMMIT_DESIGNATOR, PRE_COMMIT_NIL_DESIGNATOR, PRE_VOTE_DESIGNATOR,
    PRE_VOTE_NIL_DESIGNATOR, PROPOSAL_DESIGNATOR,
};
use crate::crypto::{GroupSigner, Hash, ValidatorAddress, ValidatorSignature, ValidatorSigner};
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};

/// A proposer's block for one (height, round)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub pclaims: PClaims,
    pub tx_hashes: Vec<Hash>,
    pub signature: ValidatorSignature,
}

impl Proposal {
    pub fn new(
        signer: &ValidatorSigner,
        bclaims: BClaims,
        rcert: RCert,
        tx_hashes: Vec<Hash>,
    ) -> Result<Self> {
        let pclaims = PClaims { bclaims, rcert };
        let signature = signer.sign(&designated(PROPOSAL_DESIGNATOR, &pclaims)?);
        Ok(Self {
            pclaims,
            tx_hashes,
            signature,
        })
    }

    pub fn bclaims(&self) -> &BClaims {
        &self.pclaims.bclaims
    }

    pub fn block_hash(&self) -> Hash {
        self.pclaims.bclaims.block_hash()
    }

    /// Same block, re-signed under a later round certificate
    pub fn re_propose(&self, signer: &ValidatorSigner, rcert: RCert) -> Result<Self> {
        Self::new(signer, self.pclaims.bclaims.clone(), rcert, self.tx_hashes.clone())
    }

    pub fn pre_vote(&self, signer: &ValidatorSigner) -> Result<PreVote> {
        let signature = signer.sign(&designated(PRE_VOTE_DESIGNATOR, &self.pclaims)?);
        Ok(PreVote {
            proposal: self.clone(),
            signature,
        })
    }

    pub fn validate_signatures(&self) -> Result<Signers> {
        let group_key = self.pclaims.validate()?;
        self.pclaims.bclaims.validate_tx_hashes(&self.tx_hashes)?;
        let proposer = self
            .signature
            .verify(&designated(PROPOSAL_DESIGNATOR, &self.pclaims)?)?;
        Ok(Signers {
            group_key,
            proposer: Some(proposer),
            ..Signers::default()
        })
    }
}

/// Vote for a proposal
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVote {
    pub proposal: Proposal,
    pub signature: ValidatorSignature,
}

impl PreVote {
    pub fn validate_signatures(&self) -> Result<Signers> {
        let mut signers = self.proposal.validate_signatures()?;
        signers.voter = Some(
            self.signature
                .verify(&designated(PRE_VOTE_DESIGNATOR, &self.proposal.pclaims)?)?,
        );
        Ok(signers)
    }
}

/// Build a precommit from a prevote quorum for one proposal
pub fn make_pre_commit(signer: &ValidatorSigner, pre_votes: &[PreVote]) -> Result<PreCommit> {
    let first = pre_votes
        .first()
        .ok_or_else(|| ConsensusError::invalid("no prevotes to precommit"))?;
    if pre_votes
        .iter()
        .any(|pv| pv.proposal.pclaims != first.proposal.pclaims)
    {
        return Err(ConsensusError::invalid("prevotes disagree on the proposal"));
    }
    let proposal = first.proposal.clone();
    let signature = signer.sign(&designated(PRE_COMMIT_DESIGNATOR, &proposal.pclaims)?);
    Ok(PreCommit {
        proposal,
        pre_votes: pre_votes.iter().map(|pv| pv.signature.clone()).collect(),
        signature,
    })
}

/// Timeout vote for nothing in a round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreVoteNil {
    pub rcert: RCert,
    pub signature: ValidatorSignature,
}

impl PreVoteNil {
    pub fn validate_signatures(&self) -> Result<Signers> {
        let group_key = self.rcert.validate_signature()?;
        let voter = self
            .signature
            .verify(&designated(PRE_VOTE_NIL_DESIGNATOR, &self.rcert)?)?;
        Ok(Signers {
            group_key,
            voter: Some(voter),
            ..Signers::default()
        })
    }
}

/// Commitment to a proposal backed by a prevote quorum
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommit {
    pub proposal: Proposal,
    /// Signatures of the prevotes this precommit was built from
    pub pre_votes: Vec<ValidatorSignature>,
    pub signature: ValidatorSignature,
}

impl PreCommit {
    pub fn validate_signatures(&self) -> Result<Signers> {
        let mut signers = self.proposal.validate_signatures()?;
        let pv_message = designated(PRE_VOTE_DESIGNATOR, &self.proposal.pclaims)?;
        signers.cosigners = verify_all(&self.pre_votes, &pv_message)?;
        signers.voter = Some(
            self.signature
                .verify(&designated(PRE_COMMIT_DESIGNATOR, &self.proposal.pclaims)?)?,
        );
        Ok(signers)
    }

    /// The prevotes this precommit proves were cast
    pub fn implicit_pre_votes(&self) -> Vec<PreVote> {
        self.pre_votes
            .iter()
            .map(|signature| PreVote {
                proposal: self.proposal.clone(),
                signature: signature.clone(),
            })
            .collect()
    }
}

/// Build a next height vote from a precommit quorum for one proposal
pub fn make_next_height(
    signer: &ValidatorSigner,
    group: &GroupSigner,
    pre_commits: &[PreCommit],
) -> Result<NextHeight> {
    let first = pre_commits
        .first()
        .ok_or_else(|| ConsensusError::invalid("no precommits for next height"))?;
    if pre_commits
        .iter()
        .any(|pc| pc.proposal.pclaims != first.proposal.pclaims)
    {
        return Err(ConsensusError::invalid("precommits disagree on the proposal"));
    }
    let proposal = first.proposal.clone();
    let share = group.sign_share(proposal.block_hash().as_bytes());
    let claims = NHClaims { proposal, share };
    let signature = signer.sign(&designated(NEXT_HEIGHT_DESIGNATOR, &claims)?);
    Ok(NextHeight {
        claims,
        pre_commits: pre_commits.iter().map(|pc| pc.signature.clone()).collect(),
        signature,
    })
}

/// Timeout commit for nothing in a round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreCommitNil {
    pub rcert: RCert,
    pub signature: ValidatorSignature,
}

impl PreCommitNil {
    pub fn validate_signatures(&self) -> Result<Signers> {
        let group_key = self.rcert.validate_signature()?;
        let voter = self
            .signature
            .verify(&designated(PRE_COMMIT_NIL_DESIGNATOR, &self.rcert)?)?;
        Ok(Signers {
            group_key,
            voter: Some(voter),
            ..Signers::default()
        })
    }
}

pub(crate) fn verify_all(
    signatures: &[ValidatorSignature],
    message: &[u8],
) -> Result<Vec<ValidatorAddress>> {
    signatures
        .iter()
        .map(|sig| sig.verify(message).map_err(ConsensusError::from))
        .collect()
}
