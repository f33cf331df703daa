use super::votes::verify_all;
use super::{
    designated, BClaims, Proposal, RCert, RClaims, Signers, NEXT_HEIGHT_DESIGNATOR,
    NEXT_ROUND_DESIGNATOR, PRE_COMMIT_DESIGNATOR,
};
use crate::crypto::{
    GroupKey, GroupSignature, GroupSigner, Hash, ShareSignature, ValidatorSignature,
    ValidatorSigner,
};
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};

/// Round escalation claims: the current certificate plus a share over the
/// claims of the next round
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NRClaims {
    pub rcert: RCert,
    pub next_claims: RClaims,
    pub share: ShareSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextRound {
    pub claims: NRClaims,
    pub signature: ValidatorSignature,
}

impl NextRound {
    pub fn validate_signatures(&self) -> Result<Signers> {
        let group_key = self.claims.rcert.validate_signature()?;
        if self.claims.next_claims != self.claims.rcert.claims.next_round() {
            return Err(ConsensusError::invalid("next round claims do not follow the rcert"));
        }
        self.claims
            .share
            .verify(&self.claims.next_claims.signing_bytes()?)?;
        let voter = self
            .signature
            .verify(&designated(NEXT_ROUND_DESIGNATOR, &self.claims)?)?;
        Ok(Signers {
            group_key,
            voter: Some(voter),
            group_share: Some(self.claims.share.share.clone()),
            ..Signers::default()
        })
    }
}

/// Aggregate a quorum of next round votes into the certificate of round + 1
pub fn make_round_cert(group: &GroupSigner, next_rounds: &[NextRound]) -> Result<RCert> {
    let first = next_rounds
        .first()
        .ok_or_else(|| ConsensusError::invalid("no next round votes"))?;
    let claims = first.claims.next_claims.clone();
    if next_rounds.iter().any(|nr| nr.claims.next_claims != claims) {
        return Err(ConsensusError::invalid("next round votes disagree"));
    }
    let shares: Vec<ShareSignature> = next_rounds.iter().map(|nr| nr.claims.share.clone()).collect();
    let sig_group = group.aggregate(&claims.signing_bytes()?, &shares)?;
    Ok(RCert {
        claims,
        sig_group: Some(sig_group),
    })
}

/// Height escalation claims: the precommitted proposal plus a share over
/// its block hash
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NHClaims {
    pub proposal: Proposal,
    pub share: ShareSignature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextHeight {
    pub claims: NHClaims,
    /// Signatures of the precommits this vote was built from
    pub pre_commits: Vec<ValidatorSignature>,
    pub signature: ValidatorSignature,
}

impl NextHeight {
    pub fn proposal(&self) -> &Proposal {
        &self.claims.proposal
    }

    pub fn validate_signatures(&self) -> Result<Signers> {
        let mut signers = self.claims.proposal.validate_signatures()?;
        self.claims
            .share
            .verify(self.claims.proposal.block_hash().as_bytes())?;
        let pc_message = designated(PRE_COMMIT_DESIGNATOR, &self.claims.proposal.pclaims)?;
        signers.cosigners = verify_all(&self.pre_commits, &pc_message)?;
        signers.voter = Some(
            self.signature
                .verify(&designated(NEXT_HEIGHT_DESIGNATOR, &self.claims)?)?,
        );
        signers.group_share = Some(self.claims.share.share.clone());
        Ok(signers)
    }

    /// The same vote, re-signed under the local validator's keys
    pub fn plagiarize(&self, signer: &ValidatorSigner, group: &GroupSigner) -> Result<NextHeight> {
        let proposal = self.claims.proposal.clone();
        let share = group.sign_share(proposal.block_hash().as_bytes());
        let claims = NHClaims { proposal, share };
        let signature = signer.sign(&designated(NEXT_HEIGHT_DESIGNATOR, &claims)?);
        Ok(NextHeight {
            claims,
            pre_commits: self.pre_commits.clone(),
            signature,
        })
    }
}

/// Aggregate a quorum of next height votes into the committed header and
/// the round 1 certificate of the following height
pub fn make_block_header(
    group: &GroupSigner,
    next_heights: &[NextHeight],
) -> Result<(BlockHeader, RCert)> {
    let first = next_heights
        .first()
        .ok_or_else(|| ConsensusError::invalid("no next height votes"))?;
    let proposal = &first.claims.proposal;
    let bclaims = proposal.pclaims.bclaims.clone();
    if next_heights
        .iter()
        .any(|nh| nh.claims.proposal.pclaims.bclaims != bclaims)
    {
        return Err(ConsensusError::invalid("next height votes disagree"));
    }
    let shares: Vec<ShareSignature> = next_heights.iter().map(|nh| nh.claims.share.clone()).collect();
    let sig_group = group.aggregate(bclaims.block_hash().as_bytes(), &shares)?;
    let header = BlockHeader {
        bclaims,
        sig_group: Some(sig_group),
        tx_hashes: proposal.tx_hashes.clone(),
    };
    let rcert = header.next_rcert();
    Ok((header, rcert))
}

/// A committed block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub bclaims: BClaims,
    /// Absent only on the genesis header
    pub sig_group: Option<GroupSignature>,
    pub tx_hashes: Vec<Hash>,
}

impl BlockHeader {
    pub fn genesis(chain_id: u32, state_root: Hash) -> Self {
        let bclaims = BClaims {
            chain_id,
            height: 1,
            tx_count: 0,
            prev_block: Hash::zero(),
            tx_root: super::make_tx_root(&[]),
            state_root,
            header_root: Hash::zero(),
        };
        Self {
            bclaims,
            sig_group: None,
            tx_hashes: Vec::new(),
        }
    }

    pub fn block_hash(&self) -> Hash {
        self.bclaims.block_hash()
    }

    /// Validate the group signature, returning the signing group's key
    pub fn validate_signatures(&self) -> Result<GroupKey> {
        if self.bclaims.chain_id == 0 {
            return Err(ConsensusError::invalid("block header chain id is zero"));
        }
        self.bclaims.validate_tx_hashes(&self.tx_hashes)?;
        match (self.bclaims.height, &self.sig_group) {
            (0, _) => Err(ConsensusError::invalid("block header height is zero")),
            (1, _) => Ok(GroupKey::default()),
            (_, None) => Err(ConsensusError::invalid("block header missing group signature")),
            (_, Some(sig)) => Ok(sig.verify(self.block_hash().as_bytes())?),
        }
    }

    /// Round 1 certificate of the following height
    pub fn next_rcert(&self) -> RCert {
        RCert {
            claims: RClaims {
                chain_id: self.bclaims.chain_id,
                height: self.bclaims.height + 1,
                round: 1,
                prev_block: self.block_hash(),
            },
            sig_group: self.sig_group.clone(),
        }
    }
}
