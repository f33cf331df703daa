use super::{
    designated, encode, NRClaims, NextRound, PreCommitNil, PreVoteNil, NEXT_ROUND_DESIGNATOR,
    PRE_COMMIT_NIL_DESIGNATOR, PRE_VOTE_NIL_DESIGNATOR,
};
use crate::config::DEAD_BLOCK_ROUND;
use crate::crypto::{hash_concat, hash_data, GroupKey, GroupSignature, GroupSigner, Hash, ValidatorSigner};
use crate::error::{ConsensusError, Result};
use serde::{Deserialize, Serialize};

/// Claims of a round certificate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RClaims {
    pub chain_id: u32,
    pub height: u32,
    pub round: u32,
    pub prev_block: Hash,
}

impl RClaims {
    /// Bytes the group signs for a round above 1
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn next_round(&self) -> Self {
        Self {
            round: self.round + 1,
            ..self.clone()
        }
    }
}

/// Proof that the network reached (height, round) after `prev_block`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RCert {
    pub claims: RClaims,
    /// Absent only for round 1 of heights 1 and 2
    pub sig_group: Option<GroupSignature>,
}

impl RCert {
    /// Round 1 certificate of a height whose predecessor carries no group
    /// signature (heights 1 and 2)
    pub fn unsigned(chain_id: u32, height: u32, prev_block: Hash) -> Self {
        Self {
            claims: RClaims {
                chain_id,
                height,
                round: 1,
                prev_block,
            },
            sig_group: None,
        }
    }

    pub fn chain_id(&self) -> u32 {
        self.claims.chain_id
    }

    pub fn prev_block(&self) -> &Hash {
        &self.claims.prev_block
    }

    /// Validate the group signature and return the signing group's key.
    /// Unsigned genesis certificates yield the zero key.
    pub fn validate_signature(&self) -> Result<GroupKey> {
        let c = &self.claims;
        if c.height == 0 {
            return Err(ConsensusError::invalid("rcert height is zero"));
        }
        if c.chain_id == 0 {
            return Err(ConsensusError::invalid("rcert chain id is zero"));
        }
        if c.round == 0 {
            return Err(ConsensusError::invalid("rcert round is zero"));
        }
        if c.round > DEAD_BLOCK_ROUND {
            return Err(ConsensusError::invalid("rcert round beyond dead block round"));
        }
        match (c.height, c.round) {
            (1, 1) | (2, 1) => return Ok(GroupKey::default()),
            (1, _) => return Err(ConsensusError::invalid("no round above 1 exists at height 1")),
            _ => {}
        }
        let sig = self
            .sig_group
            .as_ref()
            .ok_or_else(|| ConsensusError::invalid("rcert missing group signature"))?;
        let key = if c.round > 1 {
            sig.verify(&c.signing_bytes()?)?
        } else {
            sig.verify(c.prev_block.as_bytes())?
        };
        Ok(key)
    }

    pub fn pre_vote_nil(&self, signer: &ValidatorSigner) -> Result<PreVoteNil> {
        let signature = signer.sign(&designated(PRE_VOTE_NIL_DESIGNATOR, self)?);
        Ok(PreVoteNil {
            rcert: self.clone(),
            signature,
        })
    }

    pub fn pre_commit_nil(&self, signer: &ValidatorSigner) -> Result<PreCommitNil> {
        let signature = signer.sign(&designated(PRE_COMMIT_NIL_DESIGNATOR, self)?);
        Ok(PreCommitNil {
            rcert: self.clone(),
            signature,
        })
    }

    /// Vote to move to round + 1, with a share over the next round's claims
    pub fn next_round(&self, signer: &ValidatorSigner, group: &GroupSigner) -> Result<NextRound> {
        let next_claims = self.claims.next_round();
        let share = group.sign_share(&next_claims.signing_bytes()?);
        let claims = NRClaims {
            rcert: self.clone(),
            next_claims,
            share,
        };
        let signature = signer.sign(&designated(NEXT_ROUND_DESIGNATOR, &claims)?);
        Ok(NextRound { claims, signature })
    }
}

/// Claims of a block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BClaims {
    pub chain_id: u32,
    pub height: u32,
    pub tx_count: u32,
    pub prev_block: Hash,
    pub tx_root: Hash,
    pub state_root: Hash,
    pub header_root: Hash,
}

impl BClaims {
    /// BLAKE3 over the fixed-width fields in declaration order, integers
    /// big-endian
    pub fn block_hash(&self) -> Hash {
        hash_concat([
            &self.chain_id.to_be_bytes()[..],
            &self.height.to_be_bytes()[..],
            &self.tx_count.to_be_bytes()[..],
            &self.prev_block.as_bytes()[..],
            &self.tx_root.as_bytes()[..],
            &self.state_root.as_bytes()[..],
            &self.header_root.as_bytes()[..],
        ])
    }

    /// Check that `tx_hashes` is the list these claims commit to
    pub fn validate_tx_hashes(&self, tx_hashes: &[Hash]) -> Result<()> {
        if self.tx_count as usize != tx_hashes.len() {
            return Err(ConsensusError::invalid(format!(
                "tx count {} does not match {} hashes",
                self.tx_count,
                tx_hashes.len()
            )));
        }
        if make_tx_root(tx_hashes) != self.tx_root {
            return Err(ConsensusError::invalid("tx root mismatch"));
        }
        Ok(())
    }
}

/// Claims signed by a proposer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PClaims {
    pub bclaims: BClaims,
    pub rcert: RCert,
}

impl PClaims {
    pub fn validate(&self) -> Result<GroupKey> {
        let rc = &self.rcert.claims;
        if self.bclaims.chain_id != rc.chain_id {
            return Err(ConsensusError::invalid("bclaims and rcert chain id differ"));
        }
        if self.bclaims.height != rc.height {
            return Err(ConsensusError::invalid("bclaims and rcert height differ"));
        }
        if self.bclaims.prev_block != rc.prev_block {
            return Err(ConsensusError::invalid("bclaims and rcert prev block differ"));
        }
        self.rcert.validate_signature()
    }
}

/// Merkle-free commitment to an ordered set of transaction hashes
pub fn make_tx_root(tx_hashes: &[Hash]) -> Hash {
    if tx_hashes.is_empty() {
        return hash_data(&[]);
    }
    let mut sorted = tx_hashes.to_vec();
    sorted.sort();
    hash_concat(sorted.iter().map(|h| &h.as_bytes()[..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(height: u32, round: u32) -> RClaims {
        RClaims {
            chain_id: 7,
            height,
            round,
            prev_block: Hash::new([3u8; 32]),
        }
    }

    #[test]
    fn test_block_hash_layout() {
        let bclaims = BClaims {
            chain_id: 7,
            height: 2,
            tx_count: 0,
            prev_block: Hash::new([1u8; 32]),
            tx_root: Hash::new([2u8; 32]),
            state_root: Hash::new([3u8; 32]),
            header_root: Hash::new([4u8; 32]),
        };
        let mut bytes = Vec::with_capacity(116);
        bytes.extend([0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, 0]);
        for fill in 1u8..=4 {
            bytes.extend([fill; 32]);
        }
        assert_eq!(bclaims.block_hash(), hash_data(&bytes));

        let moved = BClaims { height: 3, ..bclaims.clone() };
        assert_ne!(moved.block_hash(), bclaims.block_hash());
    }

    #[test]
    fn test_rcert_structural_rules() {
        let zero_height = RCert { claims: claims(0, 1), sig_group: None };
        assert!(zero_height.validate_signature().is_err());

        let zero_round = RCert { claims: claims(4, 0), sig_group: None };
        assert!(zero_round.validate_signature().is_err());

        let beyond_dbr = RCert { claims: claims(4, DEAD_BLOCK_ROUND + 1), sig_group: None };
        assert!(beyond_dbr.validate_signature().is_err());

        let h1r2 = RCert { claims: claims(1, 2), sig_group: None };
        assert!(h1r2.validate_signature().is_err());

        let mut zero_chain = RCert::unsigned(0, 2, Hash::zero());
        assert!(zero_chain.validate_signature().is_err());
        zero_chain.claims.chain_id = 1;
        assert!(zero_chain.validate_signature().unwrap().is_zero());
    }

    #[test]
    fn test_signed_rcert_requires_signature() {
        let unsigned = RCert { claims: claims(3, 1), sig_group: None };
        assert!(matches!(unsigned.validate_signature(), Err(ConsensusError::Invalid(_))));
    }

    #[test]
    fn test_tx_root_is_order_independent() {
        let a = hash_data(b"a");
        let b = hash_data(b"b");
        assert_eq!(make_tx_root(&[a, b]), make_tx_root(&[b, a]));
        assert_ne!(make_tx_root(&[a]), make_tx_root(&[]));
    }

    #[test]
    fn test_bclaims_tx_hash_validation() {
        let hashes = vec![hash_data(b"tx1"), hash_data(b"tx2")];
        let mut bclaims = BClaims {
            chain_id: 7,
            height: 3,
            tx_count: 2,
            prev_block: Hash::zero(),
            tx_root: make_tx_root(&hashes),
            state_root: Hash::zero(),
            header_root: Hash::zero(),
        };
        assert!(bclaims.validate_tx_hashes(&hashes).is_ok());
        assert!(bclaims.validate_tx_hashes(&hashes[..1]).is_err());
        bclaims.tx_count = 1;
        assert!(bclaims.validate_tx_hashes(&hashes[..1]).is_err());
    }

    #[test]
    fn test_block_hash_covers_every_field() {
        let base = BClaims {
            chain_id: 7,
            height: 3,
            tx_count: 0,
            prev_block: Hash::zero(),
            tx_root: make_tx_root(&[]),
            state_root: Hash::zero(),
            header_root: Hash::zero(),
        };
        let mut other = base.clone();
        other.state_root = Hash::new([1u8; 32]);
        assert_ne!(base.block_hash(), other.block_hash());
        assert_eq!(base.block_hash(), base.clone().block_hash());
    }
}
