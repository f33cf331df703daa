/// Engine configuration and protocol constants

use crate::tx_resolver::TxResolverConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reserved round where only empty blocks may be proposed
pub const DEAD_BLOCK_ROUND: u32 = 5;

/// The round whose NextRound quorum escalates into the dead block round
pub const DEAD_BLOCK_ROUND_NR: u32 = 4;

/// Heights per snapshot epoch
pub const EPOCH_LENGTH: u32 = 1024;

/// Step timeouts and proposal limits
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time after round start before a proposal is given up on
    pub proposal_step_timeout: Duration,

    /// Time after the local prevote before falling back
    pub pre_vote_step_timeout: Duration,

    /// Time after the local precommit before falling back
    pub pre_commit_step_timeout: Duration,

    /// Extra wait in the dead block round predecessor before escalating
    pub dead_block_round_grace: Duration,

    /// Upper bound on the encoded transactions of a new proposal
    pub max_proposal_bytes: usize,

    pub tx_resolver: TxResolverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            proposal_step_timeout: Duration::from_secs(4),
            pre_vote_step_timeout: Duration::from_secs(3),
            pre_commit_step_timeout: Duration::from_secs(3),
            dead_block_round_grace: Duration::from_secs(60),
            max_proposal_bytes: 3 * 1024 * 1024,
            tx_resolver: TxResolverConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse from JSON, missing fields fall back to defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Every timeout zero; steps fall through as soon as they are reached
    pub fn immediate() -> Self {
        Self {
            proposal_step_timeout: Duration::ZERO,
            pre_vote_step_timeout: Duration::ZERO,
            pre_commit_step_timeout: Duration::ZERO,
            dead_block_round_grace: Duration::ZERO,
            ..Self::default()
        }
    }
}
