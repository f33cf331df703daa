/// Round-robin BFT consensus engine
///
/// This crate implements the per-node decision logic of a Tendermint-style
/// protocol with:
/// - Proposers rotating by `(height + round - 1) mod n`
/// - BLS group signatures over round certificates and committed headers
/// - A dead block round that forces progress with an empty block
/// - Per-validator round records persisted in RocksDB
///
/// Transport is left to the caller: inbound messages go through
/// [`Handlers::admit`], outbound ones are read back from the broadcast queue
/// in storage, and [`Engine::update_local_state`] is called on every tick.

pub mod application;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod objects;
pub mod round_states;
pub mod storage;
pub mod tx_resolver;

#[cfg(test)]
mod test_fixtures;

pub use application::{Application, MockApplication, Transaction};
pub use config::{EngineConfig, DEAD_BLOCK_ROUND, DEAD_BLOCK_ROUND_NR, EPOCH_LENGTH};
pub use crypto::{BLSPublicKey, BLSSecretKey, BLSSignature, Hash};
pub use engine::{Engine, EngineStatus, GroupKeyStore, InMemoryKeyStore};
pub use error::{ConsensusError, Result};
pub use handlers::Handlers;
pub use objects::{BlockHeader, ConsensusMessage};
pub use storage::Storage;
pub use tx_resolver::{TxFetcher, TxResolver, TxResolverConfig};
