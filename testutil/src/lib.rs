/// Testing utilities for the consensus engine
///
/// Provides:
/// - Transaction payload generators and proptest strategies
/// - Tracing setup for tests

pub mod fixtures;
pub mod generators;

pub use fixtures::*;
pub use generators::*;
