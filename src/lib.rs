//! Bridge Orchestrator - validator-side orchestration of cross-chain locks
//!
//! Moves Bitcoin and Ethereum lock transfers through a per-block state
//! machine, runs the external-chain work (broadcasts, finality checks) as
//! retryable jobs on validator nodes, and aggregates the M-of-N signatures
//! that authorize Bitcoin multisig spends.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod jobs;
pub mod keys;
pub mod metrics;
pub mod state;
pub mod tracker;
pub mod tx;

pub use error::{BridgeError, BridgeResult};
