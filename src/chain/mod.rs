//! External chain drivers
//!
//! This module provides:
//! - The async driver contracts jobs use to reach Bitcoin and Ethereum
//! - Bitcoin lock transaction assembly (pure, no network)
//! - Bitcoin Core JSON-RPC and ethers-based implementations

pub mod bitcoin;
pub mod ethereum;

pub use self::bitcoin::BitcoinRpcDriver;
pub use self::ethereum::EthereumChainDriver;

use crate::error::BridgeResult;

use ::bitcoin::{Transaction, Txid};
use async_trait::async_trait;
use ethers::types::H256;
use serde::Serialize;

/// Bitcoin node operations needed by bridge jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BtcChainDriver: Send + Sync {
    /// Submit a fully signed transaction; already-known transactions succeed
    async fn broadcast_tx(&self, tx: &Transaction) -> BridgeResult<Txid>;

    /// Whether the transaction has reached the configured confirmation depth
    async fn check_finality(&self, txid: &Txid) -> BridgeResult<bool>;

    async fn health_check(&self) -> bool;
}

/// Confirmation status of an Ethereum transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EthFinality {
    /// Unknown, unmined, or not deep enough yet
    Pending,
    Confirmed,
    /// Mined but reverted
    Failed,
}

/// Ethereum node operations needed by bridge jobs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EthChainDriver: Send + Sync {
    /// Submit a signed raw transaction; returns its hash
    async fn broadcast_raw(&self, raw_tx: &[u8]) -> BridgeResult<H256>;

    async fn check_finality(&self, tx_hash: H256) -> BridgeResult<EthFinality>;

    async fn health_check(&self) -> bool;
}
