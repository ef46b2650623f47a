//! Ethereum driver with multi-RPC failover
//!
//! Finality is judged by confirmation depth: a mined, successful receipt at
//! least `confirmation_blocks` below the head counts as final.

use super::{EthChainDriver, EthFinality};
use crate::config::EthereumConfig;
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::utils::keccak256;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct EthereumChainDriver {
    chain_id: u64,
    confirmation_blocks: u64,
    /// HTTP providers (multiple for failover)
    providers: Vec<Provider<Http>>,
    current_provider: AtomicUsize,
}

impl EthereumChainDriver {
    pub fn new(config: &EthereumConfig) -> BridgeResult<Self> {
        let mut providers = Vec::new();

        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    providers.push(provider.interval(Duration::from_millis(100)));
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if providers.is_empty() {
            return Err(connection_error("No valid RPC providers".to_string()));
        }

        Ok(Self {
            chain_id: config.chain_id,
            confirmation_blocks: config.confirmation_blocks,
            providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.providers[idx % self.providers.len()]
    }

    /// Switch to next available provider
    fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.chain_id, next);
    }

    async fn get_block_number(&self) -> BridgeResult<u64> {
        for _ in 0..self.providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(connection_error("All providers failed".to_string()))
    }

    async fn get_transaction_receipt(&self, tx_hash: H256) -> BridgeResult<Option<TransactionReceipt>> {
        for _ in 0..self.providers.len() {
            match self.http().get_transaction_receipt(tx_hash).await {
                Ok(receipt) => return Ok(receipt),
                Err(e) => {
                    warn!("Failed to get receipt {:?} from chain {}: {}", tx_hash, self.chain_id, e);
                    self.failover();
                }
            }
        }

        Err(connection_error("All providers failed to get receipt".to_string()))
    }

    async fn is_known(&self, tx_hash: H256) -> bool {
        matches!(self.http().get_transaction(tx_hash).await, Ok(Some(_)))
    }
}

fn connection_error(message: String) -> BridgeError {
    BridgeError::ChainConnection {
        chain: "ethereum".to_string(),
        message,
    }
}

/// Classify a mined receipt against the current head
fn receipt_finality(receipt: &TransactionReceipt, current_block: u64, confirmation_blocks: u64) -> EthFinality {
    if receipt.status == Some(0.into()) {
        return EthFinality::Failed;
    }
    match receipt.block_number {
        Some(mined) if current_block.saturating_sub(mined.as_u64()) >= confirmation_blocks => {
            EthFinality::Confirmed
        }
        _ => EthFinality::Pending,
    }
}

#[async_trait]
impl EthChainDriver for EthereumChainDriver {
    async fn broadcast_raw(&self, raw_tx: &[u8]) -> BridgeResult<H256> {
        let tx_hash = H256::from(keccak256(raw_tx));
        if self.is_known(tx_hash).await {
            debug!("Ethereum transaction {:?} already known", tx_hash);
            return Ok(tx_hash);
        }

        let raw = Bytes::from(raw_tx.to_vec());
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => {
                let sent = *pending;
                info!("Transaction broadcast to chain {}: {:?}", self.chain_id, sent);
                Ok(sent)
            }
            Err(e) if e.to_string().contains("already known") => Ok(tx_hash),
            Err(e) => {
                error!("Broadcast to chain {} failed: {}", self.chain_id, e);
                self.failover();
                Err(BridgeError::Broadcast {
                    chain: "ethereum".to_string(),
                    message: e.to_string(),
                })
            }
        }
    }

    async fn check_finality(&self, tx_hash: H256) -> BridgeResult<EthFinality> {
        let Some(receipt) = self.get_transaction_receipt(tx_hash).await? else {
            debug!("No receipt yet for {:?} on chain {}", tx_hash, self.chain_id);
            return Ok(EthFinality::Pending);
        };

        let current_block = self.get_block_number().await?;
        let finality = receipt_finality(&receipt, current_block, self.confirmation_blocks);
        debug!(
            "Transaction {:?} on chain {} is {:?} at block {}",
            tx_hash, self.chain_id, finality, current_block
        );
        Ok(finality)
    }

    async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.chain_id, e);
                false
            }
        }
    }
}
