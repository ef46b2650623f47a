//! Submission of internally generated transactions

use super::{BroadcastReply, InternalBroadcastRequest, TxPool};
use crate::error::{BridgeError, BridgeResult};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hands a transaction to the node for inclusion in a block
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait InternalBroadcaster: Send + Sync {
    async fn internal_broadcast(&self, request: InternalBroadcastRequest) -> BridgeResult<BroadcastReply>;
}

/// Posts transactions to a node's `/tx` endpoint
pub struct HttpBroadcaster {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBroadcaster {
    pub fn new(base_url: &str) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| BridgeError::InternalBroadcast(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/tx", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl InternalBroadcaster for HttpBroadcaster {
    async fn internal_broadcast(&self, request: InternalBroadcastRequest) -> BridgeResult<BroadcastReply> {
        debug!("Posting {} to {}", request.request_id, self.endpoint);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| BridgeError::InternalBroadcast(e.to_string()))?;

        response
            .json::<BroadcastReply>()
            .await
            .map_err(|e| BridgeError::InternalBroadcast(format!("invalid reply: {}", e)))
    }
}

/// Queues transactions in this node's own pool
pub struct LoopbackBroadcaster {
    pool: Arc<TxPool>,
}

impl LoopbackBroadcaster {
    pub fn new(pool: Arc<TxPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InternalBroadcaster for LoopbackBroadcaster {
    async fn internal_broadcast(&self, request: InternalBroadcastRequest) -> BridgeResult<BroadcastReply> {
        Ok(self.pool.submit(request.raw_tx))
    }
}
