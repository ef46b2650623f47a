//! Bridge transactions carried through the internal ledger
//!
//! - `RawTx`: typed envelope with a serialized payload and a memo (the job id
//!   for internally generated transactions)
//! - `TxPool`: transactions waiting for the next block
//! - `InternalBroadcaster`: how jobs hand transactions to the node
//! - `apply_tx`: the state changes a transaction makes when its block runs

mod apply;
mod broadcast;
mod pool;

pub use apply::{apply_tx, TxContext};
pub use broadcast::{HttpBroadcaster, InternalBroadcaster, LoopbackBroadcaster};
pub use pool::TxPool;

#[cfg(test)]
pub use broadcast::MockInternalBroadcaster;

use crate::error::{BridgeError, BridgeResult};
use crate::keys::{hex_bytes, verify_digest, Address, NodeKey, Signature};

use ethers::types::U256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    /// User lock spending into a Bitcoin tracker
    BtcLock,
    /// Validator signature for a pending Bitcoin spend
    BtcAddSignature,
    BtcReportFinalityMint,
    /// User-signed Ethereum lock transaction
    EthLock,
    EthReportFinalityMint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTx {
    pub tx_type: TxType,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
    pub memo: String,
    /// Validator signature over `signing_digest`, for validator-only types
    #[serde(default, with = "hex_bytes")]
    pub auth: Vec<u8>,
}

impl RawTx {
    pub fn new<T: Serialize>(tx_type: TxType, payload: &T, memo: impl Into<String>) -> BridgeResult<Self> {
        Ok(Self {
            tx_type,
            data: serde_json::to_vec(payload)?,
            memo: memo.into(),
            auth: Vec::new(),
        })
    }

    /// Keccak-256 of the type tag and payload; the memo is not covered
    pub fn signing_digest(&self) -> [u8; 32] {
        let mut hasher = Keccak256::new();
        hasher.update([self.tx_type as u8]);
        hasher.update(&self.data);
        hasher.finalize().into()
    }

    pub fn signed(mut self, key: &NodeKey) -> Self {
        self.auth = key.sign_digest(self.signing_digest());
        self
    }

    /// Reject unless `signer` produced `auth`
    pub fn verify_signer(&self, signer: &Address) -> BridgeResult<()> {
        verify_digest(signer, self.signing_digest(), &self.auth)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> BridgeResult<T> {
        serde_json::from_slice(&self.data).map_err(|e| {
            BridgeError::Validation(format!("malformed {:?} payload: {}", self.tx_type, e))
        })
    }

    /// Keccak-256 of the canonical encoding, `0x`-prefixed
    pub fn hash(&self) -> BridgeResult<String> {
        let encoded = serde_json::to_vec(self)?;
        let digest = Keccak256::digest(&encoded);
        Ok(format!("0x{}", hex::encode(digest)))
    }

    /// Check the payload decodes as the type it claims
    pub fn validate_payload(&self) -> BridgeResult<()> {
        match self.tx_type {
            TxType::BtcLock => self.decode::<BtcLock>().map(|_| ()),
            TxType::BtcAddSignature => self.decode::<AddSignature>().map(|_| ()),
            TxType::EthLock => self.decode::<EthLock>().map(|_| ()),
            TxType::BtcReportFinalityMint | TxType::EthReportFinalityMint => {
                self.decode::<ReportFinality>().map(|_| ())
            }
        }
    }
}

/// A validator's attestation that a tracker's external transaction is final
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportFinality {
    pub tracker_name: String,
    pub owner: Address,
    pub validator: Address,
    /// Fresh per report so repeated reports hash differently
    #[serde(with = "hex_bytes")]
    pub random_bytes: Vec<u8>,
}

impl ReportFinality {
    pub fn new(tracker_name: impl Into<String>, owner: Address, validator: Address) -> Self {
        let random_bytes = rand::random::<[u8; 4]>().to_vec();
        Self {
            tracker_name: tracker_name.into(),
            owner,
            validator,
            random_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddSignature {
    pub tracker_name: String,
    /// The multisig message being signed; stale signatures are refused
    #[serde(with = "hex_bytes")]
    pub message: Vec<u8>,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BtcLock {
    pub locker: Address,
    pub tracker_name: String,
    /// Lock transaction with the user's input signed
    #[serde(with = "hex_bytes")]
    pub btc_tx: Vec<u8>,
    pub lock_amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthLock {
    pub locker: Address,
    #[serde(with = "hex_bytes")]
    pub eth_tx: Vec<u8>,
    pub lock_amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalBroadcastRequest {
    pub request_id: Uuid,
    pub raw_tx: RawTx,
}

impl InternalBroadcastRequest {
    pub fn new(raw_tx: RawTx) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            raw_tx,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReply {
    pub tx_hash: String,
    pub ok: bool,
    pub error_msg: Option<String>,
}

impl BroadcastReply {
    pub fn accepted(tx_hash: String) -> Self {
        Self {
            tx_hash,
            ok: true,
            error_msg: None,
        }
    }

    pub fn rejected(tx_hash: String, error_msg: impl Into<String>) -> Self {
        Self {
            tx_hash,
            ok: false,
            error_msg: Some(error_msg.into()),
        }
    }
}
