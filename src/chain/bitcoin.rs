//! Bitcoin lock transactions and the Bitcoin Core driver
//!
//! A lock transaction spends, in this order:
//! - the tracker's current UTXO `(current_tx_id, 0)` held by the validators'
//!   multisig redeem script (absent for a tracker's first lock)
//! - the user's UTXO, signed by the user before submitting the lock
//!
//! into a single P2SH output carrying the new tracker balance. Validators
//! sign input 0; their signatures are assembled into a script sig here.

use super::BtcChainDriver;
use crate::config::BitcoinConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::tracker::BtcTracker;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::opcodes::OP_0;
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, PublicKey, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// bitcoind `RPC_VERIFY_ALREADY_IN_CHAIN`
const RPC_ALREADY_IN_CHAIN: i64 = -27;
/// bitcoind `RPC_INVALID_ADDRESS_OR_KEY`, returned for unknown transactions
const RPC_NOT_FOUND: i64 = -5;

/// `OP_m <pubkeys> OP_n OP_CHECKMULTISIG`
pub fn multisig_redeem_script(m: usize, pubkeys: &[PublicKey]) -> BridgeResult<ScriptBuf> {
    let n = pubkeys.len();
    if m == 0 || m > n || n > 16 {
        return Err(BridgeError::InvalidThreshold { m, n });
    }

    let mut builder = Builder::new().push_int(m as i64);
    for key in pubkeys {
        builder = builder.push_key(key);
    }
    Ok(builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Key under which a redeem script is stored: its hex script hash
pub fn lock_script_address(redeem_script: &Script) -> String {
    redeem_script.script_hash().to_string()
}

pub fn lock_script_pubkey(redeem_script: &Script) -> ScriptBuf {
    ScriptBuf::new_p2sh(&redeem_script.script_hash())
}

/// Build the unsigned lock transaction moving the tracker balance plus the
/// user's input into a fresh lock output.
pub fn prepare_lock(
    current: Option<(Txid, u64)>,
    user_input: OutPoint,
    user_amount: u64,
    fee: u64,
    redeem_script: &Script,
) -> BridgeResult<Transaction> {
    if user_amount <= fee {
        return Err(BridgeError::Validation(format!(
            "input amount {} does not cover fee {}",
            user_amount, fee
        )));
    }

    let mut input = Vec::with_capacity(2);
    let mut balance = 0;
    if let Some((txid, current_balance)) = current {
        input.push(unsigned_input(OutPoint { txid, vout: 0 }));
        balance = current_balance;
    }
    input.push(unsigned_input(user_input));

    let value = balance
        .checked_add(user_amount - fee)
        .filter(|value| *value <= Amount::MAX_MONEY.to_sat())
        .ok_or_else(|| {
            BridgeError::Validation(format!(
                "lock of {} sats onto a balance of {} exceeds the bitcoin supply",
                user_amount, balance
            ))
        })?;
    Ok(Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: lock_script_pubkey(redeem_script),
        }],
    })
}

/// Unsigned lock for `tracker`, paying into its process lock script
pub fn prepare_tracker_lock(
    tracker: &BtcTracker,
    redeem_script: &[u8],
    user_input: OutPoint,
    user_amount: u64,
    fee: u64,
) -> BridgeResult<Transaction> {
    let current = tracker
        .current_tx_id
        .map(|txid| (txid, tracker.current_balance));
    prepare_lock(current, user_input, user_amount, fee, Script::from_bytes(redeem_script))
}

fn unsigned_input(previous_output: OutPoint) -> TxIn {
    TxIn {
        previous_output,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}

/// Digest validators sign to release the tracker UTXO (input 0, SIGHASH_ALL)
pub fn lock_sighash(tx: &Transaction, redeem_script: &Script) -> BridgeResult<[u8; 32]> {
    let cache = SighashCache::new(tx);
    let sighash = cache
        .legacy_signature_hash(0, redeem_script, EcdsaSighashType::All.to_u32())
        .map_err(|e| BridgeError::Validation(format!("cannot compute sighash: {}", e)))?;
    Ok(sighash.to_byte_array())
}

/// `OP_0 <sig_1> .. <sig_m> <redeem_script>`; extra signatures beyond `m` are dropped
pub fn build_multisig_script_sig(
    signatures: &[Vec<u8>],
    m: usize,
    redeem_script: &Script,
) -> BridgeResult<ScriptBuf> {
    if signatures.len() < m {
        return Err(BridgeError::Validation(format!(
            "{} signatures collected, {} required",
            signatures.len(),
            m
        )));
    }

    let mut builder = Builder::new().push_opcode(OP_0);
    for sig in signatures.iter().take(m) {
        builder = builder.push_slice(push_bytes(sig.clone())?);
    }
    Ok(builder
        .push_slice(push_bytes(redeem_script.to_bytes())?)
        .into_script())
}

fn push_bytes(data: Vec<u8>) -> BridgeResult<PushBytesBuf> {
    PushBytesBuf::try_from(data)
        .map_err(|_| BridgeError::Validation("script push exceeds size limit".to_string()))
}

/// Place the validators' script sig on the tracker input
pub fn add_lock_signature(tx: &mut Transaction, script_sig: ScriptBuf) -> BridgeResult<()> {
    let input = tx
        .input
        .first_mut()
        .ok_or_else(|| BridgeError::Validation("lock transaction has no inputs".to_string()))?;
    input.script_sig = script_sig;
    Ok(())
}

pub fn decode_tx(bytes: &[u8]) -> BridgeResult<Transaction> {
    encode::deserialize(bytes)
        .map_err(|e| BridgeError::Validation(format!("malformed bitcoin transaction: {}", e)))
}

pub fn encode_tx(tx: &Transaction) -> Vec<u8> {
    encode::serialize(tx)
}

/// The tracker's pending lock with the validators' signatures in place.
///
/// `redeem_script` is the script guarding the tracker's current UTXO. A
/// tracker without a current UTXO has nothing for validators to unlock, so
/// its transaction is returned as the user signed it.
pub fn signed_lock_tx(tracker: &BtcTracker, redeem_script: &[u8]) -> BridgeResult<Transaction> {
    let mut tx = decode_tx(&tracker.process_unsigned_tx)?;
    if tracker.current_tx_id.is_none() {
        return Ok(tx);
    }

    let multisig = tracker.multisig.as_ref().ok_or_else(|| {
        BridgeError::Validation(format!("tracker {} has no multisig", tracker.name))
    })?;
    if !multisig.is_valid() {
        return Err(BridgeError::Validation(format!(
            "tracker {} has {} of {} required signatures",
            tracker.name,
            multisig.signature_count(),
            multisig.threshold()
        )));
    }

    let script_sig = build_multisig_script_sig(
        &multisig.signatures_in_order(),
        multisig.threshold(),
        Script::from_bytes(redeem_script),
    )?;
    add_lock_signature(&mut tx, script_sig)?;
    Ok(tx)
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    #[serde(default)]
    confirmations: u64,
}

/// Bitcoin Core JSON-RPC driver
pub struct BitcoinRpcDriver {
    client: reqwest::Client,
    url: String,
    user: String,
    password: String,
    min_confirmations: u64,
}

impl BitcoinRpcDriver {
    pub fn new(config: &BitcoinConfig) -> BridgeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| connection_error(e.to_string()))?;

        Ok(Self {
            client,
            url: config.rpc_url.clone(),
            user: config.rpc_user.clone(),
            password: config.rpc_password.clone(),
            min_confirmations: config.min_confirmations,
        })
    }

    /// Call an RPC method; node-level errors are returned in the inner result
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> BridgeResult<Result<T, RpcError>> {
        let payload = json!({
            "jsonrpc": "1.0",
            "id": "bridge",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.password))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BridgeError::Timeout {
                        operation: format!("bitcoin {}", method),
                    }
                } else {
                    connection_error(e.to_string())
                }
            })?;

        // bitcoind reports RPC errors with non-2xx codes and a JSON body
        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| connection_error(format!("invalid {} response: {}", method, e)))?;

        if let Some(error) = body.error {
            return Ok(Err(error));
        }
        let result = body.result.unwrap_or(Value::Null);
        Ok(Ok(serde_json::from_value(result)?))
    }
}

fn connection_error(message: String) -> BridgeError {
    BridgeError::ChainConnection {
        chain: "bitcoin".to_string(),
        message,
    }
}

fn already_known(error: &RpcError) -> bool {
    error.code == RPC_ALREADY_IN_CHAIN
        || error.message.contains("already in")
        || error.message.contains("txn-already-known")
}

#[async_trait]
impl BtcChainDriver for BitcoinRpcDriver {
    async fn broadcast_tx(&self, tx: &Transaction) -> BridgeResult<Txid> {
        let txid = tx.compute_txid();
        let raw = encode::serialize_hex(tx);

        match self.call::<Txid>("sendrawtransaction", json!([raw])).await? {
            Ok(sent) => {
                info!("Broadcast bitcoin transaction {}", sent);
                Ok(sent)
            }
            Err(e) if already_known(&e) => {
                debug!("Bitcoin transaction {} already known: {}", txid, e.message);
                Ok(txid)
            }
            Err(e) => {
                warn!("Bitcoin node rejected {}: {} ({})", txid, e.message, e.code);
                Err(BridgeError::Broadcast {
                    chain: "bitcoin".to_string(),
                    message: format!("{} ({})", e.message, e.code),
                })
            }
        }
    }

    async fn check_finality(&self, txid: &Txid) -> BridgeResult<bool> {
        let params = json!([txid.to_string(), true]);
        match self.call::<VerboseTransaction>("getrawtransaction", params).await? {
            Ok(tx) => {
                debug!(
                    "Bitcoin transaction {} has {} / {} confirmations",
                    txid, tx.confirmations, self.min_confirmations
                );
                Ok(tx.confirmations >= self.min_confirmations)
            }
            Err(e) if e.code == RPC_NOT_FOUND => Ok(false),
            Err(e) => Err(connection_error(format!("{} ({})", e.message, e.code))),
        }
    }

    async fn health_check(&self) -> bool {
        match self.call::<u64>("getblockcount", json!([])).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("Bitcoin health check failed: {}", e.message);
                false
            }
            Err(e) => {
                warn!("Bitcoin health check failed: {}", e);
                false
            }
        }
    }
}
