//! Ledger side of bridge transactions

use super::{AddSignature, BtcLock, EthLock, RawTx, ReportFinality, TxType};
use crate::chain::bitcoin::{decode_tx, lock_script_pubkey, lock_sighash};
use crate::error::{BridgeError, BridgeResult};
use crate::keys::{Address, MultiSig, ValidatorSet};
use crate::state::StateManager;
use crate::tracker::{BtcTrackerState, EthTracker, EthTrackerState, Quorum};

use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, Script};
use tracing::{debug, info};

/// What a transaction may read and write while its block runs
pub struct TxContext<'a> {
    pub state: &'a StateManager,
    pub validators: &'a ValidatorSet,
    /// Also the multisig threshold for Bitcoin spends
    pub quorum: Quorum,
}

/// Apply one transaction. Returns false when it was a harmless duplicate
/// (repeated vote, signature or lock observation).
pub fn apply_tx(ctx: &TxContext<'_>, raw_tx: &RawTx) -> BridgeResult<bool> {
    match raw_tx.tx_type {
        TxType::BtcLock => apply_btc_lock(ctx, raw_tx.decode()?),
        TxType::BtcAddSignature => apply_add_signature(ctx, raw_tx, raw_tx.decode()?),
        TxType::BtcReportFinalityMint => apply_btc_report(ctx, raw_tx, raw_tx.decode()?),
        TxType::EthLock => apply_eth_lock(ctx, raw_tx.decode()?),
        TxType::EthReportFinalityMint => apply_eth_report(ctx, raw_tx, raw_tx.decode()?),
    }
}

/// Validator-only transactions must be signed by the validator they name
fn authorize(ctx: &TxContext<'_>, raw_tx: &RawTx, validator: &Address) -> BridgeResult<()> {
    if !ctx.validators.is_validator(validator) {
        return Err(BridgeError::NotAValidator {
            address: validator.to_string(),
        });
    }
    raw_tx.verify_signer(validator)
}

fn apply_btc_lock(ctx: &TxContext<'_>, lock: BtcLock) -> BridgeResult<bool> {
    let mut tracker = ctx.state.btc_trackers.get(&lock.tracker_name)?;
    if tracker.is_busy() {
        return Err(BridgeError::invalid_transition("LOCK", tracker.state));
    }

    let tx = decode_tx(&lock.btc_tx)?;

    // the tracker UTXO, when present, must be spent by input 0
    match tracker.current_tx_id {
        None if tx.input.len() == 1 => {}
        Some(txid) if tx.input.len() == 2 && tx.input[0].previous_output == (OutPoint { txid, vout: 0 }) => {}
        _ => {
            return Err(BridgeError::Validation(format!(
                "lock transaction does not spend tracker {}",
                tracker.name
            )))
        }
    }

    let output = tx
        .output
        .first()
        .ok_or_else(|| BridgeError::Validation("lock transaction has no outputs".to_string()))?;
    let process_script = ctx
        .state
        .lock_scripts
        .get_lock_script(&tracker.process_lock_script_address)?;
    if output.script_pubkey != lock_script_pubkey(Script::from_bytes(&process_script)) {
        return Err(BridgeError::Validation(
            "lock output does not pay the validators' lock script".to_string(),
        ));
    }

    let lock_amount = output
        .value
        .to_sat()
        .checked_sub(tracker.current_balance)
        .unwrap_or_default();
    if lock_amount != lock.lock_amount {
        return Err(BridgeError::Validation(format!(
            "lock amount {} does not match transaction ({})",
            lock.lock_amount, lock_amount
        )));
    }

    let message = match tracker.current_tx_id {
        Some(_) => {
            let current_script = ctx
                .state
                .lock_scripts
                .get_lock_script(&tracker.current_lock_script_address)?;
            lock_sighash(&tx, Script::from_bytes(&current_script))?.to_vec()
        }
        None => tx.compute_txid().to_byte_array().to_vec(),
    };

    let signers: Vec<_> = ctx.validators.iter().cloned().collect();
    let m = ctx.quorum.required(signers.len()).min(signers.len());
    let multisig = MultiSig::new(message, m, signers)?;

    tracker.begin_lock(lock.locker, lock.btc_tx, lock_amount, multisig)?;
    ctx.state.btc_trackers.set(&tracker)?;
    info!("Bitcoin lock of {} sats requested on {}", lock_amount, tracker.name);
    Ok(true)
}

fn apply_add_signature(ctx: &TxContext<'_>, raw_tx: &RawTx, add: AddSignature) -> BridgeResult<bool> {
    authorize(ctx, raw_tx, &add.signature.address)?;

    let mut tracker = ctx.state.btc_trackers.get(&add.tracker_name)?;
    if let Some(multisig) = &tracker.multisig {
        if multisig.message() != add.message.as_slice() {
            return Err(BridgeError::Validation(format!(
                "signature is not for the pending spend of {}",
                tracker.name
            )));
        }
    }
    let before = tracker.multisig.as_ref().map(|ms| ms.signature_count());
    tracker.add_signature(add.signature)?;
    let after = tracker.multisig.as_ref().map(|ms| ms.signature_count());

    if before == after {
        debug!("Duplicate signature for {}", tracker.name);
        return Ok(false);
    }
    ctx.state.btc_trackers.set(&tracker)?;
    Ok(true)
}

fn apply_btc_report(ctx: &TxContext<'_>, raw_tx: &RawTx, report: ReportFinality) -> BridgeResult<bool> {
    authorize(ctx, raw_tx, &report.validator)?;

    let mut tracker = ctx.state.btc_trackers.get(&report.tracker_name)?;
    if !matches!(
        tracker.state,
        BtcTrackerState::BusyBroadcasting | BtcTrackerState::BusyFinalizing
    ) {
        return Err(BridgeError::invalid_transition("REPORT_FINALITY", tracker.state));
    }
    if tracker.process_owner.as_ref() != Some(&report.owner) {
        return Err(BridgeError::Validation(format!(
            "finality report owner {} does not match tracker {}",
            report.owner, tracker.name
        )));
    }

    if !tracker.add_finality_vote(report.validator.clone()) {
        debug!("{} already voted on {}", report.validator, tracker.name);
        return Ok(false);
    }
    ctx.state.btc_trackers.set(&tracker)?;
    info!(
        "Finality vote from {} on {} ({} votes)",
        report.validator,
        tracker.name,
        tracker.vote_count()
    );
    Ok(true)
}

fn apply_eth_lock(ctx: &TxContext<'_>, lock: EthLock) -> BridgeResult<bool> {
    if lock.eth_tx.is_empty() || lock.lock_amount.is_zero() {
        return Err(BridgeError::Validation("empty ethereum lock".to_string()));
    }

    let tracker = EthTracker::new(lock.locker, lock.eth_tx, lock.lock_amount);
    if ctx.state.eth_trackers.exists(&tracker.name)? {
        debug!("Ethereum lock {} already tracked", tracker.name);
        return Ok(false);
    }
    ctx.state.eth_trackers.create(&tracker)?;
    info!("Tracking ethereum lock {} of {} wei", tracker.name, tracker.lock_amount);
    Ok(true)
}

fn apply_eth_report(ctx: &TxContext<'_>, raw_tx: &RawTx, report: ReportFinality) -> BridgeResult<bool> {
    authorize(ctx, raw_tx, &report.validator)?;

    let mut tracker = ctx.state.eth_trackers.get(&report.tracker_name)?;
    if !matches!(
        tracker.state,
        EthTrackerState::BusyBroadcasting | EthTrackerState::BusyFinalizing
    ) {
        return Err(BridgeError::invalid_transition("REPORT_FINALITY", tracker.state));
    }
    if tracker.process_owner != report.owner {
        return Err(BridgeError::Validation(format!(
            "finality report owner {} does not match tracker {}",
            report.owner, tracker.name
        )));
    }

    if !tracker.add_finality_vote(report.validator.clone()) {
        debug!("{} already voted on {}", report.validator, tracker.name);
        return Ok(false);
    }
    ctx.state.eth_trackers.set(&tracker)?;
    info!(
        "Finality vote from {} on {} ({} votes)",
        report.validator,
        tracker.name,
        tracker.vote_count()
    );
    Ok(true)
}
