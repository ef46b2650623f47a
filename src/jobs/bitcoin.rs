//! Bitcoin lock jobs

use super::{Job, JobKind, JobStatus, JobsContext};
use crate::chain::bitcoin::signed_lock_tx;
use crate::config::BroadcastFailurePolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::tracker::{BtcTracker, BtcTrackerState};
use crate::tx::TxType;

use chrono::Utc;
use tracing::{debug, info, warn};

/// Assemble and broadcast the multisig spend, then report its finality
pub(super) async fn broadcast(job: &mut Job, ctx: &JobsContext) -> BridgeResult<()> {
    let driver = ctx.btc()?;
    let tracker = ctx.state.btc_trackers.get(&job.tracker_name)?;

    if matches!(job.kind, JobKind::BtcBroadcast { broadcast_successful: true }) {
        return report_when_final(job, ctx, &tracker).await;
    }

    let redeem_script = match tracker.current_tx_id {
        Some(_) => ctx
            .state
            .lock_scripts
            .get_lock_script(&tracker.current_lock_script_address)?,
        None => Vec::new(),
    };
    let tx = signed_lock_tx(&tracker, &redeem_script)?;

    match driver.broadcast_tx(&tx).await {
        Ok(txid) => {
            info!("Broadcast bitcoin lock {} for {}", txid, tracker.name);
        }
        Err(e)
            if ctx.config.broadcast_failure == BroadcastFailurePolicy::Proceed
                && !e.is_validation() =>
        {
            warn!("Broadcast of {} failed, going forward: {}", tracker.name, e);
            job.retry_count = job.retry_count.saturating_add(1);
        }
        Err(e) => return Err(e),
    }

    job.kind = JobKind::BtcBroadcast {
        broadcast_successful: true,
    };
    job.check_after = Utc::now().timestamp() + ctx.config.finality_initial_delay_secs;
    Ok(())
}

/// Finality check for validators whose broadcast job did not vote
pub(super) async fn check_finality(job: &mut Job, ctx: &JobsContext) -> BridgeResult<()> {
    let tracker = ctx.state.btc_trackers.get(&job.tracker_name)?;

    let voting = matches!(
        tracker.state,
        BtcTrackerState::BusyBroadcasting | BtcTrackerState::BusyFinalizing
    );
    if !voting || tracker.has_voted_finality(ctx.node_key.address()) {
        job.status = JobStatus::Completed;
        return Ok(());
    }

    report_when_final(job, ctx, &tracker).await
}

async fn report_when_final(job: &mut Job, ctx: &JobsContext, tracker: &BtcTracker) -> BridgeResult<()> {
    let driver = ctx.btc()?;
    let txid = tracker.process_tx_id.ok_or_else(|| {
        BridgeError::Validation(format!("tracker {} has no lock transaction", tracker.name))
    })?;
    let owner = tracker.process_owner.clone().ok_or_else(|| {
        BridgeError::Validation(format!("tracker {} has no lock owner", tracker.name))
    })?;

    if !driver.check_finality(&txid).await? {
        debug!("Bitcoin lock {} not final yet", txid);
        job.recheck_later(ctx);
        return Ok(());
    }

    ctx.report_finality(TxType::BtcReportFinalityMint, job, owner)
        .await?;
    job.recheck_later(ctx);
    Ok(())
}
