//! Ethereum lock jobs

use super::{Job, JobStatus, JobsContext};
use crate::chain::EthFinality;
use crate::config::BroadcastFailurePolicy;
use crate::error::{BridgeError, BridgeResult};
use crate::tx::TxType;

use tracing::{debug, info, warn};

/// Relay the user's signed lock transaction to Ethereum
pub(super) async fn broadcast(job: &mut Job, ctx: &JobsContext) -> BridgeResult<()> {
    let driver = ctx.eth()?;
    let tracker = ctx.state.eth_trackers.get(&job.tracker_name)?;

    match driver.broadcast_raw(&tracker.signed_eth_tx).await {
        Ok(hash) => {
            info!("Broadcast ethereum lock {:?}", hash);
        }
        Err(e) if ctx.config.broadcast_failure == BroadcastFailurePolicy::Proceed => {
            warn!("Broadcast of {} failed, going forward: {}", tracker.name, e);
            job.retry_count = job.retry_count.saturating_add(1);
        }
        Err(e) => return Err(e),
    }

    job.status = JobStatus::Completed;
    Ok(())
}

pub(super) async fn check_finality(job: &mut Job, ctx: &JobsContext) -> BridgeResult<()> {
    let driver = ctx.eth()?;
    let tracker = ctx.state.eth_trackers.get(&job.tracker_name)?;

    match driver.check_finality(tracker.tx_hash).await? {
        EthFinality::Pending => {
            debug!("Ethereum lock {} not final yet", tracker.name);
            job.recheck_later(ctx);
            Ok(())
        }
        EthFinality::Failed => Err(BridgeError::Validation(format!(
            "ethereum lock {} reverted",
            tracker.name
        ))),
        EthFinality::Confirmed => {
            ctx.report_finality(TxType::EthReportFinalityMint, job, tracker.process_owner)
                .await?;
            // done once the vote lands in a block
            job.recheck_later(ctx);
            Ok(())
        }
    }
}
