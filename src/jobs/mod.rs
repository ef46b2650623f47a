//! Asynchronous, retryable work driven by tracker state
//!
//! Transition functions enqueue jobs on validator nodes; the scheduler runs
//! them against external chains. A job never changes a tracker directly: it
//! reports back through an internal transaction.
//!
//! - `Job`: one unit of work, identified by `"{tracker}#{state}"`
//! - `JobStore`: node-local persistence, at most one job per identifier
//! - `JobScheduler`: polling loop with bounded concurrency

mod bitcoin;
mod ethereum;
mod scheduler;
mod store;

pub use scheduler::JobScheduler;
pub use store::JobStore;

use crate::chain::{BtcChainDriver, EthChainDriver};
use crate::config::JobsConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::keys::{Address, NodeKey};
use crate::metrics;
use crate::state::StateManager;
use crate::tracker::{job_id, BtcTrackerState, EthTrackerState};
use crate::tx::{InternalBroadcastRequest, InternalBroadcaster, RawTx, ReportFinality, TxType};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    New,
    InProgress,
    Completed,
    /// Gave up after the retry ceiling or a validation failure
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Broadcast the signed lock, then report its finality
    BtcBroadcast { broadcast_successful: bool },
    BtcCheckFinality,
    EthBroadcast,
    EthCheckFinality,
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::BtcBroadcast { .. } => "btc_broadcast",
            JobKind::BtcCheckFinality => "btc_check_finality",
            JobKind::EthBroadcast => "eth_broadcast",
            JobKind::EthCheckFinality => "eth_check_finality",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub tracker_name: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub retry_count: u8,
    /// Unix seconds before which the job stays idle
    pub check_after: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    fn new(tracker_name: &str, job_id: String, kind: JobKind, check_after: i64) -> Self {
        let now = Utc::now().timestamp();
        Self {
            job_id,
            tracker_name: tracker_name.to_string(),
            kind,
            status: JobStatus::New,
            retry_count: 0,
            check_after,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn btc_broadcast(tracker_name: &str) -> Self {
        Self::new(
            tracker_name,
            job_id(tracker_name, BtcTrackerState::BusyBroadcasting),
            JobKind::BtcBroadcast {
                broadcast_successful: false,
            },
            0,
        )
    }

    pub fn btc_check_finality(tracker_name: &str, config: &JobsConfig) -> Self {
        Self::new(
            tracker_name,
            job_id(tracker_name, BtcTrackerState::BusyFinalizing),
            JobKind::BtcCheckFinality,
            Utc::now().timestamp() + config.finality_initial_delay_secs,
        )
    }

    pub fn eth_broadcast(tracker_name: &str) -> Self {
        Self::new(
            tracker_name,
            job_id(tracker_name, EthTrackerState::BusyBroadcasting),
            JobKind::EthBroadcast,
            0,
        )
    }

    pub fn eth_check_finality(tracker_name: &str, config: &JobsConfig) -> Self {
        Self::new(
            tracker_name,
            job_id(tracker_name, EthTrackerState::BusyFinalizing),
            JobKind::EthCheckFinality,
            Utc::now().timestamp() + config.finality_initial_delay_secs,
        )
    }

    /// Terminal status reached
    pub fn is_done(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Abandoned)
    }

    pub fn exhausted(&self, max_retries: u8) -> bool {
        self.retry_count > max_retries
    }

    /// Attempt one step. Failures are counted, never propagated.
    pub async fn do_my_job(&mut self, ctx: &JobsContext) {
        if self.is_done() {
            return;
        }

        let now = Utc::now().timestamp();
        if now < self.check_after {
            debug!("Job {} idle for {}s", self.job_id, self.check_after - now);
            return;
        }

        self.status = JobStatus::InProgress;
        self.updated_at = now;

        let result = match self.kind {
            JobKind::BtcBroadcast { .. } => bitcoin::broadcast(self, ctx).await,
            JobKind::BtcCheckFinality => bitcoin::check_finality(self, ctx).await,
            JobKind::EthBroadcast => ethereum::broadcast(self, ctx).await,
            JobKind::EthCheckFinality => ethereum::check_finality(self, ctx).await,
        };

        if let Err(e) = result {
            if e.is_validation() {
                warn!("Abandoning job {}: {}", self.job_id, e);
                self.status = JobStatus::Abandoned;
            } else {
                self.retry_count = self.retry_count.saturating_add(1);
                warn!(
                    "Job {} failed (attempt {}): {}",
                    self.job_id, self.retry_count, e
                );
                metrics::record_job_retry(self.kind.name());
            }
        }
    }

    /// Whether nothing more is needed from this node
    pub fn is_my_job_done(&self, ctx: &JobsContext) -> bool {
        if self.is_done() || self.exhausted(ctx.config.max_retries) {
            return true;
        }

        match self.tracker_progressed(ctx) {
            Ok(done) => done,
            Err(e) if e.is_not_found() => true,
            Err(e) => {
                debug!("Cannot inspect tracker of job {}: {}", self.job_id, e);
                false
            }
        }
    }

    pub fn is_sufficient(&self, ctx: &JobsContext) -> bool {
        self.is_my_job_done(ctx)
    }

    /// Mark the job terminal; exhausted jobs are recorded as abandoned
    pub fn do_finalize(&mut self, max_retries: u8) {
        if !self.is_done() {
            self.status = if self.exhausted(max_retries) {
                warn!(
                    "Job {} abandoned after {} retries",
                    self.job_id, self.retry_count
                );
                JobStatus::Abandoned
            } else {
                info!("Job {} completed", self.job_id);
                JobStatus::Completed
            };
        }
        self.updated_at = Utc::now().timestamp();
        let outcome = match self.status {
            JobStatus::Abandoned => "abandoned",
            _ => "completed",
        };
        metrics::record_job_finished(self.kind.name(), outcome);
    }

    fn tracker_progressed(&self, ctx: &JobsContext) -> BridgeResult<bool> {
        let me = ctx.node_key.address();
        match self.kind {
            JobKind::BtcBroadcast { .. } | JobKind::BtcCheckFinality => {
                let tracker = ctx.state.btc_trackers.get(&self.tracker_name)?;
                let voting = matches!(
                    tracker.state,
                    BtcTrackerState::BusyBroadcasting | BtcTrackerState::BusyFinalizing
                );
                Ok(!voting || tracker.has_voted_finality(me))
            }
            JobKind::EthBroadcast => {
                let tracker = ctx.state.eth_trackers.get(&self.tracker_name)?;
                Ok(tracker.state != EthTrackerState::BusyBroadcasting)
            }
            JobKind::EthCheckFinality => {
                let tracker = ctx.state.eth_trackers.get(&self.tracker_name)?;
                let voting = matches!(
                    tracker.state,
                    EthTrackerState::BusyBroadcasting | EthTrackerState::BusyFinalizing
                );
                Ok(!voting || tracker.check_if_voted(me).is_some())
            }
        }
    }

    fn recheck_later(&mut self, ctx: &JobsContext) {
        self.check_after = Utc::now().timestamp() + ctx.config.finality_recheck_secs;
    }
}

/// Everything a job may touch
pub struct JobsContext {
    pub state: Arc<StateManager>,
    pub btc: Option<Arc<dyn BtcChainDriver>>,
    pub eth: Option<Arc<dyn EthChainDriver>>,
    pub broadcaster: Arc<dyn InternalBroadcaster>,
    /// Signs the votes this validator reports
    pub node_key: NodeKey,
    pub config: JobsConfig,
}

impl JobsContext {
    fn btc(&self) -> BridgeResult<&dyn BtcChainDriver> {
        self.btc
            .as_deref()
            .ok_or_else(|| BridgeError::Config("bitcoin driver is not configured".to_string()))
    }

    fn eth(&self) -> BridgeResult<&dyn EthChainDriver> {
        self.eth
            .as_deref()
            .ok_or_else(|| BridgeError::Config("ethereum driver is not configured".to_string()))
    }

    /// Submit this validator's finality vote for the job's tracker
    async fn report_finality(&self, tx_type: TxType, job: &Job, owner: Address) -> BridgeResult<()> {
        let report = ReportFinality::new(&job.tracker_name, owner, self.node_key.address().clone());
        let raw_tx = RawTx::new(tx_type, &report, job.job_id.clone())?.signed(&self.node_key);

        let reply = self
            .broadcaster
            .internal_broadcast(InternalBroadcastRequest::new(raw_tx))
            .await?;
        if !reply.ok {
            return Err(BridgeError::InternalBroadcast(
                reply.error_msg.unwrap_or_else(|| "rejected".to_string()),
            ));
        }

        info!("Reported finality of {} ({})", job.tracker_name, reply.tx_hash);
        Ok(())
    }
}
