//! Bitcoin lock transition graph
//!
//! ```text
//! Available --(BTC_LOCK tx)--> Requested --BROADCASTING--> BusyBroadcasting
//! BusyBroadcasting --FINALIZING--> BusyFinalizing --FINALIZE--> Finalized
//! Finalized --RELEASE--> Available
//! ```
//!
//! `Available -> Requested` happens when a lock transaction is applied, not
//! through the engine. Bitcoin trackers are never deleted.

use super::engine::{Engine, Target, Transition, TransitionContext};
use super::BridgeEnv;
use crate::chain::bitcoin::signed_lock_tx;
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::Job;
use crate::state::StateManager;
use crate::tracker::{BtcTracker, BtcTrackerState, Currency, LedgerEffect, TrackerRecord};

use ethers::types::U256;
use std::sync::Arc;
use tracing::{debug, info};

pub const BROADCASTING: &str = "BROADCASTING";
pub const FINALIZING: &str = "FINALIZING";
pub const FINALIZE: &str = "FINALIZE";
pub const RELEASE: &str = "RELEASE";

pub struct BtcTrackerCtx {
    pub tracker: BtcTracker,
    pub env: Arc<BridgeEnv>,
    pub state: Arc<StateManager>,
    pub effects: Vec<LedgerEffect>,
}

impl BtcTrackerCtx {
    pub fn new(tracker: BtcTracker, env: Arc<BridgeEnv>, state: Arc<StateManager>) -> Self {
        Self {
            tracker,
            env,
            state,
            effects: Vec::new(),
        }
    }

    fn node_may_vote(&self) -> bool {
        self.env.is_validator() && !self.tracker.has_voted_finality(&self.env.node_address)
    }
}

impl TransitionContext for BtcTrackerCtx {
    type State = BtcTrackerState;

    fn current_state(&self) -> BtcTrackerState {
        self.tracker.state
    }
}

fn broadcasting(ctx: &mut BtcTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != BtcTrackerState::Requested {
        return Err(BridgeError::invalid_transition(BROADCASTING, ctx.tracker.state));
    }

    let signed = ctx
        .tracker
        .multisig
        .as_ref()
        .map(|m| m.is_valid())
        .unwrap_or(false);
    if !signed {
        return Ok(());
    }

    let redeem_script = match ctx.tracker.current_tx_id {
        Some(_) => ctx
            .state
            .lock_scripts
            .get_lock_script(&ctx.tracker.current_lock_script_address)?,
        None => Vec::new(),
    };
    let txid = signed_lock_tx(&ctx.tracker, &redeem_script)?.compute_txid();

    if ctx.env.is_validator() {
        ctx.state.jobs.save_new_job(&Job::btc_broadcast(ctx.tracker.name()))?;
    }

    debug!("Tracker {} will broadcast {}", ctx.tracker.name, txid);
    ctx.tracker.process_tx_id = Some(txid);
    ctx.tracker.state = BtcTrackerState::BusyBroadcasting;
    Ok(())
}

fn finalizing(ctx: &mut BtcTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != BtcTrackerState::BusyBroadcasting {
        return Err(BridgeError::invalid_transition(FINALIZING, ctx.tracker.state));
    }

    if ctx.node_may_vote() {
        let broadcast_id = ctx.tracker.job_id(BtcTrackerState::BusyBroadcasting);
        let broadcast_done = match ctx.state.jobs.get_job(&broadcast_id) {
            Ok(job) => job.is_done(),
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(e),
        };
        if broadcast_done {
            ctx.state
                .jobs
                .save_new_job(&Job::btc_check_finality(ctx.tracker.name(), &ctx.env.jobs))?;
        }
    }

    if ctx.tracker.vote_count() > 0 {
        ctx.tracker.state = BtcTrackerState::BusyFinalizing;
    }
    Ok(())
}

fn finalize(ctx: &mut BtcTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != BtcTrackerState::BusyFinalizing {
        return Err(BridgeError::invalid_transition(FINALIZE, ctx.tracker.state));
    }

    if ctx.tracker.finalized(ctx.env.quorum, ctx.env.validators.len()) {
        ctx.tracker.state = BtcTrackerState::Finalized;
        return Ok(());
    }

    if ctx.node_may_vote() {
        ctx.state
            .jobs
            .save_new_job(&Job::btc_check_finality(ctx.tracker.name(), &ctx.env.jobs))?;
    }
    Ok(())
}

fn release(ctx: &mut BtcTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != BtcTrackerState::Finalized {
        return Err(BridgeError::invalid_transition(RELEASE, ctx.tracker.state));
    }

    let owner = ctx.tracker.process_owner.clone().ok_or_else(|| {
        BridgeError::Validation(format!("tracker {} has no lock owner", ctx.tracker.name))
    })?;

    let removed = ctx.state.jobs.delete_jobs_for_tracker(&ctx.tracker.name)?;
    ctx.effects.push(LedgerEffect::Mint {
        tracker: ctx.tracker.name.clone(),
        owner,
        currency: Currency::Btc,
        amount: U256::from(ctx.tracker.process_lock_amount),
    });
    ctx.tracker.settle();

    info!(
        "Tracker {} released, balance {} ({} jobs removed)",
        ctx.tracker.name, ctx.tracker.current_balance, removed
    );
    Ok(())
}

pub fn btc_lock_engine() -> BridgeResult<Engine<BtcTrackerCtx>> {
    use BtcTrackerState::*;

    let mut engine = Engine::new(BtcTrackerState::ALL);
    let transitions: [(&'static str, BtcTrackerState, BtcTrackerState, fn(&mut BtcTrackerCtx) -> BridgeResult<()>); 4] = [
        (BROADCASTING, Requested, BusyBroadcasting, broadcasting),
        (FINALIZING, BusyBroadcasting, BusyFinalizing, finalizing),
        (FINALIZE, BusyFinalizing, Finalized, finalize),
        (RELEASE, Finalized, Available, release),
    ];
    for (name, from, to, func) in transitions {
        engine.register(Transition {
            name,
            from,
            to: Target::State(to),
            func,
        })?;
    }
    Ok(engine)
}
