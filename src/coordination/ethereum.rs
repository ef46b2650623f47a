//! Ethereum lock transition graph
//!
//! ```text
//! New --BROADCASTING--> BusyBroadcasting --FINALIZING--> BusyFinalizing
//! BusyFinalizing --FINALIZE--> Finalized --MINTING--> Released --CLEANUP--> (deleted)
//! ```

use super::engine::{Engine, Target, Transition, TransitionContext};
use super::BridgeEnv;
use crate::error::{BridgeError, BridgeResult};
use crate::jobs::Job;
use crate::state::StateManager;
use crate::tracker::{Currency, EthTracker, EthTrackerState, LedgerEffect, TrackerRecord};

use std::sync::Arc;
use tracing::debug;

pub const BROADCASTING: &str = "BROADCASTING";
pub const FINALIZING: &str = "FINALIZING";
pub const FINALIZE: &str = "FINALIZE";
pub const MINTING: &str = "MINTING";
pub const CLEANUP: &str = "CLEANUP";

pub struct EthTrackerCtx {
    pub tracker: EthTracker,
    pub env: Arc<BridgeEnv>,
    pub state: Arc<StateManager>,
    pub effects: Vec<LedgerEffect>,
}

impl EthTrackerCtx {
    pub fn new(tracker: EthTracker, env: Arc<BridgeEnv>, state: Arc<StateManager>) -> Self {
        Self {
            tracker,
            env,
            state,
            effects: Vec::new(),
        }
    }

    fn node_may_vote(&self) -> bool {
        self.env.is_validator() && self.tracker.check_if_voted(&self.env.node_address).is_none()
    }
}

impl TransitionContext for EthTrackerCtx {
    type State = EthTrackerState;

    fn current_state(&self) -> EthTrackerState {
        self.tracker.state
    }
}

fn broadcasting(ctx: &mut EthTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != EthTrackerState::New {
        return Err(BridgeError::invalid_transition(BROADCASTING, ctx.tracker.state));
    }

    if ctx.env.is_validator() {
        ctx.state.jobs.save_new_job(&Job::eth_broadcast(ctx.tracker.name()))?;
    }

    ctx.tracker.state = EthTrackerState::BusyBroadcasting;
    Ok(())
}

fn finalizing(ctx: &mut EthTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != EthTrackerState::BusyBroadcasting {
        return Err(BridgeError::invalid_transition(FINALIZING, ctx.tracker.state));
    }

    if ctx.node_may_vote() {
        let broadcast_id = ctx.tracker.job_id(EthTrackerState::BusyBroadcasting);
        let broadcast_done = match ctx.state.jobs.get_job(&broadcast_id) {
            Ok(job) => job.is_done(),
            Err(e) if e.is_not_found() => true,
            Err(e) => return Err(e),
        };
        if broadcast_done {
            ctx.state
                .jobs
                .save_new_job(&Job::eth_check_finality(ctx.tracker.name(), &ctx.env.jobs))?;
        }
    }

    if ctx.tracker.vote_count() > 0 {
        ctx.tracker.state = EthTrackerState::BusyFinalizing;
    }
    Ok(())
}

fn finalize(ctx: &mut EthTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != EthTrackerState::BusyFinalizing {
        return Err(BridgeError::invalid_transition(FINALIZE, ctx.tracker.state));
    }

    if ctx.tracker.finalized(ctx.env.quorum, ctx.env.validators.len()) {
        ctx.tracker.state = EthTrackerState::Finalized;
        return Ok(());
    }

    if ctx.node_may_vote() {
        ctx.state
            .jobs
            .save_new_job(&Job::eth_check_finality(ctx.tracker.name(), &ctx.env.jobs))?;
    }
    Ok(())
}

fn minting(ctx: &mut EthTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != EthTrackerState::Finalized {
        return Err(BridgeError::invalid_transition(MINTING, ctx.tracker.state));
    }

    if ctx.tracker.finalized(ctx.env.quorum, ctx.env.validators.len()) {
        ctx.effects.push(LedgerEffect::Mint {
            tracker: ctx.tracker.name.clone(),
            owner: ctx.tracker.process_owner.clone(),
            currency: Currency::Eth,
            amount: ctx.tracker.lock_amount,
        });
        ctx.tracker.state = EthTrackerState::Released;
    }
    Ok(())
}

fn cleanup(ctx: &mut EthTrackerCtx) -> BridgeResult<()> {
    if ctx.tracker.state != EthTrackerState::Released {
        return Err(BridgeError::invalid_transition(CLEANUP, ctx.tracker.state));
    }

    let name = ctx.tracker.name.clone();
    let removed = ctx.state.jobs.delete_jobs_for_tracker(&name)?;
    ctx.state.eth_trackers.delete(&name)?;
    debug!("Cleaned up tracker {} and {} jobs", name, removed);
    Ok(())
}

pub fn eth_lock_engine() -> BridgeResult<Engine<EthTrackerCtx>> {
    use EthTrackerState::*;

    let mut engine = Engine::new(EthTrackerState::ALL);
    let transitions: [(&'static str, EthTrackerState, Target<EthTrackerState>, fn(&mut EthTrackerCtx) -> BridgeResult<()>); 5] = [
        (BROADCASTING, New, Target::State(BusyBroadcasting), broadcasting),
        (FINALIZING, BusyBroadcasting, Target::State(BusyFinalizing), finalizing),
        (FINALIZE, BusyFinalizing, Target::State(Finalized), finalize),
        (MINTING, Finalized, Target::State(Released), minting),
        (CLEANUP, Released, Target::Deleted, cleanup),
    ];
    for (name, from, to, func) in transitions {
        engine.register(Transition { name, from, to, func })?;
    }
    Ok(engine)
}
