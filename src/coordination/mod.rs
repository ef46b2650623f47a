//! Per-block orchestration of bridge trackers
//!
//! Every block the coordinator:
//! 1. Applies the block's internal transactions (locks, signatures, votes)
//! 2. Runs the chain's transition engine over every tracker
//! 3. Persists advanced trackers and collects ledger effects
//!
//! Transition functions are deterministic over consensus state; anything
//! node-specific (jobs) lives in the local store.

pub mod bitcoin;
pub mod coordinator;
pub mod engine;
pub mod ethereum;

pub use coordinator::{BlockSummary, Coordinator};
pub use engine::{Engine, Outcome, Target, Transition, TransitionContext};

use crate::config::JobsConfig;
use crate::keys::{Address, ValidatorSet};
use crate::tracker::Quorum;

use serde::Serialize;

/// Node-level facts transition functions consult
#[derive(Debug, Clone)]
pub struct BridgeEnv {
    pub node_address: Address,
    pub validators: ValidatorSet,
    pub quorum: Quorum,
    pub jobs: JobsConfig,
}

impl BridgeEnv {
    /// Whether this node is in the validator set and should run jobs
    pub fn is_validator(&self) -> bool {
        !self.node_address.is_empty() && self.validators.is_validator(&self.node_address)
    }
}

/// Serializable view of an engine's state graph
#[derive(Debug, Clone, Serialize)]
pub struct EngineInfo {
    pub chain: &'static str,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionInfo {
    pub name: &'static str,
    pub from: String,
    pub to: String,
}

impl EngineInfo {
    pub fn describe<C: TransitionContext>(chain: &'static str, engine: &Engine<C>) -> Self {
        let state_name = |s: &C::State| format!("{:?}", s);
        Self {
            chain,
            states: engine.states().iter().map(state_name).collect(),
            transitions: engine
                .transitions()
                .iter()
                .map(|t| TransitionInfo {
                    name: t.name,
                    from: state_name(&t.from),
                    to: match &t.to {
                        Target::State(s) => state_name(s),
                        Target::Deleted => "Deleted".to_string(),
                    },
                })
                .collect(),
        }
    }
}
