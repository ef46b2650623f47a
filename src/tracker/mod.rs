//! Durable per-transfer progress records
//!
//! A tracker is the consensus-side record of one cross-chain transfer: its
//! lifecycle state, the validators that attested finality and, for Bitcoin,
//! the pending multisig spend. Trackers are only mutated by transition
//! functions and by applying internal transactions (votes, signatures).

pub mod bitcoin;
pub mod ethereum;

pub use self::bitcoin::{BtcTracker, BtcTrackerState, LockScriptStore};
pub use self::ethereum::{EthTracker, EthTrackerState};

use crate::error::{BridgeError, BridgeResult};
use crate::keys::Address;
use crate::state::{KvStore, PrefixedStore};

use ethers::types::U256;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// How many finality votes are needed before a transfer counts as final
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quorum {
    /// A single attestation is enough
    Any,
    /// More than half of the validator set
    Majority,
    /// At least two thirds of the validator set
    #[default]
    TwoThirds,
}

impl Quorum {
    /// Votes required for a validator set of `validators` members
    pub fn required(&self, validators: usize) -> usize {
        let required = match self {
            Quorum::Any => 1,
            Quorum::Majority => validators / 2 + 1,
            Quorum::TwoThirds => (validators * 2).div_ceil(3),
        };
        required.max(1)
    }
}

/// Validators that attested finality of the current external transaction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FinalityVotes(Vec<Address>);

impl FinalityVotes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Position of the validator's vote, if any
    pub fn check_if_voted(&self, address: &Address) -> Option<usize> {
        self.0.iter().position(|v| v == address)
    }

    pub fn has_voted(&self, address: &Address) -> bool {
        self.check_if_voted(address).is_some()
    }

    /// Record a vote; returns false if the validator had already voted
    pub fn add_vote(&mut self, address: Address) -> bool {
        if self.has_voted(&address) {
            return false;
        }
        self.0.push(address);
        true
    }

    pub fn count(&self) -> usize {
        self.0.len()
    }

    pub fn reached(&self, quorum: Quorum, validators: usize) -> bool {
        self.count() >= quorum.required(validators)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.0.iter()
    }
}

/// Internal ledger mutation a finished transfer asks the host to apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEffect {
    Mint {
        tracker: String,
        owner: Address,
        currency: Currency,
        amount: U256,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    Btc,
    Eth,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Btc => write!(f, "BTC"),
            Currency::Eth => write!(f, "ETH"),
        }
    }
}

/// Common surface of chain-specific trackers
pub trait TrackerRecord: Serialize + DeserializeOwned + Clone + Send + Sync {
    type State: Copy + Eq + fmt::Debug;

    fn name(&self) -> &str;

    fn state(&self) -> Self::State;

    /// Job identifier for the work scheduled while in `state`
    fn job_id(&self, state: Self::State) -> String {
        job_id(self.name(), state)
    }
}

/// Stable job identifier derived from tracker name and state
pub fn job_id(tracker_name: &str, state: impl fmt::Debug) -> String {
    format!("{}#{:?}", tracker_name, state)
}

/// Typed tracker storage over a prefixed key-value store
pub struct TrackerStore<T> {
    store: PrefixedStore,
    _marker: PhantomData<T>,
}

impl<T: TrackerRecord> TrackerStore<T> {
    pub fn new(backend: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            store: PrefixedStore::new(backend, prefix),
            _marker: PhantomData,
        }
    }

    pub fn get(&self, name: &str) -> BridgeResult<T> {
        let bytes = self
            .store
            .get(name)?
            .ok_or_else(|| BridgeError::TrackerNotFound {
                name: name.to_string(),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Insert a new tracker; names are immutable so duplicates are rejected
    pub fn create(&self, tracker: &T) -> BridgeResult<()> {
        if self.store.exists(tracker.name())? {
            return Err(BridgeError::TrackerExists {
                name: tracker.name().to_string(),
            });
        }
        self.set(tracker)
    }

    pub fn set(&self, tracker: &T) -> BridgeResult<()> {
        let bytes = serde_json::to_vec(tracker)?;
        self.store.set(tracker.name(), &bytes)
    }

    pub fn delete(&self, name: &str) -> BridgeResult<bool> {
        self.store.delete(name)
    }

    pub fn exists(&self, name: &str) -> BridgeResult<bool> {
        self.store.exists(name)
    }

    /// All trackers, ordered by name
    pub fn list(&self) -> BridgeResult<Vec<T>> {
        self.store
            .values("")?
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).map_err(BridgeError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    fn addr(b: u8) -> Address {
        Address::new(vec![b; 20])
    }

    #[test]
    fn test_quorum_required() {
        assert_eq!(Quorum::Any.required(10), 1);
        assert_eq!(Quorum::Any.required(0), 1);
        assert_eq!(Quorum::Majority.required(4), 3);
        assert_eq!(Quorum::Majority.required(5), 3);
        assert_eq!(Quorum::TwoThirds.required(4), 3);
        assert_eq!(Quorum::TwoThirds.required(3), 2);
        assert_eq!(Quorum::TwoThirds.required(6), 4);
        assert_eq!(Quorum::TwoThirds.required(7), 5);
        assert_eq!(Quorum::TwoThirds.required(1), 1);
    }

    #[test]
    fn test_votes_are_idempotent() {
        let mut votes = FinalityVotes::new();
        assert!(votes.add_vote(addr(1)));
        assert!(!votes.add_vote(addr(1)));
        assert!(votes.add_vote(addr(2)));

        assert_eq!(votes.count(), 2);
        assert_eq!(votes.check_if_voted(&addr(2)), Some(1));
        assert!(!votes.has_voted(&addr(3)));

        assert!(votes.reached(Quorum::Any, 4));
        assert!(!votes.reached(Quorum::TwoThirds, 4));
        votes.add_vote(addr(3));
        assert!(votes.reached(Quorum::TwoThirds, 4));
    }

    #[test]
    fn test_tracker_store_create_rejects_duplicates() {
        let store: TrackerStore<EthTracker> =
            TrackerStore::new(Arc::new(MemoryStore::new()), "tracker/eth/");
        let tracker = EthTracker::new(addr(9), vec![0xf8, 0x01], U256::from(5u64));

        store.create(&tracker).unwrap();
        assert!(matches!(
            store.create(&tracker),
            Err(BridgeError::TrackerExists { .. })
        ));

        let loaded = store.get(tracker.name()).unwrap();
        assert_eq!(loaded, tracker);
        assert_eq!(store.list().unwrap().len(), 1);

        assert!(store.delete(tracker.name()).unwrap());
        assert!(matches!(
            store.get(tracker.name()),
            Err(BridgeError::TrackerNotFound { .. })
        ));
    }

    #[test]
    fn test_job_id_is_derived_from_name_and_state() {
        assert_eq!(
            job_id("tracker_1", BtcTrackerState::BusyBroadcasting),
            "tracker_1#BusyBroadcasting"
        );
    }
}
