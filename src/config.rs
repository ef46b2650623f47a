//! Configuration management for the bridge orchestrator
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::keys::{check_public_key, Address, NodeKey, ValidatorSet};
use crate::tracker::Quorum;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    #[serde(default)]
    pub finality: FinalityConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub bitcoin: BitcoinConfig,
    #[serde(default)]
    pub ethereum: EthereumConfig,
    #[serde(default)]
    pub internal: InternalConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Hex secp256k1 secret key; absent on non-validator nodes.
    /// The node's address is the matching compressed public key.
    pub validator_key: Option<String>,
    /// Compressed public keys of the validator set
    pub validators: Vec<String>,
    /// Directory of the sled database; in-memory storage when absent
    pub data_dir: Option<String>,
    pub block_interval_ms: u64,
    /// Drive the engines from a local block timer instead of a host
    #[serde(default = "default_true")]
    pub standalone: bool,
    /// Transactions held for the next block before submissions are refused
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FinalityConfig {
    #[serde(default)]
    pub quorum: Quorum,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent_jobs: usize,
    /// Jobs past this many retries are abandoned
    pub max_retries: u8,
    pub finality_initial_delay_secs: i64,
    pub finality_recheck_secs: i64,
    pub broadcast_failure: BroadcastFailurePolicy,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_concurrent_jobs: 16,
            max_retries: 20,
            finality_initial_delay_secs: 5 * 60,
            finality_recheck_secs: 2 * 60,
            broadcast_failure: BroadcastFailurePolicy::Retry,
        }
    }
}

/// What a broadcast job does when the external node rejects its transaction
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BroadcastFailurePolicy {
    /// Count a retry and broadcast again on the next poll
    #[default]
    Retry,
    /// Count a retry but move on to finality checking anyway
    Proceed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BitcoinConfig {
    pub enabled: bool,
    pub rpc_url: String,
    pub rpc_user: String,
    pub rpc_password: String,
    pub min_confirmations: u64,
    pub request_timeout_secs: u64,
    /// Tracker names created at startup when missing
    pub trackers: Vec<String>,
    /// Hex redeem script of the validators' multisig
    pub lock_script: String,
}

impl BitcoinConfig {
    /// Decoded redeem script, `None` when not configured
    pub fn redeem_script(&self) -> Result<Option<Vec<u8>>> {
        if self.lock_script.is_empty() {
            return Ok(None);
        }
        let script = hex::decode(self.lock_script.trim_start_matches("0x"))
            .context("bitcoin.lock_script is not valid hex")?;
        Ok(Some(script))
    }
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rpc_url: String::new(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            min_confirmations: 6,
            request_timeout_secs: 30,
            trackers: Vec::new(),
            lock_script: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EthereumConfig {
    pub enabled: bool,
    pub chain_id: u64,
    pub rpc_urls: Vec<String>,
    pub confirmation_blocks: u64,
}

impl Default for EthereumConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chain_id: 1,
            rpc_urls: Vec::new(),
            confirmation_blocks: 12,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InternalConfig {
    /// Node endpoint accepting internal transactions; loopback when absent
    pub broadcast_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_pool_capacity() -> usize {
    10_000
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(input: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(input);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        self.validator_set()?;
        self.node_address()?;

        if self.node.block_interval_ms == 0 {
            anyhow::bail!("node.block_interval_ms must be positive");
        }
        if self.jobs.max_retries == u8::MAX {
            anyhow::bail!("jobs.max_retries must be below {}", u8::MAX);
        }
        if self.jobs.max_concurrent_jobs == 0 {
            anyhow::bail!("jobs.max_concurrent_jobs must be positive");
        }
        if self.bitcoin.enabled && self.bitcoin.rpc_url.is_empty() {
            anyhow::bail!("Bitcoin is enabled but bitcoin.rpc_url is empty");
        }
        if !self.bitcoin.trackers.is_empty() && self.bitcoin.redeem_script()?.is_none() {
            anyhow::bail!("bitcoin.trackers are configured without bitcoin.lock_script");
        }
        if let Some(name) = self
            .bitcoin
            .trackers
            .iter()
            .find(|name| name.is_empty() || name.contains('#'))
        {
            anyhow::bail!("Invalid bitcoin tracker name {:?}: must be non-empty without '#'", name);
        }
        if self.ethereum.enabled && self.ethereum.rpc_urls.is_empty() {
            anyhow::bail!("Ethereum is enabled but has no RPC URLs configured");
        }
        if self.node_key()?.is_none() {
            tracing::warn!("No validator key configured - node will not run bridge jobs");
        }

        Ok(())
    }

    /// Current validator set
    pub fn validator_set(&self) -> Result<ValidatorSet> {
        let validators = self
            .node
            .validators
            .iter()
            .map(|v| {
                let address = v
                    .parse::<Address>()
                    .with_context(|| format!("Invalid validator address: {}", v))?;
                check_public_key(&address)?;
                Ok(address)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ValidatorSet::new(validators))
    }

    /// This node's signing key, if it is configured as a validator
    pub fn node_key(&self) -> Result<Option<NodeKey>> {
        match self.node.validator_key.as_deref() {
            None | Some("") => Ok(None),
            Some(key) => Ok(Some(NodeKey::from_hex(key)?)),
        }
    }

    /// This node's address; empty for non-validators
    pub fn node_address(&self) -> Result<Address> {
        Ok(self
            .node_key()?
            .map(|key| key.address().clone())
            .unwrap_or_default())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
