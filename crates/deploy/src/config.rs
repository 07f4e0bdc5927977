//! The immutable configuration object built once at startup.
//!
//! Values are layered with figment: built-in defaults, then `Slipway.toml`, then
//! `SLIPWAY_*` environment variables (nested keys separated by `__`, e.g.
//! `SLIPWAY_DEPLOY__CONFIRMATIONS=3`). Secrets are never stored here: networks only
//! name the environment variables that hold them.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, docker::DockerImage};

/// The default name for the slipway configuration file.
pub const CONFIG_FILENAME: &str = "Slipway.toml";

/// Prefix of the environment variables that override configuration values.
pub const ENV_PREFIX: &str = "SLIPWAY_";

/// Default environment variable holding the deployer private key.
pub const DEFAULT_PRIVATE_KEY_ENV: &str = "PRIVATE_KEY";

/// Default environment variable holding the explorer API key.
pub const DEFAULT_API_KEY_ENV: &str = "API_KEY";

/// Default Docker image for the Anvil fork (Foundry).
pub const ANVIL_DEFAULT_IMAGE: &str = "ghcr.io/foundry-rs/foundry";
/// Default Docker tag for the Anvil fork (Foundry).
pub const ANVIL_DEFAULT_TAG: &str = "latest";

/// Root configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipwayConfig {
    /// Solidity compiler version the artifacts must have been built with.
    pub compiler_version: String,
    /// Directory containing the compiler output (Hardhat layout).
    pub artifacts_dir: PathBuf,
    /// Directory of the durable artifact store.
    pub store_dir: PathBuf,
    /// Known networks, by logical name.
    pub networks: BTreeMap<String, NetworkConfig>,
    /// Per-contract deployment inputs.
    pub contracts: BTreeMap<String, ContractConfig>,
    /// Deployment orchestrator settings.
    pub deploy: DeploySettings,
    /// Verification submitter settings.
    pub verify: VerifySettings,
    /// Fork rehearsal settings.
    pub fork: ForkSettings,
    /// Client binding generation.
    pub bindings: BindingsSettings,
    /// Gas usage reporting.
    pub gas_reporter: GasReporterSettings,
}

impl Default for SlipwayConfig {
    fn default() -> Self {
        let mut networks = BTreeMap::new();
        networks.insert(
            "sepolia".to_string(),
            NetworkConfig {
                rpc_url: "https://eth-sepolia.public.blastapi.io".to_string(),
                chain_id: Some(11155111),
                private_key_env: DEFAULT_PRIVATE_KEY_ENV.to_string(),
                confirmations: None,
                explorer: Some(ExplorerConfig {
                    api_url: "https://api-sepolia.etherscan.io/api".to_string(),
                    browser_url: Some("https://sepolia.etherscan.io/".to_string()),
                    api_key_env: DEFAULT_API_KEY_ENV.to_string(),
                }),
            },
        );
        networks.insert(
            "mainnet".to_string(),
            NetworkConfig {
                rpc_url: "https://rpc.ankr.com/eth".to_string(),
                chain_id: Some(1),
                private_key_env: DEFAULT_PRIVATE_KEY_ENV.to_string(),
                confirmations: None,
                explorer: Some(ExplorerConfig {
                    api_url: "https://api.etherscan.io/api/".to_string(),
                    browser_url: Some("https://etherscan.io/".to_string()),
                    api_key_env: DEFAULT_API_KEY_ENV.to_string(),
                }),
            },
        );

        Self {
            compiler_version: "0.8.23".to_string(),
            artifacts_dir: PathBuf::from("artifacts"),
            store_dir: PathBuf::from(".slipway"),
            networks,
            contracts: BTreeMap::new(),
            deploy: DeploySettings::default(),
            verify: VerifySettings::default(),
            fork: ForkSettings::default(),
            bindings: BindingsSettings::default(),
            gas_reporter: GasReporterSettings::default(),
        }
    }
}

impl SlipwayConfig {
    /// Load the configuration: defaults, then the TOML file (if it exists), then
    /// the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME));

        Self::figment(&path)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    /// Load the configuration from defaults and the TOML file only.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Load(e.to_string()))
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default())).merge(Toml::file(path))
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration to {}", path.display()))?;

        Ok(())
    }
}

/// Connection parameters of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// JSON-RPC endpoint.
    pub rpc_url: String,
    /// EIP-155 chain id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Environment variable holding the deployer private key.
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
    /// Confirmation depth override for this network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u64>,
    /// Block explorer routing, if the network has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer: Option<ExplorerConfig>,
}

/// Etherscan-compatible explorer routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplorerConfig {
    /// API endpoint.
    pub api_url: String,
    /// Human-facing explorer URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_url: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

fn default_private_key_env() -> String {
    DEFAULT_PRIVATE_KEY_ENV.to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

/// Deployment inputs for one contract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractConfig {
    /// ABI-encoded constructor arguments, hex.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constructor_args: Option<String>,
}

/// Settings of the deployment orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySettings {
    /// Blocks required after inclusion before a deployment is final.
    pub confirmations: u64,
    /// Interval between receipt polls.
    pub poll_interval_ms: u64,
    /// Maximum wait for confirmation before the deployment is marked failed.
    pub confirmation_timeout_ms: u64,
    /// Attempts for each RPC call made while preparing and broadcasting.
    pub max_broadcast_attempts: usize,
    /// First backoff delay between broadcast attempts.
    pub backoff_min_ms: u64,
    /// Upper bound of the backoff delay.
    pub backoff_max_ms: u64,
    /// Consecutive failed receipt polls tolerated before giving up.
    pub max_poll_errors: usize,
    /// Gas limit as a percentage of the node's estimate.
    pub gas_limit_percent: u64,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            confirmations: 2,
            poll_interval_ms: 2_000,
            confirmation_timeout_ms: 600_000,
            max_broadcast_attempts: 5,
            backoff_min_ms: 500,
            backoff_max_ms: 30_000,
            max_poll_errors: 10,
            gas_limit_percent: 120,
        }
    }
}

impl DeploySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn backoff_min(&self) -> Duration {
        Duration::from_millis(self.backoff_min_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Settings of the verification submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifySettings {
    /// First delay between status polls; grows exponentially.
    pub poll_interval_ms: u64,
    /// Upper bound of the delay between status polls.
    pub max_poll_interval_ms: u64,
    /// Maximum wait for a terminal explorer status.
    pub timeout_ms: u64,
    /// Attempts for the submission request.
    pub max_submit_attempts: usize,
    /// Consecutive transient poll errors tolerated before giving up.
    pub max_transient_errors: usize,
    /// Bound on a single submission request.
    pub submit_timeout_ms: u64,
    /// How long a claim may go unrenewed before another run takes it over. Never
    /// shorter than one submission attempt plus the delay before the next one.
    pub claim_wait_ms: u64,
}

impl Default for VerifySettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            max_poll_interval_ms: 60_000,
            timeout_ms: 300_000,
            max_submit_attempts: 5,
            max_transient_errors: 5,
            submit_timeout_ms: 30_000,
            claim_wait_ms: 120_000,
        }
    }
}

impl VerifySettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    /// Silence after which a claim is considered abandoned. The claim holder renews
    /// it before every attempt, and the longest gap between renewals is one attempt
    /// plus the largest jittered backoff delay.
    pub fn claim_wait(&self) -> Duration {
        let longest_gap = self.submit_timeout() + self.max_poll_interval() + self.poll_interval();
        Duration::from_millis(self.claim_wait_ms).max(longest_gap)
    }
}

/// Settings of the fork rehearsal sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForkSettings {
    /// Docker image running Anvil.
    pub docker_image: DockerImage,
    /// Block to fork from; latest when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_block_number: Option<u64>,
    /// Maximum wait for the fork to answer RPC calls.
    pub startup_timeout_secs: u64,
    /// Use Anvil's pre-funded test account on forks instead of the real key.
    pub allow_test_key: bool,
    /// Extra arguments passed to Anvil.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

impl Default for ForkSettings {
    fn default() -> Self {
        Self {
            docker_image: DockerImage::new(ANVIL_DEFAULT_IMAGE, ANVIL_DEFAULT_TAG),
            fork_block_number: None,
            startup_timeout_secs: 60,
            allow_test_key: true,
            extra_args: Vec::new(),
        }
    }
}

/// Settings of the client binding generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindingsSettings {
    pub enabled: bool,
    pub out_dir: PathBuf,
}

impl Default for BindingsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            out_dir: PathBuf::from("typechain"),
        }
    }
}

/// Settings of the gas reporter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GasReporterSettings {
    pub enabled: bool,
    /// Fiat currency used for the cost column.
    pub currency: String,
    /// Price of one ether in `currency`; the fiat column is omitted when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eth_price: Option<f64>,
}

impl Default for GasReporterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            currency: "USD".to_string(),
            eth_price: None,
        }
    }
}
