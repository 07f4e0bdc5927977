//! Network registry: resolves logical network names into immutable contexts.

use url::Url;

use crate::{
    ConfigError, SlipwayConfig,
    config::{ExplorerConfig, NetworkConfig},
    credentials::{Secret, SecretSource},
};

/// Reserved name of the ephemeral forked sandbox.
pub const FORK_NETWORK: &str = "fork";

/// Default confirmation depth of a fork, which mines every transaction instantly.
const FORK_CONFIRMATIONS: u64 = 1;

/// Where and how to reach a block explorer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExplorerRoute {
    pub api_url: Url,
    pub browser_url: Option<Url>,
    pub api_key: Option<Secret>,
    /// Name of the secret the API key is read from.
    pub api_key_ref: String,
}

/// Everything the pipeline needs to know about one target network.
///
/// Built only by [`NetworkRegistry`]; read through accessors and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkContext {
    name: String,
    chain_id: u64,
    rpc_endpoint: Url,
    explorer: Option<ExplorerRoute>,
    confirmations: u64,
    credential_ref: String,
    is_ephemeral_fork: bool,
    forked_from: Option<String>,
}

impl NetworkContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn rpc_endpoint(&self) -> &Url {
        &self.rpc_endpoint
    }

    pub fn explorer(&self) -> Option<&ExplorerRoute> {
        self.explorer.as_ref()
    }

    /// Number of blocks on top of the deployment block before it counts as confirmed.
    pub fn confirmations(&self) -> u64 {
        self.confirmations
    }

    /// Name of the secret holding the deployer key.
    pub fn credential_ref(&self) -> &str {
        &self.credential_ref
    }

    pub fn is_ephemeral_fork(&self) -> bool {
        self.is_ephemeral_fork
    }

    /// The upstream network a fork was taken from.
    pub fn forked_from(&self) -> Option<&str> {
        self.forked_from.as_deref()
    }
}

/// Pure lookup of network contexts against the startup configuration.
#[derive(Debug, Clone)]
pub struct NetworkRegistry<S> {
    networks: std::collections::BTreeMap<String, NetworkConfig>,
    default_confirmations: u64,
    secrets: S,
}

impl<S: SecretSource> NetworkRegistry<S> {
    pub fn new(config: &SlipwayConfig, secrets: S) -> Self {
        Self {
            networks: config.networks.clone(),
            default_confirmations: config.deploy.confirmations,
            secrets,
        }
    }

    /// Names of all configured networks, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.networks.keys().map(String::as_str)
    }

    /// Resolve a configured network by name.
    pub fn resolve(&self, name: &str) -> Result<NetworkContext, ConfigError> {
        if name == FORK_NETWORK {
            return Err(ConfigError::ForkRequiresUpstream(name.to_string()));
        }

        let network = self
            .networks
            .get(name)
            .ok_or_else(|| ConfigError::UnknownNetwork(name.to_string()))?;

        let chain_id = network
            .chain_id
            .filter(|id| *id != 0)
            .ok_or_else(|| ConfigError::MissingChainId(name.to_string()))?;

        let rpc_endpoint = parse_endpoint(name, "rpc_url", &network.rpc_url)?;

        let explorer = network
            .explorer
            .as_ref()
            .map(|explorer| self.explorer_route(name, explorer))
            .transpose()?;

        Ok(NetworkContext {
            name: name.to_string(),
            chain_id,
            rpc_endpoint,
            explorer,
            confirmations: network
                .confirmations
                .unwrap_or(self.default_confirmations)
                .max(1),
            credential_ref: network.private_key_env.clone(),
            is_ephemeral_fork: false,
            forked_from: None,
        })
    }

    /// Resolve the context of a local fork of `upstream` reachable at `local_endpoint`.
    ///
    /// The fork inherits the upstream chain id and credential reference, has no
    /// explorer routing and confirms after one block.
    pub fn resolve_fork(
        &self,
        upstream: &str,
        local_endpoint: Url,
    ) -> Result<NetworkContext, ConfigError> {
        let upstream_ctx = self.resolve(upstream)?;
        check_scheme(FORK_NETWORK, "rpc_url", &local_endpoint)?;

        Ok(NetworkContext {
            name: FORK_NETWORK.to_string(),
            chain_id: upstream_ctx.chain_id,
            rpc_endpoint: local_endpoint,
            explorer: None,
            confirmations: FORK_CONFIRMATIONS,
            credential_ref: upstream_ctx.credential_ref,
            is_ephemeral_fork: true,
            forked_from: Some(upstream_ctx.name),
        })
    }

    fn explorer_route(
        &self,
        network: &str,
        explorer: &ExplorerConfig,
    ) -> Result<ExplorerRoute, ConfigError> {
        let api_url = parse_endpoint(network, "explorer api_url", &explorer.api_url)?;
        let browser_url = explorer
            .browser_url
            .as_deref()
            .map(|url| parse_endpoint(network, "explorer browser_url", url))
            .transpose()?;

        Ok(ExplorerRoute {
            api_url,
            browser_url,
            api_key: self.secrets.secret(&explorer.api_key_env),
            api_key_ref: explorer.api_key_env.clone(),
        })
    }
}

fn parse_endpoint(network: &str, field: &'static str, value: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::MalformedEndpoint {
        network: network.to_string(),
        field,
        value: value.to_string(),
        reason: e.to_string(),
    })?;
    check_scheme(network, field, &url)?;
    Ok(url)
}

fn check_scheme(network: &str, field: &'static str, url: &Url) -> Result<(), ConfigError> {
    match url.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::MalformedEndpoint {
            network: network.to_string(),
            field,
            value: url.to_string(),
            reason: format!("unsupported scheme `{other}`"),
        }),
    }
}
