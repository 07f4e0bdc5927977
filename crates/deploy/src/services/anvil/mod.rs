//! Anvil fork backend running in Docker.

mod cmd;

use std::{net::TcpListener, time::Duration};

use anyhow::Context;
use url::Url;

pub use cmd::AnvilCmdBuilder;

use crate::{
    NetworkContext,
    config::ForkSettings,
    docker::{SandboxDocker, SandboxSpec},
    fork::{ForkBackend, ForkError, ForkInstance},
    rpc::{ChainRpc, HttpRpc, wait_until_ready},
};

/// The internal port Anvil listens on inside the container.
pub const ANVIL_INTERNAL_PORT: u16 = 8545;

/// Starts Anvil containers forking the upstream network.
pub struct AnvilForkBackend {
    docker: SandboxDocker,
    settings: ForkSettings,
}

impl AnvilForkBackend {
    pub fn new(docker: SandboxDocker, settings: ForkSettings) -> Self {
        Self { docker, settings }
    }

    /// Connect to the local Docker daemon.
    pub fn connect(settings: ForkSettings) -> anyhow::Result<Self> {
        Ok(Self::new(SandboxDocker::connect()?, settings))
    }

    async fn start_anvil(&self, upstream: &NetworkContext) -> anyhow::Result<ForkInstance> {
        self.docker
            .ensure_image(&self.settings.docker_image)
            .await
            .context("Failed to pull Anvil image")?;

        let host_port = free_local_port()?;
        let container_name = format!(
            "slipway-fork-{}",
            names::Generator::default()
                .next()
                .unwrap_or_else(|| "anvil".to_string())
        );

        let spec = SandboxSpec {
            image: self.settings.docker_image.clone(),
            entrypoint: vec!["anvil".to_string()],
            args: AnvilCmdBuilder::new(upstream.chain_id(), upstream.rpc_endpoint().as_str())
                .port(ANVIL_INTERNAL_PORT)
                .fork_block_number(self.settings.fork_block_number)
                .extra_args(self.settings.extra_args.clone())
                .build(),
            rpc_port: ANVIL_INTERNAL_PORT,
            host_port,
            upstream: upstream.name().to_string(),
        };

        let container_id = self
            .docker
            .launch(&container_name, &spec)
            .await
            .context("Failed to start Anvil container")?;

        tracing::info!(
            container_id = %container_id,
            container_name = %container_name,
            host_port,
            "Anvil container started"
        );

        let rpc_endpoint = Url::parse(&format!("http://127.0.0.1:{host_port}/"))
            .context("Failed to build fork RPC URL")?;

        if let Err(e) = self.wait_ready(&rpc_endpoint, upstream.chain_id()).await {
            self.docker.discard(&container_id).await.ok();
            return Err(e);
        }

        Ok(ForkInstance {
            id: container_id,
            rpc_endpoint,
        })
    }

    async fn wait_ready(&self, rpc_endpoint: &Url, chain_id: u64) -> anyhow::Result<()> {
        let rpc = HttpRpc::new(rpc_endpoint.clone())?;
        let rpc = &rpc;

        wait_until_ready(
            "anvil fork",
            Duration::from_secs(self.settings.startup_timeout_secs),
            || async move {
                let reported = rpc.chain_id().await?;
                anyhow::ensure!(
                    reported == chain_id,
                    "fork reports chain id {reported}, expected {chain_id}"
                );
                Ok(())
            },
        )
        .await
    }
}

impl ForkBackend for AnvilForkBackend {
    async fn start(&self, upstream: &NetworkContext) -> Result<ForkInstance, ForkError> {
        self.start_anvil(upstream)
            .await
            .map_err(|e| ForkError::Start {
                upstream: upstream.name().to_string(),
                reason: format!("{e:#}"),
            })
    }

    async fn stop(&self, instance: &ForkInstance) -> Result<(), ForkError> {
        self.docker
            .discard(&instance.id)
            .await
            .map_err(|e| ForkError::Teardown {
                id: instance.id.clone(),
                reason: format!("{e:#}"),
            })
    }
}

/// Ask the OS for a currently unused local port.
fn free_local_port() -> anyhow::Result<u16> {
    let listener =
        TcpListener::bind("127.0.0.1:0").context("Failed to find a free port for the fork")?;
    Ok(listener
        .local_addr()
        .context("Failed to read the bound port")?
        .port())
}
