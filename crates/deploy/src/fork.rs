//! Fork rehearsal controller: runs a body against a disposable fork of a live network.
//!
//! The fork is torn down on every exit path. Success and failure of the body await
//! an explicit teardown; if the surrounding future is dropped instead (cancellation),
//! [`TeardownGuard`] blocks on the teardown in its `Drop`.

use std::{future::Future, sync::Arc};

use thiserror::Error;
use url::Url;

use crate::{
    ConfigError, NetworkContext,
    credentials::SecretSource,
    error::exit_code,
    network::NetworkRegistry,
};

#[derive(Debug, Error)]
pub enum ForkError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("failed to start a fork of `{upstream}`: {reason}")]
    Start { upstream: String, reason: String },

    #[error("failed to tear down fork {id}: {reason}")]
    Teardown { id: String, reason: String },
}

impl ForkError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => exit_code::CONFIGURATION,
            Self::Start { .. } | Self::Teardown { .. } => exit_code::FAILURE,
        }
    }
}

/// A running fork.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkInstance {
    pub id: String,
    pub rpc_endpoint: Url,
}

/// Starts and stops forked chains.
pub trait ForkBackend: Send + Sync + 'static {
    /// Start a fork of `upstream`. Returns once the fork answers RPC calls.
    fn start(
        &self,
        upstream: &NetworkContext,
    ) -> impl Future<Output = Result<ForkInstance, ForkError>> + Send;

    fn stop(&self, instance: &ForkInstance) -> impl Future<Output = Result<(), ForkError>> + Send;
}

/// Owns a running fork until it is torn down.
struct TeardownGuard<B: ForkBackend> {
    backend: Arc<B>,
    instance: Option<ForkInstance>,
}

impl<B: ForkBackend> TeardownGuard<B> {
    fn new(backend: Arc<B>, instance: ForkInstance) -> Self {
        Self {
            backend,
            instance: Some(instance),
        }
    }

    async fn teardown(&mut self) -> Result<(), ForkError> {
        let Some(instance) = self.instance.take() else {
            return Ok(());
        };

        tracing::debug!(fork = %instance.id, "Tearing down fork");
        self.backend.stop(&instance).await?;
        tracing::info!(fork = %instance.id, "Fork torn down");
        Ok(())
    }
}

impl<B: ForkBackend> Drop for TeardownGuard<B> {
    fn drop(&mut self) {
        let Some(instance) = self.instance.take() else {
            return;
        };

        tracing::warn!(fork = %instance.id, "Fork abandoned before teardown, stopping it");

        let stop = self.backend.stop(&instance);
        let result = match tokio::runtime::Handle::try_current() {
            Ok(handle)
                if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread =>
            {
                tokio::task::block_in_place(|| handle.block_on(stop))
            }
            _ => futures::executor::block_on(stop),
        };

        if let Err(e) = result {
            tracing::error!(fork = %instance.id, error = %e, "Failed to tear down fork");
        }
    }
}

/// Scopes pipeline runs to ephemeral forks.
pub struct ForkRehearsalController<B, S> {
    backend: Arc<B>,
    registry: Arc<NetworkRegistry<S>>,
}

impl<B: ForkBackend, S: SecretSource> ForkRehearsalController<B, S> {
    pub fn new(backend: Arc<B>, registry: Arc<NetworkRegistry<S>>) -> Self {
        Self { backend, registry }
    }

    /// Start a fork of `upstream`, run `body` against its context, and tear the fork
    /// down whatever the outcome.
    pub async fn with_fork_of<T, E, F, Fut>(&self, upstream: &str, body: F) -> Result<T, E>
    where
        F: FnOnce(NetworkContext) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ForkError>,
    {
        let upstream_ctx = self.registry.resolve(upstream).map_err(ForkError::from)?;

        tracing::info!(upstream, chain_id = upstream_ctx.chain_id(), "Starting fork");
        let instance = self.backend.start(&upstream_ctx).await?;
        tracing::info!(upstream, fork = %instance.id, rpc = %instance.rpc_endpoint, "Fork ready");

        let endpoint = instance.rpc_endpoint.clone();
        let mut guard = TeardownGuard::new(self.backend.clone(), instance);

        let ctx = match self.registry.resolve_fork(upstream, endpoint) {
            Ok(ctx) => ctx,
            Err(e) => {
                if let Err(teardown) = guard.teardown().await {
                    tracing::error!(error = %teardown, "Failed to tear down fork");
                }
                return Err(ForkError::from(e).into());
            }
        };

        let result = body(ctx).await;
        let teardown = guard.teardown().await;

        match (result, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(teardown)) => Err(teardown.into()),
            (Err(e), teardown) => {
                if let Err(teardown) = teardown {
                    tracing::error!(error = %teardown, "Failed to tear down fork");
                }
                Err(e)
            }
        }
    }
}
