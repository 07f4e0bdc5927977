//! Docker access for the fork sandbox.
//!
//! Each rehearsal runs one short-lived container that publishes a single RPC port
//! on the loopback interface. Containers are labelled so that leftovers from a
//! crashed process can be found with `docker ps --filter label=slipway.fork`.

use std::{collections::HashMap, fmt, time::Duration};

use anyhow::{Context, Result};
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, RemoveContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    secret::{HostConfig, PortBinding},
};
use derive_more::Deref;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

/// Label set on every sandbox container, valued with the forked network name.
pub const SANDBOX_LABEL: &str = "slipway.fork";

/// Grace period given to a sandbox before Docker kills it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// An image reference, `repository:tag`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DockerImage {
    pub image: String,
    pub tag: String,
}

impl DockerImage {
    pub fn new(image: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            tag: tag.into(),
        }
    }

    pub fn reference(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DockerImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.image, self.tag)
    }
}

/// What to run in a sandbox container.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    pub image: DockerImage,
    pub entrypoint: Vec<String>,
    pub args: Vec<String>,
    /// Port the node listens on inside the container.
    pub rpc_port: u16,
    /// Loopback port the RPC port is published on.
    pub host_port: u16,
    /// Network being forked, recorded in [`SANDBOX_LABEL`].
    pub upstream: String,
}

impl SandboxSpec {
    fn port_key(&self) -> String {
        format!("{}/tcp", self.rpc_port)
    }

    fn container_config(&self) -> Config<String> {
        let port_key = self.port_key();
        let binding = PortBinding {
            host_ip: Some("127.0.0.1".to_string()),
            host_port: Some(self.host_port.to_string()),
        };

        Config {
            image: Some(self.image.reference()),
            entrypoint: Some(self.entrypoint.clone()),
            cmd: Some(self.args.clone()),
            labels: Some(HashMap::from([(
                SANDBOX_LABEL.to_string(),
                self.upstream.clone(),
            )])),
            exposed_ports: Some(HashMap::from([(port_key.clone(), HashMap::new())])),
            host_config: Some(HostConfig {
                port_bindings: Some(HashMap::from([(port_key, Some(vec![binding]))])),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Docker client used by the fork backend. It never removes containers it was not
/// asked to; teardown is driven by the rehearsal controller.
#[derive(Deref, Clone)]
pub struct SandboxDocker {
    #[deref]
    docker: Docker,
}

impl SandboxDocker {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker. Is Docker running?")?;
        Ok(Self { docker })
    }

    /// Make `image` available locally, pulling it when missing.
    pub async fn ensure_image(&self, image: &DockerImage) -> Result<()> {
        let reference = image.reference();
        if self.docker.inspect_image(&reference).await.is_ok() {
            tracing::debug!(image = %reference, "Sandbox image present");
            return Ok(());
        }

        tracing::info!(image = %reference, "Pulling sandbox image");
        let options = CreateImageOptions {
            from_image: image.image.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            let step = step.with_context(|| format!("Failed to pull '{reference}'"))?;
            if let Some(status) = step.status {
                tracing::trace!(image = %reference, status, "pull");
            }
        }
        Ok(())
    }

    /// Create and start a sandbox, returning its container id. A container that was
    /// created but failed to start is discarded before returning the error.
    pub async fn launch(&self, name: &str, spec: &SandboxSpec) -> Result<String> {
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    ..Default::default()
                }),
                spec.container_config(),
            )
            .await
            .with_context(|| format!("Failed to create sandbox '{name}'"))?;

        tracing::debug!(container_id = %created.id, name, upstream = %spec.upstream, "Sandbox created");

        if let Err(e) = self.docker.start_container::<String>(&created.id, None).await {
            self.discard(&created.id).await.ok();
            return Err(e).with_context(|| format!("Failed to start sandbox '{name}'"));
        }
        Ok(created.id)
    }

    /// Stop and remove a sandbox. Missing or already stopped containers are fine.
    pub async fn discard(&self, container_id: &str) -> Result<()> {
        let stop = StopContainerOptions {
            t: STOP_GRACE.as_secs() as i64,
        };
        if let Err(e) = self.docker.stop_container(container_id, Some(stop)).await {
            tracing::debug!(container_id, error = %e, "Sandbox stop failed");
        }

        let remove = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(remove)).await {
            Ok(())
            | Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                tracing::debug!(container_id, "Sandbox removed");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("Failed to remove sandbox {container_id}")),
        }
    }
}
