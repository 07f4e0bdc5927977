//! Wires the components into the operator commands: deploy, verify and rehearse.

use std::sync::Arc;

use futures::future::join_all;
use url::Url;

use crate::{
    CompiledArtifact, NetworkContext, SlipwayConfig, SlipwayError,
    bindings::{AbiExporter, BindingGenerator},
    cancel::Cancellation,
    compiler::{Compiler, HardhatArtifacts},
    credentials::{CredentialProvider, SecretSource},
    deploy::DeploymentOrchestrator,
    explorer::{EtherscanClient, ExplorerApi},
    fork::{ForkBackend, ForkRehearsalController},
    gas::{GasReport, ReceiptObserver},
    network::NetworkRegistry,
    records::{DeploymentKey, DeploymentRecord, VerificationRecord, VerificationStatus},
    rpc::{ChainRpc, HttpRpc},
    store::{ArtifactStore, StoreError},
    verify::{VerificationSubmitter, VerifyError, explorer_route},
};

/// Opens the chain and explorer clients of a resolved network.
pub trait Connector: Send + Sync {
    type Rpc: ChainRpc;
    type Explorer: ExplorerApi;

    fn rpc(&self, ctx: &NetworkContext) -> Result<Self::Rpc, SlipwayError>;

    /// Fails with [`VerifyError::ExplorerUnavailable`] for networks without an explorer.
    fn explorer(&self, ctx: &NetworkContext) -> Result<Self::Explorer, SlipwayError>;
}

/// JSON-RPC over HTTP and the Etherscan API.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    type Rpc = HttpRpc;
    type Explorer = EtherscanClient;

    fn rpc(&self, ctx: &NetworkContext) -> Result<HttpRpc, SlipwayError> {
        Ok(HttpRpc::new(ctx.rpc_endpoint().clone())?)
    }

    fn explorer(&self, ctx: &NetworkContext) -> Result<EtherscanClient, SlipwayError> {
        let (api_url, api_key) = explorer_route(ctx)?;
        Ok(EtherscanClient::new(
            api_url.clone(),
            api_key.clone(),
            ctx.chain_id(),
        )?)
    }
}

/// What happened to verification during a rehearsal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RehearsalVerification {
    /// Forks have no explorer; the reason is reported instead of an error.
    OutOfScope(String),
    /// The fork context carried an explorer route and the submitter ran to the end.
    Recorded(VerificationRecord),
    /// The fork deployment did not confirm, so verification was not attempted.
    NotAttempted,
}

/// Outcome of a rehearsal. Advisory only: the fork is a snapshot of the live chain.
#[derive(Debug, Clone)]
pub struct RehearsalReport {
    pub upstream: String,
    pub fork_endpoint: Url,
    pub deployment: DeploymentRecord,
    pub verification: RehearsalVerification,
}

/// The deployment pipeline of one invocation.
pub struct Pipeline<S, C = HttpConnector> {
    config: SlipwayConfig,
    connector: C,
    registry: Arc<NetworkRegistry<S>>,
    credentials: CredentialProvider<S>,
    compiler: Arc<dyn Compiler>,
    store: Arc<ArtifactStore>,
    gas_report: Option<Arc<GasReport>>,
    bindings: Option<AbiExporter>,
    cancel: Cancellation,
}

impl<S: SecretSource + Clone + 'static> Pipeline<S, HttpConnector> {
    pub fn new(config: SlipwayConfig, secrets: S) -> Result<Self, SlipwayError> {
        let registry = Arc::new(NetworkRegistry::new(&config, secrets.clone()));
        let credentials =
            CredentialProvider::new(secrets).allow_fork_test_key(config.fork.allow_test_key);
        let compiler: Arc<dyn Compiler> = Arc::new(HardhatArtifacts::from_config(&config)?);
        let store = Arc::new(ArtifactStore::open(&config.store_dir)?);

        let gas_report = config
            .gas_reporter
            .enabled
            .then(|| Arc::new(GasReport::new(config.gas_reporter.clone())));
        let bindings = config
            .bindings
            .enabled
            .then(|| AbiExporter::new(&config.bindings.out_dir));

        Ok(Self {
            config,
            connector: HttpConnector,
            registry,
            credentials,
            compiler,
            store,
            gas_report,
            bindings,
            cancel: Cancellation::never(),
        })
    }
}

impl<S: SecretSource + Clone + 'static, C: Connector> Pipeline<S, C> {
    /// Reach the networks through `connector` instead of HTTP.
    pub fn with_connector<D: Connector>(self, connector: D) -> Pipeline<S, D> {
        Pipeline {
            config: self.config,
            connector,
            registry: self.registry,
            credentials: self.credentials,
            compiler: self.compiler,
            store: self.store,
            gas_report: self.gas_report,
            bindings: self.bindings,
            cancel: self.cancel,
        }
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = compiler;
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &SlipwayConfig {
        &self.config
    }

    pub fn registry(&self) -> &NetworkRegistry<S> {
        &self.registry
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn gas_report(&self) -> Option<&GasReport> {
        self.gas_report.as_deref()
    }

    /// Deploy `contracts` to `network` concurrently.
    ///
    /// Resolution, credential and compilation problems fail the whole call before
    /// anything is broadcast; per-contract outcomes are returned in input order.
    pub async fn deploy(
        &self,
        network: &str,
        contracts: &[String],
    ) -> Result<Vec<Result<DeploymentRecord, SlipwayError>>, SlipwayError> {
        let ctx = self.registry.resolve(network)?;
        let credential = self.credentials.credential_for(&ctx)?;
        let artifacts = contracts
            .iter()
            .map(|contract| self.compile(contract))
            .collect::<Result<Vec<_>, _>>()?;

        let orchestrator = self.orchestrator(&ctx, self.store.clone())?;

        tracing::info!(
            network = %ctx.name(),
            chain_id = ctx.chain_id(),
            deployer = %credential.address(),
            contracts = contracts.len(),
            "Deploying"
        );

        let outcomes = join_all(artifacts.iter().map(|artifact| {
            let orchestrator = &orchestrator;
            let ctx = &ctx;
            let credential = &credential;
            async move {
                orchestrator
                    .deploy(ctx, credential, artifact)
                    .await
                    .map_err(SlipwayError::from)
            }
        }))
        .await;

        Ok(outcomes)
    }

    /// Verify the deployment of `contract` on `network`.
    pub async fn verify(
        &self,
        network: &str,
        contract: &str,
    ) -> Result<VerificationRecord, SlipwayError> {
        let ctx = self.registry.resolve(network)?;
        let artifact = self.compiler.compile(contract)?;
        let key = DeploymentKey::new(ctx.name(), contract, artifact.bytecode_hash);

        let Some(entry) = self.store.get(&key)? else {
            return Err(VerifyError::NotYetDeployed {
                key,
                status: "not deployed".to_string(),
            }
            .into());
        };

        if let Some(existing) = entry.verification.as_ref().filter(|v| is_settled(v)) {
            tracing::info!(key = %key, status = %existing.status, "Verification already settled");
            return Ok(existing.clone());
        }

        let explorer = self.connector.explorer(&ctx)?;
        Ok(self
            .submitter(explorer, self.store.clone())
            .verify(&ctx, &entry.deployment, &artifact.source_metadata)
            .await?)
    }

    /// Rehearse the deployment of `contract` against a fork of `network`, using the
    /// given fork backend.
    pub async fn rehearse<B: ForkBackend>(
        &self,
        backend: Arc<B>,
        network: &str,
        contract: &str,
    ) -> Result<RehearsalReport, SlipwayError> {
        let artifact = self.compile(contract)?;
        let controller = ForkRehearsalController::new(backend, self.registry.clone());
        let artifact = &artifact;

        controller
            .with_fork_of(network, |ctx| async move {
                // Rehearsal records never reach the durable store.
                let scratch = tempdir::TempDir::new("slipway-rehearsal").map_err(|source| {
                    StoreError::Io {
                        path: std::env::temp_dir(),
                        source,
                    }
                })?;
                let store = Arc::new(ArtifactStore::open(scratch.path())?);

                let credential = self.credentials.credential_for(&ctx)?;
                let deployment = self
                    .orchestrator(&ctx, store.clone())?
                    .deploy(&ctx, &credential, artifact)
                    .await?;

                let verification = if deployment.is_confirmed() {
                    let attempt = match self.connector.explorer(&ctx) {
                        Ok(explorer) => self
                            .submitter(explorer, store)
                            .verify(&ctx, &deployment, &artifact.source_metadata)
                            .await
                            .map_err(SlipwayError::from),
                        Err(e) => Err(e),
                    };
                    match attempt {
                        Ok(record) => RehearsalVerification::Recorded(record),
                        Err(SlipwayError::Verification(
                            reason @ VerifyError::ExplorerUnavailable(_),
                        )) => RehearsalVerification::OutOfScope(reason.to_string()),
                        Err(e) => return Err(e),
                    }
                } else {
                    RehearsalVerification::NotAttempted
                };

                tracing::info!(
                    upstream = %network,
                    status = %deployment.status,
                    address = ?deployment.address,
                    "Rehearsal finished; results are advisory"
                );

                Ok::<_, SlipwayError>(RehearsalReport {
                    upstream: network.to_string(),
                    fork_endpoint: ctx.rpc_endpoint().clone(),
                    deployment,
                    verification,
                })
            })
            .await
    }

    fn compile(&self, contract: &str) -> Result<CompiledArtifact, SlipwayError> {
        let artifact = self.compiler.compile(contract)?;

        if let Some(bindings) = &self.bindings {
            if let Err(e) = bindings.generate(&artifact.contract_name, &artifact.abi) {
                tracing::warn!(contract, error = %e, "Failed to generate bindings");
            }
        }

        Ok(artifact)
    }

    fn submitter(
        &self,
        explorer: C::Explorer,
        store: Arc<ArtifactStore>,
    ) -> VerificationSubmitter<C::Explorer> {
        VerificationSubmitter::new(explorer, store, self.config.verify.clone())
            .with_cancellation(self.cancel.clone())
    }

    fn orchestrator(
        &self,
        ctx: &NetworkContext,
        store: Arc<ArtifactStore>,
    ) -> Result<DeploymentOrchestrator<C::Rpc>, SlipwayError> {
        let rpc = self.connector.rpc(ctx)?;
        let mut orchestrator = DeploymentOrchestrator::new(rpc, store, self.config.deploy.clone())
            .with_cancellation(self.cancel.clone());

        if let Some(report) = &self.gas_report {
            orchestrator = orchestrator.with_observer(report.clone() as Arc<dyn ReceiptObserver>);
        }

        Ok(orchestrator)
    }
}

/// Verified, or failed for a reason resubmission cannot fix.
fn is_settled(record: &VerificationRecord) -> bool {
    match record.status {
        VerificationStatus::Verified => true,
        VerificationStatus::Failed => !record.cause.as_ref().is_some_and(|c| c.kind.is_retriable()),
        _ => false,
    }
}
