//! In-process stand-ins for the chain, the explorer and the fork backend.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use alloy_core::primitives::{Address, B256, Bytes, address, keccak256};
use serde_json::json;
use tempdir::TempDir;
use url::Url;

use slipway_deploy::{
    ArtifactStore, CompilationError, CompiledArtifact, Compiler, Connector, Credential,
    CredentialProvider, DeploymentOrchestrator, DeploymentRecord, ForkBackend, ForkError,
    ForkInstance, MapSecrets, NetworkContext, NetworkRegistry, SlipwayConfig, SlipwayError,
    SourceMetadata, VerifyError,
    config::{DeploySettings, VerifySettings},
    explorer::{CheckStatus, ExplorerApi, ExplorerError, VerificationRequest},
    rpc::{ChainRpc, RpcError, TransactionReceipt},
};

pub const SEPOLIA_CHAIN_ID: u64 = 11155111;

/// Anvil's second default account.
pub const DEPLOYER_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";
pub const DEPLOYER: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");

pub const GAS_USED: u64 = 250_000;
pub const GAS_PRICE: u128 = 2_000_000_000;

pub fn transport_error(method: &str) -> RpcError {
    RpcError::Transport {
        method: method.to_string(),
        message: "connection reset by peer".to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MinedTx {
    block: u64,
    success: bool,
}

#[derive(Debug)]
struct ChainState {
    chain_id: u64,
    head: u64,
    nonces: HashMap<Address, u64>,
    /// Accepted transactions; `None` until mined.
    txs: HashMap<B256, Option<MinedTx>>,
    send_attempts: usize,
    send_failures: VecDeque<RpcError>,
    receipt_failures: VecDeque<RpcError>,
    mining: bool,
    revert: bool,
}

/// A chain that mines every accepted transaction in the next block and advances its
/// head by one block on each `eth_blockNumber` call.
#[derive(Debug, Clone)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                chain_id,
                head: 100,
                nonces: HashMap::new(),
                txs: HashMap::new(),
                send_attempts: 0,
                send_failures: VecDeque::new(),
                receipt_failures: VecDeque::new(),
                mining: true,
                revert: false,
            })),
        }
    }

    pub fn sepolia() -> Self {
        Self::new(SEPOLIA_CHAIN_ID)
    }

    /// Transactions the chain accepted.
    pub fn broadcasts(&self) -> usize {
        self.state.lock().unwrap().txs.len()
    }

    /// Calls to `eth_sendRawTransaction`, including rejected ones.
    pub fn send_attempts(&self) -> usize {
        self.state.lock().unwrap().send_attempts
    }

    /// Fail the next sends with these errors, in order.
    pub fn fail_sends(&self, errors: impl IntoIterator<Item = RpcError>) {
        self.state.lock().unwrap().send_failures.extend(errors);
    }

    /// Fail the next receipt polls with these errors, in order.
    pub fn fail_receipts(&self, errors: impl IntoIterator<Item = RpcError>) {
        self.state.lock().unwrap().receipt_failures.extend(errors);
    }

    /// Stop including new transactions in blocks.
    pub fn pause_mining(&self) {
        self.state.lock().unwrap().mining = false;
    }

    /// Resume mining and include every waiting transaction in the next block.
    pub fn resume_mining(&self) {
        let mut state = self.state.lock().unwrap();
        state.mining = true;
        let block = state.head + 1;
        let success = !state.revert;
        for tx in state.txs.values_mut().filter(|tx| tx.is_none()) {
            *tx = Some(MinedTx { block, success });
        }
    }

    /// Make every mined transaction revert.
    pub fn revert_all(&self) {
        self.state.lock().unwrap().revert = true;
    }
}

impl ChainRpc for MockChain {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        Ok(self.state.lock().unwrap().chain_id)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.head += 1;
        Ok(state.head)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or(0))
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        Ok(GAS_PRICE)
    }

    async fn max_priority_fee(&self) -> Result<u128, RpcError> {
        Ok(1_000_000_000)
    }

    async fn estimate_gas(&self, _from: Address, _input: &Bytes) -> Result<u64, RpcError> {
        Ok(GAS_USED)
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        let mut state = self.state.lock().unwrap();
        state.send_attempts += 1;

        if let Some(err) = state.send_failures.pop_front() {
            return Err(err);
        }

        let hash = keccak256(raw);
        if state.txs.contains_key(&hash) {
            return Err(RpcError::AlreadyKnown);
        }

        // Every test transaction is signed by the same deployer.
        *state.nonces.entry(DEPLOYER).or_default() += 1;

        let mined = state.mining.then(|| MinedTx {
            block: state.head + 1,
            success: !state.revert,
        });
        state.txs.insert(hash, mined);
        Ok(hash)
    }

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        let mut state = self.state.lock().unwrap();

        if let Some(err) = state.receipt_failures.pop_front() {
            return Err(err);
        }

        let Some(Some(mined)) = state.txs.get(&tx_hash).copied() else {
            return Ok(None);
        };
        // Keep the head at or past the inclusion block.
        state.head = state.head.max(mined.block);

        Ok(Some(TransactionReceipt {
            transaction_hash: tx_hash,
            block_number: mined.block,
            status: mined.success,
            contract_address: None,
            gas_used: GAS_USED,
            effective_gas_price: GAS_PRICE,
        }))
    }
}

#[derive(Debug, Default)]
struct ExplorerState {
    submissions: Vec<VerificationRequest>,
    submit_results: VecDeque<Result<String, ExplorerError>>,
    statuses: VecDeque<Result<CheckStatus, ExplorerError>>,
    checks: usize,
}

/// An explorer that hands out sequential guids and answers status checks from a
/// script, reporting `Verified` once the script is exhausted.
#[derive(Debug, Clone, Default)]
pub struct MockExplorer {
    state: Arc<Mutex<ExplorerState>>,
    submit_delay: Duration,
}

impl MockExplorer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every submission for `delay`, so concurrent callers can interleave.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn script_submits(&self, results: impl IntoIterator<Item = Result<String, ExplorerError>>) {
        self.state.lock().unwrap().submit_results.extend(results);
    }

    pub fn script_statuses(
        &self,
        statuses: impl IntoIterator<Item = Result<CheckStatus, ExplorerError>>,
    ) {
        self.state.lock().unwrap().statuses.extend(statuses);
    }

    pub fn submissions(&self) -> Vec<VerificationRequest> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn checks(&self) -> usize {
        self.state.lock().unwrap().checks
    }
}

impl ExplorerApi for MockExplorer {
    async fn submit(&self, request: &VerificationRequest) -> Result<String, ExplorerError> {
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let mut state = self.state.lock().unwrap();
        state.submissions.push(request.clone());
        let n = state.submissions.len();
        state
            .submit_results
            .pop_front()
            .unwrap_or_else(|| Ok(format!("guid-{n}")))
    }

    async fn check_status(&self, _guid: &str) -> Result<CheckStatus, ExplorerError> {
        let mut state = self.state.lock().unwrap();
        state.checks += 1;
        state
            .statuses
            .pop_front()
            .unwrap_or(Ok(CheckStatus::Verified))
    }
}

/// Routes every network, forks included, to the same in-process chain. Networks
/// without an explorer route are refused like the HTTP connector refuses them.
#[derive(Debug, Clone)]
pub struct MockConnector {
    pub chain: MockChain,
    pub explorer: MockExplorer,
}

impl MockConnector {
    pub fn new(chain: &MockChain, explorer: &MockExplorer) -> Self {
        Self {
            chain: chain.clone(),
            explorer: explorer.clone(),
        }
    }
}

impl Connector for MockConnector {
    type Rpc = MockChain;
    type Explorer = MockExplorer;

    fn rpc(&self, _ctx: &NetworkContext) -> Result<MockChain, SlipwayError> {
        Ok(self.chain.clone())
    }

    fn explorer(&self, ctx: &NetworkContext) -> Result<MockExplorer, SlipwayError> {
        if ctx.explorer().is_none() {
            return Err(VerifyError::ExplorerUnavailable(ctx.name().to_string()).into());
        }
        Ok(self.explorer.clone())
    }
}

/// Counts fork starts and stops.
#[derive(Debug, Default)]
pub struct MockForkBackend {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub endpoint: Option<Url>,
}

impl MockForkBackend {
    /// A backend whose forks listen on `endpoint`.
    pub fn at(endpoint: &str) -> Self {
        Self {
            endpoint: Some(Url::parse(endpoint).unwrap()),
            ..Default::default()
        }
    }

    pub fn running(&self) -> usize {
        self.starts.load(Ordering::SeqCst) - self.stops.load(Ordering::SeqCst)
    }
}

impl ForkBackend for MockForkBackend {
    async fn start(&self, upstream: &NetworkContext) -> Result<ForkInstance, ForkError> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(ForkInstance {
            id: format!("fork-{}-{n}", upstream.name()),
            rpc_endpoint: self
                .endpoint
                .clone()
                .unwrap_or_else(|| Url::parse("http://127.0.0.1:8545/").unwrap()),
        })
    }

    async fn stop(&self, _instance: &ForkInstance) -> Result<(), ForkError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Serves prebuilt artifacts by name.
#[derive(Debug, Default)]
pub struct StaticCompiler {
    artifacts: HashMap<String, CompiledArtifact>,
}

impl StaticCompiler {
    pub fn with(mut self, artifact: CompiledArtifact) -> Self {
        self.artifacts
            .insert(artifact.contract_name.clone(), artifact);
        self
    }
}

impl Compiler for StaticCompiler {
    fn compile(&self, contract: &str) -> Result<CompiledArtifact, CompilationError> {
        self.artifacts
            .get(contract)
            .cloned()
            .ok_or_else(|| CompilationError::NotFound {
                contract: contract.to_string(),
                dir: "artifacts".into(),
            })
    }
}

/// A compiled contract with the given creation bytecode.
pub fn artifact(contract: &str, bytecode: &'static [u8]) -> CompiledArtifact {
    CompiledArtifact::new(
        contract,
        Bytes::from_static(bytecode),
        json!([]),
        SourceMetadata {
            compiler_version: "v0.8.23+commit.f704f362".to_string(),
            source_name: format!("contracts/{contract}.sol"),
            standard_json_input: json!({ "language": "Solidity", "sources": {} }),
            constructor_args: Bytes::new(),
        },
    )
}

pub fn token() -> CompiledArtifact {
    artifact("Token", &[0x60, 0x80, 0x60, 0x40, 0x52, 0x00])
}

/// Deploy settings with millisecond timings.
pub fn fast_deploy_settings() -> DeploySettings {
    DeploySettings {
        confirmations: 2,
        poll_interval_ms: 5,
        confirmation_timeout_ms: 2_000,
        max_broadcast_attempts: 4,
        backoff_min_ms: 1,
        backoff_max_ms: 5,
        max_poll_errors: 3,
        gas_limit_percent: 120,
    }
}

/// Verify settings with millisecond timings.
pub fn fast_verify_settings() -> VerifySettings {
    VerifySettings {
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        timeout_ms: 2_000,
        max_submit_attempts: 3,
        max_transient_errors: 3,
        submit_timeout_ms: 500,
        claim_wait_ms: 1_000,
    }
}

pub fn secrets() -> MapSecrets {
    MapSecrets::new([("PRIVATE_KEY", DEPLOYER_KEY), ("API_KEY", "explorer-key")])
}

/// Test setup: a temporary store and resolved networks from the default configuration.
pub struct TestContext {
    pub dir: TempDir,
    pub config: SlipwayConfig,
    pub registry: NetworkRegistry<MapSecrets>,
    pub store: Arc<ArtifactStore>,
}

/// Initialize tracing for tests (idempotent).
pub fn init_test_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init()
        .ok();
}

impl TestContext {
    pub fn new(prefix: &str) -> Self {
        init_test_tracing();

        let dir = TempDir::new(prefix).expect("Failed to create temp dir");

        let mut config = SlipwayConfig::default();
        config.store_dir = dir.path().join("store");
        config.artifacts_dir = dir.path().join("artifacts");
        config.deploy = fast_deploy_settings();
        config.verify = fast_verify_settings();
        config.bindings.enabled = false;
        config.gas_reporter.enabled = false;

        let registry = NetworkRegistry::new(&config, secrets());
        let store = Arc::new(ArtifactStore::open(&config.store_dir).expect("Failed to open store"));

        Self {
            dir,
            config,
            registry,
            store,
        }
    }

    pub fn sepolia(&self) -> NetworkContext {
        self.registry.resolve("sepolia").expect("sepolia resolves")
    }

    pub fn credential(&self, ctx: &NetworkContext) -> Credential {
        CredentialProvider::new(secrets())
            .credential_for(ctx)
            .expect("credential")
    }

    pub fn orchestrator(&self, chain: &MockChain) -> DeploymentOrchestrator<MockChain> {
        DeploymentOrchestrator::new(chain.clone(), self.store.clone(), self.config.deploy.clone())
    }

    /// Deploy `artifact` to sepolia and return the confirmed record.
    pub async fn deployed(&self, chain: &MockChain, artifact: &CompiledArtifact) -> DeploymentRecord {
        let ctx = self.sepolia();
        let record = self
            .orchestrator(chain)
            .deploy(&ctx, &self.credential(&ctx), artifact)
            .await
            .expect("deployment");
        assert!(record.is_confirmed(), "deployment not confirmed: {record:?}");
        record
    }
}
