//! Deployment orchestrator: sign, broadcast, confirm and record one contract creation.
//!
//! Per [`DeploymentKey`] the orchestrator drives `NoRecord -> Pending -> {Confirmed |
//! Failed}`. The check of the stored record, the broadcast and the persistence of the
//! `Pending` record form one critical section under the store's per-key lock, so a
//! key is never broadcast twice by concurrent callers.

use std::{future::Future, sync::Arc};

use alloy_consensus::TxEip1559;
use alloy_core::primitives::{Address, Bytes, TxKind, U256};
use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    CompiledArtifact, ConfigError, NetworkContext,
    cancel::Cancellation,
    config::DeploySettings,
    credentials::{Credential, CredentialError, SignedTransaction},
    error::exit_code,
    gas::ReceiptObserver,
    records::{DeploymentKey, DeploymentRecord, DeploymentStatus, FailureCause, FailureKind},
    rpc::{ChainRpc, RpcError, TransactionReceipt},
    store::{ArtifactStore, StoreError},
};

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("node rejected the deployment of {key}: {source}")]
    Rejected {
        key: DeploymentKey,
        #[source]
        source: RpcError,
    },

    #[error("deployer {address} cannot pay for {key}: {message}")]
    InsufficientFunds {
        key: DeploymentKey,
        address: Address,
        message: String,
    },

    #[error("nonce conflict for {key} persisted after refetching the nonce: {message}")]
    NonceConflict { key: DeploymentKey, message: String },

    #[error("gave up on {key} after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: DeploymentKey,
        attempts: usize,
        #[source]
        source: RpcError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("deployment of {key} cancelled; the record is resumable")]
    Cancelled { key: DeploymentKey },
}

impl DeployError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => exit_code::CONFIGURATION,
            Self::Credential(_) => exit_code::CREDENTIAL,
            Self::RetriesExhausted { .. } => exit_code::TRANSIENT_EXHAUSTED,
            Self::Store(err) => err.exit_code(),
            Self::Cancelled { .. } => exit_code::CANCELLED,
            Self::Rejected { .. } | Self::InsufficientFunds { .. } | Self::NonceConflict { .. } => {
                exit_code::FAILURE
            }
        }
    }
}

enum Broadcast {
    Sent { signed: SignedTransaction, nonce: u64 },
    /// The transaction being replaced was mined in the meantime.
    PreviouslyMined(DeploymentRecord),
}

/// Deploys compiled artifacts to one network through `R`.
pub struct DeploymentOrchestrator<R> {
    rpc: R,
    store: Arc<ArtifactStore>,
    settings: DeploySettings,
    observers: Vec<Arc<dyn ReceiptObserver>>,
    cancel: Cancellation,
}

impl<R: ChainRpc> DeploymentOrchestrator<R> {
    pub fn new(rpc: R, store: Arc<ArtifactStore>, settings: DeploySettings) -> Self {
        Self {
            rpc,
            store,
            settings,
            observers: Vec::new(),
            cancel: Cancellation::never(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ReceiptObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Deploy `artifact` to `ctx`, or return the existing outcome for its key.
    ///
    /// On-chain failures are recorded on the returned record; only errors that occur
    /// before a record exists (configuration, credential, rejected broadcast) are
    /// returned as `Err`.
    pub async fn deploy(
        &self,
        ctx: &NetworkContext,
        credential: &Credential,
        artifact: &CompiledArtifact,
    ) -> Result<DeploymentRecord, DeployError> {
        let key = DeploymentKey::new(ctx.name(), &artifact.contract_name, artifact.bytecode_hash);
        let _guard = self.store.lock(&key).await;

        let previous = match self.store.get(&key)? {
            Some(entry) => match entry.deployment.status {
                DeploymentStatus::Confirmed => {
                    tracing::info!(
                        key = %key,
                        address = ?entry.deployment.address,
                        "Already deployed, nothing to do"
                    );
                    return Ok(entry.deployment);
                }
                DeploymentStatus::Pending => {
                    tracing::info!(
                        key = %key,
                        tx_hash = %entry.deployment.tx_hash,
                        "Resuming confirmation of a pending deployment"
                    );
                    return self.await_confirmation(ctx, entry.deployment).await;
                }
                DeploymentStatus::Failed => Some(entry.deployment),
            },
            None => None,
        };

        if self.cancel.is_cancelled() {
            return Err(DeployError::Cancelled { key });
        }

        self.check_chain_id(ctx, &key).await?;

        // A failure other than a revert says nothing about whether the earlier
        // transaction can still be mined. Settle that before sending another one.
        let replacing = match previous.as_ref() {
            Some(prev) if !prev.reverted() => {
                if self.receipt_of(&key, prev).await?.is_some() {
                    tracing::info!(
                        key = %key,
                        tx_hash = %prev.tx_hash,
                        "Transaction of the failed attempt was mined, resuming it"
                    );
                    return self.resume_failed(ctx, prev.clone()).await;
                }
                tracing::info!(
                    key = %key,
                    cause = ?prev.cause,
                    nonce = prev.nonce,
                    "Previous attempt was never mined, replacing its transaction"
                );
                (prev.deployer == credential.address()).then_some(prev)
            }
            Some(prev) => {
                tracing::info!(key = %key, cause = ?prev.cause, "Previous attempt reverted, deploying again");
                None
            }
            None => None,
        };

        let input = artifact.deployment_input();
        let (signed, nonce) = match self
            .broadcast(ctx, credential, &key, &input, replacing)
            .await?
        {
            Broadcast::Sent { signed, nonce } => (signed, nonce),
            Broadcast::PreviouslyMined(prev) => return self.resume_failed(ctx, prev).await,
        };

        let deployer = credential.address();
        let record = DeploymentRecord {
            network: key.network.clone(),
            contract: key.contract.clone(),
            bytecode_hash: key.bytecode_hash,
            deployer,
            address: Some(deployer.create(nonce)),
            tx_hash: signed.tx_hash,
            nonce,
            block_number: None,
            confirmations: 0,
            status: DeploymentStatus::Pending,
            cause: None,
            revision: previous.map_or(0, |p| p.revision),
            updated_at: 0,
        };
        let record = self.store.upsert_deployment(record)?;

        tracing::info!(
            key = %key,
            tx_hash = %record.tx_hash,
            nonce,
            deployer = %deployer,
            "Deployment transaction accepted"
        );

        self.await_confirmation(ctx, record).await
    }

    async fn check_chain_id(&self, ctx: &NetworkContext, key: &DeploymentKey) -> Result<(), DeployError> {
        let actual = self
            .retry(key, "eth_chainId", || self.rpc.chain_id())
            .await
            .map_err(|e| self.rpc_failure(key, Address::ZERO, e))?;

        if actual != ctx.chain_id() {
            return Err(ConfigError::ChainIdMismatch {
                network: ctx.name().to_string(),
                expected: ctx.chain_id(),
                actual,
            }
            .into());
        }

        Ok(())
    }

    /// Prepare, sign and send the creation transaction. A nonce conflict refetches
    /// the nonce exactly once.
    ///
    /// When `replacing` is set the transaction reuses its nonce, so at most one of the
    /// two can ever be mined. If that nonce turns out to be taken, the replaced
    /// transaction is checked once more before a fresh nonce is fetched.
    async fn broadcast(
        &self,
        ctx: &NetworkContext,
        credential: &Credential,
        key: &DeploymentKey,
        input: &Bytes,
        mut replacing: Option<&DeploymentRecord>,
    ) -> Result<Broadcast, DeployError> {
        let deployer = credential.address();
        let mut nonce_refetched = false;

        loop {
            let pinned = replacing.map(|prev| prev.nonce);
            let tx = self
                .retry(key, "prepare", || self.build_transaction(ctx, deployer, input, pinned))
                .await
                .map_err(|e| self.rpc_failure(key, deployer, e))?;
            let nonce = tx.nonce;
            let signed = credential.handle().sign(tx)?;

            tracing::debug!(key = %key, nonce, tx_hash = %signed.tx_hash, "Broadcasting deployment");

            match self
                .retry(key, "eth_sendRawTransaction", || self.send(&signed))
                .await
            {
                Ok(()) => return Ok(Broadcast::Sent { signed, nonce }),
                Err(RpcError::NonceConflict(message)) if !nonce_refetched => {
                    nonce_refetched = true;
                    if let Some(prev) = replacing.take() {
                        if self.receipt_of(key, prev).await?.is_some() {
                            return Ok(Broadcast::PreviouslyMined(prev.clone()));
                        }
                    }
                    tracing::warn!(key = %key, nonce, message, "Nonce conflict, refetching nonce");
                }
                Err(e) => return Err(self.rpc_failure(key, deployer, e)),
            }
        }
    }

    async fn build_transaction(
        &self,
        ctx: &NetworkContext,
        from: Address,
        input: &Bytes,
        pinned_nonce: Option<u64>,
    ) -> Result<TxEip1559, RpcError> {
        let nonce = match pinned_nonce {
            Some(nonce) => nonce,
            None => self.rpc.transaction_count(from).await?,
        };
        let gas_price = self.rpc.gas_price().await?;
        let priority_fee = self.rpc.max_priority_fee().await?;
        let estimate = self.rpc.estimate_gas(from, input).await?;

        let max_fee_per_gas = gas_price.saturating_mul(2).max(priority_fee);

        Ok(TxEip1559 {
            chain_id: ctx.chain_id(),
            nonce,
            gas_limit: estimate.saturating_mul(self.settings.gas_limit_percent) / 100,
            max_fee_per_gas,
            max_priority_fee_per_gas: priority_fee.min(max_fee_per_gas),
            to: TxKind::Create,
            value: U256::ZERO,
            input: input.clone(),
            ..Default::default()
        })
    }

    async fn send(&self, signed: &SignedTransaction) -> Result<(), RpcError> {
        match self.rpc.send_raw_transaction(&signed.raw).await {
            Ok(hash) => {
                if hash != signed.tx_hash {
                    tracing::warn!(expected = %signed.tx_hash, reported = %hash, "Node reported a different transaction hash");
                }
                Ok(())
            }
            // A retried send of a transaction the node already accepted.
            Err(RpcError::AlreadyKnown) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn retry<T, F, Fut>(
        &self,
        key: &DeploymentKey,
        operation: &'static str,
        call: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.settings.backoff_min())
            .with_max_delay(self.settings.backoff_max())
            .with_max_times(self.settings.max_broadcast_attempts.saturating_sub(1))
            .with_jitter();

        call.retry(backoff)
            .sleep(tokio::time::sleep)
            .when(RpcError::is_transient)
            .notify(|err, retry_in| {
                tracing::warn!(key = %key, operation, error = %err, ?retry_in, "Transient RPC error, retrying");
            })
            .await
    }

    fn rpc_failure(&self, key: &DeploymentKey, deployer: Address, err: RpcError) -> DeployError {
        let key = key.clone();
        match err {
            err if err.is_transient() => DeployError::RetriesExhausted {
                key,
                attempts: self.settings.max_broadcast_attempts.max(1),
                source: err,
            },
            RpcError::InsufficientFunds(message) => DeployError::InsufficientFunds {
                key,
                address: deployer,
                message,
            },
            RpcError::NonceConflict(message) => DeployError::NonceConflict { key, message },
            err => DeployError::Rejected { key, source: err },
        }
    }

    /// Poll until the transaction has the context's confirmation depth, reverts, or
    /// the wait is exhausted.
    async fn await_confirmation(
        &self,
        ctx: &NetworkContext,
        mut record: DeploymentRecord,
    ) -> Result<DeploymentRecord, DeployError> {
        let key = record.key();
        let deadline = Instant::now() + self.settings.confirmation_timeout();
        let mut consecutive_errors = 0usize;

        loop {
            match self.poll_receipt(&record).await {
                Ok(Some((receipt, head))) => {
                    consecutive_errors = 0;

                    if !receipt.status {
                        self.notify_observers(&record, &receipt);
                        record.block_number = Some(receipt.block_number);
                        return self.fail(
                            record,
                            FailureCause::new(
                                FailureKind::Reverted,
                                format!("transaction {} reverted", receipt.transaction_hash),
                            ),
                        );
                    }

                    let confirmations = head.saturating_sub(receipt.block_number) + 1;
                    if confirmations >= ctx.confirmations() {
                        self.notify_observers(&record, &receipt);

                        record.status = DeploymentStatus::Confirmed;
                        record.address = receipt.contract_address.or(record.address);
                        record.block_number = Some(receipt.block_number);
                        record.confirmations = confirmations;
                        let record = self.store.upsert_deployment(record)?;

                        tracing::info!(
                            key = %key,
                            address = ?record.address,
                            block = receipt.block_number,
                            confirmations,
                            "Deployment confirmed"
                        );
                        return Ok(record);
                    }

                    if record.block_number != Some(receipt.block_number) {
                        record.block_number = Some(receipt.block_number);
                        record.confirmations = confirmations;
                        record = self.store.upsert_deployment(record)?;
                    }

                    tracing::debug!(
                        key = %key,
                        confirmations,
                        required = ctx.confirmations(),
                        "Waiting for confirmations"
                    );
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    tracing::debug!(key = %key, tx_hash = %record.tx_hash, "Transaction not mined yet");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!(
                        key = %key,
                        error = %e,
                        consecutive_errors,
                        "Failed to poll deployment receipt"
                    );

                    if consecutive_errors >= self.settings.max_poll_errors.max(1) {
                        return self.fail(
                            record,
                            FailureCause::new(
                                FailureKind::RetriesExhausted,
                                format!("{consecutive_errors} consecutive polling errors, last: {e}"),
                            ),
                        );
                    }
                }
            }

            if Instant::now() >= deadline {
                return self.fail(
                    record,
                    FailureCause::new(
                        FailureKind::ConfirmationTimeout,
                        format!(
                            "not confirmed within {:?}",
                            self.settings.confirmation_timeout()
                        ),
                    ),
                );
            }

            if self.cancel.sleep(self.settings.poll_interval()).await.is_err() {
                tracing::warn!(key = %key, tx_hash = %record.tx_hash, "Cancelled while awaiting confirmation");
                return Err(DeployError::Cancelled { key });
            }
        }
    }

    async fn poll_receipt(
        &self,
        record: &DeploymentRecord,
    ) -> Result<Option<(TransactionReceipt, u64)>, RpcError> {
        let Some(receipt) = self.rpc.transaction_receipt(record.tx_hash).await? else {
            return Ok(None);
        };
        let head = self.rpc.block_number().await?;
        Ok(Some((receipt, head)))
    }

    fn notify_observers(&self, record: &DeploymentRecord, receipt: &TransactionReceipt) {
        for observer in &self.observers {
            observer.observe(&record.network, &record.contract, receipt);
        }
    }

    async fn receipt_of(
        &self,
        key: &DeploymentKey,
        record: &DeploymentRecord,
    ) -> Result<Option<TransactionReceipt>, DeployError> {
        self.retry(key, "eth_getTransactionReceipt", || {
            self.rpc.transaction_receipt(record.tx_hash)
        })
        .await
        .map_err(|e| self.rpc_failure(key, record.deployer, e))
    }

    /// Take a failed record back to `Pending` and follow its transaction again.
    async fn resume_failed(
        &self,
        ctx: &NetworkContext,
        mut record: DeploymentRecord,
    ) -> Result<DeploymentRecord, DeployError> {
        record.status = DeploymentStatus::Pending;
        record.cause = None;
        let record = self.store.upsert_deployment(record)?;
        self.await_confirmation(ctx, record).await
    }

    fn fail(
        &self,
        mut record: DeploymentRecord,
        cause: FailureCause,
    ) -> Result<DeploymentRecord, DeployError> {
        tracing::warn!(key = %record.key(), cause = %cause, "Deployment failed");

        record.status = DeploymentStatus::Failed;
        record.cause = Some(cause);
        Ok(self.store.upsert_deployment(record)?)
    }
}
