//! Verification submitter: drives a confirmed deployment to a terminal verification
//! state on its block explorer.
//!
//! Only one run submits a given key. Runs race to store a `Submitted` claim; the
//! loser observes [`StoreError::AlreadySubmitted`], waits for the winner's guid and
//! polls that instead. The winner renews its claim before every submission attempt.
//! A claim left unrenewed for `verify.claim_wait` is taken over, and the takeover is
//! itself a renewal, so at most one run is ever submitting.

use std::sync::Arc;

use backon::{BackoffBuilder, ExponentialBuilder};
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::{
    NetworkContext,
    cancel::Cancellation,
    compiler::SourceMetadata,
    config::VerifySettings,
    credentials::{CredentialError, Secret},
    error::exit_code,
    explorer::{CheckStatus, ExplorerApi, ExplorerError, VerificationRequest},
    records::{
        DeploymentKey, DeploymentRecord, FailureCause, FailureKind, VerificationRecord,
        VerificationStatus,
    },
    store::{ArtifactStore, StoreError},
};

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("{key} is not deployed yet (status: {status})")]
    NotYetDeployed { key: DeploymentKey, status: String },

    #[error("network `{0}` has no block explorer to verify on")]
    ExplorerUnavailable(String),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("verification of {key} cancelled; the record is resumable")]
    Cancelled { key: DeploymentKey },

    #[error("verification of {key} is claimed by another run that has not submitted yet")]
    ClaimPending { key: DeploymentKey },
}

impl VerifyError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::NotYetDeployed { .. } | Self::ClaimPending { .. } => {
                exit_code::INVALID_TRANSITION
            }
            Self::ExplorerUnavailable(_) => exit_code::CONFIGURATION,
            Self::Credential(_) => exit_code::CREDENTIAL,
            Self::Store(err) => err.exit_code(),
            Self::Cancelled { .. } => exit_code::CANCELLED,
        }
    }
}

/// The explorer endpoint and API key of `ctx`.
pub fn explorer_route(ctx: &NetworkContext) -> Result<(&Url, &Secret), VerifyError> {
    let route = ctx
        .explorer()
        .ok_or_else(|| VerifyError::ExplorerUnavailable(ctx.name().to_string()))?;

    let api_key = route
        .api_key
        .as_ref()
        .ok_or_else(|| CredentialError::MissingCredential {
            network: ctx.name().to_string(),
            variable: route.api_key_ref.clone(),
        })?;

    Ok((&route.api_url, api_key))
}

/// Submits deployments of one network to its explorer through `E`.
pub struct VerificationSubmitter<E> {
    explorer: E,
    store: Arc<ArtifactStore>,
    settings: VerifySettings,
    cancel: Cancellation,
}

impl<E: ExplorerApi> VerificationSubmitter<E> {
    pub fn new(explorer: E, store: Arc<ArtifactStore>, settings: VerifySettings) -> Self {
        Self {
            explorer,
            store,
            settings,
            cancel: Cancellation::never(),
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    /// Verify `deployment`, or return its existing terminal verification.
    pub async fn verify(
        &self,
        ctx: &NetworkContext,
        deployment: &DeploymentRecord,
        metadata: &SourceMetadata,
    ) -> Result<VerificationRecord, VerifyError> {
        let key = deployment.key();
        if !deployment.is_confirmed() || deployment.address.is_none() {
            return Err(VerifyError::NotYetDeployed {
                key,
                status: deployment.status.to_string(),
            });
        }

        let existing = self.store.get(&key)?.and_then(|entry| entry.verification);
        if let Some(existing) = &existing {
            match existing.status {
                VerificationStatus::Verified => {
                    tracing::info!(key = %key, "Already verified, nothing to do");
                    return Ok(existing.clone());
                }
                VerificationStatus::Failed
                    if !existing.cause.as_ref().is_some_and(|c| c.kind.is_retriable()) =>
                {
                    tracing::info!(
                        key = %key,
                        cause = ?existing.cause,
                        "Verification failed permanently, not resubmitting"
                    );
                    return Ok(existing.clone());
                }
                VerificationStatus::Submitted | VerificationStatus::Pending
                    if existing.explorer_guid.is_some() =>
                {
                    tracing::info!(key = %key, guid = ?existing.explorer_guid, "Resuming verification polling");
                    return self.poll(existing.clone()).await;
                }
                VerificationStatus::Submitted => {
                    return self.follow_claim(ctx, deployment, metadata).await;
                }
                _ => {}
            }
        }

        let verified_elsewhere = self.store.find_verified(ctx.name(), key.bytecode_hash)?;
        if verified_elsewhere.is_none() {
            explorer_route(ctx)?;
        }

        let mut claim = existing.unwrap_or_else(|| VerificationRecord::new(&key));
        claim.status = VerificationStatus::Submitted;
        claim.explorer_guid = None;
        claim.last_error = None;
        claim.cause = None;

        let claimed = match self.store.upsert_verification(claim) {
            Ok(claimed) => claimed,
            Err(StoreError::AlreadySubmitted { .. } | StoreError::Conflict { .. }) => {
                tracing::info!(key = %key, "Verification claimed by another run, following it");
                return self.follow_claim(ctx, deployment, metadata).await;
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(other) = verified_elsewhere {
            tracing::info!(
                key = %key,
                verified_as = %other.key(),
                "Identical bytecode already verified, skipping explorer submission"
            );
            let mut record = claimed;
            record.status = VerificationStatus::Verified;
            record.explorer_guid = other.explorer_guid;
            return self.advance(record);
        }

        match self.submit_claimed(ctx, deployment, metadata, claimed).await? {
            Some(record) => Ok(record),
            None => self.follow_claim(ctx, deployment, metadata).await,
        }
    }

    /// Wait for the run holding the claim to attach its guid, then poll it.
    async fn follow_claim(
        &self,
        ctx: &NetworkContext,
        deployment: &DeploymentRecord,
        metadata: &SourceMetadata,
    ) -> Result<VerificationRecord, VerifyError> {
        let key = deployment.key();
        let deadline = Instant::now() + self.settings.claim_wait();
        // Last claim revision seen, and when it was first seen.
        let mut watched: Option<(u64, Instant)> = None;

        loop {
            let current = self.store.get(&key)?.and_then(|entry| entry.verification);

            match current {
                Some(current) if current.status.is_terminal() => return Ok(current),
                Some(current) if current.explorer_guid.is_some() => {
                    tracing::debug!(key = %key, guid = ?current.explorer_guid, "Polling the winning submission");
                    return self.poll(current).await;
                }
                Some(current) if current.status == VerificationStatus::Submitted => {
                    let since = match watched {
                        Some((revision, since)) if revision == current.revision => since,
                        _ => Instant::now(),
                    };
                    watched = Some((current.revision, since));

                    if since.elapsed() >= self.settings.claim_wait() {
                        tracing::warn!(
                            key = %key,
                            revision = current.revision,
                            claimed_at = current.updated_at,
                            "Claim was not renewed in time, taking it over"
                        );
                        if let Some(record) =
                            self.submit_claimed(ctx, deployment, metadata, current).await?
                        {
                            return Ok(record);
                        }
                        watched = None;
                    }
                }
                _ if Instant::now() >= deadline => {
                    return Err(VerifyError::ClaimPending { key });
                }
                _ => {}
            }

            if self.cancel.sleep(self.settings.poll_interval()).await.is_err() {
                return Err(VerifyError::Cancelled { key });
            }
        }
    }

    /// Submit the source for a claim this run believes it holds. Returns `None` when
    /// another run holds the claim after all.
    async fn submit_claimed(
        &self,
        ctx: &NetworkContext,
        deployment: &DeploymentRecord,
        metadata: &SourceMetadata,
        mut record: VerificationRecord,
    ) -> Result<Option<VerificationRecord>, VerifyError> {
        let key = record.key();
        explorer_route(ctx)?;

        let Some(address) = deployment.address else {
            return Err(VerifyError::NotYetDeployed {
                key,
                status: deployment.status.to_string(),
            });
        };

        let request = VerificationRequest {
            address,
            contract_name: metadata.qualified_name(&deployment.contract),
            compiler_version: metadata.compiler_version.clone(),
            standard_json_input: metadata.standard_json_input.clone(),
            constructor_args: metadata.constructor_args.clone(),
        };

        let mut delays = ExponentialBuilder::default()
            .with_min_delay(self.settings.poll_interval())
            .with_max_delay(self.settings.max_poll_interval())
            .with_max_times(self.settings.max_submit_attempts.saturating_sub(1))
            .with_jitter()
            .build();

        let submitted = loop {
            record = match self.store.renew_claim(&record) {
                Ok(renewed) => renewed,
                Err(StoreError::Conflict { .. } | StoreError::InvalidTransition { .. }) => {
                    tracing::info!(key = %key, "Claim is held by another run, following it");
                    return Ok(None);
                }
                Err(e) => return Err(e.into()),
            };

            let attempt = tokio::time::timeout(
                self.settings.submit_timeout(),
                self.explorer.submit(&request),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ExplorerError::Transport(format!(
                    "no answer within {:?}",
                    self.settings.submit_timeout()
                )))
            });

            match attempt {
                Err(err) if err.is_transient() => match delays.next() {
                    Some(retry_in) => {
                        tracing::warn!(key = %key, error = %err, ?retry_in, "Explorer submission failed, retrying");
                        if self.cancel.sleep(retry_in).await.is_err() {
                            return Err(VerifyError::Cancelled { key });
                        }
                    }
                    None => break Err(err),
                },
                other => break other,
            }
        };

        let guid = match submitted {
            Ok(guid) => guid,
            Err(ExplorerError::AlreadyVerified) => {
                tracing::info!(key = %key, "Explorer reports the source as already verified");
                record.status = VerificationStatus::Verified;
                return self.advance(record).map(Some);
            }
            Err(e) if e.is_transient() => {
                record.fail(FailureCause::new(FailureKind::RetriesExhausted, e.to_string()));
                return self.advance(record).map(Some);
            }
            Err(e) => {
                record.fail(FailureCause::new(FailureKind::ExplorerRejected, e.to_string()));
                return self.advance(record).map(Some);
            }
        };

        tracing::info!(key = %key, guid = %guid, "Source submitted for verification");

        record.explorer_guid = Some(guid);
        match self.store.upsert_verification(record) {
            Ok(record) => self.poll(record).await.map(Some),
            Err(err @ (StoreError::Conflict { .. } | StoreError::InvalidTransition { .. })) => {
                // Another run took the claim over in the meantime.
                let current = self.store.get(&key)?.and_then(|entry| entry.verification);
                match current {
                    Some(current) if current.status.is_terminal() => Ok(Some(current)),
                    Some(current) if current.explorer_guid.is_some() => {
                        self.poll(current).await.map(Some)
                    }
                    _ => Err(err.into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Poll the explorer for `record`'s guid until a terminal answer or the timeout.
    async fn poll(&self, mut record: VerificationRecord) -> Result<VerificationRecord, VerifyError> {
        let key = record.key();
        let Some(guid) = record.explorer_guid.clone() else {
            return Err(VerifyError::ClaimPending { key });
        };

        let deadline = Instant::now() + self.settings.timeout();
        let mut delays = ExponentialBuilder::default()
            .with_min_delay(self.settings.poll_interval())
            .with_max_delay(self.settings.max_poll_interval())
            .without_max_times()
            .build();
        let mut transient_errors = 0usize;

        loop {
            match self.explorer.check_status(&guid).await {
                Ok(CheckStatus::Verified) => {
                    tracing::info!(key = %key, guid = %guid, "Contract verified");
                    record.status = VerificationStatus::Verified;
                    record.last_error = None;
                    return self.advance(record);
                }
                Ok(CheckStatus::Mismatch(message)) => {
                    tracing::warn!(key = %key, message, "Explorer could not reproduce the bytecode");
                    record.fail(FailureCause::new(FailureKind::BytecodeMismatch, message));
                    return self.advance(record);
                }
                Ok(CheckStatus::Rejected(message)) => {
                    record.fail(FailureCause::new(FailureKind::ExplorerRejected, message));
                    return self.advance(record);
                }
                Ok(CheckStatus::Pending(message)) => {
                    transient_errors = 0;
                    tracing::debug!(key = %key, attempts = record.attempts + 1, message, "Verification pending");

                    record.status = VerificationStatus::Pending;
                    record.attempts += 1;
                    record.last_error = None;
                    record = self.advance(record)?;
                    if record.status.is_terminal() {
                        return Ok(record);
                    }
                }
                Err(e) if e.is_transient() => {
                    transient_errors += 1;
                    tracing::warn!(key = %key, error = %e, transient_errors, "Verification status poll failed");

                    if transient_errors >= self.settings.max_transient_errors.max(1) {
                        record.fail(FailureCause::new(FailureKind::RetriesExhausted, e.to_string()));
                        return self.advance(record);
                    }
                }
                Err(e) => {
                    record.fail(FailureCause::new(FailureKind::ExplorerRejected, e.to_string()));
                    return self.advance(record);
                }
            }

            if Instant::now() >= deadline {
                record.fail(FailureCause::new(
                    FailureKind::ExplorerTimeout,
                    format!("no verdict within {:?}", self.settings.timeout()),
                ));
                return self.advance(record);
            }

            let delay = delays
                .next()
                .unwrap_or_else(|| self.settings.max_poll_interval());
            if self.cancel.sleep(delay).await.is_err() {
                tracing::warn!(key = %key, guid = %guid, "Cancelled while polling verification status");
                return Err(VerifyError::Cancelled { key });
            }
        }
    }

    /// Store `record`. On a stale revision, another poller of the same guid wrote in
    /// between: a terminal record of theirs wins, otherwise ours is rebased.
    fn advance(&self, mut record: VerificationRecord) -> Result<VerificationRecord, VerifyError> {
        let key = record.key();

        loop {
            match self.store.upsert_verification(record.clone()) {
                Ok(stored) => return Ok(stored),
                Err(err @ StoreError::Conflict { .. }) => {
                    let Some(current) = self.store.get(&key)?.and_then(|entry| entry.verification)
                    else {
                        return Err(err.into());
                    };
                    if current.status.is_terminal() {
                        return Ok(current);
                    }
                    record.revision = current.revision;
                    record.attempts = record.attempts.max(current.attempts);
                    record.explorer_guid = record.explorer_guid.or(current.explorer_guid);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
