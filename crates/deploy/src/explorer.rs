//! Etherscan-compatible verification API client.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, Bytes};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::credentials::Secret;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ExplorerError {
    #[error("explorer transport error: {0}")]
    Transport(String),

    #[error("explorer rate limit reached: {0}")]
    RateLimited(String),

    #[error("explorer has not indexed the contract yet: {0}")]
    NotIndexed(String),

    #[error("contract source code already verified")]
    AlreadyVerified,

    #[error("explorer rejected the request: {0}")]
    Rejected(String),

    #[error("unexpected explorer response: {0}")]
    Decode(String),
}

impl ExplorerError {
    /// Wrap a reqwest error. The URL is dropped since queries carry the API key.
    fn transport(e: reqwest::Error) -> Self {
        Self::Transport(e.without_url().to_string())
    }

    /// Errors worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited(_) | Self::NotIndexed(_) | Self::Decode(_)
        )
    }
}

/// A `verifysourcecode` submission.
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRequest {
    pub address: Address,
    /// Fully qualified contract name (`contracts/Token.sol:Token`).
    pub contract_name: String,
    pub compiler_version: String,
    pub standard_json_input: Value,
    pub constructor_args: Bytes,
}

/// Result of one `checkverifystatus` poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckStatus {
    Pending(String),
    Verified,
    /// The explorer compiled the source and got different bytecode.
    Mismatch(String),
    Rejected(String),
}

/// Map a status message returned by `checkverifystatus`.
pub fn classify_status(message: &str) -> Result<CheckStatus, ExplorerError> {
    let lower = message.to_lowercase();

    if lower.starts_with("pass - verified") || lower.starts_with("already verified") {
        Ok(CheckStatus::Verified)
    } else if lower.starts_with("pending") || lower.contains("in queue") {
        Ok(CheckStatus::Pending(message.to_string()))
    } else if lower.starts_with("fail - unable to verify") {
        Ok(CheckStatus::Mismatch(message.to_string()))
    } else if lower.contains("rate limit") {
        Err(ExplorerError::RateLimited(message.to_string()))
    } else {
        Ok(CheckStatus::Rejected(message.to_string()))
    }
}

/// Map an error `result` of `verifysourcecode`.
fn classify_submit_error(message: &str) -> ExplorerError {
    let lower = message.to_lowercase();

    if lower.contains("already verified") {
        ExplorerError::AlreadyVerified
    } else if lower.contains("rate limit") {
        ExplorerError::RateLimited(message.to_string())
    } else if lower.contains("unable to locate contractcode") {
        ExplorerError::NotIndexed(message.to_string())
    } else {
        ExplorerError::Rejected(message.to_string())
    }
}

/// The explorer operations the verification submitter drives.
pub trait ExplorerApi: Send + Sync {
    /// Submit source for verification, returning the explorer's guid.
    fn submit(
        &self,
        request: &VerificationRequest,
    ) -> impl Future<Output = Result<String, ExplorerError>> + Send;

    fn check_status(
        &self,
        guid: &str,
    ) -> impl Future<Output = Result<CheckStatus, ExplorerError>> + Send;
}

#[derive(Debug, Serialize, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: Value,
}

impl EtherscanResponse {
    fn result_text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Etherscan API client for source verification.
#[derive(Debug, Clone)]
pub struct EtherscanClient {
    api_url: Url,
    api_key: Secret,
    chain_id: u64,
    client: reqwest::Client,
}

impl EtherscanClient {
    pub fn new(api_url: Url, api_key: Secret, chain_id: u64) -> Result<Self, ExplorerError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(ExplorerError::transport)?;

        Ok(Self {
            api_url,
            api_key,
            chain_id,
            client,
        })
    }

    async fn read_response(response: reqwest::Response) -> Result<EtherscanResponse, ExplorerError> {
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ExplorerError::RateLimited(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ExplorerError::Transport(format!(
                "Etherscan API request failed: {status}"
            )));
        }

        let text = response
            .text()
            .await
            .map_err(ExplorerError::transport)?;

        serde_json::from_str(&text).map_err(|_| ExplorerError::Decode(text))
    }
}

impl ExplorerApi for EtherscanClient {
    async fn submit(&self, request: &VerificationRequest) -> Result<String, ExplorerError> {
        let source = request.standard_json_input.to_string();
        let address = request.address.to_string();
        let chain_id = self.chain_id.to_string();
        let constructor_args = hex::encode(&request.constructor_args);

        let form = [
            ("apikey", self.api_key.expose()),
            ("chainid", chain_id.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", source.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", request.contract_name.as_str()),
            ("compilerversion", request.compiler_version.as_str()),
            // Misspelling is part of the Etherscan API.
            ("constructorArguements", constructor_args.as_str()),
        ];

        tracing::debug!(
            api = %self.api_url,
            address = %request.address,
            contract = %request.contract_name,
            "Submitting source for verification"
        );

        let response = self
            .client
            .post(self.api_url.clone())
            .form(&form)
            .send()
            .await
            .map_err(ExplorerError::transport)?;

        let body = Self::read_response(response).await?;
        if body.status != "1" {
            return Err(classify_submit_error(&body.result_text()));
        }

        Ok(body.result_text())
    }

    async fn check_status(&self, guid: &str) -> Result<CheckStatus, ExplorerError> {
        let chain_id = self.chain_id.to_string();

        let response = self
            .client
            .get(self.api_url.clone())
            .query(&[
                ("apikey", self.api_key.expose()),
                ("chainid", chain_id.as_str()),
                ("module", "contract"),
                ("action", "checkverifystatus"),
                ("guid", guid),
            ])
            .send()
            .await
            .map_err(ExplorerError::transport)?;

        let body = Self::read_response(response).await?;
        tracing::trace!(guid, status = %body.status, message = %body.message, "Verification status");

        classify_status(&body.result_text())
    }
}
