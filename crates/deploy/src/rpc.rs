//! Ethereum JSON-RPC client used by the orchestrator and the fork readiness check.

use std::{future::Future, time::Duration};

use alloy_core::primitives::{Address, B256, Bytes};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use url::Url;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between polling attempts when waiting for readiness.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Node error code used by several providers for rate limiting.
const LIMIT_EXCEEDED_CODE: i64 = -32005;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport error during {method}: {message}")]
    Transport { method: String, message: String },

    #[error("nonce conflict: {0}")]
    NonceConflict(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("transaction already known to the node")]
    AlreadyKnown,

    #[error("node rejected {method} (code {code}): {message}")]
    Node {
        method: String,
        code: i64,
        message: String,
    },

    #[error("failed to decode {method} result: {message}")]
    Decode { method: String, message: String },
}

impl RpcError {
    /// Errors worth retrying with identical inputs.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Node { code, message, .. } => {
                let message = message.to_lowercase();
                *code == LIMIT_EXCEEDED_CODE
                    || message.contains("rate limit")
                    || message.contains("too many requests")
                    || message.contains("timeout")
                    || message.contains("header not found")
            }
            _ => false,
        }
    }

    /// Reqwest errors must have their URL stripped first; node URLs often embed keys.
    fn transport(method: &str, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            method: method.to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a node-side JSON-RPC error to its class.
fn classify_node_error(method: &str, code: i64, message: &str) -> RpcError {
    let lower = message.to_lowercase();

    if lower.contains("nonce too low")
        || lower.contains("nonce too high")
        || lower.contains("replacement transaction underpriced")
    {
        RpcError::NonceConflict(message.to_string())
    } else if lower.contains("insufficient funds") {
        RpcError::InsufficientFunds(message.to_string())
    } else if lower.contains("already known") || lower.contains("known transaction") {
        RpcError::AlreadyKnown
    } else {
        RpcError::Node {
            method: method.to_string(),
            code,
            message: message.to_string(),
        }
    }
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client() -> Result<reqwest::Client, RpcError> {
    reqwest::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| RpcError::transport("client", e.without_url()))
}

/// Make a JSON-RPC call and deserialize the result.
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(|e| RpcError::transport(method, e.without_url()))?;

    let status = response.status();
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(RpcError::transport(method, format!("HTTP {status}")));
    }

    let result: Value = response
        .json()
        .await
        .map_err(|e| RpcError::transport(method, e.without_url()))?;

    if let Some(error) = result.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(classify_node_error(method, code, message));
    }

    let result_value = result.get("result").cloned().unwrap_or(Value::Null);

    serde_json::from_value(result_value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Wait for a service to be ready by repeatedly calling a check function.
pub async fn wait_until_ready<F, Fut>(
    name: &str,
    timeout: Duration,
    check_fn: F,
) -> Result<(), anyhow::Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<(), anyhow::Error>>,
{
    let start = std::time::Instant::now();

    loop {
        if start.elapsed() > timeout {
            anyhow::bail!("Timeout waiting for {} to be ready", name);
        }

        match check_fn().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                tracing::trace!(error = %e, service = %name, "Readiness check failed, retrying...");
            }
        }

        tokio::time::sleep(DEFAULT_POLL_INTERVAL).await;
    }
}

/// Deserialize a u64 from a hex quantity (with 0x prefix).
fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn deserialize_u128_from_hex<'de, D>(deserializer: D) -> Result<u128, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    u128::from_str_radix(s.trim_start_matches("0x"), 16).map_err(serde::de::Error::custom)
}

fn deserialize_status<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(deserialize_u64_from_hex(deserializer)? == 1)
}

/// The subset of `eth_getTransactionReceipt` the orchestrator consumes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub block_number: u64,
    /// `false` when the transaction reverted.
    #[serde(deserialize_with = "deserialize_status")]
    pub status: bool,
    pub contract_address: Option<Address>,
    #[serde(deserialize_with = "deserialize_u64_from_hex")]
    pub gas_used: u64,
    #[serde(deserialize_with = "deserialize_u128_from_hex", default)]
    pub effective_gas_price: u128,
}

/// The JSON-RPC calls the deployment pipeline depends on.
pub trait ChainRpc: Send + Sync {
    fn chain_id(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// Nonce of `address`, including pending transactions.
    fn transaction_count(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<u64, RpcError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, RpcError>> + Send;

    fn max_priority_fee(&self) -> impl Future<Output = Result<u128, RpcError>> + Send;

    /// Gas estimate of a contract creation from `from` with `input`.
    fn estimate_gas(
        &self,
        from: Address,
        input: &Bytes,
    ) -> impl Future<Output = Result<u64, RpcError>> + Send;

    /// Broadcast a signed transaction, returning its hash.
    fn send_raw_transaction(
        &self,
        raw: &Bytes,
    ) -> impl Future<Output = Result<B256, RpcError>> + Send;

    /// The receipt of `tx_hash`, or `None` while it is not mined.
    fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> impl Future<Output = Result<Option<TransactionReceipt>, RpcError>> + Send;
}

/// [`ChainRpc`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRpc {
    client: reqwest::Client,
    url: Url,
}

impl HttpRpc {
    pub fn new(url: Url) -> Result<Self, RpcError> {
        Ok(Self {
            client: create_client()?,
            url,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Vec<Value>) -> Result<T, RpcError> {
        tracing::trace!(method, url = %self.url, "JSON-RPC call");
        json_rpc_call(&self.client, self.url.as_str(), method, params).await
    }

    async fn quantity(&self, method: &str, params: Vec<Value>) -> Result<u128, RpcError> {
        let hex: String = self.call(method, params).await?;
        u128::from_str_radix(hex.trim_start_matches("0x"), 16).map_err(|e| RpcError::Decode {
            method: method.to_string(),
            message: e.to_string(),
        })
    }
}

fn to_u64(method: &str, value: u128) -> Result<u64, RpcError> {
    u64::try_from(value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        message: e.to_string(),
    })
}

impl ChainRpc for HttpRpc {
    async fn chain_id(&self) -> Result<u64, RpcError> {
        to_u64("eth_chainId", self.quantity("eth_chainId", vec![]).await?)
    }

    async fn block_number(&self) -> Result<u64, RpcError> {
        to_u64("eth_blockNumber", self.quantity("eth_blockNumber", vec![]).await?)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, RpcError> {
        let params = vec![serde_json::json!(address), serde_json::json!("pending")];
        to_u64(
            "eth_getTransactionCount",
            self.quantity("eth_getTransactionCount", params).await?,
        )
    }

    async fn gas_price(&self) -> Result<u128, RpcError> {
        self.quantity("eth_gasPrice", vec![]).await
    }

    async fn max_priority_fee(&self) -> Result<u128, RpcError> {
        self.quantity("eth_maxPriorityFeePerGas", vec![]).await
    }

    async fn estimate_gas(&self, from: Address, input: &Bytes) -> Result<u64, RpcError> {
        let params = vec![serde_json::json!({ "from": from, "data": input })];
        to_u64(
            "eth_estimateGas",
            self.quantity("eth_estimateGas", params).await?,
        )
    }

    async fn send_raw_transaction(&self, raw: &Bytes) -> Result<B256, RpcError> {
        self.call("eth_sendRawTransaction", vec![serde_json::json!(raw)])
            .await
    }

    async fn transaction_receipt(
        &self,
        tx_hash: B256,
    ) -> Result<Option<TransactionReceipt>, RpcError> {
        self.call("eth_getTransactionReceipt", vec![serde_json::json!(tx_hash)])
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_node_errors() {
        assert!(matches!(
            classify_node_error("eth_sendRawTransaction", -32000, "nonce too low: next nonce 5"),
            RpcError::NonceConflict(_)
        ));
        assert!(matches!(
            classify_node_error(
                "eth_sendRawTransaction",
                -32000,
                "insufficient funds for gas * price + value"
            ),
            RpcError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_node_error("eth_sendRawTransaction", -32000, "already known"),
            RpcError::AlreadyKnown
        ));

        let limited = classify_node_error("eth_blockNumber", -32005, "limit exceeded");
        assert!(limited.is_transient());

        let reverted = classify_node_error("eth_estimateGas", 3, "execution reverted");
        assert!(!reverted.is_transient());
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(RpcError::transport("eth_chainId", "connection refused").is_transient());
        assert!(!RpcError::InsufficientFunds("x".to_string()).is_transient());
    }

    #[tokio::test]
    async fn test_transport_errors_hide_the_endpoint() {
        let rpc = HttpRpc::new(Url::parse("http://127.0.0.1:1/v3/PROJECTKEY").unwrap()).unwrap();

        let err = rpc.chain_id().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!err.to_string().contains("PROJECTKEY"));
    }

    #[test]
    fn test_receipt_deserialization() {
        let json = serde_json::json!({
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0x10",
            "status": "0x1",
            "contractAddress": "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "logs": []
        });

        let receipt: TransactionReceipt = serde_json::from_value(json).unwrap();
        assert_eq!(receipt.block_number, 16);
        assert!(receipt.status);
        assert_eq!(receipt.gas_used, 21_000);
        assert_eq!(receipt.effective_gas_price, 1_000_000_000);
        assert!(receipt.contract_address.is_some());
    }

    #[test]
    fn test_reverted_receipt() {
        let json = serde_json::json!({
            "transactionHash": "0x2222222222222222222222222222222222222222222222222222222222222222",
            "blockNumber": "0x1",
            "status": "0x0",
            "contractAddress": null,
            "gasUsed": "0x1"
        });

        let receipt: TransactionReceipt = serde_json::from_value(json).unwrap();
        assert!(!receipt.status);
        assert_eq!(receipt.contract_address, None);
        assert_eq!(receipt.effective_gas_price, 0);
    }
}
