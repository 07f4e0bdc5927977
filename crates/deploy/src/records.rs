//! Durable record types kept in the artifact store.

use std::fmt;

use alloy_core::primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Idempotency key of a deployment: one live deployment per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub network: String,
    pub contract: String,
    pub bytecode_hash: B256,
}

impl DeploymentKey {
    pub fn new(network: impl Into<String>, contract: impl Into<String>, bytecode_hash: B256) -> Self {
        Self {
            network: network.into(),
            contract: contract.into(),
            bytecode_hash,
        }
    }

    /// File stem of the record inside its network directory.
    pub fn file_stem(&self) -> String {
        format!("{}-{}", self.contract, hex::encode(self.bytecode_hash))
    }
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.network,
            self.contract,
            &hex::encode(self.bytecode_hash)[..8]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Confirmed,
    Failed,
}

impl DeploymentStatus {
    /// Whether the store accepts moving from `from` (`None` for a new record) to `self`.
    pub fn can_follow(self, from: Option<DeploymentStatus>) -> bool {
        use DeploymentStatus::*;
        matches!(
            (from, self),
            (None, Pending)
                | (Some(Pending), Pending | Confirmed | Failed)
                | (Some(Failed), Pending)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VerificationStatus {
    NotSubmitted,
    Submitted,
    Pending,
    Verified,
    Failed,
}

impl VerificationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }
}

/// Why a record ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    Reverted,
    ConfirmationTimeout,
    BytecodeMismatch,
    RetriesExhausted,
    ExplorerTimeout,
    ExplorerRejected,
}

impl FailureKind {
    /// Failures that may succeed when attempted again with identical inputs.
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::RetriesExhausted | Self::ExplorerTimeout)
    }

    /// Short human description, as printed by the CLI.
    pub fn describe(self) -> &'static str {
        match self {
            Self::Reverted => "transaction reverted",
            Self::ConfirmationTimeout => "confirmation timeout",
            Self::BytecodeMismatch => "bytecode mismatch",
            Self::RetriesExhausted => "retries exhausted",
            Self::ExplorerTimeout => "explorer timeout",
            Self::ExplorerRejected => "explorer rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureCause {
    pub kind: FailureKind,
    pub message: String,
}

impl FailureCause {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.describe())
        } else {
            write!(f, "{}: {}", self.kind.describe(), self.message)
        }
    }
}

/// Outcome of deploying one contract to one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub network: String,
    pub contract: String,
    pub bytecode_hash: B256,
    pub deployer: Address,
    /// Contract address, predicted at broadcast and taken from the receipt once confirmed.
    pub address: Option<Address>,
    pub tx_hash: B256,
    pub nonce: u64,
    pub block_number: Option<u64>,
    pub confirmations: u64,
    pub status: DeploymentStatus,
    pub cause: Option<FailureCause>,
    /// Compare-and-set token; bumped by every successful store write.
    pub revision: u64,
    /// Unix timestamp (seconds) of the last store write.
    pub updated_at: i64,
}

impl DeploymentRecord {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.network, &self.contract, self.bytecode_hash)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == DeploymentStatus::Confirmed
    }

    /// Whether the chain executed the transaction and reverted it.
    pub fn reverted(&self) -> bool {
        self.cause
            .as_ref()
            .is_some_and(|cause| cause.kind == FailureKind::Reverted)
    }
}

/// Verification progress of one deployment on its explorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub network: String,
    pub contract: String,
    pub bytecode_hash: B256,
    pub explorer_guid: Option<String>,
    pub status: VerificationStatus,
    /// Number of status polls performed.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub cause: Option<FailureCause>,
    pub revision: u64,
    pub updated_at: i64,
}

impl VerificationRecord {
    /// A fresh, never-stored record for `key`.
    pub fn new(key: &DeploymentKey) -> Self {
        Self {
            network: key.network.clone(),
            contract: key.contract.clone(),
            bytecode_hash: key.bytecode_hash,
            explorer_guid: None,
            status: VerificationStatus::NotSubmitted,
            attempts: 0,
            last_error: None,
            cause: None,
            revision: 0,
            updated_at: 0,
        }
    }

    pub fn key(&self) -> DeploymentKey {
        DeploymentKey::new(&self.network, &self.contract, self.bytecode_hash)
    }

    /// Mark as failed; `last_error` carries the short description, the cause keeps the
    /// explorer or network message.
    pub fn fail(&mut self, cause: FailureCause) {
        self.status = VerificationStatus::Failed;
        self.last_error = Some(cause.kind.describe().to_string());
        self.cause = Some(cause);
    }

    /// Whether the store accepts moving from `from` to this record.
    pub fn can_follow(&self, from: Option<&VerificationRecord>) -> bool {
        use VerificationStatus::*;
        let Some(from) = from else {
            return matches!(self.status, NotSubmitted | Submitted);
        };

        match (from.status, self.status) {
            (NotSubmitted, NotSubmitted | Submitted) => true,
            (Submitted, Submitted) => from.explorer_guid.is_none() && self.explorer_guid.is_some(),
            (Submitted, Pending | Verified | Failed) => true,
            (Pending, Pending | Verified | Failed) => true,
            (Failed, Submitted) => from.cause.as_ref().is_some_and(|c| c.kind.is_retriable()),
            _ => false,
        }
    }
}

/// Everything the store holds for one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreEntry {
    pub deployment: DeploymentRecord,
    pub verification: Option<VerificationRecord>,
}
