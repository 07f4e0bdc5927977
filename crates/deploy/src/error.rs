//! Error taxonomy shared by every component and the exit codes the CLI maps them to.

use thiserror::Error;

use crate::{
    CompilationError, DeployError, ForkError, StoreError, VerifyError, credentials::CredentialError,
    explorer::ExplorerError, records::FailureKind, rpc::RpcError,
};

/// Process exit codes, one per error class.
pub mod exit_code {
    /// A recorded failure that does not fit a more specific class.
    pub const FAILURE: u8 = 1;
    /// Unknown network, malformed endpoint, unreadable configuration.
    pub const CONFIGURATION: u8 = 2;
    /// Missing or malformed secret material.
    pub const CREDENTIAL: u8 = 3;
    /// Transient network errors that outlived their retry budget.
    pub const TRANSIENT_EXHAUSTED: u8 = 4;
    /// Reverted transaction or confirmation timeout.
    pub const ON_CHAIN_FAILURE: u8 = 5;
    /// The explorer recompiled the source and got different bytecode.
    pub const EXPLORER_MISMATCH: u8 = 6;
    /// State machine violation, usually a concurrent duplicate.
    pub const INVALID_TRANSITION: u8 = 7;
    /// The compiler collaborator could not produce an artifact.
    pub const COMPILATION: u8 = 8;
    /// The run was interrupted; the stored state is resumable.
    pub const CANCELLED: u8 = 130;
}

/// Configuration problems. Always fatal, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),

    #[error("network `{network}` has a malformed {field} `{value}`: {reason}")]
    MalformedEndpoint {
        network: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("network `{0}` does not declare a chain id")]
    MissingChainId(String),

    #[error("`{0}` is reserved for ephemeral forks; use `rehearse <upstream>` instead")]
    ForkRequiresUpstream(String),

    #[error("RPC endpoint of `{network}` reports chain id {actual}, configuration expects {expected}")]
    ChainIdMismatch {
        network: String,
        expected: u64,
        actual: u64,
    },

    #[error("constructor arguments for `{contract}` are not valid hex: {reason}")]
    ConstructorArgs { contract: String, reason: String },

    #[error("failed to load configuration: {0}")]
    Load(String),
}

/// Top-level error returned by the pipeline.
#[derive(Debug, Error)]
pub enum SlipwayError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Compilation(#[from] CompilationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Deployment(#[from] DeployError),

    #[error(transparent)]
    Verification(#[from] VerifyError),

    #[error(transparent)]
    Fork(#[from] ForkError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Explorer(#[from] ExplorerError),
}

impl SlipwayError {
    /// The exit code the CLI reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) => exit_code::CONFIGURATION,
            Self::Credential(_) => exit_code::CREDENTIAL,
            Self::Compilation(_) => exit_code::COMPILATION,
            Self::Store(err) => err.exit_code(),
            Self::Deployment(err) => err.exit_code(),
            Self::Verification(err) => err.exit_code(),
            Self::Fork(err) => err.exit_code(),
            Self::Rpc(err) if err.is_transient() => exit_code::TRANSIENT_EXHAUSTED,
            Self::Explorer(err) if err.is_transient() => exit_code::TRANSIENT_EXHAUSTED,
            Self::Rpc(_) | Self::Explorer(_) => exit_code::FAILURE,
        }
    }
}

impl FailureKind {
    /// The exit code for a record that terminated with this failure.
    pub fn exit_code(self) -> u8 {
        match self {
            FailureKind::Reverted | FailureKind::ConfirmationTimeout => exit_code::ON_CHAIN_FAILURE,
            FailureKind::BytecodeMismatch => exit_code::EXPLORER_MISMATCH,
            FailureKind::RetriesExhausted => exit_code::TRANSIENT_EXHAUSTED,
            FailureKind::ExplorerTimeout | FailureKind::ExplorerRejected => exit_code::FAILURE,
        }
    }
}
