//! slipway-deploy - Contract deployment and verification library.
//!
//! This crate turns "deploy contract C to network N and verify it on explorer E" into
//! an idempotent, resumable operation. Outcomes are recorded in a durable
//! [`ArtifactStore`] keyed by network, contract name and bytecode hash, so re-running
//! a command never broadcasts a deployment twice nor resubmits a settled verification.

pub mod bindings;
pub mod cancel;
pub mod compiler;
pub mod config;
pub mod credentials;
pub mod deploy;
pub mod docker;
pub mod error;
pub mod explorer;
pub mod fork;
pub mod gas;
pub mod network;
pub mod pipeline;
pub mod records;
pub mod rpc;
pub mod services;
pub mod store;
pub mod verify;

pub use cancel::{CancelHandle, Cancellation, Cancelled};
pub use compiler::{CompilationError, CompiledArtifact, Compiler, HardhatArtifacts, SourceMetadata};
pub use config::{CONFIG_FILENAME, SlipwayConfig};
pub use credentials::{Credential, CredentialError, CredentialProvider, EnvSecrets, MapSecrets};
pub use deploy::{DeployError, DeploymentOrchestrator};
pub use error::{ConfigError, SlipwayError, exit_code};
pub use explorer::{EtherscanClient, ExplorerApi};
pub use fork::{ForkBackend, ForkError, ForkInstance, ForkRehearsalController};
pub use network::{FORK_NETWORK, NetworkContext, NetworkRegistry};
pub use pipeline::{Connector, HttpConnector, Pipeline, RehearsalReport, RehearsalVerification};
pub use records::{
    DeploymentKey, DeploymentRecord, DeploymentStatus, FailureCause, FailureKind, StoreEntry,
    VerificationRecord, VerificationStatus,
};
pub use rpc::{ChainRpc, HttpRpc};
pub use services::anvil::AnvilForkBackend;
pub use store::{ArtifactStore, StoreError};
pub use verify::{VerificationSubmitter, VerifyError};
