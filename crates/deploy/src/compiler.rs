//! Compiler collaborator: loads compiled artifacts from Hardhat build output.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::primitives::{B256, Bytes, keccak256};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{ConfigError, SlipwayConfig};

#[derive(Debug, Error)]
pub enum CompilationError {
    #[error("compilation of `{contract}` failed:\n{diagnostics}")]
    Failed {
        contract: String,
        diagnostics: String,
    },

    #[error("no compiled artifact for contract `{contract}` under {}", dir.display())]
    NotFound { contract: String, dir: PathBuf },

    #[error("`{contract}` was compiled with solc {found}, configuration requires {expected}")]
    VersionMismatch {
        contract: String,
        expected: String,
        found: String,
    },

    #[error("malformed artifact {}: {reason}", path.display())]
    Malformed { path: PathBuf, reason: String },
}

/// Everything an explorer needs to reproduce the build.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMetadata {
    /// Full compiler version, e.g. `v0.8.23+commit.f704f362`.
    pub compiler_version: String,
    /// Fully qualified source name, e.g. `contracts/Token.sol`.
    pub source_name: String,
    pub standard_json_input: Value,
    /// ABI-encoded constructor arguments.
    pub constructor_args: Bytes,
}

impl SourceMetadata {
    /// Fully qualified name as explorers expect it (`contracts/Token.sol:Token`).
    pub fn qualified_name(&self, contract: &str) -> String {
        format!("{}:{contract}", self.source_name)
    }
}

/// Output of the compiler for one contract.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledArtifact {
    pub contract_name: String,
    pub bytecode: Bytes,
    /// `keccak256(bytecode)`.
    pub bytecode_hash: B256,
    pub abi: Value,
    pub source_metadata: SourceMetadata,
}

impl CompiledArtifact {
    pub fn new(
        contract_name: impl Into<String>,
        bytecode: Bytes,
        abi: Value,
        source_metadata: SourceMetadata,
    ) -> Self {
        Self {
            contract_name: contract_name.into(),
            bytecode_hash: keccak256(&bytecode),
            bytecode,
            abi,
            source_metadata,
        }
    }

    /// Creation transaction input: bytecode followed by the constructor arguments.
    pub fn deployment_input(&self) -> Bytes {
        let mut input = self.bytecode.to_vec();
        input.extend_from_slice(&self.source_metadata.constructor_args);
        input.into()
    }
}

/// Produces compiled artifacts by contract name.
pub trait Compiler: Send + Sync {
    fn compile(&self, contract: &str) -> Result<CompiledArtifact, CompilationError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HardhatArtifact {
    contract_name: String,
    source_name: String,
    abi: Value,
    bytecode: String,
    #[serde(default)]
    link_references: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DebugFile {
    build_info: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    solc_version: String,
    solc_long_version: String,
    input: Value,
    #[serde(default)]
    output: Value,
}

/// Reads `artifacts/**/<Name>.json`, its `.dbg.json` and the referenced build info.
#[derive(Debug, Clone)]
pub struct HardhatArtifacts {
    artifacts_dir: PathBuf,
    compiler_version: String,
    constructor_args: BTreeMap<String, Bytes>,
}

impl HardhatArtifacts {
    pub fn new(artifacts_dir: impl Into<PathBuf>, compiler_version: impl Into<String>) -> Self {
        Self {
            artifacts_dir: artifacts_dir.into(),
            compiler_version: compiler_version.into(),
            constructor_args: BTreeMap::new(),
        }
    }

    /// Build from configuration, decoding each contract's constructor arguments.
    pub fn from_config(config: &SlipwayConfig) -> Result<Self, ConfigError> {
        let mut loader = Self::new(&config.artifacts_dir, &config.compiler_version);

        for (contract, settings) in &config.contracts {
            if let Some(args) = &settings.constructor_args {
                let bytes = hex::decode(args.trim().trim_start_matches("0x")).map_err(|e| {
                    ConfigError::ConstructorArgs {
                        contract: contract.clone(),
                        reason: e.to_string(),
                    }
                })?;
                loader = loader.with_constructor_args(contract, bytes.into());
            }
        }

        Ok(loader)
    }

    pub fn with_constructor_args(mut self, contract: impl Into<String>, args: Bytes) -> Self {
        self.constructor_args.insert(contract.into(), args);
        self
    }

    fn find_artifact(&self, contract: &str) -> Result<PathBuf, CompilationError> {
        let file_name = format!("{contract}.json");
        find_file(&self.artifacts_dir, &file_name)
            .map_err(|e| CompilationError::Malformed {
                path: self.artifacts_dir.clone(),
                reason: e.to_string(),
            })?
            .ok_or_else(|| CompilationError::NotFound {
                contract: contract.to_string(),
                dir: self.artifacts_dir.clone(),
            })
    }
}

impl Compiler for HardhatArtifacts {
    fn compile(&self, contract: &str) -> Result<CompiledArtifact, CompilationError> {
        let artifact_path = self.find_artifact(contract)?;
        let artifact: HardhatArtifact = read_json(&artifact_path)?;

        let debug_path = artifact_path.with_extension("dbg.json");
        let debug: DebugFile = read_json(&debug_path)?;

        let build_info_path = debug_path
            .parent()
            .map(|dir| dir.join(&debug.build_info))
            .unwrap_or_else(|| PathBuf::from(&debug.build_info));
        let build_info: BuildInfo = read_json(&build_info_path)?;

        let diagnostics = error_diagnostics(&build_info.output);
        if !diagnostics.is_empty() {
            return Err(CompilationError::Failed {
                contract: contract.to_string(),
                diagnostics,
            });
        }

        if build_info.solc_version != self.compiler_version {
            return Err(CompilationError::VersionMismatch {
                contract: contract.to_string(),
                expected: self.compiler_version.clone(),
                found: build_info.solc_version,
            });
        }

        if !artifact.link_references.is_empty() {
            return Err(CompilationError::Malformed {
                path: artifact_path,
                reason: "bytecode has unlinked library references".to_string(),
            });
        }

        let bytecode = hex::decode(artifact.bytecode.trim_start_matches("0x")).map_err(|e| {
            CompilationError::Malformed {
                path: artifact_path.clone(),
                reason: format!("bytecode is not hex: {e}"),
            }
        })?;
        if bytecode.is_empty() {
            return Err(CompilationError::Malformed {
                path: artifact_path,
                reason: "empty bytecode (abstract contract or interface?)".to_string(),
            });
        }

        tracing::debug!(
            contract = %artifact.contract_name,
            source = %artifact.source_name,
            solc = %build_info.solc_long_version,
            "Loaded compiled artifact"
        );

        Ok(CompiledArtifact::new(
            artifact.contract_name,
            bytecode.into(),
            artifact.abi,
            SourceMetadata {
                compiler_version: format!("v{}", build_info.solc_long_version),
                source_name: artifact.source_name,
                standard_json_input: build_info.input,
                constructor_args: self
                    .constructor_args
                    .get(contract)
                    .cloned()
                    .unwrap_or_default(),
            },
        ))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CompilationError> {
    let malformed = |reason: String| CompilationError::Malformed {
        path: path.to_path_buf(),
        reason,
    };

    let content = std::fs::read(path).map_err(|e| malformed(e.to_string()))?;
    serde_json::from_slice(&content).map_err(|e| malformed(e.to_string()))
}

/// Collect `severity == "error"` entries of a solc standard JSON output.
fn error_diagnostics(output: &Value) -> String {
    output
        .get("errors")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|e| e.get("severity").and_then(Value::as_str) == Some("error"))
        .filter_map(|e| {
            e.get("formattedMessage")
                .or_else(|| e.get("message"))
                .and_then(Value::as_str)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Depth-first search for `file_name`, skipping the `build-info` directory.
fn find_file(dir: &Path, file_name: &str) -> std::io::Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let mut entries = std::fs::read_dir(dir)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();

    for path in entries {
        if path.is_dir() {
            if path.file_name().is_some_and(|name| name == "build-info") {
                continue;
            }
            if let Some(found) = find_file(&path, file_name)? {
                return Ok(Some(found));
            }
        } else if path.file_name().is_some_and(|name| name == file_name) {
            return Ok(Some(path));
        }
    }

    Ok(None)
}
