//! Durable compare-and-set record store.
//!
//! Layout: `<root>/<network>/<contract>-<bytecode hash>.json`, one file per
//! [`DeploymentKey`]. Writes go through a temp file and a rename, under an exclusive
//! advisory lock on a sibling `.lock` file so separate processes serialize per key.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use alloy_core::primitives::B256;
use fs2::FileExt;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::{
    error::exit_code,
    records::{
        DeploymentKey, DeploymentRecord, StoreEntry, VerificationRecord, VerificationStatus,
    },
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: DeploymentKey,
        from: String,
        to: String,
    },

    #[error("stale write for {key}: expected revision {expected}, store has {found}")]
    Conflict {
        key: DeploymentKey,
        expected: u64,
        found: u64,
    },

    #[error("verification of {key} was already submitted by another run")]
    AlreadySubmitted { key: DeploymentKey },

    #[error("{key} has no confirmed deployment")]
    DeploymentNotConfirmed { key: DeploymentKey },

    #[error("store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt store record at {}: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidTransition { .. }
            | Self::Conflict { .. }
            | Self::AlreadySubmitted { .. }
            | Self::DeploymentNotConfirmed { .. } => exit_code::INVALID_TRANSITION,
            Self::Io { .. } | Self::Corrupt { .. } => exit_code::FAILURE,
        }
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The artifact store.
#[derive(Debug)]
pub struct ArtifactStore {
    root: PathBuf,
    key_locks: Mutex<HashMap<DeploymentKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl ArtifactStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_error(&root))?;

        tracing::debug!(root = %root.display(), "Opened artifact store");

        Ok(Self {
            root,
            key_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Take the in-process lock of `key`. Distinct keys never contend.
    pub async fn lock(&self, key: &DeploymentKey) -> OwnedMutexGuard<()> {
        let mutex = {
            let mut locks = self
                .key_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks.entry(key.clone()).or_default().clone()
        };
        mutex.lock_owned().await
    }

    pub fn get(&self, key: &DeploymentKey) -> Result<Option<StoreEntry>, StoreError> {
        read_entry(&self.record_path(key))
    }

    /// Compare-and-set write of a deployment record.
    pub fn upsert_deployment(
        &self,
        record: DeploymentRecord,
    ) -> Result<DeploymentRecord, StoreError> {
        let key = record.key();
        let _file_lock = self.lock_file(&key)?;

        let path = self.record_path(&key);
        let current = read_entry(&path)?;

        let found = current.as_ref().map_or(0, |e| e.deployment.revision);
        if record.revision != found {
            return Err(StoreError::Conflict {
                key,
                expected: record.revision,
                found,
            });
        }

        let from = current.as_ref().map(|e| e.deployment.status);
        if !record.status.can_follow(from) {
            return Err(StoreError::InvalidTransition {
                key,
                from: from.map_or_else(|| "none".to_string(), |s| s.to_string()),
                to: record.status.to_string(),
            });
        }

        let mut stored = record;
        stored.revision += 1;
        stored.updated_at = chrono::Utc::now().timestamp();

        let entry = StoreEntry {
            deployment: stored.clone(),
            verification: current.and_then(|e| e.verification),
        };
        write_entry(&path, &entry)?;

        tracing::debug!(
            key = %key,
            status = %stored.status,
            revision = stored.revision,
            "Stored deployment record"
        );

        Ok(stored)
    }

    /// Compare-and-set write of a verification record.
    ///
    /// A claim (a `Submitted` record without a guid) that finds the key already
    /// submitted, pending or verified fails with [`StoreError::AlreadySubmitted`].
    pub fn upsert_verification(
        &self,
        record: VerificationRecord,
    ) -> Result<VerificationRecord, StoreError> {
        let key = record.key();
        let _file_lock = self.lock_file(&key)?;

        let path = self.record_path(&key);
        let Some(mut entry) = read_entry(&path)?.filter(|e| e.deployment.is_confirmed()) else {
            return Err(StoreError::DeploymentNotConfirmed { key });
        };

        let current = entry.verification.as_ref();

        let is_claim =
            record.status == VerificationStatus::Submitted && record.explorer_guid.is_none();
        if is_claim
            && current.is_some_and(|c| {
                matches!(
                    c.status,
                    VerificationStatus::Submitted
                        | VerificationStatus::Pending
                        | VerificationStatus::Verified
                )
            })
        {
            return Err(StoreError::AlreadySubmitted { key });
        }

        let found = current.map_or(0, |c| c.revision);
        if record.revision != found {
            return Err(StoreError::Conflict {
                key,
                expected: record.revision,
                found,
            });
        }

        if !record.can_follow(current) {
            return Err(StoreError::InvalidTransition {
                key,
                from: current.map_or_else(|| "none".to_string(), |c| c.status.to_string()),
                to: record.status.to_string(),
            });
        }

        let mut stored = record;
        stored.revision += 1;
        stored.updated_at = chrono::Utc::now().timestamp();

        entry.verification = Some(stored.clone());
        write_entry(&path, &entry)?;

        tracing::debug!(
            key = %key,
            status = %stored.status,
            revision = stored.revision,
            "Stored verification record"
        );

        Ok(stored)
    }

    /// Renew a claim this caller last saw at `claim.revision`.
    ///
    /// The holder of a claim renews it before every submission attempt. A run that
    /// takes over an abandoned claim renews it too, so whichever of the two is behind
    /// gets [`StoreError::Conflict`] and stops.
    pub fn renew_claim(&self, claim: &VerificationRecord) -> Result<VerificationRecord, StoreError> {
        let key = claim.key();
        let _file_lock = self.lock_file(&key)?;

        let path = self.record_path(&key);
        let Some(mut entry) = read_entry(&path)?.filter(|e| e.deployment.is_confirmed()) else {
            return Err(StoreError::DeploymentNotConfirmed { key });
        };

        let Some(current) = entry.verification.as_mut() else {
            return Err(StoreError::Conflict {
                key,
                expected: claim.revision,
                found: 0,
            });
        };
        if current.revision != claim.revision {
            return Err(StoreError::Conflict {
                key,
                expected: claim.revision,
                found: current.revision,
            });
        }
        if current.status != VerificationStatus::Submitted || current.explorer_guid.is_some() {
            return Err(StoreError::InvalidTransition {
                key,
                from: current.status.to_string(),
                to: VerificationStatus::Submitted.to_string(),
            });
        }

        current.revision += 1;
        current.updated_at = chrono::Utc::now().timestamp();
        let renewed = current.clone();
        write_entry(&path, &entry)?;

        tracing::trace!(key = %key, revision = renewed.revision, "Renewed verification claim");
        Ok(renewed)
    }

    /// Find a verified record for the same bytecode on `network`.
    pub fn find_verified(
        &self,
        network: &str,
        bytecode_hash: B256,
    ) -> Result<Option<VerificationRecord>, StoreError> {
        Ok(self
            .list(Some(network))?
            .into_iter()
            .filter_map(|entry| entry.verification)
            .find(|v| v.bytecode_hash == bytecode_hash && v.status == VerificationStatus::Verified))
    }

    /// All entries, optionally restricted to one network, sorted by key.
    pub fn list(&self, network: Option<&str>) -> Result<Vec<StoreEntry>, StoreError> {
        let network_dirs = match network {
            Some(network) => vec![self.root.join(network)],
            None => {
                let mut dirs = Vec::new();
                for dir_entry in fs::read_dir(&self.root).map_err(io_error(&self.root))? {
                    let dir_entry = dir_entry.map_err(io_error(&self.root))?;
                    if dir_entry.path().is_dir() {
                        dirs.push(dir_entry.path());
                    }
                }
                dirs
            }
        };

        let mut entries = Vec::new();
        for dir in network_dirs {
            if !dir.exists() {
                continue;
            }
            for file in fs::read_dir(&dir).map_err(io_error(&dir))? {
                let path = file.map_err(io_error(&dir))?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(entry) = read_entry(&path)? {
                        entries.push(entry);
                    }
                }
            }
        }

        entries.sort_by(|a, b| a.deployment.key().cmp(&b.deployment.key()));
        Ok(entries)
    }

    fn record_path(&self, key: &DeploymentKey) -> PathBuf {
        self.root
            .join(&key.network)
            .join(format!("{}.json", key.file_stem()))
    }

    fn lock_file(&self, key: &DeploymentKey) -> Result<File, StoreError> {
        let dir = self.root.join(&key.network);
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;

        let path = dir.join(format!("{}.lock", key.file_stem()));
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(io_error(&path))?;
        file.lock_exclusive().map_err(io_error(&path))?;

        // Released when the file handle is dropped.
        Ok(file)
    }
}

fn read_entry(path: &Path) -> Result<Option<StoreEntry>, StoreError> {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };

    serde_json::from_slice(&content)
        .map(Some)
        .map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
}

fn write_entry(path: &Path, entry: &StoreEntry) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(entry).map_err(|source| StoreError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;

    let tmp = path.with_extension("json.tmp");
    let mut file = File::create(&tmp).map_err(io_error(&tmp))?;
    file.write_all(&content).map_err(io_error(&tmp))?;
    file.sync_all().map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))?;

    Ok(())
}
