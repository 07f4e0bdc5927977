//! Credential provider: turns a secret reference into a chain-bound signing handle.
//!
//! Raw key material only ever lives inside [`SigningHandle`] and [`Secret`], both of
//! which redact themselves in `Debug` and `Display` output.

use std::{collections::HashMap, fmt, sync::Arc};

use alloy_consensus::{SignableTransaction, TxEip1559, TxEnvelope};
use alloy_core::primitives::{Address, B256, Bytes};
use alloy_eips::eip2718::Encodable2718;
use alloy_signer::SignerSync;
use alloy_signer_local::PrivateKeySigner;
use thiserror::Error;

use crate::NetworkContext;

/// Private key of Anvil's first pre-funded development account.
///
/// Publicly known; only ever used against ephemeral forks.
const ANVIL_TEST_PRIVATE_KEY: &str =
    "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no credential for network `{network}`: environment variable `{variable}` is not set")]
    MissingCredential { network: String, variable: String },

    #[error("credential for network `{network}` is malformed: {reason}")]
    InvalidCredentialFormat { network: String, reason: String },

    #[error("the fork test key cannot be used on live network `{0}`")]
    ForkKeyOnLiveNetwork(String),

    #[error("signing handle is bound to chain {bound}, refusing to sign for chain {requested}")]
    ChainMismatch { bound: u64, requested: u64 },

    #[error("failed to sign transaction: {0}")]
    Signing(String),
}

/// A secret value. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub(crate) fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Where secrets come from.
pub trait SecretSource: Send + Sync {
    /// Look up the secret stored under `name`.
    fn secret(&self, name: &str) -> Option<Secret>;
}

/// Reads secrets from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn secret(&self, name: &str) -> Option<Secret> {
        std::env::var(name)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(Secret::new)
    }
}

/// In-memory secrets, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapSecrets(Arc<HashMap<String, String>>);

impl MapSecrets {
    pub fn new<K, V>(entries: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self(Arc::new(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }
}

impl SecretSource for MapSecrets {
    fn secret(&self, name: &str) -> Option<Secret> {
        self.0.get(name).cloned().map(Secret::new)
    }
}

/// A signed transaction ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransaction {
    pub tx_hash: B256,
    pub raw: Bytes,
}

/// Opaque signing capability bound to a single chain.
pub struct SigningHandle {
    signer: PrivateKeySigner,
    chain_id: u64,
}

impl SigningHandle {
    fn new(signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self { signer, chain_id }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign an EIP-1559 transaction. The transaction must target the bound chain.
    pub fn sign(&self, tx: TxEip1559) -> Result<SignedTransaction, CredentialError> {
        if tx.chain_id != self.chain_id {
            return Err(CredentialError::ChainMismatch {
                bound: self.chain_id,
                requested: tx.chain_id,
            });
        }

        let signature = self
            .signer
            .sign_hash_sync(&tx.signature_hash())
            .map_err(|e| CredentialError::Signing(e.to_string()))?;

        let signed = tx.into_signed(signature);
        let tx_hash = *signed.hash();
        let raw = TxEnvelope::from(signed).encoded_2718();

        Ok(SignedTransaction {
            tx_hash,
            raw: raw.into(),
        })
    }
}

impl fmt::Debug for SigningHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningHandle")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Signing material for one network, alive for the duration of a run.
#[derive(Debug)]
pub struct Credential {
    handle: SigningHandle,
}

impl Credential {
    pub fn address(&self) -> Address {
        self.handle.address()
    }

    pub fn handle(&self) -> &SigningHandle {
        &self.handle
    }
}

/// Produces credentials for resolved networks.
#[derive(Debug, Clone)]
pub struct CredentialProvider<S> {
    secrets: S,
    allow_fork_test_key: bool,
}

impl<S: SecretSource> CredentialProvider<S> {
    pub fn new(secrets: S) -> Self {
        Self {
            secrets,
            allow_fork_test_key: false,
        }
    }

    /// Substitute Anvil's pre-funded test account on ephemeral forks.
    pub fn allow_fork_test_key(mut self, allow: bool) -> Self {
        self.allow_fork_test_key = allow;
        self
    }

    /// Build the credential for `ctx`.
    ///
    /// On a fork, and only when the substitution was enabled, this returns
    /// [`Self::fork_test_credential`]; otherwise the key is read from the secret the
    /// network references.
    pub fn credential_for(&self, ctx: &NetworkContext) -> Result<Credential, CredentialError> {
        if ctx.is_ephemeral_fork() && self.allow_fork_test_key {
            return self.fork_test_credential(ctx);
        }

        let variable = ctx.credential_ref();
        let secret =
            self.secrets
                .secret(variable)
                .ok_or_else(|| CredentialError::MissingCredential {
                    network: ctx.name().to_string(),
                    variable: variable.to_string(),
                })?;

        let signer = parse_private_key(ctx.name(), secret.expose())?;

        tracing::debug!(
            network = %ctx.name(),
            chain_id = ctx.chain_id(),
            address = %signer.address(),
            "Loaded deployer credential"
        );

        Ok(Credential {
            handle: SigningHandle::new(signer, ctx.chain_id()),
        })
    }

    /// The deterministic pre-funded test credential. Refused outside of forks.
    pub fn fork_test_credential(&self, ctx: &NetworkContext) -> Result<Credential, CredentialError> {
        if !ctx.is_ephemeral_fork() {
            return Err(CredentialError::ForkKeyOnLiveNetwork(ctx.name().to_string()));
        }

        let signer = parse_private_key(ctx.name(), ANVIL_TEST_PRIVATE_KEY)?;

        tracing::warn!(
            network = %ctx.name(),
            address = %signer.address(),
            "Using the pre-funded Anvil test account on the fork"
        );

        Ok(Credential {
            handle: SigningHandle::new(signer, ctx.chain_id()),
        })
    }
}

fn parse_private_key(network: &str, value: &str) -> Result<PrivateKeySigner, CredentialError> {
    let invalid = |reason: String| CredentialError::InvalidCredentialFormat {
        network: network.to_string(),
        reason,
    };

    let value = value.trim();
    let hex_key = value.strip_prefix("0x").unwrap_or(value);

    let bytes = hex::decode(hex_key).map_err(|_| invalid("not a hex string".to_string()))?;
    if bytes.len() != 32 {
        return Err(invalid(format!(
            "expected 32 bytes, got {}",
            bytes.len()
        )));
    }

    PrivateKeySigner::from_bytes(&B256::from_slice(&bytes))
        .map_err(|_| invalid("not a valid secp256k1 private key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NetworkRegistry, SlipwayConfig};
    use alloy_core::primitives::{TxKind, U256, address};
    use url::Url;

    const KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn registry(secrets: MapSecrets) -> NetworkRegistry<MapSecrets> {
        NetworkRegistry::new(&SlipwayConfig::default(), secrets)
    }

    fn fork_context() -> NetworkContext {
        registry(MapSecrets::default())
            .resolve_fork("mainnet", Url::parse("http://127.0.0.1:8545/").unwrap())
            .unwrap()
    }

    #[test]
    fn test_credential_from_environment_reference() {
        let secrets = MapSecrets::new([("PRIVATE_KEY", KEY)]);
        let ctx = registry(secrets.clone()).resolve("sepolia").unwrap();

        let credential = CredentialProvider::new(secrets)
            .credential_for(&ctx)
            .expect("credential");

        assert_eq!(
            credential.address(),
            address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8")
        );
        assert_eq!(credential.handle().chain_id(), 11155111);
    }

    #[test]
    fn test_missing_credential() {
        let ctx = registry(MapSecrets::default()).resolve("sepolia").unwrap();
        let result = CredentialProvider::new(MapSecrets::default()).credential_for(&ctx);

        assert!(matches!(
            result,
            Err(CredentialError::MissingCredential { ref variable, .. }) if variable == "PRIVATE_KEY"
        ));
    }

    #[test]
    fn test_invalid_credential_format() {
        for bad in ["not-hex", "0x1234", ""] {
            let secrets = MapSecrets::new([("PRIVATE_KEY", bad)]);
            let ctx = registry(secrets.clone()).resolve("sepolia").unwrap();
            let result = CredentialProvider::new(secrets).credential_for(&ctx);

            assert!(
                matches!(result, Err(CredentialError::InvalidCredentialFormat { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_fork_key_refused_on_live_network() {
        let ctx = registry(MapSecrets::default()).resolve("mainnet").unwrap();
        let provider = CredentialProvider::new(MapSecrets::default()).allow_fork_test_key(true);

        assert!(matches!(
            provider.fork_test_credential(&ctx),
            Err(CredentialError::ForkKeyOnLiveNetwork(_))
        ));
        // The substitution flag alone never applies to a live network.
        assert!(matches!(
            provider.credential_for(&ctx),
            Err(CredentialError::MissingCredential { .. })
        ));
    }

    #[test]
    fn test_fork_substitution_is_opt_in() {
        let ctx = fork_context();

        let without = CredentialProvider::new(MapSecrets::default()).credential_for(&ctx);
        assert!(matches!(
            without,
            Err(CredentialError::MissingCredential { .. })
        ));

        let with = CredentialProvider::new(MapSecrets::default())
            .allow_fork_test_key(true)
            .credential_for(&ctx)
            .expect("fork credential");
        assert_eq!(
            with.address(),
            address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266")
        );
    }

    #[test]
    fn test_handle_refuses_other_chains() {
        let secrets = MapSecrets::new([("PRIVATE_KEY", KEY)]);
        let ctx = registry(secrets.clone()).resolve("sepolia").unwrap();
        let credential = CredentialProvider::new(secrets).credential_for(&ctx).unwrap();

        let tx = TxEip1559 {
            chain_id: 1,
            to: TxKind::Create,
            value: U256::ZERO,
            ..Default::default()
        };

        assert!(matches!(
            credential.handle().sign(tx),
            Err(CredentialError::ChainMismatch {
                bound: 11155111,
                requested: 1
            })
        ));
    }

    #[test]
    fn test_signing_produces_typed_envelope() {
        let secrets = MapSecrets::new([("PRIVATE_KEY", KEY)]);
        let ctx = registry(secrets.clone()).resolve("sepolia").unwrap();
        let credential = CredentialProvider::new(secrets).credential_for(&ctx).unwrap();

        let tx = TxEip1559 {
            chain_id: 11155111,
            nonce: 7,
            gas_limit: 100_000,
            max_fee_per_gas: 2_000_000_000,
            max_priority_fee_per_gas: 1_000_000_000,
            to: TxKind::Create,
            input: Bytes::from_static(&[0x60, 0x80]),
            ..Default::default()
        };

        let signed = credential.handle().sign(tx).expect("signed");
        assert_eq!(signed.raw[0], 0x02, "EIP-1559 envelope type");
        assert_eq!(
            signed.tx_hash,
            alloy_core::primitives::keccak256(&signed.raw)
        );
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let secrets = MapSecrets::new([("PRIVATE_KEY", KEY)]);
        let ctx = registry(secrets.clone()).resolve("sepolia").unwrap();
        let credential = CredentialProvider::new(secrets).credential_for(&ctx).unwrap();

        let rendered = format!("{credential:?}");
        assert!(!rendered.contains(&KEY[2..]));
        assert!(rendered.contains("<redacted>"));
        assert_eq!(format!("{:?}", Secret::new(KEY)), "Secret(<redacted>)");
    }
}
