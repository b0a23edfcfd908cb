// Copyright (c) 2024 Botho Foundation

//! Local signing capability.
//!
//! The private key stays inside a [`KeypairSigner`]; the rest of the agent
//! only sees the [`Signer`] trait through a shared [`SignerHandle`].
//!
//! Security: key material read from text or files passes through
//! `Zeroizing` buffers, and the ed25519 signing key wipes itself on drop.

use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use fuego_core::{Identity, Signature};
use serde::Deserialize;
use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::sync::Mutex;
use zeroize::Zeroizing;

/// Environment variable holding a base58 keypair.
pub const ENV_KEYPAIR: &str = "FUEGO_KEYPAIR_BASE58";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("failed to read keypair from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("signer produced a signature that does not verify")]
    InvalidSignature,
}

/// Something that can sign message bytes for one identity.
#[async_trait]
pub trait Signer: Send + Sync {
    fn identity(&self) -> Identity;

    async fn sign(&self, message: &[u8]) -> Result<Signature, SignerError>;
}

/// An in-process ed25519 keypair.
pub struct KeypairSigner {
    key: SigningKey,
}

impl fmt::Debug for KeypairSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeypairSigner")
            .field("identity", &self.identity())
            .finish_non_exhaustive()
    }
}

/// Wallet file layout: either a bare byte array or an object with a
/// `privateKey` byte array.
#[derive(Deserialize)]
#[serde(untagged)]
enum KeypairFile {
    Bytes(Vec<u8>),
    Wallet {
        #[serde(rename = "privateKey")]
        private_key: Vec<u8>,
    },
}

impl KeypairSigner {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    /// Accepts a 32-byte seed or a 64-byte seed-plus-public-key keypair. The
    /// public half of a keypair must match the seed.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SignerError> {
        match bytes.len() {
            32 => {
                let mut seed = Zeroizing::new([0u8; 32]);
                seed.copy_from_slice(bytes);
                Ok(Self::from_seed(&seed))
            }
            64 => {
                let mut pair = Zeroizing::new([0u8; 64]);
                pair.copy_from_slice(bytes);
                let key = SigningKey::from_keypair_bytes(&pair)
                    .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
                Ok(Self { key })
            }
            n => Err(SignerError::InvalidKey(format!(
                "expected 32 or 64 key bytes, got {}",
                n
            ))),
        }
    }

    pub fn from_base58(text: &str) -> Result<Self, SignerError> {
        let bytes = Zeroizing::new(
            bs58::decode(text.trim())
                .into_vec()
                .map_err(|e| SignerError::InvalidKey(e.to_string()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Load a JSON wallet file.
    pub fn from_json_file(path: &Path) -> Result<Self, SignerError> {
        let contents =
            Zeroizing::new(std::fs::read_to_string(path).map_err(|source| SignerError::Io {
                path: path.to_path_buf(),
                source,
            })?);
        let parsed: KeypairFile = serde_json::from_str(&contents)
            .map_err(|e| SignerError::InvalidKey(format!("{}: {}", path.display(), e)))?;
        let bytes = Zeroizing::new(match parsed {
            KeypairFile::Bytes(bytes) => bytes,
            KeypairFile::Wallet { private_key } => private_key,
        });
        Self::from_bytes(&bytes)
    }

    /// Load from `FUEGO_KEYPAIR_BASE58` if it is set.
    pub fn from_env() -> Result<Option<Self>, SignerError> {
        match std::env::var(ENV_KEYPAIR) {
            Ok(value) if !value.trim().is_empty() => {
                let value = Zeroizing::new(value);
                Self::from_base58(&value).map(Some)
            }
            _ => Ok(None),
        }
    }
}

#[async_trait]
impl Signer for KeypairSigner {
    fn identity(&self) -> Identity {
        Identity::new(self.key.verifying_key().to_bytes())
    }

    async fn sign(&self, message: &[u8]) -> Result<Signature, SignerError> {
        Ok(Signature::new(self.key.sign(message).to_bytes()))
    }
}

/// Check `signature` over `message` for `identity`.
pub fn verify(identity: &Identity, message: &[u8], signature: &Signature) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(identity.as_bytes()) else {
        return false;
    };
    let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
    key.verify(message, &signature).is_ok()
}

/// Shared access to the agent's single signer.
///
/// Concurrent flows may all hold a handle; sign calls are serialized and the
/// lock is held only for the duration of one call.
#[derive(Clone)]
pub struct SignerHandle {
    identity: Identity,
    inner: Arc<Mutex<Box<dyn Signer>>>,
}

impl fmt::Debug for SignerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerHandle")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl SignerHandle {
    pub fn new<S: Signer + 'static>(signer: S) -> Self {
        Self {
            identity: signer.identity(),
            inner: Arc::new(Mutex::new(Box::new(signer))),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub async fn sign(&self, message: &[u8]) -> Result<Signature, SignerError> {
        let signer = self.inner.lock().await;
        signer.sign(message).await
    }
}
