//! Pluggable signing capability for the replication subsystem.
//!
//! Implementations never expose private key material and degrade to `None`
//! rather than erroring when no backend is available — callers are expected
//! to fall back to unsigned envelopes only where the protocol explicitly
//! allows it.

use base64::{engine::general_purpose::STANDARD, Engine};
use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("failed to read or write key material: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed key material: {0}")]
    Malformed(String),
}

/// Capability handle that produces signatures and exposes a node's public key.
/// How a concrete implementation obtains key material is out of scope; callers
/// only see this trait.
pub trait Signer: Send + Sync {
    fn public_key_b64(&self) -> Option<String>;
    fn sign(&self, bytes: &[u8]) -> Option<Vec<u8>>;
}

/// File-backed Ed25519 signer: generates a key on first use and persists it
/// under a fixed path, the local stand-in for the privileged hidden-service
/// key backend that this spec treats as an external collaborator.
pub struct Ed25519Signer {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Load a key from `path`, generating and persisting a fresh one if absent.
    pub fn load_or_generate(path: &Path) -> Result<Self, SignerError> {
        if let Ok(bytes) = std::fs::read(path) {
            let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                SignerError::Malformed(format!("key file at {path:?} is not 32 bytes"))
            })?;
            let signing_key = SigningKey::from_bytes(&arr);
            let verifying_key = signing_key.verifying_key();
            tracing::debug!(path = %path.display(), "loaded signer key from disk");
            return Ok(Self {
                signing_key,
                verifying_key,
            });
        }
        let signer = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, signer.signing_key.to_bytes())?;
        tracing::info!(path = %path.display(), "generated new signer key");
        Ok(signer)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.verifying_key
    }
}

impl Signer for Ed25519Signer {
    fn public_key_b64(&self) -> Option<String> {
        Some(STANDARD.encode(self.verifying_key.to_bytes()))
    }

    fn sign(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let sig: Signature = self.signing_key.sign(bytes);
        Some(sig.to_bytes().to_vec())
    }
}

/// Signer with no key material available. Used when no signing backend is
/// attached; both methods always return `None`.
#[derive(Default)]
pub struct NoSigner;

impl Signer for NoSigner {
    fn public_key_b64(&self) -> Option<String> {
        None
    }

    fn sign(&self, _bytes: &[u8]) -> Option<Vec<u8>> {
        None
    }
}

/// Verify a detached signature over `bytes` against a base64-encoded Ed25519
/// public key and base64-encoded signature. Returns `false` on any malformed
/// input rather than erroring — verification failure at the bus boundary is
/// always a silent drop.
pub fn verify_detached(bytes: &[u8], public_key_b64: &str, signature_b64: &str) -> bool {
    let Ok(pk_bytes) = STANDARD.decode(public_key_b64) else {
        return false;
    };
    let Ok(pk_arr): Result<[u8; 32], _> = pk_bytes.as_slice().try_into() else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_arr) else {
        return false;
    };
    let Ok(sig_bytes) = STANDARD.decode(signature_b64) else {
        return false;
    };
    let Ok(sig_arr): Result<[u8; 64], _> = sig_bytes.as_slice().try_into() else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_arr);
    use signature::Verifier;
    verifying_key.verify(bytes, &signature).is_ok()
}
