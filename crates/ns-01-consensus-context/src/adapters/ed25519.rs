//! Ed25519 `Signer`/`Verifier` adapters.

use crate::domain::ContextError;
use crate::ports::{Signer, Verifier};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};
use shared_types::Signature;

/// Signs with a local Ed25519 key. Also verifies its own signatures.
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Create from secret seed (32 bytes).
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(&seed),
        }
    }

    /// Public half, for handing to a counterparty's verifier.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Verifier for this key.
    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier {
            key: self.signing_key.verifying_key(),
        }
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, preimage: &[u8]) -> Option<Signature> {
        Some(Signature::from_bytes(
            self.signing_key.sign(preimage).to_bytes(),
        ))
    }
}

impl Verifier for Ed25519Signer {
    fn verify(&self, preimage: &[u8], signature: &Signature) -> bool {
        self.verifier().verify(preimage, signature)
    }
}

/// Verifies signatures from a known Ed25519 public key.
#[derive(Clone)]
pub struct Ed25519Verifier {
    key: VerifyingKey,
}

impl Ed25519Verifier {
    /// Create from public key bytes. Rejects bytes that are not a curve point.
    pub fn from_public_key(bytes: [u8; 32]) -> Result<Self, ContextError> {
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| ContextError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }
}

impl Verifier for Ed25519Verifier {
    fn verify(&self, preimage: &[u8], signature: &Signature) -> bool {
        let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        self.key.verify(preimage, &signature).is_ok()
    }
}
