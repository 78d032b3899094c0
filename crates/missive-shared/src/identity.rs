use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::IdentityError;
use crate::types::PublicKey;

/// A node or ephemeral identity based on Ed25519.
/// The public key doubles as the peer address; the same key, mapped onto
/// Curve25519, is used for X25519 agreement.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// X25519 static secret matching [`x25519_public`] of this identity's public key.
    pub fn x25519_secret(&self) -> x25519_dalek::StaticSecret {
        x25519_dalek::StaticSecret::from(self.signing_key.to_scalar_bytes())
    }

    /// Derive a 32-byte seed for the libp2p transport keypair.
    pub fn derive_seed(&self, context: &str) -> [u8; 32] {
        blake3::derive_key(context, self.signing_key.as_bytes())
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public_key", &self.public_key().short())
            .finish_non_exhaustive()
    }
}

/// Map an Ed25519 public key onto its X25519 (Montgomery) form.
pub fn x25519_public(key: &PublicKey) -> Result<x25519_dalek::PublicKey, IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| IdentityError::InvalidKeyBytes)?;
    Ok(x25519_dalek::PublicKey::from(
        verifying_key.to_montgomery().to_bytes(),
    ))
}

/// Verify a detached signature against a public key
pub fn verify_signature(
    key: &PublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| IdentityError::InvalidKeyBytes)?;
    let signature =
        Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verifying_key
        .verify(message, &signature)
        .map_err(|_| IdentityError::InvalidSignature)
}
