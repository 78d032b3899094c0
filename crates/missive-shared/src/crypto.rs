use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;

use crate::constants::{KDF_CONTEXT_SHARED_SECRET, NONCE_SIZE};
use crate::error::{CryptoError, IdentityError};
use crate::identity::{x25519_public, Identity};
use crate::types::PublicKey;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Pairwise secret between `identity` and `peer`.
///
/// Both ends obtain the same key: the X25519 output is bound to both public
/// keys in sorted order.
pub fn agree(identity: &Identity, peer: &PublicKey) -> Result<SymmetricKey, IdentityError> {
    let dh = identity.x25519_secret().diffie_hellman(&x25519_public(peer)?);

    let own = identity.public_key();
    let (lo, hi) = if own <= *peer { (own, *peer) } else { (*peer, own) };

    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SHARED_SECRET);
    hasher.update(dh.as_bytes());
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    Ok(*hasher.finalize().as_bytes())
}
