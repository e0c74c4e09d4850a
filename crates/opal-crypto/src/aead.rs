//! Authenticated encryption with associated data.
//!
//! XChaCha20-Poly1305 with a random 192-bit nonce.
//! Key: 32 bytes.  Nonce: 24 bytes.  Tag: 16 bytes.
//!
//! Wire format: `[ nonce (24) | ciphertext + tag ]`

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng, Payload},
    XChaCha20Poly1305, XNonce,
};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;

/// Everything the AEAD adds on top of the plaintext length.
pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Encrypt `plaintext` under a 32-byte key, prepending a random nonce.
/// `aad` is authenticated but not encrypted.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut AeadOsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (`nonce || ciphertext+tag`).
pub fn decrypt(key: &[u8; 32], data: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < OVERHEAD {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = XNonce::from_slice(nonce_bytes);

    let cipher = XChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ct, aad })
        .map_err(|_| CryptoError::AeadDecrypt)?;

    Ok(Zeroizing::new(plaintext))
}

/// Encrypt a 32-byte data key under a wrapping key (key transport).
pub fn wrap_key(wrapping: &[u8; 32], key: &[u8; 32], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
    encrypt(wrapping, key, aad)
}

/// Decrypt a wrapped 32-byte key.
pub fn unwrap_key(wrapping: &[u8; 32], wrapped: &[u8], aad: &[u8]) -> Result<[u8; 32], CryptoError> {
    let plaintext = decrypt(wrapping, wrapped, aad)?;
    if plaintext.len() != 32 {
        return Err(CryptoError::InvalidKey("unwrapped key wrong length".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&plaintext);
    Ok(out)
}
