use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AEAD encryption failed")]
    AeadEncrypt,

    #[error("AEAD decryption failed (authentication tag mismatch)")]
    AeadDecrypt,

    #[error("key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("byte span is not an encrypted cell")]
    NotACell,

    #[error("encrypted cell is truncated")]
    TruncatedCell,

    #[error("handshake failed: {0}")]
    Handshake(String),
}
