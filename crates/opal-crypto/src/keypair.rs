//! X25519 keypairs used for cell encryption and transport authentication.

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

/// An X25519 keypair. The secret half zeroizes itself on drop.
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    /// Generate a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Reconstruct a keypair from 32 raw secret bytes (keystore format).
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let raw: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32-byte X25519 secret".into()))?;
        let secret = StaticSecret::from(raw);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

/// Parse 32 raw bytes into an X25519 public key.
pub fn public_from_bytes(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    let raw: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("expected 32-byte X25519 public key".into()))?;
    Ok(PublicKey::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_roundtrip() {
        let pair = KeyPair::generate();
        let restored = KeyPair::from_secret_bytes(&pair.secret_bytes()).unwrap();
        assert_eq!(pair.public_bytes(), restored.public_bytes());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(KeyPair::from_secret_bytes(&[0u8; 31]).is_err());
        assert!(public_from_bytes(&[0u8; 33]).is_err());
    }
}
