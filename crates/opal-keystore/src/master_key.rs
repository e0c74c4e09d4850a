//! Master key loading.
//!
//! The 32-byte master key arrives base64-encoded in `ACRA_MASTER_KEY`.
//! Any problem here is fatal at startup; per-key failures later surface
//! as `Corrupt` instead.

use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::error::KeystoreError;

pub const MASTER_KEY_ENV: &str = "ACRA_MASTER_KEY";
pub const MASTER_KEY_LEN: usize = 32;

/// Decode a base64 master key and check its length.
pub fn decode_master_key(encoded: &str) -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, KeystoreError> {
    let decoded = Zeroizing::new(
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeystoreError::MasterKey(format!("invalid base64: {e}")))?,
    );
    if decoded.len() != MASTER_KEY_LEN {
        return Err(KeystoreError::MasterKey(format!(
            "expected {} bytes after base64 decode, got {}",
            MASTER_KEY_LEN,
            decoded.len()
        )));
    }
    let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    key.copy_from_slice(&decoded);
    Ok(key)
}

/// Read and decode the master key from the environment.
pub fn master_key_from_env() -> Result<Zeroizing<[u8; MASTER_KEY_LEN]>, KeystoreError> {
    let encoded = std::env::var(MASTER_KEY_ENV)
        .map_err(|_| KeystoreError::MasterKey(format!("{MASTER_KEY_ENV} is not set")))?;
    decode_master_key(&encoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};

    #[test]
    fn decodes_valid_key() {
        let encoded = STANDARD.encode([7u8; MASTER_KEY_LEN]);
        let key = decode_master_key(&encoded).unwrap();
        assert_eq!(&key[..], &[7u8; MASTER_KEY_LEN]);
    }

    #[test]
    fn rejects_wrong_length() {
        let encoded = STANDARD.encode([7u8; 16]);
        assert!(matches!(
            decode_master_key(&encoded),
            Err(KeystoreError::MasterKey(_))
        ));
    }

    #[test]
    fn rejects_bad_base64() {
        assert!(decode_master_key("not base64 at all!!!").is_err());
    }

    #[test]
    fn trims_whitespace() {
        let encoded = format!("  {}\n", STANDARD.encode([1u8; MASTER_KEY_LEN]));
        assert!(decode_master_key(&encoded).is_ok());
    }
}
