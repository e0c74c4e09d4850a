//! Client identifiers.
//!
//! A client id names a tenant. It selects which storage keypair decrypts
//! that tenant's cells, so the accepted alphabet is deliberately narrow:
//! `[A-Za-z0-9_-]`, length 5–256.

use std::fmt;

use crate::config::ConfigError;

/// An opaque, validated tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Vec<u8>);

pub const MIN_LEN: usize = 5;
pub const MAX_LEN: usize = 256;

fn valid_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
}

impl ClientId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        let bytes = bytes.into();
        if bytes.len() < MIN_LEN || bytes.len() > MAX_LEN {
            return Err(ConfigError::InvalidClientId(format!(
                "length {} outside {}..={}",
                bytes.len(),
                MIN_LEN,
                MAX_LEN
            )));
        }
        if let Some(b) = bytes.iter().find(|b| !valid_byte(**b)) {
            return Err(ConfigError::InvalidClientId(format!(
                "byte 0x{:02x} outside [A-Za-z0-9_-]",
                b
            )));
        }
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The id as a string; always valid UTF-8 given the alphabet.
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).expect("client id alphabet is ASCII")
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_ids() {
        for id in ["client_one", "acra_server", "A1-b2_C3", &"x".repeat(256)] {
            assert!(ClientId::new(id.as_bytes().to_vec()).is_ok(), "{id}");
        }
    }

    #[test]
    fn rejects_bad_length() {
        assert!(ClientId::new(b"abcd".to_vec()).is_err());
        assert!(ClientId::new(vec![b'x'; 257]).is_err());
    }

    #[test]
    fn rejects_bad_bytes() {
        assert!(ClientId::new(b"has space".to_vec()).is_err());
        assert!(ClientId::new(b"nul\0byte".to_vec()).is_err());
        assert!(ClientId::new("unicode-é".as_bytes().to_vec()).is_err());
    }
}
