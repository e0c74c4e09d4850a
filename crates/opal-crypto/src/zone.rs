//! Zone identifiers.
//!
//! A zone partitions the keyspace at row granularity: a zone-id block
//! embedded in a result row ahead of an encrypted cell selects the zone's
//! keypair instead of the connection's client key.
//!
//! Block layout: `magic (8) || zone id (24)`, the id drawn from `[A-Za-z0-9]`.

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;

/// Fixed 8-byte prefix of a zone-id block.
pub const ZONE_MAGIC: [u8; 8] = [0x85, 0x32, 0xFA, 0x8E, 0x5A, 0x4F, 0x4E, 0x45];

pub const ZONE_ID_LEN: usize = 24;

/// Full block length: magic plus id.
pub const ZONE_BLOCK_LEN: usize = ZONE_MAGIC.len() + ZONE_ID_LEN;

/// Generate a fresh random zone id.
pub fn generate_zone_id() -> Vec<u8> {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(ZONE_ID_LEN)
        .collect()
}

/// A usable zone id is exactly `ZONE_ID_LEN` alphanumeric bytes.
pub fn is_valid_zone_id(id: &[u8]) -> bool {
    id.len() == ZONE_ID_LEN && id.iter().all(|b| b.is_ascii_alphanumeric())
}

/// Parse a zone-id block at the start of `data`. Returns the zone id.
pub fn parse_block(data: &[u8]) -> Option<&[u8]> {
    if data.len() < ZONE_BLOCK_LEN || data[..ZONE_MAGIC.len()] != ZONE_MAGIC {
        return None;
    }
    let id = &data[ZONE_MAGIC.len()..ZONE_BLOCK_LEN];
    is_valid_zone_id(id).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..16 {
            assert!(is_valid_zone_id(&generate_zone_id()));
        }
    }

    #[test]
    fn block_roundtrip() {
        let id = generate_zone_id();
        let mut block = ZONE_MAGIC.to_vec();
        block.extend_from_slice(&id);
        block.extend_from_slice(b"rest of row");
        assert_eq!(parse_block(&block), Some(&id[..]));
    }

    #[test]
    fn short_or_garbled_block_rejected() {
        assert_eq!(parse_block(&ZONE_MAGIC), None);
        let mut block = ZONE_MAGIC.to_vec();
        block.extend_from_slice(&[0u8; ZONE_ID_LEN]);
        assert_eq!(parse_block(&block), None);
    }
}
