//! The encrypted-cell envelope.
//!
//! A cell is a self-describing binary blob an application writes into a
//! database column. The proxy recognizes cells by the magic prefix, opens
//! them with the connection's private key and splices the plaintext back
//! into the result row.
//!
//! Layout:
//!
//! ```text
//! ┌───────────┬──────────────┬───────────────┬───────────────┬───────────────────┐
//! │ magic (8) │ eph pub (32) │ wrapped DEK   │ payload len   │ body              │
//! │           │ X25519       │ (72)          │ u64 LE (8)    │ (24 + len + 16)   │
//! └───────────┴──────────────┴───────────────┴───────────────┴───────────────────┘
//! ```
//!
//! The wrapped DEK is the 32-byte data key sealed under
//! `HKDF(X25519(ephemeral, recipient))`; the body is the payload sealed
//! under the DEK with the declared length as associated data. A cell is
//! either entirely present in a byte span or it is not a cell; truncated
//! candidates are never decrypted.

use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CryptoError;
use crate::kdf;

/// Fixed 8-byte prefix every cell starts with.
pub const CELL_MAGIC: [u8; 8] = [0x85, 0x32, 0xFA, 0x8E, 0x4F, 0x50, 0x41, 0x4C];

const EPH_PUB_LEN: usize = 32;
const WRAPPED_DEK_LEN: usize = 32 + aead::OVERHEAD;
const LEN_FIELD_LEN: usize = 8;

/// Header length up to and including the payload-length field.
pub const CELL_HEADER_LEN: usize = CELL_MAGIC.len() + EPH_PUB_LEN + WRAPPED_DEK_LEN + LEN_FIELD_LEN;

/// Smallest possible cell (empty payload).
pub const CELL_MIN_LEN: usize = CELL_HEADER_LEN + aead::OVERHEAD;

const WRAP_INFO: &[u8] = b"opal-cell-key-wrap";

/// Parsed cell header. Borrowed views into the original span.
pub struct CellHeader<'a> {
    eph_pub: &'a [u8],
    wrapped_dek: &'a [u8],
    payload_len: u64,
}

impl<'a> CellHeader<'a> {
    /// Parse a cell header at the start of `data`.
    ///
    /// `NotACell` when the magic does not match; `TruncatedCell` when the
    /// magic matches but the span is shorter than the declared cell.
    pub fn parse(data: &'a [u8]) -> Result<Self, CryptoError> {
        if data.len() < CELL_MAGIC.len() || data[..CELL_MAGIC.len()] != CELL_MAGIC {
            return Err(CryptoError::NotACell);
        }
        if data.len() < CELL_HEADER_LEN {
            return Err(CryptoError::TruncatedCell);
        }
        let mut offset = CELL_MAGIC.len();
        let eph_pub = &data[offset..offset + EPH_PUB_LEN];
        offset += EPH_PUB_LEN;
        let wrapped_dek = &data[offset..offset + WRAPPED_DEK_LEN];
        offset += WRAPPED_DEK_LEN;
        let payload_len = u64::from_le_bytes(data[offset..offset + LEN_FIELD_LEN].try_into().unwrap());

        let header = Self { eph_pub, wrapped_dek, payload_len };
        if (data.len() as u64) < header.total_len() {
            return Err(CryptoError::TruncatedCell);
        }
        Ok(header)
    }

    /// Full cell length, header plus sealed body.
    pub fn total_len(&self) -> u64 {
        CELL_HEADER_LEN as u64 + aead::OVERHEAD as u64 + self.payload_len
    }
}

/// Seal `plaintext` into a cell addressed to `recipient_pub`.
pub fn seal(recipient_pub: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = PublicKey::from(&eph_secret);
    let shared = eph_secret.diffie_hellman(recipient_pub);

    let kek = Zeroizing::new(kdf::derive_key(shared.as_bytes(), eph_pub.as_bytes(), WRAP_INFO)?);

    let mut dek = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut dek[..]);
    let wrapped_dek = aead::wrap_key(&kek, &dek, &CELL_MAGIC)?;

    let len_field = (plaintext.len() as u64).to_le_bytes();
    let body = aead::encrypt(&dek, plaintext, &len_field)?;

    let mut out = Vec::with_capacity(CELL_HEADER_LEN + body.len());
    out.extend_from_slice(&CELL_MAGIC);
    out.extend_from_slice(eph_pub.as_bytes());
    out.extend_from_slice(&wrapped_dek);
    out.extend_from_slice(&len_field);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Open the cell at the start of `data` with the recipient's secret key.
///
/// `data` may extend past the end of the cell; only `total_len()` bytes
/// are consumed. Any authentication failure surfaces as `AeadDecrypt` and
/// leaves no partial plaintext behind.
pub fn open(secret: &StaticSecret, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let header = CellHeader::parse(data)?;
    let eph_pub = crate::keypair::public_from_bytes(header.eph_pub)?;
    let shared = secret.diffie_hellman(&eph_pub);

    let kek = Zeroizing::new(kdf::derive_key(shared.as_bytes(), header.eph_pub, WRAP_INFO)?);
    let dek = Zeroizing::new(aead::unwrap_key(&kek, header.wrapped_dek, &CELL_MAGIC)?);

    let len_field = header.payload_len.to_le_bytes();
    let body = &data[CELL_HEADER_LEN..header.total_len() as usize];
    let plaintext = aead::decrypt(&dek, body, &len_field)?;

    if plaintext.len() as u64 != header.payload_len {
        return Err(CryptoError::AeadDecrypt);
    }
    Ok(plaintext.to_vec())
}
