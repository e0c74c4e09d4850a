//! # opal-crypto
//!
//! Cryptographic core of the Opal proxy:
//!
//! - [`cell`] — the self-describing encrypted-cell envelope that applications
//!   write into database columns and the proxy transparently opens.
//! - [`session`] — the three-message mutually-authenticated key exchange used
//!   by the secure-session transport wrapper.
//! - [`poison`] — tripwire records that signal unauthorized decryption.
//! - [`zone`] — per-row keying namespace identifiers.
//!
//! Primitives are XChaCha20-Poly1305 for authenticated encryption,
//! X25519 for key agreement and HKDF-SHA256 for key derivation.

pub use x25519_dalek;

pub mod aead;
pub mod cell;
pub mod error;
pub mod kdf;
pub mod keypair;
pub mod poison;
pub mod session;
pub mod zone;

pub use cell::{CellHeader, CELL_MAGIC, CELL_MIN_LEN};
pub use error::CryptoError;
pub use keypair::KeyPair;
pub use session::SessionKeys;
