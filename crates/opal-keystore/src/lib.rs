//! # opal-keystore
//!
//! Content-addressed filesystem keystore. Each key lives in its own file
//! whose name encodes `(kind, identifier)`; private halves are wrapped in
//! a symmetric envelope keyed by the master key from the environment.
//! Decrypted lookups go through a bounded LRU cache that stores the
//! *encrypted* file contents and zeroes evicted buffers.

pub mod cache;
pub mod error;
pub mod fs;
pub mod master_key;

pub use error::KeystoreError;
pub use fs::{FsKeyStore, KeyKind};
pub use master_key::{decode_master_key, master_key_from_env, MASTER_KEY_ENV, MASTER_KEY_LEN};
