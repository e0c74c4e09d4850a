//! # opal-proxy
//!
//! The connection-serving engine: transport wrappers that authenticate an
//! accepted socket and yield a client identity, protocol adapters that
//! frame the PostgreSQL and MySQL wire protocols, the row decryptor that
//! splices plaintext over encrypted cells, and the per-connection
//! pipeline that pumps frames in both directions.
//!
//! ```text
//! connector ──► transport wrapper ──► adapter ──► censor ──► database
//!           ◄── rewrite ◄── decryptor ◄── adapter ◄──────────
//! ```

pub mod bytea;
pub mod decryptor;
pub mod error;
pub mod mysql;
pub mod pipeline;
pub mod postgres;
pub mod stream;
pub mod tls;
pub mod wrapper;

pub use error::ProxyError;
pub use pipeline::{serve_connection, PoisonAction};
pub use wrapper::TransportWrapper;

/// Transport wrappers must produce an authenticated stream within this
/// budget or refuse the connection.
pub const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
