use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Transport wrapper failed to authenticate the peer.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The wire protocol stream violated its framing rules.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("keystore: {0}")]
    Keystore(#[from] opal_keystore::KeystoreError),

    #[error("crypto: {0}")]
    Crypto(#[from] opal_crypto::CryptoError),

    #[error("TLS configuration: {0}")]
    TlsConfig(String),

    #[error("failed to connect to database at {address}: {source}")]
    DatabaseConnect {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
