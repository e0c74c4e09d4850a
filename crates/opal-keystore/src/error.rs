use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeystoreError {
    /// The key file does not exist.
    #[error("key not found")]
    NotFound,

    /// The key file exists but its envelope failed to authenticate.
    /// Deliberately distinct from `NotFound`: a wrong master key must not
    /// look like a missing key.
    #[error("key material corrupted: {0}")]
    Corrupt(String),

    #[error("key already exists")]
    Exists,

    #[error("master key: {0}")]
    MasterKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
