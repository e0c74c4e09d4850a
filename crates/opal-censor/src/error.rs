use thiserror::Error;

#[derive(Debug, Error)]
pub enum CensorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("policy YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid pattern {0:?}: {1}")]
    InvalidPattern(String, String),

    #[error("SQL parse error: {0}")]
    ParseError(String),
}
