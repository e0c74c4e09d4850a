//! Censor policy file model.
//!
//! ```yaml
//! ignore_parse_errors: false
//! handlers:
//!   - handler: deny
//!     queries:
//!       - DROP TABLE users
//!     tables:
//!       - credit_cards
//!     patterns:
//!       - "DROP TABLE .*"
//!   - handler: allow
//!     tables:
//!       - public_products
//! ```
//!
//! Handlers run in order; the first match decides. An `allow` handler
//! with rules is terminal: anything it does not match is denied.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub ignore_parse_errors: bool,

    #[serde(default)]
    pub handlers: Vec<HandlerConfig>,
}

#[derive(Debug, Deserialize)]
pub struct HandlerConfig {
    pub handler: HandlerKind,

    /// Exact statements, compared by hash of the normalized SQL.
    #[serde(default)]
    pub queries: Vec<String>,

    /// Table names, matched against parsed statement references.
    #[serde(default)]
    pub tables: Vec<String>,

    /// Regular expressions over the raw query text.
    #[serde(default)]
    pub patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerKind {
    Allow,
    Deny,
}

impl PolicyFile {
    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }
}
