//! Unified server configuration.
//!
//! The binary assembles a [`Config`] from CLI flags (optionally merged
//! with a YAML config file carrying the same keys) and validates it once
//! at startup. Everything downstream consumes the typed form.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::client_id::ClientId;

/// Which database dialect the proxy speaks. Exactly one is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgresql,
    Mysql,
}

/// PostgreSQL bytea text encoding in effect on result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteaFormat {
    Hex,
    Escape,
}

/// How incoming connector connections are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSelection {
    /// No transport transformation; the configured client id applies.
    Raw,
    /// Server-side TLS handshake; identity from the peer certificate.
    Tls,
    /// Mutually-authenticated key exchange against keystore transport keys.
    SecureSession,
}

/// TLS context shared by the connector-facing acceptor and the
/// database-facing connector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    pub key: PathBuf,
    pub cert: PathBuf,
    #[serde(default)]
    pub ca: Option<PathBuf>,
    /// Expected server name (SNI) of the database; falls back to `db_host`.
    #[serde(default)]
    pub db_sni: Option<String>,
    /// Client-auth mode 0–4: none / request / require-any / verify-if-given /
    /// require-and-verify.
    #[serde(default = "default_tls_auth")]
    pub auth_mode: u8,
}

fn default_tls_auth() -> u8 {
    4
}

/// What to do when a poison record decrypts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoisonPolicy {
    /// Check decrypted cells against the poison keypair at all.
    pub detect: bool,
    /// Tear the server down through the error channel on a match.
    pub shutdown: bool,
    /// Script to spawn (not awaited) on a match. Empty = none.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

impl Default for PoisonPolicy {
    fn default() -> Self {
        Self { detect: true, shutdown: false, script: None }
    }
}

/// Complete validated server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_host: String,
    pub db_port: u16,

    pub incoming_connection_host: String,
    pub incoming_connection_port: u16,
    pub incoming_connection_api_port: u16,

    pub keys_dir: PathBuf,
    /// `-1` disables the keystore cache, `0` means unbounded.
    pub keystore_cache_size: i64,

    /// Own identity in the secure-session handshake.
    pub securesession_id: String,

    pub transport: TransportSelection,
    pub tls: Option<TlsSettings>,
    /// Required with the raw wrapper when zone mode is off; optional
    /// override of the certificate-derived id with the TLS wrapper.
    pub client_id: Option<ClientId>,

    pub dialect: Dialect,
    pub bytea_format: ByteaFormat,

    pub censor_config_file: Option<PathBuf>,
    pub poison: PoisonPolicy,

    pub zone_mode: bool,
    pub injected_cell: bool,
    pub http_api_enable: bool,

    /// Graceful drain budget in seconds.
    pub close_timeout_secs: u64,
}

impl Config {
    /// Whether the admin HTTP listener is started at all. The restart path
    /// duplicates the API descriptor under the same predicate.
    pub fn api_enabled(&self) -> bool {
        self.http_api_enable || self.zone_mode
    }

    pub fn db_addr(&self) -> String {
        format!("{}:{}", self.db_host, self.db_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.incoming_connection_host, self.incoming_connection_port)
    }

    pub fn api_addr(&self) -> String {
        format!("{}:{}", self.incoming_connection_host, self.incoming_connection_api_port)
    }

    /// Startup-time validation; any failure here is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.db_host.is_empty() {
            return Err(ConfigError::Invalid("db_host is empty: you must specify db_host".into()));
        }
        if self.transport == TransportSelection::Raw && self.client_id.is_none() && !self.zone_mode {
            return Err(ConfigError::Invalid(
                "without zone mode and without transport encryption you must set client_id".into(),
            ));
        }
        if self.transport == TransportSelection::Tls {
            match &self.tls {
                None => {
                    return Err(ConfigError::Invalid(
                        "TLS transport selected but tls_key/tls_cert are not set".into(),
                    ))
                }
                Some(tls) if tls.auth_mode > 4 => {
                    return Err(ConfigError::Invalid(format!(
                        "tls_auth must be in 0..=4, got {}",
                        tls.auth_mode
                    )))
                }
                _ => {}
            }
        }
        if self.keystore_cache_size < -1 {
            return Err(ConfigError::Invalid(format!(
                "keystore_cache_size must be >= -1, got {}",
                self.keystore_cache_size
            )));
        }
        ClientId::new(self.securesession_id.as_bytes().to_vec())
            .map_err(|e| ConfigError::Invalid(format!("securesession_id: {e}")))?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid client id: {0}")]
    InvalidClientId(String),

    #[error("configuration error: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            db_host: "localhost".into(),
            db_port: 5432,
            incoming_connection_host: "0.0.0.0".into(),
            incoming_connection_port: 9393,
            incoming_connection_api_port: 9090,
            keys_dir: ".acrakeys".into(),
            keystore_cache_size: 0,
            securesession_id: "acra_server".into(),
            transport: TransportSelection::SecureSession,
            tls: None,
            client_id: None,
            dialect: Dialect::Postgresql,
            bytea_format: ByteaFormat::Hex,
            censor_config_file: None,
            poison: PoisonPolicy::default(),
            zone_mode: false,
            injected_cell: false,
            http_api_enable: false,
            close_timeout_secs: 10,
        }
    }

    #[test]
    fn valid_baseline() {
        base().validate().unwrap();
    }

    #[test]
    fn empty_db_host_rejected() {
        let mut cfg = base();
        cfg.db_host.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn raw_transport_requires_client_id_without_zones() {
        let mut cfg = base();
        cfg.transport = TransportSelection::Raw;
        assert!(cfg.validate().is_err());

        cfg.client_id = Some(ClientId::new(b"client_one".to_vec()).unwrap());
        cfg.validate().unwrap();

        cfg.client_id = None;
        cfg.zone_mode = true;
        cfg.validate().unwrap();
    }

    #[test]
    fn tls_transport_requires_context() {
        let mut cfg = base();
        cfg.transport = TransportSelection::Tls;
        assert!(cfg.validate().is_err());

        cfg.tls = Some(TlsSettings {
            key: "server.key".into(),
            cert: "server.crt".into(),
            ca: None,
            db_sni: None,
            auth_mode: 4,
        });
        cfg.validate().unwrap();

        cfg.tls.as_mut().unwrap().auth_mode = 5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn api_listener_predicate() {
        let mut cfg = base();
        assert!(!cfg.api_enabled());
        cfg.zone_mode = true;
        assert!(cfg.api_enabled());
        cfg.zone_mode = false;
        cfg.http_api_enable = true;
        assert!(cfg.api_enabled());
    }
}
