//! opal-server: transparent decrypting proxy between a connector and a
//! PostgreSQL or MySQL database.
//!
//! Startup order matters: configuration, keystore, censor, transport,
//! signal handlers, listeners — any failure before the accept loop exits
//! with code 1 and a structured event code.

mod api;
mod counter;
mod lifecycle;
mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{ArgAction, CommandFactory, FromArgMatches, Parser};
use clap::parser::ValueSource;
use serde::Deserialize;

use opal_censor::Censor;
use opal_core::{
    events, ByteaFormat, ClientId, Config, ConfigError, Dialect, PoisonPolicy, TlsSettings,
    TransportSelection,
};
use opal_keystore::FsKeyStore;
use opal_proxy::pipeline::{ConnectionContext, PoisonAction};
use opal_proxy::{tls, TransportWrapper};

use crate::lifecycle::{
    dup_listener_fd, is_graceful_restart_child, listener_from_fd, RestartContext, ServerLifecycle,
};
use crate::server::{Server, DESCRIPTOR_API, DESCRIPTOR_DATA};

/// Client id used for raw transport in zone mode, where per-row zone
/// keys do the real selection.
const ZONEMODE_CLIENT_ID: &[u8] = b"zonemode_client";

#[derive(Parser, Debug)]
#[command(name = "opal-server", version, about = "Transparent decrypting database proxy")]
struct Cli {
    /// Host of the upstream database.
    #[arg(long = "db_host")]
    db_host: Option<String>,

    /// Port of the upstream database.
    #[arg(long = "db_port", default_value_t = 5432)]
    db_port: u16,

    #[arg(long = "incoming_connection_host", default_value = "0.0.0.0")]
    incoming_connection_host: String,

    #[arg(long = "incoming_connection_port", default_value_t = 9393)]
    incoming_connection_port: u16,

    #[arg(long = "incoming_connection_api_port", default_value_t = 9090)]
    incoming_connection_api_port: u16,

    /// Directory keys are loaded from.
    #[arg(long = "keys_dir", default_value = ".acrakeys")]
    keys_dir: PathBuf,

    /// Keys kept in the in-memory LRU cache in encrypted form.
    /// 0 = unbounded, -1 = cache off.
    #[arg(long = "keystore_cache_size", default_value_t = 0, allow_negative_numbers = true)]
    keystore_cache_size: i64,

    /// Own identity sent in the secure-session handshake.
    #[arg(long = "securesession_id", default_value = "acra_server")]
    securesession_id: String,

    /// Use TLS between the connector and this server.
    #[arg(long = "acraconnector_tls_transport_enable", action = ArgAction::SetTrue)]
    acraconnector_tls_transport_enable: bool,

    /// Use a raw socket between the connector and this server.
    #[arg(long = "acraconnector_transport_encryption_disable", action = ArgAction::SetTrue)]
    acraconnector_transport_encryption_disable: bool,

    #[arg(long = "tls_key")]
    tls_key: Option<PathBuf>,

    #[arg(long = "tls_cert")]
    tls_cert: Option<PathBuf>,

    #[arg(long = "tls_ca")]
    tls_ca: Option<PathBuf>,

    /// Expected server name (SNI) of the database.
    #[arg(long = "tls_db_sni")]
    tls_db_sni: Option<String>,

    /// Client-auth mode 0-4 for TLS peers.
    #[arg(long = "tls_auth", default_value_t = 4)]
    tls_auth: u8,

    /// Expected client id when transport encryption is disabled.
    #[arg(long = "client_id")]
    client_id: Option<String>,

    #[arg(long = "mysql_enable", action = ArgAction::SetTrue)]
    mysql_enable: bool,

    #[arg(long = "postgresql_enable", action = ArgAction::SetTrue)]
    postgresql_enable: bool,

    /// Censor policy YAML; absent means allow all.
    #[arg(long = "acracensor_config_file")]
    acracensor_config_file: Option<PathBuf>,

    #[arg(long = "poison_detect_enable", default_value_t = true, action = ArgAction::Set)]
    poison_detect_enable: bool,

    #[arg(long = "poison_shutdown_enable", action = ArgAction::SetTrue)]
    poison_shutdown_enable: bool,

    #[arg(long = "poison_run_script_file")]
    poison_run_script_file: Option<PathBuf>,

    #[arg(long = "zonemode_enable", action = ArgAction::SetTrue)]
    zonemode_enable: bool,

    /// Cells may sit at any offset inside a column value.
    #[arg(long = "acrastruct_injectedcell_enable", action = ArgAction::SetTrue)]
    acrastruct_injectedcell_enable: bool,

    #[arg(long = "http_api_enable", action = ArgAction::SetTrue)]
    http_api_enable: bool,

    /// Seconds to wait for connections to close on shutdown or restart.
    #[arg(long = "incoming_connection_close_timeout", default_value_t = 10)]
    incoming_connection_close_timeout: u64,

    #[arg(long = "pgsql_hex_bytea", action = ArgAction::SetTrue)]
    pgsql_hex_bytea: bool,

    #[arg(long = "pgsql_escape_bytea", action = ArgAction::SetTrue)]
    pgsql_escape_bytea: bool,

    /// Log INFO and up to stderr.
    #[arg(short = 'v', action = ArgAction::SetTrue)]
    v: bool,

    /// Log everything to stderr.
    #[arg(short = 'd', action = ArgAction::SetTrue)]
    d: bool,

    /// YAML file supplying defaults for any of the flags above.
    #[arg(long = "config_file")]
    config_file: Option<PathBuf>,
}

/// Config-file form of the CLI surface: every key optional, explicit
/// flags win.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    db_host: Option<String>,
    db_port: Option<u16>,
    incoming_connection_host: Option<String>,
    incoming_connection_port: Option<u16>,
    incoming_connection_api_port: Option<u16>,
    keys_dir: Option<PathBuf>,
    keystore_cache_size: Option<i64>,
    securesession_id: Option<String>,
    acraconnector_tls_transport_enable: Option<bool>,
    acraconnector_transport_encryption_disable: Option<bool>,
    tls_key: Option<PathBuf>,
    tls_cert: Option<PathBuf>,
    tls_ca: Option<PathBuf>,
    tls_db_sni: Option<String>,
    tls_auth: Option<u8>,
    client_id: Option<String>,
    mysql_enable: Option<bool>,
    postgresql_enable: Option<bool>,
    acracensor_config_file: Option<PathBuf>,
    poison_detect_enable: Option<bool>,
    poison_shutdown_enable: Option<bool>,
    poison_run_script_file: Option<PathBuf>,
    zonemode_enable: Option<bool>,
    acrastruct_injectedcell_enable: Option<bool>,
    http_api_enable: Option<bool>,
    incoming_connection_close_timeout: Option<u64>,
    pgsql_hex_bytea: Option<bool>,
    pgsql_escape_bytea: Option<bool>,
}

fn merge_file_config(cli: &mut Cli, file: FileConfig, matches: &clap::ArgMatches) {
    fn from_cli(matches: &clap::ArgMatches, id: &str) -> bool {
        matches.value_source(id) == Some(ValueSource::CommandLine)
    }

    macro_rules! merge {
        ($field:ident) => {
            if let Some(value) = file.$field {
                if !from_cli(matches, stringify!($field)) {
                    cli.$field = value;
                }
            }
        };
    }
    macro_rules! merge_opt {
        ($field:ident) => {
            if let Some(value) = file.$field {
                if !from_cli(matches, stringify!($field)) {
                    cli.$field = Some(value);
                }
            }
        };
    }

    merge_opt!(db_host);
    merge!(db_port);
    merge!(incoming_connection_host);
    merge!(incoming_connection_port);
    merge!(incoming_connection_api_port);
    merge!(keys_dir);
    merge!(keystore_cache_size);
    merge!(securesession_id);
    merge!(acraconnector_tls_transport_enable);
    merge!(acraconnector_transport_encryption_disable);
    merge_opt!(tls_key);
    merge_opt!(tls_cert);
    merge_opt!(tls_ca);
    merge_opt!(tls_db_sni);
    merge!(tls_auth);
    merge_opt!(client_id);
    merge!(mysql_enable);
    merge!(postgresql_enable);
    merge_opt!(acracensor_config_file);
    merge!(poison_detect_enable);
    merge!(poison_shutdown_enable);
    merge_opt!(poison_run_script_file);
    merge!(zonemode_enable);
    merge!(acrastruct_injectedcell_enable);
    merge!(http_api_enable);
    merge!(incoming_connection_close_timeout);
    merge!(pgsql_hex_bytea);
    merge!(pgsql_escape_bytea);
}

fn build_config(cli: &Cli) -> Result<Config, ConfigError> {
    if cli.mysql_enable && cli.postgresql_enable {
        return Err(ConfigError::Invalid(
            "mysql_enable and postgresql_enable are mutually exclusive".into(),
        ));
    }
    let dialect = if cli.mysql_enable {
        Dialect::Mysql
    } else {
        Dialect::Postgresql
    };

    let bytea_format = if cli.pgsql_hex_bytea || !cli.pgsql_escape_bytea {
        ByteaFormat::Hex
    } else {
        ByteaFormat::Escape
    };

    let transport = if cli.acraconnector_tls_transport_enable {
        TransportSelection::Tls
    } else if cli.acraconnector_transport_encryption_disable {
        TransportSelection::Raw
    } else {
        TransportSelection::SecureSession
    };

    let tls = match (&cli.tls_key, &cli.tls_cert) {
        (Some(key), Some(cert)) => Some(TlsSettings {
            key: key.clone(),
            cert: cert.clone(),
            ca: cli.tls_ca.clone(),
            db_sni: cli.tls_db_sni.clone(),
            auth_mode: cli.tls_auth,
        }),
        (None, None) => None,
        _ => {
            return Err(ConfigError::Invalid(
                "tls_key and tls_cert must be set together".into(),
            ))
        }
    };

    let client_id = cli
        .client_id
        .as_ref()
        .map(|id| ClientId::new(id.as_bytes().to_vec()))
        .transpose()?;

    let config = Config {
        db_host: cli.db_host.clone().unwrap_or_default(),
        db_port: cli.db_port,
        incoming_connection_host: cli.incoming_connection_host.clone(),
        incoming_connection_port: cli.incoming_connection_port,
        incoming_connection_api_port: cli.incoming_connection_api_port,
        keys_dir: cli.keys_dir.clone(),
        keystore_cache_size: cli.keystore_cache_size,
        securesession_id: cli.securesession_id.clone(),
        transport,
        tls,
        client_id,
        dialect,
        bytea_format,
        censor_config_file: cli.acracensor_config_file.clone(),
        poison: PoisonPolicy {
            detect: cli.poison_detect_enable,
            shutdown: cli.poison_shutdown_enable,
            script: cli.poison_run_script_file.clone(),
        },
        zone_mode: cli.zonemode_enable,
        injected_cell: cli.acrastruct_injectedcell_enable,
        http_api_enable: cli.http_api_enable,
        close_timeout_secs: cli.incoming_connection_close_timeout,
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(cli: &Cli) {
    let filter = if cli.d {
        "trace"
    } else if cli.v {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn exit_config_error(code: u16, error: impl std::fmt::Display) -> ! {
    tracing::error!(event_code = code, error = %error, "startup failed");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    let matches = Cli::command().get_matches();
    let mut cli = match Cli::from_arg_matches(&matches) {
        Ok(cli) => cli,
        Err(e) => e.exit(),
    };
    init_logging(&cli);
    tracing::info!(pid = std::process::id(), "starting opal-server");

    if let Some(path) = cli.config_file.clone() {
        let file: FileConfig = match std::fs::read_to_string(&path)
            .map_err(ConfigError::from)
            .and_then(|content| serde_yaml::from_str(&content).map_err(ConfigError::from))
        {
            Ok(file) => file,
            Err(e) => exit_config_error(events::CANT_READ_SERVICE_CONFIG, e),
        };
        merge_file_config(&mut cli, file, &matches);
    }

    let config = match build_config(&cli) {
        Ok(config) => Arc::new(config),
        Err(e) => exit_config_error(events::WRONG_CONFIGURATION, e),
    };

    tracing::info!("initializing keystore");
    let master_key = match opal_keystore::master_key_from_env() {
        Ok(key) => key,
        Err(e) => exit_config_error(events::CANT_INIT_KEYSTORE, e),
    };
    let keystore = match FsKeyStore::new(&config.keys_dir, master_key, config.keystore_cache_size) {
        Ok(store) => Arc::new(store),
        Err(e) => exit_config_error(events::CANT_INIT_KEYSTORE, e),
    };
    tracing::info!("keystore init OK");

    let censor = match Censor::from_file(config.censor_config_file.as_deref(), config.dialect) {
        Ok(censor) => Arc::new(censor),
        Err(e) => exit_config_error(events::CENSOR_SETUP, e),
    };

    tracing::info!("configuring transport");
    let wrapper = match build_wrapper(&config, &keystore) {
        Ok(wrapper) => Arc::new(wrapper),
        Err(e) => exit_config_error(events::TRANSPORT_CONFIGURATION, e),
    };

    let db_connector = if config.dialect == Dialect::Postgresql {
        match config.tls.as_ref().map(tls::build_db_connector).transpose() {
            Ok(connector) => connector,
            Err(e) => exit_config_error(events::TRANSPORT_CONFIGURATION, e),
        }
    } else {
        if config.tls.is_some() {
            tracing::info!("database-side TLS is not applied for MySQL");
        }
        None
    };

    let lifecycle = match ServerLifecycle::new() {
        Ok(lifecycle) => lifecycle,
        Err(e) => exit_config_error(events::CANT_REGISTER_SIGNAL_HANDLER, e),
    };

    let poison = Arc::new(PoisonAction::new(config.poison.clone(), lifecycle.error_tx.clone()));
    let ctx = Arc::new(ConnectionContext {
        config: config.clone(),
        keystore: keystore.clone(),
        censor,
        wrapper,
        poison,
        db_connector,
    });

    // Bind or inherit the listeners. Data and API addresses are
    // independent; the API listener exists iff the API is enabled.
    let inherited = is_graceful_restart_child();
    let data_listener = match bind_or_inherit(inherited, DESCRIPTOR_DATA, &config.data_addr()).await
    {
        Ok(listener) => listener,
        Err(e) => exit_config_error(events::CANT_START_SERVICE, e),
    };
    let api_listener = if config.api_enabled() {
        match bind_or_inherit(inherited, DESCRIPTOR_API, &config.api_addr()).await {
            Ok(listener) => Some(listener),
            Err(e) => exit_config_error(events::CANT_START_SERVICE, e),
        }
    } else {
        None
    };

    // Duplicate the descriptors up front so the restart path does not
    // depend on the accept loops still owning the listeners.
    let restart = {
        let data_fd = match dup_listener_fd(&data_listener) {
            Ok(fd) => fd,
            Err(e) => exit_config_error(events::CANT_GET_FILE_DESCRIPTOR, e),
        };
        let api_fd = match api_listener.as_ref().map(dup_listener_fd).transpose() {
            Ok(fd) => fd,
            Err(e) => exit_config_error(events::CANT_GET_FILE_DESCRIPTOR, e),
        };
        RestartContext { data_fd, api_fd }
    };

    let server = Server::new(ctx, lifecycle.error_tx.clone());
    let _accept_loop = server.spawn_accept_loop(data_listener);

    if let Some(api_listener) = api_listener {
        let state = api::ApiState {
            keystore: keystore.clone(),
            zone_mode: config.zone_mode,
        };
        tracing::info!(addr = %config.api_addr(), "admin API listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(api_listener, api::router(state)).await {
                tracing::error!(error = %e, "admin API server error");
            }
        });
    }

    tracing::info!(
        addr = %config.data_addr(),
        pid = std::process::id(),
        "listening for connections"
    );

    lifecycle
        .run(
            server,
            Duration::from_secs(config.close_timeout_secs),
            restart,
        )
        .await;
}

fn build_wrapper(
    config: &Config,
    keystore: &Arc<FsKeyStore>,
) -> Result<TransportWrapper, anyhow::Error> {
    match config.transport {
        TransportSelection::Raw => {
            tracing::info!("selecting transport: raw");
            let client_id = match &config.client_id {
                Some(id) => id.clone(),
                // Validated: raw without a client id implies zone mode.
                None => ClientId::new(ZONEMODE_CLIENT_ID.to_vec())?,
            };
            Ok(TransportWrapper::Raw { client_id })
        }
        TransportSelection::Tls => {
            tracing::info!("selecting transport: TLS");
            let settings = config
                .tls
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("TLS transport requires tls_key/tls_cert"))?;
            let acceptor = tls::build_acceptor(settings)?;
            Ok(TransportWrapper::Tls {
                acceptor,
                client_id_override: config.client_id.clone(),
            })
        }
        TransportSelection::SecureSession => {
            tracing::info!("selecting transport: secure session");
            Ok(TransportWrapper::SecureSession {
                keystore: keystore.clone(),
                server_id: config.securesession_id.as_bytes().to_vec(),
            })
        }
    }
}

async fn bind_or_inherit(
    inherited: bool,
    descriptor: i32,
    addr: &str,
) -> std::io::Result<tokio::net::TcpListener> {
    if inherited {
        tracing::info!(descriptor, "reconstructing listener from inherited descriptor");
        listener_from_fd(descriptor)
    } else {
        tokio::net::TcpListener::bind(addr).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> (Cli, clap::ArgMatches) {
        let mut full = vec!["opal-server"];
        full.extend_from_slice(args);
        let matches = Cli::command().get_matches_from(&full);
        let cli = Cli::from_arg_matches(&matches).unwrap();
        (cli, matches)
    }

    #[test]
    fn defaults_match_documented_surface() {
        let (cli, _) = parse(&["--db_host", "localhost"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.db_port, 5432);
        assert_eq!(config.incoming_connection_port, 9393);
        assert_eq!(config.incoming_connection_api_port, 9090);
        assert_eq!(config.keys_dir, PathBuf::from(".acrakeys"));
        assert_eq!(config.dialect, Dialect::Postgresql);
        assert_eq!(config.bytea_format, ByteaFormat::Hex);
        assert_eq!(config.transport, TransportSelection::SecureSession);
        assert!(config.poison.detect);
        assert!(!config.poison.shutdown);
        assert_eq!(config.close_timeout_secs, 10);
    }

    #[test]
    fn dialects_are_mutually_exclusive() {
        let (cli, _) = parse(&["--db_host", "h", "--mysql_enable", "--postgresql_enable"]);
        assert!(build_config(&cli).is_err());

        let (cli, _) = parse(&["--db_host", "h", "--mysql_enable"]);
        assert_eq!(build_config(&cli).unwrap().dialect, Dialect::Mysql);
    }

    #[test]
    fn escape_bytea_selected_only_when_asked() {
        let (cli, _) = parse(&["--db_host", "h", "--pgsql_escape_bytea"]);
        assert_eq!(build_config(&cli).unwrap().bytea_format, ByteaFormat::Escape);

        let (cli, _) = parse(&["--db_host", "h", "--pgsql_escape_bytea", "--pgsql_hex_bytea"]);
        assert_eq!(build_config(&cli).unwrap().bytea_format, ByteaFormat::Hex);
    }

    #[test]
    fn raw_transport_needs_client_id() {
        let (cli, _) = parse(&["--db_host", "h", "--acraconnector_transport_encryption_disable"]);
        assert!(build_config(&cli).is_err());

        let (cli, _) = parse(&[
            "--db_host", "h",
            "--acraconnector_transport_encryption_disable",
            "--client_id", "client_one",
        ]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.transport, TransportSelection::Raw);

        let (cli, _) = parse(&[
            "--db_host", "h",
            "--acraconnector_transport_encryption_disable",
            "--zonemode_enable",
        ]);
        assert!(build_config(&cli).unwrap().zone_mode);
    }

    #[test]
    fn tls_flags_must_come_together() {
        let (cli, _) = parse(&["--db_host", "h", "--tls_key", "k.pem"]);
        assert!(build_config(&cli).is_err());

        let (cli, _) = parse(&["--db_host", "h", "--tls_key", "k.pem", "--tls_cert", "c.pem"]);
        let config = build_config(&cli).unwrap();
        assert_eq!(config.tls.as_ref().unwrap().auth_mode, 4);
    }

    #[test]
    fn poison_detect_can_be_disabled() {
        let (cli, _) = parse(&["--db_host", "h", "--poison_detect_enable", "false"]);
        assert!(!build_config(&cli).unwrap().poison.detect);
    }

    #[test]
    fn file_config_fills_gaps_but_flags_win() {
        let (mut cli, matches) = parse(&["--db_host", "cli-host", "--db_port", "6000"]);
        let file: FileConfig = serde_yaml::from_str(
            r#"
db_host: file-host
db_port: 7000
keystore_cache_size: 16
"#,
        )
        .unwrap();
        merge_file_config(&mut cli, file, &matches);

        assert_eq!(cli.db_host.as_deref(), Some("cli-host"));
        assert_eq!(cli.db_port, 6000);
        assert_eq!(cli.keystore_cache_size, 16);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let parsed: Result<FileConfig, _> = serde_yaml::from_str("no_such_flag: 1");
        assert!(parsed.is_err());
    }
}
