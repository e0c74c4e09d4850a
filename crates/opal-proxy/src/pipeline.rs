//! Per-connection pipeline.
//!
//! For every accepted socket: authenticate through the transport wrapper
//! (30 s deadline), open the database connection (TLS-upgraded when
//! configured), then run two pumps until either peer closes or the
//! server cancels. The client→db pump consults the censor on every query
//! frame; the db→client pump runs the decryptor over every result row.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_rustls::TlsConnector;

use opal_censor::{Censor, Decision};
use opal_core::{events, ClientId, Config, Dialect, PoisonPolicy};
use opal_keystore::FsKeyStore;

use crate::decryptor::{DecryptorMode, RowDecryptor};
use crate::error::ProxyError;
use crate::stream::BoxedStream;
use crate::wrapper::TransportWrapper;
use crate::{bytea, mysql, postgres, tls, HANDSHAKE_TIMEOUT};

/// Executes the configured poison policy. Shutdown goes through the
/// server's error channel so only one teardown can be in progress.
pub struct PoisonAction {
    policy: PoisonPolicy,
    error_tx: mpsc::UnboundedSender<String>,
}

impl PoisonAction {
    pub fn new(policy: PoisonPolicy, error_tx: mpsc::UnboundedSender<String>) -> Self {
        Self { policy, error_tx }
    }

    pub fn fire(&self, client_id: &ClientId) {
        tracing::error!(
            event_code = events::POISON_DETECTED,
            client_id = %client_id,
            "poison record detected"
        );
        if let Some(script) = &self.policy.script {
            match tokio::process::Command::new(script).env_clear().spawn() {
                Ok(_) => tracing::info!(script = %script.display(), "poison script started"),
                Err(e) => tracing::error!(
                    event_code = events::SYSTEM_ERROR,
                    script = %script.display(),
                    error = %e,
                    "failed to start poison script"
                ),
            }
        }
        if self.policy.shutdown {
            let _ = self.error_tx.send("poison record detected".to_string());
        }
    }
}

/// Everything a connection needs, shared across all connections.
pub struct ConnectionContext {
    pub config: Arc<Config>,
    pub keystore: Arc<FsKeyStore>,
    pub censor: Arc<Censor>,
    pub wrapper: Arc<TransportWrapper>,
    pub poison: Arc<PoisonAction>,
    pub db_connector: Option<TlsConnector>,
}

/// Serve one accepted connection to completion.
pub async fn serve_connection(
    ctx: Arc<ConnectionContext>,
    socket: TcpStream,
    cancel: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (client_stream, client_id) = tokio::time::timeout(HANDSHAKE_TIMEOUT, ctx.wrapper.wrap(socket))
        .await
        .map_err(|_| ProxyError::Handshake("handshake deadline expired".into()))??;

    tracing::debug!(client_id = %client_id, "connection authenticated");

    let db_stream = connect_database(&ctx).await?;

    match ctx.config.dialect {
        Dialect::Postgresql => run_postgres(ctx, client_stream, db_stream, client_id, cancel).await,
        Dialect::Mysql => run_mysql(ctx, client_stream, db_stream, client_id, cancel).await,
    }
}

/// Open the database connection, upgrading to TLS when configured.
async fn connect_database(ctx: &ConnectionContext) -> Result<BoxedStream, ProxyError> {
    let address = ctx.config.db_addr();
    let mut tcp = TcpStream::connect(&address)
        .await
        .map_err(|source| ProxyError::DatabaseConnect { address: address.clone(), source })?;

    match (&ctx.config.dialect, &ctx.db_connector) {
        (Dialect::Postgresql, Some(connector)) => {
            // SSLRequest before anything else reaches the server.
            tcp.write_all(&8u32.to_be_bytes()).await?;
            tcp.write_all(&postgres::SSL_REQUEST_CODE.to_be_bytes()).await?;
            tcp.flush().await?;
            let mut answer = [0u8; 1];
            tcp.read_exact(&mut answer).await?;
            if answer[0] != b'S' {
                return Err(ProxyError::Protocol(
                    "database refused TLS but tls context is configured".into(),
                ));
            }
            let tls_settings = ctx.config.tls.as_ref().expect("connector implies settings");
            let name = tls::db_server_name(tls_settings, &ctx.config.db_host)?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| ProxyError::Handshake(format!("database TLS: {e}")))?;
            Ok(Box::new(stream))
        }
        (Dialect::Mysql, Some(_)) => Err(ProxyError::TlsConfig(
            "database-side TLS is not supported for MySQL".into(),
        )),
        _ => Ok(Box::new(tcp)),
    }
}

fn new_decryptor(ctx: &ConnectionContext, client_id: &ClientId) -> Result<RowDecryptor, ProxyError> {
    let mode = if ctx.config.injected_cell {
        DecryptorMode::InjectedCell
    } else {
        DecryptorMode::WholeCell
    };
    Ok(RowDecryptor::new(
        mode,
        ctx.config.zone_mode,
        ctx.keystore.clone(),
        client_id.clone(),
        ctx.config.poison.detect,
    )?)
}

async fn run_postgres(
    ctx: Arc<ConnectionContext>,
    client_stream: BoxedStream,
    db_stream: BoxedStream,
    client_id: ClientId,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (mut client_read, client_write) = tokio::io::split(client_stream);
    let (mut db_read, mut db_write) = tokio::io::split(db_stream);
    // Censor denials are written client-bound from the client→db pump.
    let client_write = Arc::new(Mutex::new(client_write));

    let c2d = {
        let ctx = ctx.clone();
        let client_id = client_id.clone();
        let client_write = client_write.clone();
        tokio::spawn(async move {
            // Startup phase: forwarded without inspection. SSL/GSS probes
            // are answered locally; transport security is the wrapper's job.
            loop {
                let Some(frame) = postgres::read_untyped_frame(&mut client_read).await? else {
                    return Ok::<(), ProxyError>(());
                };
                match frame.startup_code() {
                    Some(postgres::SSL_REQUEST_CODE) | Some(postgres::GSSENC_REQUEST_CODE) => {
                        client_write.lock().await.write_all(b"N").await?;
                    }
                    _ => {
                        postgres::write_frame(&mut db_write, &frame).await?;
                        if frame.startup_code() == Some(postgres::CANCEL_REQUEST_CODE) {
                            return Ok(());
                        }
                        break;
                    }
                }
            }

            loop {
                let Some(frame) = postgres::read_frame(&mut client_read).await? else {
                    return Ok(());
                };
                if frame.is_query() {
                    let sql = frame.sql().unwrap_or_default();
                    match ctx.censor.inspect(&sql, &client_id) {
                        Decision::Allow => postgres::write_frame(&mut db_write, &frame).await?,
                        Decision::Deny(reason) => {
                            tracing::warn!(
                                event_code = events::CENSOR_DENIED,
                                client_id = %client_id,
                                reason = %reason,
                                "query denied"
                            );
                            let mut writer = client_write.lock().await;
                            postgres::write_frame(&mut *writer, &postgres::error_response("42000", &reason))
                                .await?;
                            postgres::write_frame(&mut *writer, &postgres::ready_for_query_idle())
                                .await?;
                        }
                    }
                } else {
                    postgres::write_frame(&mut db_write, &frame).await?;
                    if frame.tag == postgres::TAG_TERMINATE {
                        return Ok(());
                    }
                }
            }
        })
    };

    let d2c = {
        let ctx = ctx.clone();
        let client_id = client_id.clone();
        let client_write = client_write.clone();
        let mut decryptor = new_decryptor(&ctx, &client_id)?;
        let format = ctx.config.bytea_format;
        tokio::spawn(async move {
            loop {
                let Some(frame) = postgres::read_frame(&mut db_read).await? else {
                    return Ok::<(), ProxyError>(());
                };
                let out = if frame.is_data_row() {
                    decryptor.on_row_start();
                    let rewritten = postgres::rewrite_data_row(&frame.body, |value| {
                        match bytea::decode(format, value) {
                            Some(decoded) => decryptor
                                .process_value(&decoded)
                                .map(|plain| bytea::encode(format, &plain)),
                            None => decryptor.process_value(value),
                        }
                    })?;
                    if decryptor.take_poison_detected() {
                        ctx.poison.fire(&client_id);
                    }
                    match rewritten {
                        Some(body) => postgres::PgFrame::typed(postgres::TAG_DATA_ROW, body),
                        None => frame,
                    }
                } else {
                    frame
                };
                postgres::write_frame(&mut *client_write.lock().await, &out).await?;
            }
        })
    };

    join_pumps(c2d, d2c, &mut cancel).await
}

async fn run_mysql(
    ctx: Arc<ConnectionContext>,
    client_stream: BoxedStream,
    db_stream: BoxedStream,
    client_id: ClientId,
    mut cancel: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (mut client_read, client_write) = tokio::io::split(client_stream);
    let (mut db_read, mut db_write) = tokio::io::split(db_stream);
    let client_write = Arc::new(Mutex::new(client_write));
    let tracker = Arc::new(std::sync::Mutex::new(mysql::ResponseTracker::new()));

    let c2d = {
        let ctx = ctx.clone();
        let client_id = client_id.clone();
        let client_write = client_write.clone();
        let tracker = tracker.clone();
        tokio::spawn(async move {
            loop {
                let Some(packet) = mysql::read_packet(&mut client_read).await? else {
                    return Ok::<(), ProxyError>(());
                };
                if packet.is_query() {
                    let sql = packet.sql().unwrap_or_default();
                    match ctx.censor.inspect(&sql, &client_id) {
                        Decision::Allow => {
                            tracker.lock().expect("tracker lock").query_sent();
                            mysql::write_packet(&mut db_write, &packet).await?;
                        }
                        Decision::Deny(reason) => {
                            tracing::warn!(
                                event_code = events::CENSOR_DENIED,
                                client_id = %client_id,
                                reason = %reason,
                                "query denied"
                            );
                            let error = mysql::error_packet(
                                packet.seq.wrapping_add(1),
                                mysql::CENSOR_DENIED_ERRNO,
                                mysql::CENSOR_DENIED_SQLSTATE,
                                &reason,
                            );
                            mysql::write_packet(&mut *client_write.lock().await, &error).await?;
                        }
                    }
                } else {
                    mysql::write_packet(&mut db_write, &packet).await?;
                    if packet.seq == 0 && packet.payload.first() == Some(&mysql::COM_QUIT) {
                        return Ok(());
                    }
                }
            }
        })
    };

    let d2c = {
        let ctx = ctx.clone();
        let client_id = client_id.clone();
        let client_write = client_write.clone();
        let tracker = tracker.clone();
        let mut decryptor = new_decryptor(&ctx, &client_id)?;
        tokio::spawn(async move {
            loop {
                let Some(packet) = mysql::read_packet(&mut db_read).await? else {
                    return Ok::<(), ProxyError>(());
                };
                let action = tracker.lock().expect("tracker lock").on_server_packet(&packet.payload);
                let out = match action {
                    mysql::RowAction::Forward => packet,
                    mysql::RowAction::Rewrite { ncols } => {
                        decryptor.on_row_start();
                        let rewritten = mysql::rewrite_text_row(&packet.payload, ncols, |value| {
                            decryptor.process_value(value)
                        })?;
                        if decryptor.take_poison_detected() {
                            ctx.poison.fire(&client_id);
                        }
                        match rewritten {
                            Some(payload) => mysql::MyPacket::new(packet.seq, payload),
                            None => packet,
                        }
                    }
                };
                mysql::write_packet(&mut *client_write.lock().await, &out).await?;
            }
        })
    };

    join_pumps(c2d, d2c, &mut cancel).await
}

/// Wait for either pump to finish or the server to cancel; the other pump
/// is aborted so both stream halves drop together.
async fn join_pumps(
    c2d: tokio::task::JoinHandle<Result<(), ProxyError>>,
    d2c: tokio::task::JoinHandle<Result<(), ProxyError>>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let mut c2d = c2d;
    let mut d2c = d2c;
    let result = tokio::select! {
        r = &mut c2d => flatten(r),
        r = &mut d2c => flatten(r),
        _ = cancel.changed() => Ok(()),
    };
    c2d.abort();
    d2c.abort();
    result
}

fn flatten(r: Result<Result<(), ProxyError>, tokio::task::JoinError>) -> Result<(), ProxyError> {
    match r {
        Ok(inner) => inner,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(ProxyError::Protocol(format!("pump task failed: {e}"))),
    }
}
