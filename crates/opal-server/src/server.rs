//! Listener ownership and accept loops.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use opal_core::events;
use opal_proxy::pipeline::ConnectionContext;
use opal_proxy::serve_connection;

use crate::counter::ConnectionCounter;

/// Fixed descriptor slots a restarted child inherits its listeners on.
pub const DESCRIPTOR_DATA: i32 = 3;
pub const DESCRIPTOR_API: i32 = 4;

/// Environment flag marking a graceful-restart child.
pub const GRACEFUL_ENV: &str = "GRACEFUL_RESTART";

pub struct Server {
    pub ctx: Arc<ConnectionContext>,
    pub counter: Arc<ConnectionCounter>,
    /// Stops the accept loops; active connections keep running.
    pub stop_accept_tx: watch::Sender<bool>,
    /// Forcibly cancels active connection pipelines.
    pub force_close_tx: watch::Sender<bool>,
    pub error_tx: mpsc::UnboundedSender<String>,
}

impl Server {
    pub fn new(ctx: Arc<ConnectionContext>, error_tx: mpsc::UnboundedSender<String>) -> Self {
        let (stop_accept_tx, _) = watch::channel(false);
        let (force_close_tx, _) = watch::channel(false);
        Self {
            ctx,
            counter: ConnectionCounter::new(),
            stop_accept_tx,
            force_close_tx,
            error_tx,
        }
    }

    /// Run the data accept loop until told to stop. Each accepted socket
    /// gets its own task and counter guard.
    pub fn spawn_accept_loop(&self, listener: TcpListener) -> JoinHandle<()> {
        let ctx = self.ctx.clone();
        let counter = self.counter.clone();
        let mut stop = self.stop_accept_tx.subscribe();
        let force_close = self.force_close_tx.subscribe();
        let error_tx = self.error_tx.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.changed() => {
                        tracing::debug!("data listener stopped accepting");
                        return;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            tracing::debug!(peer = %peer, "new connection");
                            let guard = counter.acquire();
                            let ctx = ctx.clone();
                            let cancel = force_close.clone();
                            tokio::spawn(async move {
                                let _guard = guard;
                                if let Err(e) = serve_connection(ctx, socket, cancel).await {
                                    log_connection_error(&e);
                                }
                            });
                        }
                        Err(e) => {
                            if is_fatal_accept_error(&e) {
                                tracing::error!(
                                    event_code = events::CANT_ACCEPT_CONNECTION,
                                    error = %e,
                                    "fatal accept error"
                                );
                                let _ = error_tx.send(format!("accept failed: {e}"));
                                return;
                            }
                            tracing::warn!(error = %e, "transient accept error");
                        }
                    }
                }
            }
        })
    }

    pub fn stop_accepting(&self) {
        let _ = self.stop_accept_tx.send(true);
    }

    pub fn force_close_connections(&self) {
        let _ = self.force_close_tx.send(true);
    }
}

fn log_connection_error(e: &opal_proxy::ProxyError) {
    use opal_proxy::ProxyError;
    match e {
        ProxyError::Handshake(_) => tracing::warn!(
            event_code = events::HANDSHAKE_FAILED,
            error = %e,
            "connection handshake failed"
        ),
        ProxyError::Protocol(_) => tracing::warn!(
            event_code = events::PROTOCOL_ERROR,
            error = %e,
            "connection protocol error"
        ),
        ProxyError::Keystore(_) => tracing::warn!(
            event_code = events::KEYSTORE_ERROR,
            error = %e,
            "connection keystore error"
        ),
        _ => tracing::warn!(error = %e, "connection closed with error"),
    }
}

/// Per-connection failures keep the loop alive; resource exhaustion and
/// listener teardown do not.
fn is_fatal_accept_error(e: &std::io::Error) -> bool {
    !matches!(
        e.kind(),
        std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::WouldBlock
            | std::io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_not_fatal() {
        for kind in [
            std::io::ErrorKind::ConnectionAborted,
            std::io::ErrorKind::ConnectionReset,
            std::io::ErrorKind::Interrupted,
        ] {
            assert!(!is_fatal_accept_error(&kind.into()));
        }
        assert!(is_fatal_accept_error(
            &std::io::ErrorKind::InvalidInput.into()
        ));
    }
}
