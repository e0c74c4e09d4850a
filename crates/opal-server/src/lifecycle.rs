//! Signal handling, graceful drain and graceful restart.
//!
//! `ServerLifecycle` owns the shutdown and error channels explicitly and
//! is passed to the run loop at construction; there is no process-global
//! signal state. Exit behavior:
//!
//! - SIGTERM / SIGINT: stop accepting, drain up to the configured
//!   timeout, exit 0 on a clean drain, 1 when connections were cut.
//! - SIGHUP: stop accepting, fork-exec the same binary with the listener
//!   descriptors duplicated onto fixed slots, drain, exit 0.
//! - Error channel (fatal accept error, poison shutdown): stop accepting,
//!   drain, force-close, exit 1.

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::sync::mpsc;

use opal_core::events;

use crate::counter::WaitTimeout;
use crate::server::{Server, DESCRIPTOR_API, DESCRIPTOR_DATA, GRACEFUL_ENV};

/// The process-level control surface: both signal streams plus the error
/// channel, owned as a value.
pub struct ServerLifecycle {
    sigterm: Signal,
    sigint: Signal,
    sighup: Signal,
    pub error_tx: mpsc::UnboundedSender<String>,
    error_rx: mpsc::UnboundedReceiver<String>,
}

impl ServerLifecycle {
    /// Register the signal handlers. Failure here is fatal at startup.
    pub fn new() -> std::io::Result<Self> {
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sighup: signal(SignalKind::hangup())?,
            error_tx,
            error_rx,
        })
    }

    /// Dispatch signals until the process exits; every arm terminates the
    /// process, so this never returns.
    pub async fn run(mut self, server: Server, drain_timeout: Duration, restart: RestartContext) {
        loop {
            tokio::select! {
                _ = self.sigterm.recv() => {
                    tracing::info!("received SIGTERM");
                    graceful_shutdown(&server, drain_timeout).await;
                }
                _ = self.sigint.recv() => {
                    tracing::info!("received SIGINT");
                    graceful_shutdown(&server, drain_timeout).await;
                }
                _ = self.sighup.recv() => {
                    tracing::info!("received SIGHUP");
                    graceful_restart(&server, drain_timeout, &restart).await;
                }
                Some(reason) = self.error_rx.recv() => {
                    tracing::error!(
                        event_code = events::SYSTEM_ERROR,
                        reason = %reason,
                        "shutting down on internal error"
                    );
                    error_shutdown(&server, drain_timeout).await;
                }
            }
        }
    }
}

async fn graceful_shutdown(server: &Server, drain_timeout: Duration) {
    tracing::debug!("stop accepting new connections, waiting for drain");
    server.stop_accepting();
    match server.counter.wait_with_timeout(drain_timeout).await {
        Ok(()) => {
            tracing::info!(pid = std::process::id(), "graceful shutdown completed");
            std::process::exit(0);
        }
        Err(WaitTimeout) => {
            tracing::warn!(
                active = server.counter.active(),
                "drain timeout, cutting remaining connections"
            );
            server.force_close_connections();
            std::process::exit(1);
        }
    }
}

async fn error_shutdown(server: &Server, drain_timeout: Duration) {
    server.stop_accepting();
    if server.counter.wait_with_timeout(drain_timeout).await.is_err() {
        tracing::warn!(
            active = server.counter.active(),
            "drain timeout, cutting remaining connections"
        );
        server.force_close_connections();
    }
    std::process::exit(1);
}

/// Everything the restart path needs to recreate this process.
pub struct RestartContext {
    /// Duplicated data-listener descriptor, kept alive for the child.
    pub data_fd: RawFd,
    /// Duplicated API-listener descriptor; present iff the API listener
    /// was started.
    pub api_fd: Option<RawFd>,
}

async fn graceful_restart(server: &Server, drain_timeout: Duration, restart: &RestartContext) {
    server.stop_accepting();

    match spawn_successor(restart) {
        Ok(child_pid) => {
            tracing::info!(child_pid, "successor process forked");
        }
        Err(e) => {
            tracing::error!(
                event_code = events::CANT_FORK_PROCESS,
                error = %e,
                "failed to fork successor"
            );
            std::process::exit(1);
        }
    }

    if server.counter.wait_with_timeout(drain_timeout).await.is_err() {
        tracing::warn!(
            active = server.counter.active(),
            "restart drain timeout, cutting remaining connections"
        );
        server.force_close_connections();
    }
    tracing::info!(pid = std::process::id(), "graceful restart completed");
    std::process::exit(0);
}

/// Fork-exec the same binary with identical arguments; the duplicated
/// listener descriptors land on the fixed slots before exec.
fn spawn_successor(restart: &RestartContext) -> std::io::Result<u32> {
    use std::os::unix::process::CommandExt;

    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    let data_fd = restart.data_fd;
    let api_fd = restart.api_fd;

    let mut command = std::process::Command::new(exe);
    command.args(args).env(GRACEFUL_ENV, "true");
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(data_fd, DESCRIPTOR_DATA) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if let Some(api_fd) = api_fd {
                if libc::dup2(api_fd, DESCRIPTOR_API) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
    let child = command.spawn()?;
    Ok(child.id())
}

/// Duplicate a listener's descriptor so it survives for the restart path
/// independently of the accept loop's ownership.
pub fn dup_listener_fd(listener: &TcpListener) -> std::io::Result<RawFd> {
    let fd = unsafe { libc::dup(listener.as_raw_fd()) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(fd)
}

/// Rebuild a listener from an inherited descriptor slot.
pub fn listener_from_fd(fd: RawFd) -> std::io::Result<TcpListener> {
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    std_listener.set_nonblocking(true)?;
    TcpListener::from_std(std_listener)
}

/// True when this process was started by a graceful restart and must
/// reconstruct its listeners from inherited descriptors.
pub fn is_graceful_restart_child() -> bool {
    std::env::var(GRACEFUL_ENV).as_deref() == Ok("true")
}
