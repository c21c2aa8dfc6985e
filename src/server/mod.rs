//! Server side of the call multiplexer
//!
//! A [`Server`] owns its dispatch table and cancel registry. Services are
//! registered up front through `&mut self`; serving only needs `&self`, so
//! registration always happens before any connection is accepted.

pub mod cancel;
mod connection;
pub mod dispatch;
pub mod registry;

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    errors::RegistrationError,
};

use self::{
    cancel::{CancelService, CANCEL_SERVICE},
    connection::Connection,
    dispatch::{DispatchTable, Service},
    registry::CancelRegistry,
};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct Server {
    table: Arc<DispatchTable>,
    registry: Arc<CancelRegistry>,
    config: Config,
    next_connection: AtomicU64,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let registry = Arc::new(CancelRegistry::new());
        let mut table = DispatchTable::new();
        table.install_builtin(
            CANCEL_SERVICE,
            "Cancel",
            Arc::new(CancelService::new(Arc::clone(&registry))),
        );

        Self {
            table: Arc::new(table),
            registry,
            config,
            next_connection: AtomicU64::new(1),
        }
    }

    /// Installs every method of `service` under `name`, or none of them.
    pub fn register_name(&mut self, name: &str, service: Service) -> Result<(), RegistrationError> {
        if name == CANCEL_SERVICE {
            return Err(RegistrationError::ReservedService {
                service: name.to_string(),
            });
        }

        let methods = service.len();
        Arc::make_mut(&mut self.table).install(name, service)?;
        info!(service = name, methods, "service registered");
        Ok(())
    }

    pub fn registry(&self) -> Arc<CancelRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn methods(&self) -> Vec<&str> {
        self.table.methods()
    }

    /// Serves connections from `listener` until `root` is cancelled.
    ///
    /// Each connection's calls derive their contexts from `root`; stopping the
    /// accept loop does not wait for in-flight calls. Accept failures never end
    /// the loop.
    pub async fn accept(&self, root: CancellationToken, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "accepting connections");
        }

        loop {
            let accepted = tokio::select! {
                _ = root.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => match accept_retry_delay(&err) {
                    None => {
                        warn!(error = %err, "dropped connection during accept");
                        continue;
                    }
                    Some(delay) => {
                        error!(error = %err, retry_in_ms = delay.as_millis() as u64, "failed to accept connection");
                        tokio::select! {
                            _ = root.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                },
            };

            if let Err(err) = stream.set_nodelay(true) {
                info!(peer = %peer, error = %err, "failed to disable nagle");
            }
            let connection = self.connection(peer.to_string());
            tokio::spawn(connection.serve(root.clone(), stream));
        }

        info!("accept loop stopped");
    }

    /// Serves a single already-established stream until it closes or `root`
    /// is cancelled.
    pub async fn serve_stream<S>(&self, root: CancellationToken, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.connection("stream".to_string()).serve(root, stream).await
    }

    fn connection(&self, peer: String) -> Connection {
        Connection {
            id: self.next_connection.fetch_add(1, Ordering::Relaxed),
            peer,
            table: Arc::clone(&self.table),
            registry: Arc::clone(&self.registry),
            max_frame_bytes: self.config.max_frame_bytes,
            outbound_queue: self.config.outbound_queue,
        }
    }
}

/// Failures tied to a single incoming connection are retried at once; anything
/// else, such as running out of file descriptors, backs off first.
fn accept_retry_delay(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}
