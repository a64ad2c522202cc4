//! Local socket that SPICE viewers connect to.
//!
//! The listener lives in a private temporary directory (unix) or on an
//! ephemeral loopback port (elsewhere). Every accepted connection is handed
//! to a [`Connector`] in its own task; a failing connection never disturbs
//! its siblings or the listener.

use crate::error::{Error, Result};
use crate::remote::{Connector, ProxyConnection};
use crate::signal::{DisconnectReason, DisconnectSignal};

/// Kind of local endpoint exposed to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyBackend {
    /// Filesystem unix socket, `spice+unix://` URI.
    PosixSocket,
    /// Loopback TCP, `spice://127.0.0.1:<port>` URI.
    TcpFallback,
}

impl ProxyBackend {
    /// Best backend for the running platform.
    #[must_use]
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            ProxyBackend::PosixSocket
        } else {
            ProxyBackend::TcpFallback
        }
    }

    #[must_use]
    pub fn from_choice(choice: hatch_config::ProxyBackendChoice) -> Self {
        match choice {
            hatch_config::ProxyBackendChoice::Auto => Self::platform_default(),
            hatch_config::ProxyBackendChoice::Unix => ProxyBackend::PosixSocket,
            hatch_config::ProxyBackendChoice::Tcp => ProxyBackend::TcpFallback,
        }
    }
}

enum Acceptor {
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Tcp(tokio::net::TcpListener),
}

impl Acceptor {
    async fn accept(&self) -> std::io::Result<ProxyConnection> {
        match self {
            #[cfg(unix)]
            Acceptor::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(Box::new(stream))
            }
            Acceptor::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!("viewer connected from {peer}");
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// An opened, not yet serving, proxy endpoint.
pub struct SocketProxyListener {
    acceptor: Acceptor,
    uri: String,
    /// Holds the socket file; removing it removes the socket.
    socket_dir: Option<tempfile::TempDir>,
}

impl SocketProxyListener {
    /// Create the listening endpoint. Nothing is left on disk on failure.
    pub fn open(backend: ProxyBackend) -> Result<Self> {
        let listener = match backend {
            ProxyBackend::PosixSocket => Self::open_unix()?,
            ProxyBackend::TcpFallback => Self::open_tcp()?,
        };
        tracing::info!("console proxy listening on {}", listener.uri);
        Ok(listener)
    }

    #[cfg(unix)]
    fn open_unix() -> Result<Self> {
        Self::open_unix_in(&std::env::temp_dir())
    }

    #[cfg(unix)]
    fn open_unix_in(root: &std::path::Path) -> Result<Self> {
        let socket_dir = tempfile::Builder::new()
            .prefix("hatch_spice_")
            .tempdir_in(root)
            .map_err(Error::ProxySetup)?;
        let path = socket_dir.path().join("socket");
        // On error the directory is dropped, and removed, along with it.
        let listener = tokio::net::UnixListener::bind(&path).map_err(Error::ProxySetup)?;
        Ok(Self {
            acceptor: Acceptor::Unix(listener),
            uri: format!("spice+unix://{}", path.display()),
            socket_dir: Some(socket_dir),
        })
    }

    #[cfg(not(unix))]
    fn open_unix() -> Result<Self> {
        Err(Error::ProxySetup(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "unix sockets are not available on this platform",
        )))
    }

    fn open_tcp() -> Result<Self> {
        let std_listener = std::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
            .map_err(Error::ProxySetup)?;
        std_listener
            .set_nonblocking(true)
            .map_err(Error::ProxySetup)?;
        let listener = tokio::net::TcpListener::from_std(std_listener).map_err(Error::ProxySetup)?;
        let port = listener.local_addr().map_err(Error::ProxySetup)?.port();
        Ok(Self {
            acceptor: Acceptor::Tcp(listener),
            uri: format!("spice://127.0.0.1:{port}"),
            socket_dir: None,
        })
    }

    /// URI to hand to a viewer.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Filesystem path of the socket, for the unix backend.
    #[must_use]
    pub fn socket_path(&self) -> Option<std::path::PathBuf> {
        self.socket_dir.as_ref().map(|dir| dir.path().join("socket"))
    }

    /// Stop listening without ever serving.
    pub fn close(self) -> Result<()> {
        drop(self.acceptor);
        if let Some(dir) = self.socket_dir {
            dir.close().map_err(Error::ProxySetup)?;
        }
        Ok(())
    }

    /// Start accepting connections and forwarding them through `connector`.
    ///
    /// Closing `cancel` cancels in-flight forwards as well.
    pub fn serve<C: Connector>(self, connector: C, cancel: DisconnectSignal) -> ProxyHandle {
        let stop = DisconnectSignal::new();
        let (first_tx, first_rx) = tokio::sync::watch::channel(false);
        let (active_tx, active_rx) = tokio::sync::watch::channel(0usize);
        let (done_tx, done_rx) = tokio::sync::watch::channel(false);
        let uri = self.uri.clone();

        let state = AcceptState {
            stop: stop.clone(),
            cancel: cancel.clone(),
            first: first_tx,
            active: active_tx,
            done: done_tx,
        };
        let task = tokio::spawn(accept_loop(self, connector, state));

        ProxyHandle {
            uri,
            stop,
            cancel,
            first: first_rx,
            active: active_rx,
            done: done_rx,
            task,
        }
    }
}

struct AcceptState {
    stop: DisconnectSignal,
    cancel: DisconnectSignal,
    first: tokio::sync::watch::Sender<bool>,
    active: tokio::sync::watch::Sender<usize>,
    done: tokio::sync::watch::Sender<bool>,
}

type ForwardResult = (u64, Result<()>);

async fn accept_loop<C: Connector>(listener: SocketProxyListener, connector: C, state: AcceptState) {
    let SocketProxyListener {
        acceptor,
        uri,
        socket_dir,
    } = listener;
    let mut forwards: tokio::task::JoinSet<ForwardResult> = tokio::task::JoinSet::new();
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            _ = state.stop.closed() => break,
            accepted = acceptor.accept() => match accepted {
                Ok(conn) => {
                    next_id += 1;
                    let id = next_id;
                    tracing::debug!("viewer connection {id} accepted");
                    let connector = connector.clone();
                    let cancel = state.cancel.clone();
                    forwards.spawn(async move {
                        tokio::select! {
                            result = connector.connect(conn) => (id, result),
                            _ = cancel.closed() => (id, Ok(())),
                        }
                    });
                    // Count before announcing, so a first connection is never seen as idle.
                    state.active.send_replace(forwards.len());
                    state.first.send_replace(true);
                }
                Err(e) => {
                    tracing::warn!("accept failed on {uri}: {e}");
                    break;
                }
            },
            Some(joined) = forwards.join_next() => {
                log_forward(joined);
                state.active.send_replace(forwards.len());
            }
        }
    }

    drop(acceptor);
    if let Some(dir) = socket_dir
        && let Err(e) = dir.close()
    {
        tracing::warn!("failed to remove proxy socket for {uri}: {e}");
    }
    tracing::info!("console proxy on {uri} closed");

    while let Some(joined) = forwards.join_next().await {
        log_forward(joined);
        state.active.send_replace(forwards.len());
    }
    state.done.send_replace(true);
}

fn log_forward(joined: std::result::Result<ForwardResult, tokio::task::JoinError>) {
    match joined {
        Ok((id, Ok(()))) => tracing::debug!("viewer connection {id} finished"),
        Ok((id, Err(e))) => tracing::debug!("viewer connection {id} failed: {e}"),
        Err(e) => tracing::warn!("viewer connection task failed: {e}"),
    }
}

/// A serving proxy. Dropping it tears everything down immediately.
pub struct ProxyHandle {
    uri: String,
    stop: DisconnectSignal,
    cancel: DisconnectSignal,
    first: tokio::sync::watch::Receiver<bool>,
    active: tokio::sync::watch::Receiver<usize>,
    done: tokio::sync::watch::Receiver<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Resolves once a first viewer connected; `false` if the proxy stopped
    /// before any did.
    pub async fn first_connection(&self) -> bool {
        let mut first = self.first.clone();
        first.wait_for(|connected| *connected).await.is_ok()
    }

    #[must_use]
    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Resolves when no forwards are in flight.
    pub async fn idle(&self) {
        let mut active = self.active.clone();
        let _ = active.wait_for(|n| *n == 0).await;
    }

    /// Stop accepting and wait for in-flight forwards to finish on their own.
    pub async fn close(&self) {
        self.stop.close(DisconnectReason::Detached);
        self.finished().await;
    }

    /// Stop accepting and cancel in-flight forwards.
    pub async fn abort(&self) {
        self.cancel.close(DisconnectReason::Detached);
        self.stop.close(DisconnectReason::Detached);
        self.finished().await;
    }

    async fn finished(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|done| *done).await;
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
