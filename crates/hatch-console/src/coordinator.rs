//! Top-level console sequencing for both console types.

use tokio::io::AsyncWriteExt as _;

use crate::control::ResizeEvents;
use crate::error::{Error, Result};
use crate::escape::DetachKeys;
use crate::proxy::{ProxyBackend, ProxyHandle, SocketProxyListener};
use crate::remote::{
    ConsoleService, Connector, GraphicalAttachOptions, InstanceStatus, Operation as _,
    ProxyConnection,
};
use crate::session::{SessionOptions, TerminalSession};
use crate::signal::{DisconnectReason, DisconnectSignal};
use crate::terminal::Terminal;
use crate::viewer::ViewerLauncher;

/// Kind of console to attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleMode {
    /// Serial console on the local terminal.
    Text,
    /// SPICE console in an external viewer.
    Graphical,
}

impl std::str::FromStr for ConsoleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "console" | "text" => Ok(ConsoleMode::Text),
            "vga" | "graphical" => Ok(ConsoleMode::Graphical),
            other => Err(Error::UnknownMode(other.to_string())),
        }
    }
}

/// One attachment attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub instance: String,
    pub mode: ConsoleMode,
    /// Take over a console held by another client.
    pub force: bool,
    /// Print the console log instead of attaching.
    pub show_log: bool,
}

impl Session {
    /// Validate and build a session request.
    pub fn new(
        instance: impl Into<String>,
        mode: &str,
        force: bool,
        show_log: bool,
    ) -> Result<Self> {
        let mode: ConsoleMode = mode.parse()?;
        if show_log && mode != ConsoleMode::Text {
            return Err(Error::ShowLogRequiresText);
        }
        Ok(Self {
            instance: instance.into(),
            mode,
            force,
            show_log,
        })
    }
}

/// Drives a [`Session`] from attach to teardown.
pub struct ConsoleCoordinator<S, T, V> {
    service: S,
    terminal: T,
    viewer: V,
    keys: DetachKeys,
    hint: String,
    backend: ProxyBackend,
    interrupt: Option<DisconnectSignal>,
}

impl<S, T, V> ConsoleCoordinator<S, T, V>
where
    S: ConsoleService,
    T: Terminal,
    V: ViewerLauncher,
{
    pub fn new(service: S, terminal: T, viewer: V) -> Self {
        Self {
            service,
            terminal,
            viewer,
            keys: DetachKeys::default(),
            hint: "<ctrl>+a q".to_string(),
            backend: ProxyBackend::platform_default(),
            interrupt: None,
        }
    }

    #[must_use]
    pub fn with_detach_keys(mut self, keys: DetachKeys, hint: impl Into<String>) -> Self {
        self.keys = keys;
        self.hint = hint.into();
        self
    }

    #[must_use]
    pub fn with_proxy_backend(mut self, backend: ProxyBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Closing `interrupt` ends a graphical console as if its viewer had
    /// exited.
    #[must_use]
    pub fn with_interrupt(mut self, interrupt: DisconnectSignal) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub async fn run(&self, session: &Session, resize: Option<ResizeEvents>) -> Result<()> {
        match session.mode {
            ConsoleMode::Text if session.show_log => self.show_log(&session.instance).await,
            ConsoleMode::Text => self.run_text(session, resize).await,
            ConsoleMode::Graphical if session.show_log => Err(Error::ShowLogRequiresText),
            ConsoleMode::Graphical => self.run_graphical(session).await,
        }
    }

    /// Write the instance's console log to the local output verbatim.
    pub async fn show_log(&self, instance: &str) -> Result<()> {
        let log = self.service.fetch_console_log(instance).await?;
        let mut output = self.terminal.output();
        output.write_all(&log).await?;
        output.flush().await?;
        Ok(())
    }

    async fn run_text(&self, session: &Session, resize: Option<ResizeEvents>) -> Result<()> {
        let terminal_session =
            TerminalSession::new(&self.terminal, self.keys).with_hint(self.hint.clone());
        let options = SessionOptions {
            force: session.force,
            resize,
        };
        let err = match terminal_session
            .run(&self.service, &session.instance, options)
            .await
        {
            Ok(()) => return Ok(()),
            Err(e) if e.is_session_failure() => e,
            Err(e) => return Err(e),
        };

        // A console that died with its instance is better shown as its log.
        match self.service.instance_status(&session.instance).await {
            Ok(InstanceStatus::Stopped) => {
                tracing::info!(
                    "{} stopped during the session ({err}), showing console log",
                    session.instance
                );
                self.show_log(&session.instance).await
            }
            Ok(status) => {
                tracing::debug!("{} is {status:?}, not falling back to log", session.instance);
                Err(err)
            }
            Err(status_err) => {
                tracing::debug!("failed to query {} state: {status_err}", session.instance);
                Err(err)
            }
        }
    }

    async fn run_graphical(&self, session: &Session) -> Result<()> {
        let listener = SocketProxyListener::open(self.backend)?;
        let uri = listener.uri().to_string();

        let mut viewer = self.viewer.launch(&uri)?;
        if viewer.is_none() {
            let notice = format!("No SPICE viewer found. Point a SPICE client at: {uri}\n");
            let mut output = self.terminal.output();
            output.write_all(notice.as_bytes()).await?;
            output.flush().await?;
        }

        let (connector_tx, connector_rx) = tokio::sync::watch::channel(None);
        let proxy = listener.serve(
            PendingConnector { rx: connector_rx },
            DisconnectSignal::new(),
        );

        tokio::select! {
            connected = proxy.first_connection() => {
                if !connected {
                    return Err(Error::ProxySetup(std::io::Error::other(
                        "console proxy stopped before a viewer connected",
                    )));
                }
            }
            status = wait_viewer(&mut viewer) => {
                proxy.abort().await;
                return match status {
                    Ok(status) if status.success() => Ok(()),
                    Ok(status) => Err(Error::Viewer(format!(
                        "viewer exited with {status} before connecting"
                    ))),
                    Err(e) => Err(Error::Viewer(e.to_string())),
                };
            }
            () = interrupted(self.interrupt.as_ref()) => {
                tracing::debug!("interrupted before a viewer connected");
                proxy.abort().await;
                stop_viewer(&mut viewer).await;
                return Ok(());
            }
        }
        tracing::debug!("first viewer connected to {uri}");

        let disconnect = DisconnectSignal::new();
        let attached = self
            .service
            .attach_graphical(
                &session.instance,
                GraphicalAttachOptions {
                    force: session.force,
                    disconnect: disconnect.clone(),
                },
            )
            .await;
        let (operation, connector) = match attached {
            Ok(attached) => attached,
            Err(e) => {
                proxy.abort().await;
                stop_viewer(&mut viewer).await;
                return Err(e);
            }
        };
        connector_tx.send_replace(Some(connector));

        let wait = operation.wait();
        tokio::pin!(wait);
        let result = tokio::select! {
            result = &mut wait => {
                tracing::debug!("graphical console operation on {} ended", session.instance);
                proxy.abort().await;
                stop_viewer(&mut viewer).await;
                result
            }
            () = viewers_gone(&mut viewer, &proxy) => {
                tracing::debug!("all viewers of {} disconnected", session.instance);
                disconnect.close(DisconnectReason::Detached);
                wait.await
            }
            () = interrupted(self.interrupt.as_ref()) => {
                tracing::debug!("graphical console of {} interrupted", session.instance);
                disconnect.close(DisconnectReason::Detached);
                proxy.abort().await;
                stop_viewer(&mut viewer).await;
                wait.await
            }
        };

        result.map_err(|e| match e {
            e @ Error::Remote { .. } => e,
            other => Error::Remote {
                instance: session.instance.clone(),
                message: other.to_string(),
            },
        })
    }
}

/// Forwards wait here until the remote console is attached.
#[derive(Clone)]
struct PendingConnector<C> {
    rx: tokio::sync::watch::Receiver<Option<C>>,
}

impl<C: Connector> Connector for PendingConnector<C> {
    async fn connect(&self, conn: ProxyConnection) -> Result<()> {
        let mut rx = self.rx.clone();
        let connector = match rx.wait_for(Option::is_some).await {
            Ok(connector) => connector.clone(),
            Err(_) => None,
        };
        match connector {
            Some(connector) => connector.connect(conn).await,
            None => Err(Error::Forwarding(std::io::Error::other(
                "console closed before the remote side was ready",
            ))),
        }
    }
}

async fn interrupted(interrupt: Option<&DisconnectSignal>) {
    match interrupt {
        Some(signal) => {
            signal.closed().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_viewer(
    viewer: &mut Option<tokio::process::Child>,
) -> std::io::Result<std::process::ExitStatus> {
    match viewer {
        Some(child) => child.wait().await,
        None => std::future::pending().await,
    }
}

async fn stop_viewer(viewer: &mut Option<tokio::process::Child>) {
    if let Some(child) = viewer {
        if let Err(e) = child.start_kill() {
            tracing::debug!("viewer already gone: {e}");
        }
        let _ = child.wait().await;
    }
}

/// The viewer process exited (or, without one, the last connection closed)
/// and every forward has drained.
async fn viewers_gone(viewer: &mut Option<tokio::process::Child>, proxy: &ProxyHandle) {
    match viewer {
        Some(child) => {
            let status = child.wait().await;
            tracing::debug!("viewer exited: {status:?}");
        }
        None => proxy.idle().await,
    }
    proxy.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("console".parse::<ConsoleMode>().unwrap(), ConsoleMode::Text);
        assert_eq!("vga".parse::<ConsoleMode>().unwrap(), ConsoleMode::Graphical);
        assert!(matches!(
            "serial".parse::<ConsoleMode>(),
            Err(Error::UnknownMode(m)) if m == "serial"
        ));
    }

    #[test]
    fn test_session_rejects_graphical_log() {
        assert!(matches!(
            Session::new("web1", "vga", false, true),
            Err(Error::ShowLogRequiresText)
        ));
        let session = Session::new("web1", "console", true, true).unwrap();
        assert!(session.force && session.show_log);
        assert_eq!(session.mode, ConsoleMode::Text);
    }
}
