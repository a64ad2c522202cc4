//! Client library for the hatch daemon.
//!
//! Every request opens a fresh connection to the daemon socket. Console
//! requests keep that connection afterwards as a raw byte stream or a
//! control channel.

mod console;

use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _};

pub use console::{DaemonConnector, DaemonConsole, DaemonOperation};
pub use hatch_protocol::{ConsoleType, InstanceStatus, Request, Response, daemon_socket};

/// Longest response line read from a connection that is handed over raw.
const MAX_RESPONSE_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("hatch daemon is not running at {}", .0.display())]
    DaemonUnavailable(std::path::PathBuf),
    #[error("daemon closed the connection")]
    Closed,
    #[error("daemon error: {0}")]
    Daemon(String),
    #[error("unexpected response from daemon: {0}")]
    UnexpectedResponse(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for hatch_console::Error {
    fn from(e: Error) -> Self {
        hatch_console::Error::Service(e.to_string())
    }
}

fn unexpected(response: &Response) -> Error {
    Error::UnexpectedResponse(format!("{response:?}"))
}

/// Handle on the daemon socket.
#[derive(Debug, Clone)]
pub struct Client {
    socket: std::path::PathBuf,
}

impl Client {
    #[must_use]
    pub fn new(socket: impl Into<std::path::PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    /// `HATCH_SOCKET`, then the configured socket, then [`daemon_socket`].
    #[must_use]
    pub fn from_config(config: &hatch_config::DaemonConfig) -> Self {
        let socket = std::env::var_os(hatch_protocol::SOCKET_ENV)
            .map(std::path::PathBuf::from)
            .or_else(|| config.socket.clone())
            .unwrap_or_else(daemon_socket);
        Self::new(socket)
    }

    #[must_use]
    pub fn socket(&self) -> &std::path::Path {
        &self.socket
    }

    async fn open(&self) -> Result<tokio::net::UnixStream> {
        match tokio::net::UnixStream::connect(&self.socket).await {
            Ok(stream) => Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(Error::DaemonUnavailable(self.socket.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send(stream: &mut tokio::net::UnixStream, request: &Request) -> Result<()> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        stream.write_all(&line).await?;
        Ok(())
    }

    /// One request, one response, connection dropped.
    async fn call(&self, request: &Request) -> Result<Response> {
        let mut stream = self.open().await?;
        Self::send(&mut stream, request).await?;

        let mut reader = tokio::io::BufReader::new(stream);
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Err(Error::Closed);
        }
        Ok(serde_json::from_str(&line)?)
    }

    /// Like [`Client::call`], but keeps the connection for what follows the
    /// response line.
    ///
    /// The response is read a byte at a time so no stream bytes get buffered
    /// away from the caller.
    async fn upgrade(&self, request: &Request) -> Result<(Response, tokio::net::UnixStream)> {
        let mut stream = self.open().await?;
        Self::send(&mut stream, request).await?;

        let mut line = Vec::new();
        loop {
            let byte = match stream.read_u8().await {
                Ok(byte) => byte,
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Err(Error::Closed);
                }
                Err(e) => return Err(e.into()),
            };
            if byte == b'\n' {
                break;
            }
            line.push(byte);
            if line.len() > MAX_RESPONSE_LEN {
                return Err(Error::UnexpectedResponse(
                    "response line too long".to_string(),
                ));
            }
        }
        Ok((serde_json::from_slice(&line)?, stream))
    }

    /// Query the run state of an instance.
    pub async fn instance_state(&self, instance: &str) -> Result<InstanceStatus> {
        let response = self
            .call(&Request::InstanceState {
                instance: instance.to_string(),
            })
            .await?;
        match response {
            Response::State { status } => Ok(status),
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Fetch the console log of an instance.
    pub async fn console_log(&self, instance: &str) -> Result<Vec<u8>> {
        let response = self
            .call(&Request::ConsoleLog {
                instance: instance.to_string(),
            })
            .await?;
        match response {
            Response::ConsoleLog { content } => Ok(content),
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Start a console operation. Returns the operation ID and the
    /// connection, which now carries console bytes.
    pub async fn attach(
        &self,
        instance: &str,
        console_type: ConsoleType,
        size: (u16, u16),
        force: bool,
    ) -> Result<(String, tokio::net::UnixStream)> {
        let (response, stream) = self
            .upgrade(&Request::ConsoleAttach {
                instance: instance.to_string(),
                console_type,
                width: size.0,
                height: size.1,
                force,
            })
            .await?;
        match response {
            Response::ConsoleAttached { operation } => {
                tracing::debug!("console operation {operation} started on {instance}");
                Ok((operation, stream))
            }
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Open the control channel of an operation.
    pub async fn control(&self, operation: &str) -> Result<tokio::net::UnixStream> {
        let (response, stream) = self
            .upgrade(&Request::ConsoleControl {
                operation: operation.to_string(),
            })
            .await?;
        match response {
            Response::Ok => Ok(stream),
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Open one more data stream of a graphical operation.
    pub async fn stream(&self, operation: &str) -> Result<tokio::net::UnixStream> {
        let (response, stream) = self
            .upgrade(&Request::ConsoleStream {
                operation: operation.to_string(),
            })
            .await?;
        match response {
            Response::Ok => Ok(stream),
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }

    /// Block until an operation finishes. `Some` carries its failure.
    pub async fn wait(&self, operation: &str) -> Result<Option<String>> {
        let response = self
            .call(&Request::OperationWait {
                operation: operation.to_string(),
            })
            .await?;
        match response {
            Response::OperationDone { error } => Ok(error),
            Response::Error { message } => Err(Error::Daemon(message)),
            other => Err(unexpected(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_config_uses_configured_socket() {
        if std::env::var_os(hatch_protocol::SOCKET_ENV).is_some() {
            return;
        }
        let config = hatch_config::DaemonConfig {
            socket: Some("/run/custom/hatchd.sock".into()),
        };
        let client = Client::from_config(&config);
        assert_eq!(client.socket(), std::path::Path::new("/run/custom/hatchd.sock"));
    }

    #[tokio::test]
    async fn test_missing_daemon_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let client = Client::new(dir.path().join("hatchd.sock"));
        let err = client.instance_state("web1").await.unwrap_err();
        assert!(matches!(err, Error::DaemonUnavailable(_)));
    }
}
