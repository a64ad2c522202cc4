/// Errors produced while attaching to or running a console session.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to configure terminal raw mode: {0}")]
    RawMode(#[source] std::io::Error),
    #[error("another console session is already active in this process")]
    SessionActive,
    #[error("console attach to '{instance}' rejected: {message}")]
    AttachRejected { instance: String, message: String },
    #[error("console stream for '{instance}' failed: {source}")]
    Stream {
        instance: String,
        #[source]
        source: std::io::Error,
    },
    #[error("console session on '{instance}' failed: {message}")]
    Remote { instance: String, message: String },
    #[error("failed to set up local console socket: {0}")]
    ProxySetup(#[source] std::io::Error),
    #[error("failed to forward viewer connection: {0}")]
    Forwarding(#[source] std::io::Error),
    #[error("unknown console type {0:?}, expected `console` or `vga`")]
    UnknownMode(String),
    #[error("the console log is only available for text consoles")]
    ShowLogRequiresText,
    #[error("viewer failed: {0}")]
    Viewer(String),
    #[error("console service error: {0}")]
    Service(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the failure happened inside an established session, which is
    /// when a stopped instance is worth checking for.
    #[must_use]
    pub fn is_session_failure(&self) -> bool {
        matches!(self, Error::Remote { .. } | Error::Stream { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
