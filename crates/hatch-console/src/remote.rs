//! The remote console service as seen by the attachment code.

use std::future::Future;

pub use hatch_protocol::InstanceStatus;

use crate::error::Result;
use crate::signal::DisconnectSignal;

/// A bidirectional byte stream.
pub trait ConsoleStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static {}

impl<T> ConsoleStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static {}

/// One local viewer connection accepted by the proxy.
pub type ProxyConnection = Box<dyn ConsoleStream>;

/// Parameters of a text console attach.
#[derive(Debug, Clone)]
pub struct TextAttachOptions {
    pub width: u16,
    pub height: u16,
    /// Take over a console held by another client.
    pub force: bool,
    /// Closed by the service when the remote side ends, and by the local
    /// side to request teardown.
    pub disconnect: DisconnectSignal,
}

/// Parameters of a graphical console attach.
#[derive(Debug, Clone)]
pub struct GraphicalAttachOptions {
    pub force: bool,
    pub disconnect: DisconnectSignal,
}

/// Streams of an attached text console.
pub struct TextAttachment<S, O> {
    /// Raw console bytes in both directions.
    pub data: S,
    /// Control messages, see [`crate::control`].
    pub control: S,
    pub operation: O,
}

/// A running remote console operation.
pub trait Operation: Send + 'static {
    /// Wait for the operation to finish.
    fn wait(self) -> impl Future<Output = Result<()>> + Send;
}

/// Callback binding one local connection to the remote console stream.
pub trait Connector: Clone + Send + Sync + 'static {
    /// Forward `conn` until either side closes.
    fn connect(&self, conn: ProxyConnection) -> impl Future<Output = Result<()>> + Send;
}

/// Remote instance console API.
pub trait ConsoleService: Send + Sync {
    type Stream: ConsoleStream;
    type Operation: Operation;
    type Connector: Connector;

    /// Attach to the text console. Rejections are [`crate::Error::AttachRejected`].
    fn attach_text(
        &self,
        instance: &str,
        options: TextAttachOptions,
    ) -> impl Future<Output = Result<TextAttachment<Self::Stream, Self::Operation>>> + Send;

    /// Start a graphical console operation; each local viewer connection is
    /// then bound through the returned connector.
    fn attach_graphical(
        &self,
        instance: &str,
        options: GraphicalAttachOptions,
    ) -> impl Future<Output = Result<(Self::Operation, Self::Connector)>> + Send;

    fn fetch_console_log(&self, instance: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;

    fn instance_status(&self, instance: &str) -> impl Future<Output = Result<InstanceStatus>> + Send;
}
