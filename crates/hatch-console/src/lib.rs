//! Interactive console attachment for remote instances.
//!
//! A text console runs on the local terminal in raw mode: keyboard input is
//! forwarded to the instance until the detach sequence is typed, remote
//! output is copied to the screen, and terminal size changes travel over a
//! separate control channel. A graphical console is exposed to a local SPICE
//! viewer through a temporary socket proxy.
//!
//! [`ConsoleCoordinator`] ties both together behind a [`ConsoleService`],
//! the remote API this crate is driven against.

pub mod control;
mod coordinator;
mod error;
pub mod escape;
pub mod proxy;
pub mod remote;
mod session;
mod signal;
pub mod terminal;
mod viewer;

pub use coordinator::{ConsoleCoordinator, ConsoleMode, Session};
pub use error::{Error, Result};
pub use escape::{DetachKeys, EscapeDetector, Keystroke};
pub use proxy::{ProxyBackend, ProxyHandle, SocketProxyListener};
pub use remote::{
    ConsoleService, ConsoleStream, Connector, GraphicalAttachOptions, InstanceStatus, Operation,
    ProxyConnection, TextAttachOptions, TextAttachment,
};
pub use session::{SessionOptions, TerminalSession};
pub use signal::{DisconnectReason, DisconnectSignal};
pub use terminal::{HostTerminal, RawModeGuard, Terminal};
pub use viewer::{CommandViewer, NoViewer, ViewerLauncher};
