//! Interactive text console session.

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::control::{ControlChannel, ResizeEvents};
use crate::error::{Error, Result};
use crate::escape::{DetachKeys, EscapeDetector};
use crate::remote::{ConsoleService, Operation as _, TextAttachOptions};
use crate::signal::{DisconnectReason, DisconnectSignal};
use crate::terminal::{RawModeGuard, Terminal, size_or_default};

const IO_BUFFER_SIZE: usize = 4096;

/// How long a detach waits for pending input to reach the remote.
const DETACH_DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// Per-run options of a [`TerminalSession`].
#[derive(Default)]
pub struct SessionOptions {
    /// Take over a console held by another client.
    pub force: bool,
    /// Local size changes to forward after the initial resize.
    pub resize: Option<ResizeEvents>,
}

/// Runs one text console attachment on a local terminal.
pub struct TerminalSession<'a, T: Terminal> {
    terminal: &'a T,
    keys: DetachKeys,
    hint: String,
}

impl<'a, T: Terminal> TerminalSession<'a, T> {
    pub fn new(terminal: &'a T, keys: DetachKeys) -> Self {
        Self {
            terminal,
            keys,
            hint: "<ctrl>+a q".to_string(),
        }
    }

    /// How the detach sequence is shown to the user.
    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }

    /// Attach to `instance` and shuttle bytes until either side disconnects.
    ///
    /// Raw mode is held for the whole call and restored on every return path.
    pub async fn run<S: ConsoleService>(
        &self,
        service: &S,
        instance: &str,
        options: SessionOptions,
    ) -> Result<()> {
        let _raw = RawModeGuard::acquire(self.terminal)?;
        let (width, height) = size_or_default(self.terminal);

        let disconnect = DisconnectSignal::new();
        let attachment = service
            .attach_text(
                instance,
                TextAttachOptions {
                    width,
                    height,
                    force: options.force,
                    disconnect: disconnect.clone(),
                },
            )
            .await?;
        tracing::debug!("attached to console of {instance} at {width}x{height}");

        let mut output = self.terminal.output();
        let hint = format!("To detach from the console, press: {}\r\n", self.hint);
        let printed = match output.write_all(hint.as_bytes()).await {
            Ok(()) => output.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = printed {
            tracing::warn!("failed to print detach hint: {e}");
        }

        let mut control = ControlChannel::new(attachment.control);
        if let Err(e) = control.send_resize(width, height).await {
            tracing::warn!("failed to send initial window size: {e}");
        }
        let control_task = tokio::spawn(control.run(options.resize, disconnect.clone()));

        let (remote_read, remote_write) = tokio::io::split(attachment.data);
        let detector = EscapeDetector::new(self.keys, disconnect.clone());
        let input_task = tokio::spawn(pump_input(
            self.terminal.input(),
            remote_write,
            detector,
            disconnect.clone(),
        ));
        let output_task = tokio::spawn(pump_output(remote_read, output, disconnect.clone()));

        let reason = disconnect.closed().await;
        tracing::debug!("console of {instance} ending: {reason:?}");

        // Keys typed ahead of the detach sequence may still be in flight.
        let grace = if reason == DisconnectReason::Detached {
            DETACH_DRAIN_TIMEOUT
        } else {
            std::time::Duration::ZERO
        };
        let input = join_within(input_task, grace).await;
        // Blocked reads never return on their own once the other side is gone,
        // so the first close wins and a later error from a sibling is dropped.
        output_task.abort();
        control_task.abort();
        let mut stream_error = None;
        for joined in [input, output_task.await.ok()] {
            if let Some(Err(e)) = joined {
                stream_error.get_or_insert(e);
            }
        }
        let _ = control_task.await;

        let waited = attachment.operation.wait().await;

        let mut output = self.terminal.output();
        let _ = output.write_all(b"\r\n").await;
        let _ = output.flush().await;

        if let Err(e) = waited {
            return Err(match e {
                e @ Error::Remote { .. } => e,
                other => Error::Remote {
                    instance: instance.to_string(),
                    message: other.to_string(),
                },
            });
        }
        if let Some(source) = stream_error {
            return Err(Error::Stream {
                instance: instance.to_string(),
                source,
            });
        }
        Ok(())
    }
}

/// Join `task`, aborting it if it has not finished within `grace`.
async fn join_within<T>(
    mut task: tokio::task::JoinHandle<T>,
    grace: std::time::Duration,
) -> Option<T> {
    if let Ok(joined) = tokio::time::timeout(grace, &mut task).await {
        return joined.ok();
    }
    task.abort();
    task.await.ok()
}

/// Peer went away rather than the stream failing.
fn is_disconnect(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::UnexpectedEof
    )
}

/// Local keyboard to remote console, through the detach detector.
async fn pump_input<R, W>(
    mut local: R,
    mut remote: W,
    mut detector: EscapeDetector,
    signal: DisconnectSignal,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        let n = match local.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("local input closed");
                signal.close(DisconnectReason::Detached);
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => {
                signal.close(DisconnectReason::Detached);
                return Err(e);
            }
        };

        let forward = detector.filter(&buf[..n]);
        if !forward.is_empty() {
            let written = match remote.write_all(&forward).await {
                Ok(()) => remote.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = written {
                signal.close(DisconnectReason::RemoteClosed);
                return if is_disconnect(&e) { Ok(()) } else { Err(e) };
            }
        }

        if signal.is_closed() {
            let _ = remote.shutdown().await;
            return Ok(());
        }
    }
}

/// Remote console to local screen.
async fn pump_output<R, W>(mut remote: R, mut local: W, signal: DisconnectSignal) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; IO_BUFFER_SIZE];
    loop {
        match remote.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("remote console stream closed");
                signal.close(DisconnectReason::RemoteClosed);
                return Ok(());
            }
            Ok(n) => {
                let written = match local.write_all(&buf[..n]).await {
                    Ok(()) => local.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    signal.close(DisconnectReason::Detached);
                    return Err(e);
                }
            }
            Err(e) => {
                signal.close(DisconnectReason::RemoteClosed);
                return if is_disconnect(&e) { Ok(()) } else { Err(e) };
            }
        }
    }
}
