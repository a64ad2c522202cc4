//! Line-delimited JSON control channel.

use hatch_protocol::{ControlCommand, ControlMessage};
use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::signal::DisconnectSignal;

/// Longest control line accepted before the channel is considered broken.
const MAX_LINE_LEN: usize = 64 * 1024;

/// Terminal size changes `(width, height)` to forward to the remote side.
pub type ResizeEvents = tokio::sync::mpsc::UnboundedReceiver<(u16, u16)>;

/// Reads control messages, one JSON object per line.
pub struct ControlReader<R> {
    inner: R,
    buf: bytes::BytesMut,
}

impl<R: AsyncRead + Unpin> ControlReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: bytes::BytesMut::with_capacity(1024),
        }
    }

    /// Next well-formed message, or `None` once the channel closes.
    ///
    /// Malformed lines are skipped. Cancel safe: partial lines stay buffered.
    pub async fn next(&mut self) -> std::io::Result<Option<ControlMessage>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let line = self.buf.split_to(pos + 1);
                let line = &line[..pos];
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<ControlMessage>(line) {
                    Ok(msg) => return Ok(Some(msg)),
                    Err(e) => {
                        tracing::warn!("ignoring malformed control message: {e}");
                        continue;
                    }
                }
            }

            if self.buf.len() > MAX_LINE_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "control message too long",
                ));
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }
}

/// Writes control messages, one JSON object per line.
pub struct ControlWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, msg: &ControlMessage) -> std::io::Result<()> {
        let line = msg.to_line().map_err(std::io::Error::other)?;
        self.inner.write_all(&line).await?;
        self.inner.flush().await
    }

    pub async fn send_resize(&mut self, width: u16, height: u16) -> std::io::Result<()> {
        tracing::debug!("sending window-resize {width}x{height}");
        self.send(&ControlMessage::window_resize(width, height))
            .await
    }

    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

/// Both directions of a control stream.
pub struct ControlChannel<S> {
    reader: ControlReader<tokio::io::ReadHalf<S>>,
    writer: ControlWriter<tokio::io::WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> ControlChannel<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: ControlReader::new(read_half),
            writer: ControlWriter::new(write_half),
        }
    }

    pub async fn send_resize(&mut self, width: u16, height: u16) -> std::io::Result<()> {
        self.writer.send_resize(width, height).await
    }

    /// Serve the channel until `signal` closes or the remote end goes away.
    ///
    /// Incoming messages are informational; unknown commands are ignored.
    pub async fn run(mut self, mut resize: Option<ResizeEvents>, signal: DisconnectSignal) {
        loop {
            tokio::select! {
                _ = signal.closed() => break,
                msg = self.reader.next() => match msg {
                    Ok(Some(msg)) => match msg.command() {
                        ControlCommand::WindowResize { width, height } => {
                            tracing::debug!("remote reported window size {width}x{height}");
                        }
                        ControlCommand::Unknown(command) => {
                            tracing::debug!("ignoring control command {command:?}");
                        }
                    },
                    Ok(None) => {
                        tracing::debug!("control channel closed by remote");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!("control channel read error: {e}");
                        break;
                    }
                },
                size = next_resize(&mut resize) => match size {
                    Some((width, height)) => {
                        if let Err(e) = self.writer.send_resize(width, height).await {
                            tracing::debug!("failed to send window-resize: {e}");
                            break;
                        }
                    }
                    None => resize = None,
                },
            }
        }
        let _ = self.writer.shutdown().await;
    }
}

async fn next_resize(resize: &mut Option<ResizeEvents>) -> Option<(u16, u16)> {
    match resize {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncBufReadExt as _;

    use super::*;
    use crate::signal::DisconnectReason;

    #[tokio::test]
    async fn test_reader_splits_lines() {
        let (mut remote, local) = tokio::io::duplex(1024);
        remote
            .write_all(b"{\"command\":\"window-resize\",\"args\":{\"width\":\"80\",\"height\":\"24\"}}\n\n{\"command\":\"x\"}\n")
            .await
            .unwrap();
        drop(remote);

        let mut reader = ControlReader::new(local);
        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(
            first.command(),
            ControlCommand::WindowResize {
                width: 80,
                height: 24
            }
        );
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.command(), ControlCommand::Unknown("x".to_string()));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reader_skips_malformed_lines() {
        let (mut remote, local) = tokio::io::duplex(1024);
        remote
            .write_all(b"not json\n{\"command\":\"ok\"}\n")
            .await
            .unwrap();
        drop(remote);

        let mut reader = ControlReader::new(local);
        let msg = reader.next().await.unwrap().unwrap();
        assert_eq!(msg.command, "ok");
    }

    #[tokio::test]
    async fn test_run_forwards_resize_events_and_ignores_unknown() {
        let (local, remote) = tokio::io::duplex(1024);
        let (resize_tx, resize_rx) = tokio::sync::mpsc::unbounded_channel();
        let signal = DisconnectSignal::new();

        let mut channel = ControlChannel::new(local);
        channel.send_resize(100, 30).await.unwrap();
        let task = tokio::spawn(channel.run(Some(resize_rx), signal.clone()));

        let (remote_read, mut remote_write) = tokio::io::split(remote);
        remote_write
            .write_all(b"{\"command\":\"future-thing\",\"args\":{}}\n")
            .await
            .unwrap();
        resize_tx.send((120, 40)).unwrap();

        let mut lines = tokio::io::BufReader::new(remote_read).lines();
        let first: ControlMessage =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(first, ControlMessage::window_resize(100, 30));
        let second: ControlMessage =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(second, ControlMessage::window_resize(120, 40));

        signal.close(DisconnectReason::Detached);
        task.await.unwrap();
    }
}
