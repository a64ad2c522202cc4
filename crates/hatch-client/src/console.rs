use hatch_console::{
    ConsoleService, Connector, DisconnectReason, DisconnectSignal, GraphicalAttachOptions,
    InstanceStatus, Operation, ProxyConnection, TextAttachOptions, TextAttachment,
};

use crate::{Client, ConsoleType, Error};

/// [`ConsoleService`] backed by the hatch daemon.
#[derive(Debug, Clone)]
pub struct DaemonConsole {
    client: Client,
}

impl DaemonConsole {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Wait for `operation` in the background, closing `disconnect` when it
    /// finishes.
    ///
    /// `hold` is a connection whose hangup ends the operation on the daemon;
    /// it is dropped once the local side disconnects.
    fn watch(
        &self,
        instance: &str,
        operation: String,
        disconnect: DisconnectSignal,
        hold: Option<tokio::net::UnixStream>,
    ) -> DaemonOperation {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let client = self.client.clone();
        let instance = instance.to_string();
        tokio::spawn(async move {
            let mut hold = hold;
            let wait = client.wait(&operation);
            tokio::pin!(wait);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut wait => break outcome,
                    _ = disconnect.closed(), if hold.is_some() => {
                        tracing::debug!("hanging up console operation {operation}");
                        hold = None;
                    }
                }
            };
            let result = match outcome {
                Ok(None) => Ok(()),
                Ok(Some(message)) => Err(hatch_console::Error::Remote { instance, message }),
                Err(e) => Err(e.into()),
            };
            tracing::debug!("console operation {operation} finished: {result:?}");
            disconnect.close(DisconnectReason::RemoteClosed);
            let _ = tx.send(result);
        });
        DaemonOperation { rx }
    }
}

fn rejected(instance: &str, e: Error) -> hatch_console::Error {
    match e {
        Error::Daemon(message) => hatch_console::Error::AttachRejected {
            instance: instance.to_string(),
            message,
        },
        other => other.into(),
    }
}

/// A console operation running on the daemon.
pub struct DaemonOperation {
    rx: tokio::sync::oneshot::Receiver<hatch_console::Result<()>>,
}

impl Operation for DaemonOperation {
    async fn wait(self) -> hatch_console::Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(hatch_console::Error::Service(
                "lost track of the console operation".to_string(),
            )),
        }
    }
}

/// Opens a daemon data stream per viewer connection.
#[derive(Debug, Clone)]
pub struct DaemonConnector {
    client: Client,
    operation: String,
}

impl Connector for DaemonConnector {
    async fn connect(&self, mut conn: ProxyConnection) -> hatch_console::Result<()> {
        let mut remote = self
            .client
            .stream(&self.operation)
            .await
            .map_err(|e| hatch_console::Error::Forwarding(std::io::Error::other(e.to_string())))?;
        let (up, down) = tokio::io::copy_bidirectional(&mut conn, &mut remote)
            .await
            .map_err(hatch_console::Error::Forwarding)?;
        tracing::debug!("viewer stream closed after {up} bytes up, {down} bytes down");
        Ok(())
    }
}

impl ConsoleService for DaemonConsole {
    type Stream = tokio::net::UnixStream;
    type Operation = DaemonOperation;
    type Connector = DaemonConnector;

    async fn attach_text(
        &self,
        instance: &str,
        options: TextAttachOptions,
    ) -> hatch_console::Result<TextAttachment<Self::Stream, Self::Operation>> {
        let (operation, data) = self
            .client
            .attach(
                instance,
                ConsoleType::Console,
                (options.width, options.height),
                options.force,
            )
            .await
            .map_err(|e| rejected(instance, e))?;
        let control = self.client.control(&operation).await?;
        let operation = self.watch(instance, operation, options.disconnect, None);
        Ok(TextAttachment {
            data,
            control,
            operation,
        })
    }

    async fn attach_graphical(
        &self,
        instance: &str,
        options: GraphicalAttachOptions,
    ) -> hatch_console::Result<(Self::Operation, Self::Connector)> {
        // Viewer traffic goes over per-connection streams; the attach
        // connection only keeps the operation alive.
        let (operation, attach) = self
            .client
            .attach(instance, ConsoleType::Vga, (0, 0), options.force)
            .await
            .map_err(|e| rejected(instance, e))?;
        let connector = DaemonConnector {
            client: self.client.clone(),
            operation: operation.clone(),
        };
        Ok((
            self.watch(instance, operation, options.disconnect, Some(attach)),
            connector,
        ))
    }

    async fn fetch_console_log(&self, instance: &str) -> hatch_console::Result<Vec<u8>> {
        Ok(self.client.console_log(instance).await?)
    }

    async fn instance_status(&self, instance: &str) -> hatch_console::Result<InstanceStatus> {
        Ok(self.client.instance_state(instance).await?)
    }
}
