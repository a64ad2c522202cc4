//! Client behaviour against a scripted daemon on a temporary socket.

use hatch_client::{Client, DaemonConsole, InstanceStatus, Request, Response};
use hatch_console::{
    ConsoleService as _, Connector as _, DisconnectReason, DisconnectSignal,
    GraphicalAttachOptions, Operation as _, TextAttachOptions,
};
use tokio::io::{AsyncBufReadExt as _, AsyncReadExt as _, AsyncWriteExt as _};

struct FakeDaemon {
    _dir: tempfile::TempDir,
    client: Client,
}

impl FakeDaemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hatchd.sock");
        let listener = tokio::net::UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(handle(stream));
            }
        });
        Self {
            _dir: dir,
            client: Client::new(path),
        }
    }
}

fn line(response: &Response) -> Vec<u8> {
    let mut line = serde_json::to_vec(response).unwrap();
    line.push(b'\n');
    line
}

async fn echo(stream: tokio::net::UnixStream) {
    let (mut read_half, mut write_half) = stream.into_split();
    let _ = tokio::io::copy(&mut read_half, &mut write_half).await;
}

async fn handle(stream: tokio::net::UnixStream) {
    let mut reader = tokio::io::BufReader::new(stream);
    let mut request = String::new();
    if reader.read_line(&mut request).await.unwrap_or(0) == 0 {
        return;
    }
    let request: Request = serde_json::from_str(&request).unwrap();
    let mut stream = reader.into_inner();

    match request {
        Request::InstanceState { instance } => {
            let status = if instance == "web1" {
                InstanceStatus::Stopped
            } else {
                InstanceStatus::Running
            };
            let _ = stream.write_all(&line(&Response::State { status })).await;
        }
        Request::ConsoleLog { .. } => {
            let response = Response::ConsoleLog {
                content: b"boot ok\n".to_vec(),
            };
            let _ = stream.write_all(&line(&response)).await;
        }
        Request::ConsoleAttach {
            instance, force, ..
        } if instance == "busy" && !force => {
            let response = Response::Error {
                message: "console already in use".to_string(),
            };
            let _ = stream.write_all(&line(&response)).await;
        }
        Request::ConsoleAttach { instance, .. } => {
            let response = Response::ConsoleAttached {
                operation: format!("op-{instance}"),
            };
            // Console bytes share the write with the response line.
            let mut reply = line(&response);
            reply.extend_from_slice(b"login: ");
            let _ = stream.write_all(&reply).await;
            echo(stream).await;
        }
        Request::ConsoleControl { .. } => {
            let _ = stream.write_all(&line(&Response::Ok)).await;
            let mut sink = Vec::new();
            let _ = stream.read_to_end(&mut sink).await;
        }
        Request::ConsoleStream { .. } => {
            let _ = stream.write_all(&line(&Response::Ok)).await;
            echo(stream).await;
        }
        Request::OperationWait { operation } if operation == "op-crash" => {
            let response = Response::OperationDone {
                error: Some("instance stopped".to_string()),
            };
            let _ = stream.write_all(&line(&response)).await;
        }
        Request::OperationWait { .. } => std::future::pending().await,
    }
}

fn text_options(disconnect: &DisconnectSignal) -> TextAttachOptions {
    TextAttachOptions {
        width: 80,
        height: 24,
        force: false,
        disconnect: disconnect.clone(),
    }
}

#[tokio::test]
async fn test_state_and_log_queries() {
    let daemon = FakeDaemon::start();
    assert_eq!(
        daemon.client.instance_state("web1").await.unwrap(),
        InstanceStatus::Stopped
    );
    assert_eq!(
        daemon.client.instance_state("db1").await.unwrap(),
        InstanceStatus::Running
    );
    assert_eq!(daemon.client.console_log("web1").await.unwrap(), b"boot ok\n");
}

#[tokio::test]
async fn test_attach_keeps_bytes_after_response() {
    let daemon = FakeDaemon::start();
    let (operation, mut stream) = daemon
        .client
        .attach("web1", hatch_client::ConsoleType::Console, (80, 24), false)
        .await
        .unwrap();
    assert_eq!(operation, "op-web1");

    let mut banner = [0u8; 7];
    stream.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"login: ");

    stream.write_all(b"root\r").await.unwrap();
    let mut echoed = [0u8; 5];
    stream.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"root\r");
}

#[tokio::test]
async fn test_daemon_refusal_is_attach_rejected() {
    let daemon = FakeDaemon::start();
    let console = DaemonConsole::new(daemon.client.clone());
    let disconnect = DisconnectSignal::new();

    let err = match console.attach_text("busy", text_options(&disconnect)).await {
        Ok(_) => panic!("attach to a busy console succeeded"),
        Err(e) => e,
    };
    match err {
        hatch_console::Error::AttachRejected { instance, message } => {
            assert_eq!(instance, "busy");
            assert_eq!(message, "console already in use");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!disconnect.is_closed());
}

#[tokio::test]
async fn test_operation_failure_closes_disconnect() {
    let daemon = FakeDaemon::start();
    let console = DaemonConsole::new(daemon.client.clone());
    let disconnect = DisconnectSignal::new();

    let attachment = console
        .attach_text("crash", text_options(&disconnect))
        .await
        .unwrap();
    assert_eq!(disconnect.closed().await, DisconnectReason::RemoteClosed);

    let err = attachment.operation.wait().await.unwrap_err();
    match err {
        hatch_console::Error::Remote { instance, message } => {
            assert_eq!(instance, "crash");
            assert_eq!(message, "instance stopped");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_graphical_connector_forwards_viewer_bytes() {
    let daemon = FakeDaemon::start();
    let console = DaemonConsole::new(daemon.client.clone());
    let (_operation, connector) = console
        .attach_graphical(
            "web1",
            GraphicalAttachOptions {
                force: false,
                disconnect: DisconnectSignal::new(),
            },
        )
        .await
        .unwrap();

    let (mut viewer, proxied) = tokio::io::duplex(1024);
    let forward = tokio::spawn(async move { connector.connect(Box::new(proxied)).await });

    viewer.write_all(b"spice").await.unwrap();
    let mut back = [0u8; 5];
    viewer.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"spice");

    drop(viewer);
    forward.await.unwrap().unwrap();
}
