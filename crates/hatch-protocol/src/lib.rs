//! Shared wire types for hatch console sessions.

use std::collections::BTreeMap;

/// Command name of the resize control message.
pub const WINDOW_RESIZE: &str = "window-resize";

/// Out-of-band message carried on the console control channel.
///
/// Encoded as one JSON object per line. The command set is open-ended, so
/// receivers decode through [`ControlMessage::command`] and skip anything
/// they do not understand.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ControlMessage {
    pub command: String,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

/// Decoded view of a [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Terminal geometry in columns and rows.
    WindowResize { width: u16, height: u16 },
    /// A command this client does not know, or one with malformed arguments.
    Unknown(String),
}

impl ControlMessage {
    #[must_use]
    pub fn window_resize(width: u16, height: u16) -> Self {
        let mut args = BTreeMap::new();
        args.insert("width".to_string(), width.to_string());
        args.insert("height".to_string(), height.to_string());
        Self {
            command: WINDOW_RESIZE.to_string(),
            args,
        }
    }

    #[must_use]
    pub fn command(&self) -> ControlCommand {
        if self.command == WINDOW_RESIZE {
            let width = self.args.get("width").and_then(|w| w.parse().ok());
            let height = self.args.get("height").and_then(|h| h.parse().ok());
            if let (Some(width), Some(height)) = (width, height) {
                return ControlCommand::WindowResize { width, height };
            }
        }
        ControlCommand::Unknown(self.command.clone())
    }

    /// Serialize as a single newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// Console flavour requested from the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleType {
    /// Serial text console.
    Console,
    /// SPICE graphical console.
    Vga,
}

/// Coarse instance run state as reported by the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Frozen,
    Error,
    #[serde(other)]
    Unknown,
}

/// Client requests to the daemon.
///
/// Each request opens its own connection. After the response line,
/// `ConsoleStream` and a text `ConsoleAttach` switch the connection to raw
/// console bytes and `ConsoleControl` switches it to control message lines.
/// A graphical `ConsoleAttach` connection carries nothing further; hanging
/// it up ends the operation.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Start a console operation on an instance.
    ConsoleAttach {
        instance: String,
        console_type: ConsoleType,
        /// Terminal columns (text consoles only).
        width: u16,
        /// Terminal rows (text consoles only).
        height: u16,
        /// Take over a console another client holds.
        force: bool,
    },
    /// Open the control channel of a running console operation.
    ConsoleControl { operation: String },
    /// Open one more data stream of a graphical console operation.
    ConsoleStream { operation: String },
    /// Block until the operation finishes.
    OperationWait { operation: String },
    /// Query the instance run state.
    InstanceState { instance: String },
    /// Fetch the instance console log.
    ConsoleLog { instance: String },
}

/// Daemon responses.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Console operation started.
    ConsoleAttached { operation: String },
    /// Operation finished, with its failure message if it failed.
    OperationDone { error: Option<String> },
    /// Instance run state.
    State { status: InstanceStatus },
    /// Console log content.
    ConsoleLog { content: Vec<u8> },
    /// Success.
    Ok,
    /// Error.
    Error { message: String },
}

/// Environment variable overriding the daemon socket path.
pub const SOCKET_ENV: &str = "HATCH_SOCKET";

/// Get the default daemon socket directory.
#[must_use]
pub fn socket_dir() -> std::path::PathBuf {
    dirs::runtime_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join(".hatch")))
        .unwrap_or_else(|| std::path::PathBuf::from("/tmp/hatch"))
}

/// Get the daemon socket path, honouring `HATCH_SOCKET`.
#[must_use]
pub fn daemon_socket() -> std::path::PathBuf {
    std::env::var_os(SOCKET_ENV)
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| socket_dir().join("hatchd.sock"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_resize_wire_format() {
        let msg = ControlMessage::window_resize(120, 40);
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "command": "window-resize",
                "args": { "width": "120", "height": "40" }
            })
        );
    }

    #[test]
    fn test_to_line_is_newline_terminated() {
        let line = ControlMessage::window_resize(80, 24).to_line().unwrap();
        assert_eq!(line.last(), Some(&b'\n'));
        assert_eq!(line.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_unknown_command_is_not_an_error() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"command":"signal","args":{"signal":"15"}}"#).unwrap();
        assert_eq!(msg.command(), ControlCommand::Unknown("signal".to_string()));
    }

    #[test]
    fn test_missing_args_defaults_to_empty() {
        let msg: ControlMessage = serde_json::from_str(r#"{"command":"ping"}"#).unwrap();
        assert!(msg.args.is_empty());
    }

    #[test]
    fn test_malformed_resize_is_unknown() {
        let mut msg = ControlMessage::window_resize(80, 24);
        msg.args.insert("width".to_string(), "wide".to_string());
        assert!(matches!(msg.command(), ControlCommand::Unknown(_)));
    }

    #[test]
    fn test_request_tagging() {
        let req = Request::InstanceState {
            instance: "web1".to_string(),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"type":"instance_state","instance":"web1"}"#);
    }

    #[test]
    fn test_unknown_status_tolerated() {
        let resp: Response =
            serde_json::from_str(r#"{"type":"state","status":"migrating"}"#).unwrap();
        assert!(matches!(
            resp,
            Response::State {
                status: InstanceStatus::Unknown
            }
        ));
    }
}
