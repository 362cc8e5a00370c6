use chrono::{DateTime, Utc};
use gcode::{InterpreterConfig, ProgramSummary};
use serde::{Serialize, Deserialize};
use serde_json::Value;

use crate::grbl::GrblStatusReport;

/*
    Client -> server
*/

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenRequest {
    pub port: String,
    pub controller_type: String,
    #[serde(default)]
    pub baud_rate: Option<u32>,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortRequest {
    pub port: String,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub port: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<Value>,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub port: String,
    pub data: String,
    #[serde(default)]
    pub context: Value,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileLoadRequest {
    #[serde(default)]
    pub port: Option<String>,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub visualizer: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ClientCommand {
    #[serde(rename = "list")]
    List,
    #[serde(rename = "open")]
    Open(OpenRequest),
    #[serde(rename = "close")]
    Close(PortRequest),
    #[serde(rename = "reconnect")]
    Reconnect(PortRequest),
    #[serde(rename = "addclient")]
    AddClient(PortRequest),
    #[serde(rename = "command")]
    Command(CommandRequest),
    #[serde(rename = "write")]
    Write(WriteRequest),
    #[serde(rename = "writeln")]
    Writeln(WriteRequest),
    #[serde(rename = "file:load")]
    FileLoad(FileLoadRequest),
    #[serde(rename = "file:fetch")]
    FileFetch,
    #[serde(rename = "file:unload")]
    FileUnload,
    #[serde(rename = "ping")]
    Ping,
}
impl ClientCommand {
    pub fn port(&self) -> Option<&str> {
        match self {
            ClientCommand::Open(OpenRequest { port, .. })
            | ClientCommand::Close(PortRequest { port })
            | ClientCommand::Reconnect(PortRequest { port })
            | ClientCommand::AddClient(PortRequest { port })
            | ClientCommand::Command(CommandRequest { port, .. })
            | ClientCommand::Write(WriteRequest { port, .. })
            | ClientCommand::Writeln(WriteRequest { port, .. }) => Some(port),
            ClientCommand::FileLoad(FileLoadRequest { port, .. }) => port.as_deref(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    event: String,
    #[serde(default)]
    data: Value,
}

/// `{"id": 7, "event": "open", "data": {...}}`; the id is echoed in the acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRequest {
    pub id: Option<u64>,
    pub command: ClientCommand,
}
impl ClientRequest {
    pub fn parse(text: &str) -> Result<ClientRequest, serde_json::Error> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let mut object = serde_json::Map::new();
        object.insert("event".into(), Value::String(envelope.event));
        // Events without a payload tolerate `null` or `{}`.
        let empty = match &envelope.data {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        };
        if !empty {
            object.insert("data".into(), envelope.data);
        }
        let command = serde_json::from_value(Value::Object(object))?;
        Ok(ClientRequest { id: envelope.id, command })
    }
    pub fn to_json(&self) -> Value {
        let mut value = serde_json::to_value(&self.command).unwrap_or(Value::Null);
        if let (Some(id), Value::Object(map)) = (self.id, &mut value) {
            map.insert("id".into(), id.into());
        }
        value
    }
}

/*
    Server -> client
*/

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub name: String,
    /// Bytes.
    pub size: usize,
    pub total_lines: usize,
    pub visualizer: Option<String>,
    pub port: Option<String>,
    pub loaded_at: DateTime<Utc>,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LoadedFile {
    pub meta: FileMeta,
    pub content: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StartupInfo {
    pub version: String,
    pub controllers: Vec<String>,
    pub time: DateTime<Utc>,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortInfo {
    pub port: String,
    pub manufacturer: Option<String>,
    pub vendor_id: Option<String>,
    pub product_id: Option<String>,
    /// Matches one of the configured vendor/product filters.
    pub recognized: bool,
    pub in_use: bool,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PortOpened {
    pub port: String,
    pub controller_type: String,
    pub baud_rate: u32,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortClosed {
    pub port: String,
    pub reason: Option<String>,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortError {
    pub port: String,
    pub message: String,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortData {
    pub port: String,
    pub data: String,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortWrite {
    pub port: String,
    pub data: String,
    pub context: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskStart {
    pub task_id: u64,
    pub name: String,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskProgress {
    pub task_id: u64,
    pub percent: u8,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskFinish {
    pub task_id: u64,
    pub summary: ProgramSummary,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskError {
    pub task_id: u64,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControllerState {
    pub port: String,
    pub controller_type: String,
    pub status: GrblStatusReport,
}
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Workflow {
    Idle,
    Running,
    Paused,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowState {
    pub port: String,
    pub state: Workflow,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct SenderStatus {
    pub name: Option<String>,
    pub total: usize,
    pub sent: usize,
    pub received: usize,
    pub hold: bool,
    pub finished: bool,
    pub elapsed_ms: u64,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PortSenderStatus {
    pub port: String,
    #[serde(flatten)]
    pub status: SenderStatus,
}
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControllerAlarm {
    pub port: String,
    pub code: u64,
    pub message: String,
}

#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "startup")]
    Startup(StartupInfo),
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "config:change")]
    ConfigChange(InterpreterConfig),
    #[serde(rename = "serialport:list")]
    PortList(Vec<PortInfo>),
    #[serde(rename = "serialport:open")]
    PortOpen(PortOpened),
    #[serde(rename = "serialport:close")]
    PortClose(PortClosed),
    #[serde(rename = "serialport:error")]
    PortError(PortError),
    #[serde(rename = "serialport:read")]
    PortRead(PortData),
    #[serde(rename = "serialport:write")]
    PortWrite(PortWrite),
    #[serde(rename = "file:load")]
    FileLoad(LoadedFile),
    #[serde(rename = "file:unload")]
    FileUnload,
    #[serde(rename = "task:start")]
    TaskStart(TaskStart),
    #[serde(rename = "task:progress")]
    TaskProgress(TaskProgress),
    #[serde(rename = "task:finish")]
    TaskFinish(TaskFinish),
    #[serde(rename = "task:error")]
    TaskError(TaskError),
    #[serde(rename = "controller:state")]
    ControllerState(ControllerState),
    #[serde(rename = "controller:alarm")]
    ControllerAlarm(ControllerAlarm),
    #[serde(rename = "workflow:state")]
    WorkflowState(WorkflowState),
    #[serde(rename = "sender:status")]
    SenderStatus(PortSenderStatus),
}
impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Startup(_) => "startup",
            ServerEvent::Pong => "pong",
            ServerEvent::ConfigChange(_) => "config:change",
            ServerEvent::PortList(_) => "serialport:list",
            ServerEvent::PortOpen(_) => "serialport:open",
            ServerEvent::PortClose(_) => "serialport:close",
            ServerEvent::PortError(_) => "serialport:error",
            ServerEvent::PortRead(_) => "serialport:read",
            ServerEvent::PortWrite(_) => "serialport:write",
            ServerEvent::FileLoad(_) => "file:load",
            ServerEvent::FileUnload => "file:unload",
            ServerEvent::TaskStart(_) => "task:start",
            ServerEvent::TaskProgress(_) => "task:progress",
            ServerEvent::TaskFinish(_) => "task:finish",
            ServerEvent::TaskError(_) => "task:error",
            ServerEvent::ControllerState(_) => "controller:state",
            ServerEvent::ControllerAlarm(_) => "controller:alarm",
            ServerEvent::WorkflowState(_) => "workflow:state",
            ServerEvent::SenderStatus(_) => "sender:status",
        }
    }
}

#[allow(clippy::large_enum_variant)]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Ack {
        id: Option<u64>,
        result: Value,
        error: Option<String>,
    },
    Event(ServerEvent),
}
impl ServerMessage {
    pub fn ok(id: Option<u64>, result: Value) -> Self {
        ServerMessage::Ack { id, result, error: None }
    }
    pub fn error(id: Option<u64>, error: impl ToString) -> Self {
        ServerMessage::Ack { id, result: Value::Null, error: Some(error.to_string()) }
    }
}
impl From<ServerEvent> for ServerMessage {
    fn from(event: ServerEvent) -> Self {
        ServerMessage::Event(event)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_open() {
        let request = ClientRequest::parse(r#"{"id": 7, "event": "open", "data": {"port": "/dev/ttyUSB0", "controllerType": "Grbl"}}"#).unwrap();
        assert_eq!(request, ClientRequest {
            id: Some(7),
            command: ClientCommand::Open(OpenRequest {
                port: "/dev/ttyUSB0".into(),
                controller_type: "Grbl".into(),
                baud_rate: None,
            }),
        });
        assert_eq!(request.command.port(), Some("/dev/ttyUSB0"));
    }

    #[test]
    fn test_parse_events_without_payload() {
        for text in [r#"{"event": "list"}"#, r#"{"event": "list", "data": null}"#, r#"{"event": "list", "data": {}}"#] {
            assert_eq!(ClientRequest::parse(text).unwrap().command, ClientCommand::List);
        }
        let request = ClientRequest::parse(r#"{"id": 1, "event": "file:unload"}"#).unwrap();
        assert_eq!(request.command, ClientCommand::FileUnload);
    }

    #[test]
    fn test_parse_command_args() {
        let request = ClientRequest::parse(r#"{"event": "command", "data": {"port": "COM3", "cmd": "feedOverride", "args": [10]}}"#).unwrap();
        assert_eq!(request.id, None);
        assert_eq!(request.command, ClientCommand::Command(CommandRequest {
            port: "COM3".into(),
            cmd: "feedOverride".into(),
            args: vec![json!(10)],
        }));
    }

    #[test]
    fn test_rejects_unknown_event() {
        assert!(ClientRequest::parse(r#"{"event": "format-disk"}"#).is_err());
        assert!(ClientRequest::parse(r#"{"event": "open", "data": {}}"#).is_err());
    }

    #[test]
    fn test_request_round_trip() {
        let request = ClientRequest {
            id: Some(3),
            command: ClientCommand::Writeln(WriteRequest { port: "p".into(), data: "G0 X1".into(), context: Value::Null }),
        };
        assert_eq!(ClientRequest::parse(&request.to_json().to_string()).unwrap(), request);
    }

    #[test]
    fn test_message_shapes() {
        let ack = serde_json::to_value(ServerMessage::ok(Some(7), json!(true))).unwrap();
        assert_eq!(ack, json!({"type": "ack", "id": 7, "result": true, "error": null}));
        let event = ServerMessage::from(ServerEvent::PortClose(PortClosed { port: "p".into(), reason: None }));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"type": "event", "event": "serialport:close", "data": {"port": "p", "reason": null}}));
        assert_eq!(serde_json::from_value::<ServerMessage>(value).unwrap(), event);
        let pong = serde_json::to_value(ServerMessage::from(ServerEvent::Pong)).unwrap();
        assert_eq!(pong, json!({"type": "event", "event": "pong"}));
    }
}
