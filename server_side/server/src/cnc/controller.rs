use std::{fmt, str::FromStr, sync::Arc};

use async_trait::async_trait;
use common::{
    grbl::GrblStatusReport,
    protocol::{
        ControllerAlarm, ControllerState, PortClosed, PortData, PortError, PortSenderStatus, PortWrite,
        SenderStatus, ServerEvent, Workflow, WorkflowState,
    },
};
use serde_json::Value;
use tokio::sync::mpsc;

use super::{connection::Transport, grbl::GrblController};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControllerKind {
    Grbl,
}
impl ControllerKind {
    pub const ALL: [ControllerKind; 1] = [ControllerKind::Grbl];

    /// Starts the firmware task for this kind over an already opened transport.
    pub fn connect(self, transport: Transport, options: ControllerOptions, events: mpsc::UnboundedSender<ControllerEvent>) -> Box<dyn Controller> {
        match self {
            ControllerKind::Grbl => Box::new(GrblController::spawn(transport, options, events)),
        }
    }
}
impl FromStr for ControllerKind {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ControllerKind::ALL
            .into_iter()
            .find(|kind| kind.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ControllerError::UnknownKind(s.to_string()))
    }
}
impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerKind::Grbl => write!(f, "Grbl"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub status_interval: std::time::Duration,
    pub rx_buffer_size: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("unknown controller type {0:?}")]
    UnknownKind(String),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("bad argument for {command}: {message}")]
    BadArgument { command: String, message: String },
    #[error("no program is loaded")]
    NoProgram,
    #[error("controller connection is closed")]
    Closed,
}

/// What a running controller reports; the session stamps each with its port before broadcasting.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Read(String),
    Write { data: String, context: Value },
    State(GrblStatusReport),
    Workflow(Workflow),
    Sender(SenderStatus),
    Alarm { code: u64, message: String },
    Error(String),
    Closed(Option<String>),
}
impl ControllerEvent {
    pub fn into_server_event(self, port: &str, kind: ControllerKind) -> ServerEvent {
        let port = port.to_string();
        match self {
            ControllerEvent::Read(data) => ServerEvent::PortRead(PortData { port, data }),
            ControllerEvent::Write { data, context } => ServerEvent::PortWrite(PortWrite { port, data, context }),
            ControllerEvent::State(status) => ServerEvent::ControllerState(ControllerState {
                port,
                controller_type: kind.to_string(),
                status,
            }),
            ControllerEvent::Workflow(state) => ServerEvent::WorkflowState(WorkflowState { port, state }),
            ControllerEvent::Sender(status) => ServerEvent::SenderStatus(PortSenderStatus { port, status }),
            ControllerEvent::Alarm { code, message } => ServerEvent::ControllerAlarm(ControllerAlarm { port, code, message }),
            ControllerEvent::Error(message) => ServerEvent::PortError(PortError { port, message }),
            ControllerEvent::Closed(reason) => ServerEvent::PortClose(PortClosed { port, reason }),
        }
    }
}

#[async_trait]
pub trait Controller: Send + Sync {
    async fn command(&self, name: &str, args: &[Value]) -> Result<(), ControllerError>;
    /// Raw data; only newline-terminated data goes through line flow control.
    async fn write(&self, data: String, context: Value) -> Result<(), ControllerError>;
    async fn writeln(&self, data: String, context: Value) -> Result<(), ControllerError>;
    async fn load_program(&self, name: String, content: Arc<str>) -> Result<(), ControllerError>;
    async fn unload_program(&self) -> Result<(), ControllerError>;
    /// Stops the firmware task and releases the transport.
    async fn shutdown(self: Box<Self>);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!("grbl".parse::<ControllerKind>().unwrap(), ControllerKind::Grbl);
        assert_eq!(" GRBL ".parse::<ControllerKind>().unwrap(), ControllerKind::Grbl);
        assert!(matches!("Marlin".parse::<ControllerKind>(), Err(ControllerError::UnknownKind(_))));
    }

    #[test]
    fn test_events_carry_port() {
        let event = ControllerEvent::Read("ok".to_string()).into_server_event("/dev/ttyACM0", ControllerKind::Grbl);
        assert_eq!(event, ServerEvent::PortRead(PortData { port: "/dev/ttyACM0".to_string(), data: "ok".to_string() }));
    }
}
