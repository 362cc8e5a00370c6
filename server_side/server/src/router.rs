use std::sync::Arc;

use common::protocol::{
    ClientCommand, ClientRequest, CommandRequest, ControllerState, OpenRequest, PortError, PortRequest,
    ServerEvent, ServerMessage, WriteRequest,
};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::{
    cnc::controller::ControllerKind,
    hub::Hub,
    multiplexer::ClientId,
    session::{ControllerSession, SessionError},
};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no session for port {0}")]
    NoSession(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to list ports: {0}")]
    ListPorts(String),
}

/// Resolves one request from one client and acknowledges it to that client only.
pub async fn dispatch(hub: &Hub, client: ClientId, request: ClientRequest) {
    let ClientRequest { id, command } = request;
    let port = command.port().map(str::to_string);
    let message = match route(hub, client, command).await {
        Ok(result) => ServerMessage::ok(id, result),
        Err(error) => {
            match (&error, &port) {
                (RouterError::NoSession(port), _) => warn!("Client {} addressed {} which has no session", client, port),
                (RouterError::Session(session_error), Some(port)) => {
                    warn!("Session fault on {}: {}", port, session_error);
                    let event = ServerEvent::PortError(PortError { port: port.clone(), message: session_error.to_string() });
                    // The issuer may not be in the room yet, e.g. after a failed open.
                    if !hub.multiplexer.room_members(port).contains(&client) {
                        hub.multiplexer.send_to(client, ServerMessage::Event(event.clone()));
                    }
                    hub.multiplexer.broadcast_room(port, event);
                }
                _ => debug!("Request from client {} failed: {}", client, error),
            }
            ServerMessage::error(id, error)
        }
    };
    hub.multiplexer.send_to(client, message);
}

fn session(hub: &Hub, port: &str) -> Result<Arc<ControllerSession>, RouterError> {
    hub.registry.get(port).ok_or_else(|| RouterError::NoSession(port.to_string()))
}

/// Adds the client to the session and its room, then catches it up on the port.
fn attach(hub: &Hub, client: ClientId, session: &ControllerSession) {
    session.add_connection(client);
    hub.multiplexer.join(client, session.port());
    if session.is_open() {
        hub.multiplexer.send_to(client, ServerMessage::Event(session.opened_event(hub.config.baud_rate)));
    }
    if let Some(status) = session.last_status() {
        let state = ControllerState { port: session.port().to_string(), controller_type: session.kind().to_string(), status };
        hub.multiplexer.send_to(client, ServerMessage::Event(ServerEvent::ControllerState(state)));
    }
}

async fn open(hub: &Hub, client: ClientId, request: OpenRequest) -> Result<Value, RouterError> {
    let OpenRequest { port, controller_type, baud_rate } = request;
    let kind = controller_type
        .parse::<ControllerKind>()
        .ok()
        .filter(|kind| hub.kinds.contains(kind))
        .ok_or_else(|| SessionError::UnsupportedKind(controller_type.clone()))?;
    let session = hub.registry.get_or_create(&port, kind).await?;
    let baud_rate = baud_rate.unwrap_or(hub.config.baud_rate);
    let opened = match session.open(baud_rate).await {
        Ok(opened) => opened,
        Err(error) => {
            hub.registry.discard_if_unused(&session);
            return Err(error.into());
        }
    };
    if opened {
        if let Some((name, content)) = hub.files.content_for(&port) {
            session.load_file(name, content).await?;
        }
        session.add_connection(client);
        hub.multiplexer.join(client, &port);
        hub.multiplexer.broadcast_room(&port, session.opened_event(baud_rate));
    } else {
        attach(hub, client, &session);
    }
    Ok(json!({ "port": port, "controllerType": kind.to_string(), "opened": opened }))
}

async fn route(hub: &Hub, client: ClientId, command: ClientCommand) -> Result<Value, RouterError> {
    let result = match command {
        ClientCommand::List => {
            let ports = hub.list_ports().await.map_err(|error| RouterError::ListPorts(format!("{:#}", error)))?;
            hub.multiplexer.broadcast_all(ServerEvent::PortList(ports.clone()));
            json!(ports)
        }
        ClientCommand::Open(request) => open(hub, client, request).await?,
        ClientCommand::Close(PortRequest { port }) => {
            hub.registry.close(&port).await?;
            Value::Null
        }
        ClientCommand::AddClient(PortRequest { port }) => {
            attach(hub, client, &*session(hub, &port)?);
            Value::Null
        }
        ClientCommand::Reconnect(PortRequest { port }) => {
            let session = session(hub, &port)?;
            // A session whose device dropped out gets its hardware back.
            if !session.is_open() {
                session.open(hub.config.baud_rate).await?;
            }
            attach(hub, client, &session);
            Value::Null
        }
        ClientCommand::Command(CommandRequest { port, cmd, args }) => {
            session(hub, &port)?.command(&cmd, &args).await?;
            Value::Null
        }
        ClientCommand::Write(WriteRequest { port, data, context }) => {
            session(hub, &port)?.write(data, context).await?;
            Value::Null
        }
        ClientCommand::Writeln(WriteRequest { port, data, context }) => {
            session(hub, &port)?.writeln(data, context).await?;
            Value::Null
        }
        ClientCommand::FileLoad(request) => json!(hub.files.load(&hub.registry, hub.interpreter_config(), request).await?),
        ClientCommand::FileFetch => {
            hub.files.send_current(client);
            json!(hub.files.current())
        }
        ClientCommand::FileUnload => json!(hub.files.unload(&hub.registry).await?),
        ClientCommand::Ping => {
            hub.multiplexer.send_to(client, ServerMessage::Event(ServerEvent::Pong));
            Value::Null
        }
    };
    Ok(result)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::{config::HubConfig, testing::test_hub};

    fn request(id: u64, json: Value) -> ClientRequest {
        let mut json = json;
        json["id"] = json!(id);
        ClientRequest::parse(&json.to_string()).unwrap()
    }

    struct Ack {
        result: Value,
        error: Option<String>,
        /// Events delivered ahead of the ack.
        events: Vec<ServerEvent>,
    }

    async fn ack(receiver: &mut mpsc::UnboundedReceiver<ServerMessage>, id: u64) -> Ack {
        timeout(Duration::from_secs(5), async {
            let mut events = Vec::new();
            loop {
                match receiver.recv().await.unwrap() {
                    ServerMessage::Ack { id: Some(got), result, error } if got == id => return Ack { result, error, events },
                    ServerMessage::Event(event) => events.push(event),
                    ServerMessage::Ack { .. } => {}
                }
            }
        }).await.unwrap()
    }

    fn events(receiver: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(message) = receiver.try_recv() {
            if let ServerMessage::Event(event) = message {
                events.push(event);
            }
        }
        events
    }

    #[tokio::test]
    async fn test_command_without_session() {
        let hub = test_hub(HubConfig::default());
        let (client, mut receiver) = hub.connect();
        let (_other, mut other_receiver) = hub.connect();
        dispatch(&hub, client, request(1, json!({"event": "command", "data": {"port": "nowhere", "cmd": "homing"}}))).await;
        assert_eq!(ack(&mut receiver, 1).await.error.as_deref(), Some("no session for port nowhere"));
        while let Ok(message) = other_receiver.try_recv() {
            assert!(!matches!(message, ServerMessage::Ack { .. }));
        }
        assert!(hub.multiplexer.room_members("nowhere").is_empty());
    }

    #[tokio::test]
    async fn test_two_clients_share_one_port() {
        let hub = test_hub(HubConfig::default());
        let (a, mut a_receiver) = hub.connect();
        let (b, mut b_receiver) = hub.connect();
        let open = json!({"event": "open", "data": {"port": "mock0", "controllerType": "grbl"}});
        dispatch(&hub, a, request(1, open.clone())).await;
        assert_eq!(ack(&mut a_receiver, 1).await.result["opened"], json!(true));
        dispatch(&hub, b, request(2, open)).await;
        assert_eq!(ack(&mut b_receiver, 2).await.result["opened"], json!(false));
        assert_eq!(hub.registry.sessions().len(), 1);
        assert_eq!(hub.multiplexer.room_members("mock0"), vec![a, b]);
        assert_eq!(hub.registry.get("mock0").unwrap().clients(), vec![a, b]);

        dispatch(&hub, b, request(3, json!({"event": "writeln", "data": {"port": "mock0", "data": "G0 X1"}}))).await;
        assert_eq!(ack(&mut b_receiver, 3).await.error, None);

        dispatch(&hub, a, request(4, json!({"event": "close", "data": {"port": "mock0"}}))).await;
        assert_eq!(ack(&mut a_receiver, 4).await.error, None);
        assert!(hub.registry.get("mock0").is_none());
        dispatch(&hub, a, request(5, json!({"event": "close", "data": {"port": "mock0"}}))).await;
        assert_eq!(ack(&mut a_receiver, 5).await.error.as_deref(), Some("no session for port mock0"));
    }

    #[tokio::test]
    async fn test_open_rejects_disabled_kind() {
        let hub = test_hub(HubConfig::default());
        let (client, mut receiver) = hub.connect();
        dispatch(&hub, client, request(1, json!({"event": "open", "data": {"port": "mock0", "controllerType": "Marlin"}}))).await;
        let ack = ack(&mut receiver, 1).await;
        assert!(ack.error.unwrap().contains("Marlin"));
        assert!(hub.registry.get("mock0").is_none());
        assert!(ack.events.iter().any(|event| matches!(event, ServerEvent::PortError(_))));
    }

    #[tokio::test]
    async fn test_file_load_is_room_scoped() {
        let hub = test_hub(HubConfig::default());
        let (a, mut a_receiver) = hub.connect();
        let (b, mut b_receiver) = hub.connect();
        dispatch(&hub, a, request(1, json!({"event": "open", "data": {"port": "mock0", "controllerType": "Grbl"}}))).await;
        ack(&mut a_receiver, 1).await;
        events(&mut b_receiver);
        dispatch(&hub, a, request(2, json!({"event": "file:load", "data": {"port": "mock0", "name": "part.nc", "content": "G0 X1\nG1 X2 F100\n"}}))).await;
        assert_eq!(ack(&mut a_receiver, 2).await.result["total_lines"], json!(2));
        assert_eq!(hub.registry.get("mock0").unwrap().program_name().as_deref(), Some("part.nc"));
        assert!(!events(&mut b_receiver).iter().any(|event| matches!(event, ServerEvent::FileLoad(_))));

        dispatch(&hub, b, request(3, json!({"event": "file:fetch"}))).await;
        ack(&mut b_receiver, 3).await;
        dispatch(&hub, b, request(4, json!({"event": "file:unload"}))).await;
        assert_eq!(ack(&mut b_receiver, 4).await.result, json!(true));
        assert!(events(&mut a_receiver).iter().any(|event| *event == ServerEvent::FileUnload));
        dispatch(&hub, a, request(5, json!({"event": "close", "data": {"port": "mock0"}}))).await;
    }

    #[tokio::test]
    async fn test_ping_and_addclient() {
        let hub = test_hub(HubConfig::default());
        let (client, mut receiver) = hub.connect();
        dispatch(&hub, client, request(1, json!({"event": "ping"}))).await;
        assert!(ack(&mut receiver, 1).await.events.contains(&ServerEvent::Pong));
        dispatch(&hub, client, request(2, json!({"event": "addclient", "data": {"port": "mock0"}}))).await;
        assert_eq!(ack(&mut receiver, 2).await.error.as_deref(), Some("no session for port mock0"));
    }
}
