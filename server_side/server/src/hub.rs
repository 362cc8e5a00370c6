use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use chrono::Utc;
use common::{
    api::Health,
    protocol::{PortInfo, ServerEvent, ServerMessage, StartupInfo},
};
use gcode::InterpreterConfig;
use itertools::Itertools;
use tokio::sync::mpsc;
use tracing::info;

use crate::{
    cnc::{
        connection::{classify_port, PortOpener},
        controller::ControllerKind,
    },
    config::HubConfig,
    file_queue::FileQueue,
    multiplexer::{ClientId, Multiplexer},
    registry::{SessionContext, SessionRegistry},
};

pub struct Hub {
    pub config: HubConfig,
    pub kinds: HashSet<ControllerKind>,
    pub multiplexer: Arc<Multiplexer>,
    pub registry: SessionRegistry,
    pub files: Arc<FileQueue>,
    opener: Arc<dyn PortOpener>,
    interpreter: RwLock<InterpreterConfig>,
}
impl Hub {
    pub fn new(config: HubConfig, opener: Arc<dyn PortOpener>) -> anyhow::Result<Hub> {
        let kinds = config.enabled_kinds()?;
        let multiplexer = Arc::new(Multiplexer::new());
        let registry = SessionRegistry::new(SessionContext {
            opener: opener.clone(),
            multiplexer: multiplexer.clone(),
            options: config.controller_options(),
        });
        Ok(Hub {
            kinds,
            files: Arc::new(FileQueue::new(multiplexer.clone())),
            registry,
            multiplexer,
            opener,
            interpreter: RwLock::new(config.interpreter.clone()),
            config,
        })
    }

    pub fn authorize(&self, token: Option<&str>) -> bool {
        self.config.access_tokens.is_empty()
            || token.map_or(false, |token| self.config.access_tokens.iter().any(|allowed| allowed == token))
    }

    fn startup_info(&self) -> StartupInfo {
        StartupInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            controllers: self.kinds.iter().map(ToString::to_string).sorted().collect(),
            time: Utc::now(),
        }
    }

    /// Registers a client, greets it, and replays the loaded program to it.
    pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let (client, receiver) = self.multiplexer.register();
        info!("Client {} connected", client);
        self.multiplexer.send_to(client, ServerMessage::Event(ServerEvent::Startup(self.startup_info())));
        self.files.send_current(client);
        (client, receiver)
    }

    /// Leaves every room; open ports stay open.
    pub fn disconnect(&self, client: ClientId) {
        self.multiplexer.remove_client(client);
        for session in self.registry.sessions() {
            session.remove_connection(client);
        }
        info!("Client {} disconnected", client);
    }

    pub async fn list_ports(&self) -> anyhow::Result<Vec<PortInfo>> {
        let open_ports: HashSet<String> = self.registry.open_ports().into_iter().collect();
        let ports = self.opener.list().await?;
        Ok(ports
            .iter()
            .map(|info| classify_port(info, &self.config.port_filters, open_ports.contains(&info.port_name)))
            .sorted_by(|a, b| b.recognized.cmp(&a.recognized).then_with(|| a.port.cmp(&b.port)))
            .collect())
    }

    pub fn interpreter_config(&self) -> InterpreterConfig {
        self.interpreter.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }
    /// Replaces the settings, tells every client, and re-parses the loaded program with them.
    pub fn set_interpreter_config(&self, config: InterpreterConfig) {
        *self.interpreter.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = config.clone();
        self.multiplexer.broadcast_all(ServerEvent::ConfigChange(config.clone()));
        self.files.reparse(config);
    }

    pub fn health(&self) -> Health {
        Health {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            open_ports: self.registry.open_ports(),
            clients: self.multiplexer.client_count(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{test_hub, MockOpener};

    #[test]
    fn test_authorize() {
        let open = test_hub(HubConfig::default());
        assert!(open.authorize(None));
        let guarded = test_hub(HubConfig { access_tokens: vec!["abc".into()], ..Default::default() });
        assert!(!guarded.authorize(None));
        assert!(!guarded.authorize(Some("abd")));
        assert!(guarded.authorize(Some("abc")));
    }

    #[test]
    fn test_no_valid_controller() {
        let config = HubConfig { controllers: vec!["TinyG".into()], ..Default::default() };
        assert!(Hub::new(config, Arc::new(MockOpener::default())).is_err());
    }

    #[tokio::test]
    async fn test_connect_greets() {
        let hub = test_hub(HubConfig::default());
        let (client, mut receiver) = hub.connect();
        match receiver.try_recv().unwrap() {
            ServerMessage::Event(ServerEvent::Startup(info)) => assert_eq!(info.controllers, vec!["Grbl".to_string()]),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(hub.health().clients, 1);
        hub.disconnect(client);
        assert_eq!(hub.health().clients, 0);
    }

    #[tokio::test]
    async fn test_list_ports() {
        let hub = test_hub(HubConfig::default());
        let ports = hub.list_ports().await.unwrap();
        assert_eq!(ports.iter().map(|port| (port.port.as_str(), port.recognized)).collect::<Vec<_>>(), vec![("mock0", true), ("ttyS0", false)]);
    }

    #[tokio::test]
    async fn test_settings_change_is_broadcast() {
        let hub = test_hub(HubConfig::default());
        let (_client, mut receiver) = hub.connect();
        while receiver.try_recv().is_ok() {}
        let config = InterpreterConfig { arc_points: 8, ..Default::default() };
        hub.set_interpreter_config(config.clone());
        assert_eq!(hub.interpreter_config(), config);
        assert_eq!(receiver.try_recv().unwrap(), ServerMessage::Event(ServerEvent::ConfigChange(config)));
    }
}
