use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use common::{grbl::GrblStatusReport, protocol::{PortOpened, ServerEvent}};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use crate::{
    cnc::controller::{Controller, ControllerError, ControllerEvent, ControllerKind},
    multiplexer::ClientId,
    registry::SessionContext,
};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no session for port {0}")]
    PortNotOpen(String),
    #[error("failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },
    #[error("port {port} is already in use by a {existing} controller, not {requested}")]
    KindMismatch { port: String, existing: ControllerKind, requested: ControllerKind },
    #[error("controller type {0:?} is not enabled")]
    UnsupportedKind(String),
    #[error("port {0} is not open")]
    NotOpen(String),
    #[error(transparent)]
    Controller(#[from] ControllerError),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Hands the stored program to a fresh controller, shutting the controller down if that fails.
async fn with_program(controller: Box<dyn Controller>, program: Option<(String, Arc<str>)>) -> Result<Box<dyn Controller>, SessionError> {
    if let Some((name, content)) = program {
        if let Err(error) = controller.load_program(name, content).await {
            controller.shutdown().await;
            return Err(error.into());
        }
    }
    Ok(controller)
}

/// One hardware port and the clients attached to it.
pub struct ControllerSession {
    port: String,
    kind: ControllerKind,
    context: Arc<SessionContext>,
    /// Held across the hardware open so two opens cannot race.
    controller: AsyncMutex<Option<Box<dyn Controller>>>,
    open: Arc<AtomicBool>,
    clients: Mutex<HashSet<ClientId>>,
    program: Mutex<Option<(String, Arc<str>)>>,
    last_status: Arc<Mutex<Option<GrblStatusReport>>>,
}
impl ControllerSession {
    pub fn new(port: String, kind: ControllerKind, context: Arc<SessionContext>) -> Self {
        ControllerSession {
            port,
            kind,
            context,
            controller: AsyncMutex::new(None),
            open: Arc::new(AtomicBool::new(false)),
            clients: Mutex::new(HashSet::new()),
            program: Mutex::new(None),
            last_status: Arc::new(Mutex::new(None)),
        }
    }
    pub fn port(&self) -> &str {
        &self.port
    }
    pub fn kind(&self) -> ControllerKind {
        self.kind
    }
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
    pub fn last_status(&self) -> Option<GrblStatusReport> {
        lock(&self.last_status).clone()
    }
    pub fn opened_event(&self, baud_rate: u32) -> ServerEvent {
        ServerEvent::PortOpen(PortOpened {
            port: self.port.clone(),
            controller_type: self.kind.to_string(),
            baud_rate,
        })
    }

    /// Opens the hardware unless it already is. Returns true when this call opened it.
    pub async fn open(&self, baud_rate: u32) -> Result<bool, SessionError> {
        let mut controller = self.controller.lock().await;
        if controller.is_some() && self.is_open() {
            return Ok(false);
        }
        if let Some(stale) = controller.take() {
            // The device went away underneath us; release the old task before reopening.
            stale.shutdown().await;
        }
        info!("Opening {} ({}, {} baud)", self.port, self.kind, baud_rate);
        let transport = self.context.opener.open(&self.port, baud_rate).await.map_err(|error| {
            warn!("Failed to open {}: {:#}", self.port, error);
            SessionError::OpenFailed { port: self.port.clone(), message: format!("{:#}", error) }
        })?;
        let (events, receiver) = mpsc::unbounded_channel();
        let opened = self.kind.connect(transport, self.context.options.clone(), events);
        let program = lock(&self.program).clone();
        let opened = with_program(opened, program).await?;
        self.open.store(true, Ordering::SeqCst);
        self.spawn_forwarder(receiver);
        *controller = Some(opened);
        Ok(true)
    }
    fn spawn_forwarder(&self, mut receiver: mpsc::UnboundedReceiver<ControllerEvent>) {
        let port = self.port.clone();
        let kind = self.kind;
        let open = self.open.clone();
        let last_status = self.last_status.clone();
        let multiplexer = self.context.multiplexer.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match &event {
                    ControllerEvent::State(status) => *lock(&last_status) = Some(status.clone()),
                    // An explicit close announces itself.
                    ControllerEvent::Closed(None) => break,
                    ControllerEvent::Closed(Some(reason)) => {
                        warn!("Lost {}: {}", port, reason);
                        open.store(false, Ordering::SeqCst);
                    }
                    _ => (),
                }
                multiplexer.broadcast_room(&port, event.into_server_event(&port, kind));
            }
            debug!("Event forwarding for {} finished", port);
        });
    }
    /// Stops the controller and releases the hardware. Errors if nothing was open.
    pub async fn close(&self) -> Result<(), SessionError> {
        let controller = self.controller.lock().await.take();
        self.open.store(false, Ordering::SeqCst);
        match controller {
            Some(controller) => {
                info!("Closing {}", self.port);
                controller.shutdown().await;
                Ok(())
            }
            None => Err(SessionError::PortNotOpen(self.port.clone())),
        }
    }

    pub fn add_connection(&self, client: ClientId) -> bool {
        lock(&self.clients).insert(client)
    }
    pub fn remove_connection(&self, client: ClientId) -> bool {
        lock(&self.clients).remove(&client)
    }
    pub fn clients(&self) -> Vec<ClientId> {
        let mut clients: Vec<ClientId> = lock(&self.clients).iter().copied().collect();
        clients.sort_unstable();
        clients
    }
    pub fn clear_connections(&self) {
        lock(&self.clients).clear();
    }

    pub fn program_name(&self) -> Option<String> {
        lock(&self.program).as_ref().map(|(name, _)| name.clone())
    }
    pub async fn load_file(&self, name: String, content: Arc<str>) -> Result<(), SessionError> {
        *lock(&self.program) = Some((name.clone(), content.clone()));
        match self.controller.lock().await.as_ref() {
            Some(controller) if self.is_open() => Ok(controller.load_program(name, content).await?),
            _ => Ok(()),
        }
    }
    pub async fn unload_file(&self) -> Result<(), SessionError> {
        *lock(&self.program) = None;
        match self.controller.lock().await.as_ref() {
            Some(controller) if self.is_open() => Ok(controller.unload_program().await?),
            _ => Ok(()),
        }
    }

    pub async fn command(&self, name: &str, args: &[Value]) -> Result<(), SessionError> {
        match self.controller.lock().await.as_ref() {
            Some(controller) if self.is_open() => Ok(controller.command(name, args).await?),
            _ => Err(SessionError::NotOpen(self.port.clone())),
        }
    }
    pub async fn write(&self, data: String, context: Value) -> Result<(), SessionError> {
        match self.controller.lock().await.as_ref() {
            Some(controller) if self.is_open() => Ok(controller.write(data, context).await?),
            _ => Err(SessionError::NotOpen(self.port.clone())),
        }
    }
    pub async fn writeln(&self, data: String, context: Value) -> Result<(), SessionError> {
        match self.controller.lock().await.as_ref() {
            Some(controller) if self.is_open() => Ok(controller.writeln(data, context).await?),
            _ => Err(SessionError::NotOpen(self.port.clone())),
        }
    }
}
