use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use common::protocol::{PortClosed, ServerEvent};
use tokio::sync::watch;
use tracing::debug;

use crate::{
    cnc::{connection::PortOpener, controller::{ControllerKind, ControllerOptions}},
    multiplexer::Multiplexer,
    session::{ControllerSession, SessionError},
};

/// What every session needs from the process.
pub struct SessionContext {
    pub opener: Arc<dyn PortOpener>,
    pub multiplexer: Arc<Multiplexer>,
    pub options: ControllerOptions,
}

#[derive(Default)]
struct Sessions {
    active: HashMap<String, Arc<ControllerSession>>,
    /// Ports whose hardware is still being released. The sender side drops once it is.
    closing: HashMap<String, watch::Receiver<()>>,
}

/// Marks a port as closing until dropped.
struct ClosingGuard<'a> {
    registry: &'a SessionRegistry,
    port: &'a str,
    _done: watch::Sender<()>,
}
impl Drop for ClosingGuard<'_> {
    fn drop(&mut self) {
        self.registry.lock().closing.remove(self.port);
    }
}

/// The only owner of sessions: one per port.
pub struct SessionRegistry {
    context: Arc<SessionContext>,
    sessions: Mutex<Sessions>,
}
impl SessionRegistry {
    pub fn new(context: SessionContext) -> Self {
        SessionRegistry { context: Arc::new(context), sessions: Mutex::new(Sessions::default()) }
    }
    fn lock(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    /// Waits out a close in progress on the same port, so a port never has two hardware handles.
    pub async fn get_or_create(&self, port: &str, kind: ControllerKind) -> Result<Arc<ControllerSession>, SessionError> {
        loop {
            let mut closing = {
                let mut sessions = self.lock();
                match sessions.closing.get(port) {
                    Some(closing) => closing.clone(),
                    None => return self.get_or_insert(&mut sessions, port, kind),
                }
            };
            debug!("Waiting for {} to finish closing", port);
            while closing.changed().await.is_ok() {}
        }
    }
    fn get_or_insert(&self, sessions: &mut Sessions, port: &str, kind: ControllerKind) -> Result<Arc<ControllerSession>, SessionError> {
        if let Some(session) = sessions.active.get(port) {
            if session.kind() != kind {
                return Err(SessionError::KindMismatch { port: port.to_string(), existing: session.kind(), requested: kind });
            }
            return Ok(session.clone());
        }
        debug!("New session for {}", port);
        let session = Arc::new(ControllerSession::new(port.to_string(), kind, self.context.clone()));
        sessions.active.insert(port.to_string(), session.clone());
        Ok(session)
    }
    pub fn get(&self, port: &str) -> Option<Arc<ControllerSession>> {
        self.lock().active.get(port).cloned()
    }
    /// Drops a session nobody uses, e.g. after its open failed.
    pub fn discard_if_unused(&self, session: &Arc<ControllerSession>) -> bool {
        let mut sessions = self.lock();
        let unused = !session.is_open() && session.clients().is_empty();
        match sessions.active.get(session.port()) {
            Some(current) if unused && Arc::ptr_eq(current, session) => {
                sessions.active.remove(session.port());
                true
            }
            _ => false,
        }
    }
    /// Removes the session, releases its hardware, and empties its room.
    pub async fn close(&self, port: &str) -> Result<Arc<ControllerSession>, SessionError> {
        let (done, closed) = watch::channel(());
        let session = {
            let mut sessions = self.lock();
            let session = sessions.active.remove(port).ok_or_else(|| SessionError::PortNotOpen(port.to_string()))?;
            sessions.closing.insert(port.to_string(), closed);
            session
        };
        let _closing = ClosingGuard { registry: self, port, _done: done };
        if let Err(error) = session.close().await {
            debug!("Session for {} had no hardware open: {}", port, error);
        }
        let multiplexer = &self.context.multiplexer;
        multiplexer.broadcast_room(port, ServerEvent::PortClose(PortClosed { port: port.to_string(), reason: None }));
        multiplexer.clear_room(port);
        session.clear_connections();
        Ok(session)
    }
    pub fn sessions(&self) -> Vec<Arc<ControllerSession>> {
        self.lock().active.values().cloned().collect()
    }
    pub fn open_ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = self.lock().active.values().filter(|session| session.is_open()).map(|session| session.port().to_string()).collect();
        ports.sort();
        ports
    }
}
