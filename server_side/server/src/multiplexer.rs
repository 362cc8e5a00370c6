use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use common::protocol::{ServerEvent, ServerMessage};
use tokio::sync::mpsc;
use tracing::debug;

pub type ClientId = u64;

#[derive(Default)]
struct Inner {
    clients: HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>,
    rooms: HashMap<String, HashSet<ClientId>>,
}

/// Outbound fan-out. Every client has one unbounded queue, and each port has a room of client ids.
#[derive(Default)]
pub struct Multiplexer {
    next_id: AtomicU64,
    inner: Mutex<Inner>,
}
impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    pub fn register(&self) -> (ClientId, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (sender, receiver) = mpsc::unbounded_channel();
        self.lock().clients.insert(id, sender);
        (id, receiver)
    }
    /// Returns the rooms the client was in.
    pub fn remove_client(&self, client: ClientId) -> Vec<String> {
        let mut inner = self.lock();
        inner.clients.remove(&client);
        let mut left = Vec::new();
        inner.rooms.retain(|port, members| {
            if members.remove(&client) {
                left.push(port.clone());
            }
            !members.is_empty()
        });
        left
    }
    /// Returns false if the client was already in the room.
    pub fn join(&self, client: ClientId, port: &str) -> bool {
        let mut inner = self.lock();
        if !inner.clients.contains_key(&client) {
            return false;
        }
        inner.rooms.entry(port.to_string()).or_default().insert(client)
    }
    pub fn leave(&self, client: ClientId, port: &str) -> bool {
        let mut inner = self.lock();
        let Some(members) = inner.rooms.get_mut(port) else { return false };
        let removed = members.remove(&client);
        if members.is_empty() {
            inner.rooms.remove(port);
        }
        removed
    }
    pub fn clear_room(&self, port: &str) -> Vec<ClientId> {
        self.lock().rooms.remove(port).map(|members| members.into_iter().collect()).unwrap_or_default()
    }
    pub fn room_members(&self, port: &str) -> Vec<ClientId> {
        let mut members: Vec<ClientId> = self.lock().rooms.get(port).map(|members| members.iter().copied().collect()).unwrap_or_default();
        members.sort_unstable();
        members
    }
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
    pub fn send_to(&self, client: ClientId, message: ServerMessage) -> bool {
        match self.lock().clients.get(&client) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }
    pub fn broadcast_room(&self, port: &str, event: ServerEvent) {
        let inner = self.lock();
        let Some(members) = inner.rooms.get(port) else {
            debug!("No clients listening on {} for {}", port, event.name());
            return;
        };
        let message = ServerMessage::Event(event);
        for client in members {
            if let Some(sender) = inner.clients.get(client) {
                drop(sender.send(message.clone()));
            }
        }
    }
    pub fn broadcast_all(&self, event: ServerEvent) {
        let message = ServerMessage::Event(event);
        for sender in self.lock().clients.values() {
            drop(sender.send(message.clone()));
        }
    }
}
