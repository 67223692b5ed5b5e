use confer_protocol::{ClientId, ServerMessage};
use std::collections::{HashMap, HashSet};
use tokio::sync::{mpsc, RwLock};

pub struct ConnectionManager {
    /// Map from client ID to outbound message channel
    senders: RwLock<HashMap<ClientId, mpsc::UnboundedSender<String>>>,
    /// Map from client ID to the room whose broadcast group it is in
    client_rooms: RwLock<HashMap<ClientId, String>>,
    /// Map from room name to member client IDs
    room_members: RwLock<HashMap<String, HashSet<ClientId>>>,
}

fn encode(message: &ServerMessage) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            tracing::error!("Failed to serialize message: {}", e);
            None
        }
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            senders: RwLock::new(HashMap::new()),
            client_rooms: RwLock::new(HashMap::new()),
            room_members: RwLock::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, client_id: ClientId, sender: mpsc::UnboundedSender<String>) {
        self.senders.write().await.insert(client_id, sender);
        tracing::debug!("Client {} connected", client_id);
    }

    pub async fn remove_connection(&self, client_id: ClientId) {
        self.leave_room(client_id).await;
        self.senders.write().await.remove(&client_id);
        tracing::debug!("Client {} disconnected", client_id);
    }

    /// Put the client in the broadcast group of `room`, leaving any other group
    pub async fn join_room(&self, client_id: ClientId, room: &str) {
        let previous = self
            .client_rooms
            .write()
            .await
            .insert(client_id, room.to_string());

        let mut members = self.room_members.write().await;
        if let Some(previous) = previous.filter(|p| p != room) {
            if let Some(group) = members.get_mut(&previous) {
                group.remove(&client_id);
            }
        }
        members.entry(room.to_string()).or_default().insert(client_id);

        tracing::debug!("Client {} joined broadcast group {}", client_id, room);
    }

    /// Remove the client from its broadcast group; returns the room it left
    pub async fn leave_room(&self, client_id: ClientId) -> Option<String> {
        let room = self.client_rooms.write().await.remove(&client_id)?;

        let mut members = self.room_members.write().await;
        if let Some(group) = members.get_mut(&room) {
            group.remove(&client_id);
            if group.is_empty() {
                members.remove(&room);
            }
        }

        tracing::debug!("Client {} left broadcast group {}", client_id, room);
        Some(room)
    }

    pub async fn room_of(&self, client_id: ClientId) -> Option<String> {
        self.client_rooms.read().await.get(&client_id).cloned()
    }

    pub async fn room_member_count(&self, room: &str) -> usize {
        self.room_members
            .read()
            .await
            .get(room)
            .map(|group| group.len())
            .unwrap_or(0)
    }

    /// Send to every member of `room` except `except`
    pub async fn broadcast_to_room_except(&self, room: &str, except: ClientId, message: &ServerMessage) {
        let Some(json) = encode(message) else {
            return;
        };

        let members = self.room_members.read().await;
        let senders = self.senders.read().await;

        if let Some(group) = members.get(room) {
            tracing::debug!("Broadcasting to {} members of room {}", group.len().saturating_sub(1), room);
            for client_id in group.iter().filter(|id| **id != except) {
                if let Some(sender) = senders.get(client_id) {
                    if let Err(e) = sender.send(json.clone()) {
                        tracing::error!("Failed to send message to {}: {}", client_id, e);
                    }
                }
            }
        } else {
            tracing::debug!("No members in room {}", room);
        }
    }

    pub async fn send_to_connection(&self, client_id: ClientId, message: &ServerMessage) {
        let Some(json) = encode(message) else {
            return;
        };

        let senders = self.senders.read().await;

        if let Some(sender) = senders.get(&client_id) {
            if let Err(e) = sender.send(json) {
                tracing::error!("Failed to send message to {}: {}", client_id, e);
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}
