use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use warp::ws::{Message, WebSocket};

use crate::messages::{ClientMessage, ReactionAction, ServerMessage};
use crate::room::{ConnId, ConnectionSender, Room, StoredMessage};

type Rooms = Arc<RwLock<HashMap<String, Room>>>;

/// The connection/room registry and broadcast engine. Cloning shares the
/// same registry; one instance serves the whole process.
#[derive(Clone, Default)]
pub struct Server {
    rooms: Rooms,
}

impl Server {
    pub fn new() -> Self {
        Self::default()
    }

    async fn room(&self, name: &str) -> Option<Room> {
        self.rooms.read().await.get(name).cloned()
    }

    /// Registers the connection and announces the updated roster to the
    /// whole room. Rooms come into existence on first join.
    pub async fn join(&self, room_name: &str, username: &str, conn: ConnId, tx: ConnectionSender) {
        let online = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(room_name.to_string()).or_default().clone();
            room.add_member(conn, username, tx).await
        };
        self.broadcast(
            room_name,
            &ServerMessage::Join {
                user: username.to_string(),
                online,
            },
        )
        .await;
    }

    /// Deregisters the connection, announcing the departure if it was a
    /// member. A no-op for connections the room never saw.
    pub async fn leave(&self, room_name: &str, conn: &ConnId) {
        let dead = self.evict(room_name, conn).await;
        self.reap(room_name, dead).await;
    }

    pub async fn is_member(&self, room_name: &str, username: &str) -> bool {
        match self.room(room_name).await {
            Some(room) => room.has_user(username).await,
            None => false,
        }
    }

    /// Serializes the event once and pushes it to every connection in the
    /// room. Failed sends are proof of disconnection: those connections
    /// are evicted afterwards, which cascades into departure broadcasts.
    pub async fn broadcast(&self, room_name: &str, message: &ServerMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let Some(room) = self.room(room_name).await else {
            return;
        };
        let dead = send_many(&room.sender_snapshot().await, &text);
        self.reap(room_name, dead).await;
    }

    /// Delivers a payload to the one connection resolved for the target
    /// username. Absent target: silently dropped, like any best-effort
    /// signaling packet.
    pub async fn send_to_user(&self, room_name: &str, target: &str, message: &ClientMessage) {
        let Ok(text) = serde_json::to_string(message) else {
            return;
        };
        let Some(room) = self.room(room_name).await else {
            return;
        };
        let Some((conn, tx)) = room.resolve_user(target).await else {
            return;
        };
        if tx.send(text).is_err() {
            debug!("relay to {} in {} failed, evicting {}", target, room_name, conn);
            self.leave(room_name, &conn).await;
        }
    }

    /// Removes one connection and broadcasts its departure to whoever is
    /// left. Returns the connections whose departure-broadcast send failed.
    async fn evict(&self, room_name: &str, conn: &ConnId) -> Vec<ConnId> {
        let Some(room) = self.room(room_name).await else {
            return Vec::new();
        };
        let Some(departure) = room.remove_member(conn).await else {
            return Vec::new();
        };
        if room.is_empty().await {
            self.drop_room_if_empty(room_name).await;
        }
        let message = ServerMessage::Leave {
            user: departure.user,
            online: departure.online,
        };
        match serde_json::to_string(&message) {
            Ok(text) => send_many(&departure.remaining, &text),
            Err(_) => Vec::new(),
        }
    }

    /// Drains an eviction worklist. Evictions run against membership
    /// snapshots, so a cascade never iterates a set it is mutating.
    async fn reap(&self, room_name: &str, mut dead: Vec<ConnId>) {
        while let Some(conn) = dead.pop() {
            dead.extend(self.evict(room_name, &conn).await);
        }
    }

    async fn drop_room_if_empty(&self, room_name: &str) {
        let mut rooms = self.rooms.write().await;
        // re-check under the registry lock; a join may have raced us
        if let Some(room) = rooms.get(room_name) {
            if room.is_empty().await {
                rooms.remove(room_name);
                debug!("room {} destroyed", room_name);
            }
        }
    }

    /// Dispatches one decoded inbound payload on behalf of a session.
    pub async fn handle_client_message(
        &self,
        room_name: &str,
        username: &str,
        message: ClientMessage,
    ) {
        match message {
            ClientMessage::Message { content } => {
                let Some(room) = self.room(room_name).await else {
                    return;
                };
                let stored = StoredMessage::new(username, content);
                let event = ServerMessage::Message {
                    user: stored.user.clone(),
                    content: stored.content.clone(),
                    message_id: stored.id.clone(),
                    reactions: stored.reactions.clone(),
                    timestamp: stored.timestamp,
                };
                room.store_message(stored).await;
                self.broadcast(room_name, &event).await;
            }
            ClientMessage::AddReaction { message_id, emoji } => {
                self.apply_reaction(room_name, username, &message_id, &emoji, ReactionAction::Add)
                    .await;
            }
            ClientMessage::RemoveReaction { message_id, emoji } => {
                self.apply_reaction(
                    room_name,
                    username,
                    &message_id,
                    &emoji,
                    ReactionAction::Remove,
                )
                .await;
            }
            ClientMessage::Reaction {
                message_id,
                emoji,
                action,
            } => {
                self.apply_reaction(room_name, username, &message_id, &emoji, action)
                    .await;
            }
            relay @ (ClientMessage::CallOffer { .. }
            | ClientMessage::CallAnswer { .. }
            | ClientMessage::IceCandidate { .. }) => {
                let Some(target) = relay.to_user() else {
                    return;
                };
                let target = target.to_string();
                self.send_to_user(room_name, &target, &relay).await;
            }
        }
    }

    /// Shared path for all three reaction kinds. Only live room members
    /// may react; a mutation that changed nothing stays silent.
    async fn apply_reaction(
        &self,
        room_name: &str,
        username: &str,
        message_id: &str,
        emoji: &str,
        action: ReactionAction,
    ) {
        let Some(room) = self.room(room_name).await else {
            return;
        };
        if !room.has_user(username).await {
            debug!("reaction from non-member {} in {} dropped", username, room_name);
            return;
        }
        let changed = match action {
            ReactionAction::Add => room
                .add_reaction(message_id, emoji, username)
                .await
                .map(|()| true),
            ReactionAction::Remove => room.remove_reaction(message_id, emoji, username).await,
        };
        match changed {
            Ok(true) => {
                let Some(message) = room.message(message_id).await else {
                    return;
                };
                let users = message.reactions.users_for(emoji);
                self.broadcast(
                    room_name,
                    &ServerMessage::ReactionUpdate {
                        user: username.to_string(),
                        message_id: message_id.to_string(),
                        emoji: emoji.to_string(),
                        users,
                        reactions: message.reactions,
                    },
                )
                .await;
            }
            Ok(false) => {}
            Err(e) => debug!("reaction from {} in {} dropped: {}", username, room_name, e),
        }
    }

    /// Session loop for one WebSocket: join on connect, receive/decode/
    /// dispatch until the transport closes, then leave.
    pub async fn handle_connection(&self, room_name: String, username: String, ws: WebSocket) {
        let conn = ConnId::generate();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        // outbound pump: room events -> socket
        let pump_conn = conn.clone();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if let Err(e) = ws_tx.send(Message::text(text)).await {
                    debug!("outbound send to {} failed: {}", pump_conn, e);
                    break;
                }
            }
        });

        self.join(&room_name, &username, conn.clone(), tx).await;
        info!("{} joined {} as {}", conn, room_name, username);

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        match serde_json::from_str::<ClientMessage>(text) {
                            Ok(client_msg) => {
                                self.handle_client_message(&room_name, &username, client_msg)
                                    .await;
                            }
                            Err(e) => debug!("ignoring payload from {}: {}", conn, e),
                        }
                    }
                }
                Err(e) => {
                    debug!("websocket error on {}: {}", conn, e);
                    break;
                }
            }
        }

        info!("{} disconnected from {}", conn, room_name);
        self.leave(&room_name, &conn).await;
    }
}

fn send_many(targets: &[(ConnId, ConnectionSender)], text: &str) -> Vec<ConnId> {
    let mut dead = Vec::new();
    for (conn, tx) in targets {
        if tx.send(text.to_string()).is_err() {
            dead.push(conn.clone());
        }
    }
    dead
}

#[cfg(test)]
impl Server {
    async fn room_exists(&self, name: &str) -> bool {
        self.rooms.read().await.contains_key(name)
    }
}
