use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Stable identity for one live connection, minted when the transport
/// accepts the socket. Never reused for the lifetime of the process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(String);

impl ConnId {
    pub fn generate() -> Self {
        ConnId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle for pushing serialized events toward one connection's socket.
/// A failed send means the connection's outbound pump is gone.
pub type ConnectionSender = mpsc::UnboundedSender<String>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReactionError {
    #[error("message {0} not found")]
    MessageNotFound(String),
}

/// Emoji -> usernames who applied it. An emoji key is never present with
/// an empty user list.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReactionSet(HashMap<String, Vec<String>>);

impl ReactionSet {
    pub fn add(&mut self, emoji: &str, username: &str) {
        let users = self.0.entry(emoji.to_string()).or_default();
        if !users.iter().any(|u| u == username) {
            users.push(username.to_string());
        }
    }

    /// Returns whether the username was present and got removed.
    pub fn remove(&mut self, emoji: &str, username: &str) -> bool {
        let Some(users) = self.0.get_mut(emoji) else {
            return false;
        };
        let Some(pos) = users.iter().position(|u| u == username) else {
            return false;
        };
        users.remove(pos);
        if users.is_empty() {
            self.0.remove(emoji);
        }
        true
    }

    pub fn users_for(&self, emoji: &str) -> Vec<String> {
        self.0.get(emoji).cloned().unwrap_or_default()
    }

    pub fn contains(&self, emoji: &str) -> bool {
        self.0.contains_key(emoji)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub user: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub reactions: ReactionSet,
}

impl StoredMessage {
    pub fn new(user: &str, content: String) -> Self {
        StoredMessage {
            id: Uuid::new_v4().to_string(),
            user: user.to_string(),
            content,
            timestamp: Utc::now(),
            reactions: ReactionSet::default(),
        }
    }
}

struct Member {
    name: String,
    seq: u64,
    sender: ConnectionSender,
}

#[derive(Default)]
struct RoomState {
    next_seq: u64,
    members: HashMap<ConnId, Member>,
    messages: HashMap<String, StoredMessage>,
}

impl RoomState {
    /// Usernames with at least one live connection, in join order,
    /// deduplicated.
    fn online(&self) -> Vec<String> {
        let mut members: Vec<&Member> = self.members.values().collect();
        members.sort_unstable_by_key(|m| m.seq);
        let mut online: Vec<String> = Vec::with_capacity(members.len());
        for member in members {
            if !online.iter().any(|name| name == &member.name) {
                online.push(member.name.clone());
            }
        }
        online
    }

    fn snapshot(&self) -> Vec<(ConnId, ConnectionSender)> {
        self.members
            .iter()
            .map(|(conn, member)| (conn.clone(), member.sender.clone()))
            .collect()
    }
}

/// What a departing member leaves behind: who left, the roster afterwards,
/// and the senders of everyone still in the room.
pub struct Departure {
    pub user: String,
    pub online: Vec<String>,
    pub remaining: Vec<(ConnId, ConnectionSender)>,
}

/// One named room: membership and the message store behind a single
/// coarse lock. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct Room {
    state: Arc<RwLock<RoomState>>,
}

impl Room {
    pub async fn add_member(
        &self,
        conn: ConnId,
        username: &str,
        sender: ConnectionSender,
    ) -> Vec<String> {
        let mut state = self.state.write().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.members.insert(
            conn,
            Member {
                name: username.to_string(),
                seq,
                sender,
            },
        );
        state.online()
    }

    /// Removes the connection. None if it was not a member.
    pub async fn remove_member(&self, conn: &ConnId) -> Option<Departure> {
        let mut state = self.state.write().await;
        let member = state.members.remove(conn)?;
        Some(Departure {
            user: member.name,
            online: state.online(),
            remaining: state.snapshot(),
        })
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.members.is_empty()
    }

    pub async fn has_user(&self, username: &str) -> bool {
        self.state
            .read()
            .await
            .members
            .values()
            .any(|m| m.name == username)
    }

    /// Resolves a username to its connection. When the same username is
    /// connected more than once, the most recently joined connection wins.
    pub async fn resolve_user(&self, username: &str) -> Option<(ConnId, ConnectionSender)> {
        let state = self.state.read().await;
        state
            .members
            .iter()
            .filter(|(_, m)| m.name == username)
            .max_by_key(|(_, m)| m.seq)
            .map(|(conn, m)| (conn.clone(), m.sender.clone()))
    }

    pub async fn sender_snapshot(&self) -> Vec<(ConnId, ConnectionSender)> {
        self.state.read().await.snapshot()
    }

    pub async fn store_message(&self, message: StoredMessage) {
        let mut state = self.state.write().await;
        state.messages.insert(message.id.clone(), message);
    }

    pub async fn message(&self, message_id: &str) -> Option<StoredMessage> {
        self.state.read().await.messages.get(message_id).cloned()
    }

    pub async fn add_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        username: &str,
    ) -> Result<(), ReactionError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ReactionError::MessageNotFound(message_id.to_string()))?;
        message.reactions.add(emoji, username);
        Ok(())
    }

    /// Ok(true) when a reaction was actually removed; Ok(false) when the
    /// username/emoji pair was never there.
    pub async fn remove_reaction(
        &self,
        message_id: &str,
        emoji: &str,
        username: &str,
    ) -> Result<bool, ReactionError> {
        let mut state = self.state.write().await;
        let message = state
            .messages
            .get_mut(message_id)
            .ok_or_else(|| ReactionError::MessageNotFound(message_id.to_string()))?;
        Ok(message.reactions.remove(emoji, username))
    }
}
