use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::ReactionSet;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    Add,
    Remove,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "message")]
    Message {
        content: String,
    },
    /// Legacy combined form; newer clients send `add_reaction` / `remove_reaction`.
    #[serde(rename = "reaction")]
    Reaction {
        message_id: String,
        emoji: String,
        action: ReactionAction,
    },
    #[serde(rename = "add_reaction")]
    AddReaction {
        message_id: String,
        emoji: String,
    },
    #[serde(rename = "remove_reaction")]
    RemoveReaction {
        message_id: String,
        emoji: String,
    },
    #[serde(rename = "call_offer")]
    CallOffer {
        from_user: String,
        to_user: String,
        call_type: String,
        sdp: Option<Value>,
    },
    #[serde(rename = "call_answer")]
    CallAnswer {
        from_user: String,
        to_user: String,
        sdp: Option<Value>,
        accepted: bool,
    },
    #[serde(rename = "ice_candidate")]
    IceCandidate {
        from_user: String,
        to_user: String,
        candidate: Value,
    },
}

impl ClientMessage {
    /// Target username for the direct-relay kinds, None for everything else.
    pub fn to_user(&self) -> Option<&str> {
        match self {
            ClientMessage::CallOffer { to_user, .. }
            | ClientMessage::CallAnswer { to_user, .. }
            | ClientMessage::IceCandidate { to_user, .. } => Some(to_user),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "join")]
    Join {
        user: String,
        online: Vec<String>,
    },
    #[serde(rename = "leave")]
    Leave {
        user: String,
        online: Vec<String>,
    },
    #[serde(rename = "message")]
    Message {
        user: String,
        content: String,
        message_id: String,
        reactions: ReactionSet,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "reaction_update")]
    ReactionUpdate {
        user: String,
        message_id: String,
        emoji: String,
        users: Vec<String>,
        reactions: ReactionSet,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_chat_message() {
        let decoded: ClientMessage =
            serde_json::from_str(r#"{"type":"message","content":"hi"}"#).unwrap();
        match decoded {
            ClientMessage::Message { content } => assert_eq!(content, "hi"),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn decodes_legacy_reaction_with_action() {
        let decoded: ClientMessage = serde_json::from_str(
            r#"{"type":"reaction","message_id":"m1","emoji":"👍","action":"remove"}"#,
        )
        .unwrap();
        match decoded {
            ClientMessage::Reaction { action, .. } => {
                assert_eq!(action, ReactionAction::Remove);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_kind() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"shout","content":"HI"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_missing_required_field() {
        let result = serde_json::from_str::<ClientMessage>(r#"{"type":"add_reaction","emoji":"👍"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn call_offer_reserializes_verbatim() {
        let raw = json!({
            "type": "call_offer",
            "from_user": "alice",
            "to_user": "bob",
            "call_type": "video",
            "sdp": {"kind": "offer"}
        });
        let decoded: ClientMessage = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(serde_json::to_value(&decoded).unwrap(), raw);
    }

    #[test]
    fn join_event_wire_shape() {
        let event = ServerMessage::Join {
            user: "alice".to_string(),
            online: vec!["alice".to_string()],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "join", "user": "alice", "online": ["alice"]})
        );
    }
}
