//! Wire Protocol
//!
//! JSON frames exchanged with WebSocket clients. All channels share one
//! envelope shape with optional fields; the `type` discriminator tells the
//! client what to expect. History and live messages use the same message
//! shape so a client can merge them by id.

use serde::{Deserialize, Serialize};

use crate::auth::Identity;
use crate::store::StoredMessage;

pub const TYPE_SYSTEM: &str = "system";
pub const TYPE_COMMUNITY_HISTORY: &str = "community.history";
pub const TYPE_COMMUNITY_MESSAGE: &str = "community.message";
pub const TYPE_CHAT_HISTORY: &str = "chat.history";
pub const TYPE_CHAT_MESSAGE: &str = "chat.message";

/// A single persisted message as shown to clients, in history and live.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    pub id: i64,
    pub content: String,
    /// Unix milliseconds assigned at persistence time.
    pub timestamp: u64,
    pub sender_id: i64,
    pub sender_role: String,
    pub sender_name: String,
}

impl From<StoredMessage> for WireMessage {
    fn from(msg: StoredMessage) -> Self {
        WireMessage {
            id: msg.id,
            content: msg.content,
            timestamp: msg.timestamp,
            sender_id: msg.sender_id,
            sender_role: msg.sender_role,
            sender_name: msg.sender_name,
        }
    }
}

/// Outbound envelope sent to sockets and published to the broker.
///
/// One shape for every channel; fields irrelevant to a given `type` are
/// omitted from the JSON entirely.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub community_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<i64>,
    /// System notice text ("joined").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// History replay, chronological order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<WireMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Envelope {
    /// Handshake acknowledgment sent once per successful subscription.
    pub fn joined(
        community_id: Option<i64>,
        connection_id: Option<i64>,
        conversation_id: Option<i64>,
    ) -> Self {
        Envelope {
            kind: TYPE_SYSTEM.to_string(),
            community_id,
            connection_id,
            conversation_id,
            message: Some("joined".to_string()),
            ..Default::default()
        }
    }

    /// History replay envelope, sent once before the join acknowledgment.
    pub fn history(
        kind: &str,
        community_id: Option<i64>,
        connection_id: Option<i64>,
        messages: Vec<WireMessage>,
    ) -> Self {
        Envelope {
            kind: kind.to_string(),
            community_id,
            connection_id,
            messages: Some(messages),
            ..Default::default()
        }
    }

    /// A live user message, built after persistence assigned id and timestamp.
    pub fn live_message(
        kind: &str,
        community_id: Option<i64>,
        connection_id: Option<i64>,
        content: String,
        sender: &Identity,
        sender_name: &str,
        message_id: i64,
        timestamp: u64,
    ) -> Self {
        Envelope {
            kind: kind.to_string(),
            community_id,
            connection_id,
            content: Some(content),
            sender_id: Some(sender.user_id),
            sender_role: Some(sender.role.clone()),
            sender_name: Some(sender_name.to_string()),
            message_id: Some(message_id),
            timestamp: Some(timestamp),
            ..Default::default()
        }
    }
}

/// Inbound client frame. Any other shape is tolerated; a missing or empty
/// `content` means the frame is silently ignored.
#[derive(Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub content: Option<String>,
}

/// Extracts usable message content from a raw inbound frame.
///
/// Returns `None` for unparseable JSON or content that is empty after
/// trimming. Content longer than `max_len` characters is truncated.
pub fn extract_content(raw: &str, max_len: usize) -> Option<String> {
    let frame: InboundFrame = serde_json::from_str(raw).ok()?;
    let content = frame.content?;
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(max_len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_joined_envelope_omits_unset_fields() {
        let env = Envelope::joined(Some(5), None, None);
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["type"], "system");
        assert_eq!(json["message"], "joined");
        assert_eq!(json["communityId"], 5);
        assert!(json.get("connectionId").is_none());
        assert!(json.get("content").is_none());
    }

    #[test]
    fn test_live_message_field_names() {
        let sender = Identity {
            user_id: 9,
            role: "mentor".to_string(),
        };
        let env = Envelope::live_message(
            TYPE_COMMUNITY_MESSAGE,
            Some(3),
            None,
            "hello".to_string(),
            &sender,
            "Ada",
            101,
            1700000000000,
        );
        let json = serde_json::to_value(&env).unwrap();

        assert_eq!(json["type"], "community.message");
        assert_eq!(json["communityId"], 3);
        assert_eq!(json["content"], "hello");
        assert_eq!(json["senderId"], 9);
        assert_eq!(json["senderRole"], "mentor");
        assert_eq!(json["senderName"], "Ada");
        assert_eq!(json["messageId"], 101);
        assert_eq!(json["timestamp"], 1700000000000u64);
    }

    #[test]
    fn test_history_envelope_round_trip() {
        let env = Envelope::history(
            TYPE_CHAT_HISTORY,
            None,
            Some(12),
            vec![WireMessage {
                id: 1,
                content: "hi".to_string(),
                timestamp: 1000,
                sender_id: 2,
                sender_role: "mentee".to_string(),
                sender_name: "Bo".to_string(),
            }],
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();

        assert_eq!(back["type"], "chat.history");
        assert_eq!(back["connectionId"], 12);
        assert_eq!(back["messages"][0]["senderName"], "Bo");
    }

    #[test]
    fn test_extract_content_trims_and_truncates() {
        assert_eq!(
            extract_content(r#"{"content":"  hello  "}"#, 4000),
            Some("hello".to_string())
        );

        let long = "x".repeat(5000);
        let frame = format!(r#"{{"content":"{long}"}}"#);
        assert_eq!(extract_content(&frame, 4000).unwrap().chars().count(), 4000);
    }

    #[test]
    fn test_extract_content_rejects_empty_and_garbage() {
        assert_eq!(extract_content(r#"{"content":"   "}"#, 4000), None);
        assert_eq!(extract_content(r#"{"content":""}"#, 4000), None);
        assert_eq!(extract_content(r#"{"other":"field"}"#, 4000), None);
        assert_eq!(extract_content("not json", 4000), None);
    }

    #[test]
    fn test_extract_content_multibyte_boundary() {
        let long = "é".repeat(4100);
        let frame = format!(r#"{{"content":"{long}"}}"#);
        let out = extract_content(&frame, 4000).unwrap();
        assert_eq!(out.chars().count(), 4000);
    }
}
