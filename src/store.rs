//! Platform Persistence Collaborator
//!
//! The relay is stateless; memberships, messages, conversations, and user
//! records live in the platform's relational database. This module defines
//! the interface the relay consumes, plus an in-memory implementation used
//! by tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::RelayError;

/// A persisted message, as stored by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: i64,
    pub content: String,
    /// Unix milliseconds assigned at persistence time.
    pub timestamp: u64,
    pub sender_id: i64,
    pub sender_role: String,
    pub sender_name: String,
}

/// Id and timestamp assigned when a message is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewMessage {
    pub id: i64,
    pub timestamp: u64,
}

/// A mentor-mentee connection record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    pub mentor_id: i64,
    pub mentee_id: i64,
    /// Conversation container, created lazily on first chat connection.
    pub conversation_id: Option<i64>,
}

impl ConnectionRecord {
    /// Returns true when the user is either party of this connection.
    pub fn includes(&self, user_id: i64) -> bool {
        self.mentor_id == user_id || self.mentee_id == user_id
    }
}

/// Persistence operations the relay consumes.
///
/// Implementations provide their own transactional guarantees; the relay
/// treats every call as an opaque async operation.
#[async_trait]
pub trait PlatformStore: Send + Sync {
    /// Checks whether the user holds a membership in the community.
    async fn is_member(
        &self,
        community_id: i64,
        user_id: i64,
        role: &str,
    ) -> Result<bool, RelayError>;

    /// Last `limit` community messages, chronological order.
    async fn recent_community_messages(
        &self,
        community_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RelayError>;

    /// Last `limit` conversation messages, chronological order.
    async fn recent_chat_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RelayError>;

    /// Persists a community message, assigning its id and timestamp.
    async fn create_community_message(
        &self,
        community_id: i64,
        sender_id: i64,
        content: &str,
    ) -> Result<NewMessage, RelayError>;

    /// Persists a chat message, assigning its id and timestamp.
    async fn create_chat_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
    ) -> Result<NewMessage, RelayError>;

    /// Looks up a mentor-mentee connection record.
    async fn find_connection(
        &self,
        connection_id: i64,
    ) -> Result<Option<ConnectionRecord>, RelayError>;

    /// Creates the conversation container for a connection, idempotently:
    /// concurrent callers for the same connection get the same id.
    async fn create_conversation(&self, connection_id: i64) -> Result<i64, RelayError>;

    /// Display name for a user.
    async fn user_name(&self, user_id: i64) -> Result<String, RelayError>;
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// In-Memory Store (for testing and development)
// ============================================================================

#[derive(Debug, Clone)]
struct UserRecord {
    name: String,
    role: String,
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<i64, UserRecord>,
    /// (community_id, user_id, role) membership tuples.
    memberships: Vec<(i64, i64, String)>,
    community_messages: HashMap<i64, Vec<StoredMessage>>,
    chat_messages: HashMap<i64, Vec<StoredMessage>>,
    connections: HashMap<i64, ConnectionRecord>,
    next_message_id: i64,
    next_conversation_id: i64,
}

/// In-memory platform store indexed under a single lock.
pub struct MemoryPlatformStore {
    state: Mutex<MemoryState>,
}

impl MemoryPlatformStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MemoryPlatformStore {
            state: Mutex::new(MemoryState {
                next_message_id: 1,
                next_conversation_id: 1,
                ..Default::default()
            }),
        }
    }

    /// Registers a user so messages and history can resolve their name/role.
    pub fn add_user(&self, user_id: i64, name: &str, role: &str) {
        let mut state = self.state.lock().unwrap();
        state.users.insert(
            user_id,
            UserRecord {
                name: name.to_string(),
                role: role.to_string(),
            },
        );
    }

    /// Adds a community membership.
    pub fn add_membership(&self, community_id: i64, user_id: i64, role: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .memberships
            .push((community_id, user_id, role.to_string()));
    }

    /// Adds a mentor-mentee connection with no conversation yet.
    pub fn add_connection(&self, connection_id: i64, mentor_id: i64, mentee_id: i64) {
        let mut state = self.state.lock().unwrap();
        state.connections.insert(
            connection_id,
            ConnectionRecord {
                mentor_id,
                mentee_id,
                conversation_id: None,
            },
        );
    }

    /// Total persisted community messages for a community (test helper).
    pub fn community_message_count(&self, community_id: i64) -> usize {
        let state = self.state.lock().unwrap();
        state
            .community_messages
            .get(&community_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn build_message(state: &mut MemoryState, sender_id: i64, content: &str) -> StoredMessage {
        let id = state.next_message_id;
        state.next_message_id += 1;
        let user = state.users.get(&sender_id).cloned().unwrap_or(UserRecord {
            name: String::new(),
            role: String::new(),
        });
        StoredMessage {
            id,
            content: content.to_string(),
            timestamp: now_millis(),
            sender_id,
            sender_role: user.role,
            sender_name: user.name,
        }
    }

    fn tail(messages: Option<&Vec<StoredMessage>>, limit: usize) -> Vec<StoredMessage> {
        let messages = match messages {
            Some(m) => m,
            None => return Vec::new(),
        };
        let start = messages.len().saturating_sub(limit);
        messages[start..].to_vec()
    }
}

impl Default for MemoryPlatformStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlatformStore for MemoryPlatformStore {
    async fn is_member(
        &self,
        community_id: i64,
        user_id: i64,
        role: &str,
    ) -> Result<bool, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .memberships
            .iter()
            .any(|(c, u, r)| *c == community_id && *u == user_id && r == role))
    }

    async fn recent_community_messages(
        &self,
        community_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(Self::tail(state.community_messages.get(&community_id), limit))
    }

    async fn recent_chat_messages(
        &self,
        conversation_id: i64,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(Self::tail(state.chat_messages.get(&conversation_id), limit))
    }

    async fn create_community_message(
        &self,
        community_id: i64,
        sender_id: i64,
        content: &str,
    ) -> Result<NewMessage, RelayError> {
        let mut state = self.state.lock().unwrap();
        let message = Self::build_message(&mut state, sender_id, content);
        let new = NewMessage {
            id: message.id,
            timestamp: message.timestamp,
        };
        state
            .community_messages
            .entry(community_id)
            .or_default()
            .push(message);
        Ok(new)
    }

    async fn create_chat_message(
        &self,
        conversation_id: i64,
        sender_id: i64,
        content: &str,
    ) -> Result<NewMessage, RelayError> {
        let mut state = self.state.lock().unwrap();
        let message = Self::build_message(&mut state, sender_id, content);
        let new = NewMessage {
            id: message.id,
            timestamp: message.timestamp,
        };
        state
            .chat_messages
            .entry(conversation_id)
            .or_default()
            .push(message);
        Ok(new)
    }

    async fn find_connection(
        &self,
        connection_id: i64,
    ) -> Result<Option<ConnectionRecord>, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(state.connections.get(&connection_id).cloned())
    }

    async fn create_conversation(&self, connection_id: i64) -> Result<i64, RelayError> {
        let mut state = self.state.lock().unwrap();
        // Upsert under the lock: concurrent first connections converge on
        // the same conversation id.
        if let Some(existing) = state
            .connections
            .get(&connection_id)
            .and_then(|c| c.conversation_id)
        {
            return Ok(existing);
        }
        let id = state.next_conversation_id;
        state.next_conversation_id += 1;
        match state.connections.get_mut(&connection_id) {
            Some(record) => {
                record.conversation_id = Some(id);
                Ok(id)
            }
            None => Err(RelayError::Store(format!(
                "unknown connection {connection_id}"
            ))),
        }
    }

    async fn user_name(&self, user_id: i64) -> Result<String, RelayError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .users
            .get(&user_id)
            .map(|u| u.name.clone())
            .unwrap_or_default())
    }
}
