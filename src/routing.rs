//! Routing Key and Path Conventions
//!
//! Pure functions computing broker binding keys from channel contexts, plus
//! the fixed exchange names and upgrade paths the relay recognizes. All
//! sessions interested in the same context must compute the same key, so the
//! broker fans out to every one of them.

/// Durable direct exchange for point-to-point delivery keyed by recipient.
pub const DIRECT_EXCHANGE: &str = "relay.direct";
/// Durable topic exchange for multicast delivery keyed by channel context.
pub const TOPIC_EXCHANGE: &str = "relay.topic";

/// Durable work queue consumed by the out-of-process AI worker.
pub const AI_REQUEST_QUEUE: &str = "ai.requests";
/// Routing key the AI work queue is bound under on the direct exchange.
pub const AI_REQUEST_KEY: &str = "ai.request";

/// Upgrade path for community discussion channels.
pub const COMMUNITY_PATH: &str = "/ws/community";
/// Upgrade path for the bot-reply delivery channel.
pub const BOT_REPLY_PATH: &str = "/ws/bot-reply";
/// Upgrade path for mentor-mentee direct chat.
pub const CHAT_PATH: &str = "/ws/chat";

/// Binding key for a community discussion channel.
pub fn community_key(community_id: i64) -> String {
    format!("community.{community_id}")
}

/// Binding key for a user's bot-reply delivery queue (direct exchange).
pub fn bot_reply_key(user_id: i64) -> String {
    format!("bot-reply.{user_id}")
}

/// Binding key for a mentor-mentee connection's chat channel.
pub fn chat_connection_key(connection_id: i64) -> String {
    format!("chat-connection.{connection_id}")
}
