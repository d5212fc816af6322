//! Mentor Relay
//!
//! Realtime messaging relay for the mentorship platform: bridges browser
//! WebSocket connections to a topic-based message broker for community
//! discussions, mentor-mentee direct chat, and AI bot-reply delivery.
//!
//! The relay authenticates each connection, checks channel authorization
//! against the platform database, replays recent history, and binds an
//! ephemeral broker consumer per session. User messages are persisted
//! before they are published, so history and live fanout never diverge.

pub mod auth;
pub mod bus;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod routing;
pub mod server;
pub mod session;
pub mod store;
pub mod topology;
