//! Per-Channel Connection Sessions
//!
//! One lifecycle shared by all three channel variants:
//!
//! `Connecting → Authenticating → Authorizing → Subscribed → Closed`
//!
//! The variants differ only in their authorization predicate, binding key,
//! and history policy, supplied by [`ChannelContext`]. Once subscribed, the
//! session is symmetric: broker deliveries are forwarded to the socket while
//! inbound frames are validated, persisted, and then published — never the
//! other way around, so history and live traffic can never diverge.
//!
//! Every reconnect is a brand-new session with a fresh history replay; there
//! is no resume state.

use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::auth::{Authenticator, Identity};
use crate::bus::MessageBus;
use crate::metrics::RelayMetrics;
use crate::protocol::{
    self, Envelope, TYPE_CHAT_HISTORY, TYPE_CHAT_MESSAGE, TYPE_COMMUNITY_HISTORY,
    TYPE_COMMUNITY_MESSAGE,
};
use crate::router::{ChannelKind, RouteRequest};
use crate::routing::{
    bot_reply_key, chat_connection_key, community_key, DIRECT_EXCHANGE, TOPIC_EXCHANGE,
};
use crate::store::PlatformStore;

type WsWriter = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// Shared dependencies injected into every session.
pub struct SessionDeps {
    pub store: Arc<dyn PlatformStore>,
    pub bus: Arc<dyn MessageBus>,
    pub auth: Arc<Authenticator>,
    pub metrics: RelayMetrics,
    pub history_limit: usize,
    pub max_content_len: usize,
}

/// Channel context resolved during authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelContext {
    Community { community_id: i64 },
    BotReply,
    Chat { connection_id: i64, conversation_id: i64 },
}

impl ChannelContext {
    /// Exchange and binding key for this context. The same context always
    /// yields the same key, so every interested session shares the fanout.
    fn binding(&self, user_id: i64) -> (&'static str, String) {
        match self {
            ChannelContext::Community { community_id } => {
                (TOPIC_EXCHANGE, community_key(*community_id))
            }
            ChannelContext::BotReply => (DIRECT_EXCHANGE, bot_reply_key(user_id)),
            ChannelContext::Chat { connection_id, .. } => {
                (TOPIC_EXCHANGE, chat_connection_key(*connection_id))
            }
        }
    }
}

/// Why session setup was refused.
#[derive(Debug, PartialEq, Eq)]
enum SetupError {
    /// Close 1008: bad credential, missing parameter, or not permitted.
    Policy(&'static str),
    /// Close 1011: a collaborator failed while setting up.
    Internal(&'static str),
}

/// Runs the authorization step and resolves the channel context.
///
/// Community: the identity must hold a membership. Chat: the identity must
/// be a party of the connection record; the conversation container is
/// created lazily (idempotently) on first connection. Bot-reply: a valid
/// identity is enough — the binding key itself scopes delivery.
async fn resolve_context(
    store: &dyn PlatformStore,
    identity: &Identity,
    route: &RouteRequest,
) -> Result<ChannelContext, SetupError> {
    match route.kind {
        ChannelKind::Community => {
            let community_id = route
                .context_id
                .ok_or(SetupError::Policy("missing or invalid communityId"))?;
            let member = store
                .is_member(community_id, identity.user_id, &identity.role)
                .await
                .map_err(|_| SetupError::Internal("membership check failed"))?;
            if !member {
                return Err(SetupError::Policy("not a member of this community"));
            }
            Ok(ChannelContext::Community { community_id })
        }
        ChannelKind::BotReply => Ok(ChannelContext::BotReply),
        ChannelKind::Chat => {
            let connection_id = route
                .context_id
                .ok_or(SetupError::Policy("missing or invalid connectionId"))?;
            let record = store
                .find_connection(connection_id)
                .await
                .map_err(|_| SetupError::Internal("connection lookup failed"))?
                .ok_or(SetupError::Policy("unknown connection"))?;
            if !record.includes(identity.user_id) {
                return Err(SetupError::Policy("not a party of this connection"));
            }
            let conversation_id = match record.conversation_id {
                Some(id) => id,
                None => store
                    .create_conversation(connection_id)
                    .await
                    .map_err(|_| SetupError::Internal("conversation creation failed"))?,
            };
            Ok(ChannelContext::Chat {
                connection_id,
                conversation_id,
            })
        }
    }
}

async fn close_with(write: &mut WsWriter, code: CloseCode, reason: &'static str) {
    let _ = write
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn send_envelope(write: &mut WsWriter, envelope: &Envelope) -> bool {
    match serde_json::to_string(envelope) {
        Ok(json) => write.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode envelope: {}", e);
            true
        }
    }
}

/// Handles one WebSocket connection from authentication to teardown.
pub async fn run_session(
    ws_stream: WebSocketStream<TcpStream>,
    route: RouteRequest,
    deps: SessionDeps,
) {
    // Random session label for logging; user ids stay out of the label so a
    // log line alone does not identify who is connected where.
    let session = uuid::Uuid::new_v4().to_string()[..8].to_string();
    let (mut write, mut read) = ws_stream.split();

    // --- Authenticating ---
    let identity = match route.token.as_deref().and_then(|t| deps.auth.verify(t)) {
        Some(identity) => identity,
        None => {
            deps.metrics.auth_rejections.inc();
            debug!("[{}] Rejected: missing or invalid token", session);
            close_with(&mut write, CloseCode::Policy, "invalid or missing token").await;
            return;
        }
    };

    // --- Authorizing ---
    let context = match resolve_context(deps.store.as_ref(), &identity, &route).await {
        Ok(context) => context,
        Err(SetupError::Policy(reason)) => {
            deps.metrics.auth_rejections.inc();
            debug!("[{}] Rejected: {}", session, reason);
            close_with(&mut write, CloseCode::Policy, reason).await;
            return;
        }
        Err(SetupError::Internal(reason)) => {
            deps.metrics.connection_errors.inc();
            warn!("[{}] Setup failed: {}", session, reason);
            close_with(&mut write, CloseCode::Error, reason).await;
            return;
        }
    };

    // --- Subscribing ---
    // A session with no live delivery path is useless, so consumer creation
    // failure aborts the whole setup (unlike history, which degrades).
    let (exchange, binding_key) = context.binding(identity.user_id);
    let mut subscription = match deps.bus.subscribe(exchange, &binding_key).await {
        Ok(sub) => sub,
        Err(e) => {
            deps.metrics.connection_errors.inc();
            warn!("[{}] Consumer creation failed: {}", session, e);
            close_with(&mut write, CloseCode::Error, "subscription failed").await;
            return;
        }
    };

    let sender_name = match context {
        ChannelContext::BotReply => String::new(),
        _ => deps
            .store
            .user_name(identity.user_id)
            .await
            .unwrap_or_else(|e| {
                warn!("[{}] User name lookup failed: {}", session, e);
                String::new()
            }),
    };

    // History replay, then join-ack, then live traffic — the same order on
    // every channel. A message published between subscribe and the history
    // query can arrive twice (live and in history) but never be missed;
    // clients dedupe by messageId.
    let history = match &context {
        ChannelContext::Community { community_id } => deps
            .store
            .recent_community_messages(*community_id, deps.history_limit)
            .await
            .map(|messages| {
                Envelope::history(
                    TYPE_COMMUNITY_HISTORY,
                    Some(*community_id),
                    None,
                    messages.into_iter().map(Into::into).collect(),
                )
            })
            .map(Some),
        ChannelContext::Chat {
            connection_id,
            conversation_id,
        } => deps
            .store
            .recent_chat_messages(*conversation_id, deps.history_limit)
            .await
            .map(|messages| {
                Envelope::history(
                    TYPE_CHAT_HISTORY,
                    None,
                    Some(*connection_id),
                    messages.into_iter().map(Into::into).collect(),
                )
            })
            .map(Some),
        ChannelContext::BotReply => Ok(None),
    };

    match history {
        Ok(Some(envelope)) => {
            if !send_envelope(&mut write, &envelope).await {
                subscription.cancel().await;
                return;
            }
            deps.metrics.history_replays.inc();
        }
        Ok(None) => {}
        Err(e) => {
            // Not safety-critical: the session continues without history.
            warn!("[{}] History load failed: {}", session, e);
        }
    }

    let joined = match &context {
        ChannelContext::Community { community_id } => Envelope::joined(Some(*community_id), None, None),
        ChannelContext::BotReply => Envelope::joined(None, None, None),
        ChannelContext::Chat {
            connection_id,
            conversation_id,
        } => Envelope::joined(None, Some(*connection_id), Some(*conversation_id)),
    };
    if !send_envelope(&mut write, &joined).await {
        subscription.cancel().await;
        return;
    }

    debug!("[{}] Subscribed to {} on {}", session, binding_key, exchange);

    // --- Subscribed ---
    loop {
        tokio::select! {
            delivered = subscription.inbox.recv() => {
                let value = match delivered {
                    Some(v) => v,
                    None => {
                        warn!("[{}] Consumer stream ended", session);
                        break;
                    }
                };
                // Forward the envelope verbatim: the sender's own messages
                // come back through this same path, so ordering is defined
                // solely by broker delivery order.
                match serde_json::to_string(&value) {
                    Ok(json) => {
                        if write.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                        deps.metrics.messages_delivered.inc();
                    }
                    Err(e) => warn!("[{}] Unencodable delivery: {}", session, e),
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_inbound(&session, &text, &identity, &sender_name, &context, &deps).await;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        match String::from_utf8(data) {
                            Ok(text) => {
                                handle_inbound(&session, &text, &identity, &sender_name, &context, &deps)
                                    .await;
                            }
                            Err(_) => {
                                deps.metrics.frames_dropped.inc();
                                debug!("[{}] Dropping non-UTF8 binary frame", session);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!("[{}] Client sent close", session);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("[{}] Connection error: {}", session, e);
                        break;
                    }
                    None => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                }
            }
        }
    }

    // --- Closed ---
    subscription.cancel().await;
    debug!("[{}] Session closed", session);
}

/// Validate → persist → publish for one inbound frame.
///
/// The publish is issued only after persistence has returned an id, so no
/// peer (or the sender's own echo) can ever observe a message that history
/// will not also contain. Failures drop the single frame: the client has no
/// ack protocol to correlate a retry against.
async fn handle_inbound(
    session: &str,
    raw: &str,
    identity: &Identity,
    sender_name: &str,
    context: &ChannelContext,
    deps: &SessionDeps,
) {
    // Bot-reply sockets are consume-only; inbound frames are not expected.
    if matches!(context, ChannelContext::BotReply) {
        debug!("[{}] Ignoring inbound frame on bot-reply channel", session);
        return;
    }

    deps.metrics.frames_received.inc();

    let content = match protocol::extract_content(raw, deps.max_content_len) {
        Some(content) => content,
        None => {
            deps.metrics.frames_dropped.inc();
            return;
        }
    };

    let persisted = match context {
        ChannelContext::Community { community_id } => {
            deps.store
                .create_community_message(*community_id, identity.user_id, &content)
                .await
        }
        ChannelContext::Chat {
            conversation_id, ..
        } => {
            deps.store
                .create_chat_message(*conversation_id, identity.user_id, &content)
                .await
        }
        ChannelContext::BotReply => unreachable!("bot-reply frames are ignored above"),
    };

    let persisted = match persisted {
        Ok(new) => new,
        Err(e) => {
            deps.metrics.frames_dropped.inc();
            warn!("[{}] Message persistence failed, frame dropped: {}", session, e);
            return;
        }
    };

    let envelope = match context {
        ChannelContext::Community { community_id } => Envelope::live_message(
            TYPE_COMMUNITY_MESSAGE,
            Some(*community_id),
            None,
            content,
            identity,
            sender_name,
            persisted.id,
            persisted.timestamp,
        ),
        ChannelContext::Chat { connection_id, .. } => Envelope::live_message(
            TYPE_CHAT_MESSAGE,
            None,
            Some(*connection_id),
            content,
            identity,
            sender_name,
            persisted.id,
            persisted.timestamp,
        ),
        ChannelContext::BotReply => unreachable!(),
    };

    let (exchange, key) = context.binding(identity.user_id);
    match serde_json::to_value(&envelope) {
        Ok(value) => match deps.bus.publish(exchange, &key, &value).await {
            Ok(()) => deps.metrics.messages_published.inc(),
            Err(e) => {
                warn!("[{}] Publish failed, message persisted but not fanned out: {}", session, e);
            }
        },
        Err(e) => warn!("[{}] Failed to encode envelope: {}", session, e),
    }
}
