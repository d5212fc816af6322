//! Upgrade Router
//!
//! Inspects the raw HTTP preamble of an incoming connection (peeked before
//! any handshake) and resolves which channel handler should take it. Only
//! three paths are recognized; anything else is a signal to destroy the
//! socket without writing a byte. Query parameters are carried along so the
//! session can authenticate after the handshake completes.

use crate::routing::{BOT_REPLY_PATH, CHAT_PATH, COMMUNITY_PATH};

/// The three realtime channel variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Community,
    BotReply,
    Chat,
}

/// A recognized upgrade request, parsed but not yet authenticated.
///
/// `token` and `context_id` stay optional here: a known path with missing
/// or malformed parameters still gets a handshake so the session can close
/// it with a proper policy-violation code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub kind: ChannelKind,
    pub token: Option<String>,
    /// `communityId` or `connectionId`, when the channel requires one and it
    /// parsed as an integer.
    pub context_id: Option<i64>,
}

/// Extracts the request target from the first line of an HTTP preamble.
pub fn request_target(preamble: &str) -> &str {
    preamble
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/")
}

/// Case-insensitive check for a WebSocket upgrade in the peeked headers.
pub fn is_websocket_upgrade(preamble: &str) -> bool {
    let lower = preamble.to_ascii_lowercase();
    lower.contains("upgrade: websocket") && lower.contains("connection:") && lower.contains("upgrade")
}

/// Resolves a request target to a channel route.
///
/// Returns `None` for unknown paths — the caller must destroy the socket
/// without a handshake; this is a security boundary, not a 404.
pub fn resolve(target: &str) -> Option<RouteRequest> {
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, q),
        None => (target, ""),
    };

    let (kind, context_param) = match path {
        COMMUNITY_PATH => (ChannelKind::Community, Some("communityId")),
        BOT_REPLY_PATH => (ChannelKind::BotReply, None),
        CHAT_PATH => (ChannelKind::Chat, Some("connectionId")),
        _ => return None,
    };

    let token = query_param(query, "token").map(str::to_string);
    let context_id =
        context_param.and_then(|name| query_param(query, name).and_then(|v| v.parse().ok()));

    Some(RouteRequest {
        kind,
        token,
        context_id,
    })
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_community_path() {
        let route = resolve("/ws/community?token=abc&communityId=12").unwrap();
        assert_eq!(route.kind, ChannelKind::Community);
        assert_eq!(route.token.as_deref(), Some("abc"));
        assert_eq!(route.context_id, Some(12));
    }

    #[test]
    fn test_resolve_chat_path() {
        let route = resolve("/ws/chat?connectionId=7&token=t").unwrap();
        assert_eq!(route.kind, ChannelKind::Chat);
        assert_eq!(route.context_id, Some(7));
    }

    #[test]
    fn test_resolve_bot_reply_ignores_context() {
        let route = resolve("/ws/bot-reply?token=t").unwrap();
        assert_eq!(route.kind, ChannelKind::BotReply);
        assert_eq!(route.context_id, None);
    }

    #[test]
    fn test_resolve_unknown_path() {
        assert!(resolve("/ws/other?token=t").is_none());
        assert!(resolve("/").is_none());
        assert!(resolve("/ws/communityX?token=t").is_none());
    }

    #[test]
    fn test_query_string_excluded_from_path_match() {
        // The path comparison must ignore everything after '?'.
        assert!(resolve("/ws/community?foo=/ws/other").is_some());
    }

    #[test]
    fn test_missing_or_malformed_params_still_route() {
        let route = resolve("/ws/community").unwrap();
        assert_eq!(route.token, None);
        assert_eq!(route.context_id, None);

        let route = resolve("/ws/community?token=t&communityId=abc").unwrap();
        assert_eq!(route.context_id, None);
    }

    #[test]
    fn test_request_target_parsing() {
        let preamble = "GET /ws/chat?token=t HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(request_target(preamble), "/ws/chat?token=t");
        assert_eq!(request_target(""), "/");
    }

    #[test]
    fn test_upgrade_detection() {
        let upgrade =
            "GET /ws/community HTTP/1.1\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n";
        assert!(is_websocket_upgrade(upgrade));

        let plain = "GET /health HTTP/1.1\r\nHost: x\r\n\r\n";
        assert!(!is_websocket_upgrade(plain));
    }
}
