//! WebSocket Accept Loop
//!
//! Owns the TCP listener: enforces the connection cap, peeks each stream to
//! tell plain HTTP probes from WebSocket upgrades, routes upgrades by path,
//! and spawns one session task per accepted connection. Unknown upgrade
//! paths destroy the socket with no handshake and no response body.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::bus::MessageBus;
use crate::metrics::RelayMetrics;
use crate::router;
use crate::session::{run_session, SessionDeps};
use crate::store::PlatformStore;

/// Everything the accept loop needs, constructed once at startup.
pub struct ServerDeps {
    pub store: Arc<dyn PlatformStore>,
    pub bus: Arc<dyn MessageBus>,
    pub auth: Arc<Authenticator>,
    pub metrics: RelayMetrics,
    pub history_limit: usize,
    pub max_content_len: usize,
    pub handshake_timeout: Duration,
    pub max_connections: usize,
}

impl ServerDeps {
    fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            store: self.store.clone(),
            bus: self.bus.clone(),
            auth: self.auth.clone(),
            metrics: self.metrics.clone(),
            history_limit: self.history_limit,
            max_content_len: self.max_content_len,
        }
    }
}

/// Runs the accept loop until the listener fails.
pub async fn run(listener: TcpListener, deps: Arc<ServerDeps>) {
    let limiter = Arc::new(Semaphore::new(deps.max_connections));

    while let Ok((stream, _addr)) = listener.accept().await {
        let permit = match limiter.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(
                    "Connection rejected: at max capacity ({})",
                    deps.max_connections
                );
                deps.metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let deps = deps.clone();
        tokio::spawn(async move {
            // Holds the connection slot for the lifetime of the task.
            let _permit = permit;

            // Peek the preamble to read the request line and headers before
            // committing to a WebSocket handshake.
            let mut peek_buf = [0u8; 512];
            let preamble = match stream.peek(&mut peek_buf).await {
                Ok(n) if n > 0 => String::from_utf8_lossy(&peek_buf[..n]).into_owned(),
                _ => return,
            };

            if !router::is_websocket_upgrade(&preamble) {
                answer_plain_http(stream, &preamble).await;
                return;
            }

            let target = router::request_target(&preamble);
            let route = match router::resolve(target) {
                Some(route) => route,
                None => {
                    // Security boundary: no handshake, no response body.
                    debug!("Destroying socket for unknown upgrade path");
                    drop(stream);
                    return;
                }
            };

            match tokio::time::timeout(deps.handshake_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    deps.metrics.connections_total.inc();
                    deps.metrics.connections_active.inc();
                    run_session(ws_stream, route, deps.session_deps()).await;
                    deps.metrics.connections_active.dec();
                }
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed: {}", e);
                    deps.metrics.connection_errors.inc();
                }
                Err(_) => {
                    warn!("WebSocket handshake timeout (slowloris protection)");
                    deps.metrics.connection_errors.inc();
                }
            }
        });
    }

    info!("Listener closed, accept loop ending");
}

/// Answers plain HTTP on the WebSocket port: a health probe for load
/// balancers, and a hint for anything else.
async fn answer_plain_http(mut stream: tokio::net::TcpStream, preamble: &str) {
    let lower = preamble.to_ascii_lowercase();
    if !lower.starts_with("get ") {
        return;
    }

    let body = if lower.starts_with("get /health") {
        format!(
            r#"{{"status":"healthy","version":"{}"}}"#,
            env!("CARGO_PKG_VERSION")
        )
    } else {
        r#"{"error":"This is a WebSocket relay endpoint"}"#.to_string()
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
