//! Mentor Relay Server
//!
//! Realtime messaging relay for the mentorship platform.
//! Provides:
//! - WebSocket endpoints for community discussion, direct chat, and bot replies
//! - AMQP-backed fanout with per-connection ephemeral consumers
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info, warn};

use mentor_relay::auth::Authenticator;
use mentor_relay::bus::{LapinBus, MemoryBus, MessageBus};
use mentor_relay::config::{BusBackend, RelayConfig};
use mentor_relay::http::{create_router, HttpState};
use mentor_relay::metrics::RelayMetrics;
use mentor_relay::server::{self, ServerDeps};
use mentor_relay::store::{MemoryPlatformStore, PlatformStore};
use mentor_relay::topology::TopologyManager;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mentor_relay=info".parse().unwrap()),
        )
        .init();

    let config = RelayConfig::from_env();

    info!(
        "Starting Mentor Relay Server v{}",
        env!("CARGO_PKG_VERSION")
    );
    info!("WebSocket: {}", config.listen_addr);
    info!("Metrics endpoint: {}", config.metrics_addr);
    info!("History limit: {} messages", config.history_limit);

    if config.uses_default_secret() {
        warn!("=======================================================================");
        warn!("RELAY_JWT_SECRET is not set; using the insecure development default.");
        warn!("Every token signed with the public default secret will be accepted.");
        warn!("Set RELAY_JWT_SECRET before exposing this relay to real traffic.");
        warn!("=======================================================================");
    }

    // Broker connection is a startup requirement: the relay cannot deliver
    // anything without its fanout path, so failure here is fatal.
    let bus: Arc<dyn MessageBus> = match config.bus_backend {
        BusBackend::Amqp => {
            info!("Broker: {}", config.broker_url);
            let bus = match LapinBus::connect(&config.broker_url).await {
                Ok(bus) => bus,
                Err(e) => {
                    error!("Failed to connect to broker: {}", e);
                    std::process::exit(1);
                }
            };
            if let Err(e) = TopologyManager::new(bus.channel()).ensure_topology().await {
                error!("Failed to declare broker topology: {}", e);
                std::process::exit(1);
            }
            Arc::new(bus)
        }
        BusBackend::Memory => {
            warn!("Using in-process memory bus (no broker); single-node only");
            Arc::new(MemoryBus::new())
        }
    };

    // The production persistence collaborator is the platform API backed by
    // the relational database; the memory store serves broker-less
    // development. Wiring a database-backed PlatformStore replaces this.
    let store: Arc<dyn PlatformStore> = Arc::new(MemoryPlatformStore::new());

    let metrics = RelayMetrics::new();
    let auth = Arc::new(Authenticator::new(&config.jwt_secret));

    let metrics_token = std::env::var("RELAY_METRICS_TOKEN").ok();
    if metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    }

    let http_router = create_router(HttpState {
        metrics: metrics.clone(),
        metrics_token,
    });
    let http_listener = TcpListener::bind(&config.metrics_addr)
        .await
        .expect("Failed to bind HTTP listener");
    let metrics_addr = config.metrics_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", metrics_addr);
        axum::serve(http_listener, http_router).await.unwrap();
    });

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");
    info!("WebSocket server listening on {}", config.listen_addr);

    let deps = Arc::new(ServerDeps {
        store,
        bus,
        auth,
        metrics,
        history_limit: config.history_limit,
        max_content_len: config.max_content_len,
        handshake_timeout: config.handshake_timeout(),
        max_connections: config.max_connections,
    });

    server::run(listener, deps).await;
}
