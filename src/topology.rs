//! Broker Topology Manager
//!
//! Declares the exchanges and durable work queues the relay depends on.
//! Declarations are idempotent; this runs once at startup and is safe to
//! re-run. If the broker is unreachable, startup fails fast — the relay
//! cannot function without its delivery path.

use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, ExchangeKind};
use tracing::debug;

use crate::error::RelayError;
use crate::routing::{AI_REQUEST_KEY, AI_REQUEST_QUEUE, DIRECT_EXCHANGE, TOPIC_EXCHANGE};

/// Declares relay topology on the shared channel.
pub struct TopologyManager {
    channel: Channel,
}

impl TopologyManager {
    pub fn new(channel: Channel) -> Self {
        TopologyManager { channel }
    }

    /// Ensures all exchanges, work queues, and their bindings exist.
    pub async fn ensure_topology(&self) -> Result<(), RelayError> {
        self.declare_exchanges().await?;
        self.declare_work_queues().await?;
        debug!("Broker topology ensured");
        Ok(())
    }

    /// Durable direct exchange (point-to-point by recipient key) and durable
    /// topic exchange (multicast by channel-context key).
    async fn declare_exchanges(&self) -> Result<(), RelayError> {
        self.channel
            .exchange_declare(
                DIRECT_EXCHANGE,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .exchange_declare(
                TOPIC_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }

    /// Durable queue for the out-of-process AI worker. Declared here so the
    /// worker can attach at any time; the relay itself never consumes it.
    async fn declare_work_queues(&self) -> Result<(), RelayError> {
        self.channel
            .queue_declare(
                AI_REQUEST_QUEUE,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        self.channel
            .queue_bind(
                AI_REQUEST_QUEUE,
                DIRECT_EXCHANGE,
                AI_REQUEST_KEY,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        Ok(())
    }
}
