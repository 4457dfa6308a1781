//! Broker client abstraction (mechanics only).
//!
//! A broker carries [`EventEnvelope`]s between the two services over one
//! long-lived logical connection, routed by topic (the routing key).
//!
//! ## Delivery Guarantees
//!
//! - **Durable**: the exchange and every queue survive a broker restart, and
//!   published messages are persistent.
//! - **At-least-once**: a message may be delivered again (consumer crash before
//!   acknowledgment, redelivery after reconnect). Handlers must be idempotent.
//! - **FIFO per queue**: messages for one routing key are consumed in publish
//!   order. There is no ordering across routing keys.
//!
//! Publishing succeeding only means the broker accepted the message. It says
//! nothing about whether the peer has applied it.
//!
//! ## Consumption
//!
//! Each `subscribe` call declares a durable queue named after the routing key
//! (see [`queue_name_for`](crate::queue_name_for)), binds it, and starts one
//! consumer task that processes messages strictly one at a time. A message is
//! acknowledged after the handler returns; on handler failure it is disposed
//! per the broker's [`FailurePolicy`](crate::FailurePolicy) and acknowledged
//! anyway, so a bad message never halts its queue.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::handler::MessageHandler;

/// Transport-level failure. These surface to the caller and are never swallowed.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker unreachable at {url}: {reason}")]
    Unreachable { url: String, reason: String },

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("publish to {routing_key} failed: {reason}")]
    Publish { routing_key: String, reason: String },

    #[error("subscribe to {routing_key} failed: {reason}")]
    Subscribe { routing_key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("broker client is closed")]
    Closed,
}

/// Broker client contract.
///
/// ## Lifecycle
///
/// - `connect()` is idempotent and is called lazily by `publish` and
///   `subscribe`, so callers never need to order it themselves.
/// - `close()` stops consumer tasks, letting a message that is already being
///   handled finish first, then drops the connection. Calling it on a closed
///   client is a no-op.
///
/// ## Thread Safety
///
/// Implementations are `Send + Sync`; several tasks may publish concurrently.
/// One client is owned by one synchronization service (or by the publishing
/// service layer) and injected by the composition root.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Wrap `payload` in an envelope stamped with the current UTC time and
    /// publish it persistently under `routing_key`.
    async fn publish(&self, routing_key: &str, payload: JsonValue) -> Result<(), BrokerError>;

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl<B> Broker for Arc<B>
where
    B: Broker + ?Sized,
{
    async fn connect(&self) -> Result<(), BrokerError> {
        (**self).connect().await
    }

    async fn publish(&self, routing_key: &str, payload: JsonValue) -> Result<(), BrokerError> {
        (**self).publish(routing_key, payload).await
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        (**self).subscribe(routing_key, handler).await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        (**self).close().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}
