//! Consumer-side handler contract and per-message failure disposition.

use core::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use crate::envelope::EventEnvelope;
use crate::event::{DecodeError, EventKind};

/// Why a handler could not apply a message.
///
/// "Already applied" is never an error: handlers absorb redelivery silently.
/// Everything here is contained per message by the consumer loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// Payload did not match the shape its routing key dictates.
    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: String, reason: String },

    /// Routing key outside the event taxonomy reached a handler.
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    /// A referenced entity has not replicated yet (or was lost).
    #[error("referential gap: {entity} {key} not found")]
    ReferentialGap { entity: &'static str, key: String },

    /// Applying would break a business invariant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The local store failed.
    #[error("repository failure: {0}")]
    Repository(String),
}

impl From<DecodeError> for HandlerError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::UnknownKind(k) => HandlerError::UnknownKind(k),
            DecodeError::Malformed { kind, reason } => HandlerError::Malformed {
                kind: kind.to_string(),
                reason,
            },
        }
    }
}

/// Applies delivered envelopes to a local store.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Event kind this handler is bound to.
    fn kind(&self) -> EventKind;

    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

/// What happens to a message whose handler failed.
///
/// In both cases the message is acknowledged and the consumer moves on; the
/// difference is whether the failed message is kept anywhere.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Forward the message and its error to the queue's dead-letter
    /// destination, then acknowledge.
    #[default]
    DeadLetter,
    /// Log and acknowledge. The event is lost.
    Acknowledge,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "dead_letter" | "dlq" => Ok(FailurePolicy::DeadLetter),
            "acknowledge" | "ack" => Ok(FailurePolicy::Acknowledge),
            other => Err(format!("unknown failure policy: {other}")),
        }
    }
}

/// A failed message parked for inspection or manual replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub queue: String,
    pub routing_key: String,
    /// Original message body, verbatim.
    pub body: String,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(queue: &str, routing_key: &str, body: &[u8], error: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            body: String::from_utf8_lossy(body).into_owned(),
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Outcome of processing one delivery. Every variant is acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    DeadLettered(DeadLetter),
    Dropped { error: String },
}

fn on_failure(
    policy: FailurePolicy,
    queue: &str,
    routing_key: &str,
    body: &[u8],
    error: String,
) -> Disposition {
    match policy {
        FailurePolicy::DeadLetter => {
            Disposition::DeadLettered(DeadLetter::new(queue, routing_key, body, error))
        }
        FailurePolicy::Acknowledge => {
            warn!(queue, routing_key, error = %error, "dropping failed message");
            Disposition::Dropped { error }
        }
    }
}

/// Run one decoded delivery through its handler and decide its disposition.
///
/// Shared by every broker implementation so failure handling is identical
/// regardless of transport.
#[instrument(skip_all, fields(queue = queue, routing_key = envelope.routing_key()))]
pub async fn dispatch(
    queue: &str,
    envelope: &EventEnvelope,
    body: &[u8],
    handler: &dyn MessageHandler,
    policy: FailurePolicy,
) -> Disposition {
    match handler.handle(envelope).await {
        Ok(()) => {
            debug!(queue, routing_key = envelope.routing_key(), "message processed");
            Disposition::Processed
        }
        Err(err) => {
            error!(
                queue,
                routing_key = envelope.routing_key(),
                published_at = %envelope.timestamp(),
                error = %err,
                "message handler failed"
            );
            on_failure(policy, queue, envelope.routing_key(), body, err.to_string())
        }
    }
}

/// Disposition for a body that could not even be decoded into an envelope.
pub fn undecodable(
    queue: &str,
    routing_key: &str,
    body: &[u8],
    error: impl core::fmt::Display,
    policy: FailurePolicy,
) -> Disposition {
    error!(queue, routing_key, error = %error, "undecodable message body");
    on_failure(policy, queue, routing_key, body, format!("undecodable body: {error}"))
}
