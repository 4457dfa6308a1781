//! Cross-service replication events: taxonomy, wire envelope and broker contract.
//!
//! This crate is mechanics only. Concrete transports live in `shelfsync-infra`
//! (Redis Streams) or here for tests/dev ([`InMemoryBroker`]).

pub mod broker;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_broker;
pub mod retry;

pub use broker::{Broker, BrokerError};
pub use envelope::{EventEnvelope, WireError};
pub use event::{
    queue_name_for, BookBorrowed, BookDeleted, BookEntry, DecodeError, EventKind, ReplicationEvent,
    ServiceRole, UserCreated,
};
pub use handler::{
    dispatch, undecodable, DeadLetter, Disposition, FailurePolicy, HandlerError, MessageHandler,
};
pub use in_memory_broker::InMemoryBroker;
pub use retry::{connect_with_retry, ExponentialBackoff, NoRetry, ReconnectPolicy};
