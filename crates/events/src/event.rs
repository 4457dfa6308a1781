//! Event taxonomy: the closed set of replication event kinds and their payloads.
//!
//! The payload shape is a function of the routing key alone. Adding a kind means
//! adding a variant here, a producer in the originating service and exactly one
//! consumer-side handler in the peer.

use core::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use shelfsync_core::{Email, Isbn};

/// Which of the two services a process is running as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Authoritative catalogue and loan ledger.
    Admin,
    /// Read-optimized replica serving patrons.
    Frontend,
}

impl ServiceRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceRole::Admin => "admin",
            ServiceRole::Frontend => "frontend",
        }
    }
}

impl core::fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Ok(ServiceRole::Admin),
            "frontend" => Ok(ServiceRole::Frontend),
            other => Err(format!("unknown service role: {other}")),
        }
    }
}

/// Enumerated event kinds. The routing key is the wire identity of a kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    BooksCreated,
    BookDeleted,
    BookBorrowed,
    UserCreated,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::BooksCreated,
        EventKind::BookDeleted,
        EventKind::BookBorrowed,
        EventKind::UserCreated,
    ];

    pub fn routing_key(self) -> &'static str {
        match self {
            EventKind::BooksCreated => "books.created",
            EventKind::BookDeleted => "book.deleted",
            EventKind::BookBorrowed => "book.borrowed",
            EventKind::UserCreated => "user.created",
        }
    }

    /// Durable queue bound to this kind's routing key.
    pub fn queue_name(self) -> String {
        queue_name_for(self.routing_key())
    }

    /// Service that commits the mutation and publishes the event.
    pub fn producer(self) -> ServiceRole {
        match self {
            EventKind::BooksCreated | EventKind::BookDeleted => ServiceRole::Admin,
            EventKind::BookBorrowed | EventKind::UserCreated => ServiceRole::Frontend,
        }
    }

    /// Service that applies the event to its own store.
    pub fn consumer(self) -> ServiceRole {
        match self.producer() {
            ServiceRole::Admin => ServiceRole::Frontend,
            ServiceRole::Frontend => ServiceRole::Admin,
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.routing_key())
    }
}

impl FromStr for EventKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.routing_key() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Deterministic durable queue name for a routing key.
///
/// Redeploys resume the same backlog because the name never changes.
pub fn queue_name_for(routing_key: &str) -> String {
    format!("{routing_key}_queue")
}

/// One catalogue entry in a `books.created` batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookEntry {
    pub title: String,
    pub author: String,
    pub isbn: Isbn,
    pub publisher: String,
    pub category: String,
}

/// `book.deleted` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDeleted {
    pub isbn: Isbn,
}

/// `book.borrowed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookBorrowed {
    pub book_isbn: Isbn,
    pub user_email: Email,
    pub return_date: NaiveDate,
}

/// `user.created` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCreated {
    pub email: Email,
    pub firstname: String,
    pub lastname: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown event kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: EventKind, reason: String },
}

/// A typed replication event: kind and payload in one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationEvent {
    BooksCreated(Vec<BookEntry>),
    BookDeleted(BookDeleted),
    BookBorrowed(BookBorrowed),
    UserCreated(UserCreated),
}

impl ReplicationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ReplicationEvent::BooksCreated(_) => EventKind::BooksCreated,
            ReplicationEvent::BookDeleted(_) => EventKind::BookDeleted,
            ReplicationEvent::BookBorrowed(_) => EventKind::BookBorrowed,
            ReplicationEvent::UserCreated(_) => EventKind::UserCreated,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.kind().routing_key()
    }

    /// JSON payload as carried in the envelope's `data` field.
    pub fn to_payload(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            ReplicationEvent::BooksCreated(entries) => serde_json::to_value(entries),
            ReplicationEvent::BookDeleted(p) => serde_json::to_value(p),
            ReplicationEvent::BookBorrowed(p) => serde_json::to_value(p),
            ReplicationEvent::UserCreated(p) => serde_json::to_value(p),
        }
    }

    /// Decode a payload whose shape is dictated by `kind`.
    pub fn from_payload(kind: EventKind, data: &JsonValue) -> Result<Self, DecodeError> {
        let malformed = |e: serde_json::Error| DecodeError::Malformed {
            kind,
            reason: e.to_string(),
        };

        let event = match kind {
            EventKind::BooksCreated => {
                ReplicationEvent::BooksCreated(Vec::<BookEntry>::deserialize(data).map_err(malformed)?)
            }
            EventKind::BookDeleted => {
                ReplicationEvent::BookDeleted(BookDeleted::deserialize(data).map_err(malformed)?)
            }
            EventKind::BookBorrowed => {
                ReplicationEvent::BookBorrowed(BookBorrowed::deserialize(data).map_err(malformed)?)
            }
            EventKind::UserCreated => {
                ReplicationEvent::UserCreated(UserCreated::deserialize(data).map_err(malformed)?)
            }
        };
        Ok(event)
    }

    /// Decode from a routing key, rejecting kinds outside the taxonomy.
    pub fn decode(routing_key: &str, data: &JsonValue) -> Result<Self, DecodeError> {
        let kind: EventKind = routing_key.parse()?;
        Self::from_payload(kind, data)
    }
}
