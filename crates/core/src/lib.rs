//! `shelfsync-core`: library domain building blocks shared by both services.
//!
//! This crate contains **pure domain** primitives (no broker or storage concerns).
//! Surrogate identifiers defined here are private to the service that assigned
//! them; only natural keys ever cross a service boundary.

pub mod clock;
pub mod entity;
pub mod error;
pub mod id;
pub mod natural_key;
pub mod value_object;

pub use clock::{Clock, FixedClock, SystemClock};
pub use entity::{Book, BorrowRecord, Entity, NaturalKeyed, NewBook, NewBorrow, NewUser, User};
pub use error::{DomainError, DomainResult};
pub use id::{BookId, BorrowId, UserId};
pub use natural_key::{Email, Isbn};
pub use value_object::ValueObject;
