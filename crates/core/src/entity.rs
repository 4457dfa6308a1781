//! Entities held in a service's local store.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{BookId, BorrowId, UserId};
use crate::natural_key::{Email, Isbn};

/// Entity marker + minimal interface.
pub trait Entity {
    /// Strongly-typed, store-local identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}

/// Anything that can be matched across stores by a business identifier.
///
/// Replication resolves entities exclusively through this key.
pub trait NaturalKeyed {
    type Key: Clone + Eq + core::hash::Hash + core::fmt::Debug + core::fmt::Display;

    fn natural_key(&self) -> &Self::Key;
}

/// A book row in one service's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub isbn: Isbn,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub category: String,
    pub available: bool,
    pub return_date: Option<NaiveDate>,
}

impl Book {
    /// Mark the book as lent out until `return_date`.
    pub fn lend_until(&mut self, return_date: NaiveDate) {
        self.available = false;
        self.return_date = Some(return_date);
    }
}

/// A book not yet stored (no surrogate id assigned).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBook {
    pub isbn: Isbn,
    pub title: String,
    pub author: String,
    pub publisher: String,
    pub category: String,
    pub available: bool,
    pub return_date: Option<NaiveDate>,
}

/// A user row in one service's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: Email,
    pub firstname: String,
    pub lastname: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub email: Email,
    pub firstname: String,
    pub lastname: String,
    pub created_at: DateTime<Utc>,
}

/// Loan ledger entry (admin store only).
///
/// References are local surrogate ids: a record is only meaningful inside the
/// store that holds both the user and the book rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorrowRecord {
    pub id: BorrowId,
    pub user_id: UserId,
    pub book_id: BookId,
    pub borrow_date: NaiveDate,
    pub return_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBorrow {
    pub user_id: UserId,
    pub book_id: BookId,
    pub borrow_date: NaiveDate,
    pub return_date: NaiveDate,
}

impl Entity for Book {
    type Id = BookId;

    fn id(&self) -> &BookId {
        &self.id
    }
}

impl Entity for User {
    type Id = UserId;

    fn id(&self) -> &UserId {
        &self.id
    }
}

impl Entity for BorrowRecord {
    type Id = BorrowId;

    fn id(&self) -> &BorrowId {
        &self.id
    }
}

impl NaturalKeyed for Book {
    type Key = Isbn;

    fn natural_key(&self) -> &Isbn {
        &self.isbn
    }
}

impl NaturalKeyed for NewBook {
    type Key = Isbn;

    fn natural_key(&self) -> &Isbn {
        &self.isbn
    }
}

impl NaturalKeyed for User {
    type Key = Email;

    fn natural_key(&self) -> &Email {
        &self.email
    }
}

impl NaturalKeyed for NewUser {
    type Key = Email;

    fn natural_key(&self) -> &Email {
        &self.email
    }
}
