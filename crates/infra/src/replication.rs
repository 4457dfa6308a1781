//! Replication handlers: apply a peer's mutation to the local store.
//!
//! Every `apply_*` function is idempotent. Reprocessing an event that has
//! already been applied succeeds and changes nothing (at most it re-writes the
//! same values). Errors are reserved for referential gaps, genuine conflicts,
//! malformed payloads and store failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use shelfsync_core::{Book, BorrowRecord, Clock, Isbn, NewBook, NewBorrow, NewUser, User, UserId};
use shelfsync_events::{
    BookBorrowed, BookDeleted, BookEntry, DecodeError, EventEnvelope, EventKind, HandlerError,
    MessageHandler, UserCreated,
};

use crate::reconcile::{
    decide_borrow, decide_create, decide_delete, reject_surrogate_ids, BorrowDecision, CreateDecision,
    DeleteDecision, SurrogateIdLeak,
};
use crate::repository::{BookRepository, BorrowRepository, RepositoryError, UserRepository};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    SurrogateId(#[from] SurrogateIdLeak),

    #[error("referential gap: {entity} {key} not found")]
    ReferentialGap { entity: &'static str, key: String },

    #[error("book {isbn} is already borrowed by user {holder}")]
    Conflict { isbn: Isbn, holder: UserId },

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<ReplicationError> for HandlerError {
    fn from(value: ReplicationError) -> Self {
        match value {
            ReplicationError::Decode(e) => e.into(),
            ReplicationError::SurrogateId(e) => HandlerError::Malformed {
                kind: "payload".to_string(),
                reason: e.to_string(),
            },
            ReplicationError::ReferentialGap { entity, key } => HandlerError::ReferentialGap { entity, key },
            e @ ReplicationError::Conflict { .. } => HandlerError::Conflict(e.to_string()),
            ReplicationError::Repository(e) => HandlerError::Repository(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BooksCreatedOutcome {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookDeletedOutcome {
    Deleted(Book),
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BorrowOutcome {
    Borrowed(BorrowRecord),
    Reaffirmed(BorrowRecord),
    Repaired(BorrowRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserCreatedOutcome {
    Created(User),
    Existing(User),
}

/// Insert every entry whose ISBN is not present yet.
pub async fn apply_books_created(
    entries: &[BookEntry],
    books: &dyn BookRepository,
) -> Result<BooksCreatedOutcome, ReplicationError> {
    let mut outcome = BooksCreatedOutcome::default();

    for entry in entries {
        match decide_create(books.find_by_isbn(&entry.isbn).await?) {
            CreateDecision::Skip(_) => {
                debug!(isbn = %entry.isbn, "book already present");
                outcome.skipped += 1;
            }
            CreateDecision::Insert => match books.insert(new_book(entry)).await {
                Ok(book) => {
                    debug!(isbn = %book.isbn, book_id = %book.id, "book replicated");
                    outcome.inserted += 1;
                }
                // Lost a race against a concurrent insert of the same ISBN.
                Err(RepositoryError::DuplicateKey { .. }) => outcome.skipped += 1,
                Err(e) => return Err(e.into()),
            },
        }
    }

    info!(inserted = outcome.inserted, skipped = outcome.skipped, "books.created applied");
    Ok(outcome)
}

pub async fn apply_book_deleted(
    payload: &BookDeleted,
    books: &dyn BookRepository,
) -> Result<BookDeletedOutcome, ReplicationError> {
    match decide_delete(books.find_by_isbn(&payload.isbn).await?) {
        DeleteDecision::Delete(book) => {
            books.delete(&book.isbn).await?;
            info!(isbn = %book.isbn, "book deleted");
            Ok(BookDeletedOutcome::Deleted(book))
        }
        DeleteDecision::AlreadyAbsent => {
            debug!(isbn = %payload.isbn, "book already absent");
            Ok(BookDeletedOutcome::AlreadyAbsent)
        }
    }
}

/// Record a loan made on the peer.
///
/// The book row is marked out before the ledger entry is written, so a crash
/// between the two leaves a state that redelivery repairs. A ledger write that
/// fails outright puts the book row back before the error is reported.
pub async fn apply_book_borrowed(
    payload: &BookBorrowed,
    books: &dyn BookRepository,
    users: &dyn UserRepository,
    borrows: &dyn BorrowRepository,
    clock: &dyn Clock,
) -> Result<BorrowOutcome, ReplicationError> {
    let user = users
        .find_by_email(&payload.user_email)
        .await?
        .ok_or_else(|| gap("user", &payload.user_email))?;
    let mut book = books
        .find_by_isbn(&payload.book_isbn)
        .await?
        .ok_or_else(|| gap("book", &payload.book_isbn))?;

    let latest = borrows.latest_for_book(book.id).await?;
    let outcome = match decide_borrow(&book, latest, &user) {
        BorrowDecision::Borrow => {
            BorrowOutcome::Borrowed(record_loan(&book, &user, payload, books, borrows, clock).await?)
        }
        BorrowDecision::Reaffirm(mut record) => {
            book.lend_until(payload.return_date);
            books.update(&book).await?;
            if record.return_date != payload.return_date {
                record.return_date = payload.return_date;
                borrows.update(&record).await?;
            }
            BorrowOutcome::Reaffirmed(record)
        }
        BorrowDecision::Repair => {
            warn!(isbn = %book.isbn, email = %user.email, "book out without ledger entry, repairing");
            BorrowOutcome::Repaired(record_loan(&book, &user, payload, books, borrows, clock).await?)
        }
        BorrowDecision::Conflict { holder } => {
            return Err(ReplicationError::Conflict {
                isbn: book.isbn,
                holder,
            });
        }
    };

    info!(isbn = %book.isbn, email = %user.email, return_date = %payload.return_date, "book.borrowed applied");
    Ok(outcome)
}

/// Mark `book` out and write its ledger entry, restoring the book row if the
/// entry cannot be written.
async fn record_loan(
    book: &Book,
    user: &User,
    payload: &BookBorrowed,
    books: &dyn BookRepository,
    borrows: &dyn BorrowRepository,
    clock: &dyn Clock,
) -> Result<BorrowRecord, ReplicationError> {
    let mut lent = book.clone();
    lent.lend_until(payload.return_date);
    books.update(&lent).await?;

    match borrows.insert(new_borrow(&lent, user, payload, clock)).await {
        Ok(record) => Ok(record),
        Err(err) => {
            if let Err(restore) = books.update(book).await {
                error!(isbn = %book.isbn, error = %restore, "book left marked out after failed ledger write");
            }
            Err(err.into())
        }
    }
}

pub async fn apply_user_created(
    payload: &UserCreated,
    users: &dyn UserRepository,
    clock: &dyn Clock,
) -> Result<UserCreatedOutcome, ReplicationError> {
    if let CreateDecision::Skip(existing) = decide_create(users.find_by_email(&payload.email).await?) {
        debug!(email = %payload.email, "user already present");
        return Ok(UserCreatedOutcome::Existing(existing));
    }

    let new_user = NewUser {
        email: payload.email.clone(),
        firstname: payload.firstname.clone(),
        lastname: payload.lastname.clone(),
        created_at: clock.now(),
    };
    match users.insert(new_user).await {
        Ok(user) => {
            info!(email = %user.email, user_id = %user.id, "user replicated");
            Ok(UserCreatedOutcome::Created(user))
        }
        Err(RepositoryError::DuplicateKey { .. }) => users
            .find_by_email(&payload.email)
            .await?
            .map(UserCreatedOutcome::Existing)
            .ok_or_else(|| gap("user", &payload.email)),
        Err(e) => Err(e.into()),
    }
}

fn gap(entity: &'static str, key: &impl core::fmt::Display) -> ReplicationError {
    ReplicationError::ReferentialGap {
        entity,
        key: key.to_string(),
    }
}

fn new_book(entry: &BookEntry) -> NewBook {
    NewBook {
        isbn: entry.isbn.clone(),
        title: entry.title.clone(),
        author: entry.author.clone(),
        publisher: entry.publisher.clone(),
        category: entry.category.clone(),
        available: true,
        return_date: None,
    }
}

fn new_borrow(book: &Book, user: &User, payload: &BookBorrowed, clock: &dyn Clock) -> NewBorrow {
    NewBorrow {
        user_id: user.id,
        book_id: book.id,
        borrow_date: clock.today(),
        return_date: payload.return_date,
    }
}

/// Decode an envelope payload for `kind`, refusing surrogate ids.
fn decode_payload<T: DeserializeOwned>(kind: EventKind, envelope: &EventEnvelope) -> Result<T, ReplicationError> {
    let delivered: EventKind = envelope.routing_key().parse()?;
    if delivered != kind {
        return Err(DecodeError::Malformed {
            kind,
            reason: format!("delivered under routing key {delivered}"),
        }
        .into());
    }
    reject_surrogate_ids(envelope.data())?;
    T::deserialize(envelope.data()).map_err(|e| {
        DecodeError::Malformed {
            kind,
            reason: e.to_string(),
        }
        .into()
    })
}

/// `books.created` consumer (frontend).
pub struct BooksCreatedHandler {
    books: Arc<dyn BookRepository>,
}

impl BooksCreatedHandler {
    pub fn new(books: Arc<dyn BookRepository>) -> Self {
        Self { books }
    }
}

#[async_trait]
impl MessageHandler for BooksCreatedHandler {
    fn kind(&self) -> EventKind {
        EventKind::BooksCreated
    }

    #[instrument(skip_all, fields(routing_key = envelope.routing_key()))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let entries: Vec<BookEntry> = decode_payload(self.kind(), envelope)?;
        apply_books_created(&entries, self.books.as_ref()).await?;
        Ok(())
    }
}

/// `book.deleted` consumer (frontend).
pub struct BookDeletedHandler {
    books: Arc<dyn BookRepository>,
}

impl BookDeletedHandler {
    pub fn new(books: Arc<dyn BookRepository>) -> Self {
        Self { books }
    }
}

#[async_trait]
impl MessageHandler for BookDeletedHandler {
    fn kind(&self) -> EventKind {
        EventKind::BookDeleted
    }

    #[instrument(skip_all, fields(routing_key = envelope.routing_key()))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let deleted: BookDeleted = decode_payload(self.kind(), envelope)?;
        apply_book_deleted(&deleted, self.books.as_ref()).await?;
        Ok(())
    }
}

/// `book.borrowed` consumer (admin).
pub struct BookBorrowedHandler {
    books: Arc<dyn BookRepository>,
    users: Arc<dyn UserRepository>,
    borrows: Arc<dyn BorrowRepository>,
    clock: Arc<dyn Clock>,
}

impl BookBorrowedHandler {
    pub fn new(
        books: Arc<dyn BookRepository>,
        users: Arc<dyn UserRepository>,
        borrows: Arc<dyn BorrowRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            books,
            users,
            borrows,
            clock,
        }
    }
}

#[async_trait]
impl MessageHandler for BookBorrowedHandler {
    fn kind(&self) -> EventKind {
        EventKind::BookBorrowed
    }

    #[instrument(skip_all, fields(routing_key = envelope.routing_key()))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let borrowed: BookBorrowed = decode_payload(self.kind(), envelope)?;
        apply_book_borrowed(
            &borrowed,
            self.books.as_ref(),
            self.users.as_ref(),
            self.borrows.as_ref(),
            self.clock.as_ref(),
        )
        .await?;
        Ok(())
    }
}

/// `user.created` consumer (admin).
pub struct UserCreatedHandler {
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
}

impl UserCreatedHandler {
    pub fn new(users: Arc<dyn UserRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { users, clock }
    }
}

#[async_trait]
impl MessageHandler for UserCreatedHandler {
    fn kind(&self) -> EventKind {
        EventKind::UserCreated
    }

    #[instrument(skip_all, fields(routing_key = envelope.routing_key()))]
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        let created: UserCreated = decode_payload(self.kind(), envelope)?;
        apply_user_created(&created, self.users.as_ref(), self.clock.as_ref()).await?;
        Ok(())
    }
}

