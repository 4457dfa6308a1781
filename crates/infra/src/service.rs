//! Local mutations that emit replication events.
//!
//! Every operation commits to the local store first and publishes only once
//! the commit succeeded. A publish failure is reported to the caller; the
//! local change stays committed.

use std::sync::Arc;

use chrono::Days;
use thiserror::Error;
use tracing::{info, instrument};

use shelfsync_core::{Book, Clock, DomainError, Email, Isbn, NewBook, NewUser, User};
use shelfsync_events::{
    BookBorrowed, BookDeleted, BookEntry, Broker, BrokerError, ReplicationEvent, UserCreated,
};

use crate::reconcile::{reject_surrogate_ids, SurrogateIdLeak};
use crate::repository::{BookRepository, RepositoryError, UserRepository};

/// Longest loan a patron can ask for, in days.
pub const MAX_LOAN_DAYS: u32 = 365;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    SurrogateId(#[from] SurrogateIdLeak),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("{entity} {key} already exists")]
    AlreadyExists { entity: &'static str, key: String },

    #[error("book {0} is not available")]
    Unavailable(Isbn),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// The local change is committed; the peer has not been told.
    #[error("committed locally but {routing_key} was not published: {source}")]
    Publish {
        routing_key: &'static str,
        #[source]
        source: PublishError,
    },
}

/// Outbound half of replication: publishes typed events on one broker client.
#[derive(Clone)]
pub struct EventPublisher {
    broker: Arc<dyn Broker>,
}

impl EventPublisher {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    #[instrument(skip_all, fields(routing_key = event.routing_key()), err)]
    pub async fn publish(&self, event: &ReplicationEvent) -> Result<(), PublishError> {
        let payload = event.to_payload()?;
        reject_surrogate_ids(&payload)?;
        self.broker.publish(event.routing_key(), payload).await?;
        Ok(())
    }

    async fn publish_committed(&self, event: ReplicationEvent) -> Result<(), ServiceError> {
        self.publish(&event).await.map_err(|source| ServiceError::Publish {
            routing_key: event.routing_key(),
            source,
        })
    }
}

impl core::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

/// Admin catalogue: the authoritative source of `books.created` and `book.deleted`.
pub struct CatalogService {
    books: Arc<dyn BookRepository>,
    publisher: EventPublisher,
}

impl CatalogService {
    pub fn new(books: Arc<dyn BookRepository>, publisher: EventPublisher) -> Self {
        Self { books, publisher }
    }

    /// Insert every entry whose ISBN is new and announce exactly those.
    ///
    /// Nothing is published when every ISBN was already catalogued.
    #[instrument(skip_all, fields(entries = entries.len()))]
    pub async fn create_books(&self, entries: Vec<BookEntry>) -> Result<Vec<Book>, ServiceError> {
        let mut created = Vec::new();
        let mut announced = Vec::new();

        for entry in entries {
            if self.books.find_by_isbn(&entry.isbn).await?.is_some() {
                continue;
            }
            let new_book = NewBook {
                isbn: entry.isbn.clone(),
                title: entry.title.clone(),
                author: entry.author.clone(),
                publisher: entry.publisher.clone(),
                category: entry.category.clone(),
                available: true,
                return_date: None,
            };
            match self.books.insert(new_book).await {
                Ok(book) => {
                    created.push(book);
                    announced.push(entry);
                }
                Err(RepositoryError::DuplicateKey { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if !announced.is_empty() {
            info!(count = announced.len(), "books catalogued");
            self.publisher
                .publish_committed(ReplicationEvent::BooksCreated(announced))
                .await?;
        }
        Ok(created)
    }

    #[instrument(skip_all, fields(isbn = %isbn))]
    pub async fn delete_book(&self, isbn: &Isbn) -> Result<Book, ServiceError> {
        let book = self.books.find_by_isbn(isbn).await?.ok_or_else(|| ServiceError::NotFound {
            entity: "book",
            key: isbn.to_string(),
        })?;

        if !self.books.delete(&book.isbn).await? {
            return Err(ServiceError::NotFound {
                entity: "book",
                key: isbn.to_string(),
            });
        }
        info!(isbn = %book.isbn, "book removed from catalogue");

        self.publisher
            .publish_committed(ReplicationEvent::BookDeleted(BookDeleted {
                isbn: book.isbn.clone(),
            }))
            .await?;
        Ok(book)
    }
}

/// Frontend circulation: enrolment and loans, the source of `user.created`
/// and `book.borrowed`.
pub struct CirculationService {
    books: Arc<dyn BookRepository>,
    users: Arc<dyn UserRepository>,
    clock: Arc<dyn Clock>,
    publisher: EventPublisher,
}

impl CirculationService {
    pub fn new(
        books: Arc<dyn BookRepository>,
        users: Arc<dyn UserRepository>,
        clock: Arc<dyn Clock>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            books,
            users,
            clock,
            publisher,
        }
    }

    #[instrument(skip_all, fields(email = %email))]
    pub async fn enroll_user(
        &self,
        email: Email,
        firstname: &str,
        lastname: &str,
    ) -> Result<User, ServiceError> {
        let (firstname, lastname) = (firstname.trim(), lastname.trim());
        if firstname.is_empty() || lastname.is_empty() {
            return Err(DomainError::validation("firstname and lastname are required").into());
        }
        if self.users.find_by_email(&email).await?.is_some() {
            return Err(already_exists("user", &email));
        }

        let user = self
            .users
            .insert(NewUser {
                email: email.clone(),
                firstname: firstname.to_string(),
                lastname: lastname.to_string(),
                created_at: self.clock.now(),
            })
            .await
            .map_err(|e| match e {
                RepositoryError::DuplicateKey { .. } => already_exists("user", &email),
                other => other.into(),
            })?;
        info!(email = %user.email, "user enrolled");

        self.publisher
            .publish_committed(ReplicationEvent::UserCreated(UserCreated {
                email: user.email.clone(),
                firstname: user.firstname.clone(),
                lastname: user.lastname.clone(),
            }))
            .await?;
        Ok(user)
    }

    /// Lend `isbn` to `email` for `days` days starting today.
    #[instrument(skip_all, fields(isbn = %isbn, email = %email, days = days))]
    pub async fn borrow_book(&self, isbn: &Isbn, email: &Email, days: u32) -> Result<Book, ServiceError> {
        if !(1..=MAX_LOAN_DAYS).contains(&days) {
            return Err(DomainError::validation(format!(
                "loan length must be between 1 and {MAX_LOAN_DAYS} days, got {days}"
            ))
            .into());
        }

        let user = self.users.find_by_email(email).await?.ok_or_else(|| ServiceError::NotFound {
            entity: "user",
            key: email.to_string(),
        })?;
        let book = self.books.find_by_isbn(isbn).await?.ok_or_else(|| ServiceError::NotFound {
            entity: "book",
            key: isbn.to_string(),
        })?;
        if !book.available {
            return Err(ServiceError::Unavailable(book.isbn));
        }

        let return_date = self
            .clock
            .today()
            .checked_add_days(Days::new(u64::from(days)))
            .ok_or_else(|| DomainError::validation("return date out of range"))?;

        // A concurrent borrow may have taken the book since the lookup above.
        let isbn = book.isbn;
        let book = self
            .books
            .lend(&isbn, return_date)
            .await?
            .ok_or_else(|| ServiceError::Unavailable(isbn.clone()))?;
        info!(isbn = %book.isbn, email = %user.email, %return_date, "book lent");

        self.publisher
            .publish_committed(ReplicationEvent::BookBorrowed(BookBorrowed {
                book_isbn: book.isbn.clone(),
                user_email: user.email.clone(),
                return_date,
            }))
            .await?;
        Ok(book)
    }
}

fn already_exists(entity: &'static str, key: &impl core::fmt::Display) -> ServiceError {
    ServiceError::AlreadyExists {
        entity,
        key: key.to_string(),
    }
}
