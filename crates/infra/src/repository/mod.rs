//! Local store abstractions consumed by replication and the service layer.
//!
//! Lookups go through natural keys (ISBN, email). Surrogate ids are assigned by
//! each store and only ever used to link rows inside that same store.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chrono::NaiveDate;

use shelfsync_core::{Book, BookId, BorrowRecord, Email, Isbn, NewBook, NewBorrow, NewUser, User};

pub use memory::{InMemoryBookRepository, InMemoryBorrowRepository, InMemoryUserRepository};
pub use postgres::{ensure_schema, PgBookRepository, PgBorrowRepository, PgUserRepository};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// A row with the same natural key already exists (e.g. lost insert race).
    #[error("duplicate {entity} key: {key}")]
    DuplicateKey { entity: &'static str, key: String },

    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: String },

    #[error("storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait BookRepository: Send + Sync {
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError>;

    /// Insert a new row. Fails with `DuplicateKey` if the ISBN is taken.
    async fn insert(&self, book: NewBook) -> Result<Book, RepositoryError>;

    /// Overwrite the row identified by `book.isbn`.
    async fn update(&self, book: &Book) -> Result<(), RepositoryError>;

    /// Mark the book out until `return_date`, but only if it is available.
    ///
    /// Check and write are one atomic step. `None` means the book is absent
    /// or already out.
    async fn lend(&self, isbn: &Isbn, return_date: NaiveDate) -> Result<Option<Book>, RepositoryError>;

    /// Returns whether a row was removed.
    async fn delete(&self, isbn: &Isbn) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &Email) -> Result<Option<User>, RepositoryError>;

    /// Insert a new row. Fails with `DuplicateKey` if the email is taken.
    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError>;

    async fn delete(&self, email: &Email) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait BorrowRepository: Send + Sync {
    /// Most recent record for a book, by borrow date then insertion order.
    async fn latest_for_book(&self, book_id: BookId) -> Result<Option<BorrowRecord>, RepositoryError>;

    async fn insert(&self, record: NewBorrow) -> Result<BorrowRecord, RepositoryError>;

    async fn update(&self, record: &BorrowRecord) -> Result<(), RepositoryError>;
}

#[async_trait]
impl<R> BookRepository for Arc<R>
where
    R: BookRepository + ?Sized,
{
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError> {
        (**self).find_by_isbn(isbn).await
    }

    async fn insert(&self, book: NewBook) -> Result<Book, RepositoryError> {
        (**self).insert(book).await
    }

    async fn update(&self, book: &Book) -> Result<(), RepositoryError> {
        (**self).update(book).await
    }

    async fn lend(&self, isbn: &Isbn, return_date: NaiveDate) -> Result<Option<Book>, RepositoryError> {
        (**self).lend(isbn, return_date).await
    }

    async fn delete(&self, isbn: &Isbn) -> Result<bool, RepositoryError> {
        (**self).delete(isbn).await
    }
}

#[async_trait]
impl<R> UserRepository for Arc<R>
where
    R: UserRepository + ?Sized,
{
    async fn find_by_email(&self, email: &Email) -> Result<Option<User>, RepositoryError> {
        (**self).find_by_email(email).await
    }

    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError> {
        (**self).insert(user).await
    }

    async fn delete(&self, email: &Email) -> Result<bool, RepositoryError> {
        (**self).delete(email).await
    }
}

#[async_trait]
impl<R> BorrowRepository for Arc<R>
where
    R: BorrowRepository + ?Sized,
{
    async fn latest_for_book(&self, book_id: BookId) -> Result<Option<BorrowRecord>, RepositoryError> {
        (**self).latest_for_book(book_id).await
    }

    async fn insert(&self, record: NewBorrow) -> Result<BorrowRecord, RepositoryError> {
        (**self).insert(record).await
    }

    async fn update(&self, record: &BorrowRecord) -> Result<(), RepositoryError> {
        (**self).update(record).await
    }
}

/// The three stores of one service, shared by its sync services and its
/// publishing service layer.
#[derive(Clone)]
pub struct Repositories {
    pub books: Arc<dyn BookRepository>,
    pub users: Arc<dyn UserRepository>,
    pub borrows: Arc<dyn BorrowRepository>,
}

impl Repositories {
    /// In-memory stores whose surrogate ids start at `id_start`.
    ///
    /// Giving each simulated service a different start makes id-space
    /// divergence visible in tests.
    pub fn in_memory(id_start: i64) -> Self {
        Self {
            books: Arc::new(InMemoryBookRepository::starting_at(id_start)),
            users: Arc::new(InMemoryUserRepository::starting_at(id_start)),
            borrows: Arc::new(InMemoryBorrowRepository::starting_at(id_start)),
        }
    }

    /// Postgres stores sharing one pool. Creates missing tables first.
    pub async fn postgres(pool: sqlx::PgPool) -> Result<Self, RepositoryError> {
        ensure_schema(&pool).await?;
        Ok(Self {
            books: Arc::new(PgBookRepository::new(pool.clone())),
            users: Arc::new(PgUserRepository::new(pool.clone())),
            borrows: Arc::new(PgBorrowRepository::new(pool)),
        })
    }
}

impl core::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
