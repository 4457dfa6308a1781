//! Postgres-backed repositories.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | RepositoryError |
//! |------------|----------------------|-----------------|
//! | Database (unique violation) | `23505` | `DuplicateKey` |
//! | any other | any | `Storage` |
//!
//! Natural-key columns carry `UNIQUE` constraints, so concurrent inserts of the
//! same ISBN or email resolve to exactly one row and a `DuplicateKey` for the loser.

use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use async_trait::async_trait;
use chrono::NaiveDate;
use shelfsync_core::{
    Book, BookId, BorrowId, BorrowRecord, Email, Isbn, NewBook, NewBorrow, NewUser, User, UserId,
};

use super::{BookRepository, BorrowRepository, RepositoryError, UserRepository};

const SCHEMA: [&str; 4] = [
    r#"
    CREATE TABLE IF NOT EXISTS books (
        id          BIGSERIAL PRIMARY KEY,
        isbn        TEXT NOT NULL UNIQUE,
        title       TEXT NOT NULL,
        author      TEXT NOT NULL,
        publisher   TEXT NOT NULL,
        category    TEXT NOT NULL,
        available   BOOLEAN NOT NULL DEFAULT TRUE,
        return_date DATE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id         BIGSERIAL PRIMARY KEY,
        email      TEXT NOT NULL UNIQUE,
        firstname  TEXT NOT NULL,
        lastname   TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS borrow_records (
        id          BIGSERIAL PRIMARY KEY,
        user_id     BIGINT NOT NULL REFERENCES users (id) ON DELETE CASCADE,
        book_id     BIGINT NOT NULL REFERENCES books (id) ON DELETE CASCADE,
        borrow_date DATE NOT NULL,
        return_date DATE NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS borrow_records_book_idx ON borrow_records (book_id, borrow_date DESC, id DESC)",
];

/// Create the replica tables if they do not exist yet.
pub async fn ensure_schema(pool: &PgPool) -> Result<(), RepositoryError> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", "schema", "", e))?;
    }
    debug!("replica schema ensured");
    Ok(())
}

fn map_sqlx_error(operation: &str, entity: &'static str, key: &str, err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::DuplicateKey {
            entity,
            key: key.to_string(),
        },
        _ => RepositoryError::Storage(format!("{operation}: {err}")),
    }
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, RepositoryError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(name)
        .map_err(|e| RepositoryError::Storage(format!("failed to read column {name}: {e}")))
}

fn book_from_row(row: &PgRow) -> Result<Book, RepositoryError> {
    let isbn: String = column(row, "isbn")?;
    Ok(Book {
        id: BookId::new(column(row, "id")?),
        isbn: Isbn::parse(&isbn).map_err(|e| RepositoryError::Storage(e.to_string()))?,
        title: column(row, "title")?,
        author: column(row, "author")?,
        publisher: column(row, "publisher")?,
        category: column(row, "category")?,
        available: column(row, "available")?,
        return_date: column(row, "return_date")?,
    })
}

fn user_from_row(row: &PgRow) -> Result<User, RepositoryError> {
    let email: String = column(row, "email")?;
    Ok(User {
        id: UserId::new(column(row, "id")?),
        email: Email::parse(&email).map_err(|e| RepositoryError::Storage(e.to_string()))?,
        firstname: column(row, "firstname")?,
        lastname: column(row, "lastname")?,
        created_at: column(row, "created_at")?,
    })
}

fn borrow_from_row(row: &PgRow) -> Result<BorrowRecord, RepositoryError> {
    Ok(BorrowRecord {
        id: BorrowId::new(column(row, "id")?),
        user_id: UserId::new(column(row, "user_id")?),
        book_id: BookId::new(column(row, "book_id")?),
        borrow_date: column(row, "borrow_date")?,
        return_date: column(row, "return_date")?,
    })
}

/// Book table on Postgres.
#[derive(Debug, Clone)]
pub struct PgBookRepository {
    pool: PgPool,
}

impl PgBookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BookRepository for PgBookRepository {
    #[instrument(skip_all, fields(isbn = %isbn), err)]
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, isbn, title, author, publisher, category, available, return_date
            FROM books
            WHERE isbn = $1
            "#,
        )
        .bind(isbn.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_book", "book", isbn.as_str(), e))?;

        row.as_ref().map(book_from_row).transpose()
    }

    #[instrument(skip_all, fields(isbn = %book.isbn), err)]
    async fn insert(&self, book: NewBook) -> Result<Book, RepositoryError> {
        // ON CONFLICT DO NOTHING: a lost race yields no row instead of an aborted statement.
        let row = sqlx::query(
            r#"
            INSERT INTO books (isbn, title, author, publisher, category, available, return_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (isbn) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(book.isbn.as_str())
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.publisher)
        .bind(&book.category)
        .bind(book.available)
        .bind(book.return_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_book", "book", book.isbn.as_str(), e))?;

        let Some(row) = row else {
            return Err(RepositoryError::DuplicateKey {
                entity: "book",
                key: book.isbn.to_string(),
            });
        };

        Ok(Book {
            id: BookId::new(column(&row, "id")?),
            isbn: book.isbn,
            title: book.title,
            author: book.author,
            publisher: book.publisher,
            category: book.category,
            available: book.available,
            return_date: book.return_date,
        })
    }

    #[instrument(skip_all, fields(isbn = %book.isbn), err)]
    async fn update(&self, book: &Book) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE books
            SET title = $2, author = $3, publisher = $4, category = $5, available = $6, return_date = $7
            WHERE isbn = $1
            "#,
        )
        .bind(book.isbn.as_str())
        .bind(&book.title)
        .bind(&book.author)
        .bind(&book.publisher)
        .bind(&book.category)
        .bind(book.available)
        .bind(book.return_date)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_book", "book", book.isbn.as_str(), e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "book",
                key: book.isbn.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip_all, fields(isbn = %isbn, return_date = %return_date), err)]
    async fn lend(&self, isbn: &Isbn, return_date: NaiveDate) -> Result<Option<Book>, RepositoryError> {
        // The `available` guard makes check-and-set a single statement.
        let row = sqlx::query(
            r#"
            UPDATE books
            SET available = FALSE, return_date = $2
            WHERE isbn = $1 AND available
            RETURNING id, isbn, title, author, publisher, category, available, return_date
            "#,
        )
        .bind(isbn.as_str())
        .bind(return_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("lend_book", "book", isbn.as_str(), e))?;

        row.as_ref().map(book_from_row).transpose()
    }

    #[instrument(skip_all, fields(isbn = %isbn), err)]
    async fn delete(&self, isbn: &Isbn) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM books WHERE isbn = $1")
            .bind(isbn.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_book", "book", isbn.as_str(), e))?;
        Ok(result.rows_affected() > 0)
    }
}

/// User table on Postgres.
#[derive(Debug, Clone)]
pub struct PgUserRepository {
    pool: PgPool,
}

impl PgUserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    #[instrument(skip_all, fields(email = %email), err)]
    async fn find_by_email(&self, email: &Email) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, firstname, lastname, created_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_user", "user", email.as_str(), e))?;

        row.as_ref().map(user_from_row).transpose()
    }

    #[instrument(skip_all, fields(email = %user.email), err)]
    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO users (email, firstname, lastname, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (email) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(user.email.as_str())
        .bind(&user.firstname)
        .bind(&user.lastname)
        .bind(user.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_user", "user", user.email.as_str(), e))?;

        let Some(row) = row else {
            return Err(RepositoryError::DuplicateKey {
                entity: "user",
                key: user.email.to_string(),
            });
        };

        Ok(User {
            id: UserId::new(column(&row, "id")?),
            email: user.email,
            firstname: user.firstname,
            lastname: user.lastname,
            created_at: user.created_at,
        })
    }

    #[instrument(skip_all, fields(email = %email), err)]
    async fn delete(&self, email: &Email) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM users WHERE email = $1")
            .bind(email.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_user", "user", email.as_str(), e))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Loan ledger on Postgres.
#[derive(Debug, Clone)]
pub struct PgBorrowRepository {
    pool: PgPool,
}

impl PgBorrowRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BorrowRepository for PgBorrowRepository {
    #[instrument(skip_all, fields(book_id = %book_id), err)]
    async fn latest_for_book(&self, book_id: BookId) -> Result<Option<BorrowRecord>, RepositoryError> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, book_id, borrow_date, return_date
            FROM borrow_records
            WHERE book_id = $1
            ORDER BY borrow_date DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(book_id.get())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("latest_borrow", "borrow record", &book_id.to_string(), e))?;

        row.as_ref().map(borrow_from_row).transpose()
    }

    #[instrument(skip_all, fields(book_id = %record.book_id), err)]
    async fn insert(&self, record: NewBorrow) -> Result<BorrowRecord, RepositoryError> {
        let row = sqlx::query(
            r#"
            INSERT INTO borrow_records (user_id, book_id, borrow_date, return_date)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(record.user_id.get())
        .bind(record.book_id.get())
        .bind(record.borrow_date)
        .bind(record.return_date)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_borrow", "borrow record", &record.book_id.to_string(), e))?;

        Ok(BorrowRecord {
            id: BorrowId::new(column(&row, "id")?),
            user_id: record.user_id,
            book_id: record.book_id,
            borrow_date: record.borrow_date,
            return_date: record.return_date,
        })
    }

    #[instrument(skip_all, fields(borrow_id = %record.id), err)]
    async fn update(&self, record: &BorrowRecord) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"
            UPDATE borrow_records
            SET borrow_date = $2, return_date = $3
            WHERE id = $1
            "#,
        )
        .bind(record.id.get())
        .bind(record.borrow_date)
        .bind(record.return_date)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_borrow", "borrow record", &record.id.to_string(), e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound {
                entity: "borrow record",
                key: record.id.to_string(),
            });
        }
        Ok(())
    }
}
