use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::NaiveDate;

use shelfsync_core::{
    Book, BookId, BorrowId, BorrowRecord, Email, Isbn, NewBook, NewBorrow, NewUser, User, UserId,
};

use super::{BookRepository, BorrowRepository, RepositoryError, UserRepository};

/// Monotonic surrogate id source for one table.
#[derive(Debug)]
struct Sequence(AtomicI64);

impl Sequence {
    fn starting_at(first: i64) -> Self {
        Self(AtomicI64::new(first))
    }

    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, RepositoryError> {
    lock.read()
        .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, RepositoryError> {
    lock.write()
        .map_err(|_| RepositoryError::Storage("lock poisoned".to_string()))
}

/// In-memory book table for tests/dev.
#[derive(Debug)]
pub struct InMemoryBookRepository {
    rows: RwLock<HashMap<Isbn, Book>>,
    ids: Sequence,
}

impl InMemoryBookRepository {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            ids: Sequence::starting_at(first_id),
        }
    }

    /// All rows ordered by surrogate id.
    pub fn snapshot(&self) -> Vec<Book> {
        let mut rows: Vec<Book> = match self.rows.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return vec![],
        };
        rows.sort_by_key(|b| b.id);
        rows
    }
}

impl Default for InMemoryBookRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookRepository for InMemoryBookRepository {
    async fn find_by_isbn(&self, isbn: &Isbn) -> Result<Option<Book>, RepositoryError> {
        Ok(read(&self.rows)?.get(isbn).cloned())
    }

    async fn insert(&self, book: NewBook) -> Result<Book, RepositoryError> {
        let mut rows = write(&self.rows)?;
        if rows.contains_key(&book.isbn) {
            return Err(RepositoryError::DuplicateKey {
                entity: "book",
                key: book.isbn.to_string(),
            });
        }
        let stored = Book {
            id: BookId::new(self.ids.next()),
            isbn: book.isbn,
            title: book.title,
            author: book.author,
            publisher: book.publisher,
            category: book.category,
            available: book.available,
            return_date: book.return_date,
        };
        rows.insert(stored.isbn.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, book: &Book) -> Result<(), RepositoryError> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(&book.isbn) {
            Some(row) => {
                *row = book.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity: "book",
                key: book.isbn.to_string(),
            }),
        }
    }

    async fn lend(&self, isbn: &Isbn, return_date: NaiveDate) -> Result<Option<Book>, RepositoryError> {
        let mut rows = write(&self.rows)?;
        match rows.get_mut(isbn) {
            Some(row) if row.available => {
                row.lend_until(return_date);
                Ok(Some(row.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, isbn: &Isbn) -> Result<bool, RepositoryError> {
        Ok(write(&self.rows)?.remove(isbn).is_some())
    }
}

/// In-memory user table for tests/dev.
#[derive(Debug)]
pub struct InMemoryUserRepository {
    rows: RwLock<HashMap<Email, User>>,
    ids: Sequence,
}

impl InMemoryUserRepository {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            ids: Sequence::starting_at(first_id),
        }
    }

    pub fn snapshot(&self) -> Vec<User> {
        let mut rows: Vec<User> = match self.rows.read() {
            Ok(map) => map.values().cloned().collect(),
            Err(_) => return vec![],
        };
        rows.sort_by_key(|u| u.id);
        rows
    }
}

impl Default for InMemoryUserRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_email(&self, email: &Email) -> Result<Option<User>, RepositoryError> {
        Ok(read(&self.rows)?.get(email).cloned())
    }

    async fn insert(&self, user: NewUser) -> Result<User, RepositoryError> {
        let mut rows = write(&self.rows)?;
        if rows.contains_key(&user.email) {
            return Err(RepositoryError::DuplicateKey {
                entity: "user",
                key: user.email.to_string(),
            });
        }
        let stored = User {
            id: UserId::new(self.ids.next()),
            email: user.email,
            firstname: user.firstname,
            lastname: user.lastname,
            created_at: user.created_at,
        };
        rows.insert(stored.email.clone(), stored.clone());
        Ok(stored)
    }

    async fn delete(&self, email: &Email) -> Result<bool, RepositoryError> {
        Ok(write(&self.rows)?.remove(email).is_some())
    }
}

/// In-memory loan ledger for tests/dev.
#[derive(Debug)]
pub struct InMemoryBorrowRepository {
    rows: RwLock<Vec<BorrowRecord>>,
    ids: Sequence,
}

impl InMemoryBorrowRepository {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    pub fn starting_at(first_id: i64) -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
            ids: Sequence::starting_at(first_id),
        }
    }

    pub fn snapshot(&self) -> Vec<BorrowRecord> {
        self.rows.read().map(|rows| rows.clone()).unwrap_or_default()
    }
}

impl Default for InMemoryBorrowRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BorrowRepository for InMemoryBorrowRepository {
    async fn latest_for_book(&self, book_id: BookId) -> Result<Option<BorrowRecord>, RepositoryError> {
        Ok(read(&self.rows)?
            .iter()
            .filter(|r| r.book_id == book_id)
            .max_by_key(|r| (r.borrow_date, r.id))
            .cloned())
    }

    async fn insert(&self, record: NewBorrow) -> Result<BorrowRecord, RepositoryError> {
        let stored = BorrowRecord {
            id: BorrowId::new(self.ids.next()),
            user_id: record.user_id,
            book_id: record.book_id,
            borrow_date: record.borrow_date,
            return_date: record.return_date,
        };
        write(&self.rows)?.push(stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &BorrowRecord) -> Result<(), RepositoryError> {
        let mut rows = write(&self.rows)?;
        match rows.iter_mut().find(|r| r.id == record.id) {
            Some(row) => {
                *row = record.clone();
                Ok(())
            }
            None => Err(RepositoryError::NotFound {
                entity: "borrow record",
                key: record.id.to_string(),
            }),
        }
    }
}
