//! Infrastructure layer: stores, broker transports, replication wiring, config.

pub mod config;
pub mod event_bus;
pub mod reconcile;
pub mod replication;
pub mod repository;
pub mod service;
pub mod sync;

mod integration_tests;

pub use config::{ConfigError, ReplicationConfig};
pub use reconcile::{
    decide_borrow, decide_create, decide_delete, reject_surrogate_ids, BorrowDecision, CreateDecision,
    DeleteDecision, SurrogateIdLeak,
};
pub use replication::{
    apply_book_borrowed, apply_book_deleted, apply_books_created, apply_user_created, BookBorrowedHandler,
    BookDeletedHandler, BookDeletedOutcome, BooksCreatedHandler, BooksCreatedOutcome, BorrowOutcome,
    ReplicationError, UserCreatedHandler, UserCreatedOutcome,
};
pub use repository::{
    BookRepository, BorrowRepository, Repositories, RepositoryError, UserRepository,
};
pub use service::{CatalogService, CirculationService, EventPublisher, PublishError, ServiceError};
pub use sync::{SyncError, SyncService, SyncState};
