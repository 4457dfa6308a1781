//! Integration tests for cross-service replication.
//!
//! Tests: local mutation → publish → broker queue → sync service → peer store
//!
//! Verifies:
//! - Every handler is idempotent under redelivery
//! - Referential gaps and double borrows surface as errors, never as silent writes
//! - The two stores' surrogate ids never leak into payloads
//! - Failed messages are dead-lettered and do not stall their queue

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{NaiveDate, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use async_trait::async_trait;
    use shelfsync_core::{BookId, BorrowRecord, Clock, Email, FixedClock, Isbn, NewBook, NewBorrow};
    use shelfsync_events::{
        BookBorrowed, BookDeleted, BookEntry, Broker, EventEnvelope, EventKind, HandlerError,
        InMemoryBroker, MessageHandler, ServiceRole, UserCreated,
    };

    use crate::replication::{
        apply_book_borrowed, apply_book_deleted, apply_books_created, apply_user_created,
        BookBorrowedHandler, BookDeletedOutcome, BooksCreatedHandler, BooksCreatedOutcome, BorrowOutcome,
        ReplicationError, UserCreatedOutcome,
    };
    use crate::repository::{
        BookRepository, BorrowRepository, InMemoryBookRepository, InMemoryBorrowRepository,
        InMemoryUserRepository, Repositories, RepositoryError, UserRepository,
    };
    use crate::service::{CatalogService, CirculationService, EventPublisher};
    use crate::sync::SyncService;

    const IDLE: Duration = Duration::from_secs(2);

    fn isbn(raw: &str) -> Isbn {
        Isbn::parse(raw).unwrap()
    }

    fn email(raw: &str) -> Email {
        Email::parse(raw).unwrap()
    }

    fn entry(raw_isbn: &str, title: &str) -> BookEntry {
        BookEntry {
            title: title.into(),
            author: "Some Author".into(),
            isbn: isbn(raw_isbn),
            publisher: "penguin".into(),
            category: "fiction".into(),
        }
    }

    fn clock() -> FixedClock {
        FixedClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 9, 0, 0).unwrap())
    }

    fn due() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, 15).unwrap()
    }

    struct AdminStore {
        books: InMemoryBookRepository,
        users: InMemoryUserRepository,
        borrows: InMemoryBorrowRepository,
    }

    impl AdminStore {
        fn new() -> Self {
            Self {
                books: InMemoryBookRepository::starting_at(1),
                users: InMemoryUserRepository::starting_at(1),
                borrows: InMemoryBorrowRepository::starting_at(1),
            }
        }

        async fn borrow(&self, payload: &BookBorrowed) -> Result<BorrowOutcome, ReplicationError> {
            apply_book_borrowed(payload, &self.books, &self.users, &self.borrows, &clock()).await
        }
    }

    fn borrowed(book: &str, user: &str) -> BookBorrowed {
        BookBorrowed {
            book_isbn: isbn(book),
            user_email: email(user),
            return_date: due(),
        }
    }

    fn user_created(raw: &str) -> UserCreated {
        UserCreated {
            email: email(raw),
            firstname: "Alan".into(),
            lastname: "Turing".into(),
        }
    }

    #[tokio::test]
    async fn books_created_twice_yields_one_row() {
        let books = InMemoryBookRepository::new();
        let batch = vec![entry("9780140449136", "The Odyssey")];

        let first = apply_books_created(&batch, &books).await.unwrap();
        let second = apply_books_created(&batch, &books).await.unwrap();

        assert_eq!(first, BooksCreatedOutcome { inserted: 1, skipped: 0 });
        assert_eq!(second, BooksCreatedOutcome { inserted: 0, skipped: 1 });
        let rows = books.snapshot();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].available);
        assert_eq!(rows[0].return_date, None);
    }

    #[tokio::test]
    async fn duplicate_isbns_inside_one_batch_are_skipped() {
        let books = InMemoryBookRepository::new();
        let batch = vec![entry("978-0-14-044913-6", "a"), entry("9780140449136", "b")];

        let outcome = apply_books_created(&batch, &books).await.unwrap();

        assert_eq!(outcome, BooksCreatedOutcome { inserted: 1, skipped: 1 });
        assert_eq!(books.snapshot()[0].title, "a");
    }

    #[tokio::test]
    async fn deleting_an_absent_book_is_a_no_op() {
        let books = InMemoryBookRepository::new();
        let outcome = apply_book_deleted(&BookDeleted { isbn: isbn("123") }, &books)
            .await
            .unwrap();
        assert_eq!(outcome, BookDeletedOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn delete_then_create_leaves_the_book_present() {
        let books = InMemoryBookRepository::new();
        apply_books_created(&[entry("42", "old")], &books).await.unwrap();

        apply_book_deleted(&BookDeleted { isbn: isbn("42") }, &books).await.unwrap();
        apply_books_created(&[entry("42", "new")], &books).await.unwrap();

        let book = books.find_by_isbn(&isbn("42")).await.unwrap().unwrap();
        assert_eq!(book.title, "new");
    }

    #[tokio::test]
    async fn user_created_twice_yields_one_row() {
        let users = InMemoryUserRepository::new();
        let payload = user_created("Alan@Bletchley.uk");

        let first = apply_user_created(&payload, &users, &clock()).await.unwrap();
        let second = apply_user_created(&payload, &users, &clock()).await.unwrap();

        let UserCreatedOutcome::Created(created) = first else {
            panic!("first apply should create");
        };
        assert_eq!(second, UserCreatedOutcome::Existing(created.clone()));
        assert_eq!(created.created_at, clock().now());
        assert_eq!(users.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn borrow_with_unknown_user_or_book_is_a_gap() {
        let admin = AdminStore::new();
        apply_books_created(&[entry("777", "x")], &admin.books).await.unwrap();

        let err = admin.borrow(&borrowed("777", "ghost@lib.org")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ReferentialGap { entity: "user", .. }));

        apply_user_created(&user_created("real@lib.org"), &admin.users, &clock()).await.unwrap();
        let err = admin.borrow(&borrowed("888", "real@lib.org")).await.unwrap_err();
        assert!(matches!(err, ReplicationError::ReferentialGap { entity: "book", .. }));

        assert!(admin.borrows.snapshot().is_empty());
        assert!(admin.books.snapshot()[0].available);
    }

    #[tokio::test]
    async fn borrow_before_catalogue_replays_once_the_book_arrives() {
        let admin = AdminStore::new();
        apply_user_created(&user_created("early@lib.org"), &admin.users, &clock()).await.unwrap();
        let payload = borrowed("9780262510875", "early@lib.org");

        assert!(admin.borrow(&payload).await.is_err());

        apply_books_created(&[entry("9780262510875", "SICP")], &admin.books).await.unwrap();
        let outcome = admin.borrow(&payload).await.unwrap();

        assert!(matches!(outcome, BorrowOutcome::Borrowed(_)));
        let book = admin.books.find_by_isbn(&isbn("9780262510875")).await.unwrap().unwrap();
        assert!(!book.available);
        assert_eq!(book.return_date, Some(due()));
    }

    #[tokio::test]
    async fn replayed_borrow_keeps_one_record() {
        let admin = AdminStore::new();
        apply_books_created(&[entry("1001", "b")], &admin.books).await.unwrap();
        apply_user_created(&user_created("one@lib.org"), &admin.users, &clock()).await.unwrap();
        let payload = borrowed("1001", "one@lib.org");

        let first = admin.borrow(&payload).await.unwrap();
        let again = admin.borrow(&payload).await.unwrap();

        let BorrowOutcome::Borrowed(record) = first else {
            panic!("first apply should borrow");
        };
        assert_eq!(again, BorrowOutcome::Reaffirmed(record.clone()));
        assert_eq!(record.borrow_date, clock().today());
        assert_eq!(admin.borrows.snapshot(), vec![record]);
        let book = admin.books.find_by_isbn(&isbn("1001")).await.unwrap().unwrap();
        assert_eq!(book.return_date, Some(due()));
    }

    #[tokio::test]
    async fn second_user_borrowing_an_unavailable_book_conflicts() {
        let admin = AdminStore::new();
        apply_books_created(&[entry("2002", "b")], &admin.books).await.unwrap();
        for who in ["first@lib.org", "second@lib.org"] {
            apply_user_created(&user_created(who), &admin.users, &clock()).await.unwrap();
        }

        admin.borrow(&borrowed("2002", "first@lib.org")).await.unwrap();
        let err = admin.borrow(&borrowed("2002", "second@lib.org")).await.unwrap_err();

        assert!(matches!(err, ReplicationError::Conflict { .. }));
        assert_eq!(admin.borrows.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn book_out_without_record_is_repaired() {
        let admin = AdminStore::new();
        apply_books_created(&[entry("3003", "b")], &admin.books).await.unwrap();
        apply_user_created(&user_created("late@lib.org"), &admin.users, &clock()).await.unwrap();
        let mut book = admin.books.find_by_isbn(&isbn("3003")).await.unwrap().unwrap();
        book.lend_until(due());
        admin.books.update(&book).await.unwrap();

        let outcome = admin.borrow(&borrowed("3003", "late@lib.org")).await.unwrap();

        assert!(matches!(outcome, BorrowOutcome::Repaired(_)));
        assert_eq!(admin.borrows.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn surrogate_ids_diverge_and_never_travel() {
        let admin = Repositories::in_memory(1);
        let frontend_books = Arc::new(InMemoryBookRepository::starting_at(9000));
        let broker = Arc::new(InMemoryBroker::new());

        let catalog = CatalogService::new(admin.books.clone(), EventPublisher::new(broker.clone()));
        let sync = SyncService::new("book", Arc::new(broker.client()))
            .with_handler(Arc::new(BooksCreatedHandler::new(frontend_books.clone())));
        sync.start().await.unwrap();

        let created = catalog.create_books(vec![entry("5005", "b")]).await.unwrap();
        assert!(broker.wait_idle(IDLE).await);

        let replica = frontend_books.find_by_isbn(&isbn("5005")).await.unwrap().unwrap();
        assert_ne!(created[0].id, replica.id);
        let sent = &broker.published_for("books.created")[0];
        assert!(sent.data()[0].get("id").is_none());
        sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn payload_carrying_a_surrogate_id_is_rejected() {
        let books: Arc<dyn BookRepository> = Arc::new(InMemoryBookRepository::new());
        let handler = BooksCreatedHandler::new(books.clone());
        let envelope = EventEnvelope::new(
            "books.created",
            json!([{"id": 3, "title": "t", "author": "a", "isbn": "1", "publisher": "p", "category": "c"}]),
        );

        let err = handler.handle(&envelope).await.unwrap_err();

        assert!(matches!(err, HandlerError::Malformed { .. }));
        assert!(books.find_by_isbn(&isbn("1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn handler_refuses_envelopes_of_another_kind() {
        let repos = Repositories::in_memory(1);
        let handler = BookBorrowedHandler::new(
            repos.books.clone(),
            repos.users.clone(),
            repos.borrows.clone(),
            Arc::new(clock()),
        );
        assert_eq!(handler.kind(), EventKind::BookBorrowed);

        let err = handler
            .handle(&EventEnvelope::new("book.deleted", json!({"isbn": "1"})))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Malformed { .. }));

        let err = handler
            .handle(&EventEnvelope::new("book.returned", json!({"isbn": "1"})))
            .await
            .unwrap_err();
        assert_eq!(err, HandlerError::UnknownKind("book.returned".into()));
    }

    #[tokio::test]
    async fn referential_gap_is_dead_lettered_and_queue_continues() {
        let repos = Repositories::in_memory(1);
        let broker = Arc::new(InMemoryBroker::new());
        let clock: Arc<dyn Clock> = Arc::new(clock());
        let user_sync = SyncService::user(Arc::new(broker.client()), &repos, clock.clone());
        let borrow_sync = SyncService::borrow(Arc::new(broker.client()), &repos, clock);
        user_sync.start().await.unwrap();
        borrow_sync.start().await.unwrap();
        repos
            .books
            .insert(NewBook {
                isbn: isbn("6006"),
                title: "t".into(),
                author: "a".into(),
                publisher: "p".into(),
                category: "c".into(),
                available: true,
                return_date: None,
            })
            .await
            .unwrap();

        let gap = json!({"book_isbn": "6006", "user_email": "nobody@lib.org", "return_date": "2025-04-15"});
        broker.publish("book.borrowed", gap).await.unwrap();
        broker
            .publish("user.created", json!({"email": "somebody@lib.org", "firstname": "S", "lastname": "B"}))
            .await
            .unwrap();
        assert!(broker.wait_idle(IDLE).await);
        broker
            .publish("book.borrowed", json!({"book_isbn": "6006", "user_email": "somebody@lib.org", "return_date": "2025-04-15"}))
            .await
            .unwrap();
        assert!(broker.wait_idle(IDLE).await);

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, "book.borrowed_queue");
        assert!(dead[0].error.contains("nobody@lib.org"));
        let book = repos.books.find_by_isbn(&isbn("6006")).await.unwrap().unwrap();
        assert!(!book.available);

        user_sync.stop().await.unwrap();
        borrow_sync.stop().await.unwrap();
    }

    #[tokio::test]
    async fn admin_and_frontend_converge_over_one_broker() {
        let exchange = InMemoryBroker::new();
        let clock: Arc<dyn Clock> = Arc::new(clock());
        let admin = Repositories::in_memory(1);
        let frontend = Repositories::in_memory(10_000);

        let admin_sync = SyncService::for_role(ServiceRole::Admin, &admin, clock.clone(), || -> Arc<dyn Broker> {
            Arc::new(exchange.client())
        });
        let frontend_sync = SyncService::for_role(ServiceRole::Frontend, &frontend, clock.clone(), || -> Arc<dyn Broker> {
            Arc::new(exchange.client())
        });
        for service in admin_sync.iter().chain(frontend_sync.iter()) {
            service.start().await.unwrap();
        }

        let catalog = CatalogService::new(admin.books.clone(), EventPublisher::new(Arc::new(exchange.client())));
        let circulation = CirculationService::new(
            frontend.books.clone(),
            frontend.users.clone(),
            clock.clone(),
            EventPublisher::new(Arc::new(exchange.client())),
        );

        // Admin catalogues two books; the frontend replica picks them up.
        catalog
            .create_books(vec![entry("9780201633610", "Design Patterns"), entry("9780131103627", "K&R")])
            .await
            .unwrap();
        assert!(exchange.wait_idle(IDLE).await);
        let replica = frontend.books.find_by_isbn(&isbn("978-0-201-63361-0")).await.unwrap().unwrap();
        assert!(replica.available);

        // A patron enrols and borrows on the frontend; the admin ledger follows.
        let patron = email("patron@lib.org");
        circulation.enroll_user(patron.clone(), "Pat", "Ron").await.unwrap();
        assert!(exchange.wait_idle(IDLE).await);
        circulation.borrow_book(&isbn("9780201633610"), &patron, 14).await.unwrap();
        assert!(exchange.wait_idle(IDLE).await);

        let admin_user = admin.users.find_by_email(&patron).await.unwrap().unwrap();
        let admin_book = admin.books.find_by_isbn(&isbn("9780201633610")).await.unwrap().unwrap();
        assert!(!admin_book.available);
        assert_eq!(admin_book.return_date, Some(NaiveDate::from_ymd_opt(2025, 4, 15).unwrap()));
        let record = admin.borrows.latest_for_book(admin_book.id).await.unwrap().unwrap();
        assert_eq!(record.user_id, admin_user.id);

        // Admin withdraws the other title; the replica drops it.
        catalog.delete_book(&isbn("9780131103627")).await.unwrap();
        assert!(exchange.wait_idle(IDLE).await);
        assert!(frontend.books.find_by_isbn(&isbn("9780131103627")).await.unwrap().is_none());

        assert!(exchange.dead_letters().is_empty());
        for service in admin_sync.iter().chain(frontend_sync.iter()) {
            service.stop().await.unwrap();
        }
    }

    /// Loan ledger that cannot take new entries.
    struct FullLedger;

    #[async_trait]
    impl BorrowRepository for FullLedger {
        async fn latest_for_book(&self, _book_id: BookId) -> Result<Option<BorrowRecord>, RepositoryError> {
            Ok(None)
        }

        async fn insert(&self, _record: NewBorrow) -> Result<BorrowRecord, RepositoryError> {
            Err(RepositoryError::Storage("disk full".into()))
        }

        async fn update(&self, _record: &BorrowRecord) -> Result<(), RepositoryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_ledger_write_puts_the_book_back() {
        let admin = AdminStore::new();
        apply_books_created(&[entry("8008", "b")], &admin.books).await.unwrap();
        apply_user_created(&user_created("held@lib.org"), &admin.users, &clock()).await.unwrap();

        let err = apply_book_borrowed(&borrowed("8008", "held@lib.org"), &admin.books, &admin.users, &FullLedger, &clock())
            .await
            .unwrap_err();

        assert!(matches!(err, ReplicationError::Repository(RepositoryError::Storage(_))));
        let book = admin.books.find_by_isbn(&isbn("8008")).await.unwrap().unwrap();
        assert!(book.available);
        assert_eq!(book.return_date, None);
    }

    #[tokio::test]
    async fn dead_lettered_borrow_leaves_no_orphaned_loan() {
        let repos = Repositories::in_memory(1);
        let broker = Arc::new(InMemoryBroker::new());
        apply_books_created(&[entry("9009", "b")], repos.books.as_ref()).await.unwrap();
        apply_user_created(&user_created("held@lib.org"), repos.users.as_ref(), &clock()).await.unwrap();
        let sync = SyncService::new("borrow", Arc::new(broker.client())).with_handler(Arc::new(
            BookBorrowedHandler::new(repos.books.clone(), repos.users.clone(), Arc::new(FullLedger), Arc::new(clock())),
        ));
        sync.start().await.unwrap();

        broker
            .publish("book.borrowed", json!({"book_isbn": "9009", "user_email": "held@lib.org", "return_date": "2025-04-15"}))
            .await
            .unwrap();
        assert!(broker.wait_idle(IDLE).await);

        assert_eq!(broker.dead_letters().len(), 1);
        let book = repos.books.find_by_isbn(&isbn("9009")).await.unwrap().unwrap();
        assert!(book.available);
        sync.stop().await.unwrap();
    }

    proptest! {
        #[test]
        fn applying_a_batch_again_changes_nothing(
            raw in prop::collection::vec("[0-9]{10,13}", 1..8),
            repeats in 2usize..4,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let books = InMemoryBookRepository::new();
                let batch: Vec<BookEntry> = raw.iter().map(|i| entry(i, "t")).collect();

                apply_books_created(&batch, &books).await.unwrap();
                let once = books.snapshot();
                for _ in 1..repeats {
                    let outcome = apply_books_created(&batch, &books).await.unwrap();
                    prop_assert_eq!(outcome.inserted, 0);
                }
                prop_assert_eq!(books.snapshot(), once);
                Ok(())
            })?;
        }

        #[test]
        fn user_created_is_idempotent_for_any_case(local in "[a-z]{1,8}", upper in any::<bool>()) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let users = InMemoryUserRepository::new();
                let raw = format!("{local}@lib.org");
                let shouted = if upper { raw.to_uppercase() } else { raw.clone() };

                apply_user_created(&user_created(&raw), &users, &clock()).await.unwrap();
                apply_user_created(&user_created(&shouted), &users, &clock()).await.unwrap();

                prop_assert_eq!(users.snapshot().len(), 1);
                Ok(())
            })?;
        }
    }
}
