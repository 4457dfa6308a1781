//! Synchronization services: bind replication handlers to a broker.
//!
//! One service per entity family, each owning exactly one broker client:
//! - `book` (frontend): `books.created`, `book.deleted`
//! - `user` (admin): `user.created`
//! - `borrow` (admin): `book.borrowed`

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use shelfsync_core::Clock;
use shelfsync_events::{Broker, BrokerError, MessageHandler, ServiceRole};

use crate::replication::{BookBorrowedHandler, BookDeletedHandler, BooksCreatedHandler, UserCreatedHandler};
use crate::repository::Repositories;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// Stopped services are not restarted; a process restart builds new ones.
    #[error("synchronization service {0} has been stopped")]
    Stopped(&'static str),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SyncState {
    Created,
    Started,
    Stopped,
}

/// Keeps one family of local rows in step with the peer.
pub struct SyncService {
    name: &'static str,
    broker: Arc<dyn Broker>,
    handlers: Vec<Arc<dyn MessageHandler>>,
    state: Mutex<SyncState>,
}

impl SyncService {
    pub fn new(name: &'static str, broker: Arc<dyn Broker>) -> Self {
        Self {
            name,
            broker,
            handlers: Vec::new(),
            state: Mutex::new(SyncState::Created),
        }
    }

    /// Subscribe `handler` under its own routing key on start.
    pub fn with_handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Frontend catalogue replica.
    pub fn book(broker: Arc<dyn Broker>, repos: &Repositories) -> Self {
        Self::new("book", broker)
            .with_handler(Arc::new(BooksCreatedHandler::new(repos.books.clone())))
            .with_handler(Arc::new(BookDeletedHandler::new(repos.books.clone())))
    }

    /// Admin user directory.
    pub fn user(broker: Arc<dyn Broker>, repos: &Repositories, clock: Arc<dyn Clock>) -> Self {
        Self::new("user", broker).with_handler(Arc::new(UserCreatedHandler::new(repos.users.clone(), clock)))
    }

    /// Admin loan ledger.
    pub fn borrow(broker: Arc<dyn Broker>, repos: &Repositories, clock: Arc<dyn Clock>) -> Self {
        Self::new("borrow", broker).with_handler(Arc::new(BookBorrowedHandler::new(
            repos.books.clone(),
            repos.users.clone(),
            repos.borrows.clone(),
            clock,
        )))
    }

    /// The services a node running as `role` needs.
    ///
    /// `broker` is invoked once per service so each owns its own client.
    pub fn for_role<F>(role: ServiceRole, repos: &Repositories, clock: Arc<dyn Clock>, mut broker: F) -> Vec<Self>
    where
        F: FnMut() -> Arc<dyn Broker>,
    {
        match role {
            ServiceRole::Frontend => vec![Self::book(broker(), repos)],
            ServiceRole::Admin => vec![
                Self::user(broker(), repos, clock.clone()),
                Self::borrow(broker(), repos, clock),
            ],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn routing_keys(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.kind().routing_key()).collect()
    }

    pub async fn state(&self) -> SyncState {
        *self.state.lock().await
    }

    /// Connect and subscribe every handler. No-op when already started.
    ///
    /// If a subscription fails the broker is closed again and the service
    /// stays `Created`, so start can be retried.
    pub async fn start(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        match *state {
            SyncState::Started => return Ok(()),
            SyncState::Stopped => return Err(SyncError::Stopped(self.name)),
            SyncState::Created => {}
        }

        if let Err(err) = self.subscribe_all().await {
            warn!(service = self.name, error = %err, "synchronization service failed to start");
            if let Err(close_err) = self.broker.close().await {
                warn!(service = self.name, error = %close_err, "broker close after failed start");
            }
            return Err(err.into());
        }

        *state = SyncState::Started;
        info!(service = self.name, routing_keys = ?self.routing_keys(), "synchronization service started");
        Ok(())
    }

    async fn subscribe_all(&self) -> Result<(), BrokerError> {
        self.broker.connect().await?;
        for handler in &self.handlers {
            self.broker
                .subscribe(handler.kind().routing_key(), Arc::clone(handler))
                .await?;
        }
        Ok(())
    }

    /// Close the broker if open. Safe to call in any state.
    pub async fn stop(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock().await;
        if *state == SyncState::Stopped {
            return Ok(());
        }

        if self.broker.is_connected() {
            self.broker.close().await?;
        }
        *state = SyncState::Stopped;
        info!(service = self.name, "synchronization service stopped");
        Ok(())
    }
}

impl core::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncService")
            .field("name", &self.name)
            .field("routing_keys", &self.routing_keys())
            .finish_non_exhaustive()
    }
}
