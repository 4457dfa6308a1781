use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::{info, warn};

use shelfsync_core::{Clock, SystemClock};
use shelfsync_events::{connect_with_retry, Broker, InMemoryBroker, ReconnectPolicy, ServiceRole};
use shelfsync_infra::{CatalogService, CirculationService, EventPublisher, ReplicationConfig, Repositories, SyncService};

#[cfg(feature = "redis")]
use shelfsync_infra::event_bus::RedisStreamsBroker;

/// Broker URLs with this prefix run an in-process exchange. Events never
/// leave the process, which is only useful for local smoke runs.
pub const MEMORY_SCHEME: &str = "memory://";

enum Transport {
    Memory(InMemoryBroker),
    #[cfg(feature = "redis")]
    Redis(RedisStreamsBroker),
}

impl Transport {
    fn open(config: &ReplicationConfig) -> anyhow::Result<Self> {
        if config.broker_url.starts_with(MEMORY_SCHEME) {
            warn!(url = %config.broker_url, "using in-process broker, nothing is replicated to the peer");
            return Ok(Transport::Memory(InMemoryBroker::with_policy(config.failure_policy)));
        }
        Self::open_remote(config)
    }

    #[cfg(feature = "redis")]
    fn open_remote(config: &ReplicationConfig) -> anyhow::Result<Self> {
        let broker = RedisStreamsBroker::from_config(config).context("configuring Redis Streams broker")?;
        Ok(Transport::Redis(broker))
    }

    #[cfg(not(feature = "redis"))]
    fn open_remote(config: &ReplicationConfig) -> anyhow::Result<Self> {
        anyhow::bail!("broker url {} needs the `redis` feature", config.broker_url)
    }

    /// One unconnected client per caller.
    fn client(&self) -> Arc<dyn Broker> {
        match self {
            Transport::Memory(exchange) => Arc::new(exchange.client()),
            #[cfg(feature = "redis")]
            Transport::Redis(broker) => Arc::new(broker.client()),
        }
    }
}

/// What local mutations a role may make; each one publishes its event.
pub enum Surface {
    /// Admin: catalogue entries and withdrawals.
    Catalog(CatalogService),
    /// Frontend: enrolment and lending.
    Circulation(CirculationService),
}

/// A running replica: its store, its sync services and its publishing surface.
pub struct Node {
    role: ServiceRole,
    repos: Repositories,
    services: Vec<SyncService>,
    clients: Vec<Arc<dyn Broker>>,
    publisher: Arc<dyn Broker>,
    surface: Surface,
    reconnect: Arc<dyn ReconnectPolicy>,
}

impl Node {
    pub async fn build(config: ReplicationConfig) -> anyhow::Result<Self> {
        let repos = repositories(&config).await?;
        Self::with_repositories(config, repos, Arc::new(SystemClock))
    }

    pub fn with_repositories(
        config: ReplicationConfig,
        repos: Repositories,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let transport = Transport::open(&config)?;

        let mut clients = Vec::new();
        let services = SyncService::for_role(config.role, &repos, clock.clone(), || {
            let client = transport.client();
            clients.push(Arc::clone(&client));
            client
        });

        let publisher = transport.client();
        let events = EventPublisher::new(Arc::clone(&publisher));
        let surface = match config.role {
            ServiceRole::Admin => Surface::Catalog(CatalogService::new(repos.books.clone(), events)),
            ServiceRole::Frontend => Surface::Circulation(CirculationService::new(
                repos.books.clone(),
                repos.users.clone(),
                clock,
                events,
            )),
        };

        Ok(Self {
            role: config.role,
            repos,
            services,
            clients,
            publisher,
            surface,
            reconnect: config.reconnect_policy(),
        })
    }

    pub fn role(&self) -> ServiceRole {
        self.role
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repos
    }

    pub fn services(&self) -> &[SyncService] {
        &self.services
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    /// Connect every client (retrying per policy), then start the services.
    pub async fn start(&self) -> anyhow::Result<()> {
        connect_with_retry(self.publisher.as_ref(), self.reconnect.as_ref())
            .await
            .context("connecting publisher")?;
        for client in &self.clients {
            connect_with_retry(client.as_ref(), self.reconnect.as_ref())
                .await
                .context("connecting synchronization client")?;
        }
        for service in &self.services {
            service
                .start()
                .await
                .with_context(|| format!("starting {} synchronization", service.name()))?;
        }
        info!(role = %self.role, services = self.services.len(), "node started");
        Ok(())
    }

    /// Stop every service and the publisher. Keeps going past failures and
    /// reports the first one.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let mut first_error: Option<anyhow::Error> = None;

        for service in &self.services {
            if let Err(err) = service.stop().await {
                warn!(service = service.name(), error = %err, "stop failed");
                first_error.get_or_insert(err.into());
            }
        }
        if self.publisher.is_connected() {
            if let Err(err) = self.publisher.close().await {
                warn!(error = %err, "publisher close failed");
                first_error.get_or_insert(err.into());
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                info!(role = %self.role, "node stopped");
                Ok(())
            }
        }
    }
}

async fn repositories(config: &ReplicationConfig) -> anyhow::Result<Repositories> {
    match &config.database_url {
        Some(url) => {
            let pool = PgPool::connect(url).await.context("connecting to Postgres")?;
            let repos = Repositories::postgres(pool).await.context("preparing Postgres schema")?;
            info!("using Postgres repositories");
            Ok(repos)
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory repositories");
            Ok(Repositories::in_memory(1))
        }
    }
}
