//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! This implementation maps the topic-exchange model onto Redis Streams:
//! - **Exchange**: one stream per routing key, `<exchange>:<routing_key>`
//! - **Durable queue**: a consumer group `<routing_key>_queue` on that stream,
//!   created with `MKSTREAM` from id `0`, so a backlog written while no
//!   consumer was running is picked up on start
//! - **At-least-once**: a consumer first re-reads its own pending (delivered
//!   but unacknowledged) entries, then blocks for new ones; `XACK` happens only
//!   after the handler's disposition is known
//! - **Dead-letter queue**: `<exchange>:<queue>:dlq`
//!
//! ## Architecture
//!
//! - Publishing uses one multiplexed `ConnectionManager`.
//! - Every subscription gets its own connection, since `XREADGROUP ... BLOCK`
//!   would otherwise stall publishes sharing the multiplexed one.
//! - Read failures are retried per the configured [`ReconnectPolicy`];
//!   `ConnectionManager` re-dials underneath.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use shelfsync_events::{
    dispatch, queue_name_for, undecodable, Broker, BrokerError, DeadLetter, Disposition, EventEnvelope,
    ExponentialBackoff, FailurePolicy, MessageHandler, ReconnectPolicy,
};

use crate::config::{ReplicationConfig, DEFAULT_EXCHANGE};

/// Stream entry field holding the envelope body.
const BODY_FIELD: &str = "body";

/// Entries fetched per read.
const READ_COUNT: usize = 10;

/// Stream carrying one routing key.
pub fn stream_key(exchange: &str, routing_key: &str) -> String {
    format!("{exchange}:{routing_key}")
}

/// Dead-letter stream for one queue.
pub fn dlq_key(exchange: &str, queue: &str) -> String {
    format!("{exchange}:{queue}:dlq")
}

/// Stable per-queue consumer name, so a restarted process reclaims its own
/// pending entries.
fn consumer_name(queue: &str) -> String {
    format!("{queue}-consumer")
}

struct Session {
    publisher: ConnectionManager,
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
    queues: HashSet<String>,
}

pub struct RedisStreamsBroker {
    client: redis::Client,
    url: String,
    exchange: String,
    policy: FailurePolicy,
    block: Duration,
    reconnect: Arc<dyn ReconnectPolicy>,
    session: Mutex<Option<Session>>,
    connected: AtomicBool,
}

impl RedisStreamsBroker {
    /// Create a broker client. No connection is made until first use.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `exchange` - stream key prefix (default: "library_events")
    pub fn new(redis_url: impl Into<String>, exchange: Option<String>) -> Result<Self, BrokerError> {
        let url = redis_url.into();
        let client = redis::Client::open(url.as_str()).map_err(|e| BrokerError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            url,
            exchange: exchange.unwrap_or_else(|| DEFAULT_EXCHANGE.to_string()),
            policy: FailurePolicy::default(),
            block: Duration::from_millis(1000),
            reconnect: Arc::new(ExponentialBackoff::default()),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &ReplicationConfig) -> Result<Self, BrokerError> {
        Ok(Self::new(config.broker_url.clone(), Some(config.exchange.clone()))?
            .with_failure_policy(config.failure_policy)
            .with_block(config.consumer_block)
            .with_reconnect_policy(config.reconnect_policy()))
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect = policy;
        self
    }

    /// A fresh, unconnected client on the same server and exchange.
    pub fn client(&self) -> Self {
        Self {
            client: self.client.clone(),
            url: self.url.clone(),
            exchange: self.exchange.clone(),
            policy: self.policy,
            block: self.block,
            reconnect: Arc::clone(&self.reconnect),
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    async fn dial(&self) -> Result<ConnectionManager, BrokerError> {
        ConnectionManager::new(self.client.clone())
            .await
            .map_err(|e| BrokerError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream if needed; starting at `0` means entries
    /// already in the stream are delivered too.
    async fn ensure_consumer_group(
        conn: &mut ConnectionManager,
        stream: &str,
        group: &str,
    ) -> Result<(), redis::RedisError> {
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return Ok(());
        }

        let publisher = self.dial().await?;
        let (shutdown, _) = watch::channel(false);
        *session = Some(Session {
            publisher,
            shutdown,
            consumers: Vec::new(),
            queues: HashSet::new(),
        });
        self.connected.store(true, Ordering::SeqCst);
        info!(exchange = %self.exchange, "connected to redis broker");
        Ok(())
    }

    #[instrument(skip(self, payload), fields(exchange = %self.exchange), err)]
    async fn publish(&self, routing_key: &str, payload: JsonValue) -> Result<(), BrokerError> {
        self.connect().await?;

        let envelope = EventEnvelope::new(routing_key, payload);
        let body = envelope
            .to_body()
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let mut conn = {
            let session = self.session.lock().await;
            session.as_ref().map(|s| s.publisher.clone()).ok_or(BrokerError::Closed)?
        };

        let _: String = conn
            .xadd(stream_key(&self.exchange, routing_key), "*", &[(BODY_FIELD, body)])
            .await
            .map_err(|e| BrokerError::Publish {
                routing_key: routing_key.to_string(),
                reason: format!("XADD failed: {e}"),
            })?;
        Ok(())
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        self.connect().await?;

        let queue = queue_name_for(routing_key);
        let stream = stream_key(&self.exchange, routing_key);
        let subscribe_err = |reason: String| BrokerError::Subscribe {
            routing_key: routing_key.to_string(),
            reason,
        };

        let mut session = self.session.lock().await;
        let session = session.as_mut().ok_or(BrokerError::Closed)?;
        if session.queues.contains(&queue) {
            return Err(subscribe_err(format!("queue {queue} already has a consumer")));
        }

        let mut conn = self.dial().await?;
        Self::ensure_consumer_group(&mut conn, &stream, &queue)
            .await
            .map_err(|e| subscribe_err(format!("XGROUP CREATE failed: {e}")))?;

        let consumer = StreamConsumer {
            conn,
            stream,
            dlq: dlq_key(&self.exchange, &queue),
            consumer: consumer_name(&queue),
            queue: queue.clone(),
            routing_key: routing_key.to_string(),
            handler,
            policy: self.policy,
            block: self.block,
            reconnect: Arc::clone(&self.reconnect),
        };
        info!(routing_key, queue = %queue, "consumer attached");

        session.consumers.push(tokio::spawn(consumer.run(session.shutdown.subscribe())));
        session.queues.insert(queue);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let session = self.session.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);

        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            for task in session.consumers {
                if let Err(e) = task.await {
                    warn!(error = %e, "consumer task ended abnormally");
                }
            }
            info!(exchange = %self.exchange, "redis broker closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl core::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("exchange", &self.exchange)
            .field("policy", &self.policy)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

/// One consumer group reader; processes entries strictly in stream order.
struct StreamConsumer {
    conn: ConnectionManager,
    stream: String,
    dlq: String,
    consumer: String,
    queue: String,
    routing_key: String,
    handler: Arc<dyn MessageHandler>,
    policy: FailurePolicy,
    block: Duration,
    reconnect: Arc<dyn ReconnectPolicy>,
}

impl StreamConsumer {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        // Own pending entries first (delivered before a crash, never acked).
        let mut cursor = "0";
        let mut failures = 0u32;

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = tokio::select! {
                read = self.read(cursor) => read,
                _ = shutdown.changed() => break,
            };

            let entries = match read {
                Ok(entries) => {
                    failures = 0;
                    entries
                }
                Err(e) => {
                    failures += 1;
                    match self.reconnect.next_delay(failures) {
                        Some(delay) => {
                            warn!(queue = %self.queue, attempt = failures, error = %e, "stream read failed, retrying");
                            let stopping = tokio::select! {
                                _ = tokio::time::sleep(delay) => false,
                                _ = shutdown.changed() => true,
                            };
                            if stopping {
                                break;
                            }
                            continue;
                        }
                        None => {
                            error!(queue = %self.queue, error = %e, "stream read failed, consumer giving up");
                            break;
                        }
                    }
                }
            };

            if cursor == "0" && entries.is_empty() {
                cursor = ">";
                continue;
            }

            for entry in entries {
                self.process(entry).await;
            }
        }

        debug!(queue = %self.queue, "consumer stopped");
    }

    async fn read(&mut self, cursor: &str) -> redis::RedisResult<Vec<StreamId>> {
        let mut opts = StreamReadOptions::default()
            .group(&self.queue, &self.consumer)
            .count(READ_COUNT);
        if cursor == ">" {
            opts = opts.block(self.block.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[self.stream.as_str()], &[cursor], &opts)
            .await?;

        Ok(reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
            .unwrap_or_default())
    }

    async fn process(&mut self, entry: StreamId) {
        // Pending entries trimmed from the stream come back without fields.
        let Some(body) = entry.get::<Vec<u8>>(BODY_FIELD) else {
            warn!(queue = %self.queue, id = %entry.id, "stream entry without body, acknowledging");
            self.ack(&entry.id).await;
            return;
        };

        let disposition = match EventEnvelope::from_body(self.routing_key.as_str(), &body) {
            Ok(envelope) => dispatch(&self.queue, &envelope, &body, self.handler.as_ref(), self.policy).await,
            Err(e) => undecodable(&self.queue, &self.routing_key, &body, e, self.policy),
        };

        if let Disposition::DeadLettered(dead) = disposition {
            self.dead_letter(&entry.id, &dead).await;
        }
        self.ack(&entry.id).await;
    }

    async fn dead_letter(&mut self, id: &str, dead: &DeadLetter) {
        let failed_at = dead.failed_at.to_rfc3339();
        let dead_letter_id = dead.id.to_string();
        let fields: [(&str, &str); 7] = [
            ("dead_letter_id", &dead_letter_id),
            ("original_message_id", id),
            ("queue", &dead.queue),
            ("routing_key", &dead.routing_key),
            ("error", &dead.error),
            ("failed_at", &failed_at),
            (BODY_FIELD, &dead.body),
        ];

        let written: redis::RedisResult<String> = self.conn.xadd(&self.dlq, "*", &fields).await;
        match written {
            Ok(_) => warn!(queue = %self.queue, message_id = %id, dlq = %self.dlq, "message sent to dead-letter queue"),
            Err(e) => error!(queue = %self.queue, message_id = %id, error = %e, "failed to write dead letter"),
        }
    }

    async fn ack(&mut self, id: &str) {
        let acked: redis::RedisResult<i64> = self.conn.xack(&self.stream, &self.queue, &[id]).await;
        if let Err(e) = acked {
            // Stays pending; re-read on the next start.
            error!(queue = %self.queue, message_id = %id, error = %e, "XACK failed");
        }
    }
}
