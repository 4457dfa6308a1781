//! In-memory broker for tests/dev.
//!
//! Models a topic exchange with durable queues:
//! - queues and bindings outlive client connections, so messages published
//!   while no consumer is attached wait in the queue
//! - one consumer task per queue, messages handled strictly in order
//! - several clients (one per synchronization service) can share one exchange
//!   via [`InMemoryBroker::client`], each with its own connection lifecycle

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use crate::broker::{Broker, BrokerError};
use crate::envelope::EventEnvelope;
use crate::event::queue_name_for;
use crate::handler::{dispatch, undecodable, DeadLetter, Disposition, FailurePolicy, MessageHandler};

const DEFAULT_EXCHANGE: &str = "library_events";

#[derive(Debug)]
struct Queue {
    messages: VecDeque<(String, Vec<u8>)>,
    notify: Arc<Notify>,
    consuming: bool,
}

impl Queue {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            consuming: false,
        }
    }
}

#[derive(Debug, Default)]
struct ExchangeState {
    queues: HashMap<String, Queue>,
    /// routing key -> bound queue names
    bindings: HashMap<String, Vec<String>>,
    published: Vec<EventEnvelope>,
    dead_letters: Vec<DeadLetter>,
    acked: usize,
    in_flight: usize,
}

#[derive(Debug)]
struct Shared {
    exchange: String,
    policy: FailurePolicy,
    reachable: AtomicBool,
    state: Mutex<ExchangeState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ExchangeState> {
        // A panicking handler must not wedge the whole exchange.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
struct Session {
    shutdown: watch::Sender<bool>,
    consumers: Vec<JoinHandle<()>>,
}

#[derive(Debug, Default)]
struct Connection {
    session: Option<Session>,
    connect_count: usize,
}

/// In-memory topic-exchange broker.
#[derive(Debug)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
    conn: Mutex<Connection>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_policy(FailurePolicy::default())
    }

    pub fn with_policy(policy: FailurePolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                exchange: DEFAULT_EXCHANGE.to_string(),
                policy,
                reachable: AtomicBool::new(true),
                state: Mutex::new(ExchangeState::default()),
            }),
            conn: Mutex::new(Connection::default()),
        }
    }

    /// A new, unconnected client on the same exchange.
    pub fn client(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            conn: Mutex::new(Connection::default()),
        }
    }

    /// Simulate a network partition (affects every client of the exchange).
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn exchange(&self) -> &str {
        &self.shared.exchange
    }

    /// How many times this client actually established a connection.
    pub fn connect_count(&self) -> usize {
        self.conn().connect_count
    }

    pub fn published(&self) -> Vec<EventEnvelope> {
        self.shared.lock().published.clone()
    }

    pub fn published_for(&self, routing_key: &str) -> Vec<EventEnvelope> {
        self.shared
            .lock()
            .published
            .iter()
            .filter(|e| e.routing_key() == routing_key)
            .cloned()
            .collect()
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.lock().dead_letters.clone()
    }

    /// Messages acknowledged across all queues.
    pub fn acked(&self) -> usize {
        self.shared.lock().acked
    }

    /// Messages waiting in a queue (not yet handed to its consumer).
    pub fn pending(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    /// Wait until every consumed queue is drained and nothing is in flight.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let st = self.shared.lock();
                let drained = st
                    .queues
                    .values()
                    .filter(|q| q.consuming)
                    .all(|q| q.messages.is_empty());
                if drained && st.in_flight == 0 {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if !self.shared.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unreachable {
                url: format!("memory://{}", self.shared.exchange),
                reason: "partitioned".to_string(),
            });
        }

        let mut conn = self.conn();
        if conn.session.is_some() {
            return Ok(());
        }
        let (shutdown, _) = watch::channel(false);
        conn.session = Some(Session {
            shutdown,
            consumers: Vec::new(),
        });
        conn.connect_count += 1;
        debug!(exchange = %self.shared.exchange, "in-memory broker connected");
        Ok(())
    }

    #[instrument(skip(self, payload), fields(exchange = %self.shared.exchange), err)]
    async fn publish(&self, routing_key: &str, payload: JsonValue) -> Result<(), BrokerError> {
        self.connect().await?;

        let envelope = EventEnvelope::new(routing_key, payload);
        let body = envelope
            .to_body()
            .map_err(|e| BrokerError::Serialization(e.to_string()))?;

        let mut st = self.shared.lock();
        st.published.push(envelope);

        let targets = st.bindings.get(routing_key).cloned().unwrap_or_default();
        for name in targets {
            if let Some(queue) = st.queues.get_mut(&name) {
                queue.messages.push_back((routing_key.to_string(), body.clone()));
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        routing_key: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        self.connect().await?;

        let queue_name = queue_name_for(routing_key);
        let mut conn = self.conn();
        let session = conn.session.as_mut().ok_or(BrokerError::Closed)?;

        let notify = {
            let mut st = self.shared.lock();
            let queue = st.queues.entry(queue_name.clone()).or_insert_with(Queue::new);
            if queue.consuming {
                return Err(BrokerError::Subscribe {
                    routing_key: routing_key.to_string(),
                    reason: format!("queue {queue_name} already has a consumer"),
                });
            }
            queue.consuming = true;
            let notify = Arc::clone(&queue.notify);

            let bound = st.bindings.entry(routing_key.to_string()).or_default();
            if !bound.contains(&queue_name) {
                bound.push(queue_name.clone());
            }
            notify
        };

        info!(routing_key, queue = %queue_name, "consumer attached");

        let task = tokio::spawn(consume(
            Arc::clone(&self.shared),
            queue_name,
            notify,
            handler,
            session.shutdown.subscribe(),
        ));
        session.consumers.push(task);
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let session = self.conn().session.take();
        if let Some(session) = session {
            let _ = session.shutdown.send(true);
            for task in session.consumers {
                let _ = task.await;
            }
            debug!(exchange = %self.shared.exchange, "in-memory broker closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.conn().session.is_some()
    }
}

/// Accounts for one message taken off `queue`.
///
/// Dropped after the disposition is recorded on the normal path. If the
/// handler panics, the unwind drops it instead: the message is dead-lettered
/// (under that policy), in-flight accounting is settled and the queue is
/// released so another consumer can attach.
struct InFlight<'a> {
    shared: &'a Shared,
    queue: &'a str,
    routing_key: &'a str,
    body: &'a [u8],
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut st = self.shared.lock();
        st.in_flight -= 1;
        if !std::thread::panicking() {
            return;
        }

        error!(queue = self.queue, routing_key = self.routing_key, "message handler panicked");
        if self.shared.policy == FailurePolicy::DeadLetter {
            st.dead_letters
                .push(DeadLetter::new(self.queue, self.routing_key, self.body, "handler panicked"));
        }
        st.acked += 1;
        if let Some(q) = st.queues.get_mut(self.queue) {
            q.consuming = false;
        }
    }
}

async fn consume(
    shared: Arc<Shared>,
    queue: String,
    notify: Arc<Notify>,
    handler: Arc<dyn MessageHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = {
            let mut st = shared.lock();
            let next = st.queues.get_mut(&queue).and_then(|q| q.messages.pop_front());
            if next.is_some() {
                st.in_flight += 1;
            }
            next
        };

        match next {
            Some((routing_key, body)) => {
                let _in_flight = InFlight {
                    shared: &shared,
                    queue: &queue,
                    routing_key: &routing_key,
                    body: &body,
                };
                let disposition = match EventEnvelope::from_body(&routing_key, &body) {
                    Ok(envelope) => {
                        dispatch(&queue, &envelope, &body, handler.as_ref(), shared.policy).await
                    }
                    Err(e) => undecodable(&queue, &routing_key, &body, e, shared.policy),
                };

                let mut st = shared.lock();
                if let Disposition::DeadLettered(dead) = disposition {
                    st.dead_letters.push(dead);
                }
                st.acked += 1;
            }
            None => {
                tokio::select! {
                    _ = notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    if let Some(q) = shared.lock().queues.get_mut(&queue) {
        q.consuming = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use crate::handler::HandlerError;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<JsonValue>>,
        fail_on: Option<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        fn kind(&self) -> EventKind {
            EventKind::BookDeleted
        }

        async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(bad) = self.fail_on {
                if envelope.data()["isbn"] == bad {
                    return Err(HandlerError::Conflict("boom".into()));
                }
            }
            self.seen.lock().unwrap().push(envelope.data().clone());
            Ok(())
        }
    }

    const IDLE: Duration = Duration::from_secs(2);

    #[tokio::test]
    async fn connect_is_idempotent() {
        let broker = InMemoryBroker::new();
        broker.connect().await.unwrap();
        broker.connect().await.unwrap();
        assert_eq!(broker.connect_count(), 1);
        assert!(broker.is_connected());
    }

    #[tokio::test]
    async fn publish_connects_lazily() {
        let broker = InMemoryBroker::new();
        broker.publish("book.deleted", json!({"isbn": "1"})).await.unwrap();
        assert!(broker.is_connected());
        assert_eq!(broker.published_for("book.deleted").len(), 1);
    }

    #[tokio::test]
    async fn unreachable_broker_surfaces_transport_error() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let err = broker.publish("book.deleted", json!({})).await.unwrap_err();
        assert!(matches!(err, BrokerError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", handler.clone()).await.unwrap();

        for isbn in ["1", "2", "3"] {
            broker.publish("book.deleted", json!({"isbn": isbn})).await.unwrap();
        }

        assert!(broker.wait_idle(IDLE).await);
        let seen = handler.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![json!({"isbn": "1"}), json!({"isbn": "2"}), json!({"isbn": "3"})]);
        assert_eq!(broker.acked(), 3);
    }

    #[tokio::test]
    async fn unbound_routing_keys_are_not_delivered() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", handler.clone()).await.unwrap();

        broker.publish("books.created", json!([])).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_message_is_dead_lettered_and_queue_keeps_going() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(Recorder {
            fail_on: Some("bad"),
            ..Default::default()
        });
        broker.subscribe("book.deleted", handler.clone()).await.unwrap();

        broker.publish("book.deleted", json!({"isbn": "bad"})).await.unwrap();
        broker.publish("book.deleted", json!({"isbn": "good"})).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].queue, "book.deleted_queue");
        assert_eq!(handler.seen.lock().unwrap().clone(), vec![json!({"isbn": "good"})]);
        assert_eq!(broker.acked(), 2);
    }

    #[tokio::test]
    async fn acknowledge_policy_loses_failed_message() {
        let broker = InMemoryBroker::with_policy(FailurePolicy::Acknowledge);
        let handler = Arc::new(Recorder {
            fail_on: Some("bad"),
            ..Default::default()
        });
        broker.subscribe("book.deleted", handler).await.unwrap();

        broker.publish("book.deleted", json!({"isbn": "bad"})).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        assert!(broker.dead_letters().is_empty());
        assert_eq!(broker.acked(), 1);
    }

    #[tokio::test]
    async fn durable_queue_keeps_backlog_while_consumer_is_offline() {
        let broker = InMemoryBroker::new();
        let first = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", first.clone()).await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());

        let producer = broker.client();
        producer.publish("book.deleted", json!({"isbn": "while-offline"})).await.unwrap();
        assert_eq!(broker.pending("book.deleted_queue"), 1);

        let second = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", second.clone()).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        assert_eq!(first.calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.seen.lock().unwrap().clone(), vec![json!({"isbn": "while-offline"})]);
    }

    #[tokio::test]
    async fn second_consumer_on_same_queue_is_rejected() {
        let broker = InMemoryBroker::new();
        broker.subscribe("book.deleted", Arc::new(Recorder::default())).await.unwrap();
        let err = broker
            .client()
            .subscribe("book.deleted", Arc::new(Recorder::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Subscribe { .. }));
    }

    #[tokio::test]
    async fn close_is_safe_twice() {
        let broker = InMemoryBroker::new();
        broker.close().await.unwrap();
        broker.connect().await.unwrap();
        broker.close().await.unwrap();
        broker.close().await.unwrap();
        assert!(!broker.is_connected());
    }

    struct Panicking;

    #[async_trait]
    impl MessageHandler for Panicking {
        fn kind(&self) -> EventKind {
            EventKind::BookDeleted
        }

        async fn handle(&self, _envelope: &EventEnvelope) -> Result<(), HandlerError> {
            panic!("handler bug");
        }
    }

    #[tokio::test]
    async fn panicking_handler_releases_its_queue() {
        let broker = InMemoryBroker::new();
        broker.subscribe("book.deleted", Arc::new(Panicking)).await.unwrap();

        broker.publish("book.deleted", json!({"isbn": "1"})).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].error, "handler panicked");
        assert_eq!(broker.acked(), 1);

        let replacement = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", replacement.clone()).await.unwrap();
        broker.publish("book.deleted", json!({"isbn": "2"})).await.unwrap();

        assert!(broker.wait_idle(IDLE).await);
        assert_eq!(replacement.seen.lock().unwrap().clone(), vec![json!({"isbn": "2"})]);
        broker.close().await.unwrap();
    }

    #[tokio::test]
    async fn garbage_body_is_dead_lettered() {
        let broker = InMemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        broker.subscribe("book.deleted", handler.clone()).await.unwrap();

        {
            let mut st = broker.shared.lock();
            let q = st.queues.get_mut("book.deleted_queue").unwrap();
            q.messages.push_back(("book.deleted".into(), b"not json".to_vec()));
            q.notify.notify_one();
        }

        assert!(broker.wait_idle(IDLE).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(broker.dead_letters().len(), 1);
    }
}
