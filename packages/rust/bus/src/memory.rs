//! Process-local broker.
//!
//! [`MemoryBroker`] owns the topics, queues and messages; each
//! [`MemoryBus`] handed out by [`MemoryBroker::handle`] is an independent
//! connection to it. Declarations live in the broker and survive
//! disconnects, like a real broker's durable entities.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use listingflow_shared::{ListingFlowError, Result};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::{Acknowledger, Consumer, Delivery, MessageBus, TopicKind, routing_matches};

#[derive(Clone)]
struct Message {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Owner {
    connection: u64,
    consumer: u64,
}

struct Unacked {
    owner: Owner,
    message: Message,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Unacked>,
    notify: Arc<Notify>,
}

struct Binding {
    queue: String,
    topic: String,
    key: String,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
    next_id: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Move unacked messages whose owner matches back to the head of their
    /// queue, flagged redelivered, keeping their original order.
    fn requeue(&mut self, mut owned: impl FnMut(&Owner) -> bool) -> usize {
        let mut total = 0;
        for queue in self.queues.values_mut() {
            let mut tags: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, entry)| owned(&entry.owner))
                .map(|(tag, _)| *tag)
                .collect();
            if tags.is_empty() {
                continue;
            }
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in &tags {
                if let Some(entry) = queue.unacked.remove(tag) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            total += tags.len();
            queue.notify.notify_one();
        }
        total
    }
}

fn lock(state: &Mutex<BrokerState>) -> MutexGuard<'_, BrokerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

/// Shared in-process broker state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new connection handle. Call [`MessageBus::connect`] before use.
    pub fn handle(&self) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
            connection: Mutex::new(None),
        }
    }

    /// Messages waiting in `queue`, not yet handed to a consumer.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages handed out from `queue` and not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

struct Connection {
    id: u64,
    closed: CancellationToken,
}

/// One connection to a [`MemoryBroker`].
pub struct MemoryBus {
    broker: MemoryBroker,
    connection: Mutex<Option<Connection>>,
}

impl MemoryBus {
    fn current(&self) -> Result<(u64, CancellationToken)> {
        let guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|c| (c.id, c.closed.clone()))
            .ok_or_else(|| ListingFlowError::Bus("not connected".into()))
    }

    fn close(&self) -> usize {
        let taken = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(conn) = taken else {
            return 0;
        };
        conn.closed.cancel();
        lock(&self.broker.state).requeue(|owner| owner.connection == conn.id)
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn connect(&self) -> Result<()> {
        let mut guard = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let id = lock(&self.broker.state).next_id();
            *guard = Some(Connection {
                id,
                closed: CancellationToken::new(),
            });
            tracing::debug!(connection = id, "memory bus connected");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let requeued = self.close();
        tracing::debug!(requeued, "memory bus disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    async fn declare_topic(&self, name: &str, kind: TopicKind) -> Result<()> {
        self.current()?;
        let mut state = lock(&self.broker.state);
        match state.topics.get(name) {
            Some(existing) if *existing != kind => Err(ListingFlowError::Bus(format!(
                "topic '{name}' already declared as {}",
                existing.as_str()
            ))),
            Some(_) => Ok(()),
            None => {
                state.topics.insert(name.to_string(), kind);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.current()?;
        lock(&self.broker.state)
            .queues
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn bind(&self, queue: &str, topic: &str, binding_key: &str) -> Result<()> {
        self.current()?;
        let mut state = lock(&self.broker.state);
        if !state.topics.contains_key(topic) {
            return Err(ListingFlowError::Bus(format!("topic '{topic}' is not declared")));
        }
        if !state.queues.contains_key(queue) {
            return Err(ListingFlowError::Bus(format!("queue '{queue}' is not declared")));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.topic == topic && b.key == binding_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                topic: topic.to_string(),
                key: binding_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.current()?;
        let mut guard = lock(&self.broker.state);
        let state = &mut *guard;
        let Some(kind) = state.topics.get(topic).copied() else {
            return Err(ListingFlowError::Bus(format!("topic '{topic}' is not declared")));
        };

        let targets: BTreeSet<&str> = state
            .bindings
            .iter()
            .filter(|b| b.topic == topic && routing_matches(kind, &b.key, routing_key))
            .map(|b| b.queue.as_str())
            .collect();

        for name in targets {
            if let Some(queue) = state.queues.get_mut(name) {
                queue.ready.push_back(Message {
                    body: body.to_vec(),
                    routing_key: routing_key.to_string(),
                    redelivered: false,
                });
                queue.notify.notify_one();
            }
        }
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>> {
        let (connection, closed) = self.current()?;
        let mut state = lock(&self.broker.state);
        let Some(notify) = state.queues.get(queue).map(|q| q.notify.clone()) else {
            return Err(ListingFlowError::Bus(format!("queue '{queue}' is not declared")));
        };
        let owner = Owner {
            connection,
            consumer: state.next_id(),
        };
        drop(state);

        Ok(Box::new(MemoryConsumer {
            broker: self.broker.clone(),
            queue: queue.to_string(),
            owner,
            closed,
            notify,
            acker: Arc::new(MemoryAcker {
                state: self.broker.state.clone(),
                queue: queue.to_string(),
                owner,
            }),
        }))
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

struct MemoryConsumer {
    broker: MemoryBroker,
    queue: String,
    owner: Owner,
    closed: CancellationToken,
    notify: Arc<Notify>,
    acker: Arc<MemoryAcker>,
}

impl MemoryConsumer {
    fn take(&self) -> Option<(u64, Message)> {
        let mut guard = lock(&self.broker.state);
        let state = &mut *guard;
        let queue = state.queues.get_mut(&self.queue)?;
        let message = queue.ready.pop_front()?;
        state.next_tag += 1;
        let tag = state.next_tag;
        queue.unacked.insert(
            tag,
            Unacked {
                owner: self.owner,
                message: message.clone(),
            },
        );
        // Pass the wakeup on so another consumer of this queue sees the rest.
        if !queue.ready.is_empty() {
            queue.notify.notify_one();
        }
        Some((tag, message))
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            if let Some((tag, message)) = self.take() {
                return Some(Delivery::new(
                    message.body,
                    message.routing_key,
                    message.redelivered,
                    tag,
                    self.acker.clone(),
                ));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.closed.cancelled() => return None,
            }
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        let consumer = self.owner.consumer;
        lock(&self.broker.state).requeue(|owner| owner.consumer == consumer);
    }
}

struct MemoryAcker {
    state: Arc<Mutex<BrokerState>>,
    queue: String,
    owner: Owner,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, tag: u64) -> Result<()> {
        let mut state = lock(&self.state);
        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| ListingFlowError::Bus(format!("queue '{}' is gone", self.queue)))?;
        match queue.unacked.get(&tag) {
            Some(entry) if entry.owner == self.owner => {
                queue.unacked.remove(&tag);
                Ok(())
            }
            _ => Err(ListingFlowError::Bus(format!(
                "unknown delivery tag {tag} on '{}': consumer closed",
                self.queue
            ))),
        }
    }
}
