//! Message bus abstraction for ListingFlow.
//!
//! A [`MessageBus`] handle is one logical connection to a broker: it declares
//! topics, queues and bindings, publishes persistent messages, and opens
//! [`Consumer`]s. Delivery is at-least-once: a [`Delivery`] stays owned by
//! its consumer until [`Delivery::ack`] is called, and is handed out again
//! (flagged `redelivered`) if the consumer or its connection goes away first.
//!
//! Two brokers are provided:
//! - [`MemoryBroker`]: process-local, for tests and single-process runs
//! - [`SqlBus`]: durable, backed by a libSQL database file

mod memory;
mod sql;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use listingflow_shared::{BusConfig, Result, expand_home};

pub use memory::{MemoryBroker, MemoryBus};
pub use sql::SqlBus;

/// How a topic matches routing keys against bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    /// Binding keys may use `*` (one word) and `#` (zero or more words).
    Topic,
    /// Binding keys match routing keys exactly.
    Direct,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Topic => "topic",
            TopicKind::Direct => "direct",
        }
    }

    pub(crate) fn parse(s: &str) -> Option<Self> {
        match s {
            "topic" => Some(TopicKind::Topic),
            "direct" => Some(TopicKind::Direct),
            _ => None,
        }
    }
}

/// Whether a message published with `routing_key` reaches a queue bound
/// with `binding_key`.
pub fn routing_matches(kind: TopicKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        TopicKind::Direct => binding_key == routing_key,
        TopicKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_match(&pattern, &words)
        }
    }
}

fn topic_match(pattern: &[&str], words: &[&str]) -> bool {
    match (pattern.first(), words.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            // `#` swallows zero words, or one word and stays in place.
            topic_match(&pattern[1..], words)
                || (!words.is_empty() && topic_match(pattern, &words[1..]))
        }
        (Some(&"*"), Some(_)) => topic_match(&pattern[1..], &words[1..]),
        (Some(p), Some(w)) if p == w => topic_match(&pattern[1..], &words[1..]),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Deliveries
// ---------------------------------------------------------------------------

/// Settles deliveries on behalf of a broker.
#[async_trait]
pub(crate) trait Acknowledger: Send + Sync {
    async fn ack(&self, tag: u64) -> Result<()>;
}

/// One message handed to a consumer. Must be acknowledged explicitly.
pub struct Delivery {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
    tag: u64,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub(crate) fn new(
        body: Vec<u8>,
        routing_key: String,
        redelivered: bool,
        tag: u64,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            body,
            routing_key,
            redelivered,
            tag,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// True when this message was handed out before and never acknowledged.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    /// Mark the message done. Fails if the owning consumer or connection is
    /// already gone, in which case the broker will redeliver it.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack(self.tag).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("tag", &self.tag)
            .field("len", &self.body.len())
            .finish()
    }
}

/// A stream of deliveries from one queue.
#[async_trait]
pub trait Consumer: Send {
    /// Wait for the next delivery. `None` means the consumer has ended
    /// because its connection went away; open a new one after reconnecting.
    async fn next(&mut self) -> Option<Delivery>;
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

/// A connection to a broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// (Re)establish the connection. Messages this handle left unacknowledged
    /// on a previous connection become ready again.
    async fn connect(&self) -> Result<()>;

    /// Drop the connection. Open consumers end; their unacknowledged
    /// deliveries are requeued as redelivered.
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Idempotent. Redeclaring a topic with a different kind is an error.
    async fn declare_topic(&self, name: &str, kind: TopicKind) -> Result<()>;

    /// Idempotent. Queues are durable.
    async fn declare_queue(&self, name: &str) -> Result<()>;

    /// Idempotent. Both the queue and the topic must already be declared.
    async fn bind(&self, queue: &str, topic: &str, binding_key: &str) -> Result<()>;

    /// Persist `body` into every queue bound to `topic` whose binding key
    /// matches `routing_key`. Publishing to an undeclared topic is an error.
    async fn publish(&self, topic: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>>;
}

// ---------------------------------------------------------------------------
// Provider
// ---------------------------------------------------------------------------

/// Hands out one bus handle per worker for the configured broker.
#[derive(Clone)]
pub enum BusProvider {
    Memory(MemoryBroker),
    Sql {
        path: PathBuf,
        poll_interval: Duration,
        lease_ttl: Duration,
    },
}

impl BusProvider {
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        if config.is_memory() {
            return Ok(Self::Memory(MemoryBroker::new()));
        }
        Ok(Self::Sql {
            path: expand_home(&config.address)?,
            poll_interval: config.poll_interval(),
            lease_ttl: config.lease_ttl(),
        })
    }

    /// Release deliveries whose claim expired, e.g. those held by a process
    /// that died. Live consumers keep their claims, so this is safe while
    /// other workers share the broker.
    pub async fn recover(&self) -> Result<u64> {
        match self {
            Self::Memory(_) => Ok(0),
            Self::Sql {
                path,
                poll_interval,
                lease_ttl,
            } => {
                SqlBus::open(path, *poll_interval, *lease_ttl)
                    .await?
                    .release_expired()
                    .await
            }
        }
    }

    /// A new, not yet connected handle.
    pub async fn handle(&self) -> Result<Arc<dyn MessageBus>> {
        match self {
            Self::Memory(broker) => Ok(Arc::new(broker.handle())),
            Self::Sql {
                path,
                poll_interval,
                lease_ttl,
            } => Ok(Arc::new(SqlBus::open(path, *poll_interval, *lease_ttl).await?)),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Memory(_) => listingflow_shared::MEMORY_BUS_ADDRESS.to_string(),
            Self::Sql { path, .. } => path.display().to_string(),
        }
    }
}
