//! Durable broker backed by a libSQL database file.
//!
//! Every handle opened on the same file sees the same topics, queues and
//! messages, so workers in separate processes can share one broker. A
//! message row is `ready` until a consumer claims it, then `unacked` and
//! owned by that consumer's connection until acknowledged (deleted) or
//! released back to `ready` with `redelivered = 1`.
//!
//! A claim is a lease: it carries an expiry that the owning connection keeps
//! renewing while it is connected. A claim whose lease ran out (its process
//! died) can be taken by any other consumer, flagged as redelivered.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use libsql::{Connection, Database, TransactionBehavior, params};
use listingflow_shared::{ListingFlowError, Result};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{Acknowledger, Consumer, Delivery, MessageBus, TopicKind, routing_matches};

const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bus_topics (
    name TEXT PRIMARY KEY,
    kind TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS bus_queues (
    name       TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS bus_bindings (
    queue       TEXT NOT NULL REFERENCES bus_queues(name),
    topic       TEXT NOT NULL REFERENCES bus_topics(name),
    binding_key TEXT NOT NULL,
    PRIMARY KEY (queue, topic, binding_key)
);

CREATE TABLE IF NOT EXISTS bus_messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    queue        TEXT NOT NULL,
    routing_key  TEXT NOT NULL,
    body         BLOB NOT NULL,
    state        TEXT NOT NULL DEFAULT 'ready',
    owner        TEXT,
    redelivered  INTEGER NOT NULL DEFAULT 0,
    published_at TEXT NOT NULL,
    lease_expires_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_bus_messages_claim ON bus_messages(queue, state, id);
CREATE INDEX IF NOT EXISTS idx_bus_messages_owner ON bus_messages(owner);
"#;

fn bus_err(e: impl std::fmt::Display) -> ListingFlowError {
    ListingFlowError::Bus(e.to_string())
}

async fn connect_db(db: &Database) -> Result<Connection> {
    let conn = db.connect().map_err(bus_err)?;
    conn.query(&format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}"), ())
        .await
        .map_err(bus_err)?;
    Ok(conn)
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lease expiry for a claim made or renewed now.
fn lease_deadline(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}

/// Databases created before leases existed lack the expiry column.
async fn ensure_lease_column(conn: &Connection) -> Result<()> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM pragma_table_info('bus_messages') WHERE name = 'lease_expires_at'",
            (),
        )
        .await
        .map_err(bus_err)?;
    if rows.next().await.map_err(bus_err)?.is_none() {
        drop(rows);
        conn.execute("ALTER TABLE bus_messages ADD COLUMN lease_expires_at INTEGER", ())
            .await
            .map_err(bus_err)?;
    }
    Ok(())
}

/// Release every unacked message owned by `owner`. Returns the number of
/// released messages.
async fn release(conn: &Connection, owner: &str) -> Result<u64> {
    conn.execute(
        "UPDATE bus_messages
         SET state = 'ready', owner = NULL, redelivered = 1, lease_expires_at = NULL
         WHERE state = 'unacked' AND owner = ?1",
        params![owner],
    )
    .await
    .map_err(bus_err)
}

/// Extend the lease of every message `owner` holds.
async fn renew(conn: &Connection, owner: &str, expires_at: i64) -> Result<u64> {
    conn.execute(
        "UPDATE bus_messages SET lease_expires_at = ?1
         WHERE state = 'unacked' AND owner = ?2",
        params![expires_at, owner],
    )
    .await
    .map_err(bus_err)
}

/// Keep `owner`'s leases alive until `closed` fires.
fn spawn_renewal(db: Arc<Database>, owner: String, closed: CancellationToken, ttl: Duration) {
    let every = (ttl / 3).max(Duration::from_millis(10));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                _ = tokio::time::sleep(every) => {}
            }
            let renewed = match connect_db(&db).await {
                Ok(conn) => renew(&conn, &owner, lease_deadline(ttl)).await,
                Err(e) => Err(e),
            };
            if let Err(e) = renewed {
                tracing::warn!(%owner, error = %e, "lease renewal failed");
            }
        }
    });
}

struct Session {
    owner: String,
    closed: CancellationToken,
}

/// One connection to a durable broker file.
pub struct SqlBus {
    db: Arc<Database>,
    poll_interval: Duration,
    lease_ttl: Duration,
    session: Mutex<Option<Session>>,
    /// Owner id of the last session, released on the next connect.
    previous_owner: Mutex<Option<String>>,
}

impl SqlBus {
    /// Open (creating if needed) the broker database at `path`. Claims made
    /// through this handle expire `lease_ttl` after its last renewal.
    pub async fn open(path: &Path, poll_interval: Duration, lease_ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ListingFlowError::io(parent, e))?;
        }
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(bus_err)?;

        let conn = connect_db(&db).await?;
        conn.execute_batch(SCHEMA).await.map_err(bus_err)?;
        ensure_lease_column(&conn).await?;

        Ok(Self {
            db: Arc::new(db),
            poll_interval,
            lease_ttl,
            session: Mutex::new(None),
            previous_owner: Mutex::new(None),
        })
    }

    /// Release unacked messages whose lease expired. Claims of live
    /// connections are renewed and stay untouched.
    pub async fn release_expired(&self) -> Result<u64> {
        let conn = connect_db(&self.db).await?;
        let released = conn
            .execute(
                "UPDATE bus_messages
                 SET state = 'ready', owner = NULL, redelivered = 1, lease_expires_at = NULL
                 WHERE state = 'unacked' AND lease_expires_at < ?1",
                params![now_ms()],
            )
            .await
            .map_err(bus_err)?;
        if released > 0 {
            tracing::info!(released, "released expired deliveries");
        }
        Ok(released)
    }

    /// Messages waiting in `queue`.
    pub async fn ready_count(&self, queue: &str) -> Result<u64> {
        self.count(queue, "ready").await
    }

    /// Messages claimed from `queue` and not yet acknowledged.
    pub async fn unacked_count(&self, queue: &str) -> Result<u64> {
        self.count(queue, "unacked").await
    }

    async fn count(&self, queue: &str, state: &str) -> Result<u64> {
        let conn = connect_db(&self.db).await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM bus_messages WHERE queue = ?1 AND state = ?2",
                params![queue, state],
            )
            .await
            .map_err(bus_err)?;
        match rows.next().await.map_err(bus_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(bus_err)? as u64),
            None => Ok(0),
        }
    }

    fn current(&self) -> Result<(String, CancellationToken)> {
        let guard = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .map(|s| (s.owner.clone(), s.closed.clone()))
            .ok_or_else(|| ListingFlowError::Bus("not connected".into()))
    }

    async fn topic_kind(conn: &Connection, name: &str) -> Result<Option<TopicKind>> {
        let mut rows = conn
            .query("SELECT kind FROM bus_topics WHERE name = ?1", params![name])
            .await
            .map_err(bus_err)?;
        match rows.next().await.map_err(bus_err)? {
            Some(row) => {
                let kind = row.get::<String>(0).map_err(bus_err)?;
                TopicKind::parse(&kind)
                    .map(Some)
                    .ok_or_else(|| ListingFlowError::Bus(format!("unknown topic kind '{kind}'")))
            }
            None => Ok(None),
        }
    }

    async fn queue_exists(conn: &Connection, name: &str) -> Result<bool> {
        let mut rows = conn
            .query("SELECT 1 FROM bus_queues WHERE name = ?1", params![name])
            .await
            .map_err(bus_err)?;
        Ok(rows.next().await.map_err(bus_err)?.is_some())
    }
}

#[async_trait]
impl MessageBus for SqlBus {
    async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let previous = self
            .previous_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            let conn = connect_db(&self.db).await?;
            release(&conn, &previous).await?;
        }

        let owner = Uuid::now_v7().to_string();
        let closed = CancellationToken::new();
        spawn_renewal(self.db.clone(), owner.clone(), closed.clone(), self.lease_ttl);
        tracing::debug!(%owner, "sql bus connected");
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(Session { owner, closed });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let taken = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(session) = taken else {
            return Ok(());
        };
        session.closed.cancel();

        let conn = connect_db(&self.db).await;
        let released = match conn {
            Ok(conn) => release(&conn, &session.owner).await,
            Err(e) => Err(e),
        };
        match released {
            Ok(released) => {
                tracing::debug!(released, "sql bus disconnected");
                Ok(())
            }
            Err(e) => {
                // Next connect retries the release.
                *self
                    .previous_owner
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(session.owner);
                Err(e)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.current().is_ok()
    }

    async fn declare_topic(&self, name: &str, kind: TopicKind) -> Result<()> {
        self.current()?;
        let conn = connect_db(&self.db).await?;
        conn.execute(
            "INSERT OR IGNORE INTO bus_topics (name, kind) VALUES (?1, ?2)",
            params![name, kind.as_str()],
        )
        .await
        .map_err(bus_err)?;

        match Self::topic_kind(&conn, name).await? {
            Some(existing) if existing != kind => Err(ListingFlowError::Bus(format!(
                "topic '{name}' already declared as {}",
                existing.as_str()
            ))),
            _ => Ok(()),
        }
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        self.current()?;
        let conn = connect_db(&self.db).await?;
        conn.execute(
            "INSERT OR IGNORE INTO bus_queues (name) VALUES (?1)",
            params![name],
        )
        .await
        .map_err(bus_err)?;
        Ok(())
    }

    async fn bind(&self, queue: &str, topic: &str, binding_key: &str) -> Result<()> {
        self.current()?;
        let conn = connect_db(&self.db).await?;
        if Self::topic_kind(&conn, topic).await?.is_none() {
            return Err(ListingFlowError::Bus(format!("topic '{topic}' is not declared")));
        }
        if !Self::queue_exists(&conn, queue).await? {
            return Err(ListingFlowError::Bus(format!("queue '{queue}' is not declared")));
        }
        conn.execute(
            "INSERT OR IGNORE INTO bus_bindings (queue, topic, binding_key) VALUES (?1, ?2, ?3)",
            params![queue, topic, binding_key],
        )
        .await
        .map_err(bus_err)?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(topic = %topic, routing_key = %routing_key))]
    async fn publish(&self, topic: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.current()?;
        let conn = connect_db(&self.db).await?;
        let Some(kind) = Self::topic_kind(&conn, topic).await? else {
            return Err(ListingFlowError::Bus(format!("topic '{topic}' is not declared")));
        };

        let mut rows = conn
            .query(
                "SELECT DISTINCT queue, binding_key FROM bus_bindings WHERE topic = ?1",
                params![topic],
            )
            .await
            .map_err(bus_err)?;
        let mut targets = std::collections::BTreeSet::new();
        while let Some(row) = rows.next().await.map_err(bus_err)? {
            let queue = row.get::<String>(0).map_err(bus_err)?;
            let binding_key = row.get::<String>(1).map_err(bus_err)?;
            if routing_matches(kind, &binding_key, routing_key) {
                targets.insert(queue);
            }
        }
        drop(rows);

        if targets.is_empty() {
            tracing::debug!("no queue bound for routing key");
            return Ok(());
        }

        let now = chrono::Utc::now().to_rfc3339();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(bus_err)?;
        for queue in &targets {
            let inserted = tx
                .execute(
                    "INSERT INTO bus_messages (queue, routing_key, body, published_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![queue.as_str(), routing_key, body.to_vec(), now.as_str()],
                )
                .await;
            if let Err(e) = inserted {
                if let Err(rollback) = tx.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                return Err(bus_err(e));
            }
        }
        tx.commit().await.map_err(bus_err)?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>> {
        let (owner, closed) = self.current()?;
        let conn = connect_db(&self.db).await?;
        if !Self::queue_exists(&conn, queue).await? {
            return Err(ListingFlowError::Bus(format!("queue '{queue}' is not declared")));
        }
        let acker = Arc::new(SqlAcker {
            db: self.db.clone(),
            owner: owner.clone(),
        });
        Ok(Box::new(SqlConsumer {
            conn,
            queue: queue.to_string(),
            owner,
            closed,
            poll_interval: self.poll_interval,
            lease_ttl: self.lease_ttl,
            acker,
        }))
    }
}

impl Drop for SqlBus {
    /// Stops lease renewal. Claims are not released: they expire and get
    /// picked up by other consumers.
    fn drop(&mut self) {
        if let Some(session) = self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            session.closed.cancel();
        }
    }
}

struct SqlConsumer {
    conn: Connection,
    queue: String,
    owner: String,
    closed: CancellationToken,
    poll_interval: Duration,
    lease_ttl: Duration,
    acker: Arc<SqlAcker>,
}

impl SqlConsumer {
    /// Claim the oldest ready or lease-expired message in one statement.
    async fn claim(&self) -> Result<Option<Delivery>> {
        let mut rows = self
            .conn
            .query(
                "UPDATE bus_messages
                 SET redelivered = CASE WHEN state = 'unacked' THEN 1 ELSE redelivered END,
                     state = 'unacked', owner = ?1, lease_expires_at = ?3
                 WHERE id = (
                     SELECT id FROM bus_messages
                     WHERE queue = ?2
                       AND (state = 'ready' OR (state = 'unacked' AND lease_expires_at < ?4))
                     ORDER BY id LIMIT 1
                 )
                 RETURNING id, routing_key, body, redelivered",
                params![
                    self.owner.as_str(),
                    self.queue.as_str(),
                    lease_deadline(self.lease_ttl),
                    now_ms()
                ],
            )
            .await
            .map_err(bus_err)?;

        match rows.next().await.map_err(bus_err)? {
            Some(row) => {
                let id = row.get::<i64>(0).map_err(bus_err)?;
                let routing_key = row.get::<String>(1).map_err(bus_err)?;
                let body = row.get::<Vec<u8>>(2).map_err(bus_err)?;
                let redelivered = row.get::<i64>(3).map_err(bus_err)? != 0;
                Ok(Some(Delivery::new(
                    body,
                    routing_key,
                    redelivered,
                    id as u64,
                    self.acker.clone(),
                )))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl Consumer for SqlConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed.is_cancelled() {
                return None;
            }
            match self.claim().await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(queue = %self.queue, error = %e, "claim failed, ending consumer");
                    return None;
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.closed.cancelled() => return None,
            }
        }
    }
}

struct SqlAcker {
    db: Arc<Database>,
    owner: String,
}

#[async_trait]
impl Acknowledger for SqlAcker {
    async fn ack(&self, tag: u64) -> Result<()> {
        let conn = connect_db(&self.db).await?;
        let deleted = conn
            .execute(
                "DELETE FROM bus_messages WHERE id = ?1 AND owner = ?2 AND state = 'unacked'",
                params![tag as i64, self.owner.as_str()],
            )
            .await
            .map_err(bus_err)?;
        if deleted == 0 {
            return Err(ListingFlowError::Bus(format!(
                "unknown delivery tag {tag}: connection closed"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("lf_bus_{}.db", Uuid::now_v7()))
    }

    const LEASE: Duration = Duration::from_secs(30);

    async fn connected(path: &Path) -> SqlBus {
        connected_with_lease(path, LEASE).await
    }

    async fn connected_with_lease(path: &Path, lease_ttl: Duration) -> SqlBus {
        let bus = SqlBus::open(path, Duration::from_millis(10), lease_ttl)
            .await
            .unwrap();
        bus.connect().await.unwrap();
        bus
    }

    async fn declare(bus: &SqlBus) {
        bus.declare_topic("enrichment", TopicKind::Topic).await.unwrap();
        bus.declare_queue("geo_enrichment_queue").await.unwrap();
        bus.declare_queue("economic_enrichment_queue").await.unwrap();
        bus.bind("geo_enrichment_queue", "enrichment", "enrich.geo").await.unwrap();
        bus.bind("economic_enrichment_queue", "enrichment", "enrich.economic")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn routes_by_exact_key() {
        let path = temp_path();
        let bus = connected(&path).await;
        declare(&bus).await;

        bus.publish("enrichment", "enrich.geo", b"{}").await.unwrap();
        assert_eq!(bus.ready_count("geo_enrichment_queue").await.unwrap(), 1);
        assert_eq!(bus.ready_count("economic_enrichment_queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn declarations_are_idempotent_and_kind_checked() {
        let path = temp_path();
        let bus = connected(&path).await;
        declare(&bus).await;
        declare(&bus).await;
        assert!(bus.declare_topic("enrichment", TopicKind::Direct).await.is_err());
        assert!(bus.publish("missing", "k", b"x").await.is_err());
    }

    #[tokio::test]
    async fn messages_survive_reopen() {
        let path = temp_path();
        {
            let bus = connected(&path).await;
            declare(&bus).await;
            bus.publish("enrichment", "enrich.geo", b"durable").await.unwrap();
        }

        let bus = connected(&path).await;
        let mut consumer = bus.consume("geo_enrichment_queue").await.unwrap();
        let delivery = consumer.next().await.expect("delivery");
        assert_eq!(delivery.body(), b"durable");
        delivery.ack().await.unwrap();
        assert_eq!(bus.ready_count("geo_enrichment_queue").await.unwrap(), 0);
        assert_eq!(bus.unacked_count("geo_enrichment_queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn disconnect_releases_unacked_as_redelivered() {
        let path = temp_path();
        let bus = connected(&path).await;
        declare(&bus).await;
        bus.publish("enrichment", "enrich.geo", b"again").await.unwrap();

        let mut consumer = bus.consume("geo_enrichment_queue").await.unwrap();
        let stale = consumer.next().await.expect("delivery");
        assert!(!stale.redelivered());

        bus.disconnect().await.unwrap();
        assert!(consumer.next().await.is_none());
        assert!(stale.ack().await.is_err());

        bus.connect().await.unwrap();
        let mut consumer = bus.consume("geo_enrichment_queue").await.unwrap();
        let again = consumer.next().await.expect("redelivery");
        assert!(again.redelivered());
        assert_eq!(again.body(), b"again");
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn expired_claims_released_on_recovery() {
        let path = temp_path();
        let crashed = connected_with_lease(&path, Duration::from_millis(50)).await;
        declare(&crashed).await;
        crashed.publish("enrichment", "enrich.geo", b"orphan").await.unwrap();
        let mut consumer = crashed.consume("geo_enrichment_queue").await.unwrap();
        let held = consumer.next().await.expect("delivery");
        // A process that died without disconnecting: renewal stops, the
        // claim stays in the table.
        drop(consumer);
        drop(crashed);
        assert_eq!(
            SqlBus::open(&path, Duration::from_millis(10), LEASE)
                .await
                .unwrap()
                .unacked_count("geo_enrichment_queue")
                .await
                .unwrap(),
            1
        );

        tokio::time::sleep(Duration::from_millis(150)).await;
        let fresh = connected(&path).await;
        assert_eq!(fresh.release_expired().await.unwrap(), 1);
        assert_eq!(fresh.ready_count("geo_enrichment_queue").await.unwrap(), 1);

        let mut consumer = fresh.consume("geo_enrichment_queue").await.unwrap();
        let again = consumer.next().await.expect("redelivery");
        assert!(again.redelivered());
        assert!(held.ack().await.is_err());
        again.ack().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_takes_over_expired_claim() {
        let path = temp_path();
        let crashed = connected_with_lease(&path, Duration::from_millis(50)).await;
        declare(&crashed).await;
        crashed.publish("enrichment", "enrich.geo", b"stuck").await.unwrap();
        let mut consumer = crashed.consume("geo_enrichment_queue").await.unwrap();
        let _held = consumer.next().await.expect("delivery");
        drop(consumer);
        drop(crashed);

        let fresh = connected(&path).await;
        let mut consumer = fresh.consume("geo_enrichment_queue").await.unwrap();
        let taken = tokio::time::timeout(Duration::from_secs(5), consumer.next())
            .await
            .expect("expired claim is claimable")
            .expect("delivery");
        assert_eq!(taken.body(), b"stuck");
        assert!(taken.redelivered());
        taken.ack().await.unwrap();
    }

    #[tokio::test]
    async fn recovery_leaves_live_claims_alone() {
        let path = temp_path();
        let lease = Duration::from_millis(300);
        let a = connected_with_lease(&path, lease).await;
        let b = connected_with_lease(&path, lease).await;
        declare(&a).await;
        a.publish("enrichment", "enrich.geo", b"m").await.unwrap();

        let mut ca = a.consume("geo_enrichment_queue").await.unwrap();
        let in_flight = ca.next().await.expect("a claims it");

        // Outlive the lease: a keeps renewing while it is connected.
        tokio::time::sleep(Duration::from_millis(700)).await;
        let provider = crate::BusProvider::Sql {
            path: path.clone(),
            poll_interval: Duration::from_millis(10),
            lease_ttl: lease,
        };
        assert_eq!(provider.recover().await.unwrap(), 0);

        let mut cb = b.consume("geo_enrichment_queue").await.unwrap();
        let stolen = tokio::time::timeout(Duration::from_millis(100), cb.next()).await;
        assert!(stolen.is_err(), "live claim must not be handed out again");

        in_flight.ack().await.unwrap();
        assert_eq!(a.unacked_count("geo_enrichment_queue").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn two_consumers_never_share_a_message() {
        let path = temp_path();
        let a = connected(&path).await;
        let b = connected(&path).await;
        declare(&a).await;
        a.publish("enrichment", "enrich.geo", b"only-once").await.unwrap();

        let mut ca = a.consume("geo_enrichment_queue").await.unwrap();
        let mut cb = b.consume("geo_enrichment_queue").await.unwrap();
        let first = ca.next().await.expect("a gets it");
        let second =
            tokio::time::timeout(Duration::from_millis(50), cb.next()).await;
        assert!(second.is_err(), "message must not be claimed twice");
        first.ack().await.unwrap();
    }
}
