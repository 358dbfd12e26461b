//! Generic stage worker.
//!
//! Every stage runs the same state machine around its transform:
//!
//! ```text
//! Receiving → Validating → Processing → Publishing | Retrying | DeadLettering | Dropping
//! ```
//!
//! The delivery is acknowledged only once a terminal state has finished its
//! publish. If the bus fails before that, the delivery stays unacknowledged,
//! the worker drops its connection and reconnects, and the broker hands the
//! message out again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use listingflow_bus::{Consumer, Delivery, MessageBus};
use listingflow_shared::{
    DeadLetterRecord, Envelope, ListingFlowError, Result, Stage, StageError, StageOutput,
};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, field, info, instrument, warn};

use crate::retry::RetryPolicy;
use crate::topology::Topology;

// ---------------------------------------------------------------------------
// Transform seam
// ---------------------------------------------------------------------------

/// The stage-specific part of a worker.
///
/// Errors must already be classified: the worker routes on the
/// [`StageError`] variant and never reclassifies.
#[async_trait]
pub trait StageTransform: Send + Sync {
    fn stage(&self) -> Stage;

    /// Check the fields this stage needs. Routing fields are checked by the
    /// worker before this is called.
    fn validate(&self, envelope: &Envelope) -> std::result::Result<(), StageError>;

    /// Produce this stage's section of the payload.
    async fn process(&self, envelope: &Envelope) -> std::result::Result<StageOutput, StageError>;
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Per-worker outcome counters.
#[derive(Debug, Default)]
pub struct WorkerStats {
    published: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Envelopes that completed this stage (the terminal stage publishes nothing).
    pub published: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

impl StatsSnapshot {
    pub fn total(&self) -> u64 {
        self.published + self.retried + self.dead_lettered + self.dropped
    }
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::Published | Outcome::Completed => &self.published,
            Outcome::Retried => &self.retried,
            Outcome::DeadLettered => &self.dead_lettered,
            Outcome::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Terminal state a delivery reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Published,
    /// Success at the last stage: nothing to publish.
    Completed,
    Retried,
    DeadLettered,
    Dropped,
}

// ---------------------------------------------------------------------------
// Consume loop shared by stage workers and the dead-letter sink
// ---------------------------------------------------------------------------

/// Why a delivery was left unacknowledged.
#[derive(Debug)]
pub(crate) enum Abandon {
    /// Shutdown interrupted the delivery.
    Cancelled,
    /// Publishing, storing or acknowledging failed; reconnect and let the
    /// broker redeliver.
    Redeliver(ListingFlowError),
}

impl From<ListingFlowError> for Abandon {
    fn from(e: ListingFlowError) -> Self {
        Self::Redeliver(e)
    }
}

#[async_trait]
pub(crate) trait DeliveryHandler: Send + Sync {
    fn queue(&self) -> &str;

    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), Abandon>;
}

/// Connection settings shared by every consumer.
#[derive(Debug, Clone, Copy)]
pub struct WorkerSettings {
    pub retry: RetryPolicy,
    pub reconnect_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancel.
async fn pause(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

async fn open_consumer(
    bus: &dyn MessageBus,
    topology: &Topology,
    queue: &str,
) -> Result<Box<dyn Consumer>> {
    bus.connect().await?;
    topology.declare(bus).await?;
    bus.consume(queue).await
}

/// Consume `handler.queue()` until cancelled, reconnecting whenever the
/// consumer ends or a delivery is abandoned because of the bus.
pub(crate) async fn consume_loop(
    bus: &dyn MessageBus,
    topology: &Topology,
    handler: &dyn DeliveryHandler,
    cancel: &CancellationToken,
    reconnect_delay: Duration,
) {
    let queue = handler.queue();

    while !cancel.is_cancelled() {
        let mut consumer = match open_consumer(bus, topology, queue).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(queue, error = %e, "bus unavailable");
                if let Err(e) = bus.disconnect().await {
                    debug!(queue, error = %e, "disconnect after failed connect");
                }
                if !pause(cancel, reconnect_delay).await {
                    break;
                }
                continue;
            }
        };
        info!(queue, "consuming");

        let reconnect = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break false,
                next = consumer.next() => next,
            };
            let Some(delivery) = next else {
                warn!(queue, "consumer ended, reconnecting");
                break true;
            };
            match handler.handle(delivery).await {
                Ok(()) => {}
                Err(Abandon::Cancelled) => {
                    info!(queue, "shutdown during delivery, left for redelivery");
                    break false;
                }
                Err(Abandon::Redeliver(e)) => {
                    warn!(queue, error = %e, "delivery left unacknowledged");
                    break true;
                }
            }
        };

        drop(consumer);
        if let Err(e) = bus.disconnect().await {
            debug!(queue, error = %e, "disconnect failed");
        }
        if !reconnect || !pause(cancel, reconnect_delay).await {
            break;
        }
    }

    if bus.is_connected() {
        if let Err(e) = bus.disconnect().await {
            debug!(queue, error = %e, "disconnect failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Stage worker
// ---------------------------------------------------------------------------

/// One consumer for one stage.
pub struct StageWorker {
    bus: Arc<dyn MessageBus>,
    topology: Arc<Topology>,
    transform: Arc<dyn StageTransform>,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
    cancel: CancellationToken,
}

impl StageWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topology: Arc<Topology>,
        transform: Arc<dyn StageTransform>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            topology,
            transform,
            settings,
            stats: Arc::new(WorkerStats::default()),
            cancel,
        }
    }

    pub fn stage(&self) -> Stage {
        self.transform.stage()
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the cancellation token fires.
    pub async fn run(self) {
        let stage = self.stage();
        info!(%stage, queue = %self.topology.inbound(stage).queue, "stage worker starting");

        consume_loop(
            self.bus.as_ref(),
            &self.topology,
            &self,
            &self.cancel,
            self.settings.reconnect_delay,
        )
        .await;

        let stats = self.stats.snapshot();
        info!(
            %stage,
            published = stats.published,
            retried = stats.retried,
            dead_lettered = stats.dead_lettered,
            dropped = stats.dropped,
            "stage worker stopped"
        );
    }

    /// Drive one delivery to a terminal state and acknowledge it.
    #[instrument(
        skip_all,
        fields(
            stage = %self.stage(),
            trace_id = field::Empty,
            subject_id = field::Empty,
            retry_count = field::Empty,
        )
    )]
    pub(crate) async fn process_delivery(
        &self,
        delivery: Delivery,
    ) -> std::result::Result<Outcome, Abandon> {
        let outcome = self.settle(&delivery).await?;
        delivery.ack().await?;
        self.stats.record(outcome);
        Ok(outcome)
    }

    /// Everything up to, but not including, the acknowledgement.
    async fn settle(&self, delivery: &Delivery) -> std::result::Result<Outcome, Abandon> {
        // Receiving
        let envelope = match Envelope::from_slice(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e @ StageError::MalformedMessage(_)) => {
                warn!(error = %e, redelivered = delivery.redelivered(), "dropping undecodable message");
                return Ok(Outcome::Dropped);
            }
            Err(e) => return self.dead_letter(delivery.body(), &e).await,
        };

        let span = Span::current();
        span.record("trace_id", envelope.meta.trace_id.as_str());
        span.record("subject_id", envelope.meta.subject_id.as_str());
        span.record("retry_count", envelope.meta.retry_count);

        // Validating, then Processing
        let result = match envelope
            .validate_routing()
            .and_then(|()| self.transform.validate(&envelope))
        {
            Ok(()) => self.transform.process(&envelope).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => self.publish_next(envelope, output).await,
            Err(e) if e.is_retryable() && self.settings.retry.should_retry(envelope.meta.retry_count) => {
                self.retry(envelope, &e).await
            }
            Err(e) => self.dead_letter(delivery.body(), &e).await,
        }
    }

    async fn publish_next(
        &self,
        envelope: Envelope,
        output: StageOutput,
    ) -> std::result::Result<Outcome, Abandon> {
        let Some(route) = self.topology.outbound(self.stage()) else {
            debug!("stage complete");
            return Ok(Outcome::Completed);
        };

        let next = envelope.advance(output);
        self.bus.publish(&route.topic, &route.key, &next.to_vec()?).await?;
        debug!(to = %route.key, "published to next stage");
        Ok(Outcome::Published)
    }

    async fn retry(
        &self,
        envelope: Envelope,
        error: &StageError,
    ) -> std::result::Result<Outcome, Abandon> {
        let attempt = envelope.meta.retry_count + 1;
        let delay = self.settings.retry.delay(attempt);
        let next_eligible_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "retrying"
        );
        if !pause(&self.cancel, delay).await {
            return Err(Abandon::Cancelled);
        }

        let route = self.topology.inbound(self.stage());
        let retried = envelope.for_retry(error, next_eligible_at);
        self.bus.publish(&route.topic, &route.key, &retried.to_vec()?).await?;
        Ok(Outcome::Retried)
    }

    async fn dead_letter(
        &self,
        body: &[u8],
        error: &StageError,
    ) -> std::result::Result<Outcome, Abandon> {
        warn!(reason = error.kind(), error = %error, "dead-lettering");

        let record = DeadLetterRecord::from_body(body, self.stage(), error, Utc::now())?;
        let route = self.topology.dead_letter();
        self.bus.publish(&route.topic, &route.key, &record.to_vec()?).await?;
        Ok(Outcome::DeadLettered)
    }
}

#[async_trait]
impl DeliveryHandler for StageWorker {
    fn queue(&self) -> &str {
        &self.topology.inbound(self.stage()).queue
    }

    async fn handle(&self, delivery: Delivery) -> std::result::Result<(), Abandon> {
        self.process_delivery(delivery).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use listingflow_bus::MemoryBroker;
    use listingflow_shared::{AnalysisResult, Attractiveness};
    use std::sync::Mutex;

    /// Replays a scripted list of results, then succeeds.
    struct Scripted {
        stage: Stage,
        script: Mutex<Vec<std::result::Result<StageOutput, StageError>>>,
        calls: AtomicU64,
    }

    impl Scripted {
        fn new(stage: Stage, script: Vec<std::result::Result<StageOutput, StageError>>) -> Arc<Self> {
            Arc::new(Self {
                stage,
                script: Mutex::new(script.into_iter().rev().collect()),
                calls: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl StageTransform for Scripted {
        fn stage(&self) -> Stage {
            self.stage
        }

        fn validate(&self, _envelope: &Envelope) -> std::result::Result<(), StageError> {
            Ok(())
        }

        async fn process(&self, _envelope: &Envelope) -> std::result::Result<StageOutput, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(StageOutput::Scored(AnalysisResult {
                    score: 1,
                    attractiveness_label: Attractiveness::Low,
                    estimated_yield: 0.5,
                })))
        }
    }

    struct Harness {
        broker: MemoryBroker,
        worker: StageWorker,
        tap: Box<dyn Consumer>,
        _tap_bus: Arc<dyn MessageBus>,
    }

    async fn harness(transform: Arc<dyn StageTransform>, max_retries: u32) -> Harness {
        let broker = MemoryBroker::new();
        let topology = Arc::new(Topology::default());

        let tap_bus: Arc<dyn MessageBus> = Arc::new(broker.handle());
        tap_bus.connect().await.unwrap();
        topology.declare(tap_bus.as_ref()).await.unwrap();
        let tap = tap_bus.consume("dead_letter_queue").await.unwrap();

        let bus: Arc<dyn MessageBus> = Arc::new(broker.handle());
        bus.connect().await.unwrap();

        let worker = StageWorker::new(
            bus,
            topology,
            transform,
            WorkerSettings {
                retry: RetryPolicy::new(max_retries, Duration::ZERO),
                reconnect_delay: Duration::from_millis(10),
            },
            CancellationToken::new(),
        );
        Harness {
            broker,
            worker,
            tap,
            _tap_bus: tap_bus,
        }
    }

    /// The next delivery on `queue`. Keep the consumer alive until the
    /// delivery is acked: dropping it requeues the delivery.
    async fn take(worker: &StageWorker, queue: &str) -> (Box<dyn Consumer>, Delivery) {
        let mut consumer = worker.bus.consume(queue).await.unwrap();
        let delivery = consumer.next().await.unwrap();
        (consumer, delivery)
    }

    fn envelope_body(retry_count: u32) -> Vec<u8> {
        let mut envelope = Envelope::new("42", "trace-1", None, "https://spb.cian.ru/rent/flat/42/");
        envelope.meta.retry_count = retry_count;
        envelope.to_vec().unwrap()
    }

    #[tokio::test]
    async fn success_publishes_downstream_with_reset_retry_count() {
        let transform = Scripted::new(Stage::Persistence, vec![]);
        let h = harness(transform, 3).await;
        h.worker
            .bus
            .publish("enrichment", "persist.request", &envelope_body(2))
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "persistence_queue").await;
        let outcome = h.worker.process_delivery(delivery).await.unwrap();
        assert_eq!(outcome, Outcome::Published);

        let (_consumer_next, next) = take(&h.worker, "scoring_queue").await;
        let envelope = Envelope::from_slice(next.body()).unwrap();
        assert_eq!(envelope.meta.trace_id, "trace-1");
        assert_eq!(envelope.meta.retry_count, 0);
        assert!(envelope.meta.retry.is_none());
        assert!(envelope.payload.analysis.is_some());
        assert_eq!(h.broker.unacked_count("persistence_queue"), 0);
    }

    #[tokio::test]
    async fn transient_failure_republishes_to_own_queue() {
        let transform = Scripted::new(
            Stage::Scoring,
            vec![Err(StageError::Transient("timeout".into()))],
        );
        let h = harness(transform, 3).await;
        h.worker
            .bus
            .publish("analysis", "analyze.request", &envelope_body(0))
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "scoring_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::Retried
        );

        let (_consumer_again, again) = take(&h.worker, "scoring_queue").await;
        let envelope = Envelope::from_slice(again.body()).unwrap();
        assert_eq!(envelope.meta.retry_count, 1);
        let retry = envelope.meta.retry.unwrap();
        assert_eq!(retry.attempt, 1);
        assert!(retry.last_error.contains("timeout"));
        assert!(!again.redelivered());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter() {
        let transform = Scripted::new(
            Stage::Scoring,
            vec![Err(StageError::Transient("still down".into()))],
        );
        let mut h = harness(transform, 3).await;
        h.worker
            .bus
            .publish("analysis", "analyze.request", &envelope_body(3))
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "scoring_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::DeadLettered
        );
        assert_eq!(h.broker.ready_count("scoring_queue"), 0);

        let dead = h.tap.next().await.unwrap();
        let record = DeadLetterRecord::from_slice(dead.body()).unwrap();
        assert_eq!(record.reason, "TransientError");
        assert_eq!(record.stage, Stage::Scoring);
        assert_eq!(record.retry_count(), 3);
        assert_eq!(record.trace_id(), Some("trace-1"));
    }

    #[tokio::test]
    async fn fatal_failure_dead_letters_immediately() {
        let transform = Scripted::new(
            Stage::Extraction,
            vec![Err(StageError::CapabilityNotFound("no parser".into()))],
        );
        let mut h = harness(transform, 3).await;
        h.worker
            .bus
            .publish("ingress", "ingest.request", &envelope_body(0))
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "extraction_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::DeadLettered
        );

        let dead = h.tap.next().await.unwrap();
        let record = DeadLetterRecord::from_slice(dead.body()).unwrap();
        assert_eq!(record.reason, "CapabilityNotFoundError");
        assert_eq!(record.retry_count(), 0);
        assert_eq!(h.broker.ready_count("extraction_queue"), 0);
    }

    #[tokio::test]
    async fn missing_identity_is_dead_lettered_without_processing() {
        let transform = Scripted::new(Stage::Scoring, vec![]);
        let mut h = harness(transform.clone(), 3).await;
        h.worker
            .bus
            .publish("analysis", "analyze.request", br#"{"traceId":"t-1"}"#)
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "scoring_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::DeadLettered
        );
        assert_eq!(transform.calls.load(Ordering::SeqCst), 0);

        let dead = h.tap.next().await.unwrap();
        let record = DeadLetterRecord::from_slice(dead.body()).unwrap();
        assert_eq!(record.reason, "ValidationError");
    }

    #[tokio::test]
    async fn undecodable_body_is_dropped_and_acked() {
        let transform = Scripted::new(Stage::Scoring, vec![]);
        let h = harness(transform.clone(), 3).await;
        h.worker
            .bus
            .publish("analysis", "analyze.request", b"not json at all")
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "scoring_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::Dropped
        );
        assert_eq!(transform.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.broker.unacked_count("scoring_queue"), 0);
        assert_eq!(h.broker.ready_count("dead_letter_queue"), 0);
        assert_eq!(h.worker.stats().snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn wrongly_typed_fields_are_dead_lettered() {
        let bodies: [&[u8]; 3] = [
            br#"{"subjectId":"305548024","traceId":"t-1","listing":"oops"}"#,
            br#"{"subjectId":305548024,"traceId":"t-1"}"#,
            br#"{"subjectId":"305548024","traceId":"t-1","retryCount":-1}"#,
        ];
        for body in bodies {
            let transform = Scripted::new(Stage::GeoEnrichment, vec![]);
            let mut h = harness(transform.clone(), 3).await;
            h.worker.bus.publish("enrichment", "enrich.geo", body).await.unwrap();

            let (_consumer_delivery, delivery) = take(&h.worker, "geo_enrichment_queue").await;
            assert_eq!(
                h.worker.process_delivery(delivery).await.unwrap(),
                Outcome::DeadLettered
            );
            assert_eq!(transform.calls.load(Ordering::SeqCst), 0);
            assert_eq!(h.broker.unacked_count("geo_enrichment_queue"), 0);

            let dead = h.tap.next().await.unwrap();
            let record = DeadLetterRecord::from_slice(dead.body()).unwrap();
            assert_eq!(record.reason, "ValidationError");
            assert_eq!(record.stage, Stage::GeoEnrichment);
            assert_eq!(record.trace_id(), Some("t-1"));
            assert_eq!(h.worker.stats().snapshot().dead_lettered, 1);
        }
    }

    #[tokio::test]
    async fn terminal_stage_publishes_nothing() {
        let transform = Scripted::new(Stage::Notification, vec![Ok(StageOutput::Notified)]);
        let h = harness(transform, 3).await;
        h.worker
            .bus
            .publish("notification", "notify.user", &envelope_body(0))
            .await
            .unwrap();

        let (_consumer_delivery, delivery) = take(&h.worker, "notification_queue").await;
        assert_eq!(
            h.worker.process_delivery(delivery).await.unwrap(),
            Outcome::Completed
        );
        assert_eq!(h.broker.unacked_count("notification_queue"), 0);
    }

    #[tokio::test]
    async fn cancel_during_retry_wait_leaves_delivery_unacked() {
        let transform = Scripted::new(
            Stage::Scoring,
            vec![Err(StageError::Transient("slow".into()))],
        );
        let broker = MemoryBroker::new();
        let topology = Arc::new(Topology::default());
        let bus: Arc<dyn MessageBus> = Arc::new(broker.handle());
        bus.connect().await.unwrap();
        topology.declare(bus.as_ref()).await.unwrap();

        let cancel = CancellationToken::new();
        let worker = StageWorker::new(
            bus.clone(),
            topology,
            transform,
            WorkerSettings {
                retry: RetryPolicy::new(3, Duration::from_secs(60)),
                reconnect_delay: Duration::from_millis(10),
            },
            cancel.clone(),
        );
        bus.publish("analysis", "analyze.request", &envelope_body(0))
            .await
            .unwrap();
        let (_consumer_delivery, delivery) = take(&worker, "scoring_queue").await;

        cancel.cancel();
        let result = worker.process_delivery(delivery).await;
        assert!(matches!(result, Err(Abandon::Cancelled)));
        assert_eq!(broker.unacked_count("scoring_queue"), 1);

        bus.disconnect().await.unwrap();
        assert_eq!(broker.ready_count("scoring_queue"), 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_cancel() {
        let transform = Scripted::new(Stage::Scoring, vec![]);
        let h = harness(transform, 3).await;
        let cancel = h.worker.cancel.clone();
        let stats = h.worker.stats();
        h.worker
            .bus
            .publish("analysis", "analyze.request", &envelope_body(0))
            .await
            .unwrap();

        let handle = tokio::spawn(h.worker.run());
        for _ in 0..200 {
            if stats.snapshot().published == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats.snapshot().published, 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(h.broker.ready_count("notification_queue"), 1);
    }
}
