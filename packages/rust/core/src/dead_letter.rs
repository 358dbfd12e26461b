//! Dead-letter sink: stores every dead-letter record once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use listingflow_bus::{Delivery, MessageBus};
use listingflow_shared::DeadLetterRecord;
use listingflow_storage::ListingStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::topology::Topology;
use crate::worker::{Abandon, DeliveryHandler, WorkerSettings, consume_loop};

/// Consumes the dead-letter queue into the store's write-once table.
pub struct DeadLetterSink {
    bus: Arc<dyn MessageBus>,
    topology: Arc<Topology>,
    store: Arc<ListingStore>,
    settings: WorkerSettings,
    cancel: CancellationToken,
    stored: AtomicU64,
}

impl DeadLetterSink {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topology: Arc<Topology>,
        store: Arc<ListingStore>,
        settings: WorkerSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            topology,
            store,
            settings,
            cancel,
            stored: AtomicU64::new(0),
        }
    }

    pub async fn run(self) {
        info!(queue = %self.topology.dead_letter().queue, "dead-letter sink starting");
        consume_loop(
            self.bus.as_ref(),
            &self.topology,
            &self,
            &self.cancel,
            self.settings.reconnect_delay,
        )
        .await;
        info!(stored = self.stored.load(Ordering::Relaxed), "dead-letter sink stopped");
    }

    #[instrument(skip_all)]
    pub(crate) async fn store_delivery(&self, delivery: Delivery) -> Result<(), Abandon> {
        match DeadLetterRecord::from_slice(delivery.body()) {
            Ok(record) => {
                let inserted = self.store.insert_dead_letter(&record).await?;
                if inserted {
                    self.stored.fetch_add(1, Ordering::Relaxed);
                }
                info!(
                    trace_id = record.trace_id().unwrap_or_default(),
                    subject_id = record.subject_id().unwrap_or_default(),
                    stage = %record.stage,
                    reason = %record.reason,
                    duplicate = !inserted,
                    "dead letter recorded"
                );
            }
            Err(e) => warn!(error = %e, "discarding undecodable dead-letter record"),
        }
        delivery.ack().await?;
        Ok(())
    }
}

#[async_trait]
impl DeliveryHandler for DeadLetterSink {
    fn queue(&self) -> &str {
        &self.topology.dead_letter().queue
    }

    async fn handle(&self, delivery: Delivery) -> Result<(), Abandon> {
        self.store_delivery(delivery).await
    }
}
