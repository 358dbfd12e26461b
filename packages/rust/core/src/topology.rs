//! Bus topology: which topic, routing key and queue feed each stage.

use std::collections::BTreeSet;

use listingflow_bus::{MessageBus, TopicKind};
use listingflow_shared::{Result, Stage, TopologyConfig};
use tracing::debug;

/// One `topic / routing key → queue` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub topic: String,
    pub key: String,
    pub queue: String,
}

impl Route {
    fn new(topic: &str, key: &str, queue: &str) -> Self {
        Self {
            topic: topic.to_string(),
            key: key.to_string(),
            queue: queue.to_string(),
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {} -> {}", self.topic, self.key, self.queue)
    }
}

/// The full routing table of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    stages: [Route; 6],
    dead_letter: Route,
}

impl Topology {
    pub fn from_config(c: &TopologyConfig) -> Self {
        Self {
            stages: [
                Route::new(&c.ingress_topic, &c.ingest_key, &c.extraction_queue),
                Route::new(&c.enrichment_topic, &c.geo_key, &c.geo_queue),
                Route::new(&c.enrichment_topic, &c.economic_key, &c.economic_queue),
                Route::new(&c.enrichment_topic, &c.persist_key, &c.persistence_queue),
                Route::new(&c.analysis_topic, &c.analyze_key, &c.scoring_queue),
                Route::new(&c.notification_topic, &c.notify_key, &c.notification_queue),
            ],
            dead_letter: Route::new(&c.ingress_topic, &c.dead_letter_key, &c.dead_letter_queue),
        }
    }

    /// Where envelopes for `stage` are published and consumed.
    pub fn inbound(&self, stage: Stage) -> &Route {
        let idx = match stage {
            Stage::Extraction => 0,
            Stage::GeoEnrichment => 1,
            Stage::EconomicEnrichment => 2,
            Stage::Persistence => 3,
            Stage::Scoring => 4,
            Stage::Notification => 5,
        };
        &self.stages[idx]
    }

    /// Where `stage` publishes on success; `None` for the terminal stage.
    pub fn outbound(&self, stage: Stage) -> Option<&Route> {
        stage.next().map(|next| self.inbound(next))
    }

    pub fn dead_letter(&self) -> &Route {
        &self.dead_letter
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.stages.iter().chain(std::iter::once(&self.dead_letter))
    }

    /// Declare every topic, queue and binding. Idempotent, so workers call it
    /// on every (re)connect.
    pub async fn declare(&self, bus: &dyn MessageBus) -> Result<()> {
        let topics: BTreeSet<&str> = self.routes().map(|r| r.topic.as_str()).collect();
        for topic in topics {
            bus.declare_topic(topic, TopicKind::Topic).await?;
        }
        for route in self.routes() {
            bus.declare_queue(&route.queue).await?;
            bus.bind(&route.queue, &route.topic, &route.key).await?;
        }
        debug!("topology declared");
        Ok(())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&TopologyConfig::default())
    }
}
