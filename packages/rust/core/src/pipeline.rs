//! Pipeline runner: builds every worker with its dependencies, spawns them
//! and shuts them down together.

use std::sync::Arc;
use std::time::Duration;

use listingflow_bus::BusProvider;
use listingflow_extraction::{Extractor, PageFetcher, ParserRegistry};
use listingflow_shared::{AppConfig, Result, Stage};
use listingflow_storage::ListingStore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::dead_letter::DeadLetterSink;
use crate::enrichment::{EconomicLookup, GeoLookup, StaticEconomicDirectory, StaticGeoDirectory};
use crate::ingest::Ingestor;
use crate::notify::{LogChannel, NotificationChannel};
use crate::retry::RetryPolicy;
use crate::stages::{
    EconomicStage, ExtractionStage, GeoStage, NotificationStage, PersistenceStage, ScoringStage,
};
use crate::topology::Topology;
use crate::worker::{StageTransform, StageWorker, StatsSnapshot, WorkerSettings, WorkerStats};

/// External collaborators the stage transforms call.
#[derive(Clone)]
pub struct Capabilities {
    pub extractor: Extractor,
    pub geo: Arc<dyn GeoLookup>,
    pub economic: Arc<dyn EconomicLookup>,
    pub channel: Arc<dyn NotificationChannel>,
}

impl Capabilities {
    /// Built-in parsers over HTTP, static directories, log notifications.
    pub fn builtin(config: &AppConfig) -> Result<Self> {
        let fetcher = PageFetcher::new(&config.fetch)?;
        Ok(Self {
            extractor: Extractor::new(Arc::new(ParserRegistry::new()), Arc::new(fetcher)),
            geo: Arc::new(StaticGeoDirectory),
            economic: Arc::new(StaticEconomicDirectory),
            channel: Arc::new(LogChannel),
        })
    }
}

/// Everything needed to run stage workers.
pub struct Pipeline {
    provider: BusProvider,
    topology: Arc<Topology>,
    store: Arc<ListingStore>,
    settings: WorkerSettings,
    capabilities: Capabilities,
}

impl Pipeline {
    pub fn new(
        provider: BusProvider,
        topology: Topology,
        store: Arc<ListingStore>,
        settings: WorkerSettings,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            provider,
            topology: Arc::new(topology),
            store,
            settings,
            capabilities,
        }
    }

    /// Wire a pipeline from configuration with the built-in capabilities.
    pub fn from_config(config: &AppConfig, store: Arc<ListingStore>) -> Result<Self> {
        Ok(Self::new(
            BusProvider::from_config(&config.bus)?,
            Topology::from_config(&config.topology),
            store,
            WorkerSettings {
                retry: RetryPolicy::from_config(&config.retry),
                reconnect_delay: config.bus.reconnect_delay(),
            },
            Capabilities::builtin(config)?,
        ))
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn store(&self) -> &Arc<ListingStore> {
        &self.store
    }

    /// The transform for `stage`, wired to this pipeline's capabilities.
    pub fn transform(&self, stage: Stage) -> Arc<dyn StageTransform> {
        let caps = &self.capabilities;
        match stage {
            Stage::Extraction => Arc::new(ExtractionStage::new(caps.extractor.clone())),
            Stage::GeoEnrichment => Arc::new(GeoStage::new(Arc::clone(&caps.geo))),
            Stage::EconomicEnrichment => Arc::new(EconomicStage::new(Arc::clone(&caps.economic))),
            Stage::Persistence => Arc::new(PersistenceStage::new(Arc::clone(&self.store))),
            Stage::Scoring => Arc::new(ScoringStage),
            Stage::Notification => Arc::new(NotificationStage::new(Arc::clone(&caps.channel))),
        }
    }

    /// An ingestor on its own bus connection.
    pub async fn ingestor(&self) -> Result<Ingestor> {
        Ingestor::connect(self.provider.handle().await?, Arc::clone(&self.topology)).await
    }

    /// Release deliveries whose claim expired because their process died.
    /// Claims held by live workers sharing the broker are left alone.
    pub async fn recover(&self) -> Result<u64> {
        let released = self.provider.recover().await?;
        if released > 0 {
            info!(released, "released expired deliveries");
        }
        Ok(released)
    }

    /// Spawn one worker per stage in `stages`, plus the dead-letter sink when
    /// `dead_letters` is set. Each gets its own bus handle.
    pub async fn spawn(&self, stages: &[Stage], dead_letters: bool) -> Result<RunningPipeline> {
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        let mut stats = Vec::new();

        for &stage in stages {
            let worker = StageWorker::new(
                self.provider.handle().await?,
                Arc::clone(&self.topology),
                self.transform(stage),
                self.settings,
                cancel.clone(),
            );
            stats.push((stage, worker.stats()));
            tasks.push((stage.to_string(), tokio::spawn(worker.run())));
        }

        if dead_letters {
            let sink = DeadLetterSink::new(
                self.provider.handle().await?,
                Arc::clone(&self.topology),
                Arc::clone(&self.store),
                self.settings,
                cancel.clone(),
            );
            tasks.push(("dead_letter".to_string(), tokio::spawn(sink.run())));
        }

        info!(
            workers = tasks.len(),
            bus = %self.provider.describe(),
            "pipeline started"
        );
        Ok(RunningPipeline {
            cancel,
            tasks,
            stats,
        })
    }
}

/// Handles to spawned workers.
pub struct RunningPipeline {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
    stats: Vec<(Stage, Arc<WorkerStats>)>,
}

impl RunningPipeline {
    pub fn stats(&self) -> Vec<(Stage, StatsSnapshot)> {
        snapshot_all(&self.stats)
    }

    pub fn stage_stats(&self, stage: Stage) -> Option<StatsSnapshot> {
        self.stats
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, stats)| stats.snapshot())
    }

    /// Token that stops every worker when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop taking new messages and wait for every worker to release its
    /// connection. A worker that does not stop within `grace` is aborted.
    /// Returns the final per-stage counters.
    pub async fn shutdown(self, grace: Duration) -> Vec<(Stage, StatsSnapshot)> {
        self.cancel.cancel();
        for (name, mut task) in self.tasks {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(worker = %name, error = %e, "worker task failed"),
                Err(_) => {
                    warn!(worker = %name, "worker did not stop in time, aborting");
                    task.abort();
                }
            }
        }
        info!("pipeline stopped");
        snapshot_all(&self.stats)
    }
}

fn snapshot_all(stats: &[(Stage, Arc<WorkerStats>)]) -> Vec<(Stage, StatsSnapshot)> {
    stats
        .iter()
        .map(|(stage, stats)| (*stage, stats.snapshot()))
        .collect()
}
