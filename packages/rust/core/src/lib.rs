//! Pipeline orchestration for listing ingestion.
//!
//! A listing URL enters through [`Ingestor::submit`] and travels as an
//! [`Envelope`](listingflow_shared::Envelope) through six stage workers
//! (extraction, geo enrichment, economic enrichment, persistence, scoring,
//! notification). Each worker consumes its own queue, acknowledges a message
//! only after it reached a terminal state, and routes failures to a retry or
//! to the dead-letter queue drained by [`DeadLetterSink`].

pub mod dead_letter;
pub mod enrichment;
pub mod ingest;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod scoring;
pub mod stages;
pub mod topology;
pub mod worker;

pub use dead_letter::DeadLetterSink;
pub use enrichment::{
    EconomicLookup, GeoLookup, StaticEconomicDirectory, StaticGeoDirectory, region_from_address,
};
pub use ingest::{Ingestor, Submission, subject_id_for};
pub use notify::{LogChannel, NotificationChannel, format_message};
pub use pipeline::{Capabilities, Pipeline, RunningPipeline};
pub use retry::RetryPolicy;
pub use scoring::{ScoringInput, score};
pub use stages::{
    EconomicStage, ExtractionStage, GeoStage, NotificationStage, PersistenceStage, ScoringStage,
};
pub use topology::{Route, Topology};
pub use worker::{
    Outcome, StageTransform, StageWorker, StatsSnapshot, WorkerSettings, WorkerStats,
};
