//! Shared types, error model, and configuration for ListingFlow.
//!
//! This crate is the foundation depended on by all other ListingFlow crates.
//! It provides:
//! - [`ListingFlowError`] and [`StageError`]
//! - The [`Envelope`] and its wire format
//! - Domain types ([`ListingFields`], [`DistrictInfo`], [`EconomicData`], ...)
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod envelope;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BusConfig, FetchConfig, MEMORY_BUS_ADDRESS, RetryConfig, StoreConfig,
    TopologyConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, render_config,
};
pub use envelope::{
    CURRENT_SCHEMA_VERSION, DeadLetterRecord, Envelope, ListingPayload, RetryRecord, RoutingMeta,
    StageOutput,
};
pub use error::{ListingFlowError, Result, StageError};
pub use types::{
    AnalysisResult, Attractiveness, DealSection, DistrictInfo, EconomicData, ListingFields,
    PropertyType, Stage, StoredRef, UpsertOutcome,
};
