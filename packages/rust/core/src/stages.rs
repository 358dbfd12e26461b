//! The six stage transforms.

use std::sync::Arc;

use async_trait::async_trait;
use listingflow_extraction::{Extractor, parse_listing_url};
use listingflow_shared::{Envelope, ListingFields, Stage, StageError, StageOutput};
use listingflow_storage::ListingStore;
use tracing::{debug, info, warn};

use crate::enrichment::{EconomicLookup, GeoLookup, region_from_address};
use crate::notify::{NotificationChannel, format_message};
use crate::scoring::{ScoringInput, score};
use crate::worker::StageTransform;

fn require_listing(envelope: &Envelope) -> Result<&ListingFields, StageError> {
    envelope
        .payload
        .listing
        .as_ref()
        .ok_or_else(|| StageError::Validation("listing section is missing".into()))
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

pub struct ExtractionStage {
    extractor: Extractor,
}

impl ExtractionStage {
    pub fn new(extractor: Extractor) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl StageTransform for ExtractionStage {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        let url = envelope
            .payload
            .url
            .as_deref()
            .ok_or_else(|| StageError::Validation("url is missing".into()))?;
        parse_listing_url(url).map(|_| ())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let url = envelope.payload.url.as_deref().unwrap_or_default();
        let fields = self.extractor.extract(url).await?;
        Ok(StageOutput::Extracted(fields))
    }
}

// ---------------------------------------------------------------------------
// Geo enrichment
// ---------------------------------------------------------------------------

pub struct GeoStage {
    lookup: Arc<dyn GeoLookup>,
}

impl GeoStage {
    pub fn new(lookup: Arc<dyn GeoLookup>) -> Self {
        Self { lookup }
    }
}

#[async_trait]
impl StageTransform for GeoStage {
    fn stage(&self) -> Stage {
        Stage::GeoEnrichment
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        require_listing(envelope).map(|_| ())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let listing = require_listing(envelope)?;
        let Some(address) = listing.address.as_deref().filter(|a| !a.trim().is_empty()) else {
            debug!("no address, skipping geo lookup");
            return Ok(StageOutput::GeoEnriched(None));
        };

        let district = self.lookup.lookup(address).await?;
        if district.is_none() {
            debug!(address, "no district data");
        }
        Ok(StageOutput::GeoEnriched(district))
    }
}

// ---------------------------------------------------------------------------
// Economic enrichment
// ---------------------------------------------------------------------------

pub struct EconomicStage {
    lookup: Arc<dyn EconomicLookup>,
}

impl EconomicStage {
    pub fn new(lookup: Arc<dyn EconomicLookup>) -> Self {
        Self { lookup }
    }
}

/// Region for the economic lookup: the district's region, else the city the
/// address names.
fn economic_region(envelope: &Envelope) -> Option<String> {
    envelope
        .payload
        .district
        .as_ref()
        .map(|d| d.region_name.clone())
        .filter(|r| !r.is_empty())
        .or_else(|| {
            envelope
                .payload
                .listing
                .as_ref()
                .and_then(|l| l.address.as_deref())
                .and_then(region_from_address)
                .map(str::to_string)
        })
}

#[async_trait]
impl StageTransform for EconomicStage {
    fn stage(&self) -> Stage {
        Stage::EconomicEnrichment
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        require_listing(envelope).map(|_| ())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let Some(region) = economic_region(envelope) else {
            debug!("region unknown, skipping economic lookup");
            return Ok(StageOutput::EconomyEnriched(None));
        };
        let economy = self.lookup.lookup(&region).await?;
        Ok(StageOutput::EconomyEnriched(economy))
    }
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

pub struct PersistenceStage {
    store: Arc<ListingStore>,
}

impl PersistenceStage {
    pub fn new(store: Arc<ListingStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageTransform for PersistenceStage {
    fn stage(&self) -> Stage {
        Stage::Persistence
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        require_listing(envelope).map(|_| ())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let fields = envelope
            .payload
            .domain_fields()
            .map_err(|e| StageError::Persistence(e.to_string()))?;
        let stored = self
            .store
            .upsert(&envelope.meta.subject_id, &fields)
            .await
            .map_err(|e| StageError::Persistence(e.to_string()))?;

        info!(storage_id = %stored.storage_id, outcome = %stored.outcome, "listing persisted");
        Ok(StageOutput::Persisted(stored))
    }
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

pub struct ScoringStage;

#[async_trait]
impl StageTransform for ScoringStage {
    fn stage(&self) -> Stage {
        Stage::Scoring
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        require_listing(envelope)?;
        if envelope.payload.stored.is_none() {
            return Err(StageError::Validation("stored section is missing".into()));
        }
        Ok(())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let listing = require_listing(envelope)?;
        let input = ScoringInput::from_parts(
            listing,
            envelope.payload.district.as_ref(),
            envelope.payload.economy.as_ref(),
        );
        let analysis = score(&input);
        info!(
            score = analysis.score,
            label = analysis.attractiveness_label.as_str(),
            "listing scored"
        );
        Ok(StageOutput::Scored(analysis))
    }
}

// ---------------------------------------------------------------------------
// Notification
// ---------------------------------------------------------------------------

pub struct NotificationStage {
    channel: Arc<dyn NotificationChannel>,
}

impl NotificationStage {
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl StageTransform for NotificationStage {
    fn stage(&self) -> Stage {
        Stage::Notification
    }

    fn validate(&self, envelope: &Envelope) -> Result<(), StageError> {
        if envelope.payload.analysis.is_none() {
            return Err(StageError::Validation("analysis section is missing".into()));
        }
        Ok(())
    }

    async fn process(&self, envelope: &Envelope) -> Result<StageOutput, StageError> {
        let Some(analysis) = envelope.payload.analysis.as_ref() else {
            return Err(StageError::Validation("analysis section is missing".into()));
        };
        let Some(session_id) = envelope.meta.session_id.as_deref() else {
            debug!("no session, nothing to notify");
            return Ok(StageOutput::Notified);
        };

        let text = format_message(envelope, analysis);
        // Delivery failures are not retried.
        if let Err(reason) = self.channel.send(session_id, &text).await {
            warn!(session_id, %reason, "notification not delivered");
        }
        Ok(StageOutput::Notified)
    }
}
