//! The envelope carried between stages and its wire format.
//!
//! An [`Envelope`] is two structures travelling together: [`RoutingMeta`]
//! (identity, session, retry bookkeeping) and [`ListingPayload`] (the
//! per-stage domain sections). They are merged into one flat camelCase JSON
//! object only when crossing the bus, and the store only ever sees the
//! payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StageError};
use crate::types::{AnalysisResult, DistrictInfo, EconomicData, ListingFields, Stage, StoredRef};

/// Highest envelope schema version this build understands.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

// ---------------------------------------------------------------------------
// Routing metadata
// ---------------------------------------------------------------------------

/// Bookkeeping for the most recent retry of an envelope within one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    pub attempt: u32,
    pub last_error: String,
    pub next_eligible_at: DateTime<Utc>,
}

/// Identity and routing fields. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingMeta {
    #[serde(default)]
    pub subject_id: String,
    #[serde(default)]
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryRecord>,
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Per-stage domain sections. Each section is written by exactly one stage.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<ListingFields>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district: Option<DistrictInfo>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub geo_checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub economy: Option<EconomicData>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub economy_checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored: Option<StoredRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisResult>,
}

/// What a stage transform produced. Applying it fills only that stage's
/// section of the payload.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    Extracted(ListingFields),
    GeoEnriched(Option<DistrictInfo>),
    EconomyEnriched(Option<EconomicData>),
    Persisted(StoredRef),
    Scored(AnalysisResult),
    /// Terminal stage: nothing to append.
    Notified,
}

impl StageOutput {
    /// The stage that produces this kind of output.
    pub fn stage(&self) -> Stage {
        match self {
            StageOutput::Extracted(_) => Stage::Extraction,
            StageOutput::GeoEnriched(_) => Stage::GeoEnrichment,
            StageOutput::EconomyEnriched(_) => Stage::EconomicEnrichment,
            StageOutput::Persisted(_) => Stage::Persistence,
            StageOutput::Scored(_) => Stage::Scoring,
            StageOutput::Notified => Stage::Notification,
        }
    }
}

impl ListingPayload {
    pub fn apply(&mut self, output: StageOutput) {
        match output {
            StageOutput::Extracted(fields) => self.listing = Some(fields),
            StageOutput::GeoEnriched(district) => {
                self.district = district;
                self.geo_checked = true;
            }
            StageOutput::EconomyEnriched(economy) => {
                self.economy = economy;
                self.economy_checked = true;
            }
            StageOutput::Persisted(stored) => self.stored = Some(stored),
            StageOutput::Scored(analysis) => self.analysis = Some(analysis),
            StageOutput::Notified => {}
        }
    }

    /// The domain fields handed to the listing store, keyed by section.
    /// Absent sections are omitted so a later upsert never erases them.
    pub fn domain_fields(&self) -> Result<serde_json::Map<String, serde_json::Value>> {
        let mut fields = serde_json::Map::new();
        if let Some(url) = &self.url {
            fields.insert("url".into(), serde_json::Value::String(url.clone()));
        }
        if let Some(listing) = &self.listing {
            fields.insert("listing".into(), serde_json::to_value(listing)?);
        }
        if let Some(district) = &self.district {
            fields.insert("district".into(), serde_json::to_value(district)?);
        }
        if let Some(economy) = &self.economy {
            fields.insert("economy".into(), serde_json::to_value(economy)?);
        }
        Ok(fields)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The unit of work flowing between stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub meta: RoutingMeta,
    #[serde(flatten)]
    pub payload: ListingPayload,
}

impl Envelope {
    /// A fresh envelope as published by ingestion.
    pub fn new(
        subject_id: impl Into<String>,
        trace_id: impl Into<String>,
        session_id: Option<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            meta: RoutingMeta {
                subject_id: subject_id.into(),
                trace_id: trace_id.into(),
                session_id,
                retry_count: 0,
                retry: None,
                schema_version: CURRENT_SCHEMA_VERSION,
            },
            payload: ListingPayload {
                url: Some(url.into()),
                ..Default::default()
            },
        }
    }

    /// Decode a bus body. A body that is not a JSON object carries no
    /// identity and is a [`StageError::MalformedMessage`]. An object with a
    /// wrongly typed field is a [`StageError::Validation`].
    pub fn from_slice(body: &[u8]) -> std::result::Result<Self, StageError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| StageError::MalformedMessage(e.to_string()))?;
        if !value.is_object() {
            return Err(StageError::MalformedMessage(
                "envelope is not a JSON object".into(),
            ));
        }
        serde_json::from_value(value)
            .map_err(|e| StageError::Validation(format!("invalid envelope field: {e}")))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Routing checks shared by every stage.
    pub fn validate_routing(&self) -> std::result::Result<(), StageError> {
        if self.meta.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(StageError::Validation(format!(
                "schemaVersion {} is newer than supported version {}",
                self.meta.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        if self.meta.subject_id.trim().is_empty() {
            return Err(StageError::Validation("subjectId is missing".into()));
        }
        if self.meta.trace_id.trim().is_empty() {
            return Err(StageError::Validation("traceId is missing".into()));
        }
        Ok(())
    }

    /// Apply a stage's output and hand the envelope to the next stage:
    /// retry bookkeeping starts over.
    pub fn advance(mut self, output: StageOutput) -> Self {
        self.payload.apply(output);
        self.meta.retry_count = 0;
        self.meta.retry = None;
        self
    }

    /// The same envelope scheduled for another attempt at the current stage.
    pub fn for_retry(mut self, last_error: &StageError, next_eligible_at: DateTime<Utc>) -> Self {
        self.meta.retry_count += 1;
        self.meta.retry = Some(RetryRecord {
            attempt: self.meta.retry_count,
            last_error: last_error.to_string(),
            next_eligible_at,
        });
        self
    }
}

// ---------------------------------------------------------------------------
// Dead-letter record
// ---------------------------------------------------------------------------

/// Keys a dead-letter record adds next to the original body.
const FAILURE_KEYS: [&str; 4] = ["reason", "error", "failedAt", "stage"];

/// A permanently failed envelope: the original body plus failure context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub original: serde_json::Map<String, serde_json::Value>,
    /// Classification name, e.g. `TransientError`.
    pub reason: String,
    /// Message of the error that ended processing.
    pub error: String,
    pub failed_at: DateTime<Utc>,
    pub stage: Stage,
}

impl DeadLetterRecord {
    /// Build a record from the raw body that failed. The body must decode as a
    /// JSON object, which holds for every envelope that reached validation.
    pub fn from_body(
        body: &[u8],
        stage: Stage,
        error: &StageError,
        failed_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut original: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(body)?;
        for key in FAILURE_KEYS {
            original.remove(key);
        }
        Ok(Self {
            original,
            reason: error.kind().to_string(),
            error: error.to_string(),
            failed_at,
            stage,
        })
    }

    pub fn from_slice(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.original.get("traceId").and_then(|v| v.as_str())
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.original.get("subjectId").and_then(|v| v.as_str())
    }

    pub fn retry_count(&self) -> u32 {
        self.original
            .get("retryCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }
}
