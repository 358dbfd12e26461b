//! Ingestion: turn a listing URL into the first envelope on the bus.

use std::sync::{Arc, LazyLock};

use listingflow_bus::MessageBus;
use listingflow_extraction::parse_listing_url;
use listingflow_shared::{Envelope, ListingFlowError, Result, Stage};
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{info, instrument};
use url::Url;
use uuid::Uuid;

use crate::topology::Topology;

static LISTING_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{5,}").expect("valid regex"));

/// Identity assigned to a submitted URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub subject_id: String,
    pub trace_id: String,
}

/// Stable subject id for a listing URL: the site's numeric listing id when
/// the path carries one, else a hash of the URL.
pub fn subject_id_for(url: &Url) -> String {
    if let Some(m) = LISTING_ID_RE.find(url.path()) {
        return m.as_str().to_string();
    }
    let digest = Sha256::digest(url.as_str().as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("url-{hex}")
}

/// Publishes new listing URLs to the extraction stage.
pub struct Ingestor {
    bus: Arc<dyn MessageBus>,
    topology: Arc<Topology>,
}

impl Ingestor {
    /// Connect `bus` and declare the topology.
    pub async fn connect(bus: Arc<dyn MessageBus>, topology: Arc<Topology>) -> Result<Self> {
        bus.connect().await?;
        topology.declare(bus.as_ref()).await?;
        Ok(Self { bus, topology })
    }

    /// Validate `raw_url` and publish a fresh envelope for it.
    #[instrument(skip_all, fields(url = %raw_url))]
    pub async fn submit(&self, raw_url: &str, session_id: Option<String>) -> Result<Submission> {
        let url = parse_listing_url(raw_url).map_err(|e| ListingFlowError::validation(e.to_string()))?;

        let submission = Submission {
            subject_id: subject_id_for(&url),
            trace_id: Uuid::now_v7().to_string(),
        };
        let envelope = Envelope::new(
            submission.subject_id.clone(),
            submission.trace_id.clone(),
            session_id,
            url.as_str(),
        );

        let route = self.topology.inbound(Stage::Extraction);
        self.bus
            .publish(&route.topic, &route.key, &envelope.to_vec()?)
            .await?;

        info!(
            subject_id = %submission.subject_id,
            trace_id = %submission.trace_id,
            "listing submitted"
        );
        Ok(submission)
    }

    pub async fn close(&self) -> Result<()> {
        self.bus.disconnect().await
    }
}
