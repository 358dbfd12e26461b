//! Core domain types: pipeline stages, listing facts, enrichment records,
//! persistence and scoring results.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// A consuming pipeline stage, in flow order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extraction,
    GeoEnrichment,
    EconomicEnrichment,
    Persistence,
    Scoring,
    Notification,
}

impl Stage {
    /// Every consuming stage, in flow order.
    pub const ALL: [Stage; 6] = [
        Stage::Extraction,
        Stage::GeoEnrichment,
        Stage::EconomicEnrichment,
        Stage::Persistence,
        Stage::Scoring,
        Stage::Notification,
    ];

    /// The stage an envelope moves to after this one, if any.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Extraction => Some(Stage::GeoEnrichment),
            Stage::GeoEnrichment => Some(Stage::EconomicEnrichment),
            Stage::EconomicEnrichment => Some(Stage::Persistence),
            Stage::Persistence => Some(Stage::Scoring),
            Stage::Scoring => Some(Stage::Notification),
            Stage::Notification => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::GeoEnrichment => "geo_enrichment",
            Stage::EconomicEnrichment => "economic_enrichment",
            Stage::Persistence => "persistence",
            Stage::Scoring => "scoring",
            Stage::Notification => "notification",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

// ---------------------------------------------------------------------------
// Listing facts (extraction output)
// ---------------------------------------------------------------------------

/// Deal section of a listing, derived from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealSection {
    Rent,
    Purchase,
    #[default]
    Unknown,
}

/// Property type of a listing, derived from its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    Flat,
    House,
    Commercial,
    #[default]
    Unknown,
}

/// Facts extracted from a listing page.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingFields {
    /// Listing page URL.
    pub url: String,
    pub section: DealSection,
    pub property_type: PropertyType,
    /// Price in roubles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Total area in square metres.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area_total: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kitchen_area: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub living_area: Option<f64>,
    /// Room count; a studio is 0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub floor: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_floors: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_built: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_type: Option<String>,
    #[serde(default)]
    pub balcony: bool,
    #[serde(default)]
    pub elevator: bool,
    #[serde(default)]
    pub parking: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_urls: Vec<String>,
    /// Name of the parser capability that produced these fields.
    pub parser_name: String,
}

// ---------------------------------------------------------------------------
// Enrichment records
// ---------------------------------------------------------------------------

/// District-level geographic facts for a listing address.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictInfo {
    pub region_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub district_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub population: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_price_per_sqm: Option<f64>,
    /// Incidents per resident.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crime_rate: Option<f64>,
    /// Distance to the nearest metro station, km.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metro_distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub green_area_share: Option<f64>,
}

/// Regional economic indicators.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EconomicData {
    pub region_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_interest_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_earnings: Option<f64>,
    /// Percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unemployment_rate: Option<f64>,
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Outcome kind of a listing upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

impl std::fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpsertOutcome::Inserted => "Inserted",
            UpsertOutcome::Updated => "Updated",
            UpsertOutcome::Unchanged => "Unchanged",
        };
        f.write_str(s)
    }
}

/// Result of a listing upsert: storage identity plus outcome kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredRef {
    pub storage_id: String,
    pub outcome: UpsertOutcome,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Investment attractiveness label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Attractiveness {
    High,
    Medium,
    Low,
}

impl Attractiveness {
    pub fn as_str(self) -> &'static str {
        match self {
            Attractiveness::High => "High",
            Attractiveness::Medium => "Medium",
            Attractiveness::Low => "Low",
        }
    }
}

/// Output of the scoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResult {
    pub score: u32,
    pub attractiveness_label: Attractiveness,
    /// Estimated rent yield, percent.
    pub estimated_yield: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_linear() {
        let mut walked = vec![Stage::Extraction];
        while let Some(next) = walked.last().and_then(|s| s.next()) {
            walked.push(next);
        }
        assert_eq!(walked, Stage::ALL.to_vec());
    }

    #[test]
    fn stage_parses_from_name() {
        for stage in Stage::ALL {
            assert_eq!(stage.as_str().parse::<Stage>(), Ok(stage));
        }
        assert!("ingestion".parse::<Stage>().is_err());
    }

    #[test]
    fn listing_fields_use_camel_case() {
        let fields = ListingFields {
            url: "https://spb.cian.ru/rent/flat/305548024/".into(),
            section: DealSection::Rent,
            property_type: PropertyType::Flat,
            area_total: Some(42.5),
            parser_name: "cian_rent".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&fields).expect("serialize");
        assert_eq!(json["areaTotal"], 42.5);
        assert_eq!(json["section"], "rent");
        assert_eq!(json["propertyType"], "flat");
        assert!(json.get("price").is_none());
    }

    #[test]
    fn outcome_wire_names() {
        assert_eq!(
            serde_json::to_string(&UpsertOutcome::Unchanged).unwrap(),
            "\"Unchanged\""
        );
        assert_eq!(UpsertOutcome::Inserted.to_string(), "Inserted");
    }
}
