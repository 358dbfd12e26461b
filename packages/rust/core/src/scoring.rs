//! Investment scoring of an enriched listing.

use listingflow_shared::{AnalysisResult, Attractiveness, DistrictInfo, EconomicData, ListingFields};

/// Price per square metre below which a listing gets the top price tier.
const CHEAP_PER_SQM: f64 = 130_000.0;
/// Upper bound of the middle price tier.
const FAIR_PER_SQM: f64 = 160_000.0;

const HIGH_THRESHOLD: u32 = 6;
const MEDIUM_THRESHOLD: u32 = 4;

/// Yield percent per score point.
const YIELD_PER_POINT: f64 = 0.5;

/// The facts the score depends on. Unknown facts contribute nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoringInput {
    pub price: Option<u64>,
    pub area_total: Option<f64>,
    pub rooms: Option<u32>,
    pub metro_distance: Option<f64>,
    pub crime_rate: Option<f64>,
    pub unemployment_rate: Option<f64>,
}

impl ScoringInput {
    pub fn from_parts(
        listing: &ListingFields,
        district: Option<&DistrictInfo>,
        economy: Option<&EconomicData>,
    ) -> Self {
        Self {
            price: listing.price,
            area_total: listing.area_total,
            rooms: listing.rooms,
            metro_distance: district.and_then(|d| d.metro_distance),
            crime_rate: district.and_then(|d| d.crime_rate),
            unemployment_rate: economy.and_then(|e| e.unemployment_rate),
        }
    }
}

/// Score a listing. Pure and deterministic.
pub fn score(input: &ScoringInput) -> AnalysisResult {
    let mut score = 0;

    if let (Some(price), Some(area)) = (input.price, input.area_total) {
        if price > 0 && area > 0.0 {
            let per_sqm = price as f64 / area;
            score += if per_sqm < CHEAP_PER_SQM {
                3
            } else if per_sqm < FAIR_PER_SQM {
                2
            } else {
                1
            };
        }
    }

    if input.rooms.is_some_and(|r| r <= 2) {
        score += 1;
    }
    if input.metro_distance.is_some_and(|d| d < 1.0) {
        score += 2;
    }
    if input.crime_rate.is_some_and(|c| c < 0.04) {
        score += 1;
    }
    if input.unemployment_rate.is_some_and(|u| u < 3.5) {
        score += 1;
    }

    AnalysisResult {
        score,
        attractiveness_label: label(score),
        estimated_yield: f64::from(score) * YIELD_PER_POINT,
    }
}

pub fn label(score: u32) -> Attractiveness {
    if score >= HIGH_THRESHOLD {
        Attractiveness::High
    } else if score >= MEDIUM_THRESHOLD {
        Attractiveness::Medium
    } else {
        Attractiveness::Low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_listing_scores_high() {
        let result = score(&ScoringInput {
            price: Some(9_000_000),
            area_total: Some(60.0),
            rooms: Some(2),
            metro_distance: Some(0.8),
            crime_rate: Some(0.03),
            unemployment_rate: Some(3.0),
        });
        assert_eq!(result.score, 7);
        assert_eq!(result.attractiveness_label, Attractiveness::High);
        assert_eq!(result.estimated_yield, 3.5);
    }

    #[test]
    fn price_tiers() {
        let tier = |price: u64| {
            score(&ScoringInput {
                price: Some(price),
                area_total: Some(100.0),
                ..Default::default()
            })
            .score
        };
        assert_eq!(tier(12_000_000), 3);
        assert_eq!(tier(13_000_000), 2);
        assert_eq!(tier(15_999_999), 2);
        assert_eq!(tier(16_000_000), 1);
    }

    #[test]
    fn unknown_facts_score_nothing() {
        let result = score(&ScoringInput::default());
        assert_eq!(result.score, 0);
        assert_eq!(result.attractiveness_label, Attractiveness::Low);
        assert_eq!(result.estimated_yield, 0.0);

        let zero_area = score(&ScoringInput {
            price: Some(5_000_000),
            area_total: Some(0.0),
            ..Default::default()
        });
        assert_eq!(zero_area.score, 0);
    }

    #[test]
    fn label_boundaries() {
        assert_eq!(label(3), Attractiveness::Low);
        assert_eq!(label(4), Attractiveness::Medium);
        assert_eq!(label(5), Attractiveness::Medium);
        assert_eq!(label(6), Attractiveness::High);
    }

    #[test]
    fn input_from_enriched_parts() {
        let listing = ListingFields {
            price: Some(45_000),
            area_total: Some(42.5),
            rooms: Some(2),
            ..Default::default()
        };
        let district = DistrictInfo {
            region_name: "Saint Petersburg".into(),
            metro_distance: Some(2.5),
            crime_rate: Some(0.05),
            ..Default::default()
        };
        let input = ScoringInput::from_parts(&listing, Some(&district), None);
        assert_eq!(input.metro_distance, Some(2.5));
        assert_eq!(input.unemployment_rate, None);
        // 45000 / 42.5 is well under the cheap tier, plus small flat.
        assert_eq!(score(&input).score, 4);
    }
}
