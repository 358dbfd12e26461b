//! Geo and economic enrichment capabilities.
//!
//! Both lookups are traits so a real geocoder or statistics service can be
//! plugged in; the built-in directories hold a fixed set of regions. A lookup
//! that finds nothing returns `Ok(None)`, which is not an error: the envelope
//! moves on with the section left empty.

use async_trait::async_trait;
use listingflow_shared::{DistrictInfo, EconomicData, StageError};

pub const SAINT_PETERSBURG: &str = "Санкт-Петербург";
pub const MOSCOW: &str = "Москва";
pub const LENINGRAD_OBLAST: &str = "Ленинградская область";

/// District facts for a listing address.
#[async_trait]
pub trait GeoLookup: Send + Sync {
    async fn lookup(&self, address: &str) -> Result<Option<DistrictInfo>, StageError>;
}

/// Regional economic indicators.
#[async_trait]
pub trait EconomicLookup: Send + Sync {
    async fn lookup(&self, region: &str) -> Result<Option<EconomicData>, StageError>;
}

/// The city an address is in, when it names one we know.
pub fn region_from_address(address: &str) -> Option<&'static str> {
    [SAINT_PETERSBURG, MOSCOW]
        .into_iter()
        .find(|city| address.contains(city))
}

// ---------------------------------------------------------------------------
// Built-in geo directory
// ---------------------------------------------------------------------------

struct District {
    marker: &'static str,
    name: &'static str,
    population: u64,
    metro_distance: f64,
    crime_rate: f64,
    green_area_share: f64,
}

static SPB_DISTRICTS: [District; 2] = [
    District {
        marker: "Невский",
        name: "Невский район",
        population: 520_000,
        metro_distance: 2.5,
        crime_rate: 0.05,
        green_area_share: 0.15,
    },
    District {
        marker: "Московский",
        name: "Московский район",
        population: 350_000,
        metro_distance: 1.0,
        crime_rate: 0.03,
        green_area_share: 0.20,
    },
];

static SPB_OTHER_DISTRICT: District = District {
    marker: "",
    name: "Неизвестный район",
    population: 0,
    metro_distance: 10.0,
    crime_rate: 0.1,
    green_area_share: 0.05,
};

/// Fixed district data for Saint Petersburg and central Moscow.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticGeoDirectory;

#[async_trait]
impl GeoLookup for StaticGeoDirectory {
    async fn lookup(&self, address: &str) -> Result<Option<DistrictInfo>, StageError> {
        if address.contains(SAINT_PETERSBURG) {
            let district = SPB_DISTRICTS
                .iter()
                .find(|d| address.contains(d.marker))
                .unwrap_or(&SPB_OTHER_DISTRICT);
            return Ok(Some(DistrictInfo {
                region_name: SAINT_PETERSBURG.into(),
                city_name: Some(SAINT_PETERSBURG.into()),
                district_name: Some(district.name.into()),
                population: Some(district.population),
                avg_price_per_sqm: Some(150_000.0),
                crime_rate: Some(district.crime_rate),
                metro_distance: Some(district.metro_distance),
                green_area_share: Some(district.green_area_share),
            }));
        }

        if address.contains(MOSCOW) {
            return Ok(Some(DistrictInfo {
                region_name: MOSCOW.into(),
                city_name: Some(MOSCOW.into()),
                district_name: Some("Центральный АО".into()),
                population: Some(1_000_000),
                avg_price_per_sqm: Some(300_000.0),
                crime_rate: Some(0.04),
                metro_distance: Some(0.5),
                green_area_share: Some(0.10),
            }));
        }

        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Built-in economic directory
// ---------------------------------------------------------------------------

/// Fixed regional indicators.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticEconomicDirectory;

const KEY_INTEREST_RATE: f64 = 16.0;

#[async_trait]
impl EconomicLookup for StaticEconomicDirectory {
    async fn lookup(&self, region: &str) -> Result<Option<EconomicData>, StageError> {
        let (avg_earnings, unemployment_rate) = if region.contains(SAINT_PETERSBURG) {
            (100_000.0, 3.0)
        } else if region.contains(MOSCOW) {
            (150_000.0, 2.5)
        } else if region.contains(LENINGRAD_OBLAST) {
            (70_000.0, 4.0)
        } else {
            return Ok(None);
        };

        Ok(Some(EconomicData {
            region_name: region.to_string(),
            key_interest_rate: Some(KEY_INTEREST_RATE),
            avg_earnings: Some(avg_earnings),
            unemployment_rate: Some(unemployment_rate),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nevsky_district() {
        let info = StaticGeoDirectory
            .lookup("Санкт-Петербург, р-н Невский, Дальневосточный проспект, 12к2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.region_name, SAINT_PETERSBURG);
        assert_eq!(info.district_name.as_deref(), Some("Невский район"));
        assert_eq!(info.metro_distance, Some(2.5));
        assert_eq!(info.crime_rate, Some(0.05));
    }

    #[tokio::test]
    async fn unknown_spb_district_falls_back() {
        let info = StaticGeoDirectory
            .lookup("Санкт-Петербург, Приморский район, ул. Савушкина, 10")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.district_name.as_deref(), Some("Неизвестный район"));
        assert_eq!(info.metro_distance, Some(10.0));
    }

    #[tokio::test]
    async fn unknown_city_is_none() {
        assert!(StaticGeoDirectory.lookup("Казань, ул. Баумана, 1").await.unwrap().is_none());
        assert!(StaticEconomicDirectory.lookup("Татарстан").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn economic_indicators() {
        let moscow = StaticEconomicDirectory.lookup(MOSCOW).await.unwrap().unwrap();
        assert_eq!(moscow.unemployment_rate, Some(2.5));

        let oblast = StaticEconomicDirectory
            .lookup(LENINGRAD_OBLAST)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(oblast.unemployment_rate, Some(4.0));
        assert_eq!(oblast.key_interest_rate, Some(16.0));
    }

    #[test]
    fn region_inferred_from_address() {
        assert_eq!(region_from_address("Москва, ул. Тверская, 1"), Some(MOSCOW));
        assert_eq!(region_from_address("Казань"), None);
    }
}
