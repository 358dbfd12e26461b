//! cian.ru listing parsers (rent and sale flats share one page layout).

use std::sync::LazyLock;

use listingflow_shared::{ListingFields, StageError};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::{ListingParser, collapse, select_text};

/// Flats for rent: `*.cian.ru/rent/flat/<id>/`.
pub struct CianRentParser;

/// Flats for sale: `*.cian.ru/sale/flat/<id>/`.
pub struct CianSaleParser;

impl ListingParser for CianRentParser {
    fn matches(&self, url: &Url) -> bool {
        is_cian(url) && url.path().contains("/rent/flat/")
    }

    fn parse(&self, doc: &Html) -> Result<ListingFields, StageError> {
        Ok(parse_offer_page(doc))
    }

    fn name(&self) -> &str {
        "cian_rent"
    }
}

impl ListingParser for CianSaleParser {
    fn matches(&self, url: &Url) -> bool {
        is_cian(url) && url.path().contains("/sale/flat/")
    }

    fn parse(&self, doc: &Html) -> Result<ListingFields, StageError> {
        Ok(parse_offer_page(doc))
    }

    fn name(&self) -> &str {
        "cian_sale"
    }
}

fn is_cian(url: &Url) -> bool {
    url.host_str()
        .is_some_and(|host| host == "cian.ru" || host.ends_with(".cian.ru"))
}

// ---------------------------------------------------------------------------
// Selectors
// ---------------------------------------------------------------------------

macro_rules! selector {
    ($name:ident, $css:expr) => {
        static $name: LazyLock<Selector> =
            LazyLock::new(|| Selector::parse($css).expect("valid selector"));
    };
}

selector!(PRICE_SEL, "div[data-testid='price-amount']");
selector!(ADDRESS_SEL, "div[data-name='AddressContainer']");
selector!(DESCRIPTION_SEL, "div[data-name='Description'] div");
selector!(TITLE_SEL, "h1");
selector!(
    SUMMARY_ITEM_SEL,
    "div[data-name='OfferSummaryInfoItem'], div[data-name='ObjectFactoidsItem']"
);
selector!(SUMMARY_TEXT_SEL, "p, span");
selector!(GALLERY_IMG_SEL, "[data-name*='Gallery'] img");

static NON_NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^\d,.]").expect("valid regex"));
static FLOOR_OF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+из\s+(\d+)").expect("valid regex"));
static FLOOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+этаж").expect("valid regex"));
static YEAR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d{4}").expect("valid regex"));
static ROOMS_DIGIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)-комн\.|\b(\d+)\s*комн(?:\.|ат)?").expect("valid regex"));
static ROOMS_EURO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"евро(дву|тре|трё|четыре|четырё)шка").expect("valid regex")
});
static ROOMS_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(одно|двух|трех|трёх|четырех|четырёх|пяти|шести|семи|восьми|девяти|десяти)комнатная")
        .expect("valid regex")
});

const BUILDING_TYPES: [&str; 5] = ["панельный", "кирпичный", "монолитный", "блочный", "деревянный"];
const PARKING_WORDS: [&str; 2] = ["парковка", "машиноместо"];

// ---------------------------------------------------------------------------
// Page parsing
// ---------------------------------------------------------------------------

fn parse_offer_page(doc: &Html) -> ListingFields {
    let summary = summary_items(doc);
    let lookup = |label: &str| summary_value(&summary, label);

    let description = select_text(doc, &DESCRIPTION_SEL);
    let description_lower = description.as_deref().unwrap_or_default().to_lowercase();

    let (floor, total_floors) = lookup("Этаж").map(parse_floor).unwrap_or((None, None));

    let building_type = lookup("Строительная серия")
        .filter(|v| !v.to_lowercase().contains("нет информации"))
        .map(str::to_string)
        .or_else(|| {
            BUILDING_TYPES
                .iter()
                .find(|kw| description_lower.contains(*kw))
                .map(|kw| kw.to_string())
        });

    let parking = match lookup("Парковка").or_else(|| lookup("Паркинг")) {
        Some(v) if !v.to_lowercase().contains("нет") => true,
        _ => PARKING_WORDS.iter().any(|kw| description_lower.contains(kw)),
    };

    ListingFields {
        price: select_text(doc, &PRICE_SEL).and_then(|t| parse_price(&t)),
        address: select_text(doc, &ADDRESS_SEL),
        area_total: lookup("Общая площадь").and_then(parse_area),
        kitchen_area: lookup("Площадь кухни").and_then(parse_area),
        living_area: lookup("Жилая площадь").and_then(parse_area),
        rooms: select_text(doc, &TITLE_SEL).and_then(|t| parse_rooms(&t)),
        floor,
        total_floors,
        year_built: lookup("Год постройки")
            .and_then(|v| YEAR_RE.find(v))
            .and_then(|m| m.as_str().parse().ok()),
        building_type,
        balcony: lookup("Балкон").is_some_and(|v| !v.to_lowercase().contains("нет")),
        elevator: lookup("Количество лифтов")
            .is_some_and(|v| !v.to_lowercase().contains("нет информации")),
        parking,
        image_urls: image_urls(doc),
        description,
        ..Default::default()
    }
}

/// Value for `label`: an exact label match wins over a partial one.
fn summary_value<'a>(summary: &'a [(String, String)], label: &str) -> Option<&'a str> {
    summary
        .iter()
        .find(|(l, _)| l == label)
        .or_else(|| summary.iter().find(|(l, _)| l.contains(label)))
        .map(|(_, v)| v.as_str())
}

/// `(label, value)` pairs from the offer summary and factoid blocks.
fn summary_items(doc: &Html) -> Vec<(String, String)> {
    doc.select(&SUMMARY_ITEM_SEL)
        .filter_map(|item: ElementRef<'_>| {
            let texts: Vec<String> = item
                .select(&SUMMARY_TEXT_SEL)
                .map(|el| collapse(&el.text().collect::<String>()))
                .filter(|t| !t.is_empty())
                .collect();
            match texts.as_slice() {
                [label, .., value] => Some((label.clone(), value.clone())),
                _ => None,
            }
        })
        .collect()
}

fn image_urls(doc: &Html) -> Vec<String> {
    doc.select(&GALLERY_IMG_SEL)
        .filter_map(|img| {
            img.value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
        })
        .filter(|src| src.starts_with("http"))
        .map(str::to_string)
        .collect()
}

pub(crate) fn parse_price(text: &str) -> Option<u64> {
    let digits: String = text.chars().filter(char::is_ascii_digit).collect();
    digits.parse().ok()
}

pub(crate) fn parse_area(text: &str) -> Option<f64> {
    NON_NUMERIC_RE
        .replace_all(text, "")
        .replace(',', ".")
        .trim_matches('.')
        .parse()
        .ok()
}

fn parse_floor(text: &str) -> (Option<i32>, Option<u32>) {
    if let Some(caps) = FLOOR_OF_RE.captures(text) {
        return (caps[1].parse().ok(), caps[2].parse().ok());
    }
    let floor = FLOOR_RE.captures(text).and_then(|c| c[1].parse().ok());
    (floor, None)
}

fn number_word(word: &str) -> Option<u32> {
    let n = match word {
        "одно" => 1,
        "двух" => 2,
        "трех" | "трёх" => 3,
        "четырех" | "четырёх" => 4,
        "пяти" => 5,
        "шести" => 6,
        "семи" => 7,
        "восьми" => 8,
        "девяти" => 9,
        "десяти" => 10,
        _ => return None,
    };
    Some(n)
}

/// Room count from a listing title. A studio counts as 0 rooms; a "euro"
/// layout counts its kitchen-living room.
pub(crate) fn parse_rooms(title: &str) -> Option<u32> {
    let title = title.to_lowercase();
    if title.contains("студия") {
        return Some(0);
    }
    if let Some(caps) = ROOMS_DIGIT_RE.captures(&title) {
        return caps
            .get(1)
            .or_else(|| caps.get(2))
            .and_then(|m| m.as_str().parse().ok());
    }
    if let Some(caps) = ROOMS_EURO_RE.captures(&title) {
        let rooms = match &caps[1] {
            "дву" => 2,
            "тре" | "трё" => 3,
            _ => 4,
        };
        return Some(rooms);
    }
    if let Some(caps) = ROOMS_WORD_RE.captures(&title) {
        return number_word(&caps[1]);
    }
    if title.contains("комната") {
        return Some(1);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../../fixtures/html/cian-rent-flat.html");

    #[test]
    fn matches_only_cian_flats() {
        let rent = Url::parse("https://spb.cian.ru/rent/flat/305548024/").unwrap();
        let fake = Url::parse("https://notcian.ru/rent/flat/1/").unwrap();
        assert!(CianRentParser.matches(&rent));
        assert!(!CianSaleParser.matches(&rent));
        assert!(!CianRentParser.matches(&fake));
    }

    #[test]
    fn parses_fixture_page() {
        let doc = Html::parse_document(FIXTURE);
        let fields = CianRentParser.parse(&doc).unwrap();

        assert_eq!(fields.price, Some(45_000));
        assert_eq!(
            fields.address.as_deref(),
            Some("Санкт-Петербург, р-н Невский, Дальневосточный проспект, 12к2")
        );
        assert_eq!(fields.area_total, Some(42.5));
        assert_eq!(fields.kitchen_area, Some(10.0));
        assert_eq!(fields.living_area, Some(20.3));
        assert_eq!(fields.rooms, Some(2));
        assert_eq!(fields.floor, Some(7));
        assert_eq!(fields.total_floors, Some(16));
        assert_eq!(fields.year_built, Some(2014));
        assert!(fields.balcony);
        assert!(fields.elevator);
        assert!(fields.parking);
        assert_eq!(fields.building_type.as_deref(), Some("монолитный"));
        assert_eq!(fields.image_urls.len(), 2);
        assert!(fields.description.unwrap().contains("Сдается"));
    }

    #[test]
    fn room_titles() {
        assert_eq!(parse_rooms("Студия, 25 м²"), Some(0));
        assert_eq!(parse_rooms("2-комн. квартира, 42,5 м²"), Some(2));
        assert_eq!(parse_rooms("Сдается 3 комнаты"), Some(3));
        assert_eq!(parse_rooms("Евродвушка у метро"), Some(2));
        assert_eq!(parse_rooms("Однокомнатная квартира"), Some(1));
        assert_eq!(parse_rooms("Комната в квартире"), Some(1));
        assert_eq!(parse_rooms("Апартаменты"), None);
    }

    #[test]
    fn numeric_cleanup() {
        assert_eq!(parse_price("45 000 ₽/мес."), Some(45_000));
        assert_eq!(parse_price("договорная"), None);
        assert_eq!(parse_area("42,5 м²"), Some(42.5));
        assert_eq!(parse_area("—"), None);
    }
}
