//! Listing extraction: parser capabilities, page fetching and the extractor
//! that ties them together.
//!
//! This crate provides:
//! - [`adapters`]: the [`ListingParser`] trait, [`ParserRegistry`] and the
//!   built-in cian.ru parsers
//! - [`fetch`]: [`PageSource`] and the reqwest-backed [`PageFetcher`]
//! - [`extract`]: [`Extractor`], which resolves, fetches and parses

pub mod adapters;
pub mod extract;
pub mod fetch;

pub use adapters::{CianRentParser, CianSaleParser, ListingParser, ParserRegistry, check_page};
pub use extract::{Extractor, derive_property_type, derive_section, parse_listing_url};
pub use fetch::{PageFetcher, PageSource, classify_status};
