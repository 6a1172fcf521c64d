//! The four `ObservanceSource` implementations: UN,
//! UNESCO, and WHO HTML scrapers sharing one generic client, plus the
//! Calendarific JSON API client.

pub mod calendarific;
pub mod html_scrape;

pub use calendarific::CalendarificSource;
pub use html_scrape::HtmlScrapeSource;

use crate::config::Config;
use crate::observance::{Category, ObservanceSourceDyn, Source};
use std::sync::Arc;

/// Builds the four production observance sources wired to the configured
/// upstream URLs and cache directory.
pub fn build_sources(config: &Config) -> Vec<Arc<dyn ObservanceSourceDyn>> {
    let cache_dir = config.cache_dir();
    vec![
        Arc::new(HtmlScrapeSource::new(
            Source::Un,
            config.observance.un_url.clone(),
            "li",
            Category::Culture,
            7,
            cache_dir.join("un_observances").join("un_days.json"),
        )) as Arc<dyn ObservanceSourceDyn>,
        Arc::new(HtmlScrapeSource::new(
            Source::Unesco,
            config.observance.unesco_url.clone(),
            "li",
            Category::Culture,
            30,
            cache_dir.join("unesco_observances").join("unesco_days.json"),
        )) as Arc<dyn ObservanceSourceDyn>,
        Arc::new(HtmlScrapeSource::new(
            Source::Who,
            config.observance.who_url.clone(),
            "li",
            Category::GlobalHealth,
            30,
            cache_dir.join("who_observances").join("who_days.json"),
        )) as Arc<dyn ObservanceSourceDyn>,
        Arc::new(CalendarificSource::new(
            config.calendarific.api_key.clone(),
            config.calendarific.country.clone(),
            config.calendarific.region.clone(),
            cache_dir.join("calendarific").join("holidays_cache.json"),
        )) as Arc<dyn ObservanceSourceDyn>,
    ]
}
