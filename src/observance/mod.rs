//! Observance sources and aggregation.

pub mod aggregator;
pub mod sources;
pub mod ssrf;

pub use aggregator::aggregate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `date_mmdd` identity component, `MM-DD`.
pub type DateMmDd = crate::MonthDay;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    GlobalHealth,
    Tech,
    Culture,
    Company,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::GlobalHealth => "Global Health",
            Category::Tech => "Tech",
            Category::Culture => "Culture",
            Category::Company => "Company",
        }
    }
}

/// Priority ordering for deduplication: UN > UNESCO > WHO > Calendarific > Custom.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Un,
    Unesco,
    Who,
    Calendarific,
    Custom,
}

impl Source {
    /// Lower is higher priority.
    pub(crate) fn priority(&self) -> u8 {
        match self {
            Source::Un => 0,
            Source::Unesco => 1,
            Source::Who => 2,
            Source::Calendarific => 3,
            Source::Custom => 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialDay {
    pub date: DateMmDd,
    pub name: String,
    pub category: Category,
    pub description: String,
    pub source: Source,
    pub url: Option<String>,
    pub emoji: Option<String>,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct SourceStatus {
    pub enabled: bool,
    pub cache_fresh: bool,
    pub observance_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct RefreshOutcome {
    pub observances_count: usize,
    pub refreshed_at: DateTime<Utc>,
}

/// Uniform contract every observance upstream implements.
pub trait ObservanceSource: Send + Sync {
    fn name(&self) -> Source;

    fn refresh(
        &self,
        force: bool,
    ) -> impl std::future::Future<Output = crate::error::Result<RefreshOutcome>> + Send;

    fn status(&self) -> impl std::future::Future<Output = crate::error::Result<SourceStatus>> + Send;

    fn lookup(
        &self,
        date: DateMmDd,
    ) -> impl std::future::Future<Output = crate::error::Result<Vec<SpecialDay>>> + Send;
}

/// Dynamic companion so the aggregator can hold a heterogeneous
/// `Vec<Arc<dyn ObservanceSourceDyn>>` of the four upstreams.
pub trait ObservanceSourceDyn: Send + Sync {
    fn name(&self) -> Source;

    fn refresh<'a>(
        &'a self,
        force: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<RefreshOutcome>> + Send + 'a>>;

    fn status<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<SourceStatus>> + Send + 'a>>;

    fn lookup<'a>(
        &'a self,
        date: DateMmDd,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<Vec<SpecialDay>>> + Send + 'a>>;
}

impl<T: ObservanceSource> ObservanceSourceDyn for T {
    fn name(&self) -> Source {
        ObservanceSource::name(self)
    }

    fn refresh<'a>(
        &'a self,
        force: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<RefreshOutcome>> + Send + 'a>> {
        Box::pin(ObservanceSource::refresh(self, force))
    }

    fn status<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<SourceStatus>> + Send + 'a>> {
        Box::pin(ObservanceSource::status(self))
    }

    fn lookup<'a>(
        &'a self,
        date: DateMmDd,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = crate::error::Result<Vec<SpecialDay>>> + Send + 'a>> {
        Box::pin(ObservanceSource::lookup(self, date))
    }
}

/// On-disk shape of one scrape source's cache, `{last_updated, observances}`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceCacheFile {
    #[serde(rename = "last_updated")]
    pub fetched_at: Option<DateTime<Utc>>,
    #[serde(rename = "observances")]
    pub entries: Vec<SpecialDay>,
}
