//! Calendarific JSON API client: rate-limited at
//! ~500 calls/month on the free tier (warn at 400), refreshed with a
//! weekly prefetch of 7 days of national holidays rather than a
//! per-lookup hot-path call.

use crate::error::{ObservanceError, Result};
use crate::observance::{Category, DateMmDd, ObservanceSource, RefreshOutcome, Source, SourceStatus, SpecialDay};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const MONTHLY_CALL_BUDGET: u32 = 500;
const MONTHLY_CALL_WARN_THRESHOLD: u32 = 400;
const PREFETCH_DAYS: i64 = 7;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CalendarificCacheFile {
    /// `YYYY-MM` the call counter applies to; reset to 0 on month rollover.
    call_budget_month: Option<String>,
    calls_this_month: u32,
    /// Keyed by `MM-DD`, holding the holidays fetched for that date.
    per_date: std::collections::HashMap<String, Vec<SpecialDay>>,
    fetched_at: std::collections::HashMap<String, chrono::DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    response: ApiResponseBody,
}

#[derive(Debug, Deserialize)]
struct ApiResponseBody {
    #[serde(default)]
    holidays: Vec<ApiHoliday>,
}

#[derive(Debug, Deserialize)]
struct ApiHoliday {
    name: String,
    description: Option<String>,
    date: ApiHolidayDate,
}

#[derive(Debug, Deserialize)]
struct ApiHolidayDate {
    iso: String,
}

pub struct CalendarificSource {
    api_key: Option<String>,
    country: String,
    region: Option<String>,
    cache_path: PathBuf,
    client: reqwest::Client,
    refresh_lock: Arc<Mutex<()>>,
}

impl CalendarificSource {
    pub fn new(api_key: Option<String>, country: String, region: Option<String>, cache_path: PathBuf) -> Self {
        Self {
            api_key,
            country,
            region,
            cache_path,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build calendarific http client"),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_cache(&self) -> CalendarificCacheFile {
        match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => CalendarificCacheFile::default(),
        }
    }

    async fn save_cache(&self, file: &CalendarificCacheFile) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| ObservanceError::Other(anyhow::anyhow!("failed to serialize calendarific cache: {e}")))?;
        tokio::fs::write(&self.cache_path, bytes)
            .await
            .map_err(|e| ObservanceError::Other(anyhow::anyhow!("failed to write calendarific cache: {e}")).into())
    }

    fn current_month_key(now: chrono::DateTime<Utc>) -> String {
        format!("{:04}-{:02}", now.year(), now.month())
    }

    /// Resets the monthly counter on rollover and returns the current count.
    fn ensure_month(cache: &mut CalendarificCacheFile, now: chrono::DateTime<Utc>) -> u32 {
        let month_key = Self::current_month_key(now);
        if cache.call_budget_month.as_deref() != Some(month_key.as_str()) {
            cache.call_budget_month = Some(month_key);
            cache.calls_this_month = 0;
        }
        cache.calls_this_month
    }

    async fn fetch_day(&self, date: NaiveDate) -> Result<Vec<SpecialDay>> {
        let Some(api_key) = &self.api_key else {
            return Err(ObservanceError::Degraded { source: "Calendarific".into() }.into());
        };

        let mut url = url::Url::parse("https://calendarific.com/api/v2/holidays").unwrap();
        {
            let mut q = url.query_pairs_mut();
            q.append_pair("api_key", api_key);
            q.append_pair("country", &self.country);
            q.append_pair("year", &date.year().to_string());
            q.append_pair("month", &date.month().to_string());
            q.append_pair("day", &date.day().to_string());
            if let Some(region) = &self.region {
                q.append_pair("location", region);
            }
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ObservanceError::UpstreamTransient { source: "Calendarific".into(), detail: e.to_string() })?;
        if resp.status().as_u16() == 429 {
            return Err(ObservanceError::UpstreamTransient { source: "Calendarific".into(), detail: "rate limited".into() }.into());
        }
        if !resp.status().is_success() {
            return Err(ObservanceError::UpstreamRefused {
                source: "Calendarific".into(),
                detail: format!("HTTP {}", resp.status()),
            }
            .into());
        }

        let parsed: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ObservanceError::UpstreamTransient { source: "Calendarific".into(), detail: e.to_string() })?;

        Ok(parsed
            .response
            .holidays
            .into_iter()
            .filter_map(|h| {
                let iso_date = h.date.iso.get(..10).and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())?;
                Some(SpecialDay {
                    date: DateMmDd::new(iso_date.month() as u8, iso_date.day() as u8)?,
                    name: h.name,
                    category: Category::Culture,
                    description: h.description.unwrap_or_default(),
                    source: Source::Calendarific,
                    url: None,
                    emoji: None,
                    enabled: true,
                })
            })
            .collect())
    }
}

impl ObservanceSource for CalendarificSource {
    fn name(&self) -> Source {
        Source::Calendarific
    }

    /// Weekly prefetch: one call per day in the next
    /// [`PREFETCH_DAYS`], coalesced under a single in-flight refresh lock.
    async fn refresh(&self, force: bool) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;
        let mut cache = self.load_cache().await;
        let now = Utc::now();
        let calls_so_far = Self::ensure_month(&mut cache, now);

        let today = now.date_naive();
        let mut fetched = 0usize;
        for offset in 0..PREFETCH_DAYS {
            let date = today + ChronoDuration::days(offset);
            let key = format!("{:02}-{:02}", date.month(), date.day());
            let is_fresh = cache
                .fetched_at
                .get(&key)
                .is_some_and(|t| now - *t < ChronoDuration::days(1));
            if !force && is_fresh {
                continue;
            }
            if cache.calls_this_month + fetched as u32 >= MONTHLY_CALL_BUDGET {
                tracing::warn!("calendarific monthly call budget exhausted, skipping remaining prefetch");
                break;
            }
            match self.fetch_day(date).await {
                Ok(days) => {
                    cache.per_date.insert(key.clone(), days);
                    cache.fetched_at.insert(key, now);
                    fetched += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, %key, "calendarific prefetch call failed, keeping existing cache entry");
                }
            }
        }

        cache.calls_this_month += fetched as u32;
        if cache.calls_this_month >= MONTHLY_CALL_WARN_THRESHOLD {
            tracing::warn!(
                calls_this_month = cache.calls_this_month,
                budget = MONTHLY_CALL_BUDGET,
                "calendarific approaching its monthly call budget"
            );
        }
        let _ = calls_so_far;

        let total: usize = cache.per_date.values().map(|v| v.len()).sum();
        self.save_cache(&cache).await?;
        Ok(RefreshOutcome { observances_count: total, refreshed_at: now })
    }

    async fn status(&self) -> Result<SourceStatus> {
        let cache = self.load_cache().await;
        let total: usize = cache.per_date.values().map(|v| v.len()).sum();
        let newest = cache.fetched_at.values().max().copied();
        let fresh = newest.is_some_and(|t| Utc::now() - t < ChronoDuration::days(1));
        Ok(SourceStatus {
            enabled: self.api_key.is_some(),
            cache_fresh: fresh,
            observance_count: total,
            last_updated: newest,
        })
    }

    async fn lookup(&self, date: DateMmDd) -> Result<Vec<SpecialDay>> {
        let cache = self.load_cache().await;
        let key = format!("{:02}-{:02}", date.month, date.day);
        Ok(cache.per_date.get(&key).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_key_rolls_over() {
        let mut cache = CalendarificCacheFile { call_budget_month: Some("2025-12".into()), calls_this_month: 450, ..Default::default() };
        let now = Utc::now().with_year(2026).unwrap().with_month(1).unwrap();
        let count = CalendarificSource::ensure_month(&mut cache, now);
        assert_eq!(count, 0);
        assert_eq!(cache.calls_this_month, 0);
    }
}
