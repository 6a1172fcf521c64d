//! Generic HTML-scrape observance client shared by the UN, UNESCO, and
//! WHO sources. Each upstream publishes a single list
//! page; this fetches it, validates the URL against [`crate::observance::ssrf::SsrfGuard`],
//! parses it with `scraper`, and caches the result to a per-source JSON
//! file with its own TTL.

use crate::error::{ObservanceError, Result};
use crate::observance::ssrf::SsrfGuard;
use crate::observance::{Category, DateMmDd, ObservanceSource, RefreshOutcome, SourceCacheFile, SourceStatus, SpecialDay};
use chrono::{Duration as ChronoDuration, Utc};
use scraper::{Html, Selector};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use url::Url;

/// Month-name -> number lookup used when scraping "Month Day" style text.
fn month_number(name: &str) -> Option<u8> {
    const MONTHS: &[&str] = &[
        "january", "february", "march", "april", "may", "june", "july", "august", "september",
        "october", "november", "december",
    ];
    let lower = name.to_ascii_lowercase();
    MONTHS.iter().position(|m| m.starts_with(&lower) || lower.starts_with(m)).map(|i| (i + 1) as u8)
}

fn date_re() -> &'static regex::Regex {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| {
        regex::Regex::new(r"(?i)\b(January|February|March|April|May|June|July|August|September|October|November|December)\s+(\d{1,2})\b").unwrap()
    })
}

/// Extracts a single `(month, day, remaining title text)` triple from a
/// list item's text, if it contains a recognizable "Month Day" date.
fn extract_date_and_title(text: &str) -> Option<(u8, u8, String)> {
    let caps = date_re().captures(text)?;
    let month = month_number(&caps[1])?;
    let day: u8 = caps[2].parse().ok()?;
    let date_md = DateMmDd::new(month, day)?;
    let title = date_re().replace(text, "").trim().trim_matches(|c: char| matches!(c, '-' | ':' | '|')).trim().to_string();
    Some((date_md.month, date_md.day, title))
}

/// Configuration for one upstream list page.
pub struct HtmlScrapeSource {
    source: crate::observance::Source,
    url: String,
    /// CSS selector matching each observance's list entry (e.g. `li`, `tr`).
    item_selector: &'static str,
    default_category: Category,
    ttl: ChronoDuration,
    cache_path: PathBuf,
    client: reqwest::Client,
    guard: SsrfGuard,
    refresh_lock: Arc<Mutex<()>>,
}

impl HtmlScrapeSource {
    pub fn new(
        source: crate::observance::Source,
        url: impl Into<String>,
        item_selector: &'static str,
        default_category: Category,
        ttl_days: i64,
        cache_path: PathBuf,
    ) -> Self {
        Self {
            source,
            url: url.into(),
            item_selector,
            default_category,
            ttl: ChronoDuration::days(ttl_days),
            cache_path,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("failed to build observance scrape http client"),
            guard: SsrfGuard::default(),
            refresh_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_cache(&self) -> Result<SourceCacheFile> {
        match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                ObservanceError::Other(anyhow::anyhow!("corrupt cache {}: {e}", self.cache_path.display())).into()
            }),
            Err(_) => Ok(SourceCacheFile::default()),
        }
    }

    async fn save_cache(&self, file: &SourceCacheFile) -> Result<()> {
        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                ObservanceError::Other(anyhow::anyhow!("failed to create cache dir: {e}"))
            })?;
        }
        let bytes = serde_json::to_vec_pretty(file)
            .map_err(|e| ObservanceError::Other(anyhow::anyhow!("failed to serialize cache: {e}")))?;
        tokio::fs::write(&self.cache_path, bytes)
            .await
            .map_err(|e| ObservanceError::Other(anyhow::anyhow!("failed to write cache: {e}")).into())
    }

    fn is_fresh(file: &SourceCacheFile, ttl: ChronoDuration) -> bool {
        match file.fetched_at {
            Some(fetched) => Utc::now() - fetched < ttl,
            None => false,
        }
    }

    async fn fetch(&self) -> Result<Vec<SpecialDay>> {
        let url = Url::parse(&self.url)
            .map_err(|e| ObservanceError::UpstreamRefused { source: self.source_name(), detail: format!("invalid configured URL: {e}") })?;
        self.guard
            .validate_url(&url)
            .map_err(|detail| ObservanceError::UpstreamRefused { source: self.source_name(), detail })?;

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ObservanceError::UpstreamTransient { source: self.source_name(), detail: e.to_string() })?;
        if !resp.status().is_success() {
            return Err(ObservanceError::UpstreamRefused {
                source: self.source_name(),
                detail: format!("HTTP {}", resp.status()),
            }
            .into());
        }
        let body = resp
            .text()
            .await
            .map_err(|e| ObservanceError::UpstreamTransient { source: self.source_name(), detail: e.to_string() })?;

        Ok(self.parse(&body))
    }

    fn parse(&self, html: &str) -> Vec<SpecialDay> {
        let document = Html::parse_document(html);
        let Ok(selector) = Selector::parse(self.item_selector) else {
            return Vec::new();
        };
        let mut days = Vec::new();
        for element in document.select(&selector) {
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
            let Some((month, day, title)) = extract_date_and_title(&text) else {
                continue;
            };
            if title.is_empty() {
                continue;
            }
            let url = element
                .select(&Selector::parse("a[href]").unwrap())
                .next()
                .and_then(|a| a.value().attr("href"))
                .map(|href| self.resolve_href(href));
            days.push(SpecialDay {
                date: DateMmDd::new(month, day).expect("validated by extract_date_and_title"),
                name: title,
                category: self.default_category,
                description: String::new(),
                source: self.source,
                url,
                emoji: None,
                enabled: true,
            });
        }
        days
    }

    fn resolve_href(&self, href: &str) -> String {
        Url::parse(&self.url)
            .ok()
            .and_then(|base| base.join(href).ok())
            .map(|u| u.to_string())
            .unwrap_or_else(|| href.to_string())
    }

    fn source_name(&self) -> String {
        format!("{:?}", self.source)
    }
}

impl ObservanceSource for HtmlScrapeSource {
    fn name(&self) -> crate::observance::Source {
        self.source
    }

    async fn refresh(&self, force: bool) -> Result<RefreshOutcome> {
        let _guard = self.refresh_lock.lock().await;

        let cached = self.load_cache().await.unwrap_or_default();
        if !force && Self::is_fresh(&cached, self.ttl) {
            return Ok(RefreshOutcome {
                observances_count: cached.entries.len(),
                refreshed_at: cached.fetched_at.unwrap_or_else(Utc::now),
            });
        }

        match self.fetch().await {
            Ok(entries) if !entries.is_empty() => {
                let file = SourceCacheFile { fetched_at: Some(Utc::now()), entries };
                self.save_cache(&file).await?;
                tracing::info!(source = %self.source_name(), count = file.entries.len(), "observance source refreshed");
                Ok(RefreshOutcome { observances_count: file.entries.len(), refreshed_at: file.fetched_at.unwrap() })
            }
            Ok(_) => {
                // Empty response: keep serving the existing cache.
                tracing::warn!(source = %self.source_name(), "refresh returned zero entries, keeping existing cache");
                Ok(RefreshOutcome {
                    observances_count: cached.entries.len(),
                    refreshed_at: cached.fetched_at.unwrap_or_else(Utc::now),
                })
            }
            Err(e) => {
                tracing::warn!(source = %self.source_name(), error = %e, "observance refresh failed, serving cache");
                Err(e)
            }
        }
    }

    async fn status(&self) -> Result<SourceStatus> {
        let cached = self.load_cache().await.unwrap_or_default();
        Ok(SourceStatus {
            enabled: true,
            cache_fresh: Self::is_fresh(&cached, self.ttl),
            observance_count: cached.entries.len(),
            last_updated: cached.fetched_at,
        })
    }

    async fn lookup(&self, date: DateMmDd) -> Result<Vec<SpecialDay>> {
        let cached = self.load_cache().await.unwrap_or_default();
        Ok(cached.entries.into_iter().filter(|d| d.date == date).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_month_day_and_title_from_list_text() {
        let (month, day, title) = extract_date_and_title("March 21 - World Poetry Day").unwrap();
        assert_eq!((month, day), (3, 21));
        assert_eq!(title, "World Poetry Day");
    }

    #[test]
    fn returns_none_when_no_date_present() {
        assert!(extract_date_and_title("A page with no date in it").is_none());
    }

    #[test]
    fn parses_simple_list_markup() {
        let html = r#"<ul><li>March 21 - World Poetry Day</li><li>April 7 - World Health Day</li></ul>"#;
        let source = HtmlScrapeSource::new(
            crate::observance::Source::Unesco,
            "https://example.org/days",
            "li",
            Category::Culture,
            30,
            PathBuf::from("/tmp/unused_test_cache.json"),
        );
        let days = source.parse(html);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].name, "World Poetry Day");
        assert_eq!(days[1].date, DateMmDd::new(4, 7).unwrap());
    }
}
