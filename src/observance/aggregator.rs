//! Merges the four observance sources into a single deduplicated,
//! category-filtered, deterministically ordered view.

use crate::observance::{Category, DateMmDd, ObservanceSourceDyn, SpecialDay};
use std::collections::HashMap;
use std::sync::Arc;

/// Minimum name length (after normalization) for the containment-ratio
/// dedup rule to apply; short names produce too many false positives.
const MIN_SIGNIFICANT_LENGTH: usize = 6;
const CONTAINMENT_RATIO_THRESHOLD: f64 = 0.4;

fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Two records name the same observance if their normalized names match,
/// or one contains the other with a high enough containment ratio.
fn is_duplicate(a: &str, b: &str) -> bool {
    let na = normalize_name(a);
    let nb = normalize_name(b);
    if na == nb {
        return true;
    }
    if na.len() < MIN_SIGNIFICANT_LENGTH || nb.len() < MIN_SIGNIFICANT_LENGTH {
        return false;
    }
    let (shorter, longer) = if na.len() <= nb.len() { (&na, &nb) } else { (&nb, &na) };
    if !longer.contains(shorter.as_str()) {
        return false;
    }
    let ratio = shorter.len() as f64 / longer.len() as f64;
    ratio > CONTAINMENT_RATIO_THRESHOLD
}

/// Queries every enabled source, flattens, deduplicates (preferring the
/// higher-priority source), filters by the configured
/// enabled-category set, and sorts by `(date, name)`.
///
/// The aggregator is pure with respect to source caches: it only calls
/// [`ObservanceSourceDyn::lookup`], never `refresh`.
pub async fn aggregate(
    sources: &[Arc<dyn ObservanceSourceDyn>],
    date: DateMmDd,
    category_enabled: &HashMap<String, bool>,
) -> Vec<SpecialDay> {
    let mut flattened = Vec::new();
    for source in sources {
        match source.lookup(date).await {
            Ok(days) => flattened.extend(days.into_iter().filter(|d| d.enabled)),
            Err(error) => {
                tracing::warn!(source = ?source.name(), %error, "observance source lookup failed, excluding from aggregate");
            }
        }
    }

    let deduped = dedupe(flattened);

    let mut filtered: Vec<SpecialDay> = deduped
        .into_iter()
        .filter(|d| category_enabled.get(category_key(d.category)).copied().unwrap_or(true))
        .collect();

    filtered.sort_by(|a, b| a.date.cmp(&b.date).then_with(|| a.name.cmp(&b.name)));
    filtered
}

/// Aggregates across a date range (inclusive), used for the weekly/monthly
/// special-day digest views.
pub async fn aggregate_range(
    sources: &[Arc<dyn ObservanceSourceDyn>],
    dates: &[DateMmDd],
    category_enabled: &HashMap<String, bool>,
) -> Vec<SpecialDay> {
    let mut all = Vec::new();
    for &date in dates {
        all.extend(aggregate(sources, date, category_enabled).await);
    }
    all
}

fn category_key(category: Category) -> &'static str {
    match category {
        Category::GlobalHealth => "global_health",
        Category::Tech => "tech",
        Category::Culture => "culture",
        Category::Company => "company",
    }
}

/// Keeps the first (highest-priority) record of each duplicate group.
/// Sources are queried in priority order, but a source's own `lookup`
/// batch is not itself guaranteed sorted, so this compares every new
/// entry against everything already accepted rather than assuming
/// adjacency.
fn dedupe(mut flattened: Vec<SpecialDay>) -> Vec<SpecialDay> {
    flattened.sort_by_key(|d| d.source.priority());
    let mut kept: Vec<SpecialDay> = Vec::with_capacity(flattened.len());
    for day in flattened {
        let duplicate_of_kept = kept.iter().any(|existing| existing.date == day.date && is_duplicate(&existing.name, &day.name));
        if !duplicate_of_kept {
            kept.push(day);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observance::Source;

    fn day(name: &str, source: Source, date: DateMmDd) -> SpecialDay {
        SpecialDay {
            date,
            name: name.to_string(),
            category: Category::Culture,
            description: String::new(),
            source,
            url: None,
            emoji: None,
            enabled: true,
        }
    }

    #[test]
    fn normalizes_and_matches_exact_names_case_insensitively() {
        assert!(is_duplicate("World Poetry Day", "world poetry day"));
        assert!(is_duplicate("World Poetry Day!", "World Poetry Day"));
    }

    #[test]
    fn matches_via_containment_ratio() {
        assert!(is_duplicate("International Day of Happiness", "Day of Happiness"));
    }

    #[test]
    fn does_not_match_short_unrelated_names() {
        assert!(!is_duplicate("Day", "Day of Happiness"));
        assert!(!is_duplicate("Tech Day", "World Tech Summit Day"));
    }

    #[test]
    fn dedupe_prefers_higher_priority_source() {
        let date = DateMmDd::new(3, 21).unwrap();
        let entries = vec![
            day("World Poetry Day", Source::Who, date),
            day("World Poetry Day", Source::Un, date),
        ];
        let kept = dedupe(entries);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source, Source::Un);
    }

    #[test]
    fn dedupe_keeps_distinct_observances_on_the_same_day() {
        let date = DateMmDd::new(3, 21).unwrap();
        let entries = vec![day("World Poetry Day", Source::Un, date), day("World Puppetry Day", Source::Unesco, date)];
        let kept = dedupe(entries);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn who_outranks_calendarific_for_a_year_suffixed_duplicate() {
        let date = DateMmDd::new(4, 7).unwrap();
        let entries = vec![
            day("World Health Day 2025", Source::Calendarific, date),
            day("World Health Day", Source::Who, date),
        ];
        let kept = dedupe(entries);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].source, Source::Who);
        assert_eq!(kept[0].name, "World Health Day");
    }

    #[test]
    fn same_name_on_different_dates_is_not_a_duplicate() {
        let entries = vec![
            day("World Health Day", Source::Who, DateMmDd::new(4, 7).unwrap()),
            day("World Health Day", Source::Calendarific, DateMmDd::new(4, 8).unwrap()),
        ];
        let kept = dedupe(entries);
        assert_eq!(kept.len(), 2);
    }

    struct FixedSource {
        source: Source,
        days: Vec<SpecialDay>,
    }

    impl crate::observance::ObservanceSource for FixedSource {
        fn name(&self) -> Source {
            self.source
        }

        async fn refresh(&self, _force: bool) -> crate::error::Result<crate::observance::RefreshOutcome> {
            Ok(crate::observance::RefreshOutcome {
                observances_count: self.days.len(),
                refreshed_at: chrono::Utc::now(),
            })
        }

        async fn status(&self) -> crate::error::Result<crate::observance::SourceStatus> {
            Ok(crate::observance::SourceStatus {
                enabled: true,
                cache_fresh: true,
                observance_count: self.days.len(),
                last_updated: None,
            })
        }

        async fn lookup(&self, date: DateMmDd) -> crate::error::Result<Vec<SpecialDay>> {
            Ok(self.days.iter().filter(|d| d.date == date).cloned().collect())
        }
    }

    #[tokio::test]
    async fn aggregate_is_deterministic_and_sorted_by_date_then_name() {
        let date = DateMmDd::new(4, 7).unwrap();
        let sources: Vec<Arc<dyn ObservanceSourceDyn>> = vec![
            Arc::new(FixedSource {
                source: Source::Who,
                days: vec![day("Zebra Appreciation Day", Source::Who, date), day("World Health Day", Source::Who, date)],
            }),
            Arc::new(FixedSource {
                source: Source::Calendarific,
                days: vec![day("World Health Day 2025", Source::Calendarific, date)],
            }),
        ];

        let first = aggregate(&sources, date, &HashMap::new()).await;
        let second = aggregate(&sources, date, &HashMap::new()).await;

        let names: Vec<&str> = first.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["World Health Day", "Zebra Appreciation Day"]);
        assert_eq!(first.len(), second.len());
        assert!(first.iter().zip(&second).all(|(a, b)| a.name == b.name && a.source == b.source));
    }

    #[tokio::test]
    async fn aggregate_filters_disabled_categories() {
        let date = DateMmDd::new(4, 7).unwrap();
        let mut health_day = day("World Health Day", Source::Who, date);
        health_day.category = Category::GlobalHealth;
        let sources: Vec<Arc<dyn ObservanceSourceDyn>> =
            vec![Arc::new(FixedSource { source: Source::Who, days: vec![health_day] })];

        let mut category_enabled = HashMap::new();
        category_enabled.insert("global_health".to_string(), false);
        let filtered = aggregate(&sources, date, &category_enabled).await;
        assert!(filtered.is_empty());

        let unfiltered = aggregate(&sources, date, &HashMap::new()).await;
        assert_eq!(unfiltered.len(), 1);
    }
}
