//! Ops surface: on-demand health status aggregation, in both full JSON
//! and compact human form.

use crate::config::{Config, FeatureToggles};
use crate::datastore::Datastore;
use crate::observance::{ObservanceSourceDyn, Source};
use serde::Serialize;
use std::sync::Arc;

/// Health of the scheduler loop.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerHealth {
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub last_success_at: Option<chrono::DateTime<chrono::Utc>>,
    pub last_error: Option<String>,
    /// `last_heartbeat` is older than `heartbeat_stale_threshold_secs`.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ObservanceSourceHealth {
    pub source: String,
    pub enabled: bool,
    pub cache_fresh: bool,
    pub observance_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryHealth {
    pub path: String,
    pub exists: bool,
    pub writable: bool,
}

/// Full on-demand health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub directories: Vec<DirectoryHealth>,
    pub env_vars_set: Vec<String>,
    pub birthday_count: usize,
    pub admin_count: usize,
    pub scheduler: SchedulerHealth,
    pub observance_sources: Vec<ObservanceSourceHealth>,
    pub toggles: FeatureToggles,
    pub log_file_bytes: u64,
    pub gathered_at: chrono::DateTime<chrono::Utc>,
}

impl Serialize for FeatureToggles {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("FeatureToggles", 8)?;
        s.serialize_field("timezone_aware_celebrations", &self.timezone_aware_celebrations)?;
        s.serialize_field("image_generation", &self.image_generation)?;
        s.serialize_field("nlp_date_parsing", &self.nlp_date_parsing)?;
        s.serialize_field("thread_engagement", &self.thread_engagement)?;
        s.serialize_field("mention_qa", &self.mention_qa)?;
        s.serialize_field("special_days", &self.special_days)?;
        s.serialize_field("canvas_dashboard", &self.canvas_dashboard)?;
        s.serialize_field("external_backup", &self.external_backup)?;
        s.end()
    }
}

const REQUIRED_ENV_VARS: &[&str] = &[
    "SLACK_BOT_TOKEN",
    "SLACK_APP_TOKEN",
    "BIRTHDAY_CHANNEL_ID",
    "LLM_API_KEY",
    "OPS_CHANNEL_ID",
    "CALENDARIFIC_API_KEY",
];

/// Gathers a [`SystemStatus`] snapshot from the live system.
pub async fn gather_status(
    config: &Config,
    datastore: &Datastore,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
) -> SystemStatus {
    let directories = vec![
        directory_health(&config.storage_dir()),
        directory_health(&config.cache_dir()),
        directory_health(&config.backups_dir()),
    ];

    let env_vars_set = REQUIRED_ENV_VARS
        .iter()
        .filter(|key| std::env::var(key).is_ok())
        .map(|key| key.to_string())
        .collect();

    let birthday_count = datastore
        .load_birthdays()
        .await
        .map(|f| f.0.len())
        .unwrap_or(0);
    let admin_count = datastore
        .load_admins()
        .await
        .map(|f| f.admins.len())
        .unwrap_or(0);

    let stats = datastore.load_scheduler_stats().await.unwrap_or_default();
    let stale = stats
        .last_heartbeat
        .map(|h| {
            let age = chrono::Utc::now() - h;
            age.num_seconds() as u64 > config.scheduler.heartbeat_stale_threshold_secs
        })
        .unwrap_or(true);
    let scheduler = SchedulerHealth {
        started_at: stats.started_at,
        last_heartbeat: stats.last_heartbeat,
        total_executions: stats.total_executions,
        failed_executions: stats.failed_executions,
        last_success_at: stats.last_success_at,
        last_error: stats.last_error,
        stale,
    };

    let mut observance_health = Vec::with_capacity(observance_sources.len());
    for source in observance_sources {
        let name = source_label(source.name());
        match source.status().await {
            Ok(status) => observance_health.push(ObservanceSourceHealth {
                source: name,
                enabled: status.enabled,
                cache_fresh: status.cache_fresh,
                observance_count: status.observance_count,
            }),
            Err(error) => {
                tracing::warn!(source = name, %error, "failed to read observance source status");
                observance_health.push(ObservanceSourceHealth {
                    source: name,
                    enabled: false,
                    cache_fresh: false,
                    observance_count: 0,
                });
            }
        }
    }

    let log_file_bytes = log_directory_size(&config.data_dir.join("logs")).await;

    SystemStatus {
        directories,
        env_vars_set,
        birthday_count,
        admin_count,
        scheduler,
        observance_sources: observance_health,
        toggles: config.toggles(),
        log_file_bytes,
        gathered_at: chrono::Utc::now(),
    }
}

fn source_label(source: Source) -> String {
    match source {
        Source::Un => "un",
        Source::Unesco => "unesco",
        Source::Who => "who",
        Source::Calendarific => "calendarific",
        Source::Custom => "custom",
    }
    .to_string()
}

fn directory_health(path: &std::path::Path) -> DirectoryHealth {
    let exists = path.exists();
    let writable = exists && path.metadata().map(|m| !m.permissions().readonly()).unwrap_or(false);
    DirectoryHealth {
        path: path.display().to_string(),
        exists,
        writable,
    }
}

async fn log_directory_size(path: &std::path::Path) -> u64 {
    let mut total = 0u64;
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(e) => e,
        Err(_) => return 0,
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(metadata) = entry.metadata().await {
            total += metadata.len();
        }
    }
    total
}

impl SystemStatus {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Compact human summary for a Slack reply or a log line.
    pub fn to_compact_human(&self) -> String {
        let mut lines = vec![format!(
            "*Status* (as of {})",
            self.gathered_at.format("%Y-%m-%d %H:%M UTC")
        )];
        lines.push(format!(
            "Birthdays: {} | Admins: {}",
            self.birthday_count, self.admin_count
        ));
        lines.push(format!(
            "Scheduler: {} (executions: {}, failures: {})",
            if self.scheduler.stale { "STALE" } else { "healthy" },
            self.scheduler.total_executions,
            self.scheduler.failed_executions,
        ));
        for source in &self.observance_sources {
            lines.push(format!(
                "{}: {} observances, cache {}",
                source.source,
                source.observance_count,
                if source.cache_fresh { "fresh" } else { "stale" },
            ));
        }
        let missing: Vec<&str> = REQUIRED_ENV_VARS
            .iter()
            .filter(|key| !self.env_vars_set.iter().any(|set| set == *key))
            .copied()
            .collect();
        if !missing.is_empty() {
            lines.push(format!("Missing env vars: {}", missing.join(", ")));
        }
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> SystemStatus {
        SystemStatus {
            directories: vec![],
            env_vars_set: vec!["SLACK_BOT_TOKEN".to_string()],
            birthday_count: 3,
            admin_count: 1,
            scheduler: SchedulerHealth {
                started_at: None,
                last_heartbeat: None,
                total_executions: 10,
                failed_executions: 0,
                last_success_at: None,
                last_error: None,
                stale: true,
            },
            observance_sources: vec![ObservanceSourceHealth {
                source: "un".to_string(),
                enabled: true,
                cache_fresh: false,
                observance_count: 5,
            }],
            toggles: FeatureToggles::default(),
            log_file_bytes: 0,
            gathered_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn compact_human_flags_stale_scheduler_and_missing_env() {
        let status = sample_status();
        let text = status.to_compact_human();
        assert!(text.contains("STALE"));
        assert!(text.contains("Missing env vars"));
    }

    #[test]
    fn json_form_round_trips_through_serde_value() {
        let status = sample_status();
        let json = status.to_json();
        assert_eq!(json["birthday_count"], 3);
    }
}
