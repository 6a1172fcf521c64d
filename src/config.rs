//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use arc_swap::ArcSwap;
use std::sync::Arc;

/// Feature toggles, hot-reloadable at runtime (scheduler and engagement
/// handlers read these via [`Config::toggles`] on every iteration).
#[derive(Debug, Clone, Copy)]
pub struct FeatureToggles {
    pub timezone_aware_celebrations: bool,
    pub image_generation: bool,
    pub nlp_date_parsing: bool,
    pub thread_engagement: bool,
    pub mention_qa: bool,
    pub special_days: bool,
    pub canvas_dashboard: bool,
    pub external_backup: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            timezone_aware_celebrations: false,
            image_generation: true,
            nlp_date_parsing: false,
            thread_engagement: true,
            mention_qa: true,
            special_days: true,
            canvas_dashboard: true,
            external_backup: false,
        }
    }
}

/// Scheduler timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Server-local hour:minute for the fleet-wide daily sweep.
    pub daily_check_hour: u8,
    pub daily_check_minute: u8,
    /// Poll interval for timezone-aware mode.
    pub timezone_check_interval_secs: u64,
    /// Per-user-timezone hour at which a birthday fires in timezone-aware mode.
    pub timezone_celebration_hour: u8,
    /// Early-morning server-local time for the stale-source cache refresh.
    pub cache_refresh_hour: u8,
    pub cache_refresh_minute: u8,
    pub heartbeat_stale_threshold_secs: u64,
    pub stats_flush_every_n_iterations: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            daily_check_hour: 9,
            daily_check_minute: 0,
            timezone_check_interval_secs: 60,
            timezone_celebration_hour: 9,
            cache_refresh_hour: 6,
            cache_refresh_minute: 30,
            heartbeat_stale_threshold_secs: 120,
            stats_flush_every_n_iterations: 10,
        }
    }
}

/// Engagement rate-limit configuration.
#[derive(Debug, Clone, Copy)]
pub struct EngagementConfig {
    pub mention_window_secs: u64,
    pub mention_max_requests: u32,
    pub max_reactions_per_thread: u32,
    pub thread_tracking_ttl_hours: u64,
    pub thread_tracking_ttl_days_max: u64,
    /// Whether a reply in a tracked thread can earn a personality-voiced
    /// thank-you, on top of its reaction.
    pub thank_you_enabled: bool,
    pub max_thank_yous_per_thread: u32,
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            mention_window_secs: 60,
            mention_max_requests: 5,
            max_reactions_per_thread: 20,
            thread_tracking_ttl_hours: 24,
            thread_tracking_ttl_days_max: 7,
            thank_you_enabled: false,
            max_thank_yous_per_thread: 3,
        }
    }
}

/// Calendarific API configuration.
#[derive(Debug, Clone)]
pub struct CalendarificConfig {
    pub api_key: Option<String>,
    pub country: String,
    pub region: Option<String>,
}

/// Configured list pages for the HTML-scrape observance sources.
#[derive(Debug, Clone)]
pub struct ObservanceConfig {
    pub un_url: String,
    pub unesco_url: String,
    pub who_url: String,
}

impl Default for ObservanceConfig {
    fn default() -> Self {
        Self {
            un_url: std::env::var("UN_OBSERVANCES_URL")
                .unwrap_or_else(|_| "https://www.un.org/en/observances/list-days-weeks".to_string()),
            unesco_url: std::env::var("UNESCO_OBSERVANCES_URL")
                .unwrap_or_else(|_| "https://www.unesco.org/en/international-days".to_string()),
            who_url: std::env::var("WHO_OBSERVANCES_URL")
                .unwrap_or_else(|_| "https://www.who.int/campaigns".to_string()),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: std::path::PathBuf,
    pub slack_bot_token: String,
    pub slack_app_token: String,
    pub birthday_channel_id: String,
    pub ops_channel_id: Option<String>,
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub image_endpoint: String,
    pub image_api_key: String,
    pub image_model: String,
    pub calendarific: CalendarificConfig,
    pub observance: ObservanceConfig,
    pub scheduler: SchedulerConfig,
    pub engagement: EngagementConfig,
    toggles: Arc<ArcSwap<FeatureToggles>>,
}

impl Config {
    /// Load configuration from environment variables, validating eagerly.
    pub fn load() -> Result<Self> {
        let data_dir = std::env::var("CELEBRATE_DATA_DIR")
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .map(|d| d.join("celebrate"))
                    .unwrap_or_else(|| std::path::PathBuf::from("./data"))
            });

        std::fs::create_dir_all(data_dir.join("storage"))
            .map_err(|e| ConfigError::Invalid(format!("failed to create storage dir: {e}")))?;
        std::fs::create_dir_all(data_dir.join("cache"))
            .map_err(|e| ConfigError::Invalid(format!("failed to create cache dir: {e}")))?;
        std::fs::create_dir_all(data_dir.join("backups"))
            .map_err(|e| ConfigError::Invalid(format!("failed to create backups dir: {e}")))?;

        let slack_bot_token = require_env("SLACK_BOT_TOKEN")?;
        let slack_app_token = require_env("SLACK_APP_TOKEN")?;
        let birthday_channel_id = require_env("BIRTHDAY_CHANNEL_ID")?;
        let ops_channel_id = std::env::var("OPS_CHANNEL_ID").ok();
        let llm_endpoint = std::env::var("LLM_ENDPOINT")
            .unwrap_or_else(|_| "https://api.openai.com/v1/chat/completions".to_string());
        let llm_api_key = require_env("LLM_API_KEY")?;
        let llm_model = std::env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let image_endpoint = std::env::var("IMAGE_ENDPOINT")
            .unwrap_or_else(|_| "https://api.openai.com/v1/images/generations".to_string());
        let image_api_key = std::env::var("IMAGE_API_KEY").unwrap_or_else(|_| llm_api_key.clone());
        let image_model =
            std::env::var("IMAGE_MODEL").unwrap_or_else(|_| "image-default".to_string());

        let calendarific = CalendarificConfig {
            api_key: std::env::var("CALENDARIFIC_API_KEY").ok(),
            country: std::env::var("CALENDARIFIC_COUNTRY").unwrap_or_else(|_| "US".to_string()),
            region: std::env::var("CALENDARIFIC_REGION").ok(),
        };

        let default_scheduler = SchedulerConfig::default();
        let (daily_check_hour, daily_check_minute) = env_hhmm(
            "DAILY_CHECK_TIME",
            (default_scheduler.daily_check_hour, default_scheduler.daily_check_minute),
        )?;
        let (cache_refresh_hour, cache_refresh_minute) = env_hhmm(
            "CACHE_REFRESH_TIME",
            (default_scheduler.cache_refresh_hour, default_scheduler.cache_refresh_minute),
        )?;
        let scheduler = SchedulerConfig {
            daily_check_hour,
            daily_check_minute,
            timezone_check_interval_secs: env_u64(
                "TIMEZONE_CHECK_INTERVAL_SECS",
                default_scheduler.timezone_check_interval_secs,
            ),
            timezone_celebration_hour: env_hhmm(
                "TIMEZONE_CELEBRATION_TIME",
                (default_scheduler.timezone_celebration_hour, 0),
            )?
            .0,
            cache_refresh_hour,
            cache_refresh_minute,
            heartbeat_stale_threshold_secs: env_u64(
                "HEARTBEAT_STALE_THRESHOLD_SECONDS",
                default_scheduler.heartbeat_stale_threshold_secs,
            ),
            stats_flush_every_n_iterations: default_scheduler.stats_flush_every_n_iterations,
        };

        let default_engagement = EngagementConfig::default();
        let engagement = EngagementConfig {
            mention_window_secs: env_u64("MENTION_RATE_WINDOW_SECS", default_engagement.mention_window_secs),
            mention_max_requests: env_u64("MENTION_RATE_MAX_REQUESTS", default_engagement.mention_max_requests as u64)
                as u32,
            max_reactions_per_thread: default_engagement.max_reactions_per_thread,
            thread_tracking_ttl_hours: env_u64(
                "THREAD_TRACKING_TTL_HOURS",
                default_engagement.thread_tracking_ttl_hours,
            ),
            thread_tracking_ttl_days_max: env_u64(
                "THREAD_TRACKING_TTL_DAYS",
                default_engagement.thread_tracking_ttl_days_max,
            ),
            thank_you_enabled: env_bool("ENABLE_THREAD_THANK_YOU", false),
            max_thank_yous_per_thread: default_engagement.max_thank_yous_per_thread,
        };

        let toggles = FeatureToggles {
            timezone_aware_celebrations: env_bool("TIMEZONE_AWARE_CELEBRATIONS", false),
            image_generation: env_bool("ENABLE_IMAGE_GENERATION", true),
            nlp_date_parsing: env_bool("ENABLE_NLP_DATE_PARSING", false),
            thread_engagement: env_bool("ENABLE_THREAD_ENGAGEMENT", true),
            mention_qa: env_bool("ENABLE_MENTION_QA", true),
            special_days: env_bool("ENABLE_SPECIAL_DAYS", true),
            canvas_dashboard: env_bool("ENABLE_CANVAS_DASHBOARD", true),
            external_backup: env_bool("ENABLE_EXTERNAL_BACKUP", false),
        };

        Ok(Self {
            data_dir,
            slack_bot_token,
            slack_app_token,
            birthday_channel_id,
            ops_channel_id,
            llm_endpoint,
            llm_api_key,
            llm_model,
            image_endpoint,
            image_api_key,
            image_model,
            calendarific,
            observance: ObservanceConfig::default(),
            scheduler,
            engagement,
            toggles: Arc::new(ArcSwap::from_pointee(toggles)),
        })
    }

    /// Minimal configuration for tests that exercise scheduler/pipeline
    /// paths against a temp directory, with outbound toggles quieted.
    #[cfg(test)]
    pub(crate) fn for_tests(data_dir: std::path::PathBuf) -> Self {
        Self {
            data_dir,
            slack_bot_token: "xoxb-test".to_string(),
            slack_app_token: "xapp-test".to_string(),
            birthday_channel_id: "C_BDAY".to_string(),
            ops_channel_id: Some("C_OPS".to_string()),
            llm_endpoint: "http://localhost/llm".to_string(),
            llm_api_key: "test".to_string(),
            llm_model: "test-model".to_string(),
            image_endpoint: "http://localhost/image".to_string(),
            image_api_key: "test".to_string(),
            image_model: "test-image".to_string(),
            calendarific: CalendarificConfig {
                api_key: None,
                country: "US".to_string(),
                region: None,
            },
            observance: ObservanceConfig {
                un_url: "https://example.org/un".to_string(),
                unesco_url: "https://example.org/unesco".to_string(),
                who_url: "https://example.org/who".to_string(),
            },
            scheduler: SchedulerConfig::default(),
            engagement: EngagementConfig::default(),
            toggles: Arc::new(ArcSwap::from_pointee(FeatureToggles {
                image_generation: false,
                ..FeatureToggles::default()
            })),
        }
    }

    /// Snapshot the current feature toggles.
    pub fn toggles(&self) -> FeatureToggles {
        **self.toggles.load()
    }

    /// Replace the feature toggles (e.g. from an admin slash command).
    pub fn set_toggles(&self, toggles: FeatureToggles) {
        self.toggles.store(Arc::new(toggles));
    }

    pub fn storage_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("storage")
    }

    pub fn cache_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("cache")
    }

    pub fn backups_dir(&self) -> std::path::PathBuf {
        self.data_dir.join("backups")
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| ConfigError::MissingKey(key.to_string()).into())
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses an `HH:MM` (or bare `HH`) wall-clock env var.
fn env_hhmm(key: &str, default: (u8, u8)) -> Result<(u8, u8)> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(default);
    };
    parse_hhmm(&raw).ok_or_else(|| {
        ConfigError::Invalid(format!("{key} must be HH:MM (24h), got '{raw}'")).into()
    })
}

fn parse_hhmm(raw: &str) -> Option<(u8, u8)> {
    let raw = raw.trim();
    let (hour_str, minute_str) = match raw.split_once(':') {
        Some((h, m)) => (h, m),
        None => (raw, "0"),
    };
    let hour: u8 = hour_str.parse().ok()?;
    let minute: u8 = minute_str.parse().ok()?;
    (hour < 24 && minute < 60).then_some((hour, minute))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_bool_defaults_when_unset() {
        unsafe {
            std::env::remove_var("CELEBRATE_TEST_FLAG_UNSET");
        }
        assert!(!env_bool("CELEBRATE_TEST_FLAG_UNSET", false));
        assert!(env_bool("CELEBRATE_TEST_FLAG_UNSET", true));
    }

    #[test]
    fn env_bool_parses_truthy_values() {
        unsafe {
            std::env::set_var("CELEBRATE_TEST_FLAG_ON", "true");
        }
        assert!(env_bool("CELEBRATE_TEST_FLAG_ON", false));
        unsafe {
            std::env::remove_var("CELEBRATE_TEST_FLAG_ON");
        }
    }

    #[test]
    fn parses_hhmm_wall_clock_values() {
        assert_eq!(parse_hhmm("09:00"), Some((9, 0)));
        assert_eq!(parse_hhmm("23:59"), Some((23, 59)));
        assert_eq!(parse_hhmm("7"), Some((7, 0)));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("09:60"), None);
        assert_eq!(parse_hhmm("morning"), None);
    }
}
