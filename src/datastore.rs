//! Persistent JSON file storage with write-locking and atomic replace.
//!
//! Guarantees: writes are atomic on single-file replace
//! (write-to-temp, fsync, rename); a per-file advisory lock serializes
//! concurrent writers with a 10s timeout; reads never block on other
//! reads; every mutating operation records a timestamp.

use crate::error::{DatastoreError, Result};
use crate::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

const LOCK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const MAX_BIRTHDAY_BACKUPS: usize = 10;

// ---------------------------------------------------------------------
// Data model (the datastore exclusively owns these on-disk shapes).
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CelebrationStyle {
    Quiet,
    Standard,
    Epic,
}

impl Default for CelebrationStyle {
    fn default() -> Self {
        CelebrationStyle::Standard
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirthdayPreferences {
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_true")]
    pub image_enabled: bool,
    #[serde(default = "default_true")]
    pub show_age: bool,
    #[serde(default)]
    pub celebration_style: CelebrationStyle,
}

fn default_true() -> bool {
    true
}

impl Default for BirthdayPreferences {
    fn default() -> Self {
        Self {
            active: true,
            image_enabled: true,
            show_age: true,
            celebration_style: CelebrationStyle::Standard,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirthdayRecord {
    pub month: u8,
    pub day: u8,
    pub year: Option<i32>,
    #[serde(default)]
    pub preferences: BirthdayPreferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BirthdayRecord {
    pub fn month_day(&self) -> Option<crate::MonthDay> {
        crate::MonthDay::new(self.month, self.day)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BirthdaysFile(pub HashMap<String, BirthdayRecord>);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminsFile {
    #[serde(default)]
    pub admins: HashSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionsFile {
    /// Sub-command name -> admin_only. Absent keys default to false (permissive).
    #[serde(default)]
    pub commands: HashMap<String, bool>,
}

impl PermissionsFile {
    pub fn is_admin_only(&self, command: &str) -> bool {
        self.commands.get(command).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonalityFile {
    pub current_personality: String,
    pub custom_settings: Option<serde_json::Value>,
    /// Most recent N personalities picked for `random` rotation, newest first.
    #[serde(default)]
    pub recent_personalities: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrackedThreadsFile {
    pub threads: HashMap<String, crate::thread_tracker::TrackedThread>,
    pub last_saved: Option<DateTime<Utc>>,
    pub ttl_hours: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnouncementLedgerDay {
    #[serde(default)]
    pub announced_user_ids: HashSet<String>,
    #[serde(default)]
    pub announced_timezone_bucket_user_ids: HashSet<String>,
    #[serde(default)]
    pub bot_self_announced: bool,
    #[serde(default)]
    pub special_days_announced: HashSet<(String, String, String)>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnouncementLedgerFile {
    /// Keyed by ISO date string (fleet-wide) or "date|bucket" (timezone-aware).
    #[serde(default)]
    pub days: HashMap<String, AnnouncementLedgerDay>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatsFile {
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub total_executions: u64,
    pub failed_executions: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpecialDayMode {
    Daily,
    Weekly,
}

impl Default for SpecialDayMode {
    fn default() -> Self {
        SpecialDayMode::Daily
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecialDaysConfigFile {
    #[serde(default)]
    pub category_enabled: HashMap<String, bool>,
    #[serde(default)]
    pub mode: SpecialDayMode,
    #[serde(default)]
    pub weekly_day: Option<u8>,
}

/// Cached result of a single historical-fact web search, keyed by
/// `(date, personality, year)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoricalFactCacheFile {
    pub fact: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanvasStateFile {
    pub canvas_id: Option<String>,
    pub canvas_updated_at: Option<DateTime<Utc>>,
    pub backup_thread_ts: Option<String>,
    pub backup_cache_key: Option<String>,
    pub backup_permalink: Option<String>,
}

// ---------------------------------------------------------------------
// Generic JSON-file store.
// ---------------------------------------------------------------------

/// Typed accessor over the JSON files under the data directory.
pub struct Datastore {
    storage_dir: PathBuf,
    cache_dir: PathBuf,
    backups_dir: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Datastore {
    pub fn new(storage_dir: PathBuf, cache_dir: PathBuf, backups_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            cache_dir,
            backups_dir,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(
            config.storage_dir(),
            config.cache_dir(),
            config.backups_dir(),
        )
    }

    pub fn storage_path(&self, name: &str) -> PathBuf {
        self.storage_dir.join(name)
    }

    pub fn cache_path(&self, relative: &str) -> PathBuf {
        self.cache_dir.join(relative)
    }

    async fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read and deserialize a JSON file, returning `T::default()` if it does not exist.
    pub async fn read<T>(&self, path: &Path) -> Result<T>
    where
        T: serde::de::DeserializeOwned + Default + Send + 'static,
    {
        let path = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> Result<T> {
            match std::fs::read(&path) {
                Ok(bytes) => {
                    tracing::debug!(path = %path.display(), "datastore read");
                    serde_json::from_slice(&bytes).map_err(|source| {
                        DatastoreError::Corrupt {
                            path: path.display().to_string(),
                            source,
                        }
                        .into()
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
                Err(source) => Err(DatastoreError::Read {
                    path: path.display().to_string(),
                    source,
                }
                .into()),
            }
        })
        .await
        .map_err(|e| anyhow::anyhow!("datastore read task panicked: {e}"))?;
        result
    }

    /// Write a JSON file atomically (write-to-temp, fsync, rename) under a
    /// per-path advisory lock with a 10s timeout.
    pub async fn write<T>(&self, path: &Path, value: &T) -> Result<()>
    where
        T: Serialize,
    {
        let lock = self.lock_for(path).await;
        let _guard = tokio::time::timeout(LOCK_TIMEOUT, lock.lock())
            .await
            .map_err(|_| DatastoreError::LockTimeout {
                path: path.display().to_string(),
                timeout_secs: LOCK_TIMEOUT.as_secs(),
            })?;

        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| DatastoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;

        let path = path.to_path_buf();
        let path_display = path.display().to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| anyhow::anyhow!("datastore write task panicked: {e}"))??;

        tracing::info!(path = %path_display, "datastore write");
        Ok(())
    }

    /// Read-modify-write under the file's lock, so two concurrent
    /// mutators can't lose each other's changes between load and save.
    /// The announcement ledger's check-and-set rides on this.
    pub async fn update<T, F, R>(&self, path: &Path, mutate: F) -> Result<R>
    where
        T: serde::de::DeserializeOwned + Default + Serialize,
        F: FnOnce(&mut T) -> R,
    {
        let lock = self.lock_for(path).await;
        let _guard = tokio::time::timeout(LOCK_TIMEOUT, lock.lock())
            .await
            .map_err(|_| DatastoreError::LockTimeout {
                path: path.display().to_string(),
                timeout_secs: LOCK_TIMEOUT.as_secs(),
            })?;

        let mut value: T = self.read(path).await?;
        let result = mutate(&mut value);

        let bytes = serde_json::to_vec_pretty(&value)
            .map_err(|source| DatastoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
        let path = path.to_path_buf();
        let path_display = path.display().to_string();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| anyhow::anyhow!("datastore write task panicked: {e}"))??;
        tracing::info!(path = %path_display, "datastore write");
        Ok(result)
    }

    pub async fn load_birthdays(&self) -> Result<BirthdaysFile> {
        self.read(&self.storage_path("birthdays.json")).await
    }

    /// Persist the birthdays file, rotating a ring buffer of at most
    /// [`MAX_BIRTHDAY_BACKUPS`] backups before the replace.
    pub async fn save_birthdays(&self, file: &BirthdaysFile) -> Result<()> {
        self.rotate_birthday_backup().await?;
        self.write(&self.storage_path("birthdays.json"), file).await
    }

    async fn rotate_birthday_backup(&self) -> Result<()> {
        let source = self.storage_path("birthdays.json");
        if tokio::fs::metadata(&source).await.is_err() {
            return Ok(()); // nothing to back up yet
        }
        let timestamp = Utc::now().format("%Y%m%dT%H%M%S%3f");
        let dest = self.backups_dir.join(format!("birthdays_{timestamp}.json"));
        if let Err(e) = tokio::fs::copy(&source, &dest).await {
            tracing::warn!(%e, "failed to write birthdays backup copy");
        }
        self.prune_birthday_backups().await
    }

    async fn prune_birthday_backups(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.backups_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("birthdays_") && name.ends_with(".json") {
                files.push(entry.path());
            }
        }
        files.sort();
        if files.len() > MAX_BIRTHDAY_BACKUPS {
            for stale in &files[..files.len() - MAX_BIRTHDAY_BACKUPS] {
                let _ = tokio::fs::remove_file(stale).await;
            }
        }
        Ok(())
    }

    pub async fn load_admins(&self) -> Result<AdminsFile> {
        self.read(&self.storage_path("admins.json")).await
    }

    pub async fn is_admin(&self, user_id: &UserId) -> Result<bool> {
        let admins = self.load_admins().await?;
        Ok(admins.admins.contains(user_id.as_ref()))
    }

    pub async fn load_permissions(&self) -> Result<PermissionsFile> {
        self.read(&self.storage_path("permissions.json")).await
    }

    pub async fn load_personality(&self) -> Result<PersonalityFile> {
        self.read(&self.storage_path("personality.json")).await
    }

    pub async fn save_personality(&self, file: &PersonalityFile) -> Result<()> {
        self.write(&self.storage_path("personality.json"), file).await
    }

    pub async fn load_tracked_threads(&self) -> Result<TrackedThreadsFile> {
        self.read(&self.storage_path("tracked_threads.json")).await
    }

    pub async fn save_tracked_threads(&self, file: &TrackedThreadsFile) -> Result<()> {
        self.write(&self.storage_path("tracked_threads.json"), file)
            .await
    }

    pub async fn load_ledger(&self) -> Result<AnnouncementLedgerFile> {
        self.read(&self.storage_path("announcements.json")).await
    }

    pub async fn save_ledger(&self, file: &AnnouncementLedgerFile) -> Result<()> {
        self.write(&self.storage_path("announcements.json"), file)
            .await
    }

    /// Mutate the announcement ledger under its file lock.
    pub async fn update_ledger<F, R>(&self, mutate: F) -> Result<R>
    where
        F: FnOnce(&mut AnnouncementLedgerFile) -> R,
    {
        self.update(&self.storage_path("announcements.json"), mutate)
            .await
    }

    /// Drops ledger days older than [`LEDGER_RETENTION_DAYS`].
    pub async fn prune_ledger(&self, today: chrono::NaiveDate) -> Result<usize> {
        let cutoff = today - chrono::Duration::days(LEDGER_RETENTION_DAYS);
        self.update_ledger(|ledger| {
            let before = ledger.days.len();
            ledger.days.retain(|key, _| {
                // Timezone-aware keys are plain ISO dates too, so one parse covers both.
                match chrono::NaiveDate::parse_from_str(key, "%Y-%m-%d") {
                    Ok(date) => date >= cutoff,
                    Err(_) => true,
                }
            });
            before - ledger.days.len()
        })
        .await
    }

    pub async fn load_scheduler_stats(&self) -> Result<SchedulerStatsFile> {
        self.read(&self.storage_path("scheduler_stats.json")).await
    }

    pub async fn save_scheduler_stats(&self, file: &SchedulerStatsFile) -> Result<()> {
        self.write(&self.storage_path("scheduler_stats.json"), file)
            .await
    }

    pub async fn load_special_days_config(&self) -> Result<SpecialDaysConfigFile> {
        self.read(&self.storage_path("special_days_config.json"))
            .await
    }

    pub async fn load_canvas_state(&self) -> Result<CanvasStateFile> {
        self.read(&self.storage_path("canvas_state.json")).await
    }

    pub async fn save_canvas_state(&self, file: &CanvasStateFile) -> Result<()> {
        self.write(&self.storage_path("canvas_state.json"), file)
            .await
    }

    /// Path for a cached historical fact, `cache/messages/facts_<DD>_<MM>_<personality>_<YYYY>.json`.
    fn historical_fact_path(&self, month: u8, day: u8, personality: &str, year: i32) -> PathBuf {
        self.cache_path(&format!(
            "messages/facts_{day:02}_{month:02}_{personality}_{year}.json"
        ))
    }

    /// Returns `None` on a cache miss (file absent or corrupt); callers
    /// fetch and call [`Self::save_historical_fact`] on miss.
    pub async fn load_historical_fact(
        &self,
        month: u8,
        day: u8,
        personality: &str,
        year: i32,
    ) -> Option<HistoricalFactCacheFile> {
        let path = self.historical_fact_path(month, day, personality, year);
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub async fn save_historical_fact(
        &self,
        month: u8,
        day: u8,
        personality: &str,
        year: i32,
        fact: &str,
    ) -> Result<()> {
        let path = self.historical_fact_path(month, day, personality, year);
        self.write(
            &path,
            &HistoricalFactCacheFile {
                fact: fact.to_string(),
                fetched_at: Utc::now(),
            },
        )
        .await
    }

    /// Per-day cleanup sweep: removes cached fact
    /// files from years other than `current_year`.
    pub async fn prune_stale_historical_facts(&self, current_year: i32) -> Result<usize> {
        let dir = self.cache_path("messages");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        let suffix = format!("_{current_year}.json");
        let mut removed = 0usize;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with("facts_") && name.ends_with(".json") && !name.ends_with(&suffix) {
                if tokio::fs::remove_file(entry.path()).await.is_ok() {
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "pruned stale historical fact cache entries");
        }
        Ok(removed)
    }
}

/// Retention window (days) for the announcement ledger.
pub const LEDGER_RETENTION_DAYS: i64 = 60;

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| DatastoreError::Write {
            path: path.display().to_string(),
            source,
        })?;
    }
    let tmp_path = path.with_extension(format!(
        "{}.tmp-{}",
        path.extension().and_then(|e| e.to_str()).unwrap_or("json"),
        uuid::Uuid::new_v4()
    ));

    let file = std::fs::File::create(&tmp_path).map_err(|source| DatastoreError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;
    {
        use std::io::Write;
        let mut writer = std::io::BufWriter::new(&file);
        writer.write_all(bytes).map_err(|source| DatastoreError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
        writer.flush().map_err(|source| DatastoreError::Write {
            path: tmp_path.display().to_string(),
            source,
        })?;
    }
    file.sync_all().map_err(|source| DatastoreError::Write {
        path: tmp_path.display().to_string(),
        source,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|source| DatastoreError::Write {
        path: path.display().to_string(),
        source,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore(dir: &Path) -> Datastore {
        Datastore::new(
            dir.join("storage"),
            dir.join("cache"),
            dir.join("backups"),
        )
    }

    #[tokio::test]
    async fn round_trips_birthday_record() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("backups")).unwrap();
        let ds = datastore(tmp.path());

        let mut file = BirthdaysFile::default();
        file.0.insert(
            "U1".to_string(),
            BirthdayRecord {
                month: 3,
                day: 15,
                year: Some(1990),
                preferences: BirthdayPreferences::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        ds.save_birthdays(&file).await.unwrap();

        let reloaded = ds.load_birthdays().await.unwrap();
        let record = &reloaded.0["U1"];
        assert_eq!(record.month, 3);
        assert_eq!(record.day, 15);
        assert_eq!(record.year, Some(1990));
    }

    #[tokio::test]
    async fn missing_file_yields_default() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = datastore(tmp.path());
        let file = ds.load_birthdays().await.unwrap();
        assert!(file.0.is_empty());
    }

    #[tokio::test]
    async fn backup_ring_buffer_caps_at_ten() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("backups")).unwrap();
        let ds = datastore(tmp.path());

        for i in 0..15 {
            let mut file = BirthdaysFile::default();
            file.0.insert(
                format!("U{i}"),
                BirthdayRecord {
                    month: 1,
                    day: 1,
                    year: None,
                    preferences: BirthdayPreferences::default(),
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                },
            );
            ds.save_birthdays(&file).await.unwrap();
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(tmp.path().join("backups")).await.unwrap();
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
        assert!(count <= MAX_BIRTHDAY_BACKUPS);
    }

    #[tokio::test]
    async fn concurrent_ledger_updates_are_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = Arc::new(datastore(tmp.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let ds = ds.clone();
            handles.push(tokio::spawn(async move {
                ds.update_ledger(|ledger| {
                    ledger
                        .days
                        .entry("2026-03-15".to_string())
                        .or_default()
                        .announced_user_ids
                        .insert(format!("U{i}"));
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let ledger = ds.load_ledger().await.unwrap();
        assert_eq!(ledger.days["2026-03-15"].announced_user_ids.len(), 8);
    }

    #[tokio::test]
    async fn prune_ledger_drops_only_days_past_retention() {
        let tmp = tempfile::tempdir().unwrap();
        let ds = datastore(tmp.path());
        let today = chrono::NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();

        ds.update_ledger(|ledger| {
            ledger.days.insert("2026-03-10".to_string(), Default::default());
            ledger.days.insert("2025-12-01".to_string(), Default::default());
        })
        .await
        .unwrap();

        let removed = ds.prune_ledger(today).await.unwrap();
        assert_eq!(removed, 1);
        let ledger = ds.load_ledger().await.unwrap();
        assert!(ledger.days.contains_key("2026-03-10"));
        assert!(!ledger.days.contains_key("2025-12-01"));
    }

    #[tokio::test]
    async fn corrupt_json_is_reported_as_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = tmp.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        std::fs::write(storage.join("birthdays.json"), b"not json").unwrap();
        let ds = datastore(tmp.path());

        let err = ds.load_birthdays().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Fatal);
    }
}
