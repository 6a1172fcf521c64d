//! Tracks birthday announcement threads for reply-engagement.
//!
//! The tracker is an explicitly constructed object the caller owns and
//! threads through; nothing here reaches for global mutable state.

use crate::datastore::{Datastore, TrackedThreadsFile};
use crate::error::Result;
use crate::{ChannelId, ThreadTs, UserId};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Whether a tracked thread was rooted by a birthday celebration or a
/// special-day announcement; the two kinds carry different
/// payloads (`birthday_people` vs. `special_day_info`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadType {
    Birthday,
    SpecialDay,
}

/// Structured payload for a special-day thread: the observance's identity
/// tuple, mirroring the aggregator's dedup key`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecialDayInfo {
    pub date_mmdd: String,
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedThread {
    pub channel: ChannelId,
    pub thread_ts: ThreadTs,
    pub thread_type: ThreadType,
    pub personality: String,
    pub created_at: DateTime<Utc>,
    pub reactions_count: u32,
    pub responses_sent: u32,
    /// Populated only for [`ThreadType::Birthday`] threads.
    #[serde(default)]
    pub birthday_people: Vec<UserId>,
    /// Populated only for [`ThreadType::SpecialDay`] threads.
    #[serde(default)]
    pub special_day_info: Option<SpecialDayInfo>,
}

impl TrackedThread {
    fn key(channel: &ChannelId, thread_ts: &ThreadTs) -> String {
        format!("{channel}_{thread_ts}")
    }

    pub fn is_expired(&self, ttl_hours: u64, now: DateTime<Utc>) -> bool {
        now > self.created_at + ChronoDuration::hours(ttl_hours as i64)
    }
}

/// What a tracked thread is rooted by, and its celebration payload
///`).
#[derive(Debug, Clone)]
pub enum TrackedThreadPayload {
    Birthday { people: Vec<UserId> },
    SpecialDay { info: SpecialDayInfo },
}

#[derive(Debug, Clone, Default)]
pub struct ThreadStats {
    pub active_threads: usize,
    pub total_tracked: usize,
    pub total_reactions: u32,
    pub total_responses: u32,
}

/// Tracks birthday threads in memory, backed by periodic persistence so a
/// restart doesn't lose in-flight engagement windows entirely.
pub struct ThreadTracker {
    threads: Mutex<HashMap<String, TrackedThread>>,
    ttl_hours: u64,
}

impl ThreadTracker {
    pub fn new(ttl_hours: u64) -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
            ttl_hours,
        }
    }

    /// Restore previously persisted threads, dropping any already expired.
    /// The persisted TTL wins over `default_ttl_hours` so an operator
    /// edit survives restarts.
    pub async fn load_from(datastore: &Datastore, default_ttl_hours: u64) -> Result<Self> {
        let file = datastore.load_tracked_threads().await?;
        let ttl_hours = if file.ttl_hours > 0 {
            file.ttl_hours
        } else if default_ttl_hours > 0 {
            default_ttl_hours
        } else {
            24
        };
        let now = Utc::now();
        let threads: HashMap<String, TrackedThread> = file
            .threads
            .into_iter()
            .filter(|(_, t)| !t.is_expired(ttl_hours, now))
            .collect();
        Ok(Self {
            threads: Mutex::new(threads),
            ttl_hours,
        })
    }

    pub async fn persist(&self, datastore: &Datastore) -> Result<()> {
        let threads = self.threads.lock().await;
        let file = TrackedThreadsFile {
            threads: threads.clone(),
            last_saved: Some(Utc::now()),
            ttl_hours: self.ttl_hours,
        };
        drop(threads);
        datastore.save_tracked_threads(&file).await
    }

    pub async fn track(
        &self,
        channel: ChannelId,
        thread_ts: ThreadTs,
        personality: String,
        payload: TrackedThreadPayload,
    ) -> TrackedThread {
        let (thread_type, birthday_people, special_day_info) = match payload {
            TrackedThreadPayload::Birthday { people } => (ThreadType::Birthday, people, None),
            TrackedThreadPayload::SpecialDay { info } => (ThreadType::SpecialDay, Vec::new(), Some(info)),
        };
        let thread = TrackedThread {
            channel: channel.clone(),
            thread_ts: thread_ts.clone(),
            thread_type,
            personality,
            created_at: Utc::now(),
            reactions_count: 0,
            responses_sent: 0,
            birthday_people,
            special_day_info,
        };
        let key = TrackedThread::key(&channel, &thread_ts);
        self.threads.lock().await.insert(key, thread.clone());
        thread
    }

    /// Returns the tracked thread if present and not yet expired, evicting
    /// it from the map on expiry.
    pub async fn get(&self, channel: &ChannelId, thread_ts: &ThreadTs) -> Option<TrackedThread> {
        let key = TrackedThread::key(channel, thread_ts);
        let mut threads = self.threads.lock().await;
        match threads.get(&key) {
            Some(t) if !t.is_expired(self.ttl_hours, Utc::now()) => Some(t.clone()),
            Some(_) => {
                threads.remove(&key);
                None
            }
            None => None,
        }
    }

    pub async fn is_tracked(&self, channel: &ChannelId, thread_ts: &ThreadTs) -> bool {
        self.get(channel, thread_ts).await.is_some()
    }

    pub async fn increment_reactions(&self, channel: &ChannelId, thread_ts: &ThreadTs) -> bool {
        let key = TrackedThread::key(channel, thread_ts);
        let mut threads = self.threads.lock().await;
        match threads.get_mut(&key) {
            Some(t) if !t.is_expired(self.ttl_hours, Utc::now()) => {
                t.reactions_count += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn increment_responses(&self, channel: &ChannelId, thread_ts: &ThreadTs) -> bool {
        let key = TrackedThread::key(channel, thread_ts);
        let mut threads = self.threads.lock().await;
        match threads.get_mut(&key) {
            Some(t) if !t.is_expired(self.ttl_hours, Utc::now()) => {
                t.responses_sent += 1;
                true
            }
            _ => false,
        }
    }

    pub async fn cleanup_expired(&self) -> usize {
        let mut threads = self.threads.lock().await;
        let now = Utc::now();
        let expired: Vec<String> = threads
            .iter()
            .filter(|(_, t)| t.is_expired(self.ttl_hours, now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            threads.remove(key);
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "cleaned up expired threads");
        }
        expired.len()
    }

    pub async fn stats(&self) -> ThreadStats {
        let threads = self.threads.lock().await;
        let now = Utc::now();
        let active: Vec<&TrackedThread> =
            threads.values().filter(|t| !t.is_expired(self.ttl_hours, now)).collect();
        ThreadStats {
            active_threads: active.len(),
            total_tracked: threads.len(),
            total_reactions: active.iter().map(|t| t.reactions_count).sum(),
            total_responses: active.iter().map(|t| t.responses_sent).sum(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (ChannelId, ThreadTs) {
        ("C123".into(), "1700000000.000100".into())
    }

    #[tokio::test]
    async fn tracks_and_retrieves_a_thread() {
        let tracker = ThreadTracker::new(24);
        let (channel, ts) = ids();
        tracker
            .track(channel.clone(), ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U1".into()] })
            .await;
        assert!(tracker.is_tracked(&channel, &ts).await);
        assert!(tracker.increment_reactions(&channel, &ts).await);
        let thread = tracker.get(&channel, &ts).await.unwrap();
        assert_eq!(thread.reactions_count, 1);
    }

    #[tokio::test]
    async fn expired_thread_is_evicted_on_access() {
        let tracker = ThreadTracker::new(24);
        let (channel, ts) = ids();
        let mut thread = tracker
            .track(channel.clone(), ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U1".into()] })
            .await;
        thread.created_at = Utc::now() - ChronoDuration::hours(25);
        tracker
            .threads
            .lock()
            .await
            .insert(TrackedThread::key(&channel, &ts), thread);
        assert!(tracker.get(&channel, &ts).await.is_none());
        assert!(!tracker.is_tracked(&channel, &ts).await);
    }

    #[tokio::test]
    async fn reload_recovers_exactly_the_non_expired_subset() {
        let tmp = tempfile::tempdir().unwrap();
        let datastore = Datastore::new(
            tmp.path().join("storage"),
            tmp.path().join("cache"),
            tmp.path().join("backups"),
        );
        let tracker = ThreadTracker::new(24);
        let (channel, fresh_ts) = ids();
        tracker
            .track(channel.clone(), fresh_ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U1".into()] })
            .await;

        let stale_ts: ThreadTs = "1600000000.000000".into();
        let mut stale = tracker
            .track(channel.clone(), stale_ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U2".into()] })
            .await;
        stale.created_at = Utc::now() - ChronoDuration::hours(48);
        tracker
            .threads
            .lock()
            .await
            .insert(TrackedThread::key(&channel, &stale_ts), stale);

        tracker.persist(&datastore).await.unwrap();

        let reloaded = ThreadTracker::load_from(&datastore, 24).await.unwrap();
        assert!(reloaded.is_tracked(&channel, &fresh_ts).await);
        assert!(!reloaded.is_tracked(&channel, &stale_ts).await);
        assert_eq!(reloaded.threads.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn cleanup_expired_removes_stale_entries_only() {
        let tracker = ThreadTracker::new(24);
        let (fresh_channel, fresh_ts) = ids();
        tracker
            .track(fresh_channel.clone(), fresh_ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U1".into()] })
            .await;
        let stale_ts: ThreadTs = "1600000000.000000".into();
        let mut stale = tracker
            .track(fresh_channel.clone(), stale_ts.clone(), "standard".into(), TrackedThreadPayload::Birthday { people: vec!["U2".into()] })
            .await;
        stale.created_at = Utc::now() - ChronoDuration::hours(48);
        tracker
            .threads
            .lock()
            .await
            .insert(TrackedThread::key(&fresh_channel, &stale_ts), stale);

        let cleaned = tracker.cleanup_expired().await;
        assert_eq!(cleaned, 1);
        assert!(tracker.is_tracked(&fresh_channel, &fresh_ts).await);
    }
}
