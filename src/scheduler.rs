//! Birthday and special-day scheduler.
//!
//! Four cooperating loops share one in-memory stats record: a fleet-wide
//! daily sweep at `daily_check_hour:daily_check_minute` server-local
//! time, a per-user-timezone-aware sweep gated by the
//! `timezone_aware_celebrations` toggle, a special-day emission sweep,
//! and an early-morning stale-cache refresh tick. Every loop reports
//! through the same `ExecutionGuard`/circuit-breaker idiom; a heartbeat
//! loop keeps the persisted stats fresh enough for the health aggregator.

use crate::config::Config;
use crate::datastore::{BirthdayRecord, Datastore, SchedulerStatsFile, SpecialDayMode};
use crate::error::{Error, Result};
use crate::imagegen::ImageGen;
use crate::llm::Completer;
use crate::messaging::traits::{ChatPlatform, OutboundResponse};
use crate::observance::aggregator::aggregate_range;
use crate::observance::ObservanceSourceDyn;
use crate::personality::{Personality, PersonalityFile};
use crate::pipeline::{
    run_celebration_pipeline, run_special_day_pipeline, BirthdayPerson, CelebrationMode,
    CelebrationRequest,
};
use crate::profile::ProfileResolver;
use crate::thread_tracker::ThreadTracker;
use crate::time_model::{
    effective_celebration_date, has_crossed_celebration_hour, is_birthday_today_fleet_wide,
    parse_timezone,
};
use crate::{ChannelId, MonthDay, UserId};
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Timelike, Utc};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, MissedTickBehavior};

const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// In-memory scheduler stats shared by every loop, flushed to disk by the
/// heartbeat loop and after each sweep.
type SharedStats = Arc<Mutex<SchedulerStatsFile>>;

/// RAII guard that clears an `AtomicBool` on drop, ensuring the flag is
/// released even if the holding task panics.
struct ExecutionGuard(Arc<AtomicBool>);

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Collaborators one scheduler tick needs to do its work.
pub struct SchedulerDeps<P, C, I> {
    pub config: Arc<Config>,
    pub datastore: Arc<Datastore>,
    pub profiles: Arc<ProfileResolver<P>>,
    pub tracker: Arc<ThreadTracker>,
    pub chat: Arc<P>,
    pub completer: Arc<C>,
    pub imagegen: Arc<I>,
    pub observance_sources: Arc<Vec<Arc<dyn ObservanceSourceDyn>>>,
}

impl<P, C, I> Clone for SchedulerDeps<P, C, I> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            datastore: self.datastore.clone(),
            profiles: self.profiles.clone(),
            tracker: self.tracker.clone(),
            chat: self.chat.clone(),
            completer: self.completer.clone(),
            imagegen: self.imagegen.clone(),
            observance_sources: self.observance_sources.clone(),
        }
    }
}

/// Runs every scheduler loop until the process exits. Each loop reports
/// consecutive failures through its own circuit breaker that disables the
/// loop (but not the whole process) past `MAX_CONSECUTIVE_FAILURES`.
pub async fn run<P, C, I>(deps: SchedulerDeps<P, C, I>) -> Result<()>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let stats = load_stats(&deps.datastore).await;
    {
        let mut guard = stats.lock().await;
        guard.started_at = Some(Utc::now());
    }
    flush_stats(&deps.datastore, &stats).await;

    let heartbeat = tokio::spawn(run_heartbeat_loop(
        deps.datastore.clone(),
        stats.clone(),
        deps.config.scheduler.stats_flush_every_n_iterations.max(1),
        deps.config.scheduler.heartbeat_stale_threshold_secs,
    ));
    let daily = tokio::spawn(run_daily_loop(deps.clone(), stats.clone()));
    let timezone_aware = tokio::spawn(run_timezone_loop(deps.clone(), stats.clone()));
    let special_days = tokio::spawn(run_special_day_loop(deps.clone(), stats.clone()));
    let cache_refresh = tokio::spawn(run_cache_refresh_loop(deps.clone(), stats.clone()));

    let _ = tokio::join!(heartbeat, daily, timezone_aware, special_days, cache_refresh);
    Ok(())
}

async fn load_stats(datastore: &Datastore) -> SharedStats {
    let file = datastore.load_scheduler_stats().await.unwrap_or_default();
    Arc::new(Mutex::new(file))
}

async fn flush_stats(datastore: &Datastore, stats: &SharedStats) {
    let snapshot = stats.lock().await.clone();
    if let Err(error) = datastore.save_scheduler_stats(&snapshot).await {
        tracing::warn!(%error, "failed to flush scheduler stats");
    }
}

/// Updates `last_heartbeat` every iteration and flushes the stats file
/// either every `flush_every_n` iterations or early enough that the
/// on-disk heartbeat never crosses the staleness threshold.
async fn run_heartbeat_loop(
    datastore: Arc<Datastore>,
    stats: SharedStats,
    flush_every_n: u32,
    stale_threshold_secs: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut iteration: u32 = 0;
    let mut last_flush = Instant::now();

    loop {
        ticker.tick().await;
        iteration = iteration.wrapping_add(1);
        stats.lock().await.last_heartbeat = Some(Utc::now());

        let due_by_count = iteration % flush_every_n == 0;
        let due_by_age = last_flush.elapsed().as_secs() * 2 >= stale_threshold_secs;
        if due_by_count || due_by_age {
            flush_stats(&datastore, &stats).await;
            last_flush = Instant::now();
        }
    }
}

/// Fleet-wide daily sweep: fires once per calendar day at the configured
/// server-local hour:minute, celebrating everyone whose birthday matches
/// today (under the Feb-29 policy) and isn't already in the ledger.
async fn run_daily_loop<P, C, I>(deps: SchedulerDeps<P, C, I>, stats: SharedStats)
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let execution_lock = Arc::new(AtomicBool::new(false));
    let consecutive_failures = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if deps.config.toggles().timezone_aware_celebrations {
            continue; // this mode is exclusive with the timezone-aware loop
        }

        let now = Utc::now();
        let target = &deps.config.scheduler;
        if now.hour() as u8 != target.daily_check_hour || now.minute() as u8 != target.daily_check_minute {
            continue;
        }

        if execution_lock.load(Ordering::Acquire) {
            tracing::debug!("daily scheduler tick still running, skipping");
            continue;
        }
        execution_lock.store(true, Ordering::Release);
        let guard = ExecutionGuard(execution_lock.clone());

        let today = now.date_naive();
        if let Err(error) = deps.datastore.prune_ledger(today).await {
            tracing::warn!(%error, "ledger retention prune failed");
        }
        let outcome = run_daily_sweep(&deps, today).await;
        drop(guard);
        handle_tick_outcome(&deps, &stats, outcome, &consecutive_failures, "daily").await;
    }
}

/// Per-user-timezone-aware sweep: polls frequently, celebrating each
/// person exactly once when their own local clock crosses
/// `timezone_celebration_hour` on their birthday.
async fn run_timezone_loop<P, C, I>(deps: SchedulerDeps<P, C, I>, stats: SharedStats)
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let execution_lock = Arc::new(AtomicBool::new(false));
    let consecutive_failures = Arc::new(AtomicU32::new(0));
    let interval_secs = deps.config.scheduler.timezone_check_interval_secs.max(1);
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if !deps.config.toggles().timezone_aware_celebrations {
            continue;
        }

        if execution_lock.load(Ordering::Acquire) {
            tracing::debug!("timezone-aware scheduler tick still running, skipping");
            continue;
        }
        execution_lock.store(true, Ordering::Release);
        let guard = ExecutionGuard(execution_lock.clone());

        let outcome = run_timezone_sweep(&deps, Utc::now()).await;
        drop(guard);
        handle_tick_outcome(&deps, &stats, outcome, &consecutive_failures, "timezone-aware").await;
    }
}

/// Daily (or weekly-digest) special-day announcement sweep.
async fn run_special_day_loop<P, C, I>(deps: SchedulerDeps<P, C, I>, stats: SharedStats)
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let execution_lock = Arc::new(AtomicBool::new(false));
    let consecutive_failures = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        if !deps.config.toggles().special_days {
            continue;
        }

        let now = Utc::now();
        let target = &deps.config.scheduler;
        if now.hour() as u8 != target.daily_check_hour || now.minute() as u8 != target.daily_check_minute {
            continue;
        }

        if execution_lock.load(Ordering::Acquire) {
            continue;
        }
        execution_lock.store(true, Ordering::Release);
        let guard = ExecutionGuard(execution_lock.clone());

        let outcome = run_special_day_sweep(&deps, now.date_naive()).await;
        drop(guard);
        handle_tick_outcome(&deps, &stats, outcome, &consecutive_failures, "special-day").await;
    }
}

/// Early-morning stale-cache refresh. Refreshes run concurrently; each source's own refresh lock
/// coalesces overlapping requests.
async fn run_cache_refresh_loop<P, C, I>(deps: SchedulerDeps<P, C, I>, stats: SharedStats)
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let consecutive_failures = Arc::new(AtomicU32::new(0));
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let now = Utc::now();
        let target = &deps.config.scheduler;
        if now.hour() as u8 != target.cache_refresh_hour || now.minute() as u8 != target.cache_refresh_minute {
            continue;
        }

        let outcome = refresh_stale_sources(&deps.observance_sources).await;
        handle_tick_outcome(&deps, &stats, outcome, &consecutive_failures, "cache-refresh").await;
    }
}

async fn refresh_stale_sources(sources: &[Arc<dyn ObservanceSourceDyn>]) -> Result<()> {
    for source in sources {
        let stale = match source.status().await {
            Ok(status) => status.enabled && !status.cache_fresh,
            Err(error) => {
                tracing::warn!(source = ?source.name(), %error, "failed to read source status before refresh");
                continue;
            }
        };
        if !stale {
            continue;
        }
        let source = source.clone();
        tokio::spawn(async move {
            match source.refresh(false).await {
                Ok(outcome) => {
                    tracing::info!(source = ?source.name(), count = outcome.observances_count, "stale observance cache refreshed");
                }
                Err(error) => {
                    tracing::warn!(source = ?source.name(), %error, "stale observance cache refresh failed");
                }
            }
        });
    }
    Ok(())
}

async fn handle_tick_outcome<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    stats: &SharedStats,
    outcome: Result<()>,
    consecutive_failures: &Arc<AtomicU32>,
    loop_name: &str,
) where
    P: ChatPlatform + Sync + 'static,
{
    {
        let mut stats = stats.lock().await;
        stats.total_executions += 1;
        stats.last_heartbeat = Some(Utc::now());

        match &outcome {
            Ok(()) => {
                consecutive_failures.store(0, Ordering::Release);
                stats.last_success_at = Some(Utc::now());
            }
            Err(error) => {
                stats.failed_executions += 1;
                stats.last_error = Some(error.to_string());
            }
        }
    }

    if let Err(error) = outcome {
        let failures = consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::error!(loop_name, %error, failures, "scheduler tick failed");
        notify_ops(deps, format!(":warning: {loop_name} scheduler tick failed: {error}")).await;
        if failures >= MAX_CONSECUTIVE_FAILURES {
            tracing::warn!(loop_name, "circuit breaker tripped after {MAX_CONSECUTIVE_FAILURES} consecutive failures");
        }
    }

    flush_stats(&deps.datastore, stats).await;
}

/// Best-effort short diagnostic to the operator channel.
async fn notify_ops<P, C, I>(deps: &SchedulerDeps<P, C, I>, text: String)
where
    P: ChatPlatform + Sync + 'static,
{
    let channel: ChannelId = deps
        .config
        .ops_channel_id
        .as_deref()
        .unwrap_or(&deps.config.birthday_channel_id)
        .into();
    if let Err(error) = deps.chat.post_message(&channel, OutboundResponse::Text(text)).await {
        tracing::warn!(%error, "failed to post ops notification");
    }
}

pub(crate) async fn run_daily_sweep<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    today: NaiveDate,
) -> Result<()>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let birthdays = deps.datastore.load_birthdays().await?;
    let ledger = deps.datastore.load_ledger().await?;
    let date_key = today.format("%Y-%m-%d").to_string();
    let already = ledger.days.get(&date_key).cloned().unwrap_or_default();

    let candidates: Vec<(String, BirthdayRecord)> = birthdays
        .0
        .into_iter()
        .filter(|(user_id, record)| {
            let Some(md) = record.month_day() else { return false };
            is_birthday_today_fleet_wide(md, today) && !already.announced_user_ids.contains(user_id)
        })
        .collect();

    if candidates.is_empty() {
        return Ok(());
    }

    celebrate(deps, candidates, today, date_key, false).await
}

async fn run_timezone_sweep<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    now: DateTime<Utc>,
) -> Result<()>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let birthdays = deps.datastore.load_birthdays().await?;
    let ledger = deps.datastore.load_ledger().await?;
    let celebration_hour = deps.config.scheduler.timezone_celebration_hour;

    let mut by_date_key: std::collections::HashMap<String, Vec<(String, BirthdayRecord)>> =
        std::collections::HashMap::new();

    for (user_id, record) in birthdays.0 {
        let Some(record_md) = record.month_day() else { continue };
        let Ok(profile) = deps.profiles.get_profile(&Arc::from(user_id.as_str())).await else {
            continue;
        };
        // Prefer the profile's IANA zone (DST-correct); fall back to the
        // cached raw offset for profiles without one.
        let local_date = match profile.timezone.as_deref().and_then(|tz| parse_timezone(tz).ok()) {
            Some(tz) => has_crossed_celebration_hour(tz, record_md, celebration_hour, now),
            None => {
                let local = now + chrono::Duration::seconds(profile.timezone_offset_seconds as i64);
                let local_date = local.date_naive();
                let expected = effective_celebration_date(record_md, local_date.year());
                let matches = MonthDay::new(local_date.month() as u8, local_date.day() as u8) == Some(expected);
                (matches && local.hour() >= celebration_hour as u32).then_some(local_date)
            }
        };
        let Some(local_date) = local_date else { continue };

        let date_key = local_date.format("%Y-%m-%d").to_string();
        let already = ledger
            .days
            .get(&date_key)
            .map(|d| d.announced_timezone_bucket_user_ids.contains(&user_id))
            .unwrap_or(false);
        if already {
            continue;
        }
        by_date_key
            .entry(date_key)
            .or_default()
            .push((user_id, record));
    }

    for (date_key, candidates) in by_date_key {
        let today = now.date_naive();
        if let Err(error) = celebrate(deps, candidates, today, date_key, true).await {
            tracing::error!(%error, "timezone-aware celebration batch failed");
        }
    }

    Ok(())
}

async fn celebrate<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    candidates: Vec<(String, BirthdayRecord)>,
    today: NaiveDate,
    date_key: String,
    timezone_aware: bool,
) -> Result<()>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let people: Vec<BirthdayPerson> = candidates
        .into_iter()
        .map(|(user_id, record)| BirthdayPerson {
            user_id: Arc::from(user_id.as_str()),
            record,
            profile: None,
        })
        .collect();

    let destination: ChannelId = Arc::from(deps.config.birthday_channel_id.as_str());
    let request = CelebrationRequest::new(destination, people, CelebrationMode::Production, today, date_key)
        .with_timezone_aware(timezone_aware);

    let mut personality_file = deps.datastore.load_personality().await.unwrap_or_default();
    let personality = resolve_personality(&personality_file);
    if personality.key() != personality_file.current_personality {
        Personality::record_selection(&mut personality_file, personality);
        if let Err(error) = deps.datastore.save_personality(&personality_file).await {
            tracing::warn!(%error, "failed to persist personality rotation history");
        }
    }

    let pipeline_deps = crate::pipeline::PipelineDeps {
        datastore: &deps.datastore,
        profiles: &deps.profiles,
        tracker: &deps.tracker,
        chat: deps.chat.as_ref(),
        completer: deps.completer.as_ref(),
        imagegen: deps.imagegen.as_ref(),
    };

    let toggles = deps.config.toggles();
    match run_celebration_pipeline(&pipeline_deps, request, personality, toggles).await {
        Ok(outcome) => {
            tracing::info!(
                celebrated = outcome.celebrated.len(),
                dropped = outcome.dropped.len(),
                images_posted = outcome.images_posted,
                "celebration pipeline completed"
            );
            Ok(())
        }
        Err(error) => {
            notify_ops(deps, format!(":rotating_light: celebration failed: {error}")).await;
            Err(error)
        }
    }
}

/// Resolves the configured personality for a birthday celebration.
/// `random`, `custom`, and `chronicler` never announce birthdays; they
/// fall through to the rotation over the concrete pool.
fn resolve_personality(file: &PersonalityFile) -> Personality {
    match Personality::from_key(&file.current_personality) {
        Some(Personality::Random | Personality::Custom | Personality::Chronicler) | None => {
            Personality::resolve_random(&file.recent_personalities)
        }
        Some(other) => other,
    }
}

/// The immediate-vs-deferred gate, as a pure decision: fire now
/// only when the user is a member, nothing is in the ledger for today,
/// and the daily sweep hasn't yet run (past the sweep time, the next
/// pass consolidates instead).
fn should_fire_immediately(
    now_time: NaiveTime,
    daily_check_time: NaiveTime,
    is_member: bool,
    already_celebrated: bool,
) -> bool {
    is_member && !already_celebrated && now_time < daily_check_time
}

/// Immediate-celebration path for a birthday added today.
/// Returns whether a celebration fired; `false` means the decision
/// deferred to the next scheduler pass.
pub async fn maybe_fire_immediate<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    user_id: &UserId,
    now: DateTime<Utc>,
) -> Result<bool>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    if deps.config.toggles().timezone_aware_celebrations {
        return Ok(false); // the per-user sweep owns firing in this mode
    }

    let birthdays = deps.datastore.load_birthdays().await?;
    let Some(record) = birthdays.0.get(user_id.as_ref()).cloned() else {
        return Ok(false);
    };
    let Some(record_md) = record.month_day() else {
        return Ok(false);
    };
    if !record.preferences.active {
        return Ok(false);
    }

    let today = now.date_naive();
    if !is_birthday_today_fleet_wide(record_md, today) {
        return Ok(false);
    }

    let destination: ChannelId = Arc::from(deps.config.birthday_channel_id.as_str());
    let members = deps.profiles.list_channel_members(&destination).await.unwrap_or_default();
    let is_member = members.is_empty() || members.iter().any(|m| m == user_id);

    let date_key = today.format("%Y-%m-%d").to_string();
    let ledger = deps.datastore.load_ledger().await?;
    let already = ledger
        .days
        .get(&date_key)
        .map(|d| d.announced_user_ids.contains(user_id.as_ref()))
        .unwrap_or(false);

    let target = &deps.config.scheduler;
    let daily_check_time = NaiveTime::from_hms_opt(
        target.daily_check_hour as u32,
        target.daily_check_minute as u32,
        0,
    )
    .ok_or_else(|| Error::Other(anyhow::anyhow!("invalid daily check time in config")))?;

    if !should_fire_immediately(now.time(), daily_check_time, is_member, already) {
        tracing::info!(user_id = %user_id, "deferring today's new birthday to the next scheduler pass");
        return Ok(false);
    }

    celebrate(deps, vec![(user_id.to_string(), record)], today, date_key, false).await?;
    Ok(true)
}

async fn run_special_day_sweep<P, C, I>(
    deps: &SchedulerDeps<P, C, I>,
    today: NaiveDate,
) -> Result<()>
where
    P: ChatPlatform + Sync + 'static,
    C: Completer + Sync + Send + 'static,
    I: ImageGen + Sync + Send + 'static,
{
    let config = deps.datastore.load_special_days_config().await?;
    let dates = match config.mode {
        SpecialDayMode::Daily => vec![MonthDay::new(today.month() as u8, today.day() as u8)
            .ok_or_else(|| Error::Other(anyhow::anyhow!("invalid calendar date")))?],
        SpecialDayMode::Weekly => {
            if config.weekly_day.map(|d| d as u32) != Some(today.weekday().num_days_from_monday()) {
                return Ok(());
            }
            // Digest covers the upcoming week, today included.
            (0..7)
                .filter_map(|offset| {
                    let date = today + chrono::Duration::days(offset);
                    MonthDay::new(date.month() as u8, date.day() as u8)
                })
                .collect()
        }
    };

    let days = aggregate_range(deps.observance_sources.as_slice(), &dates, &config.category_enabled).await;
    if days.is_empty() {
        return Ok(());
    }

    let date_key = today.format("%Y-%m-%d").to_string();
    let already = deps
        .datastore
        .load_ledger()
        .await?
        .days
        .get(&date_key)
        .cloned()
        .unwrap_or_default();
    let fresh: Vec<_> = days
        .into_iter()
        .filter(|d| {
            let identity = (d.date.to_string(), d.name.clone(), format!("{:?}", d.source));
            !already.special_days_announced.contains(&identity)
        })
        .collect();

    if fresh.is_empty() {
        return Ok(());
    }

    // Special-day announcements always use the chronicler voice; it is
    // reserved for them.
    let personality = Personality::Chronicler;

    let destination: ChannelId = Arc::from(deps.config.birthday_channel_id.as_str());
    let detail = matches!(config.mode, SpecialDayMode::Weekly);
    run_special_day_pipeline(
        deps.chat.as_ref(),
        deps.completer.as_ref(),
        &deps.tracker,
        &deps.datastore,
        &destination,
        &fresh,
        personality,
        detail,
    )
    .await?;

    deps.datastore
        .update_ledger(|ledger| {
            let day = ledger.days.entry(date_key).or_default();
            for announced in &fresh {
                day.special_days_announced.insert((
                    announced.date.to_string(),
                    announced.name.clone(),
                    format!("{:?}", announced.source),
                ));
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::BirthdayPreferences;
    use crate::imagegen::{GeneratedImage, ImageQuality, ImageSize};
    use crate::llm::{ChatMessage, CompletionOutcome};
    use crate::messaging::traits::{InboundStream, MembersPage, UploadedFile};
    use crate::profile::UserProfile;
    use std::sync::atomic::AtomicUsize;

    struct MockChat {
        posts: AtomicUsize,
    }

    impl MockChat {
        fn new() -> Self {
            Self { posts: AtomicUsize::new(0) }
        }
    }

    impl ChatPlatform for MockChat {
        async fn start(&self) -> Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn post_message(
            &self,
            _channel: &ChannelId,
            _response: OutboundResponse,
        ) -> Result<crate::ThreadTs> {
            let n = self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::from(format!("1700000000.{n:06}").as_str()))
        }

        async fn add_reaction(&self, _channel: &ChannelId, _ts: &crate::ThreadTs, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn upload_and_wait(&self, _bytes: Vec<u8>, _filename: String) -> Result<UploadedFile> {
            Ok(UploadedFile { file_id: "F1".into(), mimetype: Some("image/png".into()), permalink: None })
        }

        async fn users_profile_get(&self, user_id: &UserId) -> Result<UserProfile> {
            Ok(UserProfile {
                display_name: user_id.to_string(),
                real_name: format!("Person {user_id}"),
                title: None,
                timezone: None,
                timezone_offset_seconds: 0,
                photo_urls: Default::default(),
                is_deleted: false,
                is_bot: false,
                custom_fields: Default::default(),
            })
        }

        async fn users_info_is_admin(&self, _user_id: &UserId) -> Result<bool> {
            Ok(false)
        }

        async fn conversations_members(&self, _channel: &ChannelId, _cursor: Option<&str>) -> Result<MembersPage> {
            Ok(MembersPage { members: vec!["U1".into(), "U2".into()], next_cursor: None })
        }

        async fn conversations_open(&self, _user_id: &UserId) -> Result<ChannelId> {
            Ok("D1".into())
        }
    }

    struct StubCompleter;
    impl Completer for StubCompleter {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _max_tokens: u32,
            _temperature: f32,
            _reasoning_effort: Option<&str>,
        ) -> Result<CompletionOutcome> {
            Ok(CompletionOutcome {
                text: "Happy birthday <@U1> and <@U2>!".into(),
                usage: Default::default(),
            })
        }
    }

    struct StubImageGen;
    impl ImageGen for StubImageGen {
        async fn generate(
            &self,
            _prompt: &str,
            _quality: ImageQuality,
            _size: ImageSize,
            _reference_image: Option<&[u8]>,
        ) -> Result<GeneratedImage> {
            Ok(GeneratedImage { bytes: vec![0u8; 4], usage: Default::default() })
        }
    }

    fn test_deps(dir: &std::path::Path) -> SchedulerDeps<MockChat, StubCompleter, StubImageGen> {
        let config = Arc::new(Config::for_tests(dir.to_path_buf()));
        let datastore = Arc::new(Datastore::from_config(&config));
        let chat = Arc::new(MockChat::new());
        SchedulerDeps {
            config,
            datastore: datastore.clone(),
            profiles: Arc::new(ProfileResolver::new(chat.clone(), datastore)),
            tracker: Arc::new(ThreadTracker::new(24)),
            chat,
            completer: Arc::new(StubCompleter),
            imagegen: Arc::new(StubImageGen),
            observance_sources: Arc::new(Vec::new()),
        }
    }

    async fn seed_birthday(
        deps: &SchedulerDeps<MockChat, StubCompleter, StubImageGen>,
        user_id: &str,
        month: u8,
        day: u8,
    ) {
        let mut birthdays = deps.datastore.load_birthdays().await.unwrap();
        birthdays.0.insert(
            user_id.to_string(),
            BirthdayRecord {
                month,
                day,
                year: Some(1990),
                preferences: BirthdayPreferences::default(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        );
        deps.datastore.save_birthdays(&birthdays).await.unwrap();
    }

    #[tokio::test]
    async fn running_the_daily_sweep_twice_celebrates_each_user_once() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        seed_birthday(&deps, "U1", 3, 15).await;
        let today = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();

        run_daily_sweep(&deps, today).await.unwrap();
        let posts_after_first = deps.chat.posts.load(Ordering::SeqCst);
        assert!(posts_after_first >= 1);

        run_daily_sweep(&deps, today).await.unwrap();
        assert_eq!(deps.chat.posts.load(Ordering::SeqCst), posts_after_first);

        let ledger = deps.datastore.load_ledger().await.unwrap();
        let day = &ledger.days["2026-03-15"];
        assert!(day.announced_user_ids.contains("U1"));
        assert_eq!(day.announced_user_ids.len(), 1);
    }

    #[tokio::test]
    async fn daily_sweep_fires_feb_29_birthdays_on_feb_28_in_non_leap_years() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        seed_birthday(&deps, "U1", 2, 29).await;

        let feb_28 = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
        run_daily_sweep(&deps, feb_28).await.unwrap();
        let ledger = deps.datastore.load_ledger().await.unwrap();
        assert!(ledger.days["2026-02-28"].announced_user_ids.contains("U1"));

        let mar_1 = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();
        let posts_before = deps.chat.posts.load(Ordering::SeqCst);
        run_daily_sweep(&deps, mar_1).await.unwrap();
        assert_eq!(deps.chat.posts.load(Ordering::SeqCst), posts_before);
    }

    #[tokio::test]
    async fn immediate_fire_defers_after_the_daily_sweep_time() {
        let tmp = tempfile::tempdir().unwrap();
        let deps = test_deps(tmp.path());
        seed_birthday(&deps, "U1", 3, 15).await;

        // 10:30 is past the default 09:00 daily check.
        let after_sweep = "2026-03-15T10:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let fired = maybe_fire_immediate(&deps, &UserId::from("U1"), after_sweep).await.unwrap();
        assert!(!fired);

        let before_sweep = "2026-03-15T07:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let fired = maybe_fire_immediate(&deps, &UserId::from("U1"), before_sweep).await.unwrap();
        assert!(fired);

        // Once in the ledger, a second pre-sweep trigger is a no-op.
        let fired = maybe_fire_immediate(&deps, &UserId::from("U1"), before_sweep).await.unwrap();
        assert!(!fired);
    }

    #[test]
    fn immediate_fire_decision_gates() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let early = NaiveTime::from_hms_opt(7, 0, 0).unwrap();
        let late = NaiveTime::from_hms_opt(11, 0, 0).unwrap();
        assert!(should_fire_immediately(early, nine, true, false));
        assert!(!should_fire_immediately(late, nine, true, false));
        assert!(!should_fire_immediately(early, nine, false, false));
        assert!(!should_fire_immediately(early, nine, true, true));
    }

    #[test]
    fn resolves_concrete_personality_from_key() {
        let file = PersonalityFile {
            current_personality: "poet".to_string(),
            custom_settings: None,
            recent_personalities: vec![],
        };
        assert_eq!(resolve_personality(&file), Personality::Poet);
    }

    #[test]
    fn chronicler_never_announces_birthdays() {
        let file = PersonalityFile {
            current_personality: "chronicler".to_string(),
            custom_settings: None,
            recent_personalities: vec![],
        };
        let resolved = resolve_personality(&file);
        assert_ne!(resolved, Personality::Chronicler);
        assert!(crate::personality::CONCRETE_PERSONALITIES.contains(&resolved));
    }

    #[test]
    fn falls_back_to_random_resolution_for_unknown_key() {
        let file = PersonalityFile {
            current_personality: "not-a-real-key".to_string(),
            custom_settings: None,
            recent_personalities: vec![],
        };
        // Should not panic; resolves to some concrete personality.
        let resolved = resolve_personality(&file);
        assert!(crate::personality::CONCRETE_PERSONALITIES.contains(&resolved));
    }
}
