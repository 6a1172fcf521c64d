//! Live markdown dashboard in the operations channel.
//!
//! Canvas operations (`canvas_create`/`canvas_edit`/`canvas_delete`) are a
//! Slack-specific surface, not part of the generic [`ChatPlatform`] trait,
//! so this module is concrete over [`SlackClient`] rather than generic.
//! The debounce/coalescing shape reuses this crate's scheduler
//! `ExecutionGuard` idiom, adapted from "skip a concurrent tick" to
//! "coalesce a concurrent trigger's reason into the in-flight run".

use crate::config::Config;
use crate::datastore::Datastore;
use crate::messaging::slack::SlackClient;
use crate::messaging::traits::OutboundResponse;
use crate::observance::ObservanceSourceDyn;
use crate::ops::{self, SystemStatus};
use crate::{ChannelId, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};

const MIN_UPDATE_INTERVAL: Duration = Duration::from_secs(30);
const BACKUP_THREAD_TITLE: &str = ":file_folder: Backup uploads";

struct CanvasRuntime {
    pending_reason: Option<String>,
    in_flight: bool,
}

/// Owns the debounce/coalescing state and the Canvas API calls for the
/// dashboard document living in the ops channel.
pub struct CanvasDashboard {
    ops_channel: ChannelId,
    config: Arc<Config>,
    datastore: Arc<Datastore>,
    slack: Arc<SlackClient>,
    observance_sources: Arc<Vec<Arc<dyn ObservanceSourceDyn>>>,
    runtime: Mutex<CanvasRuntime>,
    last_updated_at: Mutex<Option<Instant>>,
}

impl CanvasDashboard {
    pub fn new(
        ops_channel: ChannelId,
        config: Arc<Config>,
        datastore: Arc<Datastore>,
        slack: Arc<SlackClient>,
        observance_sources: Arc<Vec<Arc<dyn ObservanceSourceDyn>>>,
    ) -> Self {
        Self {
            ops_channel,
            config,
            datastore,
            slack,
            observance_sources,
            runtime: Mutex::new(CanvasRuntime { pending_reason: None, in_flight: false }),
            last_updated_at: Mutex::new(None),
        }
    }

    /// Requests a rebuild. Concurrent calls while one is already pending or
    /// running are coalesced: the reason string is overwritten and no
    /// second task is spawned.
    pub async fn trigger(self: &Arc<Self>, reason: impl Into<String>, force: bool) {
        if !self.config.toggles().canvas_dashboard {
            return;
        }
        let reason = reason.into();
        let mut runtime = self.runtime.lock().await;
        if runtime.in_flight {
            runtime.pending_reason = Some(reason);
            return;
        }
        runtime.in_flight = true;
        runtime.pending_reason = Some(reason);
        drop(runtime);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain_updates(force).await });
    }

    async fn drain_updates(self: Arc<Self>, force: bool) {
        loop {
            let reason = {
                let mut runtime = self.runtime.lock().await;
                match runtime.pending_reason.take() {
                    Some(reason) => reason,
                    None => {
                        runtime.in_flight = false;
                        return;
                    }
                }
            };

            if !force {
                self.wait_for_debounce().await;
            }

            if let Err(error) = self.rebuild(&reason).await {
                tracing::warn!(%error, "canvas rebuild failed");
            }
        }
    }

    async fn wait_for_debounce(&self) {
        let last = *self.last_updated_at.lock().await;
        if let Some(last) = last {
            let elapsed = last.elapsed();
            if elapsed < MIN_UPDATE_INTERVAL {
                tokio::time::sleep(MIN_UPDATE_INTERVAL - elapsed).await;
            }
        }
    }

    /// Regenerates and replaces the canvas content. Recovers from a
    /// user-deleted canvas by clearing the stored ID and recreating.
    async fn rebuild(&self, reason: &str) -> Result<()> {
        let status = ops::gather_status(&self.config, &self.datastore, &self.observance_sources).await;
        let markdown = render_markdown(reason, &status);

        let mut state = self.datastore.load_canvas_state().await.unwrap_or_default();

        let canvas_id = match &state.canvas_id {
            Some(id) => match self.slack.canvas_edit(id, &markdown).await {
                Ok(()) => id.clone(),
                Err(error) if error.to_string().contains("canvas_not_found") => {
                    tracing::info!("canvas was deleted externally, recreating");
                    self.slack.canvas_create(&self.ops_channel, &markdown).await?
                }
                Err(error) => return Err(error),
            },
            None => self.slack.canvas_create(&self.ops_channel, &markdown).await?,
        };

        state.canvas_id = Some(canvas_id);
        state.canvas_updated_at = Some(Utc::now());
        self.datastore.save_canvas_state(&state).await?;
        *self.last_updated_at.lock().await = Some(Instant::now());

        tracing::info!(reason, "canvas dashboard rebuilt");
        Ok(())
    }

    /// Uploads a backup file into the pinned backup thread, deduping on
    /// `(filename, mtime)` so re-triggered backups of an unchanged file
    /// don't re-upload. Returns the permalink, reusing the
    /// cached one on a dedup hit.
    pub async fn upload_backup(
        &self,
        filename: &str,
        mtime: DateTime<Utc>,
        bytes: Vec<u8>,
    ) -> Result<Option<String>> {
        let cache_key = format!("{filename}:{}", mtime.timestamp());
        let mut state = self.datastore.load_canvas_state().await.unwrap_or_default();

        if state.backup_cache_key.as_deref() == Some(cache_key.as_str()) {
            return Ok(state.backup_permalink);
        }

        let thread_ts = match &state.backup_thread_ts {
            Some(ts) => ts.clone().into(),
            None => {
                let ts = self
                    .slack
                    .respond(&self.ops_channel, OutboundResponse::Text(BACKUP_THREAD_TITLE.to_string()))
                    .await?;
                state.backup_thread_ts = Some(ts.to_string());
                ts
            }
        };

        let uploaded = self.slack.upload_and_wait(bytes, filename.to_string()).await?;
        self.slack
            .respond(
                &self.ops_channel,
                OutboundResponse::ThreadReply {
                    thread_ts,
                    text: format!(
                        "Backup `{filename}` at {}{}",
                        mtime.format("%Y-%m-%d %H:%M UTC"),
                        uploaded
                            .permalink
                            .as_deref()
                            .map(|p| format!(" -- <{p}|view>"))
                            .unwrap_or_default()
                    ),
                },
            )
            .await?;

        state.backup_cache_key = Some(cache_key);
        state.backup_permalink = uploaded.permalink.clone();
        self.datastore.save_canvas_state(&state).await?;

        Ok(uploaded.permalink)
    }
}

fn render_markdown(reason: &str, status: &SystemStatus) -> String {
    let mut sections = vec![
        "# Celebrate Dashboard".to_string(),
        format!(
            "_Last rebuilt {} -- triggered by: {reason}_",
            status.gathered_at.format("%Y-%m-%d %H:%M UTC")
        ),
        "## Data".to_string(),
        format!("- Birthdays on file: **{}**", status.birthday_count),
        format!("- Admins: **{}**", status.admin_count),
    ];

    sections.push("## Scheduler".to_string());
    sections.push(format!(
        "- Status: **{}**",
        if status.scheduler.stale { "STALE" } else { "healthy" }
    ));
    sections.push(format!(
        "- Executions: {} total, {} failed",
        status.scheduler.total_executions, status.scheduler.failed_executions
    ));
    if let Some(error) = &status.scheduler.last_error {
        sections.push(format!("- Last error: `{error}`"));
    }

    sections.push("## Observance sources".to_string());
    for source in &status.observance_sources {
        sections.push(format!(
            "- **{}**: {} observances ({})",
            source.source,
            source.observance_count,
            if source.cache_fresh { "fresh" } else { "stale" }
        ));
    }

    sections.push("## Feature toggles".to_string());
    sections.push(format!(
        "- Images: {} | Timezone-aware: {} | Special days: {} | Thread engagement: {}",
        on_off(status.toggles.image_generation),
        on_off(status.toggles.timezone_aware_celebrations),
        on_off(status.toggles.special_days),
        on_off(status.toggles.thread_engagement),
    ));

    sections.join("\n\n")
}

fn on_off(value: bool) -> &'static str {
    if value { "on" } else { "off" }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_status() -> SystemStatus {
        SystemStatus {
            directories: vec![],
            env_vars_set: vec![],
            birthday_count: 2,
            admin_count: 1,
            scheduler: crate::ops::SchedulerHealth {
                started_at: None,
                last_heartbeat: None,
                total_executions: 1,
                failed_executions: 0,
                last_success_at: None,
                last_error: None,
                stale: false,
            },
            observance_sources: vec![],
            toggles: crate::config::FeatureToggles::default(),
            log_file_bytes: 0,
            gathered_at: Utc::now(),
        }
    }

    #[test]
    fn markdown_embeds_the_trigger_reason() {
        let markdown = render_markdown("birthday added", &sample_status());
        assert!(markdown.contains("birthday added"));
        assert!(markdown.contains("Birthdays on file"));
    }
}
