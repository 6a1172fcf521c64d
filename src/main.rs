//! Process entrypoint: wires every collaborator and runs the inbound
//! event dispatch loop alongside the background scheduler.

use celebrate::canvas::CanvasDashboard;
use celebrate::commands;
use celebrate::config::Config;
use celebrate::datastore::Datastore;
use celebrate::engagement;
use celebrate::imagegen::HttpImageGen;
use celebrate::llm::HttpCompleter;
use celebrate::messaging::slack::SlackClient;
use celebrate::messaging::traits::{ChatPlatform, InboundEvent, OutboundResponse};
use celebrate::observance::sources::build_sources;
use celebrate::profile::ProfileResolver;
use celebrate::rate_limit::RateLimiter;
use celebrate::scheduler::{self, SchedulerDeps};
use celebrate::thread_tracker::ThreadTracker;
use celebrate::{ChannelId, UserId};
use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tokio::time::Duration;

type Deps = SchedulerDeps<SlackClient, HttpCompleter, HttpImageGen>;

#[derive(Debug, Parser)]
#[command(name = "celebrate", about = "Workplace celebration assistant")]
struct Cli {
    /// Verbose (debug-level) logging.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(data_dir: &std::path::Path, debug: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = data_dir.join("logs");
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "celebrate.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("celebrate={default_level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let config = Arc::new(Config::load()?);
    let _log_guard = init_tracing(&config.data_dir, cli.debug);

    tracing::info!(data_dir = %config.data_dir.display(), "starting celebrate");

    let datastore = Arc::new(Datastore::from_config(&config));
    let slack = Arc::new(SlackClient::new(&config.slack_bot_token, &config.slack_app_token));
    let profiles = Arc::new(ProfileResolver::new(slack.clone(), datastore.clone()));
    let tracker = Arc::new(
        ThreadTracker::load_from(&datastore, config.engagement.thread_tracking_ttl_hours).await?,
    );
    let observance_sources = Arc::new(build_sources(&config));
    let completer = Arc::new(HttpCompleter::new(
        config.llm_endpoint.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
    ));
    let imagegen = Arc::new(HttpImageGen::new(
        config.image_endpoint.clone(),
        config.image_api_key.clone(),
        config.image_model.clone(),
    ));
    let mention_rate_limiter = Arc::new(RateLimiter::new(
        config.engagement.mention_window_secs,
        config.engagement.mention_max_requests,
    ));

    let ops_channel: ChannelId = config
        .ops_channel_id
        .clone()
        .unwrap_or_else(|| config.birthday_channel_id.clone())
        .into();
    let canvas = Arc::new(CanvasDashboard::new(
        ops_channel,
        config.clone(),
        datastore.clone(),
        slack.clone(),
        observance_sources.clone(),
    ));

    let deps: Deps = SchedulerDeps {
        config: config.clone(),
        datastore: datastore.clone(),
        profiles: profiles.clone(),
        tracker: tracker.clone(),
        chat: slack.clone(),
        completer: completer.clone(),
        imagegen: imagegen.clone(),
        observance_sources: observance_sources.clone(),
    };
    let scheduler_deps = deps.clone();
    tokio::spawn(async move {
        if let Err(error) = scheduler::run(scheduler_deps).await {
            tracing::error!(%error, "scheduler loop exited");
        }
    });

    tokio::spawn(run_canvas_ticker(canvas.clone()));
    tokio::spawn(run_tracker_sweep(tracker.clone(), datastore.clone()));

    let mut inbound = slack.start().await?;
    canvas.trigger("startup", true).await;

    loop {
        tokio::select! {
            event = inbound.next() => {
                let Some(event) = event else {
                    tracing::warn!("inbound event stream ended, shutting down");
                    break;
                };
                dispatch_event(event, &deps, &mention_rate_limiter, &canvas).await;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    if let Err(error) = tracker.persist(&datastore).await {
        tracing::warn!(%error, "failed to persist thread tracker on shutdown");
    }
    Ok(())
}

async fn dispatch_event(
    event: InboundEvent,
    deps: &Deps,
    mention_rate_limiter: &Arc<RateLimiter>,
    canvas: &Arc<CanvasDashboard>,
) {
    match event {
        InboundEvent::ChannelMessage { channel_id, ts: message_ts, thread_ts: Some(thread_ts), user_id, text } => {
            if !deps.config.toggles().thread_engagement {
                return;
            }
            let outcome = engagement::handle_thread_reply(
                deps.chat.as_ref(),
                &deps.tracker,
                deps.completer.as_ref(),
                &deps.config.engagement,
                &channel_id,
                &thread_ts,
                &message_ts,
                &user_id,
                &text,
            )
            .await;
            if outcome.reaction_added || outcome.thank_you_sent {
                if let Err(error) = deps.tracker.persist(&deps.datastore).await {
                    tracing::warn!(%error, "failed to persist thread tracker after engagement");
                }
            }
        }
        InboundEvent::ChannelMessage { .. } => {}
        InboundEvent::AppMention { channel_id, ts: message_ts, thread_ts, user_id, text } => {
            if !deps.config.toggles().mention_qa {
                return;
            }
            let today = chrono::Utc::now().date_naive();
            engagement::handle_mention(
                deps.chat.as_ref(),
                deps.completer.as_ref(),
                &deps.datastore,
                &deps.profiles,
                deps.observance_sources.as_slice(),
                mention_rate_limiter,
                &channel_id,
                thread_ts.as_ref(),
                &message_ts,
                &user_id,
                &text,
                today,
            )
            .await;
        }
        InboundEvent::DirectMessage { user_id, text } => {
            handle_direct_message(deps, canvas, &user_id, &text).await;
        }
        InboundEvent::SlashCommand { command, text, user_id, channel_id } => {
            handle_slash_command(deps, canvas, &command, &text, &user_id, &channel_id).await;
        }
        InboundEvent::MemberJoinedChannel { channel_id, user_id } => {
            tracing::debug!(channel = %channel_id, user = %user_id, "member joined tracked channel");
        }
    }
}

/// After a birthday mutation: maybe fire an immediate celebration for a
/// date that is today, publish the external backup if the
/// flag is set, and poke the dashboard.
async fn after_birthday_mutation(deps: &Deps, canvas: &Arc<CanvasDashboard>, user_id: &UserId, reason: &str) {
    match scheduler::maybe_fire_immediate(deps, user_id, chrono::Utc::now()).await {
        Ok(true) => tracing::info!(user = %user_id, "fired immediate celebration for today's new birthday"),
        Ok(false) => {}
        Err(error) => tracing::warn!(%error, "immediate celebration check failed"),
    }

    if deps.config.toggles().external_backup {
        let path = deps.datastore.storage_path("birthdays.json");
        match tokio::fs::metadata(&path).await {
            Ok(metadata) => {
                let mtime: chrono::DateTime<chrono::Utc> = metadata
                    .modified()
                    .map(Into::into)
                    .unwrap_or_else(|_| chrono::Utc::now());
                match tokio::fs::read(&path).await {
                    Ok(bytes) => {
                        if let Err(error) = canvas.upload_backup("birthdays.json", mtime, bytes).await {
                            tracing::warn!(%error, "external backup publish failed");
                        }
                    }
                    Err(error) => tracing::warn!(%error, "failed to read birthdays file for backup"),
                }
            }
            Err(error) => tracing::warn!(%error, "failed to stat birthdays file for backup"),
        }
    }

    canvas.trigger(reason.to_string(), false).await;
}

async fn handle_direct_message(deps: &Deps, canvas: &Arc<CanvasDashboard>, user_id: &UserId, text: &str) {
    use celebrate::messages::parse_date_with_fallback;
    use celebrate::time_model::ParsedDate;

    let nlp_date_parsing = deps.config.toggles().nlp_date_parsing;
    let parsed = parse_date_with_fallback(deps.completer.as_ref(), nlp_date_parsing, text).await;
    let mut mutated = false;
    let response = match parsed {
        ParsedDate::Invalid { .. } => OutboundResponse::Text(
            "Send me your birthday as DD/MM or DD/MM/YYYY, or use `/birthday help` for everything I can do."
                .to_string(),
        ),
        _ => match commands::handle_birthday(
            &deps.datastore,
            &deps.profiles,
            deps.completer.as_ref(),
            nlp_date_parsing,
            user_id,
            &format!("add {text}"),
        )
        .await
        {
            Ok(response) => {
                mutated = true;
                response
            }
            Err(error) => {
                tracing::warn!(%error, "failed to record birthday from direct message");
                OutboundResponse::Text("Sorry, something went wrong saving that.".to_string())
            }
        },
    };

    let dm_channel = match deps.chat.conversations_open(user_id).await {
        Ok(channel) => channel,
        Err(error) => {
            tracing::warn!(%error, "failed to open direct message channel");
            return;
        }
    };
    if let Err(error) = deps.chat.post_message(&dm_channel, response).await {
        tracing::warn!(%error, "failed to reply to direct message");
    }

    if mutated {
        after_birthday_mutation(deps, canvas, user_id, "birthday set via DM").await;
    }
}

async fn handle_slash_command(
    deps: &Deps,
    canvas: &Arc<CanvasDashboard>,
    command: &str,
    text: &str,
    user_id: &UserId,
    channel_id: &ChannelId,
) {
    let nlp_date_parsing = deps.config.toggles().nlp_date_parsing;
    let result = match command {
        "/birthday" => {
            commands::handle_birthday(
                &deps.datastore,
                &deps.profiles,
                deps.completer.as_ref(),
                nlp_date_parsing,
                user_id,
                text,
            )
            .await
        }
        "/special-day" => {
            commands::handle_special_day(
                &deps.datastore,
                &deps.profiles,
                deps.observance_sources.as_slice(),
                user_id,
                text,
            )
            .await
        }
        other => {
            tracing::warn!(command = other, "unknown slash command");
            return;
        }
    };

    match result {
        Ok(response) => {
            if let Err(error) = deps.chat.post_message(channel_id, response).await {
                tracing::warn!(%error, "failed to post slash command response");
            }
            let subcommand = text.trim().split_whitespace().next().unwrap_or("").to_lowercase();
            if command == "/birthday" && matches!(subcommand.as_str(), "add" | "pause" | "resume") {
                after_birthday_mutation(deps, canvas, user_id, &format!("{command} {subcommand} by {user_id}")).await;
            } else {
                canvas.trigger(format!("{command} by {user_id}"), false).await;
            }
        }
        Err(error) => {
            tracing::warn!(%error, command, "slash command handler failed");
            let _ = deps
                .chat
                .post_message(channel_id, OutboundResponse::Text(format!("Sorry, that didn't work: {error}")))
                .await;
        }
    }
}

/// Regenerates the canvas on the half-hour marks, on top of mutation-triggered updates fired from
/// [`handle_slash_command`].
async fn run_canvas_ticker(canvas: Arc<CanvasDashboard>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now();
        if now.timestamp() % 1800 < 60 {
            canvas.trigger("scheduled refresh", false).await;
        }
    }
}

/// Periodically evicts expired tracked threads and flushes the tracker
/// to disk even when no mutation happened to trigger an immediate save.
async fn run_tracker_sweep(tracker: Arc<ThreadTracker>, datastore: Arc<Datastore>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(15 * 60));
    loop {
        ticker.tick().await;
        let removed = tracker.cleanup_expired().await;
        if removed > 0 {
            tracing::info!(removed, "swept expired tracked threads");
        }
        if let Err(error) = tracker.persist(&datastore).await {
            tracing::warn!(%error, "failed to persist thread tracker during sweep");
        }
    }
}
