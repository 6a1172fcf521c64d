//! Slash command dispatch.
//!
//! The text-splitting glue here is deliberately thin. What this
//! module owns is the subcommand *behavior*: reading/writing the
//! datastore, checking [`PermissionsFile`], and composing the rich
//! blocks response. Every handler returns an [`OutboundResponse`]; the
//! caller is responsible for posting it to the right channel.

use crate::datastore::{BirthdayRecord, Datastore};
use crate::llm::Completer;
use crate::messaging::traits::{Block, ChatPlatform, OutboundResponse};
use crate::observance::aggregator::aggregate_range;
use crate::observance::ObservanceSourceDyn;
use crate::profile::ProfileResolver;
use crate::time_model::{self, ParsedDate};
use crate::{MonthDay, Result, UserId};
use chrono::{Datelike, Utc};
use std::sync::Arc;

fn help_response(command: &str, subcommands: &[(&str, &str)]) -> OutboundResponse {
    let mut blocks = vec![Block::Header(format!("{command} help")), Block::Divider];
    for (name, description) in subcommands {
        blocks.push(Block::Section(format!("*{name}* -- {description}")));
    }
    OutboundResponse::RichMessage {
        text: format!("{command} help"),
        blocks,
    }
}

fn error_response(text: impl Into<String>) -> OutboundResponse {
    let text = text.into();
    OutboundResponse::RichMessage {
        text: text.clone(),
        blocks: vec![Block::Section(text)],
    }
}

const BIRTHDAY_SUBCOMMANDS: &[(&str, &str)] = &[
    ("add <DD/MM[/YYYY]>", "set or update your birthday"),
    ("check @user", "show a user's on-file birthday"),
    ("list", "list everyone with a birthday on file"),
    ("export", "export the birthdays file as JSON"),
    ("pause", "stop celebrating your birthday (kept on file)"),
    ("resume", "resume celebrating your birthday"),
    ("help", "show this message"),
];

const SPECIAL_DAY_SUBCOMMANDS: &[(&str, &str)] = &[
    ("today", "special days observed today"),
    ("week", "special days observed this week"),
    ("month", "special days observed this month"),
    ("list [category]", "all tracked special days, optionally filtered"),
    ("stats", "per-source cache freshness and counts"),
    ("export [source]", "export the cache for a source as JSON"),
    ("help", "show this message"),
];

/// Permission gate: admin-only subcommands require [`ProfileResolver::is_admin`].
async fn require_admin_if_gated(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    command_key: &str,
    author: &UserId,
) -> Result<Option<OutboundResponse>> {
    let permissions = datastore.load_permissions().await?;
    if !permissions.is_admin_only(command_key) {
        return Ok(None);
    }
    if profiles.is_admin(author).await? {
        return Ok(None);
    }
    tracing::info!(command_key, author = %author, "permission denied for admin-only subcommand");
    Ok(Some(error_response(
        "Only admins can run this subcommand.",
    )))
}

/// Handles `/birthday [add|check|list|export|pause|resume|help]`.
pub async fn handle_birthday(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    completer: &impl Completer,
    nlp_date_parsing: bool,
    author: &UserId,
    text: &str,
) -> Result<OutboundResponse> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match sub.as_str() {
        "add" => birthday_add(datastore, completer, nlp_date_parsing, author, rest).await,
        "check" => birthday_check(datastore, profiles, rest).await,
        "list" => birthday_list(datastore, profiles).await,
        "export" => birthday_export(datastore, profiles, author).await,
        "pause" => birthday_set_active(datastore, author, false).await,
        "resume" => birthday_set_active(datastore, author, true).await,
        "" | "help" => Ok(help_response("/birthday", BIRTHDAY_SUBCOMMANDS)),
        other => Ok(error_response(format!(
            "Unknown /birthday subcommand `{other}`. Try `/birthday help`."
        ))),
    }
}

async fn birthday_add(
    datastore: &Datastore,
    completer: &impl Completer,
    nlp_date_parsing: bool,
    author: &UserId,
    date_text: &str,
) -> Result<OutboundResponse> {
    if date_text.is_empty() {
        return Ok(error_response("Usage: `/birthday add DD/MM` or `/birthday add DD/MM/YYYY`."));
    }
    let parsed = crate::messages::parse_date_with_fallback(completer, nlp_date_parsing, date_text).await;
    let (month, day, year) = match parsed {
        ParsedDate::Exact { month, day, year } => (month, day, year),
        ParsedDate::Ambiguous { .. } => {
            return Ok(error_response(
                "That date is ambiguous -- please use `DD/MM` or `DD/MM/YYYY`.",
            ))
        }
        ParsedDate::Invalid { reason } => {
            return Ok(error_response(format!("Couldn't parse that date: {reason}")))
        }
    };

    let mut birthdays = datastore.load_birthdays().await?;
    let now = Utc::now();
    let existing = birthdays.0.get(author.as_ref());
    let preferences = existing.map(|r| r.preferences.clone()).unwrap_or_default();
    let created_at = existing.map(|r| r.created_at).unwrap_or(now);

    birthdays.0.insert(
        author.to_string(),
        BirthdayRecord {
            month,
            day,
            year,
            preferences,
            created_at,
            updated_at: now,
        },
    );
    datastore.save_birthdays(&birthdays).await?;

    let rendered = time_model::format_date(month, day, year);
    Ok(error_response(format!("Got it -- your birthday is now set to {rendered}.")))
}

async fn birthday_check(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    target_mention: &str,
) -> Result<OutboundResponse> {
    let Some(user_id) = extract_mention(target_mention) else {
        return Ok(error_response("Usage: `/birthday check @user`."));
    };
    let birthdays = datastore.load_birthdays().await?;
    let Some(record) = birthdays.0.get(user_id.as_ref()) else {
        return Ok(error_response("No birthday on file for that user."));
    };
    let name = profiles.get_username(&user_id).await.unwrap_or_else(|_| user_id.to_string());
    let rendered = time_model::format_date(
        record.month,
        record.day,
        record.year.filter(|_| record.preferences.show_age),
    );
    Ok(error_response(format!("{name}'s birthday is on file: {rendered}.")))
}

async fn birthday_list(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
) -> Result<OutboundResponse> {
    let birthdays = datastore.load_birthdays().await?;
    if birthdays.0.is_empty() {
        return Ok(error_response("No birthdays on file yet."));
    }
    let mut entries: Vec<(String, &BirthdayRecord)> = Vec::with_capacity(birthdays.0.len());
    for (user_id, record) in &birthdays.0 {
        let user_id: UserId = Arc::from(user_id.as_str());
        let name = profiles.get_username(&user_id).await.unwrap_or_else(|_| user_id.to_string());
        entries.push((name, record));
    }
    entries.sort_by(|a, b| a.1.month.cmp(&b.1.month).then(a.1.day.cmp(&b.1.day)).then(a.0.cmp(&b.0)));

    let mut blocks = vec![Block::Header("Birthdays on file".to_string())];
    for (name, record) in &entries {
        let status = if record.preferences.active { "" } else { " (paused)" };
        blocks.push(Block::Section(format!(
            "{name}: {}{status}",
            time_model::format_date(record.month, record.day, None)
        )));
    }
    Ok(OutboundResponse::RichMessage {
        text: format!("{} birthdays on file", entries.len()),
        blocks,
    })
}

async fn birthday_export(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    author: &UserId,
) -> Result<OutboundResponse> {
    if let Some(denied) = require_admin_if_gated(datastore, profiles, "export", author).await? {
        return Ok(denied);
    }
    let birthdays = datastore.load_birthdays().await?;
    let json = serde_json::to_string_pretty(&birthdays).unwrap_or_else(|_| "{}".to_string());
    Ok(OutboundResponse::UploadFile {
        bytes: json.into_bytes(),
        filename: format!("birthdays_{}.json", Utc::now().format("%Y%m%dT%H%M%S")),
        title: "Birthdays export".to_string(),
        channel: None,
    })
}

async fn birthday_set_active(datastore: &Datastore, author: &UserId, active: bool) -> Result<OutboundResponse> {
    let mut birthdays = datastore.load_birthdays().await?;
    let Some(record) = birthdays.0.get_mut(author.as_ref()) else {
        return Ok(error_response("You don't have a birthday on file yet -- try `/birthday add DD/MM` first."));
    };
    record.preferences.active = active;
    record.updated_at = Utc::now();
    datastore.save_birthdays(&birthdays).await?;
    Ok(error_response(if active {
        "Your birthday celebrations are resumed."
    } else {
        "Your birthday celebrations are paused. Your date stays on file."
    }))
}

fn extract_mention(text: &str) -> Option<UserId> {
    let token = text.split_whitespace().next()?;
    let inner = token.strip_prefix("<@")?.trim_end_matches('>');
    let id = inner.split('|').next().unwrap_or(inner);
    if id.is_empty() {
        None
    } else {
        Some(Arc::from(id))
    }
}

/// Handles `/special-day [today|week|month|list|stats|export|help]`.
pub async fn handle_special_day(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    author: &UserId,
    text: &str,
) -> Result<OutboundResponse> {
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let sub = parts.next().unwrap_or("").to_lowercase();
    let rest = parts.next().unwrap_or("").trim();

    match sub.as_str() {
        "today" => special_day_range(datastore, observance_sources, 0).await,
        "week" => special_day_range(datastore, observance_sources, 6).await,
        "month" => special_day_range(datastore, observance_sources, 29).await,
        "list" => special_day_list(datastore, observance_sources, rest).await,
        "stats" => special_day_stats(observance_sources).await,
        "export" => special_day_export(datastore, profiles, author, observance_sources, rest).await,
        "" | "help" => Ok(help_response("/special-day", SPECIAL_DAY_SUBCOMMANDS)),
        other => Ok(error_response(format!(
            "Unknown /special-day subcommand `{other}`. Try `/special-day help`."
        ))),
    }
}

async fn special_day_range(
    datastore: &Datastore,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    days_ahead: i64,
) -> Result<OutboundResponse> {
    let config = datastore.load_special_days_config().await?;
    let today = Utc::now().date_naive();
    let dates: Vec<MonthDay> = (0..=days_ahead)
        .filter_map(|offset| {
            let date = today + chrono::Duration::days(offset);
            MonthDay::new(date.month() as u8, date.day() as u8)
        })
        .collect();
    let days = aggregate_range(observance_sources, &dates, &config.category_enabled).await;
    Ok(render_special_days(&days))
}

async fn special_day_list(
    datastore: &Datastore,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    category_filter: &str,
) -> Result<OutboundResponse> {
    let config = datastore.load_special_days_config().await?;
    let all_days: Vec<MonthDay> = (1..=12u8)
        .flat_map(|month| (1..=31u8).filter_map(move |day| MonthDay::new(month, day)))
        .collect();
    let mut days = aggregate_range(observance_sources, &all_days, &config.category_enabled).await;
    if !category_filter.is_empty() {
        let needle = category_filter.to_lowercase();
        days.retain(|d| d.category.label().to_lowercase().contains(&needle));
    }
    Ok(render_special_days(&days))
}

fn render_special_days(days: &[crate::observance::SpecialDay]) -> OutboundResponse {
    if days.is_empty() {
        return error_response("No special days found for that range.");
    }
    let mut blocks = vec![Block::Header("Special days".to_string())];
    for day in days.iter().take(50) {
        blocks.push(Block::Section(format!(
            "{} -- *{}* ({})",
            day.date,
            day.name,
            day.category.label()
        )));
    }
    if days.len() > 50 {
        blocks.push(Block::Context(format!("...and {} more", days.len() - 50)));
    }
    OutboundResponse::RichMessage {
        text: format!("{} special days", days.len()),
        blocks,
    }
}

async fn special_day_stats(
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
) -> Result<OutboundResponse> {
    let mut blocks = vec![Block::Header("Special-day source stats".to_string())];
    for source in observance_sources {
        let status = match source.status().await {
            Ok(status) => status,
            Err(error) => {
                tracing::warn!(source = ?source.name(), %error, "failed to read observance source status");
                continue;
            }
        };
        blocks.push(Block::Fields(vec![
            ("Source".to_string(), format!("{:?}", source.name())),
            ("Entries".to_string(), status.observance_count.to_string()),
            ("Fresh".to_string(), status.cache_fresh.to_string()),
        ]));
    }
    Ok(OutboundResponse::RichMessage {
        text: "special-day source stats".to_string(),
        blocks,
    })
}

async fn special_day_export(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    author: &UserId,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    source_filter: &str,
) -> Result<OutboundResponse> {
    if let Some(denied) = require_admin_if_gated(datastore, profiles, "export", author).await? {
        return Ok(denied);
    }
    let config = datastore.load_special_days_config().await?;
    let all_days: Vec<MonthDay> = (1..=12u8)
        .flat_map(|month| (1..=31u8).filter_map(move |day| MonthDay::new(month, day)))
        .collect();
    let mut days = aggregate_range(observance_sources, &all_days, &config.category_enabled).await;
    if !source_filter.is_empty() {
        let needle = source_filter.to_lowercase();
        days.retain(|d| format!("{:?}", d.source).to_lowercase() == needle);
    }
    let json = serde_json::to_string_pretty(&days).unwrap_or_else(|_| "[]".to_string());
    Ok(OutboundResponse::UploadFile {
        bytes: json.into_bytes(),
        filename: format!("special_days_{}.json", Utc::now().format("%Y%m%dT%H%M%S")),
        title: "Special days export".to_string(),
        channel: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_user_id_from_mention_token() {
        assert_eq!(extract_mention("<@U123ABC>"), Some(UserId::from("U123ABC")));
        assert_eq!(extract_mention("<@U123ABC|alex> trailing"), Some(UserId::from("U123ABC")));
        assert_eq!(extract_mention("not a mention"), None);
        assert_eq!(extract_mention(""), None);
    }

    #[test]
    fn help_response_lists_every_subcommand() {
        let response = help_response("/birthday", BIRTHDAY_SUBCOMMANDS);
        let OutboundResponse::RichMessage { blocks, .. } = response else {
            panic!("expected rich blocks help");
        };
        let sections = blocks
            .iter()
            .filter(|b| matches!(b, Block::Section(_)))
            .count();
        assert_eq!(sections, BIRTHDAY_SUBCOMMANDS.len());
        assert!(matches!(blocks[0], Block::Header(_)));
    }

    #[test]
    fn permissions_default_to_permissive_for_unlisted_commands() {
        let permissions = crate::datastore::PermissionsFile::default();
        assert!(!permissions.is_admin_only("export"));

        let mut gated = crate::datastore::PermissionsFile::default();
        gated.commands.insert("export".to_string(), true);
        assert!(gated.is_admin_only("export"));
        assert!(!gated.is_admin_only("list"));
    }
}
