//! Message generator: personality-keyed prompt composition,
//! LLM completion, and post-processing.

use crate::llm::{ChatMessage, Completer};
use crate::observance::SpecialDay;
use crate::personality::Personality;
use crate::time_model::{date_in_words, star_sign, ParsedDate};
use crate::{MonthDay, UserId};
use chrono::Datelike;
use serde::Deserialize;

/// Use-case-keyed token/temperature table.
#[derive(Debug, Clone, Copy)]
pub enum UseCase {
    BirthdaySingle,
    BirthdayConsolidated,
    SpecialDayTeaser,
    SpecialDayDetail,
    MentionAnswer,
    ImageCaption,
    ThreadThankYou,
}

impl UseCase {
    pub fn max_tokens(&self) -> u32 {
        match self {
            UseCase::BirthdaySingle => 400,
            UseCase::BirthdayConsolidated => 600,
            UseCase::SpecialDayTeaser => 220,
            UseCase::SpecialDayDetail => 700,
            UseCase::MentionAnswer => 350,
            UseCase::ImageCaption => 60,
            UseCase::ThreadThankYou => 50,
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            UseCase::BirthdaySingle | UseCase::BirthdayConsolidated => 0.9,
            UseCase::SpecialDayTeaser | UseCase::SpecialDayDetail => 0.7,
            UseCase::MentionAnswer => 0.5,
            UseCase::ImageCaption => 0.8,
            UseCase::ThreadThankYou => 0.7,
        }
    }

    pub fn reasoning_effort(&self) -> Option<&'static str> {
        match self {
            UseCase::SpecialDayDetail | UseCase::MentionAnswer => Some("medium"),
            _ => None,
        }
    }
}

/// A person context the message generator renders into a prompt.
#[derive(Debug, Clone)]
pub struct CelebrantContext {
    pub user_id: UserId,
    pub mention: String,
    pub name: String,
    pub birth_month_day: MonthDay,
    pub age: Option<i32>,
}

/// The base system message every personality extends.
const BASE_SYSTEM_TEMPLATE: &str = "You are a workplace celebration assistant posting a birthday message in a shared team channel. Be warm, concise, and workplace-appropriate. Never invent personal details about the celebrant beyond what is given.";

fn build_system_message(personality: Personality, historical_fact: Option<&str>) -> String {
    let data = personality.data();
    let mut system = format!("{BASE_SYSTEM_TEMPLATE}\n\n{}\n\n{}", data.style, data.format_instruction);
    if !data.template_extension.is_empty() {
        system.push_str("\n\n");
        system.push_str(data.template_extension);
    }
    if let Some(fact) = historical_fact {
        system.push_str(&format!(
            "\n\nYou MUST include at least one specific historical fact (with a year and a name) from the following in your message: {fact}"
        ));
    }
    system
}

fn build_user_message(people: &[CelebrantContext]) -> String {
    let mentions: Vec<String> = people.iter().map(|p| p.mention.clone()).collect();
    let mut lines = vec![format!(
        "Write a birthday message for: {}.",
        mentions.join(", ")
    )];
    for person in people {
        let mut details = format!(
            "{} was born on {} ({}).",
            person.mention,
            date_in_words(person.birth_month_day),
            star_sign(person.birth_month_day)
        );
        if let Some(age) = person.age {
            details.push_str(&format!(" They are turning {age}."));
        }
        lines.push(details);
    }
    lines.push(
        "Every mentioned person's Slack mention MUST appear at least once in the message. \
        Use Slack markup only: *bold*, _italic_, and <url|text> links -- never **bold**, \
        __italic__, or Markdown [text](url) links. Do not include a signature line."
            .to_string(),
    );
    lines.join("\n")
}

/// Normalizes common LLM markdown leakage into Slack-flavored markup.
pub fn normalize_chat_markup(text: &str) -> String {
    let bold_re = regex_cache::bold();
    let italic_re = regex_cache::italic();
    let link_re = regex_cache::markdown_link();
    let html_re = regex_cache::html_tag();

    let text = bold_re.replace_all(text, "*$1*");
    let text = italic_re.replace_all(&text, "_$1_");
    let text = link_re.replace_all(&text, "<$2|$1>");
    html_re.replace_all(&text, "").into_owned()
}

mod regex_cache {
    use regex::Regex;
    use std::sync::OnceLock;

    pub fn bold() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\*\*([^*]+)\*\*").unwrap())
    }

    pub fn italic() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"__([^_]+)__").unwrap())
    }

    pub fn markdown_link() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap())
    }

    pub fn html_tag() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"</?[a-zA-Z][^>]*>").unwrap())
    }
}

/// Semantic sanity gate for a rendered message: every surviving
/// person's Slack mention must appear in the text, and the text
/// must not contain obvious placeholder leakage (unresolved `{...}`
/// template slots). Returns a non-zero ratio whenever even one mention
/// is missing, which
/// with [`REGENERATION_THRESHOLD`] means "regenerate unless every
/// surviving person is mentioned."
pub fn invalid_ratio(text: &str, people: &[CelebrantContext]) -> f64 {
    if people.is_empty() {
        return 0.0;
    }
    let missing = people.iter().filter(|p| !text.contains(p.mention.as_str())).count();
    let has_placeholder_leakage = text.contains('{') && text.contains('}');
    if has_placeholder_leakage || missing > 0 {
        1.0
    } else {
        0.0
    }
}

/// Above this ratio, the pipeline forces one regeneration.
pub const REGENERATION_THRESHOLD: f64 = 0.3;

fn fallback_template(mentions: &[String]) -> String {
    let joined = mentions.join(", ");
    format!(
        ":birthday: HAPPY BIRTHDAY {joined}!!! :tada:\n\n<!here> We've got a birthday to celebrate today!\n\n\
        Wishing you a day filled with joy, laughter, and way too much cake. :cake:\n\n\
        Drop your birthday wishes below! :point_down:"
    )
}

/// Generates a birthday message for one or more people sharing a
/// celebration day, retrying up to 2 times before falling back to a
/// personality-agnostic template.
pub async fn generate_birthday_message(
    completer: &impl Completer,
    personality: Personality,
    people: &[CelebrantContext],
    historical_fact: Option<&str>,
) -> String {
    let use_case = if people.len() > 1 {
        UseCase::BirthdayConsolidated
    } else {
        UseCase::BirthdaySingle
    };
    let system = build_system_message(personality, historical_fact);
    let user = build_user_message(people);

    for attempt in 0..3 {
        let messages = vec![ChatMessage::System(system.clone()), ChatMessage::User(user.clone())];
        match completer
            .complete(messages, use_case.max_tokens(), use_case.temperature(), use_case.reasoning_effort())
            .await
        {
            Ok(outcome) => {
                let normalized = normalize_chat_markup(&outcome.text);
                if invalid_ratio(&normalized, people) <= REGENERATION_THRESHOLD || attempt == 2 {
                    return normalized;
                }
                tracing::warn!(attempt, "regenerating birthday message: failed sanity check");
            }
            Err(error) => {
                tracing::warn!(attempt, %error, "birthday message completion failed");
            }
        }
    }

    let mentions: Vec<String> = people.iter().map(|p| p.mention.clone()).collect();
    fallback_template(&mentions)
}

fn build_special_day_user_message(days: &[SpecialDay], detail: bool) -> String {
    let mut lines = if days.len() > 1 {
        vec!["Write a single digest announcement covering these observances:".to_string()]
    } else {
        vec!["Write an announcement for this observance:".to_string()]
    };
    for day in days {
        lines.push(format!(
            "- {} ({}): {}",
            day.name,
            day.category.label(),
            day.description
        ));
    }
    if detail {
        lines.push("Give each observance a short paragraph.".to_string());
    } else {
        lines.push("Keep it to one or two lively sentences per observance.".to_string());
    }
    lines.push(
        "Use Slack markup only: *bold*, _italic_, and <url|text> links -- never **bold**, \
        __italic__, or Markdown [text](url) links. Do not include a signature line."
            .to_string(),
    );
    lines.join("\n")
}

fn special_day_fallback_template(days: &[SpecialDay]) -> String {
    let mut lines = vec![":calendar: *Today's special day%s*".replace(
        "%s",
        if days.len() > 1 { "s" } else { "" },
    )];
    for day in days {
        let emoji = day.emoji.as_deref().unwrap_or(":sparkles:");
        lines.push(format!("{emoji} *{}* -- {}", day.name, day.description));
    }
    lines.join("\n")
}

/// Generates a special-day announcement for one or more observances sharing
/// a release (daily single day, or a weekly digest), with the same
/// retry-then-fallback shape as [`generate_birthday_message`].
pub async fn generate_special_day_message(
    completer: &impl Completer,
    personality: Personality,
    days: &[SpecialDay],
    detail: bool,
) -> String {
    let use_case = if detail { UseCase::SpecialDayDetail } else { UseCase::SpecialDayTeaser };
    let system = build_system_message(personality, None);
    let user = build_special_day_user_message(days, detail);

    for attempt in 0..3 {
        let messages = vec![ChatMessage::System(system.clone()), ChatMessage::User(user.clone())];
        match completer
            .complete(messages, use_case.max_tokens(), use_case.temperature(), use_case.reasoning_effort())
            .await
        {
            Ok(outcome) => {
                let normalized = normalize_chat_markup(&outcome.text);
                let has_placeholder_leakage = normalized.contains('{') && normalized.contains('}');
                if !has_placeholder_leakage || attempt == 2 {
                    return normalized;
                }
                tracing::warn!(attempt, "regenerating special-day message: placeholder leakage detected");
            }
            Err(error) => {
                tracing::warn!(attempt, %error, "special-day message completion failed");
            }
        }
    }

    special_day_fallback_template(days)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LlmDateJson {
    Exact { day: u8, month: u8, year: Option<i32> },
    Ambiguous { ambiguous: bool, options: Vec<(u8, u8)> },
    Error { error: String },
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end >= start).then(|| &text[start..=end])
}

/// Resolves free text to a date, trying the regex-based strategies in
/// [`crate::time_model::parse_date_str`] first and falling back to
/// [`parse_date_via_llm`] only when those are inconclusive and NLP date
/// parsing is enabled.
pub async fn parse_date_with_fallback(completer: &impl Completer, nlp_enabled: bool, input: &str) -> ParsedDate {
    let parsed = crate::time_model::parse_date_str(input);
    if nlp_enabled && matches!(parsed, ParsedDate::Invalid { .. }) {
        parse_date_via_llm(completer, input).await
    } else {
        parsed
    }
}

/// Date-parsing strategy of last resort: one LLM call returning a typed
/// `{day,month,year|null} | {ambiguous,options[]} | {error}` object,
/// invoked by callers only after the regex-based strategies in
/// [`crate::time_model::parse_date_str`] return [`ParsedDate::Invalid`].
pub async fn parse_date_via_llm(completer: &impl Completer, input: &str) -> ParsedDate {
    let system = "You convert a free-text description of a calendar date into strict JSON and nothing else. \
        Respond with exactly one JSON object in one of these three shapes: \
        {\"day\": <1-31>, \"month\": <1-12>, \"year\": <integer or null>} if you can determine one exact date; \
        {\"ambiguous\": true, \"options\": [[day, month], ...]} if more than one reading is plausible; \
        or {\"error\": \"<reason>\"} if no date can be extracted. No prose, no markdown.";
    let messages = vec![
        ChatMessage::System(system.to_string()),
        ChatMessage::User(format!("Parse this date: {input}")),
    ];

    match completer.complete(messages, 80, 0.0, None).await {
        Ok(outcome) => parse_llm_date_json(&outcome.text),
        Err(error) => {
            tracing::warn!(%error, "llm date-parsing fallback failed");
            ParsedDate::Invalid { reason: format!("llm date parsing failed: {error}") }
        }
    }
}

fn parse_llm_date_json(text: &str) -> ParsedDate {
    let Some(json) = extract_json_object(text) else {
        return ParsedDate::Invalid { reason: "llm response contained no JSON object".into() };
    };
    match serde_json::from_str::<LlmDateJson>(json) {
        Ok(LlmDateJson::Exact { day, month, year }) => {
            if MonthDay::new(month, day).is_none() {
                return ParsedDate::Invalid { reason: "llm returned an invalid day/month".into() };
            }
            if let Some(y) = year {
                let current_year = chrono::Utc::now().year();
                if !(1900..=current_year).contains(&y) {
                    return ParsedDate::Invalid { reason: format!("llm returned year {y} out of range") };
                }
            }
            ParsedDate::Exact { month, day, year }
        }
        Ok(LlmDateJson::Ambiguous { options, .. }) => {
            let valid: Vec<(u8, u8)> = options.into_iter().filter(|&(d, m)| MonthDay::new(m, d).is_some()).collect();
            if valid.is_empty() {
                ParsedDate::Invalid { reason: "llm returned no valid ambiguous options".into() }
            } else {
                ParsedDate::Ambiguous { options: valid }
            }
        }
        Ok(LlmDateJson::Error { error }) => ParsedDate::Invalid { reason: error },
        Err(e) => ParsedDate::Invalid { reason: format!("malformed llm date JSON: {e}") },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(mention: &str) -> CelebrantContext {
        CelebrantContext {
            user_id: mention.into(),
            mention: mention.to_string(),
            name: mention.to_string(),
            birth_month_day: MonthDay::new(6, 15).unwrap(),
            age: Some(30),
        }
    }

    #[test]
    fn normalizes_markdown_to_slack_markup() {
        let input = "**bold** and __italic__ with [a link](https://example.com) <b>html</b>";
        let normalized = normalize_chat_markup(input);
        assert_eq!(normalized, "*bold* and _italic_ with <https://example.com|a link> html");
    }

    #[test]
    fn invalid_ratio_counts_missing_mentions() {
        let people = vec![person("<@U1>"), person("<@U2>")];
        let text = "Happy birthday <@U1>!";
        assert_eq!(invalid_ratio(text, &people), 1.0);
    }

    #[test]
    fn invalid_ratio_zero_when_all_mentioned() {
        let people = vec![person("<@U1>"), person("<@U2>")];
        let text = "Happy birthday <@U1> and <@U2>!";
        assert_eq!(invalid_ratio(text, &people), 0.0);
    }

    #[test]
    fn invalid_ratio_flags_placeholder_leakage() {
        let people = vec![person("<@U1>")];
        let text = "Happy birthday <@U1>! Born in {birth_year}.";
        assert_eq!(invalid_ratio(text, &people), 1.0);
    }

    #[test]
    fn fallback_template_mentions_every_person() {
        let mentions = vec!["<@U1>".to_string(), "<@U2>".to_string()];
        let rendered = fallback_template(&mentions);
        assert!(rendered.contains("<@U1>"));
        assert!(rendered.contains("<@U2>"));
    }

    #[test]
    fn parses_exact_date_from_llm_json() {
        let parsed = parse_llm_date_json(r#"{"day": 4, "month": 7, "year": null}"#);
        assert_eq!(parsed, ParsedDate::Exact { month: 7, day: 4, year: None });
    }

    #[test]
    fn parses_exact_date_wrapped_in_prose() {
        let parsed = parse_llm_date_json("Sure, here you go:\n```json\n{\"day\": 25, \"month\": 12, \"year\": 1990}\n```");
        assert_eq!(parsed, ParsedDate::Exact { month: 12, day: 25, year: Some(1990) });
    }

    #[test]
    fn parses_ambiguous_date_from_llm_json() {
        let parsed = parse_llm_date_json(r#"{"ambiguous": true, "options": [[3, 4], [4, 3]]}"#);
        assert_eq!(parsed, ParsedDate::Ambiguous { options: vec![(3, 4), (4, 3)] });
    }

    #[test]
    fn parses_error_from_llm_json() {
        let parsed = parse_llm_date_json(r#"{"error": "no date mentioned"}"#);
        assert_eq!(parsed, ParsedDate::Invalid { reason: "no date mentioned".to_string() });
    }

    #[test]
    fn rejects_llm_date_with_invalid_day_month_combo() {
        let parsed = parse_llm_date_json(r#"{"day": 31, "month": 4, "year": null}"#);
        assert!(matches!(parsed, ParsedDate::Invalid { .. }));
    }

    fn special_day(name: &str) -> SpecialDay {
        SpecialDay {
            date: MonthDay::new(4, 7).unwrap(),
            name: name.to_string(),
            category: crate::observance::Category::GlobalHealth,
            description: "a day of awareness".to_string(),
            source: crate::observance::Source::Who,
            url: None,
            emoji: Some(":globe_with_meridians:".to_string()),
            enabled: true,
        }
    }

    #[test]
    fn special_day_fallback_mentions_every_observance() {
        let days = vec![special_day("World Health Day"), special_day("World Poetry Day")];
        let rendered = special_day_fallback_template(&days);
        assert!(rendered.contains("World Health Day"));
        assert!(rendered.contains("World Poetry Day"));
    }

    #[test]
    fn special_day_user_message_lists_every_observance() {
        let days = vec![special_day("World Health Day")];
        let message = build_special_day_user_message(&days, false);
        assert!(message.contains("World Health Day"));
        assert!(message.contains("a day of awareness"));
    }
}
