//! Thread reply engagement and @-mention Q&A: a reaction
//! keyword table with already-reacted tolerance and a capped thank-you,
//! plus mention stripping, question classification, typed context
//! assembly, and a category-specific fallback for unanswerable
//! questions.

use crate::config::EngagementConfig;
use crate::datastore::Datastore;
use crate::llm::{ChatMessage, Completer};
use crate::messages::UseCase;
use crate::messaging::traits::{ChatPlatform, OutboundResponse};
use crate::observance::{aggregate, ObservanceSourceDyn, SpecialDay};
use crate::personality::Personality;
use crate::profile::ProfileResolver;
use crate::rate_limit::RateLimiter;
use crate::thread_tracker::{ThreadTracker, TrackedThread};
use crate::{ChannelId, MonthDay, ThreadTs, UserId};
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

const UPCOMING_BIRTHDAY_WINDOW_DAYS: i64 = 7;

const BOT_CAPABILITIES: &[&str] = &[
    "Track and celebrate team birthdays",
    "Announce special days and observances",
    "Send personalized birthday messages with AI-generated images",
    "Provide information about upcoming events",
];

// ---------------------------------------------------------------------
// Reply handler
// ---------------------------------------------------------------------

/// Keyword -> reaction pool table.
const REACTION_MAPPINGS: &[(&[&str], &[&str])] = &[
    (&["congrat", "happy birthday", "feliz", "joyeux"], &["tada", "birthday", "partying_face"]),
    (&["love", "heart", "adore", "<3"], &["heart", "hearts", "sparkling_heart"]),
    (&["amazing", "awesome", "fantastic", "great", "wonderful"], &["star2", "dizzy", "sparkles"]),
    (&["thank", "thanks", "thx", "gracias", "merci"], &["pray", "raised_hands", "blush"]),
    (&["haha", "lol", "funny", "hilarious"], &["joy", "smile"]),
    (&["cake", "cupcake", "dessert", "sweet"], &["cake", "cupcake"]),
    (&["party", "celebrate", "fiesta"], &["confetti_ball", "balloon", "champagne"]),
    (&["wish", "hope", "dream"], &["star", "rainbow", "sparkles"]),
    (&["best", "greatest", "legend"], &["trophy", "crown", "medal"]),
    (&["cheers", "toast", "drink"], &["clinking_glasses", "champagne", "beers"]),
    (&["gift", "present", "surprise"], &["gift", "ribbon", "gift_heart"]),
];

const DEFAULT_REACTIONS: &[&str] = &["tada", "sparkles", "heart", "raised_hands", "clap"];

/// No `rand` dependency in this stack (personality rotation is also
/// deterministic, see `Personality::resolve_random`); pick a pool member
/// by hashing the triggering text so the same message always yields the
/// same reaction.
fn pick_deterministic<'a>(pool: &[&'a str], seed: &str) -> &'a str {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    pool[(hasher.finish() as usize) % pool.len()]
}

/// Keeps only pool members that are real emoji shortcodes, so a typo in
/// the reaction table degrades to the rest of the pool instead of a
/// platform `invalid_name` error. An all-invalid pool passes through
/// unchanged (it may name workspace-custom emoji).
fn validated_pool<'a>(pool: &[&'a str]) -> Vec<&'a str> {
    let valid: Vec<&str> = pool
        .iter()
        .copied()
        .filter(|name| emojis::get_by_shortcode(name).is_some())
        .collect();
    if valid.is_empty() {
        pool.to_vec()
    } else {
        valid
    }
}

fn reaction_for_message(text: &str) -> &'static str {
    let lower = text.to_lowercase();
    for (keywords, reactions) in REACTION_MAPPINGS {
        if keywords.iter().any(|k| lower.contains(k)) {
            return pick_deterministic(&validated_pool(reactions), &lower);
        }
    }
    pick_deterministic(&validated_pool(DEFAULT_REACTIONS), &lower)
}

/// Replies from a tracked thread's own celebrant(s) don't earn a reaction
/// or thank-you -- let peers do the celebrating.
fn is_authored_by_celebrant(tracked: &TrackedThread, author: &UserId) -> bool {
    tracked.birthday_people.iter().any(|p| p == author)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyOutcome {
    pub reaction_added: bool,
    pub thank_you_sent: bool,
}

/// Handles one reply in a (possibly) tracked thread: reactions plus an
/// optional thank-you, each independently capped.
pub async fn handle_thread_reply<P, C>(
    chat: &P,
    tracker: &ThreadTracker,
    completer: &C,
    config: &EngagementConfig,
    channel: &ChannelId,
    thread_ts: &ThreadTs,
    message_ts: &ThreadTs,
    author: &UserId,
    text: &str,
) -> ReplyOutcome
where
    P: ChatPlatform,
    C: Completer,
{
    let mut outcome = ReplyOutcome::default();

    let Some(tracked) = tracker.get(channel, thread_ts).await else {
        return outcome;
    };
    if is_authored_by_celebrant(&tracked, author) {
        return outcome;
    }

    if tracked.reactions_count < config.max_reactions_per_thread {
        let reaction = reaction_for_message(text);
        match chat.add_reaction(channel, message_ts, reaction).await {
            Ok(()) => {
                tracker.increment_reactions(channel, thread_ts).await;
                outcome.reaction_added = true;
            }
            Err(error) => tracing::warn!(%error, "failed to add thread-engagement reaction"),
        }
    }

    if config.thank_you_enabled && tracked.responses_sent < config.max_thank_yous_per_thread {
        if let Some(thank_you) = generate_thank_you(completer, &tracked.personality, text).await {
            match chat
                .post_message(
                    channel,
                    OutboundResponse::ThreadReply { thread_ts: thread_ts.clone(), text: thank_you },
                )
                .await
            {
                Ok(_) => {
                    tracker.increment_responses(channel, thread_ts).await;
                    outcome.thank_you_sent = true;
                }
                Err(error) => tracing::warn!(%error, "failed to post thread thank-you"),
            }
        }
    }

    outcome
}

async fn generate_thank_you(completer: &impl Completer, personality_key: &str, original_text: &str) -> Option<String> {
    let personality = Personality::from_key(personality_key).unwrap_or(Personality::Standard);
    let data = personality.data();
    let snippet: String = original_text.chars().take(100).collect();
    let system = format!(
        "You are {}, a friendly birthday celebration bot. {}",
        data.name, data.style
    );
    let user = format!(
        "Someone just posted a kind message in a birthday thread. Generate a very brief \
        (10-20 words max) thank-you response that matches your personality. Be warm but \
        concise. Use 1-2 emojis max.\n\nTheir message: \"{snippet}\"\n\nRespond with just the \
        thank-you message, no quotes or explanation."
    );
    let messages = vec![ChatMessage::System(system), ChatMessage::User(user)];
    let use_case = UseCase::ThreadThankYou;
    match completer
        .complete(messages, use_case.max_tokens(), use_case.temperature(), use_case.reasoning_effort())
        .await
    {
        Ok(outcome) if !outcome.text.trim().is_empty() => Some(outcome.text.trim().to_string()),
        Ok(_) => None,
        Err(error) => {
            tracing::warn!(%error, "thank-you generation failed");
            None
        }
    }
}

// ---------------------------------------------------------------------
// Mention handler
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionCategory {
    SpecialDays,
    Birthdays,
    Upcoming,
    Help,
    General,
}

fn mention_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<@[A-Z0-9]+(\|[^>]+)?>").unwrap())
}

fn strip_mention_token(text: &str) -> String {
    mention_token_re().replace_all(text, "").trim().to_string()
}

fn classify_question(text: &str) -> QuestionCategory {
    const SPECIAL: &[&str] = &[
        "special day", "special days", "observance", "holiday", "international day",
        "world day", "un day", "today's day", "what day is", "what is today",
    ];
    const BIRTHDAY: &[&str] = &[
        "birthday", "birthdays", "born", "celebrate", "upcoming birthday", "next birthday",
        "whose birthday", "who has a birthday",
    ];
    const UPCOMING: &[&str] = &["upcoming", "coming up", "next week", "this week", "soon", "schedule", "calendar"];
    const HELP: &[&str] = &["help", "what can you", "how do you", "what do you", "commands", "features"];

    let lower = text.to_lowercase();
    if SPECIAL.iter().any(|k| lower.contains(k)) {
        QuestionCategory::SpecialDays
    } else if BIRTHDAY.iter().any(|k| lower.contains(k)) {
        QuestionCategory::Birthdays
    } else if UPCOMING.iter().any(|k| lower.contains(k)) {
        QuestionCategory::Upcoming
    } else if HELP.iter().any(|k| lower.contains(k)) {
        QuestionCategory::Help
    } else {
        QuestionCategory::General
    }
}

#[derive(Debug, Clone)]
pub struct UpcomingBirthday {
    pub name: String,
    pub days_until: i64,
    pub date_label: String,
}

#[derive(Debug, Clone)]
pub struct MentionContext {
    pub today_label: String,
    pub special_days: Vec<SpecialDay>,
    pub upcoming_birthdays: Vec<UpcomingBirthday>,
}

async fn upcoming_birthdays_within(
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    today: NaiveDate,
    window_days: i64,
) -> Vec<UpcomingBirthday> {
    let birthdays = datastore.load_birthdays().await.unwrap_or_default();
    let mut upcoming: Vec<(i64, UpcomingBirthday)> = Vec::new();

    for (user_id, record) in birthdays.0.iter() {
        let Some(md) = record.month_day() else { continue };
        let mut candidate = match NaiveDate::from_ymd_opt(today.year(), md.month as u32, md.day as u32) {
            Some(d) => d,
            None => continue,
        };
        if candidate < today {
            candidate = match NaiveDate::from_ymd_opt(today.year() + 1, md.month as u32, md.day as u32) {
                Some(d) => d,
                None => continue,
            };
        }
        let days_until = (candidate - today).num_days();
        if days_until > window_days {
            continue;
        }
        let user_id: UserId = user_id.as_str().into();
        let name = profiles.get_username(&user_id).await.unwrap_or_else(|_| user_id.to_string());
        upcoming.push((days_until, UpcomingBirthday { name, days_until, date_label: candidate.format("%B %d").to_string() }));
    }

    upcoming.sort_by_key(|(days, _)| *days);
    upcoming.into_iter().take(5).map(|(_, b)| b).collect()
}

async fn build_context(
    category: QuestionCategory,
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    today: NaiveDate,
) -> MentionContext {
    let mut special_days = Vec::new();
    if matches!(category, QuestionCategory::SpecialDays | QuestionCategory::Upcoming | QuestionCategory::General) {
        if let Some(today_md) = MonthDay::new(today.month() as u8, today.day() as u8) {
            let special_config = datastore.load_special_days_config().await.unwrap_or_default();
            special_days = aggregate(observance_sources, today_md, &special_config.category_enabled).await;
            special_days.truncate(5);
        }
    }

    let mut upcoming_birthdays = Vec::new();
    if matches!(category, QuestionCategory::Birthdays | QuestionCategory::Upcoming | QuestionCategory::General) {
        upcoming_birthdays = upcoming_birthdays_within(datastore, profiles, today, UPCOMING_BIRTHDAY_WINDOW_DAYS).await;
    }

    MentionContext { today_label: today.format("%A, %B %d, %Y").to_string(), special_days, upcoming_birthdays }
}

fn build_mention_prompt(question: &str, category: QuestionCategory, context: &MentionContext) -> String {
    let mut prompt = format!(
        "You are a friendly birthday and special-days celebration bot for a team workspace.\n\
        Today is {}.\n\nYour capabilities:\n",
        context.today_label
    );
    for capability in BOT_CAPABILITIES {
        prompt.push_str(&format!("- {capability}\n"));
    }
    prompt.push('\n');

    if category == QuestionCategory::SpecialDays || !context.special_days.is_empty() {
        if context.special_days.is_empty() {
            prompt.push_str("There are no special observances today.\n\n");
        } else {
            prompt.push_str("Today's special observances:\n");
            for day in &context.special_days {
                prompt.push_str(&format!("- {} ({})\n", day.name, day.category.label()));
            }
            prompt.push('\n');
        }
    }

    if category == QuestionCategory::Birthdays || !context.upcoming_birthdays.is_empty() {
        if context.upcoming_birthdays.is_empty() {
            prompt.push_str("No upcoming birthdays in the next week.\n\n");
        } else {
            prompt.push_str("Upcoming birthdays:\n");
            for birthday in &context.upcoming_birthdays {
                let when = match birthday.days_until {
                    0 => "TODAY!".to_string(),
                    1 => format!("Tomorrow ({})", birthday.date_label),
                    n => format!("In {n} days ({})", birthday.date_label),
                };
                prompt.push_str(&format!("- {} - {when}\n", birthday.name));
            }
            prompt.push('\n');
        }
    }

    if category == QuestionCategory::Help {
        prompt.push_str(
            "If asked about your capabilities, explain: users can set their birthday, you \
            announce birthdays with personalized messages and AI images, you share \
            information about special days, and you can answer questions about upcoming \
            events.\n\n",
        );
    }

    prompt.push_str(&format!(
        "A user asked: \"{question}\"\n\nRespond helpfully in 2-4 sentences. Be friendly but \
        concise. Use 1-2 relevant emojis. If you don't have information to answer the \
        question, say so politely.\n\nResponse:"
    ));
    prompt
}

fn fallback_for_category(category: QuestionCategory, context: &MentionContext) -> String {
    match category {
        QuestionCategory::SpecialDays => {
            if context.special_days.is_empty() {
                "I don't see any special observances logged for today.".to_string()
            } else {
                let names: Vec<&str> = context.special_days.iter().map(|d| d.name.as_str()).collect();
                format!("Today's special days: {}", names.join(", "))
            }
        }
        QuestionCategory::Birthdays | QuestionCategory::Upcoming => {
            if context.upcoming_birthdays.is_empty() {
                "No birthdays coming up in the next week that I know of.".to_string()
            } else {
                let names: Vec<String> =
                    context.upcoming_birthdays.iter().map(|b| format!("{} ({})", b.name, b.date_label)).collect();
                format!("Upcoming birthdays: {}", names.join(", "))
            }
        }
        QuestionCategory::Help => {
            "I track birthdays, announce special days, and can answer questions about upcoming events -- just ask!".to_string()
        }
        QuestionCategory::General => {
            "I'm not sure how to answer that one, but ask me about birthdays or special days and I'm all ears!".to_string()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MentionOutcome {
    pub responded: bool,
    pub category: Option<QuestionCategory>,
}

/// Handles an `@bot` mention end to end: rate limit, classify, build
/// context, generate (with category fallback), and reply.
#[allow(clippy::too_many_arguments)]
pub async fn handle_mention<P, C>(
    chat: &P,
    completer: &C,
    datastore: &Datastore,
    profiles: &ProfileResolver<impl ChatPlatform>,
    observance_sources: &[Arc<dyn ObservanceSourceDyn>],
    rate_limiter: &RateLimiter,
    channel: &ChannelId,
    thread_ts: Option<&ThreadTs>,
    message_ts: &ThreadTs,
    author: &UserId,
    raw_text: &str,
    today: NaiveDate,
) -> MentionOutcome
where
    P: ChatPlatform,
    C: Completer,
{
    let reply_root = thread_ts.cloned().unwrap_or_else(|| message_ts.clone());

    if let Err(retry_after_secs) = rate_limiter.check(author).await {
        let _ = chat
            .post_message(
                channel,
                OutboundResponse::ThreadReply {
                    thread_ts: reply_root,
                    text: format!(
                        "Whoa there! Please wait {retry_after_secs} seconds before asking me another question."
                    ),
                },
            )
            .await;
        return MentionOutcome { responded: false, category: None };
    }

    let stripped = strip_mention_token(raw_text);
    let question = if stripped.is_empty() { "help".to_string() } else { stripped };
    let category = classify_question(&question);
    let context = build_context(category, datastore, profiles, observance_sources, today).await;

    let use_case = UseCase::MentionAnswer;
    let messages = vec![ChatMessage::User(build_mention_prompt(&question, category, &context))];
    let text = match completer
        .complete(messages, use_case.max_tokens(), use_case.temperature(), use_case.reasoning_effort())
        .await
    {
        Ok(outcome) if !outcome.text.trim().is_empty() => outcome.text.trim().to_string(),
        Ok(_) => fallback_for_category(category, &context),
        Err(error) => {
            tracing::warn!(%error, "mention completion failed");
            fallback_for_category(category, &context)
        }
    };

    match chat.post_message(channel, OutboundResponse::ThreadReply { thread_ts: reply_root, text }).await {
        Ok(_) => MentionOutcome { responded: true, category: Some(category) },
        Err(error) => {
            tracing::warn!(%error, "failed to reply to mention");
            MentionOutcome { responded: false, category: Some(category) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_tracker::ThreadType;

    fn tracked(people: Vec<UserId>) -> TrackedThread {
        TrackedThread {
            channel: "C1".into(),
            thread_ts: "1.1".into(),
            thread_type: ThreadType::Birthday,
            personality: "standard".into(),
            created_at: chrono::Utc::now(),
            reactions_count: 0,
            responses_sent: 0,
            birthday_people: people,
            special_day_info: None,
        }
    }

    #[test]
    fn ignores_replies_from_the_celebrant() {
        let author: UserId = "U1".into();
        assert!(is_authored_by_celebrant(&tracked(vec![author.clone()]), &author));
        assert!(!is_authored_by_celebrant(&tracked(vec!["U2".into()]), &author));
    }

    #[test]
    fn reaction_pick_is_deterministic_and_keyword_aware() {
        let first = reaction_for_message("Happy birthday!! so amazing");
        let second = reaction_for_message("Happy birthday!! so amazing");
        assert_eq!(first, second);
        assert!(["tada", "birthday", "partying_face"].contains(&first));
    }

    #[test]
    fn unmatched_message_falls_back_to_default_pool() {
        let reaction = reaction_for_message("ok");
        assert!(DEFAULT_REACTIONS.contains(&reaction));
    }

    #[test]
    fn strips_mention_token_and_defaults_to_help() {
        assert_eq!(strip_mention_token("<@U123ABC> what can you do"), "what can you do");
        assert_eq!(strip_mention_token("<@U123ABC|bot>"), "");
    }

    #[test]
    fn classifies_questions_by_keyword() {
        assert_eq!(classify_question("what special days are today"), QuestionCategory::SpecialDays);
        assert_eq!(classify_question("whose birthday is it"), QuestionCategory::Birthdays);
        assert_eq!(classify_question("what's coming up this week"), QuestionCategory::Upcoming);
        assert_eq!(classify_question("help me understand your commands"), QuestionCategory::Help);
        assert_eq!(classify_question("tell me a joke"), QuestionCategory::General);
    }

    #[test]
    fn fallback_lists_upcoming_birthdays_when_present() {
        let context = MentionContext {
            today_label: "today".into(),
            special_days: vec![],
            upcoming_birthdays: vec![UpcomingBirthday { name: "Alex".into(), days_until: 2, date_label: "June 15".into() }],
        };
        let fallback = fallback_for_category(QuestionCategory::Birthdays, &context);
        assert!(fallback.contains("Alex"));
    }

    #[test]
    fn every_default_reaction_is_a_real_emoji_shortcode() {
        for name in DEFAULT_REACTIONS {
            assert!(emojis::get_by_shortcode(name).is_some(), "unknown shortcode: {name}");
        }
    }

    use crate::datastore::Datastore;
    use crate::llm::CompletionOutcome;
    use crate::messaging::traits::InboundStream;
    use crate::profile::{ProfileResolver, UserProfile};
    use crate::rate_limit::RateLimiter;
    use std::sync::Mutex;

    struct MockChat {
        replies: Mutex<Vec<String>>,
    }

    impl MockChat {
        fn new() -> Self {
            Self { replies: Mutex::new(Vec::new()) }
        }
    }

    impl ChatPlatform for MockChat {
        async fn start(&self) -> crate::Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn post_message(&self, _channel: &ChannelId, response: OutboundResponse) -> crate::Result<ThreadTs> {
            if let OutboundResponse::ThreadReply { text, .. } = response {
                self.replies.lock().unwrap().push(text);
            }
            Ok("1.1".into())
        }

        async fn add_reaction(&self, _channel: &ChannelId, _ts: &ThreadTs, _name: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn upload_and_wait(
            &self,
            _bytes: Vec<u8>,
            _filename: String,
        ) -> crate::Result<crate::messaging::traits::UploadedFile> {
            Err(crate::error::MessagingError::UpstreamRefused("uploads not exercised by mention tests".into()).into())
        }

        async fn users_profile_get(&self, user_id: &UserId) -> crate::Result<UserProfile> {
            Ok(UserProfile {
                display_name: user_id.to_string(),
                real_name: user_id.to_string(),
                title: None,
                timezone: None,
                timezone_offset_seconds: 0,
                photo_urls: Default::default(),
                is_deleted: false,
                is_bot: false,
                custom_fields: Default::default(),
            })
        }

        async fn users_info_is_admin(&self, _user_id: &UserId) -> crate::Result<bool> {
            Ok(false)
        }

        async fn conversations_members(
            &self,
            _channel: &ChannelId,
            _cursor: Option<&str>,
        ) -> crate::Result<crate::messaging::traits::MembersPage> {
            Ok(Default::default())
        }

        async fn conversations_open(&self, _user_id: &UserId) -> crate::Result<ChannelId> {
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
        ) -> crate::Result<CompletionOutcome> {
            Ok(CompletionOutcome { text: "Here's what I know!".into(), usage: Default::default() })
        }
    }

    #[tokio::test]
    async fn sixth_mention_in_window_gets_a_rate_limit_reply_with_reset_time() {
        let tmp = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::new(
            tmp.path().join("storage"),
            tmp.path().join("cache"),
            tmp.path().join("backups"),
        ));
        let chat = Arc::new(MockChat::new());
        let profiles = ProfileResolver::new(chat.clone(), datastore.clone());
        let limiter = RateLimiter::new(60, 5);
        let completer = StubCompleter;
        let today = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        let channel: ChannelId = "C1".into();
        let message_ts: ThreadTs = "1.1".into();
        let author: UserId = "U_ASKER".into();

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(
                handle_mention(
                    chat.as_ref(),
                    &completer,
                    &datastore,
                    &profiles,
                    &[],
                    &limiter,
                    &channel,
                    None,
                    &message_ts,
                    &author,
                    "<@UBOT> whose birthday is next",
                    today,
                )
                .await,
            );
        }

        assert!(outcomes[..5].iter().all(|o| o.responded));
        assert!(!outcomes[5].responded);

        let replies = chat.replies.lock().unwrap();
        assert_eq!(replies.len(), 6);
        let rate_limit_reply = replies.last().unwrap();
        assert!(rate_limit_reply.contains("wait"));
        let seconds: u64 = rate_limit_reply
            .split_whitespace()
            .find_map(|word| word.parse().ok())
            .expect("reply names a reset time");
        assert!(seconds > 0);
    }
}
