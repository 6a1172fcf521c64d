//! Pipeline orchestrator: composes a `CelebrationRequest`,
//! drives it through message/image generation, posts the result, tracks
//! the thread, and updates the ledger.
//!
//! The state machine follows a `can_transition_to`/`transition_to`
//! idiom: a `matches!` tuple-pattern check over `(current, target)`,
//! returning a typed error on an invalid edge rather than silently
//! clamping.

use crate::config::FeatureToggles;
use crate::datastore::{AnnouncementLedgerDay, BirthdayRecord, Datastore};
use crate::error::{PipelineError, Result};
use crate::imagegen::{ImageGen, ImageQuality, ImageSize};
use crate::images::{run_image_fanout, ImageJob, ImageOutcome};
use crate::llm::Completer;
use crate::messages::{generate_birthday_message, generate_special_day_message, CelebrantContext};
use crate::messaging::traits::{Block, ChatPlatform, OutboundResponse, MAX_BLOCKS_PER_MESSAGE};
use crate::observance::SpecialDay;
use crate::personality::Personality;
use crate::profile::{ProfileResolver, UserProfile};
use crate::thread_tracker::{SpecialDayInfo, ThreadTracker, TrackedThreadPayload};
use crate::time_model::{age_in_years, date_in_words};
use crate::{ChannelId, MonthDay, ThreadTs, UserId};
use chrono::NaiveDate;

/// Linear, non-cyclic lifecycle of one `CelebrationRequest`.
/// Retries happen inside a state, never by looping back an edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CelebrationState {
    Pending,
    Gathering,
    Validated,
    Generating,
    Uploading,
    Composing,
    Posting,
    Tracking,
    Done,
    Aborted(String),
}

impl CelebrationState {
    fn label(&self) -> String {
        match self {
            CelebrationState::Aborted(reason) => format!("Aborted({reason})"),
            other => format!("{other:?}"),
        }
    }

    /// Whether `target` is a legal next state from `self`. Forward
    /// progress is a fixed line; `Aborted` is reachable from any
    /// non-terminal state.
    pub fn can_transition_to(&self, target: &CelebrationState) -> bool {
        use CelebrationState::*;
        if matches!(self, Done | Aborted(_)) {
            return false;
        }
        if matches!(target, Aborted(_)) {
            return true;
        }
        matches!(
            (self, target),
            (Pending, Gathering)
                | (Gathering, Validated)
                | (Validated, Generating)
                | (Generating, Uploading)
                | (Uploading, Composing)
                | (Composing, Posting)
                | (Posting, Tracking)
                | (Tracking, Done)
        )
    }

    pub fn transition_to(&mut self, target: CelebrationState) -> Result<()> {
        if !self.can_transition_to(&target) {
            return Err(PipelineError::InvalidTransition {
                from: self.label(),
                to: target.label(),
            }
            .into());
        }
        *self = target;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CelebrationMode {
    Production,
    Test,
}

/// One candidate celebrant, resolved during the Gather stage.
#[derive(Debug, Clone)]
pub struct BirthdayPerson {
    pub user_id: UserId,
    pub record: BirthdayRecord,
    pub profile: Option<UserProfile>,
}

/// Why a candidate was dropped during Validate.
#[derive(Debug, Clone)]
pub struct DroppedPerson {
    pub user_id: UserId,
    pub reason: String,
}

/// Input bundle for one pipeline run.
#[derive(Debug, Clone)]
pub struct CelebrationRequest {
    pub destination: ChannelId,
    pub people: Vec<BirthdayPerson>,
    pub mode: CelebrationMode,
    pub personality_override: Option<Personality>,
    pub include_image: bool,
    pub quality: ImageQuality,
    pub size: ImageSize,
    pub text_only: bool,
    /// Condition each person's image on their profile photo when one is
    /// available.
    pub use_reference_photo: bool,
    pub today: NaiveDate,
    pub date_key: String,
    /// True when `date_key` is a per-user-timezone bucket rather than a
    /// fleet-wide calendar date, so the ledger writes land in the
    /// `(date,bucket)` set the timezone-aware sweep actually reads back.
    pub timezone_aware: bool,
    state: CelebrationState,
}

impl CelebrationRequest {
    pub fn new(
        destination: ChannelId,
        people: Vec<BirthdayPerson>,
        mode: CelebrationMode,
        today: NaiveDate,
        date_key: String,
    ) -> Self {
        Self {
            destination,
            people,
            mode,
            personality_override: None,
            include_image: true,
            quality: ImageQuality::Standard,
            size: ImageSize::SQUARE,
            text_only: false,
            use_reference_photo: true,
            today,
            date_key,
            timezone_aware: false,
            state: CelebrationState::Pending,
        }
    }

    pub fn with_timezone_aware(mut self, timezone_aware: bool) -> Self {
        self.timezone_aware = timezone_aware;
        self
    }

    pub fn state(&self) -> &CelebrationState {
        &self.state
    }
}

/// Outcome of a completed (or aborted) run.
#[derive(Debug, Clone)]
pub struct CelebrationOutcome {
    pub state: CelebrationState,
    pub root_ts: Option<ThreadTs>,
    pub celebrated: Vec<UserId>,
    pub dropped: Vec<DroppedPerson>,
    pub message: Option<String>,
    pub personality: Option<Personality>,
    pub images_posted: usize,
    pub images_failed: usize,
}

impl CelebrationOutcome {
    fn aborted(state: CelebrationState, dropped: Vec<DroppedPerson>) -> Self {
        Self {
            state,
            root_ts: None,
            celebrated: Vec::new(),
            dropped,
            message: None,
            personality: None,
            images_posted: 0,
            images_failed: 0,
        }
    }
}

/// The collaborators a pipeline run needs, bundled so call sites (the
/// scheduler, the immediate-fire path from an admin `/birthday add`)
/// don't have to pass six separate arguments.
pub struct PipelineDeps<'a, P, C, I> {
    pub datastore: &'a Datastore,
    pub profiles: &'a ProfileResolver<P>,
    pub tracker: &'a ThreadTracker,
    pub chat: &'a P,
    pub completer: &'a C,
    pub imagegen: &'a I,
}

/// Runs the full staged pipeline for a birthday celebration.
pub async fn run_celebration_pipeline<P, C, I>(
    deps: &PipelineDeps<'_, P, C, I>,
    mut request: CelebrationRequest,
    personality: Personality,
    toggles: FeatureToggles,
) -> Result<CelebrationOutcome>
where
    P: ChatPlatform + Sync,
    C: Completer + Sync,
    I: ImageGen + Sync,
{
    // 1. Gather.
    request.state.transition_to(CelebrationState::Gathering)?;
    for person in &mut request.people {
        match deps.profiles.get_profile(&person.user_id).await {
            Ok(profile) => person.profile = Some(profile),
            Err(error) => {
                tracing::warn!(user_id = %person.user_id, %error, "failed to resolve profile during gather");
            }
        }
    }

    // 2. Validate for posting.
    request.state.transition_to(CelebrationState::Validated)?;
    let members = deps
        .profiles
        .list_channel_members(&request.destination)
        .await
        .unwrap_or_default();
    let mut dropped = Vec::new();
    let mut survivors = Vec::new();
    for person in request.people {
        if let Some(reason) = disqualify_reason(&person, &members) {
            dropped.push(DroppedPerson { user_id: person.user_id, reason });
        } else {
            survivors.push(person);
        }
    }
    if survivors.is_empty() {
        request
            .state
            .transition_to(CelebrationState::Aborted(PipelineError::NoEligiblePeople.to_string()))?;
        return Ok(CelebrationOutcome::aborted(request.state, dropped));
    }
    let survivor_ids: std::collections::HashSet<UserId> =
        survivors.iter().map(|p| p.user_id.clone()).collect();

    let contexts: Vec<CelebrantContext> = survivors
        .iter()
        .map(|p| celebrant_context(p, request.today))
        .collect();

    // 3. Historical fact.
    let historical_fact = if personality.wants_historical_fact() {
        Some(fetch_historical_fact(deps.datastore, request.today, personality).await)
    } else {
        None
    };

    // 4. Message generation.
    request.state.transition_to(CelebrationState::Generating)?;
    let message = generate_birthday_message(
        deps.completer,
        personality,
        &contexts,
        historical_fact.as_deref(),
    )
    .await;

    // 5. Image fan-out.
    request.state.transition_to(CelebrationState::Uploading)?;
    let want_images = toggles.image_generation && request.include_image && !request.text_only;
    let mut image_outcomes: Vec<(UserId, ImageOutcome)> = Vec::new();
    if want_images {
        let mut jobs = Vec::new();
        for person in survivors.iter().filter(|p| p.record.preferences.image_enabled) {
            let reference_photo = if request.use_reference_photo {
                fetch_reference_photo(person).await
            } else {
                None
            };
            jobs.push(ImageJob {
                user_id: person.user_id.clone(),
                name: display_name(person),
                quality: request.quality,
                size: request.size,
                reference_photo,
            });
        }
        image_outcomes = run_image_fanout(deps.imagegen, deps.completer, personality, jobs).await;
    }
    // Image-for-valid-people filter: discard any image whose
    // owner dropped out of the surviving set since the jobs were enqueued.
    image_outcomes.retain(|(user_id, _)| survivor_ids.contains(user_id));

    // 6. Image upload.
    let mut uploaded: Vec<(UserId, String, String)> = Vec::new(); // (user, file_id, caption)
    let mut images_failed = 0usize;
    for (user_id, outcome) in image_outcomes {
        match outcome {
            ImageOutcome::Generated { bytes, caption } => {
                let filename = format!("birthday_{user_id}.png");
                match deps.chat.upload_and_wait(bytes, filename).await {
                    Ok(file) => uploaded.push((user_id, file.file_id, caption)),
                    Err(error) => {
                        images_failed += 1;
                        tracing::warn!(%user_id, %error, "image upload failed, posting without image");
                    }
                }
            }
            ImageOutcome::Failed { reason } => {
                images_failed += 1;
                tracing::warn!(%user_id, reason, "image generation failed, posting without image");
            }
        }
    }

    // 7. Compose.
    request.state.transition_to(CelebrationState::Composing)?;
    let blocks = compose_birthday_blocks(&survivors, &message, &uploaded, personality, historical_fact.as_deref());

    // 8. Post.
    request.state.transition_to(CelebrationState::Posting)?;
    let root_ts = post_blocks_message(deps.chat, &request.destination, &message, blocks).await?;

    // 9. Track.
    request.state.transition_to(CelebrationState::Tracking)?;
    deps.tracker
        .track(
            request.destination.clone(),
            root_ts.clone(),
            personality.key().to_string(),
            TrackedThreadPayload::Birthday {
                people: survivors.iter().map(|p| p.user_id.clone()).collect(),
            },
        )
        .await;
    deps.tracker.persist(deps.datastore).await?;

    // 10. Persist & ledger.
    if request.mode == CelebrationMode::Production {
        mark_ledger(deps.datastore, &request.date_key, &survivor_ids, request.timezone_aware).await?;
    }

    request.state.transition_to(CelebrationState::Done)?;

    Ok(CelebrationOutcome {
        state: request.state,
        root_ts: Some(root_ts),
        celebrated: survivors.into_iter().map(|p| p.user_id).collect(),
        dropped,
        message: Some(message),
        personality: Some(personality),
        images_posted: uploaded.len(),
        images_failed,
    })
}

fn disqualify_reason(person: &BirthdayPerson, members: &[UserId]) -> Option<String> {
    let Some(profile) = &person.profile else {
        return Some("profile could not be resolved".to_string());
    };
    if profile.is_bot {
        return Some("user is a bot".to_string());
    }
    if profile.is_deleted {
        return Some("user is deleted".to_string());
    }
    if !members.is_empty() && !members.contains(&person.user_id) {
        return Some("user is no longer a channel member".to_string());
    }
    if !person.record.preferences.active {
        return Some("birthday preference is inactive".to_string());
    }
    None
}

fn display_name(person: &BirthdayPerson) -> String {
    person
        .profile
        .as_ref()
        .map(|p| p.preferred_name().to_string())
        .unwrap_or_else(|| person.user_id.to_string())
}

fn celebrant_context(person: &BirthdayPerson, today: NaiveDate) -> CelebrantContext {
    let birth_month_day = person
        .record
        .month_day()
        .unwrap_or_else(|| MonthDay::new(1, 1).expect("1/1 is always valid"));
    // A record without a year implies show_age=false on display.
    let age = person
        .record
        .year
        .filter(|_| person.record.preferences.show_age)
        .map(|y| age_in_years(y, today));
    CelebrantContext {
        user_id: person.user_id.clone(),
        mention: format!("<@{}>", person.user_id),
        name: display_name(person),
        birth_month_day,
        age,
    }
}

/// Downloads the highest-resolution profile photo for reference-photo
/// conditioning. Best-effort: any failure just means an unconditioned
/// image.
async fn fetch_reference_photo(person: &BirthdayPerson) -> Option<Vec<u8>> {
    let profile = person.profile.as_ref()?;
    let url = profile
        .photo_urls
        .get("512")
        .or_else(|| profile.photo_urls.get("192"))?;
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .ok()?;
    match client.get(url).send().await {
        Ok(resp) if resp.status().is_success() => resp.bytes().await.ok().map(|b| b.to_vec()),
        Ok(resp) => {
            tracing::debug!(user_id = %person.user_id, status = %resp.status(), "profile photo fetch refused");
            None
        }
        Err(error) => {
            tracing::debug!(user_id = %person.user_id, %error, "profile photo fetch failed");
            None
        }
    }
}

async fn fetch_historical_fact(
    datastore: &Datastore,
    today: NaiveDate,
    personality: Personality,
) -> String {
    use chrono::Datelike;
    let year = today.year();
    let month = today.month() as u8;
    let day = today.day() as u8;
    let _ = datastore.prune_stale_historical_facts(year).await;
    if let Some(cached) = datastore
        .load_historical_fact(month, day, personality.key(), year)
        .await
    {
        return cached.fact;
    }
    // No dedicated web-search collaborator is in scope; the cache still protects a repeat lookup
    // within the same day/year from redoing this placeholder generation.
    let fact = format!(
        "On this day in history, notable events have shaped {} {}.",
        crate::time_model::date_in_words(MonthDay::new(month, day).unwrap_or(MonthDay::new(1, 1).unwrap())),
        year
    );
    if let Err(error) = datastore
        .save_historical_fact(month, day, personality.key(), year, &fact)
        .await
    {
        tracing::warn!(%error, "failed to cache historical fact");
    }
    fact
}

fn compose_birthday_blocks(
    people: &[BirthdayPerson],
    message: &str,
    uploaded: &[(UserId, String, String)],
    personality: Personality,
    historical_fact: Option<&str>,
) -> Vec<Block> {
    let mut blocks = Vec::new();
    let header = if people.len() > 1 {
        format!("{} Birthdays Today!", personality.data().emoji)
    } else {
        format!("{} Happy Birthday!", personality.data().emoji)
    };
    blocks.push(Block::Header(header));
    blocks.push(Block::Section(message.to_string()));

    let fields: Vec<(String, String)> = people
        .iter()
        .map(|p| {
            let md = p.record.month_day().unwrap_or(MonthDay { month: 1, day: 1 });
            (display_name(p), date_in_words(md))
        })
        .collect();
    if !fields.is_empty() {
        blocks.push(Block::Fields(fields));
    }

    for (_, file_id, caption) in uploaded {
        blocks.push(Block::ImageByFileId { file_id: file_id.clone(), alt_text: caption.clone() });
    }

    let mut footer = format!("Delivered by {}", personality.data().name);
    if let Some(fact) = historical_fact {
        footer.push_str(&format!(" -- {fact}"));
    }
    blocks.push(Block::Context(footer));
    blocks
}

/// Posts a blocks-style rich message, splitting into a root + threaded
/// continuations when the block count exceeds the platform cap. A
/// continuation failure is recorded but does not fail
/// the whole post -- the thread is still tracked via the root.
async fn post_blocks_message<P: ChatPlatform>(
    chat: &P,
    destination: &ChannelId,
    text: &str,
    blocks: Vec<Block>,
) -> Result<ThreadTs> {
    let mut chunks = blocks.chunks(MAX_BLOCKS_PER_MESSAGE);
    let root_blocks = chunks.next().unwrap_or_default().to_vec();
    // One retry on the root post; a second failure
    // propagates so the ledger stays unmarked and the next pass retries.
    let root_message = OutboundResponse::RichMessage { text: text.to_string(), blocks: root_blocks };
    let root_ts = match chat.post_message(destination, root_message.clone()).await {
        Ok(ts) => ts,
        Err(error) => {
            tracing::warn!(%error, "root post failed, retrying once");
            chat.post_message(destination, root_message).await?
        }
    };

    for chunk in chunks {
        let continuation_text = chunk
            .iter()
            .map(block_to_plain_text)
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(error) = chat
            .post_message(
                destination,
                OutboundResponse::ThreadReply { thread_ts: root_ts.clone(), text: continuation_text },
            )
            .await
        {
            tracing::warn!(%error, "threaded continuation post failed, root already posted");
        }
    }

    Ok(root_ts)
}

fn block_to_plain_text(block: &Block) -> String {
    match block {
        Block::Header(text) | Block::Section(text) | Block::Context(text) => text.clone(),
        Block::Fields(fields) => fields
            .iter()
            .map(|(k, v)| format!("{k}: {v}"))
            .collect::<Vec<_>>()
            .join(" | "),
        Block::Divider => String::new(),
        Block::ImageByFileId { alt_text, .. } => alt_text.clone(),
        Block::Actions(buttons) => buttons.iter().map(|(label, _)| label.clone()).collect::<Vec<_>>().join(" "),
    }
}

async fn mark_ledger(
    datastore: &Datastore,
    date_key: &str,
    user_ids: &std::collections::HashSet<UserId>,
    timezone_aware: bool,
) -> Result<()> {
    datastore
        .update_ledger(|ledger| {
            let day = ledger
                .days
                .entry(date_key.to_string())
                .or_insert_with(AnnouncementLedgerDay::default);
            let target = if timezone_aware {
                &mut day.announced_timezone_bucket_user_ids
            } else {
                &mut day.announced_user_ids
            };
            for user_id in user_ids {
                target.insert(user_id.to_string());
            }
        })
        .await
}

/// Runs the pipeline shape for a special-day announcement: no
/// per-person gathering/validation, no images by default.
pub async fn run_special_day_pipeline<P, C>(
    chat: &P,
    completer: &C,
    tracker: &ThreadTracker,
    datastore: &Datastore,
    destination: &ChannelId,
    days: &[SpecialDay],
    personality: Personality,
    detail: bool,
) -> Result<ThreadTs>
where
    P: ChatPlatform + Sync,
    C: Completer + Sync,
{
    let Some(first) = days.first() else {
        return Err(PipelineError::NoEligiblePeople.into());
    };
    let message = generate_special_day_message(completer, personality, days, detail).await;

    let header = if days.len() > 1 {
        "Special Days This Week".to_string()
    } else {
        format!("{} {}", first.emoji.as_deref().unwrap_or(":calendar:"), first.name)
    };
    let blocks = vec![
        Block::Header(header),
        Block::Section(message.clone()),
        Block::Context(format!("Delivered by {}", personality.data().name)),
    ];

    let root_ts = post_blocks_message(chat, destination, &message, blocks).await?;

    let info = SpecialDayInfo {
        date_mmdd: first.date.to_string(),
        name: first.name.clone(),
        source: format!("{:?}", first.source),
    };
    tracker
        .track(
            destination.clone(),
            root_ts.clone(),
            personality.key().to_string(),
            TrackedThreadPayload::SpecialDay { info },
        )
        .await;
    tracker.persist(datastore).await?;

    Ok(root_ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_person(user_id: &str, active: bool) -> BirthdayPerson {
        BirthdayPerson {
            user_id: user_id.into(),
            record: BirthdayRecord {
                month: 6,
                day: 15,
                year: Some(1990),
                preferences: crate::datastore::BirthdayPreferences {
                    active,
                    ..Default::default()
                },
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
            profile: Some(UserProfile {
                display_name: "Alex".into(),
                real_name: "Alex Rivera".into(),
                title: None,
                timezone: None,
                timezone_offset_seconds: 0,
                photo_urls: Default::default(),
                is_deleted: false,
                is_bot: false,
                custom_fields: Default::default(),
            }),
        }
    }

    #[test]
    fn linear_transitions_are_legal_in_order() {
        let mut state = CelebrationState::Pending;
        for next in [
            CelebrationState::Gathering,
            CelebrationState::Validated,
            CelebrationState::Generating,
            CelebrationState::Uploading,
            CelebrationState::Composing,
            CelebrationState::Posting,
            CelebrationState::Tracking,
            CelebrationState::Done,
        ] {
            state.transition_to(next).unwrap();
        }
        assert_eq!(state, CelebrationState::Done);
    }

    #[test]
    fn cannot_skip_states() {
        let mut state = CelebrationState::Pending;
        assert!(state.transition_to(CelebrationState::Validated).is_err());
    }

    #[test]
    fn cannot_leave_a_terminal_state() {
        let mut state = CelebrationState::Done;
        assert!(state.transition_to(CelebrationState::Gathering).is_err());
        let mut aborted = CelebrationState::Aborted("x".into());
        assert!(aborted.transition_to(CelebrationState::Gathering).is_err());
    }

    #[test]
    fn abort_is_reachable_from_any_non_terminal_state() {
        let mut state = CelebrationState::Generating;
        assert!(state.transition_to(CelebrationState::Aborted("boom".into())).is_ok());
    }

    #[test]
    fn disqualifies_bot_and_inactive_people() {
        let mut bot = base_person("U1", true);
        bot.profile.as_mut().unwrap().is_bot = true;
        assert!(disqualify_reason(&bot, &["U1".into()]).is_some());

        let inactive = base_person("U2", false);
        assert!(disqualify_reason(&inactive, &["U2".into()]).is_some());

        let healthy = base_person("U3", true);
        assert!(disqualify_reason(&healthy, &["U3".into()]).is_none());
    }

    #[test]
    fn disqualifies_people_who_left_the_channel() {
        let person = base_person("U1", true);
        assert!(disqualify_reason(&person, &["U2".into()]).is_some());
    }

    use crate::config::FeatureToggles;
    use crate::imagegen::GeneratedImage;
    use crate::llm::{ChatMessage, CompletionOutcome};
    use crate::messaging::traits::{InboundStream, MembersPage, UploadedFile};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct MockChat {
        members: Vec<UserId>,
        posts: Mutex<Vec<(ChannelId, OutboundResponse)>>,
        uploads: AtomicUsize,
    }

    impl MockChat {
        fn with_members(members: Vec<UserId>) -> Self {
            Self {
                members,
                posts: Mutex::new(Vec::new()),
                uploads: AtomicUsize::new(0),
            }
        }

        fn rich_posts(&self) -> Vec<(String, Vec<Block>)> {
            self.posts
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(_, response)| match response {
                    OutboundResponse::RichMessage { text, blocks } => Some((text.clone(), blocks.clone())),
                    _ => None,
                })
                .collect()
        }

        fn thread_replies(&self) -> usize {
            self.posts
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, r)| matches!(r, OutboundResponse::ThreadReply { .. }))
                .count()
        }
    }

    impl ChatPlatform for MockChat {
        async fn start(&self) -> Result<InboundStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn post_message(&self, channel: &ChannelId, response: OutboundResponse) -> Result<ThreadTs> {
            let mut posts = self.posts.lock().unwrap();
            posts.push((channel.clone(), response));
            Ok(Arc::from(format!("1700000000.{:06}", posts.len()).as_str()))
        }

        async fn add_reaction(&self, _channel: &ChannelId, _ts: &ThreadTs, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn upload_and_wait(&self, _bytes: Vec<u8>, _filename: String) -> Result<UploadedFile> {
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(UploadedFile {
                file_id: format!("F{n}"),
                mimetype: Some("image/png".into()),
                permalink: None,
            })
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
            Ok(MembersPage { members: self.members.clone(), next_cursor: None })
        }

        async fn conversations_open(&self, _user_id: &UserId) -> Result<ChannelId> {
            Ok("D1".into())
        }
    }

    struct StubCompleter {
        text: String,
    }

    impl Completer for StubCompleter {
        async fn complete(
            &self,
            _messages: Vec<ChatMessage>,
            _max_tokens: u32,
            _temperature: f32,
            _reasoning_effort: Option<&str>,
        ) -> Result<CompletionOutcome> {
            Ok(CompletionOutcome { text: self.text.clone(), usage: Default::default() })
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
            Ok(GeneratedImage { bytes: vec![0u8; 8], usage: Default::default() })
        }
    }

    struct Harness {
        datastore: Arc<Datastore>,
        tracker: ThreadTracker,
        chat: Arc<MockChat>,
        profiles: crate::profile::ProfileResolver<MockChat>,
        completer: StubCompleter,
        imagegen: StubImageGen,
        _tmp: tempfile::TempDir,
    }

    fn harness(members: Vec<UserId>, completion: &str) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let datastore = Arc::new(Datastore::new(
            tmp.path().join("storage"),
            tmp.path().join("cache"),
            tmp.path().join("backups"),
        ));
        let chat = Arc::new(MockChat::with_members(members));
        let profiles = crate::profile::ProfileResolver::new(chat.clone(), datastore.clone());
        Harness {
            datastore,
            tracker: ThreadTracker::new(24),
            chat,
            profiles,
            completer: StubCompleter { text: completion.to_string() },
            imagegen: StubImageGen,
            _tmp: tmp,
        }
    }

    impl Harness {
        fn deps(&self) -> PipelineDeps<'_, MockChat, StubCompleter, StubImageGen> {
            PipelineDeps {
                datastore: &self.datastore,
                profiles: &self.profiles,
                tracker: &self.tracker,
                chat: self.chat.as_ref(),
                completer: &self.completer,
                imagegen: &self.imagegen,
            }
        }
    }

    fn request_for(people: Vec<BirthdayPerson>) -> CelebrationRequest {
        CelebrationRequest::new(
            "C_BDAY".into(),
            people,
            CelebrationMode::Production,
            NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
            "2026-03-15".to_string(),
        )
    }

    fn image_toggles() -> FeatureToggles {
        FeatureToggles::default()
    }

    fn count_image_blocks(blocks: &[Block]) -> usize {
        blocks.iter().filter(|b| matches!(b, Block::ImageByFileId { .. })).count()
    }

    #[tokio::test]
    async fn single_birthday_posts_one_rich_message_with_image_and_marks_ledger() {
        let harness = harness(vec!["U1".into()], "Happy birthday <@U1>!");
        let request = request_for(vec![base_person("U1", true)]);

        let outcome = run_celebration_pipeline(&harness.deps(), request, Personality::Standard, image_toggles())
            .await
            .unwrap();

        assert_eq!(outcome.state, CelebrationState::Done);
        assert_eq!(outcome.celebrated, vec![UserId::from("U1")]);
        assert_eq!(outcome.images_posted, 1);

        let posts = harness.chat.rich_posts();
        assert_eq!(posts.len(), 1);
        let (text, blocks) = &posts[0];
        assert!(text.contains("<@U1>"));
        assert!(matches!(blocks[0], Block::Header(_)));
        assert!(blocks.iter().any(|b| matches!(b, Block::Section(s) if s.contains("<@U1>"))));
        assert!(blocks.iter().any(|b| matches!(b, Block::Fields(_))));
        assert_eq!(count_image_blocks(blocks), 1);
        assert!(blocks.iter().any(|b| matches!(b, Block::Context(s) if s.contains("Delivered by"))));

        let ledger = harness.datastore.load_ledger().await.unwrap();
        assert!(ledger.days["2026-03-15"].announced_user_ids.contains("U1"));

        let tracked = harness
            .tracker
            .get(&"C_BDAY".into(), outcome.root_ts.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(tracked.birthday_people, vec![UserId::from("U1")]);
    }

    #[tokio::test]
    async fn consolidated_birthdays_share_one_message_with_one_image_each() {
        let harness = harness(
            vec!["U1".into(), "U2".into()],
            "Happy birthday <@U1> and <@U2>!",
        );
        let request = request_for(vec![base_person("U1", true), base_person("U2", true)]);

        let outcome = run_celebration_pipeline(&harness.deps(), request, Personality::Standard, image_toggles())
            .await
            .unwrap();

        assert_eq!(outcome.celebrated.len(), 2);
        let posts = harness.chat.rich_posts();
        assert_eq!(posts.len(), 1);
        let (text, blocks) = &posts[0];
        assert!(text.contains("<@U1>") && text.contains("<@U2>"));
        assert_eq!(count_image_blocks(blocks), 2);

        let tracked = harness
            .tracker
            .get(&"C_BDAY".into(), outcome.root_ts.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(tracked.birthday_people, vec![UserId::from("U1"), UserId::from("U2")]);
    }

    #[tokio::test]
    async fn late_dropout_is_removed_from_message_and_images() {
        // U2 left the channel after gather: membership only lists U1.
        let harness = harness(vec!["U1".into()], "Happy birthday <@U1>!");
        let request = request_for(vec![base_person("U1", true), base_person("U2", true)]);

        let outcome = run_celebration_pipeline(&harness.deps(), request, Personality::Standard, image_toggles())
            .await
            .unwrap();

        assert_eq!(outcome.celebrated, vec![UserId::from("U1")]);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].user_id, UserId::from("U2"));

        let posts = harness.chat.rich_posts();
        let (text, blocks) = &posts[0];
        assert!(text.contains("<@U1>"));
        assert!(!text.contains("<@U2>"));
        assert_eq!(count_image_blocks(blocks), 1);

        let ledger = harness.datastore.load_ledger().await.unwrap();
        assert!(!ledger.days["2026-03-15"].announced_user_ids.contains("U2"));
    }

    #[tokio::test]
    async fn person_with_images_disabled_gets_no_image_job() {
        let harness = harness(vec!["U1".into()], "Happy birthday <@U1>!");
        let mut person = base_person("U1", true);
        person.record.preferences.image_enabled = false;
        let request = request_for(vec![person]);

        let outcome = run_celebration_pipeline(&harness.deps(), request, Personality::Standard, image_toggles())
            .await
            .unwrap();

        assert_eq!(outcome.images_posted, 0);
        assert_eq!(outcome.images_failed, 0);
        let posts = harness.chat.rich_posts();
        assert_eq!(count_image_blocks(&posts[0].1), 0);
    }

    #[tokio::test]
    async fn exactly_fifty_blocks_posts_a_single_message() {
        let harness = harness(vec!["U1".into()], "irrelevant");
        let blocks: Vec<Block> = (0..MAX_BLOCKS_PER_MESSAGE).map(|i| Block::Section(format!("b{i}"))).collect();

        post_blocks_message(harness.chat.as_ref(), &"C1".into(), "fallback", blocks)
            .await
            .unwrap();

        assert_eq!(harness.chat.rich_posts().len(), 1);
        assert_eq!(harness.chat.thread_replies(), 0);
    }

    #[tokio::test]
    async fn fifty_one_blocks_splits_into_root_plus_threaded_continuation() {
        let harness = harness(vec!["U1".into()], "irrelevant");
        let blocks: Vec<Block> =
            (0..MAX_BLOCKS_PER_MESSAGE + 1).map(|i| Block::Section(format!("b{i}"))).collect();

        post_blocks_message(harness.chat.as_ref(), &"C1".into(), "fallback", blocks)
            .await
            .unwrap();

        let posts = harness.chat.rich_posts();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1.len(), MAX_BLOCKS_PER_MESSAGE);
        assert_eq!(harness.chat.thread_replies(), 1);
    }

    #[tokio::test]
    async fn aborts_with_no_eligible_people_when_everyone_is_dropped() {
        let harness = harness(vec!["U9".into()], "irrelevant");
        let request = request_for(vec![base_person("U1", false)]);

        let outcome = run_celebration_pipeline(&harness.deps(), request, Personality::Standard, image_toggles())
            .await
            .unwrap();

        assert!(matches!(outcome.state, CelebrationState::Aborted(_)));
        assert!(harness.chat.rich_posts().is_empty());
        let ledger = harness.datastore.load_ledger().await.unwrap();
        assert!(ledger.days.is_empty());
    }
}
