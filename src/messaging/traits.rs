//! Chat platform trait and dynamic dispatch companion.
//!
//! The core only depends on this trait; the concrete Slack adapter in
//! [`super::slack`] is the sole implementation in scope, but new
//! adapters plug in without touching the pipeline/engagement code.

use crate::error::Result;
use crate::profile::UserProfile;
use crate::{ChannelId, ThreadTs, UserId};
use futures::Stream;
use std::pin::Pin;

/// A single typed content block for a rich (blocks-style) message.
#[derive(Debug, Clone)]
pub enum Block {
    Header(String),
    Section(String),
    Fields(Vec<(String, String)>),
    Context(String),
    Divider,
    ImageByFileId { file_id: String, alt_text: String },
    Actions(Vec<(String, String)>), // (button label, action id)
}

/// The platform's per-message block cap.
pub const MAX_BLOCKS_PER_MESSAGE: usize = 50;

/// A composed outbound response, one variant per platform operation.
#[derive(Debug, Clone)]
pub enum OutboundResponse {
    Text(String),
    ThreadReply { thread_ts: ThreadTs, text: String },
    RichMessage { text: String, blocks: Vec<Block> },
    UploadFile {
        bytes: Vec<u8>,
        filename: String,
        title: String,
        channel: Option<ChannelId>,
    },
    Reaction { thread_ts: ThreadTs, name: String },
    RemoveReaction { thread_ts: ThreadTs, name: String },
    Ephemeral { user_id: UserId, text: String },
    ScheduledMessage { post_at: chrono::DateTime<chrono::Utc>, text: String },
}

/// Result of a file upload, once the platform finishes processing it.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_id: String,
    pub mimetype: Option<String>,
    pub permalink: Option<String>,
}

/// A page of channel membership.
#[derive(Debug, Clone, Default)]
pub struct MembersPage {
    pub members: Vec<UserId>,
    pub next_cursor: Option<String>,
}

/// Classification of an inbound platform event.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    DirectMessage { user_id: UserId, text: String },
    ChannelMessage {
        channel_id: ChannelId,
        /// This message's own timestamp, used to react to the exact reply.
        ts: ThreadTs,
        thread_ts: Option<ThreadTs>,
        user_id: UserId,
        text: String,
    },
    AppMention {
        channel_id: ChannelId,
        /// This mention's own timestamp, used as the reply root when it
        /// didn't already arrive inside a thread.
        ts: ThreadTs,
        thread_ts: Option<ThreadTs>,
        user_id: UserId,
        text: String,
    },
    MemberJoinedChannel { channel_id: ChannelId, user_id: UserId },
    SlashCommand { command: String, text: String, user_id: UserId, channel_id: ChannelId },
}

pub type InboundStream = Pin<Box<dyn Stream<Item = InboundEvent> + Send>>;

/// Static trait for the chat platform. Use this for type-safe call sites.
pub trait ChatPlatform: Send + Sync + 'static {
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    fn post_message(
        &self,
        channel: &ChannelId,
        response: OutboundResponse,
    ) -> impl std::future::Future<Output = Result<ThreadTs>> + Send;

    fn add_reaction(
        &self,
        channel: &ChannelId,
        ts: &ThreadTs,
        name: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn upload_and_wait(
        &self,
        bytes: Vec<u8>,
        filename: String,
    ) -> impl std::future::Future<Output = Result<UploadedFile>> + Send;

    fn users_profile_get(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<UserProfile>> + Send;

    fn users_info_is_admin(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<bool>> + Send;

    fn conversations_members(
        &self,
        channel: &ChannelId,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<MembersPage>> + Send;

    fn conversations_open(
        &self,
        user_id: &UserId,
    ) -> impl std::future::Future<Output = Result<ChannelId>> + Send;
}

/// Dynamic trait for runtime polymorphism (`Arc<dyn ChatPlatformDyn>`).
pub trait ChatPlatformDyn: Send + Sync + 'static {
    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn post_message<'a>(
        &'a self,
        channel: &'a ChannelId,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ThreadTs>> + Send + 'a>>;

    fn add_reaction<'a>(
        &'a self,
        channel: &'a ChannelId,
        ts: &'a ThreadTs,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

impl<T: ChatPlatform> ChatPlatformDyn for T {
    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(ChatPlatform::start(self))
    }

    fn post_message<'a>(
        &'a self,
        channel: &'a ChannelId,
        response: OutboundResponse,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<ThreadTs>> + Send + 'a>> {
        Box::pin(ChatPlatform::post_message(self, channel, response))
    }

    fn add_reaction<'a>(
        &'a self,
        channel: &'a ChannelId,
        ts: &'a ThreadTs,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(ChatPlatform::add_reaction(self, channel, ts, name))
    }
}
