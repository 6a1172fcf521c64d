//! Slack adapter: socket-mode event ingestion and the `ChatPlatform`
//! surface the rest of the crate depends on, built on `slack-morphism`.

use super::traits::{Block, InboundEvent, InboundStream, MembersPage, OutboundResponse, UploadedFile, MAX_BLOCKS_PER_MESSAGE};
use crate::error::{MessagingError, Result};
use crate::profile::UserProfile;
use crate::{ChannelId, ThreadTs, UserId};
use slack_morphism::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const FILE_PROCESSING_MAX_ATTEMPTS: u32 = 10;
const FILE_PROCESSING_POLL_INTERVAL: Duration = Duration::from_secs(1);
const HTTP_DEADLINE: Duration = Duration::from_secs(30);

pub struct SlackClient {
    client: Arc<slack_morphism::SlackClient<SlackClientHyperConnector>>,
    bot_token: SlackApiToken,
    app_token: SlackApiToken,
}

impl SlackClient {
    pub fn new(bot_token: &str, app_token: &str) -> Self {
        let connector = SlackClientHyperConnector::new().expect("failed to build slack http connector");
        let client = Arc::new(slack_morphism::SlackClient::new(connector));
        Self {
            client,
            bot_token: SlackApiToken::new(bot_token.into()),
            app_token: SlackApiToken::new(app_token.into()),
        }
    }

    fn session(&self) -> slack_morphism::SlackClientSession<'_, SlackClientHyperConnector> {
        self.client.open_session(&self.bot_token)
    }

    /// Send one [`OutboundResponse`], splitting rich messages that exceed
    /// the platform's per-message block cap into a root + threaded
    /// continuation.
    pub async fn respond(&self, channel: &ChannelId, response: OutboundResponse) -> Result<ThreadTs> {
        let session = self.session();
        match response {
            OutboundResponse::Text(text) => self.post_text(&session, channel, &text, None).await,
            OutboundResponse::ThreadReply { thread_ts, text } => {
                self.post_text(&session, channel, &text, Some(&thread_ts)).await
            }
            OutboundResponse::RichMessage { text, blocks } => {
                self.post_rich(&session, channel, &text, blocks).await
            }
            OutboundResponse::UploadFile { bytes, filename, title, channel: target } => {
                let uploaded = self.upload_and_wait(bytes, filename).await?;
                let dest = target.unwrap_or_else(|| channel.clone());
                self.post_rich(
                    &session,
                    &dest,
                    &title,
                    vec![Block::ImageByFileId { file_id: uploaded.file_id, alt_text: title }],
                )
                .await
            }
            OutboundResponse::Reaction { thread_ts, name } => {
                self.add_reaction(channel, &thread_ts, &name).await?;
                Ok(thread_ts)
            }
            OutboundResponse::RemoveReaction { thread_ts, name } => {
                let req = SlackApiReactionsRemoveRequest::new(name.into())
                    .with_channel(SlackChannelId(channel.to_string()))
                    .with_timestamp(SlackTs(thread_ts.to_string()));
                match session.reactions_remove(&req).await {
                    Ok(_) => Ok(thread_ts),
                    // Treat "no reaction" as success: nothing left to remove.
                    Err(e) if e.to_string().contains("no_reaction") => Ok(thread_ts),
                    Err(e) => Err(MessagingError::UpstreamTransient(e.to_string()).into()),
                }
            }
            OutboundResponse::Ephemeral { user_id, text } => {
                let req = SlackApiChatPostEphemeralRequest::new(
                    SlackChannelId(channel.to_string()),
                    SlackUserId(user_id.to_string()),
                    SlackMessageContent::new().with_text(text),
                );
                session
                    .chat_post_ephemeral(&req)
                    .await
                    .map(|_| ThreadTs::from(""))
                    .map_err(|e| MessagingError::UpstreamTransient(e.to_string()).into())
            }
            OutboundResponse::ScheduledMessage { post_at, text } => {
                let req = SlackApiChatScheduleMessageRequest::new(
                    SlackChannelId(channel.to_string()),
                    text,
                    post_at.timestamp() as u64,
                );
                session
                    .chat_schedule_message(&req)
                    .await
                    .map(|resp| ThreadTs::from(resp.message_ts.to_string().as_str()))
                    .map_err(|e| MessagingError::UpstreamTransient(e.to_string()).into())
            }
        }
    }

    async fn post_text(
        &self,
        session: &slack_morphism::SlackClientSession<'_, SlackClientHyperConnector>,
        channel: &ChannelId,
        text: &str,
        thread_ts: Option<&ThreadTs>,
    ) -> Result<ThreadTs> {
        let content = SlackMessageContent::new().with_text(text.to_string());
        let mut req = SlackApiChatPostMessageRequest::new(SlackChannelId(channel.to_string()), content);
        if let Some(ts) = thread_ts {
            req = req.with_thread_ts(SlackTs(ts.to_string()));
        }
        let resp = tokio::time::timeout(HTTP_DEADLINE, session.chat_post_message(&req))
            .await
            .map_err(|_| MessagingError::UpstreamTransient("post_message timed out".into()))?
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(ThreadTs::from(resp.ts.to_string().as_str()))
    }

    /// Post a structured rich message, splitting at [`MAX_BLOCKS_PER_MESSAGE`]
    /// into a root message plus threaded continuations.
    async fn post_rich(
        &self,
        session: &slack_morphism::SlackClientSession<'_, SlackClientHyperConnector>,
        channel: &ChannelId,
        fallback_text: &str,
        blocks: Vec<Block>,
    ) -> Result<ThreadTs> {
        let slack_blocks: Vec<SlackBlock> = blocks.iter().map(render_block).collect();
        let mut chunks = slack_blocks.chunks(MAX_BLOCKS_PER_MESSAGE);
        let root_chunk = chunks.next().unwrap_or(&[]);

        let content = SlackMessageContent::new()
            .with_text(fallback_text.to_string())
            .with_blocks(root_chunk.to_vec());
        let req = SlackApiChatPostMessageRequest::new(SlackChannelId(channel.to_string()), content);
        let resp = tokio::time::timeout(HTTP_DEADLINE, session.chat_post_message(&req))
            .await
            .map_err(|_| MessagingError::UpstreamTransient("post_message timed out".into()))?
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        let root_ts = ThreadTs::from(resp.ts.to_string().as_str());

        for chunk in chunks {
            let continuation = SlackMessageContent::new()
                .with_text(fallback_text.to_string())
                .with_blocks(chunk.to_vec());
            let mut cont_req =
                SlackApiChatPostMessageRequest::new(SlackChannelId(channel.to_string()), continuation);
            cont_req = cont_req.with_thread_ts(SlackTs(root_ts.to_string()));
            if let Err(e) = session.chat_post_message(&cont_req).await {
                // Partial post: the root succeeded, so the thread is still tracked.
                tracing::warn!(%e, "threaded continuation post failed, root remains tracked");
            }
        }

        Ok(root_ts)
    }

    /// Upload a file privately and poll `files_info` until a usable
    /// MIME type is reported (bounded by `FILE_PROCESSING_MAX_ATTEMPTS`, ~10s).
    pub async fn upload_and_wait(&self, bytes: Vec<u8>, filename: String) -> Result<UploadedFile> {
        let session = self.session();

        let url_req = SlackApiFilesGetUploadUrlExternalRequest::new(filename.clone(), bytes.len() as u64);
        let url_resp = session
            .files_get_upload_url_external(&url_req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        session
            .files_upload_via_url(&url_resp.upload_url, bytes)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        let complete_req = SlackApiFilesCompleteUploadExternalRequest::new(vec![
            SlackApiFilesCompleteUploadExternalFile {
                id: url_resp.file_id.clone(),
                title: Some(filename),
            },
        ]);
        session
            .files_complete_upload_external(&complete_req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        for attempt in 0..FILE_PROCESSING_MAX_ATTEMPTS {
            let info = session
                .files_info(&SlackApiFilesInfoRequest::new(url_resp.file_id.clone()))
                .await
                .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
            if let Some(mimetype) = info.file.mimetype.clone() {
                if !mimetype.is_empty() {
                    return Ok(UploadedFile {
                        file_id: url_resp.file_id.to_string(),
                        mimetype: Some(mimetype),
                        permalink: info.file.permalink.map(|p| p.to_string()),
                    });
                }
            }
            tracing::debug!(attempt, file_id = %url_resp.file_id, "waiting for file processing");
            tokio::time::sleep(FILE_PROCESSING_POLL_INTERVAL).await;
        }

        Err(MessagingError::UpstreamTransient("file processing did not complete in time".into()).into())
    }

    pub async fn add_reaction(&self, channel: &ChannelId, ts: &ThreadTs, name: &str) -> Result<()> {
        let session = self.session();
        let req = SlackApiReactionsAddRequest::new(
            SlackChannelId(channel.to_string()),
            SlackTs(ts.to_string()),
            name.into(),
        );
        match session.reactions_add(&req).await {
            Ok(_) => Ok(()),
            // Already-reacted is treated as success.
            Err(e) if e.to_string().contains("already_reacted") => Ok(()),
            Err(e) => Err(MessagingError::UpstreamTransient(e.to_string()).into()),
        }
    }

    pub async fn users_profile_get(&self, user_id: &UserId) -> Result<UserProfile> {
        let session = self.session();
        let req = SlackApiUsersProfileGetRequest::new().with_user(SlackUserId(user_id.to_string()));
        let resp = session
            .users_profile_get(&req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        let info = session
            .users_info(&SlackApiUsersInfoRequest::new(SlackUserId(user_id.to_string())))
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        let profile = resp.profile;
        let mut photo_urls = HashMap::new();
        if let Some(url) = profile.image_512.clone() {
            photo_urls.insert("512".to_string(), url);
        }
        if let Some(url) = profile.image_192.clone() {
            photo_urls.insert("192".to_string(), url);
        }

        Ok(UserProfile {
            display_name: profile.display_name.clone().unwrap_or_default(),
            real_name: profile.real_name.clone().unwrap_or_default(),
            title: profile.title.clone(),
            timezone: info.user.tz.clone(),
            timezone_offset_seconds: info.user.tz_offset.unwrap_or(0) as i32,
            photo_urls,
            is_deleted: info.user.deleted.unwrap_or(false),
            is_bot: info.user.is_bot.unwrap_or(false),
            custom_fields: HashMap::new(),
        })
    }

    pub async fn users_info_is_admin(&self, user_id: &UserId) -> Result<bool> {
        let session = self.session();
        let info = session
            .users_info(&SlackApiUsersInfoRequest::new(SlackUserId(user_id.to_string())))
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(info.user.is_admin.unwrap_or(false) || info.user.is_owner.unwrap_or(false))
    }

    pub async fn conversations_members(
        &self,
        channel: &ChannelId,
        cursor: Option<&str>,
    ) -> Result<MembersPage> {
        let session = self.session();
        let mut req = SlackApiConversationsMembersRequest::new(SlackChannelId(channel.to_string()));
        if let Some(c) = cursor {
            req = req.with_cursor(SlackCursorId(c.to_string()));
        }
        let resp = session
            .conversations_members(&req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(MembersPage {
            members: resp.members.into_iter().map(|m| UserId::from(m.to_string().as_str())).collect(),
            next_cursor: resp.response_metadata.and_then(|m| m.next_cursor).map(|c| c.to_string()),
        })
    }

    pub async fn conversations_open(&self, user_id: &UserId) -> Result<ChannelId> {
        let session = self.session();
        let req = SlackApiConversationsOpenRequest::new().with_users(vec![SlackUserId(user_id.to_string())]);
        let resp = session
            .conversations_open(&req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(ChannelId::from(resp.channel.id.to_string().as_str()))
    }

    pub async fn emoji_list(&self) -> Result<HashMap<String, String>> {
        let session = self.session();
        let resp = session
            .emoji_list(&SlackApiEmojiListRequest::new())
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(resp.emoji)
    }

    pub async fn canvas_create(&self, channel: &ChannelId, markdown: &str) -> Result<String> {
        let session = self.session();
        let req = SlackApiConversationsCanvasesCreateRequest::new(SlackChannelId(channel.to_string()))
            .with_document_content(markdown.to_string());
        let resp = session
            .conversations_canvases_create(&req)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;
        Ok(resp.canvas_id)
    }

    pub async fn canvas_edit(&self, canvas_id: &str, markdown: &str) -> Result<()> {
        let session = self.session();
        let req = SlackApiCanvasesEditRequest::new(canvas_id.to_string())
            .with_replace_document_content(markdown.to_string());
        match session.canvases_edit(&req).await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("canvas_not_found") => {
                Err(MessagingError::UpstreamRefused("canvas_not_found".into()).into())
            }
            Err(e) => Err(MessagingError::UpstreamTransient(e.to_string()).into()),
        }
    }

    pub async fn canvas_delete(&self, canvas_id: &str) -> Result<()> {
        let session = self.session();
        session
            .canvases_delete(&SlackApiCanvasesDeleteRequest::new(canvas_id.to_string()))
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()).into())
    }

    pub async fn set_topic(&self, channel: &ChannelId, topic: &str) -> Result<()> {
        let session = self.session();
        session
            .conversations_set_topic(&SlackApiConversationsSetTopicRequest::new(
                SlackChannelId(channel.to_string()),
                topic.to_string(),
            ))
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()).into())
    }

    pub async fn set_purpose(&self, channel: &ChannelId, purpose: &str) -> Result<()> {
        let session = self.session();
        session
            .conversations_set_purpose(&SlackApiConversationsSetPurposeRequest::new(
                SlackChannelId(channel.to_string()),
                purpose.to_string(),
            ))
            .await
            .map(|_| ())
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()).into())
    }

    /// Start the socket-mode event loop and return a stream of classified inbound events.
    pub async fn start_socket_mode(&self) -> Result<InboundStream> {
        let (tx, rx) = tokio::sync::mpsc::channel::<InboundEvent>(256);

        let push_events_tx = tx.clone();
        let callbacks = SlackSocketModeListenerCallbacks::new()
            .with_push_events(move |event: SlackPushEventCallback, _client, _states| {
                let tx = push_events_tx.clone();
                async move {
                    if let Some(inbound) = classify_push_event(event) {
                        let _ = tx.send(inbound).await;
                    }
                }
            })
            .with_command_events(move |event: SlackCommandEvent, _client, _states| {
                let tx = tx.clone();
                async move {
                    let inbound = InboundEvent::SlashCommand {
                        command: event.command.to_string(),
                        text: event.text.unwrap_or_default(),
                        user_id: UserId::from(event.user_id.to_string().as_str()),
                        channel_id: ChannelId::from(event.channel_id.to_string().as_str()),
                    };
                    let _ = tx.send(inbound).await;
                    SlackCommandEventResponse::new(SlackMessageContent::new().with_text("".into()))
                }
            });

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(self.client.clone())
                .with_error_handler(|err, _client, _states| {
                    tracing::error!(%err, "slack socket-mode error");
                    std::ops::ControlFlow::Continue(())
                }),
        );
        let socket_mode_listener =
            SlackClientSocketModeListener::new(&SlackClientSocketModeConfig::new(), listener_environment, callbacks);

        socket_mode_listener
            .listen_for(&self.app_token)
            .await
            .map_err(|e| MessagingError::UpstreamTransient(e.to_string()))?;

        tokio::spawn(async move {
            socket_mode_listener.serve().await;
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx)))
    }
}

impl super::traits::ChatPlatform for SlackClient {
    async fn start(&self) -> Result<InboundStream> {
        self.start_socket_mode().await
    }

    async fn post_message(&self, channel: &ChannelId, response: OutboundResponse) -> Result<ThreadTs> {
        self.respond(channel, response).await
    }

    async fn add_reaction(&self, channel: &ChannelId, ts: &ThreadTs, name: &str) -> Result<()> {
        SlackClient::add_reaction(self, channel, ts, name).await
    }

    async fn upload_and_wait(&self, bytes: Vec<u8>, filename: String) -> Result<UploadedFile> {
        SlackClient::upload_and_wait(self, bytes, filename).await
    }

    async fn users_profile_get(&self, user_id: &UserId) -> Result<UserProfile> {
        SlackClient::users_profile_get(self, user_id).await
    }

    async fn users_info_is_admin(&self, user_id: &UserId) -> Result<bool> {
        SlackClient::users_info_is_admin(self, user_id).await
    }

    async fn conversations_members(&self, channel: &ChannelId, cursor: Option<&str>) -> Result<MembersPage> {
        SlackClient::conversations_members(self, channel, cursor).await
    }

    async fn conversations_open(&self, user_id: &UserId) -> Result<ChannelId> {
        SlackClient::conversations_open(self, user_id).await
    }
}

fn classify_push_event(event: SlackPushEventCallback) -> Option<InboundEvent> {
    match event.event {
        SlackEventCallbackBody::AppMention(m) => Some(InboundEvent::AppMention {
            channel_id: ChannelId::from(m.channel.to_string().as_str()),
            ts: ThreadTs::from(m.origin.ts.to_string().as_str()),
            thread_ts: m.origin.thread_ts.map(|t| ThreadTs::from(t.to_string().as_str())),
            user_id: m.user.map(|u| UserId::from(u.to_string().as_str())).unwrap_or_else(|| UserId::from("")),
            text: m.content.text.unwrap_or_default(),
        }),
        SlackEventCallbackBody::Message(m) => {
            let user_id = m.sender.user.map(|u| UserId::from(u.to_string().as_str()))?;
            let text = m.content.and_then(|c| c.text).unwrap_or_default();
            let ts = ThreadTs::from(m.origin.ts.to_string().as_str());
            match m.origin.channel_type.as_deref() {
                Some("im") => Some(InboundEvent::DirectMessage { user_id, text }),
                _ => Some(InboundEvent::ChannelMessage {
                    channel_id: m.origin.channel.map(|c| ChannelId::from(c.to_string().as_str()))?,
                    ts,
                    thread_ts: m.origin.thread_ts.map(|t| ThreadTs::from(t.to_string().as_str())),
                    user_id,
                    text,
                }),
            }
        }
        SlackEventCallbackBody::MemberJoinedChannel(m) => Some(InboundEvent::MemberJoinedChannel {
            channel_id: ChannelId::from(m.channel.to_string().as_str()),
            user_id: UserId::from(m.user.to_string().as_str()),
        }),
        _ => None,
    }
}

fn render_block(block: &Block) -> SlackBlock {
    match block {
        Block::Header(text) => SlackBlock::Header(SlackHeaderBlock::new(pt(text))),
        Block::Section(text) => SlackBlock::Section(SlackSectionBlock::new().with_text(md(text))),
        Block::Fields(fields) => SlackBlock::Section(
            SlackSectionBlock::new().with_fields(
                fields
                    .iter()
                    .map(|(k, v)| md(&format!("*{k}*\n{v}")))
                    .collect(),
            ),
        ),
        Block::Context(text) => SlackBlock::Context(SlackContextBlock::new(vec![md(text).into()])),
        Block::Divider => SlackBlock::Divider(SlackDividerBlock::new()),
        Block::ImageByFileId { file_id, alt_text } => {
            SlackBlock::Image(SlackImageBlock::new(file_id.clone().into(), alt_text.clone()))
        }
        Block::Actions(buttons) => SlackBlock::Actions(SlackActionsBlock::new(
            buttons
                .iter()
                .map(|(label, action_id)| {
                    SlackBlockButtonElement::new(action_id.clone().into(), pt(label)).into()
                })
                .collect(),
        )),
    }
}

fn pt(text: &str) -> SlackBlockPlainTextOnly {
    SlackBlockPlainTextOnly::new(text.to_string())
}

fn md(text: &str) -> SlackBlockMarkDownText {
    SlackBlockMarkDownText::new(text.to_string())
}
