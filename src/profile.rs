//! Profile & membership resolver.
//!
//! Caches platform user profiles with bounded size and TTL (moka),
//! consults a persisted admin list before falling back to a
//! platform-level admin flag, and paginates membership listing.

use crate::datastore::Datastore;
use crate::error::{ProfileError, Result};
use crate::messaging::traits::ChatPlatform;
use crate::UserId;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const CACHE_MAX_ENTRIES: u64 = 1000;
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: String,
    pub real_name: String,
    pub title: Option<String>,
    pub timezone: Option<String>,
    pub timezone_offset_seconds: i32,
    pub photo_urls: HashMap<String, String>,
    pub is_deleted: bool,
    pub is_bot: bool,
    pub custom_fields: HashMap<String, String>,
}

impl UserProfile {
    /// Preferred display name: real name if set, else display name.
    pub fn preferred_name(&self) -> &str {
        if !self.real_name.trim().is_empty() {
            &self.real_name
        } else {
            &self.display_name
        }
    }
}

/// Resolves and caches user profiles and channel membership.
pub struct ProfileResolver<P> {
    platform: Arc<P>,
    datastore: Arc<Datastore>,
    cache: Cache<UserId, UserProfile>,
}

impl<P: ChatPlatform> ProfileResolver<P> {
    pub fn new(platform: Arc<P>, datastore: Arc<Datastore>) -> Self {
        let cache = Cache::builder()
            .max_capacity(CACHE_MAX_ENTRIES)
            .time_to_live(CACHE_TTL)
            .build();
        Self {
            platform,
            datastore,
            cache,
        }
    }

    pub async fn get_profile(&self, user_id: &UserId) -> Result<UserProfile> {
        if let Some(profile) = self.cache.get(user_id).await {
            return Ok(profile);
        }
        let profile = self
            .platform
            .users_profile_get(user_id)
            .await
            .map_err(|e| ProfileError::UpstreamTransient(e.to_string()))?;
        self.cache.insert(user_id.clone(), profile.clone()).await;
        Ok(profile)
    }

    pub async fn get_username(&self, user_id: &UserId) -> Result<String> {
        let profile = self.get_profile(user_id).await?;
        Ok(profile.preferred_name().to_string())
    }

    /// Admin check: persisted admin list first, then platform admin flag.
    pub async fn is_admin(&self, user_id: &UserId) -> Result<bool> {
        if self.datastore.is_admin(user_id).await? {
            return Ok(true);
        }
        self.platform
            .users_info_is_admin(user_id)
            .await
            .map_err(|e| ProfileError::UpstreamTransient(e.to_string()).into())
    }

    /// Lists all members of `channel_id`, paginating until exhausted.
    pub async fn list_channel_members(&self, channel_id: &crate::ChannelId) -> Result<Vec<UserId>> {
        let mut members = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .platform
                .conversations_members(channel_id, cursor.as_deref())
                .await
                .map_err(|e| ProfileError::UpstreamTransient(e.to_string()))?;
            members.extend(page.members);
            match page.next_cursor {
                Some(c) if !c.is_empty() => cursor = Some(c),
                _ => break,
            }
        }
        Ok(members)
    }

    pub async fn invalidate(&self, user_id: &UserId) {
        self.cache.invalidate(user_id).await;
    }
}
