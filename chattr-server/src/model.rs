//! Persistent records and the projections sent to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted chat identity. Outlives any single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub ip: Option<String>,
    /// Live connection currently bound to this user, if any.
    pub connection_id: Option<String>,
    pub is_banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
    pub ban_reason: Option<String>,
    pub message_count: u64,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl User {
    pub fn new(username: &str, avatar: Option<String>, ip: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: crate::msgid::generate(),
            username: username.to_string(),
            avatar,
            ip,
            connection_id: None,
            is_banned: false,
            banned_until: None,
            ban_reason: None,
            message_count: 0,
            joined_at: now,
            last_active: now,
        }
    }

    /// A ban is in force when flagged and either permanent or not yet expired.
    pub fn ban_active(&self, now: DateTime<Utc>) -> bool {
        self.is_banned && self.banned_until.is_none_or(|until| until > now)
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

/// Minimal author projection attached to messages and presence events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Voice,
    File,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Image => "image",
            MessageKind::Voice => "voice",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "image" => Some(MessageKind::Image),
            "voice" => Some(MessageKind::Voice),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }

    pub fn carries_media(self) -> bool {
        !matches!(self, MessageKind::Text)
    }
}

/// A stored message. `reply_to_id` is a bare id, resolved at broadcast time.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub author_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub media_file_name: Option<String>,
    pub reply_to_id: Option<String>,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// One reaction as clients see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reaction {
    pub emoji: String,
    pub user: ReactionUser,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReactionUser {
    pub id: String,
    pub username: String,
}

/// Projection of the message being replied to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyContext {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub user: Option<UserSummary>,
}

/// A message enriched with its author, reply context and reactions;
/// this is the `message-received` payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub user: Option<UserSummary>,
    pub media_url: Option<String>,
    pub media_file_name: Option<String>,
    pub reply_to: Option<ReplyContext>,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reactions: Vec<Reaction>,
}

/// Runtime policy, editable by admins, read on every send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    pub message_expiry_hours: u32,
    #[serde(rename = "maxFileSizeMB")]
    pub max_file_size_mb: u32,
    pub allow_images: bool,
    pub allow_voice: bool,
    pub allow_stickers: bool,
    pub max_users_online: u32,
    pub rate_limit_messages: u32,
    pub rate_limit_window_seconds: u32,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            message_expiry_hours: 24,
            max_file_size_mb: 10,
            allow_images: true,
            allow_voice: true,
            allow_stickers: true,
            max_users_online: 100,
            rate_limit_messages: 10,
            rate_limit_window_seconds: 60,
        }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=168).contains(&self.message_expiry_hours) {
            return Err("messageExpiryHours must be between 1 and 168".to_string());
        }
        if !(1..=100).contains(&self.max_file_size_mb) {
            return Err("maxFileSizeMB must be between 1 and 100".to_string());
        }
        if self.max_users_online == 0 {
            return Err("maxUsersOnline must be at least 1".to_string());
        }
        if self.rate_limit_window_seconds == 0 {
            return Err("rateLimitWindowSeconds must be at least 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedIp {
    pub ip: String,
    pub reason: Option<String>,
    pub blocked_at: DateTime<Utc>,
}
