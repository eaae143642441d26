//! Message pipeline: validate, sanitize, persist and enrich a chat message
//! before it may be broadcast. Also owns reaction toggles and the history
//! projection used on join.
//!
//! Persistence always completes before the caller broadcasts; nothing here
//! touches the router.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Deserialize;

use crate::db::Db;
use crate::error::{ChatError, ChatResult};
use crate::model::{ChatMessage, Message, MessageKind, Reaction, ReplyContext, UserSummary};
use crate::msgid;
use crate::router::GlobalEffect;
use crate::sanitize;
use crate::server::SharedState;

pub const MAX_CONTENT_CHARS: usize = 1000;
pub const MAX_FILE_NAME_CHARS: usize = 255;
pub const MAX_EMOJI_CHARS: usize = 16;
const UPLOAD_PREFIX: &str = "/uploads/";

/// Client payload for `send-message`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(alias = "fileUrl")]
    pub media_url: Option<String>,
    #[serde(alias = "fileName")]
    pub media_file_name: Option<String>,
    pub reply_to: Option<String>,
}

impl SendRequest {
    pub fn text(content: impl Into<String>) -> Self {
        Self { content: content.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// Persisted and enriched; broadcast as `message-received`.
    Message(ChatMessage),
    /// Reserved phrase; broadcast as `trigger-global-effect`, never stored.
    Effect(GlobalEffect),
}

/// (phrase, effect, duration ms)
const EFFECTS: &[(&str, &str, u64)] = &[
    ("let it snow", "snow", 15_000),
    ("lights out", "dark", 10_000),
    ("lights on", "light", 10_000),
    ("lockdown", "lockdown", 8_000),
    ("system scan", "scan", 8_000),
    ("spk.", "secret-sound", 5_000),
];

/// Match a reserved effect phrase (trimmed, case-insensitive, exact).
pub fn effect_for(content: &str, triggered_by: &str, rng: &mut impl Rng) -> Option<GlobalEffect> {
    let phrase = content.trim().to_lowercase();
    let (_, kind, duration) = EFFECTS.iter().find(|(p, _, _)| *p == phrase)?;
    let sound_index = (*kind == "secret-sound").then(|| rng.gen_range(1..=2));
    Some(GlobalEffect {
        kind: kind.to_string(),
        duration: *duration,
        triggered_by: triggered_by.to_string(),
        sound_index,
    })
}

/// Enforce the per-user send rate. The first check for a user this process
/// has not seen is seeded from the store so a restart keeps quotas.
pub fn check_rate(state: &SharedState, user_id: &str) -> ChatResult<()> {
    let settings = state.settings()?;
    if settings.rate_limit_messages == 0 {
        return Ok(());
    }
    let window = Duration::from_secs(settings.rate_limit_window_seconds as u64);
    if !state.limiter.is_tracking(user_id) {
        let since = Utc::now() - chrono::Duration::seconds(settings.rate_limit_window_seconds as i64);
        let prior = state.with_db(|db| db.count_recent_messages_by_user(user_id, since))?;
        state.limiter.seed(user_id, prior);
    }
    if !state.limiter.allow(user_id, settings.rate_limit_messages, window) {
        tracing::warn!(%user_id, "Rate limit exceeded");
        return Err(ChatError::policy("Rate limit exceeded. Please slow down."));
    }
    Ok(())
}

fn validate_shape(req: &SendRequest) -> ChatResult<()> {
    if req.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::validation(format!(
            "Message must be at most {MAX_CONTENT_CHARS} characters"
        )));
    }
    match req.kind {
        MessageKind::Text => {
            if req.content.trim().is_empty() {
                return Err(ChatError::validation("Message content is required"));
            }
        }
        kind => {
            let url_ok = req
                .media_url
                .as_deref()
                .is_some_and(|u| u.starts_with(UPLOAD_PREFIX) && !u.contains(".."));
            if !url_ok {
                return Err(ChatError::validation(format!(
                    "A valid media URL is required for {} messages",
                    kind.as_str()
                )));
            }
        }
    }
    if req
        .media_file_name
        .as_deref()
        .is_some_and(|n| n.chars().count() > MAX_FILE_NAME_CHARS)
    {
        return Err(ChatError::validation("File name is too long"));
    }
    if req.reply_to.as_deref().is_some_and(|id| !msgid::looks_valid(id)) {
        return Err(ChatError::validation("Invalid reply reference"));
    }
    Ok(())
}

/// Run a message through the pipeline on behalf of `author`.
///
/// `connection_id` is the sender's live session, if any; its activity
/// counters are bumped on success.
pub fn submit(
    state: &SharedState,
    author: &UserSummary,
    connection_id: Option<&str>,
    req: SendRequest,
) -> ChatResult<Submission> {
    validate_shape(&req)?;

    let settings = state.settings()?;
    match req.kind {
        MessageKind::Image if !settings.allow_images => {
            return Err(ChatError::policy("Image messages are disabled"));
        }
        MessageKind::Voice if !settings.allow_voice => {
            return Err(ChatError::policy("Voice messages are disabled"));
        }
        _ => {}
    }

    if req.kind == MessageKind::Text
        && let Some(effect) = effect_for(&req.content, &author.username, &mut rand::thread_rng())
    {
        tracing::info!(user_id = %author.id, effect = %effect.kind, "Effect triggered");
        return Ok(Submission::Effect(effect));
    }

    let now = Utc::now();
    let message = Message {
        id: msgid::generate(),
        author_id: author.id.clone(),
        content: sanitize::clean(&req.content),
        kind: req.kind,
        media_url: req.media_url.filter(|_| req.kind.carries_media()),
        media_file_name: req
            .media_file_name
            .filter(|_| req.kind.carries_media())
            .map(|n| sanitize::clean(&n)),
        reply_to_id: req.reply_to,
        is_pinned: false,
        created_at: now,
        expires_at: now + chrono::Duration::hours(settings.message_expiry_hours as i64),
    };

    let enriched = state.with_db(|db| -> ChatResult<ChatMessage> {
        db.create_message(&message)?;
        db.record_activity(&author.id, now)?;
        Ok(enrich_with_author(db, message, Some(author.clone()), now)?)
    })?;

    if let Some(conn_id) = connection_id {
        state.registry.touch(conn_id);
    }
    tracing::debug!(message_id = %enriched.id, user_id = %author.id, kind = enriched.kind.as_str(), "Message stored");
    Ok(Submission::Message(enriched))
}

/// Toggle `emoji` from `user_id` on a live message; returns the new list.
pub fn toggle_reaction(state: &SharedState, user_id: &str, message_id: &str, emoji: &str) -> ChatResult<Vec<Reaction>> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS || emoji.chars().any(char::is_control) {
        return Err(ChatError::validation("Invalid reaction"));
    }
    if !msgid::looks_valid(message_id) {
        return Err(ChatError::not_found("Message not found"));
    }
    state.with_db(|db| -> ChatResult<Vec<Reaction>> {
        if db.find_message_by_id(message_id, Utc::now())?.is_none() {
            return Err(ChatError::not_found("Message not found"));
        }
        Ok(db.toggle_reaction(message_id, user_id, emoji)?)
    })
}

/// Attach author, reply context and reactions to a stored message.
pub fn enrich(db: &Db, message: Message, now: DateTime<Utc>) -> rusqlite::Result<ChatMessage> {
    let author = db.find_user(&message.author_id)?.map(|u| u.summary());
    enrich_with_author(db, message, author, now)
}

fn enrich_with_author(
    db: &Db,
    message: Message,
    author: Option<UserSummary>,
    now: DateTime<Utc>,
) -> rusqlite::Result<ChatMessage> {
    let reply_to = match &message.reply_to_id {
        Some(id) => reply_context(db, id, now)?,
        None => None,
    };
    let reactions = db.reactions_for(&message.id)?;
    Ok(ChatMessage {
        id: message.id,
        content: message.content,
        kind: message.kind,
        user: author,
        media_url: message.media_url,
        media_file_name: message.media_file_name,
        reply_to,
        is_pinned: message.is_pinned,
        created_at: message.created_at,
        expires_at: message.expires_at,
        reactions,
    })
}

/// One level deep only; a dangling reference yields `None`.
fn reply_context(db: &Db, id: &str, now: DateTime<Utc>) -> rusqlite::Result<Option<ReplyContext>> {
    let Some(target) = db.find_message_by_id(id, now)? else {
        return Ok(None);
    };
    let user = db.find_user(&target.author_id)?.map(|u| u.summary());
    Ok(Some(ReplyContext {
        id: target.id,
        content: target.content,
        kind: target.kind,
        user,
    }))
}

/// Newest `limit` live messages (one page), oldest first, enriched.
pub fn history(db: &Db, limit: usize, page: usize, now: DateTime<Utc>) -> rusqlite::Result<Vec<ChatMessage>> {
    db.recent_messages(limit, page, now)?
        .into_iter()
        .map(|m| enrich(db, m, now))
        .collect()
}

pub fn pinned(db: &Db, limit: usize, now: DateTime<Utc>) -> rusqlite::Result<Vec<ChatMessage>> {
    db.pinned_messages(limit, now)?
        .into_iter()
        .map(|m| enrich(db, m, now))
        .collect()
}
