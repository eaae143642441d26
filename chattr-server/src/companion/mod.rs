//! Companion responder: an automated participant that occasionally reacts
//! to or answers messages.
//!
//! Runs entirely on spawned tasks after the triggering message has been
//! broadcast. Nothing here can fail or delay the sender's own flow.

mod llm;
mod persona;

pub use llm::{ContextLine, GenerateFuture, OFFLINE_LINE, OpenAiCompatible, TextGenerator};
pub use persona::Persona;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::db::Db;
use crate::error::{ChatError, ChatResult};
use crate::model::{ChatMessage, MessageKind, Reaction, User, UserSummary};
use crate::pipeline::{self, SendRequest, Submission};
use crate::router::{Audience, OutboundEvent};
use crate::server::SharedState;

/// Posted when generation fails or times out.
pub const FALLBACK_LINE: &str = "ite, my brain is lagging rn. try me again in a sec. 🙄";

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Ignore,
    React(String),
    Reply { prompt: String },
}

pub struct Companion {
    persona: Persona,
    identity: UserSummary,
    generator: Arc<dyn TextGenerator>,
    timeout: Duration,
    prefix: String,
    mention: Regex,
    topics: Option<Regex>,
    rng: Mutex<StdRng>,
}

/// Find or create the companion's stored user. It is never registered as
/// a session, so it never shows as online.
pub fn ensure_identity(db: &Db, name: &str) -> rusqlite::Result<UserSummary> {
    if let Some(user) = db.find_user_by_username(name)? {
        return Ok(user.summary());
    }
    let user = User::new(name, None, None);
    db.upsert_user(&user)?;
    Ok(user.summary())
}

impl Companion {
    pub fn new(
        persona: Persona,
        identity: UserSummary,
        generator: Arc<dyn TextGenerator>,
        timeout: Duration,
    ) -> Result<Self> {
        Self::with_rng(persona, identity, generator, timeout, StdRng::from_entropy())
    }

    pub fn with_rng(
        persona: Persona,
        identity: UserSummary,
        generator: Arc<dyn TextGenerator>,
        timeout: Duration,
        rng: StdRng,
    ) -> Result<Self> {
        let mention = Regex::new(&format!(r"(?i)@?\b{}\b", regex::escape(&persona.name)))?;
        let topics = if persona.topics.is_empty() {
            None
        } else {
            let alternatives: Vec<String> = persona.topics.iter().map(|t| regex::escape(t)).collect();
            Some(Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))?)
        };
        Ok(Self {
            prefix: persona.command_prefix(),
            persona,
            identity,
            generator,
            timeout,
            mention,
            topics,
            rng: Mutex::new(rng),
        })
    }

    pub fn identity(&self) -> &UserSummary {
        &self.identity
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Decide how to respond to an accepted message.
    pub fn decide(&self, msg: &ChatMessage, rng: &mut impl Rng) -> Decision {
        let Some(author) = &msg.user else {
            return Decision::Ignore;
        };
        if author.id == self.identity.id {
            return Decision::Ignore;
        }

        if msg.kind == MessageKind::Text {
            let content = msg.content.trim();
            let prompt = |text: &str| Decision::Reply {
                prompt: format!("{}: {}", author.username, text),
            };

            if let Some(head) = content.get(..self.prefix.len())
                && head.to_lowercase() == self.prefix
            {
                let rest = content[self.prefix.len()..].trim();
                if rest.is_empty() || content[self.prefix.len()..].starts_with(char::is_whitespace) {
                    return prompt(if rest.is_empty() { content } else { rest });
                }
            }
            if self.mention.is_match(content) {
                return prompt(content);
            }
            if self.topics.as_ref().is_some_and(|t| t.is_match(content))
                && rng.gen_bool(self.persona.topic_chance)
            {
                return prompt(content);
            }
        }

        if rng.gen_bool(self.persona.reaction_chance)
            && let Some(emoji) = self.persona.emojis.choose(rng)
        {
            return Decision::React(emoji.clone());
        }
        Decision::Ignore
    }

    /// Generate a reply within the timeout. Failures are logged and replaced
    /// by a canned line; this never errors.
    pub async fn generate(&self, prompt: &str, context: &[ContextLine]) -> String {
        let call = self.generator.generate(&self.persona.system_prompt, prompt, context);
        let failure = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) if !text.trim().is_empty() => return text.trim().to_string(),
            Ok(Ok(_)) => ChatError::Dependency("empty reply".to_string()),
            Ok(Err(e)) => ChatError::Dependency(format!("{e:#}")),
            Err(_) => ChatError::Dependency(format!("timed out after {:?}", self.timeout)),
        };
        tracing::warn!(error = %failure, "Companion generation failed, using fallback");
        FALLBACK_LINE.to_string()
    }

    fn sample_delay(&self, (min, max): (u64, u64)) -> Duration {
        Duration::from_millis(self.rng.lock().gen_range(min..=max))
    }
}

/// Look at a freshly broadcast message and maybe schedule a response.
pub fn observe(state: &Arc<SharedState>, msg: &ChatMessage) {
    let Some(companion) = state.companion.as_ref() else {
        return;
    };
    let decision = {
        let mut rng = companion.rng.lock();
        companion.decide(msg, &mut *rng)
    };
    match decision {
        Decision::Ignore => {}
        Decision::React(emoji) => {
            let delay = companion.sample_delay(companion.persona.reaction_delay_ms);
            let state = Arc::clone(state);
            let message_id = msg.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                react(&state, &message_id, &emoji);
            });
        }
        Decision::Reply { prompt } => {
            let delay = companion.sample_delay(companion.persona.typing_delay_ms);
            let state = Arc::clone(state);
            let trigger_id = msg.id.clone();
            tokio::spawn(async move {
                reply(&state, &trigger_id, &prompt, delay).await;
            });
        }
    }
}

fn react(state: &SharedState, message_id: &str, emoji: &str) {
    let Some(companion) = state.companion.as_ref() else {
        return;
    };
    let me = &companion.identity.id;
    let result = state.with_db(|db| -> ChatResult<Option<Vec<Reaction>>> {
        if db.find_message_by_id(message_id, Utc::now())?.is_none() {
            return Ok(None);
        }
        let existing = db.reactions_for(message_id)?;
        if existing.iter().any(|r| &r.user.id == me && r.emoji == emoji) {
            return Ok(None);
        }
        Ok(Some(db.toggle_reaction(message_id, me, emoji)?))
    });
    match result {
        Ok(Some(reactions)) => {
            state.router.dispatch(
                Audience::Everyone,
                &OutboundEvent::ReactionUpdated { message_id: message_id.to_string(), reactions },
            );
        }
        Ok(None) => {}
        Err(e) => tracing::warn!(%message_id, "Companion reaction failed: {e}"),
    }
}

async fn reply(state: &SharedState, trigger_id: &str, prompt: &str, delay: Duration) {
    let Some(companion) = state.companion.as_ref() else {
        return;
    };
    let me = companion.identity.clone();
    let started = tokio::time::Instant::now();
    state.router.dispatch(
        Audience::Everyone,
        &OutboundEvent::UserTyping { username: me.username.clone(), avatar: me.avatar.clone() },
    );

    let context = recent_context(state, companion.persona.context_size);
    let text = companion.generate(prompt, &context).await;

    tokio::time::sleep(delay.saturating_sub(started.elapsed())).await;
    state.router.dispatch(
        Audience::Everyone,
        &OutboundEvent::UserStopTyping { username: me.username.clone() },
    );

    let content: String = text.chars().take(pipeline::MAX_CONTENT_CHARS).collect();
    let req = SendRequest { reply_to: Some(trigger_id.to_string()), ..SendRequest::text(content) };
    match pipeline::submit(state, &me, None, req) {
        Ok(Submission::Message(msg)) => {
            tracing::info!(message_id = %msg.id, "Companion replied");
            state.router.dispatch(Audience::Everyone, &OutboundEvent::MessageReceived(msg));
        }
        Ok(Submission::Effect(effect)) => {
            state.router.dispatch(Audience::Everyone, &OutboundEvent::TriggerGlobalEffect(effect));
        }
        Err(e) => tracing::warn!("Companion reply rejected: {e}"),
    }
}

fn recent_context(state: &SharedState, size: usize) -> Vec<ContextLine> {
    if size == 0 {
        return Vec::new();
    }
    match state.with_db(|db| pipeline::history(db, size, 1, Utc::now())) {
        Ok(messages) => messages
            .into_iter()
            .filter(|m| m.kind == MessageKind::Text)
            .map(|m| ContextLine {
                username: m.user.map(|u| u.username).unwrap_or_else(|| "someone".to_string()),
                content: m.content,
            })
            .collect(),
        Err(e) => {
            tracing::warn!("Companion context unavailable: {e}");
            Vec::new()
        }
    }
}
