//! Companion persona: prompt, triggers and timing. Overridable from TOML.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const DEFAULT_EMOJIS: &[&str] = &["🔥", "😂", "💀", "👀", "💯", "❤️", "🤔"];

const DEFAULT_TOPICS: &[&str] = &[
    "rust", "code", "coding", "bug", "linux", "server", "music", "movie", "game", "anime",
    "food", "ai",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Persona {
    /// Handle used for mentions, the command prefix and the stored identity.
    pub name: String,
    pub system_prompt: String,
    pub emojis: Vec<String>,
    /// Keywords that may draw an unprompted reply.
    pub topics: Vec<String>,
    /// Probability of reacting to an ordinary message.
    pub reaction_chance: f64,
    /// Probability of replying to a topic match.
    pub topic_chance: f64,
    /// Recent messages passed as generation context.
    pub context_size: usize,
    pub typing_delay_ms: (u64, u64),
    pub reaction_delay_ms: (u64, u64),
}

impl Default for Persona {
    fn default() -> Self {
        Self::for_name("Kira")
    }
}

impl Persona {
    pub fn for_name(name: &str) -> Self {
        Self {
            name: name.to_string(),
            system_prompt: default_prompt(name),
            emojis: DEFAULT_EMOJIS.iter().map(|s| s.to_string()).collect(),
            topics: DEFAULT_TOPICS.iter().map(|s| s.to_string()).collect(),
            reaction_chance: 0.05,
            topic_chance: 0.02,
            context_size: 10,
            typing_delay_ms: (1500, 4000),
            reaction_delay_ms: (1000, 3000),
        }
    }

    /// Load a profile; fields absent from the file keep their defaults and
    /// the configured name wins unless the file sets one.
    pub fn load(path: impl AsRef<Path>, name: &str) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read companion profile {}", path.display()))?;
        Self::from_toml(&text, name)
    }

    pub fn from_toml(text: &str, name: &str) -> Result<Self> {
        let raw: toml::Table = toml::from_str(text).context("Invalid companion profile")?;
        let mut persona: Persona = raw.clone().try_into().context("Invalid companion profile")?;
        if !raw.contains_key("name") {
            persona.name = name.to_string();
        }
        if !raw.contains_key("system_prompt") {
            persona.system_prompt = default_prompt(&persona.name);
        }
        persona.validate()?;
        Ok(persona)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Companion name must not be empty");
        }
        for (label, p) in [("reaction_chance", self.reaction_chance), ("topic_chance", self.topic_chance)] {
            if !(0.0..=1.0).contains(&p) {
                anyhow::bail!("{label} must be between 0 and 1, got {p}");
            }
        }
        if self.emojis.is_empty() {
            anyhow::bail!("Companion needs at least one reaction emoji");
        }
        if self.typing_delay_ms.0 > self.typing_delay_ms.1 || self.reaction_delay_ms.0 > self.reaction_delay_ms.1 {
            anyhow::bail!("Delay ranges must be (min, max)");
        }
        Ok(())
    }

    /// `/name`, lowercased.
    pub fn command_prefix(&self) -> String {
        format!("/{}", self.name.to_lowercase())
    }
}

fn default_prompt(name: &str) -> String {
    format!(
        "You are {name}, a regular in a public group chat called Chattr. \
You are witty, relaxed and sharp. Keep replies short, usually one or two sentences, \
lowercase and casual for small talk. When someone asks a real technical question, \
answer it precisely. Stay in character, never describe yourself as an AI, \
and never prefix your reply with your own name."
    )
}
