//! Text generation behind a trait so the responder never depends on the
//! network directly.

use std::future::Future;
use std::pin::Pin;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::ServerConfig;

pub type GenerateFuture<'a> = Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;

/// One prior chat line handed to the generator.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextLine {
    pub username: String,
    pub content: String,
}

pub trait TextGenerator: Send + Sync {
    fn generate<'a>(
        &'a self,
        system: &'a str,
        prompt: &'a str,
        context: &'a [ContextLine],
    ) -> GenerateFuture<'a>;
}

/// Said when no API key is configured.
pub const OFFLINE_LINE: &str = "ite, i'm strictly offline because nobody gave me my brain keys. skill issue. 🙄";

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// Client for any OpenAI-compatible chat-completions endpoint.
pub struct OpenAiCompatible {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    name: String,
    referer: Option<String>,
}

impl OpenAiCompatible {
    pub fn new(url: &str, api_key: Option<String>, model: &str, name: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.to_string(),
            name: name.to_string(),
            referer: None,
        }
    }

    /// `name` is the persona's name, which a profile may override.
    pub fn from_config(config: &ServerConfig, name: &str) -> Self {
        let mut client = Self::new(
            &config.companion_api_url,
            config.companion_api_key.clone(),
            &config.companion_model,
            name,
        );
        client.referer = config.client_origin.clone();
        client
    }

    /// Remove a leaked `Name:` prefix and surrounding whitespace.
    pub fn clean_reply(&self, text: &str) -> String {
        let trimmed = text.trim();
        for label in [self.name.as_str(), "assistant"] {
            if let Some(head) = trimmed.get(..label.len())
                && head.eq_ignore_ascii_case(label)
                && let Some(rest) = trimmed[label.len()..].trim_start().strip_prefix(':')
            {
                return rest.trim().to_string();
            }
        }
        trimmed.to_string()
    }

    fn body(&self, system: &str, prompt: &str, context: &[ContextLine]) -> serde_json::Value {
        let mut messages = vec![serde_json::json!({"role": "system", "content": system})];
        for line in context {
            let role = if line.username.eq_ignore_ascii_case(&self.name) { "assistant" } else { "user" };
            messages.push(serde_json::json!({
                "role": role,
                "content": format!("{}: {}", line.username, line.content),
            }));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));
        serde_json::json!({ "model": self.model, "messages": messages })
    }

    async fn complete(&self, system: &str, prompt: &str, context: &[ContextLine]) -> Result<String> {
        let Some(api_key) = &self.api_key else {
            return Ok(OFFLINE_LINE.to_string());
        };

        let mut req = self
            .http
            .post(&self.url)
            .bearer_auth(api_key)
            .header("X-Title", "Chattr")
            .json(&self.body(system, prompt, context));
        if let Some(referer) = &self.referer {
            req = req.header("HTTP-Referer", referer);
        }

        let resp = req.send().await.context("Text generation request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Text generation error {status}: {body}");
        }

        let parsed: CompletionResponse = resp.json().await.context("Parse failed")?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .context("Empty completion")?;
        let cleaned = self.clean_reply(&text);
        if cleaned.is_empty() {
            anyhow::bail!("Empty completion");
        }
        Ok(cleaned)
    }
}

impl TextGenerator for OpenAiCompatible {
    fn generate<'a>(
        &'a self,
        system: &'a str,
        prompt: &'a str,
        context: &'a [ContextLine],
    ) -> GenerateFuture<'a> {
        Box::pin(self.complete(system, prompt, context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leaked_prefix() {
        let c = OpenAiCompatible::new("http://localhost", None, "m", "Kira");
        assert_eq!(c.clean_reply("Kira: hey"), "hey");
        assert_eq!(c.clean_reply("  ASSISTANT:  yo "), "yo");
        assert_eq!(c.clean_reply("kira is here"), "kira is here");
    }

    #[test]
    fn own_lines_are_assistant_turns() {
        let c = OpenAiCompatible::new("http://localhost", None, "m", "Kira");
        let context = vec![
            ContextLine { username: "alice".into(), content: "hi".into() },
            ContextLine { username: "Kira".into(), content: "sup".into() },
        ];
        let body = c.body("sys", "what's up", &context);
        let roles: Vec<_> = body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(roles, ["system", "user", "assistant", "user"]);
        assert_eq!(body["messages"][1]["content"], "alice: hi");
    }

    #[test]
    fn profile_name_drives_roles_and_cleanup() {
        let config = ServerConfig::default();
        let c = OpenAiCompatible::from_config(&config, "Nova");
        assert_eq!(c.clean_reply("Nova: sup"), "sup");
        assert_eq!(c.clean_reply("Kira: sup"), "Kira: sup");
        let context = vec![ContextLine { username: "nova".into(), content: "hey".into() }];
        assert_eq!(c.body("sys", "p", &context)["messages"][1]["role"], "assistant");
    }

    #[tokio::test]
    async fn missing_key_is_offline_without_network() {
        let c = OpenAiCompatible::new("http://127.0.0.1:9", Some("  ".into()), "m", "Kira");
        assert_eq!(c.generate("s", "p", &[]).await.unwrap(), OFFLINE_LINE);
    }

    #[tokio::test]
    async fn unreachable_endpoint_errors() {
        let c = OpenAiCompatible::new("http://127.0.0.1:9/v1", Some("key".into()), "m", "Kira");
        assert!(c.generate("s", "p", &[]).await.is_err());
    }
}
