//! Inbound frame decoding: `{"event": name, "data": payload}`.

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::pipeline::SendRequest;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    /// Grants admin observer privileges when it matches the configured token.
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRequest {
    pub message_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Join(JoinRequest),
    SendMessage(SendRequest),
    ToggleReaction(ReactionRequest),
    TypingStart,
    TypingStop,
    AdminAction(serde_json::Value),
    /// Undecodable frame; reported back to the client.
    Malformed(String),
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: serde_json::Value,
}

fn payload<T: DeserializeOwned>(event: &str, data: serde_json::Value) -> Result<T, String> {
    serde_json::from_value(data).map_err(|e| format!("Invalid {event} payload: {e}"))
}

impl InboundEvent {
    pub fn parse(text: &str) -> Self {
        let env: Envelope = match serde_json::from_str(text) {
            Ok(env) => env,
            Err(e) => return InboundEvent::Malformed(format!("Invalid frame: {e}")),
        };
        let decoded = match env.event.as_str() {
            "join" | "join-chat" => payload("join", env.data).map(InboundEvent::Join),
            "send-message" | "new-message" => payload("send-message", env.data).map(InboundEvent::SendMessage),
            "toggle-reaction" => payload("toggle-reaction", env.data).map(InboundEvent::ToggleReaction),
            "typing-start" => Ok(InboundEvent::TypingStart),
            "typing-stop" => Ok(InboundEvent::TypingStop),
            "admin-action" => Ok(InboundEvent::AdminAction(env.data)),
            other => Err(format!("Unknown event: {other}")),
        };
        decoded.unwrap_or_else(InboundEvent::Malformed)
    }

    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Join(_) => "join",
            InboundEvent::SendMessage(_) => "send-message",
            InboundEvent::ToggleReaction(_) => "toggle-reaction",
            InboundEvent::TypingStart => "typing-start",
            InboundEvent::TypingStop => "typing-stop",
            InboundEvent::AdminAction(_) => "admin-action",
            InboundEvent::Malformed(_) => "malformed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageKind;

    #[test]
    fn parses_events_and_aliases() {
        match InboundEvent::parse(r#"{"event":"join-chat","data":{"username":"alice","avatar":"/a.png"}}"#) {
            InboundEvent::Join(j) => {
                assert_eq!(j.username, "alice");
                assert_eq!(j.avatar.as_deref(), Some("/a.png"));
                assert!(j.admin_token.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }

        match InboundEvent::parse(
            r#"{"event":"new-message","data":{"content":"","type":"image","fileUrl":"/uploads/x.png","replyTo":"01ARZ3NDEKTSV4RRFFQ69G5FAV"}}"#,
        ) {
            InboundEvent::SendMessage(m) => {
                assert_eq!(m.kind, MessageKind::Image);
                assert_eq!(m.media_url.as_deref(), Some("/uploads/x.png"));
                assert!(m.reply_to.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(InboundEvent::parse(r#"{"event":"typing-start"}"#), InboundEvent::TypingStart));
        assert!(matches!(
            InboundEvent::parse(r#"{"event":"typing-stop","data":{}}"#),
            InboundEvent::TypingStop
        ));
    }

    #[test]
    fn text_defaults() {
        match InboundEvent::parse(r#"{"event":"send-message","data":{"content":"hi"}}"#) {
            InboundEvent::SendMessage(m) => {
                assert_eq!(m.kind, MessageKind::Text);
                assert!(m.media_url.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_frames() {
        for bad in [
            "not json",
            r#"{"data":{}}"#,
            r#"{"event":"join"}"#,
            r#"{"event":"toggle-reaction","data":{"emoji":"🔥"}}"#,
            r#"{"event":"send-message","data":{"content":"x","type":"sticker"}}"#,
            r#"{"event":"dance"}"#,
        ] {
            assert!(matches!(InboundEvent::parse(bad), InboundEvent::Malformed(_)), "{bad}");
        }
    }
}
