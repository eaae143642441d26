//! Messaging: send-message, toggle-reaction and the admin relay.

use super::{Connection, ReactionRequest};
use crate::companion;
use crate::error::{ChatError, ChatResult};
use crate::pipeline::{self, SendRequest, Submission};
use crate::router::{Audience, OutboundEvent};

impl Connection {
    pub(super) fn handle_send(&self, req: SendRequest) -> ChatResult<()> {
        let session = self.session()?;
        pipeline::check_rate(&self.state, &session.user_id)?;

        match pipeline::submit(&self.state, &session.summary(), Some(&self.id), req)? {
            Submission::Message(msg) => {
                let delivered = self
                    .state
                    .router
                    .dispatch(Audience::Everyone, &OutboundEvent::MessageReceived(msg.clone()));
                tracing::debug!(conn_id = %self.id, message_id = %msg.id, delivered, "Message broadcast");
                companion::observe(&self.state, &msg);
            }
            Submission::Effect(effect) => {
                self.state
                    .router
                    .dispatch(Audience::Everyone, &OutboundEvent::TriggerGlobalEffect(effect));
            }
        }
        Ok(())
    }

    pub(super) fn handle_reaction(&self, req: ReactionRequest) -> ChatResult<()> {
        let session = self.session()?;
        let reactions = pipeline::toggle_reaction(&self.state, &session.user_id, &req.message_id, &req.emoji)?;
        self.state.router.dispatch(
            Audience::Everyone,
            &OutboundEvent::ReactionUpdated { message_id: req.message_id, reactions },
        );
        Ok(())
    }

    /// Admin observers may notify each other; nobody else may use this.
    pub(super) fn handle_admin_action(&self, action: serde_json::Value) -> ChatResult<()> {
        let session = self.session()?;
        if !session.is_admin {
            tracing::warn!(conn_id = %self.id, user_id = %session.user_id, "admin-action from non-admin");
            return Err(ChatError::policy("Admin privileges required"));
        }
        let note = serde_json::json!({ "from": session.username, "action": action });
        self.state.router.dispatch(
            Audience::Admins { except: Some(self.id.as_str()) },
            &OutboundEvent::AdminNotification(note),
        );
        Ok(())
    }
}
