//! Presence: join, leave and typing indicators.

use chrono::Utc;

use super::{Connection, JoinRequest};
use crate::error::{ChatError, ChatResult};
use crate::pipeline;
use crate::registry::{Identity, JoinPolicy};
use crate::router::{Audience, OutboundEvent};

impl Connection {
    pub(super) fn handle_join(&self, req: JoinRequest) -> ChatResult<()> {
        let state = &self.state;
        if state.registry.get(&self.id).is_some() {
            return Err(ChatError::validation("Already joined"));
        }
        // The address may have been blocked since the connection opened.
        state.with_db(|db| crate::gate::admit(db, &self.ip))?;

        let is_admin = match req.admin_token.as_deref() {
            Some(token) if state.config.admin_token_matches(token) => true,
            Some(_) => {
                tracing::warn!(conn_id = %self.id, ip = %self.ip, "Join presented a wrong admin token");
                false
            }
            None => false,
        };
        let settings = state.settings()?;
        let policy = JoinPolicy {
            max_users_online: settings.max_users_online,
            companion_name: state.companion.as_ref().map(|c| c.persona().name.as_str()),
        };
        let identity = Identity {
            username: req.username,
            avatar: req.avatar.filter(|a| !a.trim().is_empty()),
            ip: self.ip.clone(),
            is_admin,
        };
        let session = state.with_db(|db| state.registry.register(db, &self.id, &identity, &policy))?;
        tracing::info!(
            conn_id = %self.id,
            user_id = %session.user_id,
            username = %session.username,
            admin = session.is_admin,
            "Joined"
        );

        // From here on the connection receives room broadcasts. History is
        // read after, so a message racing the join may arrive twice but
        // never goes missing; clients key messages by id.
        state.router.mark_joined(&self.id, session.is_admin);
        let me = Audience::Connection(&self.id);
        state.router.dispatch(me, &OutboundEvent::UserInfo(session.info()));

        let limit = state.config.recent_messages;
        let history = match state.with_db(|db| pipeline::history(db, limit, 1, Utc::now())) {
            Ok(history) => history,
            Err(e) => {
                self.abandon_join();
                return Err(e);
            }
        };
        state.router.dispatch(me, &OutboundEvent::RecentMessages(history));

        state
            .router
            .dispatch(Audience::EveryoneExcept(&self.id), &OutboundEvent::UserJoined(session.summary()));
        self.broadcast_online_users();
        Ok(())
    }

    /// Undo a join that failed after registering, so the client can retry.
    fn abandon_join(&self) {
        let state = &self.state;
        state.router.mark_left(&self.id);
        if let Err(e) = state.with_db(|db| state.registry.remove(db, &self.id)) {
            tracing::error!(conn_id = %self.id, "Failed to roll back join: {e}");
        }
    }

    pub(super) fn handle_typing(&self, started: bool) -> ChatResult<()> {
        // Typing before join is ignored rather than reported.
        let Some(session) = self.state.registry.get(&self.id) else {
            return Ok(());
        };
        let event = if started {
            OutboundEvent::UserTyping { username: session.username, avatar: session.avatar }
        } else {
            OutboundEvent::UserStopTyping { username: session.username }
        };
        self.state.router.dispatch(Audience::EveryoneExcept(&self.id), &event);
        Ok(())
    }

    /// Release the session and tell the room. The user record is kept.
    pub(super) fn cleanup(&self) {
        let state = &self.state;
        let removed = state.with_db(|db| state.registry.remove(db, &self.id));
        state.router.detach(&self.id);

        let session = match removed {
            Ok(Some(session)) => session,
            Ok(None) => {
                tracing::debug!(conn_id = %self.id, "Disconnected before joining");
                return;
            }
            Err(e) => {
                tracing::error!(conn_id = %self.id, "Failed to release session: {e}");
                return;
            }
        };
        tracing::info!(conn_id = %self.id, username = %session.username, "Left");

        // Another live session of the same user keeps them online.
        if state.registry.is_online(&session.user_id) {
            return;
        }
        state.router.dispatch(
            Audience::Everyone,
            &OutboundEvent::UserLeft { id: session.user_id, username: session.username },
        );
        self.broadcast_online_users();
    }

    fn broadcast_online_users(&self) {
        let registry = &self.state.registry;
        self.state
            .router
            .dispatch_with(Audience::Everyone, || OutboundEvent::OnlineUsers(registry.online_users()));
    }
}
