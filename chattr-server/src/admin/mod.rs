//! Moderation actions taken outside any chat connection.
//!
//! Every action persists first and only then tells the room, so a client
//! never sees a change the store does not hold. The HTTP surface lives in
//! [`api`].

pub mod api;

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::db::Stats;
use crate::error::{ChatError, ChatResult};
use crate::model::{BlockedIp, GlobalSettings};
use crate::router::{AnnouncementKind, Audience, OutboundEvent};
use crate::sanitize;
use crate::server::SharedState;

pub const DEFAULT_BAN_HOURS: u32 = 24;
pub const MAX_BAN_HOURS: u32 = 720;
pub const MAX_ANNOUNCEMENT_CHARS: usize = 500;
/// Upper bound on ids accepted by one bulk delete.
pub const MAX_BULK_DELETE: usize = 100;

/// A stored user as the admin panel sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub ip: Option<String>,
    pub is_banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
    pub ban_reason: Option<String>,
    pub message_count: u64,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminStats {
    #[serde(flatten)]
    pub store: Stats,
    pub online_users: usize,
    pub connections: usize,
    pub uptime_secs: u64,
}

pub fn delete_message(state: &SharedState, message_id: &str) -> ChatResult<()> {
    if !state.with_db(|db| db.delete_message(message_id))? {
        return Err(ChatError::not_found("Message not found"));
    }
    tracing::info!(%message_id, "Admin deleted message");
    state.router.dispatch(
        Audience::Everyone,
        &OutboundEvent::MessageDeleted { message_id: message_id.to_string() },
    );
    Ok(())
}

/// Delete several messages at once. Unknown ids are skipped; the ids that
/// were actually removed are returned and broadcast.
pub fn delete_messages(state: &SharedState, ids: &[String]) -> ChatResult<Vec<String>> {
    if ids.is_empty() {
        return Err(ChatError::validation("No message ids given"));
    }
    if ids.len() > MAX_BULK_DELETE {
        return Err(ChatError::validation(format!(
            "At most {MAX_BULK_DELETE} messages can be deleted at once"
        )));
    }
    let removed = state.with_db(|db| db.delete_messages(ids))?;
    tracing::info!(requested = ids.len(), removed = removed.len(), "Admin bulk delete");
    if !removed.is_empty() {
        state.router.dispatch(
            Audience::Everyone,
            &OutboundEvent::MessagesDeletedBulk { message_ids: removed.clone() },
        );
    }
    Ok(removed)
}

/// Flip the pinned flag. Returns the new state.
pub fn toggle_pin(state: &SharedState, message_id: &str) -> ChatResult<bool> {
    let is_pinned = state
        .with_db(|db| db.toggle_pin(message_id))?
        .ok_or_else(|| ChatError::not_found("Message not found"))?;
    state.router.dispatch(
        Audience::Everyone,
        &OutboundEvent::MessagePinUpdated { message_id: message_id.to_string(), is_pinned },
    );
    Ok(is_pinned)
}

/// Ban a user for `hours` and close their live sessions with `user-banned`.
/// Returns how many sessions were closed.
pub fn ban_user(
    state: &SharedState,
    user_id: &str,
    hours: Option<u32>,
    reason: Option<&str>,
) -> ChatResult<usize> {
    let hours = hours.unwrap_or(DEFAULT_BAN_HOURS);
    if !(1..=MAX_BAN_HOURS).contains(&hours) {
        return Err(ChatError::validation(format!(
            "Ban duration must be between 1 and {MAX_BAN_HOURS} hours"
        )));
    }
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(sanitize::clean)
        .unwrap_or_else(|| "Violation of chat rules".to_string());
    let until = Utc::now() + Duration::hours(hours as i64);

    if !state.with_db(|db| db.ban_user(user_id, Some(until), Some(reason.as_str())))? {
        return Err(ChatError::not_found("User not found"));
    }
    tracing::info!(%user_id, hours, %reason, "Admin banned user");

    let event = OutboundEvent::UserBanned { reason, duration: Some(hours) };
    let sessions = state.registry.sessions_for_user(user_id);
    for conn_id in &sessions {
        evict(state, conn_id, &event);
    }
    Ok(sessions.len())
}

/// Every stored user, newest first, with live presence. Bans that have run
/// out are reported as lifted.
pub fn users(state: &SharedState) -> ChatResult<Vec<AdminUser>> {
    let now = Utc::now();
    let users = state.with_db(|db| db.list_users())?;
    Ok(users
        .into_iter()
        .map(|u| AdminUser {
            is_online: state.registry.is_online(&u.id),
            is_banned: u.ban_active(now),
            id: u.id,
            username: u.username,
            avatar: u.avatar,
            ip: u.ip,
            banned_until: u.banned_until,
            ban_reason: u.ban_reason,
            message_count: u.message_count,
            joined_at: u.joined_at,
            last_active: u.last_active,
        })
        .collect())
}

pub fn unban_user(state: &SharedState, user_id: &str) -> ChatResult<()> {
    if !state.with_db(|db| db.unban_user(user_id))? {
        return Err(ChatError::not_found("User not found"));
    }
    tracing::info!(%user_id, "Admin unbanned user");
    Ok(())
}

/// Disconnect a user without a ban. They may rejoin immediately.
pub fn kick_user(state: &SharedState, user_id: &str, reason: Option<&str>) -> ChatResult<usize> {
    let sessions = state.registry.sessions_for_user(user_id);
    if sessions.is_empty() {
        return Err(ChatError::not_found("User is not online"));
    }
    let reason = reason
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .map(sanitize::clean)
        .unwrap_or_else(|| "Kicked by an administrator".to_string());
    tracing::info!(%user_id, %reason, "Admin kicked user");

    let event = OutboundEvent::UserKicked { reason };
    for conn_id in &sessions {
        evict(state, conn_id, &event);
    }
    Ok(sessions.len())
}

/// Revoke a session, then deliver its last event and close it. Events the
/// client already queued are discarded by its actor.
fn evict(state: &SharedState, conn_id: &str, event: &OutboundEvent) {
    state.registry.revoke(conn_id);
    state.router.send_and_close(conn_id, event);
}

pub fn announce(state: &SharedState, content: &str, kind: AnnouncementKind) -> ChatResult<()> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ChatError::validation("Announcement content is required"));
    }
    if content.chars().count() > MAX_ANNOUNCEMENT_CHARS {
        return Err(ChatError::validation(format!(
            "Announcement must be at most {MAX_ANNOUNCEMENT_CHARS} characters"
        )));
    }
    state.router.dispatch(
        Audience::Everyone,
        &OutboundEvent::AdminAnnouncement {
            content: sanitize::clean(content),
            kind,
            timestamp: Utc::now(),
        },
    );
    Ok(())
}

/// Block an address and drop every live session coming from it.
pub fn block_ip(state: &SharedState, ip: &str, reason: Option<&str>) -> ChatResult<BlockedIp> {
    let ip: IpAddr = ip
        .trim()
        .parse()
        .map_err(|_| ChatError::validation("Invalid IP address"))?;
    let ip = crate::gate::canonical(ip).to_string();
    let reason = reason.map(str::trim).filter(|r| !r.is_empty()).map(sanitize::clean);
    let now = Utc::now();
    state.with_db(|db| db.block_ip(&ip, reason.as_deref(), now))?;
    tracing::info!(%ip, ?reason, "Admin blocked address");

    let event = OutboundEvent::error(crate::gate::BLOCKED_MESSAGE);
    for conn_id in state.registry.sessions_for_ip(&ip) {
        evict(state, &conn_id, &event);
    }
    Ok(BlockedIp { ip, reason, blocked_at: now })
}

pub fn unblock_ip(state: &SharedState, ip: &str) -> ChatResult<()> {
    if !state.with_db(|db| db.unblock_ip(ip.trim()))? {
        return Err(ChatError::not_found("Address is not blocked"));
    }
    tracing::info!(%ip, "Admin unblocked address");
    Ok(())
}

pub fn blocked_ips(state: &SharedState) -> ChatResult<Vec<BlockedIp>> {
    state.with_db(|db| db.list_blocked_ips())
}

pub fn settings(state: &SharedState) -> ChatResult<GlobalSettings> {
    state.settings()
}

/// Replace the runtime policy. Takes effect on the next send or join.
pub fn update_settings(state: &SharedState, settings: GlobalSettings) -> ChatResult<GlobalSettings> {
    settings.validate().map_err(ChatError::Validation)?;
    state.with_db(|db| db.save_global_settings(&settings))?;
    tracing::info!(?settings, "Admin updated settings");
    Ok(settings)
}

pub fn stats(state: &SharedState) -> ChatResult<AdminStats> {
    let store = state.with_db(|db| db.stats(Utc::now()))?;
    Ok(AdminStats {
        store,
        online_users: state.registry.online_count(),
        connections: state.router.connection_count(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::db::Db;
    use crate::model::{Message, MessageKind, User};
    use crate::router::Frame;
    use tokio::sync::mpsc;

    fn state() -> SharedState {
        SharedState::new(ServerConfig::default(), Db::open_memory().unwrap()).unwrap()
    }

    fn listener(state: &SharedState, id: &str) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(16);
        state.router.attach(id, tx);
        state.router.mark_joined(id, false);
        rx
    }

    fn stored_message(state: &SharedState, author: &User) -> String {
        let now = Utc::now();
        let msg = Message {
            id: crate::msgid::generate(),
            author_id: author.id.clone(),
            content: "hello".into(),
            kind: MessageKind::Text,
            media_url: None,
            media_file_name: None,
            reply_to_id: None,
            is_pinned: false,
            created_at: now,
            expires_at: now + Duration::hours(1),
        };
        state.with_db(|db| db.create_message(&msg)).unwrap();
        msg.id
    }

    fn user(state: &SharedState, name: &str) -> User {
        let user = User::new(name, None, Some("192.0.2.1".into()));
        state.with_db(|db| db.upsert_user(&user)).unwrap();
        user
    }

    fn next_json(rx: &mut mpsc::Receiver<Frame>) -> serde_json::Value {
        match rx.try_recv().unwrap() {
            Frame::Text(t) => serde_json::from_str(&t).unwrap(),
            Frame::Close => panic!("unexpected close"),
        }
    }

    #[test]
    fn delete_persists_then_broadcasts() {
        let state = state();
        let alice = user(&state, "alice");
        let id = stored_message(&state, &alice);
        let mut rx = listener(&state, "c1");

        delete_message(&state, &id).unwrap();
        assert!(state.with_db(|db| db.find_message_by_id(&id, Utc::now())).unwrap().is_none());
        let frame = next_json(&mut rx);
        assert_eq!(frame["event"], "message-deleted");
        assert_eq!(frame["data"]["messageId"], id.as_str());

        assert!(matches!(delete_message(&state, &id), Err(ChatError::NotFound(_))));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn bulk_delete_reports_removed_ids() {
        let state = state();
        let alice = user(&state, "alice");
        let a = stored_message(&state, &alice);
        let b = stored_message(&state, &alice);
        let mut rx = listener(&state, "c1");

        let removed = delete_messages(&state, &[a.clone(), "missing".into(), b.clone()]).unwrap();
        assert_eq!(removed.len(), 2);
        let frame = next_json(&mut rx);
        assert_eq!(frame["event"], "messages-deleted-bulk");
        assert_eq!(frame["data"]["messageIds"].as_array().unwrap().len(), 2);

        assert!(delete_messages(&state, &[]).is_err());
    }

    #[test]
    fn pin_toggles() {
        let state = state();
        let alice = user(&state, "alice");
        let id = stored_message(&state, &alice);
        assert!(toggle_pin(&state, &id).unwrap());
        assert!(!toggle_pin(&state, &id).unwrap());
        assert!(matches!(toggle_pin(&state, "nope"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn ban_validates_duration() {
        let state = state();
        let alice = user(&state, "alice");
        assert!(matches!(ban_user(&state, &alice.id, Some(0), None), Err(ChatError::Validation(_))));
        assert!(matches!(ban_user(&state, &alice.id, Some(721), None), Err(ChatError::Validation(_))));
        assert!(matches!(ban_user(&state, "ghost", None, None), Err(ChatError::NotFound(_))));

        assert_eq!(ban_user(&state, &alice.id, None, Some("spam")).unwrap(), 0);
        let stored = state.with_db(|db| db.find_user(&alice.id)).unwrap().unwrap();
        assert!(stored.ban_active(Utc::now()));
        assert_eq!(stored.ban_reason.as_deref(), Some("spam"));
        let until = stored.banned_until.unwrap();
        assert!(until > Utc::now() + Duration::hours(23));

        unban_user(&state, &alice.id).unwrap();
        let stored = state.with_db(|db| db.find_user(&alice.id)).unwrap().unwrap();
        assert!(!stored.ban_active(Utc::now()));
    }

    #[test]
    fn users_report_bans_and_presence() {
        let state = state();
        let alice = user(&state, "alice");
        let identity = crate::registry::Identity {
            username: "bob".into(),
            avatar: None,
            ip: "192.0.2.2".into(),
            is_admin: false,
        };
        let policy = crate::registry::JoinPolicy { max_users_online: 10, companion_name: None };
        let bob = state
            .with_db(|db| state.registry.register(db, "c1", &identity, &policy))
            .unwrap();
        ban_user(&state, &alice.id, Some(1), None).unwrap();

        let listed = users(&state).unwrap();
        assert_eq!(listed.len(), 2);
        let find = |id: &str| listed.iter().find(|u| u.id == id).unwrap();
        assert!(find(&alice.id).is_banned);
        assert!(!find(&alice.id).is_online);
        assert!(find(&bob.user_id).is_online);
        assert_eq!(find(&bob.user_id).ip.as_deref(), Some("192.0.2.2"));

        let json = serde_json::to_value(find(&alice.id)).unwrap();
        assert_eq!(json["banReason"], "Violation of chat rules");
        assert!(json["joinedAt"].is_string());
    }

    #[test]
    fn ban_revokes_live_sessions() {
        let state = state();
        let identity = crate::registry::Identity {
            username: "troll".into(),
            avatar: None,
            ip: "192.0.2.3".into(),
            is_admin: false,
        };
        let policy = crate::registry::JoinPolicy { max_users_online: 10, companion_name: None };
        let mut rx = listener(&state, "c1");
        let troll = state
            .with_db(|db| state.registry.register(db, "c1", &identity, &policy))
            .unwrap();

        assert_eq!(ban_user(&state, &troll.user_id, None, None).unwrap(), 1);
        assert!(state.registry.get("c1").is_none());
        assert!(!state.router.is_attached("c1"));
        assert_eq!(next_json(&mut rx)["event"], "user-banned");
        assert_eq!(rx.try_recv().unwrap(), Frame::Close);
    }

    #[test]
    fn kick_requires_online_user() {
        let state = state();
        let alice = user(&state, "alice");
        assert!(matches!(kick_user(&state, &alice.id, None), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn announcement_bounds() {
        let state = state();
        let mut rx = listener(&state, "c1");
        assert!(announce(&state, "   ", AnnouncementKind::Info).is_err());
        assert!(announce(&state, &"x".repeat(501), AnnouncementKind::Info).is_err());

        announce(&state, "Maintenance at <b>noon</b>", AnnouncementKind::Warning).unwrap();
        let frame = next_json(&mut rx);
        assert_eq!(frame["event"], "admin-announcement");
        assert_eq!(frame["data"]["type"], "warning");
        assert_eq!(frame["data"]["content"], "Maintenance at &lt;b&gt;noon&lt;/b&gt;");
    }

    #[test]
    fn block_and_unblock() {
        let state = state();
        assert!(matches!(block_ip(&state, "not-an-ip", None), Err(ChatError::Validation(_))));

        let blocked = block_ip(&state, " ::ffff:203.0.113.9 ", Some("abuse")).unwrap();
        assert_eq!(blocked.ip, "203.0.113.9");
        assert!(crate::gate::admit(&state.db.lock(), "203.0.113.9").is_err());
        assert_eq!(blocked_ips(&state).unwrap().len(), 1);

        unblock_ip(&state, "203.0.113.9").unwrap();
        assert!(crate::gate::admit(&state.db.lock(), "203.0.113.9").is_ok());
        assert!(matches!(unblock_ip(&state, "203.0.113.9"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn settings_are_range_checked() {
        let state = state();
        let bad = GlobalSettings { message_expiry_hours: 0, ..Default::default() };
        assert!(matches!(update_settings(&state, bad), Err(ChatError::Validation(_))));

        let new = GlobalSettings { rate_limit_messages: 3, allow_images: false, ..Default::default() };
        update_settings(&state, new.clone()).unwrap();
        assert_eq!(settings(&state).unwrap(), new);
    }

    #[test]
    fn stats_counts_live_state() {
        let state = state();
        let alice = user(&state, "alice");
        stored_message(&state, &alice);
        let _rx = listener(&state, "c1");
        let stats = stats(&state).unwrap();
        assert_eq!(stats.store.total_messages, 1);
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.online_users, 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["totalMessages"], 1);
        assert_eq!(json["onlineUsers"], 0);
    }
}
