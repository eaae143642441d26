//! Session registry: which live connection is bound to which user.
//!
//! Authoritative for presence in this process. The backing user record in
//! the store outlives sessions; `remove` only clears its connection binding.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::db::Db;
use crate::error::{ChatError, ChatResult};
use crate::model::{User, UserSummary};

pub const MAX_USERNAME_CHARS: usize = 30;

/// Substrings no username may contain, compared case-insensitively.
pub const RESERVED_WORDS: &[&str] = &[
    "admin",
    "administrator",
    "system",
    "moderator",
    "support",
    "root",
    "chattr",
];

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub connection_id: String,
    pub user_id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub ip: String,
    pub is_admin: bool,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
    seq: u64,
    /// Set by moderation. A revoked session stays listed until its actor
    /// leaves but can no longer act.
    revoked: bool,
}

impl Session {
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.user_id.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.user_id.clone(),
            username: self.username.clone(),
            avatar: self.avatar.clone(),
            joined_at: self.joined_at,
            last_active: self.last_active,
            message_count: self.message_count,
            is_admin: self.is_admin,
        }
    }
}

/// The `user-info` payload sent to a freshly joined client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub username: String,
    pub avatar: Option<String>,
    pub joined_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub message_count: u64,
    pub is_admin: bool,
}

/// What a join asks for.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: String,
    pub avatar: Option<String>,
    pub ip: String,
    pub is_admin: bool,
}

/// Join-time limits, read from settings and config by the caller.
#[derive(Debug, Clone)]
pub struct JoinPolicy<'a> {
    pub max_users_online: u32,
    pub companion_name: Option<&'a str>,
}

/// Trim and check a requested username. Returns the trimmed name.
pub fn validate_username(raw: &str, companion_name: Option<&str>) -> ChatResult<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ChatError::validation("Username is required"));
    }
    if name.chars().count() > MAX_USERNAME_CHARS {
        return Err(ChatError::validation(format!(
            "Username must be at most {MAX_USERNAME_CHARS} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(ChatError::validation("Username contains invalid characters"));
    }
    let lower = name.to_lowercase();
    if RESERVED_WORDS.iter().any(|w| lower.contains(w)) {
        return Err(ChatError::validation("This username is reserved"));
    }
    if companion_name.is_some_and(|c| c.eq_ignore_ascii_case(name)) {
        return Err(ChatError::validation("This username is reserved"));
    }
    Ok(name.to_string())
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `connection_id` to a user, reviving the persisted record when
    /// the connection or the username is already known.
    pub fn register(
        &self,
        db: &Db,
        connection_id: &str,
        identity: &Identity,
        policy: &JoinPolicy<'_>,
    ) -> ChatResult<Session> {
        let username = validate_username(&identity.username, policy.companion_name)?;
        let now = Utc::now();

        let existing = match db.find_user_by_connection(connection_id)? {
            Some(user) => Some(user),
            None => db.find_user_by_username(&username)?,
        };

        let user = match existing {
            Some(mut user) => {
                if user.ban_active(now) {
                    let msg = match user.banned_until {
                        Some(until) => format!(
                            "You are banned until {}",
                            until.format("%Y-%m-%d %H:%M UTC")
                        ),
                        None => "You are banned from this chat".to_string(),
                    };
                    return Err(ChatError::unauthorized(msg));
                }
                if user.is_banned {
                    user.is_banned = false;
                    user.banned_until = None;
                    user.ban_reason = None;
                }
                self.check_capacity(&user.id, policy.max_users_online)?;
                if identity.avatar.is_some() {
                    user.avatar = identity.avatar.clone();
                }
                user.ip = Some(identity.ip.clone());
                user.connection_id = Some(connection_id.to_string());
                user.last_active = now;
                db.upsert_user(&user)?;
                tracing::info!(user_id = %user.id, username = %user.username, "Existing user rejoined");
                user
            }
            None => {
                self.check_capacity("", policy.max_users_online)?;
                let mut user = User::new(&username, identity.avatar.clone(), Some(identity.ip.clone()));
                user.connection_id = Some(connection_id.to_string());
                db.upsert_user(&user)?;
                tracing::info!(user_id = %user.id, username = %user.username, "New user created");
                user
            }
        };

        let mut inner = self.inner.lock();
        inner.next_seq += 1;
        let session = Session {
            connection_id: connection_id.to_string(),
            user_id: user.id.clone(),
            username: user.username.clone(),
            avatar: user.avatar.clone(),
            ip: identity.ip.clone(),
            is_admin: identity.is_admin,
            joined_at: now,
            last_active: now,
            message_count: user.message_count,
            seq: inner.next_seq,
            revoked: false,
        };
        inner.sessions.insert(connection_id.to_string(), session.clone());
        Ok(session)
    }

    fn check_capacity(&self, user_id: &str, max: u32) -> ChatResult<()> {
        let inner = self.inner.lock();
        let mut distinct: HashSet<&str> = HashSet::new();
        for s in inner.sessions.values() {
            if s.user_id == user_id {
                return Ok(());
            }
            distinct.insert(&s.user_id);
        }
        if distinct.len() >= max as usize {
            tracing::warn!(online = distinct.len(), max, "Join rejected: room full");
            return Err(ChatError::policy("Chat room is full"));
        }
        Ok(())
    }

    /// The session bound to a connection, unless it has been revoked.
    pub fn get(&self, connection_id: &str) -> Option<Session> {
        self.inner
            .lock()
            .sessions
            .get(connection_id)
            .filter(|s| !s.revoked)
            .cloned()
    }

    /// Stop a session from acting before its transport has gone away.
    /// Leave handling still runs when the actor exits.
    pub fn revoke(&self, connection_id: &str) -> bool {
        match self.inner.lock().sessions.get_mut(connection_id) {
            Some(session) => {
                session.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Record one accepted action for the session.
    pub fn touch(&self, connection_id: &str) -> Option<Session> {
        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(connection_id).filter(|s| !s.revoked)?;
        session.last_active = Utc::now();
        session.message_count += 1;
        Some(session.clone())
    }

    /// Drop the session and release the user's connection binding.
    pub fn remove(&self, db: &Db, connection_id: &str) -> ChatResult<Option<Session>> {
        let removed = self.inner.lock().sessions.remove(connection_id);
        if let Some(ref session) = removed {
            db.clear_connection(&session.user_id, connection_id)?;
        }
        Ok(removed)
    }

    /// All sessions in join order.
    pub fn list(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.inner.lock().sessions.values().cloned().collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
    }

    /// Distinct online users in join order. A user with a stale session and a
    /// fresh one appears once.
    pub fn online_users(&self) -> Vec<UserSummary> {
        let mut seen = HashSet::new();
        self.list()
            .into_iter()
            .filter(|s| seen.insert(s.user_id.clone()))
            .map(|s| s.summary())
            .collect()
    }

    pub fn online_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.sessions.values().map(|s| s.user_id.as_str()).collect::<HashSet<_>>().len()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.inner.lock().sessions.values().any(|s| s.user_id == user_id)
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.connection_id.clone())
            .collect()
    }

    pub fn sessions_for_ip(&self, ip: &str) -> Vec<String> {
        self.inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.ip == ip)
            .map(|s| s.connection_id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn identity(name: &str) -> Identity {
        Identity {
            username: name.to_string(),
            avatar: None,
            ip: "127.0.0.1".to_string(),
            is_admin: false,
        }
    }

    fn policy() -> JoinPolicy<'static> {
        JoinPolicy { max_users_online: 100, companion_name: Some("Kira") }
    }

    #[test]
    fn reserved_and_malformed_usernames() {
        assert!(validate_username("Admin2", None).is_err());
        assert!(validate_username("xXsYsTeMXx", None).is_err());
        assert!(validate_username("   ", None).is_err());
        assert!(validate_username(&"a".repeat(31), None).is_err());
        assert!(validate_username("bad\u{0000}name", None).is_err());
        assert!(validate_username("kira", Some("Kira")).is_err());
        assert_eq!(validate_username("  alice ", Some("Kira")).unwrap(), "alice");
        assert!(validate_username("kiraFan", Some("Kira")).is_ok());
    }

    #[test]
    fn register_creates_then_revives() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();

        let s1 = reg.register(&db, "c1", &identity("alice"), &policy()).unwrap();
        assert_eq!(reg.get("c1").unwrap().user_id, s1.user_id);
        db.record_activity(&s1.user_id, Utc::now()).unwrap();

        reg.remove(&db, "c1").unwrap();
        assert!(reg.get("c1").is_none());
        assert!(db.find_user(&s1.user_id).unwrap().is_some());

        let s2 = reg.register(&db, "c2", &identity("Alice"), &policy()).unwrap();
        assert_eq!(s2.user_id, s1.user_id);
        assert_eq!(s2.message_count, 1);
    }

    #[test]
    fn active_ban_blocks_join_expired_ban_clears() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        let s = reg.register(&db, "c1", &identity("bob"), &policy()).unwrap();
        reg.remove(&db, "c1").unwrap();

        db.ban_user(&s.user_id, Some(Utc::now() + Duration::hours(1)), None).unwrap();
        let err = reg.register(&db, "c2", &identity("bob"), &policy()).unwrap_err();
        assert!(matches!(err, ChatError::Authorization(_)));
        assert!(reg.get("c2").is_none());

        db.ban_user(&s.user_id, Some(Utc::now() - Duration::minutes(1)), None).unwrap();
        reg.register(&db, "c3", &identity("bob"), &policy()).unwrap();
        assert!(!db.find_user(&s.user_id).unwrap().unwrap().is_banned);
    }

    #[test]
    fn room_capacity_counts_distinct_users() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        let small = JoinPolicy { max_users_online: 2, companion_name: None };
        reg.register(&db, "c1", &identity("a"), &small).unwrap();
        reg.register(&db, "c2", &identity("b"), &small).unwrap();

        let err = reg.register(&db, "c3", &identity("c"), &small).unwrap_err();
        assert_eq!(err.to_string(), "Chat room is full");

        // Already-online identity reconnecting is not turned away
        reg.register(&db, "c4", &identity("a"), &small).unwrap();
        assert_eq!(reg.online_count(), 2);
    }

    #[test]
    fn online_users_dedupes_stale_sessions() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        reg.register(&db, "c1", &identity("alice"), &policy()).unwrap();
        reg.register(&db, "c2", &identity("bob"), &policy()).unwrap();
        reg.register(&db, "c3", &identity("alice"), &policy()).unwrap();

        let names: Vec<_> = reg.online_users().into_iter().map(|u| u.username).collect();
        assert_eq!(names, ["alice", "bob"]);
        assert_eq!(reg.list().len(), 3);

        let alice = reg.get("c1").unwrap().user_id;
        let mut conns = reg.sessions_for_user(&alice);
        conns.sort();
        assert_eq!(conns, ["c1", "c3"]);
        assert_eq!(reg.sessions_for_ip("127.0.0.1").len(), 3);
    }

    #[test]
    fn stale_remove_keeps_newer_binding() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        let s1 = reg.register(&db, "old", &identity("carol"), &policy()).unwrap();
        reg.register(&db, "new", &identity("carol"), &policy()).unwrap();

        reg.remove(&db, "old").unwrap();
        let user = db.find_user(&s1.user_id).unwrap().unwrap();
        assert_eq!(user.connection_id.as_deref(), Some("new"));
        assert!(reg.is_online(&s1.user_id));
    }

    #[test]
    fn revoked_session_cannot_act_but_still_leaves() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        let s = reg.register(&db, "c1", &identity("erin"), &policy()).unwrap();

        assert!(reg.revoke("c1"));
        assert!(!reg.revoke("nope"));
        assert!(reg.get("c1").is_none());
        assert!(reg.touch("c1").is_none());
        assert!(reg.is_online(&s.user_id));

        let removed = reg.remove(&db, "c1").unwrap().unwrap();
        assert_eq!(removed.username, "erin");
        assert!(!reg.is_online(&s.user_id));
    }

    #[test]
    fn touch_counts_activity() {
        let db = Db::open_memory().unwrap();
        let reg = SessionRegistry::new();
        reg.register(&db, "c1", &identity("dave"), &policy()).unwrap();
        reg.touch("c1");
        assert_eq!(reg.touch("c1").unwrap().message_count, 2);
        assert!(reg.touch("nope").is_none());
    }
}
