//! SQLite persistence layer.
//!
//! Stores users, messages, reactions, blocked addresses and the global
//! settings singleton. Uses WAL mode for concurrent reads during writes.
//! Expired messages are hidden from every read and swept by
//! [`Db::purge_expired`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};

use crate::model::{BlockedIp, GlobalSettings, Message, MessageKind, Reaction, ReactionUser, User};

/// Database handle wrapping a SQLite connection.
pub struct Db {
    conn: Connection,
}

/// Aggregate counters for the admin dashboard.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub users: u64,
    pub total_messages: u64,
    pub voice_messages: u64,
    pub image_messages: u64,
    pub pinned_messages: u64,
    pub messages_last_24h: u64,
}

fn to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

const USER_COLUMNS: &str = "id, username, avatar, ip, connection_id, is_banned, banned_until, ban_reason, message_count, joined_at, last_active";

const MESSAGE_COLUMNS: &str = "id, author_id, content, kind, media_url, media_file_name, reply_to_id, is_pinned, created_at, expires_at";

impl Db {
    /// Open (or create) the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> SqlResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> SqlResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Run raw SQL. Lets tests put the store into a failing state.
    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> SqlResult<()> {
        self.conn.execute_batch(sql)
    }

    fn init(&self) -> SqlResult<()> {
        self.conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        self.conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS users (
                id            TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE COLLATE NOCASE,
                avatar        TEXT,
                ip            TEXT,
                connection_id TEXT,
                is_banned     INTEGER NOT NULL DEFAULT 0,
                banned_until  INTEGER,
                ban_reason    TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                joined_at     INTEGER NOT NULL,
                last_active   INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_users_connection ON users(connection_id);

            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                author_id       TEXT NOT NULL,
                content         TEXT NOT NULL DEFAULT '',
                kind            TEXT NOT NULL DEFAULT 'text',
                media_url       TEXT,
                media_file_name TEXT,
                reply_to_id     TEXT,
                is_pinned       INTEGER NOT NULL DEFAULT 0,
                created_at      INTEGER NOT NULL,
                expires_at      INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_author_created ON messages(author_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_messages_expires ON messages(expires_at);

            CREATE TABLE IF NOT EXISTS reactions (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                user_id    TEXT NOT NULL,
                emoji      TEXT NOT NULL,
                UNIQUE(message_id, user_id, emoji)
            );

            CREATE TABLE IF NOT EXISTS blocked_ips (
                ip         TEXT PRIMARY KEY,
                reason     TEXT,
                blocked_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS global_settings (
                id                        INTEGER PRIMARY KEY CHECK (id = 1),
                message_expiry_hours      INTEGER NOT NULL,
                max_file_size_mb          INTEGER NOT NULL,
                allow_images              INTEGER NOT NULL,
                allow_voice               INTEGER NOT NULL,
                allow_stickers            INTEGER NOT NULL,
                max_users_online          INTEGER NOT NULL,
                rate_limit_messages       INTEGER NOT NULL,
                rate_limit_window_seconds INTEGER NOT NULL,
                updated_at                INTEGER NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────

    /// Find the user currently bound to a live connection.
    pub fn find_user_by_connection(&self, connection_id: &str) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE connection_id = ?1"),
                params![connection_id],
                map_user_row,
            )
            .optional()
    }

    /// Case-insensitive username lookup.
    pub fn find_user_by_username(&self, username: &str) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?1 COLLATE NOCASE"),
                params![username],
                map_user_row,
            )
            .optional()
    }

    pub fn find_user(&self, id: &str) -> SqlResult<Option<User>> {
        self.conn
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id],
                map_user_row,
            )
            .optional()
    }

    /// Insert a user or overwrite every mutable field of an existing one.
    pub fn upsert_user(&self, user: &User) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO users (id, username, avatar, ip, connection_id, is_banned, banned_until, ban_reason, message_count, joined_at, last_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                username=excluded.username,
                avatar=excluded.avatar,
                ip=excluded.ip,
                connection_id=excluded.connection_id,
                is_banned=excluded.is_banned,
                banned_until=excluded.banned_until,
                ban_reason=excluded.ban_reason,
                message_count=excluded.message_count,
                last_active=excluded.last_active",
            params![
                user.id,
                user.username,
                user.avatar,
                user.ip,
                user.connection_id,
                user.is_banned,
                user.banned_until.map(to_ms),
                user.ban_reason,
                user.message_count as i64,
                to_ms(user.joined_at),
                to_ms(user.last_active),
            ],
        )?;
        Ok(())
    }

    /// Drop the live-connection binding, but only if it still points at
    /// `connection_id` (a newer connection may have taken over).
    pub fn clear_connection(&self, user_id: &str, connection_id: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET connection_id = NULL WHERE id = ?1 AND connection_id = ?2",
            params![user_id, connection_id],
        )?;
        Ok(changed > 0)
    }

    /// Count one more accepted message and refresh `last_active`.
    pub fn record_activity(&self, user_id: &str, at: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "UPDATE users SET message_count = message_count + 1, last_active = ?2 WHERE id = ?1",
            params![user_id, to_ms(at)],
        )?;
        Ok(())
    }

    pub fn ban_user(
        &self,
        user_id: &str,
        until: Option<DateTime<Utc>>,
        reason: Option<&str>,
    ) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET is_banned = 1, banned_until = ?2, ban_reason = ?3 WHERE id = ?1",
            params![user_id, until.map(to_ms), reason],
        )?;
        Ok(changed > 0)
    }

    pub fn unban_user(&self, user_id: &str) -> SqlResult<bool> {
        let changed = self.conn.execute(
            "UPDATE users SET is_banned = 0, banned_until = NULL, ban_reason = NULL WHERE id = ?1",
            params![user_id],
        )?;
        Ok(changed > 0)
    }

    /// All users, newest first.
    pub fn list_users(&self) -> SqlResult<Vec<User>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY joined_at DESC"))?;
        let rows = stmt.query_map([], map_user_row)?;
        rows.collect()
    }

    // ── Blocked addresses ──────────────────────────────────────────────

    pub fn find_blocked_ip(&self, ip: &str) -> SqlResult<Option<BlockedIp>> {
        self.conn
            .query_row(
                "SELECT ip, reason, blocked_at FROM blocked_ips WHERE ip = ?1",
                params![ip],
                map_blocked_row,
            )
            .optional()
    }

    pub fn block_ip(&self, ip: &str, reason: Option<&str>, at: DateTime<Utc>) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO blocked_ips (ip, reason, blocked_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(ip) DO UPDATE SET reason=excluded.reason",
            params![ip, reason, to_ms(at)],
        )?;
        Ok(())
    }

    pub fn unblock_ip(&self, ip: &str) -> SqlResult<bool> {
        let changed = self.conn.execute("DELETE FROM blocked_ips WHERE ip = ?1", params![ip])?;
        Ok(changed > 0)
    }

    pub fn list_blocked_ips(&self) -> SqlResult<Vec<BlockedIp>> {
        let mut stmt = self
            .conn
            .prepare("SELECT ip, reason, blocked_at FROM blocked_ips ORDER BY blocked_at DESC")?;
        let rows = stmt.query_map([], map_blocked_row)?;
        rows.collect()
    }

    // ── Messages ───────────────────────────────────────────────────────

    pub fn create_message(&self, msg: &Message) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO messages (id, author_id, content, kind, media_url, media_file_name, reply_to_id, is_pinned, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                msg.id,
                msg.author_id,
                msg.content,
                msg.kind.as_str(),
                msg.media_url,
                msg.media_file_name,
                msg.reply_to_id,
                msg.is_pinned,
                to_ms(msg.created_at),
                to_ms(msg.expires_at),
            ],
        )?;
        Ok(())
    }

    /// Fetch a live (unexpired) message.
    pub fn find_message_by_id(&self, id: &str, now: DateTime<Utc>) -> SqlResult<Option<Message>> {
        self.conn
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND expires_at > ?2"),
                params![id, to_ms(now)],
                map_message_row,
            )
            .optional()
    }

    /// Page through live messages, newest page first, each page oldest-first.
    /// `page` starts at 1.
    pub fn recent_messages(&self, limit: usize, page: usize, now: DateTime<Utc>) -> SqlResult<Vec<Message>> {
        let offset = page.saturating_sub(1) * limit;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE expires_at > ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(params![to_ms(now), limit as i64, offset as i64], map_message_row)?;
        let mut out = rows.collect::<SqlResult<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    pub fn pinned_messages(&self, limit: usize, now: DateTime<Utc>) -> SqlResult<Vec<Message>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE is_pinned = 1 AND expires_at > ?1
             ORDER BY created_at DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_ms(now), limit as i64], map_message_row)?;
        rows.collect()
    }

    /// Messages by `user_id` created at or after `since`.
    pub fn count_recent_messages_by_user(&self, user_id: &str, since: DateTime<Utc>) -> SqlResult<u32> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE author_id = ?1 AND created_at >= ?2",
            params![user_id, to_ms(since)],
            |row| row.get::<_, i64>(0).map(|n| n as u32),
        )
    }

    pub fn delete_message(&self, id: &str) -> SqlResult<bool> {
        let changed = self.conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(changed > 0)
    }

    /// Delete many messages in one transaction. Returns the ids that existed.
    pub fn delete_messages(&self, ids: &[String]) -> SqlResult<Vec<String>> {
        let tx = self.conn.unchecked_transaction()?;
        let mut deleted = Vec::new();
        for id in ids {
            if tx.execute("DELETE FROM messages WHERE id = ?1", params![id])? > 0 {
                deleted.push(id.clone());
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Flip the pinned flag. `None` when the message does not exist.
    pub fn toggle_pin(&self, id: &str) -> SqlResult<Option<bool>> {
        let changed = self.conn.execute(
            "UPDATE messages SET is_pinned = 1 - is_pinned WHERE id = ?1",
            params![id],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.conn
            .query_row("SELECT is_pinned FROM messages WHERE id = ?1", params![id], |row| row.get(0))
            .optional()
    }

    /// Remove every message whose expiry has passed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> SqlResult<usize> {
        self.conn.execute("DELETE FROM messages WHERE expires_at <= ?1", params![to_ms(now)])
    }

    // ── Reactions ──────────────────────────────────────────────────────

    /// Add the reaction if absent, remove it if present. Returns the new
    /// reaction list for the message.
    pub fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> SqlResult<Vec<Reaction>> {
        let tx = self.conn.unchecked_transaction()?;
        let removed = tx.execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
            params![message_id, user_id, emoji],
        )?;
        if removed == 0 {
            tx.execute(
                "INSERT INTO reactions (message_id, user_id, emoji) VALUES (?1, ?2, ?3)",
                params![message_id, user_id, emoji],
            )?;
        }
        tx.commit()?;
        self.reactions_for(message_id)
    }

    /// Reactions in the order they were added, with the reactor's username.
    pub fn reactions_for(&self, message_id: &str) -> SqlResult<Vec<Reaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT r.emoji, r.user_id, COALESCE(u.username, '')
             FROM reactions r LEFT JOIN users u ON u.id = r.user_id
             WHERE r.message_id = ?1
             ORDER BY r.id ASC",
        )?;
        let rows = stmt.query_map(params![message_id], |row| {
            Ok(Reaction {
                emoji: row.get(0)?,
                user: ReactionUser {
                    id: row.get(1)?,
                    username: row.get(2)?,
                },
            })
        })?;
        rows.collect()
    }

    // ── Global settings ────────────────────────────────────────────────

    /// Read the settings singleton, creating it with defaults on first use.
    pub fn get_global_settings(&self) -> SqlResult<GlobalSettings> {
        let existing = self
            .conn
            .query_row(
                "SELECT message_expiry_hours, max_file_size_mb, allow_images, allow_voice, allow_stickers,
                        max_users_online, rate_limit_messages, rate_limit_window_seconds
                 FROM global_settings WHERE id = 1",
                [],
                |row| {
                    Ok(GlobalSettings {
                        message_expiry_hours: row.get(0)?,
                        max_file_size_mb: row.get(1)?,
                        allow_images: row.get(2)?,
                        allow_voice: row.get(3)?,
                        allow_stickers: row.get(4)?,
                        max_users_online: row.get(5)?,
                        rate_limit_messages: row.get(6)?,
                        rate_limit_window_seconds: row.get(7)?,
                    })
                },
            )
            .optional()?;
        match existing {
            Some(settings) => Ok(settings),
            None => {
                let settings = GlobalSettings::default();
                self.save_global_settings(&settings)?;
                Ok(settings)
            }
        }
    }

    pub fn save_global_settings(&self, s: &GlobalSettings) -> SqlResult<()> {
        self.conn.execute(
            "INSERT INTO global_settings (id, message_expiry_hours, max_file_size_mb, allow_images, allow_voice,
                                          allow_stickers, max_users_online, rate_limit_messages,
                                          rate_limit_window_seconds, updated_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                message_expiry_hours=excluded.message_expiry_hours,
                max_file_size_mb=excluded.max_file_size_mb,
                allow_images=excluded.allow_images,
                allow_voice=excluded.allow_voice,
                allow_stickers=excluded.allow_stickers,
                max_users_online=excluded.max_users_online,
                rate_limit_messages=excluded.rate_limit_messages,
                rate_limit_window_seconds=excluded.rate_limit_window_seconds,
                updated_at=excluded.updated_at",
            params![
                s.message_expiry_hours,
                s.max_file_size_mb,
                s.allow_images,
                s.allow_voice,
                s.allow_stickers,
                s.max_users_online,
                s.rate_limit_messages,
                s.rate_limit_window_seconds,
                to_ms(Utc::now()),
            ],
        )?;
        Ok(())
    }

    pub fn stats(&self, now: DateTime<Utc>) -> SqlResult<Stats> {
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> SqlResult<u64> {
            self.conn.query_row(sql, p, |row| row.get::<_, i64>(0)).map(|n| n as u64)
        };
        let live = to_ms(now);
        let day_ago = to_ms(now - chrono::Duration::hours(24));
        Ok(Stats {
            users: count("SELECT COUNT(*) FROM users", &[])?,
            total_messages: count("SELECT COUNT(*) FROM messages WHERE expires_at > ?1", &[&live])?,
            voice_messages: count(
                "SELECT COUNT(*) FROM messages WHERE kind = 'voice' AND expires_at > ?1",
                &[&live],
            )?,
            image_messages: count(
                "SELECT COUNT(*) FROM messages WHERE kind = 'image' AND expires_at > ?1",
                &[&live],
            )?,
            pinned_messages: count(
                "SELECT COUNT(*) FROM messages WHERE is_pinned = 1 AND expires_at > ?1",
                &[&live],
            )?,
            messages_last_24h: count(
                "SELECT COUNT(*) FROM messages WHERE created_at >= ?1 AND expires_at > ?2",
                &[&day_ago, &live],
            )?,
        })
    }
}

fn map_user_row(row: &rusqlite::Row) -> SqlResult<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        avatar: row.get(2)?,
        ip: row.get(3)?,
        connection_id: row.get(4)?,
        is_banned: row.get(5)?,
        banned_until: row.get::<_, Option<i64>>(6)?.map(from_ms),
        ban_reason: row.get(7)?,
        message_count: row.get::<_, i64>(8)?.max(0) as u64,
        joined_at: from_ms(row.get(9)?),
        last_active: from_ms(row.get(10)?),
    })
}

fn map_message_row(row: &rusqlite::Row) -> SqlResult<Message> {
    let kind: String = row.get(3)?;
    Ok(Message {
        id: row.get(0)?,
        author_id: row.get(1)?,
        content: row.get(2)?,
        kind: MessageKind::parse(&kind).unwrap_or_default(),
        media_url: row.get(4)?,
        media_file_name: row.get(5)?,
        reply_to_id: row.get(6)?,
        is_pinned: row.get(7)?,
        created_at: from_ms(row.get(8)?),
        expires_at: from_ms(row.get(9)?),
    })
}

fn map_blocked_row(row: &rusqlite::Row) -> SqlResult<BlockedIp> {
    Ok(BlockedIp {
        ip: row.get(0)?,
        reason: row.get(1)?,
        blocked_at: from_ms(row.get(2)?),
    })
}
