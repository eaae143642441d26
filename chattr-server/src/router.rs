//! Broadcast router: outbound event vocabulary and audience fan-out.
//!
//! Every connection registers an outlet (a bounded mpsc sender drained by
//! its socket writer). A dispatch serializes the event once and pushes the
//! same frame to each recipient while holding the outlet table lock, so two
//! broadcasts never interleave on any client.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{ChatMessage, Reaction, UserSummary};
use crate::registry::SessionInfo;

/// Frames queued per client before it is considered stuck and dropped.
pub const OUTBOUND_QUEUE: usize = 4096;

/// What a socket writer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum OutboundEvent {
    UserInfo(SessionInfo),
    UserJoined(UserSummary),
    UserLeft {
        id: String,
        username: String,
    },
    OnlineUsers(Vec<UserSummary>),
    RecentMessages(Vec<ChatMessage>),
    MessageReceived(ChatMessage),
    ReactionUpdated {
        message_id: String,
        reactions: Vec<Reaction>,
    },
    UserTyping {
        username: String,
        avatar: Option<String>,
    },
    UserStopTyping {
        username: String,
    },
    MessageDeleted {
        message_id: String,
    },
    MessagesDeletedBulk {
        message_ids: Vec<String>,
    },
    MessagePinUpdated {
        message_id: String,
        is_pinned: bool,
    },
    AdminAnnouncement {
        content: String,
        #[serde(rename = "type")]
        kind: AnnouncementKind,
        timestamp: DateTime<Utc>,
    },
    TriggerGlobalEffect(GlobalEffect),
    UserBanned {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration: Option<u32>,
    },
    UserKicked {
        reason: String,
    },
    Error {
        message: String,
    },
    AdminNotification(serde_json::Value),
}

impl OutboundEvent {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundEvent::Error { message: message.into() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::UserInfo(_) => "user-info",
            OutboundEvent::UserJoined(_) => "user-joined",
            OutboundEvent::UserLeft { .. } => "user-left",
            OutboundEvent::OnlineUsers(_) => "online-users",
            OutboundEvent::RecentMessages(_) => "recent-messages",
            OutboundEvent::MessageReceived(_) => "message-received",
            OutboundEvent::ReactionUpdated { .. } => "reaction-updated",
            OutboundEvent::UserTyping { .. } => "user-typing",
            OutboundEvent::UserStopTyping { .. } => "user-stop-typing",
            OutboundEvent::MessageDeleted { .. } => "message-deleted",
            OutboundEvent::MessagesDeletedBulk { .. } => "messages-deleted-bulk",
            OutboundEvent::MessagePinUpdated { .. } => "message-pin-updated",
            OutboundEvent::AdminAnnouncement { .. } => "admin-announcement",
            OutboundEvent::TriggerGlobalEffect(_) => "trigger-global-effect",
            OutboundEvent::UserBanned { .. } => "user-banned",
            OutboundEvent::UserKicked { .. } => "user-kicked",
            OutboundEvent::Error { .. } => "error",
            OutboundEvent::AdminNotification(_) => "admin-notification",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnouncementKind {
    Info,
    Warning,
    Danger,
}

/// Ephemeral shared UI effect. `duration` is in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalEffect {
    #[serde(rename = "type")]
    pub kind: String,
    pub duration: u64,
    pub triggered_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sound_index: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience<'a> {
    /// Every connection that has joined the room.
    Everyone,
    EveryoneExcept(&'a str),
    /// A single connection, joined or not.
    Connection(&'a str),
    /// Admin observer sessions, optionally minus one.
    Admins { except: Option<&'a str> },
}

struct Outlet {
    tx: mpsc::Sender<Frame>,
    joined: bool,
    admin: bool,
}

impl Outlet {
    fn matches(&self, conn_id: &str, audience: Audience<'_>) -> bool {
        match audience {
            Audience::Everyone => self.joined,
            Audience::EveryoneExcept(except) => self.joined && conn_id != except,
            Audience::Connection(target) => conn_id == target,
            Audience::Admins { except } => self.admin && except != Some(conn_id),
        }
    }
}

#[derive(Default)]
pub struct BroadcastRouter {
    outlets: Mutex<HashMap<String, Outlet>>,
}

impl BroadcastRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection's outbound queue. It only receives targeted
    /// frames until [`BroadcastRouter::mark_joined`].
    pub fn attach(&self, conn_id: &str, tx: mpsc::Sender<Frame>) {
        self.outlets.lock().insert(
            conn_id.to_string(),
            Outlet { tx, joined: false, admin: false },
        );
    }

    pub fn mark_joined(&self, conn_id: &str, admin: bool) {
        if let Some(outlet) = self.outlets.lock().get_mut(conn_id) {
            outlet.joined = true;
            outlet.admin = admin;
        }
    }

    /// Back to targeted frames only, for a join that could not finish.
    pub fn mark_left(&self, conn_id: &str) {
        if let Some(outlet) = self.outlets.lock().get_mut(conn_id) {
            outlet.joined = false;
            outlet.admin = false;
        }
    }

    /// False once the connection was closed, kicked or dropped as stuck.
    pub fn is_attached(&self, conn_id: &str) -> bool {
        self.outlets.lock().contains_key(conn_id)
    }

    pub fn detach(&self, conn_id: &str) {
        self.outlets.lock().remove(conn_id);
    }

    pub fn connection_count(&self) -> usize {
        self.outlets.lock().len()
    }

    /// Serialize once and enqueue to every matching outlet. Returns the
    /// number of clients the frame was queued for.
    pub fn dispatch(&self, audience: Audience<'_>, event: &OutboundEvent) -> usize {
        let outlets = self.outlets.lock();
        Self::fan_out(outlets, audience, event)
    }

    /// Like [`BroadcastRouter::dispatch`], but the event is built while the
    /// outlet table is locked. Snapshots such as the online list then reach
    /// clients in the same order they were taken.
    pub fn dispatch_with(&self, audience: Audience<'_>, build: impl FnOnce() -> OutboundEvent) -> usize {
        let outlets = self.outlets.lock();
        let event = build();
        Self::fan_out(outlets, audience, &event)
    }

    fn fan_out(
        mut outlets: parking_lot::MutexGuard<'_, HashMap<String, Outlet>>,
        audience: Audience<'_>,
        event: &OutboundEvent,
    ) -> usize {
        let text = match serde_json::to_string(event) {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(event = event.name(), error = %e, "Failed to encode event");
                return 0;
            }
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, outlet) in outlets.iter() {
            if !outlet.matches(conn_id, audience) {
                continue;
            }
            match outlet.tx.try_send(Frame::Text(text.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(%conn_id, event = event.name(), "Outbound queue full, dropping client");
                    dead.push(conn_id.clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(conn_id.clone()),
            }
        }
        // Dropping the sender ends the writer, which closes the socket.
        for conn_id in dead {
            outlets.remove(&conn_id);
        }
        delivered
    }

    /// Queue a close for one connection and stop routing to it.
    pub fn close(&self, conn_id: &str) {
        if let Some(outlet) = self.outlets.lock().remove(conn_id) {
            let _ = outlet.tx.try_send(Frame::Close);
        }
    }

    /// Send an event to one connection, then close it.
    pub fn send_and_close(&self, conn_id: &str, event: &OutboundEvent) {
        let mut outlets = self.outlets.lock();
        if let Some(outlet) = outlets.remove(conn_id) {
            match serde_json::to_string(event) {
                Ok(text) => {
                    let _ = outlet.tx.try_send(Frame::Text(text));
                }
                Err(e) => tracing::error!(event = event.name(), error = %e, "Failed to encode event"),
            }
            let _ = outlet.tx.try_send(Frame::Close);
        }
    }
}
