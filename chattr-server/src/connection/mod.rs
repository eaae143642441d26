//! Per-client connection actor.
//!
//! Each client gets a task that drains typed [`InboundEvent`]s in order and
//! pushes [`Frame`]s to its outlet in the broadcast router. The transport
//! (WebSocket in `web`, plain channels in tests) only shuttles frames.
//!
//! - [`presence`]: join, leave and typing
//! - [`messaging`]: sending, reactions and the admin relay
//!
//! `Connection::handle` is the single place where a [`ChatError`] becomes an
//! `error` event and where a forced close is decided.

mod events;
mod messaging;
mod presence;

pub use events::{InboundEvent, JoinRequest, ReactionRequest};

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ChatError, ChatResult};
use crate::registry::Session;
use crate::router::{Audience, Frame, OUTBOUND_QUEUE, OutboundEvent};
use crate::server::SharedState;

/// Inbound events buffered per client before the reader waits.
const INBOUND_QUEUE: usize = 64;

/// State of a single client connection.
pub struct Connection {
    pub id: String,
    pub ip: String,
    state: Arc<SharedState>,
}

/// Handles to a running connection actor.
pub struct Attached {
    pub id: String,
    pub inbound: mpsc::Sender<InboundEvent>,
    pub outbound: mpsc::Receiver<Frame>,
    pub task: JoinHandle<()>,
}

/// Register an outlet for a new client and spawn its actor.
pub fn attach(state: Arc<SharedState>, ip: String) -> Attached {
    let id = crate::msgid::generate();
    let (in_tx, in_rx) = mpsc::channel(INBOUND_QUEUE);
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    state.router.attach(&id, out_tx);
    tracing::info!(conn_id = %id, %ip, "New connection");

    let conn = Connection { id: id.clone(), ip, state };
    let task = tokio::spawn(conn.run(in_rx));
    Attached { id, inbound: in_tx, outbound: out_rx, task }
}

impl Connection {
    async fn run(self, mut inbound: mpsc::Receiver<InboundEvent>) {
        if let Err(e) = self.state.with_db(|db| crate::gate::admit(db, &self.ip)) {
            self.state
                .router
                .send_and_close(&self.id, &OutboundEvent::error(e.client_message()));
            tracing::info!(conn_id = %self.id, ip = %self.ip, "Connection refused: {e}");
            return;
        }

        while let Some(event) = inbound.recv().await {
            if !self.handle(event) {
                break;
            }
        }
        self.cleanup();
    }

    /// Process one event. Returns false when the connection must close.
    fn handle(&self, event: InboundEvent) -> bool {
        let name = event.name();
        // A moderated or stuck connection has lost its outlet; anything
        // still buffered from it is dropped.
        if !self.state.router.is_attached(&self.id) {
            tracing::debug!(conn_id = %self.id, event = name, "Outlet gone, discarding event");
            return false;
        }
        tracing::debug!(conn_id = %self.id, event = name, "<- event");
        let result = match event {
            InboundEvent::Join(req) => self.handle_join(req),
            InboundEvent::SendMessage(req) => self.handle_send(req),
            InboundEvent::ToggleReaction(req) => self.handle_reaction(req),
            InboundEvent::TypingStart => self.handle_typing(true),
            InboundEvent::TypingStop => self.handle_typing(false),
            InboundEvent::AdminAction(data) => self.handle_admin_action(data),
            InboundEvent::Malformed(reason) => Err(ChatError::validation(reason)),
        };
        let Err(err) = result else {
            return true;
        };

        let reply = OutboundEvent::error(err.client_message());
        if err.forces_disconnect() {
            tracing::warn!(conn_id = %self.id, event = name, "Closing connection: {err}");
            self.state.router.send_and_close(&self.id, &reply);
            return false;
        }
        match &err {
            ChatError::Store(_) | ChatError::Dependency(_) => {
                tracing::error!(conn_id = %self.id, event = name, "{err}")
            }
            _ => tracing::debug!(conn_id = %self.id, event = name, "Rejected: {err}"),
        }
        self.state.router.dispatch(Audience::Connection(&self.id), &reply);
        true
    }

    fn session(&self) -> ChatResult<Session> {
        self.state
            .registry
            .get(&self.id)
            .ok_or_else(|| ChatError::validation("You must join the chat first"))
    }
}
