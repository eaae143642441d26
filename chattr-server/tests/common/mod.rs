//! In-process chat clients for driving connection actors without sockets.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chattr_server::config::ServerConfig;
use chattr_server::connection::{self, InboundEvent};
use chattr_server::db::Db;
use chattr_server::model::GlobalSettings;
use chattr_server::router::Frame;
use chattr_server::server::SharedState;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn state() -> Arc<SharedState> {
    state_with(ServerConfig::default())
}

pub fn state_with(config: ServerConfig) -> Arc<SharedState> {
    Arc::new(SharedState::new(config, Db::open_memory().unwrap()).unwrap())
}

pub fn set_settings(state: &SharedState, settings: GlobalSettings) {
    chattr_server::admin::update_settings(state, settings).unwrap();
}

pub struct Client {
    pub id: String,
    tx: Option<mpsc::Sender<InboundEvent>>,
    rx: mpsc::Receiver<Frame>,
    task: Option<JoinHandle<()>>,
}

impl Client {
    pub fn connect(state: &Arc<SharedState>, ip: &str) -> Self {
        let attached = connection::attach(Arc::clone(state), ip.to_string());
        Self {
            id: attached.id,
            tx: Some(attached.inbound),
            rx: attached.outbound,
            task: Some(attached.task),
        }
    }

    /// Connect and join, consuming the join replies.
    pub async fn join(state: &Arc<SharedState>, username: &str) -> Self {
        let mut client = Self::connect(state, "192.0.2.1");
        client.send("join", json!({ "username": username })).await;
        client.expect("user-info").await;
        client.expect("recent-messages").await;
        client.expect("online-users").await;
        client
    }

    pub async fn send(&self, event: &str, data: Value) {
        let text = json!({ "event": event, "data": data }).to_string();
        self.send_raw(&text).await;
    }

    pub async fn send_raw(&self, text: &str) {
        let tx = self.tx.as_ref().expect("client already disconnected");
        tx.send(InboundEvent::parse(text)).await.unwrap();
    }

    pub async fn say(&self, content: &str) {
        self.send("send-message", json!({ "content": content, "type": "text" })).await;
    }

    /// Next frame as `{event, data}`. Panics on close or timeout.
    pub async fn next(&mut self) -> Value {
        match timeout(TIMEOUT, self.rx.recv()).await {
            Ok(Some(Frame::Text(text))) => serde_json::from_str(&text).unwrap(),
            Ok(Some(Frame::Close)) => panic!("connection closed"),
            Ok(None) => panic!("outlet dropped"),
            Err(_) => panic!("no frame within {TIMEOUT:?}"),
        }
    }

    /// Next frame, which must be `event`. Returns its data.
    pub async fn expect(&mut self, event: &str) -> Value {
        let frame = self.next().await;
        assert_eq!(frame["event"], event, "unexpected frame {frame}");
        frame["data"].clone()
    }

    /// Skip frames until `event` arrives. Returns its data.
    pub async fn wait_for(&mut self, event: &str) -> Value {
        loop {
            let frame = self.next().await;
            if frame["event"] == event {
                return frame["data"].clone();
            }
        }
    }

    /// Error text of the next frame, which must be an `error` event.
    pub async fn expect_error(&mut self) -> String {
        let data = self.expect("error").await;
        data["message"].as_str().unwrap().to_string()
    }

    /// The outlet must be closed next, optionally after a queued close frame.
    pub async fn expect_closed(&mut self) {
        match timeout(TIMEOUT, self.rx.recv()).await {
            Ok(Some(Frame::Close)) | Ok(None) => {}
            Ok(Some(Frame::Text(text))) => panic!("expected close, got {text}"),
            Err(_) => panic!("connection not closed within {TIMEOUT:?}"),
        }
    }

    /// Nothing is queued right now.
    pub fn assert_idle(&mut self) {
        if let Ok(frame) = self.rx.try_recv() {
            panic!("unexpected frame {frame:?}");
        }
    }

    /// Drop the transport and wait for the actor's leave handling.
    pub async fn disconnect(mut self) {
        self.tx.take();
        if let Some(task) = self.task.take() {
            timeout(TIMEOUT, task).await.unwrap().unwrap();
        }
    }
}
