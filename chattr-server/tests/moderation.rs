//! Admin actions against live connections.

mod common;

use chattr_server::admin;
use chattr_server::config::ServerConfig;
use chattr_server::router::AnnouncementKind;
use common::{Client, state, state_with};
use serde_json::json;

#[tokio::test]
async fn blocked_address_is_refused_before_joining() {
    let state = state();
    admin::block_ip(&state, "198.51.100.7", Some("spam")).unwrap();

    let mut client = Client::connect(&state, "198.51.100.7");
    assert_eq!(client.expect_error().await, "You are blocked from this chat.");
    client.expect_closed().await;
    assert_eq!(state.registry.online_count(), 0);

    admin::unblock_ip(&state, "198.51.100.7").unwrap();
    let mut client = Client::connect(&state, "198.51.100.7");
    client.send("join", json!({ "username": "mallory" })).await;
    client.expect("user-info").await;
}

#[tokio::test]
async fn blocking_drops_live_sessions_from_that_address() {
    let state = state();
    let mut watcher = Client::join(&state, "watcher").await;
    let mut target = Client::connect(&state, "198.51.100.8");
    target.send("join", json!({ "username": "mallory" })).await;
    target.expect("user-info").await;
    watcher.wait_for("online-users").await;

    admin::block_ip(&state, "198.51.100.8", None).unwrap();
    target.wait_for("error").await;
    target.expect_closed().await;
    // The actor only leaves once its transport is gone.
    target.disconnect().await;
    assert_eq!(watcher.expect("user-left").await["username"], "mallory");
}

#[tokio::test]
async fn connection_blocked_before_joining_cannot_join() {
    let state = state();
    let mut client = Client::connect(&state, "198.51.100.9");
    // Proves the connection got past the gate while the address was clean.
    client.say("hello?").await;
    assert_eq!(client.expect_error().await, "You must join the chat first");

    admin::block_ip(&state, "198.51.100.9", None).unwrap();
    client.send("join", json!({ "username": "sneaky" })).await;
    assert_eq!(client.expect_error().await, "You are blocked from this chat.");
    client.expect_closed().await;
    assert_eq!(state.registry.online_count(), 0);
}

#[tokio::test]
async fn banned_session_cannot_post_what_it_already_queued() {
    let state = state();
    let mut watcher = Client::join(&state, "watcher").await;
    let mut target = Client::join(&state, "troll").await;
    watcher.wait_for("online-users").await;
    let user_id = state.registry.get(&target.id).unwrap().user_id;

    admin::ban_user(&state, &user_id, None, None).unwrap();
    target.expect("user-banned").await;
    target.say("still here after ban").await;

    // The actor drops the queued events and leaves.
    assert_eq!(watcher.expect("user-left").await["username"], "troll");
    watcher.expect("online-users").await;
    target.expect_closed().await;
    target.disconnect().await;
    watcher.assert_idle();

    let stored = state.with_db(|db| db.recent_messages(10, 1, chrono::Utc::now())).unwrap();
    assert!(stored.is_empty());
}

#[tokio::test]
async fn kicked_session_cannot_react_after_the_kick() {
    let state = state();
    let mut watcher = Client::join(&state, "watcher").await;
    watcher.say("react to me").await;
    let id = watcher.expect("message-received").await["id"].as_str().unwrap().to_string();

    let mut target = Client::join(&state, "noisy").await;
    watcher.wait_for("online-users").await;
    let user_id = state.registry.get(&target.id).unwrap().user_id;

    admin::kick_user(&state, &user_id, Some("cool off")).unwrap();
    assert_eq!(target.expect("user-kicked").await["reason"], "cool off");
    target.send("toggle-reaction", json!({ "messageId": id, "emoji": "👍" })).await;

    assert_eq!(watcher.expect("user-left").await["username"], "noisy");
    target.disconnect().await;
    let reactions = state.with_db(|db| db.reactions_for(&id)).unwrap();
    assert!(reactions.is_empty());
}

#[tokio::test]
async fn ban_closes_the_session_and_blocks_rejoin() {
    let state = state();
    let mut watcher = Client::join(&state, "watcher").await;
    let mut target = Client::join(&state, "troll").await;
    watcher.wait_for("online-users").await;
    let user_id = state.registry.get(&target.id).unwrap().user_id;

    assert_eq!(admin::ban_user(&state, &user_id, Some(2), Some("flooding")).unwrap(), 1);
    let banned = target.expect("user-banned").await;
    assert_eq!(banned["reason"], "flooding");
    assert_eq!(banned["duration"], 2);
    target.expect_closed().await;
    target.disconnect().await;
    watcher.expect("user-left").await;

    let mut again = Client::connect(&state, "192.0.2.1");
    again.send("join", json!({ "username": "troll" })).await;
    assert!(again.expect_error().await.starts_with("You are banned until"));
    again.expect_closed().await;

    admin::unban_user(&state, &user_id).unwrap();
    let mut again = Client::connect(&state, "192.0.2.1");
    again.send("join", json!({ "username": "troll" })).await;
    again.expect("user-info").await;
}

#[tokio::test]
async fn kick_disconnects_without_banning() {
    let state = state();
    let mut target = Client::join(&state, "noisy").await;
    let user_id = state.registry.get(&target.id).unwrap().user_id;

    assert_eq!(admin::kick_user(&state, &user_id, None).unwrap(), 1);
    assert_eq!(target.expect("user-kicked").await["reason"], "Kicked by an administrator");
    target.expect_closed().await;
    target.disconnect().await;

    let again = Client::join(&state, "noisy").await;
    assert!(state.registry.get(&again.id).is_some());
}

#[tokio::test]
async fn pins_and_announcements_reach_everyone() {
    let state = state();
    let mut alice = Client::join(&state, "alice").await;
    alice.say("pin me").await;
    let id = alice.expect("message-received").await["id"].as_str().unwrap().to_string();

    assert!(admin::toggle_pin(&state, &id).unwrap());
    let pinned = alice.expect("message-pin-updated").await;
    assert_eq!(pinned, json!({ "messageId": id, "isPinned": true }));

    admin::announce(&state, "Server restarts at noon", AnnouncementKind::Danger).unwrap();
    let note = alice.expect("admin-announcement").await;
    assert_eq!(note["content"], "Server restarts at noon");
    assert_eq!(note["type"], "danger");
    assert!(note["timestamp"].is_string());
}

#[tokio::test]
async fn admin_observers_relay_actions_to_each_other() {
    let config = ServerConfig { admin_token: Some("letmein".into()), ..Default::default() };
    let state = state_with(config);

    let mut ops_one = Client::connect(&state, "192.0.2.10");
    ops_one.send("join", json!({ "username": "ops1", "adminToken": "letmein" })).await;
    assert_eq!(ops_one.expect("user-info").await["isAdmin"], true);
    ops_one.wait_for("online-users").await;

    let mut ops_two = Client::connect(&state, "192.0.2.11");
    ops_two.send("join", json!({ "username": "ops2", "adminToken": "letmein" })).await;
    ops_two.wait_for("online-users").await;
    ops_one.wait_for("online-users").await;

    let mut bob = Client::connect(&state, "192.0.2.12");
    bob.send("join", json!({ "username": "bob", "adminToken": "guess" })).await;
    assert_eq!(bob.expect("user-info").await["isAdmin"], false);
    bob.wait_for("online-users").await;
    ops_one.wait_for("online-users").await;
    ops_two.wait_for("online-users").await;

    ops_one.send("admin-action", json!({ "kind": "note", "text": "watch bob" })).await;
    let relayed = ops_two.expect("admin-notification").await;
    assert_eq!(relayed["from"], "ops1");
    assert_eq!(relayed["action"]["text"], "watch bob");

    bob.send("admin-action", json!({ "kind": "note" })).await;
    assert_eq!(bob.expect_error().await, "Admin privileges required");

    // Neither the sender nor regular users see the relay.
    ops_one.say("checkpoint").await;
    assert_eq!(ops_one.expect("message-received").await["content"], "checkpoint");
    assert_eq!(bob.expect("message-received").await["content"], "checkpoint");
}
