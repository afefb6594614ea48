mod common;

use serde_json::json;

use common::{doc_with_root, mount_with_child, simple_mount, RecordingTransport};
use livesync_client::socket::{LiveSocket, MainEffect, ReplyStatus, SocketOpts};
use livesync_client::view::ViewState;
use livesync_client::HookRegistry;
use livesync_dom::Document;

fn socket() -> LiveSocket<RecordingTransport> {
    LiveSocket::new(RecordingTransport::default(), HookRegistry::new(), SocketOpts::default())
}

// ── Nested sessions join atomically ───────────────────────────────────────

#[test]
fn parent_mount_is_held_until_child_joins() {
    let mut doc = doc_with_root("p1");
    let mut socket = socket();
    socket.connect(&mut doc);
    let parent_join = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, parent_join, ReplyStatus::Ok, &mount_with_child("p1", "c1"))
        .unwrap();

    // Parent's ok arrived but a same-batch child is outstanding: nothing
    // is visible and the child's own join is already in flight.
    assert_eq!(socket.view_state("p1"), Some(ViewState::JoinPending));
    assert_eq!(socket.view_state("c1"), Some(ViewState::JoinPending));
    let container = doc.get_element_by_id("p1").unwrap();
    assert_eq!(doc.inner_html(container), "");
    let child_join = socket.transport().last_of("live_join").unwrap();
    assert_eq!(child_join.topic, "live:c1");

    let child_push = child_join.push;
    socket
        .handle_reply(&mut doc, child_push, ReplyStatus::Ok, &simple_mount("child body"))
        .unwrap();

    // Both trees become visible in the same step.
    assert_eq!(socket.view_state("p1"), Some(ViewState::Joined));
    assert_eq!(socket.view_state("c1"), Some(ViewState::Joined));
    let container = doc.get_element_by_id("p1").unwrap();
    assert!(doc.inner_html(container).contains("parent content"));
    let child = doc.get_element_by_id("c1").unwrap();
    assert!(doc.inner_html(child).contains("child body"));
    assert!(doc.has_class(child, "live-connected"));
}

#[test]
fn child_diff_during_parent_join_applies_after_both_join() {
    let mut doc = doc_with_root("p1");
    let mut socket = socket();
    socket.connect(&mut doc);
    let parent_join = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, parent_join, ReplyStatus::Ok, &mount_with_child("p1", "c1"))
        .unwrap();
    let child_push = socket.transport().last_of("live_join").unwrap().push;

    // A diff for the child races its join reply: it must queue.
    socket
        .handle_message(&mut doc, "live:c1", "diff", json!({"0": "updated"}))
        .unwrap();
    socket
        .handle_reply(&mut doc, child_push, ReplyStatus::Ok, &simple_mount("initial"))
        .unwrap();
    let child = doc.get_element_by_id("c1").unwrap();
    assert!(doc.inner_html(child).contains("updated"));
}

// ── Session teardown ──────────────────────────────────────────────────────

#[test]
fn dropped_child_container_destroys_the_child_session() {
    let mut doc = doc_with_root("p1");
    let mut socket = socket();
    socket.connect(&mut doc);
    let parent_join = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, parent_join, ReplyStatus::Ok, &mount_with_child("p1", "c1"))
        .unwrap();
    let child_push = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, child_push, ReplyStatus::Ok, &simple_mount("child"))
        .unwrap();
    assert!(socket.view("c1").is_some());

    // The parent's next render no longer includes the child.
    socket
        .handle_message(&mut doc, "live:p1", "diff", json!({"0": ""}))
        .unwrap();
    assert!(socket.view("c1").is_none());
    assert!(doc.get_element_by_id("c1").is_none());
    assert_eq!(socket.view_state("p1"), Some(ViewState::Joined));
}

// ── Reconnection ──────────────────────────────────────────────────────────

#[test]
fn disconnect_destroys_children_and_rejoin_counts_mounts() {
    let mut doc = doc_with_root("p1");
    let mut socket = socket();
    socket.connect(&mut doc);
    let parent_join = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, parent_join, ReplyStatus::Ok, &mount_with_child("p1", "c1"))
        .unwrap();
    let child_push = socket.transport().last_of("live_join").unwrap().push;
    socket
        .handle_reply(&mut doc, child_push, ReplyStatus::Ok, &simple_mount("child"))
        .unwrap();

    socket.handle_disconnect(&mut doc);
    // No partial trees: the nested session is gone, the root survives in
    // a disconnected state and a reconnect is scheduled.
    assert!(socket.view("c1").is_none());
    assert_eq!(socket.view_state("p1"), Some(ViewState::Disconnected));
    let root = doc.get_element_by_id("p1").unwrap();
    assert!(doc.has_class(root, "live-error"));
    let effects = socket.take_effects();
    assert!(effects
        .iter()
        .any(|e| matches!(e, MainEffect::ScheduleReconnect { .. })));

    socket.reconnect(&mut doc);
    assert_eq!(socket.view_state("p1"), Some(ViewState::JoinPending));
    let rejoin = socket.transport().last_of("live_join").unwrap();
    assert_eq!(rejoin.topic, "live:p1");
    assert_eq!(rejoin.payload["joins"], 1, "rejoin reports the mount counter");
}

// ── Component GC handshake ────────────────────────────────────────────────

#[test]
fn gc_handshake_prunes_only_confirmed_unreferenced_components() {
    let mut doc = doc_with_root("v1");
    let mut socket = socket();
    socket.connect(&mut doc);
    let join = socket.transport().last_of("live_join").unwrap().push;
    let mount = json!({ "rendered": {
        "s": ["<div>", "</div>"],
        "0": 1,
        "c": { "1": { "s": ["<p>component</p>"] } },
    }});
    socket.handle_reply(&mut doc, join, ReplyStatus::Ok, &mount).unwrap();
    let container = doc.get_element_by_id("v1").unwrap();
    assert!(doc.inner_html(container).contains("component"));

    // Still referenced in the document: the proposal is filtered out and
    // nothing is confirmed to the server.
    socket
        .handle_message(&mut doc, "live:v1", "cids_will_destroy", json!({"cids": [1]}))
        .unwrap();
    assert_eq!(socket.transport().count_of("cids_destroyed"), 0);

    // The next render drops the component reference.
    socket
        .handle_message(&mut doc, "live:v1", "diff", json!({"0": ""}))
        .unwrap();
    socket
        .handle_message(&mut doc, "live:v1", "cids_will_destroy", json!({"cids": [1]}))
        .unwrap();
    let confirm = socket.transport().last_of("cids_destroyed").unwrap();
    assert_eq!(confirm.payload["cids"], json!([1]));

    let confirm_push = confirm.push;
    socket
        .handle_reply(&mut doc, confirm_push, ReplyStatus::Ok, &json!({}))
        .unwrap();
    let view = socket.view("v1").unwrap();
    assert!(view.rendered.component_ids().is_empty());
}
