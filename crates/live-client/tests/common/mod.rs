#![allow(dead_code)]

use serde_json::{json, Value};

use livesync_client::socket::{PushRef, Transport};
use livesync_dom::Document;

/// Transport double: records every push and hands out sequential refs so
/// tests can correlate replies precisely.
#[derive(Default)]
pub struct RecordingTransport {
    pub pushes: Vec<RecordedPush>,
    next: u64,
}

#[derive(Debug, Clone)]
pub struct RecordedPush {
    pub push: PushRef,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Transport for RecordingTransport {
    fn push(&mut self, topic: &str, event: &str, payload: &Value) -> PushRef {
        self.next += 1;
        let push = PushRef(self.next);
        self.pushes.push(RecordedPush {
            push,
            topic: topic.to_string(),
            event: event.to_string(),
            payload: payload.clone(),
        });
        push
    }
}

impl RecordingTransport {
    /// The last push of a given channel event, e.g. a pending join.
    pub fn last_of(&self, event: &str) -> Option<&RecordedPush> {
        self.pushes.iter().rev().find(|p| p.event == event)
    }

    pub fn count_of(&self, event: &str) -> usize {
        self.pushes.iter().filter(|p| p.event == event).count()
    }
}

/// A document holding one root session container.
pub fn doc_with_root(view_id: &str) -> Document {
    Document::from_html(&format!(
        r#"<div id="{view_id}" data-live-session="session-token"></div>"#
    ))
    .unwrap()
}

/// A minimal mount reply: one static pair around one dynamic slot.
pub fn simple_mount(text: &str) -> Value {
    json!({ "rendered": { "s": ["<span>", "</span>"], "0": text } })
}

/// A mount whose markup embeds a nested session root owned by `parent`.
pub fn mount_with_child(parent: &str, child: &str) -> Value {
    json!({ "rendered": {
        "s": [
            "<div>parent content</div>",
            "",
        ],
        "0": format!(
            "<div id=\"{child}\" data-live-session=\"child-token\" data-live-parent=\"{parent}\"></div>"
        ),
    }})
}
