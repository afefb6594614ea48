//! Wire vocabulary: diff payload keys, channel event names, and the
//! attribute markers the runtime reads and writes on live elements.
//!
//! Diff keys are single/double letters to keep payloads small. Dynamics are
//! keyed by decimal-string indices (`"0"`, `"1"`, …) next to the letter
//! keys; a key is a dynamic index iff it parses as `usize`.

use serde_json::Value;

use crate::error::ClientError;

// ── Diff payload keys ─────────────────────────────────────────────────────

pub const STATICS: &str = "s";
pub const ROOT: &str = "r";
pub const COMPONENTS: &str = "c";
pub const EVENTS: &str = "e";
pub const TITLE: &str = "t";
pub const TEMPLATES: &str = "p";
pub const DYNAMICS: &str = "d";
pub const STREAM: &str = "stream";

// ── Element attribute markers ─────────────────────────────────────────────

/// Session payload carried on a View root element.
pub const SESSION_ATTR: &str = "data-live-session";
/// Static-render verification token on a View root element.
pub const STATIC_ATTR: &str = "data-live-static";
/// Names the owning parent session on a nested View root.
pub const PARENT_ATTR: &str = "data-live-parent";
/// Names the root session of the tree a nested View belongs to.
pub const ROOT_ATTR: &str = "data-live-root";
/// Synthetic per-root identity ("magic id").
pub const MAGIC_ID_ATTR: &str = "data-live-id";
/// Marks a placeholder whose live counterpart must be left untouched.
pub const SKIP_ATTR: &str = "data-live-skip";
/// Component id of an embedded component's root element.
pub const COMPONENT_ATTR: &str = "data-live-component";
/// Pending loading-operation ref.
pub const REF_LOADING_ATTR: &str = "data-live-ref-loading";
/// Pending lock-operation ref.
pub const REF_LOCK_ATTR: &str = "data-live-ref-lock";
/// Reconciliation policy: `ignore` or `stream`.
pub const UPDATE_ATTR: &str = "live-update";
/// Stream membership marker on stream container children.
pub const STREAM_ATTR: &str = "data-live-stream";
/// Removal is transition-gated; an external timer prunes the element.
pub const PRUNING_ATTR: &str = "data-live-pruning";
/// Names the hook bound to an element.
pub const HOOK_ATTR: &str = "live-hook";

pub const UPDATE_IGNORE: &str = "ignore";
pub const UPDATE_STREAM: &str = "stream";

// ── Session root CSS state classes ────────────────────────────────────────

pub const CLASS_CONNECTED: &str = "live-connected";
pub const CLASS_LOADING: &str = "live-loading";
pub const CLASS_ERROR: &str = "live-error";
pub const CLASS_CLIENT_ERROR: &str = "live-client-error";
pub const CLASS_SERVER_ERROR: &str = "live-server-error";

// ── Channel events ────────────────────────────────────────────────────────

pub const EVENT_DIFF: &str = "diff";
pub const EVENT_LIVE_PATCH: &str = "live_patch";
pub const EVENT_LIVE_REDIRECT: &str = "live_redirect";
pub const EVENT_REDIRECT: &str = "redirect";
pub const EVENT_CIDS_WILL_DESTROY: &str = "cids_will_destroy";
pub const EVENT_CIDS_DESTROYED: &str = "cids_destroyed";

pub const PUSH_JOIN: &str = "live_join";
pub const PUSH_EVENT: &str = "event";
pub const PUSH_CIDS_DESTROYED: &str = "cids_destroyed";

/// Channel topic for a session id.
pub fn topic(view_id: &str) -> String {
    format!("live:{view_id}")
}

/// View id for a channel topic, if it is a session topic.
pub fn view_id_of_topic(topic: &str) -> Option<&str> {
    topic.strip_prefix("live:")
}

// ── Inbound event decode ──────────────────────────────────────────────────

/// A decoded steady-state channel event for one session.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Diff(Value),
    LivePatch { to: String },
    LiveRedirect { to: String },
    Redirect { to: String },
    CidsWillDestroy { cids: Vec<i64> },
    CidsDestroyed { cids: Vec<i64> },
}

impl ServerEvent {
    pub fn decode(event: &str, payload: Value) -> Result<Self, ClientError> {
        match event {
            EVENT_DIFF => Ok(ServerEvent::Diff(payload)),
            EVENT_LIVE_PATCH => Ok(ServerEvent::LivePatch { to: decode_to(&payload)? }),
            EVENT_LIVE_REDIRECT => Ok(ServerEvent::LiveRedirect { to: decode_to(&payload)? }),
            EVENT_REDIRECT => Ok(ServerEvent::Redirect { to: decode_to(&payload)? }),
            EVENT_CIDS_WILL_DESTROY => {
                Ok(ServerEvent::CidsWillDestroy { cids: decode_cids(&payload)? })
            }
            EVENT_CIDS_DESTROYED => {
                Ok(ServerEvent::CidsDestroyed { cids: decode_cids(&payload)? })
            }
            other => Err(ClientError::Desync(format!("unknown channel event {other:?}"))),
        }
    }
}

fn decode_to(payload: &Value) -> Result<String, ClientError> {
    payload
        .get("to")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ClientError::Desync("navigation event missing \"to\"".into()))
}

fn decode_cids(payload: &Value) -> Result<Vec<i64>, ClientError> {
    payload
        .get("cids")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_i64).collect())
        .ok_or_else(|| ClientError::Desync("cids event missing \"cids\"".into()))
}

/// Whether a diff-object key addresses a dynamic slot.
pub fn dynamic_index(key: &str) -> Option<usize> {
    key.parse().ok()
}
