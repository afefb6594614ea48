//! Per-session state machine.
//!
//! A `View` tracks one server session: its rendered tree, its connection
//! state, diffs queued while a join is in flight, and the bookkeeping for
//! atomic nested joins (a parent's mount markup becomes visible only once
//! every same-batch child session has joined). The socket drives all
//! transitions; this module holds the state and the queueing rules.

use std::collections::VecDeque;

use indexmap::IndexSet;
use serde_json::{json, Value};

use crate::protocol;
use crate::rendered::{Rendered, StreamMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    /// `live_join` pushed, ok not yet applied.
    JoinPending,
    Joined,
    /// Transport lost; roots rejoin, children are destroyed instead.
    Disconnected,
    Destroyed,
}

/// Mount output held back until the session tree is ready to show it.
#[derive(Debug, Clone)]
pub struct PendingMount {
    pub html: String,
    pub streams: Vec<StreamMeta>,
    pub title: Option<String>,
    pub events: Vec<Value>,
}

#[derive(Debug)]
pub struct View {
    pub id: String,
    pub parent: Option<String>,
    pub state: ViewState,
    pub rendered: Rendered,
    /// Consecutive mounts of this session, reported to the server so it
    /// can distinguish a rejoin from a first mount.
    pub join_count: u32,
    pub session_token: String,
    pub static_token: Option<String>,
    /// Children by view id, in discovery order.
    pub children: IndexSet<String>,
    /// Same-batch children whose joins have not settled yet.
    pub pending_join_children: IndexSet<String>,
    /// Server-acknowledged mount waiting on children or on the parent's
    /// own patch to insert this session's container.
    pub pending_mount: Option<PendingMount>,
    /// Join ok received and all same-batch children settled; the mount
    /// applies as soon as the container exists in the document.
    pub ready: bool,
    queued_diffs: VecDeque<Value>,
}

impl View {
    pub fn new(id: &str, parent: Option<&str>, session_token: &str) -> Self {
        View {
            id: id.to_string(),
            parent: parent.map(str::to_string),
            state: ViewState::JoinPending,
            rendered: Rendered::new(id),
            join_count: 0,
            session_token: session_token.to_string(),
            static_token: None,
            children: IndexSet::new(),
            pending_join_children: IndexSet::new(),
            pending_mount: None,
            ready: false,
            queued_diffs: VecDeque::new(),
        }
    }

    pub fn topic(&self) -> String {
        protocol::topic(&self.id)
    }

    pub fn is_joined(&self) -> bool {
        self.state == ViewState::Joined
    }

    pub fn join_payload(&self, params: &Value) -> Value {
        let mut payload = json!({
            "session": self.session_token,
            "params": params,
            "joins": self.join_count,
        });
        if let (Some(obj), Some(static_token)) =
            (payload.as_object_mut(), self.static_token.as_deref())
        {
            obj.insert("static".to_string(), json!(static_token));
        }
        payload
    }

    /// Whether inbound diffs must queue instead of applying now.
    pub fn must_queue(&self) -> bool {
        self.state != ViewState::Joined
    }

    pub fn queue_diff(&mut self, diff: Value) {
        self.queued_diffs.push_back(diff);
    }

    /// Diffs to replay in arrival order once the join settles.
    pub fn drain_queued(&mut self) -> Vec<Value> {
        self.queued_diffs.drain(..).collect()
    }

    /// Record that a same-batch child's join settled. True when this was
    /// the last one outstanding.
    pub fn child_join_settled(&mut self, child_id: &str) -> bool {
        self.pending_join_children.shift_remove(child_id);
        self.pending_join_children.is_empty()
    }

    /// Reset for a from-scratch rejoin after transport loss. The rendered
    /// tree is rebuilt by the next mount; queued work is stale.
    pub fn reset_for_rejoin(&mut self) {
        self.state = ViewState::JoinPending;
        self.rendered = Rendered::new(&self.id);
        self.join_count += 1;
        self.children.clear();
        self.pending_join_children.clear();
        self.pending_mount = None;
        self.ready = false;
        self.queued_diffs.clear();
    }
}
