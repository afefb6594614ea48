//! Transition gating: document mutation is deferred while visual
//! transitions run.
//!
//! Timers are abstract handles completed by the host; nothing here sleeps.
//! Work queued behind the set is plain data (a [`QueuedMessage`]) rather
//! than a closure, so the socket replays it through its normal dispatch
//! path once the set drains, and messages belonging to a since-destroyed
//! session can be dropped by id.

use indexmap::IndexSet;
use serde_json::Value;
use tracing::trace;

/// Host-completed handle for one outstanding transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// A deferred unit of work, tagged with the session it targets. Work
/// deferred from a push reply carries the operation ref it settles, so
/// the replay path can correlate the diff and clear the optimistic
/// decorations it left behind.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub view_id: String,
    pub event: String,
    pub payload: Value,
    pub op_ref: Option<u64>,
}

#[derive(Debug, Default)]
pub struct TransitionSet {
    next_timer: u64,
    active: IndexSet<TimerId>,
    queue: Vec<QueuedMessage>,
}

impl TransitionSet {
    pub fn new() -> Self {
        TransitionSet::default()
    }

    /// Register a transition; the host must later call [`complete`].
    ///
    /// [`complete`]: TransitionSet::complete
    pub fn start(&mut self) -> TimerId {
        self.next_timer += 1;
        let timer = TimerId(self.next_timer);
        self.active.insert(timer);
        timer
    }

    /// Complete a transition. Returns the queued messages ready to run, in
    /// arrival order, when this was the last outstanding transition.
    pub fn complete(&mut self, timer: TimerId) -> Vec<QueuedMessage> {
        self.active.swap_remove(&timer);
        if self.active.is_empty() {
            let ready = std::mem::take(&mut self.queue);
            if !ready.is_empty() {
                trace!(count = ready.len(), "transition set drained");
            }
            ready
        } else {
            Vec::new()
        }
    }

    pub fn busy(&self) -> bool {
        !self.active.is_empty()
    }

    /// Defer `message` until the set is empty. Callers check [`busy`] first
    /// and run immediately when it is false.
    ///
    /// [`busy`]: TransitionSet::busy
    pub fn defer(&mut self, message: QueuedMessage) {
        self.queue.push(message);
    }

    /// Drop deferred work for a destroyed session.
    pub fn discard_view(&mut self, view_id: &str) {
        self.queue.retain(|m| m.view_id != view_id);
    }
}
