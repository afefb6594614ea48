//! Connection orchestrator.
//!
//! `LiveSocket` owns the session table, the ref ledger, the hook table,
//! the transition set, and the reconnect state. The document itself is
//! owned by the host and lent into every entry point; no method holds a
//! borrow across a suspension. There is no async runtime anywhere: pushes
//! return a [`PushRef`], the host delivers replies through
//! [`LiveSocket::handle_reply`], and timers are completed explicitly.
//!
//! Side effects that must run outside the runtime (navigation, titles,
//! scheduling a reconnect attempt) accumulate as [`MainEffect`]s and are
//! drained by the host after each entry point returns.

use indexmap::{IndexMap, IndexSet};
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use livesync_dom::{Document, NodeId};

use crate::error::ClientError;
use crate::hooks::{HookEffect, HookRegistry, HookStage, HookTable};
use crate::patch::{self, Patch, PatchEvent, PatchKind, PatchResult};
use crate::protocol::{
    self, ServerEvent, CLASS_CONNECTED, CLASS_ERROR, CLASS_LOADING, CLASS_SERVER_ERROR,
    COMPONENT_ATTR, EVENT_DIFF, HOOK_ATTR, PARENT_ATTR, PUSH_CIDS_DESTROYED, PUSH_EVENT,
    PUSH_JOIN, REF_LOADING_ATTR, REF_LOCK_ATTR, ROOT_ATTR, SESSION_ATTR, STATIC_ATTR,
};
use crate::refs::{RefKind, RefLedger};
use crate::rendered::Rendered;
use crate::transitions::{QueuedMessage, TimerId, TransitionSet};
use crate::view::{PendingMount, View, ViewState};

// ── Transport seam ────────────────────────────────────────────────────────

/// Correlation handle for one push; the host echoes it back with the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushRef(pub u64);

/// The connection seam. Implementations deliver replies back through
/// [`LiveSocket::handle_reply`] and server events through
/// [`LiveSocket::handle_message`].
pub trait Transport {
    fn push(&mut self, topic: &str, event: &str, payload: &Value) -> PushRef;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Timeout,
}

// ── Host-facing effects ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigateKind {
    /// Same-session URL patch.
    Patch,
    /// Full navigation to a new session.
    Redirect,
}

/// Work the host performs outside the runtime, drained via
/// [`LiveSocket::take_effects`] after every entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum MainEffect {
    SetTitle(String),
    /// A server-pushed event carried on a diff, to be dispatched by the
    /// host's event system.
    ServerEvent { view_id: String, payload: Value },
    Navigate { kind: NavigateKind, to: String },
    /// Join was rejected and will not be retried.
    FallbackRedirect { reason: String },
    /// Call [`LiveSocket::reconnect`] once the transport is back, no
    /// sooner than `after_ms` from now.
    ScheduleReconnect { after_ms: u64 },
    /// Protocol desync; the only recovery is a full page reload.
    Reload { reason: String },
}

// ── Options & backoff ─────────────────────────────────────────────────────

const RECONNECT_LADDER_MS: &[u64] = &[10, 50, 100, 150, 200, 250, 500, 1000, 2000];
const FAILSAFE_BASE_MS: u64 = 5000;
const FAILSAFE_JITTER_MS: u64 = 2500;

#[derive(Debug, Clone)]
pub struct SocketOpts {
    /// Connect params echoed in every join payload.
    pub params: Value,
}

impl Default for SocketOpts {
    fn default() -> Self {
        SocketOpts { params: json!({}) }
    }
}

// ── Pending replies ───────────────────────────────────────────────────────

#[derive(Debug)]
enum PendingReply {
    Join { view_id: String },
    Event { view_id: String, op_ref: u64 },
    CidsDestroy { view_id: String, cids: Vec<i64> },
}

impl PendingReply {
    fn view_id(&self) -> &str {
        match self {
            PendingReply::Join { view_id }
            | PendingReply::Event { view_id, .. }
            | PendingReply::CidsDestroy { view_id, .. } => view_id,
        }
    }
}

/// User interaction kind, as reported to the server. Submits additionally
/// lock their element until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Click,
    Submit,
    Change,
    Keyup,
    Hook,
}

impl EventKind {
    fn wire_name(&self) -> &str {
        match self {
            EventKind::Click => "click",
            EventKind::Submit => "submit",
            EventKind::Change => "change",
            EventKind::Keyup => "keyup",
            EventKind::Hook => "hook",
        }
    }

    fn locks(&self) -> bool {
        matches!(self, EventKind::Submit)
    }
}

// ── Socket ────────────────────────────────────────────────────────────────

pub struct LiveSocket<T: Transport> {
    transport: T,
    registry: HookRegistry,
    hooks: HookTable,
    views: IndexMap<String, View>,
    ledger: RefLedger,
    transitions: TransitionSet,
    pending: IndexMap<u64, PendingReply>,
    opts: SocketOpts,
    /// Consecutive connection failures, drives the backoff ladder.
    tries: u32,
    effects: Vec<MainEffect>,
}

impl<T: Transport> LiveSocket<T> {
    pub fn new(transport: T, registry: HookRegistry, opts: SocketOpts) -> Self {
        LiveSocket {
            transport,
            registry,
            hooks: HookTable::new(),
            views: IndexMap::new(),
            ledger: RefLedger::new(),
            transitions: TransitionSet::new(),
            pending: IndexMap::new(),
            opts,
            tries: 0,
            effects: Vec::new(),
        }
    }

    /// Drain the side effects accumulated since the last call.
    pub fn take_effects(&mut self) -> Vec<MainEffect> {
        std::mem::take(&mut self.effects)
    }

    pub fn view(&self, view_id: &str) -> Option<&View> {
        self.views.get(view_id)
    }

    pub fn view_state(&self, view_id: &str) -> Option<ViewState> {
        self.views.get(view_id).map(|v| v.state)
    }

    pub fn view_ids(&self) -> Vec<&str> {
        self.views.keys().map(String::as_str).collect()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    // ── Connect & join ───────────────────────────────────────────────────

    /// Discover root sessions (session marker without a parent marker) and
    /// join each one.
    pub fn connect(&mut self, doc: &mut Document) {
        let roots: Vec<NodeId> = doc
            .elements_with_attr(doc.root(), SESSION_ATTR)
            .into_iter()
            .filter(|&n| !doc.has_attr(n, PARENT_ATTR))
            .collect();
        for node in roots {
            self.mount_view(doc, node, None);
        }
    }

    /// Create a View for a session root already present in the document
    /// and push its join.
    fn mount_view(&mut self, doc: &mut Document, node: NodeId, parent: Option<&str>) {
        let id = match doc.id_attr(node) {
            Some(id) => id.to_string(),
            None => {
                warn!("session root without an id attribute");
                return;
            }
        };
        let session = doc.attr(node, SESSION_ATTR).unwrap_or("").to_string();
        let mut view = View::new(&id, parent, &session);
        view.static_token = doc.attr(node, STATIC_ATTR).map(str::to_string);
        if let Some(parent_id) = parent {
            if let Some(parent_view) = self.views.get_mut(parent_id) {
                parent_view.children.insert(id.clone());
            }
        }
        self.views.insert(id.clone(), view);
        self.set_status(doc, &id, CLASS_LOADING);
        self.push_join(&id);
    }

    fn push_join(&mut self, view_id: &str) {
        let (topic, payload) = match self.views.get(view_id) {
            Some(view) => (view.topic(), view.join_payload(&self.opts.params)),
            None => return,
        };
        debug!(view = view_id, "pushing join");
        let push = self.transport.push(&topic, PUSH_JOIN, &payload);
        self.pending
            .insert(push.0, PendingReply::Join { view_id: view_id.to_string() });
    }

    // ── Replies ──────────────────────────────────────────────────────────

    pub fn handle_reply(
        &mut self,
        doc: &mut Document,
        push: PushRef,
        status: ReplyStatus,
        payload: &Value,
    ) -> Result<(), ClientError> {
        let reply = match self.pending.shift_remove(&push.0) {
            Some(reply) => reply,
            None => return Ok(()),
        };
        match reply {
            PendingReply::Join { view_id } => match status {
                ReplyStatus::Ok => self.on_join_ok(doc, &view_id, payload),
                ReplyStatus::Error => {
                    let reason = payload
                        .get("reason")
                        .and_then(Value::as_str)
                        .unwrap_or("error")
                        .to_string();
                    self.on_join_error(doc, &view_id, &ClientError::JoinRejected { reason });
                    Ok(())
                }
                ReplyStatus::Timeout => {
                    self.on_join_error(doc, &view_id, &ClientError::Timeout);
                    Ok(())
                }
            },
            PendingReply::Event { view_id, op_ref } => {
                if status != ReplyStatus::Ok {
                    let err = match status {
                        ReplyStatus::Timeout => ClientError::Timeout,
                        _ => ClientError::ChannelError,
                    };
                    warn!(view = view_id.as_str(), ref_ = op_ref, error = %err, "event push failed");
                }
                if self.transitions.busy() {
                    // Both the reply-carried diff and the ref settlement
                    // (which may replay a buffered lock clone) mutate the
                    // document; gate them like inbound diffs.
                    self.transitions.defer(QueuedMessage {
                        view_id,
                        event: PUSH_EVENT.to_string(),
                        payload: if status == ReplyStatus::Ok {
                            payload.clone()
                        } else {
                            json!({})
                        },
                        op_ref: Some(op_ref),
                    });
                    return Ok(());
                }
                if status == ReplyStatus::Ok {
                    if let Some(diff) = payload.get("diff") {
                        self.apply_diff(doc, &view_id, diff, Some(op_ref))?;
                    }
                }
                self.settle_ref(doc, &view_id, op_ref)
            }
            PendingReply::CidsDestroy { view_id, cids } => {
                if status == ReplyStatus::Ok {
                    if let Some(view) = self.views.get_mut(&view_id) {
                        view.rendered.prune_components(&cids);
                    }
                }
                Ok(())
            }
        }
    }

    fn on_join_ok(
        &mut self,
        doc: &mut Document,
        view_id: &str,
        payload: &Value,
    ) -> Result<(), ClientError> {
        let diff = payload.get("rendered").unwrap_or(payload);
        let (html, streams, title, events, desync) = {
            let view = self
                .views
                .get_mut(view_id)
                .ok_or_else(|| ClientError::UnknownSession(view_id.to_string()))?;
            view.rendered = Rendered::new(view_id);
            let meta = view.rendered.merge_diff(diff)?;
            let out = view.rendered.to_string()?;
            (out.html, out.streams, meta.title, meta.events, out.desync)
        };
        if desync {
            self.effects.push(MainEffect::Reload {
                reason: format!("desync during join of {view_id}"),
            });
        }
        // Discover same-batch nested sessions before anything is shown.
        let scratch = Document::from_html(&html)?;
        let mut batch_children: Vec<(String, String, Option<String>)> = Vec::new();
        for n in scratch.elements_with_attr(scratch.root(), SESSION_ATTR) {
            if scratch.attr(n, PARENT_ATTR) != Some(view_id) {
                continue;
            }
            match scratch.id_attr(n) {
                Some(id) => batch_children.push((
                    id.to_string(),
                    scratch.attr(n, SESSION_ATTR).unwrap_or("").to_string(),
                    scratch.attr(n, STATIC_ATTR).map(str::to_string),
                )),
                None => warn!("nested session root without an id attribute"),
            }
        }
        {
            let view = self
                .views
                .get_mut(view_id)
                .ok_or_else(|| ClientError::UnknownSession(view_id.to_string()))?;
            view.pending_mount = Some(PendingMount { html, streams, title, events });
            for (child_id, _, _) in &batch_children {
                view.children.insert(child_id.clone());
                view.pending_join_children.insert(child_id.clone());
            }
        }
        for (child_id, session, static_token) in batch_children {
            let mut child = View::new(&child_id, Some(view_id), &session);
            child.static_token = static_token;
            self.views.insert(child_id.clone(), child);
            self.push_join(&child_id);
        }
        self.tries = 0;
        self.check_ready(doc, view_id)
    }

    /// A session is ready when its own join ok arrived and every
    /// same-batch child has settled. Readiness propagates to the parent;
    /// the root applies the whole subtree's pending mounts at once.
    fn check_ready(&mut self, doc: &mut Document, view_id: &str) -> Result<(), ClientError> {
        let (ready, parent) = match self.views.get(view_id) {
            Some(view) => (
                !view.ready
                    && view.pending_mount.is_some()
                    && view.pending_join_children.is_empty(),
                view.parent.clone(),
            ),
            None => return Ok(()),
        };
        if !ready {
            return Ok(());
        }
        if let Some(view) = self.views.get_mut(view_id) {
            view.ready = true;
        }
        match parent {
            None => self.apply_pending_mount(doc, view_id),
            Some(parent_id) => {
                let parent_joined = self
                    .views
                    .get(&parent_id)
                    .map(|v| v.is_joined())
                    .unwrap_or(true);
                if parent_joined {
                    // Attached after the parent's mount; its container is
                    // already in the document.
                    self.apply_pending_mount(doc, view_id)?;
                    Ok(())
                } else {
                    let settled = self
                        .views
                        .get_mut(&parent_id)
                        .map(|v| v.child_join_settled(view_id))
                        .unwrap_or(false);
                    if settled {
                        self.check_ready(doc, &parent_id)?;
                    }
                    Ok(())
                }
            }
        }
    }

    /// Apply a held-back mount: patch the container, then the mounts of
    /// every ready child whose container the patch just inserted.
    fn apply_pending_mount(
        &mut self,
        doc: &mut Document,
        view_id: &str,
    ) -> Result<(), ClientError> {
        if self.transitions.busy() {
            // The mount stays pending; transition_complete re-runs the
            // ready sweep once the set drains.
            return Ok(());
        }
        let mount = match self.views.get_mut(view_id).and_then(|v| v.pending_mount.take()) {
            Some(mount) => mount,
            None => return Ok(()),
        };
        let container = match doc.get_element_by_id(view_id) {
            Some(container) => container,
            None => {
                // The parent's own patch has not inserted this container
                // yet; it re-applies us with its attached-session sweep.
                if let Some(view) = self.views.get_mut(view_id) {
                    view.pending_mount = Some(mount);
                }
                return Ok(());
            }
        };
        let root_id = self.root_of(view_id);
        doc.set_attr(container, ROOT_ATTR, &root_id);
        let result = Patch::new(view_id, container, &mount.html, PatchKind::Join)
            .with_streams(&mount.streams)
            .perform(doc, &mut self.ledger)?;
        if let Some(title) = mount.title {
            self.effects.push(MainEffect::SetTitle(title));
        }
        for payload in mount.events {
            self.effects
                .push(MainEffect::ServerEvent { view_id: view_id.to_string(), payload });
        }
        self.dispatch_patch_events(doc, view_id, &result);
        if let Some(view) = self.views.get_mut(view_id) {
            view.state = ViewState::Joined;
        }
        self.set_status(doc, view_id, CLASS_CONNECTED);
        info!(view = view_id, "session joined");
        let child_ids: Vec<String> = self
            .views
            .get(view_id)
            .map(|v| v.children.iter().cloned().collect())
            .unwrap_or_default();
        for child_id in child_ids {
            let child_ready = self
                .views
                .get(&child_id)
                .map(|v| v.ready && v.pending_mount.is_some())
                .unwrap_or(false);
            if child_ready {
                self.apply_pending_mount(doc, &child_id)?;
            }
        }
        let queued = self
            .views
            .get_mut(view_id)
            .map(|v| v.drain_queued())
            .unwrap_or_default();
        for diff in queued {
            self.apply_diff(doc, view_id, &diff, None)?;
        }
        Ok(())
    }

    fn on_join_error(&mut self, doc: &mut Document, view_id: &str, error: &ClientError) {
        match error {
            // Rejections are deliberate; retrying cannot succeed.
            ClientError::JoinRejected { reason }
                if matches!(reason.as_str(), "stale" | "unauthorized" | "reload") =>
            {
                warn!(view = view_id, reason = reason.as_str(), "join rejected");
                self.set_status(doc, view_id, CLASS_SERVER_ERROR);
                self.effects
                    .push(MainEffect::FallbackRedirect { reason: reason.clone() });
            }
            _ => {
                self.set_status(doc, view_id, CLASS_ERROR);
                self.tries += 1;
                let after_ms = self.reconnect_after(self.tries);
                self.effects.push(MainEffect::ScheduleReconnect { after_ms });
            }
        }
    }

    // ── Inbound channel events ───────────────────────────────────────────

    pub fn handle_message(
        &mut self,
        doc: &mut Document,
        topic: &str,
        event: &str,
        payload: Value,
    ) -> Result<(), ClientError> {
        let view_id = match protocol::view_id_of_topic(topic) {
            Some(id) => id.to_string(),
            None => {
                warn!(topic, "message on unknown topic shape");
                return Ok(());
            }
        };
        if !self.views.contains_key(&view_id) {
            debug!(view = view_id.as_str(), "message for unknown session dropped");
            return Ok(());
        }
        match ServerEvent::decode(event, payload)? {
            ServerEvent::Diff(diff) => {
                if self.transitions.busy() {
                    self.transitions.defer(QueuedMessage {
                        view_id,
                        event: EVENT_DIFF.to_string(),
                        payload: diff,
                        op_ref: None,
                    });
                    return Ok(());
                }
                let must_queue = {
                    let root_id = self.root_of(&view_id);
                    self.views.get(&view_id).map(|v| v.must_queue()).unwrap_or(false)
                        || self.views.get(&root_id).map(|v| v.must_queue()).unwrap_or(false)
                };
                if must_queue {
                    if let Some(view) = self.views.get_mut(&view_id) {
                        view.queue_diff(diff);
                    }
                    Ok(())
                } else {
                    self.apply_diff(doc, &view_id, &diff, None)
                }
            }
            ServerEvent::LivePatch { to } => {
                self.effects
                    .push(MainEffect::Navigate { kind: NavigateKind::Patch, to });
                Ok(())
            }
            ServerEvent::LiveRedirect { to } | ServerEvent::Redirect { to } => {
                self.effects
                    .push(MainEffect::Navigate { kind: NavigateKind::Redirect, to });
                Ok(())
            }
            ServerEvent::CidsWillDestroy { cids } => {
                self.propose_cids_destroyed(doc, &view_id, cids);
                Ok(())
            }
            ServerEvent::CidsDestroyed { cids } => {
                if let Some(view) = self.views.get_mut(&view_id) {
                    view.rendered.prune_components(&cids);
                }
                Ok(())
            }
        }
    }

    /// GC handshake: confirm destruction only for components with no
    /// remaining document references.
    fn propose_cids_destroyed(&mut self, doc: &Document, view_id: &str, cids: Vec<i64>) {
        let in_use: IndexSet<i64> = doc
            .get_element_by_id(view_id)
            .map(|container| {
                doc.elements_with_attr(container, COMPONENT_ATTR)
                    .into_iter()
                    .filter_map(|n| doc.attr(n, COMPONENT_ATTR)?.parse().ok())
                    .collect()
            })
            .unwrap_or_default();
        let confirmed: Vec<i64> = cids.into_iter().filter(|c| !in_use.contains(c)).collect();
        if confirmed.is_empty() {
            return;
        }
        let push = self.transport.push(
            &protocol::topic(view_id),
            PUSH_CIDS_DESTROYED,
            &json!({ "cids": confirmed }),
        );
        self.pending.insert(
            push.0,
            PendingReply::CidsDestroy { view_id: view_id.to_string(), cids: confirmed },
        );
    }

    // ── Diffs & patches ──────────────────────────────────────────────────

    fn apply_diff(
        &mut self,
        doc: &mut Document,
        view_id: &str,
        diff: &Value,
        patch_ref: Option<u64>,
    ) -> Result<(), ClientError> {
        let (html, streams, title, events, desync) = {
            let view = self
                .views
                .get_mut(view_id)
                .ok_or_else(|| ClientError::UnknownSession(view_id.to_string()))?;
            let meta = view.rendered.merge_diff(diff)?;
            let out = view.rendered.to_string()?;
            (out.html, out.streams, meta.title, meta.events, out.desync)
        };
        if desync {
            self.effects.push(MainEffect::Reload {
                reason: format!("desync in session {view_id}"),
            });
        }
        if let Some(container) = doc.get_element_by_id(view_id) {
            let mut patch = Patch::new(view_id, container, &html, PatchKind::Update)
                .with_streams(&streams);
            if let Some(r) = patch_ref {
                patch = patch.with_ref(r);
            }
            let result = patch.perform(doc, &mut self.ledger)?;
            self.dispatch_patch_events(doc, view_id, &result);
        } else {
            warn!(view = view_id, "container missing, diff merged but not shown");
        }
        if let Some(title) = title {
            self.effects.push(MainEffect::SetTitle(title));
        }
        for payload in events {
            self.effects
                .push(MainEffect::ServerEvent { view_id: view_id.to_string(), payload });
        }
        Ok(())
    }

    /// Dispatch recorded patch events in two ordered sweeps: departures
    /// first (destroyed hooks, before-update notifications, session
    /// teardown), then arrivals (mounted hooks, updates, child joins,
    /// focus).
    fn dispatch_patch_events(
        &mut self,
        doc: &mut Document,
        view_id: &str,
        result: &PatchResult,
    ) {
        let mut hook_effects: Vec<HookEffect> = Vec::new();
        let mut discarded_sessions: Vec<String> = Vec::new();
        for event in &result.events {
            match event {
                PatchEvent::NodeDiscarded { elem, .. } => {
                    if let Some(mut hook) = self.hooks.remove(*elem) {
                        // The node is gone; run the teardown callback
                        // against the session container for context.
                        if let Some(container) = doc.get_element_by_id(view_id) {
                            let mut cx = crate::hooks::HookCtx::new(
                                doc,
                                container,
                                view_id,
                                &mut hook_effects,
                            );
                            hook.destroyed(&mut cx);
                        }
                    }
                }
                PatchEvent::NodeUpdated { node, elem } => {
                    if doc.is_alive(*node) {
                        self.hooks.run(
                            *elem,
                            HookStage::BeforeUpdate,
                            doc,
                            *node,
                            view_id,
                            &mut hook_effects,
                        );
                    }
                }
                PatchEvent::TransitionsDiscarded { node, .. } => {
                    debug!(?node, "element held back for transition pruning");
                }
                PatchEvent::SessionDiscarded { session_id } => {
                    discarded_sessions.push(session_id.clone());
                }
                _ => {}
            }
        }
        for event in &result.events {
            match event {
                PatchEvent::NodeAdded { node, elem } => {
                    if !doc.is_alive(*node) {
                        continue;
                    }
                    let hook_name = doc.attr(*node, HOOK_ATTR).map(str::to_string);
                    if let Some(name) = hook_name {
                        if !self.hooks.contains(*elem) {
                            if let Some(hook) = self.registry.instantiate(&name) {
                                self.hooks.insert(*elem, hook);
                                self.hooks.run(
                                    *elem,
                                    HookStage::Mounted,
                                    doc,
                                    *node,
                                    view_id,
                                    &mut hook_effects,
                                );
                            }
                        }
                    }
                }
                PatchEvent::NodeUpdated { node, elem } => {
                    if doc.is_alive(*node) {
                        self.hooks.run(
                            *elem,
                            HookStage::Updated,
                            doc,
                            *node,
                            view_id,
                            &mut hook_effects,
                        );
                    }
                }
                PatchEvent::ChildJoinRequired { session_id, node } => {
                    if !self.views.contains_key(session_id) && doc.is_alive(*node) {
                        self.mount_view(doc, *node, Some(view_id));
                    }
                }
                PatchEvent::FocusRestored { node } => {
                    if doc.is_alive(*node) {
                        doc.focus(*node);
                    }
                }
                _ => {}
            }
        }
        for session_id in discarded_sessions {
            self.destroy_view(doc, &session_id, true);
        }
        for effect in hook_effects {
            let HookEffect::Push { event, payload } = effect;
            self.push_hook_event(view_id, &event, payload);
        }
    }

    // ── Outbound events ──────────────────────────────────────────────────

    /// Push a user interaction, stamping optimistic refs on the element.
    pub fn push_event(
        &mut self,
        doc: &mut Document,
        view_id: &str,
        kind: EventKind,
        event: &str,
        element: Option<NodeId>,
        payload: Value,
    ) -> Result<PushRef, ClientError> {
        let topic = self
            .views
            .get(view_id)
            .map(|v| v.topic())
            .ok_or_else(|| ClientError::UnknownSession(view_id.to_string()))?;
        let op_ref = self.ledger.next_ref();
        if let Some(node) = element {
            self.stamp_ref(doc, node, op_ref, kind.locks());
            // Form-scoped interactions decorate the enclosing form too, so
            // a submit holds the whole form until acknowledged.
            if matches!(kind, EventKind::Submit | EventKind::Change) {
                let form = doc.closest(node, |d, n| d.tag(n) == Some("form"));
                if let Some(form) = form.filter(|&f| f != node) {
                    self.stamp_ref(doc, form, op_ref, kind.locks());
                }
            }
        }
        let cid = element
            .and_then(|node| doc.closest(node, |d, n| d.has_attr(n, COMPONENT_ATTR)))
            .and_then(|n| doc.attr(n, COMPONENT_ATTR))
            .and_then(|s| s.parse::<i64>().ok());
        let mut wire = json!({
            "type": kind.wire_name(),
            "event": event,
            "value": payload,
        });
        if let (Some(obj), Some(cid)) = (wire.as_object_mut(), cid) {
            obj.insert("cid".to_string(), json!(cid));
        }
        let push = self.transport.push(&topic, PUSH_EVENT, &wire);
        self.pending.insert(
            push.0,
            PendingReply::Event { view_id: view_id.to_string(), op_ref },
        );
        Ok(push)
    }

    fn stamp_ref(&mut self, doc: &mut Document, node: NodeId, op_ref: u64, locks: bool) {
        if let Some(elem) = doc.elem_id(node) {
            self.ledger.dispatch(elem, op_ref, RefKind::Loading);
            doc.set_attr(node, REF_LOADING_ATTR, &op_ref.to_string());
            if locks {
                self.ledger.dispatch(elem, op_ref, RefKind::Lock);
                doc.set_attr(node, REF_LOCK_ATTR, &op_ref.to_string());
            }
        }
    }

    fn push_hook_event(&mut self, view_id: &str, event: &str, payload: Value) {
        let topic = match self.views.get(view_id) {
            Some(view) => view.topic(),
            None => return,
        };
        let op_ref = self.ledger.next_ref();
        let wire = json!({
            "type": EventKind::Hook.wire_name(),
            "event": event,
            "value": payload,
        });
        let push = self.transport.push(&topic, PUSH_EVENT, &wire);
        self.pending.insert(
            push.0,
            PendingReply::Event { view_id: view_id.to_string(), op_ref },
        );
    }

    /// Clear optimistic decorations for an acknowledged ref, replaying any
    /// buffered lock clones the patch engine redirected while locked.
    fn settle_ref(
        &mut self,
        doc: &mut Document,
        view_id: &str,
        op_ref: u64,
    ) -> Result<(), ClientError> {
        let undos = self.ledger.ack(op_ref);
        for undo in undos {
            let node = match doc.by_elem_id(undo.elem) {
                Some(node) => node,
                None => continue,
            };
            match undo.kind {
                RefKind::Loading => doc.remove_attr(node, REF_LOADING_ATTR),
                RefKind::Lock => {
                    doc.remove_attr(node, REF_LOCK_ATTR);
                    if let Some(clone) = undo.lock_clone {
                        let result = patch::apply_lock_clone(
                            doc,
                            &mut self.ledger,
                            view_id,
                            node,
                            &clone,
                            undo.ref_,
                        )?;
                        self.dispatch_patch_events(doc, view_id, &result);
                    }
                }
            }
        }
        Ok(())
    }

    // ── Transitions ──────────────────────────────────────────────────────

    pub fn transition_start(&mut self) -> TimerId {
        self.transitions.start()
    }

    /// Complete a transition timer, replaying any gated messages and
    /// applying mounts that became ready while the set was busy.
    pub fn transition_complete(
        &mut self,
        doc: &mut Document,
        timer: TimerId,
    ) -> Result<(), ClientError> {
        for message in self.transitions.complete(timer) {
            match message.op_ref {
                Some(op_ref) => {
                    if !self.views.contains_key(&message.view_id) {
                        continue;
                    }
                    if let Some(diff) = message.payload.get("diff") {
                        self.apply_diff(doc, &message.view_id, diff, Some(op_ref))?;
                    }
                    self.settle_ref(doc, &message.view_id, op_ref)?;
                }
                None => {
                    let topic = protocol::topic(&message.view_id);
                    self.handle_message(doc, &topic, &message.event, message.payload)?;
                }
            }
        }
        let held: Vec<String> = self
            .views
            .iter()
            .filter(|(_, v)| v.ready && v.pending_mount.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for view_id in held {
            self.apply_pending_mount(doc, &view_id)?;
        }
        Ok(())
    }

    // ── Disconnect & reconnect ───────────────────────────────────────────

    /// Transport loss: destroy every nested session (no partial trees
    /// survive), flag the roots, and schedule a rejoin.
    pub fn handle_disconnect(&mut self, doc: &mut Document) {
        self.run_connection_sweep(doc, HookStage::Disconnected);
        let nested: Vec<String> = self
            .views
            .iter()
            .filter(|(_, v)| v.parent.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for view_id in nested {
            // Recursion may have removed it already.
            if self.views.contains_key(&view_id) {
                self.destroy_view(doc, &view_id, false);
            }
        }
        let roots: Vec<String> = self.views.keys().cloned().collect();
        for view_id in &roots {
            if let Some(view) = self.views.get_mut(view_id) {
                view.state = ViewState::Disconnected;
            }
            self.set_status(doc, view_id, CLASS_ERROR);
        }
        self.tries += 1;
        let after_ms = self.reconnect_after(self.tries);
        self.effects.push(MainEffect::ScheduleReconnect { after_ms });
    }

    /// The transport is back: rejoin every root from scratch.
    pub fn reconnect(&mut self, doc: &mut Document) {
        self.run_connection_sweep(doc, HookStage::Reconnected);
        let roots: Vec<String> = self.views.keys().cloned().collect();
        for view_id in roots {
            if let Some(view) = self.views.get_mut(&view_id) {
                view.reset_for_rejoin();
            }
            self.set_status(doc, &view_id, CLASS_LOADING);
            self.push_join(&view_id);
        }
    }

    fn run_connection_sweep(&mut self, doc: &mut Document, stage: HookStage) {
        let mut hook_effects: Vec<HookEffect> = Vec::new();
        let mut pushes: Vec<(String, HookEffect)> = Vec::new();
        for elem in self.hooks.elems() {
            let node = match doc.by_elem_id(elem) {
                Some(node) => node,
                None => continue,
            };
            let owner = doc
                .closest(node, |d, n| d.has_attr(n, SESSION_ATTR))
                .and_then(|n| doc.id_attr(n))
                .map(str::to_string);
            let view_id = match owner {
                Some(id) => id,
                None => continue,
            };
            self.hooks.run(elem, stage, doc, node, &view_id, &mut hook_effects);
            for effect in hook_effects.drain(..) {
                pushes.push((view_id.clone(), effect));
            }
        }
        for (view_id, effect) in pushes {
            let HookEffect::Push { event, payload } = effect;
            self.push_hook_event(&view_id, &event, payload);
        }
    }

    /// Delay before reconnect attempt number `tries` (1-based). Within the
    /// ladder the delay is fixed; past its end a jittered failsafe applies.
    pub fn reconnect_after(&mut self, tries: u32) -> u64 {
        let idx = tries.saturating_sub(1) as usize;
        match RECONNECT_LADDER_MS.get(idx) {
            Some(&ms) => ms,
            None => FAILSAFE_BASE_MS + rand::thread_rng().gen_range(0..FAILSAFE_JITTER_MS),
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Destroy a session: children first, then hook teardown, then the
    /// tombstone on its root element.
    pub fn destroy_view(&mut self, doc: &mut Document, view_id: &str, remove_node: bool) {
        let child_ids: Vec<String> = self
            .views
            .get(view_id)
            .map(|v| v.children.iter().cloned().collect())
            .unwrap_or_default();
        for child_id in child_ids {
            self.destroy_view(doc, &child_id, remove_node);
        }
        if let Some(container) = doc.get_element_by_id(view_id) {
            let mut hook_effects: Vec<HookEffect> = Vec::new();
            for elem in self.hooks.elems() {
                let inside = doc
                    .by_elem_id(elem)
                    .map(|n| n == container || doc.contains(container, n))
                    .unwrap_or(false);
                if !inside {
                    continue;
                }
                if let (Some(mut hook), Some(node)) =
                    (self.hooks.remove(elem), doc.by_elem_id(elem))
                {
                    let mut cx =
                        crate::hooks::HookCtx::new(doc, node, view_id, &mut hook_effects);
                    hook.destroyed(&mut cx);
                }
            }
            // Teardown pushes nothing; the channel is going away.
            drop(hook_effects);
            doc.set_attr(container, SESSION_ATTR, "");
            if remove_node {
                doc.remove_subtree(container);
            }
        }
        self.transitions.discard_view(view_id);
        self.pending.retain(|_, p| p.view_id() != view_id);
        let parent = self.views.get(view_id).and_then(|v| v.parent.clone());
        if let Some(parent_id) = parent {
            if let Some(parent_view) = self.views.get_mut(&parent_id) {
                parent_view.children.shift_remove(view_id);
                parent_view.pending_join_children.shift_remove(view_id);
            }
        }
        if let Some(mut view) = self.views.shift_remove(view_id) {
            view.state = ViewState::Destroyed;
            info!(view = view_id, "session destroyed");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn root_of(&self, view_id: &str) -> String {
        let mut current = view_id.to_string();
        while let Some(parent) = self.views.get(&current).and_then(|v| v.parent.clone()) {
            current = parent;
        }
        current
    }

    fn set_status(&mut self, doc: &mut Document, view_id: &str, class: &str) {
        let container = match doc.get_element_by_id(view_id) {
            Some(container) => container,
            None => return,
        };
        for status in [
            CLASS_CONNECTED,
            CLASS_LOADING,
            CLASS_ERROR,
            protocol::CLASS_CLIENT_ERROR,
            CLASS_SERVER_ERROR,
        ] {
            doc.remove_class(container, status);
        }
        doc.add_class(container, class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct FakeTransport {
        pushes: Vec<(String, String, Value)>,
        next: u64,
    }

    impl Transport for FakeTransport {
        fn push(&mut self, topic: &str, event: &str, payload: &Value) -> PushRef {
            self.pushes.push((topic.to_string(), event.to_string(), payload.clone()));
            self.next += 1;
            PushRef(self.next)
        }
    }

    fn socket() -> LiveSocket<FakeTransport> {
        LiveSocket::new(FakeTransport::default(), HookRegistry::new(), SocketOpts::default())
    }

    fn root_doc() -> Document {
        Document::from_html(r#"<div id="v1" data-live-session="tok"></div>"#).unwrap()
    }

    fn mount_payload(text: &str) -> Value {
        json!({ "rendered": { "s": ["<span>", "</span>"], "0": text } })
    }

    #[test]
    fn connect_joins_and_patches_root() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        assert_eq!(socket.view_state("v1"), Some(ViewState::JoinPending));
        let (topic, event, payload) = socket.transport().pushes[0].clone();
        assert_eq!(topic, "live:v1");
        assert_eq!(event, PUSH_JOIN);
        assert_eq!(payload["session"], "tok");

        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount_payload("hello"))
            .unwrap();
        assert_eq!(socket.view_state("v1"), Some(ViewState::Joined));
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.has_class(container, CLASS_CONNECTED));
        assert!(doc.inner_html(container).contains("hello"));
        assert_eq!(doc.attr(container, ROOT_ATTR), Some("v1"));
    }

    #[test]
    fn diff_during_join_applies_after_join() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        socket
            .handle_message(&mut doc, "live:v1", EVENT_DIFF, json!({"0": "late"}))
            .unwrap();
        // Still pending: nothing visible yet.
        let container = doc.get_element_by_id("v1").unwrap();
        assert_eq!(doc.inner_html(container), "");
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount_payload("early"))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.inner_html(container).contains("late"));
    }

    #[test]
    fn join_rejection_is_not_retried() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Error, &json!({"reason": "stale"}))
            .unwrap();
        let effects = socket.take_effects();
        assert!(effects
            .iter()
            .any(|e| matches!(e, MainEffect::FallbackRedirect { reason } if reason == "stale")));
        assert_eq!(socket.transport().pushes.len(), 1, "no rejoin pushed");
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.has_class(container, CLASS_SERVER_ERROR));
    }

    #[test]
    fn transport_failure_schedules_backoff() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        socket.handle_disconnect(&mut doc);
        let effects = socket.take_effects();
        let delay = effects.iter().find_map(|e| match e {
            MainEffect::ScheduleReconnect { after_ms } => Some(*after_ms),
            _ => None,
        });
        assert_eq!(delay, Some(RECONNECT_LADDER_MS[0]));
        assert_eq!(socket.view_state("v1"), Some(ViewState::Disconnected));
    }

    #[test]
    fn backoff_ladder_and_failsafe_bounds() {
        let mut socket = socket();
        assert_eq!(socket.reconnect_after(1), 10);
        assert_eq!(socket.reconnect_after(9), 2000);
        for _ in 0..16 {
            let past = socket.reconnect_after(10);
            assert!(past >= FAILSAFE_BASE_MS);
            assert!(past < FAILSAFE_BASE_MS + FAILSAFE_JITTER_MS);
        }
    }

    #[test]
    fn push_event_stamps_and_ack_clears_refs() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount_payload("x"))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let target = doc.children(container)[0];
        let push = socket
            .push_event(&mut doc, "v1", EventKind::Submit, "save", Some(target), json!({}))
            .unwrap();
        assert!(doc.has_attr(target, REF_LOADING_ATTR));
        assert!(doc.has_attr(target, REF_LOCK_ATTR));
        socket
            .handle_reply(&mut doc, push, ReplyStatus::Ok, &json!({}))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let target = doc.children(container)[0];
        assert!(!doc.has_attr(target, REF_LOADING_ATTR));
        assert!(!doc.has_attr(target, REF_LOCK_ATTR));
    }

    #[test]
    fn transition_gates_diffs() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount_payload("a"))
            .unwrap();
        let timer = socket.transition_start();
        socket
            .handle_message(&mut doc, "live:v1", EVENT_DIFF, json!({"0": "b"}))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.inner_html(container).contains('a'), "diff gated");
        socket.transition_complete(&mut doc, timer).unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.inner_html(container).contains('b'));
    }

    #[test]
    fn component_only_diff_reaches_the_document() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        let mount = json!({ "rendered": {
            "s": ["<div>", "</div>"],
            "0": 1,
            "r": 1,
            "c": {"1": {"0": "x", "s": ["<span>", "</span>"]}},
        }});
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount)
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.inner_html(container).contains(">x</span>"));
        socket
            .handle_message(
                &mut doc,
                "live:v1",
                EVENT_DIFF,
                json!({"c": {"1": {"0": "y"}}}),
            )
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let inner = doc.inner_html(container);
        assert!(inner.contains(">y</span>"), "inner: {inner}");
    }

    #[test]
    fn reply_diff_and_settlement_wait_for_transitions() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        let mount = json!({ "rendered": { "s": ["<span>", "</span>"], "0": "a", "r": 1 } });
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount)
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let target = doc.children(container)[0];
        let push = socket
            .push_event(&mut doc, "v1", EventKind::Submit, "save", Some(target), json!({}))
            .unwrap();
        let timer = socket.transition_start();
        socket
            .handle_reply(&mut doc, push, ReplyStatus::Ok, &json!({"diff": {"0": "b"}}))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let target = doc.children(container)[0];
        assert!(doc.inner_html(container).contains('a'), "reply diff gated");
        assert!(doc.has_attr(target, REF_LOCK_ATTR), "settlement gated");
        socket.transition_complete(&mut doc, timer).unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        let target = doc.children(container)[0];
        assert!(doc.inner_html(container).contains('b'));
        assert!(!doc.has_attr(target, REF_LOCK_ATTR));
        assert!(!doc.has_attr(target, REF_LOADING_ATTR));
    }

    #[test]
    fn join_mount_waits_for_transitions() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        let timer = socket.transition_start();
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount_payload("hi"))
            .unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert_eq!(doc.inner_html(container), "", "mount gated");
        assert_eq!(socket.view_state("v1"), Some(ViewState::JoinPending));
        socket.transition_complete(&mut doc, timer).unwrap();
        let container = doc.get_element_by_id("v1").unwrap();
        assert!(doc.inner_html(container).contains("hi"));
        assert_eq!(socket.view_state("v1"), Some(ViewState::Joined));
    }

    #[test]
    fn before_update_runs_ahead_of_updated() {
        use std::cell::RefCell;
        use std::rc::Rc;

        #[derive(Default)]
        struct Recorder {
            log: Rc<RefCell<Vec<&'static str>>>,
        }
        impl crate::hooks::Hook for Recorder {
            fn mounted(&mut self, _cx: &mut crate::hooks::HookCtx<'_>) {
                self.log.borrow_mut().push("mounted");
            }
            fn before_update(&mut self, _cx: &mut crate::hooks::HookCtx<'_>) {
                self.log.borrow_mut().push("before_update");
            }
            fn updated(&mut self, _cx: &mut crate::hooks::HookCtx<'_>) {
                self.log.borrow_mut().push("updated");
            }
        }

        let log = Rc::new(RefCell::new(Vec::new()));
        let mut registry = HookRegistry::new();
        let shared = log.clone();
        registry.register("Rec", move || Recorder { log: shared.clone() });
        let mut doc = root_doc();
        let mut socket =
            LiveSocket::new(FakeTransport::default(), registry, SocketOpts::default());
        socket.connect(&mut doc);
        let mount = json!({ "rendered": {
            "s": ["<span id=\"h\" live-hook=\"Rec\">", "</span>"],
            "0": "a",
        }});
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount)
            .unwrap();
        socket
            .handle_message(&mut doc, "live:v1", EVENT_DIFF, json!({"0": "b"}))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["mounted", "before_update", "updated"]);
    }

    #[test]
    fn submit_locks_the_enclosing_form() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        let mount = json!({ "rendered": {
            "s": ["<form id=\"f\"><input id=\"i\" type=\"text\">", "</form>"],
            "0": "",
        }});
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount)
            .unwrap();
        let input = doc.get_element_by_id("i").unwrap();
        let form = doc.get_element_by_id("f").unwrap();
        let push = socket
            .push_event(&mut doc, "v1", EventKind::Submit, "save", Some(input), json!({}))
            .unwrap();
        assert!(doc.has_attr(input, REF_LOCK_ATTR));
        assert!(doc.has_attr(form, REF_LOCK_ATTR));
        assert!(doc.has_attr(form, REF_LOADING_ATTR));
        socket
            .handle_reply(&mut doc, push, ReplyStatus::Ok, &json!({}))
            .unwrap();
        let input = doc.get_element_by_id("i").unwrap();
        let form = doc.get_element_by_id("f").unwrap();
        assert!(!doc.has_attr(input, REF_LOCK_ATTR));
        assert!(!doc.has_attr(form, REF_LOCK_ATTR));
        assert!(!doc.has_attr(form, REF_LOADING_ATTR));
    }

    #[test]
    fn cids_handshake_confirms_only_unreferenced() {
        let mut doc = root_doc();
        let mut socket = socket();
        socket.connect(&mut doc);
        let mount = json!({ "rendered": {
            "s": ["<div data-live-component=\"1\">", "</div>"],
            "0": "body",
        }});
        socket
            .handle_reply(&mut doc, PushRef(1), ReplyStatus::Ok, &mount)
            .unwrap();
        socket
            .handle_message(
                &mut doc,
                "live:v1",
                protocol::EVENT_CIDS_WILL_DESTROY,
                json!({"cids": [1, 2]}),
            )
            .unwrap();
        let (_, event, payload) = socket.transport().pushes.last().unwrap().clone();
        assert_eq!(event, PUSH_CIDS_DESTROYED);
        assert_eq!(payload["cids"], json!([2]), "cid 1 still referenced");
    }
}
