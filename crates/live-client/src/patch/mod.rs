//! The reconciliation engine: projects freshly serialized markup into the
//! live document with a keyed diff.
//!
//! Elements are matched by explicit id, else by the synthetic magic id,
//! else by same-tag positional matching — the positional fallback applies
//! only during the initial join, since post-join markup is change-tracking
//! optimized and carries ids for everything that can move.
//!
//! The traversal itself records typed [`PatchEvent`]s instead of invoking
//! callbacks mid-walk; the session layer dispatches them in two ordered
//! sweeps after the traversal completes. Update vetoes (ignored subtrees,
//! focused form inputs, locked elements, nested-session roots) are checked
//! inline before any mutation.

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use livesync_dom::{Document, ElemId, Node, NodeId};

use crate::error::ClientError;
use crate::protocol::{
    MAGIC_ID_ATTR, PRUNING_ATTR, REF_LOADING_ATTR, REF_LOCK_ATTR, SESSION_ATTR, SKIP_ATTR,
    STREAM_ATTR, UPDATE_ATTR, UPDATE_IGNORE, UPDATE_STREAM,
};
use crate::refs::RefLedger;
use crate::rendered::StreamMeta;

// ── Events ────────────────────────────────────────────────────────────────

/// A lifecycle event recorded during reconciliation, dispatched by the
/// session layer once traversal completes.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchEvent {
    NodeAdded { node: NodeId, elem: ElemId },
    NodeUpdated { node: NodeId, elem: ElemId },
    /// Captured before removal: the node is already gone when dispatched.
    NodeDiscarded { elem: ElemId, dom_id: Option<String>, tag: String },
    /// The element's removal is transition-gated; it stays in the document
    /// until an external timer prunes it.
    TransitionsDiscarded { node: NodeId, elem: ElemId },
    /// A nested-session root disappeared from the markup; its destruction
    /// must go through session teardown, not plain detachment.
    SessionDiscarded { session_id: String },
    /// A nested-session root entered the markup and needs a join of its own.
    ChildJoinRequired { session_id: String, node: NodeId },
    FocusRestored { node: NodeId },
}

#[derive(Debug, Default)]
pub struct PatchResult {
    pub events: Vec<PatchEvent>,
    /// Session roots newly introduced by this patch: `(session id, node)`.
    pub attached_sessions: Vec<(String, NodeId)>,
}

impl PatchResult {
    pub fn attached_any(&self) -> bool {
        !self.attached_sessions.is_empty()
    }

    pub fn added(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.events.iter().filter_map(|e| match e {
            PatchEvent::NodeAdded { node, .. } => Some(*node),
            _ => None,
        })
    }

    pub fn updated(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.events.iter().filter_map(|e| match e {
            PatchEvent::NodeUpdated { node, .. } => Some(*node),
            _ => None,
        })
    }
}

// ── Patch ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Join,
    Update,
}

pub struct Patch<'a> {
    view_id: &'a str,
    target: NodeId,
    html: &'a str,
    kind: PatchKind,
    patch_ref: Option<u64>,
    streams: &'a [StreamMeta],
}

impl<'a> Patch<'a> {
    pub fn new(view_id: &'a str, target: NodeId, html: &'a str, kind: PatchKind) -> Self {
        Patch { view_id, target, html, kind, patch_ref: None, streams: &[] }
    }

    /// Attach the stream operations drained from the rendered tree.
    pub fn with_streams(mut self, streams: &'a [StreamMeta]) -> Self {
        self.streams = streams;
        self
    }

    /// Correlate this patch with an operation ref for lock comparisons.
    pub fn with_ref(mut self, patch_ref: u64) -> Self {
        self.patch_ref = Some(patch_ref);
        self
    }

    /// Reconcile the target's subtree to match the new markup.
    ///
    /// Unparsable markup is fatal locally; there is no recovery short of a
    /// full reload above this layer.
    pub fn perform(
        &self,
        doc: &mut Document,
        ledger: &mut RefLedger,
    ) -> Result<PatchResult, ClientError> {
        let desired = doc.parse_fragment(self.html)?;
        let mut inserts = IndexMap::new();
        let mut stream_refs = IndexMap::new();
        let mut delete_ids = IndexSet::new();
        let mut any_reset = false;
        for stream in self.streams {
            for ins in &stream.inserts {
                inserts.insert(ins.dom_id.clone(), (ins.index, ins.limit));
                stream_refs.insert(ins.dom_id.clone(), stream.stream_ref.clone());
            }
            delete_ids.extend(stream.delete_ids.iter().cloned());
            any_reset |= stream.reset;
        }
        let mut cx = PatchCx {
            view_id: self.view_id,
            target: self.target,
            kind: self.kind,
            patch_ref: self.patch_ref,
            inserts,
            stream_refs,
            delete_ids,
            any_reset,
            events: Vec::new(),
            attached: Vec::new(),
        };
        let focused_before = doc.focused;
        reconcile_children(doc, ledger, &mut cx, self.target, desired);
        if let Some(node) = focused_before {
            if doc.is_alive(node) {
                cx.events.push(PatchEvent::FocusRestored { node });
            }
        }
        Ok(PatchResult { events: cx.events, attached_sessions: cx.attached })
    }
}

/// Replay buffered server truth for one element after its lock cleared.
///
/// `patch_ref` is the acked ref, so the lock comparison no longer vetoes
/// the merge. The clone is a single element's outer markup.
pub fn apply_lock_clone(
    doc: &mut Document,
    ledger: &mut RefLedger,
    view_id: &str,
    node: NodeId,
    html: &str,
    patch_ref: u64,
) -> Result<PatchResult, ClientError> {
    let desired = doc.parse_fragment(html)?;
    let mut cx = PatchCx {
        view_id,
        target: node,
        kind: PatchKind::Update,
        patch_ref: Some(patch_ref),
        inserts: IndexMap::new(),
        stream_refs: IndexMap::new(),
        delete_ids: IndexSet::new(),
        any_reset: false,
        events: Vec::new(),
        attached: Vec::new(),
    };
    for d in desired {
        if doc.is_element(d) && doc.tag(d) == doc.tag(node) {
            update_element(doc, ledger, &mut cx, node, d);
        } else {
            doc.remove_subtree(d);
        }
    }
    Ok(PatchResult { events: cx.events, attached_sessions: cx.attached })
}

struct PatchCx<'a> {
    view_id: &'a str,
    target: NodeId,
    kind: PatchKind,
    patch_ref: Option<u64>,
    /// Stream insert instructions keyed by item dom id.
    inserts: IndexMap<String, (usize, Option<i64>)>,
    /// Owning stream ref per inserted item, stamped as a membership marker.
    stream_refs: IndexMap<String, String>,
    delete_ids: IndexSet<String>,
    any_reset: bool,
    events: Vec<PatchEvent>,
    attached: Vec<(String, NodeId)>,
}

// ── Child reconciliation ──────────────────────────────────────────────────

fn reconcile_children(
    doc: &mut Document,
    ledger: &mut RefLedger,
    cx: &mut PatchCx<'_>,
    parent: NodeId,
    desired: Vec<NodeId>,
) {
    if doc.attr(parent, UPDATE_ATTR) == Some(UPDATE_STREAM) {
        reconcile_stream_children(doc, ledger, cx, parent, desired);
    } else {
        reconcile_keyed_children(doc, ledger, cx, parent, desired);
    }
}

fn element_key(doc: &Document, node: NodeId) -> Option<String> {
    doc.id_attr(node)
        .or_else(|| doc.attr(node, MAGIC_ID_ATTR))
        .map(str::to_string)
}

fn reconcile_keyed_children(
    doc: &mut Document,
    ledger: &mut RefLedger,
    cx: &mut PatchCx<'_>,
    parent: NodeId,
    desired: Vec<NodeId>,
) {
    let live: Vec<NodeId> = doc.children(parent).to_vec();
    let mut by_key: IndexMap<String, NodeId> = IndexMap::new();
    let mut by_magic: IndexMap<String, NodeId> = IndexMap::new();
    for &node in &live {
        if let Some(key) = element_key(doc, node) {
            by_key.insert(key, node);
        }
        if let Some(magic) = doc.attr(node, MAGIC_ID_ATTR) {
            by_magic.insert(magic.to_string(), node);
        }
    }
    let mut live_texts: Vec<NodeId> = live
        .iter()
        .copied()
        .filter(|&n| !doc.is_element(n))
        .collect();
    live_texts.reverse(); // pop() yields document order
    let mut used: IndexSet<NodeId> = IndexSet::new();
    let mut new_children: Vec<NodeId> = Vec::with_capacity(desired.len());

    for d in desired {
        match doc.node(d) {
            Some(Node::Text(_)) => {
                if let Some(t) = live_texts.pop() {
                    let text = doc.text(d).unwrap_or("").to_string();
                    if doc.text(t) != Some(text.as_str()) {
                        doc.set_text(t, &text);
                    }
                    used.insert(t);
                    new_children.push(t);
                    doc.remove_subtree(d);
                } else {
                    new_children.push(d);
                }
            }
            Some(Node::Element(_)) => {
                if doc.has_attr(d, SKIP_ATTR) {
                    // Leave the live counterpart byte-for-byte untouched.
                    let matched = doc
                        .attr(d, MAGIC_ID_ATTR)
                        .and_then(|magic| by_magic.get(magic).copied());
                    match matched {
                        Some(node) if !used.contains(&node) => {
                            used.insert(node);
                            new_children.push(node);
                        }
                        _ => warn!("skip placeholder without a live counterpart"),
                    }
                    doc.remove_subtree(d);
                    continue;
                }
                let matched = find_match(doc, cx, &by_key, &used, &live, d);
                if let Some(node) = matched {
                    update_element(doc, ledger, cx, node, d);
                    used.insert(node);
                    new_children.push(node);
                } else {
                    mark_added(doc, cx, d);
                    new_children.push(d);
                }
            }
            None => {}
        }
    }

    // Leftovers: discard unless protected.
    for (idx, &node) in live.iter().enumerate() {
        if used.contains(&node) || !doc.is_alive(node) {
            continue;
        }
        if !doc.is_element(node) {
            doc.remove_subtree(node);
            continue;
        }
        if doc.has_attr(node, PRUNING_ATTR) {
            // Transition-gated: an external timer removes it later.
            if let Some(elem) = doc.elem_id(node) {
                cx.events.push(PatchEvent::TransitionsDiscarded { node, elem });
            }
            new_children.insert(idx.min(new_children.len()), node);
            continue;
        }
        if lock_in_force(doc, ledger, cx, node) {
            new_children.insert(idx.min(new_children.len()), node);
            continue;
        }
        if let Some(session) = live_session_id(doc, node) {
            // Owned by a View; its destruction goes through teardown.
            cx.events.push(PatchEvent::SessionDiscarded { session_id: session });
            new_children.insert(idx.min(new_children.len()), node);
            continue;
        }
        discard_subtree(doc, ledger, cx, node);
    }
    doc.set_children(parent, new_children);
}

fn find_match(
    doc: &Document,
    cx: &PatchCx<'_>,
    by_key: &IndexMap<String, NodeId>,
    used: &IndexSet<NodeId>,
    live: &[NodeId],
    desired: NodeId,
) -> Option<NodeId> {
    let desired_tag = doc.tag(desired)?.to_string();
    if let Some(key) = element_key(doc, desired) {
        let hit = by_key
            .get(&key)
            .copied()
            .filter(|n| !used.contains(n) && doc.tag(*n) == Some(desired_tag.as_str()));
        if hit.is_some() {
            return hit;
        }
    }
    if cx.kind == PatchKind::Join {
        // Initial join markup carries no ids for everything; fall back to
        // same-kind positional matching among unkeyed live elements.
        return live.iter().copied().find(|&n| {
            !used.contains(&n)
                && doc.tag(n) == Some(desired_tag.as_str())
                && element_key(doc, n).is_none()
        });
    }
    None
}

/// Whether the element, or anything inside it, holds a lock newer than the
/// ref this patch is correlated with.
fn lock_in_force(
    doc: &Document,
    ledger: &RefLedger,
    cx: &PatchCx<'_>,
    node: NodeId,
) -> bool {
    let self_locked = doc
        .elem_id(node)
        .map(|elem| ledger.is_locked_beyond(elem, cx.patch_ref))
        .unwrap_or(false);
    self_locked
        || doc.descendants(node).any(|n| {
            doc.elem_id(n)
                .map(|elem| ledger.is_locked_beyond(elem, cx.patch_ref))
                .unwrap_or(false)
        })
}

/// The session id of a live, non-tombstoned session root.
fn live_session_id(doc: &Document, node: NodeId) -> Option<String> {
    match doc.attr(node, SESSION_ATTR) {
        Some(session) if !session.is_empty() => doc.id_attr(node).map(str::to_string),
        _ => None,
    }
}

fn mark_added(doc: &Document, cx: &mut PatchCx<'_>, node: NodeId) {
    let mut record = |n: NodeId| {
        if let Some(elem) = doc.elem_id(n) {
            cx.events.push(PatchEvent::NodeAdded { node: n, elem });
            if let Some(session) = live_session_id(doc, n) {
                cx.events.push(PatchEvent::ChildJoinRequired {
                    session_id: session.clone(),
                    node: n,
                });
                cx.attached.push((session, n));
            }
        }
    };
    if doc.is_element(node) {
        record(node);
    }
    for n in doc.descendants(node) {
        if doc.is_element(n) {
            record(n);
        }
    }
}

fn discard_subtree(
    doc: &mut Document,
    ledger: &mut RefLedger,
    cx: &mut PatchCx<'_>,
    node: NodeId,
) {
    let mut elems = Vec::new();
    if doc.is_element(node) {
        elems.push(node);
    }
    elems.extend(doc.descendants(node).filter(|&n| doc.is_element(n)));
    for n in elems {
        if let Some(elem) = doc.elem_id(n) {
            cx.events.push(PatchEvent::NodeDiscarded {
                elem,
                dom_id: doc.id_attr(n).map(str::to_string),
                tag: doc.tag(n).unwrap_or("").to_string(),
            });
            ledger.forget(elem);
        }
    }
    doc.remove_subtree(node);
}

// ── Element update ────────────────────────────────────────────────────────

/// Attributes the server never owns once set locally: pending-operation
/// refs and the transition-pruning marker survive attribute merges.
// Runtime-owned decorations the serialized markup never carries.
const PRESERVED_ATTRS: &[&str] = &[REF_LOADING_ATTR, REF_LOCK_ATTR, PRUNING_ATTR, STREAM_ATTR];

fn value_bearing(tag: &str) -> bool {
    matches!(tag, "input" | "textarea" | "select")
}

fn update_element(
    doc: &mut Document,
    ledger: &mut RefLedger,
    cx: &mut PatchCx<'_>,
    live: NodeId,
    desired: NodeId,
) {
    // Ignored subtrees: only data attributes sync, children are untouched.
    if doc.attr(live, UPDATE_ATTR) == Some(UPDATE_IGNORE) {
        merge_data_attrs(doc, live, desired);
        doc.remove_subtree(desired);
        return;
    }
    let elem = match doc.elem_id(live) {
        Some(elem) => elem,
        None => {
            doc.remove_subtree(desired);
            return;
        }
    };
    // A lock still in force: keep displaying stale content, buffer the
    // eventual server truth for replay once the lock clears.
    if ledger.is_locked_beyond(elem, cx.patch_ref) {
        ledger.buffer_lock_clone(elem, doc.outer_html(desired));
        doc.remove_subtree(desired);
        return;
    }
    let tag = doc.tag(live).unwrap_or("").to_string();
    let focused_protect =
        doc.focused == Some(live) && doc.is_used(live) && value_bearing(&tag);
    // A structural change to a select's option list overrides focus
    // protection: the retained selection may no longer exist.
    let select_changed = tag == "select" && option_signature(doc, live) != option_signature(doc, desired);
    let protect_value = focused_protect && !select_changed;

    merge_attrs(doc, live, desired, protect_value);
    if !protect_value && value_bearing(&tag) {
        // Server truth wins: drop any stale local override.
        if let Some(el) = doc.element_mut(live) {
            el.value = None;
        }
    }
    cx.events.push(PatchEvent::NodeUpdated { node: live, elem });

    // Children of a nested-session root belong to its own View; selects
    // already reconciled their option list through the signature check.
    let skip_children = live_session_id(doc, live).is_some() && live != cx.target;
    if skip_children {
        doc.remove_subtree(desired);
        return;
    }
    let desired_children: Vec<NodeId> = doc.children(desired).to_vec();
    doc.set_children(desired, Vec::new());
    reconcile_children(doc, ledger, cx, live, desired_children);
    doc.remove_subtree(desired);
}

fn merge_attrs(doc: &mut Document, live: NodeId, desired: NodeId, protect_value: bool) {
    let desired_attrs: Vec<(String, String)> = doc
        .element(desired)
        .map(|el| el.attrs.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let live_attrs: Vec<String> = doc
        .element(live)
        .map(|el| el.attrs.keys().cloned().collect())
        .unwrap_or_default();
    for name in &live_attrs {
        let keep = PRESERVED_ATTRS.contains(&name.as_str())
            || (protect_value && (name == "value" || name == "checked"))
            || desired_attrs.iter().any(|(k, _)| k == name);
        if !keep {
            doc.remove_attr(live, name);
        }
    }
    for (name, value) in desired_attrs {
        if protect_value && (name == "value" || name == "checked") {
            continue;
        }
        if doc.attr(live, &name) != Some(value.as_str()) {
            doc.set_attr(live, &name, &value);
        }
    }
}

fn merge_data_attrs(doc: &mut Document, live: NodeId, desired: NodeId) {
    let desired_attrs: Vec<(String, String)> = doc
        .element(desired)
        .map(|el| {
            el.attrs
                .iter()
                .filter(|(k, _)| k.starts_with("data-"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default();
    for (name, value) in desired_attrs {
        doc.set_attr(live, &name, &value);
    }
}

/// Structural signature of a select's option list: `(value, text)` pairs.
/// Comparing signatures detects option-list changes that should force a
/// reselect even when the selected value looks unchanged.
fn option_signature(doc: &Document, select: NodeId) -> Vec<(String, String)> {
    doc.children(select)
        .iter()
        .filter(|&&c| doc.tag(c) == Some("option"))
        .map(|&c| {
            let text: String = doc
                .children(c)
                .iter()
                .filter_map(|&t| doc.text(t))
                .collect();
            let value = doc
                .attr(c, "value")
                .map(str::to_string)
                .unwrap_or_else(|| text.clone());
            (value, text)
        })
        .collect()
}

// ── Stream reconciliation ─────────────────────────────────────────────────

/// Stream containers bypass keyed child indexing: children are positioned
/// by explicit insert/delete instructions, so applying a stream diff never
/// touches unaffected siblings.
fn reconcile_stream_children(
    doc: &mut Document,
    ledger: &mut RefLedger,
    cx: &mut PatchCx<'_>,
    parent: NodeId,
    desired: Vec<NodeId>,
) {
    let mut desired_ids: IndexSet<String> = IndexSet::new();
    let mut limit: Option<i64> = None;
    for d in desired {
        if !doc.is_element(d) {
            doc.remove_subtree(d);
            continue;
        }
        let dom_id = match doc.id_attr(d) {
            Some(id) => id.to_string(),
            None => {
                warn!("stream item without a dom id");
                doc.remove_subtree(d);
                continue;
            }
        };
        desired_ids.insert(dom_id.clone());
        let ins = cx.inserts.get(&dom_id).copied();
        if let Some((_, l)) = ins {
            limit = l.or(limit);
        }
        let existing = doc
            .children(parent)
            .iter()
            .copied()
            .find(|&c| doc.id_attr(c) == Some(dom_id.as_str()));
        match (existing, ins) {
            (Some(node), ins) => {
                update_element(doc, ledger, cx, node, d);
                if let Some((index, _)) = ins {
                    let index = index.min(doc.children(parent).len().saturating_sub(1));
                    let current = doc.children(parent).iter().position(|&c| c == node);
                    // Re-inserting at the occupied position is a no-op, so
                    // a duplicate delivery of the same insert cannot move
                    // or duplicate the item.
                    if current != Some(index) {
                        doc.insert_child(parent, index, node);
                    }
                }
            }
            (None, Some((index, _))) => {
                if let Some(sref) = cx.stream_refs.get(&dom_id).cloned() {
                    doc.set_attr(d, STREAM_ATTR, &sref);
                }
                mark_added(doc, cx, d);
                doc.insert_child(parent, index, d);
            }
            (None, None) => {
                warn!(id = dom_id.as_str(), "stream item without insert instruction");
                mark_added(doc, cx, d);
                doc.append_child(parent, d);
            }
        }
    }
    // Explicit deletions by dom id.
    let delete_ids: Vec<String> = cx.delete_ids.iter().cloned().collect();
    for dom_id in delete_ids {
        let hit = doc
            .children(parent)
            .iter()
            .copied()
            .find(|&c| doc.id_attr(c) == Some(dom_id.as_str()));
        if let Some(node) = hit {
            discard_subtree(doc, ledger, cx, node);
        }
    }
    // A reset drops items the new markup no longer names.
    if cx.any_reset {
        let stale: Vec<NodeId> = doc
            .children(parent)
            .iter()
            .copied()
            .filter(|&c| {
                doc.is_element(c)
                    && doc
                        .id_attr(c)
                        .map(|id| !desired_ids.contains(id))
                        .unwrap_or(true)
            })
            .collect();
        for node in stale {
            discard_subtree(doc, ledger, cx, node);
        }
    }
    // Capacity: positive limits trim the tail, negative limits the head.
    if let Some(limit) = limit {
        let cap = limit.unsigned_abs() as usize;
        while doc.children(parent).len() > cap {
            let victim = if limit > 0 {
                *doc.children(parent).last().unwrap_or(&parent)
            } else {
                *doc.children(parent).first().unwrap_or(&parent)
            };
            if victim == parent {
                break;
            }
            discard_subtree(doc, ledger, cx, victim);
        }
    }
}
