//! The rendered-tree store: a client-side structural cache of server
//! markup, keyed by statics/dynamics/component-id, enabling diff-only
//! updates.
//!
//! # Overview
//!
//! A [`Rendered`] holds one fingerprint tree per session plus a table of
//! component trees keyed by a stable, session-scoped component id. Wire
//! diffs are merged in place with [`Rendered::merge_diff`]; markup is
//! produced with [`Rendered::to_string`], which also drains pending stream
//! operations and performs the skip optimization: a root node whose
//! subtree was not touched since its last serialization emits an empty
//! placeholder carrying its magic id instead of real markup, instructing
//! the reconciler to leave the live subtree untouched.
//!
//! Component references are always resolved through the id-indexed table,
//! never held as structural references, so sharing cannot alias. A diff
//! batch's component entries may share statics by reference: a positive
//! id points at another entry in the same batch (resolved batch-first
//! through a cache so order does not matter), a negative id points at the
//! component's own previous render.

use indexmap::{IndexMap, IndexSet};
use serde_json::{Map, Value};
use tracing::warn;

use livesync_dom::html::{inject_root_attrs, leading_tag};
use livesync_dom::is_void_tag;

use crate::error::ClientError;
use crate::protocol::{
    COMPONENTS, COMPONENT_ATTR, DYNAMICS, EVENTS, MAGIC_ID_ATTR, ROOT, SKIP_ATTR, STATICS,
    STREAM, TEMPLATES, TITLE, dynamic_index,
};

// ── Tree types ────────────────────────────────────────────────────────────

/// Ordered literal markup fragments, or a reference into a template table
/// deduplicating statics repeated across list items.
#[derive(Debug, Clone, PartialEq)]
pub enum Statics {
    Literal(Vec<String>),
    TemplateRef(u64),
}

/// One dynamic slot of a rendered node.
#[derive(Debug, Clone, PartialEq)]
pub enum Dynamic {
    Literal(String),
    Nested(RenderedNode),
    /// Reference into the session's component table.
    ComponentRef(i64),
    Comprehension(Comprehension),
}

/// A list-producing node: shared statics applied to one dynamics row per
/// item, with optional deduplicated templates and stream metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Comprehension {
    pub statics: Statics,
    pub rows: Vec<Vec<Dynamic>>,
    pub templates: Option<IndexMap<u64, Vec<String>>>,
    pub stream: Option<StreamMeta>,
}

/// Stream metadata attached to a list-producing node. Applying a stream
/// diff never requires re-serializing unaffected siblings: only inserted
/// rows are carried, deletions and limits are instructions by dom id.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMeta {
    pub stream_ref: String,
    pub inserts: Vec<StreamInsert>,
    pub delete_ids: Vec<String>,
    pub reset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInsert {
    pub dom_id: String,
    pub index: usize,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedNode {
    pub statics: Statics,
    pub dynamics: Vec<Dynamic>,
    /// Marks a node whose serialized output is an addressable element.
    pub root: bool,
    /// Synthetic identity assigned at first serialization of a root node.
    pub magic_id: Option<String>,
    /// Change-tracking flag: set on parse and on merge touch, cleared by
    /// serialization. Roots with `new_render == false` may emit a skip
    /// placeholder.
    pub new_render: bool,
}

impl RenderedNode {
    fn empty() -> Self {
        RenderedNode {
            statics: Statics::Literal(vec![String::new()]),
            dynamics: Vec::new(),
            root: false,
            magic_id: None,
            new_render: true,
        }
    }
}

/// Title and server-pushed events carried alongside a structural diff.
#[derive(Debug, Clone, Default)]
pub struct DiffMeta {
    pub title: Option<String>,
    pub events: Vec<Value>,
}

/// Serialization output: markup plus the stream operations drained from
/// list nodes during this pass.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    pub html: String,
    pub streams: Vec<StreamMeta>,
    /// A missing component id was hit; the session should escalate.
    pub desync: bool,
}

// ── Rendered store ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Rendered {
    view_id: String,
    tree: RenderedNode,
    components: IndexMap<i64, RenderedNode>,
    magic_counter: u64,
    desynced: bool,
}

impl Rendered {
    pub fn new(view_id: &str) -> Self {
        Rendered {
            view_id: view_id.to_string(),
            tree: RenderedNode::empty(),
            components: IndexMap::new(),
            magic_counter: 0,
            desynced: false,
        }
    }

    /// Whether a past serialization hit a protocol desync.
    pub fn needs_reload(&self) -> bool {
        self.desynced
    }

    pub fn component_ids(&self) -> Vec<i64> {
        self.components.keys().copied().collect()
    }

    /// Drop component trees the server confirmed destroyed.
    pub fn prune_components(&mut self, cids: &[i64]) {
        for cid in cids {
            self.components.shift_remove(cid);
        }
    }

    /// Merge a wire diff into the tree in place and return the title and
    /// event payloads it carried.
    pub fn merge_diff(&mut self, diff: &Value) -> Result<DiffMeta, ClientError> {
        let obj = diff
            .as_object()
            .ok_or_else(|| ClientError::Desync("diff is not an object".into()))?;
        let meta = DiffMeta {
            title: obj.get(TITLE).and_then(Value::as_str).map(str::to_string),
            events: obj
                .get(EVENTS)
                .and_then(Value::as_array)
                .map(|a| a.to_vec())
                .unwrap_or_default(),
        };
        if let Some(cdiffs) = obj.get(COMPONENTS) {
            let cdiffs = cdiffs
                .as_object()
                .ok_or_else(|| ClientError::Desync("component diff is not an object".into()))?;
            self.merge_components(cdiffs)?;
        }
        merge_node(&mut self.tree, obj)?;
        Ok(meta)
    }

    /// Component diffs resolve as a two-pass process per merge: first every
    /// referenced component is resolved into a cache (following reference
    /// chains), then the cache commits into the permanent table, so chains
    /// of shared statics resolve regardless of wire order.
    fn merge_components(&mut self, cdiffs: &Map<String, Value>) -> Result<(), ClientError> {
        let mut cache: IndexMap<i64, RenderedNode> = IndexMap::new();
        for (key, cdiff) in cdiffs {
            let cid: i64 = key
                .parse()
                .map_err(|_| ClientError::Desync(format!("bad component id {key:?}")))?;
            self.resolve_component(cid, cdiff, cdiffs, &mut cache)?;
        }
        let mut dirty: IndexSet<i64> = cache.keys().copied().collect();
        for (cid, node) in cache {
            self.components.insert(cid, node);
        }
        // A node embedding a freshly merged component is itself changed:
        // re-flag change tracking along every reference so no enclosing
        // root can emit a skip placeholder over stale component markup.
        // Component-to-component references close transitively first.
        let mut grew = true;
        while grew {
            grew = false;
            let found: Vec<i64> = self
                .components
                .iter()
                .filter(|(cid, node)| !dirty.contains(*cid) && node_references(node, &dirty))
                .map(|(cid, _)| *cid)
                .collect();
            for cid in found {
                dirty.insert(cid);
                grew = true;
            }
        }
        for cid in &dirty {
            if let Some(node) = self.components.get_mut(cid) {
                node.new_render = true;
            }
        }
        mark_component_references(&mut self.tree, &dirty);
        Ok(())
    }

    fn resolve_component(
        &self,
        cid: i64,
        cdiff: &Value,
        batch: &Map<String, Value>,
        cache: &mut IndexMap<i64, RenderedNode>,
    ) -> Result<(), ClientError> {
        if cache.contains_key(&cid) {
            return Ok(());
        }
        let obj = cdiff
            .as_object()
            .ok_or_else(|| ClientError::Desync(format!("component {cid} diff is not an object")))?;
        let share = obj.get(STATICS).and_then(Value::as_i64);
        let node = if let Some(scid) = share {
            let mut base = if scid > 0 {
                if let Some(tdiff) = batch.get(&scid.to_string()) {
                    self.resolve_component(scid, tdiff, batch, cache)?;
                    cache
                        .get(&scid)
                        .cloned()
                        .ok_or_else(|| ClientError::Desync(format!("unresolved component {scid}")))?
                } else {
                    self.components.get(&scid).cloned().ok_or_else(|| {
                        ClientError::Desync(format!("component {cid} shares missing {scid}"))
                    })?
                }
            } else {
                self.components.get(&-scid).cloned().ok_or_else(|| {
                    ClientError::Desync(format!("component {cid} has no previous render {scid}"))
                })?
            };
            if scid > 0 && scid != cid {
                // A tree borrowed from another component must render with
                // its own fresh identity.
                prune_magic_ids(&mut base);
            }
            merge_node_fields(&mut base, obj, true)?;
            base.new_render = true;
            base
        } else if obj.contains_key(STATICS) {
            let mut node = parse_node(obj)?;
            node.magic_id = self.components.get(&cid).and_then(|n| n.magic_id.clone());
            node
        } else {
            let mut base = self.components.get(&cid).cloned().ok_or_else(|| {
                ClientError::Desync(format!("partial diff for unknown component {cid}"))
            })?;
            merge_node_fields(&mut base, obj, false)?;
            base
        };
        cache.insert(cid, node);
        Ok(())
    }

    /// Serialize the whole tree, draining stream operations and applying
    /// the skip optimization to unchanged roots.
    pub fn to_string(&mut self) -> Result<RenderedOutput, ClientError> {
        let Rendered { view_id, tree, components, magic_counter, desynced } = self;
        let mut streams = Vec::new();
        let mut desync = false;
        let mut cx = SerializeCx {
            components,
            view_id,
            magic_counter,
            streams: &mut streams,
            desync: &mut desync,
        };
        let mut html = String::new();
        serialize_node(tree, &mut cx, true, None, &mut html)?;
        *desynced |= desync;
        Ok(RenderedOutput { html, streams, desync })
    }

    /// Serialize one component subtree on its own, without change
    /// tracking. Used for component-targeted re-renders.
    pub fn component_to_string(&mut self, cid: i64) -> Result<RenderedOutput, ClientError> {
        let Rendered { view_id, components, magic_counter, desynced, .. } = self;
        let mut streams = Vec::new();
        let mut desync = false;
        let mut cx = SerializeCx {
            components,
            view_id,
            magic_counter,
            streams: &mut streams,
            desync: &mut desync,
        };
        let mut html = String::new();
        serialize_component_ref(cid, &mut cx, false, &mut html)?;
        *desynced |= desync;
        Ok(RenderedOutput { html, streams, desync })
    }
}

// ── Parsing ───────────────────────────────────────────────────────────────

fn truthy(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn parse_statics(v: &Value) -> Result<Statics, ClientError> {
    match v {
        Value::Array(parts) => {
            let mut out = Vec::with_capacity(parts.len());
            for part in parts {
                match part.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => {
                        return Err(ClientError::Desync("non-string static fragment".into()));
                    }
                }
            }
            Ok(Statics::Literal(out))
        }
        Value::Number(n) => n
            .as_u64()
            .map(Statics::TemplateRef)
            .ok_or_else(|| ClientError::Desync("bad template reference".into())),
        _ => Err(ClientError::Desync("bad statics value".into())),
    }
}

fn parse_templates(v: &Value) -> Result<IndexMap<u64, Vec<String>>, ClientError> {
    let obj = v
        .as_object()
        .ok_or_else(|| ClientError::Desync("template table is not an object".into()))?;
    let mut out = IndexMap::new();
    for (key, parts) in obj {
        let tid: u64 = key
            .parse()
            .map_err(|_| ClientError::Desync(format!("bad template id {key:?}")))?;
        match parse_statics(parts)? {
            Statics::Literal(parts) => {
                out.insert(tid, parts);
            }
            Statics::TemplateRef(_) => {
                return Err(ClientError::Desync("template table entry references a template".into()));
            }
        }
    }
    Ok(out)
}

fn parse_stream(v: &Value) -> Result<StreamMeta, ClientError> {
    let arr = v
        .as_array()
        .filter(|a| a.len() >= 4)
        .ok_or_else(|| ClientError::Desync("bad stream payload".into()))?;
    let stream_ref = match &arr[0] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return Err(ClientError::Desync("bad stream ref".into())),
    };
    let mut inserts = Vec::new();
    for ins in arr[1].as_array().into_iter().flatten() {
        let tuple = ins
            .as_array()
            .filter(|t| t.len() >= 2)
            .ok_or_else(|| ClientError::Desync("bad stream insert".into()))?;
        let dom_id = tuple[0]
            .as_str()
            .ok_or_else(|| ClientError::Desync("bad stream insert id".into()))?
            .to_string();
        let index = tuple[1]
            .as_u64()
            .ok_or_else(|| ClientError::Desync("bad stream insert index".into()))?
            as usize;
        let limit = tuple.get(2).and_then(Value::as_i64);
        inserts.push(StreamInsert { dom_id, index, limit });
    }
    let delete_ids = arr[2]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let reset = truthy(arr.get(3));
    Ok(StreamMeta { stream_ref, inserts, delete_ids, reset })
}

fn parse_node(obj: &Map<String, Value>) -> Result<RenderedNode, ClientError> {
    let statics = parse_statics(
        obj.get(STATICS)
            .ok_or_else(|| ClientError::Desync("node without statics".into()))?,
    )?;
    let dyn_count = match &statics {
        Statics::Literal(parts) => parts.len().saturating_sub(1),
        Statics::TemplateRef(_) => obj
            .keys()
            .filter_map(|k| dynamic_index(k))
            .map(|i| i + 1)
            .max()
            .unwrap_or(0),
    };
    let mut dynamics = Vec::with_capacity(dyn_count);
    for i in 0..dyn_count {
        let slot = match obj.get(&i.to_string()) {
            Some(v) => parse_dynamic(v)?,
            None => Dynamic::Literal(String::new()),
        };
        dynamics.push(slot);
    }
    Ok(RenderedNode {
        statics,
        dynamics,
        root: truthy(obj.get(ROOT)),
        magic_id: None,
        new_render: true,
    })
}

fn parse_dynamic(v: &Value) -> Result<Dynamic, ClientError> {
    match v {
        Value::String(s) => Ok(Dynamic::Literal(s.clone())),
        Value::Number(n) => match n.as_i64() {
            Some(cid) => Ok(Dynamic::ComponentRef(cid)),
            None => Ok(Dynamic::Literal(n.to_string())),
        },
        Value::Bool(b) => Ok(Dynamic::Literal(b.to_string())),
        Value::Null => Ok(Dynamic::Literal(String::new())),
        Value::Object(obj) => {
            if obj.contains_key(DYNAMICS) {
                Ok(Dynamic::Comprehension(parse_comprehension(obj)?))
            } else {
                Ok(Dynamic::Nested(parse_node(obj)?))
            }
        }
        Value::Array(_) => Err(ClientError::Desync("array in dynamic slot".into())),
    }
}

fn parse_rows(v: &Value) -> Result<Vec<Vec<Dynamic>>, ClientError> {
    let rows = v
        .as_array()
        .ok_or_else(|| ClientError::Desync("comprehension rows are not an array".into()))?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row
            .as_array()
            .ok_or_else(|| ClientError::Desync("comprehension row is not an array".into()))?;
        let mut slots = Vec::with_capacity(row.len());
        for v in row {
            slots.push(parse_dynamic(v)?);
        }
        out.push(slots);
    }
    Ok(out)
}

fn parse_comprehension(obj: &Map<String, Value>) -> Result<Comprehension, ClientError> {
    Ok(Comprehension {
        statics: parse_statics(
            obj.get(STATICS)
                .ok_or_else(|| ClientError::Desync("comprehension without statics".into()))?,
        )?,
        rows: parse_rows(
            obj.get(DYNAMICS)
                .ok_or_else(|| ClientError::Desync("comprehension without rows".into()))?,
        )?,
        templates: obj.get(TEMPLATES).map(parse_templates).transpose()?,
        stream: obj.get(STREAM).map(parse_stream).transpose()?,
    })
}

// ── Merging ───────────────────────────────────────────────────────────────

fn merge_node(node: &mut RenderedNode, obj: &Map<String, Value>) -> Result<(), ClientError> {
    merge_node_fields(node, obj, false)
}

/// Merge a diff object into an existing node. With `skip_statics`, the
/// statics key is ignored (the caller already resolved a shared base).
fn merge_node_fields(
    node: &mut RenderedNode,
    obj: &Map<String, Value>,
    skip_statics: bool,
) -> Result<(), ClientError> {
    if !skip_statics && obj.contains_key(STATICS) {
        // New fingerprint: the subtree is replaced wholesale. The magic id
        // carries over so document identity survives the replacement.
        let magic_id = node.magic_id.take();
        *node = parse_node(obj)?;
        node.magic_id = magic_id;
        return Ok(());
    }
    // Shared-base merges always produce a fresh render; otherwise only a
    // merge that actually touches a slot invalidates change tracking.
    let mut touched = skip_statics;
    for (key, val) in obj {
        if key == COMPONENTS || key == EVENTS || key == TITLE || (skip_statics && key == STATICS) {
            continue;
        }
        if key == ROOT {
            node.root = truthy(Some(val));
            continue;
        }
        match dynamic_index(key) {
            Some(idx) if idx < node.dynamics.len() => {
                merge_dynamic(&mut node.dynamics[idx], val)?;
                touched = true;
            }
            Some(idx) => {
                return Err(ClientError::Desync(format!(
                    "dynamic index {idx} out of range ({} slots)",
                    node.dynamics.len()
                )));
            }
            None => {
                warn!(key = key.as_str(), "ignoring unknown diff key");
            }
        }
    }
    if touched {
        node.new_render = true;
    }
    Ok(())
}

fn merge_dynamic(slot: &mut Dynamic, val: &Value) -> Result<(), ClientError> {
    match val {
        Value::Object(obj) => {
            if obj.contains_key(DYNAMICS) {
                merge_comprehension(slot, obj)
            } else if obj.contains_key(STATICS) {
                // Fresh fingerprint replaces the slot; a nested root's
                // identity carries over.
                let magic_id = match slot {
                    Dynamic::Nested(n) => n.magic_id.take(),
                    _ => None,
                };
                *slot = parse_dynamic(val)?;
                if let Dynamic::Nested(n) = slot {
                    if n.magic_id.is_none() {
                        n.magic_id = magic_id;
                    }
                }
                Ok(())
            } else {
                match slot {
                    Dynamic::Nested(n) => merge_node(n, obj),
                    // A stream/template-only update for an existing list.
                    Dynamic::Comprehension(_) => merge_comprehension(slot, obj),
                    _ => Err(ClientError::Desync(
                        "partial diff for a slot with no nested tree".into(),
                    )),
                }
            }
        }
        _ => {
            *slot = parse_dynamic(val)?;
            Ok(())
        }
    }
}

fn merge_comprehension(slot: &mut Dynamic, obj: &Map<String, Value>) -> Result<(), ClientError> {
    if let Dynamic::Comprehension(c) = slot {
        if let Some(s) = obj.get(STATICS) {
            c.statics = parse_statics(s)?;
        }
        if let Some(p) = obj.get(TEMPLATES) {
            let parsed = parse_templates(p)?;
            match &mut c.templates {
                Some(existing) => existing.extend(parsed),
                None => c.templates = Some(parsed),
            }
        }
        if let Some(d) = obj.get(DYNAMICS) {
            c.rows = parse_rows(d)?;
        }
        if let Some(st) = obj.get(STREAM) {
            c.stream = Some(parse_stream(st)?);
        }
        Ok(())
    } else {
        *slot = Dynamic::Comprehension(parse_comprehension(obj)?);
        Ok(())
    }
}

fn prune_magic_ids(node: &mut RenderedNode) {
    node.magic_id = None;
    for slot in &mut node.dynamics {
        match slot {
            Dynamic::Nested(n) => prune_magic_ids(n),
            Dynamic::Comprehension(c) => {
                for row in &mut c.rows {
                    for slot in row {
                        if let Dynamic::Nested(n) = slot {
                            prune_magic_ids(n);
                        }
                    }
                }
            }
            _ => {}
        }
    }
}

fn node_references(node: &RenderedNode, cids: &IndexSet<i64>) -> bool {
    node.dynamics.iter().any(|d| dynamic_references(d, cids))
}

fn dynamic_references(d: &Dynamic, cids: &IndexSet<i64>) -> bool {
    match d {
        Dynamic::Literal(_) => false,
        Dynamic::ComponentRef(cid) => cids.contains(cid),
        Dynamic::Nested(node) => node_references(node, cids),
        Dynamic::Comprehension(comp) => comp
            .rows
            .iter()
            .flatten()
            .any(|d| dynamic_references(d, cids)),
    }
}

/// Set `new_render` on every node whose subtree references one of `cids`.
fn mark_component_references(node: &mut RenderedNode, cids: &IndexSet<i64>) -> bool {
    let mut dirty = false;
    for d in node.dynamics.iter_mut() {
        dirty |= mark_dynamic_references(d, cids);
    }
    if dirty {
        node.new_render = true;
    }
    dirty
}

fn mark_dynamic_references(d: &mut Dynamic, cids: &IndexSet<i64>) -> bool {
    match d {
        Dynamic::Literal(_) => false,
        Dynamic::ComponentRef(cid) => cids.contains(cid),
        Dynamic::Nested(node) => mark_component_references(node, cids),
        Dynamic::Comprehension(comp) => {
            let mut dirty = false;
            for row in comp.rows.iter_mut() {
                for d in row.iter_mut() {
                    dirty |= mark_dynamic_references(d, cids);
                }
            }
            dirty
        }
    }
}

// ── Serialization ─────────────────────────────────────────────────────────

struct SerializeCx<'a> {
    components: &'a mut IndexMap<i64, RenderedNode>,
    view_id: &'a str,
    magic_counter: &'a mut u64,
    streams: &'a mut Vec<StreamMeta>,
    desync: &'a mut bool,
}

impl SerializeCx<'_> {
    fn next_magic_id(&mut self) -> String {
        *self.magic_counter += 1;
        format!("m{}-{}", self.magic_counter, self.view_id)
    }
}

const NO_STATICS: &[String] = &[];

fn resolve_statics<'a>(
    statics: &'a Statics,
    templates: Option<&'a IndexMap<u64, Vec<String>>>,
    desync: &mut bool,
) -> &'a [String] {
    match statics {
        Statics::Literal(parts) => parts,
        Statics::TemplateRef(tid) => match templates.and_then(|t| t.get(tid)) {
            Some(parts) => parts,
            None => {
                warn!(template = tid, "unresolved template reference");
                *desync = true;
                NO_STATICS
            }
        },
    }
}

fn serialize_node(
    node: &mut RenderedNode,
    cx: &mut SerializeCx<'_>,
    tracking: bool,
    templates: Option<&IndexMap<u64, Vec<String>>>,
    out: &mut String,
) -> Result<(), ClientError> {
    if !node.root {
        return serialize_body(node, cx, tracking, templates, out);
    }
    if tracking && !node.new_render {
        if let Some(magic_id) = node.magic_id.clone() {
            let parts = resolve_statics(&node.statics, templates, cx.desync);
            let first = parts.first().map(String::as_str).unwrap_or("");
            emit_skip_placeholder(first, &magic_id, None, out)?;
            return Ok(());
        }
    }
    let mut body = String::new();
    serialize_body(node, cx, tracking, templates, &mut body)?;
    if node.magic_id.is_none() {
        node.magic_id = Some(cx.next_magic_id());
    }
    let magic_id = node.magic_id.clone().unwrap_or_default();
    out.push_str(&inject_root_attrs(&body, &[(MAGIC_ID_ATTR, &magic_id)], false)?);
    node.new_render = false;
    Ok(())
}

fn serialize_body(
    node: &mut RenderedNode,
    cx: &mut SerializeCx<'_>,
    tracking: bool,
    templates: Option<&IndexMap<u64, Vec<String>>>,
    out: &mut String,
) -> Result<(), ClientError> {
    let RenderedNode { statics, dynamics, .. } = node;
    let parts = resolve_statics(statics, templates, cx.desync).to_vec();
    if parts.len() != dynamics.len() + 1 && !parts.is_empty() {
        warn!(
            statics = parts.len(),
            dynamics = dynamics.len(),
            "statics/dynamics arity mismatch"
        );
        *cx.desync = true;
    }
    for (i, slot) in dynamics.iter_mut().enumerate() {
        out.push_str(parts.get(i).map(String::as_str).unwrap_or(""));
        serialize_dynamic(slot, cx, tracking, templates, out)?;
    }
    out.push_str(parts.get(dynamics.len()).map(String::as_str).unwrap_or(""));
    Ok(())
}

fn serialize_dynamic(
    slot: &mut Dynamic,
    cx: &mut SerializeCx<'_>,
    tracking: bool,
    templates: Option<&IndexMap<u64, Vec<String>>>,
    out: &mut String,
) -> Result<(), ClientError> {
    match slot {
        Dynamic::Literal(s) => {
            out.push_str(s);
            Ok(())
        }
        Dynamic::Nested(n) => serialize_node(n, cx, tracking, templates, out),
        Dynamic::ComponentRef(cid) => serialize_component_ref(*cid, cx, tracking, out),
        Dynamic::Comprehension(c) => serialize_comprehension(c, cx, out),
    }
}

/// Change tracking is always off inside a list: item statics repeat and
/// per-item skip placeholders would defeat stream positioning.
fn serialize_comprehension(
    c: &mut Comprehension,
    cx: &mut SerializeCx<'_>,
    out: &mut String,
) -> Result<(), ClientError> {
    let Comprehension { statics, rows, templates, stream } = c;
    let is_stream = stream.is_some();
    if let Some(meta) = stream.take() {
        cx.streams.push(meta);
    }
    let templates = templates.as_ref();
    let parts = resolve_statics(statics, templates, cx.desync).to_vec();
    for row in rows.iter_mut() {
        for (i, slot) in row.iter_mut().enumerate() {
            out.push_str(parts.get(i).map(String::as_str).unwrap_or(""));
            serialize_dynamic(slot, cx, false, templates, out)?;
        }
        out.push_str(parts.get(row.len()).map(String::as_str).unwrap_or(""));
    }
    if is_stream {
        // Stream rows carry only the inserted items; they are consumed by
        // this serialization and must not replay on the next pass.
        rows.clear();
    }
    Ok(())
}

fn serialize_component_ref(
    cid: i64,
    cx: &mut SerializeCx<'_>,
    tracking: bool,
    out: &mut String,
) -> Result<(), ClientError> {
    if cid <= 0 {
        warn!(cid, "unresolved component reference at serialization");
        *cx.desync = true;
        return Ok(());
    }
    let mut node = match cx.components.get_mut(&cid) {
        Some(slot) => std::mem::replace(slot, RenderedNode::empty()),
        None => {
            warn!(cid, "missing component at serialization");
            *cx.desync = true;
            return Ok(());
        }
    };
    let result = serialize_component_node(cid, &mut node, cx, tracking, out);
    if let Some(slot) = cx.components.get_mut(&cid) {
        *slot = node;
    }
    result
}

/// A component's top node serializes with root semantics whether or not it
/// carries the root flag: it is always an addressable element.
fn serialize_component_node(
    cid: i64,
    node: &mut RenderedNode,
    cx: &mut SerializeCx<'_>,
    tracking: bool,
    out: &mut String,
) -> Result<(), ClientError> {
    let cid_text = cid.to_string();
    if tracking && !node.new_render {
        if let Some(magic_id) = node.magic_id.clone() {
            let parts = resolve_statics(&node.statics, None, cx.desync);
            let first = parts.first().map(String::as_str).unwrap_or("");
            emit_skip_placeholder(first, &magic_id, Some(&cid_text), out)?;
            return Ok(());
        }
    }
    let mut body = String::new();
    serialize_body(node, cx, tracking, None, &mut body)?;
    if node.magic_id.is_none() {
        node.magic_id = Some(cx.next_magic_id());
    }
    let magic_id = node.magic_id.clone().unwrap_or_default();
    out.push_str(&inject_root_attrs(
        &body,
        &[(COMPONENT_ATTR, &cid_text), (MAGIC_ID_ATTR, &magic_id)],
        false,
    )?);
    node.new_render = false;
    Ok(())
}

fn emit_skip_placeholder(
    first_static: &str,
    magic_id: &str,
    cid: Option<&str>,
    out: &mut String,
) -> Result<(), ClientError> {
    let tag = leading_tag(first_static)?;
    out.push('<');
    out.push_str(&tag);
    if let Some(cid) = cid {
        out.push_str(&format!(" {COMPONENT_ATTR}=\"{cid}\""));
    }
    out.push_str(&format!(" {SKIP_ATTR} {MAGIC_ID_ATTR}=\"{magic_id}\">"));
    if !is_void_tag(&tag) {
        out.push_str(&format!("</{tag}>"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mount(view_id: &str, diff: Value) -> Rendered {
        let mut rendered = Rendered::new(view_id);
        rendered.merge_diff(&diff).unwrap();
        rendered
    }

    #[test]
    fn mount_and_serialize() {
        let mut r = mount("v", json!({"0": "abc", "s": ["<div>", "</div>"], "r": 1}));
        let out = r.to_string().unwrap();
        assert_eq!(out.html, r#"<div data-live-id="m1-v">abc</div>"#);
        assert!(!out.desync);
    }

    #[test]
    fn skip_placeholder_after_unchanged_reserialize() {
        let mut r = mount("v", json!({"0": "abc", "s": ["<div>", "</div>"], "r": 1}));
        let first = r.to_string().unwrap();
        assert!(first.html.contains("abc"));
        let second = r.to_string().unwrap();
        assert_eq!(second.html, r#"<div data-live-skip data-live-id="m1-v"></div>"#);
        // A merge touching the tree re-emits real markup with the same id.
        r.merge_diff(&json!({"0": "xyz"})).unwrap();
        let third = r.to_string().unwrap();
        assert_eq!(third.html, r#"<div data-live-id="m1-v">xyz</div>"#);
    }

    #[test]
    fn component_only_diff_defeats_skip_placeholder() {
        let mut r = mount(
            "v",
            json!({
                "0": 1,
                "s": ["<div>", "</div>"],
                "r": 1,
                "c": {"1": {"0": "x", "s": ["<span>", "</span>"]}}
            }),
        );
        r.to_string().unwrap();
        // Nothing but the component table changes.
        r.merge_diff(&json!({"c": {"1": {"0": "y"}}})).unwrap();
        let out = r.to_string().unwrap();
        assert!(out.html.contains(">y</span>"), "html: {}", out.html);
        assert!(!out.html.contains(SKIP_ATTR), "html: {}", out.html);
    }

    #[test]
    fn component_chain_dirties_referencing_component() {
        // Component 1 embeds component 2; a diff touching only 2 must
        // re-render through 1 as well.
        let mut r = mount(
            "v",
            json!({
                "0": 1,
                "s": ["<div>", "</div>"],
                "r": 1,
                "c": {
                    "1": {"0": 2, "s": ["<section>", "</section>"]},
                    "2": {"0": "a", "s": ["<span>", "</span>"]}
                }
            }),
        );
        r.to_string().unwrap();
        r.merge_diff(&json!({"c": {"2": {"0": "b"}}})).unwrap();
        let out = r.to_string().unwrap();
        assert!(out.html.contains(">b</span>"), "html: {}", out.html);
        assert!(!out.html.contains(SKIP_ATTR), "html: {}", out.html);
    }

    #[test]
    fn magic_id_survives_fingerprint_replacement() {
        let mut r = mount("v", json!({"0": "a", "s": ["<div>", "</div>"], "r": 1}));
        r.to_string().unwrap();
        r.merge_diff(&json!({"0": "b", "s": ["<section>", "</section>"], "r": 1}))
            .unwrap();
        let out = r.to_string().unwrap();
        assert_eq!(out.html, r#"<section data-live-id="m1-v">b</section>"#);
    }

    #[test]
    fn nested_partial_merge() {
        let mut r = mount(
            "v",
            json!({
                "0": {"0": "in", "s": ["<span>", "</span>"]},
                "s": ["<div>", "</div>"]
            }),
        );
        r.merge_diff(&json!({"0": {"0": "out"}})).unwrap();
        let out = r.to_string().unwrap();
        assert_eq!(out.html, "<div><span>out</span></div>");
    }

    #[test]
    fn component_render_and_target_serialization() {
        let mut r = mount(
            "v",
            json!({
                "0": 1,
                "s": ["<div>", "</div>"],
                "c": {"1": {"0": "x", "s": ["<span>", "</span>"]}}
            }),
        );
        let out = r.to_string().unwrap();
        assert_eq!(
            out.html,
            r#"<div><span data-live-component="1" data-live-id="m1-v">x</span></div>"#
        );
        r.merge_diff(&json!({"c": {"1": {"0": "y"}}})).unwrap();
        let comp = r.component_to_string(1).unwrap();
        assert_eq!(
            comp.html,
            r#"<span data-live-component="1" data-live-id="m1-v">y</span>"#
        );
    }

    #[test]
    fn component_shares_statics_regardless_of_batch_order() {
        // Component 2 borrows 1's statics; entry 2 appears first.
        let c = json!({
            "2": {"0": "b", "s": 1},
            "1": {"0": "a", "s": ["<b>", "</b>"]}
        });
        let mut r = mount("v", json!({"0": 1, "1": 2, "s": ["<div>", "", "</div>"], "c": c}));
        let out = r.to_string().unwrap();
        assert!(out.html.contains(r#"data-live-component="1""#));
        assert!(out.html.contains(">a</b>"));
        assert!(out.html.contains(r#"data-live-component="2""#));
        assert!(out.html.contains(">b</b>"));
        assert!(!out.desync);
    }

    #[test]
    fn component_self_share_keeps_previous_tree() {
        let mut r = mount(
            "v",
            json!({
                "0": 1,
                "s": ["<div>", "</div>"],
                "c": {"1": {"0": "a", "s": ["<b>", "</b>"]}}
            }),
        );
        r.to_string().unwrap();
        // Re-render structurally identical to the replaced one.
        r.merge_diff(&json!({"c": {"1": {"s": -1}}})).unwrap();
        let out = r.to_string().unwrap();
        assert!(out.html.contains(">a</b>"), "html: {}", out.html);
        assert!(!out.desync);
    }

    #[test]
    fn missing_component_degrades_with_desync_flag() {
        let mut r = mount("v", json!({"0": 9, "s": ["<div>", "</div>"], "r": 1}));
        let out = r.to_string().unwrap();
        assert_eq!(out.html, r#"<div data-live-id="m1-v"></div>"#);
        assert!(out.desync);
        assert!(r.needs_reload());
    }

    #[test]
    fn comprehension_rows_with_templates() {
        let mut r = mount(
            "v",
            json!({
                "0": {
                    "d": [[{"0": "a", "s": 0}], [{"0": "b", "s": 0}]],
                    "p": {"0": ["<li>", "</li>"]},
                    "s": ["", ""]
                },
                "s": ["<ul>", "</ul>"]
            }),
        );
        let out = r.to_string().unwrap();
        assert_eq!(out.html, "<ul><li>a</li><li>b</li></ul>");
    }

    #[test]
    fn stream_ops_drain_once_and_rows_consume() {
        let mut r = mount(
            "v",
            json!({
                "0": {
                    "d": [["i1", "one"]],
                    "s": ["<li id=\"", "\">", "</li>"],
                    "stream": ["s1", [["i1", 0, null]], [], false]
                },
                "s": ["<ul live-update=\"stream\">", "</ul>"]
            }),
        );
        let out = r.to_string().unwrap();
        assert!(out.html.contains(r#"<li id="i1">one</li>"#));
        assert_eq!(out.streams.len(), 1);
        assert_eq!(out.streams[0].inserts[0].dom_id, "i1");
        // Without a new diff the rows and ops are consumed.
        let again = r.to_string().unwrap();
        assert!(again.streams.is_empty());
        assert!(!again.html.contains("<li"));
    }

    #[test]
    fn component_gc_pruning() {
        let mut r = mount(
            "v",
            json!({
                "0": 1,
                "s": ["<div>", "</div>"],
                "c": {"1": {"0": "x", "s": ["<span>", "</span>"]}}
            }),
        );
        assert_eq!(r.component_ids(), vec![1]);
        r.prune_components(&[1]);
        assert!(r.component_ids().is_empty());
        let out = r.to_string().unwrap();
        assert!(out.desync);
    }

    #[test]
    fn title_and_events_extracted() {
        let mut r = mount("v", json!({"0": "a", "s": ["<div>", "</div>"]}));
        let meta = r
            .merge_diff(&json!({"0": "b", "t": "New Title", "e": [["ev", {"k": 1}]]}))
            .unwrap();
        assert_eq!(meta.title.as_deref(), Some("New Title"));
        assert_eq!(meta.events.len(), 1);
    }
}
