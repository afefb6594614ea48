//! In-memory document tree for the livesync client runtime.
//!
//! The reconciliation engine needs a live document with a small set of
//! properties a browser DOM provides: ordered children, ordered attribute
//! maps, stable element identity across moves, a focus slot, and value
//! state on form controls. [`Document`] provides exactly that as an arena
//! of nodes addressed by [`NodeId`] (slot indices, no pointer aliasing).
//!
//! Two identifiers exist per element and they are not interchangeable:
//!
//! - [`NodeId`] — the arena slot. Valid only while the node is alive;
//!   slots are recycled after [`Document::remove_subtree`].
//! - [`ElemId`] — a document-unique, never-reused id assigned at element
//!   creation. Survives moves and is the key for all side tables kept by
//!   the engines (ref ledger, hook instances).

pub mod html;

use indexmap::IndexMap;
use thiserror::Error;

pub use html::escape_attr;
pub use html::escape_text;

// ── Errors ────────────────────────────────────────────────────────────────

#[derive(Debug, Error, PartialEq)]
pub enum DomError {
    /// The markup has no parsable root tag or a structurally broken tag.
    #[error("malformed markup: {0}")]
    MalformedMarkup(String),
    /// A `NodeId` referred to a freed or out-of-range slot.
    #[error("stale node id")]
    StaleNode,
}

// ── Identifiers ───────────────────────────────────────────────────────────

/// Arena slot index. Stable while the node is alive, recycled after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Document-unique element identity. Never reused, survives moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElemId(pub u64);

// ── Nodes ─────────────────────────────────────────────────────────────────

/// Tags whose elements never have children and serialize self-contained.
pub const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "source", "track", "wbr",
];

pub fn is_void_tag(tag: &str) -> bool {
    VOID_TAGS.contains(&tag)
}

#[derive(Debug, Clone)]
pub struct Element {
    pub tag: String,
    /// Attributes in insertion order. Order is observable in serialization.
    pub attrs: IndexMap<String, String>,
    pub children: Vec<NodeId>,
    /// Never-reused identity, key for engine side tables.
    pub elem_id: ElemId,
    /// Live value state of a form control, when it diverges from the
    /// `value` attribute (user typed into the control).
    pub value: Option<String>,
    /// Whether the control was touched or submitted by the user.
    pub used: bool,
}

#[derive(Debug, Clone)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Slot {
    node: Node,
    parent: Option<NodeId>,
}

// ── Document ──────────────────────────────────────────────────────────────

/// Arena-backed document tree with one synthetic root element.
#[derive(Debug, Clone, Default)]
pub struct Document {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    root: Option<NodeId>,
    next_elem_id: u64,
    /// The currently focused element, if any.
    pub focused: Option<NodeId>,
}

impl Document {
    /// Create a document with an empty `<body>` root.
    pub fn new() -> Self {
        let mut doc = Document::default();
        let root = doc.create_element("body");
        doc.root = Some(root);
        doc
    }

    /// Create a document whose root's children are parsed from `html`.
    pub fn from_html(html: &str) -> Result<Self, DomError> {
        let mut doc = Document::new();
        let root = doc.root();
        let children = doc.parse_fragment(html)?;
        for child in children {
            doc.append_child(root, child);
        }
        Ok(doc)
    }

    pub fn root(&self) -> NodeId {
        // Set in `new`; `Document::default` is only an internal staging state.
        self.root.unwrap_or(NodeId(0))
    }

    // ── Node access ──────────────────────────────────────────────────────

    fn slot(&self, id: NodeId) -> Option<&Slot> {
        self.slots.get(id.index()).and_then(|s| s.as_ref())
    }

    fn slot_mut(&mut self, id: NodeId) -> Option<&mut Slot> {
        self.slots.get_mut(id.index()).and_then(|s| s.as_mut())
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.slot(id).is_some()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.slot(id).map(|s| &s.node)
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.node(id) {
            Some(Node::Element(el)) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match self.slot_mut(id).map(|s| &mut s.node) {
            Some(Node::Element(el)) => Some(el),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id), Some(Node::Element(_)))
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.tag.as_str())
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.node(id) {
            Some(Node::Text(t)) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) {
        if let Some(slot) = self.slot_mut(id) {
            if let Node::Text(t) = &mut slot.node {
                text.clone_into(t);
            }
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.slot(id).and_then(|s| s.parent)
    }

    pub fn elem_id(&self, id: NodeId) -> Option<ElemId> {
        self.element(id).map(|el| el.elem_id)
    }

    /// Reverse lookup from stable identity to the current arena slot.
    pub fn by_elem_id(&self, elem_id: ElemId) -> Option<NodeId> {
        self.descendants(self.root())
            .find(|&id| self.elem_id(id) == Some(elem_id))
    }

    // ── Construction ─────────────────────────────────────────────────────

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.slots[idx as usize] = Some(Slot { node, parent: None });
            NodeId(idx)
        } else {
            self.slots.push(Some(Slot { node, parent: None }));
            NodeId((self.slots.len() - 1) as u32)
        }
    }

    /// Create a detached element.
    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.next_elem_id += 1;
        let elem_id = ElemId(self.next_elem_id);
        self.alloc(Node::Element(Element {
            tag: tag.to_ascii_lowercase(),
            attrs: IndexMap::new(),
            children: Vec::new(),
            elem_id,
            value: None,
            used: false,
        }))
    }

    /// Create a detached text node.
    pub fn create_text(&mut self, text: &str) -> NodeId {
        self.alloc(Node::Text(text.to_string()))
    }

    // ── Tree surgery ─────────────────────────────────────────────────────

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.element(id).map(|el| el.children.as_slice()).unwrap_or(&[])
    }

    pub fn child_elements(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.is_element(c))
            .collect()
    }

    /// Detach `child` from its current parent, if any.
    pub fn detach(&mut self, child: NodeId) {
        let parent = match self.slot(child).and_then(|s| s.parent) {
            Some(p) => p,
            None => return,
        };
        if let Some(el) = self.element_mut(parent) {
            el.children.retain(|&c| c != child);
        }
        if let Some(slot) = self.slot_mut(child) {
            slot.parent = None;
        }
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        if let Some(el) = self.element_mut(parent) {
            el.children.push(child);
        }
        if let Some(slot) = self.slot_mut(child) {
            slot.parent = Some(parent);
        }
    }

    /// Insert `child` at `index` among `parent`'s children (clamped).
    pub fn insert_child(&mut self, parent: NodeId, index: usize, child: NodeId) {
        self.detach(child);
        if let Some(el) = self.element_mut(parent) {
            let index = index.min(el.children.len());
            el.children.insert(index, child);
        }
        if let Some(slot) = self.slot_mut(child) {
            slot.parent = Some(parent);
        }
    }

    /// Replace `parent`'s child list wholesale, reparenting every entry.
    pub fn set_children(&mut self, parent: NodeId, children: Vec<NodeId>) {
        for &child in &children {
            self.detach(child);
        }
        for &child in &children {
            if let Some(slot) = self.slot_mut(child) {
                slot.parent = Some(parent);
            }
        }
        if let Some(el) = self.element_mut(parent) {
            el.children = children;
        }
    }

    /// Detach `id` and free its whole subtree. Clears focus if it was inside.
    pub fn remove_subtree(&mut self, id: NodeId) {
        if let Some(focused) = self.focused {
            if focused == id || self.contains(id, focused) {
                self.focused = None;
            }
        }
        self.detach(id);
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(el) = self.element(cur) {
                stack.extend(el.children.iter().copied());
            }
            if let Some(slot) = self.slots.get_mut(cur.index()) {
                *slot = None;
                self.free.push(cur.0);
            }
        }
    }

    // ── Attributes ───────────────────────────────────────────────────────

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|el| el.attrs.get(name)).map(|v| v.as_str())
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.element(id).map(|el| el.attrs.contains_key(name)).unwrap_or(false)
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) {
        if let Some(el) = self.element_mut(id) {
            el.attrs.insert(name.to_string(), value.to_string());
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) {
        if let Some(el) = self.element_mut(id) {
            el.attrs.shift_remove(name);
        }
    }

    /// The author-assigned `id` attribute.
    pub fn id_attr(&self, id: NodeId) -> Option<&str> {
        self.attr(id, "id")
    }

    pub fn add_class(&mut self, id: NodeId, class: &str) {
        let mut classes: Vec<String> = self
            .attr(id, "class")
            .map(|c| c.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        if !classes.iter().any(|c| c == class) {
            classes.push(class.to_string());
        }
        self.set_attr(id, "class", &classes.join(" "));
    }

    pub fn remove_class(&mut self, id: NodeId, class: &str) {
        let classes: Vec<String> = self
            .attr(id, "class")
            .map(|c| {
                c.split_whitespace()
                    .filter(|c| *c != class)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        self.set_attr(id, "class", &classes.join(" "));
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .map(|c| c.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    // ── Queries ──────────────────────────────────────────────────────────

    /// All nodes under `root` (excluding `root`) in document order.
    pub fn descendants(&self, root: NodeId) -> Descendants<'_> {
        let mut stack = Vec::new();
        if let Some(el) = self.element(root) {
            stack.extend(el.children.iter().rev().copied());
        }
        Descendants { doc: self, stack }
    }

    /// First element matching the author `id` attribute, whole document.
    pub fn get_element_by_id(&self, dom_id: &str) -> Option<NodeId> {
        self.find_in(self.root(), |doc, n| doc.id_attr(n) == Some(dom_id))
    }

    /// First element under `root` (inclusive) matching `pred`.
    pub fn find_in<F>(&self, root: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        if self.is_element(root) && pred(self, root) {
            return Some(root);
        }
        self.descendants(root)
            .find(|&n| self.is_element(n) && pred(self, n))
    }

    /// All elements under `root` (inclusive) with attribute `name` present.
    pub fn elements_with_attr(&self, root: NodeId, name: &str) -> Vec<NodeId> {
        let mut out = Vec::new();
        if self.has_attr(root, name) {
            out.push(root);
        }
        out.extend(
            self.descendants(root)
                .filter(|&n| self.has_attr(n, name)),
        );
        out
    }

    /// Whether `node` is inside `ancestor`'s subtree (exclusive).
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = self.parent(node);
        while let Some(p) = cur {
            if p == ancestor {
                return true;
            }
            cur = self.parent(p);
        }
        false
    }

    /// Nearest self-or-ancestor element matching `pred`.
    pub fn closest<F>(&self, node: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&Document, NodeId) -> bool,
    {
        let mut cur = Some(node);
        while let Some(n) = cur {
            if self.is_element(n) && pred(self, n) {
                return Some(n);
            }
            cur = self.parent(n);
        }
        None
    }

    // ── Focus and form state ─────────────────────────────────────────────

    pub fn focus(&mut self, id: NodeId) {
        if self.is_element(id) {
            self.focused = Some(id);
        }
    }

    pub fn blur(&mut self) {
        self.focused = None;
    }

    /// The control's live value: user-entered state if present, else the
    /// `value` attribute.
    pub fn value(&self, id: NodeId) -> Option<String> {
        let el = self.element(id)?;
        el.value
            .clone()
            .or_else(|| el.attrs.get("value").cloned())
    }

    pub fn set_value(&mut self, id: NodeId, value: &str) {
        if let Some(el) = self.element_mut(id) {
            el.value = Some(value.to_string());
        }
    }

    /// Mark a control as touched by the user.
    pub fn mark_used(&mut self, id: NodeId) {
        if let Some(el) = self.element_mut(id) {
            el.used = true;
        }
    }

    pub fn is_used(&self, id: NodeId) -> bool {
        self.element(id).map(|el| el.used).unwrap_or(false)
    }

    // ── Parsing & serialization ──────────────────────────────────────────

    /// Parse an HTML fragment into detached nodes owned by this arena.
    pub fn parse_fragment(&mut self, markup: &str) -> Result<Vec<NodeId>, DomError> {
        html::parse_fragment(self, markup)
    }

    /// Replace `id`'s children with nodes parsed from `markup`.
    pub fn set_inner_html(&mut self, id: NodeId, markup: &str) -> Result<(), DomError> {
        let new_children = self.parse_fragment(markup)?;
        for &child in &self.children(id).to_vec() {
            self.remove_subtree(child);
        }
        for child in new_children {
            self.append_child(id, child);
        }
        Ok(())
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(id) {
            html::serialize_node(self, child, &mut out);
        }
        out
    }

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        html::serialize_node(self, id, &mut out);
        out
    }
}

// ── Iterators ─────────────────────────────────────────────────────────────

/// Depth-first, document-order traversal.
pub struct Descendants<'a> {
    doc: &'a Document,
    stack: Vec<NodeId>,
}

impl<'a> Iterator for Descendants<'a> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let next = self.stack.pop()?;
        if let Some(el) = self.doc.element(next) {
            self.stack.extend(el.children.iter().rev().copied());
        }
        Some(next)
    }
}
