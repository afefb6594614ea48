//! Element lifecycle hooks.
//!
//! A hook is attached declaratively with the `live-hook` attribute naming
//! a factory registered in [`HookRegistry`]; the session layer instantiates
//! one hook per element at mount and keeps it in a side table keyed by the
//! element's stable [`ElemId`]. All lifecycle methods default to no-ops.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::warn;

use livesync_dom::{Document, ElemId, NodeId};

/// What a hook asked the runtime to do. Hooks run mid-dispatch while the
/// document is borrowed, so their effects are collected and applied by the
/// socket afterwards instead of calling back into it.
#[derive(Debug, Clone, PartialEq)]
pub enum HookEffect {
    /// Push a custom event to the element's owning session.
    Push { event: String, payload: Value },
}

/// Per-invocation context handed to every lifecycle method.
pub struct HookCtx<'a> {
    pub doc: &'a Document,
    pub node: NodeId,
    pub view_id: &'a str,
    effects: &'a mut Vec<HookEffect>,
}

impl<'a> HookCtx<'a> {
    pub fn new(
        doc: &'a Document,
        node: NodeId,
        view_id: &'a str,
        effects: &'a mut Vec<HookEffect>,
    ) -> Self {
        HookCtx { doc, node, view_id, effects }
    }

    pub fn push_event(&mut self, event: &str, payload: Value) {
        self.effects.push(HookEffect::Push { event: event.to_string(), payload });
    }
}

#[allow(unused_variables)]
pub trait Hook {
    fn mounted(&mut self, cx: &mut HookCtx<'_>) {}
    fn before_update(&mut self, cx: &mut HookCtx<'_>) {}
    fn updated(&mut self, cx: &mut HookCtx<'_>) {}
    fn destroyed(&mut self, cx: &mut HookCtx<'_>) {}
    fn disconnected(&mut self, cx: &mut HookCtx<'_>) {}
    fn reconnected(&mut self, cx: &mut HookCtx<'_>) {}
}

type HookFactory = Box<dyn Fn() -> Box<dyn Hook>>;

/// Named hook constructors, passed into the socket at construction.
#[derive(Default)]
pub struct HookRegistry {
    factories: IndexMap<String, HookFactory>,
}

impl HookRegistry {
    pub fn new() -> Self {
        HookRegistry::default()
    }

    pub fn register<F, H>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> H + 'static,
        H: Hook + 'static,
    {
        self.factories
            .insert(name.to_string(), Box::new(move || Box::new(factory())));
    }

    pub fn instantiate(&self, name: &str) -> Option<Box<dyn Hook>> {
        match self.factories.get(name) {
            Some(factory) => Some(factory()),
            None => {
                warn!(hook = name, "no factory registered for hook");
                None
            }
        }
    }
}

/// Live hook instances, keyed by stable element identity.
#[derive(Default)]
pub struct HookTable {
    instances: IndexMap<ElemId, Box<dyn Hook>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    Mounted,
    BeforeUpdate,
    Updated,
    Destroyed,
    Disconnected,
    Reconnected,
}

impl HookTable {
    pub fn new() -> Self {
        HookTable::default()
    }

    pub fn insert(&mut self, elem: ElemId, hook: Box<dyn Hook>) {
        self.instances.insert(elem, hook);
    }

    pub fn contains(&self, elem: ElemId) -> bool {
        self.instances.contains_key(&elem)
    }

    pub fn remove(&mut self, elem: ElemId) -> Option<Box<dyn Hook>> {
        self.instances.shift_remove(&elem)
    }

    pub fn elems(&self) -> Vec<ElemId> {
        self.instances.keys().copied().collect()
    }

    /// Run one lifecycle stage on the instance for `elem`, if any,
    /// collecting requested effects into `effects`.
    pub fn run(
        &mut self,
        elem: ElemId,
        stage: HookStage,
        doc: &Document,
        node: NodeId,
        view_id: &str,
        effects: &mut Vec<HookEffect>,
    ) {
        let hook = match self.instances.get_mut(&elem) {
            Some(hook) => hook,
            None => return,
        };
        let mut cx = HookCtx { doc, node, view_id, effects };
        match stage {
            HookStage::Mounted => hook.mounted(&mut cx),
            HookStage::BeforeUpdate => hook.before_update(&mut cx),
            HookStage::Updated => hook.updated(&mut cx),
            HookStage::Destroyed => hook.destroyed(&mut cx),
            HookStage::Disconnected => hook.disconnected(&mut cx),
            HookStage::Reconnected => hook.reconnected(&mut cx),
        }
    }

}
