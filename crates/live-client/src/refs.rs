//! Optimistic lock/loading ref ledger.
//!
//! Every user-initiated action that produces an optimistic UI change is
//! tagged with a strictly increasing per-session ref at dispatch time and
//! attached to the dispatching element (and any elements it locks). A
//! server reply correlated with ref *r* clears decorations whose refs are
//! ≤ *r* — but acknowledgements can race: if a later ref resolves while an
//! earlier one on the same element is still outstanding, the later undo is
//! deferred into a pending queue rather than dropped, so undo
//! notifications fire exactly once per ref, in non-decreasing ref order,
//! once the blocking predecessor clears.
//!
//! The ledger is pure bookkeeping keyed by stable element identity; the
//! caller owns the corresponding attribute decorations on the document.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use livesync_dom::ElemId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    Loading,
    Lock,
}

/// One undo notification that is now allowed to fire.
#[derive(Debug, Clone, PartialEq)]
pub struct RefUndo {
    pub elem: ElemId,
    pub ref_: u64,
    pub kind: RefKind,
    /// For lock undos: the buffered server truth to replay, if the patch
    /// engine redirected a merge while the lock was in force.
    pub lock_clone: Option<String>,
}

#[derive(Debug, Default, Clone)]
struct ElementRef {
    loading_ref: Option<u64>,
    lock_ref: Option<u64>,
    /// Dispatched refs in dispatch order (strictly increasing).
    outstanding: Vec<(u64, RefKind)>,
    /// Refs acknowledged by the server, possibly ahead of their turn.
    acked: BTreeSet<u64>,
    lock_clone: Option<String>,
}

impl ElementRef {
    fn is_empty(&self) -> bool {
        self.loading_ref.is_none()
            && self.lock_ref.is_none()
            && self.outstanding.is_empty()
            && self.lock_clone.is_none()
    }
}

#[derive(Debug, Default, Clone)]
pub struct RefLedger {
    counter: u64,
    entries: IndexMap<ElemId, ElementRef>,
}

impl RefLedger {
    pub fn new() -> Self {
        RefLedger::default()
    }

    /// Allocate the next session-scoped ref.
    pub fn next_ref(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Record a dispatched operation ref on an element.
    pub fn dispatch(&mut self, elem: ElemId, ref_: u64, kind: RefKind) {
        let entry = self.entries.entry(elem).or_default();
        let slot = match kind {
            RefKind::Loading => &mut entry.loading_ref,
            RefKind::Lock => &mut entry.lock_ref,
        };
        *slot = Some(slot.map_or(ref_, |cur| cur.max(ref_)));
        entry.outstanding.push((ref_, kind));
    }

    pub fn loading_ref(&self, elem: ElemId) -> Option<u64> {
        self.entries.get(&elem).and_then(|e| e.loading_ref)
    }

    pub fn lock_ref(&self, elem: ElemId) -> Option<u64> {
        self.entries.get(&elem).and_then(|e| e.lock_ref)
    }

    /// Whether the element's lock blocks a patch correlated with
    /// `patch_ref` (an uncorrelated patch is blocked by any lock).
    pub fn is_locked_beyond(&self, elem: ElemId, patch_ref: Option<u64>) -> bool {
        match self.lock_ref(elem) {
            Some(lock) => patch_ref.map_or(true, |r| lock > r),
            None => false,
        }
    }

    /// Whether server-driven content correlated with `ref_` may be applied:
    /// both refs must be absent or ≤ the arriving update's ref.
    pub fn can_apply(&self, elem: ElemId, ref_: u64) -> bool {
        let entry = match self.entries.get(&elem) {
            Some(e) => e,
            None => return true,
        };
        entry.loading_ref.map_or(true, |r| r <= ref_)
            && entry.lock_ref.map_or(true, |r| r <= ref_)
    }

    /// Buffer the server truth for a locked element so it can be replayed
    /// once the lock clears. A newer buffer replaces an older one.
    pub fn buffer_lock_clone(&mut self, elem: ElemId, html: String) {
        self.entries.entry(elem).or_default().lock_clone = Some(html);
    }

    pub fn has_lock_clone(&self, elem: ElemId) -> bool {
        self.entries
            .get(&elem)
            .map(|e| e.lock_clone.is_some())
            .unwrap_or(false)
    }

    /// Acknowledge ref `ref_` and return every undo notification that may
    /// fire now, honoring the per-element pending queue.
    pub fn ack(&mut self, ref_: u64) -> Vec<RefUndo> {
        let mut undos = Vec::new();
        for (&elem, entry) in self.entries.iter_mut() {
            if entry.outstanding.iter().any(|&(r, _)| r == ref_) {
                entry.acked.insert(ref_);
            }
            // Drain the acked prefix in dispatch order. An acked ref that
            // sits behind an unacked one stays queued.
            while let Some(&(front, kind)) = entry.outstanding.first() {
                if !entry.acked.contains(&front) {
                    break;
                }
                entry.outstanding.remove(0);
                entry.acked.remove(&front);
                let slot = match kind {
                    RefKind::Loading => &mut entry.loading_ref,
                    RefKind::Lock => &mut entry.lock_ref,
                };
                if slot.map_or(false, |cur| cur <= front) {
                    *slot = None;
                }
                let lock_clone = match kind {
                    RefKind::Lock => entry.lock_clone.take(),
                    RefKind::Loading => None,
                };
                undos.push(RefUndo { elem, ref_: front, kind, lock_clone });
            }
        }
        self.entries.retain(|_, entry| !entry.is_empty());
        undos
    }

    /// Drop every record for an element (its subtree was destroyed).
    pub fn forget(&mut self, elem: ElemId) {
        self.entries.shift_remove(&elem);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn el(n: u64) -> ElemId {
        ElemId(n)
    }

    #[test]
    fn refs_are_strictly_increasing() {
        let mut ledger = RefLedger::new();
        let a = ledger.next_ref();
        let b = ledger.next_ref();
        assert!(b > a);
    }

    #[test]
    fn in_order_ack_fires_immediately() {
        let mut ledger = RefLedger::new();
        let r = ledger.next_ref();
        ledger.dispatch(el(1), r, RefKind::Loading);
        assert_eq!(ledger.loading_ref(el(1)), Some(r));
        let undos = ledger.ack(r);
        assert_eq!(undos.len(), 1);
        assert_eq!(undos[0].ref_, r);
        assert_eq!(ledger.loading_ref(el(1)), None);
    }

    #[test]
    fn out_of_order_ack_defers_until_blocker_clears() {
        let mut ledger = RefLedger::new();
        let r1 = ledger.next_ref();
        let r2 = ledger.next_ref();
        ledger.dispatch(el(1), r1, RefKind::Loading);
        ledger.dispatch(el(1), r2, RefKind::Loading);
        // Later ref resolves first: nothing may fire yet.
        assert!(ledger.ack(r2).is_empty());
        // Blocker clears: both fire, in ref order, exactly once.
        let undos = ledger.ack(r1);
        assert_eq!(
            undos.iter().map(|u| u.ref_).collect::<Vec<_>>(),
            vec![r1, r2]
        );
        assert!(ledger.ack(r1).is_empty());
        assert!(ledger.ack(r2).is_empty());
        assert_eq!(ledger.loading_ref(el(1)), None);
    }

    #[test]
    fn lock_undo_carries_buffered_clone() {
        let mut ledger = RefLedger::new();
        let r = ledger.next_ref();
        ledger.dispatch(el(2), r, RefKind::Lock);
        assert!(ledger.is_locked_beyond(el(2), None));
        ledger.buffer_lock_clone(el(2), "<span>truth</span>".into());
        let undos = ledger.ack(r);
        assert_eq!(undos.len(), 1);
        assert_eq!(undos[0].lock_clone.as_deref(), Some("<span>truth</span>"));
        assert!(!ledger.is_locked_beyond(el(2), None));
    }

    #[test]
    fn lock_blocks_older_patches_only() {
        let mut ledger = RefLedger::new();
        let r = ledger.next_ref();
        ledger.dispatch(el(3), r, RefKind::Lock);
        assert!(ledger.is_locked_beyond(el(3), Some(r - 1)));
        assert!(!ledger.is_locked_beyond(el(3), Some(r)));
        assert!(ledger.is_locked_beyond(el(3), None));
        assert!(!ledger.can_apply(el(3), r - 1));
        assert!(ledger.can_apply(el(3), r));
    }

    #[test]
    fn independent_elements_do_not_block_each_other() {
        let mut ledger = RefLedger::new();
        let r1 = ledger.next_ref();
        let r2 = ledger.next_ref();
        ledger.dispatch(el(1), r1, RefKind::Loading);
        ledger.dispatch(el(2), r2, RefKind::Loading);
        let undos = ledger.ack(r2);
        assert_eq!(undos.len(), 1);
        assert_eq!(undos[0].elem, el(2));
    }
}
