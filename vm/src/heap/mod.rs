//! The reference-counted heap, its incremental cycle detector, and its
//! invariant verifier (§3.2, §4.B, §4.C, §4.D).
//!
//! Grounded on Motoko's incremental GC `object_table.rs` for the
//! id-keyed arena-with-free-list shape, on `bacon-rajan-cc` for the
//! dirty/root-buffer framing of incremental cycle collection, and on
//! `gcmodule`'s `gc_ref_count`/`gc_traverse` split between "how many
//! owners" and "what do I point to" (here: `strong`/`weak` fields versus
//! [`object::HeapObject::outgoing_edges`]).

mod cycles;
mod object;
mod verifier;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tracing::warn;

use crate::consts::{
    CYCLE_THRESHOLD_CAP, CYCLE_THRESHOLD_FLOOR, CYCLE_THRESHOLD_GROW_FACTOR,
    CYCLE_THRESHOLD_INITIAL, CYCLE_THRESHOLD_SHRINK_FACTOR, DIRTY_SET_GC_FRAME_THRESHOLD,
    MIN_BUDGET_RESERVE_US,
};
use crate::value::{ObjectId, Table, Value};
use object::{HeapObject, ObjectKind};

pub use verifier::{HealthReport, Severity, Violation};

/// Runs a destructor to completion, synchronously, at the point of the
/// triggering free (§4.B free-protocol step 3; §4.F destructor
/// invocation). Implemented by [`crate::interpreter::Vm`].
///
/// Kept as a trait rather than a direct dependency on `Vm` so the heap
/// has no upward dependency on the dispatch loop; `Vm` hands itself (or
/// a view over its non-heap state) to `Heap::dec_ref`/`Heap::track_edge`
/// for exactly this callback.
pub(crate) trait DestructorRunner {
    /// Run `func_idx` with `Ref(object_id)` as its sole argument,
    /// against the given heap, to completion. Errors raised inside the
    /// destructor are caught and logged by the implementation, never
    /// propagated here (§4.B, §7: "Destructor errors — logged, not
    /// propagated; free proceeds").
    fn run_destructor(&mut self, heap: &mut Heap, func_idx: u32, object_id: ObjectId);
}

/// A `DestructorRunner` that panics if a destructor is ever actually
/// due; for use in tests and contexts that construct heaps with no
/// destructors registered.
pub(crate) struct NoDestructors;

impl DestructorRunner for NoDestructors {
    fn run_destructor(&mut self, _heap: &mut Heap, func_idx: u32, object_id: ObjectId) {
        panic!("unexpected destructor dispatch (func {func_idx}, object {object_id})");
    }
}

/// Snapshot returned by `get_gc_stats` (§4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcStats {
    /// Microseconds of cycle-scan work charged to the current frame.
    pub gc_time_us: u64,
    /// The budget passed to the most recent `begin_frame`.
    pub budget_us: u64,
    /// Size of the dirty set at the time of the call.
    pub dirty_count: usize,
}

struct FrameBudget {
    start: Instant,
    budget_us: u64,
    spent_us: u64,
}

/// The reference-counted heap (§3.2, §4.B).
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_slots: Vec<usize>,
    /// target id -> ids of live `Weak` objects forwarding to it, kept in
    /// sync so free's nullification step (§4.B step 4) never needs a
    /// full scan.
    weak_targets: HashMap<ObjectId, Vec<ObjectId>>,
    dirty_set: HashSet<ObjectId>,
    weak_promotion_roots: HashSet<ObjectId>,
    op_counter: u64,
    cycle_threshold: u64,
    frame: Option<FrameBudget>,
    last_gc_time_us: u64,
}

impl Default for Heap {
    fn default() -> Self {
        Self {
            objects: Vec::new(),
            free_slots: Vec::new(),
            weak_targets: HashMap::new(),
            dirty_set: HashSet::new(),
            weak_promotion_roots: HashSet::new(),
            op_counter: 0,
            cycle_threshold: CYCLE_THRESHOLD_INITIAL,
            frame: None,
            last_gc_time_us: 0,
        }
    }
}

impl Heap {
    /// An empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    fn id_of(slot: usize) -> ObjectId {
        slot as ObjectId + 1
    }

    fn slot_of(id: ObjectId) -> usize {
        (id - 1) as usize
    }

    fn insert(&mut self, obj_without_id: impl FnOnce(ObjectId) -> HeapObject) -> ObjectId {
        let slot = self.free_slots.pop().unwrap_or(self.objects.len());
        let id = Self::id_of(slot);
        let obj = obj_without_id(id);
        if slot == self.objects.len() {
            self.objects.push(Some(obj));
        } else {
            self.objects[slot] = Some(obj);
        }
        self.op_counter += 1;
        id
    }

    fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        if id == 0 {
            return None;
        }
        self.objects.get(Self::slot_of(id))?.as_ref()
    }

    fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        if id == 0 {
            return None;
        }
        self.objects.get_mut(Self::slot_of(id))?.as_mut()
    }

    /// True if `id` names a live object (0 is never live).
    pub fn is_live(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// The current strong refcount of `id`, or 0 if not live.
    pub fn strong_count(&self, id: ObjectId) -> u64 {
        self.get(id).map(|o| o.strong).unwrap_or(0)
    }

    /// The current weak refcount of `id`, or 0 if not live.
    pub fn weak_count(&self, id: ObjectId) -> u64 {
        self.get(id).map(|o| o.weak).unwrap_or(0)
    }

    /// Number of live objects.
    pub fn object_count(&self) -> usize {
        self.objects.len() - self.free_slots.len()
    }

    /// Size of the current dirty set.
    pub fn dirty_count(&self) -> usize {
        self.dirty_set.len()
    }

    // --- allocation (§4.B) ---

    /// Create a Scalar object with strongRefs=1.
    pub fn alloc_scalar(&mut self, value: Value, destructor: Option<u32>) -> ObjectId {
        self.insert(|id| HeapObject {
            id,
            strong: 1,
            weak: 0,
            kind: ObjectKind::Scalar(value),
            destructor,
            being_destroyed: false,
            dirty: false,
            underflowed: false,
        })
    }

    /// Create an empty Table object with strongRefs=1.
    pub fn alloc_table(&mut self, destructor: Option<u32>) -> ObjectId {
        self.insert(|id| HeapObject {
            id,
            strong: 1,
            weak: 0,
            kind: ObjectKind::Table(Table::new()),
            destructor,
            being_destroyed: false,
            dirty: false,
            underflowed: false,
        })
    }

    /// Create an empty Array object with strongRefs=1.
    pub fn alloc_array(&mut self) -> ObjectId {
        self.insert(|id| HeapObject {
            id,
            strong: 1,
            weak: 0,
            kind: ObjectKind::Array(Vec::new()),
            destructor: None,
            being_destroyed: false,
            dirty: false,
            underflowed: false,
        })
    }

    /// Create a Weak forwarder to `target`, strongRefs=1, incrementing
    /// `target`'s weakRefs.
    pub fn alloc_weak(&mut self, target: ObjectId) -> ObjectId {
        let id = self.insert(|id| HeapObject {
            id,
            strong: 1,
            weak: 0,
            kind: ObjectKind::Weak(target),
            destructor: None,
            being_destroyed: false,
            dirty: false,
            underflowed: false,
        });
        if target != 0 {
            if let Some(obj) = self.get_mut(target) {
                obj.weak += 1;
            }
            self.weak_targets.entry(target).or_default().push(id);
        }
        id
    }

    // --- refcounting (§4.B) ---

    /// Increment `id`'s strong refcount; no-op on id 0 or a dead id.
    pub fn inc_ref(&mut self, id: ObjectId) {
        if let Some(obj) = self.get_mut(id) {
            obj.strong += 1;
        }
    }

    /// Decrement `id`'s strong refcount; frees the object when it
    /// reaches zero (§4.B free protocol). No-op on id 0 (§8.3). A
    /// decrement against an already-zero count cannot be represented in
    /// the unsigned `strong` field, so it is recorded via `underflowed`
    /// instead of wrapping or panicking; `Heap::verify` surfaces it as
    /// `Violation::NegativeRefcount` (§4.D).
    pub(crate) fn dec_ref(&mut self, id: ObjectId, runner: &mut impl DestructorRunner) {
        if id == 0 {
            return;
        }
        let reached_zero = match self.get_mut(id) {
            Some(obj) => {
                if obj.strong == 0 {
                    obj.underflowed = true;
                    return;
                }
                obj.strong -= 1;
                obj.strong == 0
            }
            None => return,
        };
        if reached_zero {
            self.free_object(id, runner);
        }
    }

    /// Attempt to promote a Weak handle to a strong handle (§4.B). The
    /// caller owns the returned strong reference's refcounting — it has
    /// already been incremented here.
    pub fn weak_to_strong(&mut self, weak_id: ObjectId) -> Option<ObjectId> {
        let target = match &self.get(weak_id)?.kind {
            ObjectKind::Weak(target) => *target,
            _ => return None,
        };
        if target == 0 || !self.is_live(target) {
            return None;
        }
        self.inc_ref(target);
        self.weak_promotion_roots.insert(target);
        Some(target)
    }

    /// Record that `id`'s outgoing edges changed since the last cycle
    /// scan.
    pub fn mark_dirty(&mut self, id: ObjectId) {
        if id == 0 {
            return;
        }
        self.dirty_set.insert(id);
        if let Some(obj) = self.get_mut(id) {
            obj.dirty = true;
        }
    }

    /// Called on every reference-typed field/element write (§4.B):
    /// dec-refs `old_child` if non-zero, inc-refs `new_child` if
    /// non-zero, marks `parent` dirty.
    pub(crate) fn track_edge(
        &mut self,
        parent: ObjectId,
        old_child: ObjectId,
        new_child: ObjectId,
        runner: &mut impl DestructorRunner,
    ) {
        if old_child != 0 {
            self.dec_ref(old_child, runner);
        }
        if new_child != 0 {
            self.inc_ref(new_child);
        }
        self.mark_dirty(parent);
    }

    /// The free protocol of §4.B, shared by natural (`dec_ref` reaching
    /// zero) and forced (cycle collector) frees.
    fn free_object(&mut self, id: ObjectId, runner: &mut impl DestructorRunner) {
        // step 1: re-entry guard
        let already = match self.objects.get(Self::slot_of(id)) {
            Some(Some(obj)) => obj.being_destroyed,
            _ => return,
        };
        if already {
            return;
        }

        // step 2
        if let Some(obj) = self.get_mut(id) {
            obj.being_destroyed = true;
        }

        // step 3: destructor, synchronous, before anything else observes
        // the object as gone.
        let destructor = self.get(id).and_then(|o| o.destructor);
        if let Some(func_idx) = destructor {
            runner.run_destructor(self, func_idx, id);
        }

        // step 4: nullify weak forwarders targeting this id
        if let Some(forwarders) = self.weak_targets.remove(&id) {
            for weak_id in forwarders {
                if let Some(obj) = self.get_mut(weak_id) {
                    if let ObjectKind::Weak(target) = &mut obj.kind {
                        *target = 0;
                    }
                }
            }
        }

        // step 5: cascade to children (post-destructor field contents,
        // per §8.3: re-assignment inside the destructor is observed)
        let children = self.get(id).map(|o| o.outgoing_edges()).unwrap_or_default();
        for child in children {
            self.dec_ref(child, runner);
        }

        // step 6: release the slot
        let slot = Self::slot_of(id);
        self.objects[slot] = None;
        self.free_slots.push(slot);
        self.dirty_set.remove(&id);
        self.weak_promotion_roots.remove(&id);
    }

    // --- field/element access used by the interpreter ---

    pub(crate) fn scalar(&self, id: ObjectId) -> Option<&Value> {
        match &self.get(id)?.kind {
            ObjectKind::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn scalar_mut(&mut self, id: ObjectId) -> Option<&mut Value> {
        match &mut self.get_mut(id)?.kind {
            ObjectKind::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn table(&self, id: ObjectId) -> Option<&Table> {
        match &self.get(id)?.kind {
            ObjectKind::Table(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn table_mut(&mut self, id: ObjectId) -> Option<&mut Table> {
        match &mut self.get_mut(id)?.kind {
            ObjectKind::Table(t) => Some(t),
            _ => None,
        }
    }

    pub(crate) fn array(&self, id: ObjectId) -> Option<&Vec<Value>> {
        match &self.get(id)?.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub(crate) fn array_mut(&mut self, id: ObjectId) -> Option<&mut Vec<Value>> {
        match &mut self.get_mut(id)?.kind {
            ObjectKind::Array(a) => Some(a),
            _ => None,
        }
    }

    pub(crate) fn weak_target(&self, id: ObjectId) -> Option<ObjectId> {
        match &self.get(id)?.kind {
            ObjectKind::Weak(target) => Some(*target),
            _ => None,
        }
    }

    // --- cycle detection (§4.C) ---

    /// Run the cycle scan unconditionally if the adaptive threshold of
    /// operations since the last scan has been reached, with no budget
    /// gating. §4.C names this alongside the budgeted variant below as a
    /// separate entry point for hosts that never call `begin_frame`.
    pub(crate) fn maybe_detect_cycles(&mut self, runner: &mut impl DestructorRunner) {
        if self.op_counter < self.cycle_threshold {
            return;
        }
        let started = Instant::now();
        cycles::run_scan(self, runner);
        self.op_counter = 0;
        self.last_gc_time_us = started.elapsed().as_micros() as u64;
    }

    /// Run the cycle scan if the adaptive threshold of operations since
    /// the last scan has been reached, additionally gated by the frame
    /// budget set with `begin_frame` if one is active (§4.C). With no
    /// active frame budget this is equivalent to `maybe_detect_cycles`.
    pub(crate) fn maybe_detect_cycles_within_budget(&mut self, runner: &mut impl DestructorRunner) {
        if self.op_counter < self.cycle_threshold {
            return;
        }
        if let Some(frame) = &self.frame {
            let elapsed = frame.start.elapsed().as_micros() as u64;
            let remaining = frame.budget_us.saturating_sub(elapsed);
            if remaining < MIN_BUDGET_RESERVE_US {
                return;
            }
        }
        let started = Instant::now();
        cycles::run_scan(self, runner);
        self.op_counter = 0;
        let spent = started.elapsed().as_micros() as u64;
        self.last_gc_time_us = spent;
        if let Some(frame) = &mut self.frame {
            frame.spent_us = frame.spent_us.saturating_add(spent);
        }
    }

    fn adjust_threshold(&mut self, freed_cycles: usize) {
        let current = self.cycle_threshold as f64;
        self.cycle_threshold = if freed_cycles > 0 {
            ((current * CYCLE_THRESHOLD_SHRINK_FACTOR) as u64).max(CYCLE_THRESHOLD_FLOOR)
        } else {
            ((current * CYCLE_THRESHOLD_GROW_FACTOR) as u64).min(CYCLE_THRESHOLD_CAP)
        };
    }

    /// Force-free every member of a confirmed isolated cycle, ascending
    /// by id (the deterministic order this workspace chose for the
    /// spec's open SCC-free-order question; see `DESIGN.md`).
    fn force_free(&mut self, id: ObjectId, runner: &mut impl DestructorRunner) {
        if self.is_live(id) {
            self.free_object(id, runner);
        }
    }

    // --- host boundary (§4.C, §4.H) ---

    /// Record the frame's start time and budget (§4.C).
    pub fn begin_frame(&mut self, budget_us: u64) {
        self.frame = Some(FrameBudget { start: Instant::now(), budget_us, spent_us: 0 });
    }

    /// True once the dirty set exceeds the collection-worthy threshold
    /// (§4.C: "≈1,000").
    pub fn needs_gc_frame(&self) -> bool {
        self.dirty_set.len() > DIRTY_SET_GC_FRAME_THRESHOLD
    }

    /// Microseconds consumed this frame, budget, and dirty count (§4.H).
    pub fn get_gc_stats(&self) -> GcStats {
        match &self.frame {
            Some(frame) => GcStats {
                gc_time_us: frame.spent_us,
                budget_us: frame.budget_us,
                dirty_count: self.dirty_set.len(),
            },
            None => GcStats {
                gc_time_us: self.last_gc_time_us,
                budget_us: 0,
                dirty_count: self.dirty_set.len(),
            },
        }
    }

    /// Release every live object, running destructors in
    /// reverse-allocation order (§6 `vm_free`). Destructor-triggered
    /// frees of already-released objects are guarded by `free_object`'s
    /// re-entry check, so an object reachable from a later one is not
    /// double-freed.
    pub(crate) fn free_all(&mut self, runner: &mut impl DestructorRunner) {
        let mut ids: Vec<ObjectId> =
            self.objects.iter().enumerate().filter_map(|(i, s)| s.as_ref().map(|_| Self::id_of(i))).collect();
        ids.sort_unstable_by(|a, b| b.cmp(a));
        for id in ids {
            if self.is_live(id) {
                warn_on_residual_refs(self, id);
                self.free_object(id, runner);
            }
        }
    }
}

fn warn_on_residual_refs(heap: &Heap, id: ObjectId) {
    if let Some(obj) = heap.get(id) {
        if obj.strong > 1 {
            warn!(object = id, strong = obj.strong, "vm_free releasing object with residual strong refs");
        }
    }
}

#[cfg(test)]
mod tests {
    use quickcheck_macros::quickcheck;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(|h: &mut Heap| h.alloc_scalar(Value::Int(1), None))]
    #[case(|h: &mut Heap| h.alloc_table(None))]
    #[case(|h: &mut Heap| h.alloc_array())]
    fn every_aggregate_kind_allocates_with_strong_one_and_no_weak_refs(
        #[case] alloc: fn(&mut Heap) -> ObjectId,
    ) {
        let mut heap = Heap::new();
        let id = alloc(&mut heap);
        assert_eq!(heap.strong_count(id), 1);
        assert_eq!(heap.weak_count(id), 0);
        assert!(heap.is_live(id));
    }

    /// §8.2: `NewRef;IncRef;DecRef;DecRef` is a net no-op — the object is
    /// allocated and then fully released, leaving the heap as if it had
    /// never been created.
    #[quickcheck]
    fn new_ref_inc_ref_dec_ref_dec_ref_is_a_net_no_op(value: i64) -> bool {
        let mut heap = Heap::new();
        let before = heap.object_count();
        let id = heap.alloc_scalar(Value::Int(value), None);
        heap.inc_ref(id);
        heap.dec_ref(id, &mut NoDestructors);
        heap.dec_ref(id, &mut NoDestructors);
        !heap.is_live(id) && heap.object_count() == before
    }

    /// §8.2: `NewWeak;WeakToStrong;DecRef` is a net no-op on the target's
    /// strong refcount — promoting a weak handle and immediately
    /// releasing it again leaves the target exactly as it started.
    #[quickcheck]
    fn new_weak_weak_to_strong_dec_ref_is_a_net_no_op(value: i64) -> bool {
        let mut heap = Heap::new();
        let target = heap.alloc_scalar(Value::Int(value), None);
        let before = heap.strong_count(target);
        let weak = heap.alloc_weak(target);
        let promoted = heap.weak_to_strong(weak).expect("target is live");
        heap.dec_ref(promoted, &mut NoDestructors);
        heap.strong_count(target) == before
    }

    /// §8.2: writing the same `Ref` into a field it already holds nets no
    /// refcount change, since `track_edge`'s dec-old/inc-new cancel out.
    #[quickcheck]
    fn set_field_same_value_twice_leaves_refcount_unchanged(value: i64) -> bool {
        let mut heap = Heap::new();
        let child = heap.alloc_scalar(Value::Int(value), None);
        let parent = heap.alloc_table(None);
        heap.track_edge(parent, 0, child, &mut NoDestructors);
        let after_first_write = heap.strong_count(child);
        heap.track_edge(parent, child, child, &mut NoDestructors);
        heap.strong_count(child) == after_first_write
    }

    #[test]
    fn dec_ref_to_zero_frees_and_is_idempotent_on_id_zero() {
        let mut heap = Heap::new();
        let id = heap.alloc_scalar(Value::Int(10), None);
        assert!(heap.is_live(id));
        heap.dec_ref(id, &mut NoDestructors);
        assert!(!heap.is_live(id));
        heap.dec_ref(0, &mut NoDestructors); // no panic
    }

    #[test]
    fn new_ref_inc_dec_dec_restores_prior_state() {
        let mut heap = Heap::new();
        let id = heap.alloc_scalar(Value::Int(1), None);
        heap.inc_ref(id);
        assert_eq!(heap.strong_count(id), 2);
        heap.dec_ref(id, &mut NoDestructors);
        assert_eq!(heap.strong_count(id), 1);
        heap.dec_ref(id, &mut NoDestructors);
        assert!(!heap.is_live(id));
    }

    #[test]
    fn weak_survives_strong_death_and_promotion_fails() {
        let mut heap = Heap::new();
        let target = heap.alloc_scalar(Value::Int(42), None);
        let weak = heap.alloc_weak(target);
        heap.dec_ref(target, &mut NoDestructors);
        assert!(!heap.is_live(target));
        assert_eq!(heap.weak_to_strong(weak), None);
    }

    #[test]
    fn weak_to_strong_then_dec_ref_leaves_refcount_unchanged_net() {
        let mut heap = Heap::new();
        let target = heap.alloc_scalar(Value::Int(7), None);
        let weak = heap.alloc_weak(target);
        let promoted = heap.weak_to_strong(weak).unwrap();
        assert_eq!(promoted, target);
        assert_eq!(heap.strong_count(target), 2);
        heap.dec_ref(target, &mut NoDestructors);
        assert_eq!(heap.strong_count(target), 1);
    }

    #[test]
    fn track_edge_dec_refs_old_inc_refs_new_and_marks_parent_dirty() {
        let mut heap = Heap::new();
        let parent = heap.alloc_table(None);
        let old_child = heap.alloc_scalar(Value::Int(1), None);
        let new_child = heap.alloc_scalar(Value::Int(2), None);
        heap.track_edge(parent, 0, old_child, &mut NoDestructors);
        assert_eq!(heap.strong_count(old_child), 2);
        heap.track_edge(parent, old_child, new_child, &mut NoDestructors);
        assert_eq!(heap.strong_count(old_child), 1);
        assert_eq!(heap.strong_count(new_child), 2);
        assert!(heap.dirty_set.contains(&parent));
    }

    #[test]
    fn isolated_cycle_of_two_tables_is_collected() {
        let mut heap = Heap::new();
        let x = heap.alloc_table(None);
        let y = heap.alloc_table(None);
        heap.table_mut(x).unwrap().set("next".into(), Value::Ref(y));
        heap.inc_ref(y);
        heap.mark_dirty(x);
        heap.table_mut(y).unwrap().set("next".into(), Value::Ref(x));
        heap.inc_ref(x);
        heap.mark_dirty(y);
        // drop the root handles
        heap.dec_ref(x, &mut NoDestructors);
        heap.dec_ref(y, &mut NoDestructors);
        assert!(heap.is_live(x) && heap.is_live(y), "cycle keeps both alive until scanned");
        cycles::run_scan(&mut heap, &mut NoDestructors);
        assert!(!heap.is_live(x) && !heap.is_live(y));
    }

    #[test]
    fn maybe_detect_cycles_runs_once_the_threshold_is_crossed_with_no_budget_active() {
        let mut heap = Heap::new();
        let x = heap.alloc_table(None);
        let y = heap.alloc_table(None);
        heap.table_mut(x).unwrap().set("next".into(), Value::Ref(y));
        heap.inc_ref(y);
        heap.mark_dirty(x);
        heap.table_mut(y).unwrap().set("next".into(), Value::Ref(x));
        heap.inc_ref(x);
        heap.mark_dirty(y);
        heap.dec_ref(x, &mut NoDestructors);
        heap.dec_ref(y, &mut NoDestructors);
        assert!(heap.is_live(x) && heap.is_live(y));

        heap.op_counter = heap.cycle_threshold;
        heap.maybe_detect_cycles(&mut NoDestructors);
        assert!(!heap.is_live(x) && !heap.is_live(y));
        assert_eq!(heap.op_counter, 0);
    }
}
