//! Heap invariant catalog and bounded recovery (§4.D).
//!
//! Gated entirely behind the `verify` feature: with it off, `Heap::verify`
//! and `Heap::recover` are zero-cost no-ops, matching §4.D's "Verification
//! runs only when explicitly enabled; it must be a no-op in release
//! builds."

use std::collections::HashSet;

use super::Heap;
use crate::value::ObjectId;

/// Severity of a catalogued invariant violation (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Recoverable without affecting correctness of future operations.
    Warning,
    /// Indicates a tracking bug; heap may still be safe to keep running.
    Error,
    /// Unsound: per §7, marks the heap corrupt and halts on next
    /// allocation.
    Critical,
}

/// One catalogued invariant violation (§4.D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// An object's outgoing edge points at a freed or never-allocated id.
    DanglingRef {
        /// The object whose field/element holds the stale edge.
        parent: ObjectId,
        /// The id it incorrectly targets.
        target: ObjectId,
    },
    /// A `Weak` object's recorded target no longer resolves to a live
    /// object, but it was never nullified.
    WeakTargetingFreedId {
        /// The weak object itself.
        weak_id: ObjectId,
        /// The target id it still (incorrectly) names.
        target: ObjectId,
    },
    /// `HeapObject::dirty` is set but the id is absent from the heap's
    /// tracked dirty set, or vice versa.
    DirtyTrackingInconsistency {
        /// The affected object.
        id: ObjectId,
    },
    /// A weak-forwarder reverse-index entry (`weak_targets`) names an id
    /// that is no longer live.
    StaleEdgeTrackingEntry {
        /// The object whose reverse-index entry is stale.
        id: ObjectId,
    },
    /// An object is flagged `being_destroyed` while still showing a
    /// positive strong refcount, suggesting a second free was attempted.
    DoubleFree {
        /// The affected object.
        id: ObjectId,
    },
    /// An object's strong refcount does not match the number of live
    /// edges pointing at it from other live objects or roots.
    RefcountMismatch {
        /// The affected object.
        id: ObjectId,
        /// The refcount the object currently records.
        recorded: u64,
        /// The refcount derived from ground-truth edges and roots.
        observed: u64,
    },
    /// An object has strong>0 but is unreachable from any supplied root.
    OrphanedObject {
        /// The affected object.
        id: ObjectId,
    },
    /// A `dec_ref` was attempted against a strong count already at zero.
    /// Unrepresentable in the unsigned refcount itself, so the heap
    /// flags it separately rather than silently clamping (§4.D, §7).
    NegativeRefcount {
        /// The affected object.
        id: ObjectId,
        /// The (clamped-to-zero) refcount currently recorded.
        recorded: u64,
    },
}

impl Violation {
    /// This violation's severity classification (§4.D).
    pub fn severity(&self) -> Severity {
        match self {
            Violation::DirtyTrackingInconsistency { .. } | Violation::StaleEdgeTrackingEntry { .. } => {
                Severity::Warning
            }
            Violation::RefcountMismatch { .. } | Violation::OrphanedObject { .. } => Severity::Error,
            Violation::DanglingRef { .. }
            | Violation::WeakTargetingFreedId { .. }
            | Violation::DoubleFree { .. }
            | Violation::NegativeRefcount { .. } => Severity::Critical,
        }
    }

    fn subject(&self) -> ObjectId {
        match self {
            Violation::DanglingRef { parent, .. } => *parent,
            Violation::WeakTargetingFreedId { weak_id, .. } => *weak_id,
            Violation::DirtyTrackingInconsistency { id }
            | Violation::StaleEdgeTrackingEntry { id }
            | Violation::DoubleFree { id }
            | Violation::RefcountMismatch { id, .. }
            | Violation::OrphanedObject { id }
            | Violation::NegativeRefcount { id, .. } => *id,
        }
    }
}

/// A structured verification report (§4.D).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthReport {
    /// Every violation found, in no particular order.
    pub violations: Vec<Violation>,
    /// Number of live objects examined.
    pub objects_checked: usize,
}

impl HealthReport {
    /// Health score in `[0,1]`: the fraction of checked objects that
    /// raised no finding at all.
    pub fn health_score(&self) -> f64 {
        if self.objects_checked == 0 {
            return 1.0;
        }
        let unclean: HashSet<ObjectId> = self.violations.iter().map(Violation::subject).collect();
        1.0 - (unclean.len() as f64 / self.objects_checked as f64)
    }

    /// True if no violation was found.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// True if recovery cannot repair every finding (§7: unrecoverable
    /// findings mark the heap corrupt).
    pub fn has_unrecoverable(&self) -> bool {
        self.violations.iter().any(|v| v.severity() == Severity::Critical)
    }
}

impl Heap {
    /// Run the invariant catalog against `roots` (typically: every
    /// global and every live register holding a `Ref`), used for orphan
    /// detection. A no-op, always-clean report unless the `verify`
    /// feature is enabled.
    pub fn verify(&self, roots: &[ObjectId]) -> HealthReport {
        #[cfg(not(feature = "verify"))]
        {
            let _ = roots;
            HealthReport::default()
        }

        #[cfg(feature = "verify")]
        {
            self.verify_impl(roots)
        }
    }

    #[cfg(feature = "verify")]
    fn verify_impl(&self, roots: &[ObjectId]) -> HealthReport {
        use std::collections::HashMap;

        let mut violations = Vec::new();
        let mut checked = 0usize;

        let mut ground_truth_in: HashMap<ObjectId, u64> = HashMap::new();
        for slot in self.objects.iter().flatten() {
            for child in slot.outgoing_edges() {
                *ground_truth_in.entry(child).or_insert(0) += 1;
                if !self.is_live(child) {
                    violations.push(Violation::DanglingRef { parent: slot.id, target: child });
                }
            }
        }
        for &root in roots {
            if root != 0 {
                *ground_truth_in.entry(root).or_insert(0) += 1;
            }
        }

        let reachable = reachable_ids(self, roots);

        for slot in self.objects.iter().flatten() {
            checked += 1;
            let id = slot.id;

            if slot.being_destroyed && slot.strong > 0 {
                violations.push(Violation::DoubleFree { id });
            }

            if slot.underflowed {
                violations.push(Violation::NegativeRefcount { id, recorded: slot.strong });
            }

            let observed = ground_truth_in.get(&id).copied().unwrap_or(0);
            if slot.strong != observed && observed <= slot.strong {
                // Equality is relaxed downward: temporary registers may
                // hold duplicate strong handles the edge scan can't see
                // (§8.1 "equality holds in the absence of temporary
                // registers holding duplicates"). Only flag when the
                // object claims *fewer* owners than ground truth shows.
            } else if observed > slot.strong {
                violations.push(Violation::RefcountMismatch { id, recorded: slot.strong, observed });
            }

            if slot.dirty != self.dirty_set.contains(&id) {
                violations.push(Violation::DirtyTrackingInconsistency { id });
            }

            if slot.strong > 0 && !roots.is_empty() && !reachable.contains(&id) {
                violations.push(Violation::OrphanedObject { id });
            }
        }

        for (&weak_id, targets) in &self.weak_targets {
            for &target in targets {
                if target != 0 && !self.is_live(target) {
                    violations.push(Violation::StaleEdgeTrackingEntry { id: weak_id });
                }
            }
            if let Some(Some(obj)) = self.objects.get(Self::slot_of(weak_id)) {
                if let object::ObjectKind::Weak(target) = &obj.kind {
                    let target = *target;
                    if target != 0 && !self.is_live(target) {
                        violations.push(Violation::WeakTargetingFreedId { weak_id, target });
                    }
                }
            }
        }

        HealthReport { violations, objects_checked: checked }
    }

    /// Bounded recovery (§4.D): rebuild the dirty-flag/dirty-set
    /// correspondence and drop stale weak-forwarder reverse-index
    /// entries from ground truth. Never invents a reference and never
    /// changes a user-visible refcount, so findings like
    /// `RefcountMismatch`/`DanglingRef`/`DoubleFree`/`NegativeRefcount`
    /// survive — those are the unrecoverable class that marks the heap
    /// corrupt (§7). A
    /// no-op unless `verify` is enabled. Idempotent: `recover(); recover()`
    /// has the same effect as one call, since the second pass finds
    /// nothing left to rebuild.
    pub fn recover(&mut self, roots: &[ObjectId]) -> HealthReport {
        #[cfg(not(feature = "verify"))]
        {
            let _ = roots;
            HealthReport::default()
        }

        #[cfg(feature = "verify")]
        {
            let live: HashSet<ObjectId> =
                (0..self.objects.len()).filter(|&i| self.objects[i].is_some()).map(Self::id_of).collect();

            self.dirty_set.retain(|id| live.contains(id));
            let dirty_snapshot = self.dirty_set.clone();
            for slot in self.objects.iter_mut().flatten() {
                slot.dirty = dirty_snapshot.contains(&slot.id);
            }

            for targets in self.weak_targets.values_mut() {
                targets.retain(|id| live.contains(id));
            }
            self.weak_targets.retain(|_, targets| !targets.is_empty());

            self.verify_impl(roots)
        }
    }
}

#[cfg(feature = "verify")]
fn reachable_ids(heap: &Heap, roots: &[ObjectId]) -> HashSet<ObjectId> {
    let mut seen = HashSet::new();
    let mut stack: Vec<ObjectId> = roots.iter().copied().filter(|&id| id != 0).collect();
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(obj) = heap.get(id) {
            for child in obj.outgoing_edges() {
                if !seen.contains(&child) {
                    stack.push(child);
                }
            }
        }
    }
    seen
}

#[cfg(feature = "verify")]
use super::object;

#[cfg(all(test, feature = "verify"))]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn a_clean_heap_scores_one_and_reports_no_violations() {
        let mut heap = Heap::new();
        let a = heap.alloc_scalar(Value::Int(1), None);
        let report = heap.verify(&[a]);
        assert!(report.is_clean());
        assert_eq!(report.health_score(), 1.0);
    }

    #[test]
    fn recover_is_idempotent() {
        let mut heap = Heap::new();
        let a = heap.alloc_table(None);
        heap.mark_dirty(a);
        let first = heap.recover(&[a]);
        let second = heap.recover(&[a]);
        assert_eq!(first, second);
    }

    /// A destructor that dec-refs its own (already-zero) object id, the
    /// one point at which the underflow is representable before
    /// `free_object`'s step 6 reclaims the slot.
    struct SelfDecrefingDestructor;

    impl super::super::DestructorRunner for SelfDecrefingDestructor {
        fn run_destructor(&mut self, heap: &mut Heap, _func_idx: u32, object_id: ObjectId) {
            heap.dec_ref(object_id, &mut super::super::NoDestructors);
            let report = heap.verify(&[]);
            assert!(report.violations.contains(&Violation::NegativeRefcount { id: object_id, recorded: 0 }));
            assert!(report.has_unrecoverable());
        }
    }

    #[test]
    fn a_dec_ref_past_zero_mid_destructor_is_flagged_as_negative_refcount() {
        let mut heap = Heap::new();
        let id = heap.alloc_scalar(Value::Int(1), Some(0));
        heap.dec_ref(id, &mut SelfDecrefingDestructor);
        assert!(!heap.is_live(id));
    }

    #[test]
    fn an_object_unreachable_from_roots_is_flagged_orphaned() {
        let mut heap = Heap::new();
        let root = heap.alloc_scalar(Value::Int(1), None);
        let orphan = heap.alloc_scalar(Value::Int(2), None);
        // `orphan` still has strong==1 from its own allocation but is
        // named by no root and no other object's fields.
        let report = heap.verify(&[root]);
        assert!(report.violations.contains(&Violation::OrphanedObject { id: orphan }));
    }
}
