//! The heap object representation (§3.2).

use crate::value::{ObjectId, Table, Value};

/// The payload shape of a heap object (§3.2: "a kind: Scalar, Table,
/// Array, or Weak").
///
/// Nested aggregates are represented by nesting a `Value::Ref` rather
/// than embedding another `Table`/`Array` object inline: once an inline
/// array or table is promoted through `NewRef`, anything it holds that
/// should itself participate in refcounting/cycle detection is promoted
/// too, and stored here as a `Ref`. This keeps `track_edge`'s
/// single-slot `(parent, old_child, new_child)` contract exact and gives
/// the cycle detector a flat adjacency to walk.
#[derive(Debug, Clone)]
pub(crate) enum ObjectKind {
    /// A single boxed value (§4.B `alloc_scalar`).
    Scalar(Value),
    /// A field map (§4.B `alloc_table`).
    Table(Table),
    /// An ordered sequence (§4.B `alloc_array`).
    Array(Vec<Value>),
    /// An opaque forwarder to another object's id, or 0 if its target
    /// has been freed (§3.2).
    Weak(ObjectId),
}

/// A heap-resident object (§3.2).
#[derive(Debug, Clone)]
pub(crate) struct HeapObject {
    pub id: ObjectId,
    pub strong: u64,
    pub weak: u64,
    pub kind: ObjectKind,
    pub destructor: Option<u32>,
    pub being_destroyed: bool,
    pub dirty: bool,
    /// Set if a `dec_ref` was ever attempted against a strong count of
    /// zero (§4.D "negative refcount"). `strong` itself stays clamped at
    /// zero since it is unsigned; this flag is what lets the verifier
    /// see the underflow that would otherwise be silently absorbed.
    pub underflowed: bool,
}

impl HeapObject {
    /// Collect the ids this object holds a strong (`Ref`) edge to,
    /// recursing into `Some`/`Ok`/`Err` wrappers since those are
    /// routinely used to carry a `Ref` out of a match arm. `Weak` values
    /// are not edges: they never keep a target alive (§4.C: "applied to
    /// the subgraph reachable from the dirty set... via Ref edges").
    pub fn outgoing_edges(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        match &self.kind {
            ObjectKind::Scalar(v) => collect_refs(v, &mut out),
            ObjectKind::Table(t) => {
                for (_, v) in t.iter() {
                    collect_refs(v, &mut out);
                }
            }
            ObjectKind::Array(items) => {
                for v in items {
                    collect_refs(v, &mut out);
                }
            }
            ObjectKind::Weak(_) => {}
        }
        out
    }

    /// True if this object cannot possibly participate in a cycle and
    /// can be skipped as a scan root (§4.C "trivial-object pruning"):
    /// exactly one strong owner and no outgoing edges.
    pub fn is_trivial(&self) -> bool {
        self.strong == 1 && self.outgoing_edges().is_empty()
    }
}

fn collect_refs(value: &Value, out: &mut Vec<ObjectId>) {
    match value {
        Value::Ref(id) => out.push(*id),
        Value::Some(v) | Value::Ok(v) | Value::Err(v) => collect_refs(v, out),
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, out)),
        Value::Table(t) => t.iter().for_each(|(_, v)| collect_refs(v, out)),
        _ => {}
    }
}
