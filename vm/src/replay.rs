//! Time-travel replay recording (§4.G).
//!
//! Entirely behind the `replay` feature: a VM built without it carries no
//! recorder field and the dispatch loop's hook compiles to nothing, so
//! the "no cost when disabled" half of §4.G's budget is structural rather
//! than a runtime check. Recording itself stays deliberately thin — a
//! periodic full snapshot plus per-operation deltas — since replaying a
//! recorded run back through a debugger UI is out of scope; only the
//! dispatch-loop hook and the seek primitive are specified.

use std::rc::Rc;

use crate::value::Value;

/// How often a full snapshot is captured, in instructions executed.
const SNAPSHOT_INTERVAL: u64 = 4096;

/// One recorded change since the preceding snapshot (§4.G: "global
/// writes, frame pushes/pops, ... PC jumps"). RNG transitions are absent
/// because this instruction set exposes no RNG opcode to snapshot or
/// replay (see `DESIGN.md`).
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /// A global was (re)bound.
    GlobalWrite {
        /// The bound name.
        name: Rc<str>,
        /// Its new value.
        value: Value,
    },
    /// A call pushed a new frame.
    FramePush {
        /// The called function's index.
        function: u32,
        /// The pushed frame's entry PC.
        pc: u32,
    },
    /// A return popped the top frame.
    FramePop,
    /// The program counter changed by something other than the normal
    /// +1 (a taken branch, loop back-edge, or skip).
    PcJump {
        /// The PC landed on.
        to: u32,
    },
}

/// A full state snapshot, captured every [`SNAPSHOT_INTERVAL`]
/// instructions (§4.G).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    /// Instruction count at capture time.
    pub instruction_index: u64,
    /// `(function, pc)` for every live frame, outermost first.
    pub call_stack: Vec<(u32, u32)>,
    /// The full global table at capture time.
    pub globals: Vec<(Rc<str>, Value)>,
}

/// Records snapshots and deltas as the dispatch loop runs, and answers
/// seek queries by locating the nearest preceding snapshot and replaying
/// deltas forward to the target instruction (§4.G).
#[derive(Debug, Default)]
pub struct ReplayRecorder {
    instruction_index: u64,
    snapshots: Vec<Snapshot>,
    deltas: Vec<(u64, Delta)>,
}

impl ReplayRecorder {
    /// A fresh, empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of instructions recorded so far.
    pub fn instruction_index(&self) -> u64 {
        self.instruction_index
    }

    /// Advance the instruction counter; called once per dispatched
    /// instruction.
    pub(crate) fn tick(&mut self) {
        self.instruction_index += 1;
    }

    /// Record a delta at the current instruction index.
    pub(crate) fn record(&mut self, delta: Delta) {
        self.deltas.push((self.instruction_index, delta));
    }

    /// Capture a full snapshot, if the instruction counter has crossed a
    /// multiple of [`SNAPSHOT_INTERVAL`] since the last one.
    pub(crate) fn maybe_snapshot(&mut self, call_stack: Vec<(u32, u32)>, globals: Vec<(Rc<str>, Value)>) {
        if self.instruction_index % SNAPSHOT_INTERVAL != 0 {
            return;
        }
        if self.snapshots.last().is_some_and(|s| s.instruction_index == self.instruction_index) {
            return;
        }
        self.snapshots.push(Snapshot { instruction_index: self.instruction_index, call_stack, globals });
    }

    /// Locate the snapshot at or immediately preceding `target`, and the
    /// deltas between it and `target`, in recorded order (§4.G: "locates
    /// the nearest preceding snapshot ... and replays deltas forward to
    /// the exact target").
    pub fn seek(&self, target: u64) -> Option<(&Snapshot, impl Iterator<Item = &Delta>)> {
        let snapshot = self.snapshots.iter().rev().find(|s| s.instruction_index <= target)?;
        let from = snapshot.instruction_index;
        let deltas = self.deltas.iter().filter(move |(idx, _)| *idx > from && *idx <= target).map(|(_, d)| d);
        Some((snapshot, deltas))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_with_no_snapshot_yet_returns_none() {
        let recorder = ReplayRecorder::new();
        assert!(recorder.seek(10).is_none());
    }

    #[test]
    fn seek_returns_deltas_strictly_between_snapshot_and_target() {
        let mut recorder = ReplayRecorder::new();
        for i in 0..SNAPSHOT_INTERVAL {
            recorder.tick();
            if i == 10 {
                recorder.record(Delta::FramePush { function: 0, pc: 5 });
            }
            if i == 20 {
                recorder.record(Delta::FramePop);
            }
        }
        recorder.maybe_snapshot(vec![(0, 0)], vec![]);
        recorder.tick();
        recorder.record(Delta::PcJump { to: 99 });

        let (snapshot, deltas) = recorder.seek(SNAPSHOT_INTERVAL + 1).unwrap();
        assert_eq!(snapshot.instruction_index, SNAPSHOT_INTERVAL);
        assert_eq!(deltas.collect::<Vec<_>>(), vec![&Delta::PcJump { to: 99 }]);
    }
}
