//! Analysis configurations.
//!
//! A [`Cfg`] bundles everything the engine tracks about one abstract state:
//! the program counters of the modeled threads, the observer multi-states,
//! the owned [`Shape`], and a family of auxiliary registers — per cell term
//! (ownership, pointer/next validity, per-cell SMR guard states) and per
//! thread (pending event value, prophecy, abstract data sets, epochs).
//!
//! Configurations are created by the fixpoint driver, transformed by the
//! post calculus, and stored (and merged) by the encoding, which then owns
//! them.

use crate::observer::{DataValue, MultiState, StateId};
use crate::prog::StmtId;
use crate::shape::Shape;

/// Two resident threads plus the transient interferer slot.
pub const MAX_THREADS: usize = 3;

/// Abstract content of one of the three logical data sets.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataSet {
    /// The witness value may be in the set.
    WithData,
    /// The witness value is definitely not in the set.
    #[default]
    WithoutData,
}

/// The three-valued epoch clock of epoch-based reclamation.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Epoch {
    #[default]
    Zero,
    One,
    Two,
}

impl Epoch {
    pub fn advanced(self) -> Epoch {
        match self {
            Epoch::Zero => Epoch::One,
            Epoch::One => Epoch::Two,
            Epoch::Two => Epoch::Zero,
        }
    }
}

/// One explored abstract state.
#[derive(Clone)]
pub struct Cfg {
    /// Program counters; `None` means the thread is idle (function returned).
    pub pc: [Option<StmtId>; MAX_THREADS],
    /// Linearizability observer state.
    pub state: MultiState,
    /// SMR observer state (retire/free bookkeeping, quiescent lanes).
    pub smr: MultiState,
    /// Event value of the running call: the input argument, or the output
    /// value once the linearisation fired. `None` when no value is pending.
    pub inout: [Option<DataValue>; MAX_THREADS],
    /// Whether the witness input has been consumed by some call.
    pub seen: bool,
    /// Prophecy registers set by `oracle`.
    pub oracle: [bool; MAX_THREADS],
    /// The `REUSE` cell is currently freed (reallocation may recycle it).
    pub freed: bool,
    /// The `REUSE` cell is retired but not yet reclaimed.
    pub retired: bool,

    pub shape: Shape,

    // Per-cell registers, indexed like the shape (sized to its capacity so
    // the transient third thread block is addressable).
    /// The cell is exclusively owned by the thread holding the register.
    pub own: Vec<bool>,
    /// The pointer held by this register is valid (PRF semantics).
    pub valid_ptr: Vec<bool>,
    /// The `next` field of the pointed-to cell is valid.
    pub valid_next: Vec<bool>,
    /// Per-cell state of SMR guard 0 (e.g. hazard pointer 0).
    pub guard0: Vec<Option<StateId>>,
    /// Per-cell state of SMR guard 1.
    pub guard1: Vec<Option<StateId>>,

    // Epoch-based reclamation registers. `offender` and `localepoch` belong
    // to the epoch variant and are only touched by the epoch statements.
    pub globalepoch: Epoch,
    pub localepoch: [Epoch; MAX_THREADS],
    /// Epoch stamped on the offending thread's reclamation record.
    pub epochsel: Epoch,
    /// Whether the thread is the one whose record is tracked via `REUSE`.
    pub offender: [bool; MAX_THREADS],
    /// Abstract data fields of the tracked reclamation record.
    pub datasel: [DataValue; 2],

    // The three logical data sets, per thread.
    pub dataset0: [DataSet; MAX_THREADS],
    pub dataset1: [DataSet; MAX_THREADS],
    pub dataset2: [DataSet; MAX_THREADS],
}

impl Cfg {
    /// The configuration every run starts from: both threads idle, observer
    /// initial states, a fresh shape. The fixpoint driver then executes the
    /// init sequence on thread 0.
    pub fn start(shape: Shape, state: MultiState, smr: MultiState) -> Cfg {
        let cap = shape.capacity();
        let mut own = vec![false; cap];
        for slot in own.iter_mut().skip(shape.offset_locals(0)) {
            *slot = true;
        }
        Cfg {
            pc: [None; MAX_THREADS],
            state,
            smr,
            inout: [None; MAX_THREADS],
            seen: false,
            oracle: [false; MAX_THREADS],
            freed: false,
            retired: false,
            shape,
            own,
            valid_ptr: vec![false; cap],
            valid_next: vec![false; cap],
            guard0: vec![None; cap],
            guard1: vec![None; cap],
            globalepoch: Epoch::Zero,
            localepoch: [Epoch::Zero; MAX_THREADS],
            epochsel: Epoch::Zero,
            offender: [false; MAX_THREADS],
            datasel: [DataValue::Other; 2],
            dataset0: [DataSet::WithoutData; MAX_THREADS],
            dataset1: [DataSet::WithoutData; MAX_THREADS],
            dataset2: [DataSet::WithoutData; MAX_THREADS],
        }
    }

    /// Clone with the shape replaced; the usual way posts derive successors.
    pub fn with_shape(&self, shape: Shape) -> Cfg {
        let mut out = self.clone();
        out.shape = shape;
        out
    }

    /// Datasets accessor by set id (0..=2).
    pub fn dataset(&self, set: u8) -> &[DataSet; MAX_THREADS] {
        match set {
            0 => &self.dataset0,
            1 => &self.dataset1,
            2 => &self.dataset2,
            _ => panic!("dataset id out of range: {set}"),
        }
    }

    pub fn dataset_mut(&mut self, set: u8) -> &mut [DataSet; MAX_THREADS] {
        match set {
            0 => &mut self.dataset0,
            1 => &mut self.dataset1,
            2 => &mut self.dataset2,
            _ => panic!("dataset id out of range: {set}"),
        }
    }

    /// Reset the per-cell registers of thread `tid`'s local block (used when
    /// a thread slot is recycled and when the interferer is projected away).
    pub fn reset_locals(&mut self, tid: usize) {
        let begin = self.shape.offset_locals(tid);
        let end = begin + self.shape.size_locals();
        for i in begin..end {
            self.own[i] = true;
            self.valid_ptr[i] = false;
            self.valid_next[i] = false;
            self.guard0[i] = None;
            self.guard1[i] = None;
        }
    }
}

impl std::fmt::Debug for Cfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cfg(pc={:?}, inout={:?}, seen={}, freed={}, retired={}, {:?})",
            self.pc, self.inout, self.seen, self.freed, self.retired, self.shape
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{DataValue, Event, EventFn, ObserverBuilder};

    fn mini() -> Cfg {
        let mut b = ObserverBuilder::new();
        let s = b.initial("s");
        let t = b.state("t");
        b.transition(s, Event::enter(EventFn::Retire, true, DataValue::Data), t)
            .unwrap();
        let obs = b.build().unwrap();
        let shape = Shape::new(2, 1, 2, 2);
        Cfg::start(shape, obs.initial_state().clone(), obs.initial_state().clone())
    }

    #[test]
    fn start_state_defaults() {
        let cfg = mini();
        assert_eq!(cfg.pc, [None; MAX_THREADS]);
        assert!(!cfg.seen && !cfg.freed && !cfg.retired);
        // locals are owned, everything else is not
        let first_local = cfg.shape.offset_locals(0);
        assert!(!cfg.own[0]);
        assert!(!cfg.own[first_local - 1]);
        assert!(cfg.own[first_local]);
        assert!(cfg.own.len() >= cfg.shape.size());
    }

    #[test]
    fn reset_locals_restores_defaults() {
        let mut cfg = mini();
        let i = cfg.shape.index_local(1, 0);
        cfg.own[i] = false;
        cfg.valid_ptr[i] = true;
        cfg.reset_locals(1);
        assert!(cfg.own[i]);
        assert!(!cfg.valid_ptr[i]);
    }

    #[test]
    fn dataset_accessors_route_by_id() {
        let mut cfg = mini();
        cfg.dataset_mut(1)[0] = DataSet::WithData;
        assert_eq!(cfg.dataset(1)[0], DataSet::WithData);
        assert_eq!(cfg.dataset(0)[0], DataSet::WithoutData);
    }
}
