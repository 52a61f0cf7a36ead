//! Crate root: public surface and engine-wide invariants.
//!
//! `smrcheck` is a static verifier for lock-free data structures under
//! *manual* memory reclamation (hazard pointers, quiescent periods, plain
//! free). Given an abstract program, a linearizability observer, and an SMR
//! observer, it decides whether every interleaving of an arbitrary but
//! bounded number of client threads respects both observers. A `CORRECT`
//! verdict is a proof; an `INCORRECT` verdict names the violation. The
//! analysis is sound and incomplete.
//!
//! ## Architecture (leaf first)
//!
//! - [`relset`] — the six heap relations and their consistency oracle.
//! - [`shape`] — the abstract heap: a matrix of relation sets over cell
//!   terms, growable by one thread block for interference.
//! - [`reduce`] — concretisation, disambiguation, and merging of shapes.
//! - [`observer`] — deterministic event automata and their multi-states.
//! - [`prog`] — the program builder surface and the flattened, id-indexed
//!   statement representation.
//! - [`cfg`] — configurations: counters, observer states, shape, registers.
//! - [`post`] — the per-statement transformers and the violation taxonomy.
//! - [`encoding`] — the bucketed canonical store with pointwise merging.
//! - [`fixpoint`] / [`interference`] — the two-mode worklist driver.
//! - [`chkmimic`] / [`chkaware`] — the summary soundness post-pass and the
//!   ABA-awareness analysis.
//! - [`conformance`] / [`factory`] — the driver surface: verdict wrapper,
//!   ready-made programs and observers.
//!
//! ## Invariants
//!
//! - Shapes are kept symmetric (`shape[j][i] = symmetric(shape[i][j])`) and
//!   reflexive (`shape[i][i] = {=}`) by construction; a cell emptied through
//!   [`shape::Shape::set`] aborts the analysis as a tool bug.
//! - Defects of the *program under analysis* travel as
//!   [`post::Violation`] values and become verdicts at the conformance
//!   boundary; defects of the *driver* (malformed programs or observers)
//!   are construction-time errors and never reach the engine.
//! - The engine is single-threaded; the "threads" of the analysis are
//!   configuration slots, two resident plus a transient third.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

pub mod cfg;
pub mod chkaware;
pub mod chkmimic;
pub mod conformance;
pub mod encoding;
pub mod factory;
pub mod fixpoint;
pub mod interference;
pub mod observer;
pub mod options;
pub mod post;
pub mod prog;
pub mod reduce;
pub mod relset;
pub mod shape;

pub use cfg::Cfg;
pub use conformance::{check_conformance, ConformanceResult, RunSummary};
pub use encoding::{CfgId, Encoding};
pub use fixpoint::{fixed_point, Fixpoint};
pub use observer::{DataValue, Event, EventFn, MultiState, Observer, ObserverBuilder, StateId};
pub use options::{MemorySetup, Mode, Options, Stats};
pub use post::{PostCtx, Violation};
pub use prog::{FuncId, ProgError, Program, StmtId, VarRef};
pub use relset::{Rel, RelSet};
pub use shape::Shape;
