//! Post images: per-statement configuration transformers.
//!
//! `post(ctx, cfg, tid)` computes the finite set of configurations reachable
//! by letting thread `tid` execute the statement at `cfg.pc[tid]`. Every
//! transformer over-approximates the concrete semantics: it may case-split
//! (disambiguation), it prunes inconsistent relations (concretisation), and
//! it reports program defects as [`Violation`]s which the fixpoint surfaces
//! as verdicts.
//!
//! Submodules follow the statement families: condition evaluation, pointer
//! assignments, allocation/reclamation, SMR operations, linearisation
//! points, and the structural statements.

mod assign;
mod easy;
mod eval;
mod linp;
mod mem;
mod smr;

pub(crate) use assign::post_assignment;
pub(crate) use linp::apply_linp;
pub use mem::post_reclaim;

use thiserror::Error;

use crate::cfg::Cfg;
use crate::observer::Observer;
use crate::options::{MemorySetup, Options};
use crate::prog::{Program, StmtId, StmtKind};
use crate::relset::Rel;
use crate::shape::Shape;

/// Defects of the program under analysis. These bubble out of the post
/// transformers, are caught at the fixpoint boundary, and become `INCORRECT`
/// verdicts — they are never tool bugs.
#[derive(Debug, Error)]
pub enum Violation {
    #[error("Dereferencing NULL while accessing cell term {cell}.")]
    NullDeref { cell: usize },
    #[error("Accessing uninitialized cell term {cell}.")]
    UndefDeref { cell: usize },
    #[error("Closed cycle detected between cell terms {x} and {y}.")]
    CycleCreated { x: usize, y: usize },
    #[error("Double free detected.")]
    DoubleFree,
    #[error("Double retire on an observed address.")]
    DoubleRetire,
    #[error("Owned addresses must not be retired.")]
    RetireOwned,
    #[error("Retire of shared reachable address")]
    RetireSharedReachable,
    #[error("Specification violation detected: observer reached final state '{state}'.")]
    SpecViolation { state: String },
    #[error("Relaxed pointer race detected on cell term {cell}.")]
    PointerRace { cell: usize },
    #[error("Strong pointer race detected on cell term {cell}.")]
    StrongPointerRace { cell: usize },
    #[error("Multiple linearisation events fired by one call.")]
    DoubleLinearisation,
    #[error("Allocations may not target global variables.")]
    GlobalMalloc,
    #[error("Malicious ABA: {0}")]
    MaliciousAba(String),
    #[error("Misbehaving summary: {0}")]
    SummaryMismatch(String),
}

/// Everything a post transformer needs besides the configuration.
pub struct PostCtx<'a> {
    pub prog: &'a Program,
    /// Linearizability observer.
    pub lin: &'a Observer,
    /// SMR observer (also drives the per-cell guard registers).
    pub smr: &'a Observer,
    pub opts: &'a Options,
}

/// Advance `cfg` past its current statement, adopting `shape`.
pub(crate) fn next_cfg(ctx: &PostCtx<'_>, cfg: &Cfg, shape: Shape, tid: usize) -> Cfg {
    let pc = cfg.pc[tid].expect("post of an idle thread");
    jump_cfg(cfg, shape, ctx.prog.next_of(pc), tid)
}

/// Adopt `shape` and jump to an explicit target.
pub(crate) fn jump_cfg(cfg: &Cfg, shape: Shape, target: Option<StmtId>, tid: usize) -> Cfg {
    let mut out = cfg.with_shape(shape);
    out.pc[tid] = target;
    out
}

/// Null/undef dereference checks for an access through `cell`.
pub(crate) fn check_deref(cfg: &Cfg, cell: usize) -> Result<(), Violation> {
    let s = &cfg.shape;
    if s.test(cell, s.index_null(), Rel::Eq) {
        return Err(Violation::NullDeref { cell });
    }
    if s.test(cell, s.index_undef(), Rel::Mt) {
        return Err(Violation::UndefDeref { cell });
    }
    Ok(())
}

/// Memory-semantics-dependent access check for a heap access through `cell`.
pub(crate) fn check_access(ctx: &PostCtx<'_>, cfg: &Cfg, cell: usize) -> Result<(), Violation> {
    match ctx.opts.msetup {
        MemorySetup::Gc => Ok(()),
        MemorySetup::Prf => {
            if !cfg.valid_ptr[cell] {
                Err(Violation::PointerRace { cell })
            } else {
                Ok(())
            }
        }
        MemorySetup::Mm => {
            // only definite accesses to reclaimed memory are errors here
            let s = &cfg.shape;
            if cfg.freed && s.at(cell, s.index_reuse()) == crate::relset::EQ {
                Err(Violation::StrongPointerRace { cell })
            } else {
                Ok(())
            }
        }
    }
}

/// The post image of thread `tid`'s current statement.
pub fn post(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Result<Vec<Cfg>, Violation> {
    let pc = cfg.pc[tid].expect("post of an idle thread");
    let stmt = ctx.prog.stmt(pc);
    let mut result = match &stmt.kind {
        StmtKind::Atomic { body } => easy::post_atomic(ctx, cfg, pc, *body, tid)?,
        StmtKind::Assign { lhs, rhs } => assign::post_assign_stmt(ctx, cfg, *lhs, *rhs, tid)?,
        StmtKind::SetNull { lhs } => assign::post_set_null(ctx, cfg, *lhs, tid)?,
        StmtKind::ReadInput { var } => linp::post_read_input(ctx, cfg, *var, tid)?,
        StmtKind::WriteOutput { var } => linp::post_write_output(ctx, cfg, *var, tid)?,
        StmtKind::Malloc { var } => mem::post_malloc(ctx, cfg, pc, *var, tid)?,
        StmtKind::Free { var } => mem::post_free_stmt(ctx, cfg, *var, tid)?,
        StmtKind::Retire { var } => mem::post_retire(ctx, cfg, *var, tid)?,
        StmtKind::HpSet { var, index } => smr::post_hp_set(ctx, cfg, *var, *index, tid)?,
        StmtKind::HpRelease { index } => smr::post_hp_release(ctx, cfg, *index, tid)?,
        StmtKind::EnterQ => smr::post_quiescent(ctx, cfg, tid, true)?,
        StmtKind::LeaveQ => smr::post_quiescent(ctx, cfg, tid, false)?,
        StmtKind::Linp(l) => linp::post_linp(ctx, cfg, l, tid)?,
        StmtKind::Ite { cond, next_true, next_false, .. } => {
            eval::eval_cond(ctx, cfg, cond, *next_true, *next_false, tid)?
        }
        StmtKind::Loop { body, .. } => {
            // while (true): unconditionally enter the body
            vec![jump_cfg(cfg, cfg.shape.clone(), Some(*body), tid)]
        }
        StmtKind::Break => vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)],
        StmtKind::Cas(c) => {
            let nxt = ctx.prog.next_of(pc);
            eval::eval_cond_cas(ctx, cfg, c, nxt, nxt, tid)?
        }
        StmtKind::Oracle => easy::post_oracle(ctx, cfg, tid),
        StmtKind::CheckProphecy(expect) => easy::post_check_prophecy(ctx, cfg, *expect, tid),
        StmtKind::Kill { var } => easy::post_kill(ctx, cfg, *var, tid),
        StmtKind::SetAddArg { set } => assign::post_set_add_arg(ctx, cfg, *set, tid),
        StmtKind::SetAddSel { set, var, index } => {
            assign::post_set_add_sel(ctx, cfg, *set, *var, *index, tid)
        }
        StmtKind::SetCombine { lhs, rhs, op } => {
            assign::post_set_combine(ctx, cfg, *lhs, *rhs, *op, tid)
        }
        StmtKind::SetClear { set } => assign::post_set_clear(ctx, cfg, *set, tid),
        StmtKind::InitRec { var } => assign::post_init_rec(ctx, cfg, *var, tid),
        StmtKind::WriteRec { index, from_arg } => {
            assign::post_write_rec(ctx, cfg, *index, *from_arg, tid)
        }
        StmtKind::SetRecEpoch => smr::post_set_rec_epoch(ctx, cfg, tid),
        StmtKind::GetEpoch => smr::post_get_epoch(ctx, cfg, tid),
        StmtKind::IncEpoch => smr::post_inc_epoch(ctx, cfg, tid),
    };

    if let Some(hint) = ctx.prog.hint() {
        result.retain(|c| !hint(&c.shape));
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::Cfg;
    use crate::factory::no_reclamation_observer;
    use crate::observer::Observer;
    use crate::options::MemorySetup;
    use crate::prog::{atomic, check_prophecy, fun, kill, oracle, Program};
    use crate::relset;

    fn start(prog: &Program, lin: &Observer, smr: &Observer) -> Cfg {
        let shape = Shape::new(2, prog.num_globals(), prog.num_locals(), 2);
        Cfg::start(shape, lin.initial_state().clone(), smr.initial_state().clone())
    }

    fn gc_opts() -> Options {
        Options::with_setup(MemorySetup::Gc)
    }

    #[test]
    fn prophecies_branch_and_filter() {
        let prog = Program::new(
            "Prophecy",
            &["G"],
            &["x"],
            vec![],
            vec![fun("f", true, vec![oracle(), check_prophecy(true), kill("x")])],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = gc_opts();
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("f").unwrap()).entry();

        let branches = post(&ctx, &cfg, 0).unwrap();
        assert_eq!(branches.len(), 2);
        let survivors: Vec<Cfg> = branches
            .iter()
            .flat_map(|c| post(&ctx, c, 0).unwrap())
            .collect();
        assert_eq!(survivors.len(), 1, "only the fulfilled prophecy continues");
        assert!(survivors[0].oracle[0]);

        let killed = post(&ctx, &survivors[0], 0).unwrap().pop().unwrap();
        let x = killed.shape.index_local(0, 0);
        assert_eq!(killed.shape.at(x, killed.shape.index_undef()), relset::MT);
        assert!(killed.own[x]);
        assert!(!killed.valid_ptr[x]);
    }

    #[test]
    fn atomic_blocks_run_to_completion() {
        let prog = Program::new(
            "Blocks",
            &["G"],
            &["x"],
            vec![],
            vec![fun("f", true, vec![atomic(vec![kill("x"), kill("x")])])],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = gc_opts();
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("f").unwrap()).entry();

        let out = post(&ctx, &cfg, 0).unwrap();
        // the whole block is one indivisible step; the function then returns
        assert_eq!(out.len(), 1);
        assert!(out[0].pc[0].is_none());
        let x = out[0].shape.index_local(0, 0);
        assert_eq!(out[0].shape.at(x, out[0].shape.index_undef()), relset::MT);
    }
}
