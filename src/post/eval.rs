//! Condition evaluation.
//!
//! Pointer conditions split the shape with a partial concretisation: the
//! asserted relation on the true side, its complement on the false side.
//! Either side may turn out infeasible, in which case only one branch is
//! produced. Successful equalities *revalidate* a dangling operand — the two
//! registers provably denote the same cell, so the invalid one inherits the
//! valid one's status. This revalidation is exactly what the ABA-awareness
//! analysis later vets; age-checked comparisons are immune because a
//! matching age certifies the compared cells were not recycled.

use crate::cfg::Cfg;
use crate::options::MemorySetup;
use crate::prog::{Cas, Cond, Expr, StmtId};
use crate::reduce::isolate_partial_concretisation;
use crate::relset::{self, RelSet};
use crate::shape::Shape;

use super::{apply_linp, check_access, check_deref, post_assignment, PostCtx, Violation};

/// The relation a successful comparison asserts between the operand cells.
fn eq_relation(lhs: Expr, rhs: Expr) -> RelSet {
    match (lhs.is_selector(), rhs.is_selector()) {
        (false, false) => relset::EQ,
        // x == y.next  ⟺  y ↦ x
        (false, true) => relset::MF,
        // x.next == y  ⟺  x ↦ y
        (true, false) => relset::MT,
        (true, true) => panic!("comparing two selectors is not supported"),
    }
}

/// Split of a configuration along a condition; program counters untouched.
pub(super) struct CondSplit {
    /// Condition evaluates to true.
    pub taken: Vec<Cfg>,
    /// Condition evaluates to false.
    pub other: Vec<Cfg>,
}

fn revalidate_on_equality(cfg: &mut Cfg, lcell: usize, rcell: usize) {
    // the registers denote one cell; a dangling side inherits the live one
    match (cfg.valid_ptr[lcell], cfg.valid_ptr[rcell]) {
        (true, false) => {
            cfg.valid_ptr[rcell] = true;
            cfg.valid_next[rcell] = cfg.valid_next[lcell];
        }
        (false, true) => {
            cfg.valid_ptr[lcell] = true;
            cfg.valid_next[lcell] = cfg.valid_next[rcell];
        }
        _ => {}
    }
}

/// Remove the possibility that `cell` is the recycled cell; `None` when the
/// cell definitely is.
fn without_reuse(shape: &Shape, cell: usize) -> Option<Shape> {
    isolate_partial_concretisation(shape, cell, shape.index_reuse(), relset::MT_MF_GT_GF_BT)
}

/// Keep only the shapes where `cell` is the recycled cell.
fn only_reuse(shape: &Shape, cell: usize) -> Option<Shape> {
    isolate_partial_concretisation(shape, cell, shape.index_reuse(), relset::EQ)
}

pub(super) fn split_eqneq(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: Expr,
    rhs: Expr,
    neg: bool,
    with_age: bool,
    tid: usize,
) -> Result<CondSplit, Violation> {
    for e in [lhs, rhs] {
        if e.is_selector() {
            let cell = e.cell(&cfg.shape, tid);
            check_deref(cfg, cell)?;
            check_access(ctx, cfg, cell)?;
        }
    }
    let lcell = lhs.cell(&cfg.shape, tid);
    let rcell = rhs.cell(&cfg.shape, tid);

    if lcell == rcell && !lhs.is_selector() && !rhs.is_selector() {
        // comparing a register against itself is decided syntactically
        let taken = vec![cfg.with_shape(cfg.shape.clone())];
        let split = if neg {
            CondSplit { taken: Vec::new(), other: taken }
        } else {
            CondSplit { taken, other: Vec::new() }
        };
        return Ok(split);
    }

    let sing = eq_relation(lhs, rhs);
    let eq_shape = isolate_partial_concretisation(&cfg.shape, lcell, rcell, sing);
    let neq_shape = isolate_partial_concretisation(&cfg.shape, lcell, rcell, sing.complement());

    let plain_compare = !lhs.is_selector() && !rhs.is_selector();
    let mut eq_cfgs = Vec::new();
    let mut neq_cfgs = Vec::new();

    if let Some(nshape) = neq_shape {
        neq_cfgs.push(cfg.with_shape(nshape));
    }
    if let Some(eshape) = eq_shape {
        if with_age && ctx.opts.msetup != MemorySetup::Gc {
            // equal ages rule out the recycled cell on the success side;
            // "same pointer, different age" continues on the failure side
            if let Some(recycled) = only_reuse(&eshape, lcell) {
                neq_cfgs.push(cfg.with_shape(recycled));
            }
            let lhs_clean = without_reuse(&eshape, lcell);
            if let Some(clean) = &lhs_clean {
                if let Some(recycled) = only_reuse(clean, rcell) {
                    neq_cfgs.push(cfg.with_shape(recycled));
                }
            }
            if let Some(core) = lhs_clean.and_then(|s| without_reuse(&s, rcell)) {
                let mut c = cfg.with_shape(core);
                if plain_compare {
                    c.valid_ptr[lcell] = true;
                    c.valid_ptr[rcell] = true;
                }
                eq_cfgs.push(c);
            }
        } else {
            let mut c = cfg.with_shape(eshape);
            if plain_compare {
                revalidate_on_equality(&mut c, lcell, rcell);
            }
            eq_cfgs.push(c);
        }
    }

    Ok(if neg {
        CondSplit { taken: neq_cfgs, other: eq_cfgs }
    } else {
        CondSplit { taken: eq_cfgs, other: neq_cfgs }
    })
}

pub(super) fn eval_cond_eqneq(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: Expr,
    rhs: Expr,
    neg: bool,
    with_age: bool,
    n_true: Option<StmtId>,
    n_false: Option<StmtId>,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let split = split_eqneq(ctx, cfg, lhs, rhs, neg, with_age, tid)?;
    let mut result = Vec::with_capacity(split.taken.len() + split.other.len());
    for mut c in split.taken {
        c.pc[tid] = n_true;
        result.push(c);
    }
    for mut c in split.other {
        c.pc[tid] = n_false;
        result.push(c);
    }
    Ok(result)
}

/// CAS: split on `dst == cmp`; on success perform `dst := src` and fire the
/// attached linearisation point, on failure fall through untouched.
pub(super) fn eval_cond_cas(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    cas: &Cas,
    n_true: Option<StmtId>,
    n_false: Option<StmtId>,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let split = split_eqneq(ctx, cfg, cas.dst, cas.cmp, false, cas.with_age, tid)?;
    let mut result = Vec::new();

    for c in split.taken {
        let written = post_assignment(ctx, &c, cas.dst, cas.src, tid)?;
        let fired = match &cas.lp {
            Some(lp) => apply_linp(ctx, written, lp, tid)?,
            None => written,
        };
        for mut f in fired {
            f.pc[tid] = n_true;
            result.push(f);
        }
    }
    for mut c in split.other {
        c.pc[tid] = n_false;
        result.push(c);
    }
    Ok(result)
}

fn eval_epoch_var(cfg: &Cfg, n_true: Option<StmtId>, n_false: Option<StmtId>, tid: usize) -> Vec<Cfg> {
    // epoch != Epoch is decided by the thread-local registers
    let lagging = cfg.localepoch[tid] != cfg.globalepoch;
    let mut c = cfg.with_shape(cfg.shape.clone());
    c.pc[tid] = if lagging { n_true } else { n_false };
    vec![c]
}

fn eval_epoch_sel(
    cfg: &Cfg,
    var: crate::prog::VarRef,
    n_true: Option<StmtId>,
    n_false: Option<StmtId>,
    tid: usize,
) -> Vec<Cfg> {
    // epoch != v->epoch: decidable only when v is the tracked record
    let cell = var.cell(&cfg.shape, tid);
    let reuse = cfg.shape.index_reuse();
    let mut result = Vec::with_capacity(3);

    if let Some(eq) = isolate_partial_concretisation(&cfg.shape, cell, reuse, relset::EQ) {
        let lagging = cfg.localepoch[tid] != cfg.epochsel;
        let mut c = cfg.with_shape(eq);
        c.pc[tid] = if lagging { n_true } else { n_false };
        result.push(c);
    }
    if let Some(neq) =
        isolate_partial_concretisation(&cfg.shape, cell, reuse, relset::MT_MF_GT_GF_BT)
    {
        let mut t = cfg.with_shape(neq.clone());
        t.pc[tid] = n_true;
        result.push(t);
        let mut f = cfg.with_shape(neq);
        f.pc[tid] = n_false;
        result.push(f);
    }
    result
}

pub(super) fn eval_cond(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    cond: &Cond,
    n_true: Option<StmtId>,
    n_false: Option<StmtId>,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    match cond {
        Cond::True => unreachable!("'true' conditionals are rejected at construction"),
        Cond::NonDet => {
            let mut t = cfg.with_shape(cfg.shape.clone());
            t.pc[tid] = n_true;
            let mut f = cfg.with_shape(cfg.shape.clone());
            f.pc[tid] = n_false;
            Ok(vec![t, f])
        }
        Cond::EqNeq { lhs, rhs, neg, with_age } => {
            eval_cond_eqneq(ctx, cfg, *lhs, *rhs, *neg, *with_age, n_true, n_false, tid)
        }
        Cond::Cas(c) => eval_cond_cas(ctx, cfg, c, n_true, n_false, tid),
        Cond::EpochVar => Ok(eval_epoch_var(cfg, n_true, n_false, tid)),
        Cond::EpochSel(v) => Ok(eval_epoch_sel(cfg, *v, n_true, n_false, tid)),
        Cond::Oracle | Cond::Compound(..) => {
            unreachable!("prophecy/compound conditions only guard linearisation points")
        }
    }
}

/// Split a bare *shape* along an eq/neq condition, for the linearisation
/// point guards (no revalidation, no branching registers).
pub(super) fn split_shape_eqneq(
    shape: &Shape,
    lhs: Expr,
    rhs: Expr,
    neg: bool,
    tid: usize,
) -> (Option<Shape>, Option<Shape>) {
    let lcell = lhs.cell(shape, tid);
    let rcell = rhs.cell(shape, tid);
    if lcell == rcell && !lhs.is_selector() && !rhs.is_selector() {
        let copy = Some(shape.clone());
        return if neg { (None, copy) } else { (copy, None) };
    }
    let sing = eq_relation(lhs, rhs);
    let eq = isolate_partial_concretisation(shape, lcell, rcell, sing);
    let neq = isolate_partial_concretisation(shape, lcell, rcell, sing.complement());
    if neg {
        (neq, eq)
    } else {
        (eq, neq)
    }
}
