//! Allocation and reclamation.
//!
//! `malloc` produces a fresh cell and, when a reclaimed cell exists, a
//! second case where the allocation recycles it. `free` and `retire` fire
//! the SMR events cell-wise after deciding aliasing, invalidate dangling
//! registers, and police the reclamation contract. The *reclamation step*
//! models the scheme's background thread: it may free any retired,
//! non-owned, non-guarded, shared-unreachable cell at any time.

use crate::cfg::Cfg;
use crate::observer::{DataValue, Event, Observer, StateId};
use crate::options::MemorySetup;
use crate::prog::VarRef;
use crate::reduce::isolate_partial_concretisation;
use crate::relset::{self, Rel};
use crate::shape::Shape;

use super::{
    assign::{shape_assign_next_var, shape_assign_var_var},
    check_access, next_cfg, PostCtx, Violation,
};

/// Decide equality between `x` and every cell in `cols`, producing one shape
/// per combination that remains satisfiable.
pub(crate) fn split_on_eq_with(
    shape: &Shape,
    x: usize,
    cols: impl Iterator<Item = usize>,
) -> Vec<Shape> {
    let mut result = vec![shape.clone()];
    for j in cols {
        if j == x {
            continue;
        }
        let mut split = Vec::with_capacity(result.len());
        for s in result {
            let cell = s.at(j, x);
            if !cell.contains(Rel::Eq) || cell == relset::EQ {
                split.push(s);
                continue;
            }
            if let Some(eq) = isolate_partial_concretisation(&s, j, x, relset::EQ) {
                split.push(eq);
            }
            if let Some(neq) =
                isolate_partial_concretisation(&s, j, x, relset::MT_MF_GT_GF_BT)
            {
                split.push(neq);
            }
        }
        result = split;
    }
    result
}

/// Initial per-cell guard states: the first two initial components of the
/// SMR observer (one per guard slot).
fn guard_inits(smr: &Observer) -> (StateId, StateId) {
    let inits = smr.initial_state().states();
    let g0 = inits[0];
    let g1 = inits.get(1).copied().unwrap_or(g0);
    (g0, g1)
}

fn step_guard(smr: &Observer, slot: &mut Option<StateId>, evt: &Event) -> Option<StateId> {
    if let Some(s) = *slot {
        let next = smr.next(s, evt);
        *slot = Some(next);
        return Some(next);
    }
    None
}

/// Would freeing the cell behind this guard state fire the observer?
fn free_forbidden(smr: &Observer, slot: Option<StateId>, evt: &Event) -> bool {
    match slot {
        Some(s) => smr.is_final(smr.next(s, evt)),
        None => false,
    }
}

// -- malloc -----------------------------------------------------------------

pub(super) fn post_malloc(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    pc: crate::prog::StmtId,
    var: VarRef,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let shape = &cfg.shape;
    let cell = var.cell(shape, tid);
    if !var.is_local() && ctx.prog.stmt(pc).func.is_some() {
        return Err(Violation::GlobalMalloc);
    }
    let (g0, g1) = guard_inits(ctx.smr);
    let mut result = Vec::with_capacity(2);

    // a fresh cell: unrelated to everything, next field pointing to NULL
    {
        let mut blank = shape.clone();
        for i in 0..blank.size() {
            if i != cell {
                blank.set(cell, i, relset::BT);
            }
        }
        let fresh = shape_assign_next_var(&blank, cell, blank.index_null())?;
        let mut out = next_cfg(ctx, cfg, fresh, tid);
        out.own[cell] = var.is_local();
        out.valid_ptr[cell] = true;
        out.valid_next[cell] = true;
        out.guard0[cell] = Some(g0);
        out.guard1[cell] = Some(g1);
        result.push(out);
    }

    // the allocator may hand back the reclaimed cell
    if cfg.freed && ctx.opts.msetup != MemorySetup::Gc {
        let aliased = shape_assign_var_var(shape, cell, shape.index_reuse());
        let mut recycled = Some(shape_assign_next_var(&aliased, cell, shape.index_null())?);
        for g in shape.offset_globals()..shape.offset_locals(0) {
            // a recycled cell cannot still be shared-reachable
            recycled = match recycled {
                Some(s) => isolate_partial_concretisation(&s, g, cell, relset::MF_GF_BT),
                None => None,
            };
        }
        if let Some(s) = recycled {
            let mut out = next_cfg(ctx, cfg, s, tid);
            out.own[cell] = var.is_local();
            out.valid_ptr[cell] = true;
            out.valid_next[cell] = true;
            out.guard0[cell] = Some(g0);
            out.guard1[cell] = Some(g1);
            out.freed = false;
            out.retired = false;
            result.push(out);
        }
    }

    Ok(result)
}

// -- free (direct) ----------------------------------------------------------

/// Alias columns that matter for free/retire events: the reclaimed cell,
/// the observer cells, and every program cell up to `tid`'s block.
fn event_columns(shape: &Shape, tid: usize) -> impl Iterator<Item = usize> {
    let reuse = shape.index_reuse();
    let begin = shape.offset_observers();
    let end = shape.offset_locals(tid) + shape.size_locals();
    std::iter::once(reuse).chain(begin..end)
}

pub(super) fn post_free_stmt(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: VarRef,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    if ctx.opts.msetup == MemorySetup::Gc {
        return Ok(vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)]);
    }
    let cell = var.cell(&cfg.shape, tid);
    check_access(ctx, cfg, cell)?;

    let thread = tid == 0;
    let mut result = Vec::new();
    for shape in split_on_eq_with(&cfg.shape, cell, event_columns(&cfg.shape, tid)) {
        let mut out = next_cfg(ctx, cfg, shape, tid);
        let s = out.shape.clone();

        let lin_dval = dval_for(&s, cell, s.index_observer(0));
        let smr_dval = dval_for(&s, cell, s.index_observer(1));
        // guard registers are tracked relative to their owning thread
        let per_cell = Event::free(true, DataValue::Data);

        for j in 0..s.size() {
            if !s.test(cell, j, Rel::Eq) {
                continue;
            }
            out.valid_ptr[j] = false;
            out.valid_next[j] = false;
            if let Some(next) = step_guard(ctx.smr, &mut out.guard0[j], &per_cell) {
                if ctx.smr.is_final(next) {
                    return Err(Violation::DoubleFree);
                }
            }
            if let Some(next) = step_guard(ctx.smr, &mut out.guard1[j], &per_cell) {
                if ctx.smr.is_final(next) {
                    return Err(Violation::DoubleFree);
                }
            }
            if j == s.index_reuse() {
                out.freed = true;
                out.retired = false;
            }
        }

        out.smr = out.smr.next(ctx.smr, &Event::free(thread, smr_dval));
        if out.smr.is_marked(ctx.smr) {
            continue;
        }
        if out.smr.is_final(ctx.smr) {
            return Err(Violation::DoubleFree);
        }
        out.state = out.state.next(ctx.lin, &Event::free(thread, lin_dval));
        if out.state.is_final(ctx.lin) {
            return Err(Violation::SpecViolation {
                state: out.state.find_final(ctx.lin).to_owned(),
            });
        }
        result.push(out);
    }
    Ok(result)
}

fn dval_for(shape: &Shape, cell: usize, obs: usize) -> DataValue {
    if shape.test(cell, obs, Rel::Eq) {
        DataValue::Data
    } else {
        DataValue::Other
    }
}

// -- retire -----------------------------------------------------------------

pub(super) fn post_retire(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: VarRef,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    if ctx.opts.msetup == MemorySetup::Gc {
        return Ok(vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)]);
    }
    let cell = var.cell(&cfg.shape, tid);
    assert!(
        cfg.shape.is_local_of(cell, tid),
        "retire must go through a thread-local pointer"
    );
    check_access(ctx, cfg, cell)?;
    if cfg.own[cell] {
        return Err(Violation::RetireOwned);
    }

    let thread = tid == 0;
    let mut result = Vec::new();
    for shape in split_on_eq_with(&cfg.shape, cell, event_columns(&cfg.shape, tid)) {
        // retiring a cell the shared structure still reaches is a defect
        for g in shape.offset_globals()..shape.offset_locals(0) {
            if shape.at(g, cell).intersects(relset::EQ_MT_GT) {
                return Err(Violation::RetireSharedReachable);
            }
        }
        let mut out = next_cfg(ctx, cfg, shape, tid);
        let s = out.shape.clone();

        let per_cell = Event::enter(
            crate::observer::EventFn::Retire,
            true,
            DataValue::Data,
        );
        for j in 0..s.size() {
            if !s.test(cell, j, Rel::Eq) {
                continue;
            }
            if out.own[j] && j != cell {
                return Err(Violation::RetireOwned);
            }
            step_guard(ctx.smr, &mut out.guard0[j], &per_cell);
            step_guard(ctx.smr, &mut out.guard1[j], &per_cell);
        }

        if s.test(cell, s.index_reuse(), Rel::Eq) {
            let observed = s.test(cell, s.index_observer(0), Rel::Eq)
                || s.test(cell, s.index_observer(1), Rel::Eq);
            if out.retired && observed && out.inout[tid] == Some(DataValue::Data) {
                return Err(Violation::DoubleRetire);
            }
            out.retired = true;
        }

        let smr_dval = dval_for(&s, cell, s.index_observer(1));
        out.smr = out.smr.next(
            ctx.smr,
            &Event::enter(crate::observer::EventFn::Retire, thread, smr_dval),
        );
        if out.smr.is_marked(ctx.smr) {
            // usage-invariant violation: the interleaving is infeasible
            continue;
        }
        if out.smr.is_final(ctx.smr) {
            return Err(Violation::DoubleRetire);
        }
        result.push(out);
    }
    Ok(result)
}

// -- environment reclamation ------------------------------------------------

/// Keep only the heaps where `cell` is neither null, undefined, nor
/// reachable from any shared variable.
fn extract_shared_unreachable(shape: &Shape, cell: usize) -> Option<Shape> {
    let mut out =
        isolate_partial_concretisation(shape, cell, shape.index_null(), relset::MT_GT_BT)?;
    out = isolate_partial_concretisation(&out, cell, shape.index_undef(), relset::MT_GT_BT)?;
    for g in shape.offset_globals()..shape.offset_locals(0) {
        out = isolate_partial_concretisation(&out, g, cell, relset::MF_GF_BT)?;
    }
    Some(out)
}

/// One adversary step of the reclamation scheme: free any retired cell of
/// thread `tid` that is not owned, not guarded, and not shared-reachable.
/// The program counters do not move.
pub fn post_reclaim(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Result<Vec<Cfg>, Violation> {
    if !ctx.prog.uses_reclamation() || ctx.opts.msetup == MemorySetup::Gc {
        return Ok(Vec::new());
    }
    let thread = tid == 0;
    let free_probe = Event::free(true, DataValue::Data);
    let mut result = Vec::new();

    let begin = cfg.shape.offset_locals(tid);
    let end = begin + cfg.shape.size_locals();
    for cell in begin..end {
        if cfg.own[cell] {
            continue;
        }
        if free_forbidden(ctx.smr, cfg.guard0[cell], &free_probe)
            || free_forbidden(ctx.smr, cfg.guard1[cell], &free_probe)
        {
            // quick per-register check; aliases are vetted per split below
            continue;
        }
        let Some(unreachable) = extract_shared_unreachable(&cfg.shape, cell) else {
            continue;
        };

        'splits: for shape in
            split_on_eq_with(&unreachable, cell, 2..unreachable.size())
        {
            let mut out = cfg.with_shape(shape);
            let s = out.shape.clone();

            for j in 0..s.size() {
                if !s.test(cell, j, Rel::Eq) {
                    continue;
                }
                if free_forbidden(ctx.smr, out.guard0[j], &free_probe)
                    || free_forbidden(ctx.smr, out.guard1[j], &free_probe)
                {
                    // an alias still protects the cell; the free cannot happen
                    continue 'splits;
                }
                out.valid_ptr[j] = false;
                out.valid_next[j] = false;
                step_guard(ctx.smr, &mut out.guard0[j], &free_probe);
                step_guard(ctx.smr, &mut out.guard1[j], &free_probe);
                if j == s.index_reuse() {
                    if !out.retired {
                        continue 'splits;
                    }
                    out.freed = true;
                    out.retired = false;
                }
            }

            let smr_dval = dval_for(&s, cell, s.index_observer(1));
            out.smr = out.smr.next(ctx.smr, &Event::free(thread, smr_dval));
            if out.smr.is_marked(ctx.smr) || out.smr.is_final(ctx.smr) {
                continue;
            }
            let lin_dval = dval_for(&s, cell, s.index_observer(0));
            out.state = out.state.next(ctx.lin, &Event::free(thread, lin_dval));
            if out.state.is_final(ctx.lin) {
                return Err(Violation::SpecViolation {
                    state: out.state.find_final(ctx.lin).to_owned(),
                });
            }
            result.push(out);
        }
    }
    Ok(result)
}
