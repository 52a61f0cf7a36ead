//! Linearisation points and the input/output assignments.
//!
//! A linearisation point fires the linearizability observer. Its optional
//! guard splits the shape into an *emitter* part (the event fires) and a
//! *silent* part (nothing happens); guards may be pointer conditions,
//! prophecy checks, or conjunctions of both. Output events read their value
//! from a cell's data field, which the abstraction answers by comparing the
//! cell against the witness observer cell.

use crate::cfg::Cfg;
use crate::observer::{DataValue, Event, EventFn};
use crate::prog::{Cond, FuncId, Linp, VarRef};
use crate::reduce::{disambiguate, isolate_partial_concretisation, merge};
use crate::relset::{self, Rel};
use crate::shape::Shape;

use super::assign::shape_assign_var_var;
use super::eval::split_shape_eqneq;
use super::{check_access, check_deref, next_cfg, PostCtx, Violation};

/// Step the linearizability observer by this call's event.
fn fire_lp(ctx: &PostCtx<'_>, cfg: &mut Cfg, func: FuncId, tid: usize) -> Result<(), Violation> {
    let dval = cfg.inout[tid].expect("linearisation event without a pending value");
    let evt = Event::enter(EventFn::Call(func), tid == 0, dval);
    cfg.state = cfg.state.next(ctx.lin, &evt);
    if cfg.state.is_final(ctx.lin) {
        return Err(Violation::SpecViolation {
            state: cfg.state.find_final(ctx.lin).to_owned(),
        });
    }
    Ok(())
}

fn merge_opt(a: Option<Shape>, b: Option<Shape>) -> Option<Shape> {
    let shapes: Vec<Shape> = [a, b].into_iter().flatten().collect();
    merge(shapes)
}

/// Split the emitter shape along a guard; the failing part joins `silent`.
fn emitter_and_silent(
    cfg: &Cfg,
    cond: &Cond,
    emitter: Option<Shape>,
    silent: Option<Shape>,
    tid: usize,
) -> (Option<Shape>, Option<Shape>) {
    match cond {
        Cond::EqNeq { lhs, rhs, neg, .. } => {
            let Some(em) = emitter else {
                return (None, silent);
            };
            let (fire, quiet) = split_shape_eqneq(&em, *lhs, *rhs, *neg, tid);
            (fire, merge_opt(quiet, silent))
        }
        Cond::Oracle => {
            if cfg.oracle[tid] {
                (emitter, silent)
            } else {
                (None, merge_opt(emitter, silent))
            }
        }
        Cond::Compound(l, r) => {
            let (em, si) = emitter_and_silent(cfg, l, emitter, silent, tid);
            emitter_and_silent(cfg, r, em, si, tid)
        }
        _ => panic!("unsupported guard on a linearisation point"),
    }
}

/// Output cases for a value-carrying event: one configuration per decided
/// relation between the read cell and the witness cell.
fn output_cases(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: Option<VarRef>,
    emitter: Shape,
    func: FuncId,
    tid: usize,
    advance: bool,
) -> Result<Vec<Cfg>, Violation> {
    if cfg.inout[tid].is_some() {
        return Err(Violation::DoubleLinearisation);
    }
    let place = |shape: Shape| {
        if advance {
            next_cfg(ctx, cfg, shape, tid)
        } else {
            cfg.with_shape(shape)
        }
    };
    let mut result = Vec::new();

    let Some(v) = var else {
        // an empty return carries no witness
        let mut c = place(emitter);
        c.inout[tid] = Some(DataValue::Other);
        fire_lp(ctx, &mut c, func, tid)?;
        result.push(c);
        return Ok(result);
    };

    let cell = v.cell(&emitter, tid);
    let witness = emitter.index_observer(0);
    if let Some(eq) = isolate_partial_concretisation(&emitter, cell, witness, relset::EQ) {
        let mut c = place(eq);
        c.inout[tid] = Some(DataValue::Data);
        fire_lp(ctx, &mut c, func, tid)?;
        result.push(c);
    }
    if let Some(other) =
        isolate_partial_concretisation(&emitter, cell, witness, relset::MT_MF_GT_GF_BT)
    {
        let mut c = place(other);
        c.inout[tid] = Some(DataValue::Other);
        fire_lp(ctx, &mut c, func, tid)?;
        result.push(c);
    }
    Ok(result)
}

/// Post of a standalone linearisation-point statement.
pub(super) fn post_linp(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    l: &Linp,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let pc = cfg.pc[tid].expect("linearisation on an idle thread");
    let func = ctx
        .prog
        .stmt(pc)
        .func
        .expect("linearisation outside a function");

    let (emitter, silent) = match &l.cond {
        None => (Some(cfg.shape.clone()), None),
        Some(c) => emitter_and_silent(cfg, c, Some(cfg.shape.clone()), None, tid),
    };

    let mut result = Vec::new();
    if let Some(em) = emitter {
        if ctx.prog.func(func).has_input() {
            let mut c = next_cfg(ctx, cfg, em, tid);
            fire_lp(ctx, &mut c, func, tid)?;
            result.push(c);
        } else {
            result.extend(output_cases(ctx, cfg, l.var, em, func, tid, true)?);
        }
    }
    if let Some(quiet) = silent {
        result.push(next_cfg(ctx, cfg, quiet, tid));
    }
    Ok(result)
}

/// Fire a CAS-attached linearisation point on the already-assigned
/// configurations. Program counters are left to the CAS transformer.
pub(crate) fn apply_linp(
    ctx: &PostCtx<'_>,
    cfgs: Vec<Cfg>,
    lp: &Linp,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    debug_assert!(lp.cond.is_none(), "guarded CAS linearisations are rejected");
    let mut result = Vec::new();
    for cfg in cfgs {
        let pc = cfg.pc[tid].expect("linearisation on an idle thread");
        let func = ctx
            .prog
            .stmt(pc)
            .func
            .expect("linearisation outside a function");
        if ctx.prog.func(func).has_input() {
            let mut c = cfg;
            fire_lp(ctx, &mut c, func, tid)?;
            result.push(c);
        } else {
            let emitter = cfg.shape.clone();
            result.extend(output_cases(ctx, &cfg, lp.var, emitter, func, tid, false)?);
        }
    }
    Ok(result)
}

// -- input/output assignments ----------------------------------------------

/// Unbind an observer cell: the value it tracked was overwritten.
fn remove_observer_binding(shape: &mut Shape, obs: usize) {
    for i in 0..shape.size() {
        if i != obs {
            shape.set(i, obs, relset::BT);
        }
    }
    let undef = shape.index_undef();
    shape.set(obs, undef, relset::MT);
}

/// `v.data = __in__`: overwriting a data field kills any witness binding the
/// cell carried; a witness argument then re-binds the witness cell to `v`.
pub(super) fn post_read_input(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: VarRef,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let cell = var.cell(&cfg.shape, tid);
    check_deref(cfg, cell)?;
    check_access(ctx, cfg, cell)?;

    let mut result = Vec::new();
    for mut shape in disambiguate(&cfg.shape, cell) {
        for k in 0..shape.size_observers() {
            let obs = shape.index_observer(k);
            if shape.test(cell, obs, Rel::Eq) {
                remove_observer_binding(&mut shape, obs);
            }
        }
        if cfg.inout[tid] == Some(DataValue::Data) {
            // the witness cell now tracks v's cell
            let witness = shape.index_observer(0);
            let bound = shape_assign_var_var(&shape, witness, cell);
            let mut c = next_cfg(ctx, cfg, bound, tid);
            c.own[witness] = c.own[cell];
            result.push(c);
        } else {
            result.push(next_cfg(ctx, cfg, shape, tid));
        }
    }
    Ok(result)
}

/// `__out__ = v.data`: returning a value has no heap effect; the observer
/// event was already fired by the linearisation point.
pub(super) fn post_write_output(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: VarRef,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let cell = var.cell(&cfg.shape, tid);
    check_deref(cfg, cell)?;
    check_access(ctx, cfg, cell)?;
    Ok(vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)])
}
