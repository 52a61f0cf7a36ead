//! Pointer assignments and the small data-set/record statements.
//!
//! The three assignment shapes have very different weight: `x = y` copies a
//! row, `x = y.next` re-derives the row from scratch and prunes it against
//! the rest of the heap, and `x.next = y` disambiguates the written row,
//! cuts the old successors, and re-relates every predecessor of `x` with
//! every successor of `y` before merging the cases back together.

use crate::cfg::{Cfg, DataSet};
use crate::observer::DataValue;
use crate::options::MemorySetup;
use crate::prog::{Expr, SetOp, VarRef};
use crate::reduce::{
    consistent_at, disambiguate, isolate_partial_concretisation, merge, remove_successors,
};
use crate::relset::{self, Rel, RelSet};
use crate::shape::Shape;

use super::{check_access, check_deref, next_cfg, PostCtx, Violation};

// -- shape transformers -----------------------------------------------------

/// `lhs := rhs` for two registers: copy the row, assert equality.
pub(crate) fn shape_assign_var_var(input: &Shape, lhs: usize, rhs: usize) -> Shape {
    let mut shape = input.clone();
    if lhs == rhs {
        return shape;
    }
    shape.set(lhs, rhs, relset::EQ);
    for i in 0..shape.size() {
        let cell = shape.at(rhs, i);
        shape.set(lhs, i, cell);
    }
    shape
}

/// `lhs := rhs.next`: start from the universal row, then impose `rhs ↦ lhs`
/// and prune until stable.
pub(crate) fn shape_assign_var_next(input: &Shape, lhs: usize, rhs: usize) -> Shape {
    debug_assert_ne!(lhs, rhs, "x = x.next is rejected at construction");
    let mut shape = input.clone();

    shape.set(lhs, shape.index_null(), relset::EQ_MT_GT_BT);
    shape.set(lhs, shape.index_undef(), relset::MT_GT_BT);
    for i in shape.offset_observers()..shape.size() {
        if i != lhs {
            shape.set(lhs, i, relset::PRED);
        }
    }
    shape.set(lhs, shape.index_reuse(), relset::PRED);
    shape.set(rhs, lhs, relset::MT);

    loop {
        let mut changed = false;
        for i in 0..shape.size() {
            if i == rhs {
                continue;
            }
            for rel in shape.at(lhs, i).iter() {
                if !consistent_at(&shape, lhs, i, rel) {
                    shape.remove_relation(lhs, i, rel);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    shape
}

/// `lhs.next := rhs`: disambiguate the written row, refuse cycle creation,
/// cut old successors, re-relate predecessors with the new successors.
pub(crate) fn shape_assign_next_var(
    input: &Shape,
    lhs: usize,
    rhs: usize,
) -> Result<Shape, Violation> {
    let mut cases = Vec::new();
    for mut shape in disambiguate(input, lhs) {
        if shape.at(rhs, lhs).intersects(relset::EQ_MT_GT) {
            return Err(Violation::CycleCreated { x: rhs, y: lhs });
        }
        remove_successors(&mut shape, lhs);

        let pres: Vec<usize> = (0..shape.size())
            .filter(|&u| shape.at(u, lhs).intersects(relset::EQ_MT_GT))
            .collect();
        let succs: Vec<usize> = (0..shape.size())
            .filter(|&v| shape.at(rhs, v).intersects(relset::EQ_MT_GT))
            .collect();
        for &u in &pres {
            for &v in &succs {
                if u == v {
                    continue;
                }
                let ul = shape.at(u, lhs);
                let rv = shape.at(rhs, v);
                let mut cell = RelSet::EMPTY;
                if ul.contains(Rel::Eq) && rv.contains(Rel::Eq) {
                    cell.insert(Rel::Mt);
                }
                if ul.intersects(relset::MT_GT) || rv.intersects(relset::MT_GT) {
                    cell.insert(Rel::Gt);
                }
                if ul.intersects(relset::MF_GF_BT) || rv.intersects(relset::MF_GF_BT) {
                    cell.insert(Rel::Bt);
                }
                shape.set(u, v, cell);
            }
        }
        cases.push(shape);
    }
    Ok(merge(cases).expect("disambiguation yields at least one case"))
}

// -- register bookkeeping ---------------------------------------------------

fn copy_registers(cfg: &mut Cfg, lhs: usize, rhs: usize) {
    cfg.own[lhs] = cfg.own[rhs];
    cfg.valid_ptr[lhs] = cfg.valid_ptr[rhs];
    cfg.valid_next[lhs] = cfg.valid_next[rhs];
    cfg.guard0[lhs] = cfg.guard0[rhs];
    cfg.guard1[lhs] = cfg.guard1[rhs];
}

fn null_registers(cfg: &mut Cfg, lhs: usize) {
    cfg.own[lhs] = false;
    cfg.valid_ptr[lhs] = true;
    cfg.valid_next[lhs] = true;
    cfg.guard0[lhs] = None;
    cfg.guard1[lhs] = None;
}

// -- cfg-level assignment ---------------------------------------------------

/// Execute `lhs := rhs` on `cfg` without advancing the program counter (the
/// CAS transformer re-targets the counter itself).
pub(crate) fn post_assignment(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: Expr,
    rhs: Expr,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let shape = &cfg.shape;
    match (lhs, rhs) {
        (Expr::Var(l), Expr::Var(r)) => {
            let (lc, rc) = (l.cell(shape, tid), r.cell(shape, tid));
            let mut out = cfg.with_shape(shape_assign_var_var(shape, lc, rc));
            copy_registers(&mut out, lc, rc);
            if !l.is_local() {
                // published through a shared variable
                out.own[rc] = false;
                out.own[lc] = false;
            }
            Ok(vec![out])
        }
        (Expr::Var(l), Expr::Null) => {
            let lc = l.cell(shape, tid);
            let mut out = cfg.with_shape(shape_assign_var_var(shape, lc, shape.index_null()));
            null_registers(&mut out, lc);
            Ok(vec![out])
        }
        (Expr::Var(l), Expr::Next(r)) => {
            let (lc, rc) = (l.cell(shape, tid), r.cell(shape, tid));
            check_deref(cfg, rc)?;
            check_access(ctx, cfg, rc)?;
            let mut out = cfg.with_shape(shape_assign_var_next(shape, lc, rc));
            out.own[lc] = false;
            out.valid_ptr[lc] = match ctx.opts.msetup {
                MemorySetup::Gc => true,
                _ => cfg.valid_next[rc],
            };
            out.valid_next[lc] = out.valid_ptr[lc];
            out.guard0[lc] = None;
            out.guard1[lc] = None;
            Ok(vec![out])
        }
        (Expr::Next(l), rhs @ (Expr::Var(_) | Expr::Null)) => {
            let lc = l.cell(shape, tid);
            check_deref(cfg, lc)?;
            check_access(ctx, cfg, lc)?;
            let rc = rhs.cell(shape, tid);
            let mut out = cfg.with_shape(shape_assign_next_var(shape, lc, rc)?);
            let val = match rhs {
                Expr::Null => true,
                _ => ctx.opts.msetup == MemorySetup::Gc || cfg.valid_ptr[rc],
            };
            if val {
                // only definite aliases gain a valid next field
                for i in 0..out.shape.size() {
                    if out.shape.at(i, lc) == relset::EQ {
                        out.valid_next[i] = true;
                    }
                }
            } else {
                for i in 0..out.shape.size() {
                    if out.shape.test(i, lc, Rel::Eq) {
                        out.valid_next[i] = false;
                    }
                }
            }
            if matches!(rhs, Expr::Var(_)) {
                out.own[rc] = false;
            }
            Ok(vec![out])
        }
        (Expr::Next(_), Expr::Next(_)) => {
            unreachable!("next-to-next assignments are rejected at construction")
        }
        (Expr::Null, _) | (_, Expr::Null) => {
            unreachable!("malformed assignment survived construction")
        }
    }
}

pub(super) fn post_assign_stmt(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: Expr,
    rhs: Expr,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let pc = cfg.pc[tid].expect("assignment on an idle thread");
    let next = ctx.prog.next_of(pc);
    let mut result = post_assignment(ctx, cfg, lhs, rhs, tid)?;
    for c in &mut result {
        c.pc[tid] = next;
    }
    Ok(result)
}

pub(super) fn post_set_null(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: Expr,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let pc = cfg.pc[tid].expect("assignment on an idle thread");
    let next = ctx.prog.next_of(pc);
    let mut result = post_assignment(ctx, cfg, lhs, Expr::Null, tid)?;
    for c in &mut result {
        c.pc[tid] = next;
    }
    Ok(result)
}

// -- data sets --------------------------------------------------------------

fn add_to_set(cfg: &mut Cfg, set: u8, val: DataValue, tid: usize) {
    if val == DataValue::Data {
        cfg.dataset_mut(set)[tid] = DataSet::WithData;
    }
}

pub(super) fn post_set_add_arg(ctx: &PostCtx<'_>, cfg: &Cfg, set: u8, tid: usize) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    let val = out.inout[tid].unwrap_or(DataValue::Other);
    add_to_set(&mut out, set, val, tid);
    vec![out]
}

pub(super) fn post_set_add_sel(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    set: u8,
    var: VarRef,
    index: u8,
    tid: usize,
) -> Vec<Cfg> {
    let cell = var.cell(&cfg.shape, tid);
    let reuse = cfg.shape.index_reuse();
    let mut result = Vec::with_capacity(3);

    // the data field is only tracked for the designated record; elsewhere
    // both contents are possible
    if let Some(eq) = isolate_partial_concretisation(&cfg.shape, cell, reuse, relset::EQ) {
        let mut c = next_cfg(ctx, cfg, eq, tid);
        let val = cfg.datasel[index as usize];
        add_to_set(&mut c, set, val, tid);
        result.push(c);
    }
    if let Some(neq) =
        isolate_partial_concretisation(&cfg.shape, cell, reuse, relset::MT_MF_GT_GF_BT)
    {
        let mut with = next_cfg(ctx, cfg, neq.clone(), tid);
        add_to_set(&mut with, set, DataValue::Data, tid);
        result.push(with);
        let mut without = next_cfg(ctx, cfg, neq, tid);
        add_to_set(&mut without, set, DataValue::Other, tid);
        result.push(without);
    }
    result
}

pub(super) fn post_set_combine(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    lhs: u8,
    rhs: u8,
    op: SetOp,
    tid: usize,
) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    let rhs_val = out.dataset(rhs)[tid];
    let slot = &mut out.dataset_mut(lhs)[tid];
    match op {
        SetOp::Assign => *slot = rhs_val,
        SetOp::Minus => {
            if rhs_val == DataSet::WithData {
                *slot = DataSet::WithoutData;
            }
        }
    }
    vec![out]
}

pub(super) fn post_set_clear(ctx: &PostCtx<'_>, cfg: &Cfg, set: u8, tid: usize) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    out.dataset_mut(set)[tid] = DataSet::WithoutData;
    vec![out]
}

// -- reclamation records ----------------------------------------------------

pub(super) fn post_init_rec(ctx: &PostCtx<'_>, cfg: &Cfg, var: VarRef, tid: usize) -> Vec<Cfg> {
    let cell = var.cell(&cfg.shape, tid);
    assert_eq!(
        cell,
        cfg.shape.offset_locals(tid),
        "the record must be bound to the first thread-local variable"
    );
    let shape = if cfg.offender[tid] {
        // the offender's record is the tracked cell
        shape_assign_var_var(&cfg.shape, cfg.shape.index_reuse(), cell)
    } else {
        cfg.shape.clone()
    };
    let mut out = next_cfg(ctx, cfg, shape, tid);
    out.own[cell] = false;
    vec![out]
}

pub(super) fn post_write_rec(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    index: u8,
    from_arg: bool,
    tid: usize,
) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    if out.offender[tid] {
        out.datasel[index as usize] = if from_arg {
            out.inout[tid].unwrap_or(DataValue::Other)
        } else {
            DataValue::Other
        };
    }
    vec![out]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relset::{EQ, GT, MT};

    fn shape3() -> (Shape, usize, usize, usize) {
        let s = Shape::new(0, 3, 0, 2);
        let (a, b, c) = (s.index_global(0), s.index_global(1), s.index_global(2));
        (s, a, b, c)
    }

    #[test]
    fn var_var_copies_the_row() {
        let (mut s, a, b, c) = shape3();
        s.set(b, c, MT);
        s.set(b, s.index_undef(), GT);
        let out = shape_assign_var_var(&s, a, b);
        assert_eq!(out.at(a, b), EQ);
        assert_eq!(out.at(a, c), MT);
        assert_eq!(out.at(a, a), EQ);
        // the source row is untouched
        assert_eq!(out.at(b, c), MT);
    }

    #[test]
    fn var_next_derives_the_successor() {
        let (mut s, a, b, c) = shape3();
        // b ↦ c, c terminal
        s.set(b, c, MT);
        s.set(b, s.index_undef(), GT);
        let out = shape_assign_var_next(&s, a, b);
        assert_eq!(out.at(b, a), MT);
        // a must coincide with c, the only known successor of b
        assert!(out.at(a, c).contains(Rel::Eq));
        assert!(!out.at(a, s.index_null()).contains(Rel::Eq));
    }

    #[test]
    fn next_var_links_and_cuts() {
        let (mut s, a, b, c) = shape3();
        // a ↦ b; now a.next := c
        s.set(a, b, MT);
        s.set(a, s.index_undef(), GT);
        let out = shape_assign_next_var(&s, a, c).expect("no cycle");
        assert_eq!(out.at(a, c), MT);
        assert!(!out.at(a, b).intersects(crate::relset::MT_GT));
    }

    #[test]
    fn next_var_refuses_cycles() {
        let (mut s, a, b, _) = shape3();
        // b reachable from a... and a.next := b's predecessor closes a cycle
        s.set(a, b, MT);
        s.set(a, s.index_undef(), GT);
        // b.next := a would close the loop
        let err = shape_assign_next_var(&s, b, a).unwrap_err();
        assert!(matches!(err, Violation::CycleCreated { .. }));
    }

    use crate::factory::no_reclamation_observer;
    use crate::observer::Observer;
    use crate::options::{MemorySetup, Options};
    use crate::post::post;
    use crate::prog::{
        fun, init_rec, mllc, set_add_arg, set_add_sel, set_clear, set_combine, write_rec, Program,
    };

    fn start(prog: &Program, lin: &Observer, smr: &Observer) -> Cfg {
        let shape = Shape::new(2, prog.num_globals(), prog.num_locals(), 2);
        Cfg::start(shape, lin.initial_state().clone(), smr.initial_state().clone())
    }

    #[test]
    fn data_sets_fold_through_the_operations() {
        let prog = Program::new(
            "Sets",
            &["G"],
            &["r"],
            vec![],
            vec![fun(
                "s",
                true,
                vec![
                    set_add_arg(0),
                    set_combine(1, 0, SetOp::Assign),
                    set_combine(0, 1, SetOp::Minus),
                    set_clear(1),
                ],
            )],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("s").unwrap()).entry();
        cfg.inout[0] = Some(DataValue::Data);

        let c1 = post(&ctx, &cfg, 0).unwrap().pop().unwrap();
        assert_eq!(c1.dataset0[0], DataSet::WithData);
        let c2 = post(&ctx, &c1, 0).unwrap().pop().unwrap();
        assert_eq!(c2.dataset1[0], DataSet::WithData);
        let c3 = post(&ctx, &c2, 0).unwrap().pop().unwrap();
        assert_eq!(c3.dataset0[0], DataSet::WithoutData);
        let c4 = post(&ctx, &c3, 0).unwrap().pop().unwrap();
        assert_eq!(c4.dataset1[0], DataSet::WithoutData);
    }

    #[test]
    fn the_tracked_record_carries_its_data_field() {
        let prog = Program::new(
            "Records",
            &["G"],
            &["r"],
            vec![],
            vec![fun(
                "w",
                true,
                vec![
                    mllc("r"),
                    init_rec("r"),
                    write_rec(0, true),
                    set_add_sel(1, "r", 0),
                ],
            )],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("w").unwrap()).entry();
        cfg.inout[0] = Some(DataValue::Data);
        cfg.offender[0] = true;

        let c1 = post(&ctx, &cfg, 0).unwrap().pop().unwrap();
        let c2 = post(&ctx, &c1, 0).unwrap().pop().unwrap();
        // the record is now the tracked cell
        let r = c2.shape.index_local(0, 0);
        assert_eq!(c2.shape.at(c2.shape.index_reuse(), r), EQ);
        let c3 = post(&ctx, &c2, 0).unwrap().pop().unwrap();
        assert_eq!(c3.datasel[0], DataValue::Data);
        // reading the tracked record's field is decided, not split
        let mut out = post(&ctx, &c3, 0).unwrap();
        assert_eq!(out.len(), 1);
        let c4 = out.pop().unwrap();
        assert_eq!(c4.dataset1[0], DataSet::WithData);
    }
}
