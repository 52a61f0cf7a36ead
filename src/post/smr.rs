//! SMR operations: hazard pointers, quiescent periods, epochs.
//!
//! Guard statements step the per-cell guard registers of the acting thread's
//! locals. Whether a cell is the published address decides the event payload,
//! so the post first splits the shape until that aliasing is decided.
//! Quiescent-period statements additionally step the configuration-level SMR
//! observer, whose marked states prune interleavings that break the usage
//! contract (e.g. leaving a quiescent period twice).

use crate::cfg::Cfg;
use crate::observer::{DataValue, Event, EventFn};
use crate::prog::VarRef;
use crate::relset::Rel;

use super::mem::split_on_eq_with;
use super::{next_cfg, PostCtx, Violation};

pub(super) fn post_hp_set(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: VarRef,
    index: u8,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let cell = var.cell(&cfg.shape, tid);
    let begin = cfg.shape.offset_locals(tid);
    let end = begin + cfg.shape.size_locals();

    let mut result = Vec::new();
    for shape in split_on_eq_with(&cfg.shape, cell, begin..end) {
        let mut out = next_cfg(ctx, cfg, shape, tid);
        let s = out.shape.clone();
        for j in begin..end {
            // publishing hazard pointer `index` guards the named address and
            // implicitly un-guards whatever it pointed to before; guard
            // registers are tracked relative to their owning thread
            let dval = if s.test(cell, j, Rel::Eq) {
                DataValue::Data
            } else {
                DataValue::Other
            };
            let evt = Event::enter(EventFn::Protect(index), true, dval);
            let slot = if index == 0 { &mut out.guard0[j] } else { &mut out.guard1[j] };
            if let Some(state) = *slot {
                *slot = Some(ctx.smr.next(state, &evt));
            }
        }
        result.push(out);
    }
    Ok(result)
}

pub(super) fn post_hp_release(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    index: u8,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let evt = Event::enter(EventFn::Unprotect(index), true, DataValue::Data);
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    let begin = out.shape.offset_locals(tid);
    let end = begin + out.shape.size_locals();
    for j in begin..end {
        let slot = if index == 0 { &mut out.guard0[j] } else { &mut out.guard1[j] };
        if let Some(state) = *slot {
            *slot = Some(ctx.smr.next(state, &evt));
        }
    }
    Ok(vec![out])
}

/// `enterQ`/`leaveQ`: step the quiescent-period lanes, both per cell and at
/// the configuration level.
pub(super) fn post_quiescent(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    tid: usize,
    enter: bool,
) -> Result<Vec<Cfg>, Violation> {
    let func = if enter { EventFn::EnterQ } else { EventFn::LeaveQ };
    let per_cell = Event::enter(func, true, DataValue::Other);

    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    let begin = out.shape.offset_locals(tid);
    let end = begin + out.shape.size_locals();
    for j in begin..end {
        if let Some(state) = out.guard0[j] {
            out.guard0[j] = Some(ctx.smr.next(state, &per_cell));
        }
        if let Some(state) = out.guard1[j] {
            out.guard1[j] = Some(ctx.smr.next(state, &per_cell));
        }
    }
    let evt = Event::enter(func, tid == 0, DataValue::Other);
    out.smr = out.smr.next(ctx.smr, &evt);
    if out.smr.is_marked(ctx.smr) {
        // the usage invariant rules this interleaving out
        return Ok(Vec::new());
    }
    if out.smr.is_final(ctx.smr) {
        return Err(Violation::SpecViolation {
            state: out.smr.find_final(ctx.smr).to_owned(),
        });
    }
    Ok(vec![out])
}

// -- epochs -----------------------------------------------------------------

pub(super) fn post_set_rec_epoch(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    if out.offender[tid] {
        out.epochsel = out.localepoch[tid];
    }
    vec![out]
}

pub(super) fn post_get_epoch(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    out.localepoch[tid] = out.globalepoch;
    vec![out]
}

pub(super) fn post_inc_epoch(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Vec<Cfg> {
    let mut out = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    out.globalepoch = out.globalepoch.advanced();
    vec![out]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg::{Cfg, Epoch};
    use crate::factory::{ebr_observer, no_reclamation_observer};
    use crate::observer::Observer;
    use crate::options::{MemorySetup, Options};
    use crate::post::post;
    use crate::prog::{
        epoch_cond, fun, get_epoch, if_then_else, inc_epoch, kill, leave_q, Program, StmtKind,
    };
    use crate::shape::Shape;

    fn start(prog: &Program, lin: &Observer, smr: &Observer) -> Cfg {
        let shape = Shape::new(2, prog.num_globals(), prog.num_locals(), 2);
        Cfg::start(shape, lin.initial_state().clone(), smr.initial_state().clone())
    }

    #[test]
    fn epoch_statements_drive_the_clock() {
        let prog = Program::new(
            "Epochs",
            &["G"],
            &["r"],
            vec![],
            vec![fun(
                "work",
                true,
                vec![
                    get_epoch(),
                    inc_epoch(),
                    if_then_else(epoch_cond(), vec![kill("r")], vec![]),
                ],
            )],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("work").unwrap()).entry();

        let c1 = post(&ctx, &cfg, 0).unwrap().pop().unwrap();
        assert_eq!(c1.localepoch[0], c1.globalepoch);

        let c2 = post(&ctx, &c1, 0).unwrap().pop().unwrap();
        assert_eq!(c2.globalepoch, Epoch::One);
        assert_ne!(c2.localepoch[0], c2.globalepoch);

        // the lagging thread takes the true branch
        let c3 = post(&ctx, &c2, 0).unwrap().pop().unwrap();
        let pc = c3.pc[0].expect("true branch entered");
        assert!(matches!(prog.stmt(pc).kind, StmtKind::Kill { .. }));
    }

    #[test]
    fn leaving_the_quiescent_period_twice_is_discarded() {
        let prog = Program::new(
            "Quiesce",
            &["G"],
            &["r"],
            vec![],
            vec![fun("work", true, vec![leave_q(), leave_q()])],
        )
        .unwrap();
        let lin = no_reclamation_observer().unwrap();
        let smr = ebr_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut cfg = start(&prog, &lin, &smr);
        cfg.pc[0] = prog.func(prog.find("work").unwrap()).entry();

        let c1 = post(&ctx, &cfg, 0).unwrap().pop().unwrap();
        assert!(!c1.smr.is_marked(&smr));
        // the second leave drives the invariant lane into the sink
        let out = post(&ctx, &c1, 0).unwrap();
        assert!(out.is_empty(), "marked states prune the interleaving");
    }
}
