//! Structural statements: atomic blocks, prophecies, havoc.

use crate::cfg::Cfg;
use crate::prog::{StmtId, VarRef};
use crate::relset;

use super::{next_cfg, PostCtx, Violation};

/// Run the block to completion on a private worklist; interference cannot
/// observe the intermediate states.
pub(super) fn post_atomic(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    pc: StmtId,
    body: Option<StmtId>,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let exit = ctx.prog.next_of(pc);
    let mut entry = cfg.with_shape(cfg.shape.clone());
    entry.pc[tid] = body;
    let mut work = vec![entry];
    let mut result = Vec::new();
    while let Some(c) = work.pop() {
        if c.pc[tid].is_none() {
            // ran off the end of the block
            let mut done = c;
            done.pc[tid] = exit;
            result.push(done);
        } else {
            work.extend(super::post(ctx, &c, tid)?);
        }
    }
    Ok(result)
}

/// Nondeterministically pre-decide a later branch.
pub(super) fn post_oracle(ctx: &PostCtx<'_>, cfg: &Cfg, tid: usize) -> Vec<Cfg> {
    let mut fulfilled = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    fulfilled.oracle[tid] = true;
    let mut wrong = next_cfg(ctx, cfg, cfg.shape.clone(), tid);
    wrong.oracle[tid] = false;
    vec![fulfilled, wrong]
}

/// Keep only the executions whose prophecy matches.
pub(super) fn post_check_prophecy(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    expect: bool,
    tid: usize,
) -> Vec<Cfg> {
    if cfg.oracle[tid] == expect {
        vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)]
    } else {
        Vec::new()
    }
}

/// Havoc a register, or filter executions with a pending output value for
/// the confused variant.
pub(super) fn post_kill(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    var: Option<VarRef>,
    tid: usize,
) -> Vec<Cfg> {
    let Some(v) = var else {
        if cfg.inout[tid].is_some() {
            return Vec::new();
        }
        return vec![next_cfg(ctx, cfg, cfg.shape.clone(), tid)];
    };
    let cell = v.cell(&cfg.shape, tid);
    let mut shape = cfg.shape.clone();
    for i in 0..shape.size() {
        if i != cell {
            shape.set(cell, i, relset::BT);
        }
    }
    shape.set(cell, shape.index_undef(), relset::MT);
    let mut out = next_cfg(ctx, cfg, shape, tid);
    out.own[cell] = true;
    out.valid_ptr[cell] = false;
    out.valid_next[cell] = false;
    out.guard0[cell] = None;
    out.guard1[cell] = None;
    vec![out]
}
