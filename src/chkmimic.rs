//! CHK-MIMIC: the summary-mode soundness post-pass.
//!
//! Summary mode replaces interference by per-function summaries, which is
//! only sound if every *effectful* concrete step — one that changes the
//! shared projection — is dominated by some application of the enclosing
//! function's summary over shared state. This pass re-derives the post of
//! every stored configuration (after disambiguating the shared rows, in the
//! precise variant) and checks exactly that coverage. Free statements must
//! have no effectful post at all: reclamation is summarised as empty.

use crate::cfg::Cfg;
use crate::encoding::Encoding;
use crate::options::{MemorySetup, Mode, Stats};
use crate::post::{post, PostCtx, Violation};
use crate::prog::StmtKind;
use crate::reduce::disambiguate;
use crate::relset;

/// Shared-projection domination: equal linearizability observer states (the
/// reclamation observer is ignored), cell-wise inclusion on global×global
/// and special×global pairs, and inclusion of the shared-reachability part
/// on observer×global pairs.
pub(crate) fn subset_shared(cc: &Cfg, sc: &Cfg) -> bool {
    if cc.state != sc.state {
        return false;
    }
    let s = &cc.shape;
    let globals = s.offset_globals()..s.offset_locals(0);

    for i in globals.clone() {
        for j in i + 1..globals.end {
            if !cc.shape.at(i, j).subset_of(sc.shape.at(i, j)) {
                return false;
            }
        }
    }
    for i in 0..s.offset_observers() {
        for j in globals.clone() {
            if !cc.shape.at(i, j).subset_of(sc.shape.at(i, j)) {
                return false;
            }
        }
    }
    for i in s.offset_observers()..s.offset_globals() {
        for j in globals.clone() {
            // only the part that makes the observer cell shared-reachable
            let lhs = cc.shape.at(i, j).inter(relset::EQ_MF_GF);
            let rhs = sc.shape.at(i, j).inter(relset::EQ_MF_GF);
            if !lhs.subset_of(rhs) {
                return false;
            }
        }
    }
    true
}

fn check_disambiguated(ctx: &PostCtx<'_>, cfg: &Cfg, stats: &mut Stats) -> Result<(), Violation> {
    let Some(pc) = cfg.pc[0] else {
        return Ok(());
    };
    let stmt = ctx.prog.stmt(pc);
    // neither the init sequence nor the summaries themselves need covering
    if stmt.func.is_none() || stmt.in_summary {
        return Ok(());
    }

    let posts = post(ctx, cfg, 0)?;
    let effectful: Vec<&Cfg> = posts.iter().filter(|c| !subset_shared(c, cfg)).collect();
    if effectful.is_empty() {
        return Ok(());
    }
    stats.summaries_needed += 1;

    if matches!(stmt.kind, StmtKind::Free { .. }) {
        return Err(Violation::SummaryMismatch(
            "a free statement requires a non-empty summary".to_owned(),
        ));
    }

    let func = stmt.func.expect("statement inside a function");
    let summary = ctx
        .prog
        .func(func)
        .summary()
        .expect("summary mode guarantees summaries");
    let mut inst = cfg.clone();
    inst.pc[0] = Some(summary);
    if ctx.prog.func(func).has_output() {
        inst.inout[0] = None;
    }
    let sumpost = post(ctx, &inst, 0)?;

    for p in effectful {
        if !sumpost.iter().any(|s| subset_shared(p, s)) {
            return Err(Violation::SummaryMismatch(
                "failed to mimic a low-level action".to_owned(),
            ));
        }
    }
    Ok(())
}

fn check_rows(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    row: usize,
    stats: &mut Stats,
) -> Result<(), Violation> {
    if cfg.pc[0].is_none() {
        return Ok(());
    }
    if row < cfg.shape.offset_locals(0) {
        for shape in disambiguate(&cfg.shape, row) {
            let tmp = cfg.with_shape(shape);
            check_rows(ctx, &tmp, row + 1, stats)?;
        }
        Ok(())
    } else {
        check_disambiguated(ctx, cfg, stats)
    }
}

/// Certify every stored configuration; an error is the verification verdict.
pub fn chk_mimic(ctx: &PostCtx<'_>, enc: &Encoding, stats: &mut Stats) -> Result<(), Violation> {
    assert_eq!(ctx.opts.mode, Mode::Summary, "CHK-MIMIC only applies to summary mode");
    assert_eq!(
        ctx.opts.msetup,
        MemorySetup::Prf,
        "CHK-MIMIC is defined for PRF semantics"
    );
    for id in enc.iter_ids() {
        let cfg = enc.get(id);
        if ctx.opts.precise_chkmimic {
            check_rows(ctx, cfg, cfg.shape.offset_globals(), stats)?;
        } else {
            check_disambiguated(ctx, cfg, stats)?;
        }
    }
    Ok(())
}
