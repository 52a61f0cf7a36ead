//! ABA-awareness: vetting the revalidation of dangling pointers.
//!
//! A condition `x == y` with exactly one valid side is *ABA-prone*: the post
//! image revalidates the dangling side on success, which is only harmless if
//! a success caused by reclamation-and-reuse cannot be told apart from a
//! genuine one. This analysis re-examines every stored configuration at such
//! a condition, with the reuse alias explicitly forbidden, and demands that
//! (a) every continuation that retries arrives back at the condition in an
//! equivalent state, and (b) no continuation that gives up could also have
//! taken the success branch. A failure is a *malicious* ABA.

use crate::cfg::Cfg;
use crate::encoding::Encoding;
use crate::post::{post, PostCtx, Violation};
use crate::prog::{Cond, Expr, StmtId, StmtKind};
use crate::reduce::{make_concretisation, merge};
use crate::relset::Rel;
use crate::shape::Shape;

struct AbaSite {
    ite: StmtId,
    next_true: Option<StmtId>,
    next_false: Option<StmtId>,
    /// Cell of the (local) register participating in the comparison.
    var: usize,
    /// Cell of the valid side it is compared against.
    cmp: usize,
}

/// Whether `cfg` sits at an ABA-prone comparison: an equality (or CAS)
/// between a stale local register and a valid shared one, without age
/// fields. Other comparison patterns are outside this analysis and skipped.
fn is_aba_prone(ctx: &PostCtx<'_>, cfg: &Cfg) -> Option<AbaSite> {
    let pc = cfg.pc[0]?;
    let StmtKind::Ite { cond, next_true, next_false, .. } = &ctx.prog.stmt(pc).kind else {
        return None;
    };
    let (lhs, rhs) = match cond {
        Cond::EqNeq { lhs, rhs, neg: false, with_age: false } => (*lhs, *rhs),
        Cond::Cas(cas) if !cas.with_age => (cas.dst, cas.cmp),
        _ => return None,
    };
    let (Expr::Var(a), Expr::Var(b)) = (lhs, rhs) else {
        return None;
    };
    if a.is_local() == b.is_local() {
        // no shared side to re-read against
        return None;
    }
    let ac = a.cell(&cfg.shape, 0);
    let bc = b.cell(&cfg.shape, 0);
    let (var, cmp) = if a.is_local() { (ac, bc) } else { (bc, ac) };
    if cfg.valid_ptr[var] || !cfg.valid_ptr[cmp] {
        // only a stale local compared against a live shared pointer is prone
        return None;
    }
    Some(AbaSite {
        ite: pc,
        next_true: *next_true,
        next_false: *next_false,
        var,
        cmp,
    })
}

/// Forbid the reuse alias for the given cells; `None` if that leaves no heap.
fn prune_reuse(cfg: &Cfg, cells: [usize; 2]) -> Option<Cfg> {
    let mut out = cfg.clone();
    let reuse = out.shape.index_reuse();
    for cell in cells {
        out.shape.remove_relation(cell, reuse, Rel::Eq);
    }
    if make_concretisation(&mut out.shape) {
        Some(out)
    } else {
        None
    }
}

/// Inclusion of every non-local cell.
fn shared_shape_inclusion(shape: &Shape, other: &Shape) -> bool {
    let end = shape.offset_locals(0);
    for i in 0..end {
        for j in i + 1..end {
            if !shape.at(i, j).subset_of(other.at(i, j)) {
                return false;
            }
        }
    }
    true
}

/// Skip pure control statements (the analysis never rests on them).
fn skip_control(ctx: &PostCtx<'_>, cfg: &mut Cfg) {
    while let Some(id) = cfg.pc[0] {
        match &ctx.prog.stmt(id).kind {
            StmtKind::Break => cfg.pc[0] = ctx.prog.next_of(id),
            StmtKind::Loop { body, .. } => cfg.pc[0] = Some(*body),
            _ => break,
        }
    }
}

/// Execute the failing branch to its end: configurations that come back to
/// the comparison (retry) and configurations that leave (no retry).
///
/// Every cycle in the function body is expected to pass the comparison; a
/// path cycling without revisiting it would void the retry argument and is
/// a loud failure.
fn continuations(
    ctx: &PostCtx<'_>,
    site: &AbaSite,
    aba: &Cfg,
) -> Result<(Vec<Cfg>, Vec<Cfg>), Violation> {
    let mut worklist: Vec<(Cfg, Vec<StmtId>)> = post(ctx, aba, 0)?
        .into_iter()
        .filter(|c| c.pc[0] == site.next_false)
        .map(|c| (c, Vec::new()))
        .collect();
    let mut retry = Vec::new();
    let mut noretry = Vec::new();

    while let Some((mut c, mut trail)) = worklist.pop() {
        skip_control(ctx, &mut c);
        // the continuation is thread-local; a changed shared state would
        // invalidate the whole argument
        assert!(
            shared_shape_inclusion(&c.shape, &aba.shape),
            "ABA continuation modified the shared state"
        );
        match c.pc[0] {
            None => noretry.push(c),
            Some(id) if id == site.ite => retry.push(c),
            Some(id) => {
                assert!(
                    !trail.contains(&id),
                    "ABA continuation cycles without revisiting the comparison"
                );
                trail.push(id);
                for succ in post(ctx, &c, 0)? {
                    worklist.push((succ, trail.clone()));
                }
            }
        }
    }
    Ok((retry, noretry))
}

/// Every retry must arrive back in a state equivalent to the original one,
/// with the participating register revalidated.
fn chk_retry(retry: &[Cfg], aba: &Cfg, var: usize) -> Result<(), Violation> {
    for cfg in retry {
        let mut reasons: Vec<&str> = Vec::new();
        if !shared_shape_inclusion(&cfg.shape, &aba.shape) {
            reasons.push("non-local shape mismatch");
        }
        if aba.freed != cfg.freed || aba.retired != cfg.retired {
            reasons.push("reclamation flags mismatch");
        }
        if aba.state != cfg.state || aba.smr != cfg.smr {
            reasons.push("observer state mismatch");
        }
        if aba.seen != cfg.seen {
            reasons.push("witness bookkeeping mismatch");
        }
        if aba.inout[0] != cfg.inout[0] {
            reasons.push("pending event value mismatch");
        }
        // prophecy registers are re-drawn on every attempt and deliberately
        // not compared
        if aba.own != cfg.own {
            reasons.push("ownership mismatch");
        }
        let begin = cfg.shape.offset_locals(0);
        for i in begin..cfg.shape.size() {
            if i == var {
                continue;
            }
            if aba.valid_ptr[i] != cfg.valid_ptr[i] || aba.valid_next[i] != cfg.valid_next[i] {
                reasons.push("validity mismatch on an uninvolved register");
                break;
            }
        }
        for i in begin..cfg.shape.size() {
            if i == var {
                continue;
            }
            if aba.guard0[i] != cfg.guard0[i] || aba.guard1[i] != cfg.guard1[i] {
                reasons.push("guard state mismatch on an uninvolved register");
                break;
            }
        }
        if !cfg.valid_ptr[var] || !cfg.valid_next[var] {
            reasons.push("the compared register is not re-validated");
        }
        if aba.guard0[var] != cfg.guard0[var] || aba.guard1[var] != cfg.guard1[var] {
            reasons.push("guard state change on the compared register");
        }
        if !reasons.is_empty() {
            return Err(Violation::MaliciousAba(format!(
                "retrying configuration failed: {}",
                reasons.join(", ")
            )));
        }
    }
    Ok(())
}

/// No configuration that gives up may still fit the merged success shapes:
/// an escape is only legitimate when the success branch was impossible.
fn chk_noretry(
    ctx: &PostCtx<'_>,
    enc: &Encoding,
    site: &AbaSite,
    noretry: &[Cfg],
) -> Result<(), Violation> {
    let mut success_shapes = Vec::new();
    for id in enc.iter_ids() {
        let ec = enc.get(id);
        if ec.pc[0] != Some(site.ite) {
            continue;
        }
        for c in post(ctx, ec, 0)? {
            if c.pc[0] == site.next_true {
                success_shapes.push(c.shape);
            }
        }
    }
    let Some(success) = merge(success_shapes) else {
        return Ok(());
    };
    for cfg in noretry {
        if shared_shape_inclusion(&cfg.shape, &success) {
            return Err(Violation::MaliciousAba(
                "non-retrying configuration could have taken the success branch".to_owned(),
            ));
        }
    }
    Ok(())
}

/// Check every ABA-prone comparison in the fixpoint; returns how many were
/// examined.
pub fn chk_aba_awareness(ctx: &PostCtx<'_>, enc: &Encoding) -> Result<usize, Violation> {
    let mut examined = 0usize;
    for id in enc.iter_ids() {
        let cfg = enc.get(id);
        let Some(site) = is_aba_prone(ctx, cfg) else {
            continue;
        };
        let Some(aba) = prune_reuse(cfg, [site.var, site.cmp]) else {
            continue;
        };
        let (retry, noretry) = continuations(ctx, &site, &aba)?;
        chk_retry(&retry, &aba, site.var)?;
        chk_noretry(ctx, enc, &site, &noretry)?;
        examined += 1;
    }
    Ok(examined)
}
