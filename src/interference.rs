//! Interference: one step of another thread against a configuration.
//!
//! Candidates are unordered pairs from the same encoding bucket whose shared
//! projections are compatible. The victim's shape is extended by the
//! interferer's thread-local block, correlated through the pointwise
//! intersection of the common cells, the interferer executes a single step
//! on the transient third thread, and the result is projected back to two
//! threads. The extension is scoped: the shape always shrinks on the way
//! out, whatever the step produced.

use tracing::debug;

use crate::cfg::Cfg;
use crate::encoding::Encoding;
use crate::fixpoint::{project_to_two_threads, sequential_post, RemainingWork};
use crate::observer::colors_clash;
use crate::options::Stats;
use crate::post::{PostCtx, Violation};
use crate::prog::StmtKind;
use crate::reduce::make_concretisation;
use crate::relset;

/// Statements with no observable effect; their holders cannot interfere.
fn is_noop(ctx: &PostCtx<'_>, pc: Option<crate::prog::StmtId>) -> bool {
    if !ctx.opts.skip_noops {
        return false;
    }
    let Some(id) = pc else {
        return false;
    };
    match ctx.prog.stmt(id).kind {
        StmtKind::Break | StmtKind::Loop { .. } => true,
        StmtKind::Kill { .. } => ctx.opts.kill_is_noop,
        _ => false,
    }
}

/// Pointwise compatibility of the shared + observed-thread sub-shapes.
fn shapes_match(victim: &Cfg, interferer: &Cfg) -> bool {
    let end = victim.shape.offset_locals(1);
    for i in 0..end {
        for j in i + 1..end {
            if victim
                .shape
                .at(i, j)
                .inter(interferer.shape.at(i, j))
                .is_empty()
            {
                return false;
            }
        }
    }
    true
}

/// Coarse filter for interference candidates; the per-direction idle check
/// lives in `mk_one_interference`.
pub(crate) fn can_interfere(ctx: &PostCtx<'_>, victim: &Cfg, interferer: &Cfg) -> bool {
    if victim.pc[1].is_none() && interferer.pc[1].is_none() {
        return false;
    }
    if is_noop(ctx, victim.pc[0])
        || is_noop(ctx, victim.pc[1])
        || is_noop(ctx, interferer.pc[0])
        || is_noop(ctx, interferer.pc[1])
    {
        return false;
    }

    // global information must coincide
    if victim.state != interferer.state || victim.smr != interferer.smr {
        return false;
    }
    if victim.globalepoch != interferer.globalepoch
        || victim.epochsel != interferer.epochsel
        || victim.datasel != interferer.datasel
    {
        return false;
    }

    // the observed thread must coincide
    if victim.pc[0] != interferer.pc[0] || victim.inout[0] != interferer.inout[0] {
        return false;
    }
    if victim.dataset0[0] != interferer.dataset0[0]
        || victim.dataset1[0] != interferer.dataset1[0]
        || victim.dataset2[0] != interferer.dataset2[0]
    {
        return false;
    }

    // colored guard states must not co-occur in victim and interferer
    let begin = victim.shape.offset_locals(1);
    let end = begin + victim.shape.size_locals();
    for i in begin..end {
        for j in begin..end {
            if colors_clash(ctx.smr, victim.guard0[i], interferer.guard0[j])
                || colors_clash(ctx.smr, victim.guard1[i], interferer.guard1[j])
            {
                return false;
            }
        }
    }

    shapes_match(victim, interferer)
}

/// Build the three-thread configuration combining `victim` with the
/// interferer's second thread; `None` when the correlation is inconsistent.
fn extend_cfg(victim: &Cfg, interferer: &Cfg) -> Option<Cfg> {
    let mut shape = victim.shape.clone();
    let old_size = shape.size();
    shape.extend();

    // correlate the common region through intersection
    let end = victim.shape.offset_locals(1);
    for i in 0..end {
        for j in i + 1..end {
            let both = victim.shape.at(i, j).inter(interferer.shape.at(i, j));
            shape.set(i, j, both);
        }
    }

    // import the interferer's locals
    let locals = shape.size_locals();
    let src_base = interferer.shape.offset_locals(1);
    for i in 0..locals {
        let src_col = src_base + i;
        let dst_col = old_size + i;
        for j in i..locals {
            let cell = interferer.shape.at(src_base + j, src_col);
            shape.set(old_size + j, dst_col, cell);
        }
        for j in 0..end {
            let cell = interferer.shape.at(j, src_col);
            shape.set(j, dst_col, cell);
        }
        // nothing relates the two local blocks a priori
        for j in victim.shape.offset_locals(1)..old_size {
            shape.set(j, dst_col, relset::PRED);
        }
    }

    if !make_concretisation(&mut shape) {
        return None;
    }

    let mut out = victim.with_shape(shape);
    out.pc[2] = interferer.pc[1];
    out.inout[2] = interferer.inout[1];
    out.oracle[2] = interferer.oracle[1];
    out.offender[2] = interferer.offender[1];
    out.localepoch[2] = interferer.localepoch[1];
    out.dataset0[2] = interferer.dataset0[1];
    out.dataset1[2] = interferer.dataset1[1];
    out.dataset2[2] = interferer.dataset2[1];
    for i in 0..locals {
        let src = src_base + i;
        let dst = out.shape.offset_locals(2) + i;
        out.own[dst] = interferer.own[src];
        out.valid_ptr[dst] = interferer.valid_ptr[src];
        out.valid_next[dst] = interferer.valid_next[src];
        out.guard0[dst] = interferer.guard0[src];
        out.guard1[dst] = interferer.guard1[src];
    }
    Some(out)
}

/// Let the interferer's thread take one step against the victim.
fn mk_one_interference(
    ctx: &PostCtx<'_>,
    victim: &Cfg,
    interferer: &Cfg,
    stats: &mut Stats,
) -> Result<Vec<Cfg>, Violation> {
    if interferer.pc[1].is_none() {
        // an idle thread has no step to inject
        return Ok(Vec::new());
    }
    let Some(extended) = extend_cfg(victim, interferer) else {
        return Ok(Vec::new());
    };
    stats.interference_steps += 1;

    let mut result = sequential_post(ctx, &extended, 2)?;
    for cfg in &mut result {
        project_to_two_threads(cfg);
    }
    Ok(result)
}

/// One interference pass over the whole encoding.
pub(crate) fn mk_all_interference(
    ctx: &PostCtx<'_>,
    enc: &mut Encoding,
    work: &mut RemainingWork,
    stats: &mut Stats,
) -> Result<(), Violation> {
    let buckets = enc.bucket_ids();
    debug!(buckets = buckets.len(), "interference pass");
    let mut steps = 0usize;

    for bucket in buckets {
        for (n, &a_id) in bucket.iter().enumerate() {
            for &b_id in &bucket[n..] {
                let a = enc.get(a_id).clone();
                let b = enc.get(b_id).clone();
                if !can_interfere(ctx, &a, &b) {
                    stats.interference_skipped += 1;
                    continue;
                }
                let forward = mk_one_interference(ctx, &a, &b, stats)?;
                work.add_all(enc, forward);
                let backward = mk_one_interference(ctx, &b, &a, stats)?;
                work.add_all(enc, backward);
                steps += 2;
            }
        }
    }
    debug!(steps, encoding = enc.size(), "interference pass done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{coarse_queue, no_reclamation_observer, queue_observer};
    use crate::fixpoint::mk_init_cfg;
    use crate::observer::DataValue;
    use crate::options::{MemorySetup, Options};

    #[test]
    fn interference_candidates_agree_on_the_observed_thread() {
        let prog = coarse_queue(false).unwrap();
        let lin = queue_observer(&prog).unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let base = mk_init_cfg(&ctx).unwrap();
        let mut a = base.clone();
        a.pc[1] = prog.func(prog.find("enq").unwrap()).entry();
        let b = a.clone();
        assert!(can_interfere(&ctx, &a, &b));

        // a different pending input on the observed thread disqualifies
        let mut c = a.clone();
        c.inout[0] = Some(DataValue::Data);
        assert!(!can_interfere(&ctx, &a, &c));

        // disjoint shared shapes disqualify
        let mut d = a.clone();
        let (h, t) = (d.shape.index_global(0), d.shape.index_global(1));
        d.shape.set(h, t, crate::relset::BT);
        assert!(!can_interfere(&ctx, &a, &d));
    }

    #[test]
    fn extension_and_projection_are_scoped() {
        let prog = coarse_queue(false).unwrap();
        let lin = queue_observer(&prog).unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let base = mk_init_cfg(&ctx).unwrap();
        let mut interferer = base.clone();
        interferer.pc[1] = prog.func(prog.find("enq").unwrap()).entry();
        interferer.inout[1] = Some(DataValue::Other);

        let extended = extend_cfg(&base, &interferer).expect("compatible shapes");
        assert_eq!(extended.shape.num_threads(), 3);
        assert_eq!(extended.pc[2], interferer.pc[1]);
        assert_eq!(extended.inout[2], Some(DataValue::Other));

        let mut stats = Stats::default();
        let results = mk_one_interference(&ctx, &base, &interferer, &mut stats).unwrap();
        assert!(stats.interference_steps > 0);
        for cfg in &results {
            // every result is projected back to two threads
            assert_eq!(cfg.shape.num_threads(), 2);
            assert_eq!(cfg.pc[2], None);
        }
    }
}
