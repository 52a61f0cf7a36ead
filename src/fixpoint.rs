//! The fixpoint driver.
//!
//! Starting from the initial configuration (init sequence executed on an
//! otherwise idle system), the driver exhausts a worklist of sequential post
//! images — statement steps, function invocations for idle threads, and the
//! reclamation adversary — and then accounts for concurrency: in
//! interference mode by pairwise interference over the encoding's buckets,
//! in summary mode by one summary step per function (with CHK-MIMIC run
//! afterwards to certify the summaries).

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::cfg::{Cfg, DataSet, Epoch};
use crate::chkmimic;
use crate::encoding::{CfgId, Encoding};
use crate::observer::{DataValue, Event, Observer};
use crate::options::{Mode, Options, Stats};
use crate::post::{post, post_reclaim, PostCtx, Violation};
use crate::prog::{Program, StmtKind};
use crate::shape::Shape;

/// Result of a fixpoint run: the explored state space and the counters.
pub struct Fixpoint {
    pub encoding: Encoding,
    pub stats: Stats,
}

/// The worklist: ids of configurations whose posts are still owed.
#[derive(Default)]
pub struct RemainingWork {
    work: BTreeSet<CfgId>,
}

impl RemainingWork {
    pub fn add(&mut self, enc: &mut Encoding, cfg: Cfg) {
        let (grew, id) = enc.take(cfg);
        if grew {
            self.work.insert(id);
        }
    }

    pub fn add_all(&mut self, enc: &mut Encoding, cfgs: Vec<Cfg>) {
        for cfg in cfgs {
            self.add(enc, cfg);
        }
    }

    pub fn pop(&mut self) -> Option<CfgId> {
        self.work.pop_first()
    }

    pub fn is_empty(&self) -> bool {
        self.work.is_empty()
    }

    pub fn len(&self) -> usize {
        self.work.len()
    }
}

/// Advance the counter past statements whose post is the identity.
fn filter_pc(ctx: &PostCtx<'_>, cfg: &mut Cfg, tid: usize) -> bool {
    let Some(pc) = cfg.pc[tid] else {
        return false;
    };
    match &ctx.prog.stmt(pc).kind {
        StmtKind::Break => {
            cfg.pc[tid] = ctx.prog.next_of(pc);
            true
        }
        StmtKind::Loop { body, .. } => {
            cfg.pc[tid] = Some(*body);
            true
        }
        _ => false,
    }
}

/// Fire the exit event of a returning call; `false` discards the execution
/// (a marked observer state was entered).
fn fire_exit(ctx: &PostCtx<'_>, cfg: &mut Cfg, tid: usize) -> bool {
    // guard registers are tracked relative to their owning thread
    let per_cell = Event::exit(true);
    let begin = cfg.shape.offset_locals(tid);
    let end = begin + cfg.shape.size_locals();
    for j in begin..end {
        if let Some(state) = cfg.guard0[j] {
            cfg.guard0[j] = Some(ctx.smr.next(state, &per_cell));
        }
        if let Some(state) = cfg.guard1[j] {
            cfg.guard1[j] = Some(ctx.smr.next(state, &per_cell));
        }
    }
    cfg.smr = cfg.smr.next(ctx.smr, &Event::exit(tid == 0));
    !cfg.smr.is_marked(ctx.smr)
}

/// One sequential step of thread `tid`: statement post plus the noop filter
/// and return handling. Shared with the auxiliary analyses.
pub(crate) fn sequential_post(
    ctx: &PostCtx<'_>,
    cfg: &Cfg,
    tid: usize,
) -> Result<Vec<Cfg>, Violation> {
    let mut result = Vec::new();
    for mut pcf in post(ctx, cfg, tid)? {
        while filter_pc(ctx, &mut pcf, tid) {}
        if pcf.pc[tid].is_none() {
            if !fire_exit(ctx, &mut pcf, tid) {
                continue;
            }
            pcf.inout[tid] = None;
        }
        result.push(pcf);
    }
    Ok(result)
}

/// Input values a fresh call may receive: the witness at most once.
fn possible_args(cfg: &Cfg) -> Vec<DataValue> {
    if cfg.seen {
        vec![DataValue::Other]
    } else {
        vec![DataValue::Data, DataValue::Other]
    }
}

fn mk_tid_post(
    ctx: &PostCtx<'_>,
    result: &mut Vec<Cfg>,
    cfg: &Cfg,
    tid: usize,
) -> Result<(), Violation> {
    if cfg.pc[tid].is_some() {
        result.extend(sequential_post(ctx, cfg, tid)?);
        return Ok(());
    }
    // idle thread: invoke every function with every admissible input
    for (_, f) in ctx.prog.funcs() {
        let args = if f.has_input() {
            possible_args(cfg)
        } else {
            vec![DataValue::Other]
        };
        for arg in args {
            let mut c = cfg.clone();
            c.pc[tid] = f.entry();
            if f.has_input() {
                c.inout[tid] = Some(arg);
                if arg == DataValue::Data {
                    c.seen = true;
                }
            } else {
                c.inout[tid] = None;
            }
            while filter_pc(ctx, &mut c, tid) {}
            if c.pc[tid].is_none() {
                // an empty body returns immediately
                if !fire_exit(ctx, &mut c, tid) {
                    continue;
                }
                c.inout[tid] = None;
            }
            result.push(c);
        }
    }
    Ok(())
}

/// All sequential successors of `cfg`: both threads plus the reclamation
/// adversary.
pub(crate) fn mk_all_post(ctx: &PostCtx<'_>, cfg: &Cfg) -> Result<Vec<Cfg>, Violation> {
    let mut result = Vec::new();
    mk_tid_post(ctx, &mut result, cfg, 0)?;
    mk_tid_post(ctx, &mut result, cfg, 1)?;
    for tid in 0..2 {
        result.extend(post_reclaim(ctx, cfg, tid)?);
    }
    Ok(result)
}

/// Execute the init sequence to produce the starting configuration.
pub(crate) fn mk_init_cfg(ctx: &PostCtx<'_>) -> Result<Cfg, Violation> {
    let shape = Shape::new(2, ctx.prog.num_globals(), ctx.prog.num_locals(), 2);
    let mut init = Cfg::start(
        shape,
        ctx.lin.initial_state().clone(),
        ctx.smr.initial_state().clone(),
    );
    init.pc[0] = ctx.prog.init_entry();
    while filter_pc(ctx, &mut init, 0) {}
    while init.pc[0].is_some() {
        let mut posts = post(ctx, &init, 0)?;
        assert_eq!(posts.len(), 1, "the init sequence must be deterministic");
        init = posts.pop().expect("one post image");
        while filter_pc(ctx, &mut init, 0) {}
    }
    Ok(init)
}

// -- summary step -----------------------------------------------------------

/// Reset the transient third thread slot after a summary or interference
/// step and drop the extension block.
pub(crate) fn project_to_two_threads(cfg: &mut Cfg) {
    cfg.reset_locals(2);
    cfg.pc[2] = None;
    cfg.inout[2] = None;
    cfg.oracle[2] = false;
    cfg.offender[2] = false;
    cfg.localepoch[2] = Epoch::Zero;
    cfg.dataset0[2] = DataSet::WithoutData;
    cfg.dataset1[2] = DataSet::WithoutData;
    cfg.dataset2[2] = DataSet::WithoutData;
    cfg.shape.shrink();
}

/// Admit a fresh third thread whose locals are all undefined.
fn extend_with_fresh_thread(cfg: &Cfg) -> Cfg {
    let mut out = cfg.clone();
    out.shape.extend();
    let begin = out.shape.offset_locals(2);
    let end = begin + out.shape.size_locals();
    let undef = out.shape.index_undef();
    for i in begin..end {
        out.shape.set(i, undef, crate::relset::MT);
    }
    out.reset_locals(2);
    out
}

/// One summary step per function: the summary runs atomically on a transient
/// third thread, whose locals are projected away afterwards.
fn mk_summary(ctx: &PostCtx<'_>, cfg: &Cfg) -> Result<Vec<Cfg>, Violation> {
    let mut result = Vec::new();
    for (_, f) in ctx.prog.funcs() {
        let summary = f
            .summary()
            .unwrap_or_else(|| panic!("missing summary for function '{}'", f.name()));
        let args = if f.has_input() {
            possible_args(cfg)
        } else {
            vec![DataValue::Other]
        };
        for arg in args {
            let mut ext = extend_with_fresh_thread(cfg);
            ext.pc[2] = Some(summary);
            if f.has_input() {
                ext.inout[2] = Some(arg);
                if arg == DataValue::Data {
                    ext.seen = true;
                }
            } else {
                ext.inout[2] = None;
            }
            for mut done in post(ctx, &ext, 2)? {
                debug_assert!(done.pc[2].is_none(), "summaries are single atomic blocks");
                if !fire_exit(ctx, &mut done, 2) {
                    continue;
                }
                project_to_two_threads(&mut done);
                result.push(done);
            }
        }
    }
    Ok(result)
}

// -- driver -----------------------------------------------------------------

/// Compute the fixpoint of the abstract transition system.
pub fn fixed_point(
    prog: &Program,
    lin: &Observer,
    smr: &Observer,
    opts: &Options,
) -> Result<Fixpoint, Violation> {
    let ctx = PostCtx { prog, lin, smr, opts };
    let mut enc = Encoding::new(opts.merge_valid_ptr, opts.ad_hoc_precision);
    let mut stats = Stats::default();
    let mut work = RemainingWork::default();

    if opts.mode == Mode::Summary {
        for (_, f) in prog.funcs() {
            assert!(
                f.summary().is_some(),
                "summary mode requires a summary for '{}'",
                f.name()
            );
        }
    }

    work.add(&mut enc, mk_init_cfg(&ctx)?);

    match opts.mode {
        Mode::Summary => {
            info!("computing combined post with summaries");
            let mut iterations = 0usize;
            while let Some(id) = work.pop() {
                let cfg = enc.get(id).clone();
                stats.sequential_steps += 1;
                let posts = mk_all_post(&ctx, &cfg)?;
                work.add_all(&mut enc, posts);
                let sums = mk_summary(&ctx, &cfg)?;
                work.add_all(&mut enc, sums);
                iterations += 1;
                if iterations % 1000 == 0 {
                    debug!(iterations, encoding = enc.size(), pending = work.len());
                }
            }
            info!(encoding = enc.size(), iterations, "fixpoint reached");

            info!("running CHK-MIMIC");
            chkmimic::chk_mimic(&ctx, &enc, &mut stats)?;
            info!(effects = stats.summaries_needed, "summaries proven sound");
        }
        Mode::Interference => {
            loop {
                let mut iterations = 0usize;
                while let Some(id) = work.pop() {
                    let cfg = enc.get(id).clone();
                    stats.sequential_steps += 1;
                    let posts = mk_all_post(&ctx, &cfg)?;
                    work.add_all(&mut enc, posts);
                    iterations += 1;
                    if iterations % 10000 == 0 {
                        debug!(iterations, encoding = enc.size());
                    }
                }
                debug!(encoding = enc.size(), iterations, "sequential post quiescent");

                crate::interference::mk_all_interference(&ctx, &mut enc, &mut work, &mut stats)?;
                if work.is_empty() {
                    break;
                }
            }
            info!(
                encoding = enc.size(),
                buckets = enc.bucket_count(),
                "fixpoint reached"
            );
        }
    }

    Ok(Fixpoint { encoding: enc, stats })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::factory::{coarse_queue, no_reclamation_observer, queue_observer};
    use crate::options::MemorySetup;
    use crate::relset;

    #[test]
    fn initial_configuration_runs_the_init_sequence() {
        let prog = coarse_queue(false).unwrap();
        let lin = queue_observer(&prog).unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let init = mk_init_cfg(&ctx).unwrap();
        assert_eq!(init.pc, [None; 3]);
        assert!(!init.seen && !init.freed && !init.retired);
        assert_eq!(init.state, *lin.initial_state());
        // init established H.next = NULL and T = H
        let h = init.shape.index_global(0);
        let t = init.shape.index_global(1);
        assert_eq!(init.shape.at(h, t), relset::EQ);
        assert_eq!(init.shape.at(h, init.shape.index_null()), relset::MT);
    }

    #[test]
    fn idle_threads_enumerate_every_entry() {
        let prog = coarse_queue(false).unwrap();
        let lin = queue_observer(&prog).unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let init = mk_init_cfg(&ctx).unwrap();
        let posts = mk_all_post(&ctx, &init).unwrap();
        // per thread: enq with the witness, enq without, deq — and no
        // reclamation step for a structure that frees directly
        assert_eq!(posts.len(), 6);
        assert!(posts
            .iter()
            .any(|c| c.seen && c.inout[0] == Some(DataValue::Data)));
        assert!(posts.iter().any(|c| c.pc[1].is_some() && c.pc[0].is_none()));
    }

    #[test]
    fn witness_input_is_consumed_at_most_once() {
        let prog = coarse_queue(false).unwrap();
        let lin = queue_observer(&prog).unwrap();
        let smr = no_reclamation_observer().unwrap();
        let opts = Options::with_setup(MemorySetup::Gc);
        let ctx = PostCtx { prog: &prog, lin: &lin, smr: &smr, opts: &opts };

        let mut seen_cfg = mk_init_cfg(&ctx).unwrap();
        seen_cfg.seen = true;
        let mut result = Vec::new();
        mk_tid_post(&ctx, &mut result, &seen_cfg, 0).unwrap();
        assert!(result
            .iter()
            .all(|c| c.inout[0] != Some(DataValue::Data)));
    }
}
