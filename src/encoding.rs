//! The encoding: the engine's store of explored configurations.
//!
//! Configurations live in an arena and are addressed by stable [`CfgId`]s;
//! the worklist only ever holds ids. On top of the arena sits a two-level
//! index: the outer map is keyed by a coarse *canonical projection* (flags,
//! observer states, the shared sub-shape), the inner bucket is ordered by
//! the finer full projection (program counters, event values, prophecies,
//! guards). [`Encoding::take`] either inserts a configuration or merges it
//! pointwise into its bucket twin — shape cells grow by union, the boolean
//! registers shrink by conjunction — which is what forces the fixpoint onto
//! a finite store.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::cfg::{Cfg, MAX_THREADS};
use crate::observer::StateId;

/// Stable index of a configuration in the encoding's arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CfgId(pub u32);

/// The canonical projection keying the outer map.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
struct KeyProj {
    freed: bool,
    retired: bool,
    state: Vec<StateId>,
    smr: Vec<StateId>,
    seen: bool,
    shared: Vec<u8>,
}

impl KeyProj {
    fn of(cfg: &Cfg, ad_hoc_precision: bool) -> KeyProj {
        let s = &cfg.shape;
        let begin = s.offset_globals();
        let end = s.offset_locals(0);
        let shared = if ad_hoc_precision && begin + 1 < end {
            vec![s.at(begin, begin + 1).bits()]
        } else {
            let mut cells = Vec::with_capacity((end - begin) * (end - begin) / 2);
            for i in begin..end {
                for j in i + 1..end {
                    cells.push(s.at(i, j).bits());
                }
            }
            cells
        };
        KeyProj {
            freed: cfg.freed,
            retired: cfg.retired,
            state: cfg.state.states().to_vec(),
            smr: cfg.smr.states().to_vec(),
            seen: cfg.seen,
            shared,
        }
    }
}

/// The refinement of the key order that distinguishes bucket entries.
fn full_cmp(a: &Cfg, b: &Cfg, merge_valid_ptr: bool) -> Ordering {
    for tid in 0..MAX_THREADS {
        match a.pc[tid].cmp(&b.pc[tid]) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    match a.inout.cmp(&b.inout) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match a.oracle.cmp(&b.oracle) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match a.guard0.cmp(&b.guard0) {
        Ordering::Equal => {}
        ord => return ord,
    }
    match a.guard1.cmp(&b.guard1) {
        Ordering::Equal => {}
        ord => return ord,
    }
    if !merge_valid_ptr {
        match a.valid_ptr.cmp(&b.valid_ptr) {
            Ordering::Equal => {}
            ord => return ord,
        }
    }
    Ordering::Equal
}

/// Bucketed canonical store with pointwise merging.
pub struct Encoding {
    arena: Vec<Cfg>,
    buckets: BTreeMap<KeyProj, Vec<CfgId>>,
    merge_valid_ptr: bool,
    ad_hoc_precision: bool,
}

impl Encoding {
    pub fn new(merge_valid_ptr: bool, ad_hoc_precision: bool) -> Encoding {
        Encoding {
            arena: Vec::new(),
            buckets: BTreeMap::new(),
            merge_valid_ptr,
            ad_hoc_precision,
        }
    }

    pub fn get(&self, id: CfgId) -> &Cfg {
        &self.arena[id.0 as usize]
    }

    /// Total number of stored configurations.
    pub fn size(&self) -> usize {
        self.arena.len()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Snapshot of the current bucket contents.
    pub fn bucket_ids(&self) -> Vec<Vec<CfgId>> {
        self.buckets.values().cloned().collect()
    }

    pub fn iter_ids(&self) -> impl Iterator<Item = CfgId> + '_ {
        (0..self.arena.len() as u32).map(CfgId)
    }

    /// Insert or merge `cfg`. Returns whether the encoding grew — a new
    /// entry, or a merge that actually changed the stored twin — together
    /// with the id of the representative.
    pub fn take(&mut self, cfg: Cfg) -> (bool, CfgId) {
        let key = KeyProj::of(&cfg, self.ad_hoc_precision);
        let arena = &mut self.arena;
        let merge_valid_ptr = self.merge_valid_ptr;
        let bucket = self.buckets.entry(key).or_default();

        match bucket.binary_search_by(|&id| full_cmp(&arena[id.0 as usize], &cfg, merge_valid_ptr))
        {
            Err(pos) => {
                let id = CfgId(arena.len() as u32);
                arena.push(cfg);
                bucket.insert(pos, id);
                (true, id)
            }
            Ok(pos) => {
                let id = bucket[pos];
                let dst = &mut arena[id.0 as usize];
                let mut updated = false;

                for row in 0..dst.shape.size() {
                    for col in row..dst.shape.size() {
                        let both = dst.shape.at(row, col).union(cfg.shape.at(row, col));
                        if both != dst.shape.at(row, col) {
                            dst.shape.set(row, col, both);
                            updated = true;
                        }
                    }
                }
                for i in dst.shape.offset_locals(0)..dst.shape.size() {
                    if merge_valid_ptr {
                        let vp = dst.valid_ptr[i] && cfg.valid_ptr[i];
                        if dst.valid_ptr[i] != vp {
                            dst.valid_ptr[i] = vp;
                            updated = true;
                        }
                    }
                    let vn = dst.valid_next[i] && cfg.valid_next[i];
                    if dst.valid_next[i] != vn {
                        dst.valid_next[i] = vn;
                        updated = true;
                    }
                    let ow = dst.own[i] && cfg.own[i];
                    if dst.own[i] != ow {
                        dst.own[i] = ow;
                        updated = true;
                    }
                }
                (updated, id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::ObserverBuilder;
    use crate::prog::StmtId;
    use crate::shape::Shape;

    fn sample_cfg() -> Cfg {
        let mut b = ObserverBuilder::new();
        b.initial("s");
        let obs = b.build().unwrap();
        let shape = Shape::new(2, 2, 1, 2);
        Cfg::start(shape, obs.initial_state().clone(), obs.initial_state().clone())
    }

    #[test]
    fn take_is_idempotent() {
        let mut enc = Encoding::new(true, false);
        let cfg = sample_cfg();
        let (grew, id) = enc.take(cfg.clone());
        assert!(grew);
        let (again, id2) = enc.take(cfg);
        assert!(!again, "identical configuration must be a no-change");
        assert_eq!(id, id2);
        assert_eq!(enc.size(), 1);
    }

    #[test]
    fn distinct_pcs_share_a_bucket() {
        let mut enc = Encoding::new(true, false);
        let cfg = sample_cfg();
        let mut other = cfg.clone();
        other.pc[0] = Some(StmtId(4));
        enc.take(cfg);
        let (grew, _) = enc.take(other);
        assert!(grew);
        assert_eq!(enc.size(), 2);
        assert_eq!(enc.bucket_count(), 1);
    }

    #[test]
    fn shared_shape_differences_split_buckets() {
        let mut enc = Encoding::new(true, false);
        let cfg = sample_cfg();
        let mut other = cfg.clone();
        let (a, b) = (other.shape.offset_globals(), other.shape.offset_globals() + 1);
        other.shape.set(a, b, crate::relset::EQ);
        enc.take(cfg);
        enc.take(other);
        assert_eq!(enc.bucket_count(), 2);
    }

    #[test]
    fn merge_unions_cells_and_shrinks_registers() {
        let mut enc = Encoding::new(true, false);
        let mut cfg = sample_cfg();
        let local = cfg.shape.index_local(0, 0);
        cfg.valid_next[local] = true;
        // two configurations with equal projections but different local cells
        let mut variant = cfg.clone();
        let g = variant.shape.offset_globals();
        variant.shape.set(local, g, crate::relset::GT);
        variant.valid_next[local] = false;

        let (_, id) = enc.take(cfg);
        let (updated, id2) = enc.take(variant);
        assert!(updated);
        assert_eq!(id, id2);
        let merged = enc.get(id);
        // cells only grow
        assert!(merged.shape.at(local, g).contains(crate::relset::Rel::Gt));
        assert!(merged.shape.at(local, g).contains(crate::relset::Rel::Bt));
        // boolean registers only shrink
        assert!(!merged.valid_next[local]);

        // re-taking the merged state changes nothing
        let replay = merged.clone();
        let (changed, _) = enc.take(replay);
        assert!(!changed);
    }
}
