//! Reductions over shapes: concretisation, disambiguation, merging.
//!
//! All post images funnel through the operations here. Concretisation prunes
//! relations that cannot be realized by any concrete heap (judged by the
//! [`consistent_rel`] oracle against every middle term); disambiguation
//! enumerates the maximally decided refinements of one row; merging folds a
//! family of equally sized shapes back into a single over-approximation.

use crate::relset::{self, consistent_rel, transitive_consequences, Rel, RelSet};
use crate::shape::Shape;

/// Whether `x rel z` is consistent in `shape` against every middle term.
pub fn consistent_at(shape: &Shape, x: usize, z: usize, rel: Rel) -> bool {
    for y in 0..shape.size() {
        if !consistent_rel(rel, shape.at(x, y), shape.at(y, z)) {
            return false;
        }
    }
    true
}

/// Full consistency check, `O(n³)`. Test support; the engine prunes lazily.
pub fn consistent(shape: &Shape) -> bool {
    for x in 0..shape.size() {
        if shape.at(x, x) != relset::EQ {
            return false;
        }
        for z in x..shape.size() {
            for rel in shape.at(x, z).iter() {
                if !consistent_at(shape, x, z, rel) {
                    return false;
                }
            }
        }
    }
    true
}

/// Constraints on the special cells: pairwise unrelated, and nothing is
/// equal to, pointed from, or reachable from `UNDEF` or `NULL`.
pub fn special_constraints_hold(shape: &Shape) -> bool {
    let null = shape.index_null();
    let undef = shape.index_undef();
    let reuse = shape.index_reuse();
    if shape.at(null, undef) != relset::BT || shape.at(undef, reuse) != relset::BT {
        return false;
    }
    for i in shape.offset_observers()..shape.size() {
        // no cell may be pointed-from or reachable-from NULL
        if shape.at(i, null).intersects(relset::MF_GF) {
            return false;
        }
        // no cell may equal, be pointed-from, or be reachable-from UNDEF
        if shape.at(i, undef).intersects(relset::EQ_MF_GF) {
            return false;
        }
    }
    true
}

/// Whether the shape already contains every transitive consequence.
/// Test support only.
pub fn closed_under_transitivity(input: &Shape) -> bool {
    let mut shape = input.clone();
    loop {
        let mut updated = false;
        for x in 0..shape.size() {
            for y in 0..shape.size() {
                for z in 0..shape.size() {
                    let tc = transitive_consequences(shape.at(x, y), shape.at(y, z));
                    let both = shape.at(x, z).union(tc);
                    if both != shape.at(x, z) {
                        shape.set(x, z, both);
                        updated = true;
                    }
                }
            }
        }
        if !updated {
            break;
        }
    }
    for i in 0..shape.size() {
        for j in i + 1..shape.size() {
            if shape.at(i, j) != input.at(i, j) {
                return false;
            }
        }
    }
    true
}

/// Whether every cell of `con` is a non-empty subset of `abs`'s cell.
pub fn is_concretisation(con: &Shape, abs: &Shape) -> bool {
    debug_assert_eq!(con.size(), abs.size());
    for i in 0..con.size() {
        for j in 0..con.size() {
            let cell = con.at(i, j);
            if cell.is_empty() || !cell.subset_of(abs.at(i, j)) {
                return false;
            }
        }
    }
    true
}

/// Remove inconsistent relations until a fixpoint. Returns `false` iff some
/// cell ran empty, in which case the shape describes no heap at all.
pub fn make_concretisation(shape: &mut Shape) -> bool {
    loop {
        let mut changed = false;
        for i in 0..shape.size() {
            for j in i..shape.size() {
                for rel in shape.at(i, j).iter() {
                    if !consistent_at(shape, i, j, rel) {
                        shape.remove_relation(i, j, rel);
                        changed = true;
                    }
                }
                if shape.at(i, j).is_empty() {
                    return false;
                }
            }
        }
        if !changed {
            return true;
        }
    }
}

/// Intersect the cell `(row, col)` with `mask` and concretise. `None` means
/// no heap satisfies the restriction.
pub fn isolate_partial_concretisation(
    shape: &Shape,
    row: usize,
    col: usize,
    mask: RelSet,
) -> Option<Shape> {
    let cell = shape.at(row, col).inter(mask);
    if cell.is_empty() {
        return None;
    }
    let mut out = shape.clone();
    out.set(row, col, cell);
    if make_concretisation(&mut out) {
        Some(out)
    } else {
        None
    }
}

/// Whether a cell still mixes atoms from different split classes.
fn needs_splitting(rs: RelSet) -> bool {
    match rs.len() {
        0 => unreachable!("empty cell reached disambiguation"),
        1 => false,
        2 => rs != relset::MT_GT && rs != relset::MF_GF,
        _ => true,
    }
}

/// The split classes of a cell: `{=}`, a subset of `{↦,⇢}`, a subset of
/// `{↤,⇠}`, `{⋈}` — whichever are inhabited, in that order.
fn split_cell(rs: RelSet) -> Vec<RelSet> {
    let mut parts = Vec::with_capacity(4);
    if rs.contains(Rel::Eq) {
        parts.push(relset::EQ);
    }
    if rs.intersects(relset::MT_GT) {
        parts.push(rs.inter(relset::MT_GT));
    }
    if rs.intersects(relset::MF_GF) {
        parts.push(rs.inter(relset::MF_GF));
    }
    if rs.contains(Rel::Bt) {
        parts.push(relset::BT);
    }
    debug_assert!(!parts.is_empty());
    parts
}

/// Enumerate every maximal concretisation of `input` in which each cell of
/// `row` is decided down to one split class. Duplicates are tolerated; order
/// is irrelevant.
pub fn disambiguate(input: &Shape, row: usize) -> Vec<Shape> {
    let mut result = Vec::new();
    let mut work: Vec<(usize, Shape)> = vec![(0, input.clone())];

    while !work.is_empty() {
        let idx = work.len() - 1;
        let col = work[idx].0;
        if col >= work[idx].1.size() {
            let (_, mut shape) = work.pop().expect("work entry");
            if make_concretisation(&mut shape) {
                debug_assert!(is_concretisation(&shape, input));
                result.push(shape);
            }
            continue;
        }
        if col == row || !needs_splitting(work[idx].1.at(row, col)) {
            work[idx].0 = col + 1;
            continue;
        }

        // drop inconsistent relations before splitting to avoid useless work
        {
            let shape = &mut work[idx].1;
            for rel in shape.at(row, col).iter() {
                if !consistent_at(shape, row, col, rel) {
                    shape.remove_relation(row, col, rel);
                }
            }
        }
        if work[idx].1.at(row, col).is_empty() {
            // dead end: no concretisation down this branch
            work.pop();
            continue;
        }

        work[idx].0 = col + 1;
        if needs_splitting(work[idx].1.at(row, col)) {
            let parts = split_cell(work[idx].1.at(row, col));
            let (last, rest) = parts.split_last().expect("split classes");
            for rs in rest {
                let mut s = work[idx].1.clone();
                s.set(row, col, *rs);
                work.push((col + 1, s));
            }
            // reuse the current entry for the final class
            work[idx].1.set(row, col, *last);
        }
    }

    result
}

/// Split a single cell into its decided classes, keeping only consistent
/// outcomes.
pub fn disambiguate_cell(shape: &Shape, row: usize, col: usize) -> Vec<Shape> {
    if !needs_splitting(shape.at(row, col)) {
        return vec![shape.clone()];
    }
    let mut result = Vec::with_capacity(4);
    for rs in split_cell(shape.at(row, col)) {
        let mut s = shape.clone();
        s.set(row, col, rs);
        if make_concretisation(&mut s) {
            result.push(s);
        }
    }
    result
}

/// Pointwise union of a family of equally sized shapes. `None` on empty input.
pub fn merge(mut shapes: Vec<Shape>) -> Option<Shape> {
    let mut result = shapes.pop()?;
    for row in 0..result.size() {
        for col in row..result.size() {
            let mut cell = result.at(row, col);
            for s in &shapes {
                debug_assert_eq!(s.size(), result.size());
                cell = cell.union(s.at(row, col));
            }
            result.set(row, col, cell);
        }
    }
    Some(result)
}

/// Cell terms `t` with `shape[x][t] ∩ any_of ≠ ∅`.
pub fn get_related(shape: &Shape, x: usize, any_of: RelSet) -> Vec<usize> {
    (0..shape.size())
        .filter(|&i| shape.at(x, i).intersects(any_of))
        .collect()
}

/// For every pair `(u, v)` make `u rel v` definite possible knowledge:
/// drop `⋈`, add `rel`.
pub fn relate_all(shape: &mut Shape, lhs: &[usize], rhs: &[usize], rel: Rel) {
    for &u in lhs {
        for &v in rhs {
            shape.remove_relation(u, v, Rel::Bt);
            shape.add_relation(u, v, rel);
        }
    }
}

/// Add `rel` as a possibility to every pair `(u, v)`.
pub fn extend_all(shape: &mut Shape, lhs: &[usize], rhs: &[usize], rel: Rel) {
    for &u in lhs {
        for &v in rhs {
            shape.add_relation(u, v, rel);
        }
    }
}

/// Detach everything following `x`: every `{=,↤,⇠}`-predecessor of `x` loses
/// its `{↦,⇢}` link to every successor of `x`.
pub fn remove_successors(shape: &mut Shape, x: usize) {
    let successors = get_related(shape, x, relset::MT_GT);
    let predecessors = get_related(shape, x, relset::EQ_MF_GF);
    for &u in &successors {
        for &v in &predecessors {
            debug_assert_ne!(u, v);
            shape.set(v, u, relset::BT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relset::{BT, EQ, EQ_MT_GT, GT, MT, MT_GT, PRED};

    fn triple() -> (Shape, usize, usize, usize) {
        // no observers, three globals a, b, c; no locals
        let s = Shape::new(0, 3, 0, 2);
        let (a, b, c) = (s.index_global(0), s.index_global(1), s.index_global(2));
        (s, a, b, c)
    }

    #[test]
    fn concretisation_prunes_contradictions() {
        let (mut s, a, b, c) = triple();
        s.set(a, b, EQ);
        s.set(b, c, EQ);
        s.set(a, c, EQ.union(BT));
        assert!(make_concretisation(&mut s));
        // a=b and b=c leave no witness for a⋈c
        assert_eq!(s.at(a, c), EQ);
        assert!(consistent(&s));
    }

    #[test]
    fn concretisation_detects_empty_heaps() {
        let (mut s, a, b, c) = triple();
        s.set(a, b, EQ);
        s.set(b, c, EQ);
        s.set(a, c, BT);
        assert!(!make_concretisation(&mut s));
    }

    #[test]
    fn isolate_with_full_mask_is_identity_up_to_cleanup() {
        let (mut s, a, b, _) = triple();
        s.set(a, b, EQ.union(BT));
        assert!(make_concretisation(&mut s));
        let iso = isolate_partial_concretisation(&s, a, b, PRED).expect("full mask");
        assert_eq!(iso, s);
    }

    #[test]
    fn isolate_empty_intersection() {
        let (mut s, a, b, _) = triple();
        s.set(a, b, MT);
        assert!(isolate_partial_concretisation(&s, a, b, EQ).is_none());
    }

    #[test]
    fn disambiguation_partitions_a_row() {
        let (mut s, a, b, _) = triple();
        s.set(a, b, EQ.union(BT));
        assert!(make_concretisation(&mut s));
        let parts = disambiguate(&s, a);
        assert!(!parts.is_empty());
        let mut saw_eq = false;
        let mut saw_bt = false;
        for p in &parts {
            assert!(is_concretisation(p, &s));
            assert!(consistent(p));
            match p.at(a, b) {
                cell if cell == EQ => saw_eq = true,
                cell if cell == BT => saw_bt = true,
                cell => panic!("undecided cell {cell}"),
            }
        }
        assert!(saw_eq && saw_bt);
    }

    #[test]
    fn disambiguate_cell_decides_one_cell() {
        let (mut s, a, b, _) = triple();
        s.set(a, b, EQ_MT_GT.union(BT));
        assert!(make_concretisation(&mut s));
        let parts = disambiguate_cell(&s, a, b);
        for p in &parts {
            assert!(!needs_splitting(p.at(a, b)));
            assert!(is_concretisation(p, &s));
        }
    }

    #[test]
    fn merge_is_pointwise_union() {
        let (mut s1, a, b, _) = triple();
        s1.set(a, b, EQ);
        assert!(make_concretisation(&mut s1));
        let mut s2 = s1.clone();
        s2.set(a, b, BT);
        assert!(make_concretisation(&mut s2));
        let merged = merge(vec![s1.clone(), s2]).expect("non-empty input");
        assert_eq!(merged.at(a, b), EQ.union(BT));
        assert!(merge(Vec::new()).is_none());
    }

    #[test]
    fn remove_successors_cuts_forward_links() {
        // a ↦ b ↦ c ↦ UNDEF, as the assignment posts would build it
        let (mut s, a, b, c) = triple();
        let undef = s.index_undef();
        s.set(a, b, MT);
        s.set(b, c, MT);
        s.set(a, c, GT);
        s.set(a, undef, GT);
        s.set(b, undef, GT);
        assert!(make_concretisation(&mut s));
        assert_eq!(s.at(a, b), MT);
        remove_successors(&mut s, a);
        assert_eq!(s.at(a, b), BT);
        assert_eq!(s.at(a, c), BT);
    }

    #[test]
    fn related_and_relate_all() {
        let (mut s, a, b, c) = triple();
        s.set(a, b, MT);
        let fwd = get_related(&s, a, MT_GT);
        assert_eq!(fwd, vec![s.index_undef(), b]);
        relate_all(&mut s, &[a], &[c], Rel::Gt);
        assert!(s.at(a, c).contains(Rel::Gt));
        assert!(!s.at(a, c).contains(Rel::Bt));
        extend_all(&mut s, &[a], &[c], Rel::Bt);
        assert!(s.at(a, c).contains(Rel::Bt));
    }
}
