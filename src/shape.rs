//! Shapes: matrices of relation sets over cell terms.
//!
//! A shape is the abstract heap: a square matrix holding one [`RelSet`] per
//! ordered pair of cell terms. Cell terms are plain indices with a fixed
//! layout:
//!
//! ```text
//! 0 NULL | 1 UNDEF | 2 REUSE | observer cells | globals | locals (per thread)
//! ```
//!
//! Shapes are born with two thread-local blocks and can be grown by one more
//! block to admit an interfering thread ([`Shape::extend`]), then shrunk back
//! ([`Shape::shrink`]). Storage is allocated for the extended size up front so
//! the grow/shrink cycle never reallocates.
//!
//! ## Invariants
//!
//! - `shape[i][i] = {=}` and `shape[j][i] = symmetric(shape[i][j])`; both are
//!   maintained by [`Shape::set`] and friends, never by callers.
//! - A cell never becomes empty through [`Shape::set`]; emptying a cell is a
//!   tool bug and aborts the analysis.

use std::cmp::Ordering;
use std::fmt;

use crate::relset::{self, Rel, RelSet};

/// The abstract heap: a square matrix of relation sets.
#[derive(Clone)]
pub struct Shape {
    num_obs: usize,
    num_globals: usize,
    num_locals: usize,
    threads: usize,
    bounds: usize,
    max_bounds: usize,
    cells: Vec<RelSet>,
}

impl Shape {
    /// A fresh shape over `threads` thread-local blocks (storage for one
    /// extra block is reserved). All pairs start unrelated, every program
    /// cell is definitely undefined, and `REUSE ↦ NULL` holds definitely.
    pub fn new(num_obs: usize, num_globals: usize, num_locals: usize, threads: usize) -> Shape {
        let bounds = 3 + num_obs + num_globals + threads * num_locals;
        let max_bounds = bounds + num_locals;
        let mut shape = Shape {
            num_obs,
            num_globals,
            num_locals,
            threads,
            bounds,
            max_bounds,
            cells: vec![relset::BT; max_bounds * max_bounds],
        };
        for i in 0..max_bounds {
            shape.cells[i * max_bounds + i] = relset::EQ;
        }
        for i in shape.offset_observers()..max_bounds {
            shape.put(i, shape.index_undef(), relset::MT);
        }
        shape.put(shape.index_reuse(), shape.index_null(), relset::MT);
        shape
    }

    // -- layout ------------------------------------------------------------

    #[inline]
    pub fn index_null(&self) -> usize {
        0
    }

    #[inline]
    pub fn index_undef(&self) -> usize {
        1
    }

    #[inline]
    pub fn index_reuse(&self) -> usize {
        2
    }

    /// Cell term of observer variable `k`.
    #[inline]
    pub fn index_observer(&self, k: usize) -> usize {
        debug_assert!(k < self.num_obs);
        3 + k
    }

    /// Cell term of the global variable with the given id.
    #[inline]
    pub fn index_global(&self, id: usize) -> usize {
        debug_assert!(id < self.num_globals);
        self.offset_globals() + id
    }

    /// Cell term of thread `tid`'s local variable with the given id.
    #[inline]
    pub fn index_local(&self, tid: usize, id: usize) -> usize {
        debug_assert!(id < self.num_locals);
        self.offset_locals(tid) + id
    }

    /// First observer cell; the special cells end here.
    #[inline]
    pub fn offset_observers(&self) -> usize {
        3
    }

    /// First global cell; the observer cells end here.
    #[inline]
    pub fn offset_globals(&self) -> usize {
        3 + self.num_obs
    }

    /// First local cell of thread `tid`; shared cells end at `offset_locals(0)`.
    #[inline]
    pub fn offset_locals(&self, tid: usize) -> usize {
        self.offset_globals() + self.num_globals + tid * self.num_locals
    }

    /// Number of active cell terms.
    #[inline]
    pub fn size(&self) -> usize {
        self.bounds
    }

    /// Size of one thread-local block.
    #[inline]
    pub fn size_locals(&self) -> usize {
        self.num_locals
    }

    /// Allocated number of cell terms, including the reserved block.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max_bounds
    }

    /// Number of observer cells.
    #[inline]
    pub fn size_observers(&self) -> usize {
        self.num_obs
    }

    /// Number of active thread-local blocks.
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.threads
    }

    /// Whether `x` lies in thread `tid`'s local block.
    #[inline]
    pub fn is_local_of(&self, x: usize, tid: usize) -> bool {
        x >= self.offset_locals(tid) && x < self.offset_locals(tid) + self.num_locals
    }

    /// Whether `x` is a shared program cell (global variable).
    #[inline]
    pub fn is_shared(&self, x: usize) -> bool {
        x >= self.offset_globals() && x < self.offset_locals(0)
    }

    // -- access ------------------------------------------------------------

    #[inline]
    pub fn at(&self, i: usize, j: usize) -> RelSet {
        debug_assert!(i < self.bounds && j < self.bounds);
        self.cells[i * self.max_bounds + j]
    }

    #[inline]
    pub fn test(&self, i: usize, j: usize, r: Rel) -> bool {
        self.at(i, j).contains(r)
    }

    #[inline]
    fn put(&mut self, i: usize, j: usize, rs: RelSet) {
        let stride = self.max_bounds;
        self.cells[i * stride + j] = rs;
        self.cells[j * stride + i] = rs.symmetric();
    }

    /// Overwrite the cell `(i, j)`; the mirror cell is kept symmetric.
    pub fn set(&mut self, i: usize, j: usize, rs: RelSet) {
        assert!(i < self.bounds && j < self.bounds);
        assert!(!rs.is_empty(), "emptied shape cell ({i}, {j})");
        self.put(i, j, rs);
    }

    pub fn remove_relation(&mut self, i: usize, j: usize, r: Rel) {
        assert!(i < self.bounds && j < self.bounds);
        let stride = self.max_bounds;
        self.cells[i * stride + j].remove(r);
        self.cells[j * stride + i].remove(r.symmetric());
    }

    pub fn add_relation(&mut self, i: usize, j: usize, r: Rel) {
        assert!(i < self.bounds && j < self.bounds);
        let stride = self.max_bounds;
        self.cells[i * stride + j].insert(r);
        self.cells[j * stride + i].insert(r.symmetric());
    }

    // -- extension ---------------------------------------------------------

    /// Append one thread-local block. The new rows and columns default to
    /// `{⋈}` with `{=}` on the diagonal; the caller is expected to fill in
    /// the interferer's relations afterwards.
    pub fn extend(&mut self) {
        assert!(
            self.bounds + self.num_locals <= self.max_bounds,
            "shape already extended"
        );
        let old = self.bounds;
        self.bounds += self.num_locals;
        self.threads += 1;
        for row in old..self.bounds {
            for col in 0..self.bounds {
                self.put(row, col, relset::BT);
            }
            self.put(row, row, relset::EQ);
        }
    }

    /// Drop the last thread-local block.
    pub fn shrink(&mut self) {
        assert!(self.threads > 1, "shrinking the last thread block");
        self.bounds -= self.num_locals;
        self.threads -= 1;
    }

    /// Compare only the active upper triangle; used by the encoding orders.
    pub fn cmp_cells(&self, other: &Shape) -> Ordering {
        debug_assert_eq!(self.bounds, other.bounds);
        for i in 0..self.bounds {
            for j in i + 1..self.bounds {
                match self.at(i, j).bits().cmp(&other.at(i, j).bits()) {
                    Ordering::Equal => {}
                    ord => return ord,
                }
            }
        }
        Ordering::Equal
    }
}

impl PartialEq for Shape {
    fn eq(&self, other: &Shape) -> bool {
        // Only the active cells count; the reserved extension block may hold
        // stale values from a previous extend/shrink cycle.
        self.bounds == other.bounds && self.cmp_cells(other) == Ordering::Equal
    }
}

impl Eq for Shape {}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "      ")?;
        for i in 0..self.size() {
            write!(f, "{i:>4}  ")?;
        }
        writeln!(f)?;
        for row in 0..self.size() {
            write!(f, "{row:>3}:  ")?;
            for col in 0..self.size() {
                write!(f, "{:>4}  ", self.at(row, col).to_string())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({}x{})", self.bounds, self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relset::{BT, EQ, GT, MT, MT_GT};

    fn sample() -> Shape {
        // 2 observers, 2 globals, 1 local, 2 threads.
        Shape::new(2, 2, 1, 2)
    }

    #[test]
    fn layout_offsets() {
        let s = sample();
        assert_eq!(s.index_null(), 0);
        assert_eq!(s.index_undef(), 1);
        assert_eq!(s.index_reuse(), 2);
        assert_eq!(s.index_observer(0), 3);
        assert_eq!(s.offset_globals(), 5);
        assert_eq!(s.index_global(1), 6);
        assert_eq!(s.offset_locals(0), 7);
        assert_eq!(s.index_local(1, 0), 8);
        assert_eq!(s.size(), 9);
    }

    #[test]
    fn fresh_shape_invariants() {
        let s = sample();
        for i in 0..s.size() {
            assert_eq!(s.at(i, i), EQ);
            for j in 0..s.size() {
                assert_eq!(s.at(j, i), s.at(i, j).symmetric());
            }
        }
        // special cells are pairwise unrelated
        assert_eq!(s.at(s.index_null(), s.index_undef()), BT);
        assert_eq!(s.at(s.index_undef(), s.index_reuse()), BT);
        // reuse definitely points to null
        assert_eq!(s.at(s.index_reuse(), s.index_null()), MT);
        // every program cell is definitely undefined
        for i in s.offset_observers()..s.size() {
            assert_eq!(s.at(i, s.index_undef()), MT);
        }
    }

    #[test]
    fn set_keeps_symmetry() {
        let mut s = sample();
        let (a, b) = (s.index_global(0), s.index_local(0, 0));
        s.set(a, b, MT_GT);
        assert_eq!(s.at(b, a), MT_GT.symmetric());
        s.remove_relation(a, b, Rel::Gt);
        assert_eq!(s.at(a, b), MT);
        assert_eq!(s.at(b, a), MT.symmetric());
        s.add_relation(a, b, Rel::Gt);
        assert_eq!(s.at(a, b), MT_GT);
    }

    #[test]
    fn extend_then_shrink_is_identity() {
        let mut s = sample();
        s.set(s.index_global(0), s.index_local(1, 0), GT);
        let before = s.clone();
        s.extend();
        assert_eq!(s.size(), before.size() + s.size_locals());
        assert_eq!(s.num_threads(), 3);
        // new block defaults
        let x = s.offset_locals(2);
        assert_eq!(s.at(x, x), EQ);
        assert_eq!(s.at(x, s.index_global(0)), BT);
        s.shrink();
        assert_eq!(s, before);
    }

    #[test]
    fn extend_is_repeatable_after_shrink() {
        let mut s = sample();
        s.extend();
        let x = s.offset_locals(2);
        s.set(x, s.index_global(0), GT);
        s.shrink();
        s.extend();
        // the dirty cell from the previous extension was reset
        assert_eq!(s.at(x, s.index_global(0)), BT);
        s.shrink();
    }

    #[test]
    fn cell_order_is_total() {
        let a = sample();
        let mut b = sample();
        assert_eq!(a.cmp_cells(&b), Ordering::Equal);
        b.set(b.index_global(0), b.index_global(1), EQ);
        let ord = a.cmp_cells(&b);
        assert_ne!(ord, Ordering::Equal);
        assert_eq!(b.cmp_cells(&a), ord.reverse());
    }

    #[test]
    #[should_panic(expected = "emptied shape cell")]
    fn emptying_a_cell_is_fatal() {
        let mut s = sample();
        s.set(3, 4, RelSet::EMPTY);
    }
}
