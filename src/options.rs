//! Runtime configuration of the engine.
//!
//! Analysis mode, memory semantics, and the precision knobs live in one
//! [`Options`] value handed to the fixpoint driver, so drivers and tests can
//! exercise every combination without rebuilding.

use std::fmt;

use serde::Serialize;

/// How the fixpoint accounts for concurrent steps.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Pairwise interference between same-bucket configurations.
    Interference,
    /// Per-function summaries instead of interference; soundness is restored
    /// by the CHK-MIMIC post-pass.
    Summary,
}

/// Memory semantics the program is analysed under.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemorySetup {
    /// Garbage collection: frees are no-ops, memory is never recycled.
    Gc,
    /// Pointer-race-free semantics: validity is tracked and races reported.
    Prf,
    /// Explicitly managed memory: only definite accesses to reclaimed cells
    /// are reported.
    Mm,
}

impl fmt::Display for MemorySetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemorySetup::Gc => f.write_str("GC"),
            MemorySetup::Prf => f.write_str("PRF"),
            MemorySetup::Mm => f.write_str("MM"),
        }
    }
}

/// Engine tunables.
#[derive(Clone, Debug)]
pub struct Options {
    pub mode: Mode,
    pub msetup: MemorySetup,
    /// Filter statements without effect from posts and interference.
    pub skip_noops: bool,
    /// Treat `kill` as a noop for interference purposes.
    pub kill_is_noop: bool,
    /// Merge `valid_ptr` in the encoding instead of keying on it.
    pub merge_valid_ptr: bool,
    /// Coarser bucket key: only the first global-to-global cell.
    pub ad_hoc_precision: bool,
    /// Reserved; accepted but without effect.
    pub interference_optimization: bool,
    /// Disambiguate every shared row before checking summary coverage.
    pub precise_chkmimic: bool,
    /// Include statement ids when rendering programs.
    pub print_id: bool,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            mode: Mode::Interference,
            msetup: MemorySetup::Prf,
            skip_noops: true,
            kill_is_noop: true,
            merge_valid_ptr: true,
            ad_hoc_precision: false,
            interference_optimization: false,
            precise_chkmimic: true,
            print_id: true,
        }
    }
}

impl Options {
    pub fn with_mode(mode: Mode) -> Options {
        Options { mode, ..Options::default() }
    }

    pub fn with_setup(msetup: MemorySetup) -> Options {
        Options { msetup, ..Options::default() }
    }
}

/// Step counters collected during one `fixed_point` run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub sequential_steps: usize,
    pub interference_steps: usize,
    pub interference_skipped: usize,
    pub summaries_needed: usize,
}
