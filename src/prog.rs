//! Programs under analysis.
//!
//! Drivers describe a data structure in a small builder surface (`var`,
//! `assign`, `cas`, `loop_`, …). [`Program::new`] validates the tree and
//! flattens it into an id-indexed statement table plus an immutable successor
//! table: statements refer to each other through [`StmtId`]s, a program
//! counter is an `Option<StmtId>` (`None` means the function returned), and
//! successor lookup is a table read. The builder tree is consumed; only the
//! rendered listing survives for printing.
//!
//! Validation happens here, not during the analysis: unknown or duplicate
//! names, locals in the init sequence, unsupported expression combinations
//! (`x.next = y.next`), and the static discipline on function summaries
//! (no loops, single assignment to locals per path, at most one CAS per
//! path, the publish/unlink shapes of linearising CASes).

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::shape::Shape;

/// Index of a function within its [`Program`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncId(pub u16);

/// Index of a statement within its [`Program`]'s statement table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StmtId(pub u16);

/// A resolved variable: global or thread-local, by declaration id.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VarRef {
    Global(u16),
    Local(u16),
}

impl VarRef {
    pub fn is_local(self) -> bool {
        matches!(self, VarRef::Local(_))
    }

    /// Cell term of this variable in `shape`, for thread `tid`.
    pub fn cell(self, shape: &Shape, tid: usize) -> usize {
        match self {
            VarRef::Global(id) => shape.index_global(id as usize),
            VarRef::Local(id) => shape.index_local(tid, id as usize),
        }
    }
}

/// A resolved pointer expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Expr {
    Null,
    Var(VarRef),
    /// `v.next`
    Next(VarRef),
}

impl Expr {
    /// Cell term the expression's *base* denotes (`NULL` for the literal).
    pub fn cell(self, shape: &Shape, tid: usize) -> usize {
        match self {
            Expr::Null => shape.index_null(),
            Expr::Var(v) | Expr::Next(v) => v.cell(shape, tid),
        }
    }

    pub fn is_selector(self) -> bool {
        matches!(self, Expr::Next(_))
    }
}

/// Combining operator of a data-set statement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SetOp {
    /// `lhs := rhs`
    Assign,
    /// `lhs := lhs \ rhs`
    Minus,
}

/// A linearisation point: fires an observer event for the enclosing
/// function, optionally guarded by a condition, optionally reading the
/// emitted value from a variable's data field.
#[derive(Clone, Debug)]
pub struct Linp {
    pub cond: Option<Cond>,
    pub var: Option<VarRef>,
}

/// A compare-and-swap, optionally firing a linearisation point on success.
#[derive(Clone, Debug)]
pub struct Cas {
    pub dst: Expr,
    pub cmp: Expr,
    pub src: Expr,
    pub lp: Option<Linp>,
    /// Age-checked CAS: success additionally certifies the compared cell was
    /// not recycled.
    pub with_age: bool,
}

/// A resolved condition.
#[derive(Clone, Debug)]
pub enum Cond {
    True,
    NonDet,
    /// Branch on the prophecy register set by `oracle`.
    Oracle,
    /// `epoch != Epoch` (thread's epoch lags the global one).
    EpochVar,
    /// `epoch != v->epoch` for the reclamation record behind `v`.
    EpochSel(VarRef),
    EqNeq {
        lhs: Expr,
        rhs: Expr,
        neg: bool,
        /// Age-checked comparison, see [`Cas::with_age`].
        with_age: bool,
    },
    Cas(Box<Cas>),
    Compound(Box<Cond>, Box<Cond>),
}

/// A flattened statement.
#[derive(Clone, Debug)]
pub enum StmtKind {
    /// Indivisible block; `body` is `None` for an empty block.
    Atomic { body: Option<StmtId> },
    Assign { lhs: Expr, rhs: Expr },
    SetNull { lhs: Expr },
    /// `v.data = __in__`
    ReadInput { var: VarRef },
    /// `__out__ = v.data`
    WriteOutput { var: VarRef },
    Malloc { var: VarRef },
    Free { var: VarRef },
    Retire { var: VarRef },
    /// Publish hazard pointer `index` for `var`'s cell.
    HpSet { var: VarRef, index: u8 },
    /// Drop hazard pointer `index`.
    HpRelease { index: u8 },
    /// Enter the quiescent period (epoch-based reclamation).
    EnterQ,
    /// Leave the quiescent period.
    LeaveQ,
    Linp(Linp),
    Ite {
        cond: Cond,
        next_true: Option<StmtId>,
        next_false: Option<StmtId>,
        /// Where both branches re-join (used by the renderer).
        join: Option<StmtId>,
    },
    /// `while (true)`; leaving is by `break` only.
    Loop {
        body: StmtId,
        exit: Option<StmtId>,
    },
    Break,
    Cas(Cas),
    /// Nondeterministically pre-decide a later branch.
    Oracle,
    /// Keep only executions whose prophecy matches.
    CheckProphecy(bool),
    /// Havoc a pointer register; `None` filters executions with a pending
    /// output event instead (the "confused" variant).
    Kill { var: Option<VarRef> },
    SetAddArg { set: u8 },
    SetAddSel { set: u8, var: VarRef, index: u8 },
    SetCombine { lhs: u8, rhs: u8, op: SetOp },
    SetClear { set: u8 },
    /// Bind the thread's reclamation record to `var`'s cell.
    InitRec { var: VarRef },
    /// Write the record's data field `index` from the argument or `NULL`.
    WriteRec { index: u8, from_arg: bool },
    /// Stamp the record with the thread's local epoch.
    SetRecEpoch,
    /// Read the global epoch into the thread's local epoch.
    GetEpoch,
    /// Advance the global epoch.
    IncEpoch,
}

/// A statement with its owning function (`None` while initialising).
#[derive(Clone, Debug)]
pub struct Stmt {
    pub kind: StmtKind,
    pub func: Option<FuncId>,
    pub in_summary: bool,
}

/// A data-structure operation.
#[derive(Clone, Debug)]
pub struct Function {
    name: String,
    has_input: bool,
    entry: Option<StmtId>,
    summary: Option<StmtId>,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input functions consume an argument; the others produce an output.
    pub fn has_input(&self) -> bool {
        self.has_input
    }

    pub fn has_output(&self) -> bool {
        !self.has_input
    }

    pub fn entry(&self) -> Option<StmtId> {
        self.entry
    }

    /// Entry of the atomic summary, if one was supplied.
    pub fn summary(&self) -> Option<StmtId> {
        self.summary
    }
}

/// Predicate dropping shapes known to be infeasible for the structure at
/// hand. Optional; no filtering by default.
pub type HintFn = Box<dyn Fn(&Shape) -> bool + Send + Sync>;

/// Construction-time errors. All of these are defects of the driver, not of
/// the program under analysis.
#[derive(Debug, Error)]
pub enum ProgError {
    #[error("duplicate variable name '{0}'")]
    DuplicateVariable(String),
    #[error("unknown variable '{0}'")]
    UnknownVariable(String),
    #[error("the init sequence may only use global variables, found '{0}'")]
    InitUsesLocal(String),
    #[error("'init' is a reserved function name")]
    ReservedFunctionName,
    #[error("duplicate function name '{0}'")]
    DuplicateFunction(String),
    #[error("unsupported assignment shape: both sides select 'next'")]
    NextToNextAssignment,
    #[error("cannot assign a variable from its own 'next' selector")]
    SelfNextAssignment,
    #[error("assigning NULL requires the null-assignment statement")]
    NullAssignmentShape,
    #[error("CAS comparand must be a plain variable")]
    CasComparand,
    #[error("'break' outside of a loop")]
    BreakOutsideLoop,
    #[error("loop bodies must not be empty")]
    EmptyLoopBody,
    #[error("unsupported condition in a conditional: {0}")]
    UnsupportedCondition(&'static str),
    #[error("bad summary for '{fun}': {reason}")]
    BadSummary { fun: String, reason: String },
}

// ---------------------------------------------------------------------------
// Builder surface
// ---------------------------------------------------------------------------

/// Unresolved pointer expression.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AExpr {
    Null,
    Var(String),
    Next(String),
}

/// Unresolved condition.
#[derive(Clone, Debug)]
pub enum ACond {
    True,
    NonDet,
    Oracle,
    EpochVar,
    EpochSel(String),
    EqNeq {
        lhs: AExpr,
        rhs: AExpr,
        neg: bool,
        with_age: bool,
    },
    Cas(Box<ACas>),
    Compound(Box<ACond>, Box<ACond>),
}

#[derive(Clone, Debug)]
pub struct ACas {
    pub dst: AExpr,
    pub cmp: AExpr,
    pub src: AExpr,
    pub lp: Option<ALinp>,
    pub with_age: bool,
}

#[derive(Clone, Debug)]
pub struct ALinp {
    pub cond: Option<ACond>,
    pub var: Option<String>,
}

/// Unresolved statement.
#[derive(Clone, Debug)]
pub enum AStmt {
    Atomic(Vec<AStmt>),
    Assign {
        lhs: AExpr,
        rhs: AExpr,
        lp: Option<ALinp>,
    },
    SetNull {
        lhs: AExpr,
    },
    ReadInput {
        var: String,
    },
    WriteOutput {
        var: String,
    },
    Malloc {
        var: String,
    },
    Free {
        var: String,
    },
    Retire {
        var: String,
    },
    HpSet {
        var: String,
        index: u8,
    },
    HpRelease {
        index: u8,
    },
    EnterQ,
    LeaveQ,
    Linp(ALinp),
    Ite {
        cond: ACond,
        then_branch: Vec<AStmt>,
        else_branch: Vec<AStmt>,
    },
    Loop(Vec<AStmt>),
    Break,
    Cas(ACas),
    Oracle,
    CheckProphecy(bool),
    Kill {
        var: Option<String>,
    },
    SetAddArg {
        set: u8,
    },
    SetAddSel {
        set: u8,
        var: String,
        index: u8,
    },
    SetCombine {
        lhs: u8,
        rhs: u8,
        op: SetOp,
    },
    SetClear {
        set: u8,
    },
    InitRec {
        var: String,
    },
    WriteRec {
        index: u8,
        from_arg: bool,
    },
    SetRecEpoch,
    GetEpoch,
    IncEpoch,
}

/// An unresolved function: name, whether it consumes an argument, body, and
/// an optional atomic summary.
pub struct AFun {
    pub name: String,
    pub has_input: bool,
    pub body: Vec<AStmt>,
    pub summary: Option<Vec<AStmt>>,
}

pub fn var(name: &str) -> AExpr {
    AExpr::Var(name.to_owned())
}

pub fn next(name: &str) -> AExpr {
    AExpr::Next(name.to_owned())
}

pub fn null() -> AExpr {
    AExpr::Null
}

pub fn eq_cond(lhs: AExpr, rhs: AExpr) -> ACond {
    ACond::EqNeq { lhs, rhs, neg: false, with_age: false }
}

pub fn neq_cond(lhs: AExpr, rhs: AExpr) -> ACond {
    ACond::EqNeq { lhs, rhs, neg: true, with_age: false }
}

/// Equality, age-checked when `with_age` is set (an age match certifies the
/// compared cells were not recycled).
pub fn eq_cond_opt_age(lhs: AExpr, rhs: AExpr, with_age: bool) -> ACond {
    ACond::EqNeq { lhs, rhs, neg: false, with_age }
}

pub fn cas_cond(cas: ACas) -> ACond {
    ACond::Cas(Box::new(cas))
}

pub fn comp_cond(lhs: ACond, rhs: ACond) -> ACond {
    ACond::Compound(Box::new(lhs), Box::new(rhs))
}

pub fn nd_cond() -> ACond {
    ACond::NonDet
}

pub fn oracle_cond() -> ACond {
    ACond::Oracle
}

pub fn epoch_cond() -> ACond {
    ACond::EpochVar
}

pub fn epoch_sel_cond(name: &str) -> ACond {
    ACond::EpochSel(name.to_owned())
}

pub fn assign(lhs: AExpr, rhs: AExpr) -> AStmt {
    AStmt::Assign { lhs, rhs, lp: None }
}

pub fn assign_lp(lhs: AExpr, rhs: AExpr, lp: ALinp) -> AStmt {
    AStmt::Assign { lhs, rhs, lp: Some(lp) }
}

pub fn set_null(lhs: AExpr) -> AStmt {
    AStmt::SetNull { lhs }
}

pub fn read_input(name: &str) -> AStmt {
    AStmt::ReadInput { var: name.to_owned() }
}

pub fn write_output(name: &str) -> AStmt {
    AStmt::WriteOutput { var: name.to_owned() }
}

pub fn lp() -> ALinp {
    ALinp { cond: None, var: None }
}

pub fn lp_var(name: &str) -> ALinp {
    ALinp { cond: None, var: Some(name.to_owned()) }
}

pub fn lp_cond(cond: ACond) -> ALinp {
    ALinp { cond: Some(cond), var: None }
}

pub fn linp(l: ALinp) -> AStmt {
    AStmt::Linp(l)
}

pub fn if_then(cond: ACond, then_branch: Vec<AStmt>) -> AStmt {
    AStmt::Ite { cond, then_branch, else_branch: Vec::new() }
}

pub fn if_then_else(cond: ACond, then_branch: Vec<AStmt>, else_branch: Vec<AStmt>) -> AStmt {
    AStmt::Ite { cond, then_branch, else_branch }
}

pub fn loop_(body: Vec<AStmt>) -> AStmt {
    AStmt::Loop(body)
}

pub fn atomic(body: Vec<AStmt>) -> AStmt {
    AStmt::Atomic(body)
}

pub fn mllc(name: &str) -> AStmt {
    AStmt::Malloc { var: name.to_owned() }
}

pub fn free(name: &str) -> AStmt {
    AStmt::Free { var: name.to_owned() }
}

pub fn retire(name: &str) -> AStmt {
    AStmt::Retire { var: name.to_owned() }
}

pub fn brk() -> AStmt {
    AStmt::Break
}

pub fn kill(name: &str) -> AStmt {
    AStmt::Kill { var: Some(name.to_owned()) }
}

pub fn kill_confused() -> AStmt {
    AStmt::Kill { var: None }
}

pub fn hp_set(name: &str, index: u8) -> AStmt {
    AStmt::HpSet { var: name.to_owned(), index }
}

pub fn hp_release(index: u8) -> AStmt {
    AStmt::HpRelease { index }
}

pub fn enter_q() -> AStmt {
    AStmt::EnterQ
}

pub fn leave_q() -> AStmt {
    AStmt::LeaveQ
}

pub fn oracle() -> AStmt {
    AStmt::Oracle
}

pub fn check_prophecy(cond: bool) -> AStmt {
    AStmt::CheckProphecy(cond)
}

pub fn cas(dst: AExpr, cmp: AExpr, src: AExpr, with_age: bool) -> ACas {
    ACas { dst, cmp, src, lp: None, with_age }
}

pub fn cas_lp(dst: AExpr, cmp: AExpr, src: AExpr, lp: ALinp, with_age: bool) -> ACas {
    ACas { dst, cmp, src, lp: Some(lp), with_age }
}

pub fn cas_stmt(c: ACas) -> AStmt {
    AStmt::Cas(c)
}

pub fn set_add_arg(set: u8) -> AStmt {
    AStmt::SetAddArg { set }
}

pub fn set_add_sel(set: u8, name: &str, index: u8) -> AStmt {
    AStmt::SetAddSel { set, var: name.to_owned(), index }
}

pub fn set_combine(lhs: u8, rhs: u8, op: SetOp) -> AStmt {
    AStmt::SetCombine { lhs, rhs, op }
}

pub fn set_clear(set: u8) -> AStmt {
    AStmt::SetClear { set }
}

pub fn init_rec(name: &str) -> AStmt {
    AStmt::InitRec { var: name.to_owned() }
}

pub fn write_rec(index: u8, from_arg: bool) -> AStmt {
    AStmt::WriteRec { index, from_arg }
}

pub fn set_rec_epoch() -> AStmt {
    AStmt::SetRecEpoch
}

pub fn get_epoch() -> AStmt {
    AStmt::GetEpoch
}

pub fn inc_epoch() -> AStmt {
    AStmt::IncEpoch
}

pub fn fun(name: &str, has_input: bool, body: Vec<AStmt>) -> AFun {
    AFun { name: name.to_owned(), has_input, body, summary: None }
}

pub fn fun_with_summary(name: &str, has_input: bool, body: Vec<AStmt>, summary: Vec<AStmt>) -> AFun {
    AFun { name: name.to_owned(), has_input, body, summary: Some(summary) }
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// A validated, flattened program.
pub struct Program {
    name: String,
    globals: Vec<String>,
    locals: Vec<String>,
    stmts: Vec<Stmt>,
    next: Vec<Option<StmtId>>,
    funcs: Vec<Function>,
    init_entry: Option<StmtId>,
    listing: String,
    listing_plain: String,
    hint: Option<HintFn>,
    uses_reclamation: bool,
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("name", &self.name)
            .field("globals", &self.globals)
            .field("locals", &self.locals)
            .field("stmts", &self.stmts)
            .field("next", &self.next)
            .field("funcs", &self.funcs)
            .field("init_entry", &self.init_entry)
            .field("listing", &self.listing)
            .field("listing_plain", &self.listing_plain)
            .field("hint", &self.hint.as_ref().map(|_| "<fn>"))
            .field("uses_reclamation", &self.uses_reclamation)
            .finish()
    }
}

impl Program {
    pub fn new(
        name: &str,
        globals: &[&str],
        locals: &[&str],
        init: Vec<AStmt>,
        funs: Vec<AFun>,
    ) -> Result<Program, ProgError> {
        let mut names: HashMap<String, VarRef> = HashMap::new();
        for (i, g) in globals.iter().enumerate() {
            if names.insert((*g).to_owned(), VarRef::Global(i as u16)).is_some() {
                return Err(ProgError::DuplicateVariable((*g).to_owned()));
            }
        }
        let mut all_names = names.clone();
        for (i, l) in locals.iter().enumerate() {
            if all_names.insert((*l).to_owned(), VarRef::Local(i as u16)).is_some() {
                return Err(ProgError::DuplicateVariable((*l).to_owned()));
            }
        }
        for f in &funs {
            if f.name == "init" {
                return Err(ProgError::ReservedFunctionName);
            }
            if funs.iter().filter(|g| g.name == f.name).count() > 1 {
                return Err(ProgError::DuplicateFunction(f.name.clone()));
            }
            if let Some(summary) = &f.summary {
                check_summary(f, summary)?;
            }
        }

        let mut prog = Program {
            name: name.to_owned(),
            globals: globals.iter().map(|s| (*s).to_owned()).collect(),
            locals: locals.iter().map(|s| (*s).to_owned()).collect(),
            stmts: Vec::new(),
            next: Vec::new(),
            funcs: Vec::new(),
            init_entry: None,
            listing: String::new(),
            listing_plain: String::new(),
            hint: None,
            uses_reclamation: false,
        };

        // init first (globals only), then bodies, then summaries
        {
            let mut fl = Flattener {
                prog: &mut prog,
                names: &names,
                all: &all_names,
                func: None,
                in_summary: false,
            };
            let entry = fl.flatten_seq(&init, None, Brk::NoLoop)?;
            prog.init_entry = entry;
        }
        for f in &funs {
            let fid = FuncId(prog.funcs.len() as u16);
            prog.funcs.push(Function {
                name: f.name.clone(),
                has_input: f.has_input,
                entry: None,
                summary: None,
            });
            let entry = {
                let mut fl = Flattener {
                    prog: &mut prog,
                    names: &all_names,
                    all: &all_names,
                    func: Some(fid),
                    in_summary: false,
                };
                fl.flatten_seq(&f.body, None, Brk::NoLoop)?
            };
            prog.funcs[fid.0 as usize].entry = entry;
        }
        for (i, f) in funs.iter().enumerate() {
            let fid = FuncId(i as u16);
            if let Some(summary) = &f.summary {
                let id = {
                    let mut fl = Flattener {
                        prog: &mut prog,
                        names: &all_names,
                        all: &all_names,
                        func: Some(fid),
                        in_summary: true,
                    };
                    fl.flatten_stmt(&AStmt::Atomic(summary.clone()), None, Brk::NoLoop)?
                };
                prog.funcs[fid.0 as usize].summary = Some(id);
            }
        }

        prog.uses_reclamation = prog
            .stmts
            .iter()
            .any(|s| matches!(s.kind, StmtKind::Retire { .. }));
        prog.listing = render_program(&prog, true);
        prog.listing_plain = render_program(&prog, false);
        Ok(prog)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_globals(&self) -> usize {
        self.globals.len()
    }

    pub fn num_locals(&self) -> usize {
        self.locals.len()
    }

    pub fn global_name(&self, id: u16) -> &str {
        &self.globals[id as usize]
    }

    pub fn local_name(&self, id: u16) -> &str {
        &self.locals[id as usize]
    }

    pub fn var_name(&self, v: VarRef) -> &str {
        match v {
            VarRef::Global(id) => self.global_name(id),
            VarRef::Local(id) => self.local_name(id),
        }
    }

    pub fn stmt(&self, id: StmtId) -> &Stmt {
        &self.stmts[id.0 as usize]
    }

    /// Successor in straight-line control flow.
    pub fn next_of(&self, id: StmtId) -> Option<StmtId> {
        self.next[id.0 as usize]
    }

    pub fn num_stmts(&self) -> usize {
        self.stmts.len()
    }

    pub fn init_entry(&self) -> Option<StmtId> {
        self.init_entry
    }

    pub fn num_funcs(&self) -> usize {
        self.funcs.len()
    }

    pub fn func(&self, id: FuncId) -> &Function {
        &self.funcs[id.0 as usize]
    }

    pub fn funcs(&self) -> impl Iterator<Item = (FuncId, &Function)> {
        self.funcs
            .iter()
            .enumerate()
            .map(|(i, f)| (FuncId(i as u16), f))
    }

    pub fn find(&self, name: &str) -> Option<FuncId> {
        self.funcs()
            .find(|(_, f)| f.name() == name)
            .map(|(id, _)| id)
    }

    /// Whether the statement belongs to a function summary.
    pub fn is_summary_statement(&self, id: StmtId) -> bool {
        self.stmt(id).in_summary
    }

    /// Whether any statement retires cells (enables the reclamation step).
    pub fn uses_reclamation(&self) -> bool {
        self.uses_reclamation
    }

    /// The program text, with or without statement ids.
    pub fn listing(&self, print_id: bool) -> &str {
        if print_id {
            &self.listing
        } else {
            &self.listing_plain
        }
    }

    pub fn set_hint(&mut self, hint: HintFn) {
        self.hint = Some(hint);
    }

    pub fn hint(&self) -> Option<&HintFn> {
        self.hint.as_ref()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.listing)
    }
}

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

#[derive(Copy, Clone)]
enum Brk {
    NoLoop,
    Target(Option<StmtId>),
}

struct Flattener<'a> {
    prog: &'a mut Program,
    /// Names visible in the current context (globals only while initialising).
    names: &'a HashMap<String, VarRef>,
    /// Every declared name, for better diagnostics.
    all: &'a HashMap<String, VarRef>,
    func: Option<FuncId>,
    in_summary: bool,
}

impl Flattener<'_> {
    fn alloc(&mut self) -> StmtId {
        let id = StmtId(self.prog.stmts.len() as u16);
        self.prog.stmts.push(Stmt {
            kind: StmtKind::Break, // placeholder, overwritten by finish()
            func: self.func,
            in_summary: self.in_summary,
        });
        self.prog.next.push(None);
        id
    }

    fn finish(&mut self, id: StmtId, kind: StmtKind, next: Option<StmtId>) {
        self.prog.stmts[id.0 as usize].kind = kind;
        self.prog.next[id.0 as usize] = next;
    }

    fn lookup(&self, name: &str) -> Result<VarRef, ProgError> {
        match self.names.get(name) {
            Some(v) => Ok(*v),
            None if self.all.contains_key(name) => Err(ProgError::InitUsesLocal(name.to_owned())),
            None => Err(ProgError::UnknownVariable(name.to_owned())),
        }
    }

    fn resolve(&self, e: &AExpr) -> Result<Expr, ProgError> {
        Ok(match e {
            AExpr::Null => Expr::Null,
            AExpr::Var(n) => Expr::Var(self.lookup(n)?),
            AExpr::Next(n) => Expr::Next(self.lookup(n)?),
        })
    }

    fn resolve_linp(&self, l: &ALinp) -> Result<Linp, ProgError> {
        Ok(Linp {
            cond: match &l.cond {
                Some(c) => Some(self.resolve_cond(c)?),
                None => None,
            },
            var: match &l.var {
                Some(n) => Some(self.lookup(n)?),
                None => None,
            },
        })
    }

    fn resolve_cas(&self, c: &ACas) -> Result<Cas, ProgError> {
        if !matches!(c.cmp, AExpr::Var(_)) {
            return Err(ProgError::CasComparand);
        }
        if let Some(lp) = &c.lp {
            if lp.cond.is_some() {
                return Err(ProgError::UnsupportedCondition(
                    "guarded linearisation on a CAS",
                ));
            }
        }
        Ok(Cas {
            dst: self.resolve(&c.dst)?,
            cmp: self.resolve(&c.cmp)?,
            src: self.resolve(&c.src)?,
            lp: match &c.lp {
                Some(l) => Some(self.resolve_linp(l)?),
                None => None,
            },
            with_age: c.with_age,
        })
    }

    fn resolve_cond(&self, c: &ACond) -> Result<Cond, ProgError> {
        Ok(match c {
            ACond::True => Cond::True,
            ACond::NonDet => Cond::NonDet,
            ACond::Oracle => Cond::Oracle,
            ACond::EpochVar => Cond::EpochVar,
            ACond::EpochSel(n) => Cond::EpochSel(self.lookup(n)?),
            ACond::EqNeq { lhs, rhs, neg, with_age } => Cond::EqNeq {
                lhs: self.resolve(lhs)?,
                rhs: self.resolve(rhs)?,
                neg: *neg,
                with_age: *with_age,
            },
            ACond::Cas(cas) => Cond::Cas(Box::new(self.resolve_cas(cas)?)),
            ACond::Compound(l, r) => {
                Cond::Compound(Box::new(self.resolve_cond(l)?), Box::new(self.resolve_cond(r)?))
            }
        })
    }

    fn flatten_seq(
        &mut self,
        stmts: &[AStmt],
        follow: Option<StmtId>,
        brk: Brk,
    ) -> Result<Option<StmtId>, ProgError> {
        let mut entry = follow;
        for stmt in stmts.iter().rev() {
            entry = Some(self.flatten_stmt(stmt, entry, brk)?);
        }
        Ok(entry)
    }

    fn flatten_stmt(
        &mut self,
        stmt: &AStmt,
        follow: Option<StmtId>,
        brk: Brk,
    ) -> Result<StmtId, ProgError> {
        let id = self.alloc();
        match stmt {
            AStmt::Atomic(body) => {
                // no interference inside; the body's tail runs off the block
                let body_entry = self.flatten_seq(body, None, Brk::NoLoop)?;
                self.finish(id, StmtKind::Atomic { body: body_entry }, follow);
            }
            AStmt::Assign { lhs, rhs, lp } => {
                let lhs = self.resolve(lhs)?;
                let rhs = self.resolve(rhs)?;
                if matches!(rhs, Expr::Null) {
                    return Err(ProgError::NullAssignmentShape);
                }
                if lhs.is_selector() && rhs.is_selector() {
                    return Err(ProgError::NextToNextAssignment);
                }
                if let (Expr::Var(a), Expr::Next(b)) = (lhs, rhs) {
                    if a == b {
                        return Err(ProgError::SelfNextAssignment);
                    }
                }
                let next = match lp {
                    Some(l) => {
                        let linp = self.resolve_linp(l)?;
                        let lp_id = self.alloc();
                        self.finish(lp_id, StmtKind::Linp(linp), follow);
                        Some(lp_id)
                    }
                    None => follow,
                };
                self.finish(id, StmtKind::Assign { lhs, rhs }, next);
            }
            AStmt::SetNull { lhs } => {
                let lhs = self.resolve(lhs)?;
                self.finish(id, StmtKind::SetNull { lhs }, follow);
            }
            AStmt::ReadInput { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::ReadInput { var }, follow);
            }
            AStmt::WriteOutput { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::WriteOutput { var }, follow);
            }
            AStmt::Malloc { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::Malloc { var }, follow);
            }
            AStmt::Free { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::Free { var }, follow);
            }
            AStmt::Retire { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::Retire { var }, follow);
            }
            AStmt::HpSet { var, index } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::HpSet { var, index: *index }, follow);
            }
            AStmt::HpRelease { index } => {
                self.finish(id, StmtKind::HpRelease { index: *index }, follow);
            }
            AStmt::EnterQ => self.finish(id, StmtKind::EnterQ, follow),
            AStmt::LeaveQ => self.finish(id, StmtKind::LeaveQ, follow),
            AStmt::Linp(l) => {
                let linp = self.resolve_linp(l)?;
                self.finish(id, StmtKind::Linp(linp), follow);
            }
            AStmt::Ite { cond, then_branch, else_branch } => {
                // compound and prophecy conditions only guard linearisation
                // points; CAS conditions are additionally banned in summaries
                match cond {
                    ACond::Compound(..) => {
                        return Err(ProgError::UnsupportedCondition("compound in an if"))
                    }
                    ACond::Oracle => {
                        return Err(ProgError::UnsupportedCondition("prophecy in an if"))
                    }
                    ACond::Cas(_) if self.in_summary => {
                        return Err(ProgError::BadSummary {
                            fun: self.func_name(),
                            reason: "unsupported condition in a summary conditional".to_owned(),
                        });
                    }
                    _ => {}
                }
                let cond = self.resolve_cond(cond)?;
                if matches!(cond, Cond::True) {
                    return Err(ProgError::UnsupportedCondition("'true' in an if"));
                }
                let next_true = self.flatten_seq(then_branch, follow, brk)?;
                let next_false = self.flatten_seq(else_branch, follow, brk)?;
                self.finish(
                    id,
                    StmtKind::Ite { cond, next_true, next_false, join: follow },
                    None,
                );
            }
            AStmt::Loop(body) => {
                if self.in_summary {
                    return Err(ProgError::BadSummary {
                        fun: self.func_name(),
                        reason: "loops are not supported in summaries".to_owned(),
                    });
                }
                if body.is_empty() {
                    return Err(ProgError::EmptyLoopBody);
                }
                let body_entry = self
                    .flatten_seq(body, Some(id), Brk::Target(follow))?
                    .expect("non-empty loop body");
                self.finish(id, StmtKind::Loop { body: body_entry, exit: follow }, None);
            }
            AStmt::Break => match brk {
                Brk::NoLoop => return Err(ProgError::BreakOutsideLoop),
                Brk::Target(t) => self.finish(id, StmtKind::Break, t),
            },
            AStmt::Cas(c) => {
                let c = self.resolve_cas(c)?;
                self.finish(id, StmtKind::Cas(c), follow);
            }
            AStmt::Oracle => self.finish(id, StmtKind::Oracle, follow),
            AStmt::CheckProphecy(b) => self.finish(id, StmtKind::CheckProphecy(*b), follow),
            AStmt::Kill { var } => {
                let var = match var {
                    Some(n) => Some(self.lookup(n)?),
                    None => None,
                };
                self.finish(id, StmtKind::Kill { var }, follow);
            }
            AStmt::SetAddArg { set } => self.finish(id, StmtKind::SetAddArg { set: *set }, follow),
            AStmt::SetAddSel { set, var, index } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::SetAddSel { set: *set, var, index: *index }, follow);
            }
            AStmt::SetCombine { lhs, rhs, op } => {
                self.finish(id, StmtKind::SetCombine { lhs: *lhs, rhs: *rhs, op: *op }, follow);
            }
            AStmt::SetClear { set } => self.finish(id, StmtKind::SetClear { set: *set }, follow),
            AStmt::InitRec { var } => {
                let var = self.lookup(var)?;
                self.finish(id, StmtKind::InitRec { var }, follow);
            }
            AStmt::WriteRec { index, from_arg } => {
                self.finish(id, StmtKind::WriteRec { index: *index, from_arg: *from_arg }, follow);
            }
            AStmt::SetRecEpoch => self.finish(id, StmtKind::SetRecEpoch, follow),
            AStmt::GetEpoch => self.finish(id, StmtKind::GetEpoch, follow),
            AStmt::IncEpoch => self.finish(id, StmtKind::IncEpoch, follow),
        }
        Ok(id)
    }

    fn func_name(&self) -> String {
        match self.func {
            Some(f) => self.prog.funcs[f.0 as usize].name.clone(),
            None => "init".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Summary discipline
// ---------------------------------------------------------------------------

fn bad(fun: &AFun, reason: &str) -> ProgError {
    ProgError::BadSummary {
        fun: fun.name.clone(),
        reason: reason.to_owned(),
    }
}

/// The static checks on summaries: no loops, locals assigned at most once
/// per path, at most one CAS per path, a linearising output CAS must unlink
/// (`dst = dst.next`) with the unlinked cell freed later on the path, a
/// linearising input CAS must publish a previously allocated variable.
fn check_summary(fun: &AFun, summary: &[AStmt]) -> Result<(), ProgError> {
    check_path(
        fun,
        summary.to_vec(),
        HashMap::new(),
        Vec::new(),
        Vec::new(),
        0,
    )
}

fn check_path(
    fun: &AFun,
    stmts: Vec<AStmt>,
    mut var2val: HashMap<String, AExpr>,
    mut allocations: Vec<String>,
    mut tobefreed: Vec<String>,
    mut cas_seen: usize,
) -> Result<(), ProgError> {
    let mut rest = stmts;
    while !rest.is_empty() {
        let stmt = rest.remove(0);
        match stmt {
            AStmt::Loop(_) => return Err(bad(fun, "loops are not supported in summaries")),
            AStmt::Atomic(body) => {
                let mut inner = body;
                inner.extend(rest);
                return check_path(fun, inner, var2val, allocations, tobefreed, cas_seen);
            }
            AStmt::Ite { cond, then_branch, else_branch } => {
                if matches!(cond, ACond::Cas(_) | ACond::Compound(..) | ACond::Oracle) {
                    return Err(bad(fun, "unsupported condition in a summary conditional"));
                }
                for branch in [then_branch, else_branch] {
                    let mut path = branch;
                    path.extend(rest.iter().cloned());
                    check_path(
                        fun,
                        path,
                        var2val.clone(),
                        allocations.clone(),
                        tobefreed.clone(),
                        cas_seen,
                    )?;
                }
                return Ok(());
            }
            AStmt::Assign { lhs: AExpr::Var(v), rhs, .. } => {
                if var2val.contains_key(&v) || allocations.contains(&v) {
                    return Err(bad(fun, "multiple assignments to a variable on one path"));
                }
                var2val.insert(v, rhs);
            }
            AStmt::SetNull { lhs: AExpr::Var(v) } => {
                if var2val.contains_key(&v) || allocations.contains(&v) {
                    return Err(bad(fun, "multiple assignments to a variable on one path"));
                }
                var2val.insert(v, AExpr::Null);
            }
            AStmt::Malloc { var } => {
                if allocations.contains(&var) || var2val.contains_key(&var) {
                    return Err(bad(fun, "multiple assignments to a variable on one path"));
                }
                allocations.push(var);
            }
            AStmt::Free { var } | AStmt::Retire { var } => {
                tobefreed.retain(|v| *v != var);
            }
            AStmt::Cas(c) => {
                cas_seen += 1;
                if cas_seen > 1 {
                    return Err(bad(fun, "more than one CAS on one path"));
                }
                check_summary_cas(fun, &c, &var2val, &mut allocations, &mut tobefreed)?;
            }
            _ => {}
        }
    }
    if !tobefreed.is_empty() {
        return Err(bad(fun, "a cell unlinked by a linearising CAS is never freed"));
    }
    Ok(())
}

fn check_summary_cas(
    fun: &AFun,
    c: &ACas,
    var2val: &HashMap<String, AExpr>,
    allocations: &mut Vec<String>,
    tobefreed: &mut Vec<String>,
) -> Result<(), ProgError> {
    if c.lp.is_none() {
        return Ok(());
    }
    if fun.has_input {
        // publishing CAS: the source must be a previously allocated variable
        let AExpr::Var(src) = &c.src else {
            return Err(bad(fun, "linearising CAS source is not a variable"));
        };
        allocations.retain(|v| v != src);
    } else {
        // unlinking CAS: dst = dst.next, old dst aliased and later freed
        let AExpr::Var(dst) = &c.dst else {
            return Err(bad(fun, "linearising CAS destination is not a variable"));
        };
        let AExpr::Var(cmp) = &c.cmp else {
            return Err(bad(fun, "linearising CAS comparand is not a variable"));
        };
        if dst != cmp {
            return Err(bad(fun, "linearising CAS must compare its destination"));
        }
        let AExpr::Var(src) = &c.src else {
            return Err(bad(fun, "linearising CAS source is not a variable"));
        };
        match var2val.get(src) {
            Some(AExpr::Next(base)) if base == dst => {}
            _ => return Err(bad(fun, "linearising CAS must advance dst to dst.next")),
        }
        for (v, val) in var2val {
            if let AExpr::Var(aliased) = val {
                if aliased == dst {
                    tobefreed.push(v.clone());
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn render_expr(prog: &Program, e: Expr) -> String {
    match e {
        Expr::Null => "NULL".to_owned(),
        Expr::Var(v) => prog.var_name(v).to_owned(),
        Expr::Next(v) => format!("{}.next", prog.var_name(v)),
    }
}

fn render_cond(prog: &Program, c: &Cond) -> String {
    match c {
        Cond::True => "true".to_owned(),
        Cond::NonDet => "*".to_owned(),
        Cond::Oracle => "prophecy == fulfilled".to_owned(),
        Cond::EpochVar => "epoch != Epoch".to_owned(),
        Cond::EpochSel(v) => format!("epoch != {}.epoch", prog.var_name(*v)),
        Cond::EqNeq { lhs, rhs, neg, with_age } => {
            let op = if *neg { "!=" } else { "==" };
            let age = if *with_age { " [age]" } else { "" };
            format!("{} {op} {}{age}", render_expr(prog, *lhs), render_expr(prog, *rhs))
        }
        Cond::Cas(c) => render_cas(prog, c),
        Cond::Compound(l, r) => {
            format!("{} && {}", render_cond(prog, l), render_cond(prog, r))
        }
    }
}

fn render_linp(prog: &Program, func: Option<FuncId>, l: &Linp) -> String {
    let mut out = String::from("*** ");
    if let Some(c) = &l.cond {
        out.push_str(&format!("[{}] ", render_cond(prog, c)));
    }
    let fname = func.map_or("?", |f| prog.func(f).name());
    match (&l.var, func.map(|f| prog.func(f).has_input())) {
        (_, Some(true)) => out.push_str(&format!("{fname}(__in__)")),
        (Some(v), _) => out.push_str(&format!("{fname}({}.data)", prog.var_name(*v))),
        (None, _) => out.push_str(&format!("{fname}(empty)")),
    }
    out.push_str(" ***");
    out
}

fn render_cas(prog: &Program, c: &Cas) -> String {
    let mut out = format!(
        "CAS({}, {}, {}",
        render_expr(prog, c.dst),
        render_expr(prog, c.cmp),
        render_expr(prog, c.src)
    );
    if c.with_age {
        out.push_str(" [age]");
    }
    out.push(')');
    out
}

struct Renderer<'a> {
    prog: &'a Program,
    out: String,
    print_id: bool,
}

impl Renderer<'_> {
    fn line(&mut self, indent: usize, id: Option<StmtId>, text: &str) {
        for _ in 0..indent {
            self.out.push_str("    ");
        }
        if self.print_id {
            if let Some(id) = id {
                self.out.push_str(&format!("[{}] ", id.0 + 1));
            }
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    /// Render the chain starting at `entry` until `stop` (exclusive) or a
    /// control transfer ends it.
    fn chain(&mut self, entry: Option<StmtId>, stop: Option<StmtId>, indent: usize) {
        let mut cur = entry;
        while let Some(id) = cur {
            if Some(id) == stop {
                return;
            }
            let prog = self.prog;
            let stmt = prog.stmt(id);
            match &stmt.kind {
                StmtKind::Atomic { body } => {
                    self.line(indent, Some(id), "atomic {");
                    self.chain(*body, None, indent + 1);
                    self.line(indent, None, "}");
                    cur = prog.next_of(id);
                }
                StmtKind::Assign { lhs, rhs } => {
                    let text = format!(
                        "{} = {};",
                        render_expr(prog, *lhs),
                        render_expr(prog, *rhs)
                    );
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetNull { lhs } => {
                    let text = format!("{} = NULL;", render_expr(prog, *lhs));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::ReadInput { var } => {
                    let text = format!("{}.data = __in__;", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::WriteOutput { var } => {
                    let text = format!("__out__ = {}.data;", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Malloc { var } => {
                    let text = format!("malloc({});", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Free { var } => {
                    let text = format!("free({});", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Retire { var } => {
                    let text = format!("retire({});", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::HpSet { var, index } => {
                    let text = format!("protect{index}({});", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::HpRelease { index } => {
                    let text = format!("unprotect{index}();");
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::EnterQ => {
                    self.line(indent, Some(id), "enterQ();");
                    cur = prog.next_of(id);
                }
                StmtKind::LeaveQ => {
                    self.line(indent, Some(id), "leaveQ();");
                    cur = prog.next_of(id);
                }
                StmtKind::Linp(l) => {
                    let text = render_linp(prog, stmt.func, l);
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Ite { cond, next_true, next_false, join } => {
                    let head = format!("if ({}) {{", render_cond(prog, cond));
                    self.line(indent, Some(id), &head);
                    self.chain(*next_true, *join, indent + 1);
                    if *next_false != *join {
                        self.line(indent, None, "} else {");
                        self.chain(*next_false, *join, indent + 1);
                    }
                    self.line(indent, None, "}");
                    cur = *join;
                }
                StmtKind::Loop { body, exit } => {
                    self.line(indent, Some(id), "while (true) {");
                    self.chain(Some(*body), Some(id), indent + 1);
                    self.line(indent, None, "}");
                    // the loop is left via break, towards its exit
                    cur = *exit;
                }
                StmtKind::Break => {
                    self.line(indent, Some(id), "break;");
                    return;
                }
                StmtKind::Cas(c) => {
                    let mut text = render_cas(prog, c);
                    if let Some(l) = &c.lp {
                        text.push(' ');
                        text.push_str(&render_linp(prog, stmt.func, l));
                    }
                    text.push(';');
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Oracle => {
                    self.line(indent, Some(id), "oracle(prophecy);");
                    cur = prog.next_of(id);
                }
                StmtKind::CheckProphecy(b) => {
                    let text =
                        format!("assume(prophecy == {});", if *b { "fulfilled" } else { "wrong" });
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::Kill { var } => {
                    let text = match var {
                        Some(v) => format!("kill({});", prog.var_name(*v)),
                        None => "kill_confused();".to_owned(),
                    };
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetAddArg { set } => {
                    let text = format!("set{set}.add(__in__);");
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetAddSel { set, var, index } => {
                    let text = format!("set{set}.add({}.data{index});", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetCombine { lhs, rhs, op } => {
                    let text = match op {
                        SetOp::Assign => format!("set{lhs} = set{rhs};"),
                        SetOp::Minus => format!("set{lhs} = set{lhs} \\ set{rhs};"),
                    };
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetClear { set } => {
                    let text = format!("set{set}.clear();");
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::InitRec { var } => {
                    let text = format!("rec = {};", prog.var_name(*var));
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::WriteRec { index, from_arg } => {
                    let rhs = if *from_arg { "__in__" } else { "NULL" };
                    let text = format!("rec.data{index} = {rhs};");
                    self.line(indent, Some(id), &text);
                    cur = prog.next_of(id);
                }
                StmtKind::SetRecEpoch => {
                    self.line(indent, Some(id), "rec.epoch = epoch;");
                    cur = prog.next_of(id);
                }
                StmtKind::GetEpoch => {
                    self.line(indent, Some(id), "epoch = Epoch;");
                    cur = prog.next_of(id);
                }
                StmtKind::IncEpoch => {
                    self.line(indent, Some(id), "Epoch = Epoch + 1;");
                    cur = prog.next_of(id);
                }
            }
        }
    }
}

fn render_program(prog: &Program, print_id: bool) -> String {
    let mut r = Renderer { prog, out: String::new(), print_id };
    r.out.push_str(&format!("PROGRAM {} BEGIN\n", prog.name));
    r.out.push_str(&format!("    GLOBALS: {};\n", prog.globals.join(", ")));
    r.out.push_str(&format!("    LOCALS:  {};\n\n", prog.locals.join(", ")));
    if prog.init_entry.is_some() {
        r.line(1, None, "init {");
        r.chain(prog.init_entry, None, 2);
        r.line(1, None, "}");
    }
    for (_, f) in prog.funcs() {
        let marker = if f.has_input() { "?" } else { "!" };
        r.out.push('\n');
        r.line(1, None, &format!("function[{marker}] {} {{", f.name()));
        r.chain(f.entry(), None, 2);
        r.line(1, None, "}");
    }
    for (_, f) in prog.funcs() {
        if let Some(sum) = f.summary() {
            r.out.push('\n');
            r.line(1, None, &format!("summary({}) ", f.name()));
            r.chain(Some(sum), None, 1);
        }
    }
    r.out.push_str("END\n");
    r.out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_stack() -> Result<Program, ProgError> {
        let push_body = vec![
            mllc("node"),
            read_input("node"),
            loop_(vec![
                assign(var("top"), var("ToS")),
                assign(next("node"), var("top")),
                if_then(
                    cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp(), false)),
                    vec![brk()],
                ),
            ]),
        ];
        let pop_body = vec![loop_(vec![
            assign_lp(var("top"), var("ToS"), lp_cond(eq_cond(var("top"), null()))),
            if_then_else(
                eq_cond(var("top"), null()),
                vec![brk()],
                vec![
                    assign(var("node"), next("top")),
                    if_then(
                        cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp_var("top"), false)),
                        vec![write_output("top"), free("top"), brk()],
                    ),
                ],
            ),
        ])];
        Program::new(
            "TinyStack",
            &["ToS"],
            &["node", "top"],
            vec![set_null(var("ToS"))],
            vec![fun("push", true, push_body), fun("pop", false, pop_body)],
        )
    }

    #[test]
    fn builds_and_wires_control_flow() {
        let prog = tiny_stack().expect("valid program");
        assert_eq!(prog.num_funcs(), 2);
        let push = prog.find("push").unwrap();
        assert!(prog.func(push).has_input());

        // init: single statement, then return
        let init = prog.init_entry().expect("init entry");
        assert!(matches!(prog.stmt(init).kind, StmtKind::SetNull { .. }));
        assert_eq!(prog.next_of(init), None);

        // push: malloc -> read -> loop
        let entry = prog.func(push).entry().expect("body");
        assert!(matches!(prog.stmt(entry).kind, StmtKind::Malloc { .. }));
        let read = prog.next_of(entry).unwrap();
        assert!(matches!(prog.stmt(read).kind, StmtKind::ReadInput { .. }));
        let lp = prog.next_of(read).unwrap();
        let StmtKind::Loop { body, exit } = &prog.stmt(lp).kind else {
            panic!("expected loop");
        };
        assert_eq!(*exit, None);

        // loop body: assign -> assign -> ite, whose false branch re-joins the loop
        let a1 = *body;
        let a2 = prog.next_of(a1).unwrap();
        let ite = prog.next_of(a2).unwrap();
        let StmtKind::Ite { next_true, next_false, join, .. } = &prog.stmt(ite).kind else {
            panic!("expected ite");
        };
        assert_eq!(*next_false, Some(lp), "empty else falls back into the loop");
        assert_eq!(*join, Some(lp));
        let brk_id = next_true.expect("then branch");
        assert!(matches!(prog.stmt(brk_id).kind, StmtKind::Break));
        // break leaves the loop; the loop is the last statement of push
        assert_eq!(prog.next_of(brk_id), None);
    }

    #[test]
    fn statements_know_their_function() {
        let prog = tiny_stack().unwrap();
        let init = prog.init_entry().unwrap();
        assert!(prog.stmt(init).func.is_none());
        let push = prog.find("push").unwrap();
        let entry = prog.func(push).entry().unwrap();
        assert_eq!(prog.stmt(entry).func, Some(push));
        assert!(!prog.is_summary_statement(entry));
    }

    #[test]
    fn listing_mentions_the_operations() {
        let prog = tiny_stack().unwrap();
        let listing = prog.to_string();
        assert!(listing.contains("PROGRAM TinyStack BEGIN"));
        assert!(listing.contains("function[?] push"));
        assert!(listing.contains("function[!] pop"));
        assert!(listing.contains("CAS(ToS, top, node)"));
        assert!(listing.contains("while (true)"));
        assert!(listing.contains("break;"));
    }

    #[test]
    fn rejects_duplicate_and_unknown_names() {
        let err = Program::new("P", &["a", "a"], &[], vec![], vec![]).unwrap_err();
        assert!(matches!(err, ProgError::DuplicateVariable(_)));

        let err = Program::new(
            "P",
            &["a"],
            &["x"],
            vec![],
            vec![fun("f", true, vec![assign(var("x"), var("nope"))])],
        )
        .unwrap_err();
        assert!(matches!(err, ProgError::UnknownVariable(_)));
    }

    #[test]
    fn init_must_not_touch_locals() {
        let err = Program::new("P", &["g"], &["x"], vec![set_null(var("x"))], vec![]).unwrap_err();
        assert!(matches!(err, ProgError::InitUsesLocal(_)));
    }

    #[test]
    fn rejects_next_to_next_assignment() {
        let err = Program::new(
            "P",
            &["g"],
            &["x"],
            vec![],
            vec![fun("f", true, vec![assign(next("x"), next("g"))])],
        )
        .unwrap_err();
        assert!(matches!(err, ProgError::NextToNextAssignment));
    }

    #[test]
    fn reserved_function_name() {
        let err =
            Program::new("P", &["g"], &[], vec![], vec![fun("init", true, vec![])]).unwrap_err();
        assert!(matches!(err, ProgError::ReservedFunctionName));
    }

    #[test]
    fn summary_discipline_rejects_loops_and_double_assignment() {
        let err = Program::new(
            "P",
            &["g"],
            &["x"],
            vec![],
            vec![fun_with_summary("f", true, vec![], vec![loop_(vec![brk()])])],
        )
        .unwrap_err();
        assert!(matches!(err, ProgError::BadSummary { .. }));

        let err = Program::new(
            "P",
            &["g"],
            &["x"],
            vec![],
            vec![fun_with_summary(
                "f",
                true,
                vec![],
                vec![assign(var("x"), var("g")), assign(var("x"), var("g"))],
            )],
        )
        .unwrap_err();
        assert!(matches!(err, ProgError::BadSummary { .. }));
    }

    #[test]
    fn summary_discipline_accepts_publish_and_unlink_shapes() {
        // push summary: malloc; read; node.next = ToS; ToS = node *** push ***
        let push_sum = vec![
            mllc("node"),
            read_input("node"),
            assign(next("node"), var("ToS")),
            assign_lp(var("ToS"), var("node"), lp()),
        ];
        // pop summary: if (ToS == NULL) *** pop(empty) *** else unlink via CAS + free
        let pop_sum = vec![if_then_else(
            eq_cond(var("ToS"), null()),
            vec![linp(lp())],
            vec![
                assign(var("top"), var("ToS")),
                assign(var("node"), next("ToS")),
                cas_stmt(cas_lp(var("ToS"), var("ToS"), var("node"), lp_var("top"), false)),
                free("top"),
            ],
        )];
        let prog = Program::new(
            "P",
            &["ToS"],
            &["node", "top"],
            vec![set_null(var("ToS"))],
            vec![
                fun_with_summary("push", true, vec![], push_sum),
                fun_with_summary("pop", false, vec![], pop_sum),
            ],
        );
        let prog = prog.expect("summaries follow the discipline");
        assert!(prog.func(prog.find("push").unwrap()).summary().is_some());
    }

    #[test]
    fn unlinking_cas_must_free_the_cell() {
        let pop_sum = vec![
            assign(var("top"), var("ToS")),
            assign(var("node"), next("ToS")),
            cas_stmt(cas_lp(var("ToS"), var("ToS"), var("node"), lp_var("top"), false)),
            // missing free("top")
        ];
        let err = Program::new(
            "P",
            &["ToS"],
            &["node", "top"],
            vec![],
            vec![fun_with_summary("pop", false, vec![], pop_sum)],
        )
        .unwrap_err();
        assert!(matches!(err, ProgError::BadSummary { .. }));
    }

    #[test]
    fn retire_enables_reclamation() {
        let prog = Program::new(
            "P",
            &["g"],
            &["x"],
            vec![],
            vec![fun("f", true, vec![retire("x")])],
        )
        .unwrap();
        assert!(prog.uses_reclamation());
        let no = tiny_stack().unwrap();
        assert!(!no.uses_reclamation());
    }
}
