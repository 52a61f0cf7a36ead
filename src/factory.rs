//! Ready-made programs and observers for the drivers and the test suite.
//!
//! The programs are the usual lock-free suspects: the coarse (atomic) queue
//! and stack, Treiber's stack (with the cheating-CAS, atomic-init, and
//! age-field knobs, plus summaries), the Michael–Scott queue (with
//! prophecy-guarded linearisation and summaries), and a DGLM-style queue
//! protected by hazard pointers. The observers are the linearizability
//! automata over the single witness value and the SMR contracts.

use crate::observer::{DataValue, Event, EventFn, Observer, ObserverBuilder, ObserverError};
use crate::prog::{
    assign, assign_lp, atomic, brk, cas, cas_cond, cas_lp, cas_stmt, check_prophecy, comp_cond,
    enter_q, eq_cond, eq_cond_opt_age, free, fun, fun_with_summary, hp_release, hp_set, if_then,
    if_then_else, kill, leave_q, linp, loop_, lp, lp_cond, lp_var, mllc, next, null, oracle,
    oracle_cond, read_input, retire, set_null, var, write_output, Program, ProgError,
};

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// The coarse queue: enqueue and dequeue effects inside atomic blocks.
pub fn coarse_queue(mega_malloc: bool) -> Result<Program, ProgError> {
    let init = vec![
        mllc("H"),
        set_null(next("H")),
        assign(var("T"), var("H")),
    ];

    let publish = atomic(vec![
        linp(lp()),
        assign(next("T"), var("n")),
        assign(var("T"), var("n")),
    ]);
    let enq_body = if mega_malloc {
        vec![
            atomic(vec![mllc("n"), set_null(next("n")), read_input("n")]),
            publish,
        ]
    } else {
        vec![
            mllc("n"),
            set_null(next("n")),
            read_input("n"),
            publish,
        ]
    };

    let deq_body = vec![atomic(vec![
        assign(var("n"), next("H")),
        if_then_else(
            eq_cond(var("n"), null()),
            vec![linp(lp())],
            vec![
                linp(lp_var("n")),
                write_output("n"),
                free("H"),
                assign(var("H"), var("n")),
            ],
        ),
    ])];

    Program::new(
        "CoarseQueue",
        &["H", "T"],
        &["n"],
        init,
        vec![fun("enq", true, enq_body), fun("deq", false, deq_body)],
    )
}

/// The coarse stack.
pub fn coarse_stack(mega_malloc: bool) -> Result<Program, ProgError> {
    let init = vec![set_null(var("ToS"))];

    let publish = atomic(vec![
        linp(lp()),
        assign(next("n"), var("ToS")),
        assign(var("ToS"), var("n")),
    ]);
    let push_body = if mega_malloc {
        vec![
            atomic(vec![mllc("n"), set_null(next("n")), read_input("n")]),
            publish,
        ]
    } else {
        vec![mllc("n"), set_null(next("n")), read_input("n"), publish]
    };

    let pop_body = vec![atomic(vec![
        assign(var("n"), var("ToS")),
        if_then_else(
            eq_cond(var("n"), null()),
            vec![linp(lp())],
            vec![
                linp(lp_var("n")),
                write_output("n"),
                assign(var("ToS"), next("n")),
                free("n"),
            ],
        ),
    ])];

    Program::new(
        "CoarseStack",
        &["ToS"],
        &["n"],
        init,
        vec![fun("push", true, push_body), fun("pop", false, pop_body)],
    )
}

/// Treiber's stack. `cheating_cas` dereferences `top.next` inside the CAS
/// (not available in hardware); `use_ages` makes comparisons age-checked.
pub fn treibers_stack(
    cheating_cas: bool,
    mega_malloc: bool,
    use_ages: bool,
) -> Result<Program, ProgError> {
    let init = vec![set_null(var("ToS"))];

    let push_loop = loop_(vec![
        assign(var("top"), var("ToS")),
        assign(next("node"), var("top")),
        if_then(
            cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp(), use_ages)),
            vec![brk()],
        ),
    ]);
    let push_body = if mega_malloc {
        vec![atomic(vec![mllc("node"), read_input("node")]), push_loop]
    } else {
        vec![mllc("node"), read_input("node"), push_loop]
    };

    let pop_hit = vec![write_output("top"), free("top"), brk()];
    let pop_else = if cheating_cas {
        vec![if_then(
            cas_cond(cas_lp(var("ToS"), var("top"), next("top"), lp_var("top"), use_ages)),
            pop_hit,
        )]
    } else {
        vec![
            assign(var("node"), next("top")),
            if_then(
                cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp_var("top"), use_ages)),
                pop_hit,
            ),
        ]
    };
    let pop_body = vec![loop_(vec![
        assign_lp(var("top"), var("ToS"), lp_cond(eq_cond(var("top"), null()))),
        if_then_else(eq_cond(var("top"), null()), vec![brk()], pop_else),
    ])];

    let push_summary = vec![
        mllc("node"),
        read_input("node"),
        assign(next("node"), var("ToS")),
        assign_lp(var("ToS"), var("node"), lp()),
    ];
    let pop_summary = vec![if_then_else(
        eq_cond(var("ToS"), null()),
        vec![linp(lp())],
        vec![
            assign(var("top"), var("ToS")),
            assign(var("node"), next("ToS")),
            cas_stmt(cas_lp(var("ToS"), var("ToS"), var("node"), lp_var("top"), use_ages)),
            free("top"),
        ],
    )];

    Program::new(
        "TreibersStack",
        &["ToS"],
        &["node", "top"],
        init,
        vec![
            fun_with_summary("push", true, push_body, push_summary),
            fun_with_summary("pop", false, pop_body, pop_summary),
        ],
    )
}

/// Treiber's stack under epoch-based reclamation: operations run outside
/// the quiescent period and retire instead of freeing.
pub fn treibers_stack_ebr(use_ages: bool) -> Result<Program, ProgError> {
    let init = vec![set_null(var("ToS"))];

    let push_body = vec![
        leave_q(),
        mllc("node"),
        read_input("node"),
        loop_(vec![
            assign(var("top"), var("ToS")),
            assign(next("node"), var("top")),
            if_then(
                cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp(), use_ages)),
                vec![brk()],
            ),
        ]),
        enter_q(),
    ];

    let pop_body = vec![
        leave_q(),
        loop_(vec![
            assign_lp(var("top"), var("ToS"), lp_cond(eq_cond(var("top"), null()))),
            if_then_else(
                eq_cond(var("top"), null()),
                vec![brk()],
                vec![
                    assign(var("node"), next("top")),
                    if_then(
                        cas_cond(cas_lp(var("ToS"), var("top"), var("node"), lp_var("top"), use_ages)),
                        vec![write_output("top"), retire("top"), brk()],
                    ),
                ],
            ),
        ]),
        enter_q(),
    ];

    Program::new(
        "TreibersStackEBR",
        &["ToS"],
        &["node", "top"],
        init,
        vec![fun("push", true, push_body), fun("pop", false, pop_body)],
    )
}

/// The Michael–Scott queue, with prophecy-guarded empty dequeues and
/// per-function summaries.
pub fn michael_scott_queue(
    mega_malloc: bool,
    age_compare: bool,
    use_ages: bool,
) -> Result<Program, ProgError> {
    assert!(
        !age_compare || use_ages,
        "conditionals may only compare age fields when age fields are in use"
    );
    let init = vec![
        mllc("Head"),
        set_null(next("Head")),
        assign(var("Tail"), var("Head")),
    ];

    let enq_loop = loop_(vec![
        assign(var("t"), var("Tail")),
        assign(var("n"), next("t")),
        if_then(
            eq_cond_opt_age(var("t"), var("Tail"), age_compare),
            vec![if_then_else(
                eq_cond(var("n"), null()),
                vec![if_then(
                    cas_cond(cas_lp(next("t"), var("n"), var("h"), lp(), use_ages)),
                    vec![brk()],
                )],
                vec![cas_stmt(cas(var("Tail"), var("t"), var("n"), use_ages))],
            )],
        ),
        kill("t"),
        kill("n"),
        set_null(next("h")),
    ]);
    let enq_body = if mega_malloc {
        vec![
            atomic(vec![mllc("h"), set_null(next("h")), read_input("h")]),
            enq_loop,
            cas_stmt(cas(var("Tail"), var("t"), var("h"), use_ages)),
        ]
    } else {
        vec![
            mllc("h"),
            set_null(next("h")),
            read_input("h"),
            enq_loop,
            cas_stmt(cas(var("Tail"), var("t"), var("h"), use_ages)),
        ]
    };

    // deq(empty) fires while reading h.next, guarded by the prophecy and the
    // emptiness conditions
    let empty_guard = comp_cond(
        oracle_cond(),
        comp_cond(
            eq_cond_opt_age(var("h"), var("Head"), age_compare),
            comp_cond(eq_cond(var("h"), var("t")), eq_cond(var("n"), null())),
        ),
    );
    let deq_body = vec![loop_(vec![
        assign(var("h"), var("Head")),
        assign(var("t"), var("Tail")),
        oracle(),
        assign_lp(var("n"), next("h"), lp_cond(empty_guard)),
        if_then(
            eq_cond_opt_age(var("h"), var("Head"), age_compare),
            vec![if_then_else(
                eq_cond(var("h"), var("t")),
                vec![
                    if_then(eq_cond(var("n"), null()), vec![check_prophecy(true), brk()]),
                    cas_stmt(cas(var("Tail"), var("t"), var("n"), use_ages)),
                ],
                vec![if_then(
                    cas_cond(cas_lp(var("Head"), var("h"), var("n"), lp_var("n"), use_ages)),
                    vec![check_prophecy(false), write_output("n"), free("h"), brk()],
                )],
            )],
        ),
        kill("n"),
    ])];

    let enq_summary = vec![
        assign(var("t"), var("Tail")),
        assign(var("n"), next("t")),
        if_then_else(
            eq_cond(var("n"), null()),
            vec![
                mllc("h"),
                read_input("h"),
                cas_stmt(cas_lp(next("t"), var("n"), var("h"), lp(), use_ages)),
            ],
            // help: swing the tail forward
            vec![assign(var("Tail"), var("n"))],
        ),
    ];
    let deq_summary = vec![
        assign(var("h"), var("Head")),
        assign(var("n"), next("Head")),
        if_then_else(
            eq_cond(var("n"), null()),
            vec![linp(lp())],
            vec![
                cas_stmt(cas_lp(var("Head"), var("Head"), var("n"), lp_var("n"), use_ages)),
                free("h"),
            ],
        ),
    ];

    Program::new(
        "MichaelScottQueue",
        &["Head", "Tail"],
        &["h", "t", "n"],
        init,
        vec![
            fun_with_summary("enq", true, enq_body, enq_summary),
            fun_with_summary("deq", false, deq_body, deq_summary),
        ],
    )
}

/// A DGLM-style queue whose dequeuers protect the head with hazard pointers
/// and retire it instead of freeing.
pub fn dglm_queue(mega_malloc: bool) -> Result<Program, ProgError> {
    let init = vec![
        mllc("Head"),
        set_null(next("Head")),
        assign(var("Tail"), var("Head")),
    ];

    let enq_loop = loop_(vec![
        assign(var("t"), var("Tail")),
        assign(var("n"), next("t")),
        if_then(
            eq_cond(var("t"), var("Tail")),
            vec![if_then_else(
                eq_cond(var("n"), null()),
                vec![if_then(
                    cas_cond(cas_lp(next("t"), var("n"), var("h"), lp(), false)),
                    vec![brk()],
                )],
                vec![cas_stmt(cas(var("Tail"), var("t"), var("n"), false))],
            )],
        ),
        kill("t"),
        kill("n"),
        set_null(next("h")),
    ]);
    let enq_body = if mega_malloc {
        vec![
            atomic(vec![mllc("h"), set_null(next("h")), read_input("h")]),
            enq_loop,
            cas_stmt(cas(var("Tail"), var("t"), var("h"), false)),
        ]
    } else {
        vec![
            mllc("h"),
            set_null(next("h")),
            read_input("h"),
            enq_loop,
            cas_stmt(cas(var("Tail"), var("t"), var("h"), false)),
        ]
    };

    let deq_body = vec![loop_(vec![
        assign(var("h"), var("Head")),
        hp_set("h", 0),
        if_then(
            eq_cond(var("h"), var("Head")),
            vec![
                oracle(),
                assign_lp(
                    var("n"),
                    next("h"),
                    lp_cond(comp_cond(oracle_cond(), eq_cond(var("n"), null()))),
                ),
                if_then_else(
                    eq_cond(var("n"), null()),
                    vec![check_prophecy(true), hp_release(0), brk()],
                    vec![
                        check_prophecy(false),
                        assign(var("t"), var("Tail")),
                        if_then(
                            eq_cond(var("h"), var("t")),
                            vec![cas_stmt(cas(var("Tail"), var("t"), var("n"), false))],
                        ),
                        if_then(
                            cas_cond(cas_lp(var("Head"), var("h"), var("n"), lp_var("n"), false)),
                            vec![
                                write_output("n"),
                                retire("h"),
                                hp_release(0),
                                brk(),
                            ],
                        ),
                    ],
                ),
            ],
        ),
        kill("n"),
        kill("t"),
    ])];

    Program::new(
        "DGLMQueue",
        &["Head", "Tail"],
        &["h", "t", "n"],
        init,
        vec![fun("enq", true, enq_body), fun("deq", false, deq_body)],
    )
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

const BOTH_THREADS: [bool; 2] = [true, false];

/// Trivial SMR observer for structures that free directly.
pub fn no_reclamation_observer() -> Result<Observer, ObserverError> {
    let mut b = ObserverBuilder::new();
    b.initial("env:idle");
    b.build()
}

/// The retire/free contract: double retires are usage violations, freeing a
/// cell that was not retired is a defect.
pub fn base_observer() -> Result<Observer, ObserverError> {
    let mut b = ObserverBuilder::new();
    let freed = b.initial("base:freed");
    let retired0 = b.state("base:retired0");
    let retired1 = b.colored("base:retired1", 1);
    let dupfree = b.final_state("base:double-free");
    let dupretire = b.marked("base:double-retire");

    let d = DataValue::Data;
    b.transition(freed, Event::enter(EventFn::Retire, true, d), retired1)?;
    b.transition(freed, Event::enter(EventFn::Retire, false, d), retired0)?;
    for src in [retired0, retired1] {
        for t in BOTH_THREADS {
            b.transition(src, Event::enter(EventFn::Retire, t, d), dupretire)?;
            b.transition(src, Event::free(t, d), freed)?;
        }
    }
    b.transition(freed, Event::free(true, d), dupfree)?;
    b.build()
}

/// The hazard-pointer contract, one lane per guard slot: a cell that was
/// protected, validated (exit) and then retired must not be freed.
pub fn hp_observer() -> Result<Observer, ObserverError> {
    let mut b = ObserverBuilder::new();
    let d = DataValue::Data;
    let o = DataValue::Other;

    for index in 0..2u8 {
        let init = b.initial(&format!("hp{index}:init"));
        let entered = b.state(&format!("hp{index}:entered"));
        let exited = b.state(&format!("hp{index}:exited"));
        let retired = b.state(&format!("hp{index}:retired"));
        let fatal = b.final_state(&format!("hp{index}:freed-protected"));

        b.transition(init, Event::enter(EventFn::Protect(index), true, d), entered)?;
        b.transition(entered, Event::exit(true), exited)?;
        for t in BOTH_THREADS {
            b.transition(exited, Event::enter(EventFn::Retire, t, d), retired)?;
            b.transition(retired, Event::free(t, d), fatal)?;
            // protection engages as soon as the pointer is published
            b.transition(entered, Event::free(t, d), fatal)?;
        }
        for src in [entered, exited, retired] {
            b.transition(src, Event::enter(EventFn::Protect(index), true, o), init)?;
            b.transition(src, Event::enter(EventFn::Unprotect(index), true, d), init)?;
            b.transition(src, Event::enter(EventFn::Unprotect(index), true, o), init)?;
        }
    }
    b.build()
}

/// The epoch/quiescent-period contract plus its usage-invariant lanes.
pub fn ebr_observer() -> Result<Observer, ObserverError> {
    let mut b = ObserverBuilder::new();
    let o = DataValue::Other;
    let d = DataValue::Data;

    let init = b.initial("ebr:init");
    let leaving = b.state("ebr:leavingQ");
    let left = b.state("ebr:leftQ");
    let retired = b.state("ebr:retired");
    let fatal = b.final_state("ebr:freed-protected");
    b.transition(init, Event::enter(EventFn::LeaveQ, true, o), leaving)?;
    b.transition(leaving, Event::exit(true), left)?;
    for t in BOTH_THREADS {
        b.transition(left, Event::enter(EventFn::Retire, t, d), retired)?;
        b.transition(retired, Event::free(t, d), fatal)?;
    }
    for src in [leaving, left, retired] {
        b.transition(src, Event::enter(EventFn::EnterQ, true, o), init)?;
    }

    let in_q = b.initial("inv:inQ");
    let out_q = b.state("inv:outQ");
    let sink = b.marked("inv:sink");
    for t in BOTH_THREADS {
        b.transition(in_q, Event::enter(EventFn::LeaveQ, t, o), out_q)?;
        b.transition(out_q, Event::enter(EventFn::EnterQ, t, o), in_q)?;
        b.transition(out_q, Event::enter(EventFn::LeaveQ, t, o), sink)?;
    }
    b.build()
}

/// Linearizability observer for queues over the single witness: one lane for
/// creation/duplication, one for loss by reclamation.
pub fn queue_observer(prog: &Program) -> Result<Observer, ObserverError> {
    fifo_observer(prog, "enq", "deq")
}

/// The stack observer shares the single-witness lanes.
pub fn stack_observer(prog: &Program) -> Result<Observer, ObserverError> {
    fifo_observer(prog, "push", "pop")
}

fn fifo_observer(prog: &Program, put: &str, get: &str) -> Result<Observer, ObserverError> {
    let put = EventFn::Call(prog.find(put).expect("producer operation"));
    let get = EventFn::Call(prog.find(get).expect("consumer operation"));
    let d = DataValue::Data;
    let mut b = ObserverBuilder::new();

    // lane 1: the witness is produced once and consumed at most once
    let fresh = b.initial("lin:fresh");
    let inside = b.state("lin:inside");
    let taken = b.state("lin:taken");
    let bad = b.final_state("lin:misuse");
    for t in BOTH_THREADS {
        b.transition(fresh, Event::enter(put, t, d), inside)?;
        b.transition(fresh, Event::enter(get, t, d), bad)?;
        b.transition(inside, Event::enter(get, t, d), taken)?;
        b.transition(taken, Event::enter(get, t, d), bad)?;
    }

    // lane 2: the witness must not be reclaimed while logically inside
    let idle = b.initial("loss:idle");
    let live = b.state("loss:live");
    let done = b.state("loss:done");
    let lost = b.final_state("loss:lost");
    for t in BOTH_THREADS {
        b.transition(idle, Event::enter(put, t, d), live)?;
        b.transition(live, Event::free(t, d), lost)?;
        b.transition(live, Event::enter(get, t, d), done)?;
    }
    b.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn programs_build() {
        for mega in [false, true] {
            assert!(coarse_queue(mega).is_ok());
            assert!(coarse_stack(mega).is_ok());
            assert!(treibers_stack(true, mega, true).is_ok());
            assert!(treibers_stack(false, mega, false).is_ok());
            assert!(treibers_stack_ebr(false).is_ok());
            assert!(michael_scott_queue(mega, false, false).is_ok());
            assert!(michael_scott_queue(mega, true, true).is_ok());
            assert!(dglm_queue(mega).is_ok());
        }
    }

    #[test]
    fn observers_build_deterministically() {
        let q = coarse_queue(false).unwrap();
        assert!(queue_observer(&q).is_ok());
        assert!(no_reclamation_observer().is_ok());
        assert!(base_observer().is_ok());
        assert!(hp_observer().is_ok());
        assert!(ebr_observer().is_ok());
    }

    #[test]
    fn listings_render() {
        let prog = treibers_stack(true, false, true).unwrap();
        let listing = prog.to_string();
        assert!(listing.contains("PROGRAM TreibersStack BEGIN"));
        assert!(listing.contains("CAS(ToS, top, top.next [age])"));
        assert!(listing.contains("summary(push)"));
    }

    #[test]
    fn queue_observer_accepts_a_fifo_history_and_flags_a_double_take() {
        let prog = coarse_queue(false).unwrap();
        let obs = queue_observer(&prog).unwrap();
        let enq = EventFn::Call(prog.find("enq").unwrap());
        let deq = EventFn::Call(prog.find("deq").unwrap());
        let d = DataValue::Data;

        let s0 = obs.initial_state().clone();
        let s1 = s0.next(&obs, &Event::enter(enq, true, d));
        assert!(!s1.is_final(&obs));
        let s2 = s1.next(&obs, &Event::enter(deq, false, d));
        assert!(!s2.is_final(&obs));
        let s3 = s2.next(&obs, &Event::free(false, d));
        assert!(!s3.is_final(&obs), "freeing after the take is fine");
        let dup = s2.next(&obs, &Event::enter(deq, true, d));
        assert!(dup.is_final(&obs), "taking the witness twice must fire");
    }

    #[test]
    fn queue_observer_flags_loss_of_an_enqueued_witness() {
        let prog = coarse_queue(false).unwrap();
        let obs = queue_observer(&prog).unwrap();
        let enq = EventFn::Call(prog.find("enq").unwrap());
        let d = DataValue::Data;
        let s = obs
            .initial_state()
            .next(&obs, &Event::enter(enq, true, d))
            .next(&obs, &Event::free(false, d));
        assert!(s.is_final(&obs));
        assert_eq!(s.find_final(&obs), "loss:lost");
    }
}
