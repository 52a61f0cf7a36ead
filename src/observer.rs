//! Observer automata.
//!
//! Observers are deterministic finite automata over the event alphabet of the
//! analysis: function/SMR-operation entry, function exit, and memory
//! reclamation. A linearizability observer judges histories of the data
//! structure's operations; an SMR observer encodes the contract of the
//! reclamation scheme (hazard pointers, quiescent periods, plain free).
//!
//! A [`MultiState`] is the parallel product of all initial states: stepping
//! an event advances every component, and the observer "fires" as soon as any
//! component is final. Entering a *marked* state means the execution violated
//! a usage invariant of the SMR scheme — such executions are discarded, not
//! reported.

use std::fmt;

use thiserror::Error;

use crate::prog::FuncId;

/// Whether an event's payload is the observed witness.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataValue {
    /// The observed witness value (or address).
    Data,
    /// Any other value.
    Other,
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Data => f.write_str("<D>"),
            DataValue::Other => f.write_str("<?>"),
        }
    }
}

/// The operation an `Enter` event reports.
///
/// Data-structure operations are program functions; the SMR operations are
/// fired directly by the corresponding statements.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventFn {
    /// Entry of a program function (also fired by linearisation points).
    Call(FuncId),
    /// A cell was retired to the reclamation scheme.
    Retire,
    /// Hazard pointer `0` or `1` was set.
    Protect(u8),
    /// Hazard pointer `0` or `1` was released.
    Unprotect(u8),
    /// The thread entered a quiescent period.
    EnterQ,
    /// The thread left its quiescent period.
    LeaveQ,
}

/// An observer event. The `thread` flag is `true` for the observed thread.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Enter {
        func: EventFn,
        thread: bool,
        dval: DataValue,
    },
    Exit {
        thread: bool,
    },
    Free {
        thread: bool,
        dval: DataValue,
    },
}

impl Event {
    pub fn enter(func: EventFn, thread: bool, dval: DataValue) -> Event {
        Event::Enter { func, thread, dval }
    }

    pub fn exit(thread: bool) -> Event {
        Event::Exit { thread }
    }

    pub fn free(thread: bool, dval: DataValue) -> Event {
        Event::Free { thread, dval }
    }
}

/// Index of a state within its [`Observer`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub u16);

/// Construction-time errors for observers.
#[derive(Debug, Error)]
pub enum ObserverError {
    #[error("non-deterministic observer: state '{state}' has two transitions for the same trigger")]
    NonDeterministic { state: String },
    #[error("observers must have an initial state")]
    NoInitialState,
    #[error("transition endpoint {0:?} does not exist")]
    UnknownState(StateId),
}

struct State {
    name: String,
    is_initial: bool,
    is_final: bool,
    is_marked: bool,
    color: Option<u32>,
    out: Vec<(Event, StateId)>,
}

/// Builder for observers; states first, then transitions.
pub struct ObserverBuilder {
    states: Vec<State>,
}

impl ObserverBuilder {
    pub fn new() -> ObserverBuilder {
        ObserverBuilder { states: Vec::new() }
    }

    fn push(&mut self, state: State) -> StateId {
        let id = StateId(self.states.len() as u16);
        self.states.push(state);
        id
    }

    pub fn state(&mut self, name: &str) -> StateId {
        self.push(State {
            name: name.to_owned(),
            is_initial: false,
            is_final: false,
            is_marked: false,
            color: None,
            out: Vec::new(),
        })
    }

    pub fn initial(&mut self, name: &str) -> StateId {
        let id = self.state(name);
        self.states[id.0 as usize].is_initial = true;
        id
    }

    pub fn final_state(&mut self, name: &str) -> StateId {
        let id = self.state(name);
        self.states[id.0 as usize].is_final = true;
        id
    }

    /// A usage-invariant violation state; executions reaching it are dropped.
    pub fn marked(&mut self, name: &str) -> StateId {
        let id = self.state(name);
        self.states[id.0 as usize].is_marked = true;
        id
    }

    /// A colored state: equal colors must not be held by the observed thread
    /// and an interferer at the same time (interference pruning hint).
    pub fn colored(&mut self, name: &str, color: u32) -> StateId {
        let id = self.state(name);
        self.states[id.0 as usize].color = Some(color);
        id
    }

    /// Add a transition; rejects duplicate triggers (determinism).
    pub fn transition(&mut self, src: StateId, trigger: Event, dst: StateId) -> Result<(), ObserverError> {
        if dst.0 as usize >= self.states.len() {
            return Err(ObserverError::UnknownState(dst));
        }
        let state = self
            .states
            .get_mut(src.0 as usize)
            .ok_or(ObserverError::UnknownState(src))?;
        if state.out.iter().any(|(evt, _)| *evt == trigger) {
            return Err(ObserverError::NonDeterministic {
                state: state.name.clone(),
            });
        }
        state.out.push((trigger, dst));
        Ok(())
    }

    pub fn build(self) -> Result<Observer, ObserverError> {
        let init: Vec<StateId> = self
            .states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_initial)
            .map(|(i, _)| StateId(i as u16))
            .collect();
        if init.is_empty() {
            return Err(ObserverError::NoInitialState);
        }
        Ok(Observer {
            states: self.states,
            init: MultiState { states: init },
        })
    }
}

impl Default for ObserverBuilder {
    fn default() -> Self {
        ObserverBuilder::new()
    }
}

/// A deterministic observer automaton.
pub struct Observer {
    states: Vec<State>,
    init: MultiState,
}

impl Observer {
    /// The multi-state the initial configuration starts from.
    pub fn initial_state(&self) -> &MultiState {
        &self.init
    }

    pub fn name(&self, s: StateId) -> &str {
        &self.states[s.0 as usize].name
    }

    pub fn is_final(&self, s: StateId) -> bool {
        self.states[s.0 as usize].is_final
    }

    pub fn is_marked(&self, s: StateId) -> bool {
        self.states[s.0 as usize].is_marked
    }

    pub fn color(&self, s: StateId) -> Option<u32> {
        self.states[s.0 as usize].color
    }

    /// Deterministic step; with no enabled transition the state is kept.
    pub fn next(&self, s: StateId, evt: &Event) -> StateId {
        for (trigger, dst) in &self.states[s.0 as usize].out {
            if trigger == evt {
                return *dst;
            }
        }
        s
    }
}

/// Parallel product of the observer's initial states.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct MultiState {
    states: Vec<StateId>,
}

impl MultiState {
    pub fn states(&self) -> &[StateId] {
        &self.states
    }

    /// Step every component.
    pub fn next(&self, obs: &Observer, evt: &Event) -> MultiState {
        MultiState {
            states: self.states.iter().map(|&s| obs.next(s, evt)).collect(),
        }
    }

    /// The observer fires as soon as any component accepts.
    pub fn is_final(&self, obs: &Observer) -> bool {
        self.states.iter().any(|&s| obs.is_final(s))
    }

    /// A usage invariant was broken; the execution is infeasible.
    pub fn is_marked(&self, obs: &Observer) -> bool {
        self.states.iter().any(|&s| obs.is_marked(s))
    }

    /// Name of some accepting component; panics if none is final.
    pub fn find_final<'a>(&self, obs: &'a Observer) -> &'a str {
        self.states
            .iter()
            .find(|&&s| obs.is_final(s))
            .map(|&s| obs.name(s))
            .expect("find_final on non-final multi-state")
    }

    pub fn render(&self, obs: &Observer) -> String {
        let names: Vec<&str> = self.states.iter().map(|&s| obs.name(s)).collect();
        format!("{{ {} }}", names.join(", "))
    }
}

/// Whether two per-cell guard states carry the same color.
pub fn colors_clash(obs: &Observer, a: Option<StateId>, b: Option<StateId>) -> bool {
    match (a.and_then(|s| obs.color(s)), b.and_then(|s| obs.color(s))) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toggle_observer() -> (Observer, StateId, StateId) {
        let mut b = ObserverBuilder::new();
        let off = b.initial("off");
        let on = b.state("on");
        let bad = b.final_state("bad");
        let evt_on = Event::enter(EventFn::EnterQ, true, DataValue::Data);
        let evt_off = Event::enter(EventFn::LeaveQ, true, DataValue::Data);
        b.transition(off, evt_on, on).unwrap();
        b.transition(on, evt_off, off).unwrap();
        b.transition(on, evt_on, bad).unwrap();
        (b.build().unwrap(), off, on)
    }

    #[test]
    fn determinism_is_enforced() {
        let mut b = ObserverBuilder::new();
        let s = b.initial("s");
        let t = b.state("t");
        let evt = Event::free(true, DataValue::Data);
        b.transition(s, evt, t).unwrap();
        let err = b.transition(s, evt, s).unwrap_err();
        assert!(matches!(err, ObserverError::NonDeterministic { .. }));
    }

    #[test]
    fn an_initial_state_is_required() {
        let mut b = ObserverBuilder::new();
        b.state("lonely");
        assert!(matches!(b.build(), Err(ObserverError::NoInitialState)));
    }

    #[test]
    fn stepping_follows_transitions_and_stays_otherwise() {
        let (obs, off, on) = toggle_observer();
        let evt_on = Event::enter(EventFn::EnterQ, true, DataValue::Data);
        let unknown = Event::exit(false);
        assert_eq!(obs.next(off, &evt_on), on);
        assert_eq!(obs.next(off, &unknown), off);
    }

    #[test]
    fn multi_state_fires_on_any_final_component() {
        let (obs, _, _) = toggle_observer();
        let evt_on = Event::enter(EventFn::EnterQ, true, DataValue::Data);
        let init = obs.initial_state().clone();
        assert!(!init.is_final(&obs));
        let once = init.next(&obs, &evt_on);
        assert!(!once.is_final(&obs));
        let twice = once.next(&obs, &evt_on);
        assert!(twice.is_final(&obs));
        assert_eq!(twice.find_final(&obs), "bad");
    }

    #[test]
    fn colors_clash_on_equal_colors_only() {
        let mut b = ObserverBuilder::new();
        let a = b.initial("a");
        let red = b.colored("red", 1);
        let red2 = b.colored("red2", 1);
        let blue = b.colored("blue", 2);
        let obs = b.build().unwrap();
        assert!(colors_clash(&obs, Some(red), Some(red2)));
        assert!(!colors_clash(&obs, Some(red), Some(blue)));
        assert!(!colors_clash(&obs, Some(red), Some(a)));
        assert!(!colors_clash(&obs, Some(red), None));
    }
}
