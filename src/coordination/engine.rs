//! Generic transition engine over a declared state graph
//!
//! Transitions are plain data: a name, a source state, a target and a function
//! over a typed context. The engine only dispatches; each function checks the
//! live state itself, performs its side effects and writes the target state.

use crate::error::{BridgeError, BridgeResult};

use std::fmt::Debug;
use tracing::{debug, info};

/// Context handed to transition functions; exposes the tracker's live state
pub trait TransitionContext {
    type State: Copy + Eq + Debug;

    fn current_state(&self) -> Self::State;
}

/// Where a transition leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<S> {
    State(S),
    /// The tracker and its jobs are removed once the function succeeds
    Deleted,
}

pub type TransitionFn<C> = fn(&mut C) -> BridgeResult<()>;

/// A named directed edge of the state graph
pub struct Transition<C: TransitionContext> {
    pub name: &'static str,
    pub from: C::State,
    pub to: Target<C::State>,
    pub func: TransitionFn<C>,
}

impl<C: TransitionContext> Clone for Transition<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            from: self.from,
            to: self.to,
            func: self.func,
        }
    }
}

impl<C: TransitionContext> Debug for Transition<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transition")
            .field("name", &self.name)
            .field("from", &self.from)
            .field("to", &self.to)
            .finish()
    }
}

/// Result of processing one context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<S> {
    /// No transition fired (not applicable yet, or none registered)
    Unchanged,
    Advanced(S),
    Deleted,
}

/// Finite state machine executor
pub struct Engine<C: TransitionContext> {
    states: Vec<C::State>,
    transitions: Vec<Transition<C>>,
}

impl<C: TransitionContext> Engine<C> {
    /// Declare the closed set of valid states
    pub fn new(states: impl IntoIterator<Item = C::State>) -> Self {
        Self {
            states: states.into_iter().collect(),
            transitions: Vec::new(),
        }
    }

    /// Add an edge. Undeclared states and duplicate names are rejected.
    pub fn register(&mut self, transition: Transition<C>) -> BridgeResult<()> {
        if !self.states.contains(&transition.from) {
            return Err(BridgeError::Registration(format!(
                "{}: source state {:?} is not declared",
                transition.name, transition.from
            )));
        }
        if let Target::State(to) = transition.to {
            if !self.states.contains(&to) {
                return Err(BridgeError::Registration(format!(
                    "{}: target state {:?} is not declared",
                    transition.name, to
                )));
            }
        }
        if self.transitions.iter().any(|t| t.name == transition.name) {
            return Err(BridgeError::Registration(format!(
                "{}: transition already registered",
                transition.name
            )));
        }

        debug!(
            "Registered transition {} ({:?} -> {:?})",
            transition.name, transition.from, transition.to
        );
        self.transitions.push(transition);
        Ok(())
    }

    /// Run every transition leaving the context's current state.
    ///
    /// Stops at the first failing function and returns its error; a failing
    /// function must leave the tracker untouched.
    pub fn process(&self, ctx: &mut C) -> BridgeResult<Outcome<C::State>> {
        let from = ctx.current_state();
        if !self.states.contains(&from) {
            return Err(BridgeError::UnknownState(format!("{:?}", from)));
        }

        let mut outcome = Outcome::Unchanged;
        for transition in self.transitions.iter().filter(|t| t.from == from) {
            if let Err(e) = (transition.func)(ctx) {
                if e.is_invalid_transition() {
                    debug!("Transition {} not applicable: {}", transition.name, e);
                } else {
                    crate::metrics::record_transition_failed(transition.name);
                }
                return Err(e);
            }

            match transition.to {
                Target::Deleted => {
                    info!("Transition {} removed tracker", transition.name);
                    crate::metrics::record_transition(transition.name);
                    return Ok(Outcome::Deleted);
                }
                Target::State(to) => {
                    let now = ctx.current_state();
                    if now == to && now != from {
                        info!("Transition {}: {:?} -> {:?}", transition.name, from, to);
                        crate::metrics::record_transition(transition.name);
                        outcome = Outcome::Advanced(to);
                    } else if now != from {
                        return Err(BridgeError::Internal(format!(
                            "{} moved tracker to {:?}, expected {:?}",
                            transition.name, now, to
                        )));
                    }
                }
            }
        }

        Ok(outcome)
    }

    pub fn states(&self) -> &[C::State] {
        &self.states
    }

    pub fn transitions(&self) -> &[Transition<C>] {
        &self.transitions
    }

    pub fn transitions_from(&self, state: C::State) -> impl Iterator<Item = &Transition<C>> {
        self.transitions.iter().filter(move |t| t.from == state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Yellow,
        Broken,
    }

    struct Ctx {
        state: Light,
        ready: bool,
        removed: bool,
    }

    impl TransitionContext for Ctx {
        type State = Light;

        fn current_state(&self) -> Light {
            self.state
        }
    }

    fn go(ctx: &mut Ctx) -> BridgeResult<()> {
        if ctx.state != Light::Red {
            return Err(BridgeError::invalid_transition("GO", ctx.state));
        }
        if ctx.ready {
            ctx.state = Light::Green;
        }
        Ok(())
    }

    fn slow(ctx: &mut Ctx) -> BridgeResult<()> {
        if ctx.state != Light::Green {
            return Err(BridgeError::invalid_transition("SLOW", ctx.state));
        }
        ctx.state = Light::Yellow;
        Ok(())
    }

    fn scrap(ctx: &mut Ctx) -> BridgeResult<()> {
        if ctx.state != Light::Yellow {
            return Err(BridgeError::invalid_transition("SCRAP", ctx.state));
        }
        ctx.removed = true;
        Ok(())
    }

    fn engine() -> Engine<Ctx> {
        let mut engine = Engine::new([Light::Red, Light::Green, Light::Yellow]);
        engine
            .register(Transition {
                name: "GO",
                from: Light::Red,
                to: Target::State(Light::Green),
                func: go,
            })
            .unwrap();
        engine
            .register(Transition {
                name: "SLOW",
                from: Light::Green,
                to: Target::State(Light::Yellow),
                func: slow,
            })
            .unwrap();
        engine
            .register(Transition {
                name: "SCRAP",
                from: Light::Yellow,
                to: Target::Deleted,
                func: scrap,
            })
            .unwrap();
        engine
    }

    #[test]
    fn test_registration_rejects_undeclared_states_and_duplicates() {
        let mut engine = engine();
        let err = engine
            .register(Transition {
                name: "BREAK",
                from: Light::Red,
                to: Target::State(Light::Broken),
                func: go,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Registration(_)));

        let err = engine
            .register(Transition {
                name: "GO",
                from: Light::Green,
                to: Target::State(Light::Red),
                func: go,
            })
            .unwrap_err();
        assert!(matches!(err, BridgeError::Registration(_)));
        assert_eq!(engine.transitions().len(), 3);
    }

    #[test]
    fn test_process_walks_graph() {
        let engine = engine();
        let mut ctx = Ctx {
            state: Light::Red,
            ready: false,
            removed: false,
        };

        assert_eq!(engine.process(&mut ctx).unwrap(), Outcome::Unchanged);
        ctx.ready = true;
        assert_eq!(
            engine.process(&mut ctx).unwrap(),
            Outcome::Advanced(Light::Green)
        );
        assert_eq!(
            engine.process(&mut ctx).unwrap(),
            Outcome::Advanced(Light::Yellow)
        );
        assert_eq!(engine.process(&mut ctx).unwrap(), Outcome::Deleted);
        assert!(ctx.removed);
    }

    #[test]
    fn test_guard_rejects_stale_state() {
        let mut ctx = Ctx {
            state: Light::Green,
            ready: true,
            removed: false,
        };
        let err = go(&mut ctx).unwrap_err();
        assert!(err.is_invalid_transition());
        assert_eq!(ctx.state, Light::Green);
    }

    #[test]
    fn test_undeclared_state_is_a_defect() {
        let engine = engine();
        let mut ctx = Ctx {
            state: Light::Broken,
            ready: true,
            removed: false,
        };
        assert!(matches!(
            engine.process(&mut ctx),
            Err(BridgeError::UnknownState(_))
        ));
    }

    #[test]
    fn test_transitions_from_is_inspectable() {
        let engine = engine();
        let names: Vec<_> = engine.transitions_from(Light::Green).map(|t| t.name).collect();
        assert_eq!(names, vec!["SLOW"]);
        assert_eq!(engine.states().len(), 3);
    }
}
