//! Generic finite-state-machine engine shared by every coordinated entity.
//!
//! Each entity type (task, session, QA brief) declares a closed transition
//! table: `(from, event) -> to` plus guard and action tags. Guards and
//! actions are entity-specific enums, not string-keyed callbacks, so every
//! predicate and side effect is a concrete implementation known at compile
//! time. The engine validates a requested transition and reports which
//! actions to run; executing actions (after the state write commits) is the
//! caller's job.

use std::fmt;

use crate::error::{CoordError, CoordResult};

/// Guard decision: allow, or deny with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict {
    Allow,
    Deny(String),
}

impl GuardVerdict {
    /// Deny with a formatted reason.
    pub fn deny(reason: impl Into<String>) -> Self {
        GuardVerdict::Deny(reason.into())
    }
}

/// Evaluates entity-specific guard tags against caller-supplied facts.
///
/// Guards are pure: the context is assembled before `fire` and evaluation
/// must not touch the filesystem.
pub trait GuardContext<G> {
    fn evaluate(&self, guard: &G) -> GuardVerdict;
}

/// One row of a transition table.
#[derive(Debug, Clone)]
pub struct Transition<S, E, G, A> {
    pub from: S,
    pub event: E,
    pub to: S,
    pub guards: Vec<G>,
    pub actions: Vec<A>,
}

impl<S, E, G, A> Transition<S, E, G, A> {
    pub fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            guards: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// Require a guard to pass before this transition is permitted.
    pub fn guarded_by(mut self, guard: G) -> Self {
        self.guards.push(guard);
        self
    }

    /// Schedule a post-transition action, invoked only after the state write
    /// succeeds, in declaration order.
    pub fn then(mut self, action: A) -> Self {
        self.actions.push(action);
        self
    }
}

/// Result of firing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fired<'a, S, A> {
    /// Transition permitted: write `to`, then run `actions` in order.
    Moved { from: S, to: S, actions: &'a [A] },
    /// The entity is already in the event's target state. Idempotent no-op
    /// so retrying callers with at-least-once delivery do not error.
    AlreadyThere(S),
}

/// A named entity type with a fixed state set and transition table.
#[derive(Debug, Clone)]
pub struct Machine<S, E, G, A> {
    entity: &'static str,
    states: Vec<S>,
    initial: S,
    transitions: Vec<Transition<S, E, G, A>>,
}

impl<S, E, G, A> Machine<S, E, G, A>
where
    S: Copy + Eq + fmt::Display,
    E: Copy + Eq + fmt::Display,
    G: fmt::Display,
{
    /// Define an entity type. Panics if a transition references a state
    /// outside `states`; tables are compiled-in and must be internally
    /// consistent before any record exists.
    pub fn define(
        entity: &'static str,
        states: Vec<S>,
        initial: S,
        transitions: Vec<Transition<S, E, G, A>>,
    ) -> Self {
        assert!(
            states.contains(&initial),
            "{entity}: initial state '{initial}' not in state set"
        );
        for t in &transitions {
            assert!(
                states.contains(&t.from) && states.contains(&t.to),
                "{entity}: transition {} -> {} references unknown state",
                t.from,
                t.to
            );
        }
        Self {
            entity,
            states,
            initial,
            transitions,
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    pub fn states(&self) -> &[S] {
        &self.states
    }

    /// Validate `event` against the current state and guards.
    ///
    /// Returns [`Fired::Moved`] when the table permits the transition and
    /// every guard allows it, [`Fired::AlreadyThere`] when the entity already
    /// sits in the event's declared target state, and a typed error
    /// otherwise. Never silently no-ops an undefined `(state, event)` pair.
    pub fn fire<C: GuardContext<G>>(
        &self,
        id: &str,
        current: S,
        event: E,
        ctx: &C,
    ) -> CoordResult<Fired<'_, S, A>> {
        if let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == current && t.event == event)
        {
            for guard in &t.guards {
                if let GuardVerdict::Deny(reason) = ctx.evaluate(guard) {
                    return Err(CoordError::GuardRejected {
                        entity: self.entity,
                        id: id.to_string(),
                        event: event.to_string(),
                        guard: guard.to_string(),
                        reason,
                    });
                }
            }
            return Ok(Fired::Moved {
                from: t.from,
                to: t.to,
                actions: &t.actions,
            });
        }

        // Already-satisfied transitions are tolerated: if some row for this
        // event targets the current state, the caller's intent already holds.
        if self
            .transitions
            .iter()
            .any(|t| t.event == event && t.to == current)
        {
            return Ok(Fired::AlreadyThere(current));
        }

        Err(CoordError::InvalidTransition {
            entity: self.entity,
            id: id.to_string(),
            state: current.to_string(),
            event: event.to_string(),
        })
    }
}
