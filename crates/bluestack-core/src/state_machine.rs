//! State Machine Engine
//!
//! Generic engine driving a single-threaded, table-free state machine: one
//! handler closure receives every event together with the current state and
//! may request a transition. Transitions always deliver `Exit` to the old
//! state and then `Enter` to the new one, in that order, before the next
//! dispatch is observed.
//!
//! Machines are owned by exactly one executor; nothing here is `Sync`.

use crate::errors::StateMachineError;
use core::fmt::Debug;

cfg_if::cfg_if! {
    if #[cfg(feature = "tracing")] {
        use tracing::{debug, trace, warn};
    } else {
        use log::{debug, trace, warn};
    }
}

/// Upper bound on transitions requested from consecutive `Enter` handlers
pub const MAX_CHAINED_TRANSITIONS: usize = 16;

// ----------------------------------------------------------------------------
// Events and Transitions
// ----------------------------------------------------------------------------

/// Event delivered to a state handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent<E> {
    /// The machine just entered the current state
    Enter,
    /// The machine is about to leave the current state
    Exit,
    /// A profile-defined event
    Event(E),
}

/// Transition request collected while a handler runs
///
/// The engine applies the request after the handler returns; the handler
/// never re-enters the machine.
#[derive(Debug)]
pub struct Transition<S> {
    target: Option<S>,
}

impl<S: Copy> Transition<S> {
    fn idle() -> Self {
        Self { target: None }
    }

    /// Ask the engine to move to `state` once the current handler returns.
    /// A later call in the same handler replaces an earlier one.
    pub fn change_state(&mut self, state: S) {
        self.target = Some(state);
    }

    /// The pending target, if any
    pub fn requested(&self) -> Option<S> {
        self.target
    }

    fn take(&mut self) -> Option<S> {
        self.target.take()
    }
}

/// Behaviour of a concrete state machine
pub trait StateHandler {
    type State: Copy + Eq + Debug;
    type Event: Debug;

    /// Handle `event` in `state`. Returns whether the event was handled.
    fn handle(
        &mut self,
        state: Self::State,
        event: SmEvent<Self::Event>,
        transition: &mut Transition<Self::State>,
    ) -> bool;
}

// ----------------------------------------------------------------------------
// State Machine
// ----------------------------------------------------------------------------

/// A running state machine instance
#[derive(Debug)]
pub struct StateMachine<H: StateHandler> {
    name: String,
    handler: H,
    current: H::State,
    live: bool,
    transitions: u64,
}

impl<H: StateHandler> StateMachine<H> {
    /// Create a machine in `initial` and deliver `Enter` to it
    ///
    /// Transitions requested by the initial `Enter` are followed, bounded by
    /// [`MAX_CHAINED_TRANSITIONS`].
    pub fn new<N: Into<String>>(
        name: N,
        handler: H,
        initial: H::State,
    ) -> Result<Self, StateMachineError> {
        let mut machine = Self {
            name: name.into(),
            handler,
            current: initial,
            live: true,
            transitions: 0,
        };

        debug!("State machine '{}' starting in {:?}", machine.name, initial);
        let mut transition = Transition::idle();
        machine
            .handler
            .handle(initial, SmEvent::Enter, &mut transition);
        machine.follow(transition.take())?;

        Ok(machine)
    }

    /// Deliver `event` to the current state's handler
    ///
    /// Returns the handler's "handled" flag. Any transition the handler
    /// requested has completed (including `Exit`/`Enter`) on return.
    pub fn dispatch(&mut self, event: H::Event) -> Result<bool, StateMachineError> {
        self.ensure_live()?;

        trace!(
            "State machine '{}' dispatching {:?} in {:?}",
            self.name,
            event,
            self.current
        );

        let mut transition = Transition::idle();
        let handled = self
            .handler
            .handle(self.current, SmEvent::Event(event), &mut transition);
        self.follow(transition.take())?;

        Ok(handled)
    }

    /// Move to `new_state`: `Exit` to the old state, then `Enter` to the new one
    ///
    /// Requesting the current state re-runs both hooks.
    pub fn change_state(&mut self, new_state: H::State) -> Result<(), StateMachineError> {
        self.ensure_live()?;
        self.follow(Some(new_state))
    }

    /// Current state
    pub fn state(&self) -> H::State {
        self.current
    }

    /// Machine name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of completed transitions since creation
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Whether the machine still accepts events
    pub fn is_live(&self) -> bool {
        self.live
    }

    /// Shared access to the profile handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Mutable access to the profile handler
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Stop the machine. No `Exit` is delivered; later calls are rejected.
    pub fn shutdown(&mut self) {
        if self.live {
            debug!(
                "State machine '{}' shut down in {:?}",
                self.name, self.current
            );
        }
        self.live = false;
    }

    fn ensure_live(&self) -> Result<(), StateMachineError> {
        if self.live {
            Ok(())
        } else {
            Err(StateMachineError::Shutdown {
                machine: self.name.clone(),
            })
        }
    }

    /// Apply a requested transition and any transitions chained from `Enter`
    fn follow(&mut self, mut target: Option<H::State>) -> Result<(), StateMachineError> {
        let mut chained = 0;

        while let Some(next) = target.take() {
            if chained == MAX_CHAINED_TRANSITIONS {
                warn!(
                    "State machine '{}' stopped after {} chained transitions in {:?}",
                    self.name, chained, self.current
                );
                return Err(StateMachineError::TransitionLoop {
                    machine: self.name.clone(),
                    limit: MAX_CHAINED_TRANSITIONS,
                });
            }
            chained += 1;

            let previous = self.current;

            let mut transition = Transition::idle();
            self.handler
                .handle(previous, SmEvent::Exit, &mut transition);
            if let Some(ignored) = transition.take() {
                warn!(
                    "State machine '{}' ignored transition to {:?} requested while exiting {:?}",
                    self.name, ignored, previous
                );
            }

            self.current = next;
            self.transitions += 1;
            debug!(
                "State machine '{}' {:?} -> {:?}",
                self.name, previous, next
            );

            self.handler.handle(next, SmEvent::Enter, &mut transition);
            target = transition.take();
        }

        Ok(())
    }
}
