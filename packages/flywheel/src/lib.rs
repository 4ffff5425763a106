//! # Flywheel
//!
//! A reactive state machine engine: an immutable state value evolved by a
//! stream of input actions and by autonomous, guarded side effects.
//!
//! ## Core Concepts
//!
//! Flywheel separates **state** from **behavior**:
//! - State is an opaque immutable value, replaced atomically on every
//!   reduction.
//! - Side effects are asynchronous tasks gated by a [`Guard`] predicate:
//!   "while the state satisfies P, run B".
//!
//! The key principle: **all reductions apply in one total order**, even
//! though side effects produce them in parallel.
//!
//! ## Architecture
//!
//! ```text
//! dispatch(action)
//!     │
//!     ▼
//! Store loop (single task = serialization point)
//!     │
//!     ├─► ManagedSideEffect A ──► side-effect task ──┐
//!     │                                              │
//!     ├─► ManagedSideEffect B ──► side-effect task ──┤
//!     │                                              │ guarded
//!     │        ◄── apply / discard ◄─────────────────┘ changes
//!     │
//!     ├─► cancel side effects whose guard now fails (join each)
//!     ├─► emit new state ──► StateStream observer
//!     └─► start side effects whose guard now holds
//! ```
//!
//! ## Key Invariants
//!
//! 1. **One instance per descriptor**: between a guard turning true and
//!    turning false again, exactly one task instance of that side effect
//!    is alive; cancel joins before anything restarts.
//! 2. **Guarded application**: every queued change carries the guard it
//!    was produced under and is re-checked at apply time; stale changes
//!    are discarded, never applied or crashed on.
//! 3. **Identity-based no-ops**: `NoChange` and identity-equal overrides
//!    never re-emit to observers.
//! 4. **Isolated failures**: a failing or panicking handler terminates
//!    its own side effect only; siblings and the loop keep running.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use flywheel::{ChangedState, ExecutionPolicy, Guard, SideEffectBuilder, StateMachine};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! enum State {
//!     Idle,
//!     Loading,
//!     Ready,
//! }
//!
//! #[derive(Debug, Clone)]
//! enum Action {
//!     Loaded,
//! }
//!
//! # async fn demo() {
//! let machine = StateMachine::new(
//!     State::Idle,
//!     vec![
//!         // While Idle: immediately move to Loading.
//!         SideEffectBuilder::on_enter(
//!             Guard::new(|s: &State| matches!(s, State::Idle)),
//!             |_snapshot: Arc<State>| async move {
//!                 Ok(ChangedState::override_with(State::Loading))
//!             },
//!         ),
//!         // While Loading: a Loaded action completes the flow.
//!         SideEffectBuilder::on_action(
//!             Guard::new(|s: &State| matches!(s, State::Loading)),
//!             ExecutionPolicy::CancelPrevious,
//!             |action: Action| match action {
//!                 Action::Loaded => Some(()),
//!             },
//!             |_trigger, _snapshot| async move {
//!                 Ok(ChangedState::override_with(State::Ready))
//!             },
//!         ),
//!     ],
//! );
//!
//! let mut states = machine.state().unwrap();
//! assert_eq!(*states.recv().await.unwrap(), State::Idle);
//! assert_eq!(*states.recv().await.unwrap(), State::Loading);
//! machine.dispatch(Action::Loaded).unwrap();
//! assert_eq!(*states.recv().await.unwrap(), State::Ready);
//! # }
//! ```
//!
//! ## What This Is Not
//!
//! Flywheel is **not**:
//! - A persistence layer: state lives in memory and dies with the process
//! - A distributed coordinator: one machine, one process
//! - A UI framework: it only orchestrates in-process asynchronous tasks

// Core modules
mod change;
mod collect_while;
mod effect;
mod error;
mod gate;
mod guard;
mod identity;
mod machine;
mod managed;
mod on_action;
mod on_enter;
mod policy;
mod store;
mod submachine;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;


// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export the reduction types
pub use change::ChangedState;

// Re-export guard predicates
pub use guard::Guard;

// Re-export execution policies
pub use policy::ExecutionPolicy;

// Re-export the side-effect surface
pub use effect::{ChangeSink, RunContext, SideEffect, SideEffectBuilder, StateHandle};

// Re-export the machine surface
pub use machine::{Action, MachineState, StateMachine, StateStream};

// Re-export error types
pub use error::MachineError;

// Re-export the child-machine startup gate
pub use gate::StartupGate;

// Re-export commonly used external types
pub use async_trait::async_trait;
