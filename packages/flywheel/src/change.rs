//! The algebraic description of how a reduction affects the state.
//!
//! Side effects never touch the state directly. They emit [`ChangedState`]
//! values describing the change, and the store loop applies them one at a
//! time against whatever the state is *at apply time*.
//!
//! # Key Properties
//!
//! - **`NoChange` is free**: it returns the current `Arc` untouched, so the
//!   loop can suppress redundant emissions by pointer identity.
//! - **`Override` replaces**: the captured state wins unconditionally. An
//!   override that carries the same `Arc` as the current state is treated
//!   as a no-op.
//! - **`Mutate` derives**: the transform runs against the freshest state,
//!   not the state at creation time. Several changes may be queued before
//!   any is applied; deferring the read is what keeps them composable.

use std::fmt;
use std::sync::Arc;

/// Describes how one reduction affects the state.
///
/// Values are produced by side-effect handlers and consumed exactly once by
/// the store loop via [`ChangedState::reduce`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use flywheel::ChangedState;
///
/// #[derive(Debug, PartialEq)]
/// struct Counter(u32);
///
/// let current = Arc::new(Counter(1));
/// let next = ChangedState::mutate(|c: &Counter| Counter(c.0 + 1)).reduce(&current);
/// assert_eq!(*next, Counter(2));
/// ```
pub enum ChangedState<S> {
    /// The state is unaffected.
    NoChange,
    /// Replace the state unconditionally.
    Override(Arc<S>),
    /// Derive the new state from the state at apply time.
    Mutate(Box<dyn FnOnce(&S) -> S + Send>),
}

impl<S> ChangedState<S> {
    /// A change that leaves the state untouched.
    pub fn no_change() -> Self {
        ChangedState::NoChange
    }

    /// Replace the state with `state`.
    ///
    /// Accepts either an owned state or an `Arc` (e.g. a snapshot handed to
    /// a handler). Passing back the same `Arc` the machine currently holds
    /// is recognized as a no-op and suppresses the downstream emission.
    pub fn override_with(state: impl Into<Arc<S>>) -> Self {
        ChangedState::Override(state.into())
    }

    /// Derive the new state from the current one.
    ///
    /// `transform` runs when the change is applied, against the state that
    /// is current at that moment.
    pub fn mutate<F>(transform: F) -> Self
    where
        F: FnOnce(&S) -> S + Send + 'static,
    {
        ChangedState::Mutate(Box::new(transform))
    }

    /// Apply this change to `current`, returning the resulting state.
    ///
    /// `NoChange` returns `current` itself (same `Arc`), which is how the
    /// store loop detects that nothing needs to be emitted.
    pub fn reduce(self, current: &Arc<S>) -> Arc<S> {
        match self {
            ChangedState::NoChange => current.clone(),
            ChangedState::Override(state) => state,
            ChangedState::Mutate(transform) => Arc::new(transform(current)),
        }
    }
}

impl<S: fmt::Debug> fmt::Debug for ChangedState<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangedState::NoChange => write!(f, "NoChange"),
            ChangedState::Override(state) => f.debug_tuple("Override").field(state).finish(),
            ChangedState::Mutate(_) => write!(f, "Mutate(..)"),
        }
    }
}
