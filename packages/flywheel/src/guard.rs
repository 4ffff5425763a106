//! Guard predicates that gate side-effect activity.
//!
//! A [`Guard`] is a pure boolean function over the state. The engine calls
//! guards an unbounded number of times per state (on every start scan,
//! cancel scan, action forward, and queued-change apply), so predicates
//! must be cheap, deterministic, and free of side effects.
//!
//! A panicking guard is a programming error and is fatal to the machine:
//! the engine cannot determine guard membership without it.

use std::fmt;
use std::sync::Arc;

/// Pure predicate that determines whether a side effect should be active.
///
/// Cloning a `Guard` is cheap (shared function pointer).
///
/// # Example
///
/// ```
/// use flywheel::Guard;
///
/// #[derive(Debug)]
/// enum TaskState {
///     Pending,
///     Running,
///     Complete,
/// }
///
/// let while_running = Guard::new(|s: &TaskState| matches!(s, TaskState::Running));
///
/// assert!(while_running.check(&TaskState::Running));
/// assert!(!while_running.check(&TaskState::Complete));
/// ```
pub struct Guard<S> {
    predicate: Arc<dyn Fn(&S) -> bool + Send + Sync>,
}

impl<S> Clone for Guard<S> {
    fn clone(&self) -> Self {
        Self {
            predicate: Arc::clone(&self.predicate),
        }
    }
}

impl<S: 'static> Guard<S> {
    /// Create a guard from a pure predicate function.
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        Guard {
            predicate: Arc::new(predicate),
        }
    }

    /// Check whether the guard holds for `state`.
    pub fn check(&self, state: &S) -> bool {
        (self.predicate)(state)
    }

    /// Combine two guards: the result holds only when both hold.
    ///
    /// Used to scope a side effect to a condition within a state (the
    /// narrower guard still drives cancel/apply decisions).
    pub fn and(&self, other: &Guard<S>) -> Guard<S> {
        let left = self.clone();
        let right = other.clone();
        Guard::new(move |state| left.check(state) && right.check(state))
    }
}

impl<S> fmt::Debug for Guard<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Guard(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum TestState {
        Idle,
        Loading { attempt: u32 },
        Done,
    }

    #[test]
    fn test_guard_matches_states() {
        let guard = Guard::new(|s: &TestState| matches!(s, TestState::Loading { .. }));

        assert!(guard.check(&TestState::Loading { attempt: 1 }));
        assert!(!guard.check(&TestState::Idle));
        assert!(!guard.check(&TestState::Done));
    }

    #[test]
    fn test_guard_is_deterministic() {
        let guard = Guard::new(|s: &TestState| matches!(s, TestState::Idle));
        let state = TestState::Idle;

        assert_eq!(guard.check(&state), guard.check(&state));
    }

    #[test]
    fn test_and_requires_both() {
        let loading = Guard::new(|s: &TestState| matches!(s, TestState::Loading { .. }));
        let early = Guard::new(|s: &TestState| matches!(s, TestState::Loading { attempt } if *attempt < 3));
        let combined = loading.and(&early);

        assert!(combined.check(&TestState::Loading { attempt: 1 }));
        assert!(!combined.check(&TestState::Loading { attempt: 5 }));
        assert!(!combined.check(&TestState::Idle));
    }

    #[test]
    fn test_clone_shares_predicate() {
        let guard = Guard::new(|s: &TestState| matches!(s, TestState::Done));
        let cloned = guard.clone();

        assert!(guard.check(&TestState::Done));
        assert!(cloned.check(&TestState::Done));
    }
}
