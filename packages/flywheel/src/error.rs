//! Structured error types for the state machine surface.
//!
//! `MachineError` covers the configuration errors of the public API:
//! misuse that is surfaced immediately and never retried. Side-effect
//! handler failures never appear here: they stay internal (logged and
//! isolated to the failing side effect), and `anyhow::Error` never crosses
//! the public boundary.

use thiserror::Error;

/// Errors returned by [`StateMachine`](crate::StateMachine) operations.
///
/// Both variants are programmer errors: they indicate a misuse of the
/// machine's lifecycle, not a runtime condition worth retrying.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MachineError {
    /// An action was dispatched while nobody collects the state stream.
    ///
    /// Dispatching requires an active observer; buffering actions forever
    /// for a stream nobody reads would only hide the bug.
    #[error(
        "cannot dispatch because the state stream of this state machine is not collected yet; \
         start collecting the state stream before dispatching any action"
    )]
    NotCollected,

    /// The state stream is already being collected.
    ///
    /// At most one concurrent collector is supported: the set of running
    /// side effects is tied to a single active subscription. Drop the
    /// existing stream before subscribing again.
    #[error(
        "the state stream of this state machine is already collected; \
         at most one concurrent collector is supported"
    )]
    AlreadyCollected,
}
