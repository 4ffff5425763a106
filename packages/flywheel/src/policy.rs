//! Execution policies: how repeated triggers of one side effect overlap.
//!
//! A side effect that reacts to a trigger stream (actions, collected
//! items) can receive a new trigger while a previous handler invocation is
//! still running. The [`ExecutionPolicy`] decides what happens then.
//!
//! # Guarantees
//!
//! - [`Ordered`](ExecutionPolicy::Ordered): one invocation at a time, in
//!   arrival order; nothing is lost while the side effect stays alive.
//!   Triggers queued but not yet started are dropped when the side effect
//!   is cancelled.
//! - [`CancelPrevious`](ExecutionPolicy::CancelPrevious): a new trigger
//!   aborts the in-flight invocation and waits for the abort to finish
//!   before starting the next (latest wins).
//! - [`Unordered`](ExecutionPolicy::Unordered): invocations run fully
//!   concurrently; completion order (and thus the order their changes
//!   apply) is explicitly unspecified.
//! - [`Throttled`](ExecutionPolicy::Throttled): the first trigger of a
//!   window runs immediately; triggers arriving while a handler is still
//!   running, or before the window has elapsed, are dropped, not queued.
//!   The handler's own execution time counts toward the window.
//!
//! Aborting an invocation is local to that invocation, never the whole
//! side effect.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{error, trace};

/// Strategy for overlapping handler invocations of one trigger source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// A new trigger cancels the still-running previous invocation.
    CancelPrevious,
    /// Invocations run strictly one at a time, in arrival order.
    Ordered,
    /// Invocations run concurrently; completion order is unspecified.
    Unordered,
    /// One invocation per window; extra triggers are dropped.
    Throttled(Duration),
}

/// Drive `invoke` for every trigger according to `policy`.
///
/// Runs until the trigger channel closes, then drains outstanding
/// invocations. Cancelling the caller drops the [`JoinSet`], which aborts
/// any spawned invocations with it.
pub(crate) async fn drive_with_policy<T, F, Fut>(
    mut triggers: mpsc::UnboundedReceiver<T>,
    policy: ExecutionPolicy,
    invoke: F,
) where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    match policy {
        ExecutionPolicy::Ordered => {
            while let Some(trigger) = triggers.recv().await {
                invoke(trigger).await;
            }
        }
        ExecutionPolicy::CancelPrevious => {
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    maybe = triggers.recv() => match maybe {
                        Some(trigger) => {
                            running.abort_all();
                            // Join before starting the next invocation: the
                            // previous one must have fully stopped first.
                            while let Some(outcome) = running.join_next().await {
                                log_invocation_outcome(outcome);
                            }
                            running.spawn(invoke(trigger));
                        }
                        None => break,
                    },
                    Some(outcome) = running.join_next(), if !running.is_empty() => {
                        log_invocation_outcome(outcome);
                    }
                }
            }
            while let Some(outcome) = running.join_next().await {
                log_invocation_outcome(outcome);
            }
        }
        ExecutionPolicy::Unordered => {
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    maybe = triggers.recv() => match maybe {
                        Some(trigger) => {
                            running.spawn(invoke(trigger));
                        }
                        None => break,
                    },
                    Some(outcome) = running.join_next(), if !running.is_empty() => {
                        log_invocation_outcome(outcome);
                    }
                }
            }
            while let Some(outcome) = running.join_next().await {
                log_invocation_outcome(outcome);
            }
        }
        ExecutionPolicy::Throttled(window) => {
            let mut running: JoinSet<()> = JoinSet::new();
            let mut window_start: Option<Instant> = None;
            loop {
                tokio::select! {
                    maybe = triggers.recv() => match maybe {
                        Some(trigger) => {
                            let busy = !running.is_empty();
                            let in_window =
                                window_start.is_some_and(|start| start.elapsed() < window);
                            if busy || in_window {
                                trace!("dropping throttled trigger");
                                continue;
                            }
                            window_start = Some(Instant::now());
                            running.spawn(invoke(trigger));
                        }
                        None => break,
                    },
                    Some(outcome) = running.join_next(), if !running.is_empty() => {
                        log_invocation_outcome(outcome);
                    }
                }
            }
            while let Some(outcome) = running.join_next().await {
                log_invocation_outcome(outcome);
            }
        }
    }
}

fn log_invocation_outcome(outcome: Result<(), JoinError>) {
    match outcome {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => trace!("handler invocation cancelled"),
        Err(err) => error!(error = %err, "handler invocation panicked"),
    }
}
