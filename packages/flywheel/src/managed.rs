//! Ownership of the 0-or-1 running instance of one side-effect descriptor.
//!
//! `ManagedSideEffect` is the scheduler primitive: the store loop calls
//! `start_if_needed` / `cancel_if_needed` after every applied change and
//! `send_action` for every forwarded action.
//!
//! # Key Properties
//!
//! - **Cancel joins**: `cancel_if_needed` waits for the cancelled task to
//!   fully finish before returning. The loop must not start a fresh
//!   instance of the same descriptor while the old one could still hold
//!   resources.
//! - **Natural completion keeps the slot occupied**: an instance whose
//!   task ran to completion (e.g. an on-enter handler) does not restart
//!   while the guard keeps holding. Only a guard false→true round-trip
//!   builds a new instance.
//! - **Panics are contained**: a panicking side-effect body terminates
//!   that one instance; it is logged and the loop keeps running.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::effect::{ChangeSink, GuardedChange, RunContext, SideEffectBuilder, StateHandle};
use crate::guard::Guard;
use crate::machine::{Action, MachineState};

pub(crate) struct ManagedSideEffect<S: MachineState, A: Action> {
    descriptor: SideEffectBuilder<S, A>,
    state: StateHandle<S>,
    changes_tx: mpsc::UnboundedSender<GuardedChange<S>>,
    subscription: CancellationToken,
    active: Option<ActiveSideEffect<S, A>>,
}

struct ActiveSideEffect<S, A> {
    /// The running instance's guard; may be narrower than the descriptor's.
    guard: Guard<S>,
    actions_tx: mpsc::UnboundedSender<A>,
    cancellation: CancellationToken,
    task: JoinHandle<()>,
}

impl<S: MachineState, A: Action> ManagedSideEffect<S, A> {
    pub(crate) fn new(
        descriptor: SideEffectBuilder<S, A>,
        state: StateHandle<S>,
        changes_tx: mpsc::UnboundedSender<GuardedChange<S>>,
        subscription: CancellationToken,
    ) -> Self {
        Self {
            descriptor,
            state,
            changes_tx,
            subscription,
            active: None,
        }
    }

    /// Build and launch an instance if the start guard holds and none is
    /// currently owned.
    pub(crate) fn start_if_needed(&mut self, state: &Arc<S>) {
        if !self.descriptor.start_guard().check(state) {
            return;
        }
        if self.active.is_some() {
            trace!("side effect already active");
            return;
        }

        debug!(state = ?state, "starting side effect");
        let effect = self.descriptor.build(state.clone());
        let guard = effect.guard();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let cancellation = self.subscription.child_token();
        let ctx = RunContext::new(
            actions_rx,
            self.state.clone(),
            ChangeSink::new(guard.clone(), self.changes_tx.clone()),
            cancellation.clone(),
            self.subscription.clone(),
        );

        let run_token = cancellation.clone();
        let task = tokio::spawn(async move {
            let body = AssertUnwindSafe(effect.run(ctx)).catch_unwind();
            tokio::select! {
                biased;
                _ = run_token.cancelled() => {
                    trace!("side effect task stopped by cancellation");
                }
                outcome = body => {
                    if let Err(panic) = outcome {
                        error!(panic = %panic_message(panic), "side effect panicked");
                    }
                }
            }
        });

        self.active = Some(ActiveSideEffect {
            guard,
            actions_tx,
            cancellation,
            task,
        });
    }

    /// Cancel the running instance if its guard no longer holds, waiting
    /// for the task to finish before returning.
    pub(crate) async fn cancel_if_needed(&mut self, state: &Arc<S>) {
        let still_running = match &self.active {
            Some(active) => active.guard.check(state),
            None => return,
        };
        if still_running {
            trace!("side effect should keep running");
            return;
        }

        debug!(state = ?state, "cancelling side effect");
        if let Some(active) = self.active.take() {
            active.cancellation.cancel();
            let _ = active.task.await;
        }
    }

    /// Forward an action to the running instance, if any and only while
    /// its guard still holds; otherwise the action is silently dropped for
    /// this side effect.
    pub(crate) fn send_action(&mut self, action: &A, state: &Arc<S>) {
        if let Some(active) = self.active.as_ref() {
            if active.guard.check(state) {
                let _ = active.actions_tx.send(action.clone());
            }
        }
    }

    /// Tear down the running instance unconditionally (collection shutdown).
    ///
    /// The subscription token is expected to be cancelled already, so the
    /// instance can observe the shutdown origin.
    pub(crate) async fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.cancellation.cancel();
            let _ = active.task.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
