//! The store loop: the single serialization point of a state machine.
//!
//! One loop task runs per active subscription. It owns the authoritative
//! state and merges two event sources, external actions and queued
//! guarded changes from running side effects, into one totally ordered
//! sequence of reductions.
//!
//! # Algorithm
//!
//! 1. On start: emit the current state to the observer, then start every
//!    side effect whose guard already holds (on-enter behavior for the
//!    initial state included).
//! 2. On an external action: forward it to every running side effect.
//!    Actions are opaque triggers; they never reduce by themselves.
//! 3. On a queued change: discard it if its guard no longer holds
//!    (benign race); apply it otherwise. If the state actually changed:
//!    cancel side effects whose guard now fails (joining each before
//!    moving on), emit the new state, then start side effects whose guard
//!    now holds.
//!
//! Because step 3 runs inside the single loop task, reductions apply one
//! at a time in queue order even though side effects produce changes in
//! parallel. The cancel/start scans run in the same iteration that applied
//! the change, so predicate evaluation never sees a stale state.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::effect::{GuardedChange, SideEffectBuilder, StateHandle};
use crate::machine::{Action, MachineState};
use crate::managed::ManagedSideEffect;

pub(crate) struct StoreLoop<S: MachineState, A: Action> {
    state: StateHandle<S>,
    side_effects: Vec<ManagedSideEffect<S, A>>,
    actions_rx: mpsc::UnboundedReceiver<A>,
    changes_rx: mpsc::UnboundedReceiver<GuardedChange<S>>,
    /// Keeps the change queue open; side effects hold clones of this.
    _changes_tx: mpsc::UnboundedSender<GuardedChange<S>>,
    states_tx: mpsc::Sender<Arc<S>>,
    subscription: CancellationToken,
}

impl<S: MachineState, A: Action> StoreLoop<S, A> {
    pub(crate) fn new(
        state: StateHandle<S>,
        descriptors: &[SideEffectBuilder<S, A>],
        actions_rx: mpsc::UnboundedReceiver<A>,
        states_tx: mpsc::Sender<Arc<S>>,
        subscription: CancellationToken,
    ) -> Self {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let side_effects = descriptors
            .iter()
            .map(|descriptor| {
                ManagedSideEffect::new(
                    descriptor.clone(),
                    state.clone(),
                    changes_tx.clone(),
                    subscription.clone(),
                )
            })
            .collect();
        Self {
            state,
            side_effects,
            actions_rx,
            changes_rx,
            _changes_tx: changes_tx,
            states_tx,
            subscription,
        }
    }

    pub(crate) async fn run(mut self) {
        let initial = self.state.get();
        info!(side_effects = self.side_effects.len(), state = ?initial, "state machine started");

        if self.states_tx.send(initial.clone()).await.is_err() {
            self.shutdown().await;
            return;
        }
        for side_effect in &mut self.side_effects {
            side_effect.start_if_needed(&initial);
        }

        loop {
            tokio::select! {
                // Drain queued changes before accepting more input, so
                // reductions triggered by earlier events apply first.
                biased;
                _ = self.subscription.cancelled() => break,
                _ = self.states_tx.closed() => break,
                Some(guarded) = self.changes_rx.recv() => {
                    if !self.apply(guarded).await {
                        break;
                    }
                }
                maybe_action = self.actions_rx.recv() => match maybe_action {
                    Some(action) => self.forward(action),
                    None => break,
                },
            }
        }

        self.shutdown().await;
    }

    /// Apply one queued change. Returns false when the observer is gone.
    async fn apply(&mut self, guarded: GuardedChange<S>) -> bool {
        let current = self.state.get();
        if !guarded.guard.check(&current) {
            trace!("discarding state change, its guard no longer holds");
            return true;
        }

        let next = guarded.change.reduce(&current);
        if Arc::ptr_eq(&next, &current) {
            return true;
        }

        debug!(state = ?next, "state changed");
        self.state.set(next.clone());

        // Cancel before emitting: a side effect leaving its state must not
        // get a chance to emit against the new one.
        for side_effect in &mut self.side_effects {
            side_effect.cancel_if_needed(&next).await;
        }

        if self.states_tx.send(next.clone()).await.is_err() {
            return false;
        }

        for side_effect in &mut self.side_effects {
            side_effect.start_if_needed(&next);
        }
        true
    }

    fn forward(&mut self, action: A) {
        trace!(action = ?action, "forwarding action to side effects");
        let current = self.state.get();
        for side_effect in &mut self.side_effects {
            side_effect.send_action(&action, &current);
        }
    }

    async fn shutdown(&mut self) {
        debug!("state machine stopping");
        self.subscription.cancel();
        for side_effect in &mut self.side_effects {
            side_effect.stop().await;
        }
        info!("state machine stopped");
    }
}
