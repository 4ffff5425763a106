//! On-action side effects: react to forwarded actions under a policy.
//!
//! A selector picks the actions this side effect cares about (and maps
//! them to a payload); matching payloads run through the
//! [`ExecutionPolicy`] driver. Each invocation re-validates the guard
//! against live state before running the handler: a trigger that arrives
//! in the window between a state change and the cancel scan is dropped,
//! not handled against a stale assumption.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::mpsc;
use tracing::error;

use crate::change::ChangedState;
use crate::effect::{narrow, ChangeHandler, RunContext, SideEffect, SideEffectBuilder};
use crate::guard::Guard;
use crate::machine::{Action, MachineState};
use crate::policy::{drive_with_policy, ExecutionPolicy};

type ActionSelector<A, M> = Arc<dyn Fn(A) -> Option<M> + Send + Sync>;

struct OnAction<S, A, M> {
    guard: Guard<S>,
    policy: ExecutionPolicy,
    selector: ActionSelector<A, M>,
    handler: ChangeHandler<S, M>,
}

#[async_trait]
impl<S, A, M> SideEffect<S, A> for OnAction<S, A, M>
where
    S: MachineState,
    A: Action,
    M: Send + 'static,
{
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        let OnAction {
            guard,
            policy,
            selector,
            handler,
        } = *self;
        let RunContext {
            mut actions,
            state,
            sink,
            cancellation,
            ..
        } = ctx;

        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let filter = async move {
            while let Some(action) = actions.recv().await {
                if let Some(payload) = selector(action) {
                    if trigger_tx.send(payload).is_err() {
                        break;
                    }
                }
            }
        };

        let invoke = move |payload: M| {
            let state = state.clone();
            let sink = sink.clone();
            let guard = guard.clone();
            let handler = handler.clone();
            let cancellation = cancellation.clone();
            async move {
                let Some(snapshot) = narrow(&state, &guard) else {
                    return;
                };
                match handler(payload, snapshot).await {
                    Ok(change) => sink.send(change),
                    Err(err) => {
                        error!(error = %err, "action handler failed");
                        // A failed handler terminates this side effect;
                        // siblings and the loop are unaffected.
                        cancellation.cancel();
                    }
                }
            }
        };

        tokio::join!(filter, drive_with_policy(trigger_rx, policy, invoke));
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// React to actions matched by `selector` while `guard` holds.
    ///
    /// `selector` both filters and maps: return `Some(payload)` for the
    /// actions this side effect handles. Overlapping handler invocations
    /// are resolved by `policy`.
    pub fn on_action<M, Sel, H, Fut>(
        guard: Guard<S>,
        policy: ExecutionPolicy,
        selector: Sel,
        handler: H,
    ) -> Self
    where
        M: Send + 'static,
        Sel: Fn(A) -> Option<M> + Send + Sync + 'static,
        H: Fn(M, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChangedState<S>>> + Send + 'static,
    {
        let selector: ActionSelector<A, M> = Arc::new(selector);
        let handler: ChangeHandler<S, M> =
            Arc::new(move |payload, snapshot| handler(payload, snapshot).boxed());
        let instance_guard = guard.clone();
        SideEffectBuilder::new(guard, move |_snapshot| {
            Box::new(OnAction {
                guard: instance_guard.clone(),
                policy,
                selector: selector.clone(),
                handler: handler.clone(),
            }) as Box<dyn SideEffect<S, A>>
        })
    }

    /// Like [`on_action`](SideEffectBuilder::on_action) but for handlers
    /// that only perform work and never change the state.
    pub fn on_action_effect<M, Sel, H, Fut>(
        guard: Guard<S>,
        policy: ExecutionPolicy,
        selector: Sel,
        handler: H,
    ) -> Self
    where
        M: Send + 'static,
        Sel: Fn(A) -> Option<M> + Send + Sync + 'static,
        H: Fn(M, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::on_action(guard, policy, selector, move |payload, snapshot| {
            let work = handler(payload, snapshot);
            async move {
                work.await?;
                Ok(ChangedState::no_change())
            }
        })
    }
}
