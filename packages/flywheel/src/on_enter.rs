//! On-enter side effects: run once per activation.
//!
//! Fires immediately when the guard transitions false→true, against the
//! state snapshot captured at start time. It does not re-fire on actions
//! and does not re-fire while the guard keeps holding; only a full
//! false→true round-trip activates it again.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{debug, error};

use crate::change::ChangedState;
use crate::effect::{RunContext, SideEffect, SideEffectBuilder};
use crate::guard::Guard;
use crate::machine::{Action, MachineState};

type EnterHandler<S> =
    Arc<dyn Fn(Arc<S>) -> BoxFuture<'static, anyhow::Result<ChangedState<S>>> + Send + Sync>;

struct OnEnter<S> {
    guard: Guard<S>,
    snapshot: Arc<S>,
    handler: EnterHandler<S>,
}

#[async_trait]
impl<S: MachineState, A: Action> SideEffect<S, A> for OnEnter<S> {
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        debug!("running on-enter handler");
        match (self.handler)(self.snapshot.clone()).await {
            Ok(change) => ctx.sink().send(change),
            Err(err) => error!(error = %err, "on-enter handler failed"),
        }
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// Run `handler` once each time `guard` transitions to true, with the
    /// state snapshot taken at that moment.
    pub fn on_enter<H, Fut>(guard: Guard<S>, handler: H) -> Self
    where
        H: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChangedState<S>>> + Send + 'static,
    {
        let handler: EnterHandler<S> = Arc::new(move |snapshot| handler(snapshot).boxed());
        let instance_guard = guard.clone();
        SideEffectBuilder::new(guard, move |snapshot| {
            Box::new(OnEnter {
                guard: instance_guard.clone(),
                snapshot,
                handler: handler.clone(),
            }) as Box<dyn SideEffect<S, A>>
        })
    }

    /// Like [`on_enter`](SideEffectBuilder::on_enter) but for handlers
    /// that only perform work and never change the state.
    pub fn on_enter_effect<H, Fut>(guard: Guard<S>, handler: H) -> Self
    where
        H: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::on_enter(guard, move |snapshot| {
            let work = handler(snapshot);
            async move {
                work.await?;
                Ok(ChangedState::no_change())
            }
        })
    }
}
