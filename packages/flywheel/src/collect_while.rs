//! Collect-while side effects: consume an external stream while in state.
//!
//! The source factory runs once per activation, receiving the state
//! snapshot of that moment; the stream it returns is consumed for as long
//! as the guard holds and torn down with the instance. Items flow through
//! the same [`ExecutionPolicy`] driver as on-action triggers.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{FutureExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::error;

use crate::change::ChangedState;
use crate::effect::{narrow, ChangeHandler, RunContext, SideEffect, SideEffectBuilder};
use crate::guard::Guard;
use crate::machine::{Action, MachineState};
use crate::policy::{drive_with_policy, ExecutionPolicy};

type SourceFactory<S, T> = Arc<dyn Fn(Arc<S>) -> BoxStream<'static, T> + Send + Sync>;

struct CollectWhile<S, T> {
    guard: Guard<S>,
    policy: ExecutionPolicy,
    source: SourceFactory<S, T>,
    handler: ChangeHandler<S, T>,
    snapshot: Arc<S>,
}

#[async_trait]
impl<S, A, T> SideEffect<S, A> for CollectWhile<S, T>
where
    S: MachineState,
    A: Action,
    T: Send + 'static,
{
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        let CollectWhile {
            guard,
            policy,
            source,
            handler,
            snapshot,
        } = *self;
        // Forwarded actions are irrelevant here; dropping the receiver
        // makes the scheduler's sends no-ops.
        let RunContext {
            state,
            sink,
            cancellation,
            ..
        } = ctx;

        let mut items = source(snapshot);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let pump = async move {
            while let Some(item) = items.next().await {
                if trigger_tx.send(item).is_err() {
                    break;
                }
            }
        };

        let invoke = move |item: T| {
            let state = state.clone();
            let sink = sink.clone();
            let guard = guard.clone();
            let handler = handler.clone();
            let cancellation = cancellation.clone();
            async move {
                let Some(current) = narrow(&state, &guard) else {
                    return;
                };
                match handler(item, current).await {
                    Ok(change) => sink.send(change),
                    Err(err) => {
                        error!(error = %err, "collect handler failed");
                        cancellation.cancel();
                    }
                }
            }
        };

        tokio::join!(pump, drive_with_policy(trigger_rx, policy, invoke));
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// Collect `source` while `guard` holds.
    ///
    /// The factory is called once per activation with the start snapshot;
    /// each item runs through `handler` under `policy`.
    pub fn collect_while<T, Src, St, H, Fut>(
        guard: Guard<S>,
        policy: ExecutionPolicy,
        source: Src,
        handler: H,
    ) -> Self
    where
        T: Send + 'static,
        Src: Fn(Arc<S>) -> St + Send + Sync + 'static,
        St: Stream<Item = T> + Send + 'static,
        H: Fn(T, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ChangedState<S>>> + Send + 'static,
    {
        let source: SourceFactory<S, T> = Arc::new(move |snapshot| source(snapshot).boxed());
        let handler: ChangeHandler<S, T> =
            Arc::new(move |item, snapshot| handler(item, snapshot).boxed());
        let instance_guard = guard.clone();
        SideEffectBuilder::new(guard, move |snapshot| {
            Box::new(CollectWhile {
                guard: instance_guard.clone(),
                policy,
                source: source.clone(),
                handler: handler.clone(),
                snapshot,
            }) as Box<dyn SideEffect<S, A>>
        })
    }

    /// Like [`collect_while`](SideEffectBuilder::collect_while) but for
    /// handlers that only perform work and never change the state.
    pub fn collect_while_effect<T, Src, St, H, Fut>(
        guard: Guard<S>,
        policy: ExecutionPolicy,
        source: Src,
        handler: H,
    ) -> Self
    where
        T: Send + 'static,
        Src: Fn(Arc<S>) -> St + Send + Sync + 'static,
        St: Stream<Item = T> + Send + 'static,
        H: Fn(T, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::collect_while(guard, policy, source, move |item, snapshot| {
            let work = handler(item, snapshot);
            async move {
                work.await?;
                Ok(ChangedState::no_change())
            }
        })
    }
}
