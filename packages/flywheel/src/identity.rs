//! Identity scoping: restart a side effect when a projection of the state
//! changes, not just when the guard flips.
//!
//! The wrapper leaves the descriptor's start guard alone but narrows the
//! built instance's guard to "base guard holds AND the identity projection
//! still equals its value at start". From the scheduler's point of view an
//! identity change is indistinguishable from a guard transition: the
//! instance is cancelled, and the next start scan builds a fresh one with
//! a fresh snapshot (and a fresh identity value).

use std::sync::Arc;

use async_trait::async_trait;

use crate::effect::{RunContext, SideEffect, SideEffectBuilder};
use crate::guard::Guard;
use crate::machine::{Action, MachineState};

struct IdentityScoped<S, A> {
    guard: Guard<S>,
    inner: Box<dyn SideEffect<S, A>>,
}

#[async_trait]
impl<S: MachineState, A: Action> SideEffect<S, A> for IdentityScoped<S, A> {
    fn guard(&self) -> Guard<S> {
        self.guard.clone()
    }

    async fn run(self: Box<Self>, ctx: RunContext<S, A>) {
        let this = *self;
        this.inner.run(ctx).await;
    }
}

impl<S: MachineState, A: Action> SideEffectBuilder<S, A> {
    /// Scope this side effect to an identity of the state.
    ///
    /// While the base guard stays true, any change of `identity(state)`
    /// (by `==`) cancels the running instance and starts a new one against
    /// the changed state.
    pub fn until_identity_changes<I, F>(self, identity: F) -> Self
    where
        I: PartialEq + Send + Sync + 'static,
        F: Fn(&S) -> I + Send + Sync + 'static,
    {
        let identity = Arc::new(identity);
        let base_factory = Arc::clone(&self.factory);
        SideEffectBuilder::new(self.guard.clone(), move |snapshot: Arc<S>| {
            let inner = (base_factory)(snapshot.clone());
            let inner_guard = inner.guard();
            let at_start = identity(&snapshot);
            let identity = Arc::clone(&identity);
            let scoped =
                Guard::new(move |state: &S| inner_guard.check(state) && identity(state) == at_start);
            Box::new(IdentityScoped {
                guard: scoped,
                inner,
            }) as Box<dyn SideEffect<S, A>>
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::ChangedState;
    use crate::machine::StateMachine;
    use crate::policy::ExecutionPolicy;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum ViewState {
        Showing { item: u32, refreshed: bool },
        Hidden,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum ViewAction {
        Select(u32),
        Refresh,
    }

    #[tokio::test]
    async fn test_identity_change_restarts_with_fresh_snapshot() {
        let snapshots = Arc::new(Mutex::new(Vec::new()));
        let snapshots_in = snapshots.clone();

        let machine: StateMachine<ViewState, ViewAction> = StateMachine::new(
            ViewState::Showing {
                item: 1,
                refreshed: false,
            },
            vec![
                SideEffectBuilder::on_enter_effect(
                    Guard::new(|s: &ViewState| matches!(s, ViewState::Showing { .. })),
                    move |snapshot: Arc<ViewState>| {
                        let snapshots = snapshots_in.clone();
                        async move {
                            if let ViewState::Showing { item, .. } = &*snapshot {
                                snapshots.lock().unwrap().push(*item);
                            }
                            Ok(())
                        }
                    },
                )
                .until_identity_changes(|s: &ViewState| match s {
                    ViewState::Showing { item, .. } => Some(*item),
                    ViewState::Hidden => None,
                }),
                SideEffectBuilder::on_action(
                    Guard::new(|s: &ViewState| matches!(s, ViewState::Showing { .. })),
                    ExecutionPolicy::Ordered,
                    |action: ViewAction| match action {
                        ViewAction::Select(item) => Some(item),
                        ViewAction::Refresh => None,
                    },
                    |item: u32, _snapshot| async move {
                        Ok(ChangedState::override_with(ViewState::Showing {
                            item,
                            refreshed: false,
                        }))
                    },
                ),
            ],
        );

        let mut states = machine.state().unwrap();
        assert_eq!(
            *states.recv().await.unwrap(),
            ViewState::Showing {
                item: 1,
                refreshed: false
            }
        );

        machine.dispatch(ViewAction::Select(2)).unwrap();
        assert_eq!(
            *states.recv().await.unwrap(),
            ViewState::Showing {
                item: 2,
                refreshed: false
            }
        );

        // Each identity got its own activation with its own snapshot.
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(*snapshots.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_same_identity_does_not_restart() {
        let starts = Arc::new(AtomicUsize::new(0));
        let starts_in = starts.clone();

        let machine: StateMachine<ViewState, ViewAction> = StateMachine::new(
            ViewState::Showing {
                item: 1,
                refreshed: false,
            },
            vec![
                SideEffectBuilder::on_enter_effect(
                    Guard::new(|s: &ViewState| matches!(s, ViewState::Showing { .. })),
                    move |_snapshot| {
                        let starts = starts_in.clone();
                        async move {
                            starts.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }
                    },
                )
                .until_identity_changes(|s: &ViewState| match s {
                    ViewState::Showing { item, .. } => Some(*item),
                    ViewState::Hidden => None,
                }),
                // Flips an identity-irrelevant field of the same state.
                SideEffectBuilder::on_action(
                    Guard::new(|s: &ViewState| matches!(s, ViewState::Showing { .. })),
                    ExecutionPolicy::Ordered,
                    |action: ViewAction| match action {
                        ViewAction::Refresh => Some(()),
                        ViewAction::Select(_) => None,
                    },
                    |_: (), _snapshot| async move {
                        Ok(ChangedState::mutate(|state: &ViewState| match state {
                            ViewState::Showing { item, .. } => ViewState::Showing {
                                item: *item,
                                refreshed: true,
                            },
                            ViewState::Hidden => ViewState::Hidden,
                        }))
                    },
                ),
            ],
        );

        let mut states = machine.state().unwrap();
        assert_eq!(
            *states.recv().await.unwrap(),
            ViewState::Showing {
                item: 1,
                refreshed: false
            }
        );

        machine.dispatch(ViewAction::Refresh).unwrap();
        assert_eq!(
            *states.recv().await.unwrap(),
            ViewState::Showing {
                item: 1,
                refreshed: true
            }
        );

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }
}
