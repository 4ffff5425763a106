//! Stress tests designed to break the engine.
//!
//! These exercise races between action storms, guard flips, and
//! cancellation under load.

#[cfg(test)]
mod stress_tests {
    use crate::change::ChangedState;
    use crate::effect::{RunContext, SideEffect, SideEffectBuilder};
    use crate::guard::Guard;
    use crate::machine::StateMachine;
    use crate::policy::ExecutionPolicy;
    use crate::testing::StateRecorder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Tally {
        total: u64,
        flips: u64,
        gate_open: bool,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum StormAction {
        Add(u64),
        Flip,
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_ordered_storm_loses_nothing() {
        let machine: StateMachine<Tally, StormAction> = StateMachine::new(
            Tally {
                total: 0,
                flips: 0,
                gate_open: true,
            },
            vec![SideEffectBuilder::on_action(
                Guard::new(|_: &Tally| true),
                ExecutionPolicy::Ordered,
                |action: StormAction| match action {
                    StormAction::Add(n) => Some(n),
                    StormAction::Flip => None,
                },
                |n: u64, _snapshot| async move {
                    Ok(ChangedState::mutate(move |t: &Tally| Tally {
                        total: t.total + n,
                        ..t.clone()
                    }))
                },
            )],
        );

        let recorder = StateRecorder::start(machine.state().unwrap());
        recorder.wait_for_count(1).await;

        let mut expected = 0u64;
        let rounds = 500;
        for _ in 0..rounds {
            let n = fastrand::u64(1..10);
            expected += n;
            machine.dispatch(StormAction::Add(n)).unwrap();
            if fastrand::u8(..) < 16 {
                tokio::task::yield_now().await;
            }
        }

        // Every dispatched Add applies exactly once, in order.
        recorder.wait_for_count(rounds + 1).await;
        let final_state = recorder.states().last().cloned().unwrap();
        assert_eq!(final_state.total, expected);
        assert_eq!(recorder.len(), rounds + 1);
    }

    /// Long-running side effect counting concurrent instances.
    struct InstanceCounter {
        guard: Guard<Tally>,
        alive: Arc<AtomicUsize>,
        max_alive: Arc<AtomicUsize>,
    }

    struct AliveGuard(Arc<AtomicUsize>);

    impl Drop for AliveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SideEffect<Tally, StormAction> for InstanceCounter {
        fn guard(&self) -> Guard<Tally> {
            self.guard.clone()
        }

        async fn run(self: Box<Self>, mut ctx: RunContext<Tally, StormAction>) {
            let alive = self.alive.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_alive.fetch_max(alive, Ordering::SeqCst);
            let _guard = AliveGuard(Arc::clone(&self.alive));
            while ctx.next_action().await.is_some() {}
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guard_flip_storm_never_double_starts() {
        let alive = Arc::new(AtomicUsize::new(0));
        let max_alive = Arc::new(AtomicUsize::new(0));

        let counter_descriptor = {
            let alive = Arc::clone(&alive);
            let max_alive = Arc::clone(&max_alive);
            let guard = Guard::new(|t: &Tally| t.gate_open);
            SideEffectBuilder::new(guard.clone(), move |_snapshot| {
                Box::new(InstanceCounter {
                    guard: guard.clone(),
                    alive: Arc::clone(&alive),
                    max_alive: Arc::clone(&max_alive),
                }) as Box<dyn SideEffect<Tally, StormAction>>
            })
        };

        let machine: StateMachine<Tally, StormAction> = StateMachine::new(
            Tally {
                total: 0,
                flips: 0,
                gate_open: true,
            },
            vec![
                counter_descriptor,
                SideEffectBuilder::on_action(
                    Guard::new(|_: &Tally| true),
                    ExecutionPolicy::Ordered,
                    |action: StormAction| match action {
                        StormAction::Flip => Some(()),
                        StormAction::Add(_) => None,
                    },
                    |_: (), _snapshot| async move {
                        Ok(ChangedState::mutate(|t: &Tally| Tally {
                            flips: t.flips + 1,
                            gate_open: !t.gate_open,
                            ..t.clone()
                        }))
                    },
                ),
            ],
        );

        let recorder = StateRecorder::start(machine.state().unwrap());
        recorder.wait_for_count(1).await;

        let flips = 200u64;
        for _ in 0..flips {
            machine.dispatch(StormAction::Flip).unwrap();
            if fastrand::u8(..) < 32 {
                tokio::task::yield_now().await;
            }
        }

        let settled = recorder.wait_for(|t| t.flips == flips).await;
        assert_eq!(settled.gate_open, true, "even flip count reopens the gate");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            max_alive.load(Ordering::SeqCst),
            1,
            "cancel-then-join must prevent overlapping instances"
        );
        assert_eq!(alive.load(Ordering::SeqCst), 1, "gate open: one instance alive");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mixed_storm_keeps_reductions_serialized() {
        // Adds run unordered while flips run ordered; totals must still be
        // exact because reductions are serialized and mutate reads the
        // freshest state.
        let machine: StateMachine<Tally, StormAction> = StateMachine::new(
            Tally {
                total: 0,
                flips: 0,
                gate_open: true,
            },
            vec![
                SideEffectBuilder::on_action(
                    Guard::new(|_: &Tally| true),
                    ExecutionPolicy::Unordered,
                    |action: StormAction| match action {
                        StormAction::Add(n) => Some(n),
                        StormAction::Flip => None,
                    },
                    |n: u64, _snapshot| async move {
                        tokio::time::sleep(Duration::from_micros(fastrand::u64(..200))).await;
                        Ok(ChangedState::mutate(move |t: &Tally| Tally {
                            total: t.total + n,
                            ..t.clone()
                        }))
                    },
                ),
                SideEffectBuilder::on_action(
                    Guard::new(|_: &Tally| true),
                    ExecutionPolicy::Ordered,
                    |action: StormAction| match action {
                        StormAction::Flip => Some(()),
                        StormAction::Add(_) => None,
                    },
                    |_: (), _snapshot| async move {
                        Ok(ChangedState::mutate(|t: &Tally| Tally {
                            flips: t.flips + 1,
                            ..t.clone()
                        }))
                    },
                ),
            ],
        );

        let recorder = StateRecorder::start(machine.state().unwrap());
        recorder.wait_for_count(1).await;

        let mut expected_total = 0u64;
        let mut expected_flips = 0u64;
        for _ in 0..300 {
            if fastrand::bool() {
                let n = fastrand::u64(1..5);
                expected_total += n;
                machine.dispatch(StormAction::Add(n)).unwrap();
            } else {
                expected_flips += 1;
                machine.dispatch(StormAction::Flip).unwrap();
            }
            if fastrand::u8(..) < 16 {
                tokio::task::yield_now().await;
            }
        }

        let settled = recorder
            .wait_for(|t| t.total == expected_total && t.flips == expected_flips)
            .await;
        assert_eq!(settled.total, expected_total);
        assert_eq!(settled.flips, expected_flips);
    }
}
