//! Property tests: whatever the interleaving, items only ever move
//! CREATED → PROCESSING → {COMPLETED | ERROR}, and terminal states stick.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::*;
use projectq::broker::Broker;
use projectq::engine::{Disposition, Registry, handler_fn};
use projectq::error::Error;
use projectq::model::*;
use projectq::store::{MemoryStore, WorkStore};
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn any_state() -> impl Strategy<Value = State> {
    prop::sample::select(State::ALL.to_vec())
}

/// One attempted store transition on item `item`.
#[derive(Debug, Clone)]
struct Step {
    item: usize,
    expected: State,
    to: State,
}

fn steps(items: usize) -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        (0..items, any_state(), any_state()).prop_map(|(item, expected, to)| Step {
            item,
            expected,
            to,
        }),
        0..40,
    )
}

proptest! {
    #[test]
    fn random_transitions_only_follow_the_machine(ops in steps(3)) {
        let rt = runtime();
        rt.block_on(async {
            let store = MemoryStore::new();
            let mut ids = Vec::new();
            for n in 0..3 {
                ids.push(store.create(NewWorkItem::new(format!("T{n}"))).await.unwrap().id);
            }
            let mut history: HashMap<WorkId, Vec<State>> =
                ids.iter().map(|id| (*id, vec![State::Created])).collect();

            for op in &ops {
                let id = ids[op.item];
                let before = store.get(id).await.unwrap();
                match store.transition(id, op.expected, op.to).await {
                    Ok(after) => {
                        prop_assert!(before.state.can_transition_to(after.state));
                        prop_assert_eq!(before.state, op.expected);
                        prop_assert!(after.updated_at >= before.updated_at);
                        history.get_mut(&id).unwrap().push(after.state);
                    }
                    Err(Error::InvalidTransition { .. }) => {
                        prop_assert!(!op.expected.can_transition_to(op.to));
                    }
                    Err(Error::StateConflict { actual, .. }) => {
                        prop_assert_eq!(actual, before.state);
                        prop_assert_ne!(actual, op.expected);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {e}"),
                }
                prop_assert_eq!(store.get(id).await.unwrap().state, *history[&id].last().unwrap());
            }

            for states in history.values() {
                prop_assert!(states.len() <= 3);
                for pair in states.windows(2) {
                    prop_assert!(pair[0].can_transition_to(pair[1]));
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn duplicate_deliveries_perform_exactly_once(
        copies in 1usize..5,
        succeed in any::<bool>(),
        workers in 1usize..4,
    ) {
        let rt = runtime();
        rt.block_on(async {
            let calls = Arc::new(AtomicU32::new(0));
            let handler = {
                let calls = calls.clone();
                handler_fn(move |_item| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        if succeed {
                            Ok(())
                        } else {
                            Err(Error::WorkFailure("nope".to_string()))
                        }
                    }
                })
            };
            let h = harness(Registry::empty().with_handler(DEFAULT_KIND, handler));
            let id = h.engine.submit(NewWorkItem::new("T")).await.unwrap();
            for _ in 1..copies {
                h.broker.enqueue(id).await.unwrap();
            }

            let executor = h.engine.executor(h.executor_config());
            let mut tasks = tokio::task::JoinSet::new();
            for _ in 0..workers {
                let executor = executor.clone();
                let broker = h.broker.clone();
                tasks.spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(d) = broker.receive(Duration::from_millis(20)).await.unwrap() {
                        seen.push(executor.handle(&d).await.unwrap());
                    }
                    seen
                });
            }

            let mut dispositions: Vec<Disposition> = Vec::new();
            while let Some(seen) = tasks.join_next().await {
                dispositions.extend(seen.unwrap());
            }

            prop_assert_eq!(dispositions.len(), copies);
            prop_assert_eq!(dispositions.iter().filter(|d| d.performed()).count(), 1);
            prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
            let expected = if succeed { State::Completed } else { State::Error };
            prop_assert_eq!(h.engine.status(id).await.unwrap(), expected);
            prop_assert_eq!(h.broker.pending().await, 0);
            Ok(())
        })?;
    }
}
