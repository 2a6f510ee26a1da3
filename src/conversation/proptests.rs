//! Property-based tests for the conversation cursor
//!
//! Drives the engine with arbitrary outcome scripts and checks it against a
//! trivial model: `None` for no session, `Some(cursor)` otherwise.

use super::*;
use crate::testing::text_update;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Success,
    Repeat,
    End,
    Fail,
}

fn arb_scripted() -> impl Strategy<Value = Scripted> {
    prop_oneof![
        4 => Just(Scripted::Success),
        2 => Just(Scripted::Repeat),
        1 => Just(Scripted::End),
        1 => Just(Scripted::Fail),
    ]
}

/// Every stage pops the next scripted outcome and logs its own index
fn scripted_stages(
    count: usize,
    script: &Arc<Mutex<VecDeque<Scripted>>>,
    ran: &Arc<Mutex<Vec<usize>>>,
) -> Stages {
    let mut builder = Stages::builder();
    for index in 0..count {
        let script = Arc::clone(script);
        let ran = Arc::clone(ran);
        builder = builder.stage(move |_update: Update| {
            ran.lock().unwrap().push(index);
            let next = script.lock().unwrap().pop_front().unwrap_or(Scripted::Success);
            async move {
                match next {
                    Scripted::Success => StageOutcome::Success,
                    Scripted::Repeat => StageOutcome::Repeat,
                    Scripted::End => StageOutcome::End,
                    Scripted::Fail => StageOutcome::failure("scripted failure"),
                }
            }
        });
    }
    builder.build().unwrap()
}

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

proptest! {
    #[test]
    fn prop_engine_matches_cursor_model(
        stage_count in 1usize..6,
        script in proptest::collection::vec(arb_scripted(), 1..40),
    ) {
        block_on(async {
            let queue = Arc::new(Mutex::new(script.iter().copied().collect::<VecDeque<_>>()));
            let ran = Arc::new(Mutex::new(Vec::new()));
            let stages = scripted_stages(stage_count, &queue, &ran);
            let engine = ConversationEngine::in_memory();

            let mut model: Option<usize> = None;
            for (step, scripted) in script.iter().enumerate() {
                let update = text_update(i64::try_from(step).unwrap(), 7, 42, "x");
                let expected_stage = model.unwrap_or(0);

                let result = if model.is_none() {
                    model = Some(0);
                    engine.start(&stages, &update).await
                } else {
                    engine.advance(&update).await
                };

                // The stage at the model cursor ran, nothing else
                prop_assert_eq!(ran.lock().unwrap().last().copied(), Some(expected_stage));

                let cursor = expected_stage;
                match scripted {
                    Scripted::Success if cursor + 1 == stage_count => {
                        prop_assert_eq!(result.unwrap(), Progress::Completed);
                        model = None;
                    }
                    Scripted::Success => {
                        prop_assert_eq!(result.unwrap(), Progress::Advanced { next_stage: cursor + 1 });
                        model = Some(cursor + 1);
                    }
                    Scripted::Repeat => {
                        prop_assert_eq!(result.unwrap(), Progress::Repeated { stage: cursor });
                    }
                    Scripted::End => {
                        prop_assert_eq!(result.unwrap(), Progress::Ended { stage: cursor });
                        model = None;
                    }
                    Scripted::Fail => {
                        let is_stage_failure = matches!(
                            result,
                            Err(ConversationError::Stage { stage, .. }) if stage == cursor
                        );
                        prop_assert!(is_stage_failure);
                    }
                }

                prop_assert_eq!(engine.has_active(7, 42).await, model.is_some());
                let stored = engine.store().get(42).await.unwrap().map(|s| s.cursor);
                prop_assert_eq!(stored, model);
            }

            prop_assert_eq!(ran.lock().unwrap().len(), script.len());
            Ok::<(), TestCaseError>(())
        })?;
    }

    #[test]
    fn prop_n_successes_always_complete(stage_count in 1usize..10) {
        block_on(async {
            let queue = Arc::new(Mutex::new(VecDeque::new()));
            let ran = Arc::new(Mutex::new(Vec::new()));
            let stages = scripted_stages(stage_count, &queue, &ran);
            let engine = ConversationEngine::in_memory();

            let mut last = engine.start(&stages, &text_update(0, 7, 42, "/start")).await.unwrap();
            for step in 1..stage_count {
                prop_assert!(engine.has_active(7, 42).await);
                last = engine
                    .advance(&text_update(i64::try_from(step).unwrap(), 7, 42, "x"))
                    .await
                    .unwrap();
            }

            prop_assert_eq!(last, Progress::Completed);
            prop_assert!(!engine.has_active(7, 42).await);
            prop_assert_eq!(ran.lock().unwrap().clone(), (0..stage_count).collect::<Vec<_>>());
            Ok::<(), TestCaseError>(())
        })?;
    }
}
