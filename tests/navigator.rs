//! End-to-end step-loop behaviour against a scripted brain and a mock
//! browser driver: numbering, the step ceiling, cooperative stop, terminal
//! actions, and the post-failure backoff policy.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use web_navigator::brain::Brain;
use web_navigator::hands::BrowserDriver;
use web_navigator::navigator::{Navigator, RunOutcome};
use web_navigator::types::{Action, MAX_STEPS, RunningContext, StepResult};

/// Replays a fixed list of decisions, then waits forever. Optionally sets a
/// stop signal while deciding a given step, which is the only race-free way
/// to exercise "cancel between steps".
struct ScriptedBrain {
    script: Mutex<VecDeque<Action>>,
    cancel_while_deciding: Option<(u32, CancellationToken)>,
    decided: Mutex<u32>,
}

impl ScriptedBrain {
    fn new(script: Vec<Action>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            cancel_while_deciding: None,
            decided: Mutex::new(0),
        })
    }

    fn cancelling(script: Vec<Action>, step: u32, stop: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            cancel_while_deciding: Some((step, stop)),
            decided: Mutex::new(0),
        })
    }
}

#[async_trait]
impl Brain for ScriptedBrain {
    fn initial_context(&self) -> RunningContext {
        RunningContext::History(Vec::new())
    }

    async fn decide(
        &self,
        _screenshot_b64: &str,
        _goal: &str,
        _ctx: &mut RunningContext,
    ) -> Action {
        let step = {
            let mut decided = self.decided.lock().unwrap();
            *decided += 1;
            *decided
        };
        if let Some((cancel_at, stop)) = &self.cancel_while_deciding {
            if step == *cancel_at {
                stop.cancel();
            }
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Action::Wait { reason: None })
    }
}

#[derive(Default)]
struct MockDriver {
    clicks: Mutex<Vec<(i64, i64)>>,
    typed: Mutex<Vec<String>>,
    keys: Mutex<Vec<String>>,
    fail_clicks: AtomicBool,
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        Ok(vec![0x89, 0x50, 0x4e, 0x47])
    }

    async fn click(&self, x: i64, y: i64) -> anyhow::Result<()> {
        if self.fail_clicks.load(Ordering::SeqCst) {
            anyhow::bail!("node is detached from document");
        }
        self.clicks.lock().unwrap().push((x, y));
        Ok(())
    }

    async fn type_text(&self, text: &str, _char_delay: Duration) -> anyhow::Result<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn press_key(&self, key: &str) -> anyhow::Result<()> {
        self.keys.lock().unwrap().push(key.to_string());
        Ok(())
    }

    async fn scroll(&self, _dx: f64, _dy: f64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn move_mouse(&self, _x: i64, _y: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn drag(&self, _x1: i64, _y1: i64, _x2: i64, _y2: i64) -> anyhow::Result<()> {
        Ok(())
    }

    async fn navigate(&self, _url: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wait_for_settle(&self, _timeout: Duration) {}
}

/// Drive a run to completion and collect everything it emitted.
async fn collect_run(
    driver: Arc<MockDriver>,
    brain: Arc<dyn Brain>,
    stop: CancellationToken,
) -> (Vec<StepResult>, RunOutcome) {
    let navigator = Navigator::new(driver, brain, "search for pigs", stop);
    let (tx, mut rx) = mpsc::channel::<StepResult>(64);
    let run = tokio::spawn(async move { navigator.run(tx).await });
    let mut results = Vec::new();
    while let Some(result) = rx.recv().await {
        results.push(result);
    }
    (results, run.await.unwrap())
}

#[tokio::test(start_paused = true)]
async fn steps_count_up_from_one_and_stop_at_the_ceiling() {
    let driver = Arc::new(MockDriver::default());
    // Nothing in the script: the brain waits forever.
    let brain = ScriptedBrain::new(Vec::new());
    let (results, outcome) = collect_run(driver, brain, CancellationToken::new()).await;

    assert_eq!(outcome, RunOutcome::StepLimit);
    assert_eq!(results.len(), MAX_STEPS as usize);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.step, i as u32 + 1);
    }
}

#[tokio::test(start_paused = true)]
async fn search_scenario_ends_with_done_on_step_four() {
    let driver = Arc::new(MockDriver::default());
    let brain = ScriptedBrain::new(vec![
        Action::Click {
            x: 640,
            y: 360,
            reason: Some("focus the search box".to_string()),
        },
        Action::Type {
            text: "pigs".to_string(),
            reason: Some("enter the query".to_string()),
        },
        Action::Key {
            key: "Enter".to_string(),
            reason: Some("submit the search".to_string()),
        },
        Action::Done {
            reason: "search results for pigs are on screen".to_string(),
        },
    ]);
    let (results, outcome) = collect_run(driver.clone(), brain, CancellationToken::new()).await;

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.success));
    assert_eq!(results[3].action.kind(), "done");
    assert_eq!(
        outcome,
        RunOutcome::Done {
            reason: "search results for pigs are on screen".to_string()
        }
    );

    assert_eq!(*driver.clicks.lock().unwrap(), vec![(640, 360)]);
    assert_eq!(*driver.typed.lock().unwrap(), vec!["pigs".to_string()]);
    assert_eq!(*driver.keys.lock().unwrap(), vec!["Enter".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn captcha_block_fails_the_run_before_the_ceiling() {
    let driver = Arc::new(MockDriver::default());
    let brain = ScriptedBrain::new(vec![Action::Fail {
        reason: "blocked by a CAPTCHA challenge".to_string(),
    }]);
    let (results, outcome) = collect_run(driver, brain, CancellationToken::new()).await;

    assert_eq!(results.len(), 1);
    assert!(!results[0].success);
    assert!(results[0].message.contains("CAPTCHA"));
    match outcome {
        RunOutcome::Failed { reason } => assert!(reason.contains("CAPTCHA")),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn stop_between_steps_emits_nothing_further() {
    let driver = Arc::new(MockDriver::default());
    let stop = CancellationToken::new();
    // The signal is set while step 2's decision is in flight; step 2 still
    // completes and is emitted, step 3 never starts.
    let brain = ScriptedBrain::cancelling(Vec::new(), 2, stop.clone());
    let (results, outcome) = collect_run(driver, brain, stop).await;

    assert_eq!(outcome, RunOutcome::Stopped);
    assert_eq!(results.len(), 2);
    assert_eq!(results.last().unwrap().step, 2);
}

#[tokio::test(start_paused = true)]
async fn stop_before_the_first_step_emits_nothing() {
    let driver = Arc::new(MockDriver::default());
    let stop = CancellationToken::new();
    stop.cancel();
    let brain = ScriptedBrain::new(Vec::new());
    let (results, outcome) = collect_run(driver, brain, stop).await;

    assert_eq!(outcome, RunOutcome::Stopped);
    assert!(results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn failed_execution_continues_the_run() {
    let driver = Arc::new(MockDriver::default());
    driver.fail_clicks.store(true, Ordering::SeqCst);
    let brain = ScriptedBrain::new(vec![
        Action::Click {
            x: 10,
            y: 10,
            reason: None,
        },
        Action::Done {
            reason: "gave up clicking and declared victory".to_string(),
        },
    ]);
    let (results, outcome) = collect_run(driver, brain, CancellationToken::new()).await;

    assert_eq!(results.len(), 2);
    assert!(!results[0].success);
    assert!(results[0].message.contains("detached"));
    assert!(results[1].success);
    assert!(matches!(outcome, RunOutcome::Done { .. }));
}

#[tokio::test(start_paused = true)]
async fn history_context_records_each_step() {
    // The brain sees its own history through the running context; verify the
    // loop feeds executed steps back in.
    struct HistoryProbe {
        seen: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl Brain for HistoryProbe {
        fn initial_context(&self) -> RunningContext {
            RunningContext::History(Vec::new())
        }

        async fn decide(
            &self,
            _screenshot_b64: &str,
            _goal: &str,
            ctx: &mut RunningContext,
        ) -> Action {
            let len = match ctx {
                RunningContext::History(entries) => entries.len(),
                RunningContext::Transcript(_) => usize::MAX,
            };
            let mut seen = self.seen.lock().unwrap();
            seen.push(len);
            if seen.len() == 3 {
                Action::Done {
                    reason: "enough".to_string(),
                }
            } else {
                Action::Wait { reason: None }
            }
        }
    }

    let probe = Arc::new(HistoryProbe {
        seen: Mutex::new(Vec::new()),
    });
    let driver = Arc::new(MockDriver::default());
    let (_, outcome) = collect_run(driver, probe.clone(), CancellationToken::new()).await;

    assert!(matches!(outcome, RunOutcome::Done { .. }));
    assert_eq!(*probe.seen.lock().unwrap(), vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn dropped_receiver_detaches_the_run() {
    let driver = Arc::new(MockDriver::default());
    let brain = ScriptedBrain::new(Vec::new());
    let navigator = Navigator::new(driver, brain, "goal", CancellationToken::new());
    let (tx, rx) = mpsc::channel::<StepResult>(1);
    drop(rx);
    assert_eq!(navigator.run(tx).await, RunOutcome::Detached);
}
