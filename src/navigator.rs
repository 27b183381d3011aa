//! Step loop: capture a screenshot, ask the brain, execute the action, emit
//! a [`StepResult`]. One cooperative task per run; cancellation is observed
//! at iteration boundaries only, so an in-flight model call or browser
//! operation always completes before the run stops.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::brain::Brain;
use crate::executor::execute_action;
use crate::hands::BrowserDriver;
use crate::types::{Action, MAX_STEPS, StepResult};

/// Pause between iterations after a failed interaction.
const STEP_BACKOFF: Duration = Duration::from_secs(2);

/// How one run ended. `StepLimit` is the silent ceiling: no terminal action
/// was decided, and callers must not confuse it with `done`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Done { reason: String },
    Failed { reason: String },
    Stopped,
    StepLimit,
    /// The result receiver went away (client disconnect); nothing left to do.
    Detached,
}

pub struct Navigator {
    driver: Arc<dyn BrowserDriver>,
    brain: Arc<dyn Brain>,
    goal: String,
    stop: CancellationToken,
}

impl Navigator {
    pub fn new(
        driver: Arc<dyn BrowserDriver>,
        brain: Arc<dyn Brain>,
        goal: impl Into<String>,
        stop: CancellationToken,
    ) -> Self {
        Self {
            driver,
            brain,
            goal: goal.into(),
            stop,
        }
    }

    /// Run to termination, emitting one [`StepResult`] per iteration on
    /// `results`. Steps are numbered from 1 and strictly increasing; at most
    /// [`MAX_STEPS`] results are ever emitted.
    pub async fn run(&self, results: mpsc::Sender<StepResult>) -> RunOutcome {
        let mut ctx = self.brain.initial_context();
        info!(goal = %self.goal, "run started");

        for step in 1..=MAX_STEPS {
            if self.stop.is_cancelled() {
                info!(step, "stop requested, ending run");
                return RunOutcome::Stopped;
            }

            let started = Instant::now();

            let screenshot_b64 = match self.driver.screenshot().await {
                Ok(bytes) => BASE64.encode(&bytes),
                Err(e) => {
                    warn!(step, error = %format!("{e:#}"), "screenshot capture failed");
                    return RunOutcome::Failed {
                        reason: format!("screenshot capture failed: {e:#}"),
                    };
                }
            };

            let action = self
                .brain
                .decide(&screenshot_b64, &self.goal, &mut ctx)
                .await;
            debug!(step, kind = action.kind(), "action decided");

            let (success, message) = execute_action(self.driver.as_ref(), &action).await;
            if !success {
                warn!(step, kind = action.kind(), %message, "execution failed");
            }

            ctx.push_history(step, action.kind(), &message);

            let result = StepResult {
                step,
                screenshot_b64,
                action: action.clone(),
                success,
                message,
                elapsed_ms: started.elapsed().as_millis() as u64,
            };
            if results.send(result).await.is_err() {
                info!(step, "result receiver dropped, ending run");
                return RunOutcome::Detached;
            }

            match action {
                Action::Done { reason } => {
                    info!(step, "run finished");
                    return RunOutcome::Done { reason };
                }
                Action::Fail { reason } => {
                    info!(step, %reason, "run failed");
                    return RunOutcome::Failed { reason };
                }
                Action::Wait { .. } => {}
                _ if !success => {
                    tokio::time::sleep(STEP_BACKOFF).await;
                }
                _ => {}
            }
        }

        info!(max_steps = MAX_STEPS, "step ceiling reached");
        RunOutcome::StepLimit
    }
}
