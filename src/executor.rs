//! Action executor: one [`Action`] in, a `(success, message)` verdict out.
//! Driver failures are caught here and reported as a failed execution; they
//! never escape to the step loop as errors.

use std::time::Duration;

use anyhow::Result;

use crate::hands::BrowserDriver;
use crate::types::{Action, ScrollDirection, truncate};

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const SCROLL_SETTLE: Duration = Duration::from_millis(500);
const WAIT_DURATION: Duration = Duration::from_secs(2);
const TYPE_CHAR_DELAY: Duration = Duration::from_millis(50);
const TYPED_ECHO_MAX: usize = 50;

/// Perform `action` against the browser. The match is exhaustive over the
/// action vocabulary, so adding a kind without an executor arm is a compile
/// error.
pub async fn execute_action(driver: &dyn BrowserDriver, action: &Action) -> (bool, String) {
    let outcome: Result<(bool, String)> = async {
        match action {
            Action::Click { x, y, .. } => {
                driver.click(*x, *y).await?;
                driver.wait_for_settle(SETTLE_TIMEOUT).await;
                Ok((true, format!("Clicked at ({x}, {y})")))
            }
            Action::Type { text, .. } => {
                driver.type_text(text, TYPE_CHAR_DELAY).await?;
                Ok((true, format!("Typed: {}", truncate(text, TYPED_ECHO_MAX))))
            }
            Action::Key { key, .. } => {
                driver.press_key(key).await?;
                driver.wait_for_settle(SETTLE_TIMEOUT).await;
                Ok((true, format!("Pressed key: {key}")))
            }
            Action::Scroll {
                direction,
                amount,
                x,
                y,
                ..
            } => {
                if let (Some(x), Some(y)) = (x, y) {
                    driver.move_mouse(*x, *y).await?;
                }
                let direction = direction.unwrap_or(ScrollDirection::Down);
                let delta = match direction {
                    ScrollDirection::Down => *amount,
                    ScrollDirection::Up => -*amount,
                };
                driver.scroll(0.0, delta as f64).await?;
                tokio::time::sleep(SCROLL_SETTLE).await;
                Ok((true, format!("Scrolled {direction} {amount}px")))
            }
            Action::Navigate { url, .. } => {
                driver.navigate(url).await?;
                Ok((true, format!("Navigated to {url}")))
            }
            Action::MoveMouse { x, y, .. } => {
                driver.move_mouse(*x, *y).await?;
                Ok((true, format!("Moved mouse to ({x}, {y})")))
            }
            Action::Drag {
                start_x,
                start_y,
                end_x,
                end_y,
                ..
            } => {
                driver.drag(*start_x, *start_y, *end_x, *end_y).await?;
                Ok((
                    true,
                    format!("Dragged from ({start_x}, {start_y}) to ({end_x}, {end_y})"),
                ))
            }
            Action::Screenshot { .. } => {
                // The model asked for a fresh frame; the loop captures one at
                // the top of every iteration anyway.
                Ok((true, "Requested a fresh screenshot".to_string()))
            }
            Action::Wait { .. } => {
                tokio::time::sleep(WAIT_DURATION).await;
                Ok((true, "Waited 2 seconds".to_string()))
            }
            Action::Done { reason } => Ok((true, format!("Goal accomplished: {reason}"))),
            Action::Fail { reason } => Ok((false, format!("Cannot complete: {reason}"))),
        }
    }
    .await;

    match outcome {
        Ok(verdict) => verdict,
        Err(e) => (false, format!("Action failed: {e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Screenshot,
        Click(i64, i64),
        Type(String),
        Key(String),
        Scroll(f64, f64),
        MoveMouse(i64, i64),
        Drag(i64, i64, i64, i64),
        Navigate(String),
        Settle,
    }

    #[derive(Default)]
    struct MockDriver {
        calls: Mutex<Vec<Call>>,
        fail_next: Mutex<Option<String>>,
    }

    impl MockDriver {
        fn record(&self, call: Call) -> anyhow::Result<()> {
            if let Some(message) = self.fail_next.lock().unwrap().take() {
                anyhow::bail!(message);
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrowserDriver for MockDriver {
        async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
            self.record(Call::Screenshot)?;
            Ok(vec![0x89, 0x50, 0x4e, 0x47])
        }

        async fn click(&self, x: i64, y: i64) -> anyhow::Result<()> {
            self.record(Call::Click(x, y))
        }

        async fn type_text(&self, text: &str, _char_delay: Duration) -> anyhow::Result<()> {
            self.record(Call::Type(text.to_string()))
        }

        async fn press_key(&self, key: &str) -> anyhow::Result<()> {
            self.record(Call::Key(key.to_string()))
        }

        async fn scroll(&self, dx: f64, dy: f64) -> anyhow::Result<()> {
            self.record(Call::Scroll(dx, dy))
        }

        async fn move_mouse(&self, x: i64, y: i64) -> anyhow::Result<()> {
            self.record(Call::MoveMouse(x, y))
        }

        async fn drag(
            &self,
            start_x: i64,
            start_y: i64,
            end_x: i64,
            end_y: i64,
        ) -> anyhow::Result<()> {
            self.record(Call::Drag(start_x, start_y, end_x, end_y))
        }

        async fn navigate(&self, url: &str) -> anyhow::Result<()> {
            self.record(Call::Navigate(url.to_string()))
        }

        async fn wait_for_settle(&self, _timeout: Duration) {
            let _ = self.record(Call::Settle);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_down_is_a_positive_delta() {
        let driver = MockDriver::default();
        let action = Action::Scroll {
            direction: Some(ScrollDirection::Down),
            amount: 300,
            x: None,
            y: None,
            reason: None,
        };
        let (success, message) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(driver.calls(), vec![Call::Scroll(0.0, 300.0)]);
        assert_eq!(message, "Scrolled down 300px");
    }

    #[tokio::test(start_paused = true)]
    async fn scroll_up_is_a_negative_delta_after_a_pointer_move() {
        let driver = MockDriver::default();
        let action = Action::Scroll {
            direction: Some(ScrollDirection::Up),
            amount: 300,
            x: Some(640),
            y: Some(400),
            reason: None,
        };
        let (success, _) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(
            driver.calls(),
            vec![Call::MoveMouse(640, 400), Call::Scroll(0.0, -300.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missing_scroll_direction_means_down() {
        let driver = MockDriver::default();
        let action: Action = serde_json::from_str(r#"{"action":"scroll","amount":120}"#).unwrap();
        let (success, message) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(driver.calls(), vec![Call::Scroll(0.0, 120.0)]);
        assert_eq!(message, "Scrolled down 120px");
    }

    #[tokio::test]
    async fn click_settles_after_the_press() {
        let driver = MockDriver::default();
        let action = Action::Click {
            x: 10,
            y: 20,
            reason: None,
        };
        let (success, message) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(driver.calls(), vec![Call::Click(10, 20), Call::Settle]);
        assert_eq!(message, "Clicked at (10, 20)");
    }

    #[tokio::test]
    async fn key_press_settles_like_a_click() {
        let driver = MockDriver::default();
        let action = Action::Key {
            key: "Enter".to_string(),
            reason: None,
        };
        let (success, _) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(
            driver.calls(),
            vec![Call::Key("Enter".to_string()), Call::Settle]
        );
    }

    #[tokio::test]
    async fn typed_text_is_echoed_with_a_bounded_prefix() {
        let driver = MockDriver::default();
        let long = "x".repeat(80);
        let action = Action::Type {
            text: long.clone(),
            reason: None,
        };
        let (success, message) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(driver.calls(), vec![Call::Type(long)]);
        assert_eq!(message.len(), "Typed: ".len() + TYPED_ECHO_MAX);
    }

    #[tokio::test]
    async fn move_mouse_has_no_settle_wait() {
        let driver = MockDriver::default();
        let action = Action::MoveMouse {
            x: 5,
            y: 6,
            reason: None,
        };
        execute_action(&driver, &action).await;
        assert_eq!(driver.calls(), vec![Call::MoveMouse(5, 6)]);
    }

    #[tokio::test]
    async fn drag_is_a_single_primitive_sequence() {
        let driver = MockDriver::default();
        let action = Action::Drag {
            start_x: 1,
            start_y: 2,
            end_x: 3,
            end_y: 4,
            reason: None,
        };
        let (success, _) = execute_action(&driver, &action).await;
        assert!(success);
        assert_eq!(driver.calls(), vec![Call::Drag(1, 2, 3, 4)]);
    }

    #[tokio::test]
    async fn screenshot_touches_nothing_and_succeeds() {
        let driver = MockDriver::default();
        let (success, _) = execute_action(&driver, &Action::Screenshot { reason: None }).await;
        assert!(success);
        assert!(driver.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_and_succeeds() {
        let driver = MockDriver::default();
        let (success, message) = execute_action(&driver, &Action::Wait { reason: None }).await;
        assert!(success);
        assert_eq!(message, "Waited 2 seconds");
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn done_and_fail_echo_their_reasons() {
        let driver = MockDriver::default();
        let (ok, message) = execute_action(
            &driver,
            &Action::Done {
                reason: "found it".to_string(),
            },
        )
        .await;
        assert!(ok);
        assert_eq!(message, "Goal accomplished: found it");

        let (ok, message) = execute_action(
            &driver,
            &Action::Fail {
                reason: "captcha".to_string(),
            },
        )
        .await;
        assert!(!ok);
        assert_eq!(message, "Cannot complete: captcha");
        assert!(driver.calls().is_empty());
    }

    #[tokio::test]
    async fn driver_errors_become_failed_executions() {
        let driver = MockDriver::default();
        *driver.fail_next.lock().unwrap() = Some("element detached".to_string());
        let action = Action::Click {
            x: 1,
            y: 1,
            reason: None,
        };
        let (success, message) = execute_action(&driver, &action).await;
        assert!(!success);
        assert!(message.contains("Action failed"));
        assert!(message.contains("element detached"));
    }
}
