//! Browser driver: the primitive-operation contract the executor runs
//! against, plus the Chrome-backed implementation. All CDP work happens on
//! blocking tasks; the async trait surface keeps the step loop cooperative.

use std::ffi::OsStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::protocol::cdp::{Input, Page};
use headless_chrome::{Browser, LaunchOptions, Tab};
use tracing::debug;

use crate::types::{VIEWPORT_HEIGHT, VIEWPORT_WIDTH};

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const SETTLE_FALLBACK_SLEEP: Duration = Duration::from_millis(1000);

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 Chrome/120.0.0.0 Safari/537.36";

/// Primitive UI operations the executor maps actions onto.
///
/// `wait_for_settle` is infallible: a page that never goes quiet is normal
/// for single-page apps, so the implementation must fall back to a fixed
/// short sleep instead of reporting an error.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// Capture the current viewport as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>>;
    async fn click(&self, x: i64, y: i64) -> Result<()>;
    async fn type_text(&self, text: &str, char_delay: Duration) -> Result<()>;
    async fn press_key(&self, key: &str) -> Result<()>;
    /// Scroll by a pixel delta at the current pointer position.
    async fn scroll(&self, dx: f64, dy: f64) -> Result<()>;
    async fn move_mouse(&self, x: i64, y: i64) -> Result<()>;
    async fn drag(&self, start_x: i64, start_y: i64, end_x: i64, end_y: i64) -> Result<()>;
    async fn navigate(&self, url: &str) -> Result<()>;
    async fn wait_for_settle(&self, timeout: Duration);
}

/// One Chrome instance with a single automated tab.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    // Wheel events carry a position; remember where the pointer last was so
    // scrolls land on the element the model aimed at.
    pointer: Arc<Mutex<(f64, f64)>>,
}

impl ChromeSession {
    pub fn launch(headless: bool) -> Result<Self> {
        let options = LaunchOptions {
            headless,
            sandbox: false,
            window_size: Some((VIEWPORT_WIDTH, VIEWPORT_HEIGHT)),
            args: vec![
                OsStr::new("--disable-dev-shm-usage"),
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
                OsStr::new("--disable-blink-features=AutomationControlled"),
            ],
            // Model calls can keep the CDP connection quiet for a while.
            idle_browser_timeout: Duration::from_secs(300),
            ..Default::default()
        };

        let browser = Browser::new(options)?;
        let tab = browser.new_tab()?;
        tab.set_default_timeout(NAVIGATION_TIMEOUT);
        tab.set_user_agent(USER_AGENT, None, None)?;
        debug!("chrome session ready");

        Ok(Self {
            _browser: browser,
            tab,
            pointer: Arc::new(Mutex::new((
                VIEWPORT_WIDTH as f64 / 2.0,
                VIEWPORT_HEIGHT as f64 / 2.0,
            ))),
        })
    }
}

#[async_trait]
impl BrowserDriver for ChromeSession {
    async fn screenshot(&self) -> Result<Vec<u8>> {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || {
            tab.capture_screenshot(Page::CaptureScreenshotFormatOption::Png, None, None, true)
        })
        .await?
    }

    async fn click(&self, x: i64, y: i64) -> Result<()> {
        let tab = self.tab.clone();
        let pointer = self.pointer.clone();
        tokio::task::spawn_blocking(move || {
            tab.click_point(Point {
                x: x as f64,
                y: y as f64,
            })?;
            *pointer.lock().unwrap() = (x as f64, y as f64);
            Ok(())
        })
        .await?
    }

    async fn type_text(&self, text: &str, char_delay: Duration) -> Result<()> {
        let tab = self.tab.clone();
        let text = text.to_string();
        tokio::task::spawn_blocking(move || {
            for ch in text.chars() {
                tab.send_character(&ch.to_string())?;
                std::thread::sleep(char_delay);
            }
            Ok(())
        })
        .await?
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let tab = self.tab.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            tab.press_key(&key)?;
            Ok(())
        })
        .await?
    }

    async fn scroll(&self, dx: f64, dy: f64) -> Result<()> {
        let tab = self.tab.clone();
        let (x, y) = *self.pointer.lock().unwrap();
        tokio::task::spawn_blocking(move || {
            tab.call_method(Input::DispatchMouseEvent {
                Type: Input::DispatchMouseEventTypeOption::MouseWheel,
                x,
                y,
                delta_x: Some(dx),
                delta_y: Some(dy),
                modifiers: None,
                timestamp: None,
                button: None,
                buttons: None,
                click_count: None,
                force: None,
                tangential_pressure: None,
                tilt_x: None,
                tilt_y: None,
                twist: None,
                pointer_Type: None,
            })?;
            Ok(())
        })
        .await?
    }

    async fn move_mouse(&self, x: i64, y: i64) -> Result<()> {
        let tab = self.tab.clone();
        let pointer = self.pointer.clone();
        tokio::task::spawn_blocking(move || {
            tab.move_mouse_to_point(Point {
                x: x as f64,
                y: y as f64,
            })?;
            *pointer.lock().unwrap() = (x as f64, y as f64);
            Ok(())
        })
        .await?
    }

    async fn drag(&self, start_x: i64, start_y: i64, end_x: i64, end_y: i64) -> Result<()> {
        let tab = self.tab.clone();
        let pointer = self.pointer.clone();
        tokio::task::spawn_blocking(move || {
            let start = Point {
                x: start_x as f64,
                y: start_y as f64,
            };
            let end = Point {
                x: end_x as f64,
                y: end_y as f64,
            };
            tab.move_mouse_to_point(start)?;
            tab.call_method(Input::DispatchMouseEvent {
                Type: Input::DispatchMouseEventTypeOption::MousePressed,
                x: start.x,
                y: start.y,
                button: Some(Input::MouseButton::Left),
                click_count: Some(1),
                modifiers: None,
                timestamp: None,
                buttons: None,
                force: None,
                tangential_pressure: None,
                tilt_x: None,
                tilt_y: None,
                twist: None,
                delta_x: None,
                delta_y: None,
                pointer_Type: None,
            })?;
            tab.move_mouse_to_point(end)?;
            tab.call_method(Input::DispatchMouseEvent {
                Type: Input::DispatchMouseEventTypeOption::MouseReleased,
                x: end.x,
                y: end.y,
                button: Some(Input::MouseButton::Left),
                click_count: Some(1),
                modifiers: None,
                timestamp: None,
                buttons: None,
                force: None,
                tangential_pressure: None,
                tilt_x: None,
                tilt_y: None,
                twist: None,
                delta_x: None,
                delta_y: None,
                pointer_Type: None,
            })?;
            *pointer.lock().unwrap() = (end.x, end.y);
            Ok(())
        })
        .await?
    }

    async fn navigate(&self, url: &str) -> Result<()> {
        let tab = self.tab.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || {
            tab.navigate_to(&url)?;
            tab.wait_until_navigated()?;
            Ok(())
        })
        .await?
    }

    async fn wait_for_settle(&self, timeout: Duration) {
        let tab = self.tab.clone();
        let settled = tokio::task::spawn_blocking(move || {
            tab.wait_for_element_with_custom_timeout("body", timeout)
                .map(|_| ())
        })
        .await;
        // Single-page apps may never settle; a short fixed pause is the safe
        // substitute for a quiescence signal.
        if !matches!(settled, Ok(Ok(()))) {
            tokio::time::sleep(SETTLE_FALLBACK_SLEEP).await;
        }
    }
}
