use serde::{Deserialize, Serialize};

use crate::gemini::Content;

/// One decided unit of browser manipulation, or a run-termination signal.
///
/// The wire shape is a flat JSON object tagged by `action`, e.g.
/// `{"action":"click","x":640,"y":360,"reason":"open the search box"}`.
/// `done` and `fail` are terminal; their `reason` is the run's final message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Click {
        x: i64,
        y: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Type {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Scroll {
        #[serde(default)]
        direction: Option<ScrollDirection>,
        #[serde(default = "default_scroll_amount")]
        amount: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        x: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        y: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Navigate {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Wait {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Key {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    MoveMouse {
        x: i64,
        y: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Drag {
        start_x: i64,
        start_y: i64,
        end_x: i64,
        end_y: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Screenshot {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Done {
        #[serde(default)]
        reason: String,
    },
    Fail {
        #[serde(default)]
        reason: String,
    },
}

impl Action {
    /// Wire name of the kind, as used in events and history lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Click { .. } => "click",
            Action::Type { .. } => "type",
            Action::Scroll { .. } => "scroll",
            Action::Navigate { .. } => "navigate",
            Action::Wait { .. } => "wait",
            Action::Key { .. } => "key",
            Action::MoveMouse { .. } => "move_mouse",
            Action::Drag { .. } => "drag",
            Action::Screenshot { .. } => "screenshot",
            Action::Done { .. } => "done",
            Action::Fail { .. } => "fail",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Action::Click { reason, .. }
            | Action::Type { reason, .. }
            | Action::Scroll { reason, .. }
            | Action::Navigate { reason, .. }
            | Action::Wait { reason, .. }
            | Action::Key { reason, .. }
            | Action::MoveMouse { reason, .. }
            | Action::Drag { reason, .. }
            | Action::Screenshot { reason, .. } => reason.as_deref(),
            Action::Done { reason } | Action::Fail { reason } => Some(reason.as_str()),
        }
    }

    /// `done` and `fail` end the run; no further steps follow them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. } | Action::Fail { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl std::str::FromStr for ScrollDirection {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(ScrollDirection::Up),
            "down" => Ok(ScrollDirection::Down),
            other => Err(anyhow::anyhow!("unknown scroll direction '{other}'")),
        }
    }
}

impl std::fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScrollDirection::Up => write!(f, "up"),
            ScrollDirection::Down => write!(f, "down"),
        }
    }
}

fn default_scroll_amount() -> i64 {
    DEFAULT_SCROLL_AMOUNT
}

/// The observable outcome of one loop iteration. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// 1-based, strictly increasing within one run.
    pub step: u32,
    /// The frame the decision was made against, base64 PNG.
    pub screenshot_b64: String,
    pub action: Action,
    pub success: bool,
    pub message: String,
    pub elapsed_ms: u64,
}

/// One line of the bounded history log fed back to Protocol A.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub action: String,
    pub message: String,
}

/// Accumulated decision context, owned by the step loop.
///
/// The shape is fixed by the decision protocol: Protocol A reads a bounded
/// history log, Protocol B keeps the whole model conversation and appends its
/// own turns for the life of the run (unbounded, a known growth risk on very
/// long runs).
#[derive(Debug, Clone)]
pub enum RunningContext {
    History(Vec<HistoryEntry>),
    Transcript(Vec<Content>),
}

impl RunningContext {
    /// Record a finished step. Only the history shape accumulates here; the
    /// transcript shape is appended to by the decision engine itself.
    pub fn push_history(&mut self, step: u32, kind: &str, message: &str) {
        if let RunningContext::History(entries) = self {
            entries.push(HistoryEntry {
                step,
                action: kind.to_string(),
                message: message.to_string(),
            });
        }
    }
}

/// Clip `text` to at most `max` characters.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

pub const MAX_STEPS: u32 = 25;
pub const VIEWPORT_WIDTH: u32 = 1280;
pub const VIEWPORT_HEIGHT: u32 = 800;
pub const DEFAULT_SCROLL_AMOUNT: i64 = 300;
pub const HISTORY_WINDOW: usize = 5;
pub const REASON_MAX_CHARS: usize = 200;
pub const DEFAULT_START_URL: &str = "https://www.google.com";
