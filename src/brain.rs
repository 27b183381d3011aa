//! Decision engine: turns (screenshot, goal, running context) into exactly
//! one [`Action`]. Two interchangeable protocols against the vision model:
//!
//! * [`StructuredBrain`] sends a single-turn prompt and parses a JSON object
//!   out of the reply text, retrying malformed replies a bounded number of
//!   times.
//! * [`ToolCallBrain`] keeps the full conversation and reads the model's
//!   native tool invocations.
//!
//! Neither protocol ever returns an error to the loop; every failure
//! degrades to a `fail` action (or `wait`, where the run should get another
//! turn).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::gemini::{
    Content, FunctionCall, FunctionDeclaration, ModelRequest, Part, VisionModel,
};
use crate::types::{
    Action, HistoryEntry, RunningContext, ScrollDirection, HISTORY_WINDOW, REASON_MAX_CHARS,
    truncate,
};

const SYSTEM_PROMPT: &str = r#"You are a web navigation agent. You observe browser screenshots and decide what action to take to accomplish the user's goal.

You MUST respond with a single JSON object. No markdown, no explanation outside the JSON.

Available actions:
- {"action": "click", "x": <int>, "y": <int>, "reason": "<why>"}
- {"action": "type", "text": "<text to type>", "reason": "<why>"}
- {"action": "scroll", "direction": "down"|"up", "amount": 300, "reason": "<why>"}
- {"action": "navigate", "url": "<full URL>", "reason": "<why>"}
- {"action": "key", "key": "<key name, e.g. Enter>", "reason": "<why>"}
- {"action": "move_mouse", "x": <int>, "y": <int>, "reason": "<why>"}
- {"action": "drag", "start_x": <int>, "start_y": <int>, "end_x": <int>, "end_y": <int>, "reason": "<why>"}
- {"action": "screenshot", "reason": "<why>"}
- {"action": "wait", "reason": "<why>"}
- {"action": "done", "reason": "<what was accomplished>"}
- {"action": "fail", "reason": "<why it cannot be done>"}

Rules:
1. Analyze the screenshot carefully. Read text, identify buttons, forms, links.
2. Choose the single most effective next action toward the goal.
3. For clicks, use pixel coordinates (x=0,y=0 is top-left, x=1280,y=800 is bottom-right).
4. For typing, assume the correct field is already focused (after clicking it).
5. If the goal is achieved, respond with "done".
6. If blocked by a CAPTCHA or login wall you cannot pass, respond with "fail".
7. NEVER access DOM or APIs. Only use what you see in the screenshot."#;

const FIRST_TURN_INSTRUCTION: &str = "You control a real web browser through the computer_use tools. \
Look at the screenshot and request the single tool call that best advances the goal. \
Coordinates are pixels on a 1280x800 viewport, origin top-left. \
Typing goes to the currently focused element, so click a field before typing into it. \
You only see screenshots; you cannot read the DOM or call APIs. \
When the goal is accomplished, reply in plain text that it is completed. \
If a CAPTCHA or login wall blocks you, say so in plain text.";

const NEXT_TURN_INSTRUCTION: &str =
    "Here is the current page. Request the next tool call, or state the outcome in plain text.";

const PARSE_ATTEMPTS: u32 = 3;
const PARSE_BACKOFF: Duration = Duration::from_millis(500);
const MODEL_TEMPERATURE: f32 = 0.1;
const MODEL_MAX_OUTPUT_TOKENS: u32 = 512;

/// Coarse scroll unit used by the tool surface, in pixels.
const SCROLL_UNIT_PX: i64 = 100;

const DONE_MARKERS: &[&str] = &["completed", "done", "accomplished", "finished", "found"];
const BLOCKED_MARKERS: &[&str] = &["cannot", "unable", "blocked", "captcha", "login required"];

/// Which decision protocol a deployment runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Structured,
    ToolCall,
}

impl FromStr for Protocol {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "structured" | "json" => Ok(Protocol::Structured),
            "tools" | "tool-call" => Ok(Protocol::ToolCall),
            other => Err(anyhow::anyhow!(
                "unknown protocol '{other}' (expected 'structured' or 'tools')"
            )),
        }
    }
}

/// The decision contract. Implementations never raise: malformed or
/// unavailable model output degrades to a `fail` action.
#[async_trait]
pub trait Brain: Send + Sync {
    /// The context shape this protocol expects the loop to own.
    fn initial_context(&self) -> RunningContext;

    async fn decide(
        &self,
        screenshot_b64: &str,
        goal: &str,
        ctx: &mut RunningContext,
    ) -> Action;
}

pub fn build_brain(protocol: Protocol, model: Arc<dyn VisionModel>) -> Arc<dyn Brain> {
    match protocol {
        Protocol::Structured => Arc::new(StructuredBrain::new(model)),
        Protocol::ToolCall => Arc::new(ToolCallBrain::new(model)),
    }
}

/// Protocol A: single-turn prompt, JSON object expected in the reply text.
pub struct StructuredBrain {
    model: Arc<dyn VisionModel>,
}

impl StructuredBrain {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Brain for StructuredBrain {
    fn initial_context(&self) -> RunningContext {
        RunningContext::History(Vec::new())
    }

    async fn decide(
        &self,
        screenshot_b64: &str,
        goal: &str,
        ctx: &mut RunningContext,
    ) -> Action {
        let history: &[HistoryEntry] = match ctx {
            RunningContext::History(entries) => entries,
            RunningContext::Transcript(_) => &[],
        };
        let prompt = build_prompt(goal, history);
        let request = ModelRequest {
            system_instruction: Some(SYSTEM_PROMPT.to_string()),
            contents: vec![Content::user(vec![
                Part::png(screenshot_b64),
                Part::text(prompt),
            ])],
            tools: None,
            temperature: MODEL_TEMPERATURE,
            max_output_tokens: MODEL_MAX_OUTPUT_TOKENS,
        };

        let mut last_err: Option<serde_json::Error> = None;
        let mut raw = String::new();
        for attempt in 1..=PARSE_ATTEMPTS {
            // Parse failures get a fresh model call; anything else fails the
            // decision immediately (network, auth and quota problems are not
            // transient at this cadence).
            let response = match self.model.generate(request.clone()).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "model call failed");
                    return Action::Fail {
                        reason: truncate(&format!("model call failed: {e}"), REASON_MAX_CHARS),
                    };
                }
            };
            raw = strip_code_fences(&response.text()).to_string();
            debug!(attempt, raw = %raw, "model replied");
            match serde_json::from_str::<Value>(&raw) {
                Ok(value) => return action_from_json(value, &raw),
                Err(e) => {
                    warn!(attempt, error = %e, "model response was not valid JSON");
                    last_err = Some(e);
                    if attempt < PARSE_ATTEMPTS {
                        tokio::time::sleep(PARSE_BACKOFF * attempt).await;
                    }
                }
            }
        }

        let parse_err = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown parse error".to_string());
        Action::Fail {
            reason: format!(
                "JSON parse failed after {PARSE_ATTEMPTS} attempts: {parse_err}. Raw: {}",
                truncate(&raw, REASON_MAX_CHARS)
            ),
        }
    }
}

fn build_prompt(goal: &str, history: &[HistoryEntry]) -> String {
    let mut prompt = format!("Goal: {goal}");
    if !history.is_empty() {
        prompt.push_str("\n\nRecent actions taken:");
        let start = history.len().saturating_sub(HISTORY_WINDOW);
        for entry in &history[start..] {
            prompt.push_str(&format!(
                "\nStep {}: {} - {}",
                entry.step, entry.action, entry.message
            ));
        }
    }
    prompt.push_str("\n\nWhat is the next action to take? Respond with JSON only.");
    prompt
}

/// Drop ```json fences some models insist on wrapping replies in.
fn strip_code_fences(raw: &str) -> &str {
    raw.trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// Map a syntactically valid JSON object onto the action vocabulary. An
/// unrecognized or incomplete action resolves to `fail` rather than another
/// model round-trip.
fn action_from_json(value: Value, raw: &str) -> Action {
    match Action::deserialize(value) {
        Ok(action) => ensure_reason(action),
        Err(e) => Action::Fail {
            reason: format!(
                "unsupported action: {e}. Raw: {}",
                truncate(raw, REASON_MAX_CHARS)
            ),
        },
    }
}

/// Terminal actions always carry a reason, even when the model left it out.
fn ensure_reason(action: Action) -> Action {
    match action {
        Action::Done { reason } if reason.is_empty() => Action::Done {
            reason: "model reported the goal as accomplished".to_string(),
        },
        Action::Fail { reason } if reason.is_empty() => Action::Fail {
            reason: "model gave up without a reason".to_string(),
        },
        other => other,
    }
}

/// Protocol B: full-transcript conversation with a registered tool surface.
pub struct ToolCallBrain {
    model: Arc<dyn VisionModel>,
}

impl ToolCallBrain {
    pub fn new(model: Arc<dyn VisionModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl Brain for ToolCallBrain {
    fn initial_context(&self) -> RunningContext {
        RunningContext::Transcript(Vec::new())
    }

    async fn decide(
        &self,
        screenshot_b64: &str,
        goal: &str,
        ctx: &mut RunningContext,
    ) -> Action {
        let transcript = match ctx {
            RunningContext::Transcript(turns) => turns,
            RunningContext::History(_) => {
                return Action::Fail {
                    reason: "decision context has the wrong shape for the tool-call protocol"
                        .to_string(),
                };
            }
        };

        let instruction = if transcript.is_empty() {
            format!("Goal: {goal}\n\n{FIRST_TURN_INSTRUCTION}")
        } else {
            NEXT_TURN_INSTRUCTION.to_string()
        };
        transcript.push(Content::user(vec![
            Part::png(screenshot_b64),
            Part::text(instruction),
        ]));

        let request = ModelRequest {
            system_instruction: None,
            contents: transcript.clone(),
            tools: Some(tool_declarations()),
            temperature: MODEL_TEMPERATURE,
            max_output_tokens: MODEL_MAX_OUTPUT_TOKENS,
        };
        let response = match self.model.generate(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "model call failed");
                return Action::Fail {
                    reason: truncate(&format!("model call failed: {e}"), REASON_MAX_CHARS),
                };
            }
        };
        transcript.push(Content::model(response.parts.clone()));

        let text = response.text();
        let lowered = text.to_lowercase();

        // Terminal signal first: a stopped model turn whose text talks about
        // completion ends the run, even if a tool call is also present.
        if response.finish_reason.as_deref() == Some("STOP")
            && DONE_MARKERS.iter().any(|m| lowered.contains(m))
        {
            return Action::Done {
                reason: truncate(text.trim(), REASON_MAX_CHARS),
            };
        }

        if let Some(call) = response.function_call() {
            debug!(tool = %call.name, "model requested tool call");
            return action_from_tool_call(call);
        }

        if BLOCKED_MARKERS.iter().any(|m| lowered.contains(m)) {
            return Action::Fail {
                reason: truncate(text.trim(), REASON_MAX_CHARS),
            };
        }

        // No tool call and nothing conclusive in the text: give the model
        // another look instead of ending the run.
        let reason = truncate(text.trim(), REASON_MAX_CHARS);
        Action::Wait {
            reason: (!reason.is_empty()).then_some(reason),
        }
    }
}

fn action_from_tool_call(call: &FunctionCall) -> Action {
    let name = call.name.strip_prefix("computer_use_").unwrap_or(&call.name);
    let args = &call.args;
    match name {
        "click" => match coordinate(args, "coordinate") {
            Some((x, y)) => Action::Click { x, y, reason: None },
            None => malformed_args(call),
        },
        "type" => match args.get("text").and_then(Value::as_str) {
            Some(text) => Action::Type {
                text: text.to_string(),
                reason: None,
            },
            None => malformed_args(call),
        },
        "scroll" => {
            let (x, y) = match coordinate(args, "coordinate") {
                Some((x, y)) => (Some(x), Some(y)),
                None => (None, None),
            };
            let direction = args
                .get("direction")
                .and_then(Value::as_str)
                .and_then(|d| d.parse::<ScrollDirection>().ok());
            // The tool surface speaks in coarse units; the executor wants
            // pixels.
            let amount = args.get("amount").and_then(Value::as_i64).unwrap_or(3) * SCROLL_UNIT_PX;
            Action::Scroll {
                direction,
                amount,
                x,
                y,
                reason: None,
            }
        }
        "key" => match args.get("key").and_then(Value::as_str) {
            Some(key) => Action::Key {
                key: key.to_string(),
                reason: None,
            },
            None => malformed_args(call),
        },
        "move_mouse" => match coordinate(args, "coordinate") {
            Some((x, y)) => Action::MoveMouse { x, y, reason: None },
            None => malformed_args(call),
        },
        "drag" => match (
            coordinate(args, "start_coordinate"),
            coordinate(args, "end_coordinate"),
        ) {
            (Some((start_x, start_y)), Some((end_x, end_y))) => Action::Drag {
                start_x,
                start_y,
                end_x,
                end_y,
                reason: None,
            },
            _ => malformed_args(call),
        },
        "navigate" => match args.get("url").and_then(Value::as_str) {
            Some(url) => Action::Navigate {
                url: url.to_string(),
                reason: None,
            },
            None => malformed_args(call),
        },
        "screenshot" => Action::Screenshot { reason: None },
        other => Action::Wait {
            reason: Some(format!("unsupported tool call '{other}'")),
        },
    }
}

/// A tool call the model got wrong should not end the run; surface it and
/// give the model another turn.
fn malformed_args(call: &FunctionCall) -> Action {
    Action::Wait {
        reason: Some(format!("malformed arguments for tool '{}'", call.name)),
    }
}

fn coordinate(args: &Value, field: &str) -> Option<(i64, i64)> {
    let pair = args.get(field)?.as_array()?;
    match pair.as_slice() {
        [x, y] => Some((x.as_i64()?, y.as_i64()?)),
        _ => None,
    }
}

fn tool_declarations() -> Vec<FunctionDeclaration> {
    use serde_json::json;

    let coordinate_schema = json!({
        "type": "array",
        "items": {"type": "integer"},
        "description": "[x, y] pixel position on the 1280x800 viewport"
    });

    let decl = |name: &str, description: &str, parameters: Value| FunctionDeclaration {
        name: name.to_string(),
        description: description.to_string(),
        parameters,
    };

    vec![
        decl(
            "computer_use_click",
            "Click the mouse at a pixel position",
            json!({
                "type": "object",
                "properties": {"coordinate": coordinate_schema},
                "required": ["coordinate"]
            }),
        ),
        decl(
            "computer_use_type",
            "Type text into the currently focused element",
            json!({
                "type": "object",
                "properties": {"text": {"type": "string"}},
                "required": ["text"]
            }),
        ),
        decl(
            "computer_use_scroll",
            "Scroll the page at a position",
            json!({
                "type": "object",
                "properties": {
                    "coordinate": coordinate_schema,
                    "direction": {"type": "string", "enum": ["up", "down"]},
                    "amount": {"type": "integer", "description": "scroll distance in coarse units"}
                },
                "required": ["direction"]
            }),
        ),
        decl(
            "computer_use_key",
            "Press a named key, e.g. Enter or Tab",
            json!({
                "type": "object",
                "properties": {"key": {"type": "string"}},
                "required": ["key"]
            }),
        ),
        decl(
            "computer_use_move_mouse",
            "Move the mouse without clicking",
            json!({
                "type": "object",
                "properties": {"coordinate": coordinate_schema},
                "required": ["coordinate"]
            }),
        ),
        decl(
            "computer_use_drag",
            "Press at the start position, drag to the end position, release",
            json!({
                "type": "object",
                "properties": {
                    "start_coordinate": coordinate_schema,
                    "end_coordinate": coordinate_schema
                },
                "required": ["start_coordinate", "end_coordinate"]
            }),
        ),
        decl(
            "computer_use_navigate",
            "Load a URL in the browser",
            json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }),
        ),
        decl(
            "computer_use_screenshot",
            "Take a fresh screenshot without changing page state",
            json!({"type": "object", "properties": {}}),
        ),
    ]
}
