//! Session stream adapter: the HTTP surface callers drive runs through.
//! `POST /run` streams one JSON object per SSE event; `POST /stop/{id}`
//! flips the session's stop signal; the registry entry is removed on every
//! exit path so cancellation state never leaks across sessions.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::Json;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::brain::{Protocol, build_brain};
use crate::gemini::{GeminiClient, VisionModel};
use crate::hands::{BrowserDriver, ChromeSession};
use crate::navigator::{Navigator, RunOutcome};
use crate::types::{DEFAULT_START_URL, StepResult};

pub struct AppState {
    pub sessions: DashMap<String, CancellationToken>,
    pub api_key: String,
    pub model: String,
    pub protocol: Protocol,
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub goal: String,
    #[serde(default)]
    pub start_url: Option<String>,
    #[serde(default)]
    pub headless: Option<bool>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Everything the adapter pushes to the client, one JSON object per event.
#[derive(Debug)]
enum RunEvent {
    Session { session_id: String },
    Step(StepResult),
    Done { message: String },
    Error { message: String },
    Stopped,
}

impl RunEvent {
    fn payload(self) -> Value {
        match self {
            RunEvent::Session { session_id } => {
                json!({"type": "session", "session_id": session_id})
            }
            RunEvent::Step(result) => json!({
                "type": "step",
                "step": result.step,
                "action": result.action.kind(),
                "reason": result.action.reason().unwrap_or(""),
                "message": result.message,
                "success": result.success,
                "screenshot": result.screenshot_b64,
                "elapsed_ms": result.elapsed_ms,
            }),
            RunEvent::Done { message } => json!({"type": "done", "message": message}),
            RunEvent::Error { message } => json!({"type": "error", "message": message}),
            RunEvent::Stopped => json!({"type": "stopped"}),
        }
    }

    fn into_sse(self) -> Event {
        Event::default().data(self.payload().to_string())
    }
}

/// The terminal event a finished run owes the client, if any. The step
/// ceiling ends the stream without one; callers treat that as an implicit
/// non-success, distinct from `done` and `error`.
fn terminal_event(outcome: RunOutcome) -> Option<RunEvent> {
    match outcome {
        RunOutcome::Done { reason } => Some(RunEvent::Done { message: reason }),
        RunOutcome::Failed { reason } => Some(RunEvent::Error { message: reason }),
        RunOutcome::Stopped => Some(RunEvent::Stopped),
        RunOutcome::StepLimit | RunOutcome::Detached => None,
    }
}

/// Removes the session's stop signal when the run ends, on every exit path.
struct SessionGuard {
    state: Arc<AppState>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.sessions.remove(&self.session_id);
        info!(session_id = %self.session_id, "session closed");
    }
}

pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    let app = Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/run", post(run_handler))
        .route("/stop/{session_id}", post(stop_handler))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_handler() -> Html<&'static str> {
    Html(INDEX_HTML)
}

async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "web-navigator",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.sessions.get(&session_id) {
        Some(entry) => {
            entry.value().cancel();
            info!(session_id = %session_id, "stop requested");
            Ok(Json(json!({"status": "stopping", "session_id": session_id})))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({
                "error": format!("Session '{session_id}' not found or already finished")
            })),
        )),
    }
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RunRequest>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>,
    (StatusCode, Json<Value>),
> {
    if state.api_key.is_empty() {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "GEMINI_API_KEY environment variable not set"})),
        ));
    }
    if request.goal.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "goal must not be empty"})),
        ));
    }

    let session_id = request
        .session_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let stop = CancellationToken::new();
    match state.sessions.entry(session_id.clone()) {
        // Never clobber a live registration; the old run's cleanup would
        // remove the new session's stop signal.
        Entry::Occupied(_) => {
            return Err((
                StatusCode::CONFLICT,
                Json(json!({"error": format!("Session '{session_id}' is already running")})),
            ));
        }
        Entry::Vacant(slot) => {
            slot.insert(stop.clone());
        }
    }

    let (event_tx, event_rx) = mpsc::channel::<RunEvent>(32);
    tokio::spawn(run_session(state, request, session_id, stop, event_tx));

    let stream = ReceiverStream::new(event_rx).map(|event| Ok(event.into_sse()));
    Ok(Sse::new(stream))
}

/// One run from browser launch to terminal event. Owns the registry guard;
/// every return path (including panics unwinding) drops it and frees the
/// session id.
async fn run_session(
    state: Arc<AppState>,
    request: RunRequest,
    session_id: String,
    stop: CancellationToken,
    events: mpsc::Sender<RunEvent>,
) {
    let _guard = SessionGuard {
        state: state.clone(),
        session_id: session_id.clone(),
    };
    info!(session_id = %session_id, goal = %request.goal, "session started");

    let _ = events
        .send(RunEvent::Session {
            session_id: session_id.clone(),
        })
        .await;

    let headless = request.headless.unwrap_or(true);
    let start_url = request
        .start_url
        .unwrap_or_else(|| DEFAULT_START_URL.to_string());

    let session = match tokio::task::spawn_blocking(move || ChromeSession::launch(headless)).await {
        Ok(Ok(session)) => session,
        Ok(Err(e)) => {
            error!(error = %format!("{e:#}"), "browser launch failed");
            let _ = events
                .send(RunEvent::Error {
                    message: format!("browser launch failed: {e:#}"),
                })
                .await;
            return;
        }
        Err(e) => {
            error!(error = %e, "browser launch panicked");
            let _ = events
                .send(RunEvent::Error {
                    message: format!("browser launch panicked: {e}"),
                })
                .await;
            return;
        }
    };
    let driver: Arc<dyn BrowserDriver> = Arc::new(session);

    if let Err(e) = driver.navigate(&start_url).await {
        let _ = events
            .send(RunEvent::Error {
                message: format!("failed to open start page {start_url}: {e:#}"),
            })
            .await;
        return;
    }

    let model: Arc<dyn VisionModel> =
        Arc::new(GeminiClient::new(state.api_key.clone(), state.model.clone()));
    let brain = build_brain(state.protocol, model);
    let navigator = Navigator::new(driver, brain, request.goal, stop);

    let (step_tx, mut step_rx) = mpsc::channel::<StepResult>(16);
    let forward = {
        let events = events.clone();
        tokio::spawn(async move {
            while let Some(result) = step_rx.recv().await {
                if events.send(RunEvent::Step(result)).await.is_err() {
                    break;
                }
            }
        })
    };

    let outcome = navigator.run(step_tx).await;
    let _ = forward.await;

    if let Some(event) = terminal_event(outcome) {
        let _ = events.send(event).await;
    }
}

const INDEX_HTML: &str = r##"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>Web Navigator</title>
<style>
  * { margin: 0; padding: 0; box-sizing: border-box; }
  body {
    background: #0a0a0f;
    color: #e0e0e0;
    font-family: 'Segoe UI', system-ui, -apple-system, sans-serif;
    height: 100vh;
    display: flex;
    flex-direction: column;
  }
  header {
    padding: 20px 32px;
    border-bottom: 1px solid #1a1a2e;
    display: flex;
    align-items: center;
    gap: 12px;
  }
  header h1 { font-size: 20px; font-weight: 600; color: #fff; }
  header .dot {
    width: 8px; height: 8px;
    border-radius: 50%;
    background: #22c55e;
    animation: pulse 2s infinite;
  }
  header .dot.busy { background: #f59e0b; }
  @keyframes pulse { 0%, 100% { opacity: 1; } 50% { opacity: 0.4; } }
  .main {
    flex: 1;
    display: flex;
    flex-direction: column;
    max-width: 860px;
    width: 100%;
    margin: 0 auto;
    padding: 24px 32px;
    gap: 16px;
    overflow: hidden;
  }
  #log { flex: 1; overflow-y: auto; display: flex; flex-direction: column; gap: 8px; }
  .entry {
    padding: 10px 14px;
    border-radius: 8px;
    font-size: 14px;
    line-height: 1.5;
    background: #111118;
    border-left: 3px solid #3b82f6;
  }
  .entry .num { color: #6366f1; font-weight: 700; margin-right: 8px; }
  .entry.error { border-left-color: #ef4444; color: #fca5a5; }
  .entry.done { border-left-color: #22c55e; color: #86efac; }
  .entry.stopped { border-left-color: #f59e0b; color: #fcd34d; }
  .entry img { display: block; max-width: 100%; border-radius: 6px; margin-top: 8px; }
  .controls { display: flex; gap: 8px; }
  input[type=text] {
    flex: 1;
    background: #111118;
    border: 1px solid #222;
    border-radius: 8px;
    padding: 12px 16px;
    color: #fff;
    font-size: 15px;
    outline: none;
  }
  input[type=text]:focus { border-color: #6366f1; }
  label { display: flex; align-items: center; gap: 6px; font-size: 13px; color: #888; }
  button {
    background: #6366f1;
    color: #fff;
    border: none;
    border-radius: 8px;
    padding: 12px 24px;
    font-size: 15px;
    font-weight: 600;
    cursor: pointer;
  }
  button:disabled { background: #333; cursor: not-allowed; }
  #stop-btn { background: #ef4444; }
</style>
</head>
<body>
  <header>
    <div class="dot" id="dot"></div>
    <h1>Web Navigator</h1>
  </header>
  <div class="main">
    <div id="log"></div>
    <div class="controls">
      <input type="text" id="goal" placeholder="What should the browser do?" autofocus />
      <input type="text" id="start-url" value="https://www.google.com" size="28" />
      <label><input type="checkbox" id="headless" checked /> headless</label>
      <button id="run-btn" onclick="run()">Run</button>
      <button id="stop-btn" onclick="stopRun()" disabled>Stop</button>
    </div>
  </div>
<script>
  const log = document.getElementById('log');
  const dot = document.getElementById('dot');
  const runBtn = document.getElementById('run-btn');
  const stopBtn = document.getElementById('stop-btn');
  let sessionId = null;

  function addEntry(cls, html) {
    const div = document.createElement('div');
    div.className = 'entry ' + cls;
    div.innerHTML = html;
    log.appendChild(div);
    log.scrollTop = log.scrollHeight;
  }

  function esc(s) { return String(s).replace(/</g, '&lt;'); }

  function setBusy(busy) {
    runBtn.disabled = busy;
    stopBtn.disabled = !busy;
    dot.className = busy ? 'dot busy' : 'dot';
  }

  function handleEvent(ev) {
    if (ev.type === 'session') {
      sessionId = ev.session_id;
    } else if (ev.type === 'step') {
      addEntry(ev.success ? '' : 'error',
        '<span class="num">Step ' + ev.step + '</span>[' + esc(ev.action) + '] ' +
        esc(ev.message) + ' (' + ev.elapsed_ms + 'ms)' +
        (ev.screenshot ? '<img src="data:image/png;base64,' + ev.screenshot + '" />' : ''));
    } else if (ev.type === 'done') {
      addEntry('done', '<strong>Done:</strong> ' + esc(ev.message));
    } else if (ev.type === 'error') {
      addEntry('error', '<strong>Error:</strong> ' + esc(ev.message));
    } else if (ev.type === 'stopped') {
      addEntry('stopped', 'Stopped.');
    }
  }

  async function run() {
    const goal = document.getElementById('goal').value.trim();
    if (!goal) return;
    setBusy(true);
    addEntry('', '<strong>Goal:</strong> ' + esc(goal));
    try {
      const res = await fetch('/run', {
        method: 'POST',
        headers: {'Content-Type': 'application/json'},
        body: JSON.stringify({
          goal,
          start_url: document.getElementById('start-url').value,
          headless: document.getElementById('headless').checked,
        }),
      });
      if (!res.ok) {
        const err = await res.json();
        addEntry('error', '<strong>Error:</strong> ' + esc(err.error || res.status));
        return;
      }
      const reader = res.body.getReader();
      const decoder = new TextDecoder();
      let buf = '';
      for (;;) {
        const {done, value} = await reader.read();
        if (done) break;
        buf += decoder.decode(value, {stream: true});
        let idx;
        while ((idx = buf.indexOf('\n\n')) >= 0) {
          const frame = buf.slice(0, idx);
          buf = buf.slice(idx + 2);
          for (const line of frame.split('\n')) {
            if (line.startsWith('data:')) handleEvent(JSON.parse(line.slice(5)));
          }
        }
      }
    } catch (e) {
      addEntry('error', '<strong>Error:</strong> ' + esc(e.message));
    } finally {
      sessionId = null;
      setBusy(false);
    }
  }

  async function stopRun() {
    if (!sessionId) return;
    await fetch('/stop/' + sessionId, {method: 'POST'});
  }

  document.getElementById('goal').addEventListener('keydown', e => {
    if (e.key === 'Enter') run();
  });
</script>
</body>
</html>
"##;
