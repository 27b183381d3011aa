use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dashmap::DashMap;
use dotenvy::dotenv;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use web_navigator::brain::{Protocol, build_brain};
use web_navigator::face::{AppState, serve};
use web_navigator::gemini::{DEFAULT_MODEL, GeminiClient, VisionModel};
use web_navigator::hands::{BrowserDriver, ChromeSession};
use web_navigator::navigator::{Navigator, RunOutcome};
use web_navigator::types::{DEFAULT_START_URL, StepResult};

#[derive(Parser)]
#[command(name = "navigator", about = "Vision-driven web navigation agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server with the SSE streaming API and web UI
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
        /// Decision protocol: 'structured' or 'tools'
        #[arg(long, default_value = "structured")]
        protocol: String,
    },
    /// Run one goal from the command line and print each step
    Run {
        /// The goal, in natural language
        goal: Vec<String>,
        #[arg(long, default_value = DEFAULT_START_URL)]
        start_url: String,
        /// Show the browser window instead of running headless
        #[arg(long)]
        headed: bool,
        /// Decision protocol: 'structured' or 'tools'
        #[arg(long, default_value = "structured")]
        protocol: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();
    let model = std::env::var("GEMINI_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());

    match cli.command.unwrap_or(Command::Serve {
        port: 8000,
        protocol: "structured".to_string(),
    }) {
        Command::Serve { port, protocol } => {
            let protocol = Protocol::from_str(&protocol)?;
            if api_key.is_empty() {
                tracing::warn!("GEMINI_API_KEY is not set; /run requests will be rejected");
            }
            let state = Arc::new(AppState {
                sessions: DashMap::new(),
                api_key,
                model,
                protocol,
            });
            serve(state, port).await
        }
        Command::Run {
            goal,
            start_url,
            headed,
            protocol,
        } => {
            let protocol = Protocol::from_str(&protocol)?;
            let goal = goal.join(" ");
            anyhow::ensure!(!goal.trim().is_empty(), "a goal is required");
            anyhow::ensure!(!api_key.is_empty(), "GEMINI_API_KEY is not set");
            run_cli(goal, start_url, !headed, protocol, api_key, model).await
        }
    }
}

async fn run_cli(
    goal: String,
    start_url: String,
    headless: bool,
    protocol: Protocol,
    api_key: String,
    model: String,
) -> Result<()> {
    let session = tokio::task::spawn_blocking(move || ChromeSession::launch(headless)).await??;
    let driver: Arc<dyn BrowserDriver> = Arc::new(session);
    driver.navigate(&start_url).await?;

    let vision: Arc<dyn VisionModel> = Arc::new(GeminiClient::new(api_key, model));
    let brain = build_brain(protocol, vision);

    let stop = CancellationToken::new();
    {
        // Ctrl-C ends the run after the current step completes.
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                stop.cancel();
            }
        });
    }

    let navigator = Navigator::new(driver, brain, goal, stop);
    let (tx, mut rx) = mpsc::channel::<StepResult>(16);
    let run = tokio::spawn(async move { navigator.run(tx).await });

    while let Some(result) = rx.recv().await {
        println!(
            "Step {}: [{}] {} ({}ms)",
            result.step,
            result.action.kind(),
            result.message,
            result.elapsed_ms
        );
    }

    match run.await? {
        RunOutcome::Done { reason } => println!("\nFinal: {reason}"),
        RunOutcome::Failed { reason } => println!("\nFailed: {reason}"),
        RunOutcome::Stopped => println!("\nStopped."),
        RunOutcome::StepLimit => println!("\nStep limit reached without a terminal action."),
        RunOutcome::Detached => {}
    }
    Ok(())
}
