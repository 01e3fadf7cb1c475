use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use std::io::Write;
use tracing_subscriber::EnvFilter;

use webpilot::{ChromeHands, Graph, Hands, LlmBrain, RetryLimits, RunState};

#[derive(Parser)]
#[command(name = "webpilot", about = "Goal-driven browser agent")]
struct Cli {
    /// The goal to accomplish. Prompted for interactively when omitted.
    command: Vec<String>,

    /// DevTools endpoint of a running Chrome to attach to.
    #[arg(long, default_value = "http://127.0.0.1:9222")]
    endpoint: String,

    /// Launch a fresh Chrome instead of attaching.
    #[arg(long)]
    launch: bool,

    /// Action replans allowed per task before replanning the task list.
    #[arg(long, default_value_t = 3)]
    max_micro_retries: u32,

    /// Task-list replans allowed before escalating to a human.
    #[arg(long, default_value_t = 2)]
    max_macro_retries: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webpilot=info")),
        )
        .init();

    let cli = Cli::parse();
    let command = if cli.command.is_empty() {
        prompt_for_command()?
    } else {
        cli.command.join(" ")
    };

    let brain = LlmBrain::new()?;

    tracing::info!("starting browser session");
    let launch = cli.launch;
    let endpoint = cli.endpoint.clone();
    let hands = tokio::task::spawn_blocking(move || {
        if launch {
            ChromeHands::launch()
        } else {
            ChromeHands::connect_or_launch(&endpoint)
        }
    })
    .await
    .map_err(|e| anyhow::anyhow!("browser startup panicked: {e}"))??;

    let mut state = RunState::new(
        command,
        RetryLimits {
            max_micro_retries: cli.max_micro_retries,
            max_macro_retries: cli.max_macro_retries,
        },
    );

    let graph = Graph::new(&brain, &hands);
    let outcome = graph.run(&mut state).await;
    hands.close().await;
    outcome?;

    if state.is_complete {
        println!("Goal reached.");
    } else if state.needs_human_intervention {
        // Deliberately not an error exit: "needs a human" is a normal
        // outcome, distinct from a crash.
        println!("Human intervention required; stopping here.");
    } else {
        println!("Run ended without completing the goal.");
    }
    Ok(())
}

fn prompt_for_command() -> Result<String> {
    print!("Enter a goal: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}
