//! ferroclaw — terminal chat over the tool-orchestration core.
//!
//! Reads lines from stdin, runs each through the planner, prints the
//! assistant's answer. Slash commands: `/history`, `/clear`, `/quit`.

use clap::Parser;
use ferroclaw_config::AppConfig;
use ferroclaw_toolserver::ServerStatus;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod runtime;

use runtime::FerroclawCore;

#[derive(Parser)]
#[command(
    name = "ferroclaw",
    about = "Conversational assistant over stdio tool servers",
    version
)]
struct Cli {
    /// Send a single message instead of entering interactive mode
    #[arg(short, long)]
    message: Option<String>,

    /// User key for conversation memory
    #[arg(short, long, default_value = "local")]
    user: String,

    /// Override the conversation database path
    #[arg(long)]
    db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = AppConfig::from_env()?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    info!(model = %config.llm_model, servers = config.tool_servers.len(), "starting ferroclaw");
    let core = FerroclawCore::start(&config).await?;

    // Startup health report: which servers actually came up.
    for (name, status) in core.server_statuses() {
        match status {
            ServerStatus::Ready => println!("  [ok] {name}"),
            _ => println!("  [unavailable] {name}"),
        }
    }

    if let Some(message) = cli.message {
        let outcome = core.run(&cli.user, &message).await;
        println!("{}", outcome.assistant_text);
        core.shutdown().await;
        return Ok(());
    }

    println!("ferroclaw ready — /history, /clear, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/clear" => {
                let purged = core.clear(&cli.user).await.unwrap_or(0);
                println!("cleared {purged} messages");
            }
            "/history" => match core.history(&cli.user, 10).await {
                Ok(messages) => {
                    for message in messages {
                        println!(
                            "[{}] {}: {}",
                            message.timestamp.format("%H:%M:%S"),
                            message.role.as_str(),
                            message.content
                        );
                    }
                }
                Err(e) => println!("history unavailable: {e}"),
            },
            _ => {
                let outcome = core.run(&cli.user, input).await;
                println!("{}", outcome.assistant_text);
            }
        }
    }

    core.shutdown().await;
    Ok(())
}
