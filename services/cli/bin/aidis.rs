//! Main Entrypoint for the AIDIS CLI
//!
//! Loads configuration, initializes logging on stderr, wires the session
//! state and either runs the interactive loop or executes a single directive.

use aidis_cli::{config::Config, repl, state::AppState};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Interactive client for the AIDIS knowledge and task service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start an interactive chat session (the default).
    Chat,
    /// Run a single directive, e.g. `aidis exec /aidis_ping` or `aidis exec ls -la`.
    Exec {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        directive: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();

    info!(
        aidis_url = %config.aidis_url,
        client_id = %config.client_id,
        provider = ?config.provider,
        model = %config.chat_model,
        "Configuration loaded"
    );
    let mut state = AppState::build(config).context("Failed to initialize session")?;

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let stdin = BufReader::new(tokio::io::stdin());
            repl::run(&mut state, stdin, &mut std::io::stdout()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Exec { directive } => {
            let result = state.router.dispatch(&directive.join(" ")).await;
            state.router.client_mut().disconnect();
            let rendered = repl::render_result(&result);
            if result.success {
                println!("{rendered}");
                Ok(ExitCode::SUCCESS)
            } else {
                eprintln!("{rendered}");
                Ok(ExitCode::FAILURE)
            }
        }
    }
}
