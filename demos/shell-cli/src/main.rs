//! Run commands through a session on the local machine.
//!
//! Run with: cargo run -p shell-cli -- "uname -a" "ls -l"
//!
//! Or with a saved connection profile:
//! cargo run -p shell-cli -- --profile profile.json "whoami"

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result, bail};
use clap::Parser;
use futures::StreamExt;
use remote_shell_core::{CommandStatus, SessionConfig, SessionStatus};
use remote_shell_session::{CommandExecutor, SessionRegistry};
use remote_shell_transport::LocalShellTransport;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI arguments for shell-cli
#[derive(Parser)]
#[command(name = "shell-cli")]
#[command(about = "Run shell commands through a managed session")]
#[command(version)]
struct Cli {
    /// JSON connection profile; overrides the host flags
    #[arg(long, value_name = "FILE")]
    profile: Option<PathBuf>,

    /// Host to connect to
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Port to connect to
    #[arg(long, default_value_t = 22)]
    port: u16,

    /// Login user
    #[arg(long, env = "USER", default_value = "user")]
    user: String,

    /// Login password
    #[arg(long, env = "SHELL_CLI_PASSWORD", default_value = "unused", hide_env_values = true)]
    password: String,

    /// Print every registry event as a JSON line on stderr
    #[arg(long)]
    events: bool,

    /// Commands to run, in order
    #[arg(required = true, value_name = "COMMAND")]
    commands: Vec<String>,
}

impl Cli {
    fn session_config(&self) -> Result<SessionConfig> {
        match &self.profile {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("reading profile {}", path.display()))?;
                Ok(SessionConfig::from_json(&json)?)
            }
            None => Ok(SessionConfig::with_password(
                &self.host,
                self.port,
                &self.user,
                self.password.as_str(),
            )),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = cli.session_config()?;

    let registry = SessionRegistry::new(Arc::new(LocalShellTransport::new()));
    let executor = CommandExecutor::new(Arc::clone(&registry));

    if cli.events {
        let mut events = registry.events().history_plus_stream();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(e) => tracing::warn!("Failed to encode event: {e}"),
                }
            }
        });
    }

    let handle = registry.create_session(config).await?;
    let session_id = handle.id();
    match handle.wait().await {
        SessionStatus::Connected => {}
        SessionStatus::Error(reason) => bail!("connect failed: {reason}"),
        other => bail!("connect ended in unexpected status {other:?}"),
    }

    let mut failed = false;
    for text in &cli.commands {
        let command = executor.execute_command(session_id, text).await?;
        print!("{}", command.output);
        match command.status {
            CommandStatus::Completed { exit_code: 0 } => {}
            CommandStatus::Completed { exit_code } => {
                tracing::warn!(command = %text, exit_code, "Command exited non-zero");
                failed = true;
            }
            CommandStatus::Error { reason } => {
                tracing::error!(command = %text, %reason, "Command failed");
                failed = true;
            }
            CommandStatus::Pending | CommandStatus::Running => {}
        }
    }

    registry.disconnect_session(session_id).await?;
    registry.remove_session(session_id).await?;

    if failed {
        std::process::exit(1);
    }
    Ok(())
}
