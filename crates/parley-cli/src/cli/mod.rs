//! CLI entry and dispatch.

use std::io;

use anyhow::{Context, Result};
use clap::Parser;
use parley_core::AgentSession;
use parley_core::config;
use tracing_subscriber::EnvFilter;

use crate::interrupt;

mod commands;

use commands::chat::Approval;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Talk to a conversational agent backend")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// How to answer an interrupt that asks for confirmation.
#[derive(clap::Args, Debug, Clone, Copy, Default)]
struct ApprovalArgs {
    /// Confirm any proposed action without asking
    #[arg(long, conflicts_with = "no")]
    yes: bool,

    /// Cancel any proposed action without asking
    #[arg(long)]
    no: bool,
}

impl From<ApprovalArgs> for Approval {
    fn from(args: ApprovalArgs) -> Self {
        match (args.yes, args.no) {
            (true, _) => Approval::Yes,
            (_, true) => Approval::No,
            _ => Approval::Ask,
        }
    }
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Manage threads on the backend
    Threads {
        #[command(subcommand)]
        command: ThreadCommands,
    },

    /// Send a message and stream the reply
    Send {
        /// The message to send
        #[arg(value_name = "MESSAGE")]
        message: String,

        /// Continue an existing thread (a new one is created otherwise)
        #[arg(long, value_name = "ID")]
        thread: Option<String>,

        /// Project to associate with a new thread
        #[arg(long, value_name = "N")]
        project: Option<i64>,

        #[command(flatten)]
        approval: ApprovalArgs,
    },

    /// Confirm an action the agent is waiting on
    Confirm {
        /// Thread holding the pending action
        #[arg(long, value_name = "ID")]
        thread: String,

        /// Ticket printed with the interrupt (JSON)
        #[arg(long, value_name = "JSON")]
        ticket: String,

        /// Extra data for the confirmed action (JSON)
        #[arg(long, value_name = "JSON")]
        payload: Option<String>,

        #[command(flatten)]
        approval: ApprovalArgs,
    },

    /// Cancel an action the agent is waiting on
    Cancel {
        /// Thread holding the pending action
        #[arg(long, value_name = "ID")]
        thread: String,

        /// Ticket printed with the interrupt (JSON)
        #[arg(long, value_name = "JSON")]
        ticket: String,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ThreadCommands {
    /// Lists threads
    List,
    /// Deletes a thread
    Delete {
        /// The ID of the thread to delete
        #[arg(value_name = "THREAD_ID")]
        id: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    init_tracing();
    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli).await })
}

/// Logs go to stderr so stdout carries only the transcript.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("PARLEY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

async fn dispatch(cli: Cli) -> Result<()> {
    if let Commands::Config { command } = &cli.command {
        return match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        };
    }

    let config = config::Config::load().context("load config")?;
    let session = AgentSession::from_config(&config).context("create session")?;
    interrupt::watch(session.abort_handle());

    match cli.command {
        Commands::Threads { command } => match command {
            ThreadCommands::List => commands::threads::list(&session).await,
            ThreadCommands::Delete { id } => commands::threads::delete(&session, &id).await,
        },

        Commands::Send {
            message,
            thread,
            project,
            approval,
        } => {
            commands::chat::send(
                &session,
                commands::chat::SendOptions {
                    message,
                    thread,
                    project,
                    approval: approval.into(),
                },
            )
            .await
        }

        Commands::Confirm {
            thread,
            ticket,
            payload,
            approval,
        } => {
            commands::chat::confirm(
                &session,
                &thread,
                &ticket,
                payload.as_deref(),
                approval.into(),
            )
            .await
        }

        Commands::Cancel { thread, ticket } => {
            commands::chat::cancel(&session, &thread, &ticket).await
        }

        // Handled before the session is built.
        Commands::Config { .. } => Ok(()),
    }
}
