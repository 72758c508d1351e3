//! Send, confirm, and cancel command handlers.
//!
//! Replies stream to stdout as they arrive. When the agent stops for approval
//! the ticket content is printed and the user is asked (unless `--yes`/`--no`
//! decided up front); the answer becomes a confirm or cancel exchange in the
//! same session.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result, bail};
use parley_core::{
    AgentSession, ConfirmAction, Exchange, ExchangeHandler, ExchangeOutcome, InterruptTicket,
    SendMessage,
};
use serde_json::Value;

use crate::interrupt::InterruptedError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Approval {
    Ask,
    Yes,
    No,
}

pub struct SendOptions {
    pub message: String,
    pub thread: Option<String>,
    pub project: Option<i64>,
    pub approval: Approval,
}

pub async fn send(session: &AgentSession, options: SendOptions) -> Result<()> {
    let mut message = SendMessage::new(options.message);
    if let Some(thread) = options.thread {
        message = message.with_thread(thread);
    }
    if let Some(project) = options.project {
        message = message.with_project(project);
    }

    let exchange = session.send_message(message).context("send message")?;
    let outcome = stream(exchange).await?;
    follow(session, outcome, options.approval).await
}

pub async fn confirm(
    session: &AgentSession,
    thread_id: &str,
    ticket: &str,
    payload: Option<&str>,
    approval: Approval,
) -> Result<()> {
    adopt(session, thread_id, ticket)?;

    let mut action = ConfirmAction::new(thread_id);
    if let Some(payload) = payload {
        action = action.with_payload(parse_json("--payload", payload)?);
    }

    let exchange = session.confirm_action(action).context("confirm action")?;
    let outcome = stream(exchange).await?;
    follow(session, outcome, approval).await
}

pub async fn cancel(session: &AgentSession, thread_id: &str, ticket: &str) -> Result<()> {
    adopt(session, thread_id, ticket)?;

    let exchange = session.cancel_action(thread_id).context("cancel action")?;
    let outcome = stream(exchange).await?;
    follow(session, outcome, Approval::Ask).await
}

/// Registers a ticket from a previous run so this session can resume it.
fn adopt(session: &AgentSession, thread_id: &str, ticket: &str) -> Result<()> {
    let content = parse_json("--ticket", ticket)?;
    session
        .adopt_interrupt(thread_id, InterruptTicket::new(thread_id, content))
        .context("use ticket")
}

fn parse_json(flag: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{flag} must be valid JSON"))
}

/// Answers interrupts until the thread completes.
async fn follow(
    session: &AgentSession,
    mut outcome: ExchangeOutcome,
    approval: Approval,
) -> Result<()> {
    loop {
        let ticket = match outcome {
            ExchangeOutcome::Completed { thread_id } => {
                println!("thread: {thread_id}");
                return Ok(());
            }
            ExchangeOutcome::Cancelled => return Err(InterruptedError.into()),
            ExchangeOutcome::Interrupted(ticket) => ticket,
        };

        let Some(thread_id) = ticket.thread_id.clone() else {
            bail!("Agent asked for confirmation without naming a thread; cannot resume");
        };
        if !ticket.resumable {
            println!("thread: {thread_id}");
            bail!("The pending action on thread {thread_id} can no longer be resumed");
        }

        let exchange = if decide(approval).await? {
            session
                .confirm_action(ConfirmAction::new(&thread_id).with_ticket(ticket))
                .context("confirm action")?
        } else {
            session
                .cancel_action(&thread_id)
                .context("cancel action")?
        };
        outcome = stream(exchange).await?;
    }
}

async fn stream(exchange: Exchange) -> Result<ExchangeOutcome> {
    let mut printer = StdoutPrinter::default();
    let outcome = exchange.run(&mut printer).await;
    printer.finish_line();
    Ok(outcome?)
}

async fn decide(approval: Approval) -> Result<bool> {
    match approval {
        Approval::Yes => Ok(true),
        Approval::No => Ok(false),
        Approval::Ask => tokio::task::spawn_blocking(ask_confirm)
            .await
            .context("read confirmation")?,
    }
}

fn ask_confirm() -> Result<bool> {
    print!("Confirm? [y/N] ");
    io::stdout().flush().context("flush stdout")?;

    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("read confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes" | "Yes"))
}

/// Writes progress chunks to stdout as they arrive.
#[derive(Default)]
struct StdoutPrinter {
    mid_line: bool,
}

impl StdoutPrinter {
    fn finish_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }
}

impl ExchangeHandler for StdoutPrinter {
    fn on_progress(&mut self, chunk: &str) {
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(chunk.as_bytes());
        let _ = stdout.flush();
        self.mid_line = !chunk.ends_with('\n');
    }

    fn on_interrupt(&mut self, ticket: &InterruptTicket) {
        self.finish_line();
        let content = serde_json::to_string_pretty(&ticket.content)
            .unwrap_or_else(|_| ticket.content.to_string());
        println!("Action requires confirmation:");
        println!("{content}");
        if let Some(thread_id) = &ticket.thread_id {
            println!("ticket: {}", ticket.content);
            println!("thread: {thread_id}");
        }
    }
}
