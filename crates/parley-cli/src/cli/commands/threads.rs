//! Thread command handlers.

use anyhow::{Context, Result};
use parley_core::AgentSession;

pub async fn list(session: &AgentSession) -> Result<()> {
    let threads = session.list_threads().await.context("list threads")?;
    if threads.is_empty() {
        println!("No threads found.");
        return Ok(());
    }

    for thread in threads {
        let project = thread
            .project_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        println!(
            "{}  {}  {}",
            thread.id,
            project,
            thread.updated_at.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub async fn delete(session: &AgentSession, id: &str) -> Result<()> {
    session
        .delete_thread(id)
        .await
        .with_context(|| format!("delete thread '{id}'"))?;
    println!("Deleted thread {id}");
    Ok(())
}
