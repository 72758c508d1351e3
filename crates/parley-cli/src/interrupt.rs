//! Ctrl+C handling.
//!
//! The first Ctrl+C aborts the session's active exchange, which then ends as
//! cancelled. With nothing to abort, or on a second Ctrl+C, the process exits
//! with status 130.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use parley_core::AbortHandle;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);
static ABORT: OnceLock<AbortHandle> = OnceLock::new();

#[derive(Debug)]
pub struct InterruptedError;

impl fmt::Display for InterruptedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interrupted")
    }
}

impl std::error::Error for InterruptedError {}

/// Installs the Ctrl+C handler.
pub fn init() -> Result<()> {
    ctrlc::set_handler(trigger_ctrl_c).context("set Ctrl+C handler")
}

/// Routes Ctrl+C to `handle`. Only the first registered handle is kept.
pub fn watch(handle: AbortHandle) {
    let _ = ABORT.set(handle);
}

fn trigger_ctrl_c() {
    if INTERRUPTED.swap(true, Ordering::SeqCst) {
        std::process::exit(130);
    }
    let aborted = ABORT.get().is_some_and(AbortHandle::abort);
    if !aborted {
        std::process::exit(130);
    }
    tracing::debug!("aborted active exchange on Ctrl+C");
}
