mod cli;
mod interrupt;

use parley_core::AgentError;

fn main() {
    if let Err(e) = cli::run() {
        if e.downcast_ref::<interrupt::InterruptedError>().is_some() {
            std::process::exit(130);
        }
        eprintln!("{e:#}"); // pretty anyhow chain
        if e.chain().any(|cause| {
            cause
                .downcast_ref::<AgentError>()
                .is_some_and(AgentError::is_unauthorized)
        }) {
            eprintln!(
                "Sign in again, then set session_token in the config file (see `parley config path`) or PARLEY_SESSION_TOKEN."
            );
            std::process::exit(2);
        }
        std::process::exit(1);
    }
}
