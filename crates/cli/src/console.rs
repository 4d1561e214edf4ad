//! The terminal operator: questions go to stderr, answers come from stdin.

use async_trait::async_trait;
use std::io::{BufRead, Write};
use tracing::warn;
use turnstile_core::human::HumanInput;
use turnstile_core::interrupt::InterruptSignal;

/// Reads answers from stdin on the blocking pool so the runtime keeps
/// servicing Ctrl-C while the operator types.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleInput;

impl ConsoleInput {
    async fn read_lines(prompt: String, multiline: bool) -> String {
        let read = tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = writeln!(stderr, "\n{prompt}");
            let _ = write!(stderr, "> ");
            let _ = stderr.flush();

            let stdin = std::io::stdin();
            let mut lines = Vec::new();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() || !multiline {
                    if !line.trim().is_empty() {
                        lines.push(line);
                    }
                    break;
                }
                lines.push(line);
                let _ = write!(stderr, "> ");
                let _ = stderr.flush();
            }
            lines.join("\n")
        })
        .await;

        match read {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "Reading operator input failed");
                String::new()
            }
        }
    }
}

#[async_trait]
impl HumanInput for ConsoleInput {
    /// Multi-line; a blank line ends the answer.
    async fn ask(&self, prompt: &str) -> String {
        Self::read_lines(prompt.to_string(), true).await
    }

    async fn confirm(&self, prompt: &str, default: bool) -> bool {
        let hint = if default { "[Y/n]" } else { "[y/N]" };
        let answer = Self::read_lines(format!("{prompt} {hint}"), false).await;
        parse_yes_no(&answer).unwrap_or(default)
    }
}

fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// First Ctrl-C raises `signal` so the loop pauses at its next checkpoint.
/// A second one while the first is still pending exits with status 130.
pub fn install_interrupt_handler(signal: InterruptSignal) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Cannot listen for Ctrl-C");
                return;
            }
            if signal.is_raised() {
                eprintln!("\nInterrupted twice, exiting.");
                std::process::exit(130);
            }
            signal.raise();
            eprintln!("\nInterrupt requested; the agent will pause after the current step.");
        }
    });
}
