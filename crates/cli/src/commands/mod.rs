pub mod config_cmd;
pub mod init;
pub mod multi;
pub mod run;
pub mod tools;

use turnstile_agent::RunOutcome;

pub type CommandResult = Result<i32, Box<dyn std::error::Error>>;

/// Print how a run ended and pick the process exit code.
pub fn report(outcome: RunOutcome) -> i32 {
    match outcome {
        RunOutcome::Completed(text) => {
            println!("{text}");
            0
        }
        RunOutcome::Failed(reason) => {
            eprintln!("{reason}");
            1
        }
        RunOutcome::Routed(message) => {
            println!("Undelivered message for {}:\n{}", message.to, message.content);
            0
        }
    }
}
