// stackvault/src/coordinator/prompt.rs
use std::io::{stdin, stdout, Write};
use tokio_util::sync::CancellationToken;

use crate::config::CancelChoice;

/// Decides what happens to maintenance mode when a run is cancelled.
pub trait OperatorPrompt: Send + Sync {
    /// True to leave the application in maintenance mode.
    fn keep_maintenance(&self) -> bool;
}

/// Asks on the terminal. Anything but an explicit yes disables maintenance mode.
pub struct ConsolePrompt;

impl OperatorPrompt for ConsolePrompt {
    fn keep_maintenance(&self) -> bool {
        println!();
        println!("Backup/restore was cancelled.");
        print!("Keep the application in maintenance mode? [y/N]: ");
        let _ = stdout().flush();

        let mut input = String::new();
        if stdin().read_line(&mut input).is_err() {
            return false;
        }
        parse_answer(&input)
    }
}

pub struct FixedAnswer(pub bool);

impl OperatorPrompt for FixedAnswer {
    fn keep_maintenance(&self) -> bool {
        self.0
    }
}

pub fn prompt_for(choice: CancelChoice) -> Box<dyn OperatorPrompt> {
    match choice {
        CancelChoice::Ask => Box::new(ConsolePrompt),
        CancelChoice::KeepMaintenance => Box::new(FixedAnswer(true)),
        CancelChoice::DisableMaintenance => Box::new(FixedAnswer(false)),
    }
}

fn parse_answer(input: &str) -> bool {
    matches!(input.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

/// Cancels `token` on Ctrl-C. The coordinator notices at its next checkpoint.
pub fn listen_for_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if token.is_cancelled() {
                eprintln!("⚠ Already cancelling; waiting for the current step to finish.");
            } else {
                eprintln!("⚠ Interrupt received; stopping after the current step.");
                token.cancel();
            }
        }
    });
}
