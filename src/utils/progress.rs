//! Operator-facing narration. Progress goes to stdout, failures to stderr.

use std::fmt::Display;

pub fn banner(message: &str) {
    println!("🚀 {}", message);
}

pub fn step_start(step: &str) {
    println!("▶ {}...", step);
    tracing::debug!(step, "step started");
}

pub fn step_done(step: &str) {
    println!("✓ {} done", step);
    tracing::debug!(step, "step finished");
}

pub fn step_failed(step: &str, err: &dyn Display) {
    eprintln!("❌ {} failed: {}", step, err);
    tracing::warn!(step, error = %err, "step failed");
}

pub fn warn(message: &str) {
    eprintln!("⚠ {}", message);
}

pub fn info(message: &str) {
    println!("ℹ {}", message);
}
