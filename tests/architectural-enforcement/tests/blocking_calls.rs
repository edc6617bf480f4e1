//! Integration Test: Blocking Call Prohibition
//!
//! The relay runs every event on the tokio runtime. A blocking sleep, a
//! synchronous subprocess or a blocking HTTP client stalls every other
//! user's lane on the same worker.

use architectural_enforcement::{scan_production, Violation};

fn report(violations: &[Violation], rule: &str, fix: &str) {
    if violations.is_empty() {
        return;
    }
    eprintln!("\n{rule} found in production code:");
    for violation in violations {
        eprintln!("  {violation}");
    }
    eprintln!("\nUse instead: {fix}");
    panic!("{} violation(s) of: {rule}", violations.len());
}

#[test]
fn test_no_thread_sleep_in_production_code() {
    report(
        &scan_production(&["thread::sleep"]),
        "blocking sleep",
        "tokio::time::sleep().await or tokio::time::interval",
    );
}

#[test]
fn test_no_std_process_in_production_code() {
    report(
        &scan_production(&["std::process::Command"]),
        "synchronous subprocess",
        "tokio::process::Command",
    );
}

#[test]
fn test_no_blocking_http_in_production_code() {
    report(
        &scan_production(&["reqwest::blocking"]),
        "blocking HTTP client",
        "reqwest::Client with .await",
    );
}

#[test]
fn test_no_unwrap_in_production_code() {
    report(
        &scan_production(&[".unwrap()"]),
        "unwrap outside tests",
        "propagate with ? or handle the None/Err case",
    );
}
