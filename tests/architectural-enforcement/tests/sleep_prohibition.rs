//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT block a thread with
//! `std::thread::sleep`, and may only await `tokio::time::sleep` where
//! waiting is the feature.
//!
//! **Exceptions**:
//! - retry backoff (`resilience/retry.rs`)
//! - token bucket refill waits (`resource/rate_limit.rs`)
//! - simulated provider latency (`provider/echo.rs`)
//! - connection drain on daemon shutdown (`server.rs`)

use architectural_enforcement::{path_ends_with, production_lines};

const ALLOWED_ASYNC_SLEEP: &[&str] = &[
    "core/src/resilience/retry.rs",
    "core/src/resource/rate_limit.rs",
    "core/src/provider/echo.rs",
    "daemon/src/server.rs",
];

#[test]
fn test_no_sleep_in_production_code() {
    let mut violations = Vec::new();

    for line in production_lines() {
        if line.code.contains("thread::sleep") {
            violations.push(format!("{line} (blocking sleep)"));
            continue;
        }

        let allowed = ALLOWED_ASYNC_SLEEP
            .iter()
            .any(|suffix| path_ends_with(&line.path, suffix));
        if line.code.contains("time::sleep(") && !allowed {
            violations.push(line.to_string());
        }
    }

    if !violations.is_empty() {
        eprintln!("\n❌ Sleep calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ ACCEPTABLE sleep uses:");
        eprintln!("  - Exponential backoff in retry logic");
        eprintln!("  - Rate limiter refill waits");
        eprintln!("  - Periodic tasks using tokio::time::interval()");

        panic!(
            "\nFound {} sleep violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
