//! Integration Test: Panic Prohibition
//!
//! **Policy**: Production code in the gateway crates MUST NOT take panicking
//! shortcuts. Failures are returned as `Result` or folded into a failed
//! `ModelResponse`.
//!
//! **Exceptions**: test code, `unwrap_or*` combinators.

use architectural_enforcement::production_lines;

const FORBIDDEN: &[&str] = &[".unwrap()", ".expect(", "panic!(", "todo!(", "unimplemented!("];

#[test]
fn test_no_panicking_shortcuts_in_production_code() {
    let violations: Vec<String> = production_lines()
        .into_iter()
        .filter(|line| FORBIDDEN.iter().any(|pattern| line.code.contains(pattern)))
        .map(|line| line.to_string())
        .collect();

    if !violations.is_empty() {
        eprintln!("\n❌ Panicking calls found in production code!\n");
        for violation in &violations {
            eprintln!("  ❌ {violation}");
        }
        eprintln!("\n✅ Use `?`, `unwrap_or_else`, or a failed ModelResponse instead.");

        panic!(
            "\nFound {} panic violation(s) in production code.\nFix these before merging!",
            violations.len()
        );
    }
}
