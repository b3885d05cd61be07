//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code in the router crates MUST NOT sleep. Periodic
//! work uses `tokio::time::interval`, and waiting for a result uses channels.
//! **Exceptions**: test code, and the mock collaborators in `test_utils.rs`
//! whose configurable delay simulates a slow backend.

use architectural_enforcement::{production_files, production_lines, read_source, Violation};
use std::path::Path;

/// Files allowed to call `tokio::time::sleep`
const TIMER_SLEEP_ALLOWED: &[&str] = &["test_utils.rs"];

/// Test that production code contains no sleep calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations: Vec<Violation> = production_files()
        .iter()
        .filter_map(|path| read_source(path).map(|content| check_file(path, &content)))
        .flatten()
        .collect();

    if !violations.is_empty() {
        eprintln!("\nSleep calls found in production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::time::interval for periodic work and channels to wait for results.");

        panic!(
            "\nFound {} sleep violation(s) in production code.",
            violations.len()
        );
    }
}

fn check_file(path: &Path, content: &str) -> Vec<Violation> {
    let timer_allowed = path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| TIMER_SLEEP_ALLOWED.contains(&name));

    let mut violations = Vec::new();
    for (idx, code) in production_lines(content) {
        let rule = if code.contains("std::thread::sleep") || code.contains("thread::sleep(") {
            "Thread sleep"
        } else if !timer_allowed && (code.contains("time::sleep(") || code.contains("sleep_until(")) {
            "Timer sleep"
        } else {
            continue;
        };
        violations.push(Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            rule,
            text: code.trim().to_string(),
        });
    }
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_violation_detection() {
        let code = "async fn poll() {\n    tokio::time::sleep(Duration::from_millis(10)).await;\n}\n";
        let violations = check_file(Path::new("core/src/poll.rs"), code);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Timer sleep");
    }

    #[test]
    fn test_thread_sleep_is_never_allowed() {
        let code = "fn wait() {\n    std::thread::sleep(Duration::from_secs(1));\n}\n";
        let violations = check_file(Path::new("core/src/test_utils.rs"), code);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].rule, "Thread sleep");
    }

    #[test]
    fn test_mock_delay_is_allowed() {
        let code = "async fn invoke() {\n    tokio::time::sleep(delay).await;\n}\n";
        assert!(check_file(Path::new("core/src/test_utils.rs"), code).is_empty());
    }

    #[test]
    fn test_interval_is_not_a_sleep() {
        let code = "async fn tick() {\n    let mut ticker = tokio::time::interval_at(start, period);\n}\n";
        assert!(check_file(Path::new("core/src/router.rs"), code).is_empty());
    }
}
