//! Integration Test: Blocking I/O Prohibition
//!
//! **Policy**: `async fn` bodies in the router crates MUST NOT block the
//! runtime thread.
//! **Required**: `tokio::fs`, `tokio::net`, `tokio::process`, `tokio::io`
//! instead of their `std` counterparts.
//!
//! Blocking calls remain acceptable in synchronous functions (configuration
//! loading before requests flow, CLI setup) and in test code.

use architectural_enforcement::{
    enclosing_fn, production_files, production_lines, read_source, FnKind, Violation,
};
use std::path::Path;

/// Patterns that block when called from an async context
const BLOCKING_PATTERNS: &[(&str, &str)] = &[
    ("std::fs::", "Blocking file I/O"),
    ("std::net::", "Blocking network I/O"),
    ("std::process::Command", "Blocking process I/O"),
    ("std::io::stdin()", "Blocking stdin"),
    ("std::io::stdout()", "Blocking stdout"),
    ("std::thread::sleep", "Blocking sleep"),
];

/// Test that no async function performs blocking I/O
#[test]
fn test_no_blocking_io_in_async_code() {
    let violations: Vec<Violation> = production_files()
        .iter()
        .filter_map(|path| read_source(path).map(|content| check_file(path, &content)))
        .flatten()
        .collect();

    if !violations.is_empty() {
        eprintln!("\nBlocking I/O calls found in async production code:\n");
        for violation in &violations {
            eprintln!("  {violation}");
        }
        eprintln!("\nUse tokio::fs, tokio::net, tokio::process and tokio::io instead.");

        panic!(
            "\nFound {} blocking I/O violation(s) in production code.",
            violations.len()
        );
    }
}

/// `reqwest::blocking` is never acceptable, sync function or not
#[test]
fn test_no_blocking_http_client() {
    let offenders: Vec<String> = production_files()
        .iter()
        .filter_map(|path| {
            let content = read_source(path)?;
            production_lines(&content)
                .iter()
                .any(|(_, code)| code.contains("reqwest::blocking"))
                .then(|| path.display().to_string())
        })
        .collect();

    assert!(offenders.is_empty(), "reqwest::blocking used in {offenders:?}");
}

fn check_file(path: &Path, content: &str) -> Vec<Violation> {
    let all_lines: Vec<&str> = content.lines().collect();
    let mut violations = Vec::new();

    for (idx, code) in production_lines(content) {
        if enclosing_fn(&all_lines, idx) != Some(FnKind::Async) {
            continue;
        }
        for &(pattern, rule) in BLOCKING_PATTERNS {
            if code.contains(pattern) {
                violations.push(Violation {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    rule,
                    text: all_lines[idx].trim().to_string(),
                });
            }
        }
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocking_io_detection() {
        let code = "async fn bad() {\n    let s = std::fs::read_to_string(\"f\")?;\n}\n";
        let violations = check_file(Path::new("bad.rs"), code);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 2);
        assert_eq!(violations[0].rule, "Blocking file I/O");
    }

    #[test]
    fn test_sync_function_is_allowed() {
        let code = "pub fn load() {\n    let s = std::fs::read_to_string(\"config.toml\");\n}\n";
        assert!(check_file(Path::new("ok.rs"), code).is_empty());
    }

    #[test]
    fn test_test_module_is_allowed() {
        let code = "#[cfg(test)]\nmod tests {\n    async fn t() {\n        std::fs::write(\"x\", b\"y\").unwrap();\n    }\n}\n";
        assert!(check_file(Path::new("t.rs"), code).is_empty());
    }
}
