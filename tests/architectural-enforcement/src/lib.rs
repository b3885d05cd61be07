//! Architectural Enforcement Integration Tests
//!
//! Source scanners shared by the tests in `tests/`:
//! - No blocking `std::fs` / `std::net` / process / stdio calls inside `async fn`
//! - No thread sleeps in production code, and no timer sleeps outside test support
//!
//! The scanners are line based. Everything from the first `#[cfg(test)]` in
//! a file onwards is treated as test code, matching the layout of the
//! router crates where test modules sit at the bottom.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["router/core/src", "router/daemon/src"];

/// Workspace root, two levels above this crate
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

/// Every `.rs` file under `dir`
#[must_use]
pub fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(|e| e.into_path())
        .collect()
}

/// Every production `.rs` file in the workspace
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_files(&root.join(dir)))
        .collect()
}

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: PathBuf,
    pub line: usize,
    pub rule: &'static str,
    pub text: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Kind of function a line sits in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    Async,
    Sync,
}

/// Production lines of a file with comments stripped, as (index, code)
#[must_use]
pub fn production_lines(content: &str) -> Vec<(usize, &str)> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .map(|(idx, line)| (idx, line.split("//").next().unwrap_or(line)))
        .filter(|(_, code)| !code.trim().is_empty())
        .collect()
}

/// Whether `line` declares a function, and which kind
#[must_use]
pub fn fn_signature(line: &str) -> Option<FnKind> {
    let mut rest = line.trim_start();
    for prefix in ["pub(crate) ", "pub(super) ", "pub "] {
        if let Some(stripped) = rest.strip_prefix(prefix) {
            rest = stripped;
            break;
        }
    }
    for qualifier in ["const ", "unsafe "] {
        if let Some(stripped) = rest.strip_prefix(qualifier) {
            rest = stripped;
        }
    }
    if rest.starts_with("async fn ") {
        Some(FnKind::Async)
    } else if rest.starts_with("fn ") {
        Some(FnKind::Sync)
    } else {
        None
    }
}

/// Kind of the nearest function declared at or above `idx`
#[must_use]
pub fn enclosing_fn(lines: &[&str], idx: usize) -> Option<FnKind> {
    lines[..=idx.min(lines.len().saturating_sub(1))]
        .iter()
        .rev()
        .find_map(|line| fn_signature(line))
}

/// Read a file, returning `None` when it cannot be read
#[must_use]
pub fn read_source(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_signature_detection() {
        assert_eq!(fn_signature("    pub async fn submit(&self) {"), Some(FnKind::Async));
        assert_eq!(fn_signature("pub(crate) fn helper() {"), Some(FnKind::Sync));
        assert_eq!(fn_signature("    const fn size() -> usize {"), Some(FnKind::Sync));
        assert_eq!(fn_signature("let f = async move {"), None);
        assert_eq!(fn_signature("// fn commented()"), None);
    }

    #[test]
    fn test_enclosing_fn() {
        let lines = vec![
            "fn load() {",
            "    let a = 1;",
            "}",
            "pub async fn serve() {",
            "    let b = 2;",
            "}",
        ];
        assert_eq!(enclosing_fn(&lines, 1), Some(FnKind::Sync));
        assert_eq!(enclosing_fn(&lines, 4), Some(FnKind::Async));
    }

    #[test]
    fn test_test_module_is_not_production() {
        let content = "fn a() {}\n// note\n#[cfg(test)]\nmod tests {\n    fn b() {}\n}\n";
        let lines = production_lines(content);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, 0);
    }

    #[test]
    fn test_production_dirs_exist() {
        let root = workspace_root();
        for dir in PRODUCTION_DIRS {
            assert!(root.join(dir).is_dir(), "missing {dir}");
        }
    }
}
