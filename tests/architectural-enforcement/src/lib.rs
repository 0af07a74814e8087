//! Architectural Enforcement
//!
//! Source scanning helpers for the integration tests in `tests/`, which
//! enforce rules on the gateway's production code:
//! - No panicking shortcuts (`unwrap`, `expect`, `panic!`)
//! - No sleeping outside backoff, rate limiting and simulated latency
//!
//! Production code is everything in a file before its first `#[cfg(test)]`.

use std::fs;
use std::path::{Path, PathBuf};

/// Crate source directories checked by the enforcement tests
pub const PRODUCTION_DIRS: &[&str] = &["gateway/core/src", "gateway/daemon/src"];

/// One line of production code
#[derive(Debug, Clone)]
pub struct SourceLine {
    /// File the line came from
    pub path: PathBuf,
    /// 1-based line number
    pub number: usize,
    /// Line text with any trailing `//` comment removed
    pub code: String,
}

impl std::fmt::Display for SourceLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.number, self.code.trim())
    }
}

/// Workspace root, resolved from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../.."))
}

/// Every production line of every `.rs` file under [`PRODUCTION_DIRS`]
pub fn production_lines() -> Vec<SourceLine> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| rust_files(&root.join(dir)))
        .flat_map(|path| production_lines_of(&path))
        .collect()
}

fn rust_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn production_lines_of(path: &Path) -> Vec<SourceLine> {
    let Ok(content) = fs::read_to_string(path) else {
        return Vec::new();
    };

    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| !line.trim_start().starts_with("#[cfg(test)]"))
        .filter(|(_, line)| !line.trim_start().starts_with("//"))
        .map(|(idx, line)| SourceLine {
            path: path.to_path_buf(),
            number: idx + 1,
            code: line.split(" //").next().unwrap_or(line).to_string(),
        })
        .collect()
}

/// Whether `path` ends with `suffix` (compared component-wise)
pub fn path_ends_with(path: &Path, suffix: &str) -> bool {
    path.ends_with(suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_production_lines_found() {
        let lines = production_lines();
        assert!(!lines.is_empty(), "no production sources found");
        assert!(lines
            .iter()
            .any(|l| path_ends_with(&l.path, "gateway/core/src/gateway.rs")));
    }

    #[test]
    fn test_test_modules_are_excluded() {
        let lines = production_lines();
        assert!(!lines.iter().any(|l| l.code.contains("mod tests {")));
    }
}
