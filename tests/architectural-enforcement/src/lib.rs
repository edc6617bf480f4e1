//! Architectural Enforcement
//!
//! Source scans that keep the relay's production code inside its async
//! runtime rules. The rules live in `tests/`; this library only locates the
//! workspace and walks its production sources.

use std::path::{Path, PathBuf};

/// Production source roots, relative to the workspace root
pub const PRODUCTION_ROOTS: &[&str] = &["relay/core/src", "relay/daemon/src"];

/// The workspace root
#[must_use]
pub fn workspace_root() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    let root = manifest.join("../..");
    root.canonicalize().unwrap_or(root)
}

/// One offending line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File the line is in
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Trimmed source text
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} - {}", self.path.display(), self.line, self.text)
    }
}

/// Every `.rs` file under the production roots
#[must_use]
pub fn production_files() -> Vec<PathBuf> {
    let root = workspace_root();
    let mut files: Vec<PathBuf> = PRODUCTION_ROOTS
        .iter()
        .map(|dir| root.join(dir))
        .filter(|dir| dir.exists())
        .flat_map(|dir| {
            walkdir::WalkDir::new(dir)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
                .map(walkdir::DirEntry::into_path)
        })
        .collect();
    files.sort();
    files
}

/// Lines of `content` before its `#[cfg(test)]` module whose code part
/// contains any of `needles`
///
/// Line comments are ignored.
#[must_use]
pub fn scan(path: &Path, content: &str, needles: &[&str]) -> Vec<Violation> {
    content
        .lines()
        .enumerate()
        .take_while(|(_, line)| line.trim() != "#[cfg(test)]")
        .filter(|(_, line)| {
            let code = line.split("//").next().unwrap_or(line);
            needles.iter().any(|needle| code.contains(needle))
        })
        .map(|(idx, line)| Violation {
            path: path.to_path_buf(),
            line: idx + 1,
            text: line.trim().to_string(),
        })
        .collect()
}

/// Scan every production file for `needles`
#[must_use]
pub fn scan_production(needles: &[&str]) -> Vec<Violation> {
    production_files()
        .into_iter()
        .filter_map(|path| {
            let content = std::fs::read_to_string(&path).ok()?;
            Some(scan(&path, &content, needles))
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_stops_at_test_module() {
        let src = "fn a() {}\nfn b() { std::thread::sleep(d) }\n#[cfg(test)]\nmod tests { std::thread::sleep(d) }\n";
        let found = scan(Path::new("x.rs"), src, &["thread::sleep"]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].line, 2);
    }

    #[test]
    fn test_scan_ignores_comments() {
        let src = "// never call std::thread::sleep here\nlet x = 1; // thread::sleep\n";
        assert!(scan(Path::new("x.rs"), src, &["thread::sleep"]).is_empty());
    }

    #[test]
    fn test_finds_production_sources() {
        let files = production_files();
        assert!(files.iter().any(|p| p.ends_with("relay/core/src/lib.rs")));
        assert!(files.iter().any(|p| p.ends_with("relay/daemon/src/main.rs")));
    }
}
