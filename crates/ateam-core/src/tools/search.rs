//! Case-insensitive text search across a directory tree

use std::path::Path;

use anyhow::{Context, Result};

/// Lines reported before the search stops
pub const MAX_RESULTS: usize = 20;
const MAX_FILE_BYTES: u64 = 1024 * 1024;

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "__pycache__",
    ".venv",
    ".pytest_cache",
];
const IGNORED_EXTS: &[&str] = &[
    "pyc", "pyo", "pyd", "so", "dll", "exe", "bin", "lock", "o", "a", "rlib",
];

/// Search `root` for lines containing `query`, as `path:line: text`.
/// Symlinks are not followed, so results stay under `root`.
pub fn search_dir(root: &Path, query: &str) -> Result<String> {
    let query = query.trim();
    if query.is_empty() {
        anyhow::bail!("Search query is empty");
    }
    let metadata = std::fs::metadata(root)
        .with_context(|| format!("Not found: {}", root.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("Not a directory: {}", root.display());
    }

    let needle = query.to_lowercase();
    let mut results = Vec::new();
    let truncated = walk(root, root, &needle, &mut results)?;

    if results.is_empty() {
        return Ok(format!("No results found for '{query}'."));
    }
    let mut out = results.join("\n");
    if truncated {
        out.push_str(&format!(
            "\n... (stopped after {MAX_RESULTS} matches, refine the query)"
        ));
    }
    Ok(out)
}

/// Returns true once the result cap is hit
fn walk(base: &Path, dir: &Path, needle: &str, results: &mut Vec<String>) -> Result<bool> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
        .filter_map(|e| e.ok())
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if file_type.is_dir() {
            if IGNORED_DIRS.contains(&name.as_str()) {
                continue;
            }
            if walk(base, &path, needle, results)? {
                return Ok(true);
            }
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        let ignored_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IGNORED_EXTS.contains(&e));
        if ignored_ext {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        // binary or unreadable files are skipped
        let Ok(content) = std::fs::read_to_string(&path) else {
            continue;
        };

        let rel = path.strip_prefix(base).unwrap_or(&path).display().to_string();
        for (i, line) in content.lines().enumerate() {
            if line.to_lowercase().contains(needle) {
                if results.len() >= MAX_RESULTS {
                    return Ok(true);
                }
                results.push(format!("{}:{}: {}", rel, i + 1, line.trim()));
            }
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_search_finds_lines_case_insensitively() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("src")).unwrap();
        std::fs::write(temp.path().join("src/lib.rs"), "fn main() {}\n// TODO: Parser\n").unwrap();
        std::fs::write(temp.path().join("notes.md"), "the parser is slow\n").unwrap();

        let out = search_dir(temp.path(), "PARSER").unwrap();
        assert_eq!(out, "notes.md:1: the parser is slow\nsrc/lib.rs:2: // TODO: Parser");
    }

    #[test]
    fn test_search_skips_ignored_dirs_and_exts() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".git")).unwrap();
        std::fs::write(temp.path().join(".git/config"), "needle").unwrap();
        std::fs::write(temp.path().join("Cargo.lock"), "needle").unwrap();

        let out = search_dir(temp.path(), "needle").unwrap();
        assert_eq!(out, "No results found for 'needle'.");
    }

    #[test]
    fn test_search_caps_results() {
        let temp = TempDir::new().unwrap();
        let body = "hit\n".repeat(MAX_RESULTS + 5);
        std::fs::write(temp.path().join("many.txt"), body).unwrap();

        let out = search_dir(temp.path(), "hit").unwrap();
        assert_eq!(out.lines().filter(|l| l.starts_with("many.txt:")).count(), MAX_RESULTS);
        assert!(out.ends_with("refine the query)"));
    }

    #[test]
    fn test_search_rejects_empty_query_and_files() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), "x").unwrap();
        assert!(search_dir(temp.path(), "  ").is_err());
        assert!(search_dir(&temp.path().join("a.txt"), "x").is_err());
    }
}
