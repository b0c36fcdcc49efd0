//! Path resolution and the sensitive-file heuristic

use std::path::{Component, Path, PathBuf};

/// Case-insensitive substrings that mark a file as sensitive
const SENSITIVE_PATTERNS: &[&str] = &[
    ".env",
    ".key",
    ".pem",
    ".cert",
    "secret",
    "password",
    "credentials",
];

/// Resolve `path` to an absolute, symlink-free form.
///
/// Relative paths are joined onto `base`. A path that does not exist yet is
/// resolved through its longest existing ancestor; the missing remainder may
/// not contain `..`. Returns `None` for NUL bytes or unresolvable paths.
pub fn resolve_path(path: &Path, base: &Path) -> Option<PathBuf> {
    if path.as_os_str().is_empty() || path.to_string_lossy().contains('\0') {
        return None;
    }

    let expanded = expand_home(path);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base.join(expanded)
    };

    let components: Vec<Component> = absolute.components().collect();
    for split in (1..=components.len()).rev() {
        let existing: PathBuf = components[..split].iter().collect();
        let Ok(canonical) = existing.canonicalize() else {
            continue;
        };
        let mut resolved = canonical;
        for component in &components[split..] {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return None,
            }
        }
        return Some(resolved);
    }
    None
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Whether writing to `path` deserves a confirmation even in selective mode
pub fn is_sensitive(path: &Path) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Whether `path` lies under any of `roots`. Both sides must already be resolved.
pub fn is_within(path: &Path, roots: &[PathBuf]) -> bool {
    roots.iter().any(|root| path.starts_with(root))
}
