use std::collections::BTreeSet;
use std::path::Path;

/// Directory and file names never captured into snapshots.
///
/// VCS metadata, caches, vendored dependencies, and virtual environments.
/// `.env` is here deliberately: secrets must never land in a snapshot.
pub const ALWAYS_IGNORE: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    ".env",
    ".ftl",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    "dist",
    "build",
    ".next",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    ".tox",
    ".coverage",
    "coverage",
    "htmlcov",
];

/// Suffixes never captured into snapshots.
pub const IGNORE_SUFFIXES: &[&str] = &[".pyc", ".dist-info", ".egg-info"];

/// Build-artifact names filtered out of diffs on both sides.
pub const DIFF_IGNORE: &[&str] = &[
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".ruff_cache",
    "node_modules",
];

/// User-supplied patterns from `.ftlignore` merged with the built-in set.
#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    names: BTreeSet<String>,
}

impl IgnoreSet {
    /// Load the full ignore set for a project: built-ins plus `.ftlignore`.
    pub fn for_project(project_path: &Path) -> Self {
        let mut names: BTreeSet<String> =
            ALWAYS_IGNORE.iter().map(|s| s.to_string()).collect();
        let ignore_file = project_path.join(".ftlignore");
        if let Ok(text) = std::fs::read_to_string(&ignore_file) {
            for line in text.lines() {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    names.insert(line.to_string());
                }
            }
        }
        Self { names }
    }

    /// True if any component of a relative path matches the set, or any
    /// component carries an ignored suffix.
    pub fn matches(&self, rel_path: &Path) -> bool {
        for part in rel_path.components() {
            let part = part.as_os_str().to_string_lossy();
            if self.names.contains(part.as_ref()) {
                return true;
            }
            if IGNORE_SUFFIXES.iter().any(|sfx| part.ends_with(sfx)) {
                return true;
            }
        }
        false
    }

}

/// True if any component of a relative path is a diff-excluded artifact.
pub fn ignored_in_diff(rel_path: &Path) -> bool {
    rel_path.components().any(|part| {
        let part = part.as_os_str().to_string_lossy();
        DIFF_IGNORE.contains(&part.as_ref())
    })
}
