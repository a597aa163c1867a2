use std::path::Path;

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use similar::{ChangeTag, TextDiff};

use ftl_core::ignore::ignored_in_diff;

/// Extensions treated as binary without looking at content.
const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "ico", "svg", "webp", "woff", "woff2", "ttf", "eot", "zip",
    "tar", "gz", "bz2", "pdf", "doc", "docx", "pyc", "pyo", "so", "dylib", "dll",
];

/// NUL sniffing window for binary detection.
const BINARY_SNIFF_BYTES: usize = 8192;

/// One changed file as reported by the in-container walker: either a
/// deletion marker or the file's new content.
#[derive(Debug, Clone, Deserialize)]
pub struct OverlayEntry {
    pub path: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub content_b64: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Created,
    Modified,
    Deleted,
}

impl DiffStatus {
    pub fn label(&self) -> &'static str {
        match self {
            DiffStatus::Created => "created",
            DiffStatus::Modified => "modified",
            DiffStatus::Deleted => "deleted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineTag {
    Equal,
    Insert,
    Delete,
}

impl LineTag {
    pub fn symbol(&self) -> char {
        match self {
            LineTag::Equal => ' ',
            LineTag::Insert => '+',
            LineTag::Delete => '-',
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiffLine {
    pub tag: LineTag,
    pub text: String,
}

/// One record per changed file. `new_content` carries the raw bytes to
/// write on merge for created/modified files.
#[derive(Debug, Clone)]
pub struct DiffEntry {
    pub path: String,
    pub status: DiffStatus,
    pub lines: Vec<DiffLine>,
    pub new_content: Option<Vec<u8>>,
}

fn has_binary_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| BINARY_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
}

fn looks_binary(path: &str, content: &[u8]) -> bool {
    has_binary_extension(path) || content[..content.len().min(BINARY_SNIFF_BYTES)].contains(&0)
}

fn read_snapshot_file(snapshot_path: &Path, rel: &str) -> Option<Vec<u8>> {
    std::fs::read(snapshot_path.join(rel)).ok()
}

fn to_lines(content: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(content)
        .lines()
        .map(str::to_string)
        .collect()
}

/// Classify overlay entries against the snapshot and produce line-level
/// diffs. Ignored artifact paths are dropped, binaries collapse to a
/// marker line, unchanged files are omitted, output is sorted by path.
pub fn compute_diff(overlay: &[OverlayEntry], snapshot_path: &Path) -> Result<Vec<DiffEntry>> {
    let mut diffs = Vec::new();

    for entry in overlay {
        let rel = Path::new(&entry.path);
        if ignored_in_diff(rel) {
            continue;
        }

        if entry.deleted {
            let Some(old) = read_snapshot_file(snapshot_path, &entry.path) else {
                continue;
            };
            let lines = if looks_binary(&entry.path, &old) {
                vec![DiffLine {
                    tag: LineTag::Delete,
                    text: "[binary file]".to_string(),
                }]
            } else {
                to_lines(&old)
                    .into_iter()
                    .map(|text| DiffLine {
                        tag: LineTag::Delete,
                        text,
                    })
                    .collect()
            };
            diffs.push(DiffEntry {
                path: entry.path.clone(),
                status: DiffStatus::Deleted,
                lines,
                new_content: None,
            });
            continue;
        }

        let new_content = BASE64
            .decode(entry.content_b64.as_deref().unwrap_or_default())
            .with_context(|| format!("Bad content encoding for {}", entry.path))?;
        let old_content = read_snapshot_file(snapshot_path, &entry.path);

        match old_content {
            None => {
                let lines = if looks_binary(&entry.path, &new_content) {
                    vec![DiffLine {
                        tag: LineTag::Insert,
                        text: "[binary file]".to_string(),
                    }]
                } else {
                    to_lines(&new_content)
                        .into_iter()
                        .map(|text| DiffLine {
                            tag: LineTag::Insert,
                            text,
                        })
                        .collect()
                };
                diffs.push(DiffEntry {
                    path: entry.path.clone(),
                    status: DiffStatus::Created,
                    lines,
                    new_content: Some(new_content),
                });
            }
            Some(old) => {
                if old == new_content {
                    continue;
                }
                if looks_binary(&entry.path, &old) || looks_binary(&entry.path, &new_content) {
                    diffs.push(DiffEntry {
                        path: entry.path.clone(),
                        status: DiffStatus::Modified,
                        lines: vec![DiffLine {
                            tag: LineTag::Equal,
                            text: "[binary file changed]".to_string(),
                        }],
                        new_content: Some(new_content),
                    });
                    continue;
                }

                let old_text = String::from_utf8_lossy(&old).into_owned();
                let new_text = String::from_utf8_lossy(&new_content).into_owned();
                let mut lines = Vec::new();
                let diff = TextDiff::from_lines(&old_text, &new_text);
                for change in diff.iter_all_changes() {
                    let tag = match change.tag() {
                        ChangeTag::Equal => LineTag::Equal,
                        ChangeTag::Insert => LineTag::Insert,
                        ChangeTag::Delete => LineTag::Delete,
                    };
                    lines.push(DiffLine {
                        tag,
                        text: change.value().trim_end_matches('\n').to_string(),
                    });
                }
                if lines.iter().all(|l| l.tag == LineTag::Equal) {
                    continue;
                }
                diffs.push(DiffEntry {
                    path: entry.path.clone(),
                    status: DiffStatus::Modified,
                    lines,
                    new_content: Some(new_content),
                });
            }
        }
    }

    diffs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(diffs)
}

/// Plain-text rendering for model context and guardrail input.
pub fn diff_to_text(diffs: &[DiffEntry]) -> String {
    let mut parts = Vec::new();
    for diff in diffs {
        parts.push(format!(
            "--- {}: {} ---",
            diff.status.label().to_uppercase(),
            diff.path
        ));
        for line in &diff.lines {
            match line.tag {
                LineTag::Insert => parts.push(format!("+ {}", line.text)),
                LineTag::Delete => parts.push(format!("- {}", line.text)),
                LineTag::Equal => parts.push(format!("  {}", line.text)),
            }
        }
        parts.push(String::new());
    }
    parts.join("\n")
}

/// Apply approved diffs to the project tree: write bytes for
/// created/modified files, unlink deleted ones. Returns the file count.
pub fn apply_diffs(diffs: &[DiffEntry], project_root: &Path) -> Result<usize> {
    let mut applied = 0;
    for diff in diffs {
        let target = project_root.join(&diff.path);
        match diff.status {
            DiffStatus::Created | DiffStatus::Modified => {
                let content = diff
                    .new_content
                    .as_ref()
                    .with_context(|| format!("No content for {}", diff.path))?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&target, content)
                    .with_context(|| format!("Failed to write {}", target.display()))?;
            }
            DiffStatus::Deleted => {
                if target.exists() {
                    std::fs::remove_file(&target)
                        .with_context(|| format!("Failed to delete {}", target.display()))?;
                }
            }
        }
        applied += 1;
    }
    Ok(applied)
}

/// Counts for the review footer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub created: usize,
    pub modified: usize,
    pub deleted: usize,
    pub insertions: usize,
    pub deletions: usize,
}

pub fn summarize(diffs: &[DiffEntry]) -> Summary {
    let mut summary = Summary::default();
    for diff in diffs {
        match diff.status {
            DiffStatus::Created => summary.created += 1,
            DiffStatus::Modified => summary.modified += 1,
            DiffStatus::Deleted => summary.deleted += 1,
        }
        for line in &diff.lines {
            match line.tag {
                LineTag::Insert => summary.insertions += 1,
                LineTag::Delete => summary.deletions += 1,
                LineTag::Equal => {}
            }
        }
    }
    summary
}
