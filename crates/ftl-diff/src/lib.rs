// ftl-diff: line-level diffs between a snapshot and the sandbox
// workspace, plus the credential lint that runs over them before merge.

mod engine;
mod lint;

pub use engine::{
    DiffEntry, DiffLine, DiffStatus, LineTag, OverlayEntry, Summary, apply_diffs, compute_diff,
    diff_to_text, summarize,
};
pub use lint::{LintViolation, lint_diffs};
