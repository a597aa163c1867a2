use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Result;
use colored::Colorize;
use regex::Regex;
use tracing::debug;

use ftl_sandbox::Sandbox;

use crate::model;

const TEST_EXEC_TIMEOUT: Duration = Duration::from_secs(600);

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)^```\w*\n(.*?)```$").unwrap());

static MISSING_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"ModuleNotFoundError: No module named '([^']+)'").unwrap());

/// Strip markdown code fences if the model wrapped its output in them.
fn strip_fence(code: &str) -> String {
    let trimmed = code.trim();
    match FENCE_RE.captures(trimmed) {
        Some(captures) => captures[1].to_string(),
        None => trimmed.to_string(),
    }
}

/// Top-level package names from ModuleNotFoundError lines.
fn extract_missing_modules(output: &str) -> BTreeSet<String> {
    MISSING_MODULE_RE
        .captures_iter(output)
        .map(|c| c[1].split('.').next().unwrap_or(&c[1]).to_string())
        .collect()
}

/// Generate adversarial test code from the task description alone.
///
/// Runs in parallel with the coding agent — it doesn't need to see the
/// implementation. Returns None on any model failure: the tester is
/// best-effort and never blocks the session.
pub fn generate_tests_from_task(task: &str, tester_model: &str) -> Option<String> {
    let system = "You are an adversarial test engineer. Given a coding task description, \
                  generate a test script that verifies the implementation is correct and \
                  tries to break it. Focus on edge cases, null inputs, boundary conditions, \
                  and unexpected usage. Your goal is to find bugs.\n\n\
                  Output ONLY the test script, no explanation. Use pytest for Python, \
                  jest/vitest for JS/TS.\n\n\
                  IMPORTANT: Real API credentials are available as environment variables in \
                  the test environment. Use them directly — do NOT mock or stub external \
                  API calls.";
    let user = format!("Write tests for this coding task:\n\n{}", task);

    match model::complete(tester_model, system, &user) {
        Ok(code) => Some(strip_fence(&code)),
        Err(e) => {
            debug!(error = %e, model = tester_model, "Test generation failed");
            None
        }
    }
}

/// Generate tests from a diff instead of the task (manual `test` command).
pub fn generate_tests_from_diff(diff_text: &str, tester_model: &str) -> Result<String> {
    let system = "You are an adversarial test engineer. Given code changes, generate a test \
                  script that tries to break the code. Output ONLY the test script. Use \
                  pytest for Python, jest/vitest for JS/TS.\n\n\
                  IMPORTANT: Real API credentials are available as environment variables. \
                  Do NOT mock external API calls.";
    let user = format!("Write tests to find bugs in these changes:\n\n{}", diff_text);
    let code = model::complete(tester_model, system, &user)?;
    Ok(strip_fence(&code))
}

/// Write generated test code into the sandbox and run it.
///
/// Tests that fail because a module is missing get a single automatic
/// `pip install` retry. The transient test file never survives the run,
/// so it can't show up in diffs.
pub fn run_test_code(test_code: &str, sandbox: &dyn Sandbox) -> Result<(i32, String)> {
    let test_code = strip_fence(test_code);

    let is_js = ["import ", "const ", "describe(", "test(", "it(", "require("]
        .iter()
        .any(|prefix| test_code.trim_start().starts_with(prefix));
    let test_file = if is_js {
        "/workspace/_ftl_test.js"
    } else {
        "/workspace/_ftl_test.py"
    };

    sandbox.exec(
        &format!("cat > {} << 'FTLEOF'\n{}\nFTLEOF", test_file, test_code),
        TEST_EXEC_TIMEOUT,
    )?;

    let run_cmd = if is_js {
        format!("cd /workspace && node {} 2>&1", test_file)
    } else {
        format!("cd /workspace && python -m pytest {} -v 2>&1", test_file)
    };

    let mut result = sandbox.exec(&run_cmd, TEST_EXEC_TIMEOUT)?;

    let missing = extract_missing_modules(&format!("{}{}", result.stdout, result.stderr));
    if !missing.is_empty() && !result.success() {
        let packages: Vec<&str> = missing.iter().map(String::as_str).collect();
        println!(
            "  {}",
            format!("installing missing modules: {}", packages.join(" ")).dimmed()
        );
        sandbox.exec(
            &format!("pip install {} -q", packages.join(" ")),
            TEST_EXEC_TIMEOUT,
        )?;
        result = sandbox.exec(&run_cmd, TEST_EXEC_TIMEOUT)?;
    }

    sandbox.exec(&format!("rm -f {}", test_file), TEST_EXEC_TIMEOUT)?;

    let output = format!("{}{}", result.stdout, result.stderr);
    if result.success() {
        println!("  {}", "Tests passed.".green());
    } else {
        println!("  {}", "Tests failed:".yellow());
        println!("{}", output.dimmed());
    }
    Ok((result.exit_code, output))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fence_python() {
        let fenced = "```python\nimport pytest\n\ndef test_x():\n    pass\n```";
        assert_eq!(strip_fence(fenced), "import pytest\n\ndef test_x():\n    pass\n");
    }

    #[test]
    fn test_strip_fence_bare() {
        assert_eq!(strip_fence("  def test(): pass  "), "def test(): pass");
    }

    #[test]
    fn test_strip_fence_no_language_tag() {
        assert_eq!(strip_fence("```\ncode\n```"), "code\n");
    }

    #[test]
    fn test_extract_missing_modules() {
        let output = "ModuleNotFoundError: No module named 'requests'\n\
                      ModuleNotFoundError: No module named 'stripe.api'\n";
        let missing = extract_missing_modules(output);
        assert_eq!(
            missing.into_iter().collect::<Vec<_>>(),
            vec!["requests".to_string(), "stripe".to_string()]
        );
    }

    #[test]
    fn test_extract_missing_modules_none() {
        assert!(extract_missing_modules("all good").is_empty());
    }
}
