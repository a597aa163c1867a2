use std::process::Command;

use anyhow::{Context, Result};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// One-shot completion against a model identifier.
///
/// `bedrock/<model-id>` routes through the aws CLI (the host's existing
/// AWS credential chain); anything else is treated as an Anthropic model
/// id and called directly with `ANTHROPIC_API_KEY`.
pub fn complete(model: &str, system: &str, user: &str) -> Result<String> {
    match model.strip_prefix("bedrock/") {
        Some(model_id) => complete_bedrock(model_id, system, user),
        None => complete_anthropic(model, system, user),
    }
}

fn complete_anthropic(model: &str, system: &str, user: &str) -> Result<String> {
    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .context("ANTHROPIC_API_KEY is not set. Run: ftl auth ANTHROPIC_API_KEY <key>")?;

    let body = serde_json::json!({
        "model": model,
        "max_tokens": MAX_TOKENS,
        "system": system,
        "messages": [{"role": "user", "content": user}],
    });

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(120))
        .build()?;
    let response = client
        .post(ANTHROPIC_API_URL)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .context("Model API request failed")?;

    let status = response.status();
    let parsed: serde_json::Value = response.json().context("Model API returned non-JSON")?;
    if !status.is_success() {
        anyhow::bail!(
            "Model API error ({}): {}",
            status,
            parsed["error"]["message"].as_str().unwrap_or("unknown")
        );
    }

    parsed["content"][0]["text"]
        .as_str()
        .map(str::to_string)
        .context("Model response had no text content")
}

fn complete_bedrock(model_id: &str, system: &str, user: &str) -> Result<String> {
    let messages = serde_json::json!([{"role": "user", "content": [{"text": user}]}]);
    let system_blocks = serde_json::json!([{"text": system}]);
    let output = Command::new("aws")
        .args([
            "bedrock-runtime",
            "converse",
            "--model-id",
            model_id,
            "--messages",
            &messages.to_string(),
            "--system",
            &system_blocks.to_string(),
            "--output",
            "json",
        ])
        .output()
        .context("Failed to run aws CLI")?;
    if !output.status.success() {
        anyhow::bail!(
            "Bedrock converse failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    parsed["output"]["message"]["content"][0]["text"]
        .as_str()
        .map(str::to_string)
        .context("Bedrock response had no text content")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(process_env)]
    fn test_anthropic_requires_api_key() {
        unsafe { std::env::remove_var("ANTHROPIC_API_KEY") };
        let err = complete("claude-haiku-4-5-20251001", "sys", "hi").unwrap_err();
        assert!(err.to_string().contains("ANTHROPIC_API_KEY"));
    }

    #[test]
    fn test_bedrock_routes_through_cli() {
        // No aws CLI credentials in the test environment: the call must
        // fail with the Bedrock error path, not the Anthropic one.
        let err = complete("bedrock/deepseek-r1", "sys", "hi").unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("Bedrock") || message.contains("aws"),
            "unexpected error: {}",
            message
        );
    }
}
