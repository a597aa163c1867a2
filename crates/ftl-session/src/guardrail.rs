use std::process::Command;

use tracing::debug;

/// Apply a Bedrock Guardrail to arbitrary text via the aws CLI.
///
/// Returns `(blocked, findings)`. Never fails: a misconfigured guardrail
/// degrades to "not blocked" and the credential lint still runs.
pub fn apply_guardrail(guardrail_id: &str, guardrail_version: &str, text: &str) -> (bool, Vec<String>) {
    if guardrail_id.is_empty() || text.is_empty() {
        return (false, Vec::new());
    }
    match invoke(guardrail_id, guardrail_version, text) {
        Ok(result) => result,
        Err(e) => {
            debug!(error = %e, guardrail_id, "Guardrail application failed; continuing");
            (false, Vec::new())
        }
    }
}

fn invoke(guardrail_id: &str, version: &str, text: &str) -> anyhow::Result<(bool, Vec<String>)> {
    let content = serde_json::json!([{"text": {"text": text}}]);
    let output = Command::new("aws")
        .args([
            "bedrock-runtime",
            "apply-guardrail",
            "--guardrail-identifier",
            guardrail_id,
            "--guardrail-version",
            if version.is_empty() { "DRAFT" } else { version },
            "--source",
            "OUTPUT",
            "--content",
            &content.to_string(),
            "--output",
            "json",
        ])
        .output()?;
    if !output.status.success() {
        anyhow::bail!(
            "apply-guardrail failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let blocked = parsed["action"].as_str() == Some("GUARDRAIL_INTERVENED");

    let mut findings = Vec::new();
    for assessment in parsed["assessments"].as_array().into_iter().flatten() {
        let sip = &assessment["sensitiveInformationPolicy"];
        for entity in sip["piiEntities"].as_array().into_iter().flatten() {
            if matches!(entity["action"].as_str(), Some("BLOCKED" | "ANONYMIZED")) {
                findings.push(format!(
                    "Sensitive info: {}",
                    entity["type"].as_str().unwrap_or("unknown")
                ));
            }
        }
        for regex in sip["regexes"].as_array().into_iter().flatten() {
            if matches!(regex["action"].as_str(), Some("BLOCKED" | "ANONYMIZED")) {
                findings.push(format!(
                    "Pattern match: {}",
                    regex["name"].as_str().unwrap_or("custom")
                ));
            }
        }
        for filter in assessment["contentPolicy"]["filters"]
            .as_array()
            .into_iter()
            .flatten()
        {
            if filter["action"].as_str() == Some("BLOCKED") {
                findings.push(format!(
                    "Content policy: {}",
                    filter["type"].as_str().unwrap_or("unknown")
                ));
            }
        }
    }

    Ok((blocked, findings))
}
