use std::collections::BTreeMap;
use std::process::Command;

use tracing::debug;

/// Fetch all secrets under an AWS Secrets Manager name prefix.
///
/// Shells out to the `aws` CLI so the host's existing credential chain is
/// reused. Secrets whose value is a JSON object are expanded into multiple
/// keys; plain strings use the last path component, upper-cased. Returns
/// an empty map on any error — this is an optional source and must never
/// block a session.
pub fn load_from_secrets_manager(prefix: &str) -> BTreeMap<String, String> {
    if prefix.is_empty() {
        return BTreeMap::new();
    }
    match fetch(prefix) {
        Ok(secrets) => secrets,
        Err(e) => {
            debug!(error = %e, prefix, "Secrets Manager fetch failed, continuing without it");
            BTreeMap::new()
        }
    }
}

fn fetch(prefix: &str) -> anyhow::Result<BTreeMap<String, String>> {
    let list = Command::new("aws")
        .args([
            "secretsmanager",
            "list-secrets",
            "--filters",
            &format!("Key=name,Values={}", prefix),
            "--output",
            "json",
        ])
        .output()?;
    if !list.status.success() {
        anyhow::bail!(
            "aws secretsmanager list-secrets failed: {}",
            String::from_utf8_lossy(&list.stderr).trim()
        );
    }

    let parsed: serde_json::Value = serde_json::from_slice(&list.stdout)?;
    let mut secrets = BTreeMap::new();

    for entry in parsed["SecretList"].as_array().into_iter().flatten() {
        let Some(name) = entry["Name"].as_str() else {
            continue;
        };
        let Ok(value) = fetch_value(name) else {
            continue;
        };

        if let Ok(serde_json::Value::Object(obj)) = serde_json::from_str(&value) {
            for (k, v) in obj {
                let v = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                secrets.insert(k, v);
            }
            continue;
        }

        let key = name
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(name)
            .to_uppercase();
        secrets.insert(key, value);
    }

    Ok(secrets)
}

fn fetch_value(secret_name: &str) -> anyhow::Result<String> {
    let output = Command::new("aws")
        .args([
            "secretsmanager",
            "get-secret-value",
            "--secret-id",
            secret_name,
            "--query",
            "SecretString",
            "--output",
            "text",
        ])
        .output()?;
    if !output.status.success() {
        anyhow::bail!("get-secret-value failed for {}", secret_name);
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_prefix_short_circuits() {
        assert!(load_from_secrets_manager("").is_empty());
    }

    #[test]
    fn test_unreachable_cli_degrades_to_empty() {
        // No aws CLI / no credentials in the test environment — the call
        // must degrade silently rather than error.
        let secrets = load_from_secrets_manager("ftl-test-nonexistent-prefix");
        assert!(secrets.is_empty());
    }
}
