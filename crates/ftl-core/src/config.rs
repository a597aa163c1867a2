use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::FtlError;
use crate::paths;

/// Project config file name, discovered by walking up from the working
/// directory the way git finds `.git`.
pub const FTLCONFIG: &str = ".ftlconfig";

pub const DEFAULT_AGENT: &str = "claude-code";
pub const DEFAULT_TESTER: &str = "claude-haiku-4-5-20251001";
pub const DEFAULT_PLANNER_MODEL: &str = "claude-haiku-4-5-20251001";

/// Merged tool configuration: defaults → `~/.ftl/config.json` → `.ftlconfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which agent adapter runs the task.
    pub agent: String,
    /// Model identifier (or agent name) for adversarial test generation.
    /// Empty string disables the tester.
    pub tester: String,
    /// Model identifier for diff Q&A during review.
    pub planner_model: String,
    /// Shell command run once in the container on fresh boot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup: Option<String>,
    /// Extra env var names to shadow beyond the project `.env`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub shadow_env: Vec<String>,
    /// Extra env var names forwarded to the agent.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub agent_env: Vec<String>,
    /// `local` or `s3`.
    pub snapshot_backend: String,
    /// Required when `snapshot_backend` is `s3`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guardrail_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secrets_manager_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloudwatch_log_group: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent: DEFAULT_AGENT.to_string(),
            tester: DEFAULT_TESTER.to_string(),
            planner_model: DEFAULT_PLANNER_MODEL.to_string(),
            setup: None,
            shadow_env: Vec::new(),
            agent_env: Vec::new(),
            snapshot_backend: "local".to_string(),
            s3_bucket: None,
            guardrail_id: None,
            guardrail_version: None,
            secrets_manager_prefix: None,
            cloudwatch_log_group: None,
        }
    }
}

/// Walk up from `start` looking for `.ftlconfig`.
pub fn find_config_from(start: &Path) -> Option<PathBuf> {
    let mut current = Some(start);
    while let Some(dir) = current {
        let candidate = dir.join(FTLCONFIG);
        if candidate.exists() {
            return Some(candidate);
        }
        current = dir.parent();
    }
    None
}

/// Walk up from the current working directory looking for `.ftlconfig`.
pub fn find_config() -> Option<PathBuf> {
    let cwd = std::env::current_dir().ok()?;
    find_config_from(&cwd)
}

/// Load the merged config.
///
/// Layering: compiled defaults, then `~/.ftl/config.json`, then the
/// project `.ftlconfig`. Later layers override earlier ones key by key.
pub fn load_config() -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;

    if let Ok(text) = std::fs::read_to_string(paths::global_config_file()) {
        if let Ok(global) = serde_json::from_str::<serde_json::Value>(&text) {
            merge_objects(&mut merged, &global);
        }
    }

    if let Some(config_path) = find_config() {
        let text = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let project: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| FtlError::ConfigInvalid {
                path: config_path.display().to_string(),
                detail: e.to_string(),
            })?;
        merge_objects(&mut merged, &project);
    }

    Ok(serde_json::from_value(merged)?)
}

/// Overlay the keys of `overlay` onto `base` (both JSON objects).
fn merge_objects(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    if let (Some(base_map), Some(overlay_map)) = (base.as_object_mut(), overlay.as_object()) {
        for (k, v) in overlay_map {
            base_map.insert(k.clone(), v.clone());
        }
    }
}

/// Read `~/.ftl/config.json`, tolerating absence and corruption.
pub fn load_global_config() -> serde_json::Map<String, serde_json::Value> {
    std::fs::read_to_string(paths::global_config_file())
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

/// Merge updates into `~/.ftl/config.json`.
pub fn save_global_config(updates: serde_json::Map<String, serde_json::Value>) -> Result<()> {
    let mut existing = load_global_config();
    existing.extend(updates);
    let path = paths::global_config_file();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(&serde_json::Value::Object(existing))?;
    std::fs::write(&path, text + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Create a `.ftlconfig` in the given directory with agent/tester seeds.
pub fn init_config(dir: &Path, agent: Option<&str>, tester: Option<&str>) -> Result<PathBuf> {
    let global = load_global_config();
    let pick = |explicit: Option<&str>, key: &str, default: &str| -> String {
        explicit
            .map(str::to_string)
            .or_else(|| global.get(key).and_then(|v| v.as_str()).map(str::to_string))
            .unwrap_or_else(|| default.to_string())
    };

    let seed = serde_json::json!({
        "agent": pick(agent, "agent", DEFAULT_AGENT),
        "tester": pick(tester, "tester", DEFAULT_TESTER),
    });
    let config_path = dir.join(FTLCONFIG);
    std::fs::write(&config_path, serde_json::to_string_pretty(&seed)? + "\n")?;
    Ok(config_path)
}
