use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use colored::Colorize;

use ftl_core::audit::read_log;
use ftl_core::config::{find_config, init_config, load_config};
use ftl_core::credentials::save_credential;
use ftl_core::paths::snapshots_dir;
use ftl_sandbox::StandbySlot;
use ftl_session::Session;
use ftl_snapshot::{SnapshotInfo, SnapshotStore, create_snapshot_store};

use crate::display;

/// Project root, or a clear exit-1 error for commands that require one.
pub(crate) fn require_project() -> Result<PathBuf> {
    let config_path =
        find_config().ok_or_else(|| anyhow::anyhow!("No .ftlconfig found. Run 'ftl init' first."))?;
    Ok(config_path.parent().expect("config file has a parent").to_path_buf())
}

pub(crate) fn open_store() -> Result<Box<dyn SnapshotStore>> {
    let config = load_config()?;
    create_snapshot_store(&config.snapshot_backend, config.s3_bucket.as_deref())
}

pub fn init() -> Result<()> {
    if find_config().is_some() {
        println!(".ftlconfig already exists.");
        return Ok(());
    }
    let cwd = std::env::current_dir()?;
    let config_path = init_config(&cwd, None, None)?;
    println!("Created {}", config_path.display());
    Ok(())
}

pub fn auth(key: &str, value: &str) -> Result<()> {
    save_credential(key, value)?;
    println!("Saved {} to ~/.ftl/credentials", key);
    Ok(())
}

/// One-shot task: start a session, then go straight to review and merge.
pub fn code(task: &str) -> Result<()> {
    let project_path = require_project()?;
    let config = load_config()?;

    if config.tester == config.agent {
        anyhow::bail!(
            "tester cannot be the same as agent. Change 'tester' in .ftlconfig to a \
             different agent or model."
        );
    }

    let store = create_snapshot_store(&config.snapshot_backend, config.s3_bucket.as_deref())?;
    let standby = StandbySlot::new();
    let mut session = Session::new(config, &project_path, store.as_ref(), &standby);
    session.start(task)?;
    session.merge()
}

pub fn config(aws: bool) -> Result<()> {
    if !aws {
        println!("Usage: ftl config --aws");
        return Ok(());
    }
    configure_aws()
}

/// Snapshots sorted oldest-first, with a human creation time read off the
/// local cache directory mtime.
pub(crate) fn snapshots_sorted(
    store: &dyn SnapshotStore,
    project_filter: Option<&Path>,
) -> Result<Vec<(SnapshotInfo, String, std::time::SystemTime)>> {
    let mut rows = Vec::new();
    for info in store.list(project_filter)? {
        let mtime = std::fs::metadata(snapshots_dir().join(&info.id))
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        let created = chrono::DateTime::<chrono::Local>::from(mtime)
            .format("%Y-%m-%d %H:%M")
            .to_string();
        rows.push((info, created, mtime));
    }
    rows.sort_by_key(|(_, _, mtime)| *mtime);
    Ok(rows)
}

pub fn snapshots_list(show_all: bool) -> Result<()> {
    let config_path = find_config();
    if !show_all && config_path.is_none() {
        anyhow::bail!("No .ftlconfig found. Use --all or run 'ftl init'.");
    }
    let store = open_store()?;
    let project_root = config_path
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf);
    let filter = if show_all { None } else { project_root };

    let rows = snapshots_sorted(store.as_ref(), filter.as_deref())?;
    if rows.is_empty() {
        println!("{}", "No snapshots found.".dimmed());
        return Ok(());
    }
    display::snapshot_table(&rows);
    Ok(())
}

pub fn snapshots_clean(
    last: Option<usize>,
    delete_all: bool,
    project_only: bool,
    yes: bool,
) -> Result<()> {
    if last.is_none() && !delete_all {
        anyhow::bail!("Specify --last N or --all.");
    }

    let store = open_store()?;
    let filter = if project_only {
        Some(require_project()?)
    } else {
        None
    };
    let rows = snapshots_sorted(store.as_ref(), filter.as_deref())?;

    let targets: Vec<_> = if delete_all {
        rows
    } else {
        let n = last.unwrap_or(0);
        // Most recent N; the list is oldest-first.
        rows.into_iter().rev().take(n).rev().collect()
    };

    if targets.is_empty() {
        println!("{}", "No snapshots to delete.".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!("About to delete {} snapshot(s):", targets.len()).bold()
    );
    for (info, created, _) in &targets {
        println!(
            "  {}  {}  {}",
            info.id.cyan(),
            info.project,
            created.dimmed()
        );
    }

    if !yes {
        let confirmed = inquire::Confirm::new("Delete these snapshots?")
            .with_default(false)
            .prompt()
            .unwrap_or(false);
        if !confirmed {
            println!("{}", "Cancelled.".dimmed());
            return Ok(());
        }
    }

    for (info, _, _) in &targets {
        store.delete(&info.id)?;
        println!("  {} {}", "Deleted".red(), info.id);
    }
    println!(
        "{}",
        format!("Done. {} snapshot(s) removed.", targets.len())
            .green()
            .bold()
    );
    Ok(())
}

pub fn logs(limit: usize, show_all: bool) -> Result<()> {
    let project = find_config()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .map(|p| p.to_string_lossy().into_owned());
    let filter = if show_all { None } else { project.as_deref() };

    let entries = read_log(filter);
    if entries.is_empty() {
        println!("{}", "No logs yet. Run a task first.".dimmed());
        return Ok(());
    }
    let start = entries.len().saturating_sub(limit);
    display::logs_table(&entries[start..]);
    Ok(())
}

/// Provision AWS resources idempotently via the aws CLI and write the
/// resulting keys back into .ftlconfig.
fn configure_aws() -> Result<()> {
    which::which("aws")
        .map_err(|_| anyhow::anyhow!("'aws' CLI not found. Install it and run 'aws configure'."))?;
    let config_path = find_config()
        .ok_or_else(|| anyhow::anyhow!("No .ftlconfig found. Run 'ftl init' first."))?;
    let project_name = config_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    println!("{}", "Configuring ftl for AWS...".bold());
    let identity = aws_json(&["sts", "get-caller-identity"])?;
    let account_id = identity["Account"]
        .as_str()
        .context("No account id in sts output")?
        .to_string();
    let region = aws_region();
    println!("  Account: {}  Region: {}", account_id, region);

    // S3 bucket (idempotent)
    let bucket = format!("ftl-{}-{}", account_id, region);
    println!("  S3 bucket: {}", bucket);
    let mut create_bucket = vec!["s3api", "create-bucket", "--bucket", bucket.as_str()];
    let location = format!("LocationConstraint={}", region);
    if region != "us-east-1" {
        create_bucket.extend(["--create-bucket-configuration", location.as_str()]);
    }
    match aws_status(&create_bucket) {
        Ok(()) => println!("    {}", "Created.".green()),
        Err(_) => println!("    {}", "Already exists.".dimmed()),
    }

    // CloudWatch log group (idempotent)
    let log_group = format!("/ftl/{}", project_name);
    println!("  CloudWatch log group: {}", log_group);
    match aws_status(&["logs", "create-log-group", "--log-group-name", &log_group]) {
        Ok(()) => println!("    {}", "Created.".green()),
        Err(_) => println!("    {}", "Already exists.".dimmed()),
    }

    // Bedrock guardrail (idempotent by name)
    let guardrail_name = format!("ftl-{}", project_name);
    println!("  Bedrock Guardrail: {}", guardrail_name);
    let (guardrail_id, guardrail_version) = ensure_guardrail(&guardrail_name, &project_name);
    match &guardrail_id {
        Some(id) => println!("    {}", format!("Ready (id={}).", id).green()),
        None => println!(
            "    {}",
            "Skipped (no bedrock:CreateGuardrail permission?).".yellow()
        ),
    }

    let sm_prefix = inquire::Text::new("Secrets Manager prefix (leave blank to skip):")
        .prompt()
        .unwrap_or_default();

    // Merge the new keys into .ftlconfig.
    let mut existing: serde_json::Map<String, serde_json::Value> =
        std::fs::read_to_string(&config_path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default();
    existing.insert("snapshot_backend".into(), "s3".into());
    existing.insert("s3_bucket".into(), bucket.into());
    existing.insert("cloudwatch_log_group".into(), log_group.into());
    if let Some(id) = guardrail_id {
        existing.insert("guardrail_id".into(), id.into());
        existing.insert("guardrail_version".into(), guardrail_version.into());
    }
    if !sm_prefix.trim().is_empty() {
        existing.insert("secrets_manager_prefix".into(), sm_prefix.trim().into());
    }
    std::fs::write(
        &config_path,
        serde_json::to_string_pretty(&serde_json::Value::Object(existing))? + "\n",
    )?;

    println!();
    println!("{}", "Done. .ftlconfig updated.".green().bold());
    println!("  {}", config_path.display().to_string().dimmed());
    Ok(())
}

fn ensure_guardrail(name: &str, project_name: &str) -> (Option<String>, String) {
    let entities: Vec<serde_json::Value> = [
        "AWS_ACCESS_KEY",
        "USERNAME",
        "PASSWORD",
        "EMAIL",
        "CREDIT_DEBIT_CARD_NUMBER",
    ]
    .iter()
    .map(|t| serde_json::json!({"type": t, "action": "BLOCK"}))
    .collect();
    let pii_config = serde_json::json!({ "piiEntitiesConfig": entities });
    let created = aws_json(&[
        "bedrock",
        "create-guardrail",
        "--name",
        name,
        "--description",
        &format!("ftl credential and content safety guardrail for {}", project_name),
        "--sensitive-information-policy-config",
        &pii_config.to_string(),
        "--blocked-input-messaging",
        "Input blocked by ftl guardrail.",
        "--blocked-outputs-messaging",
        "Output blocked by ftl guardrail.",
    ]);

    match created {
        Ok(response) => {
            let id = response["guardrailId"].as_str().map(str::to_string);
            let version = id
                .as_deref()
                .and_then(|id| {
                    aws_json(&["bedrock", "create-guardrail-version", "--guardrail-identifier", id])
                        .ok()
                })
                .and_then(|v| v["version"].as_str().map(str::to_string))
                .unwrap_or_else(|| "1".to_string());
            (id, version)
        }
        Err(_) => {
            // Probably a name conflict: find the existing guardrail.
            let listed = aws_json(&["bedrock", "list-guardrails"]).ok();
            let id = listed.as_ref().and_then(|l| {
                l["guardrails"]
                    .as_array()?
                    .iter()
                    .find(|g| g["name"].as_str() == Some(name))
                    .and_then(|g| g["id"].as_str())
                    .map(str::to_string)
            });
            (id, "1".to_string())
        }
    }
}

fn aws_region() -> String {
    std::env::var("AWS_REGION")
        .or_else(|_| std::env::var("AWS_DEFAULT_REGION"))
        .ok()
        .or_else(|| {
            Command::new("aws")
                .args(["configure", "get", "region"])
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|r| !r.is_empty())
        })
        .unwrap_or_else(|| "us-east-1".to_string())
}

fn aws_json(args: &[&str]) -> Result<serde_json::Value> {
    let output = Command::new("aws")
        .args(args)
        .args(["--output", "json"])
        .output()
        .context("Failed to run aws CLI")?;
    if !output.status.success() {
        anyhow::bail!(
            "aws {} failed: {}",
            args.first().unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(serde_json::from_slice(&output.stdout)?)
}

fn aws_status(args: &[&str]) -> Result<()> {
    let output = Command::new("aws").args(args).output()?;
    if !output.status.success() {
        anyhow::bail!("{}", String::from_utf8_lossy(&output.stderr).trim());
    }
    Ok(())
}
