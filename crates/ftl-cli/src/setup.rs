use std::process::Command;

use anyhow::Result;
use colored::Colorize;

use ftl_core::config::save_global_config;
use ftl_core::credentials::save_credential;
use ftl_core::paths::credentials_file;
use ftl_sandbox::SANDBOX_IMAGE;

const IMAGE_REGISTRY: &str = "vvenne/ftl";

/// Setup wizard choices: label, Docker Hub tag, agent config key.
const AGENT_CHOICES: &[(&str, &str, &str)] = &[
    ("Claude Code  (Anthropic, recommended)", "latest", "claude-code"),
    ("Codex        (OpenAI)", "codex", "codex"),
    ("Aider        (open-source)", "aider", "aider"),
    ("Kiro         (AWS)", "kiro", "kiro"),
];

/// Tester model choices: label, model id ("" disables the tester).
const TESTER_CHOICES: &[(&str, &str)] = &[
    (
        "Anthropic API — claude-haiku  (uses ANTHROPIC_API_KEY)",
        "claude-haiku-4-5-20251001",
    ),
    (
        "AWS Bedrock   — claude-sonnet (uses AWS credentials)",
        "bedrock/us.anthropic.claude-sonnet-4-6",
    ),
    ("Skip test generation", ""),
];

/// One-command setup: Docker checks, sandbox image, agent and tester
/// selection, API key.
pub fn setup() -> Result<()> {
    // 1. Docker present and running
    println!("{}", "Checking Docker...".bold());
    if which::which("docker").is_err() {
        anyhow::bail!(
            "Docker not found. Install Docker and try again.\n  https://docs.docker.com/get-docker/"
        );
    }
    let info = Command::new("docker").arg("info").output()?;
    if !info.status.success() {
        anyhow::bail!("Docker is installed but not running. Start it and try again.");
    }
    println!("  {}", "Docker is running.".green());

    // 2. Sandbox image + agent selection
    println!();
    let image_exists = Command::new("docker")
        .args(["images", "-q", SANDBOX_IMAGE])
        .output()
        .map(|o| !String::from_utf8_lossy(&o.stdout).trim().is_empty())
        .unwrap_or(false);

    let reconfigure = !image_exists
        || inquire::Confirm::new("ftl-sandbox image already exists. Reconfigure?")
            .with_default(false)
            .prompt()
            .unwrap_or(false);

    let mut chosen_agent = None;
    if reconfigure {
        let labels: Vec<&str> = AGENT_CHOICES.iter().map(|(label, _, _)| *label).collect();
        let picked = inquire::Select::new("Which agent do you want to use?", labels)
            .prompt()
            .unwrap_or(AGENT_CHOICES[0].0);
        let (_, tag, agent_key) = AGENT_CHOICES
            .iter()
            .find(|(label, _, _)| *label == picked)
            .unwrap_or(&AGENT_CHOICES[0]);

        pull_image(tag)?;
        let mut updates = serde_json::Map::new();
        updates.insert("agent".into(), (*agent_key).into());
        save_global_config(updates)?;
        chosen_agent = Some(*agent_key);
    } else {
        println!("  {}", "Skipping image setup.".dimmed());
    }

    // 3. Tester model
    println!();
    let labels: Vec<&str> = TESTER_CHOICES.iter().map(|(label, _)| *label).collect();
    let picked = inquire::Select::new("Which model for test generation?", labels)
        .prompt()
        .unwrap_or(TESTER_CHOICES[0].0);
    let (label, model) = TESTER_CHOICES
        .iter()
        .find(|(l, _)| *l == picked)
        .unwrap_or(&TESTER_CHOICES[0]);
    let mut updates = serde_json::Map::new();
    updates.insert("tester".into(), (*model).into());
    save_global_config(updates)?;
    println!("  {}", format!("Tester: {}", label).green());

    // 4. Kiro's browser login happens inside the container, later.
    if chosen_agent == Some("kiro") {
        println!();
        println!("{}", "Kiro authentication".bold());
        println!(
            "  Kiro uses browser-based login. After your first {} run, authenticate with:",
            "ftl code".bold()
        );
        println!(
            "  {}",
            "docker exec -it $(docker ps -qf ancestor=ftl-sandbox) kiro-cli login".dimmed()
        );
    }

    // 5. Anthropic API key
    println!();
    if api_key_configured() {
        println!("  {}", "ANTHROPIC_API_KEY already configured.".green());
    } else {
        println!("{}", "Anthropic API key".bold());
        println!("  {}", "Get one at https://console.anthropic.com".dimmed());
        let key = inquire::Password::new("ANTHROPIC_API_KEY:")
            .without_confirmation()
            .prompt()
            .unwrap_or_default();
        if key.trim().is_empty() {
            println!(
                "  {}",
                "Skipped. Set later: ftl auth ANTHROPIC_API_KEY sk-ant-...".yellow()
            );
        } else {
            save_credential("ANTHROPIC_API_KEY", key.trim())?;
            println!("  {}", "Saved to ~/.ftl/credentials".green());
        }
    }

    println!();
    println!("{}", "Setup complete.".green().bold());
    println!(
        "  Next: {}",
        "cd your-project && ftl init && ftl code 'your task'".bold()
    );
    Ok(())
}

/// Pull the published sandbox image and tag it under the local name the
/// sandbox boots from.
fn pull_image(tag: &str) -> Result<()> {
    let hub_image = format!("{}:{}", IMAGE_REGISTRY, tag);
    println!("  Pulling {}...", hub_image);
    let pull = Command::new("docker").args(["pull", &hub_image]).status()?;
    if !pull.success() {
        anyhow::bail!(
            "Failed to pull {}. Check your network, or build the image locally and tag it \
             as {}.",
            hub_image,
            SANDBOX_IMAGE
        );
    }
    let tag_status = Command::new("docker")
        .args(["tag", &hub_image, SANDBOX_IMAGE])
        .status()?;
    if !tag_status.success() {
        anyhow::bail!("Failed to tag {} as {}", hub_image, SANDBOX_IMAGE);
    }
    println!("  {}", "Pulled.".green());
    Ok(())
}

fn api_key_configured() -> bool {
    if std::env::var("ANTHROPIC_API_KEY").is_ok() {
        return true;
    }
    std::fs::read_to_string(credentials_file())
        .map(|text| text.lines().any(|l| l.starts_with("ANTHROPIC_API_KEY=")))
        .unwrap_or(false)
}
