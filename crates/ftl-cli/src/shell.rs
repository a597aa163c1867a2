use std::io::Write;

use anyhow::Result;
use colored::Colorize;

use ftl_core::config::{find_config, load_config};
use ftl_sandbox::StandbySlot;
use ftl_session::Session;
use ftl_snapshot::create_snapshot_store;

/// Interactive shell with session support.
///
/// No verb on the command line lands here. A bare line starts a session;
/// with a session active, per-turn commands inspect, test, and land or
/// discard it, and anything else is a follow-up for the agent.
pub fn shell() -> Result<()> {
    let Some(config_path) = find_config() else {
        anyhow::bail!("No .ftlconfig found. Run 'ftl init' first.");
    };
    let project_path = config_path
        .parent()
        .expect("config file has a parent")
        .to_path_buf();
    let config = load_config()?;

    println!("{}", "FTL Shell".bold());
    println!(
        "{}",
        format!("Agent: {} | Tester: {}", config.agent, config.tester).dimmed()
    );
    println!(
        "{}",
        "Type a task to start. Commands: test, diff, merge, reject, list, restore <id>, exit"
            .dimmed()
    );
    println!();

    let store = create_snapshot_store(&config.snapshot_backend, config.s3_bucket.as_deref())?;
    let standby = StandbySlot::new();
    let mut session: Option<Session> = None;

    loop {
        let prompt = if session.as_ref().is_some_and(Session::is_active) {
            "ftl[active]> "
        } else {
            "ftl> "
        };
        print!("{}", prompt);
        std::io::stdout().flush()?;

        let mut input = String::new();
        if std::io::stdin().read_line(&mut input)? == 0 {
            // EOF (Ctrl-D)
            println!("\n{}", "Goodbye.".dimmed());
            if let Some(mut active) = session.take() {
                active.reject();
            }
            break;
        }
        let input = input.trim();
        if input.is_empty() {
            ftl_sandbox::reset_interrupt();
            continue;
        }

        match input {
            "exit" | "quit" => {
                if let Some(mut active) = session.take() {
                    active.reject();
                }
                break;
            }

            // Snapshot commands, always available.
            "list" => {
                list_snapshots(store.as_ref(), Some(&project_path))?;
                continue;
            }
            "list all" => {
                list_snapshots(store.as_ref(), None)?;
                continue;
            }
            _ if input.starts_with("restore ") => {
                restore_snapshot(store.as_ref(), input["restore ".len()..].trim());
                continue;
            }
            _ => {}
        }

        // Session commands, only with an active session.
        if session.as_ref().is_some_and(Session::is_active) {
            match input {
                "merge" | "done" => {
                    let mut active = session.take().expect("checked above");
                    if let Err(e) = active.merge() {
                        println!("{}", e.to_string().red());
                    }
                }
                "reject" => {
                    let mut active = session.take().expect("checked above");
                    active.reject();
                }
                other => {
                    let active = session.as_mut().expect("checked above");
                    let result = match other {
                        "test" => active.run_tests(),
                        "diff" => active.show_diff(),
                        // Anything else is a follow-up instruction for the agent.
                        _ => active.follow_up(other),
                    };
                    if let Err(e) = result {
                        println!("{}", e.to_string().red());
                    }
                }
            }
            continue;
        }

        // No active session — the input is a new task.
        let mut new_session = Session::new(config.clone(), &project_path, store.as_ref(), &standby);
        match new_session.start(input) {
            Ok(()) => session = Some(new_session),
            Err(e) => println!("{}", e.to_string().red()),
        }
    }

    Ok(())
}

fn list_snapshots(
    store: &dyn ftl_snapshot::SnapshotStore,
    project: Option<&std::path::Path>,
) -> Result<()> {
    let snapshots = store.list(project)?;
    if snapshots.is_empty() {
        println!("{}", "No snapshots.".dimmed());
        return Ok(());
    }
    for snapshot in snapshots {
        println!("  {}  {}", snapshot.id.cyan(), snapshot.project);
    }
    Ok(())
}

fn restore_snapshot(store: &dyn ftl_snapshot::SnapshotStore, snapshot_id: &str) {
    println!("Restore snapshot {}?", snapshot_id.bold());
    let confirmed = inquire::Confirm::new("Are you sure?")
        .with_default(false)
        .prompt()
        .unwrap_or(false);
    if !confirmed {
        println!("{}", "Cancelled.".dimmed());
        return;
    }
    match store.restore(snapshot_id, None) {
        Ok(_) => println!("{}", "Restored.".green()),
        Err(e) => println!("{}", e.to_string().red()),
    }
}
