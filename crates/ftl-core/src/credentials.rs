use std::path::Path;

use anyhow::{Context, Result};

use crate::paths;

/// Load `~/.ftl/credentials` into the process environment.
///
/// The file stores auth for ftl infrastructure (Anthropic key, Bedrock
/// token) so users don't have to export env vars every session. Format:
/// `KEY=VALUE`, one per line; `#` starts a comment. Existing env vars win.
pub fn load_credentials() -> Vec<(String, String)> {
    let Ok(text) = std::fs::read_to_string(paths::credentials_file()) else {
        return Vec::new();
    };
    let mut loaded = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().to_string();
        if std::env::var_os(&key).is_none() {
            // set_var is unsafe in edition 2024: it races other threads
            // reading the environment. This runs at process startup before
            // any worker threads exist.
            unsafe { std::env::set_var(&key, &value) };
        }
        loaded.push((key, value));
    }
    loaded
}

/// Save or update a single credential in `~/.ftl/credentials`.
///
/// The file is chmod 0600 and its parent 0700: it holds real secrets.
pub fn save_credential(key: &str, value: &str) -> Result<()> {
    let path = paths::credentials_file();
    let parent = path
        .parent()
        .context("credentials file has no parent directory")?;
    std::fs::create_dir_all(parent)?;
    set_mode(parent, 0o700)?;

    let mut lines: Vec<String> = Vec::new();
    let mut found = false;
    if let Ok(text) = std::fs::read_to_string(&path) {
        for line in text.lines() {
            let stripped = line.trim();
            if !stripped.is_empty() && !stripped.starts_with('#') {
                if let Some((k, _)) = stripped.split_once('=') {
                    if k.trim() == key {
                        lines.push(format!("{}={}", key, value));
                        found = true;
                        continue;
                    }
                }
            }
            lines.push(line.to_string());
        }
    }
    if !found {
        lines.push(format!("{}={}", key, value));
    }

    std::fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    set_mode(&path, 0o600)?;
    unsafe { std::env::set_var(key, value) };
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("Failed to chmod {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(ftl_home)]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };
        unsafe { std::env::remove_var("FTL_TEST_CRED") };

        save_credential("FTL_TEST_CRED", "abc123").unwrap();
        let loaded = load_credentials();
        assert!(loaded.iter().any(|(k, v)| k == "FTL_TEST_CRED" && v == "abc123"));
        assert_eq!(std::env::var("FTL_TEST_CRED").unwrap(), "abc123");

        unsafe { std::env::remove_var("FTL_TEST_CRED") };
        unsafe { std::env::remove_var("FTL_HOME") };
    }

    #[test]
    #[serial(ftl_home)]
    fn test_save_updates_in_place() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };

        save_credential("KEY_A", "one").unwrap();
        save_credential("KEY_B", "two").unwrap();
        save_credential("KEY_A", "three").unwrap();

        let text = std::fs::read_to_string(paths::credentials_file()).unwrap();
        assert_eq!(text.matches("KEY_A=").count(), 1);
        assert!(text.contains("KEY_A=three"));
        assert!(text.contains("KEY_B=two"));

        unsafe { std::env::remove_var("KEY_A") };
        unsafe { std::env::remove_var("KEY_B") };
        unsafe { std::env::remove_var("FTL_HOME") };
    }

    #[cfg(unix)]
    #[test]
    #[serial(ftl_home)]
    fn test_credentials_file_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };

        save_credential("MODE_KEY", "v").unwrap();
        let mode = std::fs::metadata(paths::credentials_file())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        unsafe { std::env::remove_var("MODE_KEY") };
        unsafe { std::env::remove_var("FTL_HOME") };
    }

    #[test]
    #[serial(ftl_home)]
    fn test_comments_and_blanks_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        unsafe { std::env::set_var("FTL_HOME", dir.path()) };
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(
            paths::credentials_file(),
            "# comment\n\nGOOD_KEY=value\nmalformed line\n",
        )
        .unwrap();

        let loaded = load_credentials();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "GOOD_KEY");

        unsafe { std::env::remove_var("GOOD_KEY") };
        unsafe { std::env::remove_var("FTL_HOME") };
    }
}
