use std::collections::BTreeMap;
use std::path::Path;

use rand::RngCore;
use rand::rngs::OsRng;

/// Every placeholder starts with this marker so leaked values are
/// recognizable in diffs and lint output.
pub const SHADOW_PREFIX: &str = "ftl_shadow_";

/// The two parallel tables built at session start.
///
/// `inject_env` maps real variable names to freshly minted placeholders and
/// is what the sandbox sees; `swap_table` maps each placeholder back to the
/// real value and lives only in proxy memory. BTreeMap keeps iteration
/// order stable so swap behaviour is deterministic under test.
#[derive(Debug, Clone, Default)]
pub struct ShadowMap {
    pub inject_env: BTreeMap<String, String>,
    pub swap_table: BTreeMap<String, String>,
}

impl ShadowMap {
    pub fn is_empty(&self) -> bool {
        self.inject_env.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inject_env.len()
    }
}

/// Mint one placeholder: `ftl_shadow_<lowername>_<16 hex>`.
///
/// The suffix comes from the OS CSPRNG; 64 bits is plenty to make
/// collisions (and accidental occurrences in traffic) negligible.
pub fn generate_shadow_value(name: &str) -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}_{}", SHADOW_PREFIX, name.to_lowercase(), token)
}

/// Load real credentials from the project `.env` plus any extra names
/// pulled from the process environment.
///
/// Every `.env` key is treated as sensitive. Values are parsed by dotenvy,
/// which strips surrounding quotes and tolerates comments and blank lines.
/// Keys with empty values are skipped silently; nothing here is fatal.
fn load_real_keys(project_path: &Path, extra_vars: &[String]) -> BTreeMap<String, String> {
    let mut real_keys = BTreeMap::new();

    let env_file = project_path.join(".env");
    if env_file.exists() {
        if let Ok(iter) = dotenvy::from_path_iter(&env_file) {
            for item in iter {
                let Ok((key, value)) = item else {
                    continue;
                };
                if !value.is_empty() {
                    real_keys.insert(key, value);
                }
            }
        }
    }

    for key in extra_vars {
        if !real_keys.contains_key(key) {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    real_keys.insert(key.clone(), value);
                }
            }
        }
    }

    real_keys
}

/// Build the shadow map for a session.
///
/// `extras` come from the config `shadow_env` list; `seed` lets callers add
/// pre-fetched secrets (e.g. from Secrets Manager) into the same table.
pub fn build_shadow_map(
    project_path: &Path,
    extra_vars: &[String],
    seed: BTreeMap<String, String>,
) -> ShadowMap {
    let mut real_keys = seed;
    for (k, v) in load_real_keys(project_path, extra_vars) {
        real_keys.insert(k, v);
    }

    let mut map = ShadowMap::default();
    for (name, real_value) in real_keys {
        let shadow_value = generate_shadow_value(&name);
        map.swap_table.insert(shadow_value.clone(), real_value);
        map.inject_env.insert(name, shadow_value);
    }
    map
}
