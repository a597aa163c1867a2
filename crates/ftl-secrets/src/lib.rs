// ftl-secrets: loads real project secrets and mints opaque shadow
// placeholders for them. The placeholders go into the sandbox; the real
// values never leave the host process except through the swap proxy.

mod secrets_manager;
mod shadow;

pub use secrets_manager::load_from_secrets_manager;
pub use shadow::{ShadowMap, build_shadow_map, generate_shadow_value, SHADOW_PREFIX};
