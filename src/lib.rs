//! # ftl — Zero-trust control plane for AI coding agents
//!
//! Facade crate that re-exports the ftl workspace crates so consumers
//! can depend on a single `ftl` library.
//!
//! ## Crate breakdown
//!
//! | Module | Crate | Purpose |
//! |--------|-------|---------|
//! | [`core`] | ftl-core | Types, IDs, config, ignore rules, audit log |
//! | [`secrets`] | ftl-secrets | Shadow credential minting, dotenv and Secrets Manager sources |
//! | [`snapshot`] | ftl-snapshot | Immutable project snapshots, local and S3 |
//! | [`proxy`] | ftl-proxy | Credential-swap HTTP/HTTPS intercepting proxy |
//! | [`sandbox`] | ftl-sandbox | Docker container lifecycle, exec, diff capture |
//! | [`agent`] | ftl-agent | Coding-agent adapters |
//! | [`diff`] | ftl-diff | Line-level diff engine and credential lint |
//! | [`session`] | ftl-session | Session orchestration and review flow |
//! | [`cli`] | ftl-cli | Command-line surface and interactive shell |

pub use ftl_agent as agent;
pub use ftl_cli as cli;
pub use ftl_core as core;
pub use ftl_diff as diff;
pub use ftl_proxy as proxy;
pub use ftl_sandbox as sandbox;
pub use ftl_secrets as secrets;
pub use ftl_session as session;
pub use ftl_snapshot as snapshot;
