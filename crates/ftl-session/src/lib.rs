// ftl-session: drives one coding task through the full flow —
// snapshot → shadow map → proxy → sandbox boot → agent ∥ tester →
// diff → review → merge/reject — and owns cleanup at every exit.

mod guardrail;
mod model;
mod render;
mod session;
mod telemetry;
mod tester;

pub use guardrail::apply_guardrail;
pub use model::complete;
pub use render::{AgentHeartbeat, AgentRenderer, StageTimer};
pub use session::{Session, display_diff};
pub use telemetry::{CloudWatchSink, NoopSink, SpanSink};
pub use tester::{generate_tests_from_task, run_test_code};
