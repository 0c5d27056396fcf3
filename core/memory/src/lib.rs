pub mod consolidator;
pub mod database;
pub mod llm;
pub mod reconciler;
pub mod selector;
pub mod worker;

pub use consolidator::{parse_plan, Consolidator, ParsedPlan};
pub use database::{AppliedDiff, AppliedPlan, Database, SINGLE_INSTANCE_CATEGORIES};
pub use llm::{LlmClient, LlmConfig, LlmError, LlmProvider};
pub use reconciler::{parse_diff, ParsedDiff, Reconciler};
pub use selector::{RelevanceSelector, CORE_CATEGORIES};
pub use worker::ReconciliationWorker;
