//! Row enrichment engine.
//!
//! The runner walks data rows, the filter decides which rows qualify, the
//! row enricher fills blank output cells through the completion gateway under
//! the retry policy, and the extractor picks the value to store.
use crate::gateway::CompletionGateway;
use retry::{RetryPolicy, Sleeper};

pub mod extract;
pub mod filter;
pub mod retry;
pub mod row;
pub mod runner;
pub mod schema;

#[cfg(test)]
pub(crate) mod test_support;

/// Everything a pass needs besides the sheet, built once per run.
pub struct RunContext<'a> {
    pub gateway: &'a dyn CompletionGateway,
    pub sleeper: &'a dyn Sleeper,
    pub retry: RetryPolicy,
    pub model: String,
    pub system_message: String,
}
