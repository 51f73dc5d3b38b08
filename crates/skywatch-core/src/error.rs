//! Errors raised when ingesting rule definitions.
//!
//! Evaluation itself never fails; only ingestion validates.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuleError {
    #[error("rule is missing an id")]
    MissingId,
    #[error("rule has no conditions")]
    MissingConditions,
    #[error("rule conditions tree has no groups")]
    EmptyConditions,
    #[error("condition group {0} has no conditions")]
    EmptyGroup(usize),
    #[error("malformed rule conditions: {0}")]
    Malformed(String),
    #[error("rule active window ends before it starts")]
    InvertedWindow,
}
