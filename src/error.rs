//! Error taxonomy for the signal-processing pipeline.
//!
//! Leaf I/O modules (HTTP, SQLite, templating) return `anyhow::Result` the way the rest of
//! this codebase does. `AppError` is the one typed boundary: `SignalProcessor::process` and
//! `Consumer` match on its variants to decide queue disposition (complete / fail / dead-letter).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("queue unreachable: {0}")]
    QueueUnreachable(#[source] anyhow::Error),

    #[error("task payload could not be parsed: {0}")]
    ParseError(#[source] anyhow::Error),

    #[error("prompt template error: {0}")]
    TemplateError(#[source] anyhow::Error),

    #[error("LLM call timed out")]
    LlmTimeout,

    #[error("LLM transport error: {0}")]
    LlmTransport(#[source] anyhow::Error),

    #[error("LLM response did not contain a usable tool call: {0}")]
    LlmFormat(String),

    #[error("broker rejected the order: {0}")]
    BrokerRejected(String),

    #[error("broker unreachable: {0}")]
    BrokerUnreachable(#[source] anyhow::Error),

    #[error("store write failed: {0}")]
    StoreWriteError(#[source] anyhow::Error),

    #[error("task exceeded its processing deadline")]
    DeadlineExceeded,
}

impl AppError {
    /// The taxonomy key used in the `failed` table and in log fields. Kept distinct from
    /// `Display` so the stored `error_kind` column stays stable even if messages change.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ConfigInvalid(_) => "config_invalid",
            AppError::QueueUnreachable(_) => "queue_unreachable",
            AppError::ParseError(_) => "parse_error",
            AppError::TemplateError(_) => "template_error",
            AppError::LlmTimeout => "llm_timeout",
            AppError::LlmTransport(_) => "llm_transport",
            AppError::LlmFormat(_) => "llm_format",
            AppError::BrokerRejected(_) => "broker_rejected",
            AppError::BrokerUnreachable(_) => "broker_unreachable",
            AppError::StoreWriteError(_) => "store_write_error",
            AppError::DeadlineExceeded => "deadline_exceeded",
        }
    }

    /// Whether the consumer should route this to `fail` (retriable, operator re-enqueues)
    /// as opposed to folding it into a persisted Skip decision.
    pub fn is_retriable_task_failure(&self) -> bool {
        matches!(
            self,
            AppError::LlmTimeout
                | AppError::LlmTransport(_)
                | AppError::BrokerUnreachable(_)
                | AppError::StoreWriteError(_)
                | AppError::DeadlineExceeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_stable_taxonomy_key() {
        assert_eq!(AppError::LlmTimeout.kind(), "llm_timeout");
        assert_eq!(
            AppError::BrokerRejected("nope".into()).kind(),
            "broker_rejected"
        );
    }

    #[test]
    fn retriable_classification_matches_spec() {
        assert!(AppError::LlmTimeout.is_retriable_task_failure());
        assert!(AppError::DeadlineExceeded.is_retriable_task_failure());
        assert!(!AppError::LlmFormat("x".into()).is_retriable_task_failure());
        assert!(!AppError::BrokerRejected("x".into()).is_retriable_task_failure());
    }
}
