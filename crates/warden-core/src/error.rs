//! Error types shared across the Warden engine.
//!
//! Two families exist: `PolicyError` for failures surfaced by the policy
//! pipeline (validation, execution, resource limits) and `CloudError` for
//! failures raised at the cloud-client boundary. Only
//! `CloudError::Transient` is ever retried.

use std::fmt;
use thiserror::Error;

/// A single structural problem found while validating a policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Path into the document, e.g. `policies[3].filters[2].op`.
    pub path: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Errors surfaced by the policy pipeline.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Schema or semantic errors in the policy input. Carries every issue
    /// found, not just the first.
    #[error("policy validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Runtime failure that aborts the current policy but not its siblings.
    #[error("policy execution failed: {0}")]
    Execution(String),

    /// The enumerated resource count exceeded the policy's `max-resources`
    /// guard.
    #[error("policy {policy} matched {count} resources, limit is {limit}")]
    ResourceLimit {
        policy: String,
        count: usize,
        limit: usize,
    },

    /// A cloud-client failure escalated out of the pipeline.
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

impl PolicyError {
    /// Shorthand for a single-issue validation error without a path.
    pub fn invalid(message: impl Into<String>) -> Self {
        PolicyError::Validation(vec![ValidationIssue::new("", message)])
    }

    pub fn execution(message: impl Into<String>) -> Self {
        PolicyError::Execution(message.into())
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors raised at the cloud-client boundary.
#[derive(Debug, Clone, Error)]
pub enum CloudError {
    /// Throttling, rate limits, 5xx. Retried with exponential backoff.
    #[error("transient cloud error in {operation}: {message}")]
    Transient { operation: String, message: String },

    /// Auth failures, validation rejections. Never retried; escalated as a
    /// `PolicyError::Execution`.
    #[error("cloud error in {operation}: {message}")]
    Permanent { operation: String, message: String },

    /// Lookup of a specific resource id came back empty. During event
    /// resolution this is logged and treated as an empty result.
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl CloudError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Transient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        CloudError::Permanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// True when a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CloudError::Transient { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_lists_every_issue() {
        let err = PolicyError::Validation(vec![
            ValidationIssue::new("policies[0].name", "missing"),
            ValidationIssue::new("policies[1].filters[2]", "unknown filter"),
        ]);
        let text = err.to_string();
        assert!(text.contains("policies[0].name: missing"));
        assert!(text.contains("policies[1].filters[2]: unknown filter"));
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(CloudError::transient("ec2.DescribeInstances", "throttled").is_retryable());
        assert!(!CloudError::permanent("ec2.DescribeInstances", "denied").is_retryable());
        assert!(!CloudError::NotFound("i-123".into()).is_retryable());
    }
}
