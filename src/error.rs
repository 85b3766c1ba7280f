//! Typed errors for the reconciliation engine's library surface.
//!
//! Command-layer code (the CLI binary) wraps these in `anyhow::Result` with
//! `.context(...)` at each call site, the way `commands/*.rs` does in the
//! reference operator this crate is built from. The typed variants here exist
//! so callers that need to distinguish user error from transient failure
//! (the admission handler, the worker pool's retry logic) can match on them
//! instead of parsing strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("no KubeTemplatePolicy found for source namespace {0}")]
    PolicyNotFound(String),

    #[error("multiple KubeTemplatePolicy resources match source namespace {0}")]
    PolicyAmbiguous(String),

    #[error("template has {count} entries, exceeding the limit of {limit}")]
    EntryCountExceeded { count: usize, limit: usize },

    #[error("entry {index}: payload is {size} bytes, exceeding the limit of {limit} bytes")]
    PayloadTooLarge {
        index: usize,
        size: usize,
        limit: usize,
    },

    #[error("entry {index}: payload could not be decoded: {source}")]
    DecodeFailed {
        index: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("entry {index}: resource type {group}/{version},Kind={kind} is not allowed")]
    GvkNotAllowed {
        index: usize,
        group: String,
        version: String,
        kind: String,
    },

    #[error("entry {index}: namespace {namespace} is not permitted by the matched rule")]
    NamespaceNotAllowed { index: usize, namespace: String },

    #[error("entry {index}: rule {rule}: CEL evaluation failed: {reason}")]
    CelEvaluationFailed {
        index: usize,
        rule: String,
        reason: String,
    },

    #[error("entry {index}: rule {rule}: CEL evaluation exceeded the time or cost budget")]
    CelTimeout { index: usize, rule: String },

    #[error("entry {index}: field validation '{validation}' failed on {field_path}: {message}")]
    FieldValidationFailed {
        index: usize,
        validation: &'static str,
        field_path: String,
        message: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("server-side apply failed: {0}")]
    Apply(#[source] kube::Error),

    #[error("status update conflict exhausted {attempts} retries")]
    StatusConflictExhausted { attempts: u32 },

    #[error("certificate operation failed: {0}")]
    Cert(String),
}

impl OperatorError {
    /// Whether this error represents a user-fixable policy/validation
    /// problem (admission should deny) as opposed to a transient API failure
    /// (a worker should requeue), per spec.md §7's error-kind table.
    pub fn is_policy_violation(&self) -> bool {
        matches!(
            self,
            OperatorError::PolicyNotFound(_)
                | OperatorError::PolicyAmbiguous(_)
                | OperatorError::EntryCountExceeded { .. }
                | OperatorError::PayloadTooLarge { .. }
                | OperatorError::DecodeFailed { .. }
                | OperatorError::GvkNotAllowed { .. }
                | OperatorError::NamespaceNotAllowed { .. }
                | OperatorError::CelEvaluationFailed { .. }
                | OperatorError::CelTimeout { .. }
                | OperatorError::FieldValidationFailed { .. }
        )
    }

    /// Whether the underlying Kubernetes API error is a conflict (409),
    /// which the status-update read-modify-write loop retries.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(kube::Error::Api(r)) if r.code == 409
        ) || matches!(
            self,
            OperatorError::Apply(kube::Error::Api(r)) if r.code == 409
        )
    }

    /// Whether the underlying Kubernetes API error is not-found (404).
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            OperatorError::Kube(kube::Error::Api(r)) if r.code == 404
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_errors_are_policy_violations() {
        assert!(OperatorError::PolicyNotFound("x".into()).is_policy_violation());
        assert!(OperatorError::PolicyAmbiguous("x".into()).is_policy_violation());
    }

    #[test]
    fn kube_error_is_not_a_policy_violation() {
        let err = OperatorError::Kube(kube::Error::LinesCodecMaxLineLengthExceeded);
        assert!(!err.is_policy_violation());
    }

    #[test]
    fn messages_include_entry_index() {
        let err = OperatorError::GvkNotAllowed {
            index: 2,
            group: "".into(),
            version: "v1".into(),
            kind: "Secret".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("entry 2"));
        assert!(msg.contains("Secret"));
    }
}
