use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/* ============================= SHARED ENUMS ============================= */

/// Lifecycle phase of a `KubeTemplate`'s reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ProcessingPhase {
    /// No status yet recorded — not the same as `Queued`.
    #[default]
    #[serde(rename = "")]
    Empty,
    Queued,
    Processing,
    Completed,
    Failed,
    Paused,
}

/* ============================= TEMPLATE ENTRY ============================= */

/// A single embedded object inside a `KubeTemplate`'s spec.
///
/// The payload is an opaque Kubernetes object with preserved unknown fields;
/// it is decoded and validated lazily by the admission validator and worker
/// pool rather than typed against a known schema.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateEntry {
    /// The raw Kubernetes object payload, literal (never variable-rendered).
    pub object: Value,

    /// Authorises delete-and-recreate when server-side apply reports an
    /// immutable-field conflict.
    #[serde(default)]
    pub replace: bool,

    /// Requests owner-reference linkage to the parent `KubeTemplate`. Only
    /// honored for same-namespace payloads; cross-namespace owner references
    /// are forbidden by Kubernetes and silently skipped.
    #[serde(default)]
    pub referenced: bool,

    /// Explicit target namespace. Defaults to the `KubeTemplate`'s own
    /// namespace when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/* ============================= KUBETEMPLATE ============================= */

/// `KubeTemplate` — a user-owned "template of templates": an ordered list of
/// literal Kubernetes object payloads that the operator applies and keeps
/// reconciled against namespace-scoped policy.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "kubetemplater.io",
    version = "v1alpha1",
    kind = "KubeTemplate",
    plural = "kubetemplates",
    status = "KubeTemplateStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplateSpec {
    /// Ordered template entries. At most 50, enforced at admission time.
    #[serde(default)]
    pub entries: Vec<TemplateEntry>,
}

/// `KubeTemplate.status` — updated by the template reconciler and workers via
/// read-modify-write with conflict retries (§4.4).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplateStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_phase: Option<ProcessingPhase>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_cycle: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_total: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources_synced: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drift_detection_count: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_detected: Option<String>,

    /// SHA-256 hex digest of the canonicalised spec last successfully applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dry_run_checks: Option<u32>,
}

/* ============================= FIELD VALIDATIONS ============================= */

/// The exhaustive set of field-validation kinds a policy rule can attach.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FieldValidation {
    /// Evaluate a boolean CEL expression. Whole object bound to `object` when
    /// `field_path` is empty; otherwise the resolved value is bound to
    /// `value` (dyn typed, `null` when missing).
    Cel {
        #[serde(default)]
        field_path: String,
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// `field_path` must resolve to a string matching `pattern`.
    Regex {
        field_path: String,
        pattern: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// `field_path` must resolve to an integer within `[min, max]`.
    Range {
        field_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// `field_path` must exist and be non-empty.
    Required {
        field_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// `field_path` must not exist.
    Forbidden {
        field_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl FieldValidation {
    pub fn name(&self) -> &'static str {
        match self {
            FieldValidation::Cel { .. } => "cel",
            FieldValidation::Regex { .. } => "regex",
            FieldValidation::Range { .. } => "range",
            FieldValidation::Required { .. } => "required",
            FieldValidation::Forbidden { .. } => "forbidden",
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            FieldValidation::Cel { message, .. }
            | FieldValidation::Regex { message, .. }
            | FieldValidation::Range { message, .. }
            | FieldValidation::Required { message, .. }
            | FieldValidation::Forbidden { message, .. } => message.as_deref(),
        }
    }
}

/// A single GVK-scoped validation rule inside a `KubeTemplatePolicy`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationRule {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,

    /// Namespaces a matching object's effective namespace must belong to.
    #[serde(default)]
    pub target_namespaces: Vec<String>,

    /// Optional CEL expression evaluated against the whole object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel_expression: Option<String>,

    #[serde(default)]
    pub field_validations: Vec<FieldValidation>,

    /// Override message used in rejection errors attributed to this rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/* ============================= KUBETEMPLATEPOLICY ============================= */

/// `KubeTemplatePolicy` — operator-namespace-scoped policy governing which
/// object shapes a `KubeTemplate` in a given source namespace may embed.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubetemplater.io",
    version = "v1alpha1",
    kind = "KubeTemplatePolicy",
    plural = "kubetemplatepolicies",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubeTemplatePolicySpec {
    pub source_namespace: String,
    #[serde(default)]
    pub rules: Vec<ValidationRule>,
}

/* ============================= TESTS ============================= */
