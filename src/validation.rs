//! Admission + re-validation logic shared by the webhook handler and the
//! worker pool's per-entry re-validation step (spec.md §4.2, §4.4 step 4i).
//!
//! The webhook runs `validate_entry`, the full ordered pipeline including
//! per-field validations. The worker pool instead runs
//! `revalidate_entry_for_apply`, the narrower GVK/namespace/top-level-CEL
//! check step 4i actually scopes worker-time re-validation to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use serde_json::Value;

use crate::crd::{FieldValidation, KubeTemplatePolicy, TemplateEntry, ValidationRule};
use crate::error::OperatorError;
use crate::value::{self, FieldPath};

/// Template entries at most 50 (spec.md §4.2 step 2).
pub const MAX_ENTRIES: usize = 50;
/// Payload size at most 1 MiB per entry (spec.md §4.2 step 3a).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
/// CEL cost limit (spec.md §4.2). Recorded for the policy surface this crate
/// documents, but not currently enforced: the `cel` crate version this
/// validator runs against is not confirmed to expose a per-evaluation
/// cost/step budget, so only `CEL_TIMEOUT` bounds evaluation today. A known
/// gap, not a silent omission.
pub const CEL_COST_LIMIT: u64 = 1_000_000;
/// CEL wall-clock budget per rule (spec.md §4.2, §5).
pub const CEL_TIMEOUT: Duration = Duration::from_millis(100);

/// A non-fatal observability hint surfaced alongside an allowed admission
/// (spec.md §4.2: "emits warnings (not rejections)").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionWarning {
    pub index: usize,
    pub message: String,
}

/// Memoizes compiled CEL programs (by source text) and compiled regexes (by
/// pattern string) across validator invocations, matching spec.md §4.2's
/// "a fresh program is compiled per rule on first use (cache by rule text)"
/// and "compiled regex patterns are memoized by pattern string".
#[derive(Default)]
pub struct ValidatorCache {
    cel_programs: Mutex<HashMap<String, Arc<cel::Program>>>,
    regexes: Mutex<HashMap<String, Regex>>,
}

impl ValidatorCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn compile_cel(&self, expression: &str) -> Result<Arc<cel::Program>, String> {
        let mut guard = self.cel_programs.lock().expect("cel program cache poisoned");
        if let Some(program) = guard.get(expression) {
            return Ok(Arc::clone(program));
        }
        let program = Arc::new(cel::Program::compile(expression).map_err(|e| e.to_string())?);
        guard.insert(expression.to_string(), Arc::clone(&program));
        Ok(program)
    }

    fn compile_regex(&self, pattern: &str) -> Result<Regex, String> {
        let mut guard = self.regexes.lock().expect("regex cache poisoned");
        if let Some(re) = guard.get(pattern) {
            return Ok(re.clone());
        }
        let re = Regex::new(pattern).map_err(|e| e.to_string())?;
        guard.insert(pattern.to_string(), re.clone());
        Ok(re)
    }
}

fn json_to_cel(value: &Value) -> cel::Value {
    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    match value {
        Value::Null => cel::Value::Null,
        Value::Bool(b) => cel::Value::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                cel::Value::Int(i)
            } else {
                cel::Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => cel::Value::String(Arc::new(s.clone())),
        Value::Array(items) => {
            cel::Value::List(Arc::new(items.iter().map(json_to_cel).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let entries: StdHashMap<cel::objects::Key, cel::Value> = map
                .iter()
                .map(|(k, v)| (cel::objects::Key::String(Arc::new(k.clone())), json_to_cel(v)))
                .collect();
            cel::Value::Map(cel::objects::Map {
                map: Arc::new(entries),
            })
        }
    }
}

/// Evaluate a boolean CEL expression against `object`/`value` bindings,
/// bounded by `CEL_TIMEOUT` (wall-clock only; evaluation is synchronous
/// CPU-bound work run off the async executor via `spawn_blocking`).
/// `CEL_COST_LIMIT` is not enforced here — see the module-level note.
async fn eval_cel_bounded(
    cache: &ValidatorCache,
    expression: &str,
    bind_object: Option<Value>,
    bind_value: Option<Value>,
) -> Result<bool, CelError> {
    let program = cache
        .compile_cel(expression)
        .map_err(CelError::Compile)?;

    let expression = expression.to_string();
    let result = tokio::time::timeout(
        CEL_TIMEOUT,
        tokio::task::spawn_blocking(move || {
            let mut context = cel::Context::default();
            if let Some(obj) = bind_object {
                context
                    .add_variable("object", json_to_cel(&obj))
                    .expect("object binding always converts");
            }
            let value_binding = bind_value.as_ref().map(json_to_cel).unwrap_or(cel::Value::Null);
            context
                .add_variable("value", value_binding)
                .expect("value binding always converts");
            program
                .execute(&context)
                .map_err(|e| e.to_string())
        }),
    )
    .await;

    match result {
        Err(_elapsed) => Err(CelError::Timeout),
        Ok(Err(join_error)) => Err(CelError::Compile(join_error.to_string())),
        Ok(Ok(Err(reason))) => Err(CelError::Eval(reason)),
        Ok(Ok(Ok(cel::Value::Bool(b)))) => Ok(b),
        Ok(Ok(Ok(other))) => Err(CelError::Eval(format!(
            "expression did not evaluate to a bool: {other:?}",
            other = other
        ))),
    }
}

enum CelError {
    Compile(String),
    Eval(String),
    Timeout,
}

/// Locate the rule matching an object's GVK and namespace.
fn match_rule<'a>(
    policy: &'a KubeTemplatePolicy,
    group: &str,
    version: &str,
    kind: &str,
) -> Option<&'a ValidationRule> {
    policy
        .spec
        .rules
        .iter()
        .find(|r| r.group == group && r.version == version && r.kind == kind)
}

/// The outcome of validating one template entry.
pub struct EntryValidation {
    pub warnings: Vec<AdmissionWarning>,
}

/// Run the full ordered, fail-fast admission validation pipeline (spec.md
/// §4.2 steps 1-3) against a single decoded, namespace-defaulted object. For
/// the narrower re-validation worker-time apply runs, see
/// `revalidate_entry_for_apply` below.
///
/// `index` is the entry's position, used to attribute errors.
pub async fn validate_entry(
    cache: &ValidatorCache,
    policy: &KubeTemplatePolicy,
    index: usize,
    entry: &TemplateEntry,
    template_namespace: &str,
) -> Result<EntryValidation, OperatorError> {
    let payload_size = serde_json::to_vec(&entry.object)
        .map(|bytes| bytes.len())
        .unwrap_or(usize::MAX);
    if payload_size > MAX_PAYLOAD_BYTES {
        return Err(OperatorError::PayloadTooLarge {
            index,
            size: payload_size,
            limit: MAX_PAYLOAD_BYTES,
        });
    }

    let mut object = entry.object.clone();
    let effective_namespace = value::effective_namespace(entry.namespace.as_deref(), &object, template_namespace);
    value::set_namespace(&mut object, &effective_namespace);

    let (group, version, kind) = value::gvk_of(&object).ok_or_else(|| OperatorError::GvkNotAllowed {
        index,
        group: String::new(),
        version: String::new(),
        kind: String::new(),
    })?;

    let rule = match_rule(policy, &group, &version, &kind).ok_or_else(|| OperatorError::GvkNotAllowed {
        index,
        group: group.clone(),
        version: version.clone(),
        kind: kind.clone(),
    })?;

    if rule.target_namespaces.is_empty()
        || !rule.target_namespaces.iter().any(|ns| ns == &effective_namespace)
    {
        return Err(OperatorError::NamespaceNotAllowed {
            index,
            namespace: effective_namespace,
        });
    }

    let mut warnings = Vec::new();
    if entry.replace {
        warnings.push(AdmissionWarning {
            index,
            message: "replace=true authorises delete-and-recreate on immutable-field errors"
                .to_string(),
        });
    }

    if let Some(expression) = &rule.cel_expression {
        let ok = eval_cel_bounded(cache, expression, Some(object.clone()), None)
            .await
            .map_err(|e| cel_to_operator_error(e, index, rule))?;
        if !ok {
            return Err(OperatorError::FieldValidationFailed {
                index,
                validation: "cel",
                field_path: String::new(),
                message: rule_message(rule, "object does not satisfy the rule's CEL expression"),
            });
        }
    }

    for field_validation in &rule.field_validations {
        run_field_validation(cache, &object, index, field_validation).await?;
    }

    Ok(EntryValidation { warnings })
}

/// Re-validate a single entry just before applying it (spec.md §4.4 step
/// 4i), scoped to exactly what that step names: GVK allowed, namespace
/// allowed, and the rule's top-level CEL expression. Per-field validations
/// are deliberately not re-run here — an already-admitted, already-queued
/// entry should not start failing apply because a policy edit only touched
/// a field-level rule.
pub async fn revalidate_entry_for_apply(
    cache: &ValidatorCache,
    policy: &KubeTemplatePolicy,
    index: usize,
    entry: &TemplateEntry,
    template_namespace: &str,
) -> Result<(), OperatorError> {
    let mut object = entry.object.clone();
    let effective_namespace = value::effective_namespace(entry.namespace.as_deref(), &object, template_namespace);
    value::set_namespace(&mut object, &effective_namespace);

    let (group, version, kind) = value::gvk_of(&object).ok_or_else(|| OperatorError::GvkNotAllowed {
        index,
        group: String::new(),
        version: String::new(),
        kind: String::new(),
    })?;

    let rule = match_rule(policy, &group, &version, &kind).ok_or_else(|| OperatorError::GvkNotAllowed {
        index,
        group: group.clone(),
        version: version.clone(),
        kind: kind.clone(),
    })?;

    if rule.target_namespaces.is_empty()
        || !rule.target_namespaces.iter().any(|ns| ns == &effective_namespace)
    {
        return Err(OperatorError::NamespaceNotAllowed {
            index,
            namespace: effective_namespace,
        });
    }

    if let Some(expression) = &rule.cel_expression {
        let ok = eval_cel_bounded(cache, expression, Some(object.clone()), None)
            .await
            .map_err(|e| cel_to_operator_error(e, index, rule))?;
        if !ok {
            return Err(OperatorError::FieldValidationFailed {
                index,
                validation: "cel",
                field_path: String::new(),
                message: rule_message(rule, "object does not satisfy the rule's CEL expression"),
            });
        }
    }

    Ok(())
}

fn rule_message(rule: &ValidationRule, default: &str) -> String {
    rule.message.clone().unwrap_or_else(|| default.to_string())
}

fn cel_to_operator_error(err: CelError, index: usize, rule: &ValidationRule) -> OperatorError {
    match err {
        CelError::Timeout => OperatorError::CelTimeout {
            index,
            rule: rule.kind.clone(),
        },
        CelError::Compile(reason) | CelError::Eval(reason) => OperatorError::CelEvaluationFailed {
            index,
            rule: rule.kind.clone(),
            reason,
        },
    }
}

async fn run_field_validation(
    cache: &ValidatorCache,
    object: &Value,
    index: usize,
    validation: &FieldValidation,
) -> Result<(), OperatorError> {
    match validation {
        FieldValidation::Cel {
            field_path,
            expression,
            message,
        } => {
            let path = FieldPath::parse(field_path);
            let (bind_object, bind_value) = if path.is_empty() {
                (Some(object.clone()), None)
            } else {
                let resolved = value::resolve_path(object, &path).cloned().unwrap_or(Value::Null);
                (None, Some(resolved))
            };
            let program = cache.compile_cel(expression);
            if let Err(reason) = program {
                return Err(OperatorError::CelEvaluationFailed {
                    index,
                    rule: field_path.clone(),
                    reason,
                });
            }
            let ok = eval_cel_bounded(cache, expression, bind_object, bind_value)
                .await
                .map_err(|e| match e {
                    CelError::Timeout => OperatorError::CelTimeout {
                        index,
                        rule: field_path.clone(),
                    },
                    CelError::Compile(reason) | CelError::Eval(reason) => {
                        OperatorError::CelEvaluationFailed {
                            index,
                            rule: field_path.clone(),
                            reason,
                        }
                    }
                })?;
            if !ok {
                return Err(OperatorError::FieldValidationFailed {
                    index,
                    validation: "cel",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} failed CEL check")),
                });
            }
            Ok(())
        }
        FieldValidation::Regex {
            field_path,
            pattern,
            message,
        } => {
            let path = FieldPath::parse(field_path);
            let resolved = value::resolve_path(object, &path).and_then(value::as_str).ok_or_else(|| {
                OperatorError::FieldValidationFailed {
                    index,
                    validation: "regex",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} is not a string")),
                }
            })?;
            let re = cache.compile_regex(pattern).map_err(|reason| {
                OperatorError::FieldValidationFailed {
                    index,
                    validation: "regex",
                    field_path: field_path.clone(),
                    message: format!("invalid pattern: {reason}"),
                }
            })?;
            if !re.is_match(resolved) {
                return Err(OperatorError::FieldValidationFailed {
                    index,
                    validation: "regex",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} does not match {pattern}")),
                });
            }
            Ok(())
        }
        FieldValidation::Range {
            field_path,
            min,
            max,
            message,
        } => {
            let path = FieldPath::parse(field_path);
            let resolved = value::resolve_path(object, &path).and_then(value::as_i64).ok_or_else(|| {
                OperatorError::FieldValidationFailed {
                    index,
                    validation: "range",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} is not an integer")),
                }
            })?;
            let below_min = min.is_some_and(|m| resolved < m);
            let above_max = max.is_some_and(|m| resolved > m);
            if below_min || above_max {
                return Err(OperatorError::FieldValidationFailed {
                    index,
                    validation: "range",
                    field_path: field_path.clone(),
                    message: message.clone().unwrap_or_else(|| {
                        format!("{field_path}={resolved} is outside [{min:?}, {max:?}]")
                    }),
                });
            }
            Ok(())
        }
        FieldValidation::Required { field_path, message } => {
            let path = FieldPath::parse(field_path);
            let ok = value::resolve_path(object, &path)
                .map(value::is_non_empty)
                .unwrap_or(false);
            if !ok {
                return Err(OperatorError::FieldValidationFailed {
                    index,
                    validation: "required",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} is required")),
                });
            }
            Ok(())
        }
        FieldValidation::Forbidden { field_path, message } => {
            let path = FieldPath::parse(field_path);
            if value::resolve_path(object, &path).is_some() {
                return Err(OperatorError::FieldValidationFailed {
                    index,
                    validation: "forbidden",
                    field_path: field_path.clone(),
                    message: message
                        .clone()
                        .unwrap_or_else(|| format!("{field_path} is forbidden")),
                });
            }
            Ok(())
        }
    }
}

/// Validate an entire `KubeTemplate` spec against the resolved policy,
/// ordered and fail-fast (spec.md §4.2 steps 2-3). Returns accumulated
/// warnings on success.
pub async fn validate_entries(
    cache: &ValidatorCache,
    policy: &KubeTemplatePolicy,
    entries: &[TemplateEntry],
    template_namespace: &str,
) -> Result<Vec<AdmissionWarning>, OperatorError> {
    if entries.len() > MAX_ENTRIES {
        return Err(OperatorError::EntryCountExceeded {
            count: entries.len(),
            limit: MAX_ENTRIES,
        });
    }

    let mut warnings = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let result = validate_entry(cache, policy, index, entry, template_namespace).await?;
        warnings.extend(result.warnings);
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KubeTemplatePolicySpec, ValidationRule};
    use serde_json::json;

    fn configmap_policy(target_ns: &str) -> KubeTemplatePolicy {
        KubeTemplatePolicy::new(
            "p",
            KubeTemplatePolicySpec {
                source_namespace: target_ns.to_string(),
                rules: vec![ValidationRule {
                    group: String::new(),
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    target_namespaces: vec![target_ns.to_string()],
                    cel_expression: None,
                    field_validations: Vec::new(),
                    message: None,
                }],
            },
        )
    }

    fn entry(object: Value) -> TemplateEntry {
        TemplateEntry {
            object,
            replace: false,
            referenced: false,
            namespace: None,
        }
    }

    #[tokio::test]
    async fn allows_matching_gvk_and_namespace() {
        let policy = configmap_policy("default");
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        let result = validate_entry(&cache, &policy, 0, &e, "default").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_unmatched_gvk() {
        let policy = configmap_policy("default");
        let e = entry(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s1"}}));
        let cache = ValidatorCache::new();
        let err = validate_entry(&cache, &policy, 0, &e, "default").await.unwrap_err();
        assert!(matches!(err, OperatorError::GvkNotAllowed { .. }));
        assert!(err.to_string().contains("Secret"));
    }

    #[tokio::test]
    async fn rejects_namespace_outside_target_list() {
        let policy = configmap_policy("default");
        let e = entry(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c1", "namespace": "other"}
        }));
        let cache = ValidatorCache::new();
        let err = validate_entry(&cache, &policy, 0, &e, "default").await.unwrap_err();
        assert!(matches!(err, OperatorError::NamespaceNotAllowed { .. }));
    }

    #[tokio::test]
    async fn defaults_namespace_to_template_namespace() {
        let policy = configmap_policy("team-a");
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        let result = validate_entry(&cache, &policy, 0, &e, "team-a").await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn entry_count_limit_enforced() {
        let policy = configmap_policy("default");
        let entries: Vec<TemplateEntry> = (0..51)
            .map(|i| entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": format!("c{i}")}})))
            .collect();
        let cache = ValidatorCache::new();
        let err = validate_entries(&cache, &policy, &entries, "default").await.unwrap_err();
        assert!(matches!(err, OperatorError::EntryCountExceeded { .. }));
    }

    #[tokio::test]
    async fn payload_size_limit_enforced() {
        let policy = configmap_policy("default");
        let big_value = "x".repeat(MAX_PAYLOAD_BYTES + 1);
        let e = entry(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c1"}, "data": {"blob": big_value}
        }));
        let cache = ValidatorCache::new();
        let err = validate_entry(&cache, &policy, 0, &e, "default").await.unwrap_err();
        assert!(matches!(err, OperatorError::PayloadTooLarge { .. }));
    }

    #[tokio::test]
    async fn range_validation_rejects_out_of_bounds() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].kind = "Deployment".into();
        policy.spec.rules[0].field_validations.push(FieldValidation::Range {
            field_path: "spec.replicas".into(),
            min: Some(1),
            max: Some(10),
            message: Some("replicas out of range".into()),
        });
        let e = entry(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": {"name": "d1"}, "spec": {"replicas": 20}
        }));
        // group mismatch deliberately fixed below
        policy.spec.rules[0].group = "apps".into();
        let cache = ValidatorCache::new();
        let err = validate_entry(&cache, &policy, 0, &e, "default").await.unwrap_err();
        match err {
            OperatorError::FieldValidationFailed { message, .. } => {
                assert_eq!(message, "replicas out of range");
            }
            other => panic!("expected field validation failure, got {other:?}", other = other.to_string()),
        }
    }

    #[tokio::test]
    async fn required_validation_passes_when_present() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0]
            .field_validations
            .push(FieldValidation::Required {
                field_path: "metadata.name".into(),
                message: None,
            });
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_ok());
    }

    #[tokio::test]
    async fn forbidden_validation_rejects_present_field() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0]
            .field_validations
            .push(FieldValidation::Forbidden {
                field_path: "metadata.labels.restricted".into(),
                message: None,
            });
        let e = entry(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c1", "labels": {"restricted": "true"}}
        }));
        let cache = ValidatorCache::new();
        let err = validate_entry(&cache, &policy, 0, &e, "default").await.unwrap_err();
        assert!(matches!(err, OperatorError::FieldValidationFailed { validation: "forbidden", .. }));
    }

    #[tokio::test]
    async fn regex_validation_matches_pattern() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].field_validations.push(FieldValidation::Regex {
            field_path: "metadata.name".into(),
            pattern: "^c-[a-z]+$".into(),
            message: None,
        });
        let ok_entry = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c-abc"}}));
        let bad_entry = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "XYZ"}}));
        let cache = ValidatorCache::new();
        assert!(validate_entry(&cache, &policy, 0, &ok_entry, "default").await.is_ok());
        assert!(validate_entry(&cache, &policy, 0, &bad_entry, "default").await.is_err());
    }

    #[tokio::test]
    async fn cel_rule_expression_evaluated_against_whole_object() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].cel_expression = Some("object.kind == \"ConfigMap\"".into());
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_ok());
    }

    #[tokio::test]
    async fn cel_field_validation_binds_resolved_value() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].field_validations.push(FieldValidation::Cel {
            field_path: "metadata.name".into(),
            expression: "value == \"c1\"".into(),
            message: None,
        });
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_ok());
    }

    #[tokio::test]
    async fn cel_field_validation_missing_field_binds_null() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].field_validations.push(FieldValidation::Cel {
            field_path: "metadata.missing".into(),
            expression: "value == null".into(),
            message: None,
        });
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();
        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_ok());
    }

    #[tokio::test]
    async fn replace_flag_produces_a_warning_not_a_rejection() {
        let policy = configmap_policy("default");
        let mut e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        e.replace = true;
        let cache = ValidatorCache::new();
        let result = validate_entries(&cache, &policy, std::slice::from_ref(&e), "default")
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].index, 0);
    }

    #[tokio::test]
    async fn regex_cache_reuses_compiled_pattern() {
        let cache = ValidatorCache::new();
        let re1 = cache.compile_regex("^a+$").unwrap();
        let re2 = cache.compile_regex("^a+$").unwrap();
        assert_eq!(re1.as_str(), re2.as_str());
        assert_eq!(cache.regexes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_time_revalidation_ignores_field_validations() {
        let mut policy = configmap_policy("default");
        // A field validation that the entry below would fail at admission
        // time; worker-time re-validation must not re-run it.
        policy.spec.rules[0]
            .field_validations
            .push(FieldValidation::Required {
                field_path: "metadata.labels.team".into(),
                message: None,
            });
        let e = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        let cache = ValidatorCache::new();

        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_err());
        assert!(revalidate_entry_for_apply(&cache, &policy, 0, &e, "default").await.is_ok());
    }

    #[tokio::test]
    async fn worker_time_revalidation_still_enforces_gvk_namespace_and_top_level_cel() {
        let mut policy = configmap_policy("default");
        policy.spec.rules[0].cel_expression = Some("object.kind == \"ConfigMap\"".into());
        let cache = ValidatorCache::new();

        let wrong_kind = entry(json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "s1"}}));
        assert!(matches!(
            revalidate_entry_for_apply(&cache, &policy, 0, &wrong_kind, "default")
                .await
                .unwrap_err(),
            OperatorError::GvkNotAllowed { .. }
        ));

        let wrong_ns = entry(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c1", "namespace": "other"}
        }));
        assert!(matches!(
            revalidate_entry_for_apply(&cache, &policy, 0, &wrong_ns, "default")
                .await
                .unwrap_err(),
            OperatorError::NamespaceNotAllowed { .. }
        ));

        let ok = entry(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c1"}}));
        assert!(revalidate_entry_for_apply(&cache, &policy, 0, &ok, "default").await.is_ok());
    }

    #[tokio::test]
    async fn effective_namespace_for_validation_falls_back_to_inline_metadata() {
        let policy = configmap_policy("team-a");
        let e = entry(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "c1", "namespace": "team-a"}
        }));
        let cache = ValidatorCache::new();
        // template_namespace is deliberately wrong here ("default"); only the
        // inline metadata.namespace should decide the effective namespace.
        assert!(validate_entry(&cache, &policy, 0, &e, "default").await.is_ok());
    }
}
