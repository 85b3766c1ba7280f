//! Schemaless object trees for embedded template payloads.
//!
//! Template entries carry raw Kubernetes objects whose shape is unknown at
//! compile time, and policy rules address fields inside them by dot path.
//! `serde_json::Value` already models exactly the recursive
//! null/bool/number/string/list/map tree the payloads need, and it's what
//! `kube::core::DynamicObject` itself uses to carry unknown fields — so we
//! build field-path resolution on top of it rather than re-deriving a parallel
//! container type.

use serde_json::Value;

/// A dot-separated path into a decoded object, e.g. `"spec.replicas"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(path: &str) -> Self {
        if path.is_empty() {
            FieldPath(Vec::new())
        } else {
            FieldPath(path.split('.').map(str::to_string).collect())
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// Resolve a dot path against a decoded object tree.
///
/// Returns `None` when any segment of the path is missing. This is distinct
/// from the value existing and being JSON `null`, which resolves to
/// `Some(&Value::Null)`.
pub fn resolve_path<'a>(root: &'a Value, path: &FieldPath) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.segments() {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(items) => current = items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Whether a resolved value counts as "non-empty" for a `required` field
/// validation: present, not null, not an empty string, not an empty
/// array/object.
pub fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

/// Extract an integer from a resolved value for `range` validation.
pub fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64()
}

/// Extract a string from a resolved value for `regex` validation.
pub fn as_str(value: &Value) -> Option<&str> {
    value.as_str()
}

/// Read the `(group, version, kind)` of a decoded object's `apiVersion`/`kind`.
///
/// `apiVersion` is either `"<version>"` (core group) or `"<group>/<version>"`.
pub fn gvk_of(object: &Value) -> Option<(String, String, String)> {
    let api_version = object.get("apiVersion")?.as_str()?;
    let kind = object.get("kind")?.as_str()?.to_string();
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    Some((group, version, kind))
}

/// Read `metadata.namespace` from a decoded object, if set.
pub fn namespace_of(object: &Value) -> Option<&str> {
    object.get("metadata")?.get("namespace")?.as_str()
}

/// Set `metadata.namespace` on a decoded object, creating `metadata` if absent.
pub fn set_namespace(object: &mut Value, namespace: &str) {
    let obj = object
        .as_object_mut()
        .expect("decoded Kubernetes objects are always JSON objects");
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    metadata["namespace"] = Value::String(namespace.to_string());
}

/// Read `metadata.name` from a decoded object.
pub fn name_of(object: &Value) -> Option<&str> {
    object.get("metadata")?.get("name")?.as_str()
}

/// Resolve the namespace an entry's object is validated against and applied
/// into: the entry's explicit `namespace` field, falling back to the
/// embedded object's own `metadata.namespace`, falling back to the parent
/// template's namespace. Every call site that needs an entry's effective
/// namespace must go through this one function, or validation and apply can
/// disagree about which namespace an object actually lands in.
pub fn effective_namespace(entry_namespace: Option<&str>, object: &Value, template_namespace: &str) -> String {
    entry_namespace
        .map(str::to_string)
        .or_else(|| namespace_of(object).map(str::to_string))
        .unwrap_or_else(|| template_namespace.to_string())
}

/// Compare the `spec` subtree of two decoded objects under semantic
/// equivalence. `serde_json::Value`'s `PartialEq` already ignores map key
/// order (it's backed by a map, not an ordered sequence of entries), which is
/// exactly the "ignore benign ordering/defaults churn, compare only `spec`"
/// contract drift detection needs — metadata and status are never touched.
pub fn specs_equivalent(before: &Value, after: &Value) -> bool {
    let before_spec = before.get("spec").cloned().unwrap_or(Value::Null);
    let after_spec = after.get("spec").cloned().unwrap_or(Value::Null);
    before_spec == after_spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_path_walks_nested_objects() {
        let obj = json!({"spec": {"replicas": 3, "template": {"labels": {"app": "x"}}}});
        let path = FieldPath::parse("spec.template.labels.app");
        assert_eq!(resolve_path(&obj, &path), Some(&json!("x")));
    }

    #[test]
    fn resolve_path_missing_segment_is_none() {
        let obj = json!({"spec": {"replicas": 3}});
        let path = FieldPath::parse("spec.nope.deep");
        assert_eq!(resolve_path(&obj, &path), None);
    }

    #[test]
    fn resolve_path_empty_path_returns_root() {
        let obj = json!({"a": 1});
        let path = FieldPath::parse("");
        assert!(path.is_empty());
        assert_eq!(resolve_path(&obj, &path), Some(&obj));
    }

    #[test]
    fn is_non_empty_rules() {
        assert!(!is_non_empty(&Value::Null));
        assert!(!is_non_empty(&json!("")));
        assert!(!is_non_empty(&json!([])));
        assert!(!is_non_empty(&json!({})));
        assert!(is_non_empty(&json!(0)));
        assert!(is_non_empty(&json!(false)));
        assert!(is_non_empty(&json!("x")));
    }

    #[test]
    fn gvk_of_core_group() {
        let obj = json!({"apiVersion": "v1", "kind": "ConfigMap"});
        assert_eq!(
            gvk_of(&obj),
            Some((String::new(), "v1".to_string(), "ConfigMap".to_string()))
        );
    }

    #[test]
    fn gvk_of_named_group() {
        let obj = json!({"apiVersion": "apps/v1", "kind": "Deployment"});
        assert_eq!(
            gvk_of(&obj),
            Some(("apps".to_string(), "v1".to_string(), "Deployment".to_string()))
        );
    }

    #[test]
    fn set_namespace_creates_metadata() {
        let mut obj = json!({"apiVersion": "v1", "kind": "ConfigMap"});
        set_namespace(&mut obj, "team-a");
        assert_eq!(namespace_of(&obj), Some("team-a"));
    }

    #[test]
    fn specs_equivalent_ignores_metadata_and_status() {
        let a = json!({"spec": {"replicas": 3}, "metadata": {"resourceVersion": "1"}});
        let b = json!({"spec": {"replicas": 3}, "metadata": {"resourceVersion": "2"}, "status": {"x": 1}});
        assert!(specs_equivalent(&a, &b));
    }

    #[test]
    fn specs_equivalent_detects_drift() {
        let a = json!({"spec": {"replicas": 3}});
        let b = json!({"spec": {"replicas": 5}});
        assert!(!specs_equivalent(&a, &b));
    }

    #[test]
    fn specs_equivalent_ignores_key_order() {
        let a = json!({"spec": {"a": 1, "b": 2}});
        let b = json!({"spec": {"b": 2, "a": 1}});
        assert!(specs_equivalent(&a, &b));
    }

    #[test]
    fn effective_namespace_prefers_entry_field() {
        let obj = json!({"metadata": {"namespace": "inline-ns"}});
        assert_eq!(effective_namespace(Some("entry-ns"), &obj, "template-ns"), "entry-ns");
    }

    #[test]
    fn effective_namespace_falls_back_to_inline_metadata() {
        let obj = json!({"metadata": {"namespace": "inline-ns"}});
        assert_eq!(effective_namespace(None, &obj, "template-ns"), "inline-ns");
    }

    #[test]
    fn effective_namespace_falls_back_to_template_namespace() {
        let obj = json!({"metadata": {}});
        assert_eq!(effective_namespace(None, &obj, "template-ns"), "template-ns");
    }
}
