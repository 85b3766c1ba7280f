//! Semantic equivalence and spec hashing (P5, P6): drift is measured only
//! over the `spec` subtree, under a comparison that ignores key ordering,
//! and the applied-spec hash is stable under the same reordering.

use kubetemplater::value;
use kubetemplater::worker::spec_hash;

#[test]
fn reordering_keys_outside_spec_does_not_register_as_drift() {
    let before = serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": "cfg", "namespace": "team-a" },
        "spec": { "replicas": 3, "image": "nginx:1.25" }
    });
    let after = serde_json::json!({
        "kind": "ConfigMap",
        "apiVersion": "v1",
        "spec": { "image": "nginx:1.25", "replicas": 3 },
        "metadata": { "namespace": "team-a", "name": "cfg" }
    });

    assert!(value::specs_equivalent(&before, &after));
}

#[test]
fn a_changed_spec_field_registers_as_drift() {
    let before = serde_json::json!({ "spec": { "replicas": 3 } });
    let after = serde_json::json!({ "spec": { "replicas": 5 } });

    assert!(!value::specs_equivalent(&before, &after));
}

#[test]
fn a_status_only_change_outside_spec_does_not_register_as_drift() {
    let before = serde_json::json!({
        "spec": { "replicas": 3 },
        "status": { "readyReplicas": 0 }
    });
    let after = serde_json::json!({
        "spec": { "replicas": 3 },
        "status": { "readyReplicas": 3 }
    });

    assert!(value::specs_equivalent(&before, &after));
}

#[test]
fn spec_hash_is_stable_under_key_reordering() {
    let a = serde_json::json!({ "a": 1, "b": { "c": 2, "d": 3 } });
    let b = serde_json::json!({ "b": { "d": 3, "c": 2 }, "a": 1 });

    assert_eq!(spec_hash(&a), spec_hash(&b));
}

#[test]
fn spec_hash_changes_when_a_value_changes() {
    let a = serde_json::json!({ "replicas": 3 });
    let b = serde_json::json!({ "replicas": 4 });

    assert_ne!(spec_hash(&a), spec_hash(&b));
}
