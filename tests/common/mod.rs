use kubetemplater::crd::{
    FieldValidation, KubeTemplate, KubeTemplatePolicy, KubeTemplatePolicySpec, KubeTemplateSpec, TemplateEntry,
    ValidationRule,
};

pub fn configmap_entry(name: &str, namespace: Option<&str>) -> TemplateEntry {
    TemplateEntry {
        object: serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name },
            "data": { "key": "value" }
        }),
        replace: false,
        referenced: false,
        namespace: namespace.map(|s| s.to_string()),
    }
}

pub fn allow_configmaps_rule(target_namespaces: &[&str]) -> ValidationRule {
    ValidationRule {
        group: String::new(),
        version: "v1".to_string(),
        kind: "ConfigMap".to_string(),
        target_namespaces: target_namespaces.iter().map(|s| s.to_string()).collect(),
        cel_expression: None,
        field_validations: Vec::new(),
        message: None,
    }
}

pub fn policy(name: &str, source_namespace: &str, rules: Vec<ValidationRule>) -> KubeTemplatePolicy {
    KubeTemplatePolicy::new(
        name,
        KubeTemplatePolicySpec {
            source_namespace: source_namespace.to_string(),
            rules,
        },
    )
}

pub fn template(name: &str, entries: Vec<TemplateEntry>) -> KubeTemplate {
    KubeTemplate::new(name, KubeTemplateSpec { entries })
}

pub fn required_field_validation(field_path: &str) -> FieldValidation {
    FieldValidation::Required {
        field_path: field_path.to_string(),
        message: None,
    }
}
