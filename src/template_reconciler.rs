//! Template reconciler (spec.md §4.5). Watches `KubeTemplate` and keeps the
//! reconcile function itself cheap — it never performs apply directly
//! except on the drift-detection path, which bypasses the work queue
//! entirely so retry state isn't churned by routine drift checks.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::{KubeTemplate, KubeTemplateStatus, ProcessingPhase};
use crate::queue::WorkQueue;
use crate::value;
use crate::worker;

pub const ANNOTATION_RESUME: &str = "kubetemplater.io/resume";

pub struct ReconcilerContext {
    pub client: Client,
    pub queue: Arc<WorkQueue>,
    pub periodic_interval: Duration,
}

/// Event filter (spec.md §4.5, §9): updates whose only change is `status`
/// must not re-trigger reconciliation, or the worker's own status writes
/// loop forever. `kube::runtime::watcher`'s default predicate already dedups
/// on `resourceVersion`, which still changes on status-only writes, so this
/// predicate additionally requires the non-status fields to actually differ.
pub fn is_status_only_change(old: &KubeTemplate, new: &KubeTemplate) -> bool {
    old.metadata.generation == new.metadata.generation
        && old.spec == new.spec
        && old.metadata.labels == new.metadata.labels
        && old.metadata.annotations == new.metadata.annotations
        && old.metadata.finalizers == new.metadata.finalizers
        && old.status != new.status
}

pub async fn reconcile(
    template: Arc<KubeTemplate>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, kube::Error> {
    let name = template.name_any();
    let namespace = template.namespace().unwrap_or_default();
    let templates: Api<KubeTemplate> = Api::namespaced(ctx.client.clone(), &namespace);

    let phase = template
        .status
        .as_ref()
        .and_then(|s| s.processing_phase.clone())
        .unwrap_or_default();

    match phase {
        ProcessingPhase::Empty => {
            info!(namespace = %namespace, name = %name, "reconcile_queued");
            worker::update_status(&templates, &name, |status| {
                status.processing_phase = Some(ProcessingPhase::Queued);
                status.queued_at = Some(now_rfc3339());
                status.processed_at = None;
                status.retry_count = None;
            })
            .await
            .map_err(|e| kube::Error::Service(Box::new(e)))?;
            ctx.queue.enqueue((namespace, name), 0);
            Ok(Action::await_change())
        }
        ProcessingPhase::Paused => {
            let resume_requested = template
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_RESUME))
                .map(|v| v == "true")
                .unwrap_or(false);

            if resume_requested {
                info!(namespace = %namespace, name = %name, "reconcile_resumed");
                worker::update_status(&templates, &name, |status| {
                    status.processing_phase = Some(ProcessingPhase::Queued);
                    status.paused_reason = None;
                    status.paused_at = None;
                    status.retry_cycle = Some(0);
                })
                .await
                .map_err(|e| kube::Error::Service(Box::new(e)))?;
                ctx.queue.resume(&(namespace, name), 0);
            }
            Ok(Action::await_change())
        }
        ProcessingPhase::Completed => {
            reconcile_completed(&template, &templates, &ctx, &namespace, &name).await
        }
        _ => {
            ctx.queue.enqueue((namespace, name), 0);
            Ok(Action::requeue(ctx.periodic_interval))
        }
    }
}

async fn reconcile_completed(
    template: &KubeTemplate,
    templates: &Api<KubeTemplate>,
    ctx: &ReconcilerContext,
    namespace: &str,
    name: &str,
) -> Result<Action, kube::Error> {
    let id = (namespace.to_string(), name.to_string());
    if ctx.queue.contains(&id) {
        return Ok(Action::requeue(ctx.periodic_interval));
    }

    let debounce = ctx.periodic_interval / 2;
    if let Some(last) = template.status.as_ref().and_then(|s| s.last_reconcile_time.as_ref()) {
        if let Ok(last_time) = chrono::DateTime::parse_from_rfc3339(last) {
            let elapsed = chrono::Utc::now().signed_duration_since(last_time);
            if elapsed < chrono::Duration::from_std(debounce).unwrap_or_default() {
                return Ok(Action::requeue(ctx.periodic_interval));
            }
        }
    }

    let mut drifted = false;
    for entry in &template.spec.entries {
        let mut object = entry.object.clone();
        let effective_namespace = value::effective_namespace(entry.namespace.as_deref(), &object, namespace);
        value::set_namespace(&mut object, &effective_namespace);

        let before = object.clone();

        match worker::apply_entry(&ctx.client, &object, false).await {
            Ok(()) => {}
            Err(e) => {
                warn!(namespace, name, error = %e, "drift_check_apply_failed");
                continue;
            }
        }

        if let Some((group, version, kind)) = value::gvk_of(&object) {
            let live = fetch_live(
                &ctx.client,
                &group,
                &version,
                &kind,
                &effective_namespace,
                value::name_of(&object).unwrap_or_default(),
            )
            .await;
            if let Ok(Some(live)) = live {
                if !value::specs_equivalent(&before, &live) {
                    drifted = true;
                }
            }
        }
    }

    worker::update_status(templates, name, |status| {
        status.last_reconcile_time = Some(now_rfc3339());
        if drifted {
            status.drift_detection_count = Some(status.drift_detection_count.unwrap_or(0) + 1);
            status.last_drift_detected = Some(now_rfc3339());
        }
    })
    .await
    .map_err(|e| kube::Error::Service(Box::new(e)))?;

    if drifted {
        info!(namespace, name, "drift_corrected");
    }

    Ok(Action::requeue(ctx.periodic_interval))
}

async fn fetch_live(
    client: &Client,
    group: &str,
    version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> Result<Option<serde_json::Value>, kube::Error> {
    use kube::api::{ApiResource, DynamicObject, GroupVersionKind};

    let gvk = GroupVersionKind::gvk(group, version, kind);
    let ar = ApiResource::from_gvk(&gvk);
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, &ar);
    match api.get(name).await {
        Ok(obj) => Ok(serde_json::to_value(obj).ok()),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(e),
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

pub fn error_policy(
    _template: Arc<KubeTemplate>,
    error: &kube::Error,
    _ctx: Arc<ReconcilerContext>,
) -> Action {
    warn!(error = %error, "template_reconcile_error");
    Action::requeue(Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{KubeTemplateSpec, TemplateEntry};
    use serde_json::json;

    fn template_with(spec: KubeTemplateSpec, status: Option<KubeTemplateStatus>) -> KubeTemplate {
        let mut t = KubeTemplate::new("t1", spec);
        t.status = status;
        t.metadata.generation = Some(1);
        t
    }

    #[test]
    fn status_only_change_is_detected() {
        let spec = KubeTemplateSpec {
            entries: vec![TemplateEntry {
                object: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                replace: false,
                referenced: false,
                namespace: None,
            }],
        };
        let old = template_with(spec.clone(), None);
        let mut new = template_with(spec, Some(KubeTemplateStatus::default()));
        new.metadata.generation = old.metadata.generation;
        assert!(is_status_only_change(&old, &new));
    }

    #[test]
    fn spec_change_is_not_status_only() {
        let old = template_with(
            KubeTemplateSpec { entries: vec![] },
            None,
        );
        let mut new = template_with(
            KubeTemplateSpec {
                entries: vec![TemplateEntry {
                    object: json!({"apiVersion": "v1", "kind": "ConfigMap"}),
                    replace: false,
                    referenced: false,
                    namespace: None,
                }],
            },
            None,
        );
        new.metadata.generation = old.metadata.generation;
        assert!(!is_status_only_change(&old, &new));
    }
}
