//! Worker pool processing (spec.md §4.4).
//!
//! Each worker dequeues a `(namespace, name)` identity, fetches the current
//! `KubeTemplate`, re-validates every entry against the cached policy, and
//! applies each entry's object with server-side apply under the
//! `kubetemplater` field manager, forcing ownership of the fields it
//! asserts. Status transitions (`Processing` → `Completed`/`Failed`/`Paused`)
//! go through a conflict-tolerant read-modify-write helper shared with the
//! template reconciler's drift-correction path.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use kube::api::ListParams;

use crate::crd::{KubeTemplate, KubeTemplatePolicy, ProcessingPhase};
use crate::error::OperatorError;
use crate::policy_cache::{CacheLookup, PolicyCache, PolicySource};
use crate::validation::{self, ValidatorCache};
use crate::value;

/// Live-cluster `PolicySource`: lists every `KubeTemplatePolicy` in the
/// operator's own namespace and filters client-side by `sourceNamespace`
/// (spec.md §4.1, §4.6 — policies are few enough per install that a list
/// scan beats maintaining a field indexer for this).
pub struct KubePolicySource {
    client: Client,
    operator_namespace: String,
}

impl KubePolicySource {
    pub fn new(client: Client, operator_namespace: String) -> Self {
        KubePolicySource {
            client,
            operator_namespace,
        }
    }
}

#[async_trait::async_trait]
impl PolicySource for KubePolicySource {
    async fn lookup(&self, source_namespace: &str) -> Result<Vec<KubeTemplatePolicy>, OperatorError> {
        let policies: Api<KubeTemplatePolicy> =
            Api::namespaced(self.client.clone(), &self.operator_namespace);
        let list = policies.list(&ListParams::default()).await.map_err(OperatorError::Kube)?;
        Ok(list
            .items
            .into_iter()
            .filter(|p| p.spec.source_namespace == source_namespace)
            .collect())
    }
}

pub const FIELD_MANAGER: &str = "kubetemplater";
pub const LABEL_TEMPLATE_NAME: &str = "kubetemplater.io/template-name";
pub const LABEL_TEMPLATE_NAMESPACE: &str = "kubetemplater.io/template-namespace";
pub const ANNOTATION_RESUME: &str = "kubetemplater.io/resume";
pub const ANNOTATION_REPLACE_ENABLED: &str = "kubetemplater.io/replace-enabled";

/// Maximum read-modify-write attempts on a status update conflict
/// (spec.md §4.4, §7).
pub const STATUS_UPDATE_MAX_ATTEMPTS: u32 = 3;

/// Outcome of processing one work item end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The `KubeTemplate` no longer exists; dropped silently.
    NotFound,
    Completed { resources_synced: u32 },
    Failed { reason: String },
}

fn api_resource_for(group: &str, version: &str, kind: &str) -> ApiResource {
    let gvk = GroupVersionKind::gvk(group, version, kind);
    ApiResource::from_gvk(&gvk)
}

/// Stamp the two template-tracking labels onto a decoded object
/// (spec.md §4.4 step 4ii).
fn stamp_labels(object: &mut serde_json::Value, template_name: &str, template_namespace: &str) {
    let obj = object
        .as_object_mut()
        .expect("decoded Kubernetes objects are always JSON objects");
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    let labels = metadata
        .as_object_mut()
        .expect("metadata is always an object")
        .entry("labels")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    labels[LABEL_TEMPLATE_NAME] = serde_json::Value::String(template_name.to_string());
    labels[LABEL_TEMPLATE_NAMESPACE] = serde_json::Value::String(template_namespace.to_string());
}

/// Append an owner reference to the parent `KubeTemplate`, only when the
/// entry requested it and the object shares the template's namespace
/// (spec.md §4.4 step 4iii; cross-namespace requests are silently demoted).
fn maybe_add_owner_reference(
    object: &mut serde_json::Value,
    entry_referenced: bool,
    template: &KubeTemplate,
    object_namespace: &str,
) {
    if !entry_referenced {
        return;
    }
    let template_namespace = template.namespace().unwrap_or_default();
    if object_namespace != template_namespace {
        return;
    }
    let Some(uid) = template.uid() else { return };

    let owner_ref = OwnerReference {
        api_version: format!("{}/{}", KubeTemplate::group(&()), KubeTemplate::version(&())),
        kind: KubeTemplate::kind(&()).to_string(),
        name: template.name_any(),
        uid,
        controller: Some(false),
        block_owner_deletion: Some(false),
    };

    let obj = object
        .as_object_mut()
        .expect("decoded Kubernetes objects are always JSON objects");
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
    let owner_refs_json = serde_json::to_value(std::slice::from_ref(&owner_ref))
        .expect("OwnerReference always serializes");
    let owner_refs = owner_refs_json.as_array().cloned().unwrap_or_default();
    let metadata_obj = metadata.as_object_mut().expect("metadata is always an object");
    let existing = metadata_obj
        .entry("ownerReferences")
        .or_insert_with(|| serde_json::Value::Array(Vec::new()));
    if let Some(arr) = existing.as_array_mut() {
        arr.extend(owner_refs);
    }
}

/// SHA-256 hex digest over the canonicalised (key-sorted) spec, used for
/// `appliedSpecHash` (spec.md P5).
pub fn spec_hash(spec: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut sorted: Vec<_> = map.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in sorted {
                    out.insert(k.clone(), canonicalize(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }

    let canonical = canonicalize(spec);
    let bytes = serde_json::to_vec(&canonical).expect("canonicalised spec always serializes");
    let digest = Sha256::digest(&bytes);
    format!("{digest:x}")
}

/// Whether an apply error represents an immutable-field conflict that a
/// delete+recreate can resolve (spec.md §4.4 step 4v).
fn is_immutable_field_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            resp.code == 422 || resp.reason.eq_ignore_ascii_case("Invalid")
        }
        _ => false,
    }
}

/// Apply a single decoded object via server-side apply, force-owning the
/// fields asserted under the `kubetemplater` field manager, with
/// delete-and-recreate fallback on an immutable-field error when permitted.
pub async fn apply_entry(
    client: &Client,
    object: &serde_json::Value,
    allow_replace: bool,
) -> Result<(), OperatorError> {
    let (group, version, kind) = value::gvk_of(object).ok_or_else(|| OperatorError::GvkNotAllowed {
        index: 0,
        group: String::new(),
        version: String::new(),
        kind: String::new(),
    })?;
    let namespace = value::namespace_of(object).unwrap_or_default().to_string();
    let name = value::name_of(object).unwrap_or_default().to_string();

    let ar = api_resource_for(&group, &version, &kind);
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &ar);

    let dynamic_obj: DynamicObject =
        serde_json::from_value(object.clone()).map_err(|source| OperatorError::DecodeFailed {
            index: 0,
            source,
        })?;

    let params = PatchParams::apply(FIELD_MANAGER).force();
    let result = api.patch(&name, &params, &Patch::Apply(&dynamic_obj)).await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_immutable_field_error(&err) && allow_replace => {
            info!(kind = %kind, name = %name, namespace = %namespace, "immutable_field_replace");
            api.delete(&name, &Default::default())
                .await
                .map_err(OperatorError::Apply)?;
            api.patch(&name, &params, &Patch::Apply(&dynamic_obj))
                .await
                .map(|_| ())
                .map_err(OperatorError::Apply)
        }
        Err(err) => Err(OperatorError::Apply(err)),
    }
}

/// Process one dequeued work item end to end (spec.md §4.4 steps 1-5).
pub async fn process_item(
    client: &Client,
    policy_cache: &PolicyCache,
    policy_source: &dyn PolicySource,
    validator_cache: &ValidatorCache,
    namespace: &str,
    name: &str,
) -> ProcessOutcome {
    let templates: Api<KubeTemplate> = Api::namespaced(client.clone(), namespace);
    let template = match templates.get(name).await {
        Ok(t) => t,
        Err(kube::Error::Api(resp)) if resp.code == 404 => return ProcessOutcome::NotFound,
        Err(e) => {
            warn!(namespace, name, error = %e, "fetch_failed");
            return ProcessOutcome::Failed {
                reason: e.to_string(),
            };
        }
    };

    if let Err(e) = set_phase(&templates, name, ProcessingPhase::Processing, None).await {
        warn!(namespace, name, error = %e, "status_update_failed");
    }

    let policy = match policy_cache.get(namespace, policy_source).await {
        Ok(CacheLookup::Found(p)) => p,
        Ok(CacheLookup::NotFound) => {
            return fail_item(&templates, name, "no KubeTemplatePolicy found for source namespace").await;
        }
        Ok(CacheLookup::Ambiguous) => {
            return fail_item(&templates, name, "ambiguous KubeTemplatePolicy for source namespace").await;
        }
        Err(e) => return fail_item(&templates, name, &e.to_string()).await,
    };

    let entries = &template.spec.entries;
    let total = entries.len() as u32;
    let mut synced = 0u32;

    for (index, entry) in entries.iter().enumerate() {
        if let Err(e) =
            validation::revalidate_entry_for_apply(validator_cache, &policy, index, entry, namespace).await
        {
            return fail_item(&templates, name, &e.to_string()).await;
        }

        let mut object = entry.object.clone();
        let effective_namespace = value::effective_namespace(entry.namespace.as_deref(), &object, namespace);
        value::set_namespace(&mut object, &effective_namespace);
        stamp_labels(&mut object, name, namespace);
        maybe_add_owner_reference(&mut object, entry.referenced, &template, &effective_namespace);

        let allow_replace = entry.replace
            || object
                .get("metadata")
                .and_then(|m| m.get("annotations"))
                .and_then(|a| a.get(ANNOTATION_REPLACE_ENABLED))
                .and_then(|v| v.as_str())
                == Some("true");

        if let Err(e) = apply_entry(client, &object, allow_replace).await {
            return fail_item(&templates, name, &e.to_string()).await;
        }
        synced += 1;
    }

    let hash = spec_hash(&serde_json::to_value(&template.spec).unwrap_or_default());
    if let Err(e) = update_status(&templates, name, |status| {
        status.processing_phase = Some(ProcessingPhase::Completed);
        status.processed_at = Some(now_rfc3339());
        status.resources_total = Some(total);
        status.resources_synced = Some(synced);
        status.applied_spec_hash = Some(hash.clone());
    })
    .await
    {
        warn!(namespace, name, error = %e, "status_update_failed");
    }

    ProcessOutcome::Completed {
        resources_synced: synced,
    }
}

async fn fail_item(templates: &Api<KubeTemplate>, name: &str, reason: &str) -> ProcessOutcome {
    if let Err(e) = set_phase(templates, name, ProcessingPhase::Failed, Some(reason)).await {
        warn!(name, error = %e, "status_update_failed");
    }
    ProcessOutcome::Failed {
        reason: reason.to_string(),
    }
}

async fn set_phase(
    templates: &Api<KubeTemplate>,
    name: &str,
    phase: ProcessingPhase,
    reason: Option<&str>,
) -> Result<(), OperatorError> {
    update_status(templates, name, |status| {
        status.processing_phase = Some(phase.clone());
        if phase == ProcessingPhase::Failed {
            status.paused_reason = reason.map(str::to_string);
        }
    })
    .await
}

/// Read-modify-write status update with up to `STATUS_UPDATE_MAX_ATTEMPTS`
/// re-fetches on optimistic-concurrency (409) conflicts (spec.md §4.4, §7).
pub async fn update_status(
    templates: &Api<KubeTemplate>,
    name: &str,
    mutate: impl Fn(&mut crate::crd::KubeTemplateStatus),
) -> Result<(), OperatorError> {
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut current = templates.get(name).await.map_err(OperatorError::Kube)?;
        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status);
        current.status = Some(status);

        let result = templates
            .replace_status(
                name,
                &Default::default(),
                serde_json::to_vec(&current).expect("KubeTemplate always serializes"),
            )
            .await;

        match result {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(resp)) if resp.code == 409 && attempts < STATUS_UPDATE_MAX_ATTEMPTS => {
                continue;
            }
            Err(kube::Error::Api(resp)) if resp.code == 409 => {
                return Err(OperatorError::StatusConflictExhausted { attempts });
            }
            Err(e) => return Err(OperatorError::Kube(e)),
        }
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Worker loop: bridges the blocking queue into an async task, dispatching
/// each dequeued item through `process_item` and reporting the result back
/// to the queue via `done`/`requeue`. Returns when the queue is shut down.
pub async fn run_worker(
    worker_id: usize,
    client: Client,
    queue: Arc<crate::queue::WorkQueue>,
    policy_cache: Arc<PolicyCache>,
    policy_source: Arc<dyn PolicySource>,
    validator_cache: Arc<ValidatorCache>,
) {
    loop {
        let queue_for_dequeue = queue.clone();
        let dequeued = tokio::task::spawn_blocking(move || queue_for_dequeue.dequeue_blocking())
            .await
            .expect("dequeue task panicked");

        let (namespace, name) = match dequeued {
            crate::queue::DequeueResult::Item(id) => id,
            crate::queue::DequeueResult::ShuttingDown => {
                info!(worker_id, "worker_shutdown");
                return;
            }
        };

        let outcome = process_item(
            &client,
            &policy_cache,
            policy_source.as_ref(),
            &validator_cache,
            &namespace,
            &name,
        )
        .await;

        match outcome {
            ProcessOutcome::NotFound => {
                queue.done(&(namespace, name));
            }
            ProcessOutcome::Completed { resources_synced } => {
                info!(worker_id, namespace, name, resources_synced, "item_completed");
                queue.done(&(namespace.clone(), name.clone()));
            }
            ProcessOutcome::Failed { reason } => {
                warn!(worker_id, namespace, name, reason, "item_failed");
                let outcome = queue.requeue(&(namespace.clone(), name.clone()), 0);
                if let crate::queue::RequeueOutcome::Paused { retry_cycle } = outcome {
                    emit_paused_event(&client, &namespace, &name, &reason, retry_cycle).await;
                }
            }
        }
    }
}

/// Emit a `Warning TemplatePaused` event (spec.md §4.4, §6) when the queue
/// auto-pauses an item.
async fn emit_paused_event(client: &Client, namespace: &str, name: &str, reason: &str, cycle: u32) {
    use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    let events: Api<Event> = Api::namespaced(client.clone(), namespace);
    let event_name = format!("{name}.{ts}", ts = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));
    let event = Event {
        metadata: ObjectMeta {
            name: Some(event_name),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        involved_object: ObjectReference {
            kind: Some("KubeTemplate".to_string()),
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            api_version: Some("kubetemplater.io/v1alpha1".to_string()),
            ..Default::default()
        },
        reason: Some("TemplatePaused".to_string()),
        message: Some(format!("retry cycle {cycle} exceeded: {reason}")),
        type_: Some("Warning".to_string()),
        source: Some(EventSource {
            component: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }),
        first_timestamp: Some(Time(chrono::Utc::now())),
        last_timestamp: Some(Time(chrono::Utc::now())),
        count: Some(1),
        ..Default::default()
    };

    if let Err(e) = events.create(&Default::default(), &event).await {
        warn!(namespace, name, error = %e, "paused_event_emit_failed");
    }
}

/// Spawn `num_workers` worker tasks (spec.md §4.4: `N` workers, default 3,
/// range 1-20).
pub fn spawn_worker_pool(
    num_workers: u32,
    client: Client,
    queue: Arc<crate::queue::WorkQueue>,
    policy_cache: Arc<PolicyCache>,
    policy_source: Arc<dyn PolicySource>,
    validator_cache: Arc<ValidatorCache>,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..num_workers)
        .map(|id| {
            tokio::spawn(run_worker(
                id as usize,
                client.clone(),
                queue.clone(),
                policy_cache.clone(),
                policy_source.clone(),
                validator_cache.clone(),
            ))
        })
        .collect()
}
