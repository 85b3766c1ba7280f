//! Namespace reconciler (spec.md §4.7). Guarantees that a namespace carrying
//! `KubeTemplate` objects is never deleted out from under the operator
//! mid-apply: a finalizer blocks removal until every `KubeTemplate` in that
//! namespace has been cleaned up first.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::{info, warn};

use crate::crd::KubeTemplate;

pub const FINALIZER: &str = "kubetemplater.io/namespace-finalizer";

pub struct ReconcilerContext {
    pub client: Client,
}

fn has_finalizer(namespace: &Namespace) -> bool {
    namespace
        .metadata
        .finalizers
        .as_ref()
        .map(|f| f.iter().any(|f| f == FINALIZER))
        .unwrap_or(false)
}

async fn add_finalizer(namespaces: &Api<Namespace>, name: &str) -> Result<(), kube::Error> {
    let patch = json!({ "metadata": { "finalizers": [FINALIZER] } });
    namespaces
        .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

async fn remove_finalizer(namespaces: &Api<Namespace>, namespace: &Namespace) -> Result<(), kube::Error> {
    let remaining: Vec<&String> = namespace
        .metadata
        .finalizers
        .as_ref()
        .into_iter()
        .flatten()
        .filter(|f| f.as_str() != FINALIZER)
        .collect();
    let patch = json!({ "metadata": { "finalizers": remaining } });
    let name = namespace.name_any();
    namespaces
        .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Delete every `KubeTemplate` living in `namespace`, so their owned objects
/// are garbage-collected before the namespace itself disappears.
async fn drain_templates(client: &Client, namespace: &str) -> Result<(), kube::Error> {
    let templates: Api<KubeTemplate> = Api::namespaced(client.clone(), namespace);
    let list = templates.list(&ListParams::default()).await?;
    for template in list.items {
        let name = template.name_any();
        match templates.delete(&name, &Default::default()).await {
            Ok(_) => info!(namespace, name, "template_drained_for_namespace_deletion"),
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

pub async fn reconcile(
    namespace: Arc<Namespace>,
    ctx: Arc<ReconcilerContext>,
) -> Result<Action, kube::Error> {
    let name = namespace.name_any();
    let namespaces: Api<Namespace> = Api::all(ctx.client.clone());

    let is_deleting = namespace.metadata.deletion_timestamp.is_some();

    if is_deleting {
        if !has_finalizer(&namespace) {
            return Ok(Action::await_change());
        }
        drain_templates(&ctx.client, &name).await?;
        remove_finalizer(&namespaces, &namespace).await?;
        info!(namespace = %name, "namespace_finalizer_removed");
        return Ok(Action::await_change());
    }

    if !has_finalizer(&namespace) {
        add_finalizer(&namespaces, &name).await?;
        info!(namespace = %name, "namespace_finalizer_added");
    }

    Ok(Action::requeue(Duration::from_secs(3600)))
}

pub fn error_policy(
    _namespace: Arc<Namespace>,
    error: &kube::Error,
    _ctx: Arc<ReconcilerContext>,
) -> Action {
    warn!(error = %error, "namespace_reconcile_error");
    Action::requeue(Duration::from_secs(30))
}
