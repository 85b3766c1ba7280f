//! `kubetemplater-operator operator run`: wires the three controllers
//! (KubeTemplate, KubeTemplatePolicy, Namespace), the work queue + worker
//! pool, the certificate lifecycle manager, and the metrics/health server
//! into one running process (spec.md §4).

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Controller;
use kube::runtime::watcher;
use kube::{Api, Client};
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use kubetemplater::config::OperatorConfig;
use kubetemplater::crd::{KubeTemplate, KubeTemplatePolicy};
use kubetemplater::policy_cache::PolicyCache;
use kubetemplater::queue::{RetryPolicy, WorkQueue};
use kubetemplater::validation::ValidatorCache;
use kubetemplater::worker::KubePolicySource;
use kubetemplater::{certs, leader, namespace_reconciler, policy_reconciler, template_reconciler, worker};

/* ============================= PROMETHEUS ============================= */

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("kubetemplate_queue_depth", "Number of items currently tracked by the work queue")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

static WORKERS_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    let g = IntGauge::new("kubetemplate_workers_running", "Number of worker tasks in the pool")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

struct OperatorState {
    ready: bool,
}

/// Periodic interval at which the cert lifecycle state machine re-checks
/// rollover/renewal thresholds (spec.md §4.9: daily is plenty against
/// year-plus validity windows).
const CERT_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub async fn run(namespace: String) -> Result<()> {
    println!("Starting kubetemplater operator...\n");

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let config = OperatorConfig::from_env();
    println!("  Worker pool .................. {} workers", config.num_workers);
    println!("  Policy cache TTL ............. {}s", config.policy_cache_ttl_secs);
    println!(
        "  Periodic reconcile interval .. {}s",
        config.periodic_reconcile_interval_secs
    );

    let retry_policy = RetryPolicy {
        max_retries: config.queue_max_retries,
        initial_delay: Duration::from_secs(config.queue_initial_retry_delay_secs),
        max_delay: Duration::from_secs(config.queue_max_retry_delay_secs),
        max_retry_cycles: config.queue_max_retry_cycles,
    };
    let queue = Arc::new(WorkQueue::new(retry_policy));
    let policy_cache = Arc::new(PolicyCache::new(Duration::from_secs(config.policy_cache_ttl_secs)));
    let policy_source: Arc<dyn kubetemplater::policy_cache::PolicySource> =
        Arc::new(KubePolicySource::new(client.clone(), namespace.clone()));
    let validator_cache = Arc::new(ValidatorCache::new());

    let worker_handles = worker::spawn_worker_pool(
        config.num_workers,
        client.clone(),
        queue.clone(),
        policy_cache.clone(),
        policy_source.clone(),
        validator_cache,
    );
    WORKERS_RUNNING.set(worker_handles.len() as i64);

    LazyLock::force(&QUEUE_DEPTH);
    LazyLock::force(&WORKERS_RUNNING);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9090));
    let state = Arc::new(Mutex::new(OperatorState { ready: false }));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_state = state.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let queue_for_metrics = queue.clone();
    let http_handle = tokio::spawn(async move {
        start_metrics_server(http_state, http_shutdown, addr, queue_for_metrics).await
    });

    let cert_shutdown = shutdown_tx.subscribe();
    let cert_client = client.clone();
    let cert_namespace = namespace.clone();
    let cert_handle = tokio::spawn(async move { run_cert_lifecycle(cert_client, cert_namespace, cert_shutdown).await });

    let template_ctx = Arc::new(template_reconciler::ReconcilerContext {
        client: client.clone(),
        queue: queue.clone(),
        periodic_interval: Duration::from_secs(config.periodic_reconcile_interval_secs),
    });
    let templates: Api<KubeTemplate> = Api::all(client.clone());
    let template_state = state.clone();
    let template_controller = Controller::new(templates, watcher::Config::default())
        .run(template_reconciler::reconcile, template_reconciler::error_policy, template_ctx)
        .for_each(move |result| {
            let state = template_state.clone();
            async move {
                mark_ready(&state).await;
                if let Err(e) = result {
                    warn!(error = %e, "template_reconcile_dispatch_error");
                }
            }
        });

    let policy_ctx = Arc::new(policy_reconciler::ReconcilerContext {
        policy_cache: policy_cache.clone(),
    });
    let policies: Api<KubeTemplatePolicy> = Api::namespaced(client.clone(), &namespace);
    let policy_controller = Controller::new(policies, watcher::Config::default())
        .run(policy_reconciler::reconcile, policy_reconciler::error_policy, policy_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "policy_reconcile_dispatch_error");
            }
        });

    let namespace_ctx = Arc::new(namespace_reconciler::ReconcilerContext { client: client.clone() });
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let namespace_controller = Controller::new(namespaces, watcher::Config::default())
        .run(namespace_reconciler::reconcile, namespace_reconciler::error_policy, namespace_ctx)
        .for_each(|result| async move {
            if let Err(e) = result {
                warn!(error = %e, "namespace_reconcile_dispatch_error");
            }
        });

    println!("  Metrics server ............... http://{addr}");
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    info!("operator_started");

    tokio::select! {
        _ = template_controller => {
            warn!("template_controller_stream_ended");
        }
        _ = policy_controller => {
            warn!("policy_controller_stream_ended");
        }
        _ = namespace_controller => {
            warn!("namespace_controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping operator...");
        }
    }

    queue.shutdown();
    let _ = shutdown_tx.send(());
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = http_handle.await?;
    cert_handle.abort();

    println!("Operator stopped.");
    Ok(())
}

async fn mark_ready(state: &Mutex<OperatorState>) {
    let mut s = state.lock().await;
    if !s.ready {
        s.ready = true;
    }
}

const CERT_MANAGER_LEASE_NAME: &str = "kubetemplater-cert-manager";

/// Runs the certificate lifecycle state machine, gated on holding the
/// cert-manager lease (spec.md §4.8: "leader-elected"; §5 for the lease
/// timings). Every replica competes for the lease; only the winner applies
/// CA/server cert changes, avoiding concurrent rollovers racing each other.
async fn run_cert_lifecycle(client: Client, namespace: String, mut shutdown: broadcast::Receiver<()>) {
    let service_name = "kubetemplater-webhook";
    let webhook_name = "kubetemplater-webhook";
    let election = leader::LeaseElection::new(client.clone(), namespace.clone(), CERT_MANAGER_LEASE_NAME);

    let mut is_leader = false;
    let mut last_check = tokio::time::Instant::now()
        .checked_sub(CERT_CHECK_INTERVAL)
        .unwrap_or_else(tokio::time::Instant::now);

    loop {
        let tick = if is_leader { leader::RENEW_INTERVAL } else { leader::RETRY_INTERVAL };

        tokio::select! {
            _ = shutdown.recv() => {
                if is_leader {
                    if let Err(e) = election.release().await {
                        warn!(error = %e, "cert_manager_lease_release_failed");
                    }
                }
                break;
            }
            _ = tokio::time::sleep(tick) => {
                match election.acquire_or_renew().await {
                    Ok(true) => {
                        if !is_leader {
                            info!("cert_manager_leadership_acquired");
                        }
                        is_leader = true;
                    }
                    Ok(false) => is_leader = false,
                    Err(e) => warn!(error = %e, "cert_manager_lease_acquire_failed"),
                }

                if is_leader && last_check.elapsed() >= CERT_CHECK_INTERVAL {
                    match certs::reconcile_once(&client, &namespace, service_name, webhook_name).await {
                        Ok(()) => info!("cert_lifecycle_reconciled"),
                        Err(e) => warn!(error = %e, "cert_lifecycle_reconcile_failed"),
                    }
                    last_check = tokio::time::Instant::now();
                }
            }
        }
    }
}

/* ============================= METRICS SERVER ============================= */

fn build_operator_router(state: Arc<Mutex<OperatorState>>, queue: Arc<WorkQueue>) -> Router {
    Router::new()
        .route("/metrics", get(operator_metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(operator_ready_handler))
        .with_state((state, queue))
}

async fn operator_ready_handler(State((state, _queue)): State<(Arc<Mutex<OperatorState>>, Arc<WorkQueue>)>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn operator_metrics_handler(State((_state, queue)): State<(Arc<Mutex<OperatorState>>, Arc<WorkQueue>)>) -> impl IntoResponse {
    QUEUE_DEPTH.set(queue.len() as i64);

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

async fn start_metrics_server(
    state: Arc<Mutex<OperatorState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    queue: Arc<WorkQueue>,
) -> Result<()> {
    let app = build_operator_router(state, queue);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind metrics server")?;

    info!(addr = %addr, "operator_metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_handler_reports_not_ready_before_first_reconcile() {
        let state = Arc::new(Mutex::new(OperatorState { ready: false }));
        assert!(!state.lock().await.ready);
        mark_ready(&state).await;
        assert!(state.lock().await.ready);
    }

    #[test]
    fn operator_metrics_registered() {
        LazyLock::force(&QUEUE_DEPTH);
        LazyLock::force(&WORKERS_RUNNING);
        let families = REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"kubetemplate_queue_depth"));
        assert!(names.contains(&"kubetemplate_workers_running"));
    }
}
