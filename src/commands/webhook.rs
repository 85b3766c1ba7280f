//! Admission webhook server: validates `KubeTemplate` objects at admission
//! time against the namespace-scoped policy, reusing the exact pipeline the
//! worker pool re-runs before apply (spec.md §4.2, §4.4 step 4i).

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use kubetemplater::crd::KubeTemplate;
use kubetemplater::policy_cache::{PolicyCache, PolicySource};
use kubetemplater::validation::{self, ValidatorCache};
use kubetemplater::worker::KubePolicySource;
use kubetemplater::{cert_watcher, policy_cache};

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("kubetemplate_admission_requests_total", "Total admission requests"),
        &["operation", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DENIALS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new(
            "kubetemplate_admission_denials_total",
            "Total admission denials by namespace and error kind",
        ),
        &["namespace", "reason"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(c.clone()))
        .expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "kubetemplate_admission_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY
        .register(Box::new(h.clone()))
        .expect("metric not yet registered");
    h
});

/* ============================= STATE ============================= */

#[derive(Clone)]
struct WebhookState {
    policy_cache: Arc<PolicyCache>,
    policy_source: Arc<dyn PolicySource>,
    validator_cache: Arc<ValidatorCache>,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_secret_name: &str, namespace: &str) -> Result<()> {
    println!("Starting admission webhook server...\n");
    info!("webhook_starting");

    let client = kube::Client::try_default()
        .await
        .context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    print!("  TLS certificate ............. ");
    let cert_handle = cert_watcher::start(client.clone(), namespace, tls_secret_name)
        .await
        .context("Failed to start certificate watcher")?;
    if cert_handle.is_ready() {
        println!("OK (secret '{tls_secret_name}')");
    } else {
        println!("PENDING (secret '{tls_secret_name}' not yet populated)");
    }

    let state = WebhookState {
        policy_cache: Arc::new(PolicyCache::new(policy_cache::DEFAULT_TTL)),
        policy_source: Arc::new(KubePolicySource::new(client, namespace.to_string())),
        validator_cache: Arc::new(ValidatorCache::new()),
    };

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate ............ Admission review handler");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Admission webhook running. Press Ctrl+C to stop.\n");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle =
        tokio::spawn(async move { start_https_server(state, http_shutdown, addr, cert_handle).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\nShutdown signal received. Stopping webhook server...");

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate", post(admission_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "READY") }))
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

/// Builds the initial TLS config from whatever [`cert_watcher`] has loaded,
/// then keeps polling the same handle and hot-reloading `RustlsConfig` in
/// place — rotation lands in the running process without a pod restart.
async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    cert_handle: cert_watcher::CertHandle,
) -> Result<()> {
    let app = build_webhook_router(state);

    let material = cert_handle
        .get()
        .context("No TLS certificate available from the cert secret; cannot start HTTPS server")?;
    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem(material.cert_pem, material.key_pem)
        .await
        .context("Failed to load TLS configuration")?;

    let reload_config = rustls_config.clone();
    tokio::spawn(async move {
        watch_and_reload_tls(reload_config, cert_handle).await;
    });

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

/// Polls the cert handle for a material change and hot-reloads the TLS
/// config in place, so the webhook never needs restarting after the cert
/// manager rotates the secret (spec.md §4.9).
async fn watch_and_reload_tls(config: axum_server::tls_rustls::RustlsConfig, cert_handle: cert_watcher::CertHandle) {
    let mut last_cert: Option<Vec<u8>> = cert_handle.get().map(|m| m.cert_pem);
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;
        let Some(material) = cert_handle.get() else {
            continue;
        };
        if last_cert.as_deref() == Some(material.cert_pem.as_slice()) {
            continue;
        }
        match config.reload_from_pem(material.cert_pem.clone(), material.key_pem).await {
            Ok(()) => {
                info!("tls_cert_hot_reloaded");
                last_cert = Some(material.cert_pem);
            }
            Err(e) => warn!(error = %e, "tls_cert_reload_failed"),
        }
    }
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= ADMISSION HANDLER ============================= */

async fn admission_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let review: serde_json::Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            info!(error = %e, "invalid_admission_review");
            return (StatusCode::BAD_REQUEST, build_admission_response("", true, None, &[]));
        }
    };

    let uid = review["request"]["uid"].as_str().unwrap_or("").to_string();
    let operation = review["request"]["operation"].as_str().unwrap_or("UNKNOWN").to_string();
    let namespace = review["request"]["namespace"].as_str().unwrap_or("default").to_string();

    let template: KubeTemplate = match serde_json::from_value(review["request"]["object"].clone()) {
        Ok(t) => t,
        Err(e) => {
            WEBHOOK_REQUESTS.with_label_values(&[&operation, "false"]).inc();
            WEBHOOK_DENIALS.with_label_values(&[&namespace, "decode"]).inc();
            info!(error = %e, "failed_to_decode_kubetemplate");
            return (
                StatusCode::OK,
                build_admission_response(&uid, false, Some(&format!("could not decode KubeTemplate: {e}")), &[]),
            );
        }
    };

    match validate_template(&state, &namespace, &template.spec.entries).await {
        Ok(warnings) => {
            WEBHOOK_REQUESTS.with_label_values(&[&operation, "true"]).inc();
            (StatusCode::OK, build_admission_response(&uid, true, None, &warnings))
        }
        Err(reason) => {
            WEBHOOK_REQUESTS.with_label_values(&[&operation, "false"]).inc();
            WEBHOOK_DENIALS.with_label_values(&[&namespace, error_reason_label(&reason)]).inc();
            info!(namespace = %namespace, reason = %reason, "admission_denied");
            (StatusCode::OK, build_admission_response(&uid, false, Some(&reason.to_string()), &[]))
        }
    }
}

fn error_reason_label(err: &kubetemplater::error::OperatorError) -> &'static str {
    use kubetemplater::error::OperatorError::*;
    match err {
        PolicyNotFound(_) => "policy_not_found",
        PolicyAmbiguous(_) => "policy_ambiguous",
        EntryCountExceeded { .. } => "entry_count_exceeded",
        PayloadTooLarge { .. } => "payload_too_large",
        DecodeFailed { .. } => "decode_failed",
        GvkNotAllowed { .. } => "gvk_not_allowed",
        NamespaceNotAllowed { .. } => "namespace_not_allowed",
        CelEvaluationFailed { .. } => "cel_evaluation_failed",
        CelTimeout { .. } => "cel_timeout",
        FieldValidationFailed { .. } => "field_validation_failed",
        _ => "other",
    }
}

async fn validate_template(
    state: &WebhookState,
    namespace: &str,
    entries: &[kubetemplater::crd::TemplateEntry],
) -> Result<Vec<String>, kubetemplater::error::OperatorError> {
    use kubetemplater::policy_cache::CacheLookup;

    let policy = match state.policy_cache.get(namespace, state.policy_source.as_ref()).await? {
        CacheLookup::Found(p) => p,
        CacheLookup::NotFound => {
            return Err(kubetemplater::error::OperatorError::PolicyNotFound(namespace.to_string()))
        }
        CacheLookup::Ambiguous => {
            return Err(kubetemplater::error::OperatorError::PolicyAmbiguous(namespace.to_string()))
        }
    };

    let warnings = validation::validate_entries(&state.validator_cache, &policy, entries, namespace).await?;
    Ok(warnings.into_iter().map(|w| format!("entry {}: {}", w.index, w.message)).collect())
}

fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>, warnings: &[String]) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }
    if !warnings.is_empty() {
        response["response"]["warnings"] = serde_json::json!(warnings);
    }

    response.to_string()
}

/* ============================= CERT GENERATION (dev convenience) ============================= */

pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, format!("{service_name}-ca"));
    ca_params.distinguished_name = ca_dn;
    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;
    server_params.subject_alt_names = [
        format!("{service_name}.{namespace}.svc"),
        format!("{service_name}.{namespace}.svc.cluster.local"),
    ]
    .into_iter()
    .map(|s| SanType::DnsName(s.try_into().expect("SAN hostnames are valid DNS names")))
    .collect();

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .context("Failed to sign server certificate")?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    std::fs::write(output_path.join("ca.crt"), ca_cert.pem()).context("Failed to write ca.crt")?;
    std::fs::write(output_path.join("tls.crt"), server_cert.pem()).context("Failed to write tls.crt")?;
    std::fs::write(output_path.join("tls.key"), server_key.serialize_pem()).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", output_path.join("ca.crt").display());
    println!("  Server certificate .......... {}", output_path.join("tls.crt").display());
    println!("  Server key .................. {}", output_path.join("tls.key").display());
    Ok(())
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate.kubetemplater.io
    rules:
      - apiGroups: ["kubetemplater.io"]
        resources: ["kubetemplates"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate
      caBundle: {ca_b64}
    failurePolicy: Fail
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_response_allowed_has_no_status() {
        let resp = build_admission_response("uid-1", true, None, &[]);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "uid-1");
        assert_eq!(v["response"]["allowed"], true);
        assert!(v["response"]["status"].is_null());
    }

    #[test]
    fn admission_response_denied_carries_message() {
        let resp = build_admission_response("uid-2", false, Some("no policy found"), &[]);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["allowed"], false);
        assert_eq!(v["response"]["status"]["message"], "no policy found");
    }

    #[test]
    fn admission_response_includes_warnings() {
        let resp = build_admission_response("uid-3", true, None, &["entry 0: replace=true".to_string()]);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["warnings"][0], "entry 0: replace=true");
    }

    #[test]
    fn webhook_duration_metric_registered() {
        LazyLock::force(&WEBHOOK_DURATION);
        let families = WEBHOOK_REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"kubetemplate_admission_duration_seconds"));
    }
}
