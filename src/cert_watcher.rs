//! Secret-backed TLS cert watcher (spec.md §4.9), running on every pod
//! (leader or not). Loads initial TLS material with a bounded timeout, then
//! hot-reloads on every watch event, all without ever serving an empty or
//! torn certificate to an in-progress TLS handshake.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher;
use kube::{Api, Client};
use tracing::{info, warn};

use crate::error::OperatorError;

/// Initial-load timeout (spec.md §5: "Cert initial load: 1 min per attempt").
pub const INITIAL_LOAD_TIMEOUT: Duration = Duration::from_secs(60);

const KEY_TLS_CERT: &str = "tls.crt";
const KEY_TLS_KEY: &str = "tls.key";

#[derive(Clone)]
pub struct CertMaterial {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

/// Lock-free-read handle to the currently active certificate. Writers
/// (the watch loop) swap the whole `Arc`; readers (the TLS handshake
/// callback) clone it without ever blocking behind a writer for long.
#[derive(Clone, Default)]
pub struct CertHandle {
    inner: Arc<RwLock<Option<CertMaterial>>>,
}

impl CertHandle {
    pub fn get(&self) -> Option<CertMaterial> {
        self.inner.read().expect("cert handle lock poisoned").clone()
    }

    fn set(&self, material: CertMaterial) {
        *self.inner.write().expect("cert handle lock poisoned") = Some(material);
    }

    /// Readiness: at least one certificate has ever been loaded.
    pub fn is_ready(&self) -> bool {
        self.inner.read().expect("cert handle lock poisoned").is_some()
    }
}

fn extract(secret: &Secret) -> Option<CertMaterial> {
    let data = secret.data.as_ref()?;
    let cert_pem = data.get(KEY_TLS_CERT)?.0.clone();
    let key_pem = data.get(KEY_TLS_KEY)?.0.clone();
    Some(CertMaterial { cert_pem, key_pem })
}

/// Block until the initial certificate is loaded (or the bounded timeout
/// elapses), then spawn the hot-reload watch loop in the background.
/// Returns the shared handle readers should clone from.
pub async fn start(client: Client, namespace: &str, secret_name: &str) -> Result<CertHandle, OperatorError> {
    let handle = CertHandle::default();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    match tokio::time::timeout(INITIAL_LOAD_TIMEOUT, secrets.get(secret_name)).await {
        Ok(Ok(secret)) => {
            if let Some(material) = extract(&secret) {
                handle.set(material);
                info!(secret_name, "initial_cert_loaded");
            } else {
                warn!(secret_name, "initial_cert_secret_empty_deferring_readiness");
            }
        }
        Ok(Err(kube::Error::Api(resp))) if resp.code == 404 => {
            warn!(secret_name, "initial_cert_secret_missing_deferring_readiness");
        }
        Ok(Err(e)) => {
            warn!(secret_name, error = %e, "initial_cert_load_failed_deferring_readiness");
        }
        Err(_elapsed) => {
            warn!(secret_name, "initial_cert_load_timed_out_deferring_readiness");
        }
    }

    let watch_handle = handle.clone();
    let watch_client = client;
    let namespace = namespace.to_string();
    let name = secret_name.to_string();
    tokio::spawn(async move {
        run_watch_loop(watch_client, namespace, name, watch_handle).await;
    });

    Ok(handle)
}

/// Runs until the process exits. `kube::runtime::watcher` already retries
/// transient stream errors with backoff internally, so a `None`/closed
/// stream here means the watcher itself gave up; rebuild it from scratch
/// rather than exiting the loop.
async fn run_watch_loop(client: Client, namespace: String, secret_name: String, handle: CertHandle) {
    loop {
        let secrets: Api<Secret> = Api::namespaced(client.clone(), &namespace);
        let config = watcher::Config::default().fields(&format!("metadata.name={secret_name}"));
        let mut stream = Box::pin(watcher::watcher(secrets, config));

        loop {
            match stream.next().await {
                Some(Ok(watcher::Event::Apply(secret))) | Some(Ok(watcher::Event::InitApply(secret))) => {
                    if let Some(material) = extract(&secret) {
                        handle.set(material);
                        info!(secret_name, "cert_hot_reloaded");
                    } else {
                        warn!(secret_name, "cert_secret_update_missing_keys");
                    }
                }
                // `Deleted` does not invalidate: keep serving the last valid
                // cert (spec.md §4.9) — the leader is probably recreating it.
                Some(Ok(watcher::Event::Delete(_))) => {
                    warn!(secret_name, "cert_secret_deleted_keeping_last_valid_cert");
                }
                Some(Ok(watcher::Event::Init)) | Some(Ok(watcher::Event::InitDone)) => {}
                Some(Err(e)) => {
                    warn!(secret_name, error = %e, "cert_watch_error_retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                None => {
                    warn!(secret_name, "cert_watch_stream_closed_rebuilding");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    break;
                }
            }
        }
    }
}
