//! Certificate manager (spec.md §4.8) — leader-elected CA and server-cert
//! lifecycle, backed by Kubernetes Secrets rather than local files.
//!
//! Grounded in the teacher's one-shot `generate_self_signed_certs` (`rcgen`
//! CA + server cert), generalised into a stateful bootstrap / rollover /
//! promotion state machine that persists everything to Secrets so any
//! replica can pick up where a dead leader left off. Only the elected leader
//! should drive `reconcile_once`; every replica (leader or not) only reads
//! the resulting secret via [`crate::cert_watcher`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use tracing::{info, warn};

use crate::error::OperatorError;

pub const CA_RENEW_THRESHOLD: ChronoDuration = ChronoDuration::days(365);
pub const SERVER_RENEW_THRESHOLD: ChronoDuration = ChronoDuration::days(30);
pub const CA_VALIDITY: ChronoDuration = ChronoDuration::days(365 * 10);
pub const SERVER_VALIDITY: ChronoDuration = ChronoDuration::days(365);
pub const PERIODIC_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(24 * 3600);

const KEY_TLS_CERT: &str = "tls.crt";
const KEY_TLS_KEY: &str = "tls.key";
const KEY_CA_CERT: &str = "ca.crt";
const ANNOTATION_NOT_AFTER: &str = "kubetemplater.io/not-after";
const ANNOTATION_SIGNED_BY: &str = "kubetemplater.io/signed-by-ca-secret";

/// Names of the three secrets the manager owns, derived from a single base
/// name (spec.md §4.8: `<base>-ca`, `<base>-ca-new`, `<base>`).
pub struct SecretNames {
    pub ca: String,
    pub ca_new: String,
    pub server: String,
}

impl SecretNames {
    pub fn new(base: &str) -> Self {
        SecretNames {
            ca: format!("{base}-ca"),
            ca_new: format!("{base}-ca-new"),
            server: base.to_string(),
        }
    }
}

struct IssuedCert {
    cert_pem: String,
    key_pem: String,
    not_after: DateTime<Utc>,
}

fn rcgen_err(e: rcgen::Error) -> OperatorError {
    OperatorError::Cert(e.to_string())
}

fn to_offset_date_time(dt: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp_nanos(dt.timestamp_nanos_opt().unwrap_or(0) as i128)
        .expect("valid timestamp")
}

fn generate_ca(common_name: &str) -> Result<IssuedCert, OperatorError> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let not_before = Utc::now();
    let not_after = not_before + CA_VALIDITY;
    params.not_before = to_offset_date_time(not_before);
    params.not_after = to_offset_date_time(not_after);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, "kubetemplater");
    params.distinguished_name = dn;

    let key = KeyPair::generate().map_err(rcgen_err)?;
    let cert = params.self_signed(&key).map_err(rcgen_err)?;

    Ok(IssuedCert {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        not_after,
    })
}

fn generate_server_cert(
    service_name: &str,
    namespace: &str,
    ca_cert_pem: &str,
    ca_key_pem: &str,
) -> Result<IssuedCert, OperatorError> {
    let ca_key = KeyPair::from_pem(ca_key_pem).map_err(rcgen_err)?;
    let ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem).map_err(rcgen_err)?;
    let ca_cert = ca_params.self_signed(&ca_key).map_err(rcgen_err)?;

    let mut params = CertificateParams::default();
    let not_before = Utc::now();
    let not_after = not_before + SERVER_VALIDITY;
    params.not_before = to_offset_date_time(not_before);
    params.not_after = to_offset_date_time(not_after);
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    params.distinguished_name = dn;

    let sans = [
        service_name.to_string(),
        format!("{service_name}.{namespace}"),
        format!("{service_name}.{namespace}.svc"),
        format!("{service_name}.{namespace}.svc.cluster.local"),
    ];
    params.subject_alt_names = sans
        .iter()
        .map(|s| SanType::DnsName(s.clone().try_into().expect("SAN hostnames are valid DNS names")))
        .collect();

    let server_key = KeyPair::generate().map_err(rcgen_err)?;
    let server_cert = params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .map_err(rcgen_err)?;

    Ok(IssuedCert {
        cert_pem: server_cert.pem(),
        key_pem: server_key.serialize_pem(),
        not_after,
    })
}

fn not_after_of(secret: &Secret) -> Option<DateTime<Utc>> {
    let raw = secret.metadata.annotations.as_ref()?.get(ANNOTATION_NOT_AFTER)?;
    DateTime::parse_from_rfc3339(raw).ok().map(|d| d.with_timezone(&Utc))
}

fn cert_pem_of(secret: &Secret, key: &str) -> Option<String> {
    let data = secret.data.as_ref()?.get(key)?;
    String::from_utf8(data.0.clone()).ok()
}

/// Build the PEM bundle a `caBundle`/`ca.crt` field should carry: the
/// currently signing CA, plus the still-trusted old CA while a rollover is
/// in flight (spec.md §4.8, §9 — dropping the old CA here causes a webhook
/// outage during renewal).
fn build_trust_bundle(signing_ca_pem: &str, old_ca_pem: Option<&str>) -> String {
    let mut pems = vec![signing_ca_pem.to_string()];
    if let Some(old) = old_ca_pem {
        if old != signing_ca_pem {
            pems.push(old.to_string());
        }
    }
    pems.join("\n")
}

fn build_secret(name: &str, namespace: &str, entries: &[(&str, &str)], not_after: DateTime<Utc>) -> Secret {
    let mut data = std::collections::BTreeMap::new();
    for (key, value) in entries {
        data.insert(key.to_string(), k8s_openapi::ByteString(value.as_bytes().to_vec()));
    }
    let mut annotations = std::collections::BTreeMap::new();
    annotations.insert(ANNOTATION_NOT_AFTER.to_string(), not_after.to_rfc3339());

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    }
}

async fn apply_secret(api: &Api<Secret>, secret: &Secret) -> Result<(), OperatorError> {
    let name = secret.metadata.name.clone().expect("secret always named");
    api.patch(
        &name,
        &PatchParams::apply("kubetemplater-certs").force(),
        &Patch::Apply(secret),
    )
    .await
    .map(|_| ())
    .map_err(OperatorError::Apply)
}

async fn get_secret(api: &Api<Secret>, name: &str) -> Result<Option<Secret>, OperatorError> {
    match api.get(name).await {
        Ok(s) => Ok(Some(s)),
        Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(None),
        Err(e) => Err(OperatorError::Kube(e)),
    }
}

/// One full pass of the certificate state machine (spec.md §4.8). Intended
/// to be called once at startup and then every [`PERIODIC_CHECK_INTERVAL`]
/// by the leader.
pub async fn reconcile_once(
    client: &Client,
    namespace: &str,
    service_name: &str,
    webhook_name: &str,
) -> Result<(), OperatorError> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let names = SecretNames::new(service_name);
    let now = Utc::now();

    let ca = get_secret(&secrets, &names.ca).await?;
    let ca_new = get_secret(&secrets, &names.ca_new).await?;

    let mut ca_changed = false;

    let active_ca = match ca {
        None => {
            info!(namespace, "ca_bootstrap");
            let issued = generate_ca(&format!("{service_name}-ca"))?;
            let secret = build_secret(
                &names.ca,
                namespace,
                &[(KEY_TLS_CERT, &issued.cert_pem), (KEY_TLS_KEY, &issued.key_pem)],
                issued.not_after,
            );
            apply_secret(&secrets, &secret).await?;
            ca_changed = true;
            secret
        }
        Some(existing) => {
            let not_after = not_after_of(&existing).unwrap_or(now);
            if now + CA_RENEW_THRESHOLD >= not_after && ca_new.is_none() {
                info!(namespace, "ca_rollover_started");
                let issued = generate_ca(&format!("{service_name}-ca"))?;
                let secret = build_secret(
                    &names.ca_new,
                    namespace,
                    &[(KEY_TLS_CERT, &issued.cert_pem), (KEY_TLS_KEY, &issued.key_pem)],
                    issued.not_after,
                );
                apply_secret(&secrets, &secret).await?;
                ca_changed = true;
            } else if now >= not_after {
                if let Some(new_ca) = get_secret(&secrets, &names.ca_new).await? {
                    info!(namespace, "ca_promoted");
                    let mut promoted = new_ca;
                    promoted.metadata.name = Some(names.ca.clone());
                    promoted.metadata.resource_version = None;
                    apply_secret(&secrets, &promoted).await?;
                    secrets
                        .delete(&names.ca_new, &Default::default())
                        .await
                        .map_err(OperatorError::Apply)?;
                    ca_changed = true;
                } else {
                    warn!(namespace, "ca_expired_with_no_rollover_pending");
                }
            }
            existing
        }
    };

    let pending_ca_new = get_secret(&secrets, &names.ca_new).await?;
    let current_ca = get_secret(&secrets, &names.ca).await?.unwrap_or(active_ca);

    // New server certs are issued against the incoming CA as soon as rollover
    // starts, but the old CA must stay in the trust bundle until it's
    // promoted (deleted) — otherwise any client still holding only the old
    // chain loses trust a beat before every replica has the new cert.
    let signing_ca = pending_ca_new.as_ref().unwrap_or(&current_ca);
    let ca_cert_pem = cert_pem_of(signing_ca, KEY_TLS_CERT)
        .ok_or_else(|| OperatorError::Cert("signing CA secret missing tls.crt".to_string()))?;
    let ca_key_pem = cert_pem_of(signing_ca, KEY_TLS_KEY)
        .ok_or_else(|| OperatorError::Cert("signing CA secret missing tls.key".to_string()))?;
    let signing_ca_name = signing_ca.metadata.name.clone().unwrap_or_default();

    let old_ca_pem_during_rollover = pending_ca_new
        .is_some()
        .then(|| cert_pem_of(&current_ca, KEY_TLS_CERT))
        .flatten();
    let trust_bundle_pem = build_trust_bundle(&ca_cert_pem, old_ca_pem_during_rollover.as_deref());

    let server = get_secret(&secrets, &names.server).await?;
    let needs_issuance = match &server {
        None => true,
        Some(existing) => {
            let not_after = not_after_of(existing).unwrap_or(now);
            let signed_by = existing
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(ANNOTATION_SIGNED_BY))
                .cloned()
                .unwrap_or_default();
            now + SERVER_RENEW_THRESHOLD >= not_after || signed_by != signing_ca_name
        }
    };

    if needs_issuance {
        info!(namespace, service_name, "server_cert_issued");
        let issued = generate_server_cert(service_name, namespace, &ca_cert_pem, &ca_key_pem)?;
        let mut secret = build_secret(
            &names.server,
            namespace,
            &[
                (KEY_TLS_CERT, &issued.cert_pem),
                (KEY_TLS_KEY, &issued.key_pem),
                (KEY_CA_CERT, &trust_bundle_pem),
            ],
            issued.not_after,
        );
        secret
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_SIGNED_BY.to_string(), signing_ca_name);
        apply_secret(&secrets, &secret).await?;
    }

    if ca_changed || needs_issuance {
        patch_webhook_ca_bundle(client, webhook_name, &trust_bundle_pem).await;
    }

    Ok(())
}

/// Patch the `ValidatingWebhookConfiguration`'s `caBundle` on every webhook
/// entry. Failure is logged but non-fatal (spec.md §4.8, §7).
async fn patch_webhook_ca_bundle(client: &Client, webhook_name: &str, ca_cert_pem: &str) {
    use base64::Engine;

    let webhooks: Api<ValidatingWebhookConfiguration> = Api::all(client.clone());
    let ca_bundle = base64::engine::general_purpose::STANDARD.encode(ca_cert_pem.as_bytes());

    let current = match webhooks.get(webhook_name).await {
        Ok(w) => w,
        Err(e) => {
            warn!(webhook_name, error = %e, "webhook_ca_bundle_patch_failed");
            return;
        }
    };

    let entries = current.webhooks.as_ref().map(|w| w.len()).unwrap_or(0);
    let patch = serde_json::json!({
        "webhooks": (0..entries).map(|_| serde_json::json!({"clientConfig": {"caBundle": ca_bundle}})).collect::<Vec<_>>()
    });

    if let Err(e) = webhooks
        .patch(
            webhook_name,
            &PatchParams::apply("kubetemplater-certs"),
            &Patch::Merge(&patch),
        )
        .await
    {
        warn!(webhook_name, error = %e, "webhook_ca_bundle_patch_failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_ca_produces_pem() {
        let issued = generate_ca("test-ca").unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(issued.not_after > Utc::now());
    }

    #[test]
    fn generate_server_cert_is_signed_by_the_ca() {
        let ca = generate_ca("test-ca").unwrap();
        let server = generate_server_cert("svc", "default", &ca.cert_pem, &ca.key_pem).unwrap();
        assert!(server.cert_pem.contains("BEGIN CERTIFICATE"));
        assert_ne!(server.cert_pem, ca.cert_pem);
    }

    #[test]
    fn secret_names_derive_from_base() {
        let names = SecretNames::new("kubetemplater-webhook");
        assert_eq!(names.ca, "kubetemplater-webhook-ca");
        assert_eq!(names.ca_new, "kubetemplater-webhook-ca-new");
        assert_eq!(names.server, "kubetemplater-webhook");
    }

    #[test]
    fn not_after_roundtrips_through_secret_annotation() {
        let issued = generate_ca("x").unwrap();
        let secret = build_secret("s", "ns", &[(KEY_TLS_CERT, &issued.cert_pem)], issued.not_after);
        let parsed = not_after_of(&secret).unwrap();
        assert_eq!(parsed.timestamp(), issued.not_after.timestamp());
    }

    #[test]
    fn cert_pem_of_reads_back_written_data() {
        let issued = generate_ca("x").unwrap();
        let secret = build_secret("s", "ns", &[(KEY_TLS_CERT, &issued.cert_pem)], issued.not_after);
        assert_eq!(cert_pem_of(&secret, KEY_TLS_CERT), Some(issued.cert_pem));
    }

    #[test]
    fn trust_bundle_is_just_the_signing_ca_outside_a_rollover() {
        let bundle = build_trust_bundle("NEW-CA-PEM", None);
        assert_eq!(bundle, "NEW-CA-PEM");
    }

    #[test]
    fn trust_bundle_includes_both_cas_during_a_rollover() {
        let bundle = build_trust_bundle("NEW-CA-PEM", Some("OLD-CA-PEM"));
        assert!(bundle.contains("NEW-CA-PEM"));
        assert!(bundle.contains("OLD-CA-PEM"));
    }

    #[test]
    fn trust_bundle_does_not_duplicate_an_identical_old_ca() {
        let bundle = build_trust_bundle("SAME-CA-PEM", Some("SAME-CA-PEM"));
        assert_eq!(bundle, "SAME-CA-PEM");
    }
}
