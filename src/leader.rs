//! Lease-based leader election (spec.md §4.8/§5: "lease 10s, renew 7s,
//! retry 2s, ReleaseOnCancel=true"). Only the certificate manager needs
//! leadership — the controllers and the admission webhook run unconditionally
//! on every replica.

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use tracing::info;

use crate::error::OperatorError;

pub const LEASE_DURATION: chrono::Duration = chrono::Duration::seconds(10);
pub const RENEW_INTERVAL: std::time::Duration = std::time::Duration::from_secs(7);
pub const RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

pub struct LeaseElection {
    client: Client,
    namespace: String,
    lease_name: String,
    holder_identity: String,
}

impl LeaseElection {
    pub fn new(client: Client, namespace: String, lease_name: impl Into<String>) -> Self {
        let lease_name = lease_name.into();
        let holder_identity = format!("{lease_name}-{}", std::process::id());
        LeaseElection {
            client,
            namespace,
            lease_name,
            holder_identity,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Returns `true` if this process holds the lease after the call —
    /// either it just acquired an unheld/expired lease, took over its own
    /// previously-held one, or successfully renewed.
    pub async fn acquire_or_renew(&self) -> Result<bool, OperatorError> {
        let leases = self.api();
        let now = MicroTime(Utc::now());

        let fresh = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.holder_identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.num_seconds() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                ..Default::default()
            }),
        };

        match leases.create(&Default::default(), &fresh).await {
            Ok(_) => {
                info!(lease = %self.lease_name, "lease_acquired");
                return Ok(true);
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {}
            Err(e) => return Err(OperatorError::Kube(e)),
        }

        let existing = leases.get(&self.lease_name).await.map_err(OperatorError::Kube)?;
        let spec = existing.spec.as_ref();

        let is_ours = spec.and_then(|s| s.holder_identity.as_deref()) == Some(self.holder_identity.as_str());
        let is_expired = spec.is_none_or(|s| {
            s.renew_time.as_ref().is_none_or(|t| {
                let duration = s.lease_duration_seconds.unwrap_or(LEASE_DURATION.num_seconds() as i32) as i64;
                Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(duration)
            })
        });

        if !is_ours && !is_expired {
            return Ok(false);
        }

        let now = MicroTime(Utc::now());
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.holder_identity,
                "leaseDurationSeconds": LEASE_DURATION.num_seconds() as i32,
                "acquireTime": now,
                "renewTime": now,
            }
        });

        match leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(_) => {
                if !is_ours {
                    info!(lease = %self.lease_name, "lease_taken_over_from_expired_holder");
                }
                Ok(true)
            }
            Err(kube::Error::Api(err)) if err.code == 409 => Ok(false),
            Err(e) => Err(OperatorError::Kube(e)),
        }
    }

    /// `ReleaseOnCancel=true`: give up the lease immediately on shutdown so a
    /// standby replica doesn't wait out the full lease duration for failover.
    pub async fn release(&self) -> Result<(), OperatorError> {
        let leases = self.api();
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": serde_json::Value::Null,
                "renewTime": serde_json::Value::Null,
            }
        });
        leases
            .patch(&self.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(OperatorError::Kube)?;
        info!(lease = %self.lease_name, "lease_released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_constants_match_documented_timings() {
        assert_eq!(LEASE_DURATION, chrono::Duration::seconds(10));
        assert_eq!(RENEW_INTERVAL, std::time::Duration::from_secs(7));
        assert_eq!(RETRY_INTERVAL, std::time::Duration::from_secs(2));
    }

    #[test]
    fn holder_identity_is_stable_and_process_scoped() {
        let a = format!("x-{}", std::process::id());
        let b = format!("x-{}", std::process::id());
        assert_eq!(a, b);
    }
}
