//! Lease-based leader election.
//!
//! One replica holds the `gitjob-controller-leader` Lease in the controller
//! namespace. Acquisition blocks at startup; losing the lease afterwards is
//! fatal and the process exits so a supervisor can restart it.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LEASE_NAME: &str = "gitjob-controller-leader";
const LEASE_DURATION_SECS: i64 = 30;
const RETRY_INTERVAL_SECS: u64 = 5;
const RENEW_INTERVAL_SECS: u64 = 10;

pub struct LeaderElector {
    client: Client,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str) -> Self {
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("gitjob-controller-{}", std::process::id()));
        Self {
            client,
            namespace: namespace.to_string(),
            identity,
        }
    }

    fn api(&self) -> Api<Lease> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Block until this replica holds the lease.
    pub async fn acquire(&self) -> Result<(), kube::Error> {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(identity = %self.identity, "acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!("leader lease held elsewhere; retrying");
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!("leader lease update conflicted; retrying");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(std::time::Duration::from_secs(RETRY_INTERVAL_SECS)).await;
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let api = self.api();
        let now = Utc::now();
        match api.get_opt(LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(LEASE_NAME.to_string()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(LEASE_DURATION_SECS as i32),
                        acquire_time: Some(MicroTime(now)),
                        renew_time: Some(MicroTime(now)),
                        lease_transitions: Some(0),
                        ..Default::default()
                    }),
                };
                match api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(lease) => {
                let spec = lease.spec.clone().unwrap_or_default();
                let holder = spec.holder_identity.as_deref().unwrap_or_default();
                let ours = holder == self.identity;
                if !ours && !lease_expired(&lease, now) {
                    return Ok(false);
                }
                let transitions = spec.lease_transitions.unwrap_or_default() + i32::from(!ours);
                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": lease.metadata.resource_version },
                    "spec": {
                        "holderIdentity": self.identity,
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                        "acquireTime": MicroTime(now),
                        "renewTime": MicroTime(now),
                        "leaseTransitions": transitions,
                    }
                });
                api.patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(patch))
                    .await?;
                Ok(true)
            }
        }
    }

    /// Renew the lease until shutdown. Returns an error when the lease is
    /// lost; the caller treats that as fatal.
    pub async fn keep_renewed(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let api = self.api();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(std::time::Duration::from_secs(RENEW_INTERVAL_SECS)) => {}
            }
            let lease = api.get(LEASE_NAME).await?;
            let holder = lease
                .spec
                .as_ref()
                .and_then(|s| s.holder_identity.as_deref())
                .unwrap_or_default();
            if holder != self.identity {
                anyhow::bail!("leader lease taken over by {holder}");
            }
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": lease.metadata.resource_version },
                "spec": { "renewTime": MicroTime(Utc::now()) }
            });
            if let Err(e) = api
                .patch(LEASE_NAME, &PatchParams::default(), &Patch::Merge(patch))
                .await
            {
                warn!(error = %e, "leader lease renewal failed");
                return Err(e.into());
            }
        }
    }
}

fn lease_expired(lease: &Lease, now: DateTime<Utc>) -> bool {
    let Some(spec) = &lease.spec else {
        return true;
    };
    let duration = spec
        .lease_duration_seconds
        .map_or(LEASE_DURATION_SECS, i64::from);
    match &spec.renew_time {
        Some(renew) => renew.0 + chrono::Duration::seconds(duration) < now,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(renewed_secs_ago: i64, duration: i32) -> Lease {
        Lease {
            spec: Some(LeaseSpec {
                holder_identity: Some("other".to_string()),
                lease_duration_seconds: Some(duration),
                renew_time: Some(MicroTime(
                    Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
                )),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!lease_expired(&lease(5, 30), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(&lease(60, 30), Utc::now()));
    }

    #[test]
    fn lease_without_renew_time_is_expired() {
        let empty = Lease::default();
        assert!(lease_expired(&empty, Utc::now()));
    }
}
