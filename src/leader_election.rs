//! Lease based leader election, so that only one controller replica talks to the platform.

use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease as KubeLease, LeaseSpec as KubeLeaseSpec},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams},
    Client,
};
use tokio::{sync::oneshot::Sender, task::JoinHandle};

use crate::types::FIELD_MANAGER;

const LEASE_DURATION_SECONDS: i32 = 15;

/// A held lease, renewed in the background until [`Lease::join`] releases it.
pub struct Lease {
    join_handle: JoinHandle<()>,
    sender: Sender<()>,
}

impl Lease {
    /// Waits until the lease is free or expired, then takes it.
    pub async fn acquire_or_create(
        client: Client,
        namespace: &str,
        lease_name: &str,
        identity: &str,
    ) -> Result<Lease, kube::Error> {
        let lease_api: Api<KubeLease> = Api::namespaced(client, namespace);

        loop {
            match lease_api.get_opt(lease_name).await? {
                None => {
                    let lease = KubeLease {
                        metadata: ObjectMeta {
                            namespace: Some(namespace.to_string()),
                            name: Some(lease_name.to_string()),
                            ..Default::default()
                        },
                        spec: Some(held_spec(identity, 0, now())),
                    };
                    lease_api.create(&PostParams::default(), &lease).await?;
                    break;
                }
                Some(lease) => {
                    let spec = lease.spec.unwrap_or_default();
                    let held_by_us = spec.holder_identity.as_deref() == Some(identity);
                    if held_by_us || is_expired(&spec, Utc::now()) {
                        let transitions = spec.lease_transitions.unwrap_or(0);
                        let transitions = if held_by_us { transitions } else { transitions + 1 };
                        let lease = KubeLease {
                            metadata: ObjectMeta {
                                namespace: Some(namespace.to_string()),
                                name: Some(lease_name.to_string()),
                                ..Default::default()
                            },
                            spec: Some(held_spec(identity, transitions, now())),
                        };
                        lease_api
                            .patch(
                                lease_name,
                                &PatchParams::apply(FIELD_MANAGER).force(),
                                &Patch::Apply(&lease),
                            )
                            .await?;
                        break;
                    }

                    let wait = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS);
                    tracing::debug!(holder = ?spec.holder_identity, "lease is held, waiting");
                    tokio::time::sleep(Duration::from_secs(wait.max(1) as u64)).await;
                }
            }
        }

        let (sender, mut recv) = tokio::sync::oneshot::channel();
        let lease_name = lease_name.to_string();
        let join_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(renew_period());
            loop {
                tokio::select! {
                    _ = interval.tick() => (),
                    _ = &mut recv => break,
                }

                let patch = serde_json::json!({ "spec": { "renewTime": now() } });
                if let Err(error) = lease_api
                    .patch(&lease_name, &PatchParams::default(), &Patch::Merge(patch))
                    .await
                {
                    tracing::error!(%error, "failed to renew lease");
                }
            }

            let patch = serde_json::json!({
                "spec": {
                    "renewTime": Option::<()>::None,
                    "acquireTime": Option::<()>::None,
                    "holderIdentity": Option::<()>::None
                }
            });
            if let Err(error) = lease_api
                .patch(&lease_name, &PatchParams::default(), &Patch::Merge(patch))
                .await
            {
                tracing::error!(%error, "failed to release lease");
            }
        });

        Ok(Lease {
            join_handle,
            sender,
        })
    }

    /// Stops renewing and releases the lease.
    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        // The renewing task is gone already when the receiver is dropped.
        let _ = self.sender.send(());
        self.join_handle.await
    }
}

fn renew_period() -> Duration {
    Duration::from_secs((LEASE_DURATION_SECONDS / 3) as u64)
}

fn now() -> MicroTime {
    MicroTime(Utc::now())
}

fn held_spec(identity: &str, transitions: i32, at: MicroTime) -> KubeLeaseSpec {
    KubeLeaseSpec {
        acquire_time: Some(at.clone()),
        renew_time: Some(at),
        lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
        holder_identity: Some(identity.to_string()),
        lease_transitions: Some(transitions),
    }
}

/// Tells whether the holder stopped renewing the lease. A lease without holder is expired.
fn is_expired(spec: &KubeLeaseSpec, now: DateTime<Utc>) -> bool {
    if spec.holder_identity.is_none() {
        return true;
    }
    let Some(MicroTime(last)) = spec.renew_time.as_ref().or(spec.acquire_time.as_ref()) else {
        return true;
    };
    let duration = chrono::Duration::seconds(
        spec.lease_duration_seconds
            .unwrap_or(LEASE_DURATION_SECONDS)
            .into(),
    );
    match last.checked_add_signed(duration) {
        Some(expiry) => now > expiry,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_expired() {
        let t0 = Utc::now();
        let spec = held_spec("agent-0", 1, MicroTime(t0));

        assert!(!is_expired(&spec, t0 + chrono::Duration::seconds(10)));
        assert!(is_expired(&spec, t0 + chrono::Duration::seconds(16)));
    }

    #[test]
    fn test_is_expired_uses_renew_time() {
        let t0 = Utc::now();
        let mut spec = held_spec("agent-0", 1, MicroTime(t0));
        spec.renew_time = Some(MicroTime(t0 + chrono::Duration::seconds(10)));

        assert!(!is_expired(&spec, t0 + chrono::Duration::seconds(20)));
    }

    #[test]
    fn test_released_lease_is_expired() {
        let spec = KubeLeaseSpec {
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            lease_transitions: Some(3),
            ..Default::default()
        };
        assert!(is_expired(&spec, Utc::now()));
    }

    #[test]
    fn test_renew_period_is_shorter_than_lease() {
        assert!(renew_period() < Duration::from_secs(LEASE_DURATION_SECONDS as u64));
    }
}
