//! Leader election on a coordination.k8s.io/v1 Lease.
//!
//! The lease is updated with compare-and-swap on its resourceVersion: a change
//! between read and write fails with a conflict, so two replicas can never
//! both believe they acquired it.
use crate::{heartbeat::LeaseStore, options::LeaderElectionConfig, Error, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    config: LeaderElectionConfig,
    identity: String,
}

impl LeaderElector {
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, config: LeaderElectionConfig, identity: &str) -> Self {
        Self {
            store,
            config,
            identity: identity.to_string(),
        }
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.lease_duration.as_secs()).unwrap_or(i32::MAX)
    }

    fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
        match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(i64::from(duration)),
            _ => true,
        }
    }

    /// One acquire or renew attempt; `Ok(false)` when someone else holds the lease
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let ns = &self.config.namespace;
        let now = Utc::now();
        let Some(mut lease) = self.store.get(ns, &self.config.lease_name).await? else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.lease_name.clone()),
                    namespace: Some(ns.clone()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(self.identity.clone()),
                    lease_duration_seconds: Some(self.lease_duration_seconds()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_transitions: Some(0),
                    ..Default::default()
                }),
            };
            return match self.store.create(ns, &lease).await {
                Ok(_) => {
                    info!(identity = %self.identity, "created leader lease");
                    Ok(true)
                }
                Err(Error::Conflict(_)) => Ok(false),
                Err(e) => Err(e),
            };
        };

        let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
        let holding = spec.holder_identity.as_deref() == Some(self.identity.as_str());
        if !holding {
            if !Self::is_expired(spec, now) {
                return Ok(false);
            }
            spec.holder_identity = Some(self.identity.clone());
            spec.acquire_time = Some(MicroTime(now));
            spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
        }
        spec.lease_duration_seconds = Some(self.lease_duration_seconds());
        spec.renew_time = Some(MicroTime(now));
        match self.store.replace(ns, &lease).await {
            Ok(_) => {
                if !holding {
                    info!(identity = %self.identity, "took over expired leader lease");
                }
                Ok(true)
            }
            Err(Error::Conflict(_)) => {
                debug!(identity = %self.identity, "leader lease changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Block until leadership is acquired, `Err(Cancelled)` on shutdown
    pub async fn acquire(&self, token: &CancellationToken) -> Result<()> {
        info!(identity = %self.identity, lease = %self.config.lease_name, "waiting for leadership");
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return Ok(());
                }
                Ok(false) => debug!("leader lease held by another replica"),
                Err(e) => warn!("failed to acquire leader lease, retrying: {e}"),
            }
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.retry_period) => {}
            }
        }
    }

    /// Keep renewing; returns `LeadershipLost` as soon as a renewal fails
    pub async fn hold(&self, token: &CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Err(e) = self.release().await {
                        warn!("could not release leader lease: {e}");
                    }
                    return Ok(());
                }
                _ = tokio::time::sleep(self.config.renew_period) => {}
            }
            match self.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    return Err(Error::LeadershipLost);
                }
            }
        }
    }

    /// Hand the lease over by clearing the holder
    pub async fn release(&self) -> Result<()> {
        let ns = &self.config.namespace;
        let Some(mut lease) = self.store.get(ns, &self.config.lease_name).await? else {
            return Ok(());
        };
        let Some(spec) = lease.spec.as_mut() else {
            return Ok(());
        };
        if spec.holder_identity.as_deref() != Some(self.identity.as_str()) {
            return Ok(());
        }
        spec.holder_identity = None;
        spec.renew_time = None;
        self.store.replace(ns, &lease).await?;
        info!(identity = %self.identity, "released leader lease");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryLeaseStore;
    use std::time::Duration;

    fn config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            enabled: true,
            lease_name: "gardener-extension-example".into(),
            namespace: "garden".into(),
            lease_duration: Duration::from_secs(15),
            renew_period: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    #[tokio::test]
    async fn only_one_replica_leads() {
        let store = Arc::new(MemoryLeaseStore::default());
        let a = LeaderElector::new(store.clone(), config(), "pod-a");
        let b = LeaderElector::new(store.clone(), config(), "pod-b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert!(a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over() {
        let store = Arc::new(MemoryLeaseStore::default());
        let a = LeaderElector::new(store.clone(), config(), "pod-a");
        assert!(a.try_acquire_or_renew().await.unwrap());
        let mut lease = store.lease("garden", "gardener-extension-example").unwrap();
        if let Some(spec) = lease.spec.as_mut() {
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }
        store.replace("garden", &lease).await.unwrap();

        let b = LeaderElector::new(store.clone(), config(), "pod-b");
        assert!(b.try_acquire_or_renew().await.unwrap());
        let spec = store.lease("garden", "gardener-extension-example").unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("pod-b"));
        assert_eq!(spec.lease_transitions, Some(1));
        assert!(!a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn release_lets_another_replica_in() {
        let store = Arc::new(MemoryLeaseStore::default());
        let a = LeaderElector::new(store.clone(), config(), "pod-a");
        let b = LeaderElector::new(store.clone(), config(), "pod-b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        a.release().await.unwrap();
        assert!(b.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn hold_reports_lost_leadership() {
        let store = Arc::new(MemoryLeaseStore::default());
        let a = LeaderElector::new(store.clone(), config(), "pod-a");
        let token = CancellationToken::new();
        a.acquire(&token).await.unwrap();
        store.fail(1);
        let err = a.hold(&token).await.unwrap_err();
        assert!(matches!(err, Error::LeadershipLost));
    }
}
