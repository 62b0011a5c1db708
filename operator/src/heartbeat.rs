use crate::{metrics::HeartbeatMetrics, options::HeartbeatConfig, Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::coordination::v1::{Lease, LeaseSpec},
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
};
use kube::{
    api::{Api, PostParams},
    Client,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub static HEARTBEAT_LEASE_NAME: &str = "gardener-extension-heartbeat";

/// Number of renew intervals without success after which liveness fails
pub const STALE_INTERVALS: u32 = 3;

/// Minimal Lease access shared by the heartbeat and the leader election
#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>>;
    /// Fails with `Conflict` when the lease already exists
    async fn create(&self, namespace: &str, lease: &Lease) -> Result<Lease>;
    /// Guarded by the resourceVersion carried in `lease`
    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<Lease>;
}

pub struct KubeLeaseStore {
    client: Client,
}

impl KubeLeaseStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<Lease>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name).await.map_err(Error::KubeError)
    }

    async fn create(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let name = lease.metadata.name.clone().unwrap_or_default();
        api.create(&PostParams::default(), lease)
            .await
            .map_err(|e| Error::from_kube(e, &format!("lease {namespace}/{name}")))
    }

    async fn replace(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let name = lease.metadata.name.clone().unwrap_or_default();
        api.replace(&name, &PostParams::default(), lease)
            .await
            .map_err(|e| Error::from_kube(e, &format!("lease {namespace}/{name}")))
    }
}

/// Freshness of the heartbeat, read by the liveness probe
#[derive(Clone)]
pub struct HeartbeatHealth {
    interval: Duration,
    started: DateTime<Utc>,
    last_renewal: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl HeartbeatHealth {
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Utc::now(),
            last_renewal: Arc::new(RwLock::new(None)),
        }
    }

    pub async fn renewed(&self, at: DateTime<Utc>) {
        *self.last_renewal.write().await = Some(at);
    }

    pub async fn last_renewal(&self) -> Option<DateTime<Utc>> {
        *self.last_renewal.read().await
    }

    /// False once no renewal succeeded for `STALE_INTERVALS` intervals
    pub async fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        let reference = self.last_renewal().await.unwrap_or(self.started);
        let window = chrono::Duration::from_std(self.interval * STALE_INTERVALS)
            .unwrap_or(chrono::Duration::MAX);
        now - reference <= window
    }

    pub async fn is_fresh(&self) -> bool {
        self.is_fresh_at(Utc::now()).await
    }
}

/// Periodically renews the heartbeat lease, independently of leadership
pub struct Heartbeat {
    store: Arc<dyn LeaseStore>,
    config: HeartbeatConfig,
    holder: String,
    health: HeartbeatHealth,
    metrics: HeartbeatMetrics,
}

impl Heartbeat {
    #[must_use]
    pub fn new(
        store: Arc<dyn LeaseStore>,
        config: HeartbeatConfig,
        holder: &str,
        metrics: HeartbeatMetrics,
    ) -> Self {
        let health = HeartbeatHealth::new(config.renew_interval);
        Self {
            store,
            config,
            holder: holder.to_string(),
            health,
            metrics,
        }
    }

    #[must_use]
    pub fn health(&self) -> HeartbeatHealth {
        self.health.clone()
    }

    fn lease_duration_seconds(&self) -> i32 {
        i32::try_from(self.config.renew_interval.as_secs()).unwrap_or(i32::MAX)
    }

    /// Create the lease when absent, otherwise move its renewTime forward
    pub async fn renew(&self) -> Result<()> {
        let ns = &self.config.namespace;
        let now = Utc::now();
        match self.store.get(ns, HEARTBEAT_LEASE_NAME).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(HEARTBEAT_LEASE_NAME.to_string()),
                        namespace: Some(ns.clone()),
                        ..Default::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.holder.clone()),
                        lease_duration_seconds: Some(self.lease_duration_seconds()),
                        renew_time: Some(MicroTime(now)),
                        ..Default::default()
                    }),
                };
                self.store.create(ns, &lease).await?;
                info!("created heartbeat lease {ns}/{HEARTBEAT_LEASE_NAME}");
            }
            Some(mut lease) => {
                let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
                spec.holder_identity = Some(self.holder.clone());
                spec.lease_duration_seconds = Some(self.lease_duration_seconds());
                spec.renew_time = Some(MicroTime(now));
                self.store.replace(ns, &lease).await?;
                debug!("renewed heartbeat lease {ns}/{HEARTBEAT_LEASE_NAME}");
            }
        }
        self.health.renewed(now).await;
        Ok(())
    }

    /// Renew once per interval until cancelled; failures wait for the next tick
    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    match self.renew().await {
                        Ok(()) => {
                            self.metrics.renewals.inc();
                        }
                        Err(e) => {
                            self.metrics.failures.inc();
                            warn!("could not renew heartbeat lease: {e}");
                        }
                    }
                }
            }
        }
        debug!("heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MemoryLeaseStore;

    fn heartbeat(store: Arc<MemoryLeaseStore>) -> Heartbeat {
        let config = HeartbeatConfig {
            namespace: "garden".into(),
            renew_interval: Duration::from_secs(30),
        };
        Heartbeat::new(store, config, "gardener-extension-example", HeartbeatMetrics::default())
    }

    fn renew_time(store: &MemoryLeaseStore) -> Option<DateTime<Utc>> {
        store
            .lease("garden", HEARTBEAT_LEASE_NAME)
            .and_then(|l| l.spec)
            .and_then(|s| s.renew_time)
            .map(|t| t.0)
    }

    #[tokio::test]
    async fn first_renewal_creates_the_lease() {
        let store = Arc::new(MemoryLeaseStore::default());
        let hb = heartbeat(store.clone());
        hb.renew().await.unwrap();
        let spec = store.lease("garden", HEARTBEAT_LEASE_NAME).unwrap().spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("gardener-extension-example"));
        assert_eq!(spec.lease_duration_seconds, Some(30));
        assert!(hb.health().last_renewal().await.is_some());
    }

    #[tokio::test]
    async fn renewal_advances_renew_time() {
        let store = Arc::new(MemoryLeaseStore::default());
        let hb = heartbeat(store.clone());
        hb.renew().await.unwrap();
        let first = renew_time(&store).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        hb.renew().await.unwrap();
        assert!(renew_time(&store).unwrap() > first);
    }

    #[tokio::test(start_paused = true)]
    async fn run_renews_every_interval_and_survives_failures() {
        let store = Arc::new(MemoryLeaseStore::default());
        let hb = heartbeat(store.clone());
        let metrics = hb.metrics.clone();
        let token = CancellationToken::new();
        store.fail(1);
        let handle = tokio::spawn(hb.run(token.clone()));
        // first tick fails, the next ones succeed
        tokio::time::sleep(Duration::from_secs(61)).await;
        token.cancel();
        handle.await.unwrap();
        assert_eq!(metrics.failures.get(), 1);
        assert_eq!(metrics.renewals.get(), 2);
        assert!(store.lease("garden", HEARTBEAT_LEASE_NAME).is_some());
    }

    #[tokio::test]
    async fn staleness_is_detected_after_three_intervals() {
        let health = HeartbeatHealth::new(Duration::from_secs(30));
        let now = Utc::now();
        health.renewed(now).await;
        assert!(health.is_fresh_at(now + chrono::Duration::seconds(89)).await);
        assert!(health.is_fresh_at(now + chrono::Duration::seconds(90)).await);
        assert!(!health.is_fresh_at(now + chrono::Duration::seconds(91)).await);
    }
}
