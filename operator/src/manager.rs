use crate::{
    backoff::Backoff,
    controller::{error_policy, reconcile},
    events::{EventPublisher, KubeEventPublisher},
    health::{self, Probes, Readiness, INFORMER_SYNC},
    heartbeat::{Heartbeat, KubeLeaseStore, LeaseStore},
    leader::LeaderElector,
    options::{ControllerConfig, ManagerConfig},
    store::{ExtensionStore, KubeExtensionStore},
    Actuator, Error, Metrics, Result,
};
use chrono::{DateTime, Utc};
use common::{context::get_instance_name, Extension, EXTENSION_NAME};
use futures::{future, Stream, StreamExt, TryStreamExt};
use kube::{
    api::{Api, ListParams},
    client::Client,
    runtime::{
        controller::{self, Controller},
        reflector,
        watcher::{self, watcher, Config},
        WatchStreamExt,
    },
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// Context for our reconciler
pub struct Context {
    /// Extension and Cluster access
    pub store: Arc<dyn ExtensionStore>,
    /// The extension implementation
    pub actuator: Arc<dyn Actuator>,
    pub events: Arc<dyn EventPublisher>,
    pub config: ControllerConfig,
    /// Per object retry delays
    pub backoff: Backoff,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Stops in-flight actuator calls on shutdown
    pub cancel: CancellationToken,
}

impl Context {
    #[must_use]
    pub fn new(
        store: Arc<dyn ExtensionStore>,
        actuator: Arc<dyn Actuator>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            actuator,
            events,
            config,
            backoff: Backoff::default(),
            diagnostics: Arc::default(),
            metrics: Metrics::default(),
            cancel,
        }
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    pub reporter: String,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: common::context::get_client_name(),
        }
    }
}

/// Controller over a stream of Extension watch events
///
/// Extensions of another type or class are dropped before they reach the
/// work queue. They stay in the cache, which nothing else reads.
pub fn extension_controller<S>(events: S, config: &ControllerConfig, token: CancellationToken) -> Controller<Extension>
where
    S: Stream<Item = watcher::Result<watcher::Event<Extension>>> + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let handled = config.clone();
    let objects = events
        .reflect(writer)
        .applied_objects()
        .try_filter(move |ext| future::ready(handled.handles(ext)));
    Controller::for_stream(objects, reader)
        .with_config(controller::Config::default().concurrency(config.max_concurrent_reconciles))
        .graceful_shutdown_on(token.cancelled_owned())
}

/// Manager owning the Extension controller, the heartbeat and the leader election
pub struct Manager {
    config: ManagerConfig,
    client: Client,
    actuator: Arc<dyn Actuator>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
    readiness: Readiness,
}

impl Manager {
    #[must_use]
    pub fn new(config: ManagerConfig, client: Client, actuator: Arc<dyn Actuator>) -> Self {
        Self {
            config,
            client,
            actuator,
            metrics: Metrics::default(),
            diagnostics: Arc::default(),
            readiness: Readiness::default(),
        }
    }

    /// Run until the token is cancelled; losing leadership is an error
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        // Ensure CRD is installed before loop-watching
        let exts = Api::<Extension>::all(self.client.clone());
        exts.list(&ListParams::default().limit(1)).await.map_err(|e| {
            warn!("is the crd installed? please run: cargo run --bin crdgen | kubectl apply -f -");
            Error::KubeError(e)
        })?;

        let leases: Arc<dyn LeaseStore> = Arc::new(KubeLeaseStore::new(self.client.clone()));
        let heartbeat = Heartbeat::new(
            leases.clone(),
            self.config.heartbeat.clone(),
            EXTENSION_NAME,
            self.metrics.heartbeat.clone(),
        );
        let probes = Probes {
            readiness: self.readiness.clone(),
            heartbeat: Some(heartbeat.health()),
        };
        let servers = [
            health::spawn_server(
                "metrics",
                health::metrics_server(
                    &self.config.metrics_bind_address,
                    self.metrics.clone(),
                    self.diagnostics.clone(),
                )?,
                token.clone(),
            ),
            health::spawn_server(
                "probes",
                health::probe_server(&self.config.health_probe_bind_address, probes)?,
                token.clone(),
            ),
        ];
        let heartbeat = tokio::spawn(heartbeat.run(token.clone()));

        let result = self.lead(leases, &token).await;
        token.cancel();
        let _ = heartbeat.await;
        for server in servers {
            let _ = server.await;
        }
        result
    }

    async fn lead(&self, leases: Arc<dyn LeaseStore>, token: &CancellationToken) -> Result<()> {
        let le = &self.config.leader_election;
        let elector = le
            .enabled
            .then(|| LeaderElector::new(leases, le.clone(), &get_instance_name()));
        if let Some(elector) = &elector {
            match elector.acquire(token).await {
                Err(Error::Cancelled) => return Ok(()),
                res => res?,
            }
        }
        let controller = self.run_controller(token.clone());
        tokio::pin!(controller);
        match &elector {
            None => {
                controller.await;
                Ok(())
            }
            Some(elector) => tokio::select! {
                _ = &mut controller => Ok(()),
                res = elector.hold(token) => {
                    if res.is_ok() {
                        controller.await;
                    }
                    res
                }
            },
        }
    }

    async fn run_controller(&self, token: CancellationToken) {
        let ctx = Arc::new(Context {
            diagnostics: self.diagnostics.clone(),
            metrics: self.metrics.clone(),
            ..Context::new(
                Arc::new(KubeExtensionStore::new(self.client.clone())),
                self.actuator.clone(),
                Arc::new(KubeEventPublisher::new(self.client.clone())),
                self.config.controller.clone(),
                token.clone(),
            )
        });
        self.readiness.register(INFORMER_SYNC).await;

        let exts = Api::<Extension>::all(self.client.clone());
        let events = watcher(exts, Config::default().any_semantic()).default_backoff();
        let controller = extension_controller(events, &self.config.controller, token);
        let cache = controller.store();
        let readiness = self.readiness.clone();
        tokio::spawn(async move {
            if cache.wait_until_ready().await.is_ok() {
                info!("extension informer synced");
                readiness.set(INFORMER_SYNC, true).await;
            }
        });

        info!(
            "starting controller for extension type {} ({} workers)",
            self.config.controller.extension_type, self.config.controller.max_concurrent_reconciles
        );
        controller
            .run(reconcile, error_policy, ctx)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("reconciled {}", obj.name),
                    Err(e) => debug!("reconcile attempt failed: {e}"),
                }
            })
            .await;
        info!("controller stopped");
    }
}
