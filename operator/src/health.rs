use crate::{heartbeat::HeartbeatHealth, manager::Diagnostics, Error, Metrics, Result};
use actix_web::{
    dev::Server,
    get, middleware,
    web::{self, Data},
    App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use futures::{future, Stream, StreamExt};
use kube::{
    runtime::{reflector, watcher, WatchStreamExt},
    Resource,
};
use serde::de::DeserializeOwned;
use std::{collections::BTreeMap, fmt::Debug, hash::Hash, sync::Arc};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Readiness check of the manager: the Extension informer is synced
pub static INFORMER_SYNC: &str = "informer-sync";
/// Readiness check of the webhook: the TLS server is listening
pub static WEBHOOK_SERVER: &str = "webhook-server";
/// Readiness check of the webhook: its garden cluster cache is synced
pub static GARDEN_INFORMER_SYNC: &str = "garden-informer-sync";

/// Named readiness checks, all of them must pass
#[derive(Clone, Default)]
pub struct Readiness {
    checks: Arc<RwLock<BTreeMap<&'static str, bool>>>,
}

impl Readiness {
    /// Add a check, failing until `set` marks it ready
    pub async fn register(&self, name: &'static str) {
        self.checks.write().await.entry(name).or_insert(false);
    }

    pub async fn set(&self, name: &'static str, ready: bool) {
        self.checks.write().await.insert(name, ready);
    }

    /// Names of the failing checks, empty when ready
    pub async fn failing(&self) -> Vec<&'static str> {
        self.checks
            .read()
            .await
            .iter()
            .filter(|(_, ready)| !**ready)
            .map(|(name, _)| *name)
            .collect()
    }
}

/// State shared with the probe endpoints
#[derive(Clone, Default)]
pub struct Probes {
    pub readiness: Readiness,
    pub heartbeat: Option<HeartbeatHealth>,
}

#[get("/healthz")]
async fn healthz(p: Data<Probes>, _req: HttpRequest) -> impl Responder {
    if let Some(hb) = &p.heartbeat {
        if !hb.is_fresh().await {
            return HttpResponse::ServiceUnavailable().json("heartbeat lease is not renewed");
        }
    }
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn readyz(p: Data<Probes>, _req: HttpRequest) -> impl Responder {
    let failing = p.readiness.failing().await;
    if failing.is_empty() {
        HttpResponse::Ok().json("ready")
    } else {
        HttpResponse::ServiceUnavailable().json(failing)
    }
}

#[get("/metrics")]
async fn render_metrics(m: Data<Metrics>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok()
        .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
        .body(m.render())
}

#[get("/")]
async fn index(d: Data<Arc<RwLock<Diagnostics>>>, _req: HttpRequest) -> impl Responder {
    let d = d.read().await.clone();
    HttpResponse::Ok().json(&d)
}

pub fn configure_probes(cfg: &mut web::ServiceConfig) {
    cfg.service(healthz).service(readyz);
}

pub fn configure_metrics(cfg: &mut web::ServiceConfig) {
    cfg.service(render_metrics).service(index);
}

pub fn probe_server(addr: &str, probes: Probes) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(probes.clone()))
            .configure(configure_probes)
    })
    .bind(addr)
    .map_err(Error::IoError)?
    .disable_signals()
    .shutdown_timeout(5);
    Ok(server.run())
}

pub fn metrics_server(addr: &str, metrics: Metrics, diagnostics: Arc<RwLock<Diagnostics>>) -> Result<Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(metrics.clone()))
            .app_data(Data::new(diagnostics.clone()))
            .wrap(middleware::Logger::default().exclude("/metrics"))
            .configure(configure_metrics)
    })
    .bind(addr)
    .map_err(Error::IoError)?
    .disable_signals()
    .shutdown_timeout(5);
    Ok(server.run())
}

/// Mirror a watch stream into a cache until the token is cancelled.
///
/// The check passes once the initial listing is in the cache.
pub async fn sync_cache<K, S>(events: S, readiness: Readiness, check: &'static str, token: CancellationToken)
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
    S: Stream<Item = watcher::Result<watcher::Event<K>>> + Send,
{
    readiness.register(check).await;
    let (reader, writer) = reflector::store::<K>();
    let mirror = events.reflect(writer).for_each(|event| {
        if let Err(e) = event {
            warn!("{check} watch failed: {e}");
        }
        future::ready(())
    });
    let synced = async {
        if reader.wait_until_ready().await.is_ok() {
            info!("{check} cache synced");
            readiness.set(check, true).await;
        }
    };
    tokio::select! {
        _ = token.cancelled() => {}
        _ = future::join(mirror, synced) => {}
    }
}

/// Run a server in the background until the token is cancelled
pub fn spawn_server(name: &'static str, server: Server, token: CancellationToken) -> tokio::task::JoinHandle<()> {
    let handle = server.handle();
    tokio::spawn(async move {
        token.cancelled().await;
        handle.stop(true).await;
    });
    tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("{name} server failed: {e}");
        }
        tracing::debug!("{name} server stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};
    use std::time::Duration;

    #[actix_web::test]
    async fn readyz_follows_registered_checks() {
        let probes = Probes::default();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(probes.clone()))
                .configure(configure_probes),
        )
        .await;
        let req = test::TestRequest::get().uri("/readyz").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        probes.readiness.register(INFORMER_SYNC).await;
        let req = test::TestRequest::get().uri("/readyz").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Vec<String> = test::read_body_json(resp).await;
        assert_eq!(body, vec![INFORMER_SYNC.to_string()]);

        probes.readiness.set(INFORMER_SYNC, true).await;
        let req = test::TestRequest::get().uri("/readyz").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cache_check_passes_once_listed() {
        use k8s_openapi::api::admissionregistration::v1::ValidatingWebhookConfiguration;
        type Event = watcher::Result<watcher::Event<ValidatingWebhookConfiguration>>;

        let readiness = Readiness::default();
        let token = CancellationToken::new();
        let (events, rx) = futures::channel::mpsc::unbounded::<Event>();
        let task = tokio::spawn(sync_cache(rx, readiness.clone(), GARDEN_INFORMER_SYNC, token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(readiness.failing().await, vec![GARDEN_INFORMER_SYNC]);

        events.unbounded_send(Ok(watcher::Event::Init)).unwrap();
        let mut vwc = ValidatingWebhookConfiguration::default();
        vwc.metadata.name = Some("gardener-extension-example-admission".into());
        events.unbounded_send(Ok(watcher::Event::InitApply(vwc))).unwrap();
        events.unbounded_send(Ok(watcher::Event::InitDone)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !readiness.failing().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    #[actix_web::test]
    async fn healthz_fails_on_stale_heartbeat() {
        let hb = HeartbeatHealth::new(Duration::from_secs(30));
        let probes = Probes {
            heartbeat: Some(hb.clone()),
            ..Probes::default()
        };
        let app = test::init_service(
            App::new()
                .app_data(Data::new(probes))
                .configure(configure_probes),
        )
        .await;
        let req = test::TestRequest::get().uri("/healthz").to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);

        hb.renewed(chrono::Utc::now() - chrono::Duration::seconds(120)).await;
        let req = test::TestRequest::get().uri("/healthz").to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[actix_web::test]
    async fn metrics_endpoint_renders_registry() {
        let metrics = Metrics::default();
        metrics.reconcile.runs.inc();
        let app = test::init_service(
            App::new()
                .app_data(Data::new(metrics))
                .app_data(Data::new(Arc::new(RwLock::new(Diagnostics::default()))))
                .configure(configure_metrics),
        )
        .await;
        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body = test::call_and_read_body(&app, req).await;
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("extension_reconcile_runs_total 1"));
        let req = test::TestRequest::get().uri("/").to_request();
        let diag: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(diag.get("last_event").is_some());
    }
}
