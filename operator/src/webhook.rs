//! Admission webhook serving the Shoot validation and registering itself.
use crate::{
    admission::ShootValidator,
    health::{self, Probes, Readiness, GARDEN_INFORMER_SYNC, WEBHOOK_SERVER},
    heartbeat::KubeLeaseStore,
    leader::LeaderElector,
    metrics::AdmissionMetrics,
    options::{ClientConfig, WebhookConfig},
    Error, Metrics, Result,
};
use actix_web::{
    dev::Server,
    middleware, post,
    web::{self, Data},
    App, HttpResponse, HttpServer, Responder,
};
use common::{context::get_instance_name, extension_label, ConfigDecoder, Shoot, EXTENSION_NAME, EXTENSION_TYPE};
use k8s_openapi::{
    api::admissionregistration::v1::{
        RuleWithOperations, ServiceReference, ValidatingWebhook, ValidatingWebhookConfiguration,
        WebhookClientConfig,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
    ByteString,
};
use kube::{
    api::{Api, DynamicObject, Patch, PatchParams},
    config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
    core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview},
    runtime::{watcher::{self, watcher}, WatchStreamExt},
    Client,
};
use std::{collections::BTreeMap, fs::File, future::Future, io::BufReader, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub static WEBHOOK_PATH: &str = "/webhooks/validate";

#[derive(Clone)]
pub struct WebhookState {
    pub validator: ShootValidator,
    pub metrics: AdmissionMetrics,
}

fn decode(obj: Option<&DynamicObject>) -> common::Result<Option<Shoot>> {
    obj.map(|o| {
        serde_json::to_value(o)
            .map_err(common::Error::SerializationError)
            .and_then(Shoot::from_value)
    })
    .transpose()
}

/// Run the validator against an admission request
pub fn admit(validator: &ShootValidator, req: &AdmissionRequest<DynamicObject>) -> common::Result<()> {
    let new = decode(req.object.as_ref())?.ok_or(common::Error::InvalidShoot)?;
    let old = decode(req.old_object.as_ref())?;
    validator.validate(&new, old.as_ref())
}

/// Answer an admission review, denying with the validation error
#[must_use]
pub fn review(state: &WebhookState, body: AdmissionReview<DynamicObject>) -> AdmissionReview<DynamicObject> {
    state.metrics.requests.inc();
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            warn!("invalid admission review: {e}");
            state.metrics.denied.inc();
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };
    let resp = AdmissionResponse::from(&req);
    match admit(&state.validator, &req) {
        Ok(()) => {
            debug!(uid = %req.uid, "accepted shoot {}/{}", req.namespace.as_deref().unwrap_or_default(), req.name);
            resp.into_review()
        }
        Err(e) => {
            info!(uid = %req.uid, "denied shoot {}/{}: {e}", req.namespace.as_deref().unwrap_or_default(), req.name);
            state.metrics.denied.inc();
            resp.deny(e.to_string()).into_review()
        }
    }
}

#[post("/webhooks/validate")]
async fn validate(state: Data<WebhookState>, body: web::Json<AdmissionReview<DynamicObject>>) -> impl Responder {
    HttpResponse::Ok().json(review(&state, body.into_inner()))
}

pub fn configure_webhook(cfg: &mut web::ServiceConfig) {
    cfg.service(validate);
}

/// Make aws-lc-rs the process wide rustls provider; kube pulls in ring as well
pub fn install_crypto_provider() {
    if rustls::crypto::aws_lc_rs::default_provider().install_default().is_err() {
        debug!("a rustls crypto provider is already installed");
    }
}

fn tls_config(cert: &Path, key: &Path) -> Result<rustls::ServerConfig> {
    let mut certs = BufReader::new(File::open(cert).map_err(Error::IoError)?);
    let certs = rustls_pemfile::certs(&mut certs)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::IoError)?;
    let mut keys = BufReader::new(File::open(key).map_err(Error::IoError)?);
    let key = rustls_pemfile::private_key(&mut keys)
        .map_err(Error::IoError)?
        .ok_or_else(|| Error::TlsError(format!("no private key in {}", key.display())))?;
    rustls::ServerConfig::builder_with_provider(Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::TlsError(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::TlsError(e.to_string()))
}

/// Webhook server, TLS when the certificate directory holds a key pair
pub fn webhook_server(config: &WebhookConfig, state: WebhookState) -> Result<Server> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure_webhook)
    });
    let server = match (config.cert_path(), config.key_path()) {
        (Some(cert), Some(key)) if cert.exists() && key.exists() => {
            info!("serving the webhook on https://{addr}{WEBHOOK_PATH}");
            server.bind_rustls_0_23(&addr, tls_config(&cert, &key)?)
        }
        _ => {
            warn!("no certificate found, serving the webhook on http://{addr}{WEBHOOK_PATH}");
            server.bind(&addr)
        }
    }
    .map_err(Error::IoError)?;
    Ok(server.disable_signals().shutdown_timeout(5).run())
}

/// ValidatingWebhookConfiguration routing labelled Shoots to this webhook
#[must_use]
pub fn registration(
    name: &str,
    extension_type: &str,
    client: &ClientConfig,
    ca_bundle: Option<Vec<u8>>,
) -> ValidatingWebhookConfiguration {
    let client_config = match client {
        ClientConfig::Service { namespace, name, port } => WebhookClientConfig {
            service: Some(ServiceReference {
                name: name.clone(),
                namespace: namespace.clone(),
                path: Some(WEBHOOK_PATH.to_string()),
                port: Some(i32::from(*port)),
            }),
            ca_bundle: ca_bundle.map(ByteString),
            url: None,
        },
        ClientConfig::Url(url) => WebhookClientConfig {
            url: Some(format!("{}{WEBHOOK_PATH}", url.trim_end_matches('/'))),
            ca_bundle: ca_bundle.map(ByteString),
            service: None,
        },
    };
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        webhooks: Some(vec![ValidatingWebhook {
            name: format!("validation.{extension_type}.extensions.gardener.cloud"),
            admission_review_versions: vec!["v1".to_string()],
            client_config,
            failure_policy: Some("Fail".to_string()),
            side_effects: "None".to_string(),
            timeout_seconds: Some(10),
            object_selector: Some(LabelSelector {
                match_labels: Some(BTreeMap::from([(extension_label(extension_type), "true".to_string())])),
                ..LabelSelector::default()
            }),
            rules: Some(vec![RuleWithOperations {
                api_groups: Some(vec!["core.gardener.cloud".to_string()]),
                api_versions: Some(vec!["v1beta1".to_string()]),
                operations: Some(vec!["CREATE".to_string(), "UPDATE".to_string()]),
                resources: Some(vec!["shoots".to_string()]),
                scope: Some("Namespaced".to_string()),
            }]),
            ..ValidatingWebhook::default()
        }]),
    }
}

/// Server-side apply the webhook registration
pub async fn register(client: Client, config: &WebhookConfig) -> Result<()> {
    let ca_bundle = match config.ca_path() {
        Some(path) if path.exists() => Some(std::fs::read(&path).map_err(Error::IoError)?),
        _ => None,
    };
    let name = &config.extension_name;
    let vwc = registration(name, EXTENSION_TYPE, &config.client, ca_bundle);
    let api = Api::<ValidatingWebhookConfiguration>::all(client);
    api.patch(name, &PatchParams::apply(EXTENSION_NAME).force(), &Patch::Apply(&vwc))
        .await
        .map_err(Error::KubeError)?;
    info!("registered ValidatingWebhookConfiguration {name}");
    Ok(())
}

/// Client for the cluster a kubeconfig file points to
pub async fn kubeconfig_client(path: &Path) -> Result<Client> {
    let invalid = |e: KubeconfigError| Error::InvalidOption(format!("kubeconfig {}: {e}", path.display()));
    let kubeconfig = Kubeconfig::read_from(path).map_err(invalid)?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(invalid)?;
    Client::try_from(config).map_err(Error::KubeError)
}

/// Register once elected, then hold the lease until the token is cancelled
///
/// Without an elector every replica registers.
pub async fn register_when_leading<F, Fut>(
    elector: Option<&LeaderElector>,
    token: &CancellationToken,
    register: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let Some(elector) = elector else {
        register().await?;
        token.cancelled().await;
        return Ok(());
    };
    match elector.acquire(token).await {
        Err(Error::Cancelled) => return Ok(()),
        res => res?,
    }
    register().await?;
    elector.hold(token).await
}

/// Serve the webhook until the token is cancelled
///
/// `client` reaches the cluster the webhook runs in and holds the leader
/// lease. The registration goes to the garden cluster when one is configured.
pub async fn run(config: WebhookConfig, client: Client, token: CancellationToken) -> Result<()> {
    let validator = ShootValidator::new(EXTENSION_TYPE, ConfigDecoder::default())?;
    let metrics = Metrics::default();
    let readiness = Readiness::default();
    readiness.register(WEBHOOK_SERVER).await;

    let garden = match &config.garden_kubeconfig {
        Some(path) => kubeconfig_client(path).await?,
        None => client.clone(),
    };
    let mut cache = None;
    if config.garden_kubeconfig.is_some() {
        readiness.register(GARDEN_INFORMER_SYNC).await;
        let api = Api::<ValidatingWebhookConfiguration>::all(garden.clone());
        let selector = format!("metadata.name={}", config.extension_name);
        let events = watcher(api, watcher::Config::default().fields(&selector)).default_backoff();
        cache = Some(tokio::spawn(health::sync_cache(
            events,
            readiness.clone(),
            GARDEN_INFORMER_SYNC,
            token.clone(),
        )));
    }

    let state = WebhookState {
        validator,
        metrics: metrics.admission.clone(),
    };
    let probes = Probes {
        readiness: readiness.clone(),
        heartbeat: None,
    };
    let servers = [
        health::spawn_server("webhook", webhook_server(&config, state)?, token.clone()),
        health::spawn_server(
            "metrics",
            health::metrics_server(&config.metrics_bind_address, metrics, Arc::default())?,
            token.clone(),
        ),
        health::spawn_server(
            "probes",
            health::probe_server(&config.health_probe_bind_address, probes)?,
            token.clone(),
        ),
    ];
    readiness.set(WEBHOOK_SERVER, true).await;

    let le = &config.leader_election;
    let elector = le.enabled.then(|| {
        LeaderElector::new(
            Arc::new(KubeLeaseStore::new(client.clone())),
            le.clone(),
            &get_instance_name(),
        )
    });
    let result = register_when_leading(elector.as_ref(), &token, || register(garden, &config)).await;
    token.cancel();
    readiness.set(WEBHOOK_SERVER, false).await;
    for server in servers {
        let _ = server.await;
    }
    if let Some(cache) = cache {
        let _ = cache.await;
    }
    result
}
