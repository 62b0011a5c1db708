use crate::{Error, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use common::{Extension, ExtensionClass, EXTENSION_NAME, EXTENSION_TYPE, FINALIZER_SUFFIX};
use std::{collections::BTreeSet, path::PathBuf, time::Duration};

pub const LEASE_DURATION: Duration = Duration::from_secs(15);
pub const RENEW_PERIOD: Duration = Duration::from_secs(10);
pub const RETRY_PERIOD: Duration = Duration::from_secs(2);
/// Default name of the admission webhook and of its leader election lease
pub const ADMISSION_NAME: &str = "gardener-extension-example-admission";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Parameters {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the controller manager
    Manager(ManagerParameters),
    /// Start the extension admission webhook server
    Webhook(WebhookParameters),
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum WebhookConfigMode {
    Service,
    Url,
}

#[derive(Args, Debug, Clone)]
pub struct LogParameters {
    /// Verbosity of logging, RUST_LOG takes precedence when set
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,
    /// Log encoding format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,
}

#[derive(Args, Debug, Clone)]
pub struct ManagerParameters {
    /// The address the metrics endpoint binds to
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    pub metrics_bind_address: String,
    /// The address the probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    pub health_probe_bind_address: String,
    /// Extension classes this extension is responsible for [garden, seed or shoot], comma separated
    #[arg(long, env = "EXTENSION_CLASS")]
    pub extension_class: String,
    /// Max number of concurrent reconciliations
    #[arg(long, env = "MAX_CONCURRENT_RECONCILES", default_value_t = 5)]
    pub max_concurrent_reconciles: u16,
    /// Requeue interval of the controller
    #[arg(long, env = "RESYNC_INTERVAL", value_parser = parse_duration, default_value = "30s")]
    pub resync_interval: Duration,
    /// Treat every spec change as a reconcile request
    #[arg(long, env = "IGNORE_OPERATION_ANNOTATION")]
    pub ignore_operation_annotation: bool,
    /// Renew the heartbeat lease on the specified interval
    #[arg(long, env = "HEARTBEAT_RENEW_INTERVAL", value_parser = parse_duration, default_value = "30s")]
    pub heartbeat_renew_interval: Duration,
    /// Namespace of the heartbeat lease
    #[arg(long, env = "HEARTBEAT_NAMESPACE", default_value = "garden")]
    pub heartbeat_namespace: String,
    /// Enable leader election for the controller manager
    #[arg(long, env = "LEADER_ELECTION")]
    pub leader_election: bool,
    /// The leader election lease name
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = EXTENSION_NAME)]
    pub leader_election_id: String,
    /// Namespace of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "garden")]
    pub leader_election_namespace: String,
    #[command(flatten)]
    pub log: LogParameters,
}

#[derive(Args, Debug, Clone)]
pub struct WebhookParameters {
    /// The address the metrics endpoint binds to
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = ":8080")]
    pub metrics_bind_address: String,
    /// The address the probe endpoint binds to
    #[arg(long, env = "HEALTH_PROBE_BIND_ADDRESS", default_value = ":8081")]
    pub health_probe_bind_address: String,
    /// Address on which the webhook server listens on
    #[arg(long, env = "WEBHOOK_SERVER_HOST", default_value = "0.0.0.0")]
    pub webhook_server_host: String,
    /// Port on which the webhook server listens on
    #[arg(long, env = "WEBHOOK_SERVER_PORT", default_value_t = 9443)]
    pub webhook_server_port: u16,
    /// Directory containing the server key and certificate
    #[arg(long, env = "WEBHOOK_SERVER_CERT_DIR")]
    pub webhook_server_cert_dir: Option<PathBuf>,
    /// The server certificate file name
    #[arg(long, env = "WEBHOOK_SERVER_CERT_NAME", default_value = "tls.crt")]
    pub webhook_server_cert_name: String,
    /// The server certificate key file name
    #[arg(long, env = "WEBHOOK_SERVER_KEY_NAME", default_value = "tls.key")]
    pub webhook_server_key_name: String,
    /// How the api server reaches the webhook
    #[arg(long, env = "WEBHOOK_CONFIG_MODE", value_enum, default_value = "service")]
    pub webhook_config_mode: WebhookConfigMode,
    /// Namespace of the webhook service
    #[arg(long, env = "WEBHOOK_CONFIG_NAMESPACE", default_value = "garden")]
    pub webhook_config_namespace: String,
    /// Service port for the webhook when running in service mode
    #[arg(long, env = "WEBHOOK_CONFIG_SERVICE_PORT", default_value_t = 443,
          value_parser = clap::value_parser!(u16).range(1..))]
    pub webhook_config_service_port: u16,
    /// URL at which to find the webhook server, used with url mode only
    #[arg(long, env = "WEBHOOK_CONFIG_URL")]
    pub webhook_config_url: Option<String>,
    /// Name of the admission webhook, names its registration
    #[arg(long, env = "EXTENSION_NAME", default_value = ADMISSION_NAME)]
    pub extension_name: String,
    /// Only the elected replica registers the webhook
    #[arg(long, env = "LEADER_ELECTION")]
    pub leader_election: bool,
    /// The leader election lease name
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = ADMISSION_NAME)]
    pub leader_election_id: String,
    /// Namespace of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "garden")]
    pub leader_election_namespace: String,
    /// Kubeconfig of the garden cluster the webhook is registered in
    #[arg(long, env = "GARDEN_KUBECONFIG", visible_alias = "target-kubeconfig")]
    pub garden_kubeconfig: Option<PathBuf>,
    #[command(flatten)]
    pub log: LogParameters,
}

/// Parse durations like `30s`, `5m` or `1h30m`
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if s.is_empty() {
        return Err("duration cannot be empty".to_string());
    }
    let mut remaining = s;
    let mut total = 0u64;
    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return Err(format!(
                "expected a number at position {} in '{s}'",
                s.len() - remaining.len()
            ));
        }
        let num: u64 = remaining[..num_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{s}'"))?;
        remaining = &remaining[num_end..];
        let factor = match remaining.chars().next() {
            Some('h') => 3600,
            Some('m') => 60,
            Some('s') => 1,
            Some(unit) => {
                return Err(format!(
                    "invalid duration unit '{unit}' in '{s}' (expected h, m, or s)"
                ))
            }
            None => return Err(format!("missing unit suffix (h/m/s) in duration '{s}'")),
        };
        remaining = &remaining[1..];
        total = num
            .checked_mul(factor)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("duration '{s}' is too large"))?;
    }
    Ok(Duration::from_secs(total))
}

/// Parse a comma separated list of extension classes
pub fn parse_classes(s: &str) -> Result<BTreeSet<ExtensionClass>> {
    let classes = s
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::parse::<ExtensionClass>)
        .collect::<Result<BTreeSet<_>, String>>()
        .map_err(Error::InvalidOption)?;
    if classes.is_empty() {
        return Err(Error::InvalidOption("no extension class specified".to_string()));
    }
    Ok(classes)
}

/// Go style `:8080` listen addresses mean every interface
#[must_use]
pub fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn non_zero(name: &str, d: Duration) -> Result<Duration> {
    if d.is_zero() {
        return Err(Error::InvalidOption(format!("{name} must be greater than zero")));
    }
    Ok(d)
}

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub extension_type: String,
    pub finalizer: String,
    pub classes: BTreeSet<ExtensionClass>,
    pub max_concurrent_reconciles: u16,
    pub resync_interval: Duration,
    pub ignore_operation_annotation: bool,
}

impl ControllerConfig {
    /// Type and class filtering
    #[must_use]
    pub fn handles(&self, ext: &Extension) -> bool {
        ext.spec.extension_type == self.extension_type && self.classes.contains(&ext.class())
    }
}

#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub namespace: String,
    pub renew_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub enabled: bool,
    pub lease_name: String,
    pub namespace: String,
    pub lease_duration: Duration,
    pub renew_period: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    #[must_use]
    pub fn new(enabled: bool, lease_name: &str, namespace: &str) -> Self {
        Self {
            enabled,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            lease_duration: LEASE_DURATION,
            renew_period: RENEW_PERIOD,
            retry_period: RETRY_PERIOD,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ManagerConfig {
    pub metrics_bind_address: String,
    pub health_probe_bind_address: String,
    pub controller: ControllerConfig,
    pub heartbeat: HeartbeatConfig,
    pub leader_election: LeaderElectionConfig,
}

impl TryFrom<&ManagerParameters> for ManagerConfig {
    type Error = Error;

    fn try_from(p: &ManagerParameters) -> Result<Self> {
        if p.max_concurrent_reconciles == 0 {
            return Err(Error::InvalidOption(
                "max-concurrent-reconciles must be greater than zero".to_string(),
            ));
        }
        Ok(ManagerConfig {
            metrics_bind_address: bind_address(&p.metrics_bind_address),
            health_probe_bind_address: bind_address(&p.health_probe_bind_address),
            controller: ControllerConfig {
                extension_type: EXTENSION_TYPE.to_string(),
                finalizer: common::finalizer_name(FINALIZER_SUFFIX),
                classes: parse_classes(&p.extension_class)?,
                max_concurrent_reconciles: p.max_concurrent_reconciles,
                resync_interval: non_zero("resync-interval", p.resync_interval)?,
                ignore_operation_annotation: p.ignore_operation_annotation,
            },
            heartbeat: HeartbeatConfig {
                namespace: p.heartbeat_namespace.clone(),
                renew_interval: non_zero("heartbeat-renew-interval", p.heartbeat_renew_interval)?,
            },
            leader_election: LeaderElectionConfig::new(
                p.leader_election,
                &p.leader_election_id,
                &p.leader_election_namespace,
            ),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientConfig {
    Service { namespace: String, name: String, port: u16 },
    Url(String),
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub metrics_bind_address: String,
    pub health_probe_bind_address: String,
    pub host: String,
    pub port: u16,
    pub cert_dir: Option<PathBuf>,
    pub cert_name: String,
    pub key_name: String,
    pub client: ClientConfig,
    pub extension_name: String,
    pub leader_election: LeaderElectionConfig,
    pub garden_kubeconfig: Option<PathBuf>,
}

impl WebhookConfig {
    fn cert_file(&self, name: &str) -> Option<PathBuf> {
        self.cert_dir.as_ref().map(|d| d.join(name))
    }

    #[must_use]
    pub fn cert_path(&self) -> Option<PathBuf> {
        self.cert_file(&self.cert_name)
    }

    #[must_use]
    pub fn key_path(&self) -> Option<PathBuf> {
        self.cert_file(&self.key_name)
    }

    #[must_use]
    pub fn ca_path(&self) -> Option<PathBuf> {
        self.cert_file("ca.crt")
    }
}

impl TryFrom<&WebhookParameters> for WebhookConfig {
    type Error = Error;

    fn try_from(p: &WebhookParameters) -> Result<Self> {
        let client = match p.webhook_config_mode {
            WebhookConfigMode::Service => ClientConfig::Service {
                namespace: p.webhook_config_namespace.clone(),
                name: EXTENSION_NAME.to_string(),
                port: p.webhook_config_service_port,
            },
            WebhookConfigMode::Url => match p.webhook_config_url.as_deref() {
                Some(url) if url.starts_with("https://") => ClientConfig::Url(url.to_string()),
                Some(url) => {
                    return Err(Error::InvalidOption(format!(
                        "webhook-config-url must use https, got {url}"
                    )))
                }
                None => {
                    return Err(Error::InvalidOption(
                        "webhook-config-url is required in url mode".to_string(),
                    ))
                }
            },
        };
        Ok(WebhookConfig {
            metrics_bind_address: bind_address(&p.metrics_bind_address),
            health_probe_bind_address: bind_address(&p.health_probe_bind_address),
            host: p.webhook_server_host.clone(),
            port: p.webhook_server_port,
            cert_dir: p.webhook_server_cert_dir.clone(),
            cert_name: p.webhook_server_cert_name.clone(),
            key_name: p.webhook_server_key_name.clone(),
            client,
            extension_name: p.extension_name.clone(),
            leader_election: LeaderElectionConfig::new(
                p.leader_election,
                &p.leader_election_id,
                &p.leader_election_namespace,
            ),
            garden_kubeconfig: p.garden_kubeconfig.clone(),
        })
    }
}
