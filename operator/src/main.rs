use clap::Parser;
use controller::{
    options::{Commands, ManagerConfig, Parameters, WebhookConfig},
    telemetry, webhook, Error, ExampleActuator, Manager, Result,
};
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Cancel the token on ctrl-c or SIGTERM
fn handle_signals(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::warn!("cannot listen for SIGTERM: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            () = terminate => {},
        }
        tracing::info!("shutdown requested");
        token.cancel();
    });
}

async fn run(args: Parameters, token: CancellationToken) -> Result<()> {
    match args.command {
        Commands::Manager(params) => {
            let config = ManagerConfig::try_from(&params)?;
            let client = Client::try_default().await.map_err(Error::KubeError)?;
            Manager::new(config, client, Arc::new(ExampleActuator::default()))
                .run(token)
                .await
        }
        Commands::Webhook(params) => {
            let config = WebhookConfig::try_from(&params)?;
            let client = Client::try_default().await.map_err(Error::KubeError)?;
            webhook::run(config, client, token).await
        }
    }
}

#[tokio::main]
async fn main() {
    webhook::install_crypto_provider();
    let args = Parameters::parse();
    let log = match &args.command {
        Commands::Manager(p) => &p.log,
        Commands::Webhook(p) => &p.log,
    };
    if let Err(e) = telemetry::init(log) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    let token = CancellationToken::new();
    handle_signals(token.clone());
    if let Err(e) = run(args, token).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
