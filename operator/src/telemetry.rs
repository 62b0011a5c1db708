use crate::{
    options::{LogFormat, LogLevel, LogParameters},
    Error, Result,
};
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer, Registry};

impl LogLevel {
    #[must_use]
    pub fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Error => "error",
        }
    }
}

/// Filter from RUST_LOG, falling back to the configured level
fn env_filter(level: LogLevel) -> Result<EnvFilter> {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.directive()))
        .map_err(|e| Error::InvalidOption(format!("log level: {e}")))
}

/// Install the global tracing subscriber
pub fn init(params: &LogParameters) -> Result<()> {
    let logger = match params.log_format {
        LogFormat::Json => fmt::layer().json().with_current_span(true).boxed(),
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
    };
    let collector = Registry::default()
        .with(logger)
        .with(env_filter(params.log_level)?);
    tracing::subscriber::set_global_default(collector)
        .map_err(|e| Error::InvalidOption(format!("tracing subscriber: {e}")))
}
