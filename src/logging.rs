use std::io::IsTerminal;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber once. An already installed subscriber is
/// left in place.
pub fn init_logging(config: &LoggingConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        let layer = if config.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_current_span(true)
                .with_filter(config.filter())
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_ansi(std::io::stdout().is_terminal())
                .with_filter(config.filter())
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("global tracing subscriber already installed");
        } else {
            tracing::info!(level = %config.level, json = config.json, "logging initialized");
        }
    });
}
