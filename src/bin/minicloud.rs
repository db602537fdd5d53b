//! minicloud: single-endpoint emulator of SQS-compatible queues,
//! SNS-compatible topics, and an S3-compatible object store.
//!
//! ## Configuration
//! - MINICLOUD_PORT: listen port (default 4566)
//! - MINICLOUD_HOST: externally visible host used in queue URLs
//!   (default: reuse each request's Host header)
//! - MINICLOUD_DEFAULT_REGION: region when no credential scope is present
//!   (default us-east-1)
//! - MINICLOUD_LOG: env-filter logging directives (default "info")
//! - MINICLOUD_INIT_CONFIG: path to a JSON init config applied at startup
//! - MINICLOUD_SPY_CAPACITY: spy event ring size (default 100)

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use minicloud::config::LOG_ENV_VAR;
use minicloud::http;
use minicloud::{App, AppConfig, InitConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();
    info!(
        port = config.port,
        region = %config.default_region,
        external_host = ?config.external_host,
        "starting minicloud"
    );

    let app = Arc::new(App::new(config.clone()));

    if let Some(ref path) = config.init_config_path {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            error!(path = %path, error = %e, "failed to read init config");
            e
        })?;
        let init = InitConfig::parse(&raw).map_err(|e| {
            error!(path = %path, error = %e, "failed to parse init config");
            e
        })?;
        app.apply_init(&init).await?;
    }

    http::serve(app).await?;
    Ok(())
}
