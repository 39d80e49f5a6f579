use anyhow::Result;
use tracing_subscriber::EnvFilter;

use crypto_dashboard_api::{api, Config, InfluxClient};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        url = %config.influx_url,
        org = %config.influx_org,
        bucket = %config.influx_bucket,
        "connecting to influxdb"
    );

    let client = InfluxClient::new(&config);
    api::start_server(client, config.port).await
}
