use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub influx_url: String,
    pub influx_token: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            influx_url: env_or("INFLUXDB_URL", "http://localhost:8086"),
            influx_token: env_or("INFLUXDB_TOKEN", ""),
            influx_org: env_or("INFLUXDB_ORG", "cryptocurrency"),
            influx_bucket: env_or("INFLUXDB_BUCKET", "crypto_data"),
            port: env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3001),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}
