pub mod api;
pub mod config;
pub mod influx;
pub mod model;

pub use config::Config;
pub use influx::InfluxClient;
pub use model::{ApiResponse, Coin, HistoryPoint, MarketOverview};
