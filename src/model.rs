use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Latest observed values for a single coin, one record per `code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coin {
    pub code: String,
    pub name: String,
    pub rate: f64,
    pub volume: f64,
    pub market_cap: f64,
    pub rank: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_1h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_24h: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_7d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta_30d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circulating_supply: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Most recent market-wide snapshot. Metrics stay absent until the first
/// data point has been written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOverview {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_market_cap: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_liquidity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub btc_dominance: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// One downsampled bucket of a coin's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub timestamp: DateTime<Utc>,
    pub rate: f64,
    pub volume: f64,
    pub market_cap: f64,
}

/// Uniform envelope returned by every endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            message: None,
        }
    }

    pub fn error(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: None,
        }
    }

    pub fn failure(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
}
