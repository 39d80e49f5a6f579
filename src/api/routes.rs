use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::collections::HashMap;

use crate::api::SharedClient;
use crate::model::{ApiResponse, Coin, HealthResponse, HistoryPoint, MarketOverview};

type ApiError = (StatusCode, Json<ApiResponse<()>>);
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now(),
    })
}

pub async fn get_top_coins(
    Query(params): Query<HashMap<String, String>>,
    State(client): State<SharedClient>,
) -> ApiResult<Vec<Coin>> {
    let limit = positive_or(&params, "limit", 100);

    match client.get_top_coins(limit).await {
        Ok(coins) => Ok(Json(ApiResponse::ok(coins))),
        Err(err) => Err(upstream_failure("Failed to fetch top coins", err)),
    }
}

pub async fn get_coin(
    Path(code): Path<String>,
    State(client): State<SharedClient>,
) -> ApiResult<Coin> {
    let code = code.to_uppercase();

    match client.get_coin_by_code(&code).await {
        Ok(Some(coin)) => Ok(Json(ApiResponse::ok(coin))),
        Ok(None) => Err(not_found("Coin not found")),
        Err(err) => Err(upstream_failure("Failed to fetch coin data", err)),
    }
}

pub async fn get_coin_history(
    Path(code): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    State(client): State<SharedClient>,
) -> ApiResult<Vec<HistoryPoint>> {
    let code = code.to_uppercase();
    let hours = positive_or(&params, "hours", 24);

    match client.get_coin_history(&code, hours).await {
        Ok(history) => Ok(Json(ApiResponse::ok(history))),
        Err(err) => Err(upstream_failure("Failed to fetch coin history", err)),
    }
}

pub async fn get_market_overview(State(client): State<SharedClient>) -> ApiResult<MarketOverview> {
    match client.get_market_overview().await {
        Ok(Some(overview)) => Ok(Json(ApiResponse::ok(overview))),
        Ok(None) => Err(not_found("Market overview data not available")),
        Err(err) => Err(upstream_failure("Failed to fetch market overview", err)),
    }
}

/// Lenient numeric query parameter: absent, non-numeric, or non-positive
/// values fall back to the default instead of rejecting the request.
fn positive_or(params: &HashMap<String, String>, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(default)
}

fn not_found(error: &str) -> ApiError {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error(error)))
}

fn upstream_failure(error: &str, err: anyhow::Error) -> ApiError {
    tracing::error!("{}: {:#}", error, err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::failure(error, err.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn positive_or_accepts_valid_values() {
        assert_eq!(positive_or(&params(&[("limit", "5")]), "limit", 100), 5);
        assert_eq!(positive_or(&params(&[("hours", "720")]), "hours", 24), 720);
    }

    #[test]
    fn positive_or_falls_back_on_bad_input() {
        assert_eq!(positive_or(&params(&[]), "limit", 100), 100);
        assert_eq!(positive_or(&params(&[("limit", "abc")]), "limit", 100), 100);
        assert_eq!(positive_or(&params(&[("limit", "-5")]), "limit", 100), 100);
        assert_eq!(positive_or(&params(&[("limit", "0")]), "limit", 100), 100);
        assert_eq!(positive_or(&params(&[("limit", "2.5")]), "limit", 100), 100);
    }
}
