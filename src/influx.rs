use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::config::Config;
use crate::model::{Coin, HistoryPoint, MarketOverview};

/// The fields written per coin by the ingestion side. `code` and `name` are
/// tags on the same measurement.
const COIN_FIELDS: &[&str] = &[
    "rate",
    "volume",
    "market_cap",
    "rank",
    "delta_1h",
    "delta_24h",
    "delta_7d",
    "delta_30d",
    "liquidity",
    "circulating_supply",
];

const OVERVIEW_FIELDS: &[&str] = &[
    "total_market_cap",
    "total_volume",
    "total_liquidity",
    "btc_dominance",
];

/// Lookback for "current" values. The dashboard refreshes every 60s, so five
/// minutes tolerates brief ingestion gaps without serving hours-old data.
const CURRENT_WINDOW: &str = "-5m";

/// One decoded result row: column name to raw value string.
type FluxRow = HashMap<String, String>;

/// Read-only client for the InfluxDB 2.x query API. Constructed once at
/// startup and shared by every route handler.
pub struct InfluxClient {
    http: reqwest::Client,
    url: String,
    token: String,
    org: String,
    bucket: String,
}

impl InfluxClient {
    pub fn new(config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: config.influx_url.trim_end_matches('/').to_string(),
            token: config.influx_token.clone(),
            org: config.influx_org.clone(),
            bucket: config.influx_bucket.clone(),
        }
    }

    /// Most recent values for the top `limit` coins, ordered by ascending
    /// rank, at most one record per code. An empty window yields an empty vec.
    pub async fn get_top_coins(&self, limit: u32) -> Result<Vec<Coin>> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {window})
  |> filter(fn: (r) => r._measurement == "cryptocurrency_data")
  |> filter(fn: (r) => {fields})
  |> last()
  |> pivot(rowKey: ["code"], columnKey: ["_field"], valueColumn: "_value")
  |> sort(columns: ["rank"])
  |> limit(n: {limit})"#,
            bucket = self.bucket,
            window = CURRENT_WINDOW,
            fields = field_filter(COIN_FIELDS),
        );

        let rows = self.run_query(&flux).await?;

        // The query's last() already collapses to one row per code; the
        // first-seen guard keeps the invariant if the store returns more.
        let mut seen = HashSet::new();
        let mut coins = Vec::new();
        for row in &rows {
            let Some(code) = row.get("code") else { continue };
            if seen.insert(code.clone()) {
                coins.push(decode_coin(row));
            }
        }
        coins.sort_by_key(|c| c.rank);
        coins.truncate(limit as usize);
        Ok(coins)
    }

    /// Most recent values for one coin, or `None` if it has no data in the
    /// current window. Matching is exact; callers uppercase at the boundary.
    pub async fn get_coin_by_code(&self, code: &str) -> Result<Option<Coin>> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {window})
  |> filter(fn: (r) => r._measurement == "cryptocurrency_data")
  |> filter(fn: (r) => r.code == "{code}")
  |> filter(fn: (r) => {fields})
  |> last()
  |> pivot(rowKey: ["code"], columnKey: ["_field"], valueColumn: "_value")"#,
            bucket = self.bucket,
            window = CURRENT_WINDOW,
            code = escape_tag_value(code),
            fields = field_filter(COIN_FIELDS),
        );

        let rows = self.run_query(&flux).await?;
        Ok(rows
            .iter()
            .find(|row| row.get("code").map(String::as_str) == Some(code))
            .map(decode_coin))
    }

    /// Downsampled history for one coin over the trailing `hours` hours.
    /// Bucket width is `max(1, hours / 48)` hours, so the point count stays
    /// bounded near 48 no matter how long the requested range is.
    pub async fn get_coin_history(&self, code: &str, hours: u32) -> Result<Vec<HistoryPoint>> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: -{hours}h)
  |> filter(fn: (r) => r._measurement == "cryptocurrency_data")
  |> filter(fn: (r) => r.code == "{code}")
  |> filter(fn: (r) => r._field == "rate" or r._field == "volume" or r._field == "market_cap")
  |> aggregateWindow(every: {every}h, fn: mean, createEmpty: false)
  |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")"#,
            bucket = self.bucket,
            hours = hours,
            code = escape_tag_value(code),
            every = history_bucket_hours(hours),
        );

        let rows = self.run_query(&flux).await?;
        let mut points: Vec<HistoryPoint> = rows
            .iter()
            .map(|row| HistoryPoint {
                timestamp: row_time(row),
                rate: row_f64(row, "rate"),
                volume: row_f64(row, "volume"),
                market_cap: row_f64(row, "market_cap"),
            })
            .collect();
        points.sort_by_key(|p| p.timestamp);
        Ok(points)
    }

    /// Most recent market-wide snapshot, or `None` before the first data
    /// point lands.
    pub async fn get_market_overview(&self) -> Result<Option<MarketOverview>> {
        let flux = format!(
            r#"from(bucket: "{bucket}")
  |> range(start: {window})
  |> filter(fn: (r) => r._measurement == "market_overview")
  |> filter(fn: (r) => {fields})
  |> last()
  |> pivot(rowKey: ["_time"], columnKey: ["_field"], valueColumn: "_value")"#,
            bucket = self.bucket,
            window = CURRENT_WINDOW,
            fields = field_filter(OVERVIEW_FIELDS),
        );

        let rows = self.run_query(&flux).await?;
        Ok(rows.first().map(|row| MarketOverview {
            total_market_cap: row_opt_f64(row, "total_market_cap"),
            total_volume: row_opt_f64(row, "total_volume"),
            total_liquidity: row_opt_f64(row, "total_liquidity"),
            btc_dominance: row_opt_f64(row, "btc_dominance"),
            timestamp: row_time(row),
        }))
    }

    /// Executes one Flux query and returns the parsed result rows. Any store
    /// failure fails the whole operation; no retries, no partial results.
    async fn run_query(&self, flux: &str) -> Result<Vec<FluxRow>> {
        let response = self
            .http
            .post(format!("{}/api/v2/query", self.url))
            .query(&[("org", self.org.as_str())])
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "application/vnd.flux")
            .header("Accept", "application/csv")
            .body(flux.to_string())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            bail!("influxdb query failed ({status}): {}", body.trim());
        }
        parse_annotated_csv(&body)
    }
}

/// Builds the `r._field == "a" or r._field == "b" ...` filter expression.
fn field_filter(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| format!("r._field == \"{f}\""))
        .collect::<Vec<_>>()
        .join(" or ")
}

/// Escapes a value for interpolation into a double-quoted Flux string
/// literal. Coin codes are alphanumeric in practice; this keeps a hostile
/// path parameter from terminating the literal.
fn escape_tag_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// History bucket width in hours: 1h buckets up to two days, proportionally
/// wider after that so the series stays near 48 points.
fn history_bucket_hours(hours: u32) -> u32 {
    (hours / 48).max(1)
}

/// Parses an InfluxDB annotated-CSV response into string-keyed rows.
///
/// Annotation lines (`#datatype`, `#group`, `#default`) are skipped. Each
/// table opens with its own header row, recognized by the empty annotation
/// column followed by `result`/`table`. An in-band error table fails the
/// whole result.
fn parse_annotated_csv(body: &str) -> Result<Vec<FluxRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .comment(Some(b'#'))
        .from_reader(body.as_bytes());

    let mut columns: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for record in reader.records() {
        let record = record?;
        if record.iter().all(str::is_empty) {
            columns = None;
            continue;
        }
        if is_header(&record) {
            columns = Some(record.iter().map(str::to_string).collect());
            continue;
        }
        let Some(columns) = &columns else { continue };

        let mut row = FluxRow::new();
        for (key, value) in columns.iter().zip(record.iter()) {
            if !key.is_empty() && !value.is_empty() {
                row.insert(key.clone(), value.to_string());
            }
        }
        if let Some(message) = row.get("error") {
            bail!("influxdb query failed: {message}");
        }
        rows.push(row);
    }

    Ok(rows)
}

fn is_header(record: &csv::StringRecord) -> bool {
    record.get(0) == Some("")
        && matches!(record.get(1), Some("result") | Some("error"))
}

fn decode_coin(row: &FluxRow) -> Coin {
    let code = row.get("code").cloned().unwrap_or_default();
    Coin {
        name: row
            .get("name")
            .filter(|name| !name.is_empty())
            .cloned()
            .unwrap_or_else(|| code.clone()),
        code,
        rate: row_f64(row, "rate"),
        volume: row_f64(row, "volume"),
        market_cap: row_f64(row, "market_cap"),
        rank: row_f64(row, "rank") as i64,
        delta_1h: row_opt_f64(row, "delta_1h"),
        delta_24h: row_opt_f64(row, "delta_24h"),
        delta_7d: row_opt_f64(row, "delta_7d"),
        delta_30d: row_opt_f64(row, "delta_30d"),
        liquidity: row_opt_f64(row, "liquidity"),
        circulating_supply: row_opt_f64(row, "circulating_supply"),
        timestamp: row_time(row),
    }
}

fn row_f64(row: &FluxRow, key: &str) -> f64 {
    row_opt_f64(row, key).unwrap_or(0.0)
}

fn row_opt_f64(row: &FluxRow, key: &str) -> Option<f64> {
    row.get(key).and_then(|v| v.parse().ok())
}

fn row_time(row: &FluxRow) -> DateTime<Utc> {
    row.get("_time")
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOP_COINS_CSV: &str = "\
#group,false,false,true,true,false,true,true,false,false,false,false,false
#datatype,string,long,dateTime:RFC3339,dateTime:RFC3339,dateTime:RFC3339,string,string,double,double,double,double,double
#default,_result,,,,,,,,,,,
,result,table,_start,_stop,_time,code,name,rate,volume,market_cap,rank,delta_24h
,,0,2026-08-28T11:55:00Z,2026-08-28T12:00:00Z,2026-08-28T11:59:00Z,BTC,Bitcoin,97000.5,1.2e10,1.9e12,1,2.4
,,1,2026-08-28T11:55:00Z,2026-08-28T12:00:00Z,2026-08-28T11:59:00Z,ETH,Ethereum,3600.25,8.1e9,4.3e11,2,-1.1
,,2,2026-08-28T11:55:00Z,2026-08-28T12:00:00Z,2026-08-28T11:58:00Z,BTC,Bitcoin,96990.0,1.2e10,1.9e12,1,2.3
";

    #[test]
    fn parses_annotated_csv_rows() {
        let rows = parse_annotated_csv(TOP_COINS_CSV).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].get("code").unwrap(), "BTC");
        assert_eq!(rows[1].get("name").unwrap(), "Ethereum");
        assert_eq!(rows[1].get("rank").unwrap(), "2");
    }

    #[test]
    fn parses_multiple_tables() {
        let body = "\
#datatype,string,long,dateTime:RFC3339,string,double
,result,table,_time,code,rate
,,0,2026-08-28T11:59:00Z,BTC,97000.5

#datatype,string,long,dateTime:RFC3339,string,double
,result,table,_time,code,volume
,,1,2026-08-28T11:59:00Z,BTC,1.2e10
";
        let rows = parse_annotated_csv(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("rate").unwrap(), "97000.5");
        assert_eq!(rows[1].get("volume").unwrap(), "1.2e10");
    }

    #[test]
    fn empty_response_yields_no_rows() {
        assert!(parse_annotated_csv("").unwrap().is_empty());
        let header_only = "\
#datatype,string,long,dateTime:RFC3339,string,double
,result,table,_time,code,rate
";
        assert!(parse_annotated_csv(header_only).unwrap().is_empty());
    }

    #[test]
    fn error_table_fails_the_parse() {
        let body = "\
#datatype,string,long
,error,reference
,unauthorized access,401
";
        let err = parse_annotated_csv(body).unwrap_err();
        assert!(err.to_string().contains("unauthorized access"));
    }

    #[test]
    fn decode_defaults_missing_fields_to_zero() {
        let rows = parse_annotated_csv(
            "\
,result,table,_time,code,rate
,,0,2026-08-28T11:59:00Z,DOGE,0.42
",
        )
        .unwrap();
        let coin = decode_coin(&rows[0]);
        assert_eq!(coin.code, "DOGE");
        assert_eq!(coin.name, "DOGE");
        assert_eq!(coin.rate, 0.42);
        assert_eq!(coin.volume, 0.0);
        assert_eq!(coin.market_cap, 0.0);
        assert_eq!(coin.rank, 0);
        assert_eq!(coin.delta_24h, None);
        assert_eq!(coin.liquidity, None);
    }

    #[test]
    fn decode_keeps_optional_deltas() {
        let rows = parse_annotated_csv(TOP_COINS_CSV).unwrap();
        let coin = decode_coin(&rows[1]);
        assert_eq!(coin.delta_24h, Some(-1.1));
        assert_eq!(coin.rank, 2);
        assert_eq!(
            coin.timestamp,
            "2026-08-28T11:59:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn field_filter_joins_with_or() {
        assert_eq!(
            field_filter(&["rate", "volume"]),
            r#"r._field == "rate" or r._field == "volume""#
        );
    }

    #[test]
    fn escape_tag_value_neutralizes_quotes() {
        assert_eq!(escape_tag_value("BTC"), "BTC");
        assert_eq!(escape_tag_value(r#"X" or true or "#), r#"X\" or true or "#);
        assert_eq!(escape_tag_value(r"A\B"), r"A\\B");
    }

    #[test]
    fn history_buckets_stay_near_48_points() {
        assert_eq!(history_bucket_hours(1), 1);
        assert_eq!(history_bucket_hours(24), 1);
        assert_eq!(history_bucket_hours(48), 1);
        assert_eq!(history_bucket_hours(168), 3);
        assert_eq!(history_bucket_hours(720), 15);
        // 720h in 15h buckets is exactly 48 points.
        assert_eq!(720 / history_bucket_hours(720), 48);
    }
}
