//! Yahoo Finance chart API source

use super::{FetchRequest, MarketDataSource};
use crate::db::models::format_timestamp;
use crate::error::{AppError, Result};
use crate::ingest::{RawBatch, RawRow};
use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

/// Yahoo rejects requests without a browser-like agent
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) historify/1.0";

/// Range used when neither a start date nor a period is given
const DEFAULT_RANGE: &str = "1mo";

/// Metadata key -> chart `meta` key
const META_FIELDS: &[(&str, &str)] = &[
    ("shortName", "shortName"),
    ("longName", "longName"),
    ("currency", "currency"),
    ("exchange", "exchangeName"),
    ("quoteType", "instrumentType"),
    ("regularMarketPrice", "regularMarketPrice"),
    ("regularMarketDayHigh", "regularMarketDayHigh"),
    ("regularMarketDayLow", "regularMarketDayLow"),
    ("regularMarketVolume", "regularMarketVolume"),
    ("fiftyTwoWeekHigh", "fiftyTwoWeekHigh"),
    ("fiftyTwoWeekLow", "fiftyTwoWeekLow"),
    ("previousClose", "chartPreviousClose"),
    ("exchangeTimezoneName", "exchangeTimezoneName"),
];

/// Epoch-valued meta fields, reported as `YYYY-MM-DD HH:MM:SS`
const META_DATE_FIELDS: &[&str] = &["firstTradeDate", "regularMarketTime"];

/// quoteSummary modules holding quote and valuation figures
const SUMMARY_MODULES: &str = "price,summaryDetail,defaultKeyStatistics,financialData,calendarEvents";

/// Metadata key -> (quoteSummary module, field)
const VALUATION_FIELDS: &[(&str, &str, &str)] = &[
    ("marketState", "price", "marketState"),
    ("regularMarketChange", "price", "regularMarketChange"),
    ("regularMarketChangePercent", "price", "regularMarketChangePercent"),
    ("regularMarketOpen", "price", "regularMarketOpen"),
    ("regularMarketPreviousClose", "price", "regularMarketPreviousClose"),
    ("averageDailyVolume3Month", "price", "averageDailyVolume3Month"),
    ("averageDailyVolume10Day", "price", "averageDailyVolume10Day"),
    ("marketCap", "price", "marketCap"),
    ("enterpriseValue", "defaultKeyStatistics", "enterpriseValue"),
    ("trailingPE", "summaryDetail", "trailingPE"),
    ("forwardPE", "summaryDetail", "forwardPE"),
    ("priceToBook", "defaultKeyStatistics", "priceToBook"),
    ("pegRatio", "defaultKeyStatistics", "pegRatio"),
    ("beta", "summaryDetail", "beta"),
    ("dividendRate", "summaryDetail", "dividendRate"),
    ("dividendYield", "summaryDetail", "dividendYield"),
    ("totalRevenue", "financialData", "totalRevenue"),
    ("grossProfits", "financialData", "grossProfits"),
    ("ebitda", "financialData", "ebitda"),
    ("totalCash", "financialData", "totalCash"),
    ("totalDebt", "financialData", "totalDebt"),
];

pub struct YahooSource {
    client: Client,
    base_url: String,
}

impl YahooSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn chart_url(&self, symbol: &str) -> String {
        format!(
            "{}/v8/finance/chart/{}",
            self.base_url,
            urlencoding::encode(symbol)
        )
    }

    fn summary_url(&self, symbol: &str) -> String {
        format!(
            "{}/v10/finance/quoteSummary/{}",
            self.base_url,
            urlencoding::encode(symbol)
        )
    }

    /// Quote and valuation figures. Yahoo may refuse this endpoint (it can
    /// demand a session crumb); the bars are still usable, so any failure
    /// only leaves these fields null.
    async fn fetch_valuation(&self, symbol: &str) -> BTreeMap<String, Value> {
        let response = self
            .client
            .get(self.summary_url(symbol))
            .query(&[("modules", SUMMARY_MODULES)])
            .send()
            .await
            .and_then(|r| r.error_for_status());

        let body = match response {
            Ok(response) => response.json::<Value>().await,
            Err(e) => Err(e),
        };

        match body {
            Ok(body) => valuation_fields(&body),
            Err(e) => {
                warn!("Valuation figures for {} unavailable: {}", symbol, e);
                valuation_fields(&Value::Null)
            }
        }
    }
}

#[async_trait]
impl MarketDataSource for YahooSource {
    fn id(&self) -> &'static str {
        "yahoo"
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawBatch> {
        let end_date = resolve_end_date(request);
        let params = query_params(request, &end_date)?;
        let url = self.chart_url(&request.symbol);

        info!(
            "Fetching {} from {} to {} interval={} period={:?} auto_adjust={}",
            request.symbol,
            request.start_date.as_deref().unwrap_or("-"),
            end_date,
            request.interval,
            request.period,
            request.auto_adjust
        );

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| AppError::Upstream(format!("request for {} failed: {}", request.symbol, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Upstream(format!("reading response for {}: {}", request.symbol, e)))?;

        // Error responses still carry a chart envelope with a description
        let envelope: ChartEnvelope = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(e) if status.is_success() => {
                return Err(AppError::Upstream(format!(
                    "unexpected chart response for {}: {}",
                    request.symbol, e
                )))
            }
            Err(_) => {
                return Err(AppError::Upstream(format!(
                    "chart request for {} returned HTTP {}",
                    request.symbol, status
                )))
            }
        };

        let mut batch = parse_chart(request, &end_date, envelope).map_err(|e| {
            error!("Fetch for {} failed: {}", request.symbol, e);
            e
        })?;
        batch
            .metadata
            .extend(self.fetch_valuation(&request.symbol).await);
        info!("Fetched {} bars for {}", batch.rows.len(), request.symbol);
        Ok(batch)
    }
}

#[derive(Debug, Deserialize)]
struct ChartEnvelope {
    chart: Chart,
}

#[derive(Debug, Deserialize)]
struct Chart {
    result: Option<Vec<ChartResult>>,
    error: Option<ChartError>,
}

#[derive(Debug, Deserialize)]
struct ChartError {
    code: String,
    description: String,
}

#[derive(Debug, Deserialize)]
struct ChartResult {
    #[serde(default)]
    meta: Map<String, Value>,
    #[serde(default)]
    timestamp: Vec<i64>,
    #[serde(default)]
    indicators: Indicators,
}

#[derive(Debug, Default, Deserialize)]
struct Indicators {
    #[serde(default)]
    quote: Vec<QuoteSeries>,
    #[serde(default)]
    adjclose: Vec<AdjCloseSeries>,
}

#[derive(Debug, Default, Deserialize)]
struct QuoteSeries {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Debug, Default, Deserialize)]
struct AdjCloseSeries {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

fn resolve_end_date(request: &FetchRequest) -> String {
    request
        .end_date
        .clone()
        .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string())
}

fn date_to_epoch(field: &str, value: &str) -> Result<i64> {
    let date = NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").map_err(|_| {
        AppError::Validation(format!("{} must be YYYY-MM-DD, got '{}'", field, value))
    })?;
    date.and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight).timestamp())
        .ok_or_else(|| AppError::Validation(format!("{} out of range: '{}'", field, value)))
}

/// A start date selects an explicit window; otherwise the period (range) applies
fn query_params(request: &FetchRequest, end_date: &str) -> Result<Vec<(&'static str, String)>> {
    let mut params = vec![
        ("interval", request.interval.clone()),
        ("includePrePost", "false".to_string()),
        ("includeAdjustedClose", "true".to_string()),
    ];

    match (&request.start_date, &request.period) {
        (Some(start), _) => {
            let period1 = date_to_epoch("start_date", start)?;
            let period2 = date_to_epoch("end_date", end_date)?;
            if period1 >= period2 {
                return Err(AppError::Validation(format!(
                    "start_date {} must be before end_date {}",
                    start, end_date
                )));
            }
            params.push(("period1", period1.to_string()));
            params.push(("period2", period2.to_string()));
        }
        (None, Some(period)) => params.push(("range", period.clone())),
        (None, None) => params.push(("range", DEFAULT_RANGE.to_string())),
    }

    Ok(params)
}

fn parse_chart(request: &FetchRequest, end_date: &str, envelope: ChartEnvelope) -> Result<RawBatch> {
    if let Some(err) = envelope.chart.error {
        return Err(AppError::Upstream(format!(
            "{} for {}: {}",
            err.code, request.symbol, err.description
        )));
    }

    let result = envelope
        .chart
        .result
        .and_then(|results| results.into_iter().next())
        .ok_or_else(|| no_history(&request.symbol))?;

    let quote = result.indicators.quote.into_iter().next().unwrap_or_default();
    let adjclose = result
        .indicators
        .adjclose
        .into_iter()
        .next()
        .unwrap_or_default()
        .adjclose;

    let at = |series: &[Option<f64>], i: usize| series.get(i).copied().flatten();

    let mut rows = Vec::with_capacity(result.timestamp.len());
    let mut skipped = 0;
    for (i, ts) in result.timestamp.iter().enumerate() {
        let (Some(mut open), Some(mut high), Some(mut low), Some(mut close)) = (
            at(&quote.open, i),
            at(&quote.high, i),
            at(&quote.low, i),
            at(&quote.close, i),
        ) else {
            skipped += 1;
            continue;
        };

        if request.auto_adjust {
            if let Some(adj) = at(&adjclose, i) {
                if close != 0.0 {
                    let ratio = adj / close;
                    open *= ratio;
                    high *= ratio;
                    low *= ratio;
                    close = adj;
                }
            }
        }

        rows.push(RawRow {
            timestamp: Some(Value::from(*ts)),
            open: Some(Value::from(open)),
            high: Some(Value::from(high)),
            low: Some(Value::from(low)),
            close: Some(Value::from(close)),
            volume: Some(Value::from(at(&quote.volume, i).unwrap_or(0.0).trunc() as i64)),
        });
    }

    if skipped > 0 {
        debug!("Skipped {} empty bars for {}", skipped, request.symbol);
    }
    if rows.is_empty() {
        return Err(no_history(&request.symbol));
    }

    Ok(RawBatch {
        metadata: build_metadata(request, end_date, &result.meta),
        rows,
    })
}

fn no_history(symbol: &str) -> AppError {
    AppError::Upstream(format!("No historical data found for {}", symbol))
}

fn build_metadata(
    request: &FetchRequest,
    end_date: &str,
    meta: &Map<String, Value>,
) -> BTreeMap<String, Value> {
    let mut metadata = BTreeMap::new();
    metadata.insert("symbol".to_string(), Value::from(request.symbol.clone()));
    metadata.insert(
        "start_date".to_string(),
        request.start_date.clone().map(Value::from).unwrap_or(Value::Null),
    );
    metadata.insert("end_date".to_string(), Value::from(end_date));
    metadata.insert("interval".to_string(), Value::from(request.interval.clone()));

    for (key, meta_key) in META_FIELDS {
        let value = meta.get(*meta_key).cloned().unwrap_or(Value::Null);
        metadata.insert(key.to_string(), value);
    }
    for key in META_DATE_FIELDS {
        let value = meta.get(*key).map(normalize_date_field).unwrap_or(Value::Null);
        metadata.insert(key.to_string(), value);
    }

    metadata
}

/// Figures come as `{"raw": 1.5, "fmt": "1.50"}`; keep the raw value
fn raw_value(value: &Value) -> Value {
    match value {
        Value::Object(fields) => fields.get("raw").cloned().unwrap_or(Value::Null),
        Value::Array(items) => Value::Array(items.iter().map(raw_value).collect()),
        other => other.clone(),
    }
}

/// Every valuation key, null where the quoteSummary payload has no value
fn valuation_fields(body: &Value) -> BTreeMap<String, Value> {
    let summary = body.pointer("/quoteSummary/result/0");
    let field = |module: &str, name: &str| {
        summary
            .and_then(|s| s.get(module))
            .and_then(|m| m.get(name))
            .map(raw_value)
            .unwrap_or(Value::Null)
    };

    let mut fields: BTreeMap<String, Value> = VALUATION_FIELDS
        .iter()
        .map(|(key, module, name)| (key.to_string(), field(module, name)))
        .collect();

    let ex_dividend = field("summaryDetail", "exDividendDate");
    fields.insert("exDividendDate".to_string(), normalize_date_field(&ex_dividend));

    let earnings = summary
        .and_then(|s| s.pointer("/calendarEvents/earnings/earningsDate"))
        .map(raw_value)
        .unwrap_or(Value::Null);
    fields.insert("earningsDate".to_string(), normalize_date_field(&earnings));

    fields
}

/// Epoch seconds (or a list of them) -> `YYYY-MM-DD HH:MM:SS` strings
pub fn normalize_date_field(value: &Value) -> Value {
    let format = |v: &Value| -> Option<Value> {
        let secs = v.as_i64().or_else(|| v.as_f64().map(|f| f.floor() as i64))?;
        let ts = Utc.timestamp_opt(secs, 0).single()?;
        Some(Value::from(format_timestamp(&ts)))
    };

    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| format(item).unwrap_or(Value::Null))
                .collect(),
        ),
        Value::Number(_) => format(value).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}
