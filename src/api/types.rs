//! REST API types

use crate::sources::FetchRequest;
use serde::{Deserialize, Serialize};

/// Standard API response format
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success_with_message(message: &str) -> Self {
        Self {
            status: "success".to_string(),
            message: Some(message.to_string()),
            data: None,
        }
    }

    pub fn success_with_data(data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: None,
            data: Some(data),
        }
    }

    pub fn with_message(mut self, message: String) -> Self {
        self.message = Some(message);
        self
    }
}

/// Empty data type for responses without data
#[derive(Debug, Clone, Serialize)]
pub struct Empty {}

/// Query of `GET /stock-data` and `/stock-data/ingest`
#[derive(Debug, Clone, Deserialize)]
pub struct StockDataQuery {
    pub symbol: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub interval: Option<String>,
    pub period: Option<String>,
    pub auto_adjust: Option<bool>,
}

impl StockDataQuery {
    /// Fill unset fields from the given defaults
    pub fn into_request(self, interval: &str, period: Option<&str>) -> FetchRequest {
        // An explicit window overrides the default period
        let period = match (self.period, &self.start_date) {
            (Some(p), _) => Some(p),
            (None, Some(_)) => None,
            (None, None) => period.map(String::from),
        };

        FetchRequest {
            symbol: self.symbol.trim().to_string(),
            start_date: self.start_date,
            end_date: self.end_date,
            interval: self.interval.unwrap_or_else(|| interval.to_string()),
            period,
            auto_adjust: self.auto_adjust.unwrap_or(true),
        }
    }
}

/// Query naming a single symbol
#[derive(Debug, Clone, Deserialize)]
pub struct SymbolQuery {
    pub symbol: String,
}
