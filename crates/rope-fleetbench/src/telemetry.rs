//! Telemetry source used to observe cluster request rates

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{ExperimentError, Result};

/// One observed time series
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Series {
    pub labels: BTreeMap<String, String>,
    /// `(timestamp, value)` pairs
    pub samples: Vec<(f64, f64)>,
}

impl Series {
    /// Most recent sample value
    pub fn latest(&self) -> Option<f64> {
        self.samples.last().map(|(_, value)| *value)
    }
}

/// Source of instant metric queries
#[async_trait]
pub trait TelemetrySource: Send + Sync {
    /// Evaluate `query` at `at`
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>>;
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

/// Parse a Prometheus instant-vector response
pub fn parse_instant_response(body: &[u8]) -> Result<Vec<Series>> {
    let response: QueryResponse =
        serde_json::from_slice(body).map_err(|e| ExperimentError::Telemetry(e.to_string()))?;

    if response.status != "success" {
        return Err(ExperimentError::Telemetry(
            response
                .error
                .unwrap_or_else(|| format!("query status {}", response.status)),
        ));
    }

    let data = response
        .data
        .ok_or_else(|| ExperimentError::Telemetry("response without data".to_string()))?;

    data.result
        .into_iter()
        .map(|sample| {
            let (timestamp, raw) = sample.value;
            let value = raw.parse::<f64>().map_err(|e| {
                ExperimentError::Telemetry(format!("unparseable sample {:?}: {}", raw, e))
            })?;
            Ok(Series {
                labels: sample.metric,
                samples: vec![(timestamp, value)],
            })
        })
        .collect()
}

/// Prometheus HTTP API client
pub struct PrometheusSource {
    client: reqwest::Client,
    base_url: String,
}

impl PrometheusSource {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExperimentError::Telemetry(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TelemetrySource for PrometheusSource {
    async fn query_instant(&self, query: &str, at: DateTime<Utc>) -> Result<Vec<Series>> {
        let url = format!("{}/api/v1/query", self.base_url);
        let time = at.timestamp().to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await
            .map_err(|e| ExperimentError::Telemetry(e.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|e| ExperimentError::Telemetry(e.to_string()))?;

        parse_instant_response(&body)
    }
}
