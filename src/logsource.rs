//! Log backend contract and a LogQL/HTTP adapter, behind an abstract
//! `LogSource` trait so any backend satisfying the contract can stand in.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::LogSourceError;

/// A single normalized log line pulled from the backend, newest-first
/// within a query result.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub labels: HashMap<String, String>,
    pub line: String,
}

/// Abstract log-aggregation backend. Implementations must distinguish
/// transient network, authentication, non-200 with body, malformed
/// payload, and logical query failure.
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogEntry>, LogSourceError>;

    async fn query_instant(
        &self,
        query: &str,
        at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogEntry>, LogSourceError>;

    async fn ready(&self) -> Result<(), LogSourceError>;
}

/// Authentication mode for the LogQL/HTTP adapter.
#[derive(Debug, Clone)]
pub enum LogSourceAuth {
    None,
    TenantHeader(String),
    Basic { username: String, password: String },
}

#[derive(Debug, Clone)]
pub struct LogQlHttpConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub default_limit: u32,
    pub auth: LogSourceAuth,
}

impl Default for LogQlHttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3100".to_string(),
            timeout_secs: 30,
            default_limit: 1000,
            auth: LogSourceAuth::None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<ResultStream>,
}

#[derive(Debug, Deserialize)]
struct ResultStream {
    stream: HashMap<String, String>,
    values: Vec<(String, String)>,
}

/// A LogQL-over-HTTP client (Loki/VictoriaLogs-compatible `query_range`
/// API), implementing the abstract `LogSource` contract.
pub struct LogQlHttpSource {
    config: LogQlHttpConfig,
    client: reqwest::Client,
}

impl LogQlHttpSource {
    /// # Errors
    /// Returns an error if the underlying HTTP client cannot be built.
    pub fn new(config: LogQlHttpConfig) -> Result<Self, LogSourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LogSourceError::Transient(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn apply_auth(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth {
            LogSourceAuth::None => builder,
            LogSourceAuth::TenantHeader(tenant) => builder.header("X-Scope-OrgID", tenant),
            LogSourceAuth::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
        }
    }
}

#[async_trait]
impl LogSource for LogQlHttpSource {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogEntry>, LogSourceError> {
        let limit = if limit == 0 {
            self.config.default_limit
        } else {
            limit
        };
        let start_ns = start.timestamp_nanos_opt().unwrap_or(0).to_string();
        let end_ns = end.timestamp_nanos_opt().unwrap_or(0).to_string();
        let limit_s = limit.to_string();

        let url = format!(
            "{}/loki/api/v1/query_range",
            self.config.base_url.trim_end_matches('/')
        );

        debug!(query = %query, start = %start, end = %end, limit, "querying log source");

        let request = self.client.get(&url).query(&[
            ("query", query),
            ("start", start_ns.as_str()),
            ("end", end_ns.as_str()),
            ("limit", limit_s.as_str()),
            ("direction", "backward"),
        ]);
        let request = self.apply_auth(request);

        let response = request
            .send()
            .await
            .map_err(|e| LogSourceError::Transient(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LogSourceError::Authentication(format!(
                "log source rejected credentials: HTTP {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LogSourceError::HttpStatus { status, body });
        }

        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| LogSourceError::MalformedResponse(e.to_string()))?;

        if parsed.status != "success" {
            return Err(LogSourceError::QueryFailed(parsed.status));
        }

        let mut entries = Vec::new();
        for stream in parsed.data.result {
            for (ts_ns, line) in stream.values {
                let Ok(ns) = ts_ns.parse::<i64>() else {
                    warn!(ts = %ts_ns, "skipping log entry with unparsable timestamp");
                    continue;
                };
                let secs = ns / 1_000_000_000;
                #[allow(clippy::cast_sign_loss)]
                let nsecs = (ns % 1_000_000_000) as u32;
                if let Some(dt) = DateTime::from_timestamp(secs, nsecs) {
                    entries.push(LogEntry {
                        timestamp: dt,
                        labels: stream.stream.clone(),
                        line,
                    });
                }
            }
        }
        // Reverse chronological (newest first) per the contract.
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    async fn query_instant(
        &self,
        query: &str,
        at: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<LogEntry>, LogSourceError> {
        self.query_range(query, at, at, limit).await
    }

    async fn ready(&self) -> Result<(), LogSourceError> {
        let url = format!("{}/ready", self.config.base_url.trim_end_matches('/'));
        let request = self.apply_auth(self.client.get(&url));
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(LogSourceError::HttpStatus {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
            Err(e) => Err(LogSourceError::Transient(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = LogQlHttpConfig::default();
        assert_eq!(cfg.default_limit, 1000);
        assert_eq!(cfg.timeout_secs, 30);
    }

    #[tokio::test]
    async fn query_range_against_mock_server() {
        let server = wiremock::MockServer::start().await;
        let now_ns = Utc::now().timestamp_nanos_opt().unwrap();
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/loki/api/v1/query_range"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "data": {
                    "resultType": "streams",
                    "result": [{
                        "stream": {"namespace": "p", "pod": "api-1"},
                        "values": [[now_ns.to_string(), "connection refused to 10.0.0.1:5432"]]
                    }]
                }
            })))
            .mount(&server)
            .await;

        let source = LogQlHttpSource::new(LogQlHttpConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let entries = source
            .query_range("{namespace=\"p\"}", Utc::now(), Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].line.contains("connection refused"));
    }

    #[tokio::test]
    async fn non_200_surfaces_http_status_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/loki/api/v1/query_range"))
            .respond_with(wiremock::ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let source = LogQlHttpSource::new(LogQlHttpConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let err = source
            .query_range("{namespace=\"p\"}", Utc::now(), Utc::now(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LogSourceError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn logical_failure_status_surfaces_query_failed() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/loki/api/v1/query_range"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "error",
                "data": {"resultType": "streams", "result": []}
            })))
            .mount(&server)
            .await;

        let source = LogQlHttpSource::new(LogQlHttpConfig {
            base_url: server.uri(),
            ..Default::default()
        })
        .unwrap();

        let err = source
            .query_range("{namespace=\"p\"}", Utc::now(), Utc::now(), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, LogSourceError::QueryFailed(_)));
    }
}
