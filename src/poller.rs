//! Poller: windowed pull from the log backend with overlap and
//! idempotent resumption, plus LogEntry → ParsedError normalization.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::DedupCache;
use crate::fingerprint::fingerprint;
use crate::logsource::{LogEntry, LogSource};

/// Per-occurrence normalized error; transient, lives for one poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedError {
    pub id: String,
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub message: String,
    pub raw: String,
    pub labels: HashMap<String, String>,
}

static ERROR_KEYWORD_TAIL: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"(?i)(?:error|fatal|panic|exception|fail(?:ed|ure)?)\s*[:\-]?\s*(.+)$")
        .unwrap()
});

static TIMESTAMP_AND_LEVEL_PREFIX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^\s*\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?\s*(?:\[?\s*(?:DEBUG|INFO|WARN(?:ING)?|ERROR|FATAL|TRACE)\s*\]?)?\s*[:\-]?\s*(.*)$",
    )
    .unwrap()
});

const MAX_FALLBACK_MESSAGE_LEN: usize = 500;

/// Extract a message from a raw log line, trying in order: (1) JSON
/// field probe, (2) error-keyword tail, (3) timestamp/level strip,
/// (4) raw truncated to 500 bytes with an ellipsis.
#[must_use]
pub fn extract_message(line: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(line) {
        for field in ["message", "msg", "error", "err"] {
            if let Some(s) = value.get(field).and_then(Value::as_str) {
                if !s.is_empty() {
                    return s.to_string();
                }
            }
        }
    }

    if let Some(caps) = ERROR_KEYWORD_TAIL.captures(line) {
        if let Some(m) = caps.get(1) {
            let tail = m.as_str().trim();
            if !tail.is_empty() {
                return tail.to_string();
            }
        }
    }

    if let Some(caps) = TIMESTAMP_AND_LEVEL_PREFIX.captures(line) {
        if let Some(m) = caps.get(1) {
            let rest = m.as_str().trim();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }

    if line.len() > MAX_FALLBACK_MESSAGE_LEN {
        format!("{}...", &line[..MAX_FALLBACK_MESSAGE_LEN])
    } else {
        line.to_string()
    }
}

/// Turn a raw `LogEntry` into a `ParsedError` carrying a stable
/// fingerprint.
#[must_use]
pub fn parse_entry(entry: &LogEntry) -> ParsedError {
    let namespace = entry.labels.get("namespace").cloned().unwrap_or_default();
    let pod = entry.labels.get("pod").cloned().unwrap_or_default();
    let container = entry.labels.get("container").cloned().unwrap_or_default();
    let message = extract_message(&entry.line);
    let fp = fingerprint(&namespace, &pod, &container, &message);

    ParsedError {
        id: Uuid::new_v4().to_string(),
        fingerprint: fp,
        timestamp: entry.timestamp,
        namespace,
        pod,
        container,
        message,
        raw: entry.line.clone(),
        labels: entry.labels.clone(),
    }
}

/// Poller configuration. Invariant: `lookback >= poll_interval`.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub query: String,
    pub poll_interval: Duration,
    pub lookback: Duration,
    pub result_limit: u32,
    /// Cadence of the dedup-cache cleanup tick (5 minutes default).
    pub cleanup_interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            query: String::new(),
            poll_interval: Duration::from_secs(30),
            lookback: Duration::from_secs(120),
            result_limit: 1000,
            cleanup_interval: Duration::from_secs(5 * 60),
        }
    }
}

/// Windowed, watermark-driven poll loop. `start` runs until cancelled;
/// a poll failure is logged and does not stop the loop or advance the
/// watermark.
pub struct Poller<S: LogSource> {
    source: Arc<S>,
    config: PollerConfig,
    dedup: Arc<DedupCache>,
    emit: mpsc::Sender<Vec<ParsedError>>,
    /// Watermark, stored as Unix nanos; `0` means "no successful poll yet".
    watermark_nanos: AtomicI64,
}

impl<S: LogSource> Poller<S> {
    #[must_use]
    pub fn new(
        source: Arc<S>,
        config: PollerConfig,
        dedup: Arc<DedupCache>,
        emit: mpsc::Sender<Vec<ParsedError>>,
    ) -> Self {
        Self {
            source,
            config,
            dedup,
            emit,
            watermark_nanos: AtomicI64::new(0),
        }
    }

    fn watermark(&self) -> Option<DateTime<Utc>> {
        let nanos = self.watermark_nanos.load(Ordering::SeqCst);
        if nanos == 0 {
            None
        } else {
            DateTime::from_timestamp(nanos / 1_000_000_000, (nanos % 1_000_000_000) as u32)
        }
    }

    fn set_watermark(&self, at: DateTime<Utc>) {
        self.watermark_nanos
            .store(at.timestamp_nanos_opt().unwrap_or(0), Ordering::SeqCst);
    }

    /// Compute the `[start, end]` window for the next poll, given `now`.
    #[must_use]
    pub fn next_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let lookback = chrono::Duration::from_std(self.config.lookback).unwrap_or_default();
        let floor = now - lookback;
        let start = match self.watermark() {
            Some(w) => w.max(floor),
            None => floor,
        };
        (start, now)
    }

    async fn poll_once(&self) {
        let now = Utc::now();
        let (start, end) = self.next_window(now);

        match self
            .source
            .query_range(&self.config.query, start, end, self.config.result_limit)
            .await
        {
            Ok(entries) => {
                let capped = entries.len() as u32 >= self.config.result_limit;
                if capped {
                    warn!(
                        limit = self.config.result_limit,
                        "log source result cap reached; window may have lost data"
                    );
                }
                debug!(count = entries.len(), %start, %end, "poll succeeded");
                self.set_watermark(end);

                // Dedup gating happens downstream, in the orchestrator's
                // batch consumer: it needs to observe whether a fingerprint
                // was already known *before* deciding to suppress broadcast
                // and remediation, so marking it seen here would destroy
                // that signal. The poller only drives the cleanup tick.
                let batch: Vec<ParsedError> = entries.iter().map(parse_entry).collect();
                if !batch.is_empty() && self.emit.send(batch).await.is_err() {
                    warn!("emission channel closed; dropping batch");
                }
            }
            Err(e) => {
                error!(error = %e, "poll failed; watermark not advanced");
            }
        }
    }

    /// Run the poll loop and the dedup-cleanup tick until `cancel` fires.
    /// Performs one immediate poll on start, then polls at
    /// `config.poll_interval`.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        self.poll_once().await;

        let mut poll_ticker = tokio::time::interval(self.config.poll_interval);
        poll_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cleanup_ticker = tokio::time::interval(self.config.cleanup_interval);
        cleanup_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // consume the immediate tick already accounted for by poll_once
        poll_ticker.tick().await;

        info!("poller started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("poller cancelled, shutting down");
                    break;
                }
                _ = poll_ticker.tick() => {
                    self.poll_once().await;
                }
                _ = cleanup_ticker.tick() => {
                    self.dedup.cleanup(Utc::now()).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LogSourceError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn extract_message_json_field_probe() {
        assert_eq!(
            extract_message(r#"{"level":"error","msg":"disk full"}"#),
            "disk full"
        );
        assert_eq!(
            extract_message(r#"{"error":"boom"}"#),
            "boom"
        );
    }

    #[test]
    fn extract_message_error_keyword_tail() {
        assert_eq!(
            extract_message("2024-01-01T00:00:00Z worker-1: ERROR: disk full on /data"),
            "disk full on /data"
        );
    }

    #[test]
    fn extract_message_timestamp_and_level_strip() {
        assert_eq!(
            extract_message("2024-01-01T00:00:00Z INFO starting up"),
            "starting up"
        );
    }

    #[test]
    fn extract_message_fallback_truncates_with_ellipsis() {
        let long = "x".repeat(600);
        let msg = extract_message(&long);
        assert!(msg.ends_with("..."));
        assert_eq!(msg.len(), MAX_FALLBACK_MESSAGE_LEN + 3);
    }

    #[test]
    fn parse_entry_extracts_labels_and_fingerprint() {
        let mut labels = HashMap::new();
        labels.insert("namespace".to_string(), "payments".to_string());
        labels.insert("pod".to_string(), "api-7f8d-abc12".to_string());
        labels.insert("container".to_string(), "app".to_string());
        let entry = LogEntry {
            timestamp: Utc::now(),
            labels,
            line: "ERROR: connection refused to 10.0.0.1:5432".to_string(),
        };
        let parsed = parse_entry(&entry);
        assert_eq!(parsed.namespace, "payments");
        assert_eq!(parsed.message, "connection refused to 10.0.0.1:5432");
        assert_eq!(parsed.fingerprint.len(), 16);
    }

    struct StubSource {
        calls: StdMutex<Vec<(DateTime<Utc>, DateTime<Utc>)>>,
    }

    #[async_trait]
    impl LogSource for StubSource {
        async fn query_range(
            &self,
            _query: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<LogEntry>, LogSourceError> {
            self.calls.lock().unwrap().push((start, end));
            Ok(vec![])
        }
        async fn query_instant(
            &self,
            _query: &str,
            _at: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<LogEntry>, LogSourceError> {
            Ok(vec![])
        }
        async fn ready(&self) -> Result<(), LogSourceError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_window_covers_now_minus_lookback() {
        let source = Arc::new(StubSource {
            calls: StdMutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::channel(8);
        let poller = Poller::new(
            source,
            PollerConfig {
                lookback: Duration::from_secs(120),
                ..Default::default()
            },
            Arc::new(DedupCache::new(Duration::from_secs(1800))),
            tx,
        );
        let now = Utc::now();
        let (start, end) = poller.next_window(now);
        assert_eq!(end, now);
        assert!((now - start).num_seconds() >= 119);
    }

    #[tokio::test]
    async fn second_poll_starts_where_first_ended() {
        let source = Arc::new(StubSource {
            calls: StdMutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::channel(8);
        let poller = Poller::new(
            source,
            PollerConfig {
                lookback: Duration::from_secs(120),
                ..Default::default()
            },
            Arc::new(DedupCache::new(Duration::from_secs(1800))),
            tx,
        );
        poller.poll_once().await;
        let watermark_after_first = poller.watermark().unwrap();

        let (start, _end) = poller.next_window(Utc::now());
        assert_eq!(start, watermark_after_first);
    }

    #[tokio::test]
    async fn poll_interval_equals_lookback_advances_contiguously() {
        let source = Arc::new(StubSource {
            calls: StdMutex::new(vec![]),
        });
        let (tx, _rx) = mpsc::channel(8);
        let poller = Poller::new(
            source,
            PollerConfig {
                poll_interval: Duration::from_secs(30),
                lookback: Duration::from_secs(30),
                ..Default::default()
            },
            Arc::new(DedupCache::new(Duration::from_secs(1800))),
            tx,
        );
        poller.poll_once().await;
        let w1 = poller.watermark().unwrap();
        poller.poll_once().await;
        let (start, _) = poller.next_window(Utc::now());
        assert!(start >= w1);
    }
}
