//! Orchestrator: wires the poller, rule engine, store, remediation engine
//! and broadcast hub into one pipeline (poll → parse → classify → store →
//! dedup-gated broadcast → remediate → broadcast), owns the root
//! cancellation context, and drives the hourly retention sweep.
//!
//! Spawns the poll loop, the batch-consuming pipeline, and the retention
//! tick as independent activities raced against a shared cancellation
//! signal, so any one of them shutting down cleanly doesn't leave the
//! others running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broadcast::{BroadcastEvent, Hub};
use crate::dedup::DedupCache;
use crate::logsource::LogSource;
use crate::poller::{ParsedError, Poller, PollerConfig};
use crate::remediation::RemediationEngine;
use crate::rules::RuleEngine;
use crate::store::{IncidentInput, IncidentStore, RemediationStatus};

/// Default incident retention cut-off: 7 days.
pub const INCIDENT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
/// Default remediation-log retention cut-off: 30 days.
pub const LOG_RETENTION: Duration = Duration::from_secs(30 * 24 * 3600);
/// Retention sweep cadence (hourly by default).
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
/// Bound on how long shutdown waits for in-flight activities to drain.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);

/// Default capacity of the poller→pipeline channel. One poll batch at a
/// time is the expected steady state; a few slots absorb a slow pipeline
/// tick without the poller blocking on `send`.
const BATCH_CHANNEL_CAPACITY: usize = 8;

/// Owns the poller, rule engine, store, remediation engine, and hub for
/// the lifetime of the process. Constructed once at startup; `run` drives
/// it until the supplied `CancellationToken` fires.
pub struct Orchestrator<S: LogSource> {
    poller: Arc<Poller<S>>,
    rules: Arc<RuleEngine>,
    store: Arc<dyn IncidentStore>,
    remediation: Arc<RemediationEngine>,
    hub: Arc<Hub>,
    dedup: Arc<DedupCache>,
}

impl<S: LogSource + 'static> Orchestrator<S> {
    /// Wire the poller's emission channel to a fresh `Orchestrator`. The
    /// returned receiver is consumed by `run`.
    #[must_use]
    pub fn new(
        source: Arc<S>,
        poller_config: PollerConfig,
        dedup: Arc<DedupCache>,
        rules: Arc<RuleEngine>,
        store: Arc<dyn IncidentStore>,
        remediation: Arc<RemediationEngine>,
        hub: Arc<Hub>,
    ) -> (Self, mpsc::Receiver<Vec<ParsedError>>) {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_CAPACITY);
        let poller = Arc::new(Poller::new(source, poller_config, dedup.clone(), tx));
        (
            Self {
                poller,
                rules,
                store,
                remediation,
                hub,
                dedup,
            },
            rx,
        )
    }

    /// Evaluate, store, and (if novel within the dedup window) broadcast
    /// and remediate every `ParsedError` in one poll batch. Entries are
    /// processed in the order the source returned them.
    async fn process_batch(&self, batch: Vec<ParsedError>) {
        for parsed in batch {
            let rule_match = self.rules.evaluate(&parsed).await;

            // Decide novelty *before* marking seen, then mark
            // unconditionally — the store update below must happen
            // regardless of this decision.
            let is_new = self.dedup.is_new(&parsed.fingerprint).await;
            self.dedup
                .mark_seen(&parsed.fingerprint, parsed.timestamp)
                .await;

            let incident = match self
                .store
                .save_incident(IncidentInput {
                    fingerprint: parsed.fingerprint.clone(),
                    timestamp: parsed.timestamp,
                    namespace: parsed.namespace.clone(),
                    pod: parsed.pod.clone(),
                    container: parsed.container.clone(),
                    message: parsed.message.clone(),
                    priority: rule_match.priority,
                    rule_name: rule_match.rule_name.clone(),
                    labels: parsed.labels.clone(),
                    raw: parsed.raw.clone(),
                })
                .await
            {
                Ok(incident) => incident,
                Err(e) => {
                    error!(error = %e, fingerprint = %parsed.fingerprint, "failed to save incident");
                    continue;
                }
            };

            if !is_new {
                // Already seen within the dedup window: the store was
                // still updated above (count/lastSeen), but broadcast and
                // remediation are suppressed.
                continue;
            }

            self.hub
                .publish(BroadcastEvent::Incident(incident.clone()))
                .await;

            let Some(spec) = rule_match.remediation.as_ref() else {
                continue;
            };

            let log = self
                .remediation
                .remediate(&incident, &rule_match.rule_name, spec)
                .await;

            if let Err(e) = self.store.save_remediation_log(log.clone()).await {
                error!(error = %e, "failed to persist remediation log");
            }
            self.hub
                .publish(BroadcastEvent::Remediation(log.clone()))
                .await;

            if log.status == RemediationStatus::Success {
                if let Some(mut updated) = self.store.get_by_id(&incident.id).await {
                    updated.remediated = true;
                    updated.remediated_at = Some(Utc::now());
                    if let Err(e) = self.store.update_incident(updated).await {
                        error!(error = %e, "failed to mark incident remediated");
                    }
                }
            }
        }

        // A fresh stats snapshot after every batch, whether or not it
        // produced any new incidents.
        self.hub
            .publish(BroadcastEvent::Stats(self.store.stats().await))
            .await;
    }

    /// Delete incidents/logs past the default retention cut-offs.
    async fn retention_sweep(&self) {
        let incident_cutoff =
            Utc::now() - chrono::Duration::from_std(INCIDENT_RETENTION).unwrap_or_default();
        let log_cutoff = Utc::now() - chrono::Duration::from_std(LOG_RETENTION).unwrap_or_default();

        let incidents_deleted = self.store.delete_incidents_older_than(incident_cutoff).await;
        let logs_deleted = self.store.delete_remediation_logs_older_than(log_cutoff).await;
        if incidents_deleted > 0 || logs_deleted > 0 {
            info!(incidents_deleted, logs_deleted, "retention sweep completed");
        }
    }

    /// Run the poll loop, the batch-consuming pipeline, and the retention
    /// tick as independent activities until `cancel` fires, then wait up
    /// to `SHUTDOWN_DEADLINE` for them to drain before closing the store.
    pub async fn run(
        self: Arc<Self>,
        mut batches: mpsc::Receiver<Vec<ParsedError>>,
        cancel: CancellationToken,
    ) {
        let poller = self.poller.clone();
        let poller_cancel = cancel.clone();
        let poller_handle = tokio::spawn(async move {
            poller.start(poller_cancel).await;
        });

        let pipeline = self.clone();
        let pipeline_cancel = cancel.clone();
        let pipeline_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = pipeline_cancel.cancelled() => break,
                    batch = batches.recv() => {
                        match batch {
                            Some(batch) => pipeline.process_batch(batch).await,
                            None => break,
                        }
                    }
                }
            }
        });

        let retention = self.clone();
        let retention_cancel = cancel.clone();
        let retention_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RETENTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = retention_cancel.cancelled() => break,
                    _ = ticker.tick() => retention.retention_sweep().await,
                }
            }
        });

        cancel.cancelled().await;
        info!("orchestrator cancelled; draining activities");

        let drain = async {
            let _ = poller_handle.await;
            let _ = pipeline_handle.await;
            let _ = retention_handle.await;
        };
        if tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await.is_err() {
            warn!("shutdown deadline exceeded; some activities may not have drained cleanly");
        }

        self.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ClusterApiError, LogSourceError};
    use crate::k8s::{ClusterApi, ReplicaSetOwnerInfo};
    use crate::logsource::LogEntry;
    use crate::remediation::RemediationConfig;
    use crate::rules::{ActionType, RemediationSpec, RuleSpec};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::DateTime;
    use k8s_openapi::api::core::v1::{Event, Pod};
    use std::collections::HashMap;

    struct EmptySource;

    #[async_trait]
    impl LogSource for EmptySource {
        async fn query_range(
            &self,
            _query: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: u32,
        ) -> Result<Vec<LogEntry>, LogSourceError> {
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

    struct NoopCluster;

    #[async_trait]
    impl ClusterApi for NoopCluster {
        async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Pod, ClusterApiError> {
            Ok(Pod::default())
        }
        async fn list_pods(
            &self,
            _namespace: &str,
            _label_selector: Option<&str>,
        ) -> Result<Vec<Pod>, ClusterApiError> {
            Ok(vec![])
        }
        async fn delete_pod(
            &self,
            _namespace: &str,
            _name: &str,
            _grace_period_secs: u32,
        ) -> Result<(), ClusterApiError> {
            Ok(())
        }
        async fn get_deployment_replicas(
            &self,
            _namespace: &str,
            _name: &str,
        ) -> Result<i32, ClusterApiError> {
            Ok(1)
        }
        async fn scale_deployment(
            &self,
            _namespace: &str,
            _name: &str,
            _replicas: i32,
        ) -> Result<(), ClusterApiError> {
            Ok(())
        }
        async fn patch_deployment_rollback(
            &self,
            _namespace: &str,
            _name: &str,
            _to_revision: u64,
        ) -> Result<(), ClusterApiError> {
            Ok(())
        }
        async fn list_replicasets(
            &self,
            _namespace: &str,
            _label_selector: Option<&str>,
        ) -> Result<Vec<ReplicaSetOwnerInfo>, ClusterApiError> {
            Ok(vec![])
        }
        async fn list_namespaces(&self) -> Result<Vec<String>, ClusterApiError> {
            Ok(vec![])
        }
        async fn list_events(&self, _namespace: &str) -> Result<Vec<Event>, ClusterApiError> {
            Ok(vec![])
        }
        async fn resolve_deployment_for_pod(
            &self,
            _namespace: &str,
            _pod_name: &str,
        ) -> Result<String, ClusterApiError> {
            Ok("dep".to_string())
        }
    }

    fn harness(
        rule_specs: Vec<RuleSpec>,
        remediation_config: RemediationConfig,
    ) -> (Orchestrator<EmptySource>, mpsc::Receiver<Vec<ParsedError>>) {
        let rules = Arc::new(RuleEngine::new(rule_specs).unwrap());
        let store: Arc<dyn IncidentStore> = Arc::new(MemoryStore::default());
        let remediation = Arc::new(RemediationEngine::new(Arc::new(NoopCluster), remediation_config));
        let hub = Arc::new(Hub::new());
        let dedup = Arc::new(DedupCache::new(Duration::from_secs(1800)));
        Orchestrator::new(
            Arc::new(EmptySource),
            PollerConfig::default(),
            dedup,
            rules,
            store,
            remediation,
            hub,
        )
    }

    fn parsed(fp: &str, message: &str) -> ParsedError {
        ParsedError {
            id: "id".to_string(),
            fingerprint: fp.to_string(),
            timestamp: Utc::now(),
            namespace: "payments".to_string(),
            pod: "api-7f8d-abc12".to_string(),
            container: "app".to_string(),
            message: message.to_string(),
            raw: message.to_string(),
            labels: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn new_occurrence_creates_incident_and_broadcasts() {
        let (orch, _rx) = harness(vec![], RemediationConfig::default());
        let (_id, mut sub) = orch.hub.subscribe().await;

        orch.process_batch(vec![parsed("fp1", "boom")]).await;

        let incident = orch.store.get_by_fingerprint("fp1").await.unwrap();
        assert_eq!(incident.count, 1);

        // Expect an Incident event followed by a Stats event.
        let first = sub.recv().await.unwrap();
        assert!(matches!(first, BroadcastEvent::Incident(_)));
        let second = sub.recv().await.unwrap();
        assert!(matches!(second, BroadcastEvent::Stats(_)));
    }

    #[tokio::test]
    async fn duplicate_within_window_updates_store_but_suppresses_broadcast() {
        let (orch, _rx) = harness(vec![], RemediationConfig::default());

        orch.process_batch(vec![parsed("fp1", "boom")]).await;

        let (_id, mut sub) = orch.hub.subscribe().await;
        orch.process_batch(vec![parsed("fp1", "boom")]).await;

        let incident = orch.store.get_by_fingerprint("fp1").await.unwrap();
        assert_eq!(incident.count, 2);

        // Only the stats event should follow; no second Incident event.
        let event = sub.recv().await.unwrap();
        assert!(matches!(event, BroadcastEvent::Stats(_)));
        assert!(sub.try_recv().is_err());
    }

    #[tokio::test]
    async fn matched_rule_with_remediation_logs_and_marks_remediated() {
        let rule = RuleSpec {
            name: "crashloop".to_string(),
            pattern: None,
            keywords: vec!["crashloopbackoff".to_string()],
            labels: HashMap::new(),
            namespaces: vec![],
            priority: "P2".to_string(),
            remediation: Some(RemediationSpec {
                action: ActionType::RestartPod { grace_period: 10 },
                cooldown_secs: 300,
            }),
            enabled: true,
        };
        let (orch, _rx) = harness(vec![rule], RemediationConfig::default());

        orch.process_batch(vec![parsed("fp1", "CrashLoopBackOff detected")])
            .await;

        let incident = orch.store.get_by_fingerprint("fp1").await.unwrap();
        assert!(incident.remediated);
        assert!(incident.remediated_at.is_some());

        let logs = orch.store.list_remediation_logs_for_incident(&incident.id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, RemediationStatus::Success);
    }

    #[tokio::test]
    async fn retention_sweep_removes_only_stale_records() {
        let (orch, _rx) = harness(vec![], RemediationConfig::default());
        orch.store
            .save_incident(IncidentInput {
                fingerprint: "old".to_string(),
                timestamp: Utc::now() - chrono::Duration::days(10),
                namespace: "p".to_string(),
                pod: "pod".to_string(),
                container: "c".to_string(),
                message: "m".to_string(),
                priority: crate::rules::Priority::P3,
                rule_name: "default".to_string(),
                labels: HashMap::new(),
                raw: "m".to_string(),
            })
            .await
            .unwrap();
        orch.store
            .save_incident(IncidentInput {
                fingerprint: "fresh".to_string(),
                timestamp: Utc::now(),
                namespace: "p".to_string(),
                pod: "pod".to_string(),
                container: "c".to_string(),
                message: "m".to_string(),
                priority: crate::rules::Priority::P3,
                rule_name: "default".to_string(),
                labels: HashMap::new(),
                raw: "m".to_string(),
            })
            .await
            .unwrap();

        orch.retention_sweep().await;

        assert!(orch.store.get_by_fingerprint("old").await.is_none());
        assert!(orch.store.get_by_fingerprint("fresh").await.is_some());
    }
}
