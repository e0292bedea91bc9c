//! Incident store: fingerprint-indexed, bounded, LRU-evictable incidents
//! with a remediation-log sidecar.
//!
//! A single `tokio::sync::RwLock` guards the by-id index, the
//! by-fingerprint index, and the remediation logs as one consistent unit —
//! every public operation that mutates any of them holds the write guard
//! for its entire critical section, so evictions can never leave the two
//! incident indexes disagreeing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::rules::Priority;

/// Default bound on live incidents before LRU eviction kicks in.
pub const DEFAULT_MAX_INCIDENTS: usize = 10_000;
/// Default bound on retained remediation logs.
pub const DEFAULT_MAX_REMEDIATION_LOGS: usize = 5_000;

/// A deduplicated, persisted class of errors with occurrence stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub message: String,
    pub priority: Priority,
    pub rule_name: String,
    pub labels: HashMap<String, String>,
    pub raw: String,
    pub remediated: bool,
    pub remediated_at: Option<DateTime<Utc>>,
}

/// Outcome of a remediation attempt, always recorded (including skips and
/// dry-runs). Append-only; never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RemediationStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationLog {
    pub id: String,
    pub incident_id: String,
    pub action: String,
    pub target: String,
    pub status: RemediationStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub dry_run: bool,
}

/// Input to `save_incident`: an occurrence of a classified error.
#[derive(Debug, Clone)]
pub struct IncidentInput {
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub message: String,
    pub priority: Priority,
    pub rule_name: String,
    pub labels: HashMap<String, String>,
    pub raw: String,
}

/// AND-combined listing filter. Empty/zero/`None` fields match all.
#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub namespace: Option<String>,
    pub priority: Option<Priority>,
    /// Case-insensitive substring across message, pod, namespace.
    pub search: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Pagination {
    pub offset: usize,
    /// `0` means "no limit" (return all from `offset`).
    pub limit: usize,
}

/// Aggregated, derived counters — never authoritative, always recomputed.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Stats {
    pub by_priority: HashMap<String, u64>,
    pub by_namespace: HashMap<String, u64>,
    pub remediation_success: u64,
    pub remediation_failed: u64,
    pub remediation_skipped: u64,
    pub last_incident_at: Option<DateTime<Utc>>,
    pub last_remediation_at: Option<DateTime<Utc>>,
    pub total_incidents: u64,
}

/// Abstract storage contract. The shipped implementation (`MemoryStore`)
/// is the in-memory variant; a durable implementation must satisfy the
/// same trait.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn save_incident(&self, input: IncidentInput) -> Result<Incident, StoreError>;
    async fn get_by_id(&self, id: &str) -> Option<Incident>;
    async fn get_by_fingerprint(&self, fingerprint: &str) -> Option<Incident>;
    async fn list(
        &self,
        filter: IncidentFilter,
        pagination: Pagination,
    ) -> (Vec<Incident>, usize);
    async fn update_incident(&self, incident: Incident) -> Result<(), StoreError>;
    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError>;
    async fn delete_incidents_older_than(&self, cutoff: DateTime<Utc>) -> usize;

    async fn save_remediation_log(&self, log: RemediationLog) -> Result<(), StoreError>;
    async fn get_remediation_log(&self, id: &str) -> Option<RemediationLog>;
    async fn list_remediation_logs(&self, pagination: Pagination) -> (Vec<RemediationLog>, usize);
    async fn list_remediation_logs_for_incident(&self, incident_id: &str) -> Vec<RemediationLog>;
    async fn delete_remediation_logs_older_than(&self, cutoff: DateTime<Utc>) -> usize;

    async fn stats(&self) -> Stats;
    async fn close(&self);
}

struct Inner {
    by_id: HashMap<String, Incident>,
    by_fingerprint: HashMap<String, String>,
    logs: Vec<RemediationLog>,
}

/// In-memory `IncidentStore`. No durability across restart, per the
/// spec's non-goals.
pub struct MemoryStore {
    inner: RwLock<Inner>,
    max_incidents: usize,
    max_remediation_logs: usize,
}

impl MemoryStore {
    #[must_use]
    pub fn new(max_incidents: usize, max_remediation_logs: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_fingerprint: HashMap::new(),
                logs: Vec::new(),
            }),
            max_incidents,
            max_remediation_logs,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_INCIDENTS, DEFAULT_MAX_REMEDIATION_LOGS)
    }
}

/// Evict the oldest `ceil(max / 10)` incidents by ascending `last_seen`,
/// keeping both indexes consistent. Called while already holding the
/// write lock, so it can never deadlock with the saving caller.
fn evict_incidents_if_over_capacity(inner: &mut Inner, max: usize) {
    if inner.by_id.len() <= max {
        return;
    }
    let to_evict = max.div_ceil(10);
    let mut ids: Vec<(String, DateTime<Utc>)> = inner
        .by_id
        .iter()
        .map(|(id, inc)| (id.clone(), inc.last_seen))
        .collect();
    ids.sort_by_key(|(_, last_seen)| *last_seen);
    for (id, _) in ids.into_iter().take(to_evict) {
        if let Some(incident) = inner.by_id.remove(&id) {
            inner.by_fingerprint.remove(&incident.fingerprint);
        }
    }
}

fn evict_logs_if_over_capacity(inner: &mut Inner, max: usize) {
    if inner.logs.len() <= max {
        return;
    }
    let to_evict = max.div_ceil(10);
    inner.logs.sort_by_key(|l| l.timestamp);
    inner.logs.drain(0..to_evict.min(inner.logs.len()));
}

fn matches_filter(incident: &Incident, filter: &IncidentFilter) -> bool {
    if let Some(ns) = &filter.namespace {
        if !ns.is_empty() && incident.namespace != *ns {
            return false;
        }
    }
    if let Some(p) = filter.priority {
        if incident.priority != p {
            return false;
        }
    }
    if let Some(search) = &filter.search {
        if !search.is_empty() {
            let needle = search.to_lowercase();
            let haystack = format!(
                "{} {} {}",
                incident.message, incident.pod, incident.namespace
            )
            .to_lowercase();
            if !haystack.contains(&needle) {
                return false;
            }
        }
    }
    true
}

fn paginate<T>(mut items: Vec<T>, pagination: Pagination) -> Vec<T> {
    let total = items.len();
    if pagination.offset >= total {
        return Vec::new();
    }
    items.drain(0..pagination.offset);
    if pagination.limit > 0 && items.len() > pagination.limit {
        items.truncate(pagination.limit);
    }
    items
}

#[async_trait]
impl IncidentStore for MemoryStore {
    async fn save_incident(&self, input: IncidentInput) -> Result<Incident, StoreError> {
        let mut guard = self.inner.write().await;

        if let Some(existing_id) = guard.by_fingerprint.get(&input.fingerprint).cloned() {
            let incident = guard
                .by_id
                .get_mut(&existing_id)
                .ok_or_else(|| StoreError::InvariantViolation(format!(
                    "by-fingerprint index pointed at missing incident {existing_id}"
                )))?;
            incident.count += 1;
            incident.last_seen = incident.last_seen.max(input.timestamp);
            incident.first_seen = incident.first_seen.min(input.timestamp);
            let updated = incident.clone();
            return Ok(updated);
        }

        let incident = Incident {
            id: Uuid::new_v4().to_string(),
            fingerprint: input.fingerprint.clone(),
            first_seen: input.timestamp,
            last_seen: input.timestamp,
            count: 1,
            namespace: input.namespace,
            pod: input.pod,
            container: input.container,
            message: input.message,
            priority: input.priority,
            rule_name: input.rule_name,
            labels: input.labels,
            raw: input.raw,
            remediated: false,
            remediated_at: None,
        };
        guard
            .by_fingerprint
            .insert(input.fingerprint, incident.id.clone());
        guard.by_id.insert(incident.id.clone(), incident.clone());

        evict_incidents_if_over_capacity(&mut guard, self.max_incidents);
        Ok(incident)
    }

    async fn get_by_id(&self, id: &str) -> Option<Incident> {
        self.inner.read().await.by_id.get(id).cloned()
    }

    async fn get_by_fingerprint(&self, fingerprint: &str) -> Option<Incident> {
        let guard = self.inner.read().await;
        let id = guard.by_fingerprint.get(fingerprint)?;
        guard.by_id.get(id).cloned()
    }

    async fn list(
        &self,
        filter: IncidentFilter,
        pagination: Pagination,
    ) -> (Vec<Incident>, usize) {
        let guard = self.inner.read().await;
        let mut matched: Vec<Incident> = guard
            .by_id
            .values()
            .filter(|i| matches_filter(i, &filter))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.priority
                .weight()
                .cmp(&b.priority.weight())
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });
        let total = matched.len();
        (paginate(matched, pagination), total)
    }

    async fn update_incident(&self, incident: Incident) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        if !guard.by_id.contains_key(&incident.id) {
            return Err(StoreError::IncidentNotFound(incident.id));
        }
        guard.by_id.insert(incident.id.clone(), incident);
        Ok(())
    }

    async fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        let incident = guard
            .by_id
            .remove(id)
            .ok_or_else(|| StoreError::IncidentNotFound(id.to_string()))?;
        guard.by_fingerprint.remove(&incident.fingerprint);
        Ok(())
    }

    async fn delete_incidents_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.inner.write().await;
        let stale: Vec<String> = guard
            .by_id
            .values()
            .filter(|i| i.last_seen < cutoff)
            .map(|i| i.id.clone())
            .collect();
        for id in &stale {
            if let Some(incident) = guard.by_id.remove(id) {
                guard.by_fingerprint.remove(&incident.fingerprint);
            }
        }
        stale.len()
    }

    async fn save_remediation_log(&self, log: RemediationLog) -> Result<(), StoreError> {
        let mut guard = self.inner.write().await;
        guard.logs.push(log);
        evict_logs_if_over_capacity(&mut guard, self.max_remediation_logs);
        Ok(())
    }

    async fn get_remediation_log(&self, id: &str) -> Option<RemediationLog> {
        self.inner
            .read()
            .await
            .logs
            .iter()
            .find(|l| l.id == id)
            .cloned()
    }

    async fn list_remediation_logs(&self, pagination: Pagination) -> (Vec<RemediationLog>, usize) {
        let guard = self.inner.read().await;
        let mut logs = guard.logs.clone();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let total = logs.len();
        (paginate(logs, pagination), total)
    }

    async fn list_remediation_logs_for_incident(&self, incident_id: &str) -> Vec<RemediationLog> {
        let guard = self.inner.read().await;
        let mut logs: Vec<RemediationLog> = guard
            .logs
            .iter()
            .filter(|l| l.incident_id == incident_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs
    }

    async fn delete_remediation_logs_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.inner.write().await;
        let before = guard.logs.len();
        guard.logs.retain(|l| l.timestamp >= cutoff);
        before - guard.logs.len()
    }

    async fn stats(&self) -> Stats {
        let guard = self.inner.read().await;
        let mut by_priority = HashMap::new();
        let mut by_namespace = HashMap::new();
        let mut last_incident_at = None;

        for incident in guard.by_id.values() {
            *by_priority.entry(incident.priority.to_string()).or_insert(0) += 1;
            *by_namespace.entry(incident.namespace.clone()).or_insert(0) += 1;
            last_incident_at = Some(last_incident_at.map_or(incident.last_seen, |t: DateTime<Utc>| t.max(incident.last_seen)));
        }

        let mut remediation_success = 0;
        let mut remediation_failed = 0;
        let mut remediation_skipped = 0;
        let mut last_remediation_at = None;
        for log in &guard.logs {
            match log.status {
                RemediationStatus::Success => remediation_success += 1,
                RemediationStatus::Failed => remediation_failed += 1,
                RemediationStatus::Skipped => remediation_skipped += 1,
            }
            last_remediation_at = Some(
                last_remediation_at.map_or(log.timestamp, |t: DateTime<Utc>| t.max(log.timestamp)),
            );
        }

        Stats {
            by_priority,
            by_namespace,
            remediation_success,
            remediation_failed,
            remediation_skipped,
            last_incident_at,
            last_remediation_at,
            total_incidents: guard.by_id.len() as u64,
        }
    }

    async fn close(&self) {}
}
