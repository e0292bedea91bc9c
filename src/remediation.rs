//! Remediation engine: safety-gated dispatch from a matched rule's
//! `RemediationSpec` to a concrete `ClusterApi` action.
//!
//! Every call to [`RemediationEngine::remediate`] produces exactly one
//! `RemediationLog`, whether the action ran, was skipped by a gate, or
//! failed — there is no silent no-op path.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use tokio::process::Command;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use crate::k8s::ClusterApi;
use crate::rules::{ActionType, RemediationSpec};
use crate::store::{Incident, RemediationLog, RemediationStatus};

/// Global remediation policy.
#[derive(Debug, Clone)]
pub struct RemediationConfig {
    pub enabled: bool,
    pub dry_run: bool,
    pub namespace_exclusions: Vec<String>,
    pub max_actions_per_hour: u32,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            namespace_exclusions: Vec::new(),
            max_actions_per_hour: 30,
        }
    }
}

/// Safety-gated action dispatcher. Cooldown and hourly-cap state are each
/// guarded by their own mutex since they are updated independently of any
/// other component's lock.
pub struct RemediationEngine {
    cluster: Arc<dyn ClusterApi>,
    config: RwLock<RemediationConfig>,
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,
    recent_actions: Mutex<VecDeque<DateTime<Utc>>>,
    handlebars: Handlebars<'static>,
}

impl RemediationEngine {
    #[must_use]
    pub fn new(cluster: Arc<dyn ClusterApi>, config: RemediationConfig) -> Self {
        Self {
            cluster,
            config: RwLock::new(config),
            cooldowns: Mutex::new(HashMap::new()),
            recent_actions: Mutex::new(VecDeque::new()),
            handlebars: Handlebars::new(),
        }
    }

    /// Current policy, for the dashboard settings surface.
    pub async fn current_config(&self) -> RemediationConfig {
        self.config.read().await.clone()
    }

    /// Replace the policy wholesale. Does not clear existing cooldowns or
    /// the hourly counter.
    pub async fn update_config(&self, config: RemediationConfig) {
        *self.config.write().await = config;
    }

    fn log(
        incident: &Incident,
        action: &str,
        target: &str,
        status: RemediationStatus,
        message: impl Into<String>,
        dry_run: bool,
    ) -> RemediationLog {
        RemediationLog {
            id: Uuid::new_v4().to_string(),
            incident_id: incident.id.clone(),
            action: action.to_string(),
            target: target.to_string(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
            dry_run,
        }
    }

    /// Resolve the concrete target identifier an action acts upon. Pod-scoped
    /// actions target the offending pod directly; deployment-scoped actions
    /// resolve the owning `Deployment` through the pod's owner chain.
    async fn resolve_target(&self, incident: &Incident, action: &ActionType) -> Result<String, String> {
        match action {
            ActionType::RestartPod { .. } | ActionType::DeleteStuckPods { .. } => {
                Ok(incident.pod.clone())
            }
            ActionType::ScaleUp { .. } | ActionType::ScaleDown { .. } | ActionType::Rollback { .. } => {
                self.cluster
                    .resolve_deployment_for_pod(&incident.namespace, &incident.pod)
                    .await
                    .map_err(|e| e.to_string())
            }
            ActionType::None | ActionType::ExecScript { .. } => Ok(incident.pod.clone()),
        }
    }

    async fn under_hourly_cap(&self, max_actions_per_hour: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        let mut guard = self.recent_actions.lock().await;
        while guard.front().is_some_and(|t| *t < cutoff) {
            guard.pop_front();
        }
        (guard.len() as u32) < max_actions_per_hour
    }

    async fn record_action_taken(&self, cooldown_key: String, cooldown_until: DateTime<Utc>) {
        self.cooldowns.lock().await.insert(cooldown_key, cooldown_until);
        self.recent_actions.lock().await.push_back(Utc::now());
    }

    /// Evaluate gates and, if all pass, dispatch the action. Always returns
    /// a log record; never panics on a cluster-side failure.
    pub async fn remediate(
        &self,
        incident: &Incident,
        rule_name: &str,
        spec: &RemediationSpec,
    ) -> RemediationLog {
        let action_name = spec.action.name();
        let config = self.current_config().await;

        if !config.enabled {
            return Self::log(
                incident,
                action_name,
                &incident.pod,
                RemediationStatus::Skipped,
                "remediation disabled globally",
                config.dry_run,
            );
        }

        if matches!(spec.action, ActionType::None) {
            return Self::log(
                incident,
                action_name,
                &incident.pod,
                RemediationStatus::Skipped,
                "no action configured for matched rule",
                config.dry_run,
            );
        }

        if config
            .namespace_exclusions
            .iter()
            .any(|ns| ns == &incident.namespace)
        {
            return Self::log(
                incident,
                action_name,
                &incident.pod,
                RemediationStatus::Skipped,
                format!("namespace {} is excluded from remediation", incident.namespace),
                config.dry_run,
            );
        }

        let target = match self.resolve_target(incident, &spec.action).await {
            Ok(t) => t,
            Err(reason) => {
                return Self::log(
                    incident,
                    action_name,
                    &incident.pod,
                    RemediationStatus::Failed,
                    format!("could not resolve remediation target: {reason}"),
                    config.dry_run,
                );
            }
        };

        let cooldown_key = format!("{rule_name}:{}/{target}", incident.namespace);
        {
            let guard = self.cooldowns.lock().await;
            if let Some(until) = guard.get(&cooldown_key) {
                if *until > Utc::now() {
                    return Self::log(
                        incident,
                        action_name,
                        &target,
                        RemediationStatus::Skipped,
                        format!("cooldown active until {until}"),
                        config.dry_run,
                    );
                }
            }
        }

        if !self.under_hourly_cap(config.max_actions_per_hour).await {
            return Self::log(
                incident,
                action_name,
                &target,
                RemediationStatus::Skipped,
                format!(
                    "hourly remediation cap of {} reached",
                    config.max_actions_per_hour
                ),
                config.dry_run,
            );
        }

        let cooldown_until = Utc::now() + chrono::Duration::seconds(spec.cooldown_secs as i64);
        self.record_action_taken(cooldown_key, cooldown_until).await;

        if config.dry_run {
            info!(namespace = %incident.namespace, target = %target, action = action_name, "dry-run: would have executed action");
            return Self::log(
                incident,
                action_name,
                &target,
                RemediationStatus::Success,
                format!("dry run — would execute {action_name}"),
                true,
            );
        }

        match self.dispatch(incident, &target, &spec.action).await {
            Ok(message) => Self::log(
                incident,
                action_name,
                &target,
                RemediationStatus::Success,
                message,
                false,
            ),
            Err(message) => Self::log(
                incident,
                action_name,
                &target,
                RemediationStatus::Failed,
                message,
                false,
            ),
        }
    }

    async fn dispatch(
        &self,
        incident: &Incident,
        target: &str,
        action: &ActionType,
    ) -> Result<String, String> {
        match action {
            ActionType::None => Ok("no-op".to_string()),

            ActionType::RestartPod { grace_period } => self
                .cluster
                .delete_pod(&incident.namespace, target, *grace_period)
                .await
                .map(|()| format!("deleted pod {target} (grace period {grace_period}s)"))
                .map_err(|e| e.to_string()),

            ActionType::ScaleUp { increment, max_replicas } => {
                let current = self
                    .cluster
                    .get_deployment_replicas(&incident.namespace, target)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut desired = current + *increment as i32;
                if let Some(max) = max_replicas {
                    desired = desired.min(*max as i32);
                }
                self.cluster
                    .scale_deployment(&incident.namespace, target, desired)
                    .await
                    .map(|()| format!("scaled {target} from {current} to {desired} replicas"))
                    .map_err(|e| e.to_string())
            }

            ActionType::ScaleDown { decrement, min_replicas } => {
                let current = self
                    .cluster
                    .get_deployment_replicas(&incident.namespace, target)
                    .await
                    .map_err(|e| e.to_string())?;
                let desired = (current - *decrement as i32).max(*min_replicas as i32);
                self.cluster
                    .scale_deployment(&incident.namespace, target, desired)
                    .await
                    .map(|()| format!("scaled {target} from {current} to {desired} replicas"))
                    .map_err(|e| e.to_string())
            }

            ActionType::Rollback { to_revision } => self
                .cluster
                .patch_deployment_rollback(&incident.namespace, target, *to_revision)
                .await
                .map(|()| format!("rolled back {target} toward revision {to_revision}"))
                .map_err(|e| e.to_string()),

            ActionType::DeleteStuckPods { force, stuck_threshold } => {
                self.delete_stuck_pods(&incident.namespace, *force, *stuck_threshold).await
            }

            ActionType::ExecScript { script, timeout, args } => {
                self.exec_script(incident, script, *timeout, args).await
            }
        }
    }

    async fn delete_stuck_pods(
        &self,
        namespace: &str,
        force: bool,
        stuck_threshold_secs: u64,
    ) -> Result<String, String> {
        let pods = self
            .cluster
            .list_pods(namespace, None)
            .await
            .map_err(|e| e.to_string())?;

        let threshold = chrono::Duration::seconds(stuck_threshold_secs as i64);
        let now = Utc::now();
        let mut deleted = Vec::new();

        for pod in pods {
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("");
            let is_stuck_phase = matches!(phase, "Pending" | "Unknown");
            let started_long_ago = pod
                .status
                .as_ref()
                .and_then(|s| s.start_time.as_ref())
                .is_some_and(|t| now - t.0 >= threshold);

            if is_stuck_phase && started_long_ago {
                if let Some(name) = pod.metadata.name.clone() {
                    let grace = if force { 0 } else { 30 };
                    match self.cluster.delete_pod(namespace, &name, grace).await {
                        Ok(()) => deleted.push(name),
                        Err(e) => warn!(pod = %name, error = %e, "failed to delete stuck pod"),
                    }
                }
            }
        }

        if deleted.is_empty() {
            Ok("no stuck pods found".to_string())
        } else {
            Ok(format!("deleted stuck pods: {}", deleted.join(", ")))
        }
    }

    async fn exec_script(
        &self,
        incident: &Incident,
        script: &str,
        timeout_secs: u64,
        args: &HashMap<String, String>,
    ) -> Result<String, String> {
        let mut rendered = Vec::with_capacity(args.len());
        let mut context = HashMap::new();
        context.insert("namespace".to_string(), incident.namespace.clone());
        context.insert("pod".to_string(), incident.pod.clone());
        context.insert("container".to_string(), incident.container.clone());
        context.insert("fingerprint".to_string(), incident.fingerprint.clone());

        for (key, template) in args {
            let value = self
                .handlebars
                .render_template(template, &context)
                .map_err(|e| format!("argument template {key:?} failed: {e}"))?;
            rendered.push(value);
        }

        let mut command = Command::new(script);
        command
            .args(&rendered)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let run = tokio::time::timeout(Duration::from_secs(timeout_secs), command.output());
        match run.await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(format!("script {script} exited successfully"))
            }
            Ok(Ok(output)) => Err(format!(
                "script {script} exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr)
            )),
            Ok(Err(e)) => Err(format!("failed to spawn script {script}: {e}")),
            Err(_) => Err(format!("script {script} timed out after {timeout_secs}s")),
        }
    }
}
