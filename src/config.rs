//! Config loader: the `config.yaml` document, its defaults, and
//! startup-time validation. A malformed or invalid document is a
//! fatal startup error — never silently patched into something runnable.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_poll_interval_secs() -> u64 {
    30
}
fn default_lookback_secs() -> u64 {
    120
}
fn default_result_limit() -> u32 {
    1000
}
fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_rules_file() -> String {
    "rules.yaml".to_string()
}
fn default_max_actions_per_hour() -> u32 {
    30
}
fn default_store_kind() -> String {
    "memory".to_string()
}
fn default_max_incidents() -> usize {
    crate::store::DEFAULT_MAX_INCIDENTS
}
fn default_max_remediation_logs() -> usize {
    crate::store::DEFAULT_MAX_REMEDIATION_LOGS
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogSourceConfigDoc {
    pub url: String,
    pub query: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    #[serde(default = "default_result_limit")]
    pub result_limit: u32,
    #[serde(default)]
    pub tenant_header: Option<String>,
    #[serde(default)]
    pub basic_auth_username: Option<String>,
    #[serde(default)]
    pub basic_auth_password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "auth")]
pub enum ClusterConfigDoc {
    InCluster,
    Kubeconfig { path: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebConfigDoc {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfigDoc {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemediationConfigDoc {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub namespace_exclusions: Vec<String>,
    #[serde(default = "default_max_actions_per_hour")]
    pub max_actions_per_hour: u32,
}

impl Default for RemediationConfigDoc {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            namespace_exclusions: Vec::new(),
            max_actions_per_hour: default_max_actions_per_hour(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfigDoc {
    #[serde(default = "default_store_kind")]
    pub kind: String,
    #[serde(default = "default_max_incidents")]
    pub max_incidents: usize,
    #[serde(default = "default_max_remediation_logs")]
    pub max_remediation_logs: usize,
}

impl Default for StoreConfigDoc {
    fn default() -> Self {
        Self {
            kind: default_store_kind(),
            max_incidents: default_max_incidents(),
            max_remediation_logs: default_max_remediation_logs(),
        }
    }
}

/// Top-level `config.yaml` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub log_source: LogSourceConfigDoc,
    pub cluster: ClusterConfigDoc,
    #[serde(default)]
    pub web: WebConfigDoc,
    #[serde(default)]
    pub remediation: RemediationConfigDoc,
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
    #[serde(default)]
    pub store: StoreConfigDoc,
}

const RECOGNIZED_STORE_KINDS: &[&str] = &["memory"];

impl ConfigDocument {
    /// Validate cross-field invariants not expressible with `serde`
    /// defaults alone.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_source.url.trim().is_empty() {
            return Err(ConfigError::Invalid("logSource.url must not be empty".to_string()));
        }
        if self.log_source.query.trim().is_empty() {
            return Err(ConfigError::Invalid("logSource.query must not be empty".to_string()));
        }
        if self.log_source.poll_interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "logSource.pollIntervalSecs must be at least 1".to_string(),
            ));
        }
        if self.log_source.lookback_secs < self.log_source.poll_interval_secs {
            return Err(ConfigError::Invalid(
                "logSource.lookbackSecs must be >= pollIntervalSecs".to_string(),
            ));
        }
        if self.web.listen.trim().is_empty() {
            return Err(ConfigError::Invalid("web.listen must not be empty".to_string()));
        }
        if let ClusterConfigDoc::Kubeconfig { path } = &self.cluster {
            if path.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "cluster.path must not be empty when auth is kubeconfig".to_string(),
                ));
            }
        }
        if !RECOGNIZED_STORE_KINDS.contains(&self.store.kind.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "unrecognized store.kind {:?}; expected one of {:?}",
                self.store.kind, RECOGNIZED_STORE_KINDS
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.log_source.poll_interval_secs)
    }

    #[must_use]
    pub fn lookback(&self) -> Duration {
        Duration::from_secs(self.log_source.lookback_secs)
    }
}

/// Load and validate a config document from disk. I/O and parse failures
/// are wrapped distinctly so the operator can tell "file missing" from
/// "file malformed" at a glance.
pub fn load(path: impl AsRef<Path>) -> Result<ConfigDocument, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let doc: ConfigDocument = serde_yaml::from_str(&raw)?;
    doc.validate()?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_doc() -> ConfigDocument {
        ConfigDocument {
            log_source: LogSourceConfigDoc {
                url: "http://loki:3100".to_string(),
                query: "{namespace=~\".+\"}".to_string(),
                poll_interval_secs: 30,
                lookback_secs: 120,
                result_limit: 1000,
                tenant_header: None,
                basic_auth_username: None,
                basic_auth_password: None,
            },
            cluster: ClusterConfigDoc::InCluster,
            web: WebConfigDoc::default(),
            remediation: RemediationConfigDoc::default(),
            rules_file: default_rules_file(),
            store: StoreConfigDoc::default(),
        }
    }

    #[test]
    fn valid_document_passes() {
        assert!(valid_doc().validate().is_ok());
    }

    #[test]
    fn empty_url_rejected() {
        let mut doc = valid_doc();
        doc.log_source.url = String::new();
        assert!(doc.validate().is_err());
    }

    #[test]
    fn lookback_shorter_than_poll_interval_rejected() {
        let mut doc = valid_doc();
        doc.log_source.poll_interval_secs = 60;
        doc.log_source.lookback_secs = 30;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let mut doc = valid_doc();
        doc.log_source.poll_interval_secs = 0;
        assert!(doc.validate().is_err());
    }

    #[test]
    fn unrecognized_store_kind_rejected() {
        let mut doc = valid_doc();
        doc.store.kind = "postgres".to_string();
        assert!(doc.validate().is_err());
    }

    #[test]
    fn kubeconfig_without_path_rejected() {
        let mut doc = valid_doc();
        doc.cluster = ClusterConfigDoc::Kubeconfig { path: String::new() };
        assert!(doc.validate().is_err());
    }

    #[test]
    fn parses_full_yaml_document() {
        let yaml = r#"
logSource:
  url: http://loki:3100
  query: '{namespace=~".+"}'
  pollIntervalSecs: 15
  lookbackSecs: 60
cluster:
  auth: inCluster
web:
  listen: "0.0.0.0:9090"
remediation:
  enabled: true
  dryRun: false
  namespaceExclusions: ["kube-system"]
  maxActionsPerHour: 10
rulesFile: rules.yaml
store:
  kind: memory
"#;
        let doc: ConfigDocument = serde_yaml::from_str(yaml).unwrap();
        assert!(doc.validate().is_ok());
        assert_eq!(doc.web.listen, "0.0.0.0:9090");
        assert_eq!(doc.remediation.namespace_exclusions, vec!["kube-system"]);
    }

    #[test]
    fn missing_file_surfaces_read_error() {
        let err = load("/nonexistent/path/to/config.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
