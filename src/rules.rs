//! Ordered, first-match-wins rule engine with pre-compiled patterns and
//! atomic hot-reload.
//!
//! Reads (match operations) hold a `tokio::sync::RwLock` read guard; an
//! in-flight match always observes a consistent `(rules, patterns)` pair
//! because the compiled-pattern cache and the rule list are swapped
//! together, under one write lock, in [`RuleEngine::update_rules`].

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::RuleError;
use crate::poller::ParsedError;

/// Rule severity. Lower weight sorts first (P1 is most severe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    P1,
    P2,
    P3,
    P4,
}

impl Priority {
    #[must_use]
    pub fn weight(self) -> u8 {
        match self {
            Priority::P1 => 1,
            Priority::P2 => 2,
            Priority::P3 => 3,
            Priority::P4 => 4,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
            Priority::P4 => "P4",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            "P4" => Ok(Priority::P4),
            other => Err(format!("unknown priority {other:?}")),
        }
    }
}

/// The closed set of remediation actions (REDESIGN FLAG: discriminated
/// action type instead of a string enum with per-variant stringly-typed
/// params).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "action")]
pub enum ActionType {
    None,
    RestartPod {
        #[serde(default = "default_grace_period")]
        grace_period: u32,
    },
    ScaleUp {
        #[serde(default = "default_increment")]
        increment: u32,
        max_replicas: Option<u32>,
    },
    ScaleDown {
        #[serde(default = "default_decrement")]
        decrement: u32,
        #[serde(default = "default_min_replicas")]
        min_replicas: u32,
    },
    Rollback {
        #[serde(default)]
        to_revision: u64,
    },
    DeleteStuckPods {
        #[serde(default)]
        force: bool,
        #[serde(default = "default_stuck_threshold")]
        stuck_threshold: u64,
    },
    ExecScript {
        script: String,
        #[serde(default = "default_script_timeout")]
        timeout: u64,
        #[serde(default)]
        args: HashMap<String, String>,
    },
}

fn default_grace_period() -> u32 {
    30
}
fn default_increment() -> u32 {
    1
}
fn default_decrement() -> u32 {
    1
}
fn default_min_replicas() -> u32 {
    1
}
fn default_stuck_threshold() -> u64 {
    300
}
fn default_script_timeout() -> u64 {
    60
}

impl Default for ActionType {
    fn default() -> Self {
        ActionType::None
    }
}

impl ActionType {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            ActionType::None => "none",
            ActionType::RestartPod { .. } => "restart-pod",
            ActionType::ScaleUp { .. } => "scale-up",
            ActionType::ScaleDown { .. } => "scale-down",
            ActionType::Rollback { .. } => "rollback",
            ActionType::DeleteStuckPods { .. } => "delete-stuck-pods",
            ActionType::ExecScript { .. } => "exec-script",
        }
    }
}

/// Remediation block attached to a matched rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationSpec {
    #[serde(flatten)]
    pub action: ActionType,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_cooldown_secs() -> u64 {
    300
}

/// Namespace filter entry: bare name (include) or `!`-prefixed (exclude).
#[derive(Debug, Clone)]
enum NamespaceFilter {
    Include(String),
    Exclude(String),
}

/// Label filter value: exact match, `!`-prefixed negation, or `~`-prefixed
/// compiled regex.
#[derive(Debug, Clone)]
enum LabelMatcher {
    Exact(String),
    Negate(String),
    Regex(Regex),
}

/// Raw, serializable rule as loaded from `rules.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub namespaces: Vec<String>,
    pub priority: String,
    #[serde(default)]
    pub remediation: Option<RemediationSpec>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Rule set document: `{rules: [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSetDocument {
    pub rules: Vec<RuleSpec>,
}

/// A compiled, ready-to-match rule.
struct CompiledRule {
    spec: RuleSpec,
    namespaces: Vec<NamespaceFilter>,
    labels: HashMap<String, LabelMatcher>,
    pattern: Option<Regex>,
    keywords_lower: Vec<String>,
}

/// Outcome of matching a `ParsedError` against the rule set.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_name: String,
    pub priority: Priority,
    pub remediation: Option<RemediationSpec>,
}

impl RuleMatch {
    fn default_match() -> Self {
        Self {
            rule_name: "default".to_string(),
            priority: Priority::P4,
            remediation: None,
        }
    }
}

fn compile_rule(spec: RuleSpec) -> Result<CompiledRule, RuleError> {
    if spec.name.trim().is_empty() {
        return Err(RuleError::Invalid {
            name: spec.name.clone(),
            reason: "rule name must not be empty".to_string(),
        });
    }
    if spec.pattern.is_none() && spec.keywords.is_empty() {
        return Err(RuleError::Invalid {
            name: spec.name.clone(),
            reason: "rule must specify at least one of pattern or keywords".to_string(),
        });
    }
    Priority::from_str(&spec.priority).map_err(|reason| RuleError::Invalid {
        name: spec.name.clone(),
        reason,
    })?;

    let pattern = spec
        .pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|source| RuleError::PatternCompile {
            name: spec.name.clone(),
            source,
        })?;

    let namespaces = spec
        .namespaces
        .iter()
        .map(|n| {
            if let Some(excluded) = n.strip_prefix('!') {
                NamespaceFilter::Exclude(excluded.to_string())
            } else {
                NamespaceFilter::Include(n.clone())
            }
        })
        .collect();

    let mut labels = HashMap::new();
    for (k, v) in &spec.labels {
        let matcher = if let Some(negated) = v.strip_prefix('!') {
            LabelMatcher::Negate(negated.to_string())
        } else if let Some(re) = v.strip_prefix('~') {
            let compiled = Regex::new(re).map_err(|source| RuleError::PatternCompile {
                name: spec.name.clone(),
                source,
            })?;
            LabelMatcher::Regex(compiled)
        } else {
            LabelMatcher::Exact(v.clone())
        };
        labels.insert(k.clone(), matcher);
    }

    let keywords_lower = spec.keywords.iter().map(|k| k.to_lowercase()).collect();

    Ok(CompiledRule {
        spec,
        namespaces,
        labels,
        pattern,
        keywords_lower,
    })
}

fn namespace_passes(filters: &[NamespaceFilter], namespace: &str) -> bool {
    if filters.is_empty() {
        return true;
    }
    let any_exclusion_hit = filters.iter().any(|f| match f {
        NamespaceFilter::Exclude(ns) => ns == namespace,
        NamespaceFilter::Include(_) => false,
    });
    if any_exclusion_hit {
        return false;
    }
    let has_inclusions = filters
        .iter()
        .any(|f| matches!(f, NamespaceFilter::Include(_)));
    if !has_inclusions {
        // all entries are exclusions and none matched
        return true;
    }
    filters.iter().any(|f| match f {
        NamespaceFilter::Include(ns) => ns == namespace,
        NamespaceFilter::Exclude(_) => false,
    })
}

fn labels_pass(matchers: &HashMap<String, LabelMatcher>, actual: &HashMap<String, String>) -> bool {
    matchers.iter().all(|(key, matcher)| match matcher {
        LabelMatcher::Negate(expected) => actual.get(key).is_none_or(|v| v != expected),
        LabelMatcher::Exact(expected) => actual.get(key) == Some(expected),
        LabelMatcher::Regex(re) => actual.get(key).is_some_and(|v| re.is_match(v)),
    })
}

fn rule_matches(rule: &CompiledRule, e: &ParsedError) -> bool {
    if !rule.spec.enabled {
        return false;
    }
    if !namespace_passes(&rule.namespaces, &e.namespace) {
        return false;
    }
    if !labels_pass(&rule.labels, &e.labels) {
        return false;
    }
    if let Some(pattern) = &rule.pattern {
        if !(pattern.is_match(&e.message) || pattern.is_match(&e.raw)) {
            return false;
        }
    }
    if !rule.keywords_lower.is_empty() {
        let haystack = format!("{} {}", e.message, e.raw).to_lowercase();
        if !rule.keywords_lower.iter().any(|kw| haystack.contains(kw)) {
            return false;
        }
    }
    true
}

struct Compiled {
    rules: Vec<CompiledRule>,
}

/// Thread-safe, hot-reloadable rule engine.
pub struct RuleEngine {
    inner: RwLock<Compiled>,
}

impl RuleEngine {
    /// Construct the engine from an initial rule set. Fails (and aborts
    /// startup) if any rule is invalid or any pattern fails
    /// to compile.
    pub fn new(rules: Vec<RuleSpec>) -> Result<Self, RuleError> {
        let compiled = rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            inner: RwLock::new(Compiled { rules: compiled }),
        })
    }

    /// Match a `ParsedError` against the current rule set in definition
    /// order. Returns the synthetic `default`/P4 match if nothing matched.
    pub async fn evaluate(&self, e: &ParsedError) -> RuleMatch {
        let guard = self.inner.read().await;
        for rule in &guard.rules {
            if rule_matches(rule, e) {
                let priority = Priority::from_str(&rule.spec.priority)
                    .expect("rule priority validated at compile time");
                return RuleMatch {
                    rule_name: rule.spec.name.clone(),
                    priority,
                    remediation: rule.spec.remediation.clone(),
                };
            }
        }
        RuleMatch::default_match()
    }

    /// Compile `new_rules` into a staging set; on any compile error the
    /// update is rejected and current state is preserved. On success the
    /// rule list and compiled-pattern cache are swapped atomically.
    pub async fn update_rules(&self, new_rules: Vec<RuleSpec>) -> Result<(), RuleError> {
        let compiled = new_rules
            .into_iter()
            .map(compile_rule)
            .collect::<Result<Vec<_>, _>>()?;
        let mut guard = self.inner.write().await;
        guard.rules = compiled;
        Ok(())
    }

    /// Current rule specs, for the dashboard listing surface.
    pub async fn current_specs(&self) -> Vec<RuleSpec> {
        self.inner
            .read()
            .await
            .rules
            .iter()
            .map(|r| r.spec.clone())
            .collect()
    }

    /// Ad-hoc pattern test that never touches engine state. Used by the
    /// dashboard's rule editor.
    pub fn test_pattern(pattern: &str, sample: &str) -> Result<bool, String> {
        let re = Regex::new(pattern).map_err(|e| e.to_string())?;
        Ok(re.is_match(sample))
    }
}

/// Build the engine from a parsed `RuleSetDocument`, applying per-rule
/// defaults (`enabled = true`, cooldown 5 min, action `none`). Defaults
/// are applied during deserialization via `serde` `default` attributes;
/// this is a thin, explicit entry point.
pub fn build_engine(doc: RuleSetDocument) -> Result<Arc<RuleEngine>, RuleError> {
    RuleEngine::new(doc.rules).map(Arc::new)
}

/// Load a `rules.yaml` document from disk. I/O and parse failures are
/// wrapped distinctly, matching `config::load`.
pub fn load(path: impl AsRef<Path>) -> Result<RuleSetDocument, RuleError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let doc: RuleSetDocument = serde_yaml::from_str(&raw)?;
    Ok(doc)
}

/// The rule set shipped as a starting point (`rules.example.yaml`):
/// `oom-killed` (P1), `crashloop-backoff` (P2, `restart-pod`),
/// `connection-refused` (P3).
#[must_use]
pub fn default_rule_specs() -> Vec<RuleSpec> {
    vec![
        RuleSpec {
            name: "oom-killed".to_string(),
            pattern: None,
            keywords: vec!["oomkilled".to_string(), "out of memory".to_string()],
            labels: HashMap::new(),
            namespaces: vec![],
            priority: "P1".to_string(),
            remediation: None,
            enabled: true,
        },
        RuleSpec {
            name: "crashloop-backoff".to_string(),
            pattern: None,
            keywords: vec!["crashloopbackoff".to_string()],
            labels: HashMap::new(),
            namespaces: vec![],
            priority: "P2".to_string(),
            remediation: Some(RemediationSpec {
                action: ActionType::RestartPod { grace_period: 30 },
                cooldown_secs: default_cooldown_secs(),
            }),
            enabled: true,
        },
        RuleSpec {
            name: "connection-refused".to_string(),
            pattern: Some(r"(?i)connection refused".to_string()),
            keywords: vec![],
            labels: HashMap::new(),
            namespaces: vec![],
            priority: "P3".to_string(),
            remediation: None,
            enabled: true,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn parsed(namespace: &str, labels: Map<String, String>, message: &str) -> ParsedError {
        ParsedError {
            id: "id-1".to_string(),
            fingerprint: "fp".to_string(),
            timestamp: chrono::Utc::now(),
            namespace: namespace.to_string(),
            pod: "pod-1".to_string(),
            container: "app".to_string(),
            message: message.to_string(),
            raw: message.to_string(),
            labels,
        }
    }

    fn rule(name: &str, keywords: Vec<&str>, priority: &str) -> RuleSpec {
        RuleSpec {
            name: name.to_string(),
            pattern: None,
            keywords: keywords.into_iter().map(String::from).collect(),
            labels: Map::new(),
            namespaces: vec![],
            priority: priority.to_string(),
            remediation: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn first_match_wins_and_default_fallback() {
        let engine = RuleEngine::new(vec![
            rule("oom-killed", vec!["oomkilled"], "P1"),
            rule("connection-refused", vec!["connection refused"], "P3"),
        ])
        .unwrap();

        let m = engine
            .evaluate(&parsed("p", Map::new(), "OOMKilled: container exceeded limit"))
            .await;
        assert_eq!(m.rule_name, "oom-killed");
        assert_eq!(m.priority, Priority::P1);

        let m = engine
            .evaluate(&parsed("p", Map::new(), "connection refused to <IP>"))
            .await;
        assert_eq!(m.rule_name, "connection-refused");

        let m = engine
            .evaluate(&parsed("p", Map::new(), "totally unrelated message"))
            .await;
        assert_eq!(m.rule_name, "default");
        assert_eq!(m.priority, Priority::P4);
    }

    #[test]
    fn empty_name_rejected() {
        let r = rule("", vec!["x"], "P1");
        assert!(compile_rule(r).is_err());
    }

    #[test]
    fn neither_pattern_nor_keywords_rejected() {
        let mut r = rule("r", vec![], "P1");
        r.keywords = vec![];
        assert!(compile_rule(r).is_err());
    }

    #[test]
    fn bad_priority_rejected() {
        let r = rule("r", vec!["x"], "P9");
        assert!(compile_rule(r).is_err());
    }

    #[test]
    fn bad_pattern_rejected() {
        let mut r = rule("r", vec![], "P1");
        r.pattern = Some("(unclosed".to_string());
        assert!(compile_rule(r).is_err());
    }

    #[test]
    fn namespace_only_exclusions_matches_others() {
        let filters = vec![NamespaceFilter::Exclude("kube-system".to_string())];
        assert!(namespace_passes(&filters, "payments"));
        assert!(!namespace_passes(&filters, "kube-system"));
    }

    #[test]
    fn namespace_mixed_include_exclude() {
        let filters = vec![
            NamespaceFilter::Include("payments".to_string()),
            NamespaceFilter::Exclude("kube-system".to_string()),
        ];
        assert!(namespace_passes(&filters, "payments"));
        assert!(!namespace_passes(&filters, "kube-system"));
        assert!(!namespace_passes(&filters, "other"));
    }

    #[test]
    fn label_negation_on_absent_key_passes() {
        let mut matchers = HashMap::new();
        matchers.insert("tier".to_string(), LabelMatcher::Negate("backend".to_string()));
        assert!(labels_pass(&matchers, &Map::new()));
    }

    #[test]
    fn label_regex_on_absent_key_fails() {
        let mut matchers = HashMap::new();
        matchers.insert(
            "tier".to_string(),
            LabelMatcher::Regex(Regex::new("^backend$").unwrap()),
        );
        assert!(!labels_pass(&matchers, &Map::new()));
    }

    #[tokio::test]
    async fn rule_match_is_pure() {
        let engine = RuleEngine::new(vec![rule("r", vec!["boom"], "P2")]).unwrap();
        let e = parsed("p", Map::new(), "boom goes the dynamite");
        let a = engine.evaluate(&e).await;
        let b = engine.evaluate(&e).await;
        assert_eq!(a.rule_name, b.rule_name);
        assert_eq!(a.priority, b.priority);
    }

    #[tokio::test]
    async fn hot_reload_rejects_bad_update_and_preserves_state() {
        let engine = RuleEngine::new(vec![rule("r", vec!["boom"], "P2")]).unwrap();
        let mut bad = rule("r2", vec![], "P1");
        bad.keywords = vec![];
        bad.pattern = None;
        let err = engine.update_rules(vec![bad]).await;
        assert!(err.is_err());

        let e = parsed("p", Map::new(), "boom");
        let m = engine.evaluate(&e).await;
        assert_eq!(m.rule_name, "r");
    }

    #[test]
    fn test_pattern_surface_compiles_ad_hoc() {
        assert!(RuleEngine::test_pattern(r"^foo\d+$", "foo123").unwrap());
        assert!(!RuleEngine::test_pattern(r"^foo\d+$", "bar123").unwrap());
        assert!(RuleEngine::test_pattern("(unclosed", "x").is_err());
    }
}
