//! Stable error-class identity across restarts and pod-suffix churn.
//!
//! A fingerprint is derived from `(namespace, normalized pod base,
//! container, normalized message)` and hashed with SHA-256, truncated to
//! the first 16 hex characters. The regex set used for pod-name and message
//! normalization is a stability boundary: changing it changes
//! every fingerprint in existence and must be treated as a format-breaking
//! release.

use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// StatefulSet ordinal suffix, e.g. `postgres-2`.
static STATEFULSET_ORDINAL: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"-\d+$").unwrap());

/// ReplicaSet-style hashed suffix, e.g. `api-7f8d9c6b5-abc12`.
static REPLICASET_SUFFIX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"-[a-z0-9]{4,10}-[a-z0-9]{5}$").unwrap());

static ISO_TIMESTAMP: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(\.\d+)?(Z|[+-]\d{2}:?\d{2})?",
    )
    .unwrap()
});

static UUID_LITERAL: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}",
    )
    .unwrap()
});

/// 24+ char hex object id (e.g. Mongo `ObjectId`, git SHAs).
static HEX_OBJECT_ID: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?i)\b[0-9a-f]{24,}\b").unwrap());

static IP_WITH_PORT: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d{1,5})?\b|\b(?:[0-9a-fA-F]{0,4}:){2,7}[0-9a-fA-F]{0,4}(?::\d{1,5})?\b",
    )
    .unwrap()
});

static LONG_NUMERIC: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\b\d{6,}\b").unwrap());

static WHITESPACE_RUN: LazyLock<regex::Regex> = LazyLock::new(|| regex::Regex::new(r"\s+").unwrap());

/// Strip a StatefulSet ordinal or a ReplicaSet hashed suffix from a pod
/// name. Names with no recognizable suffix are returned unchanged.
#[must_use]
pub fn normalize_pod_base(pod: &str) -> String {
    if let Some(m) = REPLICASET_SUFFIX.find(pod) {
        return pod[..m.start()].to_string();
    }
    if let Some(m) = STATEFULSET_ORDINAL.find(pod) {
        return pod[..m.start()].to_string();
    }
    pod.to_string()
}

/// Replace volatile substrings (timestamps, UUIDs, hex ids, IPs, large
/// numeric literals) with fixed placeholders, then collapse whitespace.
#[must_use]
pub fn normalize_message(message: &str) -> String {
    let s = ISO_TIMESTAMP.replace_all(message, "");
    let s = UUID_LITERAL.replace_all(&s, "<UUID>");
    let s = HEX_OBJECT_ID.replace_all(&s, "<ID>");
    let s = IP_WITH_PORT.replace_all(&s, "<IP>");
    let s = LONG_NUMERIC.replace_all(&s, "<NUM>");
    WHITESPACE_RUN.replace_all(s.trim(), " ").to_string()
}

/// Derive the stable fingerprint for an error-class identity tuple.
///
/// Returns the first 16 hex characters of the SHA-256 digest of the tuple,
/// joined with a separator byte that cannot appear in any field value.
#[must_use]
pub fn fingerprint(namespace: &str, pod: &str, container: &str, message: &str) -> String {
    let pod_base = normalize_pod_base(pod);
    let normalized_message = normalize_message(message);

    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    hasher.update([0u8]);
    hasher.update(pod_base.as_bytes());
    hasher.update([0u8]);
    hasher.update(container.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalized_message.as_bytes());

    let digest = hasher.finalize();
    hex::encode(digest)[..16].to_string()
}
